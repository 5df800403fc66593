use crate::publish::PublishError;
use crate::write::executor::{WriteExecutor, WriteGateway, WriteRequest, WriteResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One message pulled off the inbound write topic.
#[derive(Debug, Clone)]
pub struct InboundWrite {
    /// Message key; when empty the dedup key falls back to "<plc>.<tag>".
    pub key: Option<String>,
    pub payload: Vec<u8>,
    /// Broker timestamp, when the transport has one.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Consumer-group style source of inbound writes. At-least-once is fine: the
/// write executor tolerates duplicate writes on PLC memory.
#[async_trait]
pub trait WriteSource: Send {
    /// Fetch the next message, waiting at most `wait`.
    async fn fetch(&mut self, wait: Duration) -> Result<Option<InboundWrite>, PublishError>;
    /// Commit the offset of the last fetched message.
    async fn commit(&mut self) -> Result<(), PublishError>;
}

/// Where per-request responses go.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn respond(&self, response: &WriteResponse) -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
pub struct WritebackOptions {
    pub fetch_wait: Duration,
    /// Coalescing window: at most one executed write per (plc, tag) per
    /// window.
    pub flush_interval: Duration,
    /// Requests whose message time predates the flush by more than this are
    /// skipped as stale.
    pub max_age: Duration,
    pub respond_timeout: Duration,
}

impl Default for WritebackOptions {
    fn default() -> Self {
        WritebackOptions {
            fetch_wait: Duration::from_millis(50),
            flush_interval: Duration::from_millis(250),
            max_age: Duration::from_secs(2),
            respond_timeout: Duration::from_secs(2),
        }
    }
}

struct Pending {
    request: WriteRequest,
    message_time: Option<DateTime<Utc>>,
}

/// The write-back consumer: coalesces requests per (plc, tag) within each
/// flush window (last write wins), ages out stale commands, and answers
/// every request — executed, deduplicated, or skipped.
pub struct WritebackConsumer<S: WriteSource> {
    source: S,
    responses: Arc<dyn ResponseSink>,
    gateway: Arc<dyn WriteGateway>,
    executor: WriteExecutor,
    opts: WritebackOptions,
}

impl<S: WriteSource> WritebackConsumer<S> {
    pub fn new(
        source: S,
        responses: Arc<dyn ResponseSink>,
        gateway: Arc<dyn WriteGateway>,
        executor: WriteExecutor,
        opts: WritebackOptions,
    ) -> Self {
        WritebackConsumer {
            source,
            responses,
            gateway,
            executor,
            opts,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut pending: HashMap<String, Pending> = HashMap::new();
        let mut discarded: Vec<Pending> = Vec::new();
        let mut last_flush = tokio::time::Instant::now();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.source.fetch(self.opts.fetch_wait).await {
                Ok(Some(msg)) => {
                    self.ingest(msg, &mut pending, &mut discarded).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "write-back fetch failed");
                    tokio::time::sleep(self.opts.fetch_wait).await;
                }
            }
            if last_flush.elapsed() >= self.opts.flush_interval {
                self.flush(&mut pending, &mut discarded).await;
                last_flush = tokio::time::Instant::now();
            }
        }
        // answer whatever is still queued before exiting
        self.flush(&mut pending, &mut discarded).await;
    }

    async fn ingest(
        &mut self,
        msg: InboundWrite,
        pending: &mut HashMap<String, Pending>,
        discarded: &mut Vec<Pending>,
    ) {
        let request: WriteRequest = match serde_json::from_slice(&msg.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "unparseable write request; committing and skipping");
                let _ = self.source.commit().await;
                return;
            }
        };
        let key = match msg.key.as_deref() {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => format!("{}.{}", request.plc, request.tag),
        };
        let message_time = request.timestamp.or(msg.timestamp);
        let entry = Pending {
            request,
            message_time,
        };
        if let Some(old) = pending.insert(key, entry) {
            discarded.push(old);
        }
        // Commit immediately so a restart does not replay; coalescing makes
        // at-least-once acceptable anyway.
        if let Err(e) = self.source.commit().await {
            warn!(error = %e, "offset commit failed");
        }
    }

    async fn flush(&mut self, pending: &mut HashMap<String, Pending>, discarded: &mut Vec<Pending>) {
        for old in discarded.drain(..) {
            let response = WriteResponse {
                plc: old.request.plc.clone(),
                tag: old.request.tag.clone(),
                value: old.request.value.clone(),
                request_id: old.request.request_id.clone(),
                success: false,
                error: Some("superseded by newer write to same tag".to_string()),
                skipped: None,
                deduplicated: Some(true),
                timestamp: crate::publish::now_rfc3339(),
            };
            self.respond(&response).await;
        }
        let now = Utc::now();
        for (_, entry) in pending.drain() {
            let stale = entry
                .message_time
                .map(|t| now.signed_duration_since(t).to_std().unwrap_or_default() > self.opts.max_age)
                .unwrap_or(false);
            if stale {
                debug!(plc = %entry.request.plc, tag = %entry.request.tag, "write request expired");
                let response = WriteResponse {
                    plc: entry.request.plc.clone(),
                    tag: entry.request.tag.clone(),
                    value: entry.request.value.clone(),
                    request_id: entry.request.request_id.clone(),
                    success: false,
                    error: Some("expired".to_string()),
                    skipped: Some(true),
                    deduplicated: None,
                    timestamp: crate::publish::now_rfc3339(),
                };
                self.respond(&response).await;
                continue;
            }
            let (response, _outcome) = self
                .executor
                .execute(self.gateway.as_ref(), &entry.request, None)
                .await;
            self.respond(&response).await;
        }
    }

    async fn respond(&self, response: &WriteResponse) {
        match timeout(self.opts.respond_timeout, self.responses.respond(response)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "write response publish failed"),
            Err(_) => warn!("write response publish timed out"),
        }
    }
}
