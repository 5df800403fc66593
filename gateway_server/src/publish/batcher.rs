use crate::plc::manager::ChangeListener;
use crate::publish::namespace::Namespace;
use crate::publish::{
    Destination, HealthMessage, MessageKind, OutMessage, PackMessage, PublishError, TagMessage,
    TransportSink,
};
use crate::tags::value::ValueChange;
use crate::write::executor::WriteResponse;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub queue_capacity: usize,
    /// Flush when a batch reaches this size...
    pub batch_max: usize,
    /// ...or when this interval elapses.
    pub flush_interval: Duration,
    /// Producers blocked on a full queue longer than this emit a diagnostic
    /// and keep blocking.
    pub blocked_warn: Duration,
    pub deliver_timeout: Duration,
    /// Best-effort drain budget on stop.
    pub stop_flush_timeout: Duration,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        PublisherOptions {
            queue_capacity: 5000,
            batch_max: 100,
            flush_interval: Duration::from_millis(20),
            blocked_warn: Duration::from_secs(5),
            deliver_timeout: Duration::from_secs(5),
            stop_flush_timeout: Duration::from_secs(2),
        }
    }
}

/// The common republishing fabric: one instance per downstream transport.
/// Batches per-tag publishes, suppresses unchanged values per destination,
/// and publishes tag, health, and pack payloads through the injected sink.
pub struct Publisher {
    name: &'static str,
    destination: Option<Destination>,
    ns: Namespace,
    sink: Arc<dyn TransportSink>,
    opts: PublisherOptions,
    tx: StdMutex<Option<mpsc::Sender<OutMessage>>>,
    suppression: Arc<DashMap<String, String>>,
    batcher: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    pub fn new(
        name: &'static str,
        destination: Option<Destination>,
        ns: Namespace,
        sink: Arc<dyn TransportSink>,
        opts: PublisherOptions,
    ) -> Arc<Self> {
        Arc::new(Publisher {
            name,
            destination,
            ns,
            sink,
            opts,
            tx: StdMutex::new(None),
            suppression: Arc::new(DashMap::new()),
            batcher: Mutex::new(None),
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub fn sink(&self) -> &Arc<dyn TransportSink> {
        &self.sink
    }

    /// Connect the sink and spawn the batcher. Idempotent; a restart clears
    /// the suppression cache so the publisher re-emits a snapshot.
    pub async fn start(self: &Arc<Self>) -> Result<(), PublishError> {
        {
            let tx = self.tx.lock().expect("publisher tx lock");
            if tx.is_some() {
                return Ok(());
            }
        }
        self.sink.connect().await?;
        self.suppression.clear();
        let (tx, rx) = mpsc::channel(self.opts.queue_capacity);
        *self.tx.lock().expect("publisher tx lock") = Some(tx);
        let task = tokio::spawn(run_batcher(
            self.name,
            Arc::clone(&self.sink),
            self.opts.clone(),
            Arc::clone(&self.suppression),
            rx,
        ));
        *self.batcher.lock().await = Some(task);
        info!(publisher = self.name, "started");
        Ok(())
    }

    /// Close the queue, let the batcher drain best-effort, disconnect.
    pub async fn stop(&self) {
        let tx = self.tx.lock().expect("publisher tx lock").take();
        if tx.is_none() {
            return;
        }
        drop(tx);
        if let Some(task) = self.batcher.lock().await.take() {
            if timeout(self.opts.stop_flush_timeout + Duration::from_secs(1), task)
                .await
                .is_err()
            {
                warn!(publisher = self.name, "batcher did not drain in time");
            }
        }
        info!(publisher = self.name, "stopped");
    }

    fn suppression_key(change: &ValueChange) -> (String, String) {
        (
            format!("{}/{}", change.plc, change.alias),
            change.value.canonical(),
        )
    }

    /// Enqueue one value change. `force` bypasses the unchanged-value check.
    pub async fn publish_change(&self, change: &ValueChange, force: bool) {
        if let Some(dest) = self.destination {
            if dest.excluded(change) {
                return;
            }
        }
        let (key, stable) = Self::suppression_key(change);
        if !force {
            if let Some(prev) = self.suppression.get(&key) {
                if *prev == stable {
                    return;
                }
            }
        }
        let body = match serde_json::to_vec(&TagMessage::from_change(change)) {
            Ok(b) => b,
            Err(e) => {
                warn!(publisher = self.name, error = %e, "tag payload encode failed");
                return;
            }
        };
        self.enqueue(OutMessage {
            path: self.ns.tag_path(&change.plc, &change.alias),
            body,
            kind: MessageKind::Tag,
            suppression: Some((key, stable)),
        })
        .await;
    }

    pub async fn publish_health(&self, health: &HealthMessage) {
        let body = match serde_json::to_vec(health) {
            Ok(b) => b,
            Err(e) => {
                warn!(publisher = self.name, error = %e, "health payload encode failed");
                return;
            }
        };
        self.enqueue(OutMessage {
            path: self.ns.health_path(&health.plc),
            body,
            kind: MessageKind::Health,
            suppression: None,
        })
        .await;
    }

    pub async fn publish_pack(&self, pack: &PackMessage) {
        let body = match serde_json::to_vec(pack) {
            Ok(b) => b,
            Err(e) => {
                warn!(publisher = self.name, error = %e, "pack payload encode failed");
                return;
            }
        };
        self.enqueue(OutMessage {
            path: self.ns.pack_path(&pack.pack),
            body,
            kind: MessageKind::Pack,
            suppression: None,
        })
        .await;
    }

    pub async fn publish_write_response(&self, resp: &WriteResponse) {
        let body = match serde_json::to_vec(resp) {
            Ok(b) => b,
            Err(e) => {
                warn!(publisher = self.name, error = %e, "write response encode failed");
                return;
            }
        };
        self.enqueue(OutMessage {
            path: self.ns.write_response_path(&resp.plc),
            body,
            kind: MessageKind::WriteResponse,
            suppression: None,
        })
        .await;
    }

    /// Bounded blocking send: after `blocked_warn` a diagnostic is emitted
    /// and the send keeps blocking. Only the SSE per-client queue is allowed
    /// to drop.
    async fn enqueue(&self, msg: OutMessage) {
        let tx = { self.tx.lock().expect("publisher tx lock").clone() };
        let Some(tx) = tx else {
            debug!(publisher = self.name, "publish before start; dropped");
            return;
        };
        match tx.send_timeout(msg, self.opts.blocked_warn).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(msg)) => {
                warn!(
                    publisher = self.name,
                    "batch queue blocked >{}s; still waiting",
                    self.opts.blocked_warn.as_secs()
                );
                let _ = tx.send(msg).await;
            }
            Err(SendTimeoutError::Closed(_)) => {}
        }
    }

    /// Test/diagnostic view of the suppression cache.
    pub fn suppression_entry(&self, plc: &str, alias: &str) -> Option<String> {
        self.suppression
            .get(&format!("{}/{}", plc, alias))
            .map(|v| v.clone())
    }
}

#[async_trait]
impl ChangeListener for Publisher {
    async fn on_changes(&self, changes: &[ValueChange]) {
        for change in changes {
            self.publish_change(change, false).await;
        }
    }
}

async fn run_batcher(
    name: &'static str,
    sink: Arc<dyn TransportSink>,
    opts: PublisherOptions,
    suppression: Arc<DashMap<String, String>>,
    mut rx: mpsc::Receiver<OutMessage>,
) {
    let mut batch: Vec<OutMessage> = Vec::with_capacity(opts.batch_max);
    let mut tick = interval(opts.flush_interval);
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(m) => {
                    batch.push(m);
                    if batch.len() >= opts.batch_max {
                        flush(name, &sink, &opts, &suppression, &mut batch).await;
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                if !batch.is_empty() {
                    flush(name, &sink, &opts, &suppression, &mut batch).await;
                }
            }
        }
    }
    // queue closed: drain whatever is left, best effort
    while let Ok(m) = rx.try_recv() {
        batch.push(m);
    }
    if !batch.is_empty() {
        let _ = timeout(
            opts.stop_flush_timeout,
            flush(name, &sink, &opts, &suppression, &mut batch),
        )
        .await;
    }
    sink.shutdown().await;
    debug!(publisher = name, "batcher exited");
}

/// Deliver one batch. The suppression cache is only updated after the sink
/// accepts the batch; a failed delivery leaves it untouched so the next poll
/// of the same value publishes again.
async fn flush(
    name: &'static str,
    sink: &Arc<dyn TransportSink>,
    opts: &PublisherOptions,
    suppression: &Arc<DashMap<String, String>>,
    batch: &mut Vec<OutMessage>,
) {
    match timeout(opts.deliver_timeout, sink.deliver(batch)).await {
        Ok(Ok(())) => {
            for msg in batch.drain(..) {
                if let Some((key, stable)) = msg.suppression {
                    suppression.insert(key, stable);
                }
            }
        }
        Ok(Err(e)) => {
            warn!(publisher = name, error = %e, dropped = batch.len(), "batch publish failed");
            batch.clear();
        }
        Err(_) => {
            warn!(publisher = name, dropped = batch.len(), "batch publish timed out");
            batch.clear();
        }
    }
}
