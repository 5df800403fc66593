use crate::plc::manager::{ChangeListener, PlcManager};
use crate::publish::{HealthMessage, PackMessage, TagMessage};
use crate::tags::value::ValueChange;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Per-client queue depth; one slow browser must not back-pressure the bus,
/// so overflow drops the event.
pub const CLIENT_QUEUE: usize = 64;

/// One event on the SSE surface.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    /// value-change | tagpack | status-change | health
    pub kind: &'static str,
    pub plc: String,
    pub tag: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub types: Option<HashSet<String>>,
    pub plcs: Option<HashSet<String>>,
    pub tags: Option<HashSet<String>>,
}

impl EventFilter {
    /// PLC- and tag-filters only apply when the event carries the
    /// corresponding non-empty field.
    fn matches(&self, event: &GatewayEvent) -> bool {
        if let Some(types) = &self.types {
            if !types.contains(event.kind) {
                return false;
            }
        }
        if let Some(plcs) = &self.plcs {
            if !event.plc.is_empty() && !plcs.contains(&event.plc) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !event.tag.is_empty() && !tags.contains(&event.tag) {
                return false;
            }
        }
        true
    }
}

struct SseClient {
    tx: mpsc::Sender<GatewayEvent>,
    filter: EventFilter,
}

/// Fan-out hub for the Server-Sent-Events surface.
pub struct SseHub {
    clients: DashMap<u64, SseClient>,
    next_id: AtomicU64,
}

impl SseHub {
    pub fn new() -> Arc<Self> {
        Arc::new(SseHub {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn subscribe(&self, filter: EventFilter) -> (u64, mpsc::Receiver<GatewayEvent>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.clients.insert(id, SseClient { tx, filter });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.clients.remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn broadcast(&self, event: GatewayEvent) {
        let mut dead = Vec::new();
        for entry in self.clients.iter() {
            if !entry.filter.matches(&event) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(client = *entry.key(), kind = event.kind, "sse client queue full; event dropped");
                }
                Err(TrySendError::Closed(_)) => dead.push(*entry.key()),
            }
        }
        for id in dead {
            self.clients.remove(&id);
        }
    }

    pub fn broadcast_health(&self, health: &HealthMessage) {
        self.broadcast(GatewayEvent {
            kind: "health",
            plc: health.plc.clone(),
            tag: String::new(),
            payload: serde_json::to_value(health).unwrap_or_default(),
        });
    }

    pub fn broadcast_pack(&self, pack: &PackMessage) {
        self.broadcast(GatewayEvent {
            kind: "tagpack",
            plc: String::new(),
            tag: String::new(),
            payload: serde_json::to_value(pack).unwrap_or_default(),
        });
    }
}

/// A subscribed client's receive side; unsubscribes itself when the
/// connection goes away.
pub struct ClientStream {
    id: u64,
    hub: Arc<SseHub>,
    rx: mpsc::Receiver<GatewayEvent>,
}

impl ClientStream {
    pub fn new(hub: Arc<SseHub>, filter: EventFilter) -> Self {
        let (id, rx) = hub.subscribe(filter);
        ClientStream { id, hub, rx }
    }
}

impl futures::Stream for ClientStream {
    type Item = GatewayEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

/// Adapts the hub onto the manager's change-listener seam. Tags flagged
/// no_rest stay off the SSE surface.
pub struct SseFanout(pub Arc<SseHub>);

#[async_trait]
impl ChangeListener for SseFanout {
    async fn on_changes(&self, changes: &[ValueChange]) {
        for change in changes {
            if change.no_rest {
                continue;
            }
            let payload =
                serde_json::to_value(TagMessage::from_change(change)).unwrap_or_default();
            self.0.broadcast(GatewayEvent {
                kind: "value-change",
                plc: change.plc.clone(),
                tag: change.alias.clone(),
                payload,
            });
        }
    }
}

/// Hook the manager's status-dirty callback up to the hub: each firing emits
/// one status-change event with the current per-PLC statuses.
pub fn register_status_events(manager: &Arc<PlcManager>, hub: Arc<SseHub>) {
    let mgr = Arc::clone(manager);
    manager.on_status_change(Arc::new(move || {
        let mgr = Arc::clone(&mgr);
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            let mut statuses = serde_json::Map::new();
            for name in mgr.plc_names().await {
                if let Some(plc) = mgr.plc(&name).await {
                    let p = plc.read().await;
                    statuses.insert(
                        name.clone(),
                        serde_json::Value::String(p.status.to_string()),
                    );
                }
            }
            hub.broadcast(GatewayEvent {
                kind: "status-change",
                plc: String::new(),
                tag: String::new(),
                payload: serde_json::Value::Object(statuses),
            });
        });
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: &'static str, plc: &str, tag: &str) -> GatewayEvent {
        GatewayEvent {
            kind,
            plc: plc.to_string(),
            tag: tag.to_string(),
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn filters_apply_only_to_events_carrying_the_field() {
        let mut filter = EventFilter::default();
        filter.plcs = Some(["pA".to_string()].into_iter().collect());
        assert!(filter.matches(&event("value-change", "pA", "t")));
        assert!(!filter.matches(&event("value-change", "pB", "t")));
        // status-change has no plc field; passes a plc filter
        assert!(filter.matches(&event("status-change", "", "")));
    }

    #[tokio::test]
    async fn overflow_drops_event_but_keeps_client() {
        let hub = SseHub::new();
        let (_id, mut rx) = hub.subscribe(EventFilter::default());
        for i in 0..CLIENT_QUEUE + 10 {
            hub.broadcast(event("value-change", "p", &format!("t{}", i)));
        }
        assert_eq!(hub.client_count(), 1);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CLIENT_QUEUE);
    }

    #[tokio::test]
    async fn closed_clients_are_pruned() {
        let hub = SseHub::new();
        let (_id, rx) = hub.subscribe(EventFilter::default());
        drop(rx);
        hub.broadcast(event("value-change", "p", "t"));
        assert_eq!(hub.client_count(), 0);
    }
}
