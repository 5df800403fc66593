pub mod batcher;
pub mod namespace;
pub mod packs;
pub mod writeback;

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "valkey")]
pub mod valkey;

use crate::plc::manager::PlcManager;
use crate::tags::value::{Value, ValueChange};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// RFC 3339 UTC without fractional seconds; every outbound payload uses this
/// form.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Deliver(String),
    #[error("transport closed")]
    Closed,
}

/// Which downstream a publisher feeds; selects the per-destination
/// suppression flag on each selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Mqtt,
    Kafka,
    Valkey,
}

impl Destination {
    pub fn excluded(self, change: &ValueChange) -> bool {
        match self {
            Destination::Mqtt => change.no_mqtt,
            Destination::Kafka => change.no_kafka,
            Destination::Valkey => change.no_valkey,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Tag,
    Health,
    Pack,
    WriteResponse,
}

/// One wire-ready payload headed for a transport-specific path.
#[derive(Debug, Clone)]
pub struct OutMessage {
    pub path: String,
    pub body: Vec<u8>,
    pub kind: MessageKind,
    /// Suppression-cache entry to commit once the transport accepts the
    /// message: (key, canonical value string).
    pub suppression: Option<(String, String)>,
}

/// A transport adapter. `deliver` returns Ok only once the transport has
/// accepted the batch (broker ack for synchronous transports, local queueing
/// for fire-and-forget ones); the batcher updates the suppression cache only
/// then.
#[async_trait]
pub trait TransportSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn connect(&self) -> Result<(), PublishError>;
    async fn deliver(&self, batch: &[OutMessage]) -> Result<(), PublishError>;
    async fn shutdown(&self);
}

/// Tag payload shared by every transport. `tag` carries the alias when one
/// is configured; `memloc` then carries the canonical name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagMessage {
    pub plc: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memloc: Option<String>,
    pub value: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub writable: bool,
    pub timestamp: String,
}

impl TagMessage {
    pub fn from_change(change: &ValueChange) -> Self {
        let aliased = change.alias != change.tag;
        TagMessage {
            plc: change.plc.clone(),
            tag: change.alias.clone(),
            memloc: aliased.then(|| change.tag.clone()),
            value: change.value.clone(),
            type_name: Some(change.type_name.clone()),
            writable: change.writable,
            timestamp: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMessage {
    pub plc: String,
    pub driver: String,
    pub online: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

/// A pack payload: the current values of a named tag group, keyed
/// "<plc>.<tag-or-alias>".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackMessage {
    pub pack: String,
    pub tags: std::collections::BTreeMap<String, Value>,
    pub timestamp: String,
}

pub const HEALTH_INTERVAL: Duration = Duration::from_secs(10);

type HealthTap = Arc<dyn Fn(&HealthMessage) + Send + Sync>;

/// Publish every PLC's health snapshot to each transport (and any extra
/// sink, e.g. the SSE hub) on a fixed cadence.
pub fn spawn_health_loop(
    manager: Arc<PlcManager>,
    publishers: Vec<Arc<batcher::Publisher>>,
    tap: Option<HealthTap>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEALTH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            for snapshot in manager.health_all().await {
                let message = HealthMessage {
                    plc: snapshot.plc,
                    driver: snapshot.driver,
                    online: snapshot.online,
                    status: snapshot.status,
                    error: snapshot.error,
                    timestamp: snapshot.timestamp,
                };
                for publisher in &publishers {
                    publisher.publish_health(&message).await;
                }
                if let Some(tap) = &tap {
                    tap(&message);
                }
            }
        }
    })
}
