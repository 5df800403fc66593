use crate::config::settings::ValkeyConfig;
use crate::publish::batcher::{Publisher, PublisherOptions};
use crate::publish::namespace::{Namespace, PathStyle};
use crate::publish::{Destination, OutMessage, PublishError, TransportSink};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Key/value cache transport: every payload is a `SET` under its `:`-joined
/// key. Publish-only; writebacks arrive over REST, MQTT, or Kafka.
struct ValkeySink {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

#[async_trait]
impl TransportSink for ValkeySink {
    fn name(&self) -> &'static str {
        "valkey"
    }

    async fn connect(&self) -> Result<(), PublishError> {
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| PublishError::Connect(e.to_string()))?;
        *self.conn.lock().await = Some(conn);
        Ok(())
    }

    async fn deliver(&self, batch: &[OutMessage]) -> Result<(), PublishError> {
        let mut conn = {
            let guard = self.conn.lock().await;
            guard.clone().ok_or(PublishError::Closed)?
        };
        let mut pipe = redis::pipe();
        for msg in batch {
            pipe.set(&msg.path, msg.body.as_slice()).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| PublishError::Deliver(e.to_string()))
    }

    async fn shutdown(&self) {
        self.conn.lock().await.take();
    }
}

pub async fn spawn_valkey(cfg: &ValkeyConfig) -> Result<Arc<Publisher>, PublishError> {
    let ns = Namespace::new(cfg.namespace.clone(), cfg.selector.clone(), PathStyle::Kv);
    let client =
        redis::Client::open(cfg.addr.as_str()).map_err(|e| PublishError::Connect(e.to_string()))?;
    let sink = Arc::new(ValkeySink {
        client,
        conn: Mutex::new(None),
    });
    let publisher = Publisher::new(
        "valkey",
        Some(Destination::Valkey),
        ns,
        sink,
        PublisherOptions::default(),
    );
    publisher.start().await?;
    info!(addr = %cfg.addr, "valkey transport started");
    Ok(publisher)
}
