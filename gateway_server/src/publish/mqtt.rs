use crate::config::settings::MqttConfig;
use crate::publish::batcher::{Publisher, PublisherOptions};
use crate::publish::namespace::{Namespace, PathStyle};
use crate::publish::{Destination, OutMessage, PublishError, TransportSink};
use crate::write::executor::{WriteExecutor, WriteGateway, WriteRequest};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WRITE_WORKERS: usize = 5;

struct MqttSink {
    client: AsyncClient,
}

#[async_trait]
impl TransportSink for MqttSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn connect(&self) -> Result<(), PublishError> {
        // the rumqttc event loop owns the actual TCP session
        Ok(())
    }

    /// Publishes queue into the client's request channel; MQTT is
    /// fire-and-forget here, so queueing counts as acceptance.
    async fn deliver(&self, batch: &[OutMessage]) -> Result<(), PublishError> {
        for msg in batch {
            self.client
                .publish(msg.path.clone(), QoS::AtLeastOnce, false, msg.body.clone())
                .await
                .map_err(|e| PublishError::Deliver(e.to_string()))?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.client.disconnect().await;
    }
}

/// Wire up the MQTT transport: the publisher with its batcher, the event
/// loop task, the write-topic subscriptions, and the inbound write worker
/// pool.
pub async fn spawn_mqtt(
    cfg: &MqttConfig,
    plc_names: &[String],
    gateway: Arc<dyn WriteGateway>,
    cancel: CancellationToken,
) -> Result<Arc<Publisher>, PublishError> {
    let ns = Namespace::new(cfg.namespace.clone(), cfg.selector.clone(), PathStyle::Bus);
    let mut options = MqttOptions::new("plcgate", cfg.broker.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (cfg.username.clone(), cfg.password.clone()) {
        options.set_credentials(user, pass);
    }
    let (client, eventloop) = AsyncClient::new(options, 64);

    let sink = Arc::new(MqttSink {
        client: client.clone(),
    });
    let publisher = Publisher::new(
        "mqtt",
        Some(Destination::Mqtt),
        ns.clone(),
        sink,
        PublisherOptions::default(),
    );
    publisher.start().await?;

    for plc in plc_names {
        let topic = ns.write_path(plc);
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| PublishError::Connect(e.to_string()))?;
    }

    let (write_tx, write_rx) = mpsc::channel::<(String, WriteRequest)>(256);
    spawn_event_loop(eventloop, write_tx, cancel.clone());
    spawn_write_workers(write_rx, gateway, Arc::clone(&publisher), cancel);

    info!(broker = %cfg.broker, port = cfg.port, "mqtt transport started");
    Ok(publisher)
}

fn spawn_event_loop(
    mut eventloop: EventLoop,
    write_tx: mpsc::Sender<(String, WriteRequest)>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = eventloop.poll() => ev,
            };
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let Some(plc) = plc_from_write_topic(&publish.topic) else {
                        continue;
                    };
                    match serde_json::from_slice::<WriteRequest>(&publish.payload) {
                        Ok(request) => {
                            if write_tx.send((plc, request)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(topic = %publish.topic, error = %e, "bad write request payload")
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "mqtt event loop error; reconnecting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!("mqtt event loop exited");
    });
}

fn spawn_write_workers(
    write_rx: mpsc::Receiver<(String, WriteRequest)>,
    gateway: Arc<dyn WriteGateway>,
    publisher: Arc<Publisher>,
    cancel: CancellationToken,
) {
    let rx = Arc::new(tokio::sync::Mutex::new(write_rx));
    for worker in 0..WRITE_WORKERS {
        let rx = Arc::clone(&rx);
        let gateway = Arc::clone(&gateway);
        let publisher = Arc::clone(&publisher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let executor = WriteExecutor::default();
            loop {
                let next = {
                    let mut guard = rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => None,
                        msg = guard.recv() => msg,
                    }
                };
                let Some((plc, request)) = next else { break };
                let (response, outcome) = executor
                    .execute(gateway.as_ref(), &request, Some(&plc))
                    .await;
                debug!(worker, plc = %response.plc, tag = %response.tag, ?outcome, "mqtt write handled");
                publisher.publish_write_response(&response).await;
            }
        });
    }
}

/// `<ns>[/<sel>]/<plc>/write` -> plc
fn plc_from_write_topic(topic: &str) -> Option<String> {
    let mut parts = topic.rsplit('/');
    if parts.next() != Some("write") {
        return None;
    }
    parts.next().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_topic_parsing() {
        assert_eq!(
            plc_from_write_topic("plant/line1/pA/write"),
            Some("pA".to_string())
        );
        assert_eq!(plc_from_write_topic("plant/pA/write"), Some("pA".to_string()));
        assert_eq!(plc_from_write_topic("plant/pA/tags/x"), None);
    }
}
