use crate::config::settings::KafkaConfig;
use crate::publish::batcher::{Publisher, PublisherOptions};
use crate::publish::namespace::{Namespace, PathStyle};
use crate::publish::writeback::{
    InboundWrite, ResponseSink, WritebackConsumer, WritebackOptions, WriteSource,
};
use crate::publish::{Destination, OutMessage, PublishError, TransportSink};
use crate::write::executor::{WriteExecutor, WriteGateway, WriteResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Event-log transport. Delivery is synchronous: `deliver` waits for broker
/// acks, so the suppression cache only advances once Kafka has the batch.
/// Topics are auto-created broker-side (`auto.create.topics.enable`); no
/// admin-client management here.
struct KafkaSink {
    producer: FutureProducer,
}

#[async_trait]
impl TransportSink for KafkaSink {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn connect(&self) -> Result<(), PublishError> {
        Ok(())
    }

    async fn deliver(&self, batch: &[OutMessage]) -> Result<(), PublishError> {
        for msg in batch {
            self.producer
                .send(
                    FutureRecord::<str, [u8]>::to(&msg.path).payload(msg.body.as_slice()),
                    Duration::from_secs(5),
                )
                .await
                .map_err(|(e, _)| PublishError::Deliver(e.to_string()))?;
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

struct KafkaWriteSource {
    consumer: StreamConsumer,
}

#[async_trait]
impl WriteSource for KafkaWriteSource {
    async fn fetch(&mut self, wait: Duration) -> Result<Option<InboundWrite>, PublishError> {
        match timeout(wait, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(PublishError::Deliver(e.to_string())),
            Ok(Ok(message)) => {
                let key = message
                    .key()
                    .map(|k| String::from_utf8_lossy(k).to_string());
                let payload = message.payload().map(|p| p.to_vec()).unwrap_or_default();
                let timestamp = match message.timestamp() {
                    Timestamp::CreateTime(ms) | Timestamp::LogAppendTime(ms) => {
                        DateTime::<Utc>::from_timestamp_millis(ms)
                    }
                    Timestamp::NotAvailable => None,
                };
                Ok(Some(InboundWrite {
                    key,
                    payload,
                    timestamp,
                }))
            }
        }
    }

    async fn commit(&mut self) -> Result<(), PublishError> {
        self.consumer
            .commit_consumer_state(CommitMode::Async)
            .map_err(|e| PublishError::Deliver(e.to_string()))
    }
}

struct KafkaResponseSink {
    publisher: Arc<Publisher>,
}

#[async_trait]
impl ResponseSink for KafkaResponseSink {
    async fn respond(&self, response: &WriteResponse) -> Result<(), PublishError> {
        self.publisher.publish_write_response(response).await;
        Ok(())
    }
}

/// Wire up the Kafka transport: producer-backed publisher plus the
/// write-back consumer on the inbound write topics.
pub async fn spawn_kafka(
    cfg: &KafkaConfig,
    plc_names: &[String],
    gateway: Arc<dyn WriteGateway>,
    cancel: CancellationToken,
) -> Result<Arc<Publisher>, PublishError> {
    let ns = Namespace::new(cfg.namespace.clone(), cfg.selector.clone(), PathStyle::Log);
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &cfg.brokers)
        .set("message.timeout.ms", "5000")
        .create()
        .map_err(|e| PublishError::Connect(e.to_string()))?;
    let sink = Arc::new(KafkaSink { producer });
    let publisher = Publisher::new(
        "kafka",
        Some(Destination::Kafka),
        ns.clone(),
        sink,
        PublisherOptions::default(),
    );
    publisher.start().await?;

    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &cfg.brokers)
        .set("group.id", &cfg.group)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "latest")
        .create()
        .map_err(|e| PublishError::Connect(e.to_string()))?;
    let write_topics: Vec<String> = plc_names.iter().map(|p| ns.write_path(p)).collect();
    let topic_refs: Vec<&str> = write_topics.iter().map(|s| s.as_str()).collect();
    consumer
        .subscribe(&topic_refs)
        .map_err(|e| PublishError::Connect(e.to_string()))?;

    let writeback = WritebackConsumer::new(
        KafkaWriteSource { consumer },
        Arc::new(KafkaResponseSink {
            publisher: Arc::clone(&publisher),
        }),
        gateway,
        WriteExecutor::default(),
        WritebackOptions {
            max_age: Duration::from_millis(cfg.write_max_age_ms),
            ..WritebackOptions::default()
        },
    );
    tokio::spawn(writeback.run(cancel));

    info!(brokers = %cfg.brokers, group = %cfg.group, "kafka transport started");
    Ok(publisher)
}
