use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use plcgate::drivers::traits::{DriverError, DriverResult};
use plcgate::publish::writeback::{
    InboundWrite, ResponseSink, WritebackConsumer, WritebackOptions, WriteSource,
};
use plcgate::publish::PublishError;
use plcgate::tags::value::{TagType, Value};
use plcgate::write::executor::{WriteExecutor, WriteGateway, WriteResponse, WriteValidation};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct QueueSource {
    queue: Arc<Mutex<VecDeque<InboundWrite>>>,
    commits: Arc<AtomicUsize>,
}

#[async_trait]
impl WriteSource for QueueSource {
    async fn fetch(&mut self, wait: Duration) -> Result<Option<InboundWrite>, PublishError> {
        let next = self.queue.lock().expect("queue lock").pop_front();
        if next.is_none() {
            tokio::time::sleep(wait).await;
        }
        Ok(next)
    }

    async fn commit(&mut self) -> Result<(), PublishError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct CollectResponses {
    responses: Mutex<Vec<WriteResponse>>,
}

#[async_trait]
impl ResponseSink for CollectResponses {
    async fn respond(&self, response: &WriteResponse) -> Result<(), PublishError> {
        self.responses
            .lock()
            .expect("responses lock")
            .push(response.clone());
        Ok(())
    }
}

/// Gateway stub: everything is a writable DINT; records executed writes.
struct StubGateway {
    writes: Mutex<Vec<(String, String, Value)>>,
}

#[async_trait]
impl WriteGateway for StubGateway {
    async fn validate(&self, _plc: &str, _tag: &str) -> WriteValidation {
        WriteValidation::Ok
    }

    async fn tag_type(&self, _plc: &str, _tag: &str) -> Option<TagType> {
        Some(TagType::Dint)
    }

    async fn execute_write(&self, plc: &str, tag: &str, value: Value) -> DriverResult<()> {
        self.writes
            .lock()
            .expect("writes lock")
            .push((plc.to_string(), tag.to_string(), value));
        Ok(())
    }
}

fn request_payload(plc: &str, tag: &str, value: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({"plc": plc, "tag": tag, "value": value})).unwrap()
}

fn fast_options() -> WritebackOptions {
    WritebackOptions {
        fetch_wait: Duration::from_millis(10),
        flush_interval: Duration::from_millis(100),
        max_age: Duration::from_secs(2),
        respond_timeout: Duration::from_secs(2),
    }
}

struct Harness {
    queue: Arc<Mutex<VecDeque<InboundWrite>>>,
    commits: Arc<AtomicUsize>,
    responses: Arc<CollectResponses>,
    gateway: Arc<StubGateway>,
}

impl Harness {
    fn new() -> Self {
        Harness {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            commits: Arc::new(AtomicUsize::new(0)),
            responses: Arc::new(CollectResponses {
                responses: Mutex::new(Vec::new()),
            }),
            gateway: Arc::new(StubGateway {
                writes: Mutex::new(Vec::new()),
            }),
        }
    }

    fn push(&self, msg: InboundWrite) {
        self.queue.lock().expect("queue lock").push_back(msg);
    }

    async fn run_for(&self, duration: Duration) {
        let consumer = WritebackConsumer::new(
            QueueSource {
                queue: Arc::clone(&self.queue),
                commits: Arc::clone(&self.commits),
            },
            Arc::clone(&self.responses) as Arc<dyn ResponseSink>,
            Arc::clone(&self.gateway) as Arc<dyn WriteGateway>,
            WriteExecutor::default(),
            fast_options(),
        );
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let handle = tokio::spawn(consumer.run(cancel));
        tokio::time::sleep(duration).await;
        stopper.cancel();
        let _ = handle.await;
    }

    fn responses(&self) -> Vec<WriteResponse> {
        self.responses.responses.lock().expect("lock").clone()
    }

    fn writes(&self) -> Vec<(String, String, Value)> {
        self.gateway.writes.lock().expect("lock").clone()
    }
}

/// Scenario: three writes to the same tag inside one flush window. Only the
/// last executes; the others answer deduplicated.
#[tokio::test]
async fn coalesces_to_last_write_within_window() {
    let harness = Harness::new();
    for value in [10, 20, 30] {
        harness.push(InboundWrite {
            key: None,
            payload: request_payload("p", "Setpoint", value),
            timestamp: Some(Utc::now()),
        });
    }
    harness.run_for(Duration::from_millis(400)).await;

    let writes = harness.writes();
    assert_eq!(writes.len(), 1, "exactly one executor call per window");
    assert_eq!(writes[0].2, Value::Int(30));

    let responses = harness.responses();
    assert_eq!(responses.len(), 3, "every request is answered");
    let mut dedup_values: Vec<i64> = responses
        .iter()
        .filter(|r| r.deduplicated == Some(true))
        .map(|r| r.value.as_i64().unwrap())
        .collect();
    dedup_values.sort();
    assert_eq!(dedup_values, vec![10, 20]);
    for r in responses.iter().filter(|r| r.deduplicated == Some(true)) {
        assert!(!r.success);
        assert_eq!(
            r.error.as_deref(),
            Some("superseded by newer write to same tag")
        );
    }
    let executed: Vec<&WriteResponse> =
        responses.iter().filter(|r| r.deduplicated.is_none()).collect();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].success);
    assert_eq!(executed[0].value.as_i64(), Some(30));

    assert_eq!(
        harness.commits.load(Ordering::SeqCst),
        3,
        "all messages committed"
    );
}

/// Scenario: a request older than the max age is skipped, not executed.
#[tokio::test]
async fn stale_requests_are_skipped() {
    let harness = Harness::new();
    harness.push(InboundWrite {
        key: None,
        payload: request_payload("p", "Setpoint", 99),
        timestamp: Some(Utc::now() - ChronoDuration::seconds(3)),
    });
    harness.run_for(Duration::from_millis(300)).await;

    assert!(harness.writes().is_empty(), "stale write must not execute");
    let responses = harness.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].skipped, Some(true));
    assert!(!responses[0].success);
    assert_eq!(responses[0].error.as_deref(), Some("expired"));
}

/// The message key, when present, wins over the (plc, tag) fallback.
#[tokio::test]
async fn explicit_message_key_drives_dedup() {
    let harness = Harness::new();
    harness.push(InboundWrite {
        key: Some("shared".to_string()),
        payload: request_payload("p", "A", 1),
        timestamp: Some(Utc::now()),
    });
    harness.push(InboundWrite {
        key: Some("shared".to_string()),
        payload: request_payload("p", "B", 2),
        timestamp: Some(Utc::now()),
    });
    harness.run_for(Duration::from_millis(300)).await;

    let writes = harness.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, "B");
    assert_eq!(
        harness
            .responses()
            .iter()
            .filter(|r| r.deduplicated == Some(true))
            .count(),
        1
    );
}

/// Different tags in the same window each execute.
#[tokio::test]
async fn distinct_tags_do_not_coalesce() {
    let harness = Harness::new();
    harness.push(InboundWrite {
        key: None,
        payload: request_payload("p", "A", 1),
        timestamp: Some(Utc::now()),
    });
    harness.push(InboundWrite {
        key: None,
        payload: request_payload("p", "B", 2),
        timestamp: Some(Utc::now()),
    });
    harness.run_for(Duration::from_millis(300)).await;

    assert_eq!(harness.writes().len(), 2);
    assert!(harness
        .responses()
        .iter()
        .all(|r| r.deduplicated.is_none() && r.success));
}

/// Unparseable payloads are committed (so they never replay) and skipped.
#[tokio::test]
async fn bad_payloads_commit_and_continue() {
    let harness = Harness::new();
    harness.push(InboundWrite {
        key: None,
        payload: b"not json".to_vec(),
        timestamp: None,
    });
    harness.push(InboundWrite {
        key: None,
        payload: request_payload("p", "A", 5),
        timestamp: Some(Utc::now()),
    });
    harness.run_for(Duration::from_millis(300)).await;

    assert_eq!(harness.commits.load(Ordering::SeqCst), 2);
    assert_eq!(harness.writes().len(), 1);
    assert_eq!(harness.responses().len(), 1);
}
