mod test_utils;

use async_trait::async_trait;
use plcgate::drivers::sim::SimDriver;
use plcgate::drivers::traits::{DriverError, DriverResult};
use plcgate::plc::manager::ManagerGateway;
use plcgate::tags::value::{TagType, Value};
use plcgate::tags::Family;
use plcgate::write::executor::{
    WriteExecutor, WriteGateway, WriteOutcome, WriteRequest, WriteValidation,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_utils::*;

struct ScriptedGateway {
    validation: WriteValidation,
    tag_type: Option<TagType>,
    write_delay: Option<Duration>,
    write_result: fn() -> DriverResult<()>,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        ScriptedGateway {
            validation: WriteValidation::Ok,
            tag_type: Some(TagType::Dint),
            write_delay: None,
            write_result: || Ok(()),
        }
    }
}

#[async_trait]
impl WriteGateway for ScriptedGateway {
    async fn validate(&self, _plc: &str, _tag: &str) -> WriteValidation {
        self.validation
    }

    async fn tag_type(&self, _plc: &str, _tag: &str) -> Option<TagType> {
        self.tag_type
    }

    async fn execute_write(&self, _plc: &str, _tag: &str, _value: Value) -> DriverResult<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        (self.write_result)()
    }
}

fn request(plc: &str, tag: &str, value: serde_json::Value) -> WriteRequest {
    WriteRequest {
        plc: plc.to_string(),
        tag: tag.to_string(),
        value,
        request_id: Some("req-1".to_string()),
        timestamp: None,
    }
}

#[tokio::test]
async fn plc_path_mismatch_is_rejected_first() {
    let gateway = ScriptedGateway::default();
    let executor = WriteExecutor::default();
    let (response, outcome) = executor
        .execute(&gateway, &request("other", "T", json!(1)), Some("p"))
        .await;
    assert_eq!(outcome, WriteOutcome::BadRequest);
    assert!(!response.success);
    assert!(response.error.unwrap().contains("does not match"));
}

#[tokio::test]
async fn not_writable_and_unknown_and_disconnected() {
    let executor = WriteExecutor::default();
    for (validation, outcome, needle) in [
        (
            WriteValidation::NotWritable,
            WriteOutcome::NotWritable,
            "not writable",
        ),
        (
            WriteValidation::UnknownTag,
            WriteOutcome::UnknownTag,
            "unknown tag",
        ),
        (
            WriteValidation::Disconnected,
            WriteOutcome::Disconnected,
            "not connected",
        ),
    ] {
        let gateway = ScriptedGateway {
            validation,
            ..Default::default()
        };
        let (response, got) = executor
            .execute(&gateway, &request("p", "T", json!(1)), Some("p"))
            .await;
        assert_eq!(got, outcome);
        assert!(
            response.error.as_deref().unwrap_or("").contains(needle),
            "expected {:?} in {:?}",
            needle,
            response.error
        );
    }
}

/// Scenario: 2147483648 does not fit a DINT; the response carries an
/// out-of-range error and the driver is never called.
#[tokio::test]
async fn out_of_range_value_fails_coercion() {
    let gateway = ScriptedGateway::default();
    let executor = WriteExecutor::default();
    let (response, outcome) = executor
        .execute(&gateway, &request("p", "Counter", json!(2147483648i64)), Some("p"))
        .await;
    assert_eq!(outcome, WriteOutcome::Failed);
    assert!(!response.success);
    assert!(response.error.unwrap().contains("out of range"));
    // echoed fields survive
    assert_eq!(response.value.as_i64(), Some(2147483648));
    assert_eq!(response.request_id.as_deref(), Some("req-1"));
}

#[tokio::test]
async fn slow_write_times_out_with_the_accepted_looseness() {
    let gateway = ScriptedGateway {
        write_delay: Some(Duration::from_millis(500)),
        ..Default::default()
    };
    let executor = WriteExecutor::with_timeout(Duration::from_millis(50));
    let (response, outcome) = executor
        .execute(&gateway, &request("p", "T", json!(1)), Some("p"))
        .await;
    assert_eq!(outcome, WriteOutcome::Timeout);
    assert!(response.error.unwrap().starts_with("write timeout"));
}

#[tokio::test]
async fn driver_error_surfaces_in_response() {
    let gateway = ScriptedGateway {
        write_result: || Err(DriverError::Protocol("cip rejected".to_string())),
        ..Default::default()
    };
    let executor = WriteExecutor::default();
    let (response, outcome) = executor
        .execute(&gateway, &request("p", "T", json!(1)), Some("p"))
        .await;
    assert_eq!(outcome, WriteOutcome::Failed);
    assert!(response.error.unwrap().contains("cip rejected"));
}

/// Round trip against the real manager + sim driver: write V, read V back.
#[tokio::test]
async fn write_then_read_round_trips_through_the_manager() {
    let driver = Arc::new(SimDriver::new("p", Family::Logix));
    driver
        .script_tag("Setpoint", TagType::Dint, vec![Value::Int(0)], true)
        .await;
    let (manager, _) = manager_with_drivers(vec![("p".to_string(), Arc::clone(&driver))]);
    manager
        .add_plc(plc_config(
            "p",
            Family::Logix,
            vec![selection("Setpoint", "DINT", true)],
        ))
        .await
        .unwrap();
    manager.connect_plc("p", false).await.unwrap();

    let gateway = ManagerGateway(Arc::clone(&manager));
    let executor = WriteExecutor::default();
    let (response, outcome) = executor
        .execute(&gateway, &request("p", "Setpoint", json!(42)), Some("p"))
        .await;
    assert_eq!(outcome, WriteOutcome::Success, "{:?}", response.error);
    assert!(response.success);

    let read_back = manager.read_tag("p", "Setpoint").await.unwrap();
    assert_eq!(read_back.value, Value::Int(42));
}
