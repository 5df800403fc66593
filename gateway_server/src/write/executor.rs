use crate::drivers::traits::DriverResult;
use crate::tags::value::{TagType, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;

/// Default budget for one write against the PLC. If it fires the response
/// reports a timeout; the write itself may still land on the device.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// An inbound write request as delivered by any transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub plc: String,
    pub tag: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// The structured response every transport publishes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub plc: String,
    pub tag: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplicated: Option<bool>,
    pub timestamp: String,
}

/// How a write attempt resolved; the REST surface maps this onto status
/// codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    /// Body/URL mismatch or malformed request.
    BadRequest,
    UnknownTag,
    NotWritable,
    Disconnected,
    /// Coercion or driver failure.
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteValidation {
    Ok,
    UnknownPlc,
    UnknownTag,
    NotWritable,
    Disconnected,
}

/// The manager-side collaborators a transport needs to execute a write,
/// injected at construction so publishers never hold the manager itself.
#[async_trait]
pub trait WriteGateway: Send + Sync {
    async fn validate(&self, plc: &str, tag: &str) -> WriteValidation;
    async fn tag_type(&self, plc: &str, tag: &str) -> Option<TagType>;
    async fn execute_write(&self, plc: &str, tag: &str, value: Value) -> DriverResult<()>;
}

/// The shared write path: every transport's write-request handler funnels
/// through `execute`.
pub struct WriteExecutor {
    timeout: Duration,
}

impl Default for WriteExecutor {
    fn default() -> Self {
        WriteExecutor {
            timeout: WRITE_TIMEOUT,
        }
    }
}

impl WriteExecutor {
    pub fn with_timeout(timeout: Duration) -> Self {
        WriteExecutor { timeout }
    }

    /// Validate, coerce, and execute one write request. `expected_plc` is the
    /// PLC name baked into the transport path (topic, URL); a mismatch with
    /// the request body is rejected before anything else.
    pub async fn execute(
        &self,
        gateway: &dyn WriteGateway,
        req: &WriteRequest,
        expected_plc: Option<&str>,
    ) -> (WriteResponse, WriteOutcome) {
        if let Some(expected) = expected_plc {
            if expected != req.plc {
                return (
                    self.response(
                        req,
                        false,
                        Some(format!(
                            "request plc {} does not match path plc {}",
                            req.plc, expected
                        )),
                    ),
                    WriteOutcome::BadRequest,
                );
            }
        }

        match gateway.validate(&req.plc, &req.tag).await {
            WriteValidation::Ok => {}
            WriteValidation::UnknownPlc => {
                return (
                    self.response(req, false, Some(format!("unknown plc {}", req.plc))),
                    WriteOutcome::UnknownTag,
                );
            }
            WriteValidation::UnknownTag => {
                return (
                    self.response(req, false, Some(format!("unknown tag {}", req.tag))),
                    WriteOutcome::UnknownTag,
                );
            }
            WriteValidation::NotWritable => {
                return (
                    self.response(req, false, Some(format!("tag {} not writable", req.tag))),
                    WriteOutcome::NotWritable,
                );
            }
            WriteValidation::Disconnected => {
                return (
                    self.response(req, false, Some(format!("plc {} not connected", req.plc))),
                    WriteOutcome::Disconnected,
                );
            }
        }

        let Some(tag_type) = gateway.tag_type(&req.plc, &req.tag).await else {
            return (
                self.response(
                    req,
                    false,
                    Some(format!("unable to resolve type of {}", req.tag)),
                ),
                WriteOutcome::Failed,
            );
        };

        let value = match coerce(&req.value, tag_type) {
            Ok(v) => v,
            Err(e) => {
                return (self.response(req, false, Some(e)), WriteOutcome::Failed);
            }
        };

        match timeout(self.timeout, gateway.execute_write(&req.plc, &req.tag, value)).await {
            Err(_) => (
                self.response(
                    req,
                    false,
                    Some("write timeout - the write may still complete".to_string()),
                ),
                WriteOutcome::Timeout,
            ),
            Ok(Err(e)) => (
                self.response(req, false, Some(e.to_string())),
                WriteOutcome::Failed,
            ),
            Ok(Ok(())) => (self.response(req, true, None), WriteOutcome::Success),
        }
    }

    fn response(&self, req: &WriteRequest, success: bool, error: Option<String>) -> WriteResponse {
        WriteResponse {
            plc: req.plc.clone(),
            tag: req.tag.clone(),
            value: req.value.clone(),
            request_id: req.request_id.clone(),
            success,
            error,
            skipped: None,
            deduplicated: None,
            timestamp: crate::publish::now_rfc3339(),
        }
    }
}

/// The only place that decides whether a JSON-shaped value fits a native tag
/// type. Every write path goes through here.
pub fn coerce(value: &serde_json::Value, tag_type: TagType) -> Result<Value, String> {
    use serde_json::Value as J;
    match tag_type {
        TagType::Bool => match value {
            J::Bool(b) => Ok(Value::Bool(*b)),
            J::Number(n) => {
                let nonzero = n.as_f64().map(|f| f != 0.0).unwrap_or(false);
                Ok(Value::Bool(nonzero))
            }
            _ => Err(format!("type mismatch: expected BOOL, got {}", value)),
        },
        TagType::Sint => coerce_signed(value, i8::MIN as i64, i8::MAX as i64, "SINT"),
        TagType::Int => coerce_signed(value, i16::MIN as i64, i16::MAX as i64, "INT"),
        TagType::Dint => coerce_signed(value, i32::MIN as i64, i32::MAX as i64, "DINT"),
        TagType::Lint => coerce_signed(value, i64::MIN, i64::MAX, "LINT"),
        TagType::Usint => coerce_unsigned(value, u8::MAX as u64, "USINT"),
        TagType::Uint => coerce_unsigned(value, u16::MAX as u64, "UINT"),
        TagType::Udint => coerce_unsigned(value, u32::MAX as u64, "UDINT"),
        TagType::Ulint => coerce_unsigned(value, u64::MAX, "ULINT"),
        TagType::Real => match value.as_f64() {
            // truncate to 32-bit precision
            Some(f) => Ok(Value::Float(f as f32 as f64)),
            None => Err(format!("type mismatch: expected REAL, got {}", value)),
        },
        TagType::Lreal => match value.as_f64() {
            Some(f) => Ok(Value::Float(f)),
            None => Err(format!("type mismatch: expected LREAL, got {}", value)),
        },
        TagType::String => match value {
            J::String(s) => Ok(Value::Text(s.clone())),
            _ => Err(format!("type mismatch: expected STRING, got {}", value)),
        },
        TagType::Struct => Err("structured tags are not writable".to_string()),
    }
}

fn coerce_signed(
    value: &serde_json::Value,
    min: i64,
    max: i64,
    label: &str,
) -> Result<Value, String> {
    let n = value
        .as_i64()
        .or_else(|| {
            value.as_f64().and_then(|f| {
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    Some(f as i64)
                } else {
                    None
                }
            })
        })
        .ok_or_else(|| format!("type mismatch: expected {}, got {}", label, value))?;
    if n < min || n > max {
        return Err(format!("value {} out of range for {}", n, label));
    }
    Ok(Value::Int(n))
}

fn coerce_unsigned(value: &serde_json::Value, max: u64, label: &str) -> Result<Value, String> {
    if let Some(f) = value.as_f64() {
        if f < 0.0 {
            return Err(format!("value {} out of range for {}: negative", f, label));
        }
        if f.fract() != 0.0 {
            return Err(format!(
                "type mismatch: expected {}, got non-integral {}",
                label, f
            ));
        }
    }
    let n = value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f as u64))
        .ok_or_else(|| format!("type mismatch: expected {}, got {}", label, value))?;
    if n > max {
        return Err(format!("value {} out of range for {}", n, label));
    }
    Ok(Value::Uint(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bool_accepts_bool_and_numeric() {
        assert_eq!(coerce(&json!(true), TagType::Bool), Ok(Value::Bool(true)));
        assert_eq!(coerce(&json!(0), TagType::Bool), Ok(Value::Bool(false)));
        assert_eq!(coerce(&json!(2.5), TagType::Bool), Ok(Value::Bool(true)));
        assert!(coerce(&json!("on"), TagType::Bool).is_err());
    }

    #[test]
    fn signed_range_checks() {
        assert_eq!(coerce(&json!(127), TagType::Sint), Ok(Value::Int(127)));
        assert!(coerce(&json!(128), TagType::Sint).is_err());
        // JSON numbers arrive as floats from most transports
        assert_eq!(coerce(&json!(1000.0), TagType::Dint), Ok(Value::Int(1000)));
        let err = coerce(&json!(2147483648i64), TagType::Dint).unwrap_err();
        assert!(err.contains("out of range"), "{}", err);
        assert!(coerce(&json!(1.5), TagType::Dint).is_err());
    }

    #[test]
    fn unsigned_rejects_negative() {
        assert!(coerce(&json!(-1), TagType::Uint).is_err());
        assert_eq!(coerce(&json!(65535), TagType::Uint), Ok(Value::Uint(65535)));
        assert!(coerce(&json!(65536), TagType::Uint).is_err());
    }

    #[test]
    fn real_truncates_to_f32() {
        let Value::Float(f) = coerce(&json!(1.0000000001), TagType::Real).unwrap() else {
            panic!("expected float");
        };
        assert_eq!(f, 1.0000000001f64 as f32 as f64);
        assert_eq!(
            coerce(&json!(2.5), TagType::Lreal),
            Ok(Value::Float(2.5))
        );
    }

    #[test]
    fn string_rejects_numeric() {
        assert_eq!(
            coerce(&json!("run"), TagType::String),
            Ok(Value::Text("run".into()))
        );
        assert!(coerce(&json!(5), TagType::String).is_err());
    }
}
