use crate::tags::value::{TagType, TagValue, Value};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Driver operation errors. `Connection`-class errors mean the transport is
/// dead and a reconnect is required; everything else is call-local.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    Connection(String),
    #[error("not connected")]
    NotConnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("tag {0} not found")]
    TagNotFound(String),
    #[error("unsupported value for {tag}: {reason}")]
    UnsupportedValue { tag: String, reason: String },
    #[error("family {0} not compiled in; rebuild with the matching feature")]
    UnsupportedFamily(String),
    #[error("operation timed out")]
    Timeout,
}

pub type DriverResult<T> = Result<T, DriverError>;

/// A bulk-read request: canonical tag name plus an optional declared type
/// hint from configuration (families without discovery need it to size the
/// read).
#[derive(Debug, Clone)]
pub struct TagReadRequest {
    pub name: String,
    pub type_hint: Option<TagType>,
}

impl TagReadRequest {
    pub fn new(name: impl Into<String>) -> Self {
        TagReadRequest {
            name: name.into(),
            type_hint: None,
        }
    }

    pub fn with_hint(name: impl Into<String>, hint: Option<TagType>) -> Self {
        TagReadRequest {
            name: name.into(),
            type_hint: hint,
        }
    }
}

/// A tag the PLC actually holds, as reported by discovery.
#[derive(Debug, Clone, Serialize)]
pub struct TagInfo {
    pub name: String,
    /// Family-specific numeric type code.
    pub type_code: u16,
    pub tag_type: TagType,
    /// Array dimensions; empty for scalars.
    pub dimensions: Vec<u32>,
    pub readable: bool,
    pub writable: bool,
}

/// Vendor identity reported once post-connect; families without the concept
/// return `None` from `device_info`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub vendor: String,
    pub product_name: String,
    pub serial: String,
    pub revision: String,
}

/// The polymorphic abstraction over a PLC family.
///
/// All I/O methods serialize on the adapter's internal mutex; `is_connected`,
/// `is_connection_error`, `supports_discovery` and `connection_mode` do not
/// touch it. A full-batch `read` failure leaves the driver reporting
/// `is_connected() == false` before returning.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Establish the protocol session.
    async fn connect(&self) -> DriverResult<()>;

    /// Release all resources; idempotent.
    async fn close(&self);

    /// Cheap predicate; false after any terminal transport error, even
    /// before `close`.
    fn is_connected(&self) -> bool;

    /// Human-readable description, diagnostics only.
    fn connection_mode(&self) -> String;

    async fn device_info(&self) -> Option<DeviceInfo>;

    fn supports_discovery(&self) -> bool;

    /// Enumerate program names; empty when discovery is unsupported.
    async fn programs(&self) -> DriverResult<Vec<String>>;

    /// Enumerate all tags; empty when discovery is unsupported.
    async fn all_tags(&self) -> DriverResult<Vec<TagInfo>>;

    /// Bulk read. One TagValue per request, same order. A per-tag failure
    /// sets that TagValue's error and leaves the batch Ok.
    async fn read(&self, requests: &[TagReadRequest]) -> DriverResult<Vec<TagValue>>;

    /// Single-tag write; the caller has already coerced `value` to the tag's
    /// declared type.
    async fn write(&self, name: &str, value: Value) -> DriverResult<()>;

    /// Does this error imply the transport is dead?
    fn is_connection_error(&self, err: &DriverError) -> bool {
        matches!(
            err,
            DriverError::Connection(_) | DriverError::NotConnected | DriverError::Connect(_)
        )
    }

    /// Issued when a poll cycle has no tags to read. May be a no-op; must not
    /// race read/write.
    async fn keepalive(&self) -> DriverResult<()> {
        Ok(())
    }
}
