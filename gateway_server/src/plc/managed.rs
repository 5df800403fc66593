use crate::config::settings::PlcConfig;
use crate::drivers::traits::{DeviceInfo, Driver, TagInfo};
use crate::tags::value::{TagType, TagValue};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Poll rates are clamped to this window.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A normalized, enabled tag selection as the poll loop consumes it. The
/// canonical name has family normalization applied (upper-case for S7/Omron).
#[derive(Debug, Clone)]
pub struct TagSelection {
    pub name: String,
    pub alias: String,
    pub type_hint: Option<TagType>,
    pub writable: bool,
    pub ignore_changes: Vec<String>,
    pub no_rest: bool,
    pub no_mqtt: bool,
    pub no_kafka: bool,
    pub no_valkey: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PollStats {
    pub tags_polled: usize,
    pub changes_found: u64,
    pub last_error: Option<String>,
}

/// Runtime state for one PLC. Held behind a tokio RwLock: workers take the
/// read lock to snapshot, the write lock to mutate status / swap the driver /
/// update values. Invariant: `driver.is_some() ⇔ status == Connected`.
pub struct ManagedPlc {
    pub config: PlcConfig,
    /// Enabled selections in configuration order, names normalized.
    pub selections: Vec<TagSelection>,
    pub driver: Option<Arc<dyn Driver>>,
    pub device_info: Option<DeviceInfo>,
    /// Discovered program names; kept across transient disconnects.
    pub programs: Vec<String>,
    /// Discovered (or synthesized) tag inventory; kept across reconnects so a
    /// fast reconnect skips re-enumeration.
    pub discovered: Vec<TagInfo>,
    /// Latest read per canonical tag name.
    pub values: HashMap<String, TagValue>,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub conn_retries: u32,
    pub retry_limited: bool,
    pub last_poll: Option<DateTime<Utc>>,
    pub stats: PollStats,
}

impl ManagedPlc {
    pub fn new(config: PlcConfig) -> Self {
        let family = config.family;
        let selections = config
            .tags
            .iter()
            .filter(|t| t.enabled)
            .map(|t| {
                let name = family.normalize(&t.name);
                TagSelection {
                    alias: t.alias.clone().unwrap_or_else(|| name.clone()),
                    type_hint: t.data_type.as_deref().and_then(TagType::parse),
                    writable: t.writable,
                    ignore_changes: t.ignore_changes.clone(),
                    no_rest: t.no_rest,
                    no_mqtt: t.no_mqtt,
                    no_kafka: t.no_kafka,
                    no_valkey: t.no_valkey,
                    name,
                }
            })
            .collect();
        ManagedPlc {
            config,
            selections,
            driver: None,
            device_info: None,
            programs: Vec::new(),
            discovered: Vec::new(),
            values: HashMap::new(),
            status: ConnectionStatus::Disconnected,
            last_error: None,
            conn_retries: 0,
            retry_limited: false,
            last_poll: None,
            stats: PollStats::default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        let configured = self
            .config
            .poll_rate
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        configured.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
    }

    /// Look a selection up by canonical name, configured name, or alias.
    pub fn selection(&self, key: &str) -> Option<&TagSelection> {
        let canonical = self.config.family.normalize(key);
        self.selections
            .iter()
            .find(|s| s.name == canonical || s.alias == key)
    }

    pub fn online(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Driver name for health payloads.
    pub fn driver_label(&self) -> String {
        match &self.driver {
            Some(d) => d.connection_mode(),
            None => self.config.family.to_string(),
        }
    }

    /// Synthesize a tag inventory from configuration for families without
    /// discovery.
    pub fn synthesized_tags(&self) -> Vec<TagInfo> {
        self.selections
            .iter()
            .map(|s| {
                let tag_type = s.type_hint.unwrap_or(TagType::Dint);
                TagInfo {
                    name: s.name.clone(),
                    type_code: tag_type as u16,
                    tag_type,
                    dimensions: vec![],
                    readable: true,
                    writable: s.writable,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::TagSelectionConfig;
    use crate::tags::Family;

    fn cfg(poll_rate: Option<u64>) -> PlcConfig {
        PlcConfig {
            name: "p".into(),
            address: "10.1.1.1".into(),
            family: Family::S7,
            slot: None,
            unit: None,
            poll_rate,
            enabled: true,
            tags: vec![TagSelectionConfig {
                name: "db1.0".into(),
                alias: Some("temp".into()),
                data_type: Some("INT".into()),
                enabled: true,
                writable: true,
                ignore_changes: vec![],
                no_rest: false,
                no_mqtt: false,
                no_kafka: false,
                no_valkey: false,
            }],
        }
    }

    #[test]
    fn poll_rate_clamps() {
        assert_eq!(
            ManagedPlc::new(cfg(Some(10))).poll_interval(),
            MIN_POLL_INTERVAL
        );
        assert_eq!(
            ManagedPlc::new(cfg(Some(60_000))).poll_interval(),
            MAX_POLL_INTERVAL
        );
        assert_eq!(
            ManagedPlc::new(cfg(Some(500))).poll_interval(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn selections_normalize_and_alias() {
        let plc = ManagedPlc::new(cfg(None));
        let sel = plc.selection("DB1.0").expect("by canonical");
        assert_eq!(sel.alias, "temp");
        assert!(plc.selection("db1.0").is_some());
        assert!(plc.selection("temp").is_some());
        assert!(plc.selection("DB9.9").is_none());
    }
}
