use crate::tags::Family;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// One tag the operator wants polled on a PLC.
#[derive(Debug, Deserialize, Clone)]
pub struct TagSelectionConfig {
    /// Canonical tag name (e.g. "Program:Main.Counter", "DB1.0", "D100.5").
    pub name: String,
    /// Optional display alias used in paths and payloads.
    #[serde(default)]
    pub alias: Option<String>,
    /// Declared data-type hint (required for families without discovery).
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub writable: bool,
    /// Structure members whose mutation should not count as a change.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
    // Per-destination suppression flags.
    #[serde(default)]
    pub no_rest: bool,
    #[serde(default)]
    pub no_mqtt: bool,
    #[serde(default)]
    pub no_kafka: bool,
    #[serde(default)]
    pub no_valkey: bool,
}

/// One managed PLC.
#[derive(Debug, Deserialize, Clone)]
pub struct PlcConfig {
    pub name: String,
    pub address: String,
    pub family: Family,
    /// Backplane slot (Logix) or rack hint (S7).
    #[serde(default)]
    pub slot: Option<u8>,
    /// Unit / CPU slot hint (S7, FINS node).
    #[serde(default)]
    pub unit: Option<u8>,
    /// Per-PLC poll rate override in milliseconds.
    #[serde(default)]
    pub poll_rate: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<TagSelectionConfig>,
}

impl PlcConfig {
    /// Reject malformed entries; a bad PLC entry is fatal only for that
    /// entry, so the caller logs and skips it.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("plc name must not be empty".into());
        }
        if self.address.is_empty() && self.family != Family::Sim {
            return Err(format!("plc {}: address must not be empty", self.name));
        }
        let mut seen = HashSet::new();
        for tag in &self.tags {
            if tag.name.is_empty() {
                return Err(format!("plc {}: tag with empty name", self.name));
            }
            let key = self.family.normalize(&tag.name);
            if !seen.insert(key) {
                return Err(format!("plc {}: duplicate tag {}", self.name, tag.name));
            }
        }
        Ok(())
    }
}

fn default_namespace() -> String {
    "plcgate".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub selector: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValkeyConfig {
    /// e.g. "redis://127.0.0.1:6379/"
    pub addr: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub selector: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    /// Comma-separated broker list.
    pub brokers: String,
    #[serde(default = "default_kafka_group")]
    pub group: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub selector: Option<String>,
    /// Write requests older than this many milliseconds are skipped as stale.
    #[serde(default = "default_write_max_age_ms")]
    pub write_max_age_ms: u64,
}

fn default_kafka_group() -> String {
    "plcgate-writeback".to_string()
}

fn default_write_max_age_ms() -> u64 {
    2000
}

/// A named group of tags republished as one JSON object whenever any member
/// changes. Members are "<plc>.<tag-or-alias>" references.
#[derive(Debug, Deserialize, Clone)]
pub struct PackConfig {
    pub name: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub plcs: Vec<PlcConfig>,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub valkey: Option<ValkeyConfig>,
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub packs: Vec<PackConfig>,
}

impl Settings {
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(config_path))
            .build()?;
        s.try_deserialize()
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plc(tags: Vec<TagSelectionConfig>) -> PlcConfig {
        PlcConfig {
            name: "p1".into(),
            address: "10.0.0.5".into(),
            family: Family::S7,
            slot: None,
            unit: None,
            poll_rate: None,
            enabled: true,
            tags,
        }
    }

    fn sel(name: &str) -> TagSelectionConfig {
        TagSelectionConfig {
            name: name.into(),
            alias: None,
            data_type: None,
            enabled: true,
            writable: false,
            ignore_changes: vec![],
            no_rest: false,
            no_mqtt: false,
            no_kafka: false,
            no_valkey: false,
        }
    }

    #[test]
    fn duplicate_tags_rejected_case_insensitively_for_s7() {
        let cfg = plc(vec![sel("db1.0"), sel("DB1.0")]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn logix_tags_are_case_sensitive() {
        let mut cfg = plc(vec![sel("Counter"), sel("counter")]);
        cfg.family = Family::Logix;
        assert!(cfg.validate().is_ok());
    }
}
