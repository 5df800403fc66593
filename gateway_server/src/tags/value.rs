use crate::tags::Family;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A decoded tag value, normalized across PLC families: a scalar, an array of
/// scalars, or a name->value mapping for user-defined structures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    /// Canonical string form. Change detection and publisher suppression both
    /// compare this form, so it must be deterministic: struct members render
    /// in key order (BTreeMap), floats use the shortest round-trip form.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Text(_) => "string",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Uint(u) => write!(f, "{}", u),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
            Value::Struct(members) => {
                f.write_str("{")?;
                for (i, (k, v)) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Native data type of a tag, unified across families. Drivers map their
/// family-specific type codes onto this; the write coercion path keys off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagType {
    Bool,
    Sint,
    Int,
    Dint,
    Lint,
    Usint,
    Uint,
    Udint,
    Ulint,
    Real,
    Lreal,
    String,
    Struct,
}

impl TagType {
    pub fn name(self) -> &'static str {
        match self {
            TagType::Bool => "BOOL",
            TagType::Sint => "SINT",
            TagType::Int => "INT",
            TagType::Dint => "DINT",
            TagType::Lint => "LINT",
            TagType::Usint => "USINT",
            TagType::Uint => "UINT",
            TagType::Udint => "UDINT",
            TagType::Ulint => "ULINT",
            TagType::Real => "REAL",
            TagType::Lreal => "LREAL",
            TagType::String => "STRING",
            TagType::Struct => "STRUCT",
        }
    }

    /// Parse a declared data-type hint from configuration. Accepts the IEC
    /// names used across families plus a few aliases.
    pub fn parse(s: &str) -> Option<TagType> {
        let t = match s.to_uppercase().as_str() {
            "BOOL" | "BIT" => TagType::Bool,
            "SINT" | "BYTE" | "INT8" => TagType::Sint,
            "INT" | "WORD" | "INT16" => TagType::Int,
            "DINT" | "DWORD" | "INT32" => TagType::Dint,
            "LINT" | "INT64" => TagType::Lint,
            "USINT" | "UINT8" => TagType::Usint,
            "UINT" | "UINT16" => TagType::Uint,
            "UDINT" | "UINT32" => TagType::Udint,
            "ULINT" | "UINT64" => TagType::Ulint,
            "REAL" | "FLOAT" | "FLOAT32" => TagType::Real,
            "LREAL" | "DOUBLE" | "FLOAT64" => TagType::Lreal,
            "STRING" => TagType::String,
            "STRUCT" | "UDT" => TagType::Struct,
            _ => return None,
        };
        Some(t)
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The result of reading one tag. `error` is set when this single read failed
/// while the batch as a whole succeeded.
#[derive(Debug, Clone)]
pub struct TagValue {
    pub name: String,
    pub family: Family,
    /// Family-specific numeric type code, as reported by the driver.
    pub type_code: u16,
    pub tag_type: TagType,
    pub value: Value,
    /// Canonical string of the stable projection (value minus ignored
    /// members). Computed once at read time; the sole basis for change
    /// detection.
    pub stable: String,
    /// Raw bytes in the device's native byte order, when the driver has them.
    pub raw: Option<Vec<u8>>,
    pub elements: usize,
    pub error: Option<String>,
}

impl TagValue {
    pub fn new(name: impl Into<String>, family: Family, tag_type: TagType, value: Value) -> Self {
        let stable = value.canonical();
        TagValue {
            name: name.into(),
            family,
            type_code: 0,
            tag_type,
            value,
            stable,
            raw: None,
            elements: 1,
            error: None,
        }
    }

    pub fn error(name: impl Into<String>, family: Family, err: impl Into<String>) -> Self {
        TagValue {
            name: name.into(),
            family,
            type_code: 0,
            tag_type: TagType::Struct,
            value: Value::Null,
            stable: String::new(),
            raw: None,
            elements: 0,
            error: Some(err.into()),
        }
    }

    /// Recompute the cached stable projection, dropping ignored structure
    /// members. A no-op for scalars and arrays.
    pub fn finalize_stable(&mut self, ignore: &[String]) {
        self.stable = stable_projection(&self.value, ignore).canonical();
    }

    /// Change test against the previous read of the same tag.
    pub fn changed_from(&self, prev: Option<&TagValue>) -> bool {
        match prev {
            None => true,
            Some(p) => p.stable != self.stable,
        }
    }
}

/// The stable projection of a value: structure members named in `ignore` are
/// removed before comparison. Nested lookups use the member name only at the
/// top level, matching how selections declare them.
pub fn stable_projection(value: &Value, ignore: &[String]) -> Value {
    if ignore.is_empty() {
        return value.clone();
    }
    match value {
        Value::Struct(members) => {
            let kept: BTreeMap<String, Value> = members
                .iter()
                .filter(|(k, _)| !ignore.iter().any(|ig| ig == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Struct(kept)
        }
        other => other.clone(),
    }
}

/// One entry on the fan-out bus: a tag whose stable projection differs from
/// the previous poll (or that has no previous value).
#[derive(Debug, Clone)]
pub struct ValueChange {
    pub plc: String,
    /// Canonical tag name.
    pub tag: String,
    /// Display alias; equals `tag` when no alias is configured.
    pub alias: String,
    /// Family-normalized address for display (upper-cased for S7/Omron).
    pub address: String,
    pub type_name: String,
    pub value: Value,
    pub writable: bool,
    pub family: Family,
    pub no_rest: bool,
    pub no_mqtt: bool,
    pub no_kafka: bool,
    pub no_valkey: bool,
}

/// Per-PLC health, published on a fixed cadence.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub plc: String,
    pub driver: String,
    pub online: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}
