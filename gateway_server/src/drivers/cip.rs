use crate::config::settings::PlcConfig;
use crate::drivers::traits::{
    DeviceInfo, Driver, DriverError, DriverResult, TagInfo, TagReadRequest,
};
use crate::tags::value::{TagType, TagValue, Value};
use crate::tags::Family;
use async_trait::async_trait;
use plctag::RawTag;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task;

const IO_TIMEOUT_MS: u32 = 2000;

/// CIP/EtherNet-IP adapter over libplctag: ControlLogix/CompactLogix,
/// Micro800, and Omron NJ/NX. One lazily-created libplctag tag handle per
/// polled tag, cached for the life of the session.
pub struct CipDriver {
    name: String,
    family: Family,
    gateway: String,
    route_path: Option<String>,
    connected: AtomicBool,
    tags: Mutex<HashMap<String, Arc<RawTag>>>,
}

impl CipDriver {
    pub fn new(cfg: &PlcConfig) -> DriverResult<Self> {
        let route_path = match cfg.family {
            // Micro800 connections must not carry a path attribute
            Family::Micro800 => None,
            _ => Some(format!("1,{}", cfg.slot.unwrap_or(0))),
        };
        Ok(CipDriver {
            name: cfg.name.clone(),
            family: cfg.family,
            gateway: cfg.address.clone(),
            route_path,
            connected: AtomicBool::new(false),
            tags: Mutex::new(HashMap::new()),
        })
    }

    fn plc_kind(&self) -> &'static str {
        match self.family {
            Family::Micro800 => "micro800",
            Family::Omron => "omron-njnx",
            _ => "controllogix",
        }
    }

    fn attribute_path(&self, tag: &str, tag_type: TagType, elements: usize) -> String {
        let mut attrs = vec![
            "protocol=ab-eip".to_string(),
            format!("plc={}", self.plc_kind()),
            format!("gateway={}", self.gateway),
        ];
        if let Some(path) = &self.route_path {
            attrs.push(format!("path={}", path));
        }
        attrs.push(format!("name={}", tag));
        if elements > 1 {
            attrs.push(format!("elem_count={}", elements));
        }
        // ControlLogix infers element sizes; the others require them
        if self.family != Family::Logix {
            attrs.push(format!("elem_size={}", elem_size(tag_type)));
        }
        attrs.join("&")
    }

    async fn handle(&self, tag: &str, tag_type: TagType) -> DriverResult<Arc<RawTag>> {
        let mut tags = self.tags.lock().await;
        if let Some(handle) = tags.get(tag) {
            return Ok(Arc::clone(handle));
        }
        let path = self.attribute_path(tag, tag_type, 1);
        let created = task::spawn_blocking(move || RawTag::new(path, IO_TIMEOUT_MS))
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))?
            .map_err(|e| DriverError::Connection(format!("tag create failed: {:?}", e)))?;
        let handle = Arc::new(created);
        tags.insert(tag.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    fn decode(handle: &RawTag, tag_type: TagType) -> DriverResult<Value> {
        let read_err = |e| DriverError::Protocol(format!("decode failed: {:?}", e));
        let value = match tag_type {
            TagType::Bool => Value::Bool(handle.get_u8(0).map_err(read_err)? != 0),
            TagType::Sint => Value::Int(handle.get_i8(0).map_err(read_err)? as i64),
            TagType::Int => Value::Int(handle.get_i16(0).map_err(read_err)? as i64),
            TagType::Dint => Value::Int(handle.get_i32(0).map_err(read_err)? as i64),
            TagType::Lint => Value::Int(handle.get_i64(0).map_err(read_err)?),
            TagType::Usint => Value::Uint(handle.get_u8(0).map_err(read_err)? as u64),
            TagType::Uint => Value::Uint(handle.get_u16(0).map_err(read_err)? as u64),
            TagType::Udint => Value::Uint(handle.get_u32(0).map_err(read_err)? as u64),
            TagType::Ulint => Value::Uint(handle.get_u64(0).map_err(read_err)?),
            TagType::Real => Value::Float(handle.get_f32(0).map_err(read_err)? as f64),
            TagType::Lreal => Value::Float(handle.get_f64(0).map_err(read_err)?),
            TagType::String | TagType::Struct => {
                return Err(DriverError::Protocol(
                    "string/struct decode requires a declared layout".to_string(),
                ))
            }
        };
        Ok(value)
    }

    fn encode(handle: &RawTag, tag_type: TagType, value: &Value) -> DriverResult<()> {
        let write_err = |e| DriverError::Protocol(format!("encode failed: {:?}", e));
        match (tag_type, value) {
            (TagType::Bool, Value::Bool(b)) => handle.set_u8(0, *b as u8).map_err(write_err),
            (TagType::Sint, Value::Int(i)) => handle.set_i8(0, *i as i8).map_err(write_err),
            (TagType::Int, Value::Int(i)) => handle.set_i16(0, *i as i16).map_err(write_err),
            (TagType::Dint, Value::Int(i)) => handle.set_i32(0, *i as i32).map_err(write_err),
            (TagType::Lint, Value::Int(i)) => handle.set_i64(0, *i).map_err(write_err),
            (TagType::Usint, Value::Uint(u)) => handle.set_u8(0, *u as u8).map_err(write_err),
            (TagType::Uint, Value::Uint(u)) => handle.set_u16(0, *u as u16).map_err(write_err),
            (TagType::Udint, Value::Uint(u)) => handle.set_u32(0, *u as u32).map_err(write_err),
            (TagType::Ulint, Value::Uint(u)) => handle.set_u64(0, *u).map_err(write_err),
            (TagType::Real, Value::Float(f)) => handle.set_f32(0, *f as f32).map_err(write_err),
            (TagType::Lreal, Value::Float(f)) => handle.set_f64(0, *f).map_err(write_err),
            (ty, v) => Err(DriverError::UnsupportedValue {
                tag: String::new(),
                reason: format!("{} does not accept {}", ty, v.type_label()),
            }),
        }
    }
}

fn elem_size(tag_type: TagType) -> usize {
    match tag_type {
        TagType::Bool | TagType::Sint | TagType::Usint => 1,
        TagType::Int | TagType::Uint => 2,
        TagType::Dint | TagType::Udint | TagType::Real => 4,
        TagType::Lint | TagType::Ulint | TagType::Lreal => 8,
        TagType::String => 88,
        TagType::Struct => 4,
    }
}

#[async_trait]
impl Driver for CipDriver {
    async fn connect(&self) -> DriverResult<()> {
        // libplctag sessions are lazy per tag; reachability is proven by the
        // first tag handle.
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.tags.lock().await.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_mode(&self) -> String {
        format!("cip ({} @ {})", self.plc_kind(), self.gateway)
    }

    async fn device_info(&self) -> Option<DeviceInfo> {
        None
    }

    fn supports_discovery(&self) -> bool {
        false
    }

    async fn programs(&self) -> DriverResult<Vec<String>> {
        Ok(vec![])
    }

    async fn all_tags(&self) -> DriverResult<Vec<TagInfo>> {
        Ok(vec![])
    }

    async fn read(&self, requests: &[TagReadRequest]) -> DriverResult<Vec<TagValue>> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let mut out = Vec::with_capacity(requests.len());
        for req in requests {
            let tag_type = req.type_hint.unwrap_or(TagType::Dint);
            match self.read_one(&req.name, tag_type).await {
                Ok(value) => {
                    let mut tv = TagValue::new(&req.name, self.family, tag_type, value);
                    tv.type_code = tag_type as u16;
                    out.push(tv);
                }
                Err(err) if self.is_connection_error(&err) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(err);
                }
                Err(err) => out.push(TagValue::error(&req.name, self.family, err.to_string())),
            }
        }
        Ok(out)
    }

    async fn write(&self, name: &str, value: Value) -> DriverResult<()> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let tag_type = value_tag_type(&value);
        let handle = self.handle(name, tag_type).await?;
        Self::encode(&handle, tag_type, &value)?;
        let status = task::spawn_blocking({
            let handle = Arc::clone(&handle);
            move || handle.write(IO_TIMEOUT_MS)
        })
        .await
        .map_err(|e| DriverError::Protocol(e.to_string()))?;
        if status.is_err() {
            return Err(DriverError::Protocol(format!(
                "write {} failed: {:?}",
                name, status
            )));
        }
        Ok(())
    }

    async fn keepalive(&self) -> DriverResult<()> {
        Ok(())
    }
}

impl CipDriver {
    async fn read_one(&self, name: &str, tag_type: TagType) -> DriverResult<Value> {
        let handle = self.handle(name, tag_type).await?;
        let status = task::spawn_blocking({
            let handle = Arc::clone(&handle);
            move || handle.read(IO_TIMEOUT_MS)
        })
        .await
        .map_err(|e| DriverError::Protocol(e.to_string()))?;
        if status.is_err() {
            // a dead handle means the session is gone; force re-creation
            self.tags.lock().await.remove(name);
            return Err(DriverError::Connection(format!(
                "read {} failed: {:?}",
                name, status
            )));
        }
        Self::decode(&handle, tag_type)
    }
}

fn value_tag_type(value: &Value) -> TagType {
    match value {
        Value::Bool(_) => TagType::Bool,
        Value::Int(_) => TagType::Dint,
        Value::Uint(_) => TagType::Udint,
        Value::Float(_) => TagType::Real,
        Value::Text(_) => TagType::String,
        _ => TagType::Dint,
    }
}
