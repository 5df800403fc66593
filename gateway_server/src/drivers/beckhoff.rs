use crate::config::settings::PlcConfig;
use crate::drivers::traits::{
    DeviceInfo, Driver, DriverError, DriverResult, TagInfo, TagReadRequest,
};
use crate::tags::value::{TagType, TagValue, Value};
use crate::tags::Family;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task;

fn type_size(tag_type: TagType) -> usize {
    match tag_type {
        TagType::Bool | TagType::Sint | TagType::Usint => 1,
        TagType::Int | TagType::Uint => 2,
        TagType::Dint | TagType::Udint | TagType::Real => 4,
        TagType::Lint | TagType::Ulint | TagType::Lreal => 8,
        TagType::String => 81,
        TagType::Struct => 4,
    }
}

/// ADS little-endian buffer decode.
fn decode(buf: &[u8], tag_type: TagType) -> DriverResult<Value> {
    if buf.len() < type_size(tag_type) {
        return Err(DriverError::Protocol("short ads read".to_string()));
    }
    let value = match tag_type {
        TagType::Bool => Value::Bool(buf[0] != 0),
        TagType::Sint => Value::Int(buf[0] as i8 as i64),
        TagType::Usint => Value::Uint(buf[0] as u64),
        TagType::Int => Value::Int(i16::from_le_bytes([buf[0], buf[1]]) as i64),
        TagType::Uint => Value::Uint(u16::from_le_bytes([buf[0], buf[1]]) as u64),
        TagType::Dint => Value::Int(i32::from_le_bytes(buf[..4].try_into().expect("len")) as i64),
        TagType::Udint => {
            Value::Uint(u32::from_le_bytes(buf[..4].try_into().expect("len")) as u64)
        }
        TagType::Lint => Value::Int(i64::from_le_bytes(buf[..8].try_into().expect("len"))),
        TagType::Ulint => Value::Uint(u64::from_le_bytes(buf[..8].try_into().expect("len"))),
        TagType::Real => {
            Value::Float(f32::from_le_bytes(buf[..4].try_into().expect("len")) as f64)
        }
        TagType::Lreal => Value::Float(f64::from_le_bytes(buf[..8].try_into().expect("len"))),
        TagType::String => {
            let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            Value::Text(String::from_utf8_lossy(&buf[..end]).to_string())
        }
        TagType::Struct => {
            return Err(DriverError::Protocol(
                "ads struct reads need a declared layout".to_string(),
            ))
        }
    };
    Ok(value)
}

fn encode(value: &Value, tag_type: TagType) -> DriverResult<Vec<u8>> {
    let buf = match (tag_type, value) {
        (TagType::Bool, Value::Bool(b)) => vec![*b as u8],
        (TagType::Sint, Value::Int(i)) => vec![*i as i8 as u8],
        (TagType::Usint, Value::Uint(u)) => vec![*u as u8],
        (TagType::Int, Value::Int(i)) => (*i as i16).to_le_bytes().to_vec(),
        (TagType::Uint, Value::Uint(u)) => (*u as u16).to_le_bytes().to_vec(),
        (TagType::Dint, Value::Int(i)) => (*i as i32).to_le_bytes().to_vec(),
        (TagType::Udint, Value::Uint(u)) => (*u as u32).to_le_bytes().to_vec(),
        (TagType::Lint, Value::Int(i)) => i.to_le_bytes().to_vec(),
        (TagType::Ulint, Value::Uint(u)) => u.to_le_bytes().to_vec(),
        (TagType::Real, Value::Float(f)) => (*f as f32).to_le_bytes().to_vec(),
        (TagType::Lreal, Value::Float(f)) => f.to_le_bytes().to_vec(),
        (TagType::String, Value::Text(s)) => {
            let mut b = s.as_bytes().to_vec();
            b.push(0);
            b
        }
        (ty, v) => {
            return Err(DriverError::UnsupportedValue {
                tag: String::new(),
                reason: format!("{} does not accept {}", ty, v.type_label()),
            })
        }
    };
    Ok(buf)
}

/// Beckhoff TwinCAT adapter over ADS symbol handles. Symbol names are
/// case-sensitive, `MAIN.fValue` style.
pub struct AdsDriver {
    name: String,
    address: String,
    net_id: String,
    ams_port: u16,
    connected: AtomicBool,
    client: Arc<StdMutex<Option<ads::Client>>>,
}

impl AdsDriver {
    pub fn new(cfg: &PlcConfig) -> DriverResult<Self> {
        // convention: AMS NetId is the route host + ".1.1" unless the
        // address carries an explicit netid after '/'
        let (address, net_id) = match cfg.address.split_once('/') {
            Some((host, netid)) => (host.to_string(), netid.to_string()),
            None => (cfg.address.clone(), format!("{}.1.1", cfg.address)),
        };
        Ok(AdsDriver {
            name: cfg.name.clone(),
            address,
            net_id,
            ams_port: 851 + cfg.unit.unwrap_or(0) as u16,
            connected: AtomicBool::new(false),
            client: Arc::new(StdMutex::new(None)),
        })
    }

    fn ams_addr(&self) -> DriverResult<ads::AmsAddr> {
        let net_id: ads::AmsNetId = self
            .net_id
            .parse()
            .map_err(|_| DriverError::Connect(format!("bad ams netid {}", self.net_id)))?;
        Ok(ads::AmsAddr::new(net_id, self.ams_port))
    }

    async fn blocking<T, F>(&self, f: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ads::Client, ads::AmsAddr) -> DriverResult<T> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        let addr = self.ams_addr()?;
        task::spawn_blocking(move || {
            let guard = client
                .lock()
                .map_err(|_| DriverError::Protocol("ads client mutex poisoned".to_string()))?;
            let client = guard.as_ref().ok_or(DriverError::NotConnected)?;
            f(client, addr)
        })
        .await
        .map_err(|e| DriverError::Protocol(e.to_string()))?
    }
}

#[async_trait]
impl Driver for AdsDriver {
    async fn connect(&self) -> DriverResult<()> {
        let address = self.address.clone();
        let holder = Arc::clone(&self.client);
        let addr = self.ams_addr()?;
        task::spawn_blocking(move || {
            let client = ads::Client::new(
                (address.as_str(), ads::PORT),
                ads::Timeouts::new(std::time::Duration::from_secs(2)),
                ads::Source::Request,
            )
            .map_err(|e| DriverError::Connect(e.to_string()))?;
            // reading the device state proves the route works
            client
                .device(addr)
                .get_state()
                .map_err(|e| DriverError::Connect(e.to_string()))?;
            *holder
                .lock()
                .map_err(|_| DriverError::Protocol("ads client mutex poisoned".to_string()))? =
                Some(client);
            Ok(())
        })
        .await
        .map_err(|e| DriverError::Protocol(e.to_string()))??;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.client.lock() {
            guard.take();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_mode(&self) -> String {
        format!("ads ({}:{} @ {})", self.net_id, self.ams_port, self.address)
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
            let symbol = req.name.clone();
            let size = type_size(tag_type);
            let result = self
                .blocking(move |client, addr| {
                    let device = client.device(addr);
                    let handle = ads::symbol::Handle::new(&device, &symbol)
                        .map_err(|e| DriverError::Connection(e.to_string()))?;
                    let mut buf = vec![0u8; size];
                    handle
                        .read(&mut buf)
                        .map_err(|e| DriverError::Connection(e.to_string()))?;
                    Ok(buf)
                })
                .await;
            match result {
                Ok(buf) => match decode(&buf, tag_type) {
                    Ok(value) => {
                        let mut tv = TagValue::new(&req.name, Family::Beckhoff, tag_type, value);
                        tv.type_code = tag_type as u16;
                        tv.raw = Some(buf);
                        out.push(tv);
                    }
                    Err(e) => {
                        out.push(TagValue::error(&req.name, Family::Beckhoff, e.to_string()))
                    }
                },
                Err(err) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        Ok(out)
    }

    async fn write(&self, name: &str, value: Value) -> DriverResult<()> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let tag_type = match &value {
            Value::Bool(_) => TagType::Bool,
            Value::Int(_) => TagType::Dint,
            Value::Uint(_) => TagType::Udint,
            Value::Float(_) => TagType::Lreal,
            Value::Text(_) => TagType::String,
            other => {
                return Err(DriverError::UnsupportedValue {
                    tag: name.to_string(),
                    reason: format!("ads cannot write {}", other.type_label()),
                })
            }
        };
        let buf = encode(&value, tag_type)?;
        let symbol = name.to_string();
        self.blocking(move |client, addr| {
            let device = client.device(addr);
            let handle = ads::symbol::Handle::new(&device, &symbol)
                .map_err(|e| DriverError::Connection(e.to_string()))?;
            handle
                .write(&buf)
                .map_err(|e| DriverError::Connection(e.to_string()))?;
            Ok(())
        })
        .await
    }
}
