use crate::config::settings::PlcConfig;
use crate::drivers::traits::{
    DeviceInfo, Driver, DriverError, DriverResult, TagInfo, TagReadRequest,
};
use crate::tags::value::{TagType, TagValue, Value};
use crate::tags::Family;
use async_trait::async_trait;
use rust_snap7::S7Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task;

/// One parsed S7 address: `DB<db>.<byte>[.<bit>]`, e.g. `DB1.0`, `DB20.4.3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Address {
    pub db: i32,
    pub byte: i32,
    pub bit: Option<u8>,
}

impl S7Address {
    pub fn parse(name: &str) -> DriverResult<S7Address> {
        let upper = name.to_uppercase();
        let rest = upper
            .strip_prefix("DB")
            .ok_or_else(|| DriverError::Protocol(format!("bad s7 address {}", name)))?;
        let mut parts = rest.split('.');
        let db = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DriverError::Protocol(format!("bad s7 db number in {}", name)))?;
        let byte = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DriverError::Protocol(format!("bad s7 byte offset in {}", name)))?;
        let bit = match parts.next() {
            None => None,
            Some(b) => Some(
                b.parse()
                    .ok()
                    .filter(|b| *b < 8)
                    .ok_or_else(|| DriverError::Protocol(format!("bad s7 bit in {}", name)))?,
            ),
        };
        Ok(S7Address { db, byte, bit })
    }
}

fn type_size(tag_type: TagType) -> i32 {
    match tag_type {
        TagType::Bool | TagType::Sint | TagType::Usint => 1,
        TagType::Int | TagType::Uint => 2,
        TagType::Dint | TagType::Udint | TagType::Real => 4,
        TagType::Lint | TagType::Ulint | TagType::Lreal => 8,
        TagType::String => 254,
        TagType::Struct => 4,
    }
}

/// S7 big-endian buffer decode.
fn decode(buf: &[u8], tag_type: TagType, bit: Option<u8>) -> DriverResult<Value> {
    let need = type_size(tag_type) as usize;
    if buf.len() < need {
        return Err(DriverError::Protocol("short s7 read".to_string()));
    }
    let value = match tag_type {
        TagType::Bool => {
            let bit = bit.unwrap_or(0);
            Value::Bool(buf[0] & (1 << bit) != 0)
        }
        TagType::Sint => Value::Int(buf[0] as i8 as i64),
        TagType::Usint => Value::Uint(buf[0] as u64),
        TagType::Int => Value::Int(i16::from_be_bytes([buf[0], buf[1]]) as i64),
        TagType::Uint => Value::Uint(u16::from_be_bytes([buf[0], buf[1]]) as u64),
        TagType::Dint => {
            Value::Int(i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64)
        }
        TagType::Udint => {
            Value::Uint(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64)
        }
        TagType::Lint => Value::Int(i64::from_be_bytes(buf[..8].try_into().expect("len"))),
        TagType::Ulint => Value::Uint(u64::from_be_bytes(buf[..8].try_into().expect("len"))),
        TagType::Real => {
            Value::Float(f32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64)
        }
        TagType::Lreal => Value::Float(f64::from_be_bytes(buf[..8].try_into().expect("len"))),
        TagType::String | TagType::Struct => {
            return Err(DriverError::Protocol(
                "s7 string/struct reads need a declared layout".to_string(),
            ))
        }
    };
    Ok(value)
}

fn encode(value: &Value, tag_type: TagType, current: u8, bit: Option<u8>) -> DriverResult<Vec<u8>> {
    let buf = match (tag_type, value) {
        (TagType::Bool, Value::Bool(b)) => {
            let bit = bit.unwrap_or(0);
            let mut byte = current;
            if *b {
                byte |= 1 << bit;
            } else {
                byte &= !(1 << bit);
            }
            vec![byte]
        }
        (TagType::Sint, Value::Int(i)) => vec![*i as i8 as u8],
        (TagType::Usint, Value::Uint(u)) => vec![*u as u8],
        (TagType::Int, Value::Int(i)) => (*i as i16).to_be_bytes().to_vec(),
        (TagType::Uint, Value::Uint(u)) => (*u as u16).to_be_bytes().to_vec(),
        (TagType::Dint, Value::Int(i)) => (*i as i32).to_be_bytes().to_vec(),
        (TagType::Udint, Value::Uint(u)) => (*u as u32).to_be_bytes().to_vec(),
        (TagType::Lint, Value::Int(i)) => i.to_be_bytes().to_vec(),
        (TagType::Ulint, Value::Uint(u)) => u.to_be_bytes().to_vec(),
        (TagType::Real, Value::Float(f)) => (*f as f32).to_be_bytes().to_vec(),
        (TagType::Lreal, Value::Float(f)) => f.to_be_bytes().to_vec(),
        (ty, v) => {
            return Err(DriverError::UnsupportedValue {
                tag: String::new(),
                reason: format!("{} does not accept {}", ty, v.type_label()),
            })
        }
    };
    Ok(buf)
}

/// Siemens S7 adapter over snap7. Addresses are DB-relative; no discovery,
/// the inventory is synthesized from configuration.
pub struct S7Driver {
    name: String,
    address: String,
    rack: i32,
    slot: i32,
    connected: AtomicBool,
    client: Arc<StdMutex<S7Client>>,
}

impl S7Driver {
    pub fn new(cfg: &PlcConfig) -> DriverResult<Self> {
        Ok(S7Driver {
            name: cfg.name.clone(),
            address: cfg.address.clone(),
            rack: cfg.slot.unwrap_or(0) as i32,
            slot: cfg.unit.unwrap_or(1) as i32,
            connected: AtomicBool::new(false),
            client: Arc::new(StdMutex::new(S7Client::create())),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S7Client) -> DriverResult<T> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        task::spawn_blocking(move || {
            let mut guard = client.lock().map_err(|_| {
                DriverError::Protocol("s7 client mutex poisoned".to_string())
            })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| DriverError::Protocol(e.to_string()))?
    }
}

#[async_trait]
impl Driver for S7Driver {
    async fn connect(&self) -> DriverResult<()> {
        let address = self.address.clone();
        let (rack, slot) = (self.rack, self.slot);
        self.blocking(move |client| {
            client
                .connect_to(&address, rack, slot)
                .map_err(|e| DriverError::Connect(format!("{:?}", e)))
        })
        .await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .blocking(|client| {
                let _ = client.disconnect();
                Ok(())
            })
            .await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_mode(&self) -> String {
        format!("s7 (rack {} slot {} @ {})", self.rack, self.slot, self.address)
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
            let tag_type = req.type_hint.unwrap_or(TagType::Int);
            let parsed = match S7Address::parse(&req.name) {
                Ok(a) => a,
                Err(e) => {
                    out.push(TagValue::error(&req.name, Family::S7, e.to_string()));
                    continue;
                }
            };
            let size = type_size(tag_type);
            let result = self
                .blocking(move |client| {
                    let mut buf = vec![0u8; size as usize];
                    client
                        .db_read(parsed.db, parsed.byte, size, &mut buf)
                        .map_err(|e| DriverError::Connection(format!("db read failed: {:?}", e)))?;
                    Ok(buf)
                })
                .await;
            match result {
                Ok(buf) => match decode(&buf, tag_type, parsed.bit) {
                    Ok(value) => {
                        let mut tv = TagValue::new(&req.name, Family::S7, tag_type, value);
                        tv.type_code = tag_type as u16;
                        tv.raw = Some(buf);
                        out.push(tv);
                    }
                    Err(e) => out.push(TagValue::error(&req.name, Family::S7, e.to_string())),
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
        let parsed = S7Address::parse(name)?;
        let tag_type = match &value {
            Value::Bool(_) => TagType::Bool,
            Value::Int(_) => TagType::Int,
            Value::Uint(_) => TagType::Uint,
            Value::Float(_) => TagType::Real,
            other => {
                return Err(DriverError::UnsupportedValue {
                    tag: name.to_string(),
                    reason: format!("s7 cannot write {}", other.type_label()),
                })
            }
        };
        let value = value.clone();
        self.blocking(move |client| {
            // bit writes read-modify-write the containing byte
            let current = if parsed.bit.is_some() {
                let mut byte = [0u8; 1];
                client
                    .db_read(parsed.db, parsed.byte, 1, &mut byte)
                    .map_err(|e| DriverError::Connection(format!("db read failed: {:?}", e)))?;
                byte[0]
            } else {
                0
            };
            let mut buf = encode(&value, tag_type, current, parsed.bit)?;
            client
                .db_write(parsed.db, parsed.byte, buf.len() as i32, &mut buf)
                .map_err(|e| DriverError::Connection(format!("db write failed: {:?}", e)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        assert_eq!(
            S7Address::parse("db1.4").unwrap(),
            S7Address {
                db: 1,
                byte: 4,
                bit: None
            }
        );
        assert_eq!(
            S7Address::parse("DB20.4.3").unwrap(),
            S7Address {
                db: 20,
                byte: 4,
                bit: Some(3)
            }
        );
        assert!(S7Address::parse("M0.0").is_err());
        assert!(S7Address::parse("DB1.0.9").is_err());
    }

    #[test]
    fn big_endian_decode() {
        assert_eq!(
            decode(&[0x01, 0x02], TagType::Int, None).unwrap(),
            Value::Int(0x0102)
        );
        assert_eq!(
            decode(&[0b0000_1000], TagType::Bool, Some(3)).unwrap(),
            Value::Bool(true)
        );
    }
}
