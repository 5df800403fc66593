use crate::config::settings::PlcConfig;
use crate::drivers::traits::{
    DeviceInfo, Driver, DriverError, DriverResult, TagInfo, TagReadRequest,
};
use crate::tags::value::{TagType, TagValue, Value};
use crate::tags::Family;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// How a simulated tag evolves between polls when it has no script left.
#[derive(Debug, Clone, Copy)]
pub enum SimMode {
    /// Keep the current value until something writes it.
    Hold,
    /// Add `step` on every read.
    Counter(i64),
    /// Flip a BOOL on every read.
    Toggle,
}

struct SimTag {
    tag_type: TagType,
    mode: SimMode,
    /// Values returned on successive reads before `mode` takes over.
    script: VecDeque<Value>,
    current: Value,
    writable: bool,
}

struct SimState {
    tags: HashMap<String, SimTag>,
    /// Batch-level errors returned by upcoming `read` calls, in order.
    read_faults: VecDeque<DriverError>,
}

/// In-process simulated PLC. Discovery-capable; used by tests, the stress
/// binary, and demo configurations (family `sim`).
pub struct SimDriver {
    name: String,
    family: Family,
    connected: AtomicBool,
    state: Mutex<SimState>,
    programs: Vec<String>,
    fail_connects: AtomicUsize,
    keepalives: AtomicUsize,
    reads: AtomicUsize,
    all_tags_probes: AtomicUsize,
    connects: AtomicUsize,
}

impl SimDriver {
    pub fn new(name: impl Into<String>, family: Family) -> Self {
        SimDriver {
            name: name.into(),
            family,
            connected: AtomicBool::new(false),
            state: Mutex::new(SimState {
                tags: HashMap::new(),
                read_faults: VecDeque::new(),
            }),
            programs: vec!["Main".to_string()],
            fail_connects: AtomicUsize::new(0),
            keepalives: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            all_tags_probes: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        }
    }

    /// Seed a driver from an operator configuration: each selection becomes a
    /// generated tag whose evolution depends on its declared type.
    pub fn from_config(cfg: &PlcConfig) -> Self {
        let sim = SimDriver::new(cfg.name.clone(), cfg.family);
        {
            let mut state = sim.state.try_lock().expect("fresh driver");
            for sel in &cfg.tags {
                let tag_type = sel
                    .data_type
                    .as_deref()
                    .and_then(TagType::parse)
                    .unwrap_or(TagType::Dint);
                let (mode, current) = match tag_type {
                    TagType::Bool => (SimMode::Toggle, Value::Bool(false)),
                    TagType::Real | TagType::Lreal => (SimMode::Hold, Value::Float(0.0)),
                    TagType::String => (SimMode::Hold, Value::Text(String::new())),
                    _ => (SimMode::Counter(1), Value::Int(0)),
                };
                state.tags.insert(
                    cfg.family.normalize(&sel.name),
                    SimTag {
                        tag_type,
                        mode,
                        script: VecDeque::new(),
                        current,
                        writable: sel.writable,
                    },
                );
            }
        }
        sim
    }

    /// Define a tag with an explicit per-poll script; once the script is
    /// exhausted the last value holds.
    pub async fn script_tag(
        &self,
        name: &str,
        tag_type: TagType,
        values: Vec<Value>,
        writable: bool,
    ) {
        let mut state = self.state.lock().await;
        let current = values.first().cloned().unwrap_or(Value::Null);
        state.tags.insert(
            self.family.normalize(name),
            SimTag {
                tag_type,
                mode: SimMode::Hold,
                script: values.into(),
                current,
                writable,
            },
        );
    }

    pub async fn set_value(&self, name: &str, value: Value) {
        let mut state = self.state.lock().await;
        if let Some(tag) = state.tags.get_mut(&self.family.normalize(name)) {
            tag.current = value;
        }
    }

    pub async fn current_value(&self, name: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .tags
            .get(&self.family.normalize(name))
            .map(|t| t.current.clone())
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Queue a batch-level error for an upcoming read. Connection-class
    /// errors also drop the simulated transport.
    pub async fn inject_read_error(&self, err: DriverError) {
        self.state.lock().await.read_faults.push_back(err);
    }

    pub fn keepalive_count(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn all_tags_calls(&self) -> usize {
        self.all_tags_probes.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Drop the simulated transport out from under the poll loop.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn next_value(tag: &mut SimTag) -> Value {
        if let Some(v) = tag.script.pop_front() {
            tag.current = v.clone();
            return v;
        }
        match tag.mode {
            SimMode::Hold => tag.current.clone(),
            SimMode::Counter(step) => {
                let next = match &tag.current {
                    Value::Int(i) => Value::Int(i + step),
                    Value::Uint(u) => Value::Uint(u.wrapping_add(step as u64)),
                    other => other.clone(),
                };
                tag.current = next.clone();
                next
            }
            SimMode::Toggle => {
                let next = match &tag.current {
                    Value::Bool(b) => Value::Bool(!b),
                    other => other.clone(),
                };
                tag.current = next.clone();
                next
            }
        }
    }
}

#[async_trait]
impl Driver for SimDriver {
    async fn connect(&self) -> DriverResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::Connect(format!(
                "simulated connect failure for {}",
                self.name
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_mode(&self) -> String {
        format!("sim ({})", self.family)
    }

    async fn device_info(&self) -> Option<DeviceInfo> {
        Some(DeviceInfo {
            vendor: "PLCGate".to_string(),
            product_name: "Simulated PLC".to_string(),
            serial: "SIM-0001".to_string(),
            revision: "1.0".to_string(),
        })
    }

    fn supports_discovery(&self) -> bool {
        true
    }

    async fn programs(&self) -> DriverResult<Vec<String>> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        Ok(self.programs.clone())
    }

    async fn all_tags(&self) -> DriverResult<Vec<TagInfo>> {
        self.all_tags_probes.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let state = self.state.lock().await;
        let mut tags: Vec<TagInfo> = state
            .tags
            .iter()
            .map(|(name, tag)| TagInfo {
                name: name.clone(),
                type_code: tag.tag_type as u16,
                tag_type: tag.tag_type,
                dimensions: vec![],
                readable: true,
                writable: tag.writable,
            })
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn read(&self, requests: &[TagReadRequest]) -> DriverResult<Vec<TagValue>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        if let Some(err) = state.read_faults.pop_front() {
            if matches!(err, DriverError::Connection(_) | DriverError::NotConnected) {
                self.connected.store(false, Ordering::SeqCst);
            }
            return Err(err);
        }
        let mut out = Vec::with_capacity(requests.len());
        for req in requests {
            let key = self.family.normalize(&req.name);
            match state.tags.get_mut(&key) {
                Some(tag) => {
                    let value = Self::next_value(tag);
                    let mut tv = TagValue::new(key.clone(), self.family, tag.tag_type, value);
                    tv.type_code = tag.tag_type as u16;
                    out.push(tv);
                }
                None => out.push(TagValue::error(
                    key.clone(),
                    self.family,
                    format!("tag {} not found", req.name),
                )),
            }
        }
        Ok(out)
    }

    async fn write(&self, name: &str, value: Value) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let key = self.family.normalize(name);
        match state.tags.get_mut(&key) {
            Some(tag) => {
                tag.current = value;
                tag.script.clear();
                Ok(())
            }
            None => Err(DriverError::TagNotFound(name.to_string())),
        }
    }

    async fn keepalive(&self) -> DriverResult<()> {
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_values_then_hold() {
        let sim = SimDriver::new("p", Family::Logix);
        sim.script_tag(
            "Counter",
            TagType::Dint,
            vec![Value::Int(10), Value::Int(10), Value::Int(20)],
            true,
        )
        .await;
        sim.connect().await.unwrap();
        let reqs = vec![TagReadRequest::new("Counter")];
        for expect in [10, 10, 20, 20] {
            let vals = sim.read(&reqs).await.unwrap();
            assert_eq!(vals[0].value, Value::Int(expect));
        }
    }

    #[tokio::test]
    async fn connection_error_drops_link() {
        let sim = SimDriver::new("p", Family::S7);
        sim.script_tag("DB1.0", TagType::Int, vec![Value::Int(1)], false)
            .await;
        sim.connect().await.unwrap();
        sim.inject_read_error(DriverError::Connection("reset by peer".into()))
            .await;
        let err = sim
            .read(&[TagReadRequest::new("DB1.0")])
            .await
            .expect_err("injected");
        assert!(sim.is_connection_error(&err));
        assert!(!sim.is_connected());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let sim = SimDriver::new("p", Family::Omron);
        sim.script_tag("d100.5", TagType::Int, vec![Value::Int(0)], true)
            .await;
        sim.connect().await.unwrap();
        sim.write("D100.5", Value::Int(42)).await.unwrap();
        let vals = sim.read(&[TagReadRequest::new("d100.5")]).await.unwrap();
        assert_eq!(vals[0].value, Value::Int(42));
        assert_eq!(vals[0].name, "D100.5");
    }
}
