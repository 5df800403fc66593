//! Shared fixtures for the integration tests: scripted sim drivers wired
//! into a manager, recording listeners, and a recording transport sink.
#![allow(dead_code)]

use async_trait::async_trait;
use plcgate::config::settings::{PlcConfig, TagSelectionConfig};
use plcgate::drivers::sim::SimDriver;
use plcgate::drivers::traits::Driver;
use plcgate::drivers::DriverFactory;
use plcgate::plc::manager::{ChangeListener, PlcManager};
use plcgate::publish::{OutMessage, PublishError, TransportSink};
use plcgate::tags::value::ValueChange;
use plcgate::tags::Family;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

pub fn selection(name: &str, data_type: &str, writable: bool) -> TagSelectionConfig {
    TagSelectionConfig {
        name: name.to_string(),
        alias: None,
        data_type: Some(data_type.to_string()),
        enabled: true,
        writable,
        ignore_changes: vec![],
        no_rest: false,
        no_mqtt: false,
        no_kafka: false,
        no_valkey: false,
    }
}

pub fn plc_config(name: &str, family: Family, tags: Vec<TagSelectionConfig>) -> PlcConfig {
    PlcConfig {
        name: name.to_string(),
        address: "10.0.0.1".to_string(),
        family,
        slot: None,
        unit: None,
        poll_rate: Some(250),
        enabled: true,
        tags,
    }
}

/// A manager whose factory hands out pre-built sim drivers, so tests keep a
/// handle on each PLC's driver for scripting and fault injection.
pub fn manager_with_drivers(
    drivers: Vec<(String, Arc<SimDriver>)>,
) -> (Arc<PlcManager>, HashMap<String, Arc<SimDriver>>) {
    let by_name: HashMap<String, Arc<SimDriver>> = drivers.into_iter().collect();
    let lookup = by_name.clone();
    let factory: DriverFactory = Arc::new(move |cfg: &PlcConfig| {
        let driver = lookup
            .get(&cfg.name)
            .cloned()
            .unwrap_or_else(|| Arc::new(SimDriver::from_config(cfg)));
        Ok(driver as Arc<dyn Driver>)
    });
    (PlcManager::new(factory), by_name)
}

/// Collects every batch a listener sees, preserving batch boundaries.
pub struct RecordingListener {
    batches: Mutex<Vec<Vec<ValueChange>>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingListener {
            batches: Mutex::new(Vec::new()),
        })
    }

    pub fn batches(&self) -> Vec<Vec<ValueChange>> {
        self.batches.lock().expect("batches lock").clone()
    }

    pub fn changes(&self) -> Vec<ValueChange> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn changes_for(&self, plc: &str, tag: &str) -> Vec<ValueChange> {
        self.changes()
            .into_iter()
            .filter(|c| c.plc == plc && c.tag == tag)
            .collect()
    }
}

#[async_trait]
impl ChangeListener for RecordingListener {
    async fn on_changes(&self, changes: &[ValueChange]) {
        self.batches
            .lock()
            .expect("batches lock")
            .push(changes.to_vec());
    }
}

/// A transport sink that records delivered batches and can be told to fail
/// or stall.
pub struct RecordingSink {
    delivered: Mutex<Vec<OutMessage>>,
    fail_next: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingSink {
            delivered: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            delay: Mutex::new(None),
        })
    }

    pub fn delivered(&self) -> Vec<OutMessage> {
        self.delivered.lock().expect("delivered lock").clone()
    }

    pub fn delivered_paths(&self) -> Vec<String> {
        self.delivered().into_iter().map(|m| m.path).collect()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().expect("delay lock") = delay;
    }
}

#[async_trait]
impl TransportSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn connect(&self) -> Result<(), PublishError> {
        Ok(())
    }

    async fn deliver(&self, batch: &[OutMessage]) -> Result<(), PublishError> {
        let delay = { *self.delay.lock().expect("delay lock") };
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PublishError::Deliver("injected failure".to_string()));
        }
        self.delivered
            .lock()
            .expect("delivered lock")
            .extend_from_slice(batch);
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}
