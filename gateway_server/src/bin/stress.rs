//! Soak the connection-and-poll engine against simulated PLCs and verify the
//! core guarantees hold under load. Exits 0 when every check passes, 1
//! otherwise.

use async_trait::async_trait;
use plcgate::config::settings::{PlcConfig, TagSelectionConfig};
use plcgate::drivers;
use plcgate::plc::manager::{ChangeListener, PlcManager};
use plcgate::tags::value::{Value, ValueChange};
use plcgate::tags::Family;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PLCS: usize = 5;
const TAGS_PER_PLC: usize = 20;
const RUN_FOR: Duration = Duration::from_secs(3);

struct Recorder {
    changes: Mutex<Vec<ValueChange>>,
}

#[async_trait]
impl ChangeListener for Recorder {
    async fn on_changes(&self, changes: &[ValueChange]) {
        self.changes
            .lock()
            .expect("recorder lock")
            .extend_from_slice(changes);
    }
}

fn plc_config(index: usize) -> PlcConfig {
    let tags = (0..TAGS_PER_PLC)
        .map(|t| TagSelectionConfig {
            name: format!("Tag{:03}", t),
            alias: None,
            data_type: Some("DINT".to_string()),
            enabled: true,
            writable: t % 4 == 0,
            ignore_changes: vec![],
            no_rest: false,
            no_mqtt: false,
            no_kafka: false,
            no_valkey: false,
        })
        .collect();
    PlcConfig {
        name: format!("sim{:02}", index),
        address: String::new(),
        family: Family::Sim,
        slot: None,
        unit: None,
        poll_rate: Some(250),
        enabled: true,
        tags,
    }
}

#[tokio::main]
async fn main() {
    plcgate::logging::init_logging();
    let mut failures: Vec<String> = Vec::new();

    let manager = PlcManager::new(drivers::default_factory());
    for i in 0..PLCS {
        manager
            .add_plc(plc_config(i))
            .await
            .expect("valid stress config");
    }
    let recorder = Arc::new(Recorder {
        changes: Mutex::new(Vec::new()),
    });
    manager.on_changes(Arc::clone(&recorder) as _);

    manager.start().await;
    manager.connect_enabled().await;
    tokio::time::sleep(RUN_FOR).await;

    // every PLC connected, and driver presence matches status
    for name in manager.plc_names().await {
        let plc = manager.plc(&name).await.expect("plc exists");
        let p = plc.read().await;
        if !p.online() {
            failures.push(format!("{} not connected (status {})", name, p.status));
        }
        if p.online() != p.driver.is_some() {
            failures.push(format!("{}: driver presence does not match status", name));
        }
        if p.stats.tags_polled != TAGS_PER_PLC {
            failures.push(format!(
                "{}: polled {} tags, expected {}",
                name, p.stats.tags_polled, TAGS_PER_PLC
            ));
        }
    }

    manager.stop().await;

    let changes = recorder.changes.lock().expect("recorder lock").clone();
    if changes.is_empty() {
        failures.push("no value changes observed".to_string());
    }

    // sim counters increment monotonically; per (plc, tag) the observed
    // sequence must be strictly increasing and in emit order
    let mut last_seen: HashMap<(String, String), i64> = HashMap::new();
    for change in &changes {
        let Value::Int(v) = change.value.clone() else {
            failures.push(format!("unexpected value shape for {}", change.tag));
            break;
        };
        let key = (change.plc.clone(), change.tag.clone());
        if let Some(prev) = last_seen.get(&key) {
            if v <= *prev {
                failures.push(format!(
                    "{}.{}: value {} observed after {} (order broken)",
                    change.plc, change.tag, v, prev
                ));
                break;
            }
        }
        last_seen.insert(key, v);
    }

    let expected_pairs = PLCS * TAGS_PER_PLC;
    if last_seen.len() != expected_pairs {
        failures.push(format!(
            "saw changes for {} tag pairs, expected {}",
            last_seen.len(),
            expected_pairs
        ));
    }

    println!(
        "stress: {} changes across {} tag pairs in {:?}",
        changes.len(),
        last_seen.len(),
        RUN_FOR
    );
    if failures.is_empty() {
        println!("stress: PASS");
        std::process::exit(0);
    }
    for failure in &failures {
        eprintln!("stress: FAIL: {}", failure);
    }
    std::process::exit(1);
}
