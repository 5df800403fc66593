mod test_utils;

use plcgate::drivers::sim::SimDriver;
use plcgate::drivers::traits::{Driver, DriverError};
use plcgate::plc::managed::ConnectionStatus;
use plcgate::tags::value::{TagType, Value};
use plcgate::tags::Family;
use std::sync::Arc;
use std::time::Duration;
use test_utils::*;

/// Scenario: two PLCs, one tag each. pA.Counter reads 10, 10, 20; pB.DB1.0
/// (alias temp) reads 25 on every poll. The listener must see pA's initial
/// value and the 10→20 edge, and nothing for pB beyond its initial value.
#[tokio::test]
async fn change_propagation_across_two_plcs() {
    let p_a = Arc::new(SimDriver::new("pA", Family::Logix));
    p_a.script_tag(
        "Counter",
        TagType::Dint,
        vec![Value::Int(10), Value::Int(10), Value::Int(20)],
        false,
    )
    .await;
    let p_b = Arc::new(SimDriver::new("pB", Family::S7));
    p_b.script_tag(
        "DB1.0",
        TagType::Int,
        vec![Value::Int(25), Value::Int(25), Value::Int(25)],
        false,
    )
    .await;

    let (manager, _drivers) = manager_with_drivers(vec![
        ("pA".to_string(), Arc::clone(&p_a)),
        ("pB".to_string(), Arc::clone(&p_b)),
    ]);
    let mut tag_b = selection("db1.0", "INT", false);
    tag_b.alias = Some("temp".to_string());
    manager
        .add_plc(plc_config(
            "pA",
            Family::Logix,
            vec![selection("Counter", "DINT", false)],
        ))
        .await
        .unwrap();
    manager
        .add_plc(plc_config("pB", Family::S7, vec![tag_b]))
        .await
        .unwrap();

    let listener = RecordingListener::new();
    manager.on_changes(Arc::clone(&listener) as _);

    manager.start().await;
    manager.connect_enabled().await;

    // three polls at 250 ms plus flusher latency
    assert!(
        wait_for(
            || listener.changes_for("pA", "Counter").len() >= 2,
            Duration::from_secs(3)
        )
        .await,
        "expected two changes for pA.Counter, saw {:?}",
        listener.changes()
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.stop().await;

    let a_changes = listener.changes_for("pA", "Counter");
    let a_values: Vec<&Value> = a_changes.iter().map(|c| &c.value).collect();
    assert_eq!(a_values, vec![&Value::Int(10), &Value::Int(20)]);

    let b_changes = listener.changes_for("pB", "DB1.0");
    assert_eq!(b_changes.len(), 1, "pB must only report its initial value");
    assert_eq!(b_changes[0].value, Value::Int(25));
    assert_eq!(b_changes[0].alias, "temp");
    assert_eq!(b_changes[0].address, "DB1.0");
}

/// Scenario: a discovery-capable PLC loses its link mid-poll. After the
/// scheduled reconnect the cached tag inventory is reused; all_tags is not
/// called a second time.
#[tokio::test]
async fn reconnect_reuses_cached_discovery() {
    let driver = Arc::new(SimDriver::new("pL", Family::Logix));
    driver
        .script_tag("T1", TagType::Dint, vec![Value::Int(1)], false)
        .await;
    driver
        .script_tag("T2", TagType::Dint, vec![Value::Int(2)], false)
        .await;
    driver
        .script_tag("T3", TagType::Dint, vec![Value::Int(3)], false)
        .await;

    let (manager, _) = manager_with_drivers(vec![("pL".to_string(), Arc::clone(&driver))]);
    manager
        .add_plc(plc_config(
            "pL",
            Family::Logix,
            vec![
                selection("T1", "DINT", false),
                selection("T2", "DINT", false),
                selection("T3", "DINT", false),
            ],
        ))
        .await
        .unwrap();

    manager.start().await;
    manager.connect_enabled().await;
    {
        let plc = manager.plc("pL").await.unwrap();
        assert!(wait_for(
            || driver.read_count() >= 1,
            Duration::from_secs(2)
        )
        .await);
        let p = plc.read().await;
        assert_eq!(p.status, ConnectionStatus::Connected);
        assert_eq!(p.discovered.len(), 3);
    }
    assert_eq!(driver.all_tags_calls(), 1);
    let connects_before = driver.connect_count();

    driver
        .inject_read_error(DriverError::Connection("link down".into()))
        .await;

    // worker notices, schedules the 2 s reconnect, reconnects
    assert!(
        wait_for(
            || driver.connect_count() > connects_before && driver.is_connected(),
            Duration::from_secs(5)
        )
        .await,
        "reconnect did not happen"
    );
    // let the manager finish the connect bookkeeping
    tokio::time::sleep(Duration::from_millis(200)).await;

    let plc = manager.plc("pL").await.unwrap();
    let p = plc.read().await;
    assert_eq!(p.discovered.len(), 3, "cached tags preserved");
    drop(p);
    assert_eq!(
        driver.all_tags_calls(),
        1,
        "all_tags must not run again on reconnect"
    );
    manager.stop().await;
}

/// Five consecutive connect failures trip the retry limit; a manual connect
/// resets it.
#[tokio::test]
async fn retry_counter_and_limit() {
    let driver = Arc::new(SimDriver::new("p", Family::Logix));
    driver
        .script_tag("T", TagType::Dint, vec![Value::Int(1)], false)
        .await;
    driver.fail_next_connects(5);

    let (manager, _) = manager_with_drivers(vec![("p".to_string(), Arc::clone(&driver))]);
    manager
        .add_plc(plc_config(
            "p",
            Family::Logix,
            vec![selection("T", "DINT", false)],
        ))
        .await
        .unwrap();

    for attempt in 1..=5u32 {
        let result = manager.connect_plc("p", false).await;
        assert!(result.is_err());
        let plc = manager.plc("p").await.unwrap();
        let p = plc.read().await;
        assert_eq!(p.conn_retries, attempt);
        assert!(p.driver.is_none());
        if attempt < 5 {
            assert_eq!(p.status, ConnectionStatus::Error);
            assert!(!p.retry_limited);
        } else {
            assert_eq!(p.status, ConnectionStatus::Disconnected);
            assert!(p.retry_limited, "fifth failure must set the retry limit");
        }
    }

    // manual connect clears the limit and succeeds
    manager.connect_plc("p", true).await.unwrap();
    let plc = manager.plc("p").await.unwrap();
    let p = plc.read().await;
    assert_eq!(p.status, ConnectionStatus::Connected);
    assert_eq!(p.conn_retries, 0);
    assert!(!p.retry_limited);
    assert!(p.driver.is_some());
}

/// An empty enabled-tag list keeps the session warm with keepalives and
/// never invokes a listener.
#[tokio::test]
async fn empty_tag_list_issues_keepalives() {
    let driver = Arc::new(SimDriver::new("p", Family::Omron));
    let (manager, _) = manager_with_drivers(vec![("p".to_string(), Arc::clone(&driver))]);
    manager
        .add_plc(plc_config("p", Family::Omron, vec![]))
        .await
        .unwrap();
    let listener = RecordingListener::new();
    manager.on_changes(Arc::clone(&listener) as _);

    manager.start().await;
    manager.connect_enabled().await;
    assert!(wait_for(|| driver.keepalive_count() >= 2, Duration::from_secs(2)).await);
    manager.stop().await;

    assert_eq!(driver.read_count(), 0);
    assert!(listener.changes().is_empty());
}

/// Per-tag read errors leave the batch intact and the connection up.
#[tokio::test]
async fn per_tag_error_does_not_break_the_batch() {
    let driver = Arc::new(SimDriver::new("p", Family::Logix));
    driver
        .script_tag("Good", TagType::Dint, vec![Value::Int(5)], false)
        .await;
    // "Missing" is configured but never defined on the device

    let (manager, _) = manager_with_drivers(vec![("p".to_string(), Arc::clone(&driver))]);
    manager
        .add_plc(plc_config(
            "p",
            Family::Logix,
            vec![
                selection("Good", "DINT", false),
                selection("Missing", "DINT", false),
            ],
        ))
        .await
        .unwrap();
    let listener = RecordingListener::new();
    manager.on_changes(Arc::clone(&listener) as _);

    manager.start().await;
    manager.connect_enabled().await;
    assert!(wait_for(
        || !listener.changes_for("p", "Good").is_empty(),
        Duration::from_secs(2)
    )
    .await);
    manager.stop().await;

    assert!(driver.is_connected());
    assert!(listener.changes_for("p", "Missing").is_empty());
    let plc = manager.plc("p").await.unwrap();
    let p = plc.read().await;
    assert_eq!(p.status, ConnectionStatus::Connected);
    let missing = p.values.get("Missing").expect("per-tag error recorded");
    assert!(missing.error.is_some());
}

/// Per-PLC ordering: the listener sees each PLC's changes in poll order.
#[tokio::test]
async fn change_order_is_poll_order_per_plc() {
    let driver = Arc::new(SimDriver::new("p", Family::Logix));
    driver
        .script_tag(
            "Seq",
            TagType::Dint,
            (1..=6).map(Value::Int).collect(),
            false,
        )
        .await;

    let (manager, _) = manager_with_drivers(vec![("p".to_string(), Arc::clone(&driver))]);
    manager
        .add_plc(plc_config(
            "p",
            Family::Logix,
            vec![selection("Seq", "DINT", false)],
        ))
        .await
        .unwrap();
    let listener = RecordingListener::new();
    manager.on_changes(Arc::clone(&listener) as _);

    manager.start().await;
    manager.connect_enabled().await;
    assert!(wait_for(
        || listener.changes_for("p", "Seq").len() >= 6,
        Duration::from_secs(4)
    )
    .await);
    manager.stop().await;

    let observed: Vec<i64> = listener
        .changes_for("p", "Seq")
        .iter()
        .map(|c| match c.value {
            Value::Int(i) => i,
            _ => panic!("unexpected value shape"),
        })
        .collect();
    assert_eq!(observed[..6], [1, 2, 3, 4, 5, 6]);
}
