use crate::plc::managed::{ConnectionStatus, ManagedPlc, PollStats};
use crate::plc::manager::PlcManager;
use crate::tags::value::ValueChange;
use crate::drivers::traits::TagReadRequest;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to one PLC's poll task.
pub struct WorkerHandle {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

pub(crate) fn spawn_worker(
    manager: Arc<PlcManager>,
    name: String,
    plc: Arc<RwLock<ManagedPlc>>,
) -> WorkerHandle {
    let cancel = manager.cancel_token().child_token();
    let loop_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        let every = { plc.read().await.poll_interval() };
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(plc = %name, interval_ms = every.as_millis() as u64, "poll worker started");
        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            poll_once(&manager, &name, &plc).await;
        }
        debug!(plc = %name, "poll worker stopped");
    });
    WorkerHandle { cancel, handle }
}

/// One poll tick. Snapshot under the read lock, I/O without any PLC lock
/// held, state mutation under the write lock.
pub(crate) async fn poll_once(
    manager: &Arc<PlcManager>,
    name: &str,
    plc: &Arc<RwLock<ManagedPlc>>,
) {
    let (driver, status, selections, family, auto_connect) = {
        let p = plc.read().await;
        (
            p.driver.clone(),
            p.status,
            p.selections.clone(),
            p.config.family,
            p.config.enabled && !p.retry_limited,
        )
    };

    let alive = status == ConnectionStatus::Connected
        && driver.as_ref().map(|d| d.is_connected()).unwrap_or(false);
    if !alive {
        let closed = {
            let mut p = plc.write().await;
            let was = p.status;
            p.status = ConnectionStatus::Disconnected;
            p.stats = PollStats::default();
            let d = p.driver.take();
            if was != ConnectionStatus::Disconnected || d.is_some() {
                manager.mark_status_dirty();
            }
            d
        };
        if let Some(d) = closed {
            d.close().await;
        }
        if auto_connect {
            manager.schedule_reconnect(name);
        }
        return;
    }
    let driver = driver.expect("alive implies driver");

    if selections.is_empty() {
        if let Err(e) = driver.keepalive().await {
            debug!(plc = %name, error = %e, "keepalive failed");
        }
        plc.write().await.stats = PollStats::default();
        return;
    }

    let requests: Vec<TagReadRequest> = selections
        .iter()
        .map(|s| TagReadRequest::with_hint(s.name.clone(), s.type_hint))
        .collect();

    match driver.read(&requests).await {
        Err(err) => {
            let conn_dead = driver.is_connection_error(&err) || !driver.is_connected();
            warn!(plc = %name, error = %err, connection_dead = conn_dead, "poll read failed");
            let closed = {
                let mut p = plc.write().await;
                p.last_error = Some(err.to_string());
                p.stats.last_error = Some(err.to_string());
                p.status = if conn_dead {
                    ConnectionStatus::Disconnected
                } else {
                    ConnectionStatus::Error
                };
                p.driver.take()
            };
            if let Some(d) = closed {
                d.close().await;
            }
            manager.mark_status_dirty();
            if conn_dead && auto_connect {
                manager.schedule_reconnect(name);
            }
        }
        Ok(mut values) => {
            for (tv, sel) in values.iter_mut().zip(&selections) {
                if tv.error.is_none() {
                    tv.finalize_stable(&sel.ignore_changes);
                }
            }
            let mut changes: Vec<ValueChange> = Vec::new();
            {
                let mut p = plc.write().await;
                for (tv, sel) in values.iter().zip(&selections) {
                    if tv.error.is_none() && tv.changed_from(p.values.get(&tv.name)) {
                        changes.push(ValueChange {
                            plc: name.to_string(),
                            tag: sel.name.clone(),
                            alias: sel.alias.clone(),
                            address: family.display_address(&sel.name),
                            type_name: tv.tag_type.name().to_string(),
                            value: tv.value.clone(),
                            writable: sel.writable,
                            family,
                            no_rest: sel.no_rest,
                            no_mqtt: sel.no_mqtt,
                            no_kafka: sel.no_kafka,
                            no_valkey: sel.no_valkey,
                        });
                    }
                    p.values.insert(tv.name.clone(), tv.clone());
                }
                p.last_poll = Some(chrono::Utc::now());
                p.stats.tags_polled = selections.len();
                p.stats.changes_found += changes.len() as u64;
                p.stats.last_error = None;
            }
            if !changes.is_empty() {
                manager.emit_changes(changes).await;
            }
        }
    }
}
