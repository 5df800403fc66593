use crate::config::settings::PlcConfig;
use crate::drivers::traits::{DriverError, DriverResult, TagReadRequest};
use crate::drivers::DriverFactory;
use crate::plc::managed::{ConnectionStatus, ManagedPlc};
use crate::plc::worker::{spawn_worker, WorkerHandle};
use crate::tags::value::{HealthSnapshot, TagType, TagValue, Value, ValueChange};
use crate::write::executor::{WriteGateway, WriteValidation};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const STATS_INTERVAL: Duration = Duration::from_millis(500);
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const SHUTDOWN_WAIT: Duration = Duration::from_millis(500);
pub const MAX_CONN_RETRIES: u32 = 5;
const CHANGE_CHANNEL_CAP: usize = 100;

/// Fan-out consumer of aggregated change batches. Invoked from the single
/// flusher task in registration order; implementations must offload blocking
/// work to their own tasks.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_changes(&self, changes: &[ValueChange]);
}

type StatusCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub plcs_total: usize,
    pub plcs_connected: usize,
    pub tags_polled: usize,
    pub changes_found: u64,
}

/// Owns every managed PLC and its poll worker; runs the batch flusher, the
/// stats aggregator, and the reconnection watchdog.
pub struct PlcManager {
    factory: DriverFactory,
    plcs: RwLock<HashMap<String, Arc<RwLock<ManagedPlc>>>>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    reconnecting: StdMutex<HashSet<String>>,
    listeners: StdMutex<Vec<(u64, Arc<dyn ChangeListener>)>>,
    status_listeners: StdMutex<Vec<StatusCallback>>,
    next_listener: AtomicU64,
    change_tx: mpsc::Sender<Vec<ValueChange>>,
    change_rx: StdMutex<Option<mpsc::Receiver<Vec<ValueChange>>>>,
    status_dirty: AtomicBool,
    started: AtomicBool,
    stats: StdMutex<ManagerStats>,
    cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl PlcManager {
    pub fn new(factory: DriverFactory) -> Arc<Self> {
        let (change_tx, change_rx) = mpsc::channel(CHANGE_CHANNEL_CAP);
        Arc::new(PlcManager {
            factory,
            plcs: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            reconnecting: StdMutex::new(HashSet::new()),
            listeners: StdMutex::new(Vec::new()),
            status_listeners: StdMutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            change_tx,
            change_rx: StdMutex::new(Some(change_rx)),
            status_dirty: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stats: StdMutex::new(ManagerStats::default()),
            cancel: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Register a PLC. A malformed entry is rejected without affecting the
    /// others.
    pub async fn add_plc(&self, cfg: PlcConfig) -> Result<(), String> {
        cfg.validate()?;
        let name = cfg.name.clone();
        let mut plcs = self.plcs.write().await;
        if plcs.contains_key(&name) {
            return Err(format!("duplicate plc name {}", name));
        }
        plcs.insert(name, Arc::new(RwLock::new(ManagedPlc::new(cfg))));
        Ok(())
    }

    pub async fn plc(&self, name: &str) -> Option<Arc<RwLock<ManagedPlc>>> {
        self.plcs.read().await.get(name).cloned()
    }

    pub async fn plc_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plcs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Spawn the background loops and one poll worker per PLC.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = self
            .change_rx
            .lock()
            .expect("change_rx lock")
            .take()
            .expect("start called once");
        let mut loops = self.loops.lock().await;
        loops.push(tokio::spawn(Arc::clone(self).run_flusher(rx)));
        loops.push(tokio::spawn(Arc::clone(self).run_stats_aggregator()));
        loops.push(tokio::spawn(Arc::clone(self).run_watchdog()));
        drop(loops);

        let plcs = self.plcs.read().await.clone();
        let mut workers = self.workers.lock().await;
        for (name, plc) in plcs {
            let enabled = { plc.read().await.config.enabled };
            if !enabled {
                continue;
            }
            workers.insert(
                name.clone(),
                spawn_worker(Arc::clone(self), name, Arc::clone(&plc)),
            );
        }
        info!(workers = workers.len(), "plc manager started");
    }

    /// Cancel everything; wait at most 500 ms for workers and another 500 ms
    /// for the manager loops, then proceed regardless. A worker blocked in a
    /// protocol read is expendable on shutdown.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let workers: Vec<WorkerHandle> = {
            let mut map = self.workers.lock().await;
            map.drain().map(|(_, w)| w).collect()
        };
        let join_workers = futures::future::join_all(workers.into_iter().map(|w| w.handle));
        if timeout(SHUTDOWN_WAIT, join_workers).await.is_err() {
            warn!("workers did not stop within budget; abandoning");
        }
        let loops: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        if timeout(SHUTDOWN_WAIT, futures::future::join_all(loops))
            .await
            .is_err()
        {
            warn!("manager loops did not stop within budget; abandoning");
        }
        // Close any drivers still attached.
        let plcs = self.plcs.read().await.clone();
        for (_, plc) in plcs {
            let closed = {
                let mut p = plc.write().await;
                p.status = ConnectionStatus::Disconnected;
                p.driver.take()
            };
            if let Some(d) = closed {
                d.close().await;
            }
        }
    }

    // ----- listener registry -----

    pub fn on_changes(&self, listener: Arc<dyn ChangeListener>) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .expect("listeners lock")
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners
            .lock()
            .expect("listeners lock")
            .retain(|(lid, _)| *lid != id);
    }

    pub fn on_status_change(&self, cb: StatusCallback) {
        self.status_listeners
            .lock()
            .expect("status listeners lock")
            .push(cb);
    }

    pub fn mark_status_dirty(&self) {
        self.status_dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn emit_changes(&self, changes: Vec<ValueChange>) {
        if self.change_tx.send(changes).await.is_err() {
            debug!("change channel closed; dropping batch");
        }
    }

    // ----- background loops -----

    async fn run_flusher(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<ValueChange>>) {
        let mut pending: Vec<ValueChange> = Vec::new();
        let mut tick = interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(b) => pending.extend(b),
                    None => break,
                },
                _ = tick.tick() => {
                    if !pending.is_empty() {
                        let batch = std::mem::take(&mut pending);
                        let listeners: Vec<Arc<dyn ChangeListener>> = self
                            .listeners
                            .lock()
                            .expect("listeners lock")
                            .iter()
                            .map(|(_, l)| Arc::clone(l))
                            .collect();
                        for listener in listeners {
                            listener.on_changes(&batch).await;
                        }
                    }
                    if self.status_dirty.swap(false, Ordering::SeqCst) {
                        let callbacks: Vec<StatusCallback> = self
                            .status_listeners
                            .lock()
                            .expect("status listeners lock")
                            .clone();
                        for cb in callbacks {
                            cb();
                        }
                    }
                }
            }
        }
    }

    async fn run_stats_aggregator(self: Arc<Self>) {
        let mut tick = interval(STATS_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let plcs = self.plcs.read().await.clone();
            let mut snapshot = ManagerStats {
                plcs_total: plcs.len(),
                ..Default::default()
            };
            for (_, plc) in plcs {
                let p = plc.read().await;
                if p.online() {
                    snapshot.plcs_connected += 1;
                }
                snapshot.tags_polled += p.stats.tags_polled;
                snapshot.changes_found += p.stats.changes_found;
            }
            *self.stats.lock().expect("stats lock") = snapshot;
        }
    }

    async fn run_watchdog(self: Arc<Self>) {
        let mut tick = interval(WATCHDOG_INTERVAL);
        tick.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let plcs = self.plcs.read().await.clone();
            for (name, plc) in plcs {
                let (wants_reconnect, limited) = {
                    let p = plc.read().await;
                    (
                        p.config.enabled
                            && matches!(
                                p.status,
                                ConnectionStatus::Disconnected | ConnectionStatus::Error
                            ),
                        p.retry_limited,
                    )
                };
                if wants_reconnect && !limited {
                    self.schedule_reconnect(&name);
                }
            }
        }
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats.lock().expect("stats lock").clone()
    }

    // ----- connect / reconnect -----

    /// Connect one PLC. `manual` connects reset the retry counter and clear
    /// the retry limit before attempting.
    pub async fn connect_plc(self: &Arc<Self>, name: &str, manual: bool) -> DriverResult<()> {
        let plc = self
            .plc(name)
            .await
            .ok_or_else(|| DriverError::Protocol(format!("unknown plc {}", name)))?;
        let cfg = {
            let mut p = plc.write().await;
            if p.status == ConnectionStatus::Connected && p.driver.is_some() {
                if manual {
                    p.conn_retries = 0;
                    p.retry_limited = false;
                }
                return Ok(());
            }
            if manual {
                p.conn_retries = 0;
                p.retry_limited = false;
            }
            p.status = ConnectionStatus::Connecting;
            p.config.clone()
        };
        self.mark_status_dirty();

        let driver = match (self.factory)(&cfg) {
            Ok(d) => d,
            Err(e) => {
                self.record_connect_failure(&plc, &e).await;
                return Err(e);
            }
        };

        let connected = match timeout(CONNECT_TIMEOUT, driver.connect()).await {
            Err(_) => Err(DriverError::Timeout),
            Ok(r) => r,
        };
        if let Err(e) = connected {
            self.record_connect_failure(&plc, &e).await;
            return Err(e);
        }

        let device_info = driver.device_info().await;
        let cached = { !plc.read().await.discovered.is_empty() };
        let mut programs = None;
        let mut discovered = None;
        if driver.supports_discovery() {
            if !cached {
                match driver.programs().await {
                    Ok(p) => programs = Some(p),
                    Err(e) => warn!(plc = %name, error = %e, "program discovery failed"),
                }
                match driver.all_tags().await {
                    Ok(t) => discovered = Some(t),
                    Err(e) => warn!(plc = %name, error = %e, "tag discovery failed"),
                }
            }
        } else if !cached {
            discovered = Some({ plc.read().await.synthesized_tags() });
        }

        {
            let mut p = plc.write().await;
            p.device_info = device_info;
            if let Some(pr) = programs {
                p.programs = pr;
            }
            if let Some(tags) = discovered {
                if p.discovered.is_empty() {
                    p.discovered = tags;
                }
            }
            p.driver = Some(driver);
            p.status = ConnectionStatus::Connected;
            p.conn_retries = 0;
            p.retry_limited = false;
            p.last_error = None;
        }
        self.mark_status_dirty();
        info!(plc = %name, "connected");
        Ok(())
    }

    async fn record_connect_failure(&self, plc: &Arc<RwLock<ManagedPlc>>, err: &DriverError) {
        let mut p = plc.write().await;
        p.conn_retries += 1;
        p.last_error = Some(err.to_string());
        if p.conn_retries >= MAX_CONN_RETRIES {
            p.retry_limited = true;
            p.status = ConnectionStatus::Disconnected;
            warn!(plc = %p.config.name, retries = p.conn_retries, "retry limit reached; auto-reconnect stopped");
        } else {
            p.status = ConnectionStatus::Error;
        }
        drop(p);
        self.mark_status_dirty();
    }

    /// Fire an initial connect for every enabled PLC, concurrently.
    pub async fn connect_enabled(self: &Arc<Self>) {
        let plcs = self.plcs.read().await.clone();
        let mut tasks = Vec::new();
        for (name, plc) in plcs {
            if !plc.read().await.config.enabled {
                continue;
            }
            let mgr = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = mgr.connect_plc(&name, false).await {
                    warn!(plc = %name, error = %e, "initial connect failed");
                }
            }));
        }
        futures::future::join_all(tasks).await;
    }

    /// Schedule a reconnect after the fixed backoff. Entry into the
    /// `reconnecting` set is mutually exclusive per PLC; the three call sites
    /// (poll loop, watchdog, ad-hoc connection-error path) all come through
    /// here.
    pub fn schedule_reconnect(self: &Arc<Self>, name: &str) {
        {
            let mut set = self.reconnecting.lock().expect("reconnecting lock");
            if !set.insert(name.to_string()) {
                return;
            }
        }
        debug!(plc = %name, "reconnect scheduled");
        let mgr = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let cancelled = tokio::select! {
                _ = mgr.cancel.cancelled() => true,
                _ = sleep(RECONNECT_BACKOFF) => false,
            };
            if !cancelled {
                if let Some(plc) = mgr.plc(&name).await {
                    let eligible = {
                        let p = plc.read().await;
                        p.config.enabled
                            && !p.retry_limited
                            && p.status != ConnectionStatus::Connected
                    };
                    if eligible {
                        if let Err(e) = mgr.connect_plc(&name, false).await {
                            debug!(plc = %name, error = %e, "reconnect attempt failed");
                        }
                    }
                }
            }
            mgr.reconnecting
                .lock()
                .expect("reconnecting lock")
                .remove(&name);
        });
    }

    pub fn is_reconnect_scheduled(&self, name: &str) -> bool {
        self.reconnecting
            .lock()
            .expect("reconnecting lock")
            .contains(name)
    }

    async fn handle_connection_error(self: &Arc<Self>, name: &str, plc: &Arc<RwLock<ManagedPlc>>) {
        let closed = {
            let mut p = plc.write().await;
            p.status = ConnectionStatus::Disconnected;
            p.driver.take()
        };
        if let Some(d) = closed {
            d.close().await;
        }
        self.mark_status_dirty();
        let auto = {
            match self.plc(name).await {
                Some(p) => {
                    let p = p.read().await;
                    p.config.enabled && !p.retry_limited
                }
                None => false,
            }
        };
        if auto {
            self.schedule_reconnect(name);
        }
    }

    // ----- ad-hoc reads and writes -----

    pub async fn read_tag(self: &Arc<Self>, plc_name: &str, tag: &str) -> DriverResult<TagValue> {
        let plc = self
            .plc(plc_name)
            .await
            .ok_or_else(|| DriverError::Protocol(format!("unknown plc {}", plc_name)))?;
        let (driver, name, hint, ignore) = {
            let p = plc.read().await;
            let driver = p.driver.clone().ok_or(DriverError::NotConnected)?;
            let sel = p.selection(tag);
            let name = sel
                .map(|s| s.name.clone())
                .unwrap_or_else(|| p.config.family.normalize(tag));
            let hint = sel.and_then(|s| s.type_hint);
            let ignore = sel.map(|s| s.ignore_changes.clone()).unwrap_or_default();
            (driver, name, hint, ignore)
        };
        let requests = [TagReadRequest::with_hint(name.clone(), hint)];
        match driver.read(&requests).await {
            Ok(mut values) => {
                let mut tv = values.remove(0);
                if tv.error.is_none() {
                    tv.finalize_stable(&ignore);
                }
                plc.write().await.values.insert(tv.name.clone(), tv.clone());
                Ok(tv)
            }
            Err(e) => {
                if driver.is_connection_error(&e) || !driver.is_connected() {
                    self.handle_connection_error(plc_name, &plc).await;
                }
                Err(e)
            }
        }
    }

    pub async fn write_tag(
        self: &Arc<Self>,
        plc_name: &str,
        tag: &str,
        value: Value,
    ) -> DriverResult<()> {
        let plc = self
            .plc(plc_name)
            .await
            .ok_or_else(|| DriverError::Protocol(format!("unknown plc {}", plc_name)))?;
        let (driver, name) = {
            let p = plc.read().await;
            let driver = p.driver.clone().ok_or(DriverError::NotConnected)?;
            let name = p
                .selection(tag)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| p.config.family.normalize(tag));
            (driver, name)
        };
        match driver.write(&name, value).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if driver.is_connection_error(&e) || !driver.is_connected() {
                    self.handle_connection_error(plc_name, &plc).await;
                }
                Err(e)
            }
        }
    }

    /// Native type of a tag: the cached value if present, else a single-tag
    /// read. The hook transport publishers use for write coercion.
    pub async fn tag_type(self: &Arc<Self>, plc_name: &str, tag: &str) -> Option<TagType> {
        let plc = self.plc(plc_name).await?;
        {
            let p = plc.read().await;
            let canonical = p.config.family.normalize(tag);
            let key = p
                .selection(tag)
                .map(|s| s.name.clone())
                .unwrap_or(canonical);
            if let Some(tv) = p.values.get(&key) {
                if tv.error.is_none() {
                    return Some(tv.tag_type);
                }
            }
        }
        self.read_tag(plc_name, tag).await.ok().map(|tv| tv.tag_type)
    }

    // ----- health -----

    pub async fn health(&self, name: &str) -> Option<HealthSnapshot> {
        let plc = self.plc(name).await?;
        let p = plc.read().await;
        Some(HealthSnapshot {
            plc: p.config.name.clone(),
            driver: p.driver_label(),
            online: p.online(),
            status: p.status.to_string(),
            error: p.last_error.clone(),
            timestamp: crate::publish::now_rfc3339(),
        })
    }

    pub async fn health_all(&self) -> Vec<HealthSnapshot> {
        let mut out = Vec::new();
        for name in self.plc_names().await {
            if let Some(h) = self.health(&name).await {
                out.push(h);
            }
        }
        out
    }
}

/// The write-side view of the manager handed to transports, keeping the
/// Manager↔Publisher graph one-way.
pub struct ManagerGateway(pub Arc<PlcManager>);

#[async_trait]
impl WriteGateway for ManagerGateway {
    async fn validate(&self, plc: &str, tag: &str) -> WriteValidation {
        let Some(managed) = self.0.plc(plc).await else {
            return WriteValidation::UnknownPlc;
        };
        let p = managed.read().await;
        let Some(sel) = p.selection(tag) else {
            return WriteValidation::UnknownTag;
        };
        if !sel.writable {
            return WriteValidation::NotWritable;
        }
        if !p.online() {
            return WriteValidation::Disconnected;
        }
        WriteValidation::Ok
    }

    async fn tag_type(&self, plc: &str, tag: &str) -> Option<TagType> {
        self.0.tag_type(plc, tag).await
    }

    async fn execute_write(&self, plc: &str, tag: &str, value: Value) -> DriverResult<()> {
        self.0.write_tag(plc, tag, value).await
    }
}
