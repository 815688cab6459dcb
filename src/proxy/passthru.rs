//! Passthrough scripted process.
//!
//! Represents an entire driving process as a synthetic one: owns the
//! tid-to-thread-proxy roster, relays memory access and loaded-image
//! queries to the driving process. Handles to driving state are
//! non-owning; a handle that outlives its process surfaces as
//! `InvalidReference`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::config::{thread_config, ScriptedConfig};
use crate::error::{Result, ScriptedError};
use crate::host::process::DrivingProcess;
use crate::host::types::{MemoryRegion, ProcessState};
use crate::host::{ExecutionContext, HostError, Target};
use crate::proxy::thread::{ThreadProxy, ThreadProxyKind};
use crate::proxy::types::{LoadedImage, MemoryData, StateCell, ThreadInfo};
use crate::proxy::ScriptedProcess;

/// Sentinel process id of passthrough processes. Overridable through the
/// `pid` config key; multiple simultaneous proxies need distinct ids.
pub const PASSTHRU_PID: u64 = 42;

struct PassthruInner {
    ctx: ExecutionContext,
    pid: u64,
    driving_target_idx: Option<usize>,
    driving_target: Option<Weak<Target>>,
    driving_process: Mutex<Option<Weak<DrivingProcess>>>,
    threads: Mutex<BTreeMap<u64, ThreadProxy>>,
    loaded_images: Mutex<Vec<LoadedImage>>,
    state: StateCell,
}

/// Scripted process that forwards all operations to one driving process.
/// Cheap to clone; clones share the same roster and state.
#[derive(Clone)]
pub struct PassthruProcess {
    inner: Arc<PassthruInner>,
}

impl PassthruProcess {
    /// Resolve the driving target named by `driving_target_idx` and, unless
    /// the driving process is not launched yet, snapshot its thread roster
    /// and loaded modules.
    pub fn new(ctx: ExecutionContext, config: &ScriptedConfig, launched: bool) -> Self {
        let driving_target_idx = config.driving_target_idx();
        let driving_target = driving_target_idx
            .and_then(|idx| ctx.debugger.target_at_index(idx))
            .map(|target| Arc::downgrade(&target));

        let process = Self {
            inner: Arc::new(PassthruInner {
                ctx,
                pid: config.pid().unwrap_or(PASSTHRU_PID),
                driving_target_idx,
                driving_target,
                driving_process: Mutex::new(None),
                threads: Mutex::new(BTreeMap::new()),
                loaded_images: Mutex::new(Vec::new()),
                state: StateCell::new(ProcessState::Invalid),
            }),
        };

        if launched {
            if let Ok(target) = process.driving_target() {
                if let Some(driving) = target.process() {
                    process.set_driving_process(&driving);
                    process.refresh_threads(ThreadProxyKind::Passthru);
                    process.snapshot_loaded_images();
                }
            }
        }

        process
    }

    pub fn ctx(&self) -> &ExecutionContext {
        &self.inner.ctx
    }

    pub fn driving_target_idx(&self) -> Option<usize> {
        self.inner.driving_target_idx
    }

    /// The driving target, if the config named a resolvable one
    pub fn driving_target(&self) -> Result<Arc<Target>> {
        let weak = self
            .inner
            .driving_target
            .as_ref()
            .ok_or(ScriptedError::InvalidDrivingTarget {
                component: "PassthruProcess",
                operation: "driving_target",
            })?;
        weak.upgrade().ok_or(ScriptedError::InvalidReference {
            what: "driving target",
        })
    }

    /// The driving process, once launched
    pub fn driving_process(&self) -> Result<Arc<DrivingProcess>> {
        let guard = self.inner.driving_process.lock().unwrap();
        let weak = guard.as_ref().ok_or(HostError::NoProcess)?;
        weak.upgrade().ok_or(ScriptedError::InvalidReference {
            what: "driving process",
        })
    }

    pub fn has_driving_process(&self) -> bool {
        self.driving_process().is_ok()
    }

    pub fn set_driving_process(&self, process: &Arc<DrivingProcess>) {
        *self.inner.driving_process.lock().unwrap() = Some(Arc::downgrade(process));
    }

    /// Clear-then-repopulate the roster from the driving process's current
    /// threads. No incremental diffing; stale records are dropped.
    pub fn refresh_threads(&self, kind: ThreadProxyKind) {
        let Ok(driving) = self.driving_process() else {
            return;
        };
        let Some(target_idx) = self.inner.driving_target_idx else {
            return;
        };

        let mut roster = BTreeMap::new();
        for thread in driving.threads() {
            let config = thread_config(target_idx, thread.index_id());
            let proxy = ThreadProxy::new(&self.inner.ctx, &config, kind);
            match proxy.thread_id() {
                Ok(tid) => {
                    roster.insert(tid, proxy);
                }
                Err(_) => log::warn!(
                    "dropping unresolved thread proxy for index {}",
                    thread.index_id()
                ),
            }
        }
        log::debug!("refreshed roster: {} threads", roster.len());
        *self.inner.threads.lock().unwrap() = roster;
    }

    /// Retag every roster entry, e.g. when a passthrough roster is adopted
    /// by a demultiplexed process.
    pub fn set_thread_kind(&self, kind: ThreadProxyKind) {
        for proxy in self.inner.threads.lock().unwrap().values_mut() {
            proxy.set_kind(kind);
        }
    }

    pub(crate) fn snapshot_loaded_images(&self) {
        let Ok(target) = self.driving_target() else {
            return;
        };
        let images = target
            .modules()
            .iter()
            .map(|module| LoadedImage {
                path: module.path.clone(),
                load_addr: module.load_addr,
            })
            .collect();
        *self.inner.loaded_images.lock().unwrap() = images;
    }

    pub fn subscribe_state(&self) -> std::sync::mpsc::Receiver<ProcessState> {
        self.inner.state.subscribe()
    }
}

impl ScriptedProcess for PassthruProcess {
    fn process_id(&self) -> u64 {
        self.inner.pid
    }

    fn state(&self) -> ProcessState {
        self.inner.state.get()
    }

    fn force_state(&self, state: ProcessState) {
        self.inner.state.force(state);
    }

    fn launch(&self) -> Result<()> {
        // The driving process is launched by the host, not by the proxy
        Ok(())
    }

    fn resume(&self, _should_stop: bool) -> Result<()> {
        self.driving_process()?.continue_execution()?;
        Ok(())
    }

    fn threads_info(&self) -> BTreeMap<u64, ThreadInfo> {
        self.inner
            .threads
            .lock()
            .unwrap()
            .values()
            .filter_map(|proxy| proxy.info())
            .map(|info| (info.thread_id, info))
            .collect()
    }

    fn read_memory_at_address(&self, addr: u64, size: usize) -> Result<MemoryData> {
        let driving = self.driving_process()?;
        let bytes = driving.read_memory(addr, size)?;
        let target = self.driving_target()?;
        Ok(MemoryData {
            bytes,
            byte_order: target.byte_order(),
            address_byte_size: target.address_byte_size(),
        })
    }

    fn write_memory_at_address(&self, addr: u64, data: &[u8]) -> Result<usize> {
        Ok(self.driving_process()?.write_memory(addr, data)?)
    }

    fn memory_region_containing_address(&self, addr: u64) -> Option<MemoryRegion> {
        // Intentionally collapses any failure into "no region"
        self.driving_process()
            .ok()?
            .memory_region_info(addr)
            .ok()
    }

    fn loaded_images(&self) -> Vec<LoadedImage> {
        self.inner.loaded_images.lock().unwrap().clone()
    }

    fn is_alive(&self) -> bool {
        // Passthrough never tracks the driving process's true liveness
        true
    }
}
