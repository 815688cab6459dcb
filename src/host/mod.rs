//! Host capability surface - target registry and process control.
//!
//! This module stands in for the host debugger the scripted layer rides on
//! top of. It provides exactly the primitives the proxies consume: a target
//! registry resolvable by index, process launch/continue with an attached
//! listener, memory and thread introspection, and the event system. The
//! processes it hands out are simulated, which keeps the multiplexing layer
//! runnable and testable without an OS debug API.

pub mod event;
pub mod process;
pub mod types;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use event::ListenerHandle;
use process::DrivingProcess;
use types::{ByteOrder, MemoryProtection, MemoryRegion, ModuleInfo};

/// Errors produced by host primitives
#[derive(Error, Debug)]
pub enum HostError {
    #[error("no target at index {index}")]
    NoTargetAtIndex { index: usize },

    #[error("target has no process")]
    NoProcess,

    #[error("launch failed: {reason}")]
    LaunchFailed { reason: String },

    #[error("process {pid} is not stopped")]
    NotStopped { pid: u64 },

    #[error("failed to read {size} bytes at {address:#x}: {reason}")]
    ReadFailed {
        address: u64,
        size: usize,
        reason: String,
    },

    #[error("failed to write memory at {address:#x}: {reason}")]
    WriteFailed { address: u64, reason: String },

    #[error("no memory region contains {address:#x}")]
    NoRegion { address: u64 },

    #[error("no thread with index id {index}")]
    NoThread { index: u32 },
}

/// Launch parameters for a driving process
#[derive(Default)]
pub struct LaunchInfo {
    listener: Option<ListenerHandle>,
    stop_at_entry: bool,
}

impl LaunchInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener that will receive the process's events
    pub fn with_listener(mut self, listener: ListenerHandle) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Stop the process at its entry point so the launch stop event gets
    /// broadcast to the attached listener.
    pub fn stop_at_entry(mut self, stop: bool) -> Self {
        self.stop_at_entry = stop;
        self
    }
}

/// Simulated process layout attached to a target: which threads exist and
/// what memory the process maps.
#[derive(Clone)]
pub struct SimSpec {
    pub thread_ids: Vec<u64>,
    pub regions: Vec<MemoryRegion>,
}

impl Default for SimSpec {
    fn default() -> Self {
        Self {
            thread_ids: vec![1, 2],
            regions: default_regions("a.out"),
        }
    }
}

impl SimSpec {
    pub fn with_thread_ids(thread_ids: &[u64]) -> Self {
        Self {
            thread_ids: thread_ids.to_vec(),
            ..Self::default()
        }
    }
}

/// Default memory map for a simulated process
pub fn default_regions(executable: &str) -> Vec<MemoryRegion> {
    vec![
        MemoryRegion {
            base_address: 0x0040_0000,
            size: 0x1_0000,
            protection: MemoryProtection::RX,
            name: Some(executable.to_string()),
        },
        MemoryRegion {
            base_address: 0x1000_0000,
            size: 0x10_0000,
            protection: MemoryProtection::RW,
            name: Some("[heap]".to_string()),
        },
        MemoryRegion {
            base_address: 0x7fff_0000_0000,
            size: 0x10_0000,
            protection: MemoryProtection::RW,
            name: Some("[stack]".to_string()),
        },
    ]
}

struct TargetInner {
    process: Option<Arc<DrivingProcess>>,
}

/// A debuggee description: executable, triple and, once launched, the
/// process running it.
pub struct Target {
    executable: String,
    triple: String,
    modules: Vec<ModuleInfo>,
    sim: SimSpec,
    inner: Mutex<TargetInner>,
}

impl Target {
    fn new(executable: &str, triple: &str, sim: SimSpec) -> Arc<Self> {
        let modules = vec![ModuleInfo {
            path: executable.to_string(),
            load_addr: 0x0040_0000,
        }];
        Arc::new(Self {
            executable: executable.to_string(),
            triple: triple.to_string(),
            modules,
            sim,
            inner: Mutex::new(TargetInner { process: None }),
        })
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn triple(&self) -> &str {
        &self.triple
    }

    /// Architecture component of the triple
    pub fn arch(&self) -> &str {
        self.triple.split('-').next().unwrap_or(&self.triple)
    }

    pub fn byte_order(&self) -> ByteOrder {
        let arch = self.arch();
        if arch.ends_with("be") || arch.starts_with("powerpc") || arch.starts_with("s390") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Pointer width in bytes
    pub fn address_byte_size(&self) -> u32 {
        match self.arch() {
            "i386" | "arm" | "armv7" | "thumbv7" => 4,
            _ => 8,
        }
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    pub fn sim(&self) -> &SimSpec {
        &self.sim
    }

    /// The current process of this target, if one was launched
    pub fn process(&self) -> Option<Arc<DrivingProcess>> {
        self.inner.lock().unwrap().process.clone()
    }

    /// Launch the target's process with the given launch parameters
    pub fn launch(&self, info: LaunchInfo) -> Result<Arc<DrivingProcess>, HostError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.process.is_some() {
            return Err(HostError::LaunchFailed {
                reason: format!("target '{}' already has a process", self.executable),
            });
        }
        if self.sim.thread_ids.is_empty() {
            return Err(HostError::LaunchFailed {
                reason: "simulated target has no threads".to_string(),
            });
        }
        let process = DrivingProcess::launch(
            &self.sim.thread_ids,
            self.sim.regions.clone(),
            self.arch(),
            info.listener.as_ref(),
            info.stop_at_entry,
        );
        log::info!(
            "launched process {} for '{}' ({} threads)",
            process.pid(),
            self.executable,
            self.sim.thread_ids.len()
        );
        inner.process = Some(process.clone());
        Ok(process)
    }
}

struct DebuggerInner {
    targets: Mutex<Vec<Arc<Target>>>,
    selected: AtomicUsize,
}

/// The host's target registry
#[derive(Clone)]
pub struct Debugger {
    inner: Arc<DebuggerInner>,
}

impl Debugger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DebuggerInner {
                targets: Mutex::new(Vec::new()),
                selected: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a target and append it to the registry
    pub fn create_target(&self, executable: &str, triple: &str, sim: SimSpec) -> Arc<Target> {
        let target = Target::new(executable, triple, sim);
        let mut targets = self.inner.targets.lock().unwrap();
        targets.push(target.clone());
        log::debug!(
            "created target #{} '{}' ({})",
            targets.len() - 1,
            executable,
            triple
        );
        target
    }

    pub fn num_targets(&self) -> usize {
        self.inner.targets.lock().unwrap().len()
    }

    pub fn target_at_index(&self, index: usize) -> Option<Arc<Target>> {
        self.inner.targets.lock().unwrap().get(index).cloned()
    }

    /// Index of a target within the registry
    pub fn index_of_target(&self, target: &Arc<Target>) -> Option<usize> {
        self.inner
            .targets
            .lock()
            .unwrap()
            .iter()
            .position(|t| Arc::ptr_eq(t, target))
    }

    pub fn selected_target(&self) -> Option<Arc<Target>> {
        self.target_at_index(self.inner.selected.load(Ordering::Relaxed))
    }

    pub fn select_target(&self, index: usize) {
        self.inner.selected.store(index, Ordering::Relaxed);
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a scripted process needs from its surroundings: the debugger
/// for target lookups and the target the scripted process belongs to.
#[derive(Clone)]
pub struct ExecutionContext {
    pub debugger: Debugger,
    pub target: Arc<Target>,
}

impl ExecutionContext {
    pub fn new(debugger: Debugger, target: Arc<Target>) -> Self {
        Self { debugger, target }
    }
}
