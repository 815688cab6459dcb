//! Demultiplexed scripted process.
//!
//! A synthetic process bound to a parity class of thread ids. Resume and
//! thread-info requests are forwarded to the owning multiplexer, which
//! filters the roster by the parity encoded in this process's id. The
//! multiplexer reference is non-owning; the multiplexer's registry owns
//! the demultiplexed processes, not the other way around.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::ScriptedConfig;
use crate::error::{Result, ScriptedError};
use crate::host::types::{MemoryRegion, ProcessState};
use crate::host::ExecutionContext;
use crate::proxy::passthru::PassthruProcess;
use crate::proxy::thread::ThreadProxyKind;
use crate::proxy::types::{LoadedImage, MemoryData, ParityClass, ThreadInfo};
use crate::proxy::ScriptedProcess;

use super::MuxInner;

/// Base of demultiplexed process ids; even processes get 420, odd 421
pub const DEMUX_PID_BASE: u64 = 420;

pub struct DemuxProcess {
    core: PassthruProcess,
    parity: ParityClass,
    multiplexer: Mutex<Option<Weak<MuxInner>>>,
    first_launch: AtomicBool,
}

impl DemuxProcess {
    /// Construct with the parity class from the config's `parity` key.
    /// Snapshots the driving roster like a passthrough and retags the
    /// thread proxies as multiplexed.
    pub fn new(ctx: ExecutionContext, config: &ScriptedConfig) -> Arc<Self> {
        let parity = config.parity().unwrap_or(ParityClass::Even);
        let core = PassthruProcess::new(ctx, config, true);
        core.set_thread_kind(ThreadProxyKind::Multiplexed(parity));
        Arc::new(Self {
            core,
            parity,
            multiplexer: Mutex::new(None),
            first_launch: AtomicBool::new(false),
        })
    }

    pub fn parity(&self) -> ParityClass {
        self.parity
    }

    pub(crate) fn bind_multiplexer(&self, mux: Weak<MuxInner>) {
        *self.multiplexer.lock().unwrap() = Some(mux);
    }

    pub fn is_bound(&self) -> bool {
        self.multiplexer.lock().unwrap().is_some()
    }

    fn multiplexer(&self, operation: &'static str) -> Result<Arc<MuxInner>> {
        let guard = self.multiplexer.lock().unwrap();
        let weak = guard.as_ref().ok_or(ScriptedError::MultiplexerNotSet {
            component: "DemuxProcess",
            operation,
        })?;
        weak.upgrade()
            .ok_or(ScriptedError::InvalidReference { what: "multiplexer" })
    }

    pub fn subscribe_state(&self) -> std::sync::mpsc::Receiver<ProcessState> {
        self.core.subscribe_state()
    }
}

impl ScriptedProcess for DemuxProcess {
    /// Even and odd processes get disjoint deterministic ids
    fn process_id(&self) -> u64 {
        DEMUX_PID_BASE + self.parity.value()
    }

    fn state(&self) -> ProcessState {
        self.core.state()
    }

    fn force_state(&self, state: ProcessState) {
        self.core.force_state(state);
    }

    /// The actual driving-process launch is owned by the multiplexer;
    /// this only arms the first-resume passthrough.
    fn launch(&self) -> Result<()> {
        self.first_launch.store(true, Ordering::Release);
        Ok(())
    }

    fn resume(&self, should_stop: bool) -> Result<()> {
        if self.first_launch.swap(false, Ordering::AcqRel) {
            return self.core.resume(should_stop);
        }
        self.multiplexer("resume")?.resume(Some(self.process_id()))
    }

    /// Parity-filtered view through the multiplexer once bound; the
    /// unfiltered passthrough view otherwise.
    fn threads_info(&self) -> BTreeMap<u64, ThreadInfo> {
        match self.multiplexer("threads_info") {
            Ok(mux) => mux.threads_info(Some(self.process_id())),
            Err(_) => self.core.threads_info(),
        }
    }

    fn read_memory_at_address(&self, addr: u64, size: usize) -> Result<MemoryData> {
        self.core.read_memory_at_address(addr, size)
    }

    fn write_memory_at_address(&self, addr: u64, data: &[u8]) -> Result<usize> {
        self.core.write_memory_at_address(addr, data)
    }

    fn memory_region_containing_address(&self, addr: u64) -> Option<MemoryRegion> {
        self.core.memory_region_containing_address(addr)
    }

    fn loaded_images(&self) -> Vec<LoadedImage> {
        self.core.loaded_images()
    }

    fn is_alive(&self) -> bool {
        self.core.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Debugger, LaunchInfo, SimSpec};
    use serde_json::json;

    fn demux_fixture(parity: u64) -> Arc<DemuxProcess> {
        let debugger = Debugger::new();
        let driving = debugger.create_target(
            "a.out",
            "x86_64-unknown-linux-gnu",
            SimSpec::with_thread_ids(&[1, 2, 3, 4]),
        );
        driving.launch(LaunchInfo::new().stop_at_entry(true)).unwrap();
        let own_target =
            debugger.create_target("a.out", "x86_64-unknown-linux-gnu", SimSpec::default());
        let ctx = ExecutionContext::new(debugger, own_target);
        let config = ScriptedConfig::new()
            .with("driving_target_idx", json!(0))
            .with("parity", json!(parity));
        DemuxProcess::new(ctx, &config)
    }

    #[test]
    fn process_id_is_parity_derived_and_idempotent() {
        let even = demux_fixture(0);
        let odd = demux_fixture(1);
        assert_eq!(even.process_id(), 420);
        assert_eq!(odd.process_id(), 421);

        even.launch().unwrap();
        even.resume(true).unwrap();
        assert_eq!(even.process_id(), 420);
    }

    #[test]
    fn resume_before_bind_fails_with_multiplexer_not_set() {
        let demux = demux_fixture(0);
        assert!(matches!(
            demux.resume(true),
            Err(ScriptedError::MultiplexerNotSet {
                operation: "resume",
                ..
            })
        ));
    }

    #[test]
    fn first_resume_after_launch_passes_through() {
        let demux = demux_fixture(1);
        demux.launch().unwrap();
        // Unbound, but the first resume goes straight to the driving side
        demux.resume(true).unwrap();
        // The flag is consumed, so the next resume needs a multiplexer
        assert!(matches!(
            demux.resume(true),
            Err(ScriptedError::MultiplexerNotSet { .. })
        ));
    }

    #[test]
    fn unbound_threads_info_is_the_unfiltered_view() {
        let demux = demux_fixture(1);
        let info = demux.threads_info();
        assert_eq!(info.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(info[&3].name, "OddMultiplexedThread.thread-3");
    }
}
