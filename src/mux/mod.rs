//! Multiplexer scripted process.
//!
//! Owns a driving process exclusively: launches it with a private listener,
//! runs a background event pump that observes its state changes, and fans
//! every stop out as forced state transitions to itself and to all
//! demultiplexed processes registered with it.

pub mod demux;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ScriptedConfig;
use crate::error::{Result, ScriptedError};
use crate::host::event::Listener;
use crate::host::types::{MemoryRegion, ProcessState};
use crate::host::{ExecutionContext, HostError, LaunchInfo};
use crate::proxy::passthru::PassthruProcess;
use crate::proxy::thread::ThreadProxyKind;
use crate::proxy::types::{LoadedImage, MemoryData, ParityClass, ThreadInfo};
use crate::proxy::ScriptedProcess;
use demux::DemuxProcess;

/// Bounded wait per pump iteration; the poll keeps the loop cancellable
const EVENT_POLL: Duration = Duration::from_secs(1);

/// Grace period while launch wires the driving process reference
const WIRING_GRACE: Duration = Duration::from_millis(10);

/// Lifecycle of the multiplexer itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxPhase {
    Constructed,
    Launching,
    Listening,
    Terminated,
}

struct PumpHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

pub(crate) struct MuxInner {
    core: PassthruProcess,
    phase: Mutex<MuxPhase>,
    /// pid -> demultiplexed process. Entries are never removed; the host's
    /// command layer is assumed to be the single binder.
    registry: Mutex<BTreeMap<u64, Arc<DemuxProcess>>>,
    pump: Mutex<Option<PumpHandle>>,
    first_resume: AtomicBool,
    /// One-shot: the pump consumes the stop-at-entry event by continuing
    /// the driving process instead of fanning it out.
    entry_continue: AtomicBool,
    resume_lock: Mutex<()>,
}

/// Handle to a multiplexer scripted process. Clones share state; the
/// demultiplexed processes hold only non-owning references.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    pub fn new(ctx: ExecutionContext, config: &ScriptedConfig) -> Self {
        // The multiplexer launches the driving process itself, so nothing
        // is snapshotted at construction time.
        Self {
            inner: Arc::new(MuxInner {
                core: PassthruProcess::new(ctx, config, false),
                phase: Mutex::new(MuxPhase::Constructed),
                registry: Mutex::new(BTreeMap::new()),
                pump: Mutex::new(None),
                first_resume: AtomicBool::new(true),
                entry_continue: AtomicBool::new(true),
                resume_lock: Mutex::new(()),
            }),
        }
    }

    pub fn phase(&self) -> MuxPhase {
        *self.inner.phase.lock().unwrap()
    }

    /// Launch the driving process with this multiplexer's listener
    /// attached, stopped at entry so the launch stop event reaches the
    /// pump, and start the pump.
    pub fn launch_driving(&self) -> Result<()> {
        let target =
            self.inner
                .core
                .driving_target()
                .map_err(|_| ScriptedError::InvalidDrivingTarget {
                    component: "Multiplexer",
                    operation: "launch",
                })?;
        if self.inner.core.has_driving_process() {
            return Err(ScriptedError::AlreadyLaunched {
                component: "Multiplexer",
            });
        }

        *self.inner.phase.lock().unwrap() = MuxPhase::Launching;

        let listener = Listener::new("procmux.listener.multiplexer");
        let handle = listener.handle();
        if let Err(err) = self.start_pump(listener) {
            *self.inner.phase.lock().unwrap() = MuxPhase::Terminated;
            return Err(err);
        }

        // Observers must see the multiplexer running before the driving
        // state's launch stop lands.
        self.inner.core.force_state(ProcessState::Running);

        let launch = target.launch(LaunchInfo::new().with_listener(handle).stop_at_entry(true));
        let driving = match launch {
            Ok(driving) => driving,
            Err(err) => {
                self.inner.stop_pump();
                *self.inner.phase.lock().unwrap() = MuxPhase::Terminated;
                return Err(err.into());
            }
        };

        self.inner.core.set_driving_process(&driving);
        self.inner.core.refresh_threads(ThreadProxyKind::Passthru);
        self.inner.core.snapshot_loaded_images();

        *self.inner.phase.lock().unwrap() = MuxPhase::Listening;
        log::info!(
            "multiplexer listening on driving process {}",
            driving.pid()
        );
        Ok(())
    }

    fn start_pump(&self, listener: Listener) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(&self.inner);
        let pump_stop = stop.clone();
        let join = thread::Builder::new()
            .name("procmux-event-pump".to_string())
            .spawn(move || event_pump(listener, pump_stop, weak))
            .map_err(|err| HostError::LaunchFailed {
                reason: format!("event pump thread: {}", err),
            })?;
        *self.inner.pump.lock().unwrap() = Some(PumpHandle { stop, join });
        Ok(())
    }

    /// Resume the driving process. The first resume is a no-op success:
    /// the pump already continued the driving process past its entry stop.
    pub fn resume(&self, pid: Option<u64>) -> Result<()> {
        self.inner.resume(pid)
    }

    /// Full roster without a pid; the parity-filtered subset with one
    pub fn threads_info(&self, pid: Option<u64>) -> BTreeMap<u64, ThreadInfo> {
        self.inner.threads_info(pid)
    }

    /// Bind a demultiplexed process to this multiplexer: set its back
    /// reference and register it under its process id.
    pub fn bind(&self, demux: &Arc<DemuxProcess>) {
        demux.bind_multiplexer(Arc::downgrade(&self.inner));
        let pid = demux.process_id();
        self.inner.registry.lock().unwrap().insert(pid, demux.clone());
        log::info!("multiplexed process {} registered", pid);
    }

    pub fn registered_pids(&self) -> Vec<u64> {
        self.inner.registry.lock().unwrap().keys().copied().collect()
    }

    pub fn subscribe_state(&self) -> std::sync::mpsc::Receiver<ProcessState> {
        self.inner.core.subscribe_state()
    }

    /// Stop the pump and mark the multiplexer terminated
    pub fn shutdown(&self) {
        self.inner.stop_pump();
        *self.inner.phase.lock().unwrap() = MuxPhase::Terminated;
    }
}

impl MuxInner {
    pub(crate) fn resume(&self, pid: Option<u64>) -> Result<()> {
        if self.first_resume.swap(false, Ordering::AcqRel) {
            log::debug!("first resume is a no-op, launch already resumed at entry");
            return Ok(());
        }

        // Serialize resume cycles; concurrent callers are not excluded by
        // the host's command layer.
        let _guard = self.resume_lock.lock().unwrap();
        let driving = self.core.driving_process()?;
        log::debug!(
            "resuming driving process {} (requested by pid {:?})",
            driving.pid(),
            pid
        );
        driving.continue_execution()?;
        Ok(())
    }

    pub(crate) fn threads_info(&self, pid: Option<u64>) -> BTreeMap<u64, ThreadInfo> {
        let roster = self.core.threads_info();
        match pid {
            None => roster,
            Some(pid) => {
                let parity = ParityClass::from_value(pid);
                roster
                    .into_iter()
                    .filter(|(tid, _)| parity.matches_tid(*tid))
                    .collect()
            }
        }
    }

    /// Driving process stopped: rebuild the roster, then force the state
    /// edge through the multiplexer first and its children second.
    fn handle_driving_stop(&self) {
        self.core.refresh_threads(ThreadProxyKind::Passthru);

        self.core.force_state(ProcessState::Running);
        self.core.force_state(ProcessState::Stopped);

        for demux in self.registry.lock().unwrap().values() {
            demux.force_state(ProcessState::Running);
            demux.force_state(ProcessState::Stopped);
        }
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.stop.store(true, Ordering::Release);
            // The final handle can be released by the pump itself; joining
            // our own thread would never return.
            if handle.join.thread().id() != thread::current().id() {
                let _ = handle.join.join();
            }
        }
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

/// Background event pump, the single consumer of the multiplexer's
/// listener and the only writer of the roster and of forced transitions.
fn event_pump(listener: Listener, stop: Arc<AtomicBool>, mux: Weak<MuxInner>) {
    log::debug!("event pump started on listener '{}'", listener.name());
    let mut pending = None;
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let event = match pending.take() {
            Some(event) => event,
            None => match listener.wait_for_event(EVENT_POLL) {
                Some(event) => event,
                None => continue,
            },
        };
        let Some(inner) = mux.upgrade() else {
            break;
        };

        let driving = match inner.core.driving_process() {
            Ok(driving) => driving,
            Err(err) if retryable_wiring_error(&err) => {
                // Entry events can arrive before launch wires the driving
                // process reference; hold the event and retry.
                pending = Some(event);
                drop(inner);
                thread::sleep(WIRING_GRACE);
                continue;
            }
            Err(err) => {
                log::warn!("dropping event, driving process is gone: {}", err);
                continue;
            }
        };
        if !event.broadcaster_matches(driving.broadcaster()) {
            continue;
        }
        match event.state_from_event() {
            Some(ProcessState::Stopped) => {
                if inner.entry_continue.swap(false, Ordering::AcqRel) {
                    // Consume the entry stop; the first stop observers see
                    // is a real one.
                    log::debug!("continuing driving process past the entry stop");
                    if let Err(err) = driving.continue_execution() {
                        log::warn!("entry continue failed: {}", err);
                    }
                } else {
                    inner.handle_driving_stop();
                }
            }
            Some(state) => log::debug!("ignoring driving state event: {}", state),
            None => {}
        }
    }
    log::debug!("event pump exited");
}

/// Only a not-yet-wired driving process is worth a park-and-retry; a dead
/// reference never comes back.
fn retryable_wiring_error(err: &ScriptedError) -> bool {
    matches!(err, ScriptedError::Delegate(HostError::NoProcess))
}

impl ScriptedProcess for Multiplexer {
    fn process_id(&self) -> u64 {
        self.inner.core.process_id()
    }

    fn state(&self) -> ProcessState {
        self.inner.core.state()
    }

    fn force_state(&self, state: ProcessState) {
        self.inner.core.force_state(state);
    }

    fn launch(&self) -> Result<()> {
        self.launch_driving()
    }

    fn resume(&self, _should_stop: bool) -> Result<()> {
        Multiplexer::resume(self, None)
    }

    fn threads_info(&self) -> BTreeMap<u64, ThreadInfo> {
        Multiplexer::threads_info(self, None)
    }

    fn read_memory_at_address(&self, addr: u64, size: usize) -> Result<MemoryData> {
        self.inner.core.read_memory_at_address(addr, size)
    }

    fn write_memory_at_address(&self, addr: u64, data: &[u8]) -> Result<usize> {
        self.inner.core.write_memory_at_address(addr, data)
    }

    fn memory_region_containing_address(&self, addr: u64) -> Option<MemoryRegion> {
        self.inner.core.memory_region_containing_address(addr)
    }

    fn loaded_images(&self) -> Vec<LoadedImage> {
        self.inner.core.loaded_images()
    }

    fn is_alive(&self) -> bool {
        self.inner.core.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Debugger, SimSpec};
    use serde_json::json;
    use std::time::Duration;

    fn mux_fixture(thread_ids: &[u64]) -> (Debugger, Multiplexer) {
        let debugger = Debugger::new();
        debugger.create_target(
            "a.out",
            "x86_64-unknown-linux-gnu",
            SimSpec::with_thread_ids(thread_ids),
        );
        let mux_target =
            debugger.create_target("a.out", "x86_64-unknown-linux-gnu", SimSpec::default());
        let ctx = ExecutionContext::new(debugger.clone(), mux_target);
        let config = ScriptedConfig::new().with("driving_target_idx", json!(0));
        (debugger, Multiplexer::new(ctx, &config))
    }

    fn wait_for_stop(rx: &std::sync::mpsc::Receiver<ProcessState>) {
        loop {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(ProcessState::Stopped) => return,
                Ok(_) => continue,
                Err(err) => panic!("no stop observed: {}", err),
            }
        }
    }

    #[test]
    fn launch_requires_driving_target() {
        let debugger = Debugger::new();
        let target =
            debugger.create_target("a.out", "x86_64-unknown-linux-gnu", SimSpec::default());
        let ctx = ExecutionContext::new(debugger, target);
        let mux = Multiplexer::new(ctx, &ScriptedConfig::new());
        assert!(matches!(
            mux.launch_driving(),
            Err(ScriptedError::InvalidDrivingTarget { .. })
        ));
    }

    #[test]
    fn launch_twice_reports_already_launched() {
        let (_, mux) = mux_fixture(&[1, 2]);
        let rx = mux.subscribe_state();
        mux.launch_driving().unwrap();
        wait_for_stop(&rx);
        assert!(matches!(
            mux.launch_driving(),
            Err(ScriptedError::AlreadyLaunched { .. })
        ));
        mux.shutdown();
    }

    #[test]
    fn launch_snapshots_roster_and_reaches_listening() {
        let (_, mux) = mux_fixture(&[1, 2, 3, 4]);
        let rx = mux.subscribe_state();
        mux.launch_driving().unwrap();
        wait_for_stop(&rx);
        assert_eq!(mux.phase(), MuxPhase::Listening);
        assert_eq!(
            mux.threads_info(None).keys().copied().collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        mux.shutdown();
    }

    #[test]
    fn threads_info_filters_by_pid_parity() {
        let (_, mux) = mux_fixture(&[1, 2, 3, 4]);
        let rx = mux.subscribe_state();
        mux.launch_driving().unwrap();
        wait_for_stop(&rx);

        let even: Vec<_> = mux.threads_info(Some(420)).keys().copied().collect();
        let odd: Vec<_> = mux.threads_info(Some(421)).keys().copied().collect();
        assert_eq!(even, vec![2, 4]);
        assert_eq!(odd, vec![1, 3]);
        mux.shutdown();
    }

    #[test]
    fn launch_continues_past_the_entry_stop() {
        let (debugger, mux) = mux_fixture(&[1, 2]);
        let rx = mux.subscribe_state();
        mux.launch_driving().unwrap();
        wait_for_stop(&rx);

        // The pump resumed the driving process once, so the first visible
        // stop is the real breakpoint, not the entry stop.
        let driving = debugger.target_at_index(0).unwrap().process().unwrap();
        assert_eq!(driving.threads()[0].stop_description(), "breakpoint 1.1");

        // The user's first resume is the matching no-op; nothing moves
        mux.resume(None).unwrap();
        assert_eq!(driving.state(), ProcessState::Stopped);
        assert_eq!(driving.threads()[0].stop_description(), "breakpoint 1.1");
        mux.shutdown();
    }

    #[test]
    fn driving_launch_failure_passes_through_and_terminates() {
        let (_, mux) = mux_fixture(&[]);
        let err = mux.launch_driving().unwrap_err();
        assert!(matches!(
            err,
            ScriptedError::Delegate(HostError::LaunchFailed { .. })
        ));
        assert_eq!(mux.phase(), MuxPhase::Terminated);
    }

    #[test]
    fn only_missing_wiring_is_retryable() {
        assert!(retryable_wiring_error(&ScriptedError::Delegate(
            HostError::NoProcess
        )));
        assert!(!retryable_wiring_error(&ScriptedError::InvalidReference {
            what: "driving process",
        }));
        assert!(!retryable_wiring_error(&ScriptedError::Delegate(
            HostError::NotStopped { pid: 1000 }
        )));
    }

    #[test]
    fn drop_on_the_pump_thread_skips_the_self_join() {
        use std::sync::mpsc;

        let debugger = Debugger::new();
        let target =
            debugger.create_target("a.out", "x86_64-unknown-linux-gnu", SimSpec::default());
        let ctx = ExecutionContext::new(debugger, target);
        let inner = Arc::new(MuxInner {
            core: PassthruProcess::new(ctx, &ScriptedConfig::new(), false),
            phase: Mutex::new(MuxPhase::Constructed),
            registry: Mutex::new(BTreeMap::new()),
            pump: Mutex::new(None),
            first_resume: AtomicBool::new(true),
            entry_continue: AtomicBool::new(true),
            resume_lock: Mutex::new(()),
        });

        // Stage the drop-on-pump-thread sequence: the spawned thread holds
        // the last strong reference and its own join handle sits in the
        // pump slot when that reference goes away.
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let thread_inner = inner.clone();
        let join = thread::spawn(move || {
            ready_rx.recv().unwrap();
            drop(thread_inner);
            done_tx.send(()).unwrap();
        });

        let stop = Arc::new(AtomicBool::new(false));
        *inner.pump.lock().unwrap() = Some(PumpHandle {
            stop: stop.clone(),
            join,
        });

        drop(inner);
        ready_tx.send(()).unwrap();
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("final drop on the pump thread deadlocked");
        assert!(stop.load(Ordering::Acquire));
    }

    #[test]
    fn first_resume_is_a_noop_then_resumes_drive() {
        let (debugger, mux) = mux_fixture(&[1, 2]);
        let rx = mux.subscribe_state();
        mux.launch_driving().unwrap();
        wait_for_stop(&rx);

        // Consumes the special case without touching the driving process
        mux.resume(None).unwrap();

        mux.resume(None).unwrap();
        wait_for_stop(&rx);
        let driving = debugger.target_at_index(0).unwrap().process().unwrap();
        assert_eq!(driving.state(), ProcessState::Stopped);
        mux.shutdown();
    }

    #[test]
    fn forced_transitions_pass_through_running_before_stopped() {
        let (_, mux) = mux_fixture(&[1, 2]);
        let rx = mux.subscribe_state();
        mux.launch_driving().unwrap();

        let mut history = Vec::new();
        while history.last() != Some(&ProcessState::Stopped) {
            history.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        for (i, state) in history.iter().enumerate() {
            if *state == ProcessState::Stopped {
                assert_eq!(history[i - 1], ProcessState::Running);
            }
        }
        mux.shutdown();
    }
}
