//! Driving process simulation.
//!
//! Implements the live-process side of the host capability surface: thread
//! roster, register frames, sparse memory with region metadata, and state
//! change broadcasting. The simulation runs to a stop synchronously on
//! `continue_execution`, which keeps the event stream deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::event::{Broadcaster, EventKind, ListenerHandle};
use super::types::{MemoryRegion, NativeStopReason, ProcessState};
use super::HostError;

static NEXT_PID: AtomicU64 = AtomicU64::new(1000);

/// A single register with its value rendered as a hexadecimal string,
/// matching how debugger frontends surface register reads.
#[derive(Debug, Clone)]
pub struct Register {
    pub name: String,
    pub value: String,
}

/// A named register set within a frame
#[derive(Debug, Clone)]
pub struct RegisterSet {
    pub name: String,
    pub registers: Vec<Register>,
}

/// A stack frame of a stopped thread
#[derive(Debug, Clone)]
pub struct Frame {
    pub pc: u64,
    pub register_sets: Vec<RegisterSet>,
}

struct ThreadState {
    stop_reason: NativeStopReason,
    frames: Vec<Frame>,
}

/// One thread of the driving process
pub struct DrivingThread {
    tid: u64,
    index_id: u32,
    name: String,
    state: Mutex<ThreadState>,
}

impl DrivingThread {
    fn new(tid: u64, index_id: u32, arch: &str) -> Self {
        Self {
            tid,
            index_id,
            name: format!("thread-{}", index_id),
            state: Mutex::new(ThreadState {
                stop_reason: NativeStopReason::None,
                frames: vec![synthesize_frame(tid, arch)],
            }),
        }
    }

    /// 64-bit thread identifier, stable for the thread's lifetime
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// 1-based index of this thread within the process roster
    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop_reason(&self) -> NativeStopReason {
        self.state.lock().unwrap().stop_reason.clone()
    }

    /// Human readable description of the current stop reason
    pub fn stop_description(&self) -> String {
        match self.stop_reason() {
            NativeStopReason::None => String::new(),
            NativeStopReason::Breakpoint { description } => description,
            NativeStopReason::Trace => "instruction step".to_string(),
            NativeStopReason::Signal { signal } => format!("signal {}", signal),
            NativeStopReason::Exception { description } => description,
        }
    }

    pub fn set_stop_reason(&self, reason: NativeStopReason) {
        self.state.lock().unwrap().stop_reason = reason;
    }

    pub fn num_frames(&self) -> usize {
        self.state.lock().unwrap().frames.len()
    }

    pub fn frame_at_index(&self, index: usize) -> Option<Frame> {
        self.state.lock().unwrap().frames.get(index).cloned()
    }
}

/// Build the innermost frame for a simulated thread. Register values are a
/// deterministic function of the thread so tests can recompute them.
fn synthesize_frame(tid: u64, arch: &str) -> Frame {
    let names: &[&str] = if arch.starts_with("arm") || arch.starts_with("aarch64") {
        &[
            "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12",
            "x13", "x14", "x15", "fp", "lr", "sp", "pc",
        ]
    } else {
        &[
            "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15", "rip", "rflags",
        ]
    };
    let registers = names
        .iter()
        .enumerate()
        .map(|(i, name)| Register {
            name: name.to_string(),
            value: format!("{:#x}", register_value(tid, i)),
        })
        .collect();
    let pc_index = names
        .iter()
        .position(|name| *name == "pc" || *name == "rip")
        .unwrap_or(0);
    Frame {
        pc: register_value(tid, pc_index),
        register_sets: vec![
            RegisterSet {
                name: "General Purpose Registers".to_string(),
                registers,
            },
            RegisterSet {
                name: "Floating Point Registers".to_string(),
                registers: Vec::new(),
            },
        ],
    }
}

/// Deterministic register value for simulated thread state
pub fn register_value(tid: u64, reg_index: usize) -> u64 {
    0x1000_0000u64
        .wrapping_mul(tid)
        .wrapping_add(reg_index as u64)
}

struct ProcessInner {
    state: ProcessState,
    threads: Vec<Arc<DrivingThread>>,
    memory: HashMap<u64, u8>,
}

/// The real process being proxied or multiplexed.
///
/// Owns its broadcaster; anything watching its lifecycle attaches a
/// listener and consumes state-changed events.
pub struct DrivingProcess {
    pid: u64,
    arch: String,
    regions: Vec<MemoryRegion>,
    broadcaster: Broadcaster,
    inner: Mutex<ProcessInner>,
}

impl DrivingProcess {
    pub(super) fn launch(
        thread_ids: &[u64],
        regions: Vec<MemoryRegion>,
        arch: &str,
        listener: Option<&ListenerHandle>,
        stop_at_entry: bool,
    ) -> Arc<Self> {
        let threads = thread_ids
            .iter()
            .enumerate()
            .map(|(i, &tid)| Arc::new(DrivingThread::new(tid, i as u32 + 1, arch)))
            .collect::<Vec<_>>();

        let process = Arc::new(Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            arch: arch.to_string(),
            regions,
            broadcaster: Broadcaster::new(),
            inner: Mutex::new(ProcessInner {
                state: ProcessState::Launching,
                threads,
                memory: HashMap::new(),
            }),
        });

        if let Some(handle) = listener {
            process.broadcaster.add_listener(handle);
        }

        process.transition(ProcessState::Running);
        if stop_at_entry {
            process.stop_threads("stop at entry");
            process.transition(ProcessState::Stopped);
        }

        process
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().unwrap().state
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn threads(&self) -> Vec<Arc<DrivingThread>> {
        self.inner.lock().unwrap().threads.clone()
    }

    /// Look up a thread by its 1-based roster index
    pub fn thread_by_index_id(&self, index_id: u32) -> Option<Arc<DrivingThread>> {
        self.inner
            .lock()
            .unwrap()
            .threads
            .iter()
            .find(|t| t.index_id() == index_id)
            .cloned()
    }

    /// Resume the process. The simulation runs until the next stop, so the
    /// caller observes a Running event followed by a Stopped event.
    pub fn continue_execution(&self) -> Result<(), HostError> {
        if self.state() != ProcessState::Stopped {
            return Err(HostError::NotStopped { pid: self.pid });
        }
        self.transition(ProcessState::Running);
        self.stop_threads("breakpoint 1.1");
        self.transition(ProcessState::Stopped);
        Ok(())
    }

    fn transition(&self, state: ProcessState) {
        self.inner.lock().unwrap().state = state;
        log::debug!("driving process {} -> {}", self.pid, state);
        self.broadcaster.broadcast(EventKind::StateChanged(state));
    }

    /// Mark per-thread stop reasons for a simulated stop. The first thread
    /// takes the breakpoint, the rest stop for no reason, which is how a
    /// live debugger reports a process-wide stop.
    fn stop_threads(&self, description: &str) {
        let inner = self.inner.lock().unwrap();
        for (i, thread) in inner.threads.iter().enumerate() {
            if i == 0 {
                thread.set_stop_reason(NativeStopReason::Breakpoint {
                    description: description.to_string(),
                });
            } else {
                thread.set_stop_reason(NativeStopReason::None);
            }
        }
    }

    pub fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>, HostError> {
        self.region_containing(addr, size).ok_or_else(|| {
            HostError::ReadFailed {
                address: addr,
                size,
                reason: "address not mapped".to_string(),
            }
        })?;
        let inner = self.inner.lock().unwrap();
        Ok((0..size as u64)
            .map(|i| inner.memory.get(&(addr + i)).copied().unwrap_or(0))
            .collect())
    }

    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize, HostError> {
        let region = self.region_containing(addr, data.len()).ok_or_else(|| {
            HostError::WriteFailed {
                address: addr,
                reason: "address not mapped".to_string(),
            }
        })?;
        if !region.protection.write {
            return Err(HostError::WriteFailed {
                address: addr,
                reason: "region is not writable".to_string(),
            });
        }
        let mut inner = self.inner.lock().unwrap();
        for (i, &byte) in data.iter().enumerate() {
            inner.memory.insert(addr + i as u64, byte);
        }
        Ok(data.len())
    }

    /// Query the memory region containing `addr`
    pub fn memory_region_info(&self, addr: u64) -> Result<MemoryRegion, HostError> {
        self.regions
            .iter()
            .find(|r| r.contains(addr))
            .cloned()
            .ok_or(HostError::NoRegion { address: addr })
    }

    fn region_containing(&self, addr: u64, size: usize) -> Option<&MemoryRegion> {
        self.regions
            .iter()
            .find(|r| r.contains(addr) && r.contains(addr + size.saturating_sub(1) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::types::MemoryProtection;

    fn test_regions() -> Vec<MemoryRegion> {
        vec![MemoryRegion {
            base_address: 0x1000,
            size: 0x1000,
            protection: MemoryProtection::RW,
            name: Some("[heap]".to_string()),
        }]
    }

    #[test]
    fn launch_stops_at_entry_with_roster() {
        let process = DrivingProcess::launch(&[1, 2, 3], test_regions(), "x86_64", None, true);
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(process.threads().len(), 3);
        assert_eq!(process.thread_by_index_id(2).unwrap().tid(), 2);
        assert!(process.thread_by_index_id(9).is_none());
    }

    #[test]
    fn memory_round_trip() {
        let process = DrivingProcess::launch(&[1], test_regions(), "x86_64", None, true);
        let payload = b"\xde\xad\xbe\xef";
        process.write_memory(0x1800, payload).unwrap();
        assert_eq!(process.read_memory(0x1800, 4).unwrap(), payload);
    }

    #[test]
    fn unmapped_access_fails() {
        let process = DrivingProcess::launch(&[1], test_regions(), "x86_64", None, true);
        assert!(process.read_memory(0x9000, 4).is_err());
        assert!(process.memory_region_info(0x9000).is_err());
        assert!(process.memory_region_info(0x1000).is_ok());
    }

    #[test]
    fn continue_sets_breakpoint_stop_on_first_thread() {
        let process = DrivingProcess::launch(&[7, 8], test_regions(), "arm64", None, true);
        process.continue_execution().unwrap();
        let threads = process.threads();
        assert!(matches!(
            threads[0].stop_reason(),
            NativeStopReason::Breakpoint { .. }
        ));
        assert!(threads[1].stop_reason().is_none());
        assert!(!threads[0].stop_description().is_empty());
    }
}
