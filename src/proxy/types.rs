//! Common types for scripted processes and threads.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use serde::Serialize;

use crate::host::types::{ByteOrder, NativeStopReason, ProcessState};

/// Numeric value of SIGTRAP on the platforms the translation targets
pub const SIGTRAP: i32 = 5;

/// Even/odd partition of thread ids, the demultiplexing key.
/// Assigned at construction and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParityClass {
    Even,
    Odd,
}

impl ParityClass {
    /// Parity of an arbitrary integer (process id, config value)
    pub fn from_value(value: u64) -> Self {
        if value % 2 == 0 {
            ParityClass::Even
        } else {
            ParityClass::Odd
        }
    }

    pub fn value(&self) -> u64 {
        match self {
            ParityClass::Even => 0,
            ParityClass::Odd => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ParityClass::Even => "Even",
            ParityClass::Odd => "Odd",
        }
    }

    pub fn matches_tid(&self, tid: u64) -> bool {
        tid % 2 == self.value()
    }
}

/// Stop reason of a scripted thread, after translation from the driving
/// thread's native reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data")]
pub enum StopReason {
    None,
    Breakpoint,
    Trace,
    Signal { signal: i32 },
    Exception { desc: String },
}

impl StopReason {
    /// Carry a native reason through unchanged, for architectures without
    /// a translation rule.
    pub fn from_native(native: &NativeStopReason) -> Self {
        match native {
            NativeStopReason::None => StopReason::None,
            NativeStopReason::Breakpoint { .. } => StopReason::Breakpoint,
            NativeStopReason::Trace => StopReason::Trace,
            NativeStopReason::Signal { signal } => StopReason::Signal { signal: *signal },
            NativeStopReason::Exception { description } => StopReason::Exception {
                desc: description.clone(),
            },
        }
    }
}

/// Raw bytes read from the driving process, tagged with the driving
/// target's byte order and address width.
#[derive(Debug, Clone)]
pub struct MemoryData {
    pub bytes: Vec<u8>,
    pub byte_order: ByteOrder,
    pub address_byte_size: u32,
}

/// A module of the driving process as seen through a scripted process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedImage {
    pub path: String,
    pub load_addr: u64,
}

/// Roster entry returned by thread-info queries
#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub thread_id: u64,
    pub name: String,
    pub stop_reason: StopReason,
}

/// The lifecycle state a scripted process presents to the host.
///
/// Mutated only through forced transitions; every forced state is pushed to
/// subscribers so observers see transition edges, not levels.
pub struct StateCell {
    state: Mutex<ProcessState>,
    watchers: Mutex<Vec<Sender<ProcessState>>>,
}

impl StateCell {
    pub fn new(initial: ProcessState) -> Self {
        Self {
            state: Mutex::new(initial),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> ProcessState {
        *self.state.lock().unwrap()
    }

    /// Force a state transition and notify subscribers, pruning the ones
    /// that went away.
    pub fn force(&self, state: ProcessState) {
        *self.state.lock().unwrap() = state;
        self.watchers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(state).is_ok());
    }

    /// Subscribe to forced transitions
    pub fn subscribe(&self) -> Receiver<ProcessState> {
        let (tx, rx) = mpsc::channel();
        self.watchers.lock().unwrap().push(tx);
        rx
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ProcessState::Invalid)
    }
}
