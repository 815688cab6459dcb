//! Proxy module - scripted processes and threads.
//!
//! A scripted process is a process-like object presented to the host
//! entirely through this crate's logic rather than native process control.
//! Variants share one contract:
//! - Passthrough: forwards everything to a single driving process
//! - Multiplexer: owns the driving process's listener, fans out its state
//! - Demultiplexed: presents a parity-filtered subset of a multiplexer

pub mod passthru;
pub mod thread;
pub mod types;

use std::collections::BTreeMap;

use crate::error::Result;
use crate::host::types::{MemoryRegion, ProcessState};
use types::{LoadedImage, MemoryData, ThreadInfo};

/// Shared contract of all scripted process variants
pub trait ScriptedProcess: Send + Sync {
    /// Identifier this synthetic process presents to the host
    fn process_id(&self) -> u64;

    fn state(&self) -> ProcessState;

    /// Forced state transition, independent of any real OS signal
    fn force_state(&self, state: ProcessState);

    fn launch(&self) -> Result<()>;

    fn resume(&self, should_stop: bool) -> Result<()>;

    /// Thread roster keyed by thread id
    fn threads_info(&self) -> BTreeMap<u64, ThreadInfo>;

    fn read_memory_at_address(&self, addr: u64, size: usize) -> Result<MemoryData>;

    fn write_memory_at_address(&self, addr: u64, data: &[u8]) -> Result<usize>;

    /// Region lookup. Collapses every failure into None; callers must
    /// treat "no region" as the only failure signal.
    fn memory_region_containing_address(&self, addr: u64) -> Option<MemoryRegion>;

    fn loaded_images(&self) -> Vec<LoadedImage>;

    fn is_alive(&self) -> bool;

    fn should_stop(&self) -> bool {
        true
    }
}
