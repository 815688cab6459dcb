//! Common types for the host capability surface.

/// Lifecycle state of a process, real or scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    Invalid,
    Launching,
    Running,
    Stopped,
    Exited,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessState::Invalid => "invalid",
            ProcessState::Launching => "launching",
            ProcessState::Running => "running",
            ProcessState::Stopped => "stopped",
            ProcessState::Exited => "exited",
        };
        write!(f, "{}", name)
    }
}

/// Byte order of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Stop reason reported natively by a driving thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeStopReason {
    /// Thread is not stopped for any reason
    None,
    /// Hit a breakpoint
    Breakpoint { description: String },
    /// Completed a single step
    Trace,
    /// Received a signal
    Signal { signal: i32 },
    /// Hardware or software exception
    Exception { description: String },
}

impl NativeStopReason {
    pub fn is_none(&self) -> bool {
        matches!(self, NativeStopReason::None)
    }
}

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProtection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl MemoryProtection {
    pub const RX: Self = Self {
        read: true,
        write: false,
        execute: true,
    };
    pub const RW: Self = Self {
        read: true,
        write: true,
        execute: false,
    };
}

/// A memory region of the driving process
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    /// Start address of the region
    pub base_address: u64,
    /// Size of the region in bytes
    pub size: usize,
    /// Memory protection flags
    pub protection: MemoryProtection,
    /// Optional name (e.g., module path, "[stack]", "[heap]")
    pub name: Option<String>,
}

impl MemoryRegion {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_address && addr < self.base_address + self.size as u64
    }
}

/// A module loaded into the driving process
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Full path of the module file
    pub path: String,
    /// Load address of the module's object file header
    pub load_addr: u64,
}
