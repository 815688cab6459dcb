//! Thread proxy - one driving thread seen through a scripted process.
//!
//! Translates the driving thread's native stop reason into the synthetic
//! stop-reason record and serializes its general purpose registers. The
//! proxy kind is a tag fixed at construction; it only affects the
//! observable name.

use std::sync::{Mutex, Weak};

use crate::config::ScriptedConfig;
use crate::error::{Result, ScriptedError};
use crate::host::process::DrivingThread;
use crate::host::types::ByteOrder;
use crate::host::ExecutionContext;
use crate::proxy::types::{ParityClass, StopReason, ThreadInfo, SIGTRAP};

/// Behavior tag of a thread proxy, selected at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadProxyKind {
    Passthru,
    Multiplexed(ParityClass),
}

impl ThreadProxyKind {
    fn name(&self) -> String {
        match self {
            ThreadProxyKind::Passthru => "PassthruThread".to_string(),
            ThreadProxyKind::Multiplexed(parity) => {
                format!("{}MultiplexedThread", parity.label())
            }
        }
    }
}

struct Binding {
    tid: u64,
    thread: Weak<DrivingThread>,
}

/// Shadow of one driving thread
pub struct ThreadProxy {
    kind: ThreadProxyKind,
    idx: u32,
    arch: String,
    byte_order: ByteOrder,
    binding: Option<Binding>,
    register_cache: Mutex<Vec<(String, u64)>>,
}

impl ThreadProxy {
    /// Resolve a driving thread from the config's `driving_target_idx` and
    /// `thread_idx`. If resolution fails the proxy stays unbound and all
    /// accessors fail with `UnboundThread`.
    pub fn new(ctx: &ExecutionContext, config: &ScriptedConfig, kind: ThreadProxyKind) -> Self {
        let idx = config.thread_idx().unwrap_or(0);

        let mut arch = String::new();
        let mut byte_order = ByteOrder::Little;
        let mut binding = None;

        if let Some(target_idx) = config.driving_target_idx() {
            if let Some(driving_target) = ctx.debugger.target_at_index(target_idx) {
                arch = driving_target.arch().to_string();
                byte_order = driving_target.byte_order();
                if let Some(process) = driving_target.process() {
                    if let Some(thread) = process.thread_by_index_id(idx) {
                        binding = Some(Binding {
                            tid: thread.tid(),
                            thread: std::sync::Arc::downgrade(&thread),
                        });
                    }
                }
            }
        }

        if binding.is_none() {
            log::warn!("thread proxy {}: no driving thread resolved", idx);
        }

        Self {
            kind,
            idx,
            arch,
            byte_order,
            binding,
            register_cache: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> ThreadProxyKind {
        self.kind
    }

    /// Retag the proxy, changing only its observable name
    pub fn set_kind(&mut self, kind: ThreadProxyKind) {
        self.kind = kind;
    }

    pub fn index(&self) -> u32 {
        self.idx
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    fn binding(&self) -> Result<&Binding> {
        self.binding
            .as_ref()
            .ok_or(ScriptedError::UnboundThread { index: self.idx })
    }

    /// The driving thread's 64-bit identifier
    pub fn thread_id(&self) -> Result<u64> {
        Ok(self.binding()?.tid)
    }

    /// Deterministic observable identity, derived from the proxy kind and
    /// its configured index.
    pub fn name(&self) -> String {
        format!("{}.thread-{}", self.kind.name(), self.idx)
    }

    /// Translate the driving thread's stop reason.
    ///
    /// An invalid driving thread, or one whose id no longer matches the
    /// bound id, reads as `None`. Non-none native reasons are translated
    /// per architecture: ARM family backends replay synthetic breakpoint
    /// stops as exceptions, x86-64 as a SIGTRAP, anything else passes the
    /// native reason through.
    pub fn stop_reason(&self) -> Result<StopReason> {
        let binding = self.binding()?;
        let thread = match binding.thread.upgrade() {
            Some(thread) if thread.tid() == binding.tid => thread,
            _ => return Ok(StopReason::None),
        };

        let native = thread.stop_reason();
        if native.is_none() {
            return Ok(StopReason::None);
        }

        if self.arch.starts_with("arm") || self.arch.starts_with("aarch64") {
            Ok(StopReason::Exception {
                desc: thread.stop_description(),
            })
        } else if self.arch == "x86_64" {
            Ok(StopReason::Signal { signal: SIGTRAP })
        } else {
            Ok(StopReason::from_native(&native))
        }
    }

    /// Serialize the general purpose registers of the innermost frame as a
    /// binary blob, 8 bytes per register in declaration order, using the
    /// driving target's byte order. Returns None when there are no frames
    /// or no general purpose set.
    pub fn register_context(&self) -> Result<Option<Vec<u8>>> {
        let binding = self.binding()?;
        let thread = match binding.thread.upgrade() {
            Some(thread) => thread,
            None => return Ok(None),
        };
        if thread.num_frames() == 0 {
            return Ok(None);
        }
        let frame = match thread.frame_at_index(0) {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let gprs = match frame
            .register_sets
            .iter()
            .find(|set| set.name.to_lowercase().contains("general purpose"))
        {
            Some(set) => set,
            None => return Ok(None),
        };

        let mut cache = self.register_cache.lock().unwrap();
        cache.clear();
        for reg in &gprs.registers {
            cache.push((reg.name.clone(), parse_hex_u64(&reg.value)));
        }

        let mut blob = Vec::with_capacity(cache.len() * 8);
        for (_, value) in cache.iter() {
            match self.byte_order {
                ByteOrder::Little => blob.extend_from_slice(&value.to_le_bytes()),
                ByteOrder::Big => blob.extend_from_slice(&value.to_be_bytes()),
            }
        }
        Ok(Some(blob))
    }

    /// Roster entry for thread-info queries; None while unbound
    pub fn info(&self) -> Option<ThreadInfo> {
        Some(ThreadInfo {
            thread_id: self.thread_id().ok()?,
            name: self.name(),
            stop_reason: self.stop_reason().unwrap_or(StopReason::None),
        })
    }
}

fn parse_hex_u64(value: &str) -> u64 {
    let digits = value
        .trim()
        .strip_prefix("0x")
        .or_else(|| value.trim().strip_prefix("0X"))
        .unwrap_or(value.trim());
    u64::from_str_radix(digits, 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::thread_config;
    use crate::host::process::register_value;
    use crate::host::{Debugger, LaunchInfo, SimSpec};

    fn launched_context(triple: &str) -> ExecutionContext {
        let debugger = Debugger::new();
        let target = debugger.create_target("a.out", triple, SimSpec::with_thread_ids(&[7, 8]));
        target
            .launch(LaunchInfo::new().stop_at_entry(true))
            .unwrap();
        ExecutionContext::new(debugger, target)
    }

    #[test]
    fn binds_to_driving_thread_by_index() {
        let ctx = launched_context("x86_64-unknown-linux-gnu");
        let proxy = ThreadProxy::new(&ctx, &thread_config(0, 1), ThreadProxyKind::Passthru);
        assert!(proxy.is_bound());
        assert_eq!(proxy.thread_id().unwrap(), 7);
        assert_eq!(proxy.name(), "PassthruThread.thread-1");
    }

    #[test]
    fn arm_family_stop_reads_as_exception() {
        let ctx = launched_context("arm64-apple-macosx");
        let proxy = ThreadProxy::new(&ctx, &thread_config(0, 1), ThreadProxyKind::Passthru);
        match proxy.stop_reason().unwrap() {
            StopReason::Exception { desc } => assert!(!desc.is_empty()),
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[test]
    fn x86_64_stop_reads_as_sigtrap() {
        let ctx = launched_context("x86_64-unknown-linux-gnu");
        let proxy = ThreadProxy::new(&ctx, &thread_config(0, 1), ThreadProxyKind::Passthru);
        assert_eq!(
            proxy.stop_reason().unwrap(),
            StopReason::Signal { signal: SIGTRAP }
        );
    }

    #[test]
    fn other_arch_passes_native_reason_through() {
        let ctx = launched_context("riscv64-unknown-linux-gnu");
        let proxy = ThreadProxy::new(&ctx, &thread_config(0, 1), ThreadProxyKind::Passthru);
        assert_eq!(proxy.stop_reason().unwrap(), StopReason::Breakpoint);
    }

    #[test]
    fn thread_without_native_reason_reads_none() {
        let ctx = launched_context("arm64-apple-macosx");
        let proxy = ThreadProxy::new(&ctx, &thread_config(0, 2), ThreadProxyKind::Passthru);
        assert_eq!(proxy.stop_reason().unwrap(), StopReason::None);
    }

    #[test]
    fn unresolved_proxy_fails_with_unbound_thread() {
        let debugger = Debugger::new();
        let target = debugger.create_target(
            "a.out",
            "x86_64-unknown-linux-gnu",
            SimSpec::default(),
        );
        // Target never launched, so there is no thread to resolve
        let ctx = ExecutionContext::new(debugger, target);
        let proxy = ThreadProxy::new(&ctx, &thread_config(0, 1), ThreadProxyKind::Passthru);
        assert!(!proxy.is_bound());
        assert!(matches!(
            proxy.thread_id(),
            Err(ScriptedError::UnboundThread { index: 1 })
        ));
        assert!(matches!(
            proxy.stop_reason(),
            Err(ScriptedError::UnboundThread { .. })
        ));
    }

    #[test]
    fn register_context_packs_gprs_in_declaration_order() {
        let ctx = launched_context("x86_64-unknown-linux-gnu");
        let proxy = ThreadProxy::new(&ctx, &thread_config(0, 1), ThreadProxyKind::Passthru);
        let blob = proxy.register_context().unwrap().unwrap();

        // 18 x86-64 general purpose registers, 8 bytes each
        assert_eq!(blob.len(), 18 * 8);
        for i in 0..18 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&blob[i * 8..(i + 1) * 8]);
            assert_eq!(u64::from_le_bytes(raw), register_value(7, i));
        }
    }

    #[test]
    fn multiplexed_kind_prefixes_name_with_parity() {
        let ctx = launched_context("x86_64-unknown-linux-gnu");
        let mut proxy = ThreadProxy::new(
            &ctx,
            &thread_config(0, 2),
            ThreadProxyKind::Multiplexed(ParityClass::Odd),
        );
        assert_eq!(proxy.name(), "OddMultiplexedThread.thread-2");
        proxy.set_kind(ThreadProxyKind::Passthru);
        assert_eq!(proxy.name(), "PassthruThread.thread-2");
    }
}
