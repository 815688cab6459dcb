//! Lifecycle and wiring glue.
//!
//! Creates duplicate targets, launches scripted processes from a class tag
//! plus a JSON configuration payload, and binds demultiplexed processes to
//! their multiplexer. Also carries the two host-facing commands: start a
//! multiplexer against the selected target, and spawn the even/odd
//! demultiplexed pair.

use std::sync::Arc;

use serde_json::json;

use crate::config::ScriptedConfig;
use crate::error::{Result, ScriptedError};
use crate::host::{Debugger, ExecutionContext, Target};
use crate::mux::demux::DemuxProcess;
use crate::mux::Multiplexer;
use crate::proxy::passthru::PassthruProcess;
use crate::proxy::types::ParityClass;
use crate::proxy::ScriptedProcess;

/// Scripted process implementation selected at launch time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedClass {
    Passthru,
    Multiplexer,
    Demultiplexed,
}

impl ScriptedClass {
    /// Resolve a class name string, tolerating the short and long forms
    /// script authors use.
    pub fn from_class_name(name: &str) -> Option<Self> {
        match name {
            "passthru" | "PassthruProcess" => Some(ScriptedClass::Passthru),
            "multiplexer" | "Multiplexer" => Some(ScriptedClass::Multiplexer),
            "demux" | "DemuxProcess" => Some(ScriptedClass::Demultiplexed),
            _ => None,
        }
    }
}

/// A launched scripted process of any class
pub enum ScriptedHandle {
    Passthru(PassthruProcess),
    Multiplexer(Multiplexer),
    Demultiplexed(Arc<DemuxProcess>),
}

impl ScriptedHandle {
    pub fn as_process(&self) -> &dyn ScriptedProcess {
        match self {
            ScriptedHandle::Passthru(p) => p,
            ScriptedHandle::Multiplexer(m) => m,
            ScriptedHandle::Demultiplexed(d) => d.as_ref(),
        }
    }
}

/// Create a second, independent target bound to the same executable and
/// triple as the driving target. Returns None when the debugger cannot
/// materialize the duplicate.
pub fn duplicate_target(debugger: &Debugger, driving_target: &Arc<Target>) -> Option<Arc<Target>> {
    debugger.index_of_target(driving_target)?;
    Some(debugger.create_target(
        driving_target.executable(),
        driving_target.triple(),
        driving_target.sim().clone(),
    ))
}

/// Construct a scripted process of `class` against `target` with the given
/// configuration payload and launch it.
pub fn launch_scripted_process(
    debugger: &Debugger,
    target: Arc<Target>,
    class: ScriptedClass,
    config: &ScriptedConfig,
) -> Result<ScriptedHandle> {
    let ctx = ExecutionContext::new(debugger.clone(), target);
    let handle = match class {
        ScriptedClass::Passthru => {
            ScriptedHandle::Passthru(PassthruProcess::new(ctx, config, true))
        }
        ScriptedClass::Multiplexer => ScriptedHandle::Multiplexer(Multiplexer::new(ctx, config)),
        ScriptedClass::Demultiplexed => {
            ScriptedHandle::Demultiplexed(DemuxProcess::new(ctx, config))
        }
    };
    handle.as_process().launch()?;
    Ok(handle)
}

/// Bind a demultiplexed process to its multiplexer. Must happen before
/// resume or thread-info calls on the demultiplexed process take the
/// multiplexer-delegating paths.
pub fn multiplex(mux_process: &Multiplexer, muxed_process: &Arc<DemuxProcess>) {
    mux_process.bind(muxed_process);
}

/// Host command: duplicate the selected target and launch a multiplexer
/// scripted process driving it.
pub fn start_multiplexer(debugger: &Debugger) -> Result<Multiplexer> {
    let driving_target = debugger
        .selected_target()
        .ok_or(ScriptedError::InvalidDrivingTarget {
            component: "wiring",
            operation: "start_multiplexer",
        })?;
    let driving_idx =
        debugger
            .index_of_target(&driving_target)
            .ok_or(ScriptedError::InvalidDrivingTarget {
                component: "wiring",
                operation: "start_multiplexer",
            })?;

    let mux_target = duplicate_target(debugger, &driving_target).ok_or(
        ScriptedError::InvalidDrivingTarget {
            component: "wiring",
            operation: "start_multiplexer",
        },
    )?;

    let config = ScriptedConfig::new().with("driving_target_idx", json!(driving_idx));
    match launch_scripted_process(debugger, mux_target, ScriptedClass::Multiplexer, &config)? {
        ScriptedHandle::Multiplexer(mux) => Ok(mux),
        _ => unreachable!("multiplexer class launched a different variant"),
    }
}

/// Host command: spawn the even and odd demultiplexed processes against
/// the multiplexer's driving target and bind them.
pub fn spawn_demultiplexed_pair(
    debugger: &Debugger,
    mux: &Multiplexer,
    driving_idx: usize,
) -> Result<(Arc<DemuxProcess>, Arc<DemuxProcess>)> {
    let driving_target =
        debugger
            .target_at_index(driving_idx)
            .ok_or(ScriptedError::InvalidDrivingTarget {
                component: "wiring",
                operation: "spawn_demultiplexed_pair",
            })?;

    let even = spawn_demuxed(debugger, mux, &driving_target, driving_idx, ParityClass::Even)?;
    let odd = spawn_demuxed(debugger, mux, &driving_target, driving_idx, ParityClass::Odd)?;
    Ok((even, odd))
}

fn spawn_demuxed(
    debugger: &Debugger,
    mux: &Multiplexer,
    driving_target: &Arc<Target>,
    driving_idx: usize,
    parity: ParityClass,
) -> Result<Arc<DemuxProcess>> {
    let target = duplicate_target(debugger, driving_target).ok_or(
        ScriptedError::InvalidDrivingTarget {
            component: "wiring",
            operation: "spawn_demultiplexed_pair",
        },
    )?;
    let config = ScriptedConfig::new()
        .with("driving_target_idx", json!(driving_idx))
        .with("parity", json!(parity.value()));
    let handle = launch_scripted_process(debugger, target, ScriptedClass::Demultiplexed, &config)?;
    let ScriptedHandle::Demultiplexed(demux) = handle else {
        unreachable!("demux class launched a different variant");
    };
    multiplex(mux, &demux);
    Ok(demux)
}
