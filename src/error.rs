//! Error taxonomy for the scripted process layer.

use thiserror::Error;

use crate::host::HostError;

/// Errors surfaced by scripted processes and their wiring.
///
/// Failures of delegated driving-process operations are carried through
/// unchanged as `Delegate`; everything else is a condition detected locally
/// and names the failing component and operation.
#[derive(Error, Debug)]
pub enum ScriptedError {
    #[error("{component}.{operation}: invalid driving target")]
    InvalidDrivingTarget {
        component: &'static str,
        operation: &'static str,
    },

    #[error("{component}.launch: driving process already launched")]
    AlreadyLaunched { component: &'static str },

    #[error("{component}.{operation}: multiplexer is not set")]
    MultiplexerNotSet {
        component: &'static str,
        operation: &'static str,
    },

    #[error("thread proxy {index}: no driving thread bound")]
    UnboundThread { index: u32 },

    #[error(transparent)]
    Delegate(#[from] HostError),

    #[error("stale reference to {what}")]
    InvalidReference { what: &'static str },
}

pub type Result<T> = std::result::Result<T, ScriptedError>;
