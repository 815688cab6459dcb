//! ProcMux - scripted process multiplexing layer.
//!
//! One real "driving" process observed and controlled through synthetic
//! proxy processes: a passthrough that forwards everything, a multiplexer
//! that owns the driving process's event listener and fans its state out,
//! and demultiplexed processes that present parity-filtered views of the
//! multiplexer's thread roster.

pub mod config;
pub mod error;
pub mod host;
pub mod mux;
pub mod proxy;
pub mod ui;
pub mod wiring;

pub use error::ScriptedError;
pub use proxy::ScriptedProcess;
