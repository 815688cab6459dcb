//! UI module - Command Line Interface
//!
//! Provides the reedline-based REPL that drives the scripted process
//! commands.

pub mod cli;
