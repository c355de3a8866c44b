//! Tool adapter framework.
//!
//! Every external scanner is fronted by an adapter implementing the
//! `describe / validate / execute / parse` contract; the framework supplies
//! the `run` orchestration, subprocess plumbing and the process-wide
//! registry.

pub mod base;
pub mod process;
pub mod registry;

pub use base::{
    AdapterEvent, AdapterStage, Diagnostics, ExecutionContext, NativeOutput, RunFailure,
    RunOutcome, ToolAdapter,
};
pub use base::validate_against_descriptor;
pub use process::{find_binary, run_command, CommandOutput, CommandSpec};
pub use registry::{AdapterGuard, ToolRegistry};
