//! Harness adapter interface for sub-agent invocations.
//!
//! A harness wraps one agent CLI (e.g. `claude`, `codex`) and runs it as a
//! one-shot subprocess against a worker directory: spawn, wait for exit or
//! timeout, then read back the step result file the agent is contracted to
//! write. There is no mid-run messaging and no event stream — the contract
//! is entirely file-based (see [`crate::gate::StepResult`]).

pub mod registry;
pub mod subprocess;
pub mod trait_def;

pub use registry::HarnessRegistry;
pub use subprocess::SubprocessHarness;
pub use trait_def::{Harness, Invocation};
