//! Pipeline definition loading and execution: a configurable, ordered list
//! of sub-agent steps driven against one worker's directory.

pub mod runner;
pub mod schema;

pub use runner::{resolve_resume_step, PipelineOutcome, PipelineRunner, StepState};
pub use schema::{Pipeline, PipelineParseError, RetryPolicy, Step};
