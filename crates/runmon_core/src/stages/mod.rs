//! Stage progression: command building and the per-run stage state machine.

mod commands;
mod machine;

pub use commands::{build_command, CommandInputs};
pub use machine::{StageAdvance, StageStateMachine, RUNNING_RUN_TIME_METRIC};
