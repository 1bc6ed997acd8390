//! Background task lifecycle
//!
//! Every long-lived side effect an agent creates (shell processes, browser
//! sessions, sub-agents) is tracked here as a [`BackgroundTask`] record and
//! reclaimed through the uniform [`Reclaimable`] interface.
//!
//! - [`registry`] - task records, status transitions, cascading cleanup
//! - [`reclaim`] - the reclaim interface plus browser and cancellation reclaimers
//! - [`process`] - shell process runner with the sync/async timeout race

pub mod process;
pub mod reclaim;
pub mod registry;

pub use process::{
    ProcessError, ProcessOutput, ProcessRunner, ShellOutcome, ShellRequest, ShellSignal,
};
pub use reclaim::{BrowserHandle, BrowserReclaimer, CancelReclaimer, ReclaimError, Reclaimable};
pub use registry::{BackgroundTask, CleanupReport, TaskKind, TaskRegistry, TaskStatus};
