//! Job orchestration.
//!
//! - **Recipes and jobs** ([`recipe`]): what an operator submits
//! - **Executor** ([`executor`]): runs one recipe against a [`HardwareSetup`](crate::hardware::HardwareSetup)
//! - **Runner** ([`runner`]): the perpetual FIFO loop with cooperative abort
//! - **State** ([`state`]): queue, active job, bounded histories and status snapshot
//!
//! # Example
//!
//! ```rust,ignore
//! use hive_runner::experiment::{Job, JobRunner};
//!
//! let runner = JobRunner::new(setup, serializer, config.runner.clone());
//! let (handle, task) = runner.spawn();
//!
//! handle.enqueue(job)?;
//! println!("{}", handle.snapshot_json()?);
//!
//! // Drop the active job and everything queued behind it
//! handle.abort();
//! ```

pub mod executor;
pub mod recipe;
pub mod runner;
pub mod state;

pub use executor::{run_recipe, spawn_recipe};
pub use recipe::{Job, PositionCoordinates, Recipe};
pub use runner::{JobRunner, RunnerHandle};
pub use state::{History, JobOutcome, JobRecord, RunStatus, RunnerSnapshot};
