//! Shared runner state.
//!
//! The pending queue, the active job, the done/failed histories and the abort
//! flag all sit behind one mutex in [`SharedState`]. Critical sections are short
//! and constant-time; no lock is ever held across a hardware wait.
//!
//! The active job and the run status are one value ([`ActiveRun`] inside an
//! `Option`), so "a job is active" and "status is Running" cannot disagree.

use crate::experiment::recipe::Job;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// `error_state` of a job that finished without errors.
pub const DONE_WITHOUT_ERRORS: &str = "Done with no errors";

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Every recipe finished.
    Completed,
    /// A recipe or the job setup failed.
    Failed,
    /// Stopped by the operator.
    Aborted,
}

/// A finished job as kept in history and handed to the serializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// The job as submitted.
    #[serde(flatten)]
    pub job: Job,
    /// How the job ended.
    pub outcome: JobOutcome,
    /// `"Done with no errors"` or the error description.
    pub error_state: String,
    /// When the record was created.
    pub finished_at: DateTime<Utc>,
}

impl JobRecord {
    /// Record of a job that completed.
    pub fn completed(job: Job) -> Self {
        Self {
            job,
            outcome: JobOutcome::Completed,
            error_state: DONE_WITHOUT_ERRORS.to_string(),
            finished_at: Utc::now(),
        }
    }

    /// Record of a job that failed or was aborted.
    pub fn failed(job: Job, outcome: JobOutcome, error_state: String) -> Self {
        Self {
            job,
            outcome,
            error_state,
            finished_at: Utc::now(),
        }
    }

    /// True for completed jobs.
    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Completed
    }
}

/// Fixed-capacity, most-recent-first list. Pushing onto a full history drops the oldest entry.
#[derive(Debug, Clone)]
pub struct History<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> History<T> {
    /// Empty history holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert at the front, evicting from the back when full.
    pub fn push(&mut self, entry: T) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    /// Entries, newest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

/// Externally observable run status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "run_status")]
pub enum RunStatus {
    /// No job active.
    Idle,
    /// A job is being processed.
    Running {
        /// Sample of the recipe in progress, empty between recipes.
        active_sample_id: String,
        /// Seconds elapsed in the current recipe.
        run_time: u64,
        /// Measuring time of the current recipe.
        run_time_target: u64,
    },
}

/// The job being processed and its progress.
#[derive(Debug, Clone)]
struct ActiveRun {
    job: Job,
    active_sample_id: String,
    run_time: u64,
    run_time_target: u64,
}

impl ActiveRun {
    fn status(&self) -> RunStatus {
        RunStatus::Running {
            active_sample_id: self.active_sample_id.clone(),
            run_time: self.run_time,
            run_time_target: self.run_time_target,
        }
    }
}

/// Consistent copy of the whole runner state.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    /// Pending jobs, next first.
    pub queue: Vec<Job>,
    /// Job being processed.
    pub active_job: Option<Job>,
    /// Completed jobs, newest first.
    pub done: Vec<JobRecord>,
    /// Failed and aborted jobs, newest first.
    pub failed: Vec<JobRecord>,
    /// Whether an abort is pending.
    pub abort_requested: bool,
    /// Run status, flattened into the document.
    #[serde(flatten)]
    pub status: RunStatus,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<Job>,
    active: Option<ActiveRun>,
    done: History<JobRecord>,
    failed: History<JobRecord>,
    abort: bool,
}

/// The runner's only shared mutable state.
#[derive(Debug)]
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    /// Idle state with empty histories of `history_capacity` entries.
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                active: None,
                done: History::new(history_capacity),
                failed: History::new(history_capacity),
                abort: false,
            }),
        }
    }

    /// Append a job to the back of the queue.
    pub fn enqueue(&self, job: Job) {
        self.inner.lock().queue.push_back(job);
    }

    /// Request an abort.
    pub fn request_abort(&self) {
        self.inner.lock().abort = true;
    }

    /// Clear the abort flag.
    pub fn clear_abort(&self) {
        self.inner.lock().abort = false;
    }

    /// Whether an abort is pending.
    pub fn abort_requested(&self) -> bool {
        self.inner.lock().abort
    }

    /// Pop the next job and make it active.
    ///
    /// Returns `None` (and leaves the queue alone) when the queue is empty, a job is
    /// already active, or an abort is pending.
    pub fn begin_next_job(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        if inner.abort || inner.active.is_some() {
            return None;
        }
        let job = inner.queue.pop_front()?;
        inner.active = Some(ActiveRun {
            job: job.clone(),
            active_sample_id: String::new(),
            run_time: 0,
            run_time_target: 0,
        });
        Some(job)
    }

    /// Pop the next job without starting it, when an abort is pending and no job
    /// is active.
    pub fn take_job_on_abort(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        if !inner.abort || inner.active.is_some() {
            return None;
        }
        inner.queue.pop_front()
    }

    /// Mark a recipe as started: sample id, target and a reset elapsed counter.
    pub fn begin_recipe(&self, sample_id: &str, run_time_target: u64) {
        if let Some(active) = self.inner.lock().active.as_mut() {
            active.active_sample_id = sample_id.to_string();
            active.run_time = 0;
            active.run_time_target = run_time_target;
        }
    }

    /// Advance the elapsed counter of the running recipe by one second.
    pub fn tick_run_time(&self) {
        if let Some(active) = self.inner.lock().active.as_mut() {
            active.run_time += 1;
        }
    }

    /// File the record in the matching history and return to Idle.
    pub fn finish_job(&self, record: JobRecord) {
        let mut inner = self.inner.lock();
        if record.is_success() {
            inner.done.push(record);
        } else {
            inner.failed.push(record);
        }
        inner.active = None;
    }

    /// If an abort is pending: drop the whole queue and clear the flag.
    ///
    /// Returns the number of dropped jobs, or `None` when no abort was pending.
    pub fn drain_on_abort(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        if !inner.abort {
            return None;
        }
        let dropped = inner.queue.len();
        inner.queue.clear();
        inner.abort = false;
        Some(dropped)
    }

    /// Current status.
    pub fn status(&self) -> RunStatus {
        self.inner
            .lock()
            .active
            .as_ref()
            .map_or(RunStatus::Idle, ActiveRun::status)
    }

    /// Deep copy of everything, taken under a single lock.
    pub fn snapshot(&self) -> RunnerSnapshot {
        let inner = self.inner.lock();
        RunnerSnapshot {
            queue: inner.queue.iter().cloned().collect(),
            active_job: inner.active.as_ref().map(|a| a.job.clone()),
            done: inner.done.to_vec(),
            failed: inner.failed.to_vec(),
            abort_requested: inner.abort,
            status: inner
                .active
                .as_ref()
                .map_or(RunStatus::Idle, ActiveRun::status),
        }
    }
}
