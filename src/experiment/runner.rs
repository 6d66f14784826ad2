//! The job runner.
//!
//! One supervising task owns the pending queue and drives jobs through it, strictly
//! FIFO and one at a time. Each iteration of the loop:
//!
//! 1. pops the next job and makes it active; with an abort pending the job is
//!    filed as aborted without touching the hardware
//! 2. runs its recipes in order, each on its own task, while ticking once per
//!    second: the elapsed counter advances and a pending abort is forwarded to
//!    the hardware on a detached task, so a silent daemon never stalls the tick
//! 3. records the outcome (persisted first, then filed into the done or failed
//!    history) and returns to Idle
//! 4. if the abort flag is still set, drops the whole queue, clears the flag and
//!    resumes the hardware
//!
//! Abort is cooperative. The recipe task is never killed; it ends once the daemons
//! stop confirming its requests. Shutdown (the [`CancellationToken`]) is the only
//! path that aborts a recipe task.
//!
//! External callers interact through the cloneable [`RunnerHandle`].

use crate::config::{RecipeFailurePolicy, RunnerConfig};
use crate::data::storage::DataSerializer;
use crate::error::{InvalidJob, RunError};
use crate::experiment::executor::spawn_recipe;
use crate::experiment::recipe::{Job, Recipe};
use crate::experiment::state::{JobRecord, RunStatus, RunnerSnapshot, SharedState};
use crate::hardware::setup::HardwareSetup;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cloneable access to a running [`JobRunner`].
#[derive(Clone)]
pub struct RunnerHandle {
    state: Arc<SharedState>,
    shutdown: CancellationToken,
}

impl RunnerHandle {
    /// Validate `job` and append it to the back of the queue.
    pub fn enqueue(&self, job: Job) -> Result<(), InvalidJob> {
        job.validate().map_err(InvalidJob)?;
        info!(job_id = %job.id, recipes = job.recipes.len(), "job queued");
        self.state.enqueue(job);
        Ok(())
    }

    /// Request an abort: the active job stops after its current recipe and the
    /// queue is dropped.
    pub fn abort(&self) {
        warn!("abort requested");
        self.state.request_abort();
    }

    /// Clear a pending abort request.
    pub fn resume(&self) {
        info!("resume requested");
        self.state.clear_abort();
    }

    /// Copy of the queue, histories, abort flag and status.
    pub fn snapshot(&self) -> RunnerSnapshot {
        self.state.snapshot()
    }

    /// The snapshot as the JSON document served to observers.
    pub fn snapshot_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self.state.snapshot())
    }

    /// Current run status.
    pub fn status(&self) -> RunStatus {
        self.state.status()
    }

    /// Stop the runner loop and cancel in-flight work.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Supervising loop that executes queued jobs.
pub struct JobRunner {
    state: Arc<SharedState>,
    setup: Arc<dyn HardwareSetup>,
    serializer: Arc<dyn DataSerializer>,
    config: RunnerConfig,
    shutdown: CancellationToken,
}

impl JobRunner {
    /// Idle runner with an empty queue and its own shutdown token.
    pub fn new(
        setup: Arc<dyn HardwareSetup>,
        serializer: Arc<dyn DataSerializer>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            state: Arc::new(SharedState::new(config.history_capacity)),
            setup,
            serializer,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Use `token` for shutdown, typically shared with the daemon client.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Handle sharing this runner's state and shutdown token.
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Start the loop on a new task.
    pub fn spawn(self) -> (RunnerHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(self) {
        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            history = self.config.history_capacity,
            "job runner started"
        );
        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_once().await;
        }
        info!("job runner stopped");
    }

    /// One loop iteration: run the next job if there is one, then handle a pending abort.
    pub async fn run_once(&self) {
        if let Some(job) = self.state.begin_next_job() {
            let record = self.process_job(job).await;
            self.write_result(record).await;
        } else if let Some(job) = self.state.take_job_on_abort() {
            warn!(job_id = %job.id, "abort pending, job not started");
            let err = RunError::Aborted;
            self.write_result(JobRecord::failed(job, err.outcome(), err.to_string()))
                .await;
        }
        self.handle_abort().await;
    }

    async fn process_job(&self, job: Job) -> JobRecord {
        info!(job_id = %job.id, recipes = job.recipes.len(), "job started");

        if let Err(e) = self.serializer.set_base_folder(&job.id).await {
            let err = RunError::from(e);
            error!(job_id = %job.id, error = %err, "could not prepare job folder");
            return JobRecord::failed(job, err.outcome(), err.to_string());
        }

        let mut first_error: Option<RunError> = None;
        for recipe in &job.recipes {
            if self.shutdown.is_cancelled() {
                first_error.get_or_insert(RunError::Shutdown);
                break;
            }

            self.state
                .begin_recipe(&recipe.sample_id, recipe.measuring_time_sec);
            let result = self.run_recipe_supervised(recipe.clone()).await;

            if self.state.abort_requested() {
                warn!(job_id = %job.id, sample_id = %recipe.sample_id, "job aborted");
                first_error = Some(RunError::Aborted);
                break;
            }
            if let Err(e) = result {
                error!(job_id = %job.id, sample_id = %recipe.sample_id, error = %e, "recipe failed");
                first_error.get_or_insert(e);
                if self.config.on_recipe_failure == RecipeFailurePolicy::AbortJob {
                    break;
                }
            }
        }

        match first_error {
            None => {
                info!(job_id = %job.id, "job completed");
                JobRecord::completed(job)
            }
            Some(e) => JobRecord::failed(job, e.outcome(), e.to_string()),
        }
    }

    /// Run one recipe on its own task while ticking the status.
    async fn run_recipe_supervised(&self, recipe: Recipe) -> Result<(), RunError> {
        let mut task = spawn_recipe(recipe, self.setup.clone(), self.serializer.clone());
        let tick = self.config.tick;
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut abort_forwarded = false;

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(_) => Err(RunError::Shutdown),
                    };
                }
                _ = ticker.tick() => {
                    self.state.tick_run_time();
                    if !abort_forwarded && self.state.abort_requested() {
                        abort_forwarded = true;
                        warn!("forwarding abort to hardware");
                        let setup = self.setup.clone();
                        tokio::spawn(async move {
                            if let Err(e) = setup.abort().await {
                                error!(error = %e, "hardware abort failed");
                            }
                        });
                    }
                }
                _ = self.shutdown.cancelled() => {
                    warn!("shutdown during recipe, cancelling it");
                    task.abort();
                    if let Err(e) = task.await {
                        if e.is_panic() {
                            std::panic::resume_unwind(e.into_panic());
                        }
                    }
                    return Err(RunError::Shutdown);
                }
            }
        }
    }

    /// Persist the record, then file it into history and return to Idle.
    async fn write_result(&self, record: JobRecord) {
        if let Err(e) = self.serializer.save_job_record(&record).await {
            error!(job_id = %record.job.id, error = %e, "failed to persist job record");
        }
        debug!(job_id = %record.job.id, outcome = ?record.outcome, "job finalized");
        self.state.finish_job(record);
    }

    async fn handle_abort(&self) {
        if !self.state.abort_requested() {
            return;
        }
        if let Err(e) = self.setup.resume().await {
            error!(error = %e, "hardware resume failed");
        }
        if let Some(dropped) = self.state.drain_on_abort() {
            warn!(dropped, "abort handled, queue cleared");
        }
    }
}
