//! Bulk AI-evaluation job control.
//!
//! A job moves `Idle -> Submitting -> Polling -> {Settled | Cancelled | TimedOut}`.
//! Submission is a single POST; progress is then polled on a fixed interval
//! until the counters report nothing pending. The completion hook runs once
//! per settled job, after a short grace delay.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use garde::Validate;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::models::job::{BulkEvaluationJob, JobPhase, JobProgress, OrchestratorSnapshot};
use crate::services::evaluation::{EvaluationApi, EvaluationError};
use crate::services::polling::PollingHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    /// Pause between observing a settled job and running the completion hook.
    pub settle_grace: Duration,
    /// `None` polls until settled or cancelled.
    pub max_poll_duration: Option<Duration>,
    /// Consecutive poll failures before the job is flagged as stalled.
    pub stall_threshold: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            settle_grace: Duration::from_secs(1),
            max_poll_duration: Some(Duration::from_secs(30 * 60)),
            stall_threshold: 5,
        }
    }
}

/// Side effect for a settled job: refresh dependent data and take the user
/// to the results for `job_key`.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_settled(&self, job_key: &str, progress: &JobProgress);
}

#[async_trait]
impl<T: CompletionHook + ?Sized> CompletionHook for Arc<T> {
    async fn on_settled(&self, job_key: &str, progress: &JobProgress) {
        (**self).on_settled(job_key, progress).await
    }
}

struct JobState {
    epoch: u64,
    phase: JobPhase,
    job_key: Option<String>,
    progress: Option<JobProgress>,
    consecutive_failures: u32,
    stalled: bool,
    last_error: Option<String>,
    polling: PollingHandle,
}

impl JobState {
    fn snapshot(&self) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            phase: self.phase,
            job_key: self.job_key.clone(),
            progress: self.progress,
            consecutive_failures: self.consecutive_failures,
            stalled: self.stalled,
            last_error: self.last_error.clone(),
            updated_at: Utc::now(),
        }
    }
}

enum PollOutcome {
    Continue,
    Settled(JobProgress),
    /// The job this loop belongs to is no longer current.
    Stale,
    Abandoned,
}

struct Shared<A> {
    api: A,
    hook: Arc<dyn CompletionHook>,
    config: OrchestratorConfig,
    state: Mutex<JobState>,
    snapshots: watch::Sender<OrchestratorSnapshot>,
}

/// Drives one bulk evaluation at a time. Dropping the orchestrator cancels
/// any job it is still polling.
pub struct BulkEvaluationOrchestrator<A: EvaluationApi + 'static> {
    shared: Arc<Shared<A>>,
}

impl<A: EvaluationApi + 'static> BulkEvaluationOrchestrator<A> {
    pub fn new(api: A, hook: impl CompletionHook + 'static, config: OrchestratorConfig) -> Self {
        let (snapshots, _) = watch::channel(OrchestratorSnapshot::idle());
        Self {
            shared: Arc::new(Shared {
                api,
                hook: Arc::new(hook),
                config,
                state: Mutex::new(JobState {
                    epoch: 0,
                    phase: JobPhase::Idle,
                    job_key: None,
                    progress: None,
                    consecutive_failures: 0,
                    stalled: false,
                    last_error: None,
                    polling: PollingHandle::new(),
                }),
                snapshots,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorSnapshot> {
        self.shared.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> OrchestratorSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn phase(&self) -> JobPhase {
        self.shared.lock().phase
    }

    /// Submit `job` and start polling its progress.
    ///
    /// Fails without touching the network when the job has no prompt or no
    /// candidates, and with [`OrchestratorError::Busy`] while another job is
    /// submitting, polling, or settled but still waiting to run its
    /// completion hook. A rejected submission returns the orchestrator to
    /// `Idle`.
    pub async fn submit(&self, job: BulkEvaluationJob) -> Result<(), OrchestratorError> {
        job.validate()?;

        let epoch = self.shared.begin_submission(&job.job_key)?;
        let _guard = SubmissionGuard {
            shared: &self.shared,
            epoch,
        };

        tracing::info!(
            job_key = %job.job_key,
            prompt_id = %job.prompt_id,
            candidates = job.candidate_ids.len(),
            epoch,
            "Submitting bulk evaluation"
        );

        match self.shared.api.submit_bulk_evaluation(&job).await {
            Ok(()) => Shared::start_polling(&self.shared, epoch, job.job_key),
            Err(e) => {
                self.shared.submission_failed(epoch, &e);
                Err(OrchestratorError::Submission(e))
            }
        }
    }

    /// Stop polling and discard anything still in flight. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

impl<A: EvaluationApi + 'static> Drop for BulkEvaluationOrchestrator<A> {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

/// Resets a submission whose future was dropped before the POST resolved.
struct SubmissionGuard<'a, A> {
    shared: &'a Shared<A>,
    epoch: u64,
}

impl<A> Drop for SubmissionGuard<'_, A> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.epoch == self.epoch && state.phase == JobPhase::Submitting {
            state.phase = JobPhase::Idle;
            self.shared.publish(&state);
        }
    }
}

impl<A> Shared<A> {
    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &JobState) {
        self.snapshots.send_replace(state.snapshot());
    }

    fn begin_submission(&self, job_key: &str) -> Result<u64, OrchestratorError> {
        let mut state = self.lock();
        // A settled job with a live loop has not run its completion hook yet.
        let awaiting_hook = state.phase == JobPhase::Settled && state.polling.is_active();
        if state.phase.is_active() || awaiting_hook {
            return Err(OrchestratorError::Busy { phase: state.phase });
        }

        state.polling.stop();
        state.epoch += 1;
        state.phase = JobPhase::Submitting;
        state.job_key = Some(job_key.to_string());
        state.progress = None;
        state.consecutive_failures = 0;
        state.stalled = false;
        state.last_error = None;
        self.publish(&state);
        Ok(state.epoch)
    }

    fn submission_failed(&self, epoch: u64, error: &EvaluationError) {
        tracing::warn!(error = %error, epoch, "Bulk evaluation submission failed");
        let mut state = self.lock();
        if state.epoch == epoch && state.phase == JobPhase::Submitting {
            state.phase = JobPhase::Idle;
            state.last_error = Some(error.to_string());
            self.publish(&state);
        }
    }

    fn cancel(&self) {
        let mut state = self.lock();
        let stopped = state.polling.stop();
        // A settled job whose loop is still live is waiting out the grace
        // delay; cancelling it suppresses the completion hook.
        let cancellable =
            state.phase.is_active() || (state.phase == JobPhase::Settled && stopped);
        if !cancellable {
            return;
        }

        tracing::info!(
            job_key = state.job_key.as_deref().unwrap_or_default(),
            from = %state.phase,
            "Bulk evaluation cancelled"
        );
        state.phase = JobPhase::Cancelled;
        self.publish(&state);
    }

    fn release(&self, epoch: u64) {
        self.lock().polling.release(epoch);
    }

    fn is_current(&self, epoch: u64, phase: JobPhase) -> bool {
        let state = self.lock();
        state.epoch == epoch && state.phase == phase
    }

    fn record_poll(
        &self,
        epoch: u64,
        result: Result<JobProgress, EvaluationError>,
    ) -> PollOutcome {
        let mut state = self.lock();
        if state.epoch != epoch || state.phase != JobPhase::Polling {
            tracing::debug!(epoch, "Discarding poll response for inactive job");
            return PollOutcome::Stale;
        }

        match result {
            Ok(progress) => {
                metrics::counter!("bulk_evaluation_polls_total", "outcome" => "ok").increment(1);
                tracing::debug!(
                    job_key = state.job_key.as_deref().unwrap_or_default(),
                    total = progress.total,
                    completed = progress.completed,
                    failed = progress.failed,
                    pending = progress.pending,
                    "Bulk evaluation progress"
                );

                state.progress = Some(progress);
                state.consecutive_failures = 0;
                state.stalled = false;
                state.last_error = None;

                if progress.is_settled() {
                    state.phase = JobPhase::Settled;
                    self.publish(&state);
                    return PollOutcome::Settled(progress);
                }

                self.publish(&state);
                PollOutcome::Continue
            }
            Err(e) if e.is_session_invalidated() => {
                tracing::warn!(
                    job_key = state.job_key.as_deref().unwrap_or_default(),
                    "Session invalidated while polling, abandoning job"
                );
                state.phase = JobPhase::Cancelled;
                state.last_error = Some(e.to_string());
                state.polling.release(epoch);
                self.publish(&state);
                PollOutcome::Abandoned
            }
            Err(e) => {
                metrics::counter!("bulk_evaluation_polls_total", "outcome" => "error").increment(1);
                state.consecutive_failures += 1;
                state.last_error = Some(e.to_string());

                tracing::warn!(
                    job_key = state.job_key.as_deref().unwrap_or_default(),
                    consecutive_failures = state.consecutive_failures,
                    error = %e,
                    "Progress poll failed, will retry on next tick"
                );

                if !state.stalled && state.consecutive_failures >= self.config.stall_threshold {
                    state.stalled = true;
                    tracing::error!(
                        job_key = state.job_key.as_deref().unwrap_or_default(),
                        consecutive_failures = state.consecutive_failures,
                        "Bulk evaluation appears stalled"
                    );
                }

                self.publish(&state);
                PollOutcome::Continue
            }
        }
    }

    fn time_out(&self, epoch: u64, elapsed: Duration) {
        let mut state = self.lock();
        if state.epoch != epoch || state.phase != JobPhase::Polling {
            return;
        }

        tracing::warn!(
            job_key = state.job_key.as_deref().unwrap_or_default(),
            elapsed_secs = elapsed.as_secs(),
            "Bulk evaluation polling timed out"
        );
        state.phase = JobPhase::TimedOut;
        state.last_error = Some(format!(
            "job did not settle within {} seconds",
            elapsed.as_secs()
        ));
        state.polling.release(epoch);
        self.publish(&state);
    }
}

impl<A: EvaluationApi + 'static> Shared<A> {
    fn start_polling(
        this: &Arc<Self>,
        epoch: u64,
        job_key: String,
    ) -> Result<(), OrchestratorError> {
        let mut state = this.lock();
        if state.epoch != epoch || state.phase != JobPhase::Submitting {
            return Err(OrchestratorError::Cancelled);
        }

        state.phase = JobPhase::Polling;
        this.publish(&state);

        let task = tokio::spawn(Arc::clone(this).poll_loop(epoch, job_key));
        state.polling.start(epoch, task);
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>, epoch: u64, job_key: String) {
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let started = Instant::now();
        let mut ticker = time::interval_at(started + period, period);
        // Ticks missed while a poll is outstanding are dropped, never queued.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if let Some(limit) = self.config.max_poll_duration {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    self.time_out(epoch, elapsed);
                    return;
                }
            }

            let result = self.api.fetch_progress(&job_key).await;
            match self.record_poll(epoch, result) {
                PollOutcome::Continue => continue,
                PollOutcome::Settled(progress) => {
                    self.complete(epoch, job_key, progress).await;
                    return;
                }
                PollOutcome::Stale | PollOutcome::Abandoned => return,
            }
        }
    }

    async fn complete(&self, epoch: u64, job_key: String, progress: JobProgress) {
        metrics::counter!("bulk_evaluation_settled_total").increment(1);
        tracing::info!(
            job_key = %job_key,
            completed = progress.completed,
            failed = progress.failed,
            "Bulk evaluation settled"
        );

        time::sleep(self.config.settle_grace).await;

        if !self.is_current(epoch, JobPhase::Settled) {
            return;
        }
        // From here on the hook runs to completion even if cancel() arrives.
        self.release(epoch);
        self.hook.on_settled(&job_key, &progress).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Bulk evaluation preconditions not met: {0}")]
    Precondition(#[from] garde::Report),

    #[error("A bulk evaluation is already {phase}")]
    Busy { phase: JobPhase },

    #[error("Bulk evaluation submission failed: {0}")]
    Submission(#[source] EvaluationError),

    #[error("Bulk evaluation was cancelled before polling started")]
    Cancelled,
}
