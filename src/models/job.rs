use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::Display;

/// A batch AI-evaluation request: one prompt applied to a fixed snapshot of
/// candidates for one hiring form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BulkEvaluationJob {
    #[garde(length(min = 1))]
    pub job_key: String,

    #[garde(length(min = 1))]
    pub prompt_id: String,

    #[garde(length(min = 1), inner(length(min = 1)))]
    pub candidate_ids: Vec<String>,
}

impl BulkEvaluationJob {
    /// Snapshot the candidate list; later changes to the source do not affect the job.
    pub fn new(
        job_key: impl Into<String>,
        prompt_id: impl Into<String>,
        candidate_ids: &[impl AsRef<str>],
    ) -> Self {
        Self {
            job_key: job_key.into(),
            prompt_id: prompt_id.into(),
            candidate_ids: candidate_ids
                .iter()
                .map(|id| id.as_ref().to_string())
                .collect(),
        }
    }
}

/// Server-side progress counters for a bulk evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
}

impl JobProgress {
    pub fn processed(&self) -> u64 {
        self.completed.saturating_add(self.failed)
    }

    /// Nothing pending and at least one candidate processed.
    /// `total` is deliberately ignored; a zeroed snapshot never settles.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.processed() > 0
    }

    /// `(completed + failed) / total` as a percentage, capped at 100.
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.processed() as f64 / self.total as f64 * 100.0).min(100.0)
    }
}

/// Lifecycle of one orchestrator job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum JobPhase {
    Idle,
    Submitting,
    Polling,
    Settled,
    Cancelled,
    TimedOut,
}

impl JobPhase {
    /// Phases in which a job is in flight and a new submission must be refused.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Submitting | Self::Polling)
    }
}

/// Observable orchestrator state, published on every transition and poll.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSnapshot {
    pub phase: JobPhase,
    pub job_key: Option<String>,
    pub progress: Option<JobProgress>,
    pub consecutive_failures: u32,
    pub stalled: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OrchestratorSnapshot {
    pub fn idle() -> Self {
        Self {
            phase: JobPhase::Idle,
            job_key: None,
            progress: None,
            consecutive_failures: 0,
            stalled: false,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn percent_complete(&self) -> f64 {
        self.progress.map(|p| p.percent_complete()).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(total: u64, completed: u64, failed: u64, pending: u64) -> JobProgress {
        JobProgress {
            total,
            completed,
            failed,
            pending,
        }
    }

    #[test]
    fn test_settles_when_nothing_pending() {
        assert!(progress(3, 2, 1, 0).is_settled());
        assert!(progress(3, 0, 3, 0).is_settled());
    }

    #[test]
    fn test_does_not_settle_while_pending() {
        assert!(!progress(3, 1, 0, 2).is_settled());
    }

    #[test]
    fn test_does_not_settle_on_zero_total() {
        assert!(!progress(0, 0, 0, 0).is_settled());
    }

    #[test]
    fn test_settles_even_if_total_disagrees() {
        assert!(progress(10, 2, 0, 0).is_settled());
    }

    #[test]
    fn test_percent_complete() {
        assert_eq!(progress(0, 0, 0, 0).percent_complete(), 0.0);
        assert_eq!(progress(4, 1, 1, 2).percent_complete(), 50.0);
        assert_eq!(progress(3, 2, 1, 0).percent_complete(), 100.0);
        assert_eq!(progress(2, 3, 0, 0).percent_complete(), 100.0);
    }

    #[test]
    fn test_progress_deserializes_server_shape() {
        let p: JobProgress =
            serde_json::from_str(r#"{"total":3,"completed":1,"failed":0,"pending":2}"#).unwrap();
        assert_eq!(p, progress(3, 1, 0, 2));
    }

    #[test]
    fn test_job_validation() {
        let ok = BulkEvaluationJob::new("J1", "P1", &["c1", "c2"]);
        assert!(ok.validate().is_ok());

        let no_candidates = BulkEvaluationJob::new("J1", "P1", &[] as &[&str]);
        assert!(no_candidates.validate().is_err());

        let no_prompt = BulkEvaluationJob::new("J1", "", &["c1"]);
        assert!(no_prompt.validate().is_err());

        let blank_candidate = BulkEvaluationJob::new("J1", "P1", &["c1", ""]);
        assert!(blank_candidate.validate().is_err());
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let job = BulkEvaluationJob::new("J1", "P1", &["c1"]);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "jobKey": "J1", "promptId": "P1", "candidateIds": ["c1"] })
        );
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(JobPhase::TimedOut.to_string(), "timed_out");
        assert!(!JobPhase::Cancelled.is_active());
        assert!(JobPhase::Polling.is_active());
        assert!(!JobPhase::Idle.is_active());
    }
}
