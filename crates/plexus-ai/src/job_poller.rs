//! Submit-then-poll driver for queue-style backends.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{PlexusError, PlexusErrorCode};

pub const DEFAULT_MAX_RETRIES: u32 = 60;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Unknown(String),
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "IN_QUEUE" | "QUEUED" => JobStatus::Queued,
            "IN_PROGRESS" => JobStatus::InProgress,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" | "ERROR" => JobStatus::Failed,
            _ => JobStatus::Unknown(raw.to_string()),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::InProgress)
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Queued => "IN_QUEUE",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Unknown(raw) => raw.as_str(),
        }
    }
}

/// Client-side record of one remote job.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncJob {
    pub id: String,
    pub status: JobStatus,
    pub result: Option<Value>,
}

impl AsyncJob {
    pub fn submitted(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPollerConfig {
    pub max_retries: u32,
    #[serde(with = "duration_millis", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
}

impl Default for JobPollerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Blocking queue protocol: submit a payload, query a status, fetch a result.
pub trait JobQueue {
    fn submit_job(&self, payload: &Value) -> Result<String, PlexusError>;
    fn job_status(&self, job_id: &str) -> Result<JobStatus, PlexusError>;
    fn fetch_job_result(&self, job_id: &str) -> Result<Value, PlexusError>;
}

#[async_trait]
pub trait AsyncJobQueue: Send + Sync {
    async fn submit_job(&self, payload: &Value) -> Result<String, PlexusError>;
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, PlexusError>;
    async fn fetch_job_result(&self, job_id: &str) -> Result<Value, PlexusError>;
}

enum PollStep {
    Fetch,
    Sleep,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobPoller {
    config: JobPollerConfig,
}

impl JobPoller {
    pub fn new(config: JobPollerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JobPollerConfig {
        &self.config
    }

    /// Submits `payload` and waits for the job's result.
    pub fn run_blocking<Q: JobQueue + ?Sized>(
        &self,
        queue: &Q,
        payload: &Value,
    ) -> Result<AsyncJob, PlexusError> {
        let job_id = queue.submit_job(payload)?;
        info!(job_id = %job_id, "job submitted");
        let mut job = AsyncJob::submitted(job_id);
        self.wait_blocking(queue, &mut job)?;
        Ok(job)
    }

    pub async fn run<Q: AsyncJobQueue + ?Sized>(
        &self,
        queue: &Q,
        payload: &Value,
    ) -> Result<AsyncJob, PlexusError> {
        let job_id = queue.submit_job(payload).await?;
        info!(job_id = %job_id, "job submitted");
        let mut job = AsyncJob::submitted(job_id);
        self.wait(queue, &mut job).await?;
        Ok(job)
    }

    /// Polls until the job completes, fails, or `max_retries` status queries
    /// have returned a pending status. The job's status tracks the last
    /// observation.
    pub fn wait_blocking<Q: JobQueue + ?Sized>(
        &self,
        queue: &Q,
        job: &mut AsyncJob,
    ) -> Result<(), PlexusError> {
        for attempt in 1..=self.config.max_retries {
            let status = queue.job_status(&job.id)?;
            match self.next_step(job, status, attempt)? {
                PollStep::Fetch => {
                    job.result = Some(queue.fetch_job_result(&job.id)?);
                    return Ok(());
                }
                PollStep::Sleep => {
                    if !self.config.retry_delay.is_zero() {
                        std::thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }
        Err(self.timeout_error(job))
    }

    pub async fn wait<Q: AsyncJobQueue + ?Sized>(
        &self,
        queue: &Q,
        job: &mut AsyncJob,
    ) -> Result<(), PlexusError> {
        for attempt in 1..=self.config.max_retries {
            let status = queue.job_status(&job.id).await?;
            match self.next_step(job, status, attempt)? {
                PollStep::Fetch => {
                    job.result = Some(queue.fetch_job_result(&job.id).await?);
                    return Ok(());
                }
                PollStep::Sleep => {
                    if !self.config.retry_delay.is_zero() {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err(self.timeout_error(job))
    }

    fn next_step(
        &self,
        job: &mut AsyncJob,
        status: JobStatus,
        attempt: u32,
    ) -> Result<PollStep, PlexusError> {
        debug!(job_id = %job.id, attempt, status = status.as_str(), "job status");
        match status {
            JobStatus::Completed => {
                job.status = JobStatus::Completed;
                Ok(PollStep::Fetch)
            }
            pending if pending.is_pending() => {
                job.status = pending;
                Ok(PollStep::Sleep)
            }
            unexpected => {
                let observed = unexpected.as_str().to_string();
                job.status = JobStatus::Failed;
                warn!(job_id = %job.id, status = %observed, "job ended with unexpected status");
                Err(PlexusError::new(
                    PlexusErrorCode::JobUnexpectedStatus,
                    format!("Job {} reported unexpected status {observed}", job.id),
                )
                .with_details(json!({
                    "jobId": job.id,
                    "status": observed,
                })))
            }
        }
    }

    fn timeout_error(&self, job: &AsyncJob) -> PlexusError {
        warn!(job_id = %job.id, max_retries = self.config.max_retries, "job polling exhausted");
        PlexusError::new(
            PlexusErrorCode::JobPollTimeout,
            format!(
                "Job {} did not complete after {} status checks",
                job.id, self.config.max_retries
            ),
        )
        .with_details(json!({
            "jobId": job.id,
            "attempts": self.config.max_retries,
            "lastStatus": job.status.as_str(),
        }))
    }
}
