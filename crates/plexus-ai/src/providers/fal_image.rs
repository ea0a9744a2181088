use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::common::{auth_headers, HttpClients};
use crate::adapter::{AdapterConfig, ProviderAdapter};
use crate::batch::BatchScheduler;
use crate::error::{PlexusError, PlexusErrorCode};
use crate::job_poller::{AsyncJob, AsyncJobQueue, JobPoller, JobPollerConfig, JobQueue, JobStatus};
use crate::stream::{BlockingTextStream, TextStream};
use crate::types::{Conversation, Message, PredictOptions, Role};
use crate::usage::UsageStats;

pub const FAL_CREDENTIAL_ENV: &str = "FAL_KEY";

/// Text-to-image generation over fal.ai's request queue.
///
/// Each image is one queued job: submit, poll its status until it completes,
/// then fetch the result and return the first image URL.
pub struct FalImageAdapter {
    model: String,
    http: HttpClients,
    poller: JobPoller,
}

impl FalImageAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, PlexusError> {
        let resolved = config.validated(FAL_CREDENTIAL_ENV)?;
        let http = HttpClients::new(
            "fal",
            &resolved.base_url,
            auth_headers("Key", &resolved.api_key)?,
        )?;
        info!(provider = "fal", model = %resolved.model, "image adapter ready");
        Ok(Self {
            model: resolved.model,
            http,
            poller: JobPoller::default(),
        })
    }

    pub fn with_poller(mut self, config: JobPollerConfig) -> Self {
        self.poller = JobPoller::new(config);
        self
    }

    pub fn poller(&self) -> &JobPoller {
        &self.poller
    }

    pub fn generate_image(&self, prompt: &str) -> Result<String, PlexusError> {
        self.generate_image_with(prompt, &Map::new())
    }

    /// `parameters` are merged into the request body next to `prompt`
    /// (for example `image_size` or `seed`).
    pub fn generate_image_with(
        &self,
        prompt: &str,
        parameters: &Map<String, Value>,
    ) -> Result<String, PlexusError> {
        let job = self.poller.run_blocking(self, &image_payload(prompt, parameters))?;
        image_url(&job)
    }

    pub async fn agenerate_image(&self, prompt: &str) -> Result<String, PlexusError> {
        self.agenerate_image_with(prompt, &Map::new()).await
    }

    pub async fn agenerate_image_with(
        &self,
        prompt: &str,
        parameters: &Map<String, Value>,
    ) -> Result<String, PlexusError> {
        let job = self.poller.run(self, &image_payload(prompt, parameters)).await?;
        image_url(&job)
    }

    /// One image per prompt, generated one after another.
    pub fn batch_images(&self, prompts: &[String]) -> Result<Vec<String>, PlexusError> {
        prompts
            .iter()
            .map(|prompt| self.generate_image(prompt))
            .collect()
    }

    /// One image per prompt with at most `max_concurrent` jobs in flight.
    /// URLs come back in prompt order.
    pub async fn abatch_images(
        &self,
        prompts: Vec<String>,
        max_concurrent: usize,
    ) -> Result<Vec<String>, PlexusError> {
        BatchScheduler::new(max_concurrent)
            .try_run_all(prompts, |prompt| async move { self.agenerate_image(&prompt).await })
            .await
    }

    fn status_path(&self, job_id: &str) -> String {
        format!("{}/requests/{job_id}/status?logs=1", self.model)
    }

    fn result_path(&self, job_id: &str) -> String {
        format!("{}/requests/{job_id}", self.model)
    }
}

fn image_payload(prompt: &str, parameters: &Map<String, Value>) -> Value {
    let mut payload = parameters.clone();
    payload.insert("prompt".to_string(), Value::String(prompt.to_string()));
    Value::Object(payload)
}

fn request_id(body: &Value) -> Result<String, PlexusError> {
    body.get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            PlexusError::new(
                PlexusErrorCode::ProviderProtocol,
                "fal queue submission returned no request_id",
            )
            .with_details(json!({ "body": body }))
        })
}

fn parse_status(body: &Value) -> Result<JobStatus, PlexusError> {
    body.get("status")
        .and_then(Value::as_str)
        .map(JobStatus::parse)
        .ok_or_else(|| {
            PlexusError::new(
                PlexusErrorCode::ProviderProtocol,
                "fal status response has no status",
            )
            .with_details(json!({ "body": body }))
        })
}

fn image_url(job: &AsyncJob) -> Result<String, PlexusError> {
    job.result
        .as_ref()
        .and_then(|result| result.get("images"))
        .and_then(Value::as_array)
        .and_then(|images| images.first())
        .and_then(|image| image.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            PlexusError::new(
                PlexusErrorCode::ProviderProtocol,
                format!("fal job {} result has no image URL", job.id),
            )
            .with_details(json!({ "jobId": job.id, "result": job.result }))
        })
}

impl JobQueue for FalImageAdapter {
    fn submit_job(&self, payload: &Value) -> Result<String, PlexusError> {
        let (response, _) = self.http.post_blocking(&self.model, payload)?;
        request_id(&self.http.read_json_blocking(response)?)
    }

    fn job_status(&self, job_id: &str) -> Result<JobStatus, PlexusError> {
        let (response, _) = self.http.get_blocking(&self.status_path(job_id))?;
        parse_status(&self.http.read_json_blocking(response)?)
    }

    fn fetch_job_result(&self, job_id: &str) -> Result<Value, PlexusError> {
        let (response, _) = self.http.get_blocking(&self.result_path(job_id))?;
        self.http.read_json_blocking(response)
    }
}

#[async_trait]
impl AsyncJobQueue for FalImageAdapter {
    async fn submit_job(&self, payload: &Value) -> Result<String, PlexusError> {
        let (response, _) = self.http.post(&self.model, payload).await?;
        request_id(&self.http.read_json(response).await?)
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, PlexusError> {
        let (response, _) = self.http.get(&self.status_path(job_id)).await?;
        parse_status(&self.http.read_json(response).await?)
    }

    async fn fetch_job_result(&self, job_id: &str) -> Result<Value, PlexusError> {
        let (response, _) = self.http.get(&self.result_path(job_id)).await?;
        self.http.read_json(response).await
    }
}

fn prompt_of(conversation: &Conversation) -> Result<String, PlexusError> {
    conversation
        .last_content(Role::Human)
        .map(str::to_string)
        .ok_or_else(|| {
            PlexusError::new(
                PlexusErrorCode::ConfigurationInvalid,
                "image generation needs a human message to use as the prompt",
            )
        })
}

/// Image jobs report no tokens; the whole wait counts as completion time.
fn image_usage(elapsed: Duration) -> UsageStats {
    UsageStats::new(0, 0, Duration::ZERO, elapsed)
}

fn ignore_chat_options(options: &PredictOptions) {
    if options.toolkit.is_some() {
        debug!(provider = "fal", "image generation ignores the toolkit");
    }
}

/// Treats the latest human message as the prompt and answers with the image URL.
#[async_trait]
impl ProviderAdapter for FalImageAdapter {
    fn provider(&self) -> &str {
        "fal"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn predict(
        &self,
        conversation: &mut Conversation,
        options: &PredictOptions,
    ) -> Result<(), PlexusError> {
        ignore_chat_options(options);
        let prompt = prompt_of(conversation)?;
        let started = Instant::now();
        let url = self.generate_image(&prompt)?;
        conversation.append(Message::assistant(url).with_usage(image_usage(started.elapsed())));
        Ok(())
    }

    async fn apredict(
        &self,
        conversation: &mut Conversation,
        options: &PredictOptions,
    ) -> Result<(), PlexusError> {
        ignore_chat_options(options);
        let prompt = prompt_of(conversation)?;
        let started = Instant::now();
        let url = self.agenerate_image(&prompt).await?;
        conversation.append(Message::assistant(url).with_usage(image_usage(started.elapsed())));
        Ok(())
    }

    fn stream<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        options: &PredictOptions,
    ) -> Result<BlockingTextStream<'a>, PlexusError> {
        ignore_chat_options(options);
        let prompt = prompt_of(conversation)?;
        let started = Instant::now();
        let url = self.generate_image(&prompt)?;
        Ok(BlockingTextStream::ready(
            vec![url],
            Some(image_usage(started.elapsed())),
            conversation,
        ))
    }

    async fn astream<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        options: &'a PredictOptions,
    ) -> Result<TextStream<'a>, PlexusError> {
        ignore_chat_options(options);
        let prompt = prompt_of(conversation)?;
        let started = Instant::now();
        let url = self.agenerate_image(&prompt).await?;
        Ok(TextStream::ready(
            vec![url],
            Some(image_usage(started.elapsed())),
            conversation,
        ))
    }
}
