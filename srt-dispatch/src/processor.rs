//! Job processing seam.
//!
//! Workers only know the [`Processor`] trait. The production implementation
//! forwards the job to the conversion function over HTTP; quota checks,
//! storage and history live behind that endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use url::Url;

use crate::notify::Notifier;
use crate::queue::{ConversionMessage, LambdaResponse};

/// Turns a job into a result envelope.
///
/// Jobs are requeued on error, so implementations must tolerate seeing the
/// same job more than once.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: ConversionMessage) -> Result<LambdaResponse>;
}

/// Calls the conversion function through its HTTP endpoint.
pub struct HttpProcessor {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpProcessor {
    pub fn new(client: Client, endpoint: Url, timeout: Duration) -> Self {
        Self {
            client,
            endpoint,
            timeout,
        }
    }
}

#[async_trait]
impl Processor for HttpProcessor {
    async fn process(&self, job: ConversionMessage) -> Result<LambdaResponse> {
        info!(
            file_id = %job.file_id,
            user_id = %job.user_id,
            file_size = job.file_size,
            file_duration = job.file_duration,
            "conversion_request_starting"
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .json(&job)
            .send()
            .await
            .context("conversion request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("conversion endpoint returned {status}");
        }

        let result: LambdaResponse = response
            .json()
            .await
            .context("conversion endpoint returned an invalid result")?;

        info!(
            file_id = %job.file_id,
            status_code = result.status_code,
            "conversion_request_complete"
        );

        Ok(result)
    }
}

/// Sends a completion notification after every successful conversion.
///
/// The notification runs in a background task so the worker can acknowledge
/// the job without waiting on the mail provider. Call [`drain`] before the
/// runtime goes away so pending notifications are delivered.
///
/// [`drain`]: NotifyingProcessor::drain
pub struct NotifyingProcessor<P> {
    inner: P,
    notifier: Arc<dyn Notifier>,
    pending: TaskTracker,
}

impl<P: Processor> NotifyingProcessor<P> {
    pub fn new(inner: P, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            inner,
            notifier,
            pending: TaskTracker::new(),
        }
    }

    /// Wait for every notification started so far.
    pub async fn drain(&self) {
        self.pending.close();
        info!(pending = self.pending.len(), "notifications_draining");
        self.pending.wait().await;
        self.pending.reopen();
    }
}

#[async_trait]
impl<P: Processor> Processor for NotifyingProcessor<P> {
    async fn process(&self, job: ConversionMessage) -> Result<LambdaResponse> {
        let email = job.email.clone();
        let file_name = job.file_name.clone();
        let file_id = job.file_id.clone();

        let result = self.inner.process(job).await?;

        if result.is_success() && !email.is_empty() {
            let notifier = Arc::clone(&self.notifier);
            let srt_url = result.body.srt_url.clone();
            self.pending.spawn(async move {
                if let Err(e) = notifier.notify(&email, &file_name, &srt_url).await {
                    error!(file_id = %file_id, error = %e, "notification_failed");
                }
            });
        }

        Ok(result)
    }
}
