//! Completion notifications.
//!
//! A requester whose synchronous wait timed out learns about the finished
//! conversion through e-mail.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

const RESEND_EMAILS_URL: &str = "https://api.resend.com/emails";

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Tell `to` that `file_name` has been converted and is available at `srt_url`.
    async fn notify(&self, to: &str, file_name: &str, srt_url: &str) -> Result<()>;
}

/// Sends completion mails through the Resend HTTP API.
pub struct ResendNotifier {
    client: Client,
    api_key: String,
    from: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: String,
}

impl ResendNotifier {
    pub fn new(client: Client, api_key: String, from: String, timeout: Duration) -> Self {
        Self {
            client,
            api_key,
            from,
            timeout,
        }
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn notify(&self, to: &str, file_name: &str, srt_url: &str) -> Result<()> {
        let request = SendEmailRequest {
            from: &self.from,
            to: [to],
            subject: "Your subtitles are ready",
            html: completion_html(file_name, srt_url),
        };

        let response = self
            .client
            .post(RESEND_EMAILS_URL)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .context("resend request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("resend returned {status}");
        }

        info!(to = %to, file_name = %file_name, "notification_sent");
        Ok(())
    }
}

/// Used when no mail provider is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, to: &str, file_name: &str, srt_url: &str) -> Result<()> {
        info!(to = %to, file_name = %file_name, srt_url = %srt_url, "notification_skipped");
        Ok(())
    }
}

fn completion_html(file_name: &str, srt_url: &str) -> String {
    format!(
        r#"<strong>{}</strong> <a href="{}">click</a>"#,
        escape_html(file_name),
        escape_html(srt_url)
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
