//! Score callback notifier
//!
//! Relays a structured grading result, together with the submitted files, to
//! a caller-supplied URL. Best effort: failures are logged and never reach
//! the primary response.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::submission::Submission;

/// Field of the callback payload holding the submitted files
pub const STUDENT_WORK_FIELD: &str = "studentWork";

#[derive(Clone)]
pub struct CallbackNotifier {
    client: reqwest::Client,
    /// Rewrite `https://` targets to `http://` for legacy receivers
    downgrade_https: bool,
}

impl CallbackNotifier {
    pub fn new(timeout: Duration, downgrade_https: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build callback HTTP client")?;
        Ok(Self {
            client,
            downgrade_https,
        })
    }

    /// URL the notification is actually sent to
    pub fn target_url(&self, url: &str) -> String {
        match url.strip_prefix("https://") {
            Some(rest) if self.downgrade_https => {
                warn!("Downgrading score callback to plain http: {}", url);
                format!("http://{}", rest)
            }
            _ => url.to_string(),
        }
    }

    /// Grading result augmented with the raw submission
    pub fn payload(result: &Map<String, Value>, submission: &Submission) -> Value {
        let mut augmented = result.clone();
        augmented.insert(STUDENT_WORK_FIELD.to_string(), submission.to_json());
        Value::Object(augmented)
    }

    /// POST the payload and log the outcome. Never fails.
    pub async fn notify(&self, url: &str, payload: &Value) {
        let target = self.target_url(url);
        info!("Score callback request: {} {}", target, payload);

        let response = match self.client.post(&target).json(payload).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Score callback to {} failed: {}", target, e);
                return;
            }
        };

        let status = response.status();
        match response.text().await {
            Ok(body) if status.is_success() => {
                info!("Score callback response: {} {}", status, body);
            }
            Ok(body) => {
                warn!("Score callback to {} returned {}: {}", target, status, body);
            }
            Err(e) => {
                warn!("Score callback to {} returned {} with unreadable body: {}", target, status, e);
            }
        }
    }

    /// Send the notification on a detached task so the caller is not delayed
    pub fn dispatch(&self, url: String, payload: Value) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move { notifier.notify(&url, &payload).await })
    }
}
