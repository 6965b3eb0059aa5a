// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Notifier implementations: Unraid notify script, JSON webhook, tracing.
//!
//! Delivery failures are logged and swallowed; an unreachable notification
//! channel never changes the outcome of a backup or restore.

use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::domain::config::NotificationConfig;
use crate::domain::notifier::{Notifier, Severity};

/// Unraid's `notify` helper (`-e event -s subject -d description -i importance`).
pub struct UnraidNotifier {
    script: PathBuf,
}

impl UnraidNotifier {
    pub fn new(script: PathBuf) -> Self {
        Self { script }
    }

    fn importance(severity: Severity) -> &'static str {
        match severity {
            Severity::Info | Severity::Success => "normal",
            Severity::Warning => "warning",
            Severity::Error => "alert",
        }
    }
}

#[async_trait]
impl Notifier for UnraidNotifier {
    async fn notify(&self, severity: Severity, subject: &str, message: &str) {
        if !self.script.is_file() {
            debug!(script = %self.script.display(), "Unraid notify script not present, skipping");
            return;
        }
        let result = tokio::process::Command::new(&self.script)
            .args(["-e", "Archon", "-s", subject, "-d", message, "-i", Self::importance(severity)])
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                code = output.status.code().unwrap_or(-1),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Unraid notification failed"
            ),
            Err(e) => warn!(error = %e, "Failed to run Unraid notify script"),
        }
    }
}

/// POSTs `{severity, subject, message, host, timestamp}` to a URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    host: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self {
            client,
            url: url.into(),
            host,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, severity: Severity, subject: &str, message: &str) {
        let body = json!({
            "severity": severity,
            "subject": subject,
            "message": message,
            "host": self.host,
            "timestamp": chrono::Utc::now(),
        });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(status = %response.status(), "Webhook notification rejected"),
            Err(e) => warn!(error = %e, "Webhook notification failed"),
        }
    }
}

/// Writes notifications to the log.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, severity: Severity, subject: &str, message: &str) {
        match severity {
            Severity::Error => error!(%subject, "{}", message),
            Severity::Warning => warn!(%subject, "{}", message),
            Severity::Info | Severity::Success => info!(%subject, %severity, "{}", message),
        }
    }
}

/// Fans a notification out to every configured channel in turn.
#[derive(Default)]
pub struct CompositeNotifier {
    channels: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, severity: Severity, subject: &str, message: &str) {
        for channel in &self.channels {
            channel.notify(severity, subject, message).await;
        }
    }
}

/// Build the notifier chain from configuration. The tracing sink is always on.
pub fn from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    let mut composite = CompositeNotifier::new().with(Arc::new(TracingNotifier));
    if !config.enabled {
        return Arc::new(composite);
    }

    composite = composite.with(Arc::new(UnraidNotifier::new(config.unraid_script.clone())));
    if let Some(url) = &config.webhook_url {
        match WebhookNotifier::new(url.clone()) {
            Ok(webhook) => composite = composite.with(Arc::new(webhook)),
            Err(e) => warn!(error = %e, "Webhook notifier disabled"),
        }
    }
    Arc::new(composite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<(Severity, String)>>);

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, severity: Severity, subject: &str, _message: &str) {
            self.0.lock().unwrap().push((severity, subject.to_string()));
        }
    }

    #[tokio::test]
    async fn test_composite_fans_out() {
        let a = Arc::new(Recording(Mutex::new(Vec::new())));
        let b = Arc::new(Recording(Mutex::new(Vec::new())));
        let composite = CompositeNotifier::new().with(a.clone()).with(b.clone());
        composite.notify(Severity::Warning, "Backup", "low space").await;
        assert_eq!(a.0.lock().unwrap().len(), 1);
        assert_eq!(b.0.lock().unwrap()[0], (Severity::Warning, "Backup".to_string()));
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::PartialJson(json!({
                "severity": "error",
                "subject": "Restore failed"
            })))
            .with_status(200)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.url())).unwrap();
        notifier.notify(Severity::Error, "Restore failed", "rolled back").await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_unraid_script_is_silent() {
        let notifier = UnraidNotifier::new(PathBuf::from("/nonexistent/notify"));
        notifier.notify(Severity::Info, "x", "y").await;
    }

    #[test]
    fn test_disabled_config_keeps_only_tracing() {
        let config = NotificationConfig {
            enabled: false,
            unraid_script: PathBuf::from("/nonexistent"),
            webhook_url: Some("http://localhost:1/hook".to_string()),
        };
        let _ = from_config(&config);
        assert_eq!(UnraidNotifier::importance(Severity::Error), "alert");
    }
}
