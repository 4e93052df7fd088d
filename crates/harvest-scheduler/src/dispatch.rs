//! Summary dispatch: sends the end-of-run summary to configured channels.
//! Supports: log output (always), Slack-compatible HTTP webhook.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::config::ReportConfig;
use harvest_core::error::{HarvestError, Result};
use harvest_core::traits::Notifier;
use harvest_core::types::RunSummary;

/// Writes the summary to the log.
pub struct LogNotifier {
    header: String,
}

impl LogNotifier {
    pub fn new(header: impl Into<String>) -> Self {
        Self { header: header.into() }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, summary: &RunSummary) -> Result<()> {
        if summary.is_clean() {
            tracing::info!("\n{}", summary.render_text(&self.header));
        } else {
            tracing::warn!("\n{}", summary.render_text(&self.header));
        }
        Ok(())
    }
}

/// POSTs `{"text": …, "summary": …}` to an incoming-webhook URL.
pub struct WebhookNotifier {
    url: String,
    header: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            header: header.into(),
            headers: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    /// Extra HTTP header sent with every request (e.g. auth).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, summary: &RunSummary) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "text": summary.render_text(&self.header),
                "summary": summary,
            }))
            .timeout(Duration::from_secs(10));

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| HarvestError::Notifier(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook summary sent to {}: run {}", self.url, summary.run_id);
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(HarvestError::Notifier(format!("Webhook error {status}: {body}")))
        }
    }
}

/// Build the notifier for a job: webhook when a URL is configured, log otherwise.
pub fn notifier_from_config(config: &ReportConfig, job: &str) -> Arc<dyn Notifier> {
    let header = config.header_for(job);
    if config.webhook_url.trim().is_empty() {
        Arc::new(LogNotifier::new(header))
    } else {
        Arc::new(WebhookNotifier::new(config.webhook_url.trim(), header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn summary() -> RunSummary {
        RunSummary {
            job: "subreddit-snapshot".into(),
            run_id: "run-42".into(),
            batch_ids: vec!["g0-o0".into()],
            total: 2,
            succeeded: 2,
            failed: 0,
            skipped: 0,
            failures: vec![],
            failures_omitted: 0,
            started_at: Utc::now(),
            duration_ms: 1200,
            cancelled: false,
        }
    }

    #[tokio::test]
    async fn test_webhook_posts_text_and_summary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-token", "abc"))
            .and(body_partial_json(serde_json::json!({"summary": {"run_id": "run-42"}})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(format!("{}/hook", server.uri()), "Snapshot").with_header("x-token", "abc");
        notifier.deliver(&summary()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri(), "Snapshot");
        let err = notifier.deliver(&summary()).await.unwrap_err();
        assert!(matches!(err, HarvestError::Notifier(ref m) if m.contains("500")));
    }

    #[tokio::test]
    async fn test_notifier_selection() {
        let mut config = ReportConfig::default();
        assert_eq!(notifier_from_config(&config, "job").name(), "log");
        config.webhook_url = "https://hooks.example.com/x".into();
        assert_eq!(notifier_from_config(&config, "job").name(), "webhook");
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier::new("Snapshot").deliver(&summary()).await.is_ok());
    }
}
