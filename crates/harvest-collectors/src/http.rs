//! HTTP JSON processor: GETs one JSON document per work item.
//!
//! Status mapping:
//! ```text
//! 2xx              → Success(body)
//! 403 / 404 / 451  → Skipped   (private, banned or missing target)
//! 408 / 429 / 5xx  → Transient
//! anything else    → Permanent
//! ```

use std::time::Duration;

use async_trait::async_trait;
use harvest_core::config::CollectorConfig;
use harvest_core::error::{HarvestError, Result};
use harvest_core::traits::{ItemError, Processed, Processor};
use harvest_core::types::WorkItem;
use reqwest::{StatusCode, Url};

/// How a response status is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Skip,
    Transient,
    Permanent,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    match status.as_u16() {
        200..=299 => StatusClass::Success,
        403 | 404 | 451 => StatusClass::Skip,
        408 | 429 | 500..=599 => StatusClass::Transient,
        _ => StatusClass::Permanent,
    }
}

/// Normalize a configured item name: `r/rust`, `/r/rust/` and ` rust ` all
/// become `rust`.
pub fn sanitize_item(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("/r/")
        .or_else(|| trimmed.strip_prefix("r/"))
        .unwrap_or(trimmed);
    stripped.trim_matches('/').trim().to_string()
}

/// Percent-encode `name` the way a URL path segment is encoded.
fn encode_segment(name: &str) -> Result<String> {
    let mut scratch = Url::parse("http://localhost/")
        .map_err(|e| HarvestError::Config(format!("scratch URL: {e}")))?;
    scratch
        .path_segments_mut()
        .map_err(|_| HarvestError::Config("scratch URL cannot hold a path".into()))?
        .clear()
        .push(name);
    Ok(scratch.path().trim_start_matches('/').to_string())
}

pub struct HttpJsonProcessor {
    client: reqwest::Client,
    url_template: String,
}

impl HttpJsonProcessor {
    /// `url_template` must contain `{item}`.
    pub fn new(url_template: impl Into<String>, user_agent: &str, timeout: Duration) -> Result<Self> {
        let url_template = url_template.into();
        if !url_template.contains("{item}") {
            return Err(HarvestError::Config(format!(
                "collector.url_template must contain {{item}}: {url_template}"
            )));
        }
        Url::parse(&url_template.replace("{item}", "item")).map_err(|e| {
            HarvestError::Config(format!("collector.url_template is not a URL: {url_template}: {e}"))
        })?;
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, url_template })
    }

    pub fn from_config(config: &CollectorConfig) -> Result<Self> {
        Self::new(
            config.url_template.clone(),
            &config.user_agent,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Fill the template with `name` encoded as a single path segment, so
    /// `?`, `#`, `/` and spaces in a name cannot change the request.
    pub fn url_for(&self, name: &str) -> Result<Url> {
        let url = self.url_template.replace("{item}", &encode_segment(name)?);
        Url::parse(&url).map_err(|e| HarvestError::Config(format!("bad URL {url}: {e}")))
    }
}

#[async_trait]
impl Processor for HttpJsonProcessor {
    fn name(&self) -> &str {
        "http-json"
    }

    async fn process(&self, item: &WorkItem) -> std::result::Result<Processed, ItemError> {
        let name = sanitize_item(item.as_str());
        if name.is_empty() {
            return Err(ItemError::Permanent(format!("empty item name '{item}'")));
        }
        let url = self
            .url_for(&name)
            .map_err(|e| ItemError::Permanent(format!("cannot build URL for '{name}': {e}")))?;

        let resp = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ItemError::Transient(format!("request to {url} failed: {e}"))
            } else {
                ItemError::Permanent(format!("request to {url} failed: {e}"))
            }
        })?;

        let status = resp.status();
        match classify_status(status) {
            StatusClass::Success => {}
            StatusClass::Skip => {
                tracing::debug!("⏭️ {url} returned {status}, skipping {name}");
                return Ok(Processed::Skipped(format!("{status}")));
            }
            StatusClass::Transient => {
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| format!(" (retry after {v}s)"))
                    .unwrap_or_default();
                return Err(ItemError::Transient(format!("{status} from {url}{retry_after}")));
            }
            StatusClass::Permanent => {
                let body = resp.text().await.unwrap_or_default();
                let body: String = body.chars().take(200).collect();
                return Err(ItemError::Permanent(format!("{status} from {url}: {body}")));
            }
        }

        resp.json::<serde_json::Value>()
            .await
            .map(Processed::Success)
            .map_err(|e| {
                if e.is_timeout() {
                    ItemError::Transient(format!("reading {url} timed out: {e}"))
                } else {
                    ItemError::Permanent(format!("invalid JSON from {url}: {e}"))
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn processor(server: &MockServer) -> HttpJsonProcessor {
        HttpJsonProcessor::new(
            format!("{}/r/{{item}}/about.json", server.uri()),
            "harvest-test/1.0",
            Duration::from_millis(500),
        )
        .unwrap()
    }

    async fn respond(status: u16) -> std::result::Result<Processed, ItemError> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        processor(&server).await.process(&WorkItem::new("rust")).await
    }

    #[test]
    fn test_sanitize_item() {
        assert_eq!(sanitize_item("r/rust"), "rust");
        assert_eq!(sanitize_item(" /r/rust/ "), "rust");
        assert_eq!(sanitize_item("golang"), "golang");
        assert_eq!(sanitize_item("r/"), "");
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), StatusClass::Success);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), StatusClass::Skip);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), StatusClass::Transient);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), StatusClass::Transient);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), StatusClass::Permanent);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), StatusClass::Permanent);
    }

    #[test]
    fn test_template_requires_placeholder() {
        let err = HttpJsonProcessor::new("https://example.com/about.json", "ua", Duration::from_secs(1));
        assert!(matches!(err, Err(HarvestError::Config(_))));
    }

    #[tokio::test]
    async fn test_item_is_encoded_as_one_path_segment() {
        let server = MockServer::start().await;
        let processor = processor(&server).await;
        let base = server.uri();

        let url = processor.url_for("rust").unwrap();
        assert_eq!(url.as_str(), format!("{base}/r/rust/about.json"));

        let url = processor.url_for("a b?c#d/e").unwrap();
        assert_eq!(url.as_str(), format!("{base}/r/a%20b%3Fc%23d%2Fe/about.json"));
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert_eq!(url.path_segments().unwrap().count(), 3);
    }

    #[test]
    fn test_template_must_be_a_url() {
        let err = HttpJsonProcessor::new("not a url/{item}", "ua", Duration::from_secs(1));
        assert!(matches!(err, Err(HarvestError::Config(_))));
    }

    #[tokio::test]
    async fn test_query_characters_stay_in_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/what%3Fnow/about.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let result = processor(&server).await.process(&WorkItem::new("what?now")).await.unwrap();
        assert_eq!(result, Processed::Success(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/rust/about.json"))
            .and(header("user-agent", "harvest-test/1.0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": {"subscribers": 300000}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let result = processor(&server).await.process(&WorkItem::new("r/rust")).await.unwrap();
        assert_eq!(
            result,
            Processed::Success(serde_json::json!({"data": {"subscribers": 300000}}))
        );
    }

    #[tokio::test]
    async fn test_status_mapping() {
        assert!(matches!(respond(403).await, Ok(Processed::Skipped(_))));
        assert!(matches!(respond(404).await, Ok(Processed::Skipped(_))));
        assert!(matches!(respond(429).await, Err(ItemError::Transient(_))));
        assert!(matches!(respond(503).await, Err(ItemError::Transient(_))));
        assert!(matches!(respond(400).await, Err(ItemError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_invalid_json_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
            .mount(&server)
            .await;
        let err = processor(&server).await.process(&WorkItem::new("rust")).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_slow_upstream_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;
        let err = processor(&server).await.process(&WorkItem::new("rust")).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn test_empty_name_is_permanent() {
        let server = MockServer::start().await;
        let err = processor(&server).await.process(&WorkItem::new(" r/ ")).await.unwrap_err();
        assert!(matches!(err, ItemError::Permanent(_)));
    }
}
