use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::HeaderValue;
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::{ConfigError, ScanConfig};
use crate::features::{FeatureMapping, FeatureSetBuilder, FeatureValue};
use crate::sources::http::{send_json, API_CLIENT};
use crate::sources::{ScanPoll, ScanProvider};

pub const SCAN_KEYS: &[&str] = &[
    "urlscan_verdict",
    "urlscan_score",
    "urlscan_domain",
    "urlscan_result_url",
    "urlscan_screenshot",
];

const API_KEY_HEADER: &str = "API-Key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Result<Self, ConfigError> {
        if interval.is_zero() || max_attempts == 0 {
            return Err(ConfigError::InvalidPolling);
        }
        Ok(Self {
            interval,
            max_attempts,
        })
    }

    pub fn from_config(config: &ScanConfig) -> Result<Self, ConfigError> {
        Self::new(config.poll_interval(), config.max_poll_attempts)
    }

    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

#[derive(Debug, Clone)]
pub struct UrlscanProvider {
    base_url: String,
    api_key: String,
    visibility: String,
    tags: Vec<String>,
}

impl UrlscanProvider {
    pub fn from_config(config: &ScanConfig) -> Option<Self> {
        if !config.has_api_key() {
            return None;
        }
        Some(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.trim().to_string(),
            visibility: config.visibility.clone(),
            tags: config.tags.clone(),
        })
    }

    fn api_key_header(&self) -> Result<HeaderValue> {
        let mut value =
            HeaderValue::from_str(&self.api_key).context("urlscan API key is not a valid header")?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[async_trait]
impl ScanProvider for UrlscanProvider {
    fn name(&self) -> &str {
        "urlscan"
    }

    async fn submit(&self, url: &str) -> Result<String> {
        let endpoint = format!("{}/scan/", self.base_url);
        let request = API_CLIENT
            .post(&endpoint)
            .header(API_KEY_HEADER, self.api_key_header()?)
            .json(&json!({
                "url": url,
                "visibility": self.visibility,
                "tags": self.tags,
            }));
        let (status, body) = send_json(request, &format!("POST {endpoint}")).await?;
        if status != 200 {
            return Err(anyhow!("scan submission for {url} returned {status}"));
        }
        let uuid = body
            .get("uuid")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("scan submission response has no uuid"))?;
        info!("submitted {url} for scanning as {uuid}");
        Ok(uuid.to_string())
    }

    async fn poll(&self, scan_id: &str) -> Result<ScanPoll> {
        let endpoint = format!("{}/result/{scan_id}/", self.base_url);
        let request = API_CLIENT
            .get(&endpoint)
            .header(API_KEY_HEADER, self.api_key_header()?);
        match send_json(request, &format!("GET {endpoint}")).await? {
            (404, _) => Ok(ScanPoll::Pending),
            (_, body) => Ok(ScanPoll::Ready(body)),
        }
    }
}

pub async fn scan_with_polling(
    provider: &dyn ScanProvider,
    url: &str,
    policy: PollPolicy,
) -> Result<Value> {
    let scan_id = provider.submit(url).await?;
    for attempt in 1..=policy.max_attempts {
        match provider.poll(&scan_id).await? {
            ScanPoll::Ready(result) => return Ok(result),
            ScanPoll::Pending => {
                debug!(
                    "{} scan {scan_id} not ready (attempt {attempt}/{})",
                    provider.name(),
                    policy.max_attempts
                );
                if attempt < policy.max_attempts {
                    sleep(policy.interval).await;
                }
            }
        }
    }
    Err(anyhow!(
        "{} result for {scan_id} not ready after {} attempts",
        provider.name(),
        policy.max_attempts
    ))
}

pub fn scan_features(result: &Value) -> FeatureMapping {
    let empty = Map::new();
    let object = result.as_object().unwrap_or(&empty);

    let verdict = match path_value(object, "verdicts.overall.malicious").and_then(Value::as_bool) {
        Some(true) => Some("malicious".to_string()),
        Some(false) => Some("clean".to_string()),
        None => string_at(object, "verdict"),
    };
    let score = path_value(object, "verdicts.overall.score").and_then(|v| {
        v.as_i64()
            .map(FeatureValue::Integer)
            .or_else(|| v.as_f64().map(FeatureValue::Float))
    });

    let mut builder = FeatureSetBuilder::new();
    builder.insert(
        "urlscan_verdict",
        FeatureValue::text_or_unavailable(verdict.or_else(|| Some("unknown".to_string()))),
    );
    builder.insert("urlscan_score", score.unwrap_or(FeatureValue::Unavailable));
    builder.insert(
        "urlscan_domain",
        FeatureValue::text_or_unavailable(string_at(object, "page.domain")),
    );
    builder.insert(
        "urlscan_result_url",
        FeatureValue::text_or_unavailable(string_at(object, "task.reportURL")),
    );
    builder.insert(
        "urlscan_screenshot",
        FeatureValue::text_or_unavailable(string_at(object, "task.screenshotURL")),
    );
    builder.build()
}

fn string_at(object: &Map<String, Value>, path: &str) -> Option<String> {
    match path_value(object, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn path_value<'a>(object: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = object.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::ScanConfig;
    use crate::features::FeatureValue;
    use crate::sources::urlscan::{scan_features, scan_with_polling, PollPolicy, UrlscanProvider};
    use crate::sources::{ScanPoll, ScanProvider};

    struct ScriptedScan {
        ready_after: Option<u32>,
        polls: AtomicU32,
        fail_poll: bool,
    }

    impl ScriptedScan {
        fn new(ready_after: Option<u32>) -> Self {
            Self {
                ready_after,
                polls: AtomicU32::new(0),
                fail_poll: false,
            }
        }
    }

    #[async_trait]
    impl ScanProvider for ScriptedScan {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn submit(&self, _url: &str) -> Result<String> {
            Ok("uuid-1".to_string())
        }

        async fn poll(&self, _scan_id: &str) -> Result<ScanPoll> {
            if self.fail_poll {
                return Err(anyhow!("poll returned 500"));
            }
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.ready_after {
                Some(ready) if n >= ready => Ok(ScanPoll::Ready(json!({"task": {"uuid": "uuid-1"}}))),
                _ => Ok(ScanPoll::Pending),
            }
        }
    }

    fn fast_policy(attempts: u32) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), attempts).unwrap()
    }

    #[tokio::test]
    async fn returns_result_once_ready() {
        let provider = ScriptedScan::new(Some(3));
        let result = scan_with_polling(&provider, "https://a.test", fast_policy(5))
            .await
            .expect("ready on third poll");
        assert_eq!(result["task"]["uuid"], "uuid-1");
        assert_eq!(provider.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let provider = ScriptedScan::new(None);
        let err = scan_with_polling(&provider, "https://a.test", fast_policy(4))
            .await
            .expect_err("never ready");
        assert!(err.to_string().contains("4 attempts"));
        assert_eq!(provider.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn poll_errors_abort_immediately() {
        let mut provider = ScriptedScan::new(Some(1));
        provider.fail_poll = true;
        assert!(scan_with_polling(&provider, "https://a.test", fast_policy(3))
            .await
            .is_err());
    }

    #[test]
    fn policy_rejects_zero_budget() {
        assert!(PollPolicy::new(Duration::ZERO, 3).is_err());
        assert!(PollPolicy::new(Duration::from_secs(5), 0).is_err());
        assert_eq!(
            PollPolicy::new(Duration::from_secs(5), 10).unwrap().budget(),
            Duration::from_secs(50)
        );
    }

    #[test]
    fn provider_requires_api_key() {
        assert!(UrlscanProvider::from_config(&ScanConfig::default()).is_none());
        let config = ScanConfig {
            api_key: "k".to_string(),
            ..ScanConfig::default()
        };
        assert!(UrlscanProvider::from_config(&config).is_some());
    }

    #[test]
    fn maps_scan_result_fields() {
        let result = json!({
            "task": {
                "reportURL": "https://urlscan.io/result/uuid-1/",
                "screenshotURL": "https://urlscan.io/screenshots/uuid-1.png"
            },
            "page": {"domain": "login-paypa1.example"},
            "verdicts": {"overall": {"malicious": true, "score": 100}}
        });
        let features = scan_features(&result);
        assert_eq!(features.get("urlscan_verdict"), Some(&FeatureValue::text("malicious")));
        assert_eq!(features.get("urlscan_score"), Some(&FeatureValue::Integer(100)));
        assert_eq!(
            features.get("urlscan_domain"),
            Some(&FeatureValue::text("login-paypa1.example"))
        );
        assert_eq!(
            features.get("urlscan_screenshot"),
            Some(&FeatureValue::text("https://urlscan.io/screenshots/uuid-1.png"))
        );

        let sparse = scan_features(&json!({}));
        assert_eq!(sparse.get("urlscan_verdict"), Some(&FeatureValue::text("unknown")));
        assert_eq!(sparse.get("urlscan_score"), Some(&FeatureValue::Unavailable));
    }
}
