pub mod dns;
pub mod extractor;
pub mod fetcher;
pub mod http;
pub mod tls;
pub mod urlscan;
pub mod whois;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::features::{FeatureMapping, StageOutcome};
use crate::sources::dns::DnsEnricher;
use crate::sources::tls::TlsEnricher;
use crate::sources::whois::WhoisEnricher;

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub status: u16,
    /// Header names are lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub elapsed: Duration,
}

impl FetchedPage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait HostEnricher: Send + Sync {
    fn stage(&self) -> &'static str;
    fn keys(&self) -> &'static [&'static str];
    async fn lookup(&self, host: &str) -> Result<FeatureMapping>;
}

pub async fn run_enricher(enricher: &dyn HostEnricher, host: &str) -> StageOutcome {
    match enricher.lookup(host).await {
        Ok(mapping) => StageOutcome::Fields(mapping),
        Err(err) => StageOutcome::Failed {
            stage: enricher.stage(),
            keys: enricher.keys(),
            reason: format!("{err:#}"),
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanPoll {
    Ready(Value),
    Pending,
}

#[async_trait]
pub trait ScanProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn submit(&self, url: &str) -> Result<String>;
    async fn poll(&self, scan_id: &str) -> Result<ScanPoll>;
}

#[derive(Clone)]
pub struct EnricherRegistry {
    enrichers: Vec<Arc<dyn HostEnricher>>,
}

impl EnricherRegistry {
    pub fn new(enrichers: Vec<Arc<dyn HostEnricher>>) -> Self {
        Self { enrichers }
    }

    pub fn with_defaults(config: &Config) -> Self {
        let timeout = config.fetch.timeout();
        let enrichers: Vec<Arc<dyn HostEnricher>> = vec![
            Arc::new(TlsEnricher::new(timeout)),
            Arc::new(DnsEnricher::from_system_conf()),
            Arc::new(WhoisEnricher::new(timeout)),
        ];
        Self { enrichers }
    }

    pub fn enrichers(&self) -> &[Arc<dyn HostEnricher>] {
        &self.enrichers
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use crate::features::{FeatureMapping, FeatureValue, StageOutcome};
    use crate::sources::{run_enricher, HostEnricher};

    struct Flaky {
        fail: bool,
    }

    #[async_trait]
    impl HostEnricher for Flaky {
        fn stage(&self) -> &'static str {
            "flaky"
        }

        fn keys(&self) -> &'static [&'static str] {
            &["flaky_a", "flaky_b"]
        }

        async fn lookup(&self, host: &str) -> Result<FeatureMapping> {
            if self.fail {
                return Err(anyhow!("lookup of {host} refused"));
            }
            Ok(FeatureMapping::from_iter([("flaky_a", host)]))
        }
    }

    #[tokio::test]
    async fn failing_enricher_reports_owned_keys() {
        match run_enricher(&Flaky { fail: true }, "example.com").await {
            StageOutcome::Failed { stage, keys, reason } => {
                assert_eq!(stage, "flaky");
                assert_eq!(keys, &["flaky_a", "flaky_b"]);
                assert!(reason.contains("example.com"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn succeeding_enricher_yields_fields() {
        let outcome = tokio_test::block_on(run_enricher(&Flaky { fail: false }, "example.com"));
        let StageOutcome::Fields(mapping) = outcome else {
            panic!("expected fields");
        };
        assert_eq!(mapping.get("flaky_a"), Some(&FeatureValue::text("example.com")));
    }
}
