use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::analysis::{normalize_url, AnalysisOptions, AnalysisReport};
use crate::audit::AuditLogger;
use crate::compare::diff_features;
use crate::config::Config;
use crate::features::{FeatureMapping, FeatureSetBuilder, FeatureValue, StageOutcome};
use crate::scoring::scorer::Scorer;
use crate::sources::extractor::{extract_features, extract_response_features};
use crate::sources::fetcher::HttpFetcher;
use crate::sources::http::{host_of, sha256_hex};
use crate::sources::urlscan::{scan_features, scan_with_polling, PollPolicy, UrlscanProvider, SCAN_KEYS};
use crate::sources::{
    run_enricher, EnricherRegistry, FetchedPage, HostEnricher, PageFetcher, ScanProvider,
};

const SCAN_SUBMIT_ALLOWANCE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct Analyzer {
    light: Arc<dyn PageFetcher>,
    heavy: Arc<dyn PageFetcher>,
    enrichers: EnricherRegistry,
    scan: Option<Arc<dyn ScanProvider>>,
    poll_policy: PollPolicy,
    scorer: Scorer,
    audit: AuditLogger,
}

impl Analyzer {
    pub fn new(
        light: Arc<dyn PageFetcher>,
        heavy: Arc<dyn PageFetcher>,
        scorer: Scorer,
        audit: AuditLogger,
    ) -> Self {
        Self {
            light,
            heavy,
            enrichers: EnricherRegistry::new(Vec::new()),
            scan: None,
            poll_policy: PollPolicy {
                interval: Duration::from_secs(5),
                max_attempts: 10,
            },
            scorer,
            audit,
        }
    }

    pub fn with_enrichers(mut self, enrichers: EnricherRegistry) -> Self {
        self.enrichers = enrichers;
        self
    }

    pub fn with_scan_provider(mut self, provider: Arc<dyn ScanProvider>, policy: PollPolicy) -> Self {
        self.scan = Some(provider);
        self.poll_policy = policy;
        self
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let light = HttpFetcher::light(&config.fetch)?;
        let heavy = HttpFetcher::browser(&config.fetch)?;
        let mut analyzer = Self::new(
            Arc::new(light),
            Arc::new(heavy),
            Scorer::new(config.scoring.clone()),
            AuditLogger::new(config.resolved_reports_dir()),
        )
        .with_enrichers(EnricherRegistry::with_defaults(config));
        if let Some(provider) = UrlscanProvider::from_config(&config.scan) {
            let policy = PollPolicy::from_config(&config.scan)?;
            analyzer = analyzer.with_scan_provider(Arc::new(provider), policy);
        }
        Ok(analyzer)
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub async fn run(
        &self,
        baseline_url: &str,
        target_url: &str,
        options: &AnalysisOptions,
    ) -> Result<AnalysisReport> {
        let baseline_url = normalize_url(baseline_url)?;
        let target_url = normalize_url(target_url)?;
        info!("analyzing {target_url} against baseline {baseline_url}");

        let (baseline, target) = tokio::try_join!(
            self.analyze_site(&baseline_url, options),
            self.analyze_site(&target_url, options),
        )?;
        Ok(self.compare(baseline_url, target_url, baseline, target, options))
    }

    pub fn compare(
        &self,
        baseline_url: String,
        target_url: String,
        baseline: FeatureMapping,
        target: FeatureMapping,
        options: &AnalysisOptions,
    ) -> AnalysisReport {
        let comparisons = diff_features(&baseline, &target, &options.ignore_keys);
        let score = self.scorer.compute(&comparisons);
        let audit_log = self
            .audit
            .record(&comparisons, self.scorer.weights(), options.audit_mode);
        info!(
            "risk {} ({}) with {}/{} mismatches",
            score.percentage,
            score.label,
            comparisons.mismatch_count(),
            comparisons.len()
        );
        AnalysisReport {
            baseline_url,
            target_url,
            generated_at: Utc::now(),
            baseline,
            target,
            comparisons,
            score,
            audit_log,
        }
    }

    pub async fn analyze_site(&self, url: &str, options: &AnalysisOptions) -> Result<FeatureMapping> {
        let page = self.fetch_with_fallback(url, options.browser).await?;

        let mut builder = FeatureSetBuilder::new();
        builder.insert("requested_url", url);
        builder.insert("final_url", page.final_url.as_str());
        builder.insert("http_status", i64::from(page.status));
        builder.insert("load_time", page.elapsed);
        builder.extend(extract_response_features(&page));
        builder.extend(extract_features(&page.body, &page.final_url));

        let favicon_hash = self.favicon_hash(builder.get("favicon_url")).await;
        builder.insert("favicon_hash", favicon_hash);

        match host_of(&page.final_url) {
            Some(host) => {
                for outcome in self.enrich_host(&host).await {
                    builder.apply(outcome);
                }
            }
            None => {
                for enricher in self.enrichers.enrichers() {
                    builder.apply(stage_failed(
                        enricher.as_ref(),
                        format!("no host in {}", page.final_url),
                    ));
                }
            }
        }

        if options.scan {
            builder.apply(self.scan_stage(&page.final_url).await);
        }

        Ok(builder.build())
    }

    async fn fetch_with_fallback(&self, url: &str, prefer_browser: bool) -> Result<FetchedPage> {
        if prefer_browser {
            return self
                .heavy
                .fetch(url)
                .await
                .with_context(|| format!("{} fetch failed for {url}", self.heavy.name()));
        }

        let server_error = match self.light.fetch(url).await {
            Ok(page) if !page.is_server_error() => return Ok(page),
            Ok(page) => {
                warn!(
                    "{url} returned {} to the {} fetcher, retrying with {}",
                    page.status,
                    self.light.name(),
                    self.heavy.name()
                );
                Some(page)
            }
            Err(err) => {
                warn!(
                    "{} fetch failed for {url}: {err:#}, retrying with {}",
                    self.light.name(),
                    self.heavy.name()
                );
                None
            }
        };

        match self.heavy.fetch(url).await {
            Ok(page) => Ok(page),
            Err(err) => match server_error {
                Some(page) => {
                    warn!(
                        "{} fetch failed for {url}: {err:#}, keeping {} response",
                        self.heavy.name(),
                        page.status
                    );
                    Ok(page)
                }
                None => Err(err.context(format!("all fetch strategies failed for {url}"))),
            },
        }
    }

    async fn favicon_hash(&self, favicon_url: Option<&FeatureValue>) -> FeatureValue {
        let Some(favicon_url) = favicon_url.and_then(FeatureValue::as_text) else {
            return FeatureValue::Unavailable;
        };
        match self.light.fetch_asset(favicon_url).await {
            Ok(bytes) if !bytes.is_empty() => FeatureValue::Text(sha256_hex(&bytes)),
            Ok(_) => FeatureValue::Unavailable,
            Err(err) => {
                warn!("favicon fetch failed for {favicon_url}: {err:#}");
                FeatureValue::Error
            }
        }
    }

    async fn enrich_host(&self, host: &str) -> Vec<StageOutcome> {
        let enrichers = self.enrichers.enrichers();
        let mut tasks = JoinSet::new();
        for (idx, enricher) in enrichers.iter().enumerate() {
            let enricher: Arc<dyn HostEnricher> = Arc::clone(enricher);
            let host = host.to_string();
            tasks.spawn(async move { (idx, run_enricher(enricher.as_ref(), &host).await) });
        }

        let mut outcomes: Vec<Option<StageOutcome>> = enrichers.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(err) => warn!("enrichment task for {host} aborted: {err}"),
            }
        }

        // A task that panicked left no outcome; its keys still read as errors.
        enrichers
            .iter()
            .zip(outcomes)
            .map(|(enricher, outcome)| {
                outcome.unwrap_or_else(|| {
                    stage_failed(enricher.as_ref(), format!("task for {host} did not complete"))
                })
            })
            .collect()
    }

    async fn scan_stage(&self, url: &str) -> StageOutcome {
        let failed = |reason: String| StageOutcome::Failed {
            stage: "scan",
            keys: SCAN_KEYS,
            reason,
        };
        let Some(provider) = self.scan.as_ref() else {
            return failed("no scan provider configured (missing API key)".to_string());
        };
        let budget = self.poll_policy.budget() + SCAN_SUBMIT_ALLOWANCE;
        match timeout(budget, scan_with_polling(provider.as_ref(), url, self.poll_policy)).await {
            Ok(Ok(result)) => StageOutcome::Fields(scan_features(&result)),
            Ok(Err(err)) => failed(format!("{err:#}")),
            Err(_) => failed(format!("scan of {url} exceeded {budget:?}")),
        }
    }
}

fn stage_failed(enricher: &dyn HostEnricher, reason: String) -> StageOutcome {
    StageOutcome::Failed {
        stage: enricher.stage(),
        keys: enricher.keys(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::analysis::{AnalysisOptions, Analyzer};
    use crate::audit::{AuditLogger, AuditMode};
    use crate::features::{FeatureMapping, FeatureValue};
    use crate::scoring::scorer::Scorer;
    use crate::scoring::RiskLabel;
    use crate::sources::urlscan::PollPolicy;
    use crate::sources::{EnricherRegistry, FetchedPage, HostEnricher, PageFetcher, ScanPoll, ScanProvider};

    const LEGIT_HTML: &str = r#"<html><head><title>Acme Bank</title>
<link rel="icon" href="/favicon.ico"></head>
<body><form><input type="password"></form></body></html>"#;
    const PHISH_HTML: &str = r#"<html><head><title>Acme Bank</title></head>
<body><form><input type="password"></form><img src="https://cdn.evil.test/logo.png"></body></html>"#;

    enum Behavior {
        Page { status: u16, body: &'static str },
        Fail,
    }

    struct MockFetcher {
        name: &'static str,
        pages: BTreeMap<&'static str, Behavior>,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn new(name: &'static str, pages: Vec<(&'static str, Behavior)>) -> Self {
            Self {
                name,
                pages: pages.into_iter().collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for MockFetcher {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(&self, url: &str) -> Result<FetchedPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.pages.get(url) {
                Some(Behavior::Page { status, body }) => Ok(FetchedPage {
                    final_url: url.to_string(),
                    status: *status,
                    headers: BTreeMap::from([(
                        "x-frame-options".to_string(),
                        "DENY".to_string(),
                    )]),
                    body: body.to_string(),
                    elapsed: Duration::from_millis(5),
                }),
                Some(Behavior::Fail) | None => Err(anyhow!("{} cannot reach {url}", self.name)),
            }
        }

        async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>> {
            if url.contains("legit.test") {
                Ok(b"icon-bytes".to_vec())
            } else {
                Err(anyhow!("404 for {url}"))
            }
        }
    }

    struct FixedEnricher {
        fail_for: Option<&'static str>,
    }

    #[async_trait]
    impl HostEnricher for FixedEnricher {
        fn stage(&self) -> &'static str {
            "fixed"
        }

        fn keys(&self) -> &'static [&'static str] {
            &["dns_ips", "dns_ttl"]
        }

        async fn lookup(&self, host: &str) -> Result<FeatureMapping> {
            if Some(host) == self.fail_for {
                return Err(anyhow!("resolver timeout"));
            }
            Ok(FeatureMapping::from_iter([
                ("dns_ips", FeatureValue::text("192.0.2.1")),
                ("dns_ttl", FeatureValue::Integer(300)),
            ]))
        }
    }

    struct Panicking;

    #[async_trait]
    impl HostEnricher for Panicking {
        fn stage(&self) -> &'static str {
            "panicking"
        }

        fn keys(&self) -> &'static [&'static str] {
            &["tls_issuer", "tls_protocol"]
        }

        async fn lookup(&self, host: &str) -> Result<FeatureMapping> {
            panic!("parser blew up on {host}");
        }
    }

    struct NeverReady;

    #[async_trait]
    impl ScanProvider for NeverReady {
        fn name(&self) -> &str {
            "never"
        }

        async fn submit(&self, _url: &str) -> Result<String> {
            Ok("id".to_string())
        }

        async fn poll(&self, _scan_id: &str) -> Result<ScanPoll> {
            Ok(ScanPoll::Pending)
        }
    }

    struct Instant;

    #[async_trait]
    impl ScanProvider for Instant {
        fn name(&self) -> &str {
            "instant"
        }

        async fn submit(&self, _url: &str) -> Result<String> {
            Ok("id".to_string())
        }

        async fn poll(&self, _scan_id: &str) -> Result<ScanPoll> {
            Ok(ScanPoll::Ready(json!({"verdicts": {"overall": {"malicious": false, "score": 0}}})))
        }
    }

    fn analyzer(light: MockFetcher, heavy: MockFetcher, reports: &std::path::Path) -> Analyzer {
        Analyzer::new(
            Arc::new(light),
            Arc::new(heavy),
            Scorer::default(),
            AuditLogger::new(reports),
        )
        .with_enrichers(EnricherRegistry::new(vec![Arc::new(FixedEnricher {
            fail_for: Some("phish.test"),
        })]))
    }

    fn both_pages() -> Vec<(&'static str, Behavior)> {
        vec![
            ("https://legit.test/", Behavior::Page { status: 200, body: LEGIT_HTML }),
            ("https://phish.test/", Behavior::Page { status: 200, body: PHISH_HTML }),
        ]
    }

    #[tokio::test]
    async fn compares_two_sites_and_writes_audit_record() {
        let dir = tempdir().expect("tempdir");
        let analyzer = analyzer(
            MockFetcher::new("light", both_pages()),
            MockFetcher::new("browser", Vec::new()),
            dir.path(),
        );
        let report = analyzer
            .run("legit.test", "https://phish.test", &AnalysisOptions::default())
            .await
            .expect("analysis succeeds");

        assert_eq!(report.baseline_url, "https://legit.test/");
        assert_eq!(report.baseline.get("title"), report.target.get("title"));
        assert_eq!(
            report.baseline.get("favicon_hash").and_then(FeatureValue::as_text).map(str::len),
            Some(64)
        );
        assert_eq!(report.target.get("favicon_hash"), Some(&FeatureValue::Error));
        assert_eq!(report.target.get("dns_ips"), Some(&FeatureValue::Error));
        assert_eq!(report.target.get("dns_ttl"), Some(&FeatureValue::Error));
        assert_eq!(report.baseline.get("hdr_xfo"), Some(&FeatureValue::text("DENY")));

        let dns = report.comparisons.get("dns_ips").expect("dns compared");
        assert!(!dns.is_match);
        assert!(report.comparisons.get("title").unwrap().is_match);
        assert!(report.score.total > 0.0);
        assert_ne!(report.score.label, RiskLabel::Indeterminate);
        let log = report.audit_log.expect("audit record written");
        assert!(log.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn server_error_falls_back_to_browser_profile() {
        let dir = tempdir().expect("tempdir");
        let light = MockFetcher::new(
            "light",
            vec![
                ("https://legit.test/", Behavior::Page { status: 503, body: "busy" }),
                ("https://phish.test/", Behavior::Fail),
            ],
        );
        let heavy = MockFetcher::new("browser", both_pages());
        let analyzer = analyzer(light, heavy, dir.path());
        let report = analyzer
            .run("https://legit.test/", "https://phish.test/", &AnalysisOptions::default())
            .await
            .expect("fallback succeeds");
        assert_eq!(report.baseline.get("http_status"), Some(&FeatureValue::Integer(200)));
        assert_eq!(report.baseline.get("title"), Some(&FeatureValue::text("Acme Bank")));
    }

    #[tokio::test]
    async fn server_error_page_kept_when_browser_also_fails() {
        let dir = tempdir().expect("tempdir");
        let light = MockFetcher::new(
            "light",
            vec![("https://legit.test/", Behavior::Page { status: 502, body: "bad gateway" })],
        );
        let heavy = Arc::new(MockFetcher::new(
            "browser",
            vec![("https://legit.test/", Behavior::Fail)],
        ));
        let analyzer = Analyzer::new(
            Arc::new(light),
            heavy.clone(),
            Scorer::default(),
            AuditLogger::new(dir.path()),
        );
        let site = analyzer
            .analyze_site("https://legit.test/", &AnalysisOptions::default())
            .await
            .expect("5xx page is kept");
        assert_eq!(heavy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(site.get("http_status"), Some(&FeatureValue::Integer(502)));
        assert_eq!(site.get("title"), Some(&FeatureValue::Unavailable));
    }

    #[tokio::test]
    async fn browser_option_failure_does_not_retry_light() {
        let dir = tempdir().expect("tempdir");
        let light = Arc::new(MockFetcher::new("light", both_pages()));
        let heavy = Arc::new(MockFetcher::new("browser", Vec::new()));
        let analyzer = Analyzer::new(
            light.clone(),
            heavy.clone(),
            Scorer::default(),
            AuditLogger::new(dir.path()),
        );
        let options = AnalysisOptions {
            browser: true,
            ..AnalysisOptions::default()
        };
        let err = analyzer
            .run("https://legit.test/", "https://phish.test/", &options)
            .await
            .expect_err("browser fetch fails");
        assert!(format!("{err:#}").contains("browser fetch failed"));
        assert_eq!(light.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hostless_final_url_fails_every_enricher() {
        let dir = tempdir().expect("tempdir");
        let url = "data:text/html,hello";
        let analyzer = analyzer(
            MockFetcher::new("light", vec![(url, Behavior::Page { status: 200, body: PHISH_HTML })]),
            MockFetcher::new("browser", Vec::new()),
            dir.path(),
        );
        let site = analyzer
            .analyze_site(url, &AnalysisOptions::default())
            .await
            .expect("site analysis succeeds");
        assert_eq!(site.get("dns_ips"), Some(&FeatureValue::Error));
        assert_eq!(site.get("dns_ttl"), Some(&FeatureValue::Error));
    }

    #[tokio::test]
    async fn panicking_enricher_marks_its_keys_as_errors() {
        let dir = tempdir().expect("tempdir");
        let analyzer = Analyzer::new(
            Arc::new(MockFetcher::new("light", both_pages())),
            Arc::new(MockFetcher::new("browser", Vec::new())),
            Scorer::default(),
            AuditLogger::new(dir.path()),
        )
        .with_enrichers(EnricherRegistry::new(vec![
            Arc::new(Panicking),
            Arc::new(FixedEnricher { fail_for: None }),
        ]));
        let site = analyzer
            .analyze_site("https://legit.test/", &AnalysisOptions::default())
            .await
            .expect("panic is contained");
        assert_eq!(site.get("tls_issuer"), Some(&FeatureValue::Error));
        assert_eq!(site.get("tls_protocol"), Some(&FeatureValue::Error));
        assert_eq!(site.get("dns_ttl"), Some(&FeatureValue::Integer(300)));
    }

    #[tokio::test]
    async fn exhausted_fetch_aborts_the_run() {
        let dir = tempdir().expect("tempdir");
        let light = MockFetcher::new(
            "light",
            vec![("https://legit.test/", Behavior::Page { status: 200, body: LEGIT_HTML })],
        );
        let heavy = MockFetcher::new("browser", Vec::new());
        let err = analyzer(light, heavy, dir.path())
            .run("https://legit.test/", "https://phish.test/", &AnalysisOptions::default())
            .await
            .expect_err("target unreachable");
        assert!(format!("{err:#}").contains("all fetch strategies failed"));
    }

    #[tokio::test]
    async fn browser_option_skips_light_fetcher() {
        let dir = tempdir().expect("tempdir");
        let light = Arc::new(MockFetcher::new("light", both_pages()));
        let heavy = Arc::new(MockFetcher::new("browser", both_pages()));
        let analyzer = Analyzer::new(
            light.clone(),
            heavy.clone(),
            Scorer::default(),
            AuditLogger::new(dir.path()),
        );
        let options = AnalysisOptions {
            browser: true,
            ..AnalysisOptions::default()
        };
        analyzer
            .run("https://legit.test/", "https://phish.test/", &options)
            .await
            .expect("browser fetch succeeds");
        assert_eq!(light.calls.load(Ordering::SeqCst), 0);
        assert_eq!(heavy.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scan_timeout_degrades_to_error_sentinels() {
        let dir = tempdir().expect("tempdir");
        let analyzer = analyzer(
            MockFetcher::new("light", both_pages()),
            MockFetcher::new("browser", Vec::new()),
            dir.path(),
        )
        .with_scan_provider(
            Arc::new(NeverReady),
            PollPolicy::new(Duration::from_millis(1), 3).unwrap(),
        );
        let options = AnalysisOptions {
            scan: true,
            ignore_keys: BTreeSet::from(["load_time".to_string()]),
            audit_mode: AuditMode::Full,
            ..AnalysisOptions::default()
        };
        let report = analyzer
            .run("https://legit.test/", "https://phish.test/", &options)
            .await
            .expect("scan failure is not fatal");
        assert_eq!(report.baseline.get("urlscan_verdict"), Some(&FeatureValue::Error));
        assert_eq!(report.target.get("urlscan_score"), Some(&FeatureValue::Error));
        assert!(report.comparisons.get("urlscan_verdict").unwrap().is_match);
        assert!(report.comparisons.get("load_time").is_none());
    }

    #[tokio::test]
    async fn ready_scan_contributes_fields() {
        let dir = tempdir().expect("tempdir");
        let analyzer = analyzer(
            MockFetcher::new("light", both_pages()),
            MockFetcher::new("browser", Vec::new()),
            dir.path(),
        )
        .with_scan_provider(
            Arc::new(Instant),
            PollPolicy::new(Duration::from_millis(1), 2).unwrap(),
        );
        let options = AnalysisOptions {
            scan: true,
            ..AnalysisOptions::default()
        };
        let report = analyzer
            .run("https://legit.test/", "https://phish.test/", &options)
            .await
            .expect("analysis succeeds");
        assert_eq!(
            report.target.get("urlscan_verdict"),
            Some(&FeatureValue::text("clean"))
        );
        assert_eq!(report.target.get("urlscan_score"), Some(&FeatureValue::Integer(0)));
    }

    #[tokio::test]
    async fn scan_without_provider_marks_errors() {
        let dir = tempdir().expect("tempdir");
        let analyzer = analyzer(
            MockFetcher::new("light", both_pages()),
            MockFetcher::new("browser", Vec::new()),
            dir.path(),
        );
        let options = AnalysisOptions {
            scan: true,
            ..AnalysisOptions::default()
        };
        let site = analyzer
            .analyze_site("https://legit.test/", &options)
            .await
            .expect("site analysis succeeds");
        assert_eq!(site.get("urlscan_domain"), Some(&FeatureValue::Error));
    }
}
