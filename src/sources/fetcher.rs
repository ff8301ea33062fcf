use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, UPGRADE_INSECURE_REQUESTS};
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::debug;

use crate::config::FetchConfig;
use crate::sources::http::preview;
use crate::sources::{FetchedPage, PageFetcher};

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchProfile {
    Light,
    Browser,
}

impl FetchProfile {
    pub fn label(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Browser => "browser",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    asset_timeout: Duration,
    profile: FetchProfile,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig, profile: FetchProfile) -> Result<Self> {
        let timeout = match profile {
            FetchProfile::Light => config.timeout(),
            FetchProfile::Browser => config.browser_timeout(),
        };
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .redirect(Policy::limited(MAX_REDIRECTS));
        if profile == FetchProfile::Browser {
            builder = builder.default_headers(browser_headers());
        }
        let client = builder
            .build()
            .with_context(|| format!("failed building {} HTTP client", profile.label()))?;
        Ok(Self {
            client,
            asset_timeout: config.asset_timeout(),
            profile,
        })
    }

    pub fn light(config: &FetchConfig) -> Result<Self> {
        Self::new(config, FetchProfile::Light)
    }

    pub fn browser(config: &FetchConfig) -> Result<Self> {
        Self::new(config, FetchProfile::Browser)
    }

}

#[async_trait]
impl PageFetcher for HttpFetcher {
    fn name(&self) -> &str {
        self.profile.label()
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed GET request: {url}"))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = collect_headers(response.headers());
        let body = response
            .text()
            .await
            .with_context(|| format!("failed reading response body: {url}"))?;
        let elapsed = started.elapsed();
        debug!(
            "{} fetch of {url} -> {final_url} ({status}, {} bytes, {:.3}s)",
            self.profile.label(),
            body.len(),
            elapsed.as_secs_f64()
        );
        Ok(FetchedPage {
            final_url,
            status,
            headers,
            body,
            elapsed,
        })
    }

    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .timeout(self.asset_timeout)
            .send()
            .await
            .with_context(|| format!("failed GET request: {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GET {url} returned {status}: {}", preview(&body)));
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed reading asset body: {url}"))?;
        Ok(bytes.to_vec())
    }
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("none"));
    headers
}
