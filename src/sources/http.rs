use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 6;
const BODY_PREVIEW_CHARS: usize = 180;

pub static API_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!("WARM/", env!("CARGO_PKG_VERSION"), " (Phishing Detector)"))
        .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
        .build()
        .expect("failed to build HTTP client")
});

/// Sends a request and decodes a JSON body. A 404 comes back as
/// `(404, Value::Null)` so pollers can treat it as "not ready yet"; any other
/// non-success status is an error.
pub async fn send_json(request: RequestBuilder, label: &str) -> Result<(u16, Value)> {
    let response = request
        .send()
        .await
        .with_context(|| format!("failed request: {label}"))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("failed reading response body: {label}"))?;
    if status == StatusCode::NOT_FOUND {
        return Ok((status.as_u16(), Value::Null));
    }
    if !status.is_success() {
        return Err(anyhow!("{label} returned {status}: {}", preview(&body)));
    }
    let value = serde_json::from_str(&body)
        .with_context(|| format!("invalid JSON response: {label}"))?;
    Ok((status.as_u16(), value))
}

pub fn preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_end_matches('.').to_ascii_lowercase()))
        .filter(|h| !h.is_empty())
}

/// Best-effort registrable domain: the last two labels, or three when the
/// second-level label is a common public suffix part (`co.uk`, `com.au`).
pub fn registrable_domain(host: &str) -> String {
    let labels = host
        .trim_end_matches('.')
        .split('.')
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>();
    if labels.len() <= 2 || host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    let second_level = labels[labels.len() - 2];
    let keep = if matches!(second_level, "co" | "com" | "net" | "org" | "gov" | "ac" | "edu")
        && labels[labels.len() - 1].len() == 2
    {
        3
    } else {
        2
    };
    labels[labels.len() - keep..].join(".")
}
