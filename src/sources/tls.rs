use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ProtocolVersion, RootCertStore};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::*;

use crate::features::{FeatureMapping, FeatureSetBuilder, FeatureValue};
use crate::sources::HostEnricher;

const TLS_PORT: u16 = 443;

pub const TLS_KEYS: &[&str] = &[
    "tls_issuer",
    "tls_valid_from",
    "tls_valid_until",
    "tls_days_left",
    "tls_protocol",
    "tls_fingerprint_sha256",
];

static CLIENT_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .expect("ring provider supports default TLS versions")
            .with_root_certificates(roots)
            .with_no_client_auth();
    Arc::new(config)
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    pub issuer: Option<String>,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
    pub days_left: Option<i64>,
    pub fingerprint_sha256: String,
}

#[derive(Debug, Clone)]
pub struct TlsEnricher {
    timeout: Duration,
}

impl TlsEnricher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HostEnricher for TlsEnricher {
    fn stage(&self) -> &'static str {
        "tls"
    }

    fn keys(&self) -> &'static [&'static str] {
        TLS_KEYS
    }

    async fn lookup(&self, host: &str) -> Result<FeatureMapping> {
        let server_name = ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid TLS server name: {host}"))?;
        let tcp = timeout(self.timeout, TcpStream::connect((host, TLS_PORT)))
            .await
            .with_context(|| format!("TCP connect to {host}:{TLS_PORT} timed out"))?
            .with_context(|| format!("TCP connect to {host}:{TLS_PORT} failed"))?;
        let connector = TlsConnector::from(Arc::clone(&CLIENT_CONFIG));
        let stream = timeout(self.timeout, connector.connect(server_name, tcp))
            .await
            .with_context(|| format!("TLS handshake with {host} timed out"))?
            .with_context(|| format!("TLS handshake with {host} failed"))?;

        let (_, session) = stream.get_ref();
        let protocol = session.protocol_version().map(describe_protocol);
        let leaf = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| anyhow!("{host} presented no certificate"))?;
        let summary = summarize_certificate(leaf.as_ref(), Utc::now())?;

        let mut builder = FeatureSetBuilder::new();
        builder.insert("tls_issuer", FeatureValue::text_or_unavailable(summary.issuer));
        builder.insert("tls_valid_from", summary.valid_from);
        builder.insert("tls_valid_until", summary.valid_until);
        builder.insert("tls_days_left", summary.days_left);
        builder.insert("tls_protocol", protocol);
        builder.insert("tls_fingerprint_sha256", summary.fingerprint_sha256);
        Ok(builder.build())
    }
}

pub fn summarize_certificate(der: &[u8], now: DateTime<Utc>) -> Result<CertificateSummary> {
    let (_, cert) =
        parse_x509_certificate(der).map_err(|err| anyhow!("invalid certificate: {err}"))?;
    let issuer = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .or_else(|| {
            cert.issuer()
                .iter_organization()
                .next()
                .and_then(|o| o.as_str().ok())
        })
        .map(str::to_string);
    let not_before = DateTime::<Utc>::from_timestamp(cert.validity().not_before.timestamp(), 0);
    let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0);

    Ok(CertificateSummary {
        issuer,
        valid_from: not_before.map(|t| t.date_naive()),
        valid_until: not_after.map(|t| t.date_naive()),
        days_left: not_after.map(|t| days_between(now, t)),
        fingerprint_sha256: fingerprint(der),
    })
}

pub fn days_between(now: DateTime<Utc>, until: DateTime<Utc>) -> i64 {
    (until - now).num_days()
}

pub fn describe_protocol(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        ProtocolVersion::TLSv1_1 => "TLSv1.1".to_string(),
        ProtocolVersion::TLSv1_0 => "TLSv1".to_string(),
        other => format!("{other:?}"),
    }
}

fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rustls::ProtocolVersion;

    use crate::sources::tls::{days_between, describe_protocol, fingerprint, summarize_certificate};

    #[test]
    fn protocol_names_follow_openssl_style() {
        assert_eq!(describe_protocol(ProtocolVersion::TLSv1_3), "TLSv1.3");
        assert_eq!(describe_protocol(ProtocolVersion::TLSv1_2), "TLSv1.2");
    }

    #[test]
    fn days_left_truncates_and_goes_negative_after_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 31, 11, 0, 0).unwrap();
        assert_eq!(days_between(now, later), 29);
        let earlier = Utc.with_ymd_and_hms(2023, 12, 20, 12, 0, 0).unwrap();
        assert_eq!(days_between(now, earlier), -12);
    }

    #[test]
    fn fingerprint_is_uppercase_sha256() {
        let fp = fingerprint(b"abc");
        assert_eq!(fp.len(), 64);
        assert!(fp.starts_with("BA7816BF"));
    }

    #[test]
    fn garbage_der_is_rejected() {
        assert!(summarize_certificate(b"not a certificate", Utc::now()).is_err());
    }
}
