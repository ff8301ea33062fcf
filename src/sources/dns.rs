use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use crate::features::{FeatureMapping, FeatureValue};
use crate::sources::HostEnricher;

pub const DNS_KEYS: &[&str] = &["dns_ips", "dns_ttl"];

pub struct DnsEnricher {
    resolver: TokioAsyncResolver,
}

impl DnsEnricher {
    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }

    pub fn from_system_conf() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            debug!("system resolver config unavailable ({err}), using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

#[async_trait]
impl HostEnricher for DnsEnricher {
    fn stage(&self) -> &'static str {
        "dns"
    }

    fn keys(&self) -> &'static [&'static str] {
        DNS_KEYS
    }

    async fn lookup(&self, host: &str) -> Result<FeatureMapping> {
        let answer = self
            .resolver
            .lookup(host, RecordType::A)
            .await
            .with_context(|| format!("A lookup failed for {host}"))?;
        let ips = answer
            .iter()
            .filter_map(|rdata| match rdata {
                RData::A(a) => Some(a.to_string()),
                _ => None,
            })
            .collect::<Vec<_>>();
        let ttl = answer
            .record_iter()
            .filter(|record| record.record_type() == RecordType::A)
            .map(|record| record.ttl())
            .min();
        Ok(dns_features(ips, ttl))
    }
}

pub fn dns_features(mut ips: Vec<String>, ttl: Option<u32>) -> FeatureMapping {
    ips.sort();
    ips.dedup();
    let joined = (!ips.is_empty()).then(|| ips.join(", "));
    FeatureMapping::from_iter([
        ("dns_ips", FeatureValue::from(joined)),
        ("dns_ttl", FeatureValue::from(ttl.map(i64::from))),
    ])
}
