use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::task;
use tokio::time::timeout;
use whois_rust::{WhoIs, WhoIsLookupOptions};

use crate::features::{FeatureMapping, FeatureSetBuilder, FeatureValue};
use crate::sources::http::registrable_domain;
use crate::sources::HostEnricher;

pub const WHOIS_KEYS: &[&str] = &[
    "whois_registrar",
    "whois_created_on",
    "whois_age_years",
    "whois_expiry_date",
    "whois_days_to_expiry",
    "whois_org",
    "whois_country",
];

const WHOIS_SERVERS: &str = r#"{
    "com": "whois.verisign-grs.com",
    "net": "whois.verisign-grs.com",
    "org": "whois.pir.org",
    "info": "whois.afilias.net",
    "biz": "whois.nic.biz",
    "io": "whois.nic.io",
    "ai": "whois.nic.ai",
    "co": "whois.nic.co",
    "me": "whois.nic.me",
    "app": "whois.nic.google",
    "dev": "whois.nic.google",
    "xyz": "whois.nic.xyz",
    "top": "whois.nic.top",
    "online": "whois.nic.online",
    "site": "whois.nic.site",
    "uk": "whois.nic.uk",
    "de": "whois.denic.de",
    "fr": "whois.nic.fr",
    "nl": "whois.domain-registry.nl",
    "eu": "whois.eu",
    "ru": "whois.tcinet.ru",
    "au": "whois.auda.org.au",
    "ca": "whois.cira.ca"
}"#;

static REGISTRAR: Lazy<Regex> = Lazy::new(|| field_regex(&["registrar", "registrar name"]));
static CREATED: Lazy<Regex> = Lazy::new(|| {
    field_regex(&[
        "creation date",
        "created",
        "created on",
        "registered on",
        "registered",
        "domain registration date",
    ])
});
static EXPIRES: Lazy<Regex> = Lazy::new(|| {
    field_regex(&[
        "registry expiry date",
        "registrar registration expiration date",
        "expiration date",
        "expiry date",
        "expires",
        "expires on",
        "paid-till",
    ])
});
static ORG: Lazy<Regex> =
    Lazy::new(|| field_regex(&["registrant organization", "registrant organisation", "org", "organization"]));
static COUNTRY: Lazy<Regex> = Lazy::new(|| field_regex(&["registrant country", "country"]));

fn field_regex(labels: &[&str]) -> Regex {
    let alternatives = labels
        .iter()
        .map(|label| regex::escape(label))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?im)^[ \t]*(?:{alternatives})[ \t]*:[ \t]*(\S[^\r\n]*)"))
        .unwrap_or_else(|err| panic!("invalid WHOIS field regex: {err}"))
}

#[derive(Debug, Clone)]
pub struct WhoisEnricher {
    timeout: Duration,
}

impl WhoisEnricher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HostEnricher for WhoisEnricher {
    fn stage(&self) -> &'static str {
        "whois"
    }

    fn keys(&self) -> &'static [&'static str] {
        WHOIS_KEYS
    }

    async fn lookup(&self, host: &str) -> Result<FeatureMapping> {
        let domain = registrable_domain(host);
        let query = domain.clone();
        let lookup = task::spawn_blocking(move || -> Result<String> {
            let client = WhoIs::from_string(WHOIS_SERVERS)
                .map_err(|err| anyhow!("invalid WHOIS server table: {err}"))?;
            let options = WhoIsLookupOptions::from_string(&query)
                .map_err(|err| anyhow!("invalid WHOIS target {query}: {err}"))?;
            client
                .lookup(options)
                .map_err(|err| anyhow!("WHOIS query for {query} failed: {err}"))
        });
        let text = timeout(self.timeout, lookup)
            .await
            .with_context(|| format!("WHOIS lookup for {domain} timed out"))?
            .context("WHOIS worker panicked")??;
        if text.trim().is_empty() {
            return Err(anyhow!("empty WHOIS response for {domain}"));
        }
        Ok(parse_whois_record(&text, Local::now().date_naive()))
    }
}

pub fn parse_whois_record(text: &str, today: NaiveDate) -> FeatureMapping {
    let created = capture(&CREATED, text).and_then(|v| parse_whois_date(&v));
    let expires = capture(&EXPIRES, text).and_then(|v| parse_whois_date(&v));

    let mut builder = FeatureSetBuilder::new();
    builder.insert(
        "whois_registrar",
        FeatureValue::text_or_unavailable(capture(&REGISTRAR, text)),
    );
    builder.insert("whois_created_on", created);
    builder.insert(
        "whois_age_years",
        created.map(|date| (today - date).num_days() / 365),
    );
    builder.insert("whois_expiry_date", expires);
    builder.insert(
        "whois_days_to_expiry",
        expires.map(|date| (date - today).num_days()),
    );
    builder.insert("whois_org", FeatureValue::text_or_unavailable(capture(&ORG, text)));
    builder.insert(
        "whois_country",
        FeatureValue::text_or_unavailable(capture(&COUNTRY, text)),
    );
    builder.build()
}

fn capture(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .find(|value| !value.is_empty() && !value.to_ascii_lowercase().starts_with("redacted"))
}

pub fn parse_whois_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Some(prefix) = raw.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(date);
        }
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y.%m.%d") {
            return Some(date);
        }
    }
    let first = raw.split_whitespace().next().unwrap_or(raw);
    ["%d-%b-%Y", "%d.%m.%Y", "%d/%m/%Y", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(first, fmt).ok())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use crate::features::FeatureValue;
    use crate::sources::whois::{parse_whois_date, parse_whois_record};

    const VERISIGN_STYLE: &str = "   Domain Name: EXAMPLE.COM\r
   Registry Domain ID: 2336799_DOMAIN_COM-VRSN\r
   Registrar WHOIS Server: whois.iana.org\r
   Updated Date: 2024-08-14T07:01:34Z\r
   Creation Date: 1995-08-14T04:00:00Z\r
   Registry Expiry Date: 2025-08-13T04:00:00Z\r
   Registrar: RESERVED-Internet Assigned Numbers Authority\r
Registrant Organization: REDACTED FOR PRIVACY\r
Registrant Country: US\r
";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_registry_record() {
        let features = parse_whois_record(VERISIGN_STYLE, date(2024, 9, 1));
        assert_eq!(
            features.get("whois_registrar"),
            Some(&FeatureValue::text("RESERVED-Internet Assigned Numbers Authority"))
        );
        assert_eq!(
            features.get("whois_created_on"),
            Some(&FeatureValue::Date(date(1995, 8, 14)))
        );
        assert_eq!(features.get("whois_age_years"), Some(&FeatureValue::Integer(29)));
        assert_eq!(
            features.get("whois_expiry_date"),
            Some(&FeatureValue::Date(date(2025, 8, 13)))
        );
        assert_eq!(features.get("whois_days_to_expiry"), Some(&FeatureValue::Integer(346)));
        assert_eq!(features.get("whois_org"), Some(&FeatureValue::Unavailable));
        assert_eq!(features.get("whois_country"), Some(&FeatureValue::text("US")));
    }

    #[test]
    fn missing_fields_are_unavailable() {
        let features = parse_whois_record("No match for domain \"NOPE.COM\".\n", date(2024, 1, 1));
        assert_eq!(features.len(), 7);
        assert!(features.iter().all(|(_, v)| *v == FeatureValue::Unavailable));
    }

    #[test]
    fn accepts_common_date_layouts() {
        assert_eq!(parse_whois_date("2020-02-29T00:00:00Z"), Some(date(2020, 2, 29)));
        assert_eq!(parse_whois_date("14-aug-1995"), Some(date(1995, 8, 14)));
        assert_eq!(parse_whois_date("2021.03.04"), Some(date(2021, 3, 4)));
        assert_eq!(parse_whois_date("soon"), None);
    }
}
