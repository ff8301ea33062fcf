//! Static page features: hashes, title, favicon location, forms, resource
//! counts, meta tags and security headers.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::features::{FeatureMapping, FeatureSetBuilder, FeatureValue};
use crate::sources::http::sha256_hex;
use crate::sources::FetchedPage;

pub const DEFAULT_FAVICON_PATH: &str = "/favicon.ico";

pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("hdr_hsts", "strict-transport-security"),
    ("hdr_csp", "content-security-policy"),
    ("hdr_xfo", "x-frame-options"),
    ("hdr_xxp", "x-xss-protection"),
    ("hdr_xcto", "x-content-type-options"),
];

static TITLE: Lazy<Selector> = Lazy::new(|| selector("title"));
static ICON_LINKS: Lazy<Selector> = Lazy::new(|| selector("link[rel][href]"));
static FORMS: Lazy<Selector> = Lazy::new(|| selector("form"));
static PASSWORD_INPUTS: Lazy<Selector> = Lazy::new(|| selector("input[type=password]"));
static SCRIPTS: Lazy<Selector> = Lazy::new(|| selector("script[src]"));
static LINKS: Lazy<Selector> = Lazy::new(|| selector("link[href]"));
static IMAGES: Lazy<Selector> = Lazy::new(|| selector("img[src]"));
static META_DESCRIPTION: Lazy<Selector> = Lazy::new(|| selector("meta[name=description]"));
static META_ROBOTS: Lazy<Selector> = Lazy::new(|| selector("meta[name=robots]"));
static STYLE_BLOCKS: Lazy<Selector> = Lazy::new(|| selector("style"));

static TITLE_FONT_RULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:title|\.page-title)[^{]*\{[^}]*font-family\s*:\s*([^;}]+)")
        .expect("valid title font regex")
});

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|err| panic!("invalid selector {css}: {err:?}"))
}

pub fn extract_features(html: &str, base_url: &str) -> FeatureMapping {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    let mut builder = FeatureSetBuilder::new();

    builder.insert("title", extract_title(&document));
    builder.insert("html_sha256", sha256_hex(html.as_bytes()));
    builder.insert("html_size", html.len());
    builder.insert("favicon_url", favicon_url(&document, base.as_ref()));

    let forms = document.select(&FORMS).collect::<Vec<_>>();
    let password_fields = forms
        .iter()
        .map(|form| form.select(&PASSWORD_INPUTS).count())
        .sum::<usize>();
    builder.insert("form_count", forms.len());
    builder.insert("password_fields", password_fields);

    let counts = ResourceCounts::collect(&document, base.as_ref());
    builder.insert("js", counts.js);
    builder.insert("css", counts.css);
    builder.insert("img", counts.img);
    builder.insert("ext_js", counts.ext_js);
    builder.insert("ext_css", counts.ext_css);
    builder.insert("ext_img", counts.ext_img);

    let description_len = first_attr(&document, &META_DESCRIPTION, "content")
        .map(|content| content.chars().count())
        .unwrap_or(0);
    builder.insert("meta_description_len", description_len);
    builder.insert(
        "meta_robots",
        FeatureValue::text_or_unavailable(first_attr(&document, &META_ROBOTS, "content")),
    );
    builder.insert("title_font", FeatureValue::text_or_unavailable(title_font(&document)));

    builder.build()
}

pub fn extract_response_features(page: &FetchedPage) -> FeatureMapping {
    SECURITY_HEADERS
        .iter()
        .map(|(key, header)| (*key, FeatureValue::text_or_unavailable(page.header(header))))
        .collect()
}

fn extract_title(document: &Html) -> FeatureValue {
    let text = document
        .select(&TITLE)
        .next()
        .map(|title| collapse_whitespace(&title.text().collect::<String>()));
    FeatureValue::text_or_unavailable(text)
}

fn favicon_url(document: &Html, base: Option<&Url>) -> FeatureValue {
    let href = document
        .select(&ICON_LINKS)
        .find(|link| {
            link.value()
                .attr("rel")
                .map(|rel| rel.to_ascii_lowercase().contains("icon"))
                .unwrap_or(false)
        })
        .and_then(|link| link.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .unwrap_or(DEFAULT_FAVICON_PATH);
    match resolve(base, href) {
        Some(url) => FeatureValue::Text(url.to_string()),
        None => FeatureValue::Unavailable,
    }
}

fn title_font(document: &Html) -> Option<String> {
    let inline = document
        .select(&TITLE)
        .next()
        .and_then(|title| title.value().attr("style"))
        .and_then(|style| {
            style.split(';').find_map(|decl| {
                let (name, value) = decl.split_once(':')?;
                (name.trim().eq_ignore_ascii_case("font-family")).then(|| value.trim().to_string())
            })
        });
    if inline.is_some() {
        return inline;
    }
    document.select(&STYLE_BLOCKS).find_map(|block| {
        let css = block.text().collect::<String>();
        TITLE_FONT_RULE
            .captures(&css)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
    })
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ResourceCounts {
    js: usize,
    css: usize,
    img: usize,
    ext_js: usize,
    ext_css: usize,
    ext_img: usize,
}

impl ResourceCounts {
    fn collect(document: &Html, base: Option<&Url>) -> Self {
        let mut counts = Self::default();
        for script in document.select(&SCRIPTS) {
            if let Some(url) = resource_url(&script, "src", base) {
                if has_extension(&url, "js") {
                    counts.js += 1;
                    counts.ext_js += usize::from(is_external(&url, base));
                }
            }
        }
        for link in document.select(&LINKS) {
            let is_stylesheet = link
                .value()
                .attr("rel")
                .map(|rel| {
                    rel.split_ascii_whitespace()
                        .any(|r| r.eq_ignore_ascii_case("stylesheet"))
                })
                .unwrap_or(false);
            if !is_stylesheet {
                continue;
            }
            if let Some(url) = resource_url(&link, "href", base) {
                if has_extension(&url, "css") {
                    counts.css += 1;
                    counts.ext_css += usize::from(is_external(&url, base));
                }
            }
        }
        for image in document.select(&IMAGES) {
            if let Some(url) = resource_url(&image, "src", base) {
                counts.img += 1;
                counts.ext_img += usize::from(is_external(&url, base));
            }
        }
        counts
    }
}

fn resource_url(element: &ElementRef<'_>, attr: &str, base: Option<&Url>) -> Option<Url> {
    let raw = element.value().attr(attr)?.trim();
    if raw.is_empty() {
        return None;
    }
    resolve(base, raw)
}

fn resolve(base: Option<&Url>, href: &str) -> Option<Url> {
    match Url::parse(href) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => base.and_then(|b| b.join(href).ok()),
        Err(_) => None,
    }
}

fn has_extension(url: &Url, ext: &str) -> bool {
    url.path()
        .rsplit_once('.')
        .map(|(_, found)| found.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

fn is_external(url: &Url, base: Option<&Url>) -> bool {
    match base {
        Some(base) => url.host_str() != base.host_str() || url.port() != base.port(),
        None => true,
    }
}

fn first_attr<'a>(document: &'a Html, selector: &Selector, attr: &str) -> Option<&'a str> {
    document
        .select(selector)
        .find_map(|element| element.value().attr(attr))
        .filter(|value| !value.trim().is_empty())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
