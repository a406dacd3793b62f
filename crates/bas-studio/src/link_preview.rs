// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OpenGraph link previews, cached per URL.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use bas_core::{Cache, TtlCache};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Only the document head matters; larger bodies are cut.
const MAX_HTML_BYTES: usize = 1024 * 1024;

static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid meta regex"));
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z_:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid attribute regex")
});
static TITLE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title regex"));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

#[derive(Clone)]
pub struct LinkPreviewService {
    client: reqwest::Client,
    cache: Arc<dyn Cache<String, LinkPreview>>,
}

impl LinkPreviewService {
    pub fn new(cache: Arc<dyn Cache<String, LinkPreview>>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("bas-studio/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client, cache }
    }

    /// Service with its own one-hour cache.
    pub fn with_default_cache() -> Self {
        Self::new(Arc::new(TtlCache::new(CACHE_TTL)))
    }

    pub async fn preview(&self, raw_url: &str) -> Result<LinkPreview> {
        let raw_url = raw_url.trim();
        if raw_url.is_empty() {
            return Err(Error::MissingField("url"));
        }
        let url = Url::parse(raw_url)
            .map_err(|e| Error::InvalidRequest(format!("invalid url '{}': {}", raw_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidRequest(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        let key = url.to_string();
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::RequestTimeout(format!("link preview of {}", url))
            } else {
                Error::Upstream(format!("link preview fetch failed: {}", e))
            }
        })?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "link preview fetch returned status {}",
                response.status()
            )));
        }
        let final_url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Upstream(format!("link preview body: {}", e)))?;
        let html = String::from_utf8_lossy(&body[..body.len().min(MAX_HTML_BYTES)]);

        let preview = parse_preview(&key, &final_url, &html);
        debug!(url = %key, has_title = preview.title.is_some(), "Link preview fetched");
        self.cache.set(key, preview.clone());
        Ok(preview)
    }
}

fn parse_preview(requested: &str, base: &Url, html: &str) -> LinkPreview {
    let mut og: HashMap<String, String> = HashMap::new();
    for tag in META_TAG.find_iter(html) {
        let mut key = None;
        let mut content = None;
        for attr in ATTRIBUTE.captures_iter(tag.as_str()) {
            let value = attr.get(2).or_else(|| attr.get(3)).map(|m| m.as_str());
            match attr[1].to_ascii_lowercase().as_str() {
                "property" | "name" => key = value.map(|v| v.to_ascii_lowercase()),
                "content" => content = value,
                _ => {}
            }
        }
        if let (Some(key), Some(content)) = (key, content)
            && key.starts_with("og:")
        {
            og.entry(key).or_insert_with(|| decode_entities(content.trim()));
        }
    }

    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
    let title = non_empty(og.remove("og:title")).or_else(|| {
        TITLE_TAG
            .captures(html)
            .map(|c| decode_entities(c[1].trim()))
            .filter(|t| !t.is_empty())
    });
    let image = non_empty(og.remove("og:image"))
        .map(|image| base.join(&image).map(|u| u.to_string()).unwrap_or(image));

    LinkPreview {
        url: requested.to_string(),
        title,
        description: non_empty(og.remove("og:description")),
        image,
        site_name: non_empty(og.remove("og:site_name")),
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_open_graph_tags() {
        let html = r#"<html><head>
            <title>Fallback</title>
            <meta content="Rust &amp; friends" property="og:title">
            <meta property='og:description' content='All about crates'>
            <meta property="og:image" content="/img/card.png" />
            <meta property="og:site_name" content="Example">
        </head></html>"#;
        let base = Url::parse("https://example.com/post/1").unwrap();
        let preview = parse_preview("https://example.com/post/1", &base, html);
        assert_eq!(preview.title.as_deref(), Some("Rust & friends"));
        assert_eq!(preview.description.as_deref(), Some("All about crates"));
        assert_eq!(preview.image.as_deref(), Some("https://example.com/img/card.png"));
        assert_eq!(preview.site_name.as_deref(), Some("Example"));
    }

    #[test]
    fn test_title_fallback() {
        let base = Url::parse("https://example.com").unwrap();
        let preview = parse_preview("https://example.com", &base, "<title> Plain page </title>");
        assert_eq!(preview.title.as_deref(), Some("Plain page"));
        assert!(preview.image.is_none());
    }

    #[tokio::test]
    async fn test_preview_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<meta property="og:title" content="Cached">"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let service = LinkPreviewService::with_default_cache();
        let url = format!("{}/article", server.uri());
        let first = service.preview(&url).await.unwrap();
        let second = service.preview(&url).await.unwrap();
        assert_eq!(first.title.as_deref(), Some("Cached"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_preview_rejects_bad_urls() {
        let service = LinkPreviewService::with_default_cache();
        assert!(matches!(service.preview("").await, Err(Error::MissingField("url"))));
        assert!(matches!(
            service.preview("ftp://example.com").await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(service.preview("not a url").await, Err(Error::InvalidRequest(_))));
    }
}
