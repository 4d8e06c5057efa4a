//! HTTP plumbing shared by the resolvers and the download manager.
//!
//! Everything talks to the network through [`Transport`] so tests can swap in
//! a scripted fake. [`HttpTransport`] is the real thing built on reqwest.

use crate::error::FetchError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use rand::seq::SliceRandom;
use reqwest::{
    header::{HeaderMap, HeaderValue, COOKIE, REFERER, USER_AGENT},
    Client, Url,
};
use std::{collections::HashMap, sync::Mutex, time::Duration};
use tokio::time::Instant;
use tracing::debug;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:136.0) Gecko/20100101 Firefox/136.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:136.0) Gecko/20100101 Firefox/136.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.7; rv:136.0) Gecko/20100101 Firefox/136.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.3 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36 Edg/134.0.3124.85",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:136.0) Gecko/20100101 Firefox/136.0",
];

/// A single GET.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn referer(mut self, referer: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(referer) {
            self.headers.insert(REFERER, value);
        }
        self
    }

    /// The url with the query string attached.
    pub fn full_url(&self) -> Result<Url, FetchError> {
        let parsed = if self.query.is_empty() {
            Url::parse(&self.url)
        } else {
            Url::parse_with_params(&self.url, &self.query)
        };
        parsed.map_err(|_| FetchError::InvalidUrl(self.url.clone()))
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends the request. Any non-2xx answer is reported as
    /// [`FetchError::Status`]; a 2xx answer yields the body as a stream.
    async fn get(&self, request: Request) -> Result<ByteStream, FetchError>;
}

/// Options for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    /// Value of the `mangabz_lang` cookie, 2 for simplified and 1 for
    /// traditional chinese.
    pub language: u8,
    pub user_agent: Option<String>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            language: 2,
            user_agent: None,
        }
    }
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(options: &HttpOptions) -> anyhow::Result<Self> {
        let user_agent = options
            .user_agent
            .clone()
            .or_else(|| {
                USER_AGENTS
                    .choose(&mut rand::thread_rng())
                    .map(|ua| ua.to_string())
            })
            .unwrap_or_default();
        debug!(%user_agent, "building http client");

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(&user_agent)?);
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("mangabz_lang={}", options.language))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(options.timeout)
            .build()?;
        Ok(Self { client })
    }
}

fn classify(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(url.to_string())
    } else if err.is_builder() {
        FetchError::InvalidUrl(url.to_string())
    } else if err.is_body() || err.is_decode() {
        FetchError::Body {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        FetchError::Connect {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: Request) -> Result<ByteStream, FetchError> {
        let url = request.full_url()?;
        let shown = url.to_string();
        let response = self
            .client
            .get(url)
            .headers(request.headers)
            .send()
            .await
            .map_err(|e| classify(&shown, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: shown,
                status: status.as_u16(),
            });
        }

        Ok(response
            .bytes_stream()
            .map_err(move |e| classify(&shown, e))
            .boxed())
    }
}

/// Fetched page text held for the caller, keyed by full url.
///
/// Entries live for `ttl`; callers can drop single entries or everything.
#[derive(Debug)]
pub struct PageCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, String)>>,
}

impl PageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, url: &str) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        let fresh = entries
            .get(url)
            .filter(|(stored, _)| stored.elapsed() < self.ttl)
            .map(|(_, text)| text.clone());
        if fresh.is_none() {
            entries.remove(url);
        }
        fresh
    }

    pub fn insert(&self, url: &str, text: String) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(url.to_string(), (Instant::now(), text));
        }
    }

    pub fn invalidate(&self, url: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(url);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// GETs `request` and decodes the body as text, consulting `cache` first
/// when one is given.
pub async fn fetch_text<T: Transport + ?Sized>(
    transport: &T,
    request: Request,
    cache: Option<&PageCache>,
) -> Result<String, FetchError> {
    let key = request.full_url()?.to_string();
    if let Some(text) = cache.and_then(|cache| cache.get(&key)) {
        debug!(url = %key, "page served from cache");
        return Ok(text);
    }

    let mut body = transport.get(request).await?;
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    let text = String::from_utf8_lossy(&bytes).into_owned();

    if let Some(cache) = cache {
        cache.insert(&key, text.clone());
    }
    Ok(text)
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTransport;
    use super::*;

    #[test]
    fn full_url_appends_query() -> anyhow::Result<()> {
        let request = Request::get("https://mangabz.com/m1/chapterimage.ashx")
            .query("cid", 1)
            .query("key", "");
        assert_eq!(
            request.full_url()?.as_str(),
            "https://mangabz.com/m1/chapterimage.ashx?cid=1&key="
        );
        Ok(())
    }

    #[test]
    fn full_url_rejects_garbage() {
        assert_eq!(
            Request::get("not a url").full_url(),
            Err(FetchError::InvalidUrl("not a url".into()))
        );
    }

    #[tokio::test]
    async fn fetch_text_uses_cache() -> anyhow::Result<()> {
        let transport = FakeTransport::new();
        transport
            .ok("https://mangabz.com/1bz/", "first")
            .ok("https://mangabz.com/1bz/", "second");
        let cache = PageCache::new(Duration::from_secs(60));

        let request = Request::get("https://mangabz.com/1bz/");
        assert_eq!(fetch_text(&transport, request.clone(), Some(&cache)).await?, "first");
        assert_eq!(fetch_text(&transport, request.clone(), Some(&cache)).await?, "first");
        assert_eq!(transport.call_count(), 1);

        cache.invalidate("https://mangabz.com/1bz/");
        assert_eq!(fetch_text(&transport, request, Some(&cache)).await?, "second");
        assert_eq!(transport.call_count(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let cache = PageCache::new(Duration::from_secs(5));
        cache.insert("u", "text".into());
        assert_eq!(cache.get("u").as_deref(), Some("text"));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("u"), None);
    }

    #[test]
    fn clear_drops_everything() {
        let cache = PageCache::new(Duration::from_secs(5));
        cache.insert("a", "1".into());
        cache.insert("b", "2".into());
        cache.clear();
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), None);
    }
}
