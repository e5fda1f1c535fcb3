//! Quotes endpoint requests: URL construction and authenticated GETs with retries.
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::DateTime;
use quote_store::{log_failure, RetryPolicy};
use reqwest::{blocking::Client, header, Url};
use serde::Deserialize;
use tracing::{debug, trace};

pub const DEFAULT_DOMAIN: &str = "data.alpaca.markets";
const KEY_ID_HEADER: &str = "APCA-API-KEY-ID";
const SECRET_KEY_HEADER: &str = "APCA-API-SECRET-KEY";

fn default_scheme() -> String {
    "https".to_string()
}
fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}
fn default_symbol() -> String {
    "QQQ".to_string()
}
fn default_start() -> String {
    "2016-01-01T00:00:00Z".to_string()
}
fn default_limit() -> u32 {
    1000
}
fn default_feed() -> String {
    "sip".to_string()
}
fn default_sort() -> String {
    "asc".to_string()
}
fn default_max_pages() -> u32 {
    1
}
fn default_timeout_secs() -> u64 {
    30
}

/// Parameters of a historical quotes download.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QuotesRequest {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// RFC3339 start of the requested window.
    #[serde(default = "default_start")]
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    /// Quotes per page.
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default = "default_feed")]
    pub feed: String,
    #[serde(default = "default_sort")]
    pub sort: String,
    /// Pages to follow through `next_page_token` in one run.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for QuotesRequest {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            domain: default_domain(),
            symbol: default_symbol(),
            start: default_start(),
            end: None,
            limit: default_limit(),
            feed: default_feed(),
            sort: default_sort(),
            max_pages: default_max_pages(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl QuotesRequest {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            bail!("request.symbol must not be empty");
        }
        if self.limit == 0 || self.max_pages == 0 {
            bail!("request.limit and request.max_pages must be at least 1");
        }
        DateTime::parse_from_rfc3339(&self.start)
            .with_context(|| format!("request.start '{}' is not RFC3339", self.start))?;
        if let Some(end) = &self.end {
            DateTime::parse_from_rfc3339(end)
                .with_context(|| format!("request.end '{end}' is not RFC3339"))?;
        }
        Ok(())
    }

    /// `<scheme>://<domain>/v2/stocks/<symbol>/quotes?start=..&limit=..&feed=..&sort=..`, with
    /// `end` and `page_token` added when present.
    pub fn url(&self, page_token: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&format!("{}://{}", self.scheme, self.domain))
            .with_context(|| format!("invalid endpoint {}://{}", self.scheme, self.domain))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("{} cannot be used as a base URL", self.domain))?
            .pop_if_empty()
            .extend(["v2", "stocks", self.symbol.as_str(), "quotes"]);

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("start", &self.start);
            if let Some(end) = &self.end {
                query.append_pair("end", end);
            }
            query
                .append_pair("limit", &self.limit.to_string())
                .append_pair("feed", &self.feed)
                .append_pair("sort", &self.sort);
            if let Some(token) = page_token {
                query.append_pair("page_token", token);
            }
        }
        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// API key pair sent with every request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub key_id: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key_id", &self.key_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// One authenticated GET of `url`. A non-success status is an error carrying the response body.
pub fn fetch_raw(client: &Client, url: &Url, credentials: &Credentials) -> Result<String> {
    debug!(%url, "GET");
    let response = client
        .get(url.clone())
        .header(KEY_ID_HEADER, &credentials.key_id)
        .header(SECRET_KEY_HEADER, &credentials.secret_key)
        .header(header::ACCEPT, "application/json")
        .send()
        .with_context(|| format!("request to {} failed", url.path()))?;

    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("reading response from {} failed", url.path()))?;
    if !status.is_success() {
        bail!("{} returned {}: {}", url.path(), status, body.trim());
    }
    trace!(bytes = body.len(), "Response received");
    Ok(body)
}

/// [`fetch_raw`] under `policy`, labelled "quote download".
pub fn fetch_with_retries(
    client: &Client,
    url: &Url,
    credentials: &Credentials,
    policy: &RetryPolicy,
) -> Result<String> {
    Ok(policy.execute(
        "quote download",
        |_| fetch_raw(client, url, credentials),
        log_failure,
    )?)
}
