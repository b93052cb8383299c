//! Source adapter contract plus the Axonaut and fixture-file implementations.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ledgersync_core::{EntityKind, SourceInvoice, SourcePayment};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const DEFAULT_AXONAUT_API_BASE: &str = "https://axonaut.com/api/v2";
pub const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 1000;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Read-only access to the accounting system's records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_invoices(&self) -> Result<Fetched<SourceInvoice>, FetchError>;

    async fn fetch_payments(&self) -> Result<Fetched<SourcePayment>, FetchError>;
}

/// Decoded records from one listing plus the count of items dropped as undecodable.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub records: Vec<T>,
    pub skipped: usize,
}

impl<T> Fetched<T> {
    pub fn new(records: Vec<T>) -> Self {
        Self {
            records,
            skipped: 0,
        }
    }

    /// Every item upstream returned, decodable or not.
    pub fn total(&self) -> usize {
        self.records.len() + self.skipped
    }

    fn extend(&mut self, other: Fetched<T>) {
        self.records.extend(other.records);
        self.skipped += other.skipped;
    }
}

impl<T> Default for Fetched<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub struct AxonautConfig {
    pub base_url: String,
    pub api_key: String,
    pub page_size: usize,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl AxonautConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_AXONAUT_API_BASE.to_string(),
            api_key: api_key.into(),
            page_size: DEFAULT_PAGE_SIZE,
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct AxonautSource {
    client: reqwest::Client,
    config: AxonautConfig,
}

impl AxonautSource {
    pub fn new(config: AxonautConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building axonaut http client")?;
        Ok(Self { client, config })
    }

    /// Fetches every page of `resource` and flattens it, in upstream order.
    ///
    /// Items whose `id` was already seen on an earlier page are dropped, and a
    /// page made only of such items ends the listing.
    async fn fetch_all<T: DeserializeOwned>(
        &self,
        resource: &str,
    ) -> Result<Fetched<T>, FetchError> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), resource);
        let limit = self.config.page_size.max(1);
        let span = info_span!("axonaut_fetch", resource);

        async {
            let mut out = Fetched::default();
            let mut seen = HashSet::new();

            for page in 1..=MAX_PAGES {
                let items = self.fetch_page(&url, limit, page).await?;
                let page_len = items.len();
                let fresh: Vec<JsonValue> = items
                    .into_iter()
                    .filter(|item| seen.insert(identity(item)))
                    .collect();
                debug!(page, page_len, fresh = fresh.len(), "fetched page");

                if page_len > 0 && fresh.is_empty() {
                    warn!(page, "page repeats records already fetched; upstream may be ignoring `page`");
                    return Ok(out);
                }
                out.extend(decode_records(resource, fresh));

                if page_len < limit {
                    return Ok(out);
                }
            }

            warn!(max_pages = MAX_PAGES, "page cap reached; upstream may be ignoring `page`");
            Ok::<_, FetchError>(out)
        }
        .instrument(span)
        .await
    }

    async fn fetch_page(
        &self,
        url: &str,
        limit: usize,
        page: usize,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("limit", limit), ("page", page)])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, url, resp).await);
        }

        let body: JsonValue = resp.json().await.map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        match body {
            JsonValue::Array(items) => Ok(items),
            other => Err(FetchError::Decode {
                url: url.to_string(),
                message: format!("expected a JSON array, got {}", json_kind(&other)),
            }),
        }
    }
}

async fn status_error(status: StatusCode, url: &str, resp: reqwest::Response) -> FetchError {
    let body = resp.text().await.unwrap_or_default();
    FetchError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
        body,
    }
}

/// The upstream `id` when present, otherwise the whole item.
fn identity(item: &JsonValue) -> String {
    match item.get("id") {
        Some(id) if !id.is_null() => id.to_string(),
        _ => item.to_string(),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Decodes each item on its own; items that are not records are logged and counted.
pub fn decode_records<T: DeserializeOwned>(resource: &str, items: Vec<JsonValue>) -> Fetched<T> {
    let mut out = Fetched::default();
    for (position, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<T>(item) {
            Ok(record) => out.records.push(record),
            Err(err) => {
                warn!(resource, position, error = %err, "skipping undecodable source record");
                out.skipped += 1;
            }
        }
    }
    out
}

#[async_trait]
impl RecordSource for AxonautSource {
    fn source_id(&self) -> &'static str {
        "axonaut"
    }

    async fn fetch_invoices(&self) -> Result<Fetched<SourceInvoice>, FetchError> {
        self.fetch_all(EntityKind::Invoices.as_str()).await
    }

    async fn fetch_payments(&self) -> Result<Fetched<SourcePayment>, FetchError> {
        self.fetch_all(EntityKind::Payments.as_str()).await
    }
}

/// Reads `invoices.json` and `payments.json` (JSON arrays shaped like the API
/// responses) from a directory. Selected for offline runs.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn load<T: DeserializeOwned>(&self, kind: EntityKind) -> Result<Fetched<T>, FetchError> {
        let path = self.root.join(format!("{}.json", kind.as_str()));
        load_fixture_records(&path).map_err(|e| FetchError::Decode {
            url: path.display().to_string(),
            message: format!("{e:#}"),
        })
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_invoices(&self) -> Result<Fetched<SourceInvoice>, FetchError> {
        self.load(EntityKind::Invoices)
    }

    async fn fetch_payments(&self) -> Result<Fetched<SourcePayment>, FetchError> {
        self.load(EntityKind::Payments)
    }
}

pub fn load_fixture_records<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Fetched<T>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let items: Vec<JsonValue> =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    let resource = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("fixture");
    Ok(decode_records(resource, items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source_for(server: &MockServer, page_size: usize) -> AxonautSource {
        let mut config = AxonautConfig::new("axo-key");
        config.base_url = format!("{}/api/v2", server.uri());
        config.page_size = page_size;
        config.timeout = Duration::from_secs(5);
        AxonautSource::new(config).expect("source")
    }

    fn make_invoices(count: usize, offset: usize) -> Vec<JsonValue> {
        (0..count)
            .map(|i| {
                json!({
                    "id": i + offset,
                    "number": format!("INV-{:03}", i + offset),
                    "amount_ttc": 120.0,
                    "date": "2025-01-10"
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn fetch_single_page() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/invoices"))
            .and(query_param("limit", "10"))
            .and(query_param("page", "1"))
            .and(header("authorization", "Bearer axo-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(make_invoices(3, 1)))
            .expect(1)
            .mount(&server)
            .await;

        let invoices = source_for(&server, 10).fetch_invoices().await.unwrap().records;
        assert_eq!(invoices.len(), 3);
        assert_eq!(invoices[0].number.as_deref(), Some("INV-001"));
    }

    #[tokio::test]
    async fn fetch_multiple_pages_in_order() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/invoices"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(make_invoices(2, 0)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/invoices"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(make_invoices(2, 2)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/invoices"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(make_invoices(1, 4)))
            .mount(&server)
            .await;

        let invoices = source_for(&server, 2).fetch_invoices().await.unwrap().records;
        let ids: Vec<_> = invoices.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    }

    #[tokio::test]
    async fn full_last_page_is_followed_by_empty_page() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/payments"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "reference": "PAY-1"},
                {"id": 2, "reference": "PAY-2"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/payments"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let payments = source_for(&server, 2).fetch_payments().await.unwrap();
        assert_eq!(payments.records.len(), 2);
    }

    #[tokio::test]
    async fn stops_when_upstream_ignores_page() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/invoices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "number": "INV-001"},
                {"id": 2, "number": "INV-002"}
            ])))
            .expect(2)
            .mount(&server)
            .await;

        let invoices = source_for(&server, 2).fetch_invoices().await.unwrap();
        let numbers: Vec<_> = invoices
            .records
            .iter()
            .map(|i| i.number.as_deref().unwrap_or_default())
            .collect();
        assert_eq!(numbers, vec!["INV-001", "INV-002"]);
        assert_eq!(invoices.skipped, 0);
    }

    #[tokio::test]
    async fn overlapping_page_keeps_only_new_ids() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/invoices"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(make_invoices(2, 0)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/invoices"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(make_invoices(1, 1)))
            .mount(&server)
            .await;

        let invoices = source_for(&server, 2).fetch_invoices().await.unwrap().records;
        let ids: Vec<_> = invoices.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![Some(0), Some(1)]);
    }

    #[tokio::test]
    async fn non_object_items_are_skipped() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/payments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "reference": "PAY-1", "amount": "oops"},
                "not-a-record",
                {"id": 3, "reference": "PAY-3"}
            ])))
            .mount(&server)
            .await;

        let fetched = source_for(&server, 50).fetch_payments().await.unwrap();
        assert_eq!(fetched.skipped, 1);
        assert_eq!(fetched.total(), 3);
        let payments = fetched.records;
        assert_eq!(payments.len(), 2);
        assert_eq!(payments[0].amount, None);
        assert_eq!(payments[1].reference.as_deref(), Some("PAY-3"));
    }

    #[tokio::test]
    async fn fails_on_401() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/invoices"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = source_for(&server, 10).fetch_invoices().await.unwrap_err();
        match err {
            FetchError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("expected HttpStatus, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn object_body_is_decode_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/invoices"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"error": "maintenance"})),
            )
            .mount(&server)
            .await;

        let err = source_for(&server, 10).fetch_invoices().await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[tokio::test]
    async fn unreachable_host_is_request_error() {
        let mut config = AxonautConfig::new("axo-key");
        config.base_url = "http://127.0.0.1:9".to_string();
        config.timeout = Duration::from_secs(2);
        let source = AxonautSource::new(config).expect("source");

        let err = source.fetch_invoices().await.unwrap_err();
        assert!(matches!(err, FetchError::Request(_)));
    }
}
