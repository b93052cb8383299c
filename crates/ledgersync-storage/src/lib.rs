//! Destination document-database client: the `DocumentStore` seam plus its
//! Notion implementation and property wire encoding.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use ledgersync_core::{DestinationRecord, Properties, PropertyValue, RecordId};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_NOTION_API_BASE: &str = "https://api.notion.com/v1";
pub const DEFAULT_NOTION_VERSION: &str = "2022-06-28";
const QUERY_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
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

/// Write/read access to a destination collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every live record in `collection_id`, keyed by the text of `title_property`.
    async fn query_records(
        &self,
        collection_id: &str,
        title_property: &str,
    ) -> Result<Vec<DestinationRecord>, StoreError>;

    async fn create_record(
        &self,
        collection_id: &str,
        properties: &Properties,
    ) -> Result<RecordId, StoreError>;

    async fn update_record(
        &self,
        record_id: &RecordId,
        properties: &Properties,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub base_url: String,
    pub api_key: String,
    pub notion_version: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl NotionConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_NOTION_API_BASE.to_string(),
            api_key: api_key.into(),
            notion_version: DEFAULT_NOTION_VERSION.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct NotionStore {
    client: reqwest::Client,
    config: NotionConfig,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<PageObject>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageObject {
    id: String,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    in_trash: bool,
    #[serde(default)]
    properties: Map<String, JsonValue>,
}

impl NotionStore {
    pub fn new(config: NotionConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building notion http client")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.config.api_key)
            .header("Notion-Version", &self.config.notion_version)
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, StoreError> {
        let resp = self.request(method, url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, url, resp).await);
        }
        resp.json::<JsonValue>().await.map_err(|e| StoreError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

async fn status_error(status: StatusCode, url: &str, resp: reqwest::Response) -> StoreError {
    let body = resp.text().await.unwrap_or_default();
    StoreError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
        body,
    }
}

#[async_trait]
impl DocumentStore for NotionStore {
    async fn query_records(
        &self,
        collection_id: &str,
        title_property: &str,
    ) -> Result<Vec<DestinationRecord>, StoreError> {
        let url = self.url(&format!("databases/{collection_id}/query"));
        let span = info_span!("notion_query", collection_id);

        async {
            let mut records = Vec::new();
            let mut cursor: Option<String> = None;

            loop {
                let mut body = json!({ "page_size": QUERY_PAGE_SIZE });
                if let Some(c) = &cursor {
                    body["start_cursor"] = JsonValue::String(c.clone());
                }

                let value = self.send_json(reqwest::Method::POST, &url, &body).await?;
                let page: QueryResponse =
                    serde_json::from_value(value).map_err(|e| StoreError::Decode {
                        url: url.clone(),
                        message: e.to_string(),
                    })?;
                debug!(results = page.results.len(), has_more = page.has_more, "query page");

                for object in page.results {
                    if object.archived || object.in_trash {
                        continue;
                    }
                    let properties = decode_properties(&object.properties);
                    let natural_key = properties
                        .get(title_property)
                        .and_then(PropertyValue::as_text)
                        .map(str::trim)
                        .unwrap_or_default()
                        .to_string();
                    if natural_key.is_empty() {
                        continue;
                    }
                    records.push(DestinationRecord {
                        database_id: RecordId::new(object.id),
                        natural_key,
                        properties,
                    });
                }

                match (page.has_more, page.next_cursor) {
                    (true, Some(next)) => cursor = Some(next),
                    _ => break,
                }
            }

            Ok::<_, StoreError>(records)
        }
        .instrument(span)
        .await
    }

    async fn create_record(
        &self,
        collection_id: &str,
        properties: &Properties,
    ) -> Result<RecordId, StoreError> {
        let url = self.url("pages");
        let body = json!({
            "parent": { "database_id": collection_id },
            "properties": encode_properties(properties),
        });
        let value = self.send_json(reqwest::Method::POST, &url, &body).await?;
        value
            .get("id")
            .and_then(JsonValue::as_str)
            .map(RecordId::new)
            .ok_or_else(|| StoreError::Decode {
                url,
                message: "created page has no id".to_string(),
            })
    }

    async fn update_record(
        &self,
        record_id: &RecordId,
        properties: &Properties,
    ) -> Result<(), StoreError> {
        let url = self.url(&format!("pages/{record_id}"));
        let body = json!({ "properties": encode_properties(properties) });
        self.send_json(reqwest::Method::PATCH, &url, &body).await?;
        Ok(())
    }
}

fn rich_text_array(content: &str) -> JsonValue {
    if content.is_empty() {
        json!([])
    } else {
        json!([{ "text": { "content": content } }])
    }
}

pub fn encode_property(value: &PropertyValue) -> JsonValue {
    match value {
        PropertyValue::Title(s) => json!({ "title": rich_text_array(s) }),
        PropertyValue::RichText(s) => json!({ "rich_text": rich_text_array(s) }),
        PropertyValue::Number(n) => json!({ "number": n }),
        PropertyValue::Date(Some(d)) => {
            json!({ "date": { "start": d.format("%Y-%m-%d").to_string() } })
        }
        PropertyValue::Date(None) => json!({ "date": null }),
        PropertyValue::Select(Some(name)) => json!({ "select": { "name": name } }),
        PropertyValue::Select(None) => json!({ "select": null }),
    }
}

pub fn encode_properties(properties: &Properties) -> JsonValue {
    JsonValue::Object(
        properties
            .iter()
            .map(|(name, value)| (name.clone(), encode_property(value)))
            .collect(),
    )
}

fn plain_text(fragments: &JsonValue) -> String {
    fragments
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.get("plain_text")
                        .or_else(|| item.get("text").and_then(|t| t.get("content")))
                        .and_then(JsonValue::as_str)
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Decodes the property types this system writes; anything else is dropped.
pub fn decode_property(value: &JsonValue) -> Option<PropertyValue> {
    let kind = value.get("type").and_then(JsonValue::as_str).or_else(|| {
        ["title", "rich_text", "number", "date", "select"]
            .into_iter()
            .find(|k| value.get(*k).is_some())
    })?;

    match kind {
        "title" => Some(PropertyValue::Title(plain_text(value.get("title")?))),
        "rich_text" => Some(PropertyValue::RichText(plain_text(value.get("rich_text")?))),
        "number" => Some(PropertyValue::Number(
            value.get("number").and_then(JsonValue::as_f64),
        )),
        "date" => Some(PropertyValue::Date(
            value
                .get("date")
                .and_then(|d| d.get("start"))
                .and_then(JsonValue::as_str)
                .and_then(|s| s.get(..10))
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        )),
        "select" => Some(PropertyValue::Select(
            value
                .get("select")
                .and_then(|s| s.get("name"))
                .and_then(JsonValue::as_str)
                .map(str::to_string),
        )),
        _ => None,
    }
}

pub fn decode_properties(raw: &Map<String, JsonValue>) -> Properties {
    raw.iter()
        .filter_map(|(name, value)| decode_property(value).map(|v| (name.clone(), v)))
        .collect()
}
