//! Core domain model for the accounting-to-document-database mirror.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

/// The two record families mirrored by a run. Each one is synced by its own pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Invoices,
    Payments,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Invoices, EntityKind::Payments];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Invoices => "invoices",
            EntityKind::Payments => "payments",
        }
    }

    /// Name of the destination title property holding the natural key.
    pub fn title_property(&self) -> &'static str {
        match self {
            EntityKind::Invoices => invoice_fields::NUMBER,
            EntityKind::Payments => payment_fields::REFERENCE,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination property names for the invoices collection.
pub mod invoice_fields {
    pub const NUMBER: &str = "Number";
    pub const SOURCE_INVOICE_ID: &str = "Source Invoice Id";
    pub const AMOUNT_INCL_TAX: &str = "Amount Incl. Tax";
    pub const AMOUNT_EXCL_TAX: &str = "Amount Excl. Tax";
    pub const INVOICE_DATE: &str = "Invoice Date";
    pub const DUE_DATE: &str = "Due Date";
    pub const STATUS: &str = "Status";
    pub const CLIENT_REFERENCE: &str = "Client Reference";
}

/// Destination property names for the payments collection.
pub mod payment_fields {
    pub const REFERENCE: &str = "Reference";
    pub const SOURCE_PAYMENT_ID: &str = "Source Payment Id";
    pub const SOURCE_INVOICE_ID: &str = "Source Invoice Id";
    pub const AMOUNT: &str = "Amount";
    pub const PAYMENT_DATE: &str = "Payment Date";
    pub const METHOD: &str = "Method";
}

/// Invoice snapshot as returned by the accounting API.
///
/// Every field is optional: a missing or malformed upstream value decodes to
/// `None` instead of rejecting the whole record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInvoice {
    #[serde(default, deserialize_with = "lenient::int")]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub number: Option<String>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub amount_ttc: Option<f64>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub amount_ht: Option<f64>,
    #[serde(default, deserialize_with = "lenient::date")]
    pub date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::date")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub client_reference: Option<String>,
}

/// Payment snapshot as returned by the accounting API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcePayment {
    #[serde(default, deserialize_with = "lenient::int")]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub reference: Option<String>,
    #[serde(default, deserialize_with = "lenient::int")]
    pub invoice_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub amount: Option<f64>,
    #[serde(default, deserialize_with = "lenient::date")]
    pub date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub nature: Option<String>,
}

/// A source record that can be mirrored into a destination collection.
pub trait SourceRecord {
    const KIND: EntityKind;

    /// Trimmed natural key, or `None` when the upstream value is blank.
    fn natural_key(&self) -> Option<&str>;

    /// Upstream numeric identifier, used only for log context.
    fn source_id(&self) -> Option<i64>;
}

impl SourceRecord for SourceInvoice {
    const KIND: EntityKind = EntityKind::Invoices;

    fn natural_key(&self) -> Option<&str> {
        non_blank(self.number.as_deref())
    }

    fn source_id(&self) -> Option<i64> {
        self.id
    }
}

impl SourceRecord for SourcePayment {
    const KIND: EntityKind = EntityKind::Payments;

    fn natural_key(&self) -> Option<&str> {
        non_blank(self.reference.as_deref())
    }

    fn source_id(&self) -> Option<i64> {
        self.id
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Typed destination property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Title(String),
    RichText(String),
    Number(Option<f64>),
    Date(Option<NaiveDate>),
    Select(Option<String>),
}

impl PropertyValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => *n,
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Title(s) | PropertyValue::RichText(s) => Some(s),
            PropertyValue::Select(s) => s.as_deref(),
            _ => None,
        }
    }
}

/// Destination property map keyed by property name.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Opaque destination identifier (a page id for Notion).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record already present in a destination collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub database_id: RecordId,
    pub natural_key: String,
    #[serde(default)]
    pub properties: Properties,
}

/// Lenient field decoders for upstream JSON.
///
/// Each decoder accepts any JSON value and returns `None` for anything it
/// cannot interpret, so a single odd field never rejects a record.
pub mod lenient {
    use super::*;

    pub fn text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(text_from_value(&JsonValue::deserialize(deserializer)?))
    }

    pub fn int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(int_from_value(&JsonValue::deserialize(deserializer)?))
    }

    pub fn decimal<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(decimal_from_value(&JsonValue::deserialize(deserializer)?))
    }

    pub fn date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(date_from_value(&JsonValue::deserialize(deserializer)?))
    }

    pub fn text_from_value(value: &JsonValue) -> Option<String> {
        match value {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn int_from_value(value: &JsonValue) -> Option<i64> {
        match value {
            JsonValue::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn decimal_from_value(value: &JsonValue) -> Option<f64> {
        let parsed = match value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
            _ => None,
        };
        parsed.filter(|f| f.is_finite())
    }

    /// Accepts `YYYY-MM-DD` or any timestamp starting with one.
    pub fn date_from_value(value: &JsonValue) -> Option<NaiveDate> {
        let JsonValue::String(s) = value else {
            return None;
        };
        let s = s.trim();
        let head = s.get(..10)?;
        NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
    }
}
