//! Quote records, the upstream page envelope, and per-field value codecs.
use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{QuoteStoreError, Result};

/// One observed market quote for a symbol at an instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    #[serde(rename = "ap")]
    pub ask_price: f64,
    #[serde(rename = "as")]
    pub ask_size: i64,
    #[serde(rename = "ax")]
    pub ask_exchange: String,
    #[serde(rename = "bp")]
    pub bid_price: f64,
    #[serde(rename = "bs")]
    pub bid_size: i64,
    #[serde(rename = "bx")]
    pub bid_exchange: String,
    #[serde(rename = "c", default, deserialize_with = "conditions_from_list_or_string")]
    pub conditions: Vec<String>,
    /// RFC3339 timestamp with up to nanosecond precision.
    #[serde(rename = "t")]
    pub timestamp: String,
    #[serde(rename = "z")]
    pub tape: String,
}

impl Quote {
    /// Parses the timestamp into nanoseconds since the Unix epoch.
    ///
    /// Pre-epoch instants are rejected: their keys would sort after every post-epoch key.
    pub fn timestamp_nanos(&self) -> Result<i64> {
        parse_timestamp_nanos(&self.timestamp)
    }
}

/// Parses an RFC3339 timestamp into non-negative nanoseconds since the Unix epoch.
pub fn parse_timestamp_nanos(value: &str) -> Result<i64> {
    let invalid = |reason: String| QuoteStoreError::InvalidTimestamp {
        value: value.to_string(),
        reason,
    };
    let parsed = DateTime::parse_from_rfc3339(value).map_err(|e| invalid(e.to_string()))?;
    let nanos = parsed
        .timestamp_nanos_opt()
        .ok_or_else(|| invalid("out of range for 64-bit nanoseconds".to_string()))?;
    if nanos < 0 {
        return Err(invalid("precedes the Unix epoch".to_string()));
    }
    Ok(nanos)
}

/// Formats nanoseconds since the epoch as an RFC3339 UTC timestamp.
pub fn format_timestamp_nanos(nanos: i64) -> String {
    Utc.timestamp_nanos(nanos)
        .to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn conditions_from_list_or_string<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Conditions {
        List(Vec<String>),
        One(String),
        Missing(()),
    }

    Ok(match Conditions::deserialize(deserializer)? {
        Conditions::List(list) => list,
        Conditions::One(one) => vec![one],
        Conditions::Missing(()) => Vec::new(),
    })
}

/// Response envelope returned by the quotes endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotesPage {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub quotes: Vec<Quote>,
    pub symbol: String,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl QuotesPage {
    /// Decodes a response body.
    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Quote>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Quote>>::deserialize(deserializer)?.unwrap_or_default())
}

/// The eight stored quote fields. Each one owns a sub-namespace under the symbol namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuoteField {
    AskPrice,
    AskSize,
    AskExchange,
    BidPrice,
    BidSize,
    BidExchange,
    Conditions,
    Tape,
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Price(f64),
    Size(i64),
    Text(String),
    Conditions(Vec<String>),
}

impl QuoteField {
    pub const ALL: [QuoteField; 8] = [
        QuoteField::AskPrice,
        QuoteField::AskSize,
        QuoteField::AskExchange,
        QuoteField::BidPrice,
        QuoteField::BidSize,
        QuoteField::BidExchange,
        QuoteField::Conditions,
        QuoteField::Tape,
    ];

    /// Name of the field's sub-namespace.
    pub fn bucket_name(self) -> &'static str {
        match self {
            QuoteField::AskPrice => "askPrice",
            QuoteField::AskSize => "askSize",
            QuoteField::AskExchange => "askExchange",
            QuoteField::BidPrice => "bidPrice",
            QuoteField::BidSize => "bidSize",
            QuoteField::BidExchange => "bidExchange",
            QuoteField::Conditions => "conditions",
            QuoteField::Tape => "tape",
        }
    }

    /// Textual encoding of this field of `quote`.
    ///
    /// Prices use the shortest decimal text that round-trips, never exponent notation.
    pub fn encode(self, quote: &Quote) -> Result<Vec<u8>> {
        let text = match self {
            QuoteField::AskPrice => quote.ask_price.to_string(),
            QuoteField::AskSize => quote.ask_size.to_string(),
            QuoteField::AskExchange => quote.ask_exchange.clone(),
            QuoteField::BidPrice => quote.bid_price.to_string(),
            QuoteField::BidSize => quote.bid_size.to_string(),
            QuoteField::BidExchange => quote.bid_exchange.clone(),
            QuoteField::Conditions => return Ok(serde_json::to_vec(&quote.conditions)?),
            QuoteField::Tape => quote.tape.clone(),
        };
        Ok(text.into_bytes())
    }

    /// Decodes a stored value of this field.
    pub fn decode(self, bytes: &[u8]) -> Result<FieldValue> {
        let decode_error = |reason: String| QuoteStoreError::Decode {
            field: self,
            reason,
        };
        if self == QuoteField::Conditions {
            let conditions =
                serde_json::from_slice(bytes).map_err(|e| decode_error(e.to_string()))?;
            return Ok(FieldValue::Conditions(conditions));
        }

        let text = std::str::from_utf8(bytes).map_err(|e| decode_error(e.to_string()))?;
        match self {
            QuoteField::AskPrice | QuoteField::BidPrice => text
                .parse()
                .map(FieldValue::Price)
                .map_err(|e| decode_error(format!("{text:?}: {e}"))),
            QuoteField::AskSize | QuoteField::BidSize => text
                .parse()
                .map(FieldValue::Size)
                .map_err(|e| decode_error(format!("{text:?}: {e}"))),
            _ => Ok(FieldValue::Text(text.to_string())),
        }
    }
}

impl fmt::Display for QuoteField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.bucket_name())
    }
}
