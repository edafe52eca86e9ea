//! Inbound interaction: one chat message with author, body, and timestamp.
//!
//! Raw payloads are JSON objects:
//!
//! ```json
//! {"author_ring_id": "abc", "body": "hi", "time": "2024-01-01T12:00:00+02:00"}
//! ```
//!
//! `author_id` is accepted in place of `author_ring_id`. `datatype` (default
//! `text/plain`) and `metadatas` (string map) are optional.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::error::ParseError;

/// Plain chat text.
pub const TEXT_DATATYPE: &str = "text/plain";

/// Commands addressed to the assistant itself.
pub const COMMAND_DATATYPE: &str = "rori/command";

/// Kinds every installation accepts, whatever modules are installed.
pub const CORE_DATATYPES: &[&str] = &[TEXT_DATATYPE, COMMAND_DATATYPE];

/// Payload kind assumed when a raw payload does not declare one.
pub const DEFAULT_DATATYPE: &str = TEXT_DATATYPE;

/// Formats carrying an explicit offset, tried after RFC 3339.
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// Formats without an offset. Interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// An inbound chat message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    author_id: String,
    body: String,
    datatype: String,
    metadatas: HashMap<String, String>,
    time: DateTime<FixedOffset>,
}

#[derive(Deserialize)]
struct RawInteraction {
    #[serde(alias = "author_id")]
    author_ring_id: String,
    body: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    datatype: Option<String>,
    #[serde(default)]
    metadatas: HashMap<String, String>,
}

impl Interaction {
    /// Build a text interaction directly.
    pub fn new(
        author_id: impl Into<String>,
        body: impl Into<String>,
        time: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            author_id: author_id.into(),
            body: body.into(),
            datatype: DEFAULT_DATATYPE.to_string(),
            metadatas: HashMap::new(),
            time,
        }
    }

    /// Same interaction with a different payload kind.
    pub fn with_datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = datatype.into();
        self
    }

    /// Same interaction carrying `metadatas`.
    pub fn with_metadatas(mut self, metadatas: HashMap<String, String>) -> Self {
        self.metadatas = metadatas;
        self
    }

    /// Parse a raw JSON payload.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let raw: RawInteraction =
            serde_json::from_str(raw).map_err(|e| ParseError::InvalidPayload(e.to_string()))?;

        if raw.author_ring_id.trim().is_empty() {
            return Err(ParseError::EmptyField("author_ring_id"));
        }

        let datatype = raw
            .datatype
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_DATATYPE.to_string());

        Ok(Self {
            author_id: raw.author_ring_id,
            body: raw.body,
            datatype,
            metadatas: raw.metadatas,
            time: parse_timestamp(&raw.time)?,
        })
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Declared payload kind, matched against a module's content type.
    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    pub fn metadatas(&self) -> &HashMap<String, String> {
        &self.metadatas
    }

    /// Timestamp as received, with its original offset.
    pub fn time(&self) -> DateTime<FixedOffset> {
        self.time
    }

    /// Canonical storage instant: the timestamp shifted to UTC, offset dropped.
    pub fn recorded_at(&self) -> NaiveDateTime {
        self.time.naive_utc()
    }
}

impl fmt::Display for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.author_id, self.datatype, self.body)
    }
}

/// Parse an ISO-8601-like timestamp with a trailing `Z`, `±HH:MM`, `±HHMM`, or no offset.
pub fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>, ParseError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ParseError::InvalidTimestamp {
            value: value.to_string(),
            reason: "empty".to_string(),
        });
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt);
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, format) {
            return Ok(dt);
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(ndt.and_utc().fixed_offset());
        }
    }

    Err(ParseError::InvalidTimestamp {
        value: value.to_string(),
        reason: "expected YYYY-MM-DDTHH:MM:SS with optional fraction and offset".to_string(),
    })
}

/// Current instant as a UTC-offset timestamp.
pub fn now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}
