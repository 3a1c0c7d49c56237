//! Request and result types exchanged with callers.
//!
//! Field names follow the serverless job format:
//! `{"input": {"inputs": [{"file_type", "file_data", "file_url", "prompt"}]}}`
//! in, `{"output": [DocumentResult, ...]}` out.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BatchError, ItemError};

/// Declared type of a submitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Image,
    Pdf,
}

impl DocumentKind {
    /// Parse the wire value. Anything but `pdf` or `image` is an [`ItemError::InvalidKind`].
    pub fn parse(s: &str) -> Result<Self, ItemError> {
        match s {
            "pdf" => Ok(Self::Pdf),
            "image" => Ok(Self::Image),
            other => Err(ItemError::InvalidKind(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Pdf => "pdf",
        }
    }
}

/// One unit of work as submitted by a caller.
///
/// `kind` stays a raw string so that an unknown value becomes a per-item
/// failure instead of rejecting the whole batch. Non-string values are
/// kept in their JSON form (`5`, `null`, `true`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestItem {
    #[serde(rename = "file_type", deserialize_with = "kind_text")]
    pub kind: String,
    #[serde(default, rename = "file_data")]
    pub inline_data: Option<String>,
    #[serde(default, rename = "file_url")]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Where an item's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemSource<'a> {
    Remote(&'a str),
    Inline(&'a str),
}

impl RequestItem {
    /// The item's source. A remote reference wins when both are set;
    /// blank strings count as absent.
    pub fn source(&self) -> Option<ItemSource<'_>> {
        non_blank(&self.source_ref)
            .map(ItemSource::Remote)
            .or_else(|| non_blank(&self.inline_data).map(ItemSource::Inline))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn kind_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct BatchEvent {
    input: BatchInput,
}

#[derive(Debug, Deserialize)]
struct BatchInput {
    inputs: Vec<RequestItem>,
}

/// Parse a serverless job event into its ordered item list.
pub fn parse_batch_event(body: &[u8]) -> Result<Vec<RequestItem>, BatchError> {
    let event: BatchEvent =
        serde_json::from_slice(body).map_err(|e| BatchError::Malformed(e.to_string()))?;
    Ok(event.input.inputs)
}

/// Raw bytes of one item plus a best-effort display name.
#[derive(Debug)]
pub struct ResolvedPayload {
    pub kind: DocumentKind,
    pub data: Vec<u8>,
    pub display_name: String,
}

/// Outcome of OCR on a single page (1-indexed).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageResult {
    pub page: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PageResult {
    pub fn recognized(page: u32, text: String) -> Self {
        Self {
            page,
            success: true,
            result: Some(text),
            error: None,
        }
    }

    pub fn failed(page: u32, error: &ItemError) -> Self {
        Self {
            page,
            success: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of one submitted item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub page_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<PageResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl DocumentResult {
    /// A single recognized image.
    pub fn text(text: String) -> Self {
        Self {
            success: true,
            result: Some(text),
            error: None,
            page_count: 1,
            pages: None,
            filename: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
            page_count: 0,
            pages: None,
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

impl From<ItemError> for DocumentResult {
    fn from(err: ItemError) -> Self {
        Self::failure(err.to_string())
    }
}

/// One result per submitted item, in input order.
pub type BatchResult = Vec<DocumentResult>;
