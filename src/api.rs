use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::Result;

/// A single text document submitted for analysis.
///
/// The external identifier is opaque to this crate and is only echoed back by
/// the provider so callers can correlate results. Uniqueness is the caller's
/// responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            external_id: None,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

/// An ordered group of documents sent together in one request.
///
/// Serializes to the provider's request body: `{"data": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub data: Vec<Document>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, document: Document) -> &mut Self {
        self.data.push(document);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<Document>> for Batch {
    fn from(data: Vec<Document>) -> Self {
        Self { data }
    }
}

/// A tag assigned to a document by a classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub tag_name: String,
    pub tag_id: i64,
    /// Provider confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

/// A span of text pulled out of a document by an extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub tag_name: String,
    pub extracted_text: String,
    /// Half-open `[start, end)` offsets into the document text.
    #[serde(default)]
    pub offset_span: (i64, i64),
    #[serde(default)]
    pub parsed_value: serde_json::Value,
}

/// The provider's answer for one document of a batch.
///
/// The same shape is used for classification and extraction; the list that
/// does not apply is left empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentResult {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(rename = "error", default)]
    pub is_error: bool,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub error_detail: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub classifications: Vec<Classification>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub extractions: Vec<Extraction>,
}

impl DocumentResult {
    /// Returns the provider's per-document error detail, if it flagged one.
    pub fn error(&self) -> Option<&str> {
        self.is_error.then_some(self.error_detail.as_str())
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Latest quota counters reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub limit: u64,
    pub remaining: u64,
}

/// Raw response handed back by a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Trait for the HTTP boundary of the pipeline.
///
/// The dispatcher only needs a way to POST a serialized batch and read back
/// status, headers and body; status interpretation happens on top of it. This
/// keeps the pipeline testable without a network.
///
/// # Example Implementation
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use bytes::Bytes;
/// use http::{HeaderMap, StatusCode};
/// use tagstream::{Result, Transport, TransportResponse};
///
/// struct AlwaysEmpty;
///
/// #[async_trait]
/// impl Transport for AlwaysEmpty {
///     async fn post(&self, _endpoint: &str, _payload: Bytes) -> Result<TransportResponse> {
///         Ok(TransportResponse {
///             status: StatusCode::OK,
///             headers: HeaderMap::new(),
///             body: Bytes::from_static(b"[]"),
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `payload` as JSON to `endpoint`, a path relative to the
    /// transport's base URL.
    ///
    /// # Errors
    ///
    /// Returns an error only when no response was obtained (connection
    /// failure, body read failure). Non-success statuses are returned as
    /// responses.
    async fn post(&self, endpoint: &str, payload: Bytes) -> Result<TransportResponse>;
}
