//! Provider quota tracking.
//!
//! Every successful response carries the provider's query limit and the
//! number of queries left. The tracker keeps only the latest pair; concurrent
//! updates are serialized and the last writer wins.

use http::HeaderMap;
use tokio::sync::Mutex;
use tracing::trace;

use crate::api::QuotaSnapshot;
use crate::{Error, Result};

pub const LIMIT_HEADER: &str = "x-query-limit-limit";
pub const REMAINING_HEADER: &str = "x-query-limit-remaining";

#[derive(Debug, Default)]
pub struct QuotaTracker {
    state: Mutex<Option<QuotaSnapshot>>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses both counters and replaces the stored snapshot.
    ///
    /// Nothing is stored unless both values are valid non-negative integers.
    pub async fn update(&self, limit: &str, remaining: &str) -> Result<QuotaSnapshot> {
        let snapshot = QuotaSnapshot {
            limit: parse_counter(LIMIT_HEADER, limit)?,
            remaining: parse_counter(REMAINING_HEADER, remaining)?,
        };

        *self.state.lock().await = Some(snapshot);
        trace!(
            limit = snapshot.limit,
            remaining = snapshot.remaining,
            "quota updated"
        );
        Ok(snapshot)
    }

    /// Reads the quota headers off a response. A missing header counts as
    /// malformed.
    pub async fn update_from_headers(&self, headers: &HeaderMap) -> Result<QuotaSnapshot> {
        let limit = header_str(headers, LIMIT_HEADER)?;
        let remaining = header_str(headers, REMAINING_HEADER)?;
        self.update(limit, remaining).await
    }

    pub async fn snapshot(&self) -> Option<QuotaSnapshot> {
        *self.state.lock().await
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str> {
    let value = headers.get(name).ok_or(Error::InvalidQuotaHeader {
        header: name,
        value: String::new(),
    })?;

    value.to_str().map_err(|_| Error::InvalidQuotaHeader {
        header: name,
        value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
    })
}

fn parse_counter(header: &'static str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::InvalidQuotaHeader {
            header,
            value: value.to_string(),
        })
}
