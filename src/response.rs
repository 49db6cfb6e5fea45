use http::StatusCode;

use crate::api::{DocumentResult, TransportResponse};
use crate::{Error, Result};

/// Largest error body kept on [`Error::UnsuccessfulRequest`].
const MAX_ERROR_BODY: usize = 2048;

/// Maps a non-200 status onto the matching error.
///
/// Only `200 OK` is accepted; other 2xx codes are not part of the provider
/// contract and are treated as failures.
pub fn check_status(response: &TransportResponse, endpoint: &str) -> Result<()> {
    match response.status {
        StatusCode::OK => Ok(()),
        StatusCode::TOO_MANY_REQUESTS => Err(Error::RateLimited {
            endpoint: endpoint.to_string(),
        }),
        status => Err(Error::UnsuccessfulRequest {
            status,
            endpoint: endpoint.to_string(),
            body: error_body(&response.body),
        }),
    }
}

/// Decodes a `200 OK` body into one result per submitted document, in the
/// order the provider returned them.
pub fn decode_results(response: &TransportResponse) -> Result<Vec<DocumentResult>> {
    serde_json::from_slice(&response.body).map_err(Error::JsonDecode)
}

fn error_body(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }

    let text = String::from_utf8_lossy(body);
    let mut end = text.len().min(MAX_ERROR_BODY);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Some(text[..end].to_string())
}
