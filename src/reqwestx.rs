use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};
use pin_project_lite::pin_project;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::api::{Transport, TransportResponse};
use crate::{Error, Result};

/// How the API key is presented in the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    #[default]
    Bearer,
    /// `Authorization: Token <key>`, the scheme MonkeyLearn-style APIs expect.
    Token,
}

impl std::fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthScheme::Bearer => write!(f, "Bearer"),
            AuthScheme::Token => write!(f, "Token"),
        }
    }
}

impl std::str::FromStr for AuthScheme {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bearer" => Ok(AuthScheme::Bearer),
            "token" => Ok(AuthScheme::Token),
            _ => Err(Error::InvalidAuthScheme {
                value: value.to_string(),
            }),
        }
    }
}

/// Connection settings for [`ApiClient`]. Request deadlines are enforced by
/// the caller, not by the HTTP client.
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub auth_scheme: AuthScheme,
    pub max_concurrent_requests: usize,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            auth_scheme: AuthScheme::default(),
            max_concurrent_requests: 300,
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    concurrent_semaphore: Arc<Semaphore>,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            let value = HeaderValue::from_str(&format!(
                "{} {}",
                config.auth_scheme,
                api_key.expose_secret()
            ))
            .map_err(Error::InvalidApiKeyHeaderValue)?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("tagstream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpClientBuild)?;

        let concurrent_semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            concurrent_semaphore,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Transport for ApiClient {
    async fn post(&self, endpoint: &str, payload: Bytes) -> Result<TransportResponse> {
        let url = self.url(endpoint);
        let request_permit = self
            .concurrent_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::SemaphoreClosed)?;

        debug!(url = %url, bytes = payload.len(), "posting batch");
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .body(payload)
            .send()
            .await
            .map_err(Error::Request)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = read_body_with_permit(response, request_permit).await?;

        debug!(
            url = %url,
            status = %status,
            elapsed = ?started.elapsed(),
            "request finished"
        );

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

async fn read_body_with_permit(
    response: Response,
    request_permit: OwnedSemaphorePermit,
) -> Result<Bytes> {
    let stream = response.bytes_stream();
    let mut guarded_stream = GuardedStream::new(stream, request_permit);

    let mut combined = BytesMut::new();
    while let Some(chunk) = guarded_stream.next().await {
        let chunk = chunk.map_err(Error::ResponseBody)?;
        combined.extend_from_slice(chunk.as_ref());
    }

    Ok(combined.freeze())
}

pin_project! {
    struct GuardedStream<S> {
        #[pin]
        inner: S,
        _request_permit: Option<OwnedSemaphorePermit>,
    }
}

impl<S> GuardedStream<S> {
    fn new(inner: S, request_permit: OwnedSemaphorePermit) -> Self {
        Self {
            inner,
            _request_permit: Some(request_permit),
        }
    }
}

impl<S, E> Stream for GuardedStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
{
    type Item = std::result::Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(None) => {
                trace!("Response body fully consumed, releasing permit");
                *this._request_permit = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
