use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("batch size must be positive, got {value}")]
    InvalidBatchSize { value: usize },

    #[error("requests per minute must be positive, got {value}")]
    InvalidRequestRate { value: u32 },

    #[error("endpoint template '{template}' has no {{model}} placeholder")]
    InvalidEndpointTemplate { template: String },

    #[error("task '{value}' is invalid (expected: classify|extract)")]
    InvalidTask { value: String },

    #[error("auth scheme '{value}' is invalid (expected: bearer|token)")]
    InvalidAuthScheme { value: String },

    #[error("invalid api key header value: {0}")]
    InvalidApiKeyHeaderValue(#[source] http::header::InvalidHeaderValue),

    #[error("http client build failed: {0}")]
    HttpClientBuild(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("response body read failed: {0}")]
    ResponseBody(#[source] reqwest::Error),

    #[error("request json encode failed: {0}")]
    JsonEncode(#[source] serde_json::Error),

    #[error("response json decode failed: {0}")]
    JsonDecode(#[source] serde_json::Error),

    #[error("quota header {header} has invalid value {value:?}")]
    InvalidQuotaHeader { header: &'static str, value: String },

    #[error("request to {endpoint} was rate limited")]
    RateLimited { endpoint: String },

    #[error("request to {endpoint} failed with status {status}")]
    UnsuccessfulRequest {
        status: StatusCode,
        endpoint: String,
        body: Option<String>,
    },

    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("request to {endpoint} was cancelled")]
    Cancelled { endpoint: String },

    #[error("rate limiter semaphore closed")]
    SemaphoreClosed,

    #[error("request queue closed")]
    QueueClosed,
}

impl Error {
    /// Whether the provider throttled the request.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
