//! Entry point for talking to a text-analysis API.
//!
//! A [`Client`] owns the HTTP transport, the pacing interval and the quota
//! tracker shared by every run it starts.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use secrecy::SecretString;
//! use tagstream::{AuthScheme, Client, ClientConfig, Document, PipelineEvent};
//!
//! # async fn example() -> tagstream::Result<()> {
//! let client = Client::new(ClientConfig {
//!     api_key: Some(SecretString::from("YOUR_API_KEY")),
//!     base_url: "https://api.monkeylearn.com".to_string(),
//!     auth_scheme: AuthScheme::Token,
//!     requests_per_minute: 120,
//!     timeout: Duration::from_secs(30),
//!     max_concurrent_requests: 50,
//! })?;
//!
//! let documents = vec![Document::new("The service was great").with_external_id("1")];
//! let (mut stream, _handle) = client.classify("cl_pi3C7JiL", documents, 10)?;
//! while let Some(event) = stream.next().await {
//!     match event {
//!         PipelineEvent::Result(result) => println!("{:?}", result.classifications),
//!         PipelineEvent::Failure(failure) => eprintln!("batch {}: {}", failure.batch, failure.error),
//!     }
//! }
//! println!("{:?}", client.quota().await);
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::api::{Batch, Document, DocumentResult, QuotaSnapshot, Transport};
use crate::dispatcher::{Dispatcher, DispatcherConfig, PipelineHandle, pacing_interval};
use crate::quota::QuotaTracker;
use crate::reqwestx::{ApiClient, ApiClientConfig, AuthScheme};
use crate::response::{check_status, decode_results};
use crate::service::Pipeline;
use crate::stream::ResultStream;
use crate::{Error, Result};

const MODEL_PLACEHOLDER: &str = "{model}";
const CLASSIFY_TEMPLATE: &str = "/v3/classifiers/{model}/classify/";
const EXTRACT_TEMPLATE: &str = "/v3/extractors/{model}/extract/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Classify,
    Extract,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Classify => write!(f, "classify"),
            TaskKind::Extract => write!(f, "extract"),
        }
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "classify" | "classifier" => Ok(TaskKind::Classify),
            "extract" | "extractor" => Ok(TaskKind::Extract),
            _ => Err(Error::InvalidTask {
                value: value.to_string(),
            }),
        }
    }
}

/// What a run asks the provider to do, and which model does it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Classify { model: String },
    Extract { model: String },
    /// Any other model endpoint; `template` must contain `{model}`.
    Custom { template: String, model: String },
}

impl Task {
    pub fn new(kind: TaskKind, model: impl Into<String>) -> Self {
        let model = model.into();
        match kind {
            TaskKind::Classify => Task::Classify { model },
            TaskKind::Extract => Task::Extract { model },
        }
    }

    /// Renders the endpoint path for this task.
    pub fn endpoint(&self) -> Result<String> {
        let (template, model) = match self {
            Task::Classify { model } => (CLASSIFY_TEMPLATE, model),
            Task::Extract { model } => (EXTRACT_TEMPLATE, model),
            Task::Custom { template, model } => (template.as_str(), model),
        };

        if !template.contains(MODEL_PLACEHOLDER) {
            return Err(Error::InvalidEndpointTemplate {
                template: template.to_string(),
            });
        }
        Ok(template.replace(MODEL_PLACEHOLDER, model))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: Option<SecretString>,
    /// Scheme and host of the API, e.g. `https://api.monkeylearn.com`.
    pub base_url: String,
    pub auth_scheme: AuthScheme,
    /// Release budget for every run started by this client.
    pub requests_per_minute: u32,
    /// Per-request deadline, covering the wait for a transport slot, the
    /// exchange and the body read. Expiry reports [`Error::Timeout`].
    pub timeout: Duration,
    /// Upper bound on requests in flight at once.
    pub max_concurrent_requests: usize,
}

#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    quota: Arc<QuotaTracker>,
    dispatch: DispatcherConfig,
}

impl Client {
    /// Builds a client backed by `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request rate is zero, the API key cannot be
    /// used as a header value, or the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let interval = pacing_interval(config.requests_per_minute)?;

        let transport = ApiClient::new(ApiClientConfig {
            base_url: config.base_url,
            api_key: config.api_key,
            auth_scheme: config.auth_scheme,
            max_concurrent_requests: config.max_concurrent_requests,
        })?;

        Ok(Self::with_transport(
            Arc::new(transport),
            DispatcherConfig {
                interval,
                request_timeout: config.timeout,
            },
        ))
    }

    /// Builds a client over any [`Transport`].
    pub fn with_transport(transport: Arc<dyn Transport>, dispatch: DispatcherConfig) -> Self {
        Self {
            transport,
            quota: Arc::new(QuotaTracker::new()),
            dispatch,
        }
    }

    /// Latest quota counters reported by the provider, if any response has
    /// carried them yet.
    pub async fn quota(&self) -> Option<QuotaSnapshot> {
        self.quota.snapshot().await
    }

    /// Tracker shared by every run this client (and its clones) starts.
    pub fn quota_tracker(&self) -> Arc<QuotaTracker> {
        Arc::clone(&self.quota)
    }

    /// Starts an empty run for `task`; feed it through the returned
    /// [`Pipeline`].
    pub fn pipeline(
        &self,
        task: &Task,
        batch_size: usize,
    ) -> Result<(Pipeline, ResultStream, PipelineHandle)> {
        let endpoint = task.endpoint()?;
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.quota),
            self.dispatch,
        );
        Pipeline::start(dispatcher, endpoint, batch_size)
    }

    /// Runs `task` over every document and closes the input.
    pub fn run<I>(
        &self,
        task: &Task,
        documents: I,
        batch_size: usize,
    ) -> Result<(ResultStream, PipelineHandle)>
    where
        I: IntoIterator<Item = Document>,
    {
        let (mut pipeline, stream, handle) = self.pipeline(task, batch_size)?;
        pipeline.submit(documents)?;
        let batch_size = pipeline.batch_size();
        let batches = pipeline.finish()?;
        debug!(batches, batch_size, "documents queued");
        Ok((stream, handle))
    }

    pub fn classify<I>(
        &self,
        model: &str,
        documents: I,
        batch_size: usize,
    ) -> Result<(ResultStream, PipelineHandle)>
    where
        I: IntoIterator<Item = Document>,
    {
        self.run(&Task::new(TaskKind::Classify, model), documents, batch_size)
    }

    pub fn extract<I>(
        &self,
        model: &str,
        documents: I,
        batch_size: usize,
    ) -> Result<(ResultStream, PipelineHandle)>
    where
        I: IntoIterator<Item = Document>,
    {
        self.run(&Task::new(TaskKind::Extract, model), documents, batch_size)
    }

    /// Sends a single batch right away, bypassing the pacing queue.
    pub async fn run_batch(&self, task: &Task, batch: &Batch) -> Result<Vec<DocumentResult>> {
        let endpoint = task.endpoint()?;
        let payload = serde_json::to_vec(batch).map_err(Error::JsonEncode)?;

        let response = timeout(
            self.dispatch.request_timeout,
            self.transport.post(&endpoint, payload.into()),
        )
        .await
        .map_err(|_| Error::Timeout {
            endpoint: endpoint.clone(),
        })??;
        check_status(&response, &endpoint)?;
        if let Err(error) = self.quota.update_from_headers(&response.headers).await {
            warn!(error = %error, "ignoring malformed quota headers");
        }
        decode_results(&response)
    }

    pub async fn classify_batch(&self, model: &str, batch: &Batch) -> Result<Vec<DocumentResult>> {
        self.run_batch(&Task::new(TaskKind::Classify, model), batch)
            .await
    }

    pub async fn extract_batch(&self, model: &str, batch: &Batch) -> Result<Vec<DocumentResult>> {
        self.run_batch(&Task::new(TaskKind::Extract, model), batch)
            .await
    }
}
