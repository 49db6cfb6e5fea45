//! Configuration types for the API client and pipeline runs.
//!
//! Serializable configuration read from JSON files. The API key is accepted
//! on input but never written back out.

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::client::{ClientConfig, Task, TaskKind};
use crate::reqwestx::AuthScheme;

/// Top-level application configuration containing API and run settings.
///
/// This struct is designed to be deserialized from configuration files and
/// provides everything needed to build a [`Client`](crate::Client) and start
/// a run.
///
/// # Example
///
/// ```rust
/// use tagstream::AppConfig;
/// use serde_json::json;
///
/// let config_json = json!({
///     "api": {
///         "url": "https://api.monkeylearn.com",
///         "auth_scheme": "token",
///         "timeout_seconds": 30,
///         "requests_per_minute": 120
///     },
///     "run": {
///         "task": "classify",
///         "model": "cl_pi3C7JiL",
///         "batch_size": 20
///     }
/// });
///
/// let config: AppConfig = serde_json::from_value(config_json).unwrap();
/// assert_eq!(config.run.batch_size, 20);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API connection settings
    pub api: Api,
    /// Settings for a single pipeline run
    pub run: Run,
}

/// Configuration for the API connection.
///
/// # Fields
///
/// - `url`: Base URL of the text-analysis API
/// - `api_key`: Optional API key (skipped during serialization for security)
/// - `auth_scheme`: `"bearer"` (default) or `"token"`
/// - `timeout_seconds`: Per-request deadline in seconds
/// - `requests_per_minute`: Maximum request release rate
/// - `max_concurrent_requests`: Maximum number of requests in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Api {
    /// Base URL of the API
    pub url: String,
    /// API key for authentication (not serialized for security)
    #[serde(default, skip_serializing)]
    pub api_key: Option<SecretString>,
    /// How the API key is sent
    #[serde(default)]
    pub auth_scheme: AuthScheme,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Maximum number of requests released per minute
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Maximum number of concurrent requests allowed
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// `"classify"` or `"extract"`
    #[serde(default)]
    pub task: TaskKind,
    /// Model identifier, e.g. `cl_pi3C7JiL`
    pub model: String,
    /// Optional endpoint template containing `{model}`; overrides `task`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_template: Option<String>,
    /// Documents per request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Api {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            api_key: self.api_key.clone(),
            base_url: self.url.clone(),
            auth_scheme: self.auth_scheme,
            requests_per_minute: self.requests_per_minute,
            timeout: Duration::from_secs(self.timeout_seconds),
            max_concurrent_requests: self.max_concurrent_requests,
        }
    }
}

impl Run {
    pub fn task(&self) -> Result<Task> {
        let task = match &self.endpoint_template {
            Some(template) => Task::Custom {
                template: template.clone(),
                model: self.model.clone(),
            },
            None => Task::new(self.task, self.model.clone()),
        };
        task.endpoint()?;
        Ok(task)
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_requests_per_minute() -> u32 {
    120
}

fn default_max_concurrent_requests() -> usize {
    300
}

fn default_batch_size() -> usize {
    1
}
