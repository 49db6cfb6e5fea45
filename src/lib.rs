//! # Tagstream
//!
//! A client-side pipeline for remote text-analysis APIs: batch documents,
//! release requests at a fixed maximum rate, and stream per-document
//! classification or extraction results back as they arrive.
//!
//! ## Features
//!
//! - **Batching**: fixed-size batches, built up front or incrementally
//! - **Pacing**: at most one request released per interval, however many are
//!   in flight
//! - **Streaming**: results and per-batch failures on two channels that close
//!   only after the last request finishes
//! - **Quota tracking**: the provider's limit/remaining headers, kept current
//!   across concurrent requests
//! - **Merging**: fold classify and extract passes together by external id
//!
//! Throttled requests (`429`) are reported, not retried. Keep the request
//! rate under the provider's limit, or retry failed batches yourself.
//!
//! ## Quick Start
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
//! let documents = vec![
//!     Document::new("Great service, fast delivery").with_external_id("1"),
//!     Document::new("Never ordering again").with_external_id("2"),
//! ];
//!
//! let (mut stream, _handle) = client.classify("cl_pi3C7JiL", documents, 2)?;
//! while let Some(event) = stream.next().await {
//!     match event {
//!         PipelineEvent::Result(result) => println!("{:?}", result),
//!         PipelineEvent::Failure(failure) => eprintln!("{}", failure.error),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`batching`] - Fixed-size document batching
//! - [`dispatcher`] - Paced request queue and execution
//! - [`merge`] - Combining result sets by external id
//! - [`quota`] - Provider quota tracking
//! - [`service`] - Feeding documents into a run
//! - Configuration types re-exported from the private `config` module

mod api;
pub mod batching;
mod client;
mod config;
pub mod dispatcher;
mod error;
pub mod merge;
pub mod quota;
mod reqwestx;
mod response;
pub mod service;
mod stream;

pub use api::{
    Batch, Classification, Document, DocumentResult, Extraction, QuotaSnapshot, Transport,
    TransportResponse,
};
pub use batching::split_in_batches;
pub use client::{Client, ClientConfig, Task, TaskKind};
pub use config::*;
pub use dispatcher::{PipelineHandle, PipelineState};
pub use error::{Error, Result};
pub use merge::merge_results;
pub use reqwestx::AuthScheme;
pub use service::Pipeline;
pub use stream::{BatchFailure, PipelineEvent, ResultStream};
