//! Output side of a pipeline run.
//!
//! Results and failures travel on two separate channels so a slow error path
//! never holds up result delivery. Both close together, once the dispatcher
//! has seen every execution unit finish.

use futures::Stream;
use tokio::sync::mpsc;
use tracing::trace;

use crate::Error;
use crate::api::DocumentResult;

/// A batch that produced no results, or a non-fatal problem reported next to
/// its results.
#[derive(Debug)]
pub struct BatchFailure {
    /// Zero-based position of the batch in submission order.
    pub batch: usize,
    /// Number of documents the batch carried.
    pub documents: usize,
    pub endpoint: String,
    pub error: Error,
}

#[derive(Debug)]
pub enum PipelineEvent {
    Result(DocumentResult),
    Failure(BatchFailure),
}

pub(crate) fn channel() -> (ResultSink, ResultStream) {
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let (failures_tx, failures_rx) = mpsc::unbounded_channel();

    (
        ResultSink {
            results: results_tx,
            failures: failures_tx,
        },
        ResultStream {
            results: results_rx,
            failures: failures_rx,
            results_open: true,
            failures_open: true,
        },
    )
}

/// Producer half, cloned into every execution unit.
#[derive(Clone)]
pub(crate) struct ResultSink {
    results: mpsc::UnboundedSender<DocumentResult>,
    failures: mpsc::UnboundedSender<BatchFailure>,
}

impl ResultSink {
    pub(crate) fn result(&self, result: DocumentResult) {
        if self.results.send(result).is_err() {
            trace!("result dropped, stream receiver is gone");
        }
    }

    pub(crate) fn failure(&self, failure: BatchFailure) {
        if self.failures.send(failure).is_err() {
            trace!("failure dropped, stream receiver is gone");
        }
    }
}

/// Consumer half of a pipeline run.
///
/// Results arrive in completion order, not submission order; correlate them
/// through `external_id`.
pub struct ResultStream {
    results: mpsc::UnboundedReceiver<DocumentResult>,
    failures: mpsc::UnboundedReceiver<BatchFailure>,
    results_open: bool,
    failures_open: bool,
}

impl ResultStream {
    /// Waits for the next result or failure. Returns `None` once both
    /// channels are closed and drained.
    pub async fn next(&mut self) -> Option<PipelineEvent> {
        loop {
            if !self.results_open && !self.failures_open {
                return None;
            }

            tokio::select! {
                result = self.results.recv(), if self.results_open => match result {
                    Some(result) => return Some(PipelineEvent::Result(result)),
                    None => self.results_open = false,
                },
                failure = self.failures.recv(), if self.failures_open => match failure {
                    Some(failure) => return Some(PipelineEvent::Failure(failure)),
                    None => self.failures_open = false,
                },
            }
        }
    }

    /// Drains the whole run.
    pub async fn collect(mut self) -> (Vec<DocumentResult>, Vec<BatchFailure>) {
        let mut results = Vec::new();
        let mut failures = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                PipelineEvent::Result(result) => results.push(result),
                PipelineEvent::Failure(failure) => failures.push(failure),
            }
        }
        (results, failures)
    }

    /// Splits into the raw result and failure receivers.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<DocumentResult>,
        mpsc::UnboundedReceiver<BatchFailure>,
    ) {
        (self.results, self.failures)
    }

    pub fn into_stream(self) -> impl Stream<Item = PipelineEvent> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|event| (event, stream))
        })
    }
}
