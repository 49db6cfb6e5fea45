//! Rate-limited request dispatch.
//!
//! A single pacing task pulls [`PendingRequest`]s off an unbounded FIFO queue
//! and releases at most one per tick of a fixed interval. Every released
//! request runs as its own task; the pacing rate caps how fast requests go
//! out, not how many are in flight.
//!
//! The pacing task is the only closer of the output streams. When the queue is
//! closed and empty (or a shutdown is requested) it moves to
//! [`PipelineState::Draining`], waits on a [`TaskTracker`] for every
//! outstanding execution unit, and only then drops its result sink and moves
//! to [`PipelineState::Closed`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::{Batch, DocumentResult, Transport};
use crate::quota::QuotaTracker;
use crate::response::{check_status, decode_results};
use crate::stream::{self, BatchFailure, ResultSink, ResultStream};
use crate::{Error, Result};

/// A serialized batch waiting for its turn.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Zero-based position of the batch in submission order.
    pub batch: usize,
    pub documents: usize,
    pub endpoint: String,
    pub payload: Bytes,
}

impl PendingRequest {
    pub fn from_batch(batch_index: usize, endpoint: impl Into<String>, batch: &Batch) -> Result<Self> {
        let payload = serde_json::to_vec(batch).map_err(Error::JsonEncode)?;
        Ok(Self {
            batch: batch_index,
            documents: batch.len(),
            endpoint: endpoint.into(),
            payload: Bytes::from(payload),
        })
    }

    fn failure(&self, error: Error) -> BatchFailure {
        BatchFailure {
            batch: self.batch,
            documents: self.documents,
            endpoint: self.endpoint.clone(),
            error,
        }
    }

    fn cancelled(&self) -> BatchFailure {
        self.failure(Error::Cancelled {
            endpoint: self.endpoint.clone(),
        })
    }
}

/// Producer half of the request queue.
///
/// Dropping every clone (or calling [`RequestQueue::close`]) tells the
/// dispatcher no more requests are coming.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<PendingRequest>,
}

impl RequestQueue {
    pub fn push(&self, request: PendingRequest) -> Result<()> {
        self.tx.send(request).map_err(|_| Error::QueueClosed)
    }

    pub fn close(self) {
        drop(self.tx);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Releasing queued requests.
    Running,
    /// No more releases; waiting for in-flight requests.
    Draining,
    /// Every unit finished and the output streams are closed.
    Closed,
}

/// Converts a per-minute request budget into the pacing interval.
pub fn pacing_interval(requests_per_minute: u32) -> Result<Duration> {
    if requests_per_minute == 0 {
        return Err(Error::InvalidRequestRate {
            value: requests_per_minute,
        });
    }
    Ok(Duration::from_secs(60) / requests_per_minute)
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Minimum spacing between two request releases.
    pub interval: Duration,
    /// Deadline for a single request, from release to last result sent.
    /// Time spent waiting for a free transport slot counts against it.
    pub request_timeout: Duration,
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    quota: Arc<QuotaTracker>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        quota: Arc<QuotaTracker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            transport,
            quota,
            config,
        }
    }

    /// Starts the pacing task and returns the queue to feed it, the stream to
    /// drain and a handle to control it.
    pub fn spawn(self) -> (RequestQueue, ResultStream, PipelineHandle) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (sink, stream) = stream::channel();
        let (state_tx, state_rx) = watch::channel(PipelineState::Running);
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();

        let task = tokio::spawn(self.run(
            queue_rx,
            sink,
            state_tx,
            shutdown.clone(),
            abort.clone(),
        ));

        (
            RequestQueue { tx: queue_tx },
            stream,
            PipelineHandle {
                shutdown,
                abort,
                state: state_rx,
                task,
            },
        )
    }

    async fn run(
        self,
        mut queue: mpsc::UnboundedReceiver<PendingRequest>,
        sink: ResultSink,
        state: watch::Sender<PipelineState>,
        shutdown: CancellationToken,
        abort: CancellationToken,
    ) {
        // tokio's interval panics on a zero period.
        let mut ticker = interval(self.config.interval.max(Duration::from_nanos(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let units = TaskTracker::new();

        info!(interval = ?self.config.interval, "dispatcher started");

        let mut released = 0usize;
        loop {
            let request = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                request = queue.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    sink.failure(request.cancelled());
                    break;
                }
                _ = ticker.tick() => {}
            }

            debug!(
                batch = request.batch,
                documents = request.documents,
                endpoint = %request.endpoint,
                "releasing request"
            );
            released += 1;

            let unit = ExecutionUnit {
                transport: Arc::clone(&self.transport),
                quota: Arc::clone(&self.quota),
                sink: sink.clone(),
                cancel: abort.child_token(),
                deadline: self.config.request_timeout,
            };
            units.spawn(unit.execute(request));
        }

        state.send_replace(PipelineState::Draining);

        queue.close();
        let mut dropped = 0usize;
        while let Ok(request) = queue.try_recv() {
            sink.failure(request.cancelled());
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "shutdown left queued requests unreleased");
        }

        units.close();
        info!(
            released,
            in_flight = units.len(),
            "dispatcher draining"
        );
        units.wait().await;

        drop(sink);
        state.send_replace(PipelineState::Closed);
        info!(released, "dispatcher closed");
    }
}

struct ExecutionUnit {
    transport: Arc<dyn Transport>,
    quota: Arc<QuotaTracker>,
    sink: ResultSink,
    cancel: CancellationToken,
    deadline: Duration,
}

impl ExecutionUnit {
    async fn execute(self, request: PendingRequest) {
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled {
                endpoint: request.endpoint.clone(),
            }),
            outcome = timeout(self.deadline, self.call(&request)) => {
                outcome.unwrap_or_else(|_| Err(Error::Timeout {
                    endpoint: request.endpoint.clone(),
                }))
            }
        };

        match outcome {
            Ok(results) => {
                debug!(
                    batch = request.batch,
                    results = results.len(),
                    elapsed = ?started.elapsed(),
                    "batch completed"
                );
                for result in results {
                    self.sink.result(result);
                }
            }
            Err(error) => {
                warn!(
                    batch = request.batch,
                    endpoint = %request.endpoint,
                    elapsed = ?started.elapsed(),
                    error = %error,
                    "batch failed"
                );
                self.sink.failure(request.failure(error));
            }
        }
    }

    async fn call(&self, request: &PendingRequest) -> Result<Vec<DocumentResult>> {
        let response = self
            .transport
            .post(&request.endpoint, request.payload.clone())
            .await?;
        check_status(&response, &request.endpoint)?;

        if let Err(error) = self.quota.update_from_headers(&response.headers).await {
            warn!(batch = request.batch, error = %error, "ignoring malformed quota headers");
        }

        decode_results(&response)
    }
}

/// Control side of a running pipeline.
pub struct PipelineHandle {
    shutdown: CancellationToken,
    abort: CancellationToken,
    state: watch::Receiver<PipelineState>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Stops releasing requests. Requests already in flight finish normally;
    /// requests still queued are reported as cancelled.
    pub fn shutdown(&self) {
        info!("pipeline shutdown requested");
        self.shutdown.cancel();
    }

    /// Like [`shutdown`](Self::shutdown), but also cancels in-flight requests.
    pub fn abort(&self) {
        warn!("pipeline abort requested");
        self.shutdown.cancel();
        self.abort.cancel();
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Waits until every unit has finished and the streams are closed.
    pub async fn closed(mut self) {
        if self
            .state
            .wait_for(|state| *state == PipelineState::Closed)
            .await
            .is_err()
        {
            // The pacing task is gone without publishing; surface a panic if
            // that is what happened.
            if let Err(err) = (&mut self.task).await
                && err.is_panic()
            {
                std::panic::resume_unwind(err.into_panic());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Document, TransportResponse};
    use crate::stream::PipelineEvent;
    use async_trait::async_trait;
    use http::{HeaderMap, HeaderValue, StatusCode};
    use std::sync::Mutex;
    use tokio::time::Instant as TokioInstant;

    /// Echoes one result per submitted document and records when each call
    /// arrived.
    struct EchoTransport {
        calls: Mutex<Vec<(TokioInstant, usize)>>,
        status_for_batch: fn(usize) -> StatusCode,
        reply_for_batch: fn(usize) -> Reply,
        quota_headers: bool,
        latency: Duration,
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Echo,
        Garbage,
        Unreachable,
    }

    fn connection_error() -> Error {
        let err = reqwest::Client::new()
            .post("not a url")
            .build()
            .unwrap_err();
        Error::Request(err)
    }

    impl EchoTransport {
        fn ok() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                status_for_batch: |_| StatusCode::OK,
                reply_for_batch: |_| Reply::Echo,
                quota_headers: true,
                latency: Duration::ZERO,
            }
        }

        fn call_times(&self) -> Vec<TokioInstant> {
            self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().iter().map(|(_, n)| *n).collect()
        }
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn post(&self, _endpoint: &str, payload: Bytes) -> Result<TransportResponse> {
            let batch: Batch = serde_json::from_slice(&payload).unwrap();
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((TokioInstant::now(), batch.len()));
                calls.len() - 1
            };

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            let reply = (self.reply_for_batch)(index);
            if let Reply::Unreachable = reply {
                return Err(connection_error());
            }

            let results: Vec<DocumentResult> = batch
                .data
                .into_iter()
                .map(|doc| DocumentResult {
                    text: doc.text,
                    external_id: doc.external_id,
                    ..Default::default()
                })
                .collect();

            let mut headers = HeaderMap::new();
            if self.quota_headers {
                headers.insert("x-query-limit-limit", HeaderValue::from_static("1000"));
                headers.insert("x-query-limit-remaining", HeaderValue::from_static("990"));
            }

            let body = match reply {
                Reply::Garbage => Bytes::from_static(b"<html>bad gateway</html>"),
                _ => Bytes::from(serde_json::to_vec(&results).unwrap()),
            };

            Ok(TransportResponse {
                status: (self.status_for_batch)(index),
                headers,
                body,
            })
        }
    }

    fn config(interval: Duration) -> DispatcherConfig {
        DispatcherConfig {
            interval,
            request_timeout: Duration::from_secs(30),
        }
    }

    fn queue_batches(queue: &RequestQueue, sizes: &[usize]) {
        let mut next = 0;
        for (index, size) in sizes.iter().enumerate() {
            let batch: Batch = (next..next + size)
                .map(|i| Document::new(format!("doc-{i}")).with_external_id(i.to_string()))
                .collect::<Vec<_>>()
                .into();
            next += size;
            queue
                .push(PendingRequest::from_batch(index, "/classify", &batch).unwrap())
                .unwrap();
        }
    }

    #[test]
    fn pacing_interval_divides_a_minute() {
        assert_eq!(pacing_interval(120).unwrap(), Duration::from_millis(500));
        assert_eq!(pacing_interval(1).unwrap(), Duration::from_secs(60));
        assert!(matches!(
            pacing_interval(0),
            Err(Error::InvalidRequestRate { value: 0 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn releases_at_most_one_request_per_interval() {
        let transport = Arc::new(EchoTransport::ok());
        let interval = Duration::from_millis(250);
        let dispatcher = Dispatcher::new(
            transport.clone(),
            Arc::new(QuotaTracker::new()),
            config(interval),
        );

        let (queue, stream, handle) = dispatcher.spawn();
        queue_batches(&queue, &[1, 1, 1, 1, 1]);
        queue.close();

        let (results, failures) = stream.collect().await;
        assert_eq!(results.len(), 5);
        assert!(failures.is_empty());

        let times = transport.call_times();
        assert_eq!(times.len(), 5);
        assert!(times[4] - times[0] >= interval * 4);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }

        handle.closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_batch_yields_one_failure_and_no_results() {
        let transport = Arc::new(EchoTransport {
            status_for_batch: |index| {
                if index == 1 {
                    StatusCode::TOO_MANY_REQUESTS
                } else {
                    StatusCode::OK
                }
            },
            ..EchoTransport::ok()
        });
        let dispatcher = Dispatcher::new(
            transport,
            Arc::new(QuotaTracker::new()),
            config(Duration::from_millis(10)),
        );

        let (queue, stream, _handle) = dispatcher.spawn();
        queue_batches(&queue, &[2, 2, 2]);
        queue.close();

        let (results, failures) = stream.collect().await;
        assert_eq!(results.len(), 4);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].batch, 1);
        assert_eq!(failures[0].documents, 2);
        assert!(failures[0].error.is_rate_limited());

        let ids: Vec<_> = results
            .iter()
            .filter_map(|r| r.external_id.clone())
            .collect();
        assert!(!ids.contains(&"2".to_string()));
        assert!(!ids.contains(&"3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn unsuccessful_status_does_not_stop_later_batches() {
        let transport = Arc::new(EchoTransport {
            status_for_batch: |index| {
                if index == 0 {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    StatusCode::OK
                }
            },
            ..EchoTransport::ok()
        });
        let dispatcher = Dispatcher::new(
            transport,
            Arc::new(QuotaTracker::new()),
            config(Duration::from_millis(10)),
        );

        let (queue, stream, _handle) = dispatcher.spawn();
        queue_batches(&queue, &[1, 1, 1]);
        queue.close();

        let (results, failures) = stream.collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0].error,
            Error::UnsuccessfulRequest { status, .. } if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_fails_only_its_batch() {
        let transport = Arc::new(EchoTransport {
            reply_for_batch: |index| {
                if index == 0 {
                    Reply::Unreachable
                } else {
                    Reply::Echo
                }
            },
            ..EchoTransport::ok()
        });
        let dispatcher = Dispatcher::new(
            transport.clone(),
            Arc::new(QuotaTracker::new()),
            config(Duration::from_millis(10)),
        );

        let (queue, stream, _handle) = dispatcher.spawn();
        queue_batches(&queue, &[2, 2]);
        queue.close();

        let (results, failures) = stream.collect().await;
        assert_eq!(transport.batch_sizes(), vec![2, 2]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].batch, 0);
        assert!(matches!(failures[0].error, Error::Request(_)));

        let ids: Vec<_> = results
            .iter()
            .filter_map(|r| r.external_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_body_fails_only_its_batch() {
        let transport = Arc::new(EchoTransport {
            reply_for_batch: |index| {
                if index == 1 {
                    Reply::Garbage
                } else {
                    Reply::Echo
                }
            },
            ..EchoTransport::ok()
        });
        let dispatcher = Dispatcher::new(
            transport,
            Arc::new(QuotaTracker::new()),
            config(Duration::from_millis(10)),
        );

        let (queue, stream, _handle) = dispatcher.spawn();
        queue_batches(&queue, &[1, 1, 1]);
        queue.close();

        let (results, failures) = stream.collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].batch, 1);
        assert!(matches!(failures[0].error, Error::JsonDecode(_)));
        assert!(
            results
                .iter()
                .all(|r| r.external_id.as_deref() != Some("1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_quota_headers_still_deliver_results() {
        let transport = Arc::new(EchoTransport {
            quota_headers: false,
            ..EchoTransport::ok()
        });
        let quota = Arc::new(QuotaTracker::new());
        let dispatcher = Dispatcher::new(transport, quota.clone(), config(Duration::from_millis(10)));

        let (queue, stream, _handle) = dispatcher.spawn();
        queue_batches(&queue, &[3, 2]);
        queue.close();

        let (results, failures) = stream.collect().await;
        assert_eq!(results.len(), 5);
        assert!(failures.is_empty());
        assert_eq!(quota.snapshot().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_quota_headers_keep_previous_snapshot() {
        let transport = Arc::new(EchoTransport {
            quota_headers: false,
            ..EchoTransport::ok()
        });
        let quota = Arc::new(QuotaTracker::new());
        quota.update("100", "42").await.unwrap();
        let dispatcher = Dispatcher::new(transport, quota.clone(), config(Duration::from_millis(10)));

        let (queue, stream, _handle) = dispatcher.spawn();
        queue_batches(&queue, &[1]);
        queue.close();

        let (results, failures) = stream.collect().await;
        assert_eq!(results.len(), 1);
        assert!(failures.is_empty());
        assert_eq!(
            quota.snapshot().await,
            Some(crate::api::QuotaSnapshot {
                limit: 100,
                remaining: 42
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quota_tracker_sees_latest_headers() {
        let quota = Arc::new(QuotaTracker::new());
        let dispatcher = Dispatcher::new(
            Arc::new(EchoTransport::ok()),
            quota.clone(),
            config(Duration::from_millis(10)),
        );

        let (queue, stream, _handle) = dispatcher.spawn();
        queue_batches(&queue, &[1, 1]);
        queue.close();
        let _ = stream.collect().await;

        let snapshot = quota.snapshot().await.unwrap();
        assert_eq!(snapshot.limit, 1000);
        assert_eq!(snapshot.remaining, 990);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_close_only_after_slow_units_finish() {
        let transport = Arc::new(EchoTransport {
            latency: Duration::from_secs(5),
            ..EchoTransport::ok()
        });
        let dispatcher = Dispatcher::new(
            transport,
            Arc::new(QuotaTracker::new()),
            config(Duration::from_millis(10)),
        );

        let (queue, mut stream, handle) = dispatcher.spawn();
        assert_eq!(handle.state(), PipelineState::Running);
        queue_batches(&queue, &[2, 2]);
        queue.close();

        let mut received = 0;
        while let Some(event) = stream.next().await {
            assert!(matches!(event, PipelineEvent::Result(_)));
            received += 1;
        }
        assert_eq!(received, 4);
        handle.closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_queued_requests_and_drains_in_flight() {
        let transport = Arc::new(EchoTransport {
            latency: Duration::from_secs(1),
            ..EchoTransport::ok()
        });
        let dispatcher = Dispatcher::new(
            transport.clone(),
            Arc::new(QuotaTracker::new()),
            config(Duration::from_secs(60)),
        );

        let (queue, stream, handle) = dispatcher.spawn();
        queue_batches(&queue, &[1, 1, 1]);

        // Let the first request out, then stop before the next tick.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();

        let (results, failures) = stream.collect().await;
        assert_eq!(transport.batch_sizes(), vec![1]);
        assert_eq!(results.len(), 1);
        assert_eq!(failures.len(), 2);
        assert!(
            failures
                .iter()
                .all(|f| matches!(f.error, Error::Cancelled { .. }))
        );

        assert!(matches!(
            queue.push(PendingRequest::from_batch(9, "/classify", &Batch::new()).unwrap()),
            Err(Error::QueueClosed)
        ));
        handle.closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_in_flight_units() {
        let transport = Arc::new(EchoTransport {
            latency: Duration::from_secs(600),
            ..EchoTransport::ok()
        });
        let dispatcher = Dispatcher::new(
            transport,
            Arc::new(QuotaTracker::new()),
            config(Duration::from_millis(10)),
        );

        let (queue, stream, handle) = dispatcher.spawn();
        queue_batches(&queue, &[1]);
        queue.close();

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let (results, failures) = stream.collect().await;
        assert!(results.is_empty());
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, Error::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_request_hits_its_deadline() {
        let transport = Arc::new(EchoTransport {
            latency: Duration::from_secs(120),
            ..EchoTransport::ok()
        });
        let dispatcher = Dispatcher::new(
            transport,
            Arc::new(QuotaTracker::new()),
            DispatcherConfig {
                interval: Duration::from_millis(10),
                request_timeout: Duration::from_secs(1),
            },
        );

        let (queue, stream, _handle) = dispatcher.spawn();
        queue_batches(&queue, &[2]);
        queue.close();

        let (results, failures) = stream.collect().await;
        assert!(results.is_empty());
        assert!(matches!(failures[0].error, Error::Timeout { .. }));
    }
}
