use tracing::debug;

use crate::api::{Batch, Document};
use crate::batching::Batcher;
use crate::dispatcher::{Dispatcher, PendingRequest, PipelineHandle, RequestQueue};
use crate::stream::ResultStream;
use crate::{Error, Result};

/// Producer side of a pipeline run.
///
/// Documents are grouped into batches as they are enqueued and every full
/// batch goes straight onto the dispatcher's queue. Call
/// [`finish`](Self::finish) to send the trailing partial batch and close the
/// queue; dropping the pipeline instead closes the queue but discards any
/// documents still waiting for a full batch.
pub struct Pipeline {
    batcher: Batcher,
    queue: Option<RequestQueue>,
    endpoint: String,
    batches: usize,
}

impl Pipeline {
    /// Validates the batch size, then starts `dispatcher` for `endpoint`.
    ///
    /// An invalid batch size is reported here, before anything is spawned
    /// or queued.
    pub fn start(
        dispatcher: Dispatcher,
        endpoint: impl Into<String>,
        batch_size: usize,
    ) -> Result<(Self, ResultStream, PipelineHandle)> {
        let batcher = Batcher::new(batch_size)?;
        let (queue, stream, handle) = dispatcher.spawn();

        Ok((
            Self {
                batcher,
                queue: Some(queue),
                endpoint: endpoint.into(),
                batches: 0,
            },
            stream,
            handle,
        ))
    }

    /// Adds one document. Returns `true` when this completed a batch and it
    /// was queued.
    pub fn enqueue(&mut self, document: Document) -> Result<bool> {
        match self.batcher.add(document) {
            Some(batch) => {
                self.queue_batch(&batch)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Enqueues every document, returning how many batches were queued.
    pub fn submit<I>(&mut self, documents: I) -> Result<usize>
    where
        I: IntoIterator<Item = Document>,
    {
        let mut queued = 0;
        for document in documents {
            if self.enqueue(document)? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Queues the trailing partial batch, if any, and closes the queue.
    /// Returns the total number of batches queued over the run.
    pub fn finish(mut self) -> Result<usize> {
        if let Some(batch) = self.batcher.flush() {
            self.queue_batch(&batch)?;
        }

        if let Some(queue) = self.queue.take() {
            queue.close();
        }
        debug!(batches = self.batches, endpoint = %self.endpoint, "pipeline input closed");
        Ok(self.batches)
    }

    pub fn batch_size(&self) -> usize {
        self.batcher.batch_size()
    }

    fn queue_batch(&mut self, batch: &Batch) -> Result<()> {
        let queue = self.queue.as_ref().ok_or(Error::QueueClosed)?;
        let request = PendingRequest::from_batch(self.batches, self.endpoint.as_str(), batch)?;
        queue.push(request)?;

        debug!(
            batch = self.batches,
            documents = batch.len(),
            "batch queued"
        );
        self.batches += 1;
        Ok(())
    }
}
