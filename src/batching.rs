use std::time::Instant;

use tracing::debug;

use crate::api::{Batch, Document};
use crate::{Error, Result};

/// Incrementally groups documents into fixed-size batches.
///
/// `add` hands back a batch as soon as it reaches `batch_size` documents;
/// `flush` hands back whatever is left over.
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    current: Batch,
}

impl Batcher {
    pub fn new(batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidBatchSize { value: batch_size });
        }

        Ok(Self {
            batch_size,
            current: Batch {
                data: Vec::with_capacity(batch_size),
            },
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn add(&mut self, document: Document) -> Option<Batch> {
        self.current.push(document);
        if self.current.len() < self.batch_size {
            return None;
        }

        let full = Batch {
            data: Vec::with_capacity(self.batch_size),
        };
        Some(std::mem::replace(&mut self.current, full))
    }

    pub fn flush(&mut self) -> Option<Batch> {
        if self.current.is_empty() {
            return None;
        }

        Some(std::mem::take(&mut self.current))
    }
}

/// Splits `documents` into consecutive batches of `batch_size`.
///
/// Order is preserved; only the last batch may be shorter. An empty input
/// produces no batches.
///
/// # Errors
///
/// Returns [`Error::InvalidBatchSize`] when `batch_size` is zero.
pub fn split_in_batches<I>(documents: I, batch_size: usize) -> Result<Vec<Batch>>
where
    I: IntoIterator<Item = Document>,
{
    let started = Instant::now();
    let mut batcher = Batcher::new(batch_size)?;

    let mut batches = Vec::new();
    for document in documents {
        if let Some(batch) = batcher.add(document) {
            batches.push(batch);
        }
    }
    batches.extend(batcher.flush());

    debug!(
        batches = batches.len(),
        batch_size,
        elapsed = ?started.elapsed(),
        "split documents into batches"
    );
    Ok(batches)
}
