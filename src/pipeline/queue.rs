//! Bounded FIFO queue feeding the batch writer

use crate::storage::ItemRecord;
use crate::HarvestError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An entry on the ingest queue
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    /// A normalized record to persist
    Record(ItemRecord),

    /// No producer will push anything after this
    EndOfStream,
}

/// Constructor for the sender/receiver pair
pub struct IngestQueue;

impl IngestQueue {
    /// Creates a queue holding at most `capacity` entries
    ///
    /// Producers wait when the queue is full.
    pub fn bounded(capacity: usize) -> (IngestSender, IngestReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            IngestSender {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            IngestReceiver { rx },
        )
    }
}

/// Producer side, cloned into every partition
#[derive(Clone)]
pub struct IngestSender {
    tx: mpsc::Sender<QueueItem>,
    dropped: Arc<AtomicU64>,
}

impl IngestSender {
    /// Pushes one record, waiting while the queue is full
    pub async fn push(&self, record: ItemRecord) -> Result<(), HarvestError> {
        self.tx.send(QueueItem::Record(record)).await.map_err(|_| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            HarvestError::QueueClosed
        })
    }

    /// Pushes records in order and returns how many were accepted
    ///
    /// If the writer has gone away the remaining records are counted as
    /// dropped and logged.
    pub async fn push_all(&self, records: Vec<ItemRecord>) -> usize {
        let total = records.len();
        let mut records = records.into_iter();

        let mut accepted = 0;
        for record in records.by_ref() {
            if self.push(record).await.is_err() {
                break;
            }
            accepted += 1;
        }

        let lost = records.len() as u64;
        if accepted < total {
            self.dropped.fetch_add(lost, Ordering::Relaxed);
            tracing::error!(
                "Writer unavailable, dropped {} of {} records",
                total - accepted,
                total
            );
        }

        accepted
    }

    /// Sends the end-of-stream marker, consuming this sender
    ///
    /// Only the orchestrator calls this, after every producer has finished.
    pub async fn finish(self) -> Result<(), HarvestError> {
        self.tx
            .send(QueueItem::EndOfStream)
            .await
            .map_err(|_| HarvestError::QueueClosed)
    }

    /// Records rejected because the writer was gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the writer
pub struct IngestReceiver {
    rx: mpsc::Receiver<QueueItem>,
}

impl IngestReceiver {
    pub async fn recv(&mut self) -> Option<QueueItem> {
        self.rx.recv().await
    }

    /// Blocking receive for use on a blocking thread
    pub fn blocking_recv(&mut self) -> Option<QueueItem> {
        self.rx.blocking_recv()
    }

    /// Stops accepting new entries; pushes after this fail
    pub fn close(&mut self) {
        self.rx.close();
    }
}
