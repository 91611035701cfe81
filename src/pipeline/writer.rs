//! Single-consumer batch writer
//!
//! The writer owns the store exclusively and runs on a blocking thread, so
//! every batch is one plain commit-or-rollback with no shared connection.

use crate::pipeline::queue::{IngestReceiver, QueueItem};
use crate::storage::{ItemRecord, ItemStore};
use crate::HarvestError;
use chrono::Utc;
use tokio::task::JoinHandle;

/// What the writer did over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub records_received: u64,
    pub records_written: u64,
    /// Records lost to failed batches
    pub records_dropped: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    /// Set when the store could not be opened; nothing was written
    pub fatal: Option<String>,
}

/// Drains the ingest queue into an [`ItemStore`] in fixed-size batches
pub struct BatchWriter<S: ItemStore> {
    store: S,
    batch_size: usize,
    buffer: Vec<ItemRecord>,
    report: WriterReport,
}

impl<S: ItemStore> BatchWriter<S> {
    pub fn new(store: S, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            report: WriterReport::default(),
        }
    }

    /// Consumes the queue until the end-of-stream marker, then flushes
    ///
    /// Must run on a blocking thread.
    pub fn run(mut self, mut rx: IngestReceiver) -> WriterReport {
        loop {
            match rx.blocking_recv() {
                Some(QueueItem::Record(record)) => self.accept(record),
                Some(QueueItem::EndOfStream) => {
                    tracing::debug!("Writer received end of stream");
                    break;
                }
                None => {
                    tracing::warn!("Ingest queue closed without end-of-stream marker");
                    break;
                }
            }
        }

        rx.close();
        self.flush();
        tracing::info!(
            "Writer finished: {} records written in {} batches ({} failed batches, {} records dropped)",
            self.report.records_written,
            self.report.batches_committed,
            self.report.batches_failed,
            self.report.records_dropped
        );
        self.report
    }

    fn accept(&mut self, record: ItemRecord) {
        self.report.records_received += 1;
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush();
        }
    }

    /// Persists the buffered records; a failed batch is discarded, not retried
    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        match self.store.persist_batch(&batch, Utc::now()) {
            Ok(written) => {
                self.report.batches_committed += 1;
                self.report.records_written += written as u64;
                tracing::info!("Writer committed batch of {} records", written);
            }
            Err(e) => {
                self.report.batches_failed += 1;
                self.report.records_dropped += batch.len() as u64;
                tracing::error!(
                    "Writer batch of {} records rolled back and discarded: {}",
                    batch.len(),
                    e
                );
            }
        }
    }
}

/// Starts the writer on a blocking thread
///
/// `open_store` runs on that thread too. If it fails the writer logs the
/// error, closes the queue so producers stop waiting on it, and returns a
/// report with `fatal` set.
pub fn spawn_writer<F, S>(
    open_store: F,
    batch_size: usize,
    mut rx: IngestReceiver,
) -> JoinHandle<WriterReport>
where
    F: FnOnce() -> Result<S, HarvestError> + Send + 'static,
    S: ItemStore + 'static,
{
    tokio::task::spawn_blocking(move || match open_store() {
        Ok(store) => BatchWriter::new(store, batch_size).run(rx),
        Err(e) => {
            tracing::error!("Writer could not open store, all records will be dropped: {}", e);
            rx.close();

            // Entries queued before the close are lost too
            let mut stranded = 0;
            while let Some(item) = rx.blocking_recv() {
                if let QueueItem::Record(_) = item {
                    stranded += 1;
                }
            }
            if stranded > 0 {
                tracing::error!("Dropped {} records queued before the writer failed", stranded);
            }

            WriterReport {
                records_received: stranded,
                records_dropped: stranded,
                fatal: Some(e.to_string()),
                ..WriterReport::default()
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::IngestQueue;
    use crate::storage::{StorageError, StorageResult};
    use chrono::{DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Store that remembers the size of every batch it was handed
    #[derive(Clone, Default)]
    struct RecordingStore {
        batches: Arc<Mutex<Vec<usize>>>,
        fail_on: Option<usize>,
    }

    impl ItemStore for RecordingStore {
        fn persist_batch(
            &mut self,
            batch: &[ItemRecord],
            _observed_at: DateTime<Utc>,
        ) -> StorageResult<usize> {
            let mut batches = self.batches.lock().unwrap();
            batches.push(batch.len());
            if self.fail_on == Some(batches.len()) {
                return Err(StorageError::Serialization("forced failure".to_string()));
            }
            Ok(batch.len())
        }
    }

    #[tokio::test]
    async fn test_flushes_full_batches_then_remainder() {
        let store = RecordingStore::default();
        let batches = store.batches.clone();
        let (tx, rx) = IngestQueue::bounded(1000);

        let handle = spawn_writer(move || Ok(store), 200, rx);

        for id in 0..450 {
            tx.push(ItemRecord::with_id(id)).await.unwrap();
        }
        tx.finish().await.unwrap();

        let report = handle.await.unwrap();
        assert_eq!(*batches.lock().unwrap(), vec![200, 200, 50]);
        assert_eq!(report.records_received, 450);
        assert_eq!(report.records_written, 450);
        assert_eq!(report.batches_committed, 3);
        assert_eq!(report.fatal, None);
    }

    #[tokio::test]
    async fn test_no_records_accepted_after_end_of_stream() {
        let store = RecordingStore::default();
        let (tx, rx) = IngestQueue::bounded(16);
        let late = tx.clone();

        let handle = spawn_writer(move || Ok(store), 200, rx);
        tx.finish().await.unwrap();
        let report = handle.await.unwrap();

        assert_eq!(report.records_received, 0);
        assert!(late.push(ItemRecord::with_id(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_batch_is_discarded_and_writer_continues() {
        let store = RecordingStore {
            fail_on: Some(1),
            ..RecordingStore::default()
        };
        let batches = store.batches.clone();
        let (tx, rx) = IngestQueue::bounded(1000);
        let handle = spawn_writer(move || Ok(store), 100, rx);

        for id in 0..250 {
            tx.push(ItemRecord::with_id(id)).await.unwrap();
        }
        tx.finish().await.unwrap();

        let report = handle.await.unwrap();
        assert_eq!(*batches.lock().unwrap(), vec![100, 100, 50]);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.records_dropped, 100);
        assert_eq!(report.records_written, 150);
    }

    #[tokio::test]
    async fn test_unopenable_store_is_fatal_and_closes_queue() {
        let (tx, rx) = IngestQueue::bounded(16);
        let handle = spawn_writer(
            || -> Result<RecordingStore, HarvestError> { Err(HarvestError::QueueClosed) },
            200,
            rx,
        );

        let report = handle.await.unwrap();
        assert!(report.fatal.is_some());
        assert!(tx.push(ItemRecord::with_id(1)).await.is_err());
        assert_eq!(tx.dropped(), 1);
    }

    #[tokio::test]
    async fn test_senders_dropped_without_marker_still_flushes() {
        let store = RecordingStore::default();
        let batches = store.batches.clone();
        let (tx, rx) = IngestQueue::bounded(16);
        let handle = spawn_writer(move || Ok(store), 200, rx);

        tx.push(ItemRecord::with_id(1)).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap();
        assert_eq!(report.records_written, 1);
        assert_eq!(*batches.lock().unwrap(), vec![1]);
    }
}
