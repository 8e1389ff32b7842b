//! Batched delivery of document upserts
//!
//! Importers produce one [`DocumentUpsert`] per parsed record; the sink
//! groups them into fixed-size batches so the document store sees a bounded
//! number of round trips regardless of file size.

use crate::documents::{DocumentStore, DocumentUpsert};
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;

/// Default number of upserts per batch.
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Buffers upserts and flushes them to a [`DocumentStore`] in batches.
///
/// Call [`UpsertSink::finish`] after the last push; dropping the sink without
/// finishing loses any buffered records.
pub struct UpsertSink {
    docs: Arc<dyn DocumentStore>,
    buffer: Vec<DocumentUpsert>,
    capacity: usize,
    confirmed: u64,
}

impl UpsertSink {
    pub fn new(docs: Arc<dyn DocumentStore>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            docs,
            buffer: Vec::with_capacity(capacity),
            capacity,
            confirmed: 0,
        }
    }

    pub fn with_default_capacity(docs: Arc<dyn DocumentStore>) -> Self {
        Self::new(docs, DEFAULT_BATCH_SIZE)
    }

    /// Buffers one upsert, flushing when the batch is full.
    pub async fn push(&mut self, upsert: DocumentUpsert) -> Result<()> {
        self.buffer.push(upsert);
        if self.buffer.len() >= self.capacity {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes out any buffered upserts immediately.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        let count = batch.len();
        self.confirmed += self.docs.bulk_upsert(&batch).await?;
        self.buffer = Vec::with_capacity(self.capacity);
        debug!("Flushed batch of {} upserts", count);
        Ok(())
    }

    /// Flushes the remainder and returns the total number of confirmed
    /// writes across all batches.
    pub async fn finish(mut self) -> Result<u64> {
        self.flush().await?;
        Ok(self.confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::PatientDocument;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records the size of each batch it receives.
    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl DocumentStore for RecordingStore {
        async fn ensure_schema(&self) -> Result<()> {
            Ok(())
        }

        async fn bulk_upsert(&self, upserts: &[DocumentUpsert]) -> Result<u64> {
            self.batches.lock().unwrap().push(upserts.len());
            Ok(upserts.len() as u64)
        }

        async fn find(&self, _barcode: &str, _cohort: &str) -> Result<Option<PatientDocument>> {
            Ok(None)
        }
    }

    fn upsert(n: usize) -> DocumentUpsert {
        DocumentUpsert {
            patient_barcode: format!("TCGA-AA-{n:04}"),
            cohort: "gbm".to_string(),
            fields: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn flushes_full_batches_and_remainder() {
        let store = Arc::new(RecordingStore::default());
        let mut sink = UpsertSink::new(store.clone(), 3);
        for n in 0..7 {
            sink.push(upsert(n)).await.unwrap();
        }
        let confirmed = sink.finish().await.unwrap();
        assert_eq!(confirmed, 7);
        assert_eq!(*store.batches.lock().unwrap(), vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn finish_on_empty_sink_writes_nothing() {
        let store = Arc::new(RecordingStore::default());
        let sink = UpsertSink::new(store.clone(), 3);
        assert_eq!(sink.finish().await.unwrap(), 0);
        assert!(store.batches.lock().unwrap().is_empty());
    }
}
