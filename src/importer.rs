//! Expression matrix import: object store to document store
//!
//! Bridges an object stream into the blocking TSV parser through a bounded
//! channel: the async side pulls bytes from the store, a `spawn_blocking`
//! task does decompression and parsing, and parsed records flow back to an
//! async loop that feeds the batched upsert sink.

use crate::blobs::BlobStore;
use crate::documents::{DocumentStore, DocumentUpsert};
use crate::error::{ImportError, Result};
use crate::matrix::{FeaturePanel, MatrixRecords, PatientRecord};
use crate::sink::UpsertSink;
use flate2::read::GzDecoder;
use serde_json::{Map, Value, json};
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Object key suffixes recognized as expression matrices.
const MATRIX_SUFFIXES: &[&str] = &[".tsv", ".tsv.gz", ".xena", ".xena.gz"];

/// Records buffered between the parser task and the sink loop.
const CHANNEL_CAPACITY: usize = 256;

/// Picks the newest entry whose key satisfies `recognized`.
pub(crate) fn select_newest<F>(
    entries: Vec<crate::blobs::ObjectEntry>,
    recognized: F,
) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    entries
        .into_iter()
        .filter(|e| recognized(&e.key))
        .max_by_key(|e| e.last_modified)
        .map(|e| e.key)
}

/// Qualifies an explicit object name with the cohort prefix, unless it
/// already carries it.
pub(crate) fn qualified_key(prefix: &str, explicit: &str) -> String {
    let explicit = explicit.trim().trim_start_matches('/');
    if explicit.starts_with(prefix) {
        explicit.to_string()
    } else {
        format!("{prefix}{explicit}")
    }
}

/// Imports expression matrices into per-patient documents.
pub struct ExpressionImporter {
    blobs: Arc<dyn BlobStore>,
    docs: Arc<dyn DocumentStore>,
    panel: FeaturePanel,
    batch_size: usize,
}

impl ExpressionImporter {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        docs: Arc<dyn DocumentStore>,
        panel: FeaturePanel,
        batch_size: usize,
    ) -> Self {
        Self {
            blobs,
            docs,
            panel,
            batch_size,
        }
    }

    /// Imports one matrix for `cohort` and returns the number of confirmed
    /// document writes.
    ///
    /// With no explicit `object_key` the newest recognized matrix under the
    /// cohort prefix is selected; a cohort with no recognized objects
    /// imports nothing and returns zero.
    pub async fn import_cohort(
        &self,
        cohort: &str,
        object_key: Option<&str>,
        token: &CancellationToken,
    ) -> Result<u64> {
        let cohort = cohort.trim().to_ascii_lowercase();
        if cohort.is_empty() {
            return Err(ImportError::MissingCohort.into());
        }
        let prefix = format!("{cohort}/");

        let key = match object_key {
            Some(explicit) => qualified_key(&prefix, explicit),
            None => {
                let entries = self.blobs.list(&prefix).await?;
                match select_newest(entries, |k| is_matrix_key(k)) {
                    Some(key) => key,
                    None => {
                        info!("No expression matrix found under {}", prefix);
                        return Ok(0);
                    }
                }
            }
        };
        debug!("Importing expression matrix {}", key);

        let stream = self.blobs.get(&key).await?;
        let bridge = SyncIoBridge::new(StreamReader::new(stream));
        let gzipped = key.to_ascii_lowercase().ends_with(".gz");

        let (tx, mut rx) = mpsc::channel::<Result<PatientRecord>>(CHANNEL_CAPACITY);
        let panel = self.panel.clone();
        let parse_cohort = cohort.clone();
        let parser = tokio::task::spawn_blocking(move || {
            let reader: Box<dyn BufRead + Send> = if gzipped {
                Box::new(BufReader::new(GzDecoder::new(bridge)))
            } else {
                Box::new(BufReader::new(bridge))
            };
            let records = match MatrixRecords::new(reader, &parse_cohort, &panel) {
                Ok(records) => records,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };
            for record in records {
                // Send failure means the receiver gave up; stop parsing.
                if tx.blocking_send(record).is_err() {
                    return;
                }
            }
        });

        let mut sink = UpsertSink::new(self.docs.clone(), self.batch_size);
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    drop(rx);
                    return Err(ImportError::Cancelled.into());
                }
                item = rx.recv() => item,
            };
            let Some(record) = item else { break };
            let record = record?;
            sink.push(expression_upsert(record)).await?;
        }
        parser.await.map_err(std::io::Error::other)?;

        let confirmed = sink.finish().await?;
        info!("Imported {}: {} document writes", key, confirmed);
        Ok(confirmed)
    }
}

fn is_matrix_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    MATRIX_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

fn expression_upsert(record: PatientRecord) -> DocumentUpsert {
    let features: Map<String, Value> = record
        .features
        .into_iter()
        .map(|(gene, value)| (gene, json!(value)))
        .collect();
    let mut fields = Map::new();
    fields.insert("features".to_string(), Value::Object(features));
    DocumentUpsert {
        patient_barcode: record.patient_barcode,
        cohort: record.cohort,
        fields,
    }
}
