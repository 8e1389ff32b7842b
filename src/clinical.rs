//! Clinical outcome import
//!
//! Clinical matrices are wide TSVs with one row per patient. Only the
//! barcode, two survival event flags, and the stage label are extracted;
//! header names vary by cohort vintage, so each field resolves through an
//! alias list. The barcode column is mandatory, the outcome columns degrade
//! to always-absent when missing.

use crate::blobs::BlobStore;
use crate::documents::{DocumentStore, DocumentUpsert};
use crate::error::{ImportError, Result};
use crate::importer::{qualified_key, select_newest};
use crate::sink::UpsertSink;
use flate2::read::GzDecoder;
use serde_json::{Map, Value, json};
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const BARCODE_ALIASES: &[&str] = &["bcr_patient_barcode", "patient_barcode", "barcode"];
const DSS_ALIASES: &[&str] = &["dss", "dss.event", "dss_status"];
const OS_ALIASES: &[&str] = &["os", "os.event", "os_status"];
const STAGE_ALIASES: &[&str] = &[
    "clinical_stage",
    "pathologic_stage",
    "ajcc_pathologic_tumor_stage",
];

const CHANNEL_CAPACITY: usize = 256;

/// Clinical outcome fields for one patient. `None` means the source had no
/// usable value, which is written through as an explicit removal.
#[derive(Debug, Clone, PartialEq)]
pub struct ClinicalRecord {
    pub patient_barcode: String,
    pub dss: Option<i64>,
    pub os: Option<i64>,
    pub clinical_stage: Option<String>,
}

/// Interprets a survival event cell as a 0/1 flag.
///
/// Values like `1:DECEASED` carry the flag before a colon; any nonzero
/// integer means the event occurred. Boolean words are accepted; everything
/// else, `NA` included, is absent.
fn parse_flag(cell: &str) -> Option<i64> {
    let token = cell.trim().split(':').next().unwrap_or("").trim();
    if let Ok(n) = token.parse::<i64>() {
        return Some(if n == 0 { 0 } else { 1 });
    }
    match token.to_ascii_lowercase().as_str() {
        "true" | "yes" => Some(1),
        "false" | "no" => Some(0),
        _ => None,
    }
}

fn parse_stage(cell: &str) -> Option<String> {
    let token = cell.trim();
    if token.is_empty() || token.eq_ignore_ascii_case("NA") {
        None
    } else {
        Some(token.to_string())
    }
}

struct ColumnMap {
    barcode: usize,
    dss: Option<usize>,
    os: Option<usize>,
    stage: Option<usize>,
}

fn resolve_column(header: &[String], aliases: &[&str]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|alias| header.iter().position(|h| h == alias))
}

/// Lazy sequence of [`ClinicalRecord`]s parsed from a clinical TSV stream.
///
/// Rows with a blank barcode are skipped; every other row yields a record,
/// with unresolvable outcome cells mapped to `None`.
pub struct ClinicalRows<R> {
    lines: std::io::Lines<R>,
    columns: ColumnMap,
}

impl<R: BufRead> ClinicalRows<R> {
    /// Reads the header and resolves the column layout. Fails when no
    /// barcode column is present; `key` only labels the error.
    pub fn new(mut reader: R, key: &str) -> Result<Self> {
        let mut header_line = String::new();
        reader.read_line(&mut header_line)?;
        let header: Vec<String> = header_line
            .trim_end_matches(['\r', '\n'])
            .split('\t')
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();

        let barcode = resolve_column(&header, BARCODE_ALIASES).ok_or_else(|| {
            ImportError::MissingBarcodeColumn {
                key: key.to_string(),
            }
        })?;
        Ok(Self {
            lines: reader.lines(),
            columns: ColumnMap {
                barcode,
                dss: resolve_column(&header, DSS_ALIASES),
                os: resolve_column(&header, OS_ALIASES),
                stage: resolve_column(&header, STAGE_ALIASES),
            },
        })
    }
}

impl<R: BufRead> Iterator for ClinicalRows<R> {
    type Item = Result<ClinicalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            let cells: Vec<&str> = line.split('\t').collect();
            let barcode = cells
                .get(self.columns.barcode)
                .map(|c| c.trim().to_ascii_uppercase())
                .unwrap_or_default();
            if barcode.is_empty() {
                continue;
            }
            let cell = |idx: Option<usize>| idx.and_then(|i| cells.get(i)).copied().unwrap_or("");
            return Some(Ok(ClinicalRecord {
                patient_barcode: barcode,
                dss: parse_flag(cell(self.columns.dss)),
                os: parse_flag(cell(self.columns.os)),
                clinical_stage: parse_stage(cell(self.columns.stage)),
            }));
        }
    }
}

/// Imports clinical outcome TSVs into per-patient documents.
pub struct ClinicalImporter {
    blobs: Arc<dyn BlobStore>,
    docs: Arc<dyn DocumentStore>,
    batch_size: usize,
}

impl ClinicalImporter {
    pub fn new(blobs: Arc<dyn BlobStore>, docs: Arc<dyn DocumentStore>, batch_size: usize) -> Self {
        Self {
            blobs,
            docs,
            batch_size,
        }
    }

    /// Imports one clinical file for `cohort` and returns the number of
    /// confirmed document writes.
    ///
    /// With no explicit `object_key` the newest object whose key mentions
    /// `clinical` is selected; a cohort without one is an error, since
    /// silently importing nothing would mask a missing upload.
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
                select_newest(entries, |k| k.to_ascii_lowercase().contains("clinical"))
                    .ok_or_else(|| ImportError::NoClinicalObject {
                        cohort: cohort.clone(),
                    })?
            }
        };
        debug!("Importing clinical file {}", key);

        let stream = self.blobs.get(&key).await?;
        let bridge = SyncIoBridge::new(StreamReader::new(stream));
        let gzipped = key.to_ascii_lowercase().ends_with(".gz");

        let (tx, mut rx) = mpsc::channel::<Result<ClinicalRecord>>(CHANNEL_CAPACITY);
        let parse_key = key.clone();
        let parser = tokio::task::spawn_blocking(move || {
            let reader: Box<dyn BufRead + Send> = if gzipped {
                Box::new(BufReader::new(GzDecoder::new(bridge)))
            } else {
                Box::new(BufReader::new(bridge))
            };
            let rows = match ClinicalRows::new(reader, &parse_key) {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };
            for row in rows {
                if tx.blocking_send(row).is_err() {
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
            sink.push(clinical_upsert(record, &cohort)).await?;
        }
        parser.await.map_err(std::io::Error::other)?;

        let confirmed = sink.finish().await?;
        info!("Imported {}: {} document writes", key, confirmed);
        Ok(confirmed)
    }
}

fn clinical_upsert(record: ClinicalRecord, cohort: &str) -> DocumentUpsert {
    // Absent outcomes are written as explicit nulls so a re-import removes
    // values a previous file carried.
    let mut fields = Map::new();
    fields.insert("dss".to_string(), record.dss.map_or(Value::Null, |v| json!(v)));
    fields.insert("os".to_string(), record.os.map_or(Value::Null, |v| json!(v)));
    fields.insert(
        "clinical_stage".to_string(),
        record.clinical_stage.map_or(Value::Null, |v| json!(v)),
    );
    DocumentUpsert {
        patient_barcode: record.patient_barcode,
        cohort: cohort.to_string(),
        fields,
    }
}
