//! # Cohort Genomic Data Ingest
//!
//! A library for ingesting public cohort genomics files into queryable
//! per-patient documents. It retrieves expression and clinical matrices
//! from mirrored hub endpoints, stores the raw files in an S3-compatible
//! object store, and imports them into a SQLite-backed document store with
//! field-level merge semantics.
//!
//! ## Features
//!
//! - **Mirror-fallback retrieval**: each source file is tried against an
//!   ordered list of hub mirrors until one streams successfully
//! - **Dual-layout matrix parsing**: sample-major and feature-major TSVs,
//!   plain or gzipped, with a configurable gene panel and alias table
//! - **Idempotent imports**: document writes are field-level merges keyed
//!   by (patient barcode, cohort), so re-running an import converges
//! - **Bounded concurrency**: batches run a configurable number of jobs in
//!   parallel and honor cooperative cancellation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use onco_ingest::{AppConfig, IngestJob, IngestManager};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load().await?;
//!     let manager = IngestManager::new(config).await?;
//!
//!     let token = CancellationToken::new();
//!     let jobs = vec![IngestJob {
//!         cohort: "GBM".to_string(),
//!         source: "HiSeqV2.tsv.gz".to_string(),
//!         object_name: None,
//!     }];
//!     let report = manager.ingest_batch(&jobs, &token).await?;
//!     println!("downloaded {} file(s)", report.downloaded.len());
//!
//!     let written = manager.import_expression("GBM", None, &token).await?;
//!     println!("{written} document writes");
//!     Ok(())
//! }
//! ```

pub mod blobs;
pub mod clinical;
pub mod config;
pub mod documents;
pub mod error;
pub mod importer;
pub mod matrix;
pub mod retriever;
pub mod sink;

pub use blobs::{BlobStore, ObjectEntry, ObjectStoreBlobs, StoredObject};
pub use clinical::{ClinicalImporter, ClinicalRecord};
pub use config::AppConfig;
pub use documents::{DocumentStore, DocumentUpsert, PatientDocument, SqliteDocumentStore};
pub use error::{IngestError, Result};
pub use importer::ExpressionImporter;
pub use matrix::{FeaturePanel, MatrixLayout, PatientRecord};
pub use retriever::{BatchReport, IngestJob, Retriever};
pub use sink::UpsertSink;

use crate::error::Validate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Facade wiring the retriever, importers, and both stores together from
/// one [`AppConfig`].
///
/// Construction validates the configuration, builds the configured object
/// store backend, and initializes the document schema. The individual
/// components remain usable on their own for callers that need different
/// wiring.
pub struct IngestManager {
    config: AppConfig,
    blobs: Arc<ObjectStoreBlobs>,
    docs: Arc<SqliteDocumentStore>,
    retriever: Retriever,
}

impl IngestManager {
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let blobs = Arc::new(ObjectStoreBlobs::from_config(&config.object_store)?);
        let docs = Arc::new(SqliteDocumentStore::new(config.documents.clone()).await?);
        let retriever = Retriever::new(blobs.clone(), &config.ingest)?;
        Ok(Self {
            config,
            blobs,
            docs,
            retriever,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Downloads every job in the batch into the object store.
    pub async fn ingest_batch(
        &self,
        jobs: &[IngestJob],
        token: &CancellationToken,
    ) -> Result<BatchReport> {
        self.retriever.run_batch(jobs, token).await
    }

    /// Imports an expression matrix for `cohort` into patient documents.
    pub async fn import_expression(
        &self,
        cohort: &str,
        object_key: Option<&str>,
        token: &CancellationToken,
    ) -> Result<u64> {
        let importer = ExpressionImporter::new(
            self.blobs.clone(),
            self.docs.clone(),
            FeaturePanel::from_config(&self.config.panel),
            self.config.ingest.batch_size,
        );
        importer.import_cohort(cohort, object_key, token).await
    }

    /// Imports a clinical outcome file for `cohort` into patient documents.
    pub async fn import_clinical(
        &self,
        cohort: &str,
        object_key: Option<&str>,
        token: &CancellationToken,
    ) -> Result<u64> {
        let importer = ClinicalImporter::new(
            self.blobs.clone(),
            self.docs.clone(),
            self.config.ingest.batch_size,
        );
        importer.import_cohort(cohort, object_key, token).await
    }

    /// Reads back one patient document, mainly for verification after an
    /// import.
    pub async fn find_document(
        &self,
        patient_barcode: &str,
        cohort: &str,
    ) -> Result<Option<PatientDocument>> {
        self.docs.find(patient_barcode, cohort).await
    }
}
