//! Shared fixtures for the pipeline integration tests.

use flate2::{Compression, write::GzEncoder};
use onco_ingest::{AppConfig, IngestManager};
use std::io::Write;
use tempfile::TempDir;

/// Sample-major expression matrix with an aliased column and an NA cell.
pub const EXPRESSION_MATRIX: &[u8] =
    b"sample\tTP53\tIL8\tCCL5\nTCGA-AB-1234-01\t1.5\t2.0\tNA\nTCGA-AB-5678-01\t0.25\tNA\t3.5\n";

/// Clinical matrix covering event notation, plain flags, and NA cells.
pub const CLINICAL_MATRIX: &[u8] =
    b"bcr_patient_barcode\tdss\tos\tclinical_stage\nTCGA-AB-1234\t1:DECEASED\t0:LIVING\tStage II\nTCGA-AB-5678\tNA\t1\tNA\n";

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Manager backed by an in-memory object store and a temp-dir SQLite
/// document store, retrieving through the given mirror templates.
pub async fn test_manager(mirrors: Vec<String>) -> (TempDir, IngestManager) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.object_store.backend = "memory".to_string();
    config.documents.data_dir = temp_dir.path().to_path_buf();
    config.documents.database = "tcga_test".to_string();
    config.documents.pool_size = 2;
    config.panel.genes = vec!["TP53".to_string(), "IL8".to_string(), "CCL5".to_string()];
    config.ingest.mirrors = mirrors;
    config.ingest.timeout = 5;

    let manager = IngestManager::new(config).await.unwrap();
    (temp_dir, manager)
}
