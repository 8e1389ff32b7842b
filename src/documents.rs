//! SQLite-backed patient document store
//!
//! Uses a deadpool-backed SQLite connection pool to provide async access
//! without blocking the Tokio runtime. Documents are JSON blobs keyed by
//! (patient barcode, cohort); every write is a field-level merge, so
//! re-running an import converges instead of accumulating.

use crate::config::DocumentStoreConfig;
use crate::error::{DocumentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_sqlite::rusqlite::{self, OptionalExtension};
use deadpool_sqlite::{Config as DeadpoolConfig, Pool, Runtime};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i32 = 1;

/// One buffered write: sets exactly the `fields` present here on the
/// document identified by (patient_barcode, cohort).
///
/// A `Value::Null` field marks the value as absent; the merge layer removes
/// the key rather than storing a null, so an unparseable cell never
/// overwrites older data with a default.
#[derive(Debug, Clone)]
pub struct DocumentUpsert {
    pub patient_barcode: String,
    pub cohort: String,
    pub fields: Map<String, Value>,
}

/// A stored patient document, as read back from the store.
#[derive(Debug, Clone)]
pub struct PatientDocument {
    pub patient_barcode: String,
    pub cohort: String,
    pub fields: Map<String, Value>,
}

/// Document store contract: unordered bulk upsert with field-level set
/// semantics, plus a point read used by the query layer and tests.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<()>;

    /// Applies the batch as independent upserts. Returns the number of
    /// confirmed writes; a failing row is skipped, not fatal for the batch.
    async fn bulk_upsert(&self, batch: &[DocumentUpsert]) -> Result<u64>;

    async fn find(&self, patient_barcode: &str, cohort: &str) -> Result<Option<PatientDocument>>;
}

pub struct SqliteDocumentStore {
    pool: Pool,
    db_path: PathBuf,
}

impl SqliteDocumentStore {
    fn configure_connection(conn: &mut rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        Ok(())
    }

    async fn with_connection<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.pool.get().await.map_err(|e| DocumentError::DatabaseError {
            message: format!("Failed to acquire SQLite connection: {e}"),
        })?;

        let result = conn
            .interact(move |conn| {
                Self::configure_connection(conn)?;
                f(conn)
            })
            .await
            .map_err(|e| DocumentError::DatabaseError {
                message: format!("SQLite connection worker failed: {e}"),
            })?;

        result.map_err(|e| {
            DocumentError::DatabaseError {
                message: e.to_string(),
            }
            .into()
        })
    }

    pub async fn new(config: DocumentStoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let db_path = config.data_dir.join(format!("{}.db", config.database));

        let pool = DeadpoolConfig::new(db_path.clone())
            .builder(Runtime::Tokio1)
            .map_err(|e| DocumentError::InitializationFailed {
                message: format!("Failed to create SQLite pool builder: {e}"),
            })?
            .max_size(config.pool_size)
            .wait_timeout(Some(std::time::Duration::from_secs(30)))
            .create_timeout(Some(std::time::Duration::from_secs(30)))
            .build()
            .map_err(|e| DocumentError::InitializationFailed {
                message: format!("Failed to create SQLite pool: {e}"),
            })?;

        let store = Self {
            pool,
            db_path: db_path.clone(),
        };
        store.ensure_schema().await?;
        info!("Document store initialized at {:?}", db_path);
        Ok(store)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    async fn init_schema(&self) -> Result<()> {
        let current_version = self
            .with_connection(|conn| {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS metadata (
                        key TEXT PRIMARY KEY,
                        value TEXT NOT NULL
                    );
                    "#,
                )?;

                conn.query_row(
                    "SELECT value FROM metadata WHERE key = 'schema_version'",
                    [],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if current_version == 0 {
            self.create_schema().await?;
        } else if current_version < SCHEMA_VERSION {
            return Err(DocumentError::UnsupportedSchemaVersion {
                current: current_version,
                required: SCHEMA_VERSION,
            }
            .into());
        }

        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                rusqlite::params!["schema_version", SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        })
        .await?;

        debug!("Document schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }

    async fn create_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS patient_documents (
                    patient_id TEXT NOT NULL,
                    cohort TEXT NOT NULL,
                    doc TEXT NOT NULL CHECK (json_valid(doc)),
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (patient_id, cohort)
                );

                CREATE INDEX IF NOT EXISTS idx_documents_cohort
                    ON patient_documents(cohort);
                "#,
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.init_schema().await
    }

    async fn bulk_upsert(&self, batch: &[DocumentUpsert]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let rows: Vec<(String, String, String)> = batch
            .iter()
            .map(|u| {
                (
                    u.patient_barcode.clone(),
                    u.cohort.clone(),
                    Value::Object(u.fields.clone()).to_string(),
                )
            })
            .collect();
        let updated_at = Utc::now().to_rfc3339();

        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let mut confirmed = 0u64;
            {
                // json_patch applies RFC 7386 merge semantics: supplied keys
                // are set, nulls remove, everything else stays untouched.
                // Fresh inserts patch against '{}' so nulls never persist;
                // the conflict arm patches with the raw document so a null
                // still removes an existing key.
                let mut stmt = tx.prepare_cached(
                    r#"
                    INSERT INTO patient_documents (patient_id, cohort, doc, updated_at)
                    VALUES (?1, ?2, json_patch('{}', json(?3)), ?4)
                    ON CONFLICT (patient_id, cohort) DO UPDATE SET
                        doc = json_patch(patient_documents.doc, json(?3)),
                        updated_at = ?4
                    "#,
                )?;
                for (patient_id, cohort, doc) in &rows {
                    match stmt.execute(rusqlite::params![patient_id, cohort, doc, updated_at]) {
                        Ok(n) => confirmed += n as u64,
                        Err(e) => {
                            warn!(
                                "Skipping failed upsert for {}/{}: {}",
                                cohort, patient_id, e
                            );
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(confirmed)
        })
        .await
    }

    async fn find(&self, patient_barcode: &str, cohort: &str) -> Result<Option<PatientDocument>> {
        let patient = patient_barcode.to_string();
        let cohort_owned = cohort.to_string();
        let row = self
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT patient_id, cohort, doc FROM patient_documents
                     WHERE patient_id = ?1 AND cohort = ?2",
                    rusqlite::params![patient, cohort_owned],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;

        match row {
            Some((patient_id, cohort, doc)) => {
                let fields = match serde_json::from_str::<Value>(&doc)? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                Ok(Some(PatientDocument {
                    patient_barcode: patient_id,
                    cohort,
                    fields,
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SqliteDocumentStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteDocumentStore::new(DocumentStoreConfig {
            data_dir: temp_dir.path().to_path_buf(),
            database: "tcga_test".to_string(),
            pool_size: 2,
        })
        .await
        .unwrap();
        (temp_dir, store)
    }

    fn upsert(barcode: &str, cohort: &str, fields: Value) -> DocumentUpsert {
        let Value::Object(fields) = fields else {
            panic!("fields must be a JSON object");
        };
        DocumentUpsert {
            patient_barcode: barcode.to_string(),
            cohort: cohort.to_string(),
            fields,
        }
    }

    #[tokio::test]
    async fn upsert_inserts_and_merges() {
        let (_guard, store) = test_store().await;

        let confirmed = store
            .bulk_upsert(&[upsert(
                "TCGA-AB-1234",
                "gbm",
                json!({"features": {"TP53": 1.5}}),
            )])
            .await
            .unwrap();
        assert_eq!(confirmed, 1);

        // A second import touching a different feature merges, not replaces.
        store
            .bulk_upsert(&[upsert(
                "TCGA-AB-1234",
                "gbm",
                json!({"features": {"CXCL8": 2.0}}),
            )])
            .await
            .unwrap();

        let doc = store.find("TCGA-AB-1234", "gbm").await.unwrap().unwrap();
        let features = doc.fields.get("features").unwrap();
        assert_eq!(features.get("TP53"), Some(&json!(1.5)));
        assert_eq!(features.get("CXCL8"), Some(&json!(2.0)));
    }

    #[tokio::test]
    async fn null_fields_read_back_as_absent() {
        let (_guard, store) = test_store().await;

        store
            .bulk_upsert(&[upsert(
                "TCGA-AB-1234",
                "gbm",
                json!({"os": 1, "dss": null, "clinical_stage": "Stage II"}),
            )])
            .await
            .unwrap();

        let doc = store.find("TCGA-AB-1234", "gbm").await.unwrap().unwrap();
        assert_eq!(doc.fields.get("os"), Some(&json!(1)));
        assert_eq!(doc.fields.get("clinical_stage"), Some(&json!("Stage II")));
        assert!(!doc.fields.contains_key("dss"));

        // Setting a field to null removes it from the stored document.
        store
            .bulk_upsert(&[upsert("TCGA-AB-1234", "gbm", json!({"os": null}))])
            .await
            .unwrap();
        let doc = store.find("TCGA-AB-1234", "gbm").await.unwrap().unwrap();
        assert!(!doc.fields.contains_key("os"));
        assert_eq!(doc.fields.get("clinical_stage"), Some(&json!("Stage II")));
    }

    #[tokio::test]
    async fn identity_is_per_cohort() {
        let (_guard, store) = test_store().await;

        store
            .bulk_upsert(&[
                upsert("TCGA-AB-1234", "gbm", json!({"features": {"TP53": 1.0}})),
                upsert("TCGA-AB-1234", "laml", json!({"features": {"TP53": 2.0}})),
            ])
            .await
            .unwrap();

        let gbm = store.find("TCGA-AB-1234", "gbm").await.unwrap().unwrap();
        let laml = store.find("TCGA-AB-1234", "laml").await.unwrap().unwrap();
        assert_eq!(gbm.fields["features"]["TP53"], json!(1.0));
        assert_eq!(laml.fields["features"]["TP53"], json!(2.0));
    }

    #[tokio::test]
    async fn reimport_is_idempotent() {
        let (_guard, store) = test_store().await;
        let batch = vec![upsert(
            "TCGA-AB-1234",
            "gbm",
            json!({"features": {"TP53": 1.5, "ATM": 0.25}}),
        )];

        store.bulk_upsert(&batch).await.unwrap();
        let first = store.find("TCGA-AB-1234", "gbm").await.unwrap().unwrap();
        store.bulk_upsert(&batch).await.unwrap();
        let second = store.find("TCGA-AB-1234", "gbm").await.unwrap().unwrap();
        assert_eq!(first.fields, second.fields);
    }

    #[tokio::test]
    async fn missing_document_is_none() {
        let (_guard, store) = test_store().await;
        assert!(store.find("TCGA-XX-0000", "gbm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_row_is_skipped_not_fatal() {
        let (_guard, store) = test_store().await;
        // Simulate a backend-level row failure (the kind SQLITE_FULL or a
        // busy handler would produce) for one specific patient.
        store
            .with_connection(|conn| {
                conn.execute_batch(
                    r#"
                    CREATE TRIGGER reject_one BEFORE INSERT ON patient_documents
                    WHEN NEW.patient_id = 'TCGA-ZZ-9999'
                    BEGIN
                        SELECT RAISE(ABORT, 'rejected');
                    END;
                    "#,
                )
            })
            .await
            .unwrap();

        let confirmed = store
            .bulk_upsert(&[
                upsert("TCGA-AB-0001", "gbm", json!({"os": 1})),
                upsert("TCGA-ZZ-9999", "gbm", json!({"os": 1})),
                upsert("TCGA-AB-0002", "gbm", json!({"os": 0})),
            ])
            .await
            .unwrap();

        // Only confirmed writes are counted; rows after the failure land.
        assert_eq!(confirmed, 2);
        assert!(store.find("TCGA-ZZ-9999", "gbm").await.unwrap().is_none());
        assert!(store.find("TCGA-AB-0002", "gbm").await.unwrap().is_some());
    }
}
