//! Configuration management for the cohort ingest pipeline

use crate::error::{ConfigError, Result, Validate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure for the ingest pipeline.
///
/// Holds the object store connection, the document store location, the
/// configured feature panel, and ingest tuning parameters.
///
/// # Example
///
/// ```rust,no_run
/// use onco_ingest::config::AppConfig;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AppConfig::load().await?;
/// println!("Bucket: {}", config.object_store.bucket);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub documents: DocumentStoreConfig,
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Connection settings for the raw-file object store.
///
/// `backend` selects the adapter: `"s3"` for any S3-compatible endpoint
/// (MinIO included), `"local"` for a filesystem-backed store under
/// `data_dir`, `"memory"` for an in-process store (tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_access_key")]
    pub access_key: String,
    #[serde(default = "default_secret_key")]
    pub secret_key: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Root directory for the `local` backend; the bucket becomes a
    /// subdirectory of it.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Location of the SQLite-backed patient document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

/// The configured set of wanted features and their alias table.
///
/// Feature matching is case-insensitive; aliases map a legacy name to its
/// canonical one and are applied before matching against the wanted set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    #[serde(default = "default_genes")]
    pub genes: Vec<String>,
    #[serde(default = "default_aliases")]
    pub aliases: HashMap<String, String>,
}

/// Tuning parameters for retrieval and import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Ordered mirror URL templates; `{filename}` is substituted with the
    /// filename derived from the job's source reference.
    #[serde(default = "default_mirrors")]
    pub mirrors: Vec<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Upper bound on ingest jobs running concurrently within one batch.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Upsert sink flush threshold, in buffered records.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            endpoint: default_endpoint(),
            region: default_region(),
            access_key: default_access_key(),
            secret_key: default_secret_key(),
            bucket: default_bucket(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: default_database(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            genes: default_genes(),
            aliases: default_aliases(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            mirrors: default_mirrors(),
            timeout: default_timeout(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            batch_size: default_batch_size(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from the default location (`onco-ingest.toml` in
    /// the current directory).
    ///
    /// Returns a default configuration when no file exists. Environment
    /// variable overrides are applied in both cases.
    pub async fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from_path(&config_path).await
        } else {
            let mut config = Self::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    /// Loads configuration from a specific TOML file.
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|_| ConfigError::InvalidFile {
                    path: path.to_path_buf(),
                })?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path (`onco-ingest.toml` in the current
    /// directory).
    pub fn default_config_path() -> PathBuf {
        PathBuf::from("onco-ingest.toml")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("ONCO_INGEST_ENDPOINT") {
            self.object_store.endpoint = endpoint;
        }
        if let Ok(bucket) = std::env::var("ONCO_INGEST_BUCKET") {
            self.object_store.bucket = bucket;
        }
        if let Ok(access_key) = std::env::var("ONCO_INGEST_ACCESS_KEY") {
            self.object_store.access_key = access_key;
        }
        if let Ok(secret_key) = std::env::var("ONCO_INGEST_SECRET_KEY") {
            self.object_store.secret_key = secret_key;
        }
        if let Ok(data_dir) = std::env::var("ONCO_INGEST_DATA_DIR") {
            self.object_store.data_dir = PathBuf::from(&data_dir);
            self.documents.data_dir = PathBuf::from(data_dir);
        }
    }
}

impl Validate for AppConfig {
    type Error = ConfigError;

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.object_store.validate()?;
        self.documents.validate()?;
        self.ingest.validate()?;
        Ok(())
    }
}

impl Validate for ObjectStoreConfig {
    type Error = ConfigError;

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        match self.backend.as_str() {
            "s3" | "local" | "memory" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "object_store.backend".to_string(),
                    value: other.to_string(),
                });
            }
        }
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "object_store.bucket".to_string(),
            });
        }
        if self.backend == "s3" && self.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "object_store.endpoint".to_string(),
            });
        }
        Ok(())
    }
}

impl Validate for DocumentStoreConfig {
    type Error = ConfigError;

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "documents.database".to_string(),
            });
        }
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "documents.pool_size".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

impl Validate for IngestConfig {
    type Error = ConfigError;

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.mirrors.is_empty() {
            return Err(ConfigError::MissingField {
                field: "ingest.mirrors".to_string(),
            });
        }
        for mirror in &self.mirrors {
            if !mirror.contains("{filename}") {
                return Err(ConfigError::InvalidValue {
                    key: "ingest.mirrors".to_string(),
                    value: mirror.clone(),
                });
            }
        }
        if self.timeout == 0 {
            return Err(ConfigError::ValidationFailed {
                message: "ingest.timeout must be greater than zero".to_string(),
            });
        }
        if self.max_concurrent_jobs == 0 || self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed {
                message: "ingest.max_concurrent_jobs and ingest.batch_size must be greater than zero"
                    .to_string(),
            });
        }
        Ok(())
    }
}

fn default_backend() -> String {
    "s3".to_string()
}

fn default_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_access_key() -> String {
    "minioadmin".to_string()
}

fn default_secret_key() -> String {
    "minioadmin".to_string()
}

fn default_bucket() -> String {
    "tcga".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".onco-ingest")
}

fn default_database() -> String {
    "tcga".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_genes() -> Vec<String> {
    [
        "C6orf150", "CCL5", "CXCL10", "TMEM173", "CXCL9", "CXCL11", "NFKB1", "IKBKE", "IRF3",
        "TREX1", "ATM", "IL6", "IL8",
    ]
    .iter()
    .map(|g| g.to_string())
    .collect()
}

fn default_aliases() -> HashMap<String, String> {
    // Historical HGNC rename; expression matrices predating it still carry
    // the old symbol.
    HashMap::from([("IL8".to_string(), "CXCL8".to_string())])
}

fn default_mirrors() -> Vec<String> {
    vec![
        "https://tcga.xenahubs.net/download?filename={filename}".to_string(),
        "https://pancanatlas.xenahubs.net/download/{filename}".to_string(),
        "https://pancanatlas.xenahubs.net/download?filename={filename}".to_string(),
        "https://toil-xenahub.s3.us-east-1.amazonaws.com/download/{filename}".to_string(),
    ]
}

fn default_timeout() -> u64 {
    60
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_batch_size() -> usize {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.object_store.bucket, "tcga");
        assert_eq!(config.ingest.batch_size, 2000);
        assert_eq!(config.ingest.mirrors.len(), 4);
    }

    #[test]
    fn rejects_unknown_backend() {
        let mut config = AppConfig::default();
        config.object_store.backend = "ftp".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn rejects_mirror_without_placeholder() {
        let mut config = AppConfig::default();
        config.ingest.mirrors = vec!["https://example.com/static.tsv".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_bucket() {
        let mut config = AppConfig::default();
        config.object_store.bucket = " ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn parses_partial_toml() {
        let toml = r#"
            [object_store]
            backend = "local"

            [panel]
            genes = ["TP53", "IL8"]
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.object_store.backend, "local");
        assert_eq!(config.panel.genes, vec!["TP53", "IL8"]);
        // Untouched sections keep their defaults.
        assert_eq!(config.ingest.max_concurrent_jobs, 4);
        assert_eq!(config.panel.aliases.get("IL8").unwrap(), "CXCL8");
    }
}
