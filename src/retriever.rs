//! Mirror-fallback retrieval of cohort source files
//!
//! Each ingest job names a source file by URL or bare filename. The
//! retriever expands it into an ordered list of candidate URLs (explicit
//! URL first, then the configured mirror templates), walks them
//! sequentially until one streams successfully into the object store, and
//! runs independent jobs of a batch concurrently up to a configured bound.

use crate::blobs::{BlobStore, StoredObject};
use crate::config::IngestConfig;
use crate::error::{ImportError, Result, RetrievalError};
use futures_util::{StreamExt, stream};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One requested source file within an ingest batch.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestJob {
    /// Cohort the file belongs to; becomes the object key prefix.
    pub cohort: String,
    /// Absolute `http(s)` URL or a bare filename resolved via the mirrors.
    pub source: String,
    /// Optional explicit object name within the cohort prefix; defaults to
    /// the filename derived from the source reference.
    #[serde(default)]
    pub object_name: Option<String>,
}

/// Outcome of a batch: every job lands either in `downloaded` or `errors`.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub downloaded: Vec<StoredObject>,
    pub errors: Vec<String>,
}

impl BatchReport {
    /// True when the batch made no progress at all.
    pub fn all_failed(&self) -> bool {
        self.downloaded.is_empty() && !self.errors.is_empty()
    }
}

/// Derives the filename a source URL refers to.
///
/// Hub-style download endpoints put the filename in a `filename` query
/// parameter behind a literal `download` path segment; everything else uses
/// the last path segment.
fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    if segment.eq_ignore_ascii_case("download") {
        url.query_pairs()
            .find(|(k, _)| k == "filename")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    } else {
        Some(segment.to_string())
    }
}

/// Last non-empty path segment of a source reference, used as the stored
/// name when the winning URL itself does not yield a filename.
fn trailing_segment(source: &str) -> Option<String> {
    let tail = source.trim().trim_end_matches('/').rsplit('/').next()?;
    let tail = tail.split('?').next().unwrap_or(tail).trim();
    (!tail.is_empty()).then(|| tail.to_string())
}

/// Expands a source reference into an ordered candidate URL list.
///
/// An absolute URL is always tried first, followed by every mirror template
/// with `{filename}` substituted; a URL without a derivable filename stays
/// the sole candidate. A bare filename uses the mirrors alone.
pub fn candidate_urls(source: &str, mirrors: &[String]) -> Result<Vec<Url>> {
    let source = source.trim();
    let invalid = || RetrievalError::InvalidSource {
        source_ref: source.to_string(),
    };

    let (filename, explicit) = if source.starts_with("http://") || source.starts_with("https://") {
        let url = Url::parse(source).map_err(|_| invalid())?;
        (filename_from_url(&url), Some(url))
    } else {
        if source.is_empty() || source.contains('/') {
            return Err(invalid().into());
        }
        (Some(source.to_string()), None)
    };

    let mut candidates = Vec::with_capacity(mirrors.len() + 1);
    candidates.extend(explicit);
    if let Some(filename) = &filename {
        for template in mirrors {
            let expanded = template.replace("{filename}", filename);
            // Mirror templates are validated at config load; a template that
            // still fails to parse with this filename is skipped, not fatal.
            match Url::parse(&expanded) {
                Ok(url) if !candidates.contains(&url) => candidates.push(url),
                Ok(_) => {}
                Err(e) => warn!("Skipping unparseable mirror candidate {}: {}", expanded, e),
            }
        }
    }
    if candidates.is_empty() {
        return Err(invalid().into());
    }
    Ok(candidates)
}

fn object_key(cohort: &str, object_name: Option<&str>, filename: &str) -> String {
    let cohort = cohort.trim().to_ascii_lowercase();
    let name = object_name
        .map(|n| n.trim().trim_start_matches('/'))
        .filter(|n| !n.is_empty())
        .unwrap_or(filename);
    format!("{cohort}/{name}")
}

/// Downloads cohort source files into the object store.
pub struct Retriever {
    client: reqwest::Client,
    blobs: Arc<dyn BlobStore>,
    mirrors: Vec<String>,
    max_concurrent: usize,
}

impl Retriever {
    pub fn new(blobs: Arc<dyn BlobStore>, config: &IngestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(concat!("onco-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            blobs,
            mirrors: config.mirrors.clone(),
            max_concurrent: config.max_concurrent_jobs.max(1),
        })
    }

    /// Runs every job in the batch, at most `max_concurrent_jobs` at a time.
    ///
    /// Individual job failures are collected as diagnostics; the call itself
    /// fails only for an empty batch, an unreachable bucket, or
    /// cancellation observed before any work starts.
    pub async fn run_batch(
        &self,
        jobs: &[IngestJob],
        token: &CancellationToken,
    ) -> Result<BatchReport> {
        if jobs.is_empty() {
            return Err(RetrievalError::EmptyBatch.into());
        }
        self.blobs.ensure_bucket().await?;

        let mut results = stream::iter(jobs)
            .map(|job| async move { (job, self.fetch_job(job, token).await) })
            .buffer_unordered(self.max_concurrent);

        let mut report = BatchReport::default();
        while let Some((job, result)) = results.next().await {
            match result {
                Ok(stored) => {
                    info!("Ingested {} as {}", job.source, stored.key);
                    report.downloaded.push(stored);
                }
                Err(e) => {
                    warn!("Ingest of {} failed: {}", job.source, e);
                    report.errors.push(format!("{}: {}", job.source, e));
                }
            }
        }
        Ok(report)
    }

    /// Retrieves one job, walking its mirror candidates in order and
    /// stopping at the first success.
    pub async fn fetch_job(
        &self,
        job: &IngestJob,
        token: &CancellationToken,
    ) -> Result<StoredObject> {
        if job.cohort.trim().is_empty() {
            return Err(ImportError::MissingCohort.into());
        }
        let candidates = candidate_urls(&job.source, &self.mirrors)?;

        for url in &candidates {
            if token.is_cancelled() {
                return Err(RetrievalError::Cancelled.into());
            }
            match self.try_download(job, url, token).await {
                Ok(stored) => return Ok(stored),
                Err(e @ crate::error::IngestError::Retrieval(RetrievalError::Cancelled)) => {
                    return Err(e);
                }
                Err(e) => warn!("Candidate {} failed for {}: {}", url, job.source, e),
            }
        }
        Err(RetrievalError::AllMirrorsFailed {
            source_ref: job.source.clone(),
        }
        .into())
    }

    async fn try_download(
        &self,
        job: &IngestJob,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<StoredObject> {
        let response = tokio::select! {
            _ = token.cancelled() => return Err(RetrievalError::Cancelled.into()),
            response = self.client.get(url.clone()).send() => response?,
        };
        let response = response.error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        // The filename comes from the candidate that actually answered, so
        // mirror-specific path shapes cannot change the stored key. A URL
        // that yields none falls back to the job source's trailing segment.
        let filename = filename_from_url(url)
            .or_else(|| trailing_segment(&job.source))
            .ok_or_else(|| RetrievalError::InvalidSource {
                source_ref: url.to_string(),
            })?;
        let key = object_key(&job.cohort, job.object_name.as_deref(), &filename);

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();

        let bytes = tokio::select! {
            _ = token.cancelled() => return Err(RetrievalError::Cancelled.into()),
            written = self.blobs.put(&key, body, &content_type) => written?,
        };
        Ok(StoredObject {
            key,
            content_type,
            bytes,
        })
    }
}
