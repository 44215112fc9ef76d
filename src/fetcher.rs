//! Contract between the session controller and the segmented fetcher.
//!
//! A fetch reports exactly two milestones, both through one `watch` channel:
//! the negotiated metadata (filename, size, paths) and the terminal outcome.
//! Byte-level progress never travels through here; it lives in the progress
//! descriptor on disk.

use anyhow::Result;
use futures::future::BoxFuture;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct FetchJob {
    pub url: String,
    pub parts: usize,
    /// Where the fetcher keeps its side files (descriptor, marker).
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub overwrite: bool,
    pub connect_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchMetadata {
    pub filename: String,
    pub output_path: PathBuf,
    pub descriptor_path: PathBuf,
    pub marker_path: PathBuf,
    pub total_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Succeeded,
    Failed(String),
    Terminated,
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchOutcome::Succeeded => write!(f, "succeeded"),
            FetchOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            FetchOutcome::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FetchStatus {
    pub metadata: Option<FetchMetadata>,
    pub outcome: Option<FetchOutcome>,
}

/// Handed to the fetcher so it can announce the negotiated metadata. The
/// progress descriptor must already exist on disk when `publish` is called.
pub struct MetadataSink {
    status: Arc<watch::Sender<FetchStatus>>,
}

impl MetadataSink {
    pub fn publish(&self, metadata: FetchMetadata) {
        self.status.send_modify(|s| s.metadata = Some(metadata));
    }
}

/// A segmented fetcher. The returned future writes the output file and the
/// progress descriptor; dropping it must stop all outstanding writes.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, job: FetchJob, sink: MetadataSink) -> BoxFuture<'static, Result<()>>;
}

/// Observer side of one fetch.
#[derive(Debug)]
pub struct FetchHandle {
    url: String,
    parts: usize,
    status: watch::Receiver<FetchStatus>,
    cancel: CancellationToken,
}

/// The not-yet-started half of a fetch, created together with its handle so
/// the handle can be published before the worker is dispatched.
pub struct PendingFetch {
    status: Arc<watch::Sender<FetchStatus>>,
    cancel: CancellationToken,
}

impl FetchHandle {
    pub fn prepare(url: &str, parts: usize) -> (FetchHandle, PendingFetch) {
        let (tx, rx) = watch::channel(FetchStatus::default());
        let cancel = CancellationToken::new();
        let handle = FetchHandle {
            url: url.to_string(),
            parts,
            status: rx,
            cancel: cancel.clone(),
        };
        let pending = PendingFetch {
            status: Arc::new(tx),
            cancel,
        };
        (handle, pending)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn parts(&self) -> usize {
        self.parts
    }

    pub fn status(&self) -> watch::Receiver<FetchStatus> {
        self.status.clone()
    }

    pub fn outcome(&self) -> Option<FetchOutcome> {
        self.status.borrow().outcome.clone()
    }

    /// Idempotent; a finished fetch ignores it.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the size is known, or with the reason the fetch ended
    /// before that.
    pub async fn negotiated(&self) -> std::result::Result<FetchMetadata, String> {
        let mut rx = self.status.clone();
        let negotiated = match rx
            .wait_for(|s| s.metadata.is_some() || s.outcome.is_some())
            .await
        {
            Ok(status) => match (&status.metadata, &status.outcome) {
                (Some(metadata), _) => Ok(metadata.clone()),
                (None, Some(outcome)) => Err(outcome.to_string()),
                (None, None) => Err("fetch reported nothing".to_string()),
            },
            Err(_) => Err("fetch was never started".to_string()),
        };
        negotiated
    }

    pub async fn finished(&self) -> FetchOutcome {
        let mut rx = self.status.clone();
        let outcome = match rx.wait_for(|s| s.outcome.is_some()).await {
            Ok(status) => status.outcome.clone().unwrap_or(FetchOutcome::Terminated),
            Err(_) => FetchOutcome::Terminated,
        };
        outcome
    }
}

impl PendingFetch {
    /// Runs the fetch on the worker pool. The terminal outcome is recorded
    /// whether the fetch returns, fails, or is cancelled.
    pub fn dispatch(self, fetcher: Arc<dyn Fetcher>, pool: Arc<Semaphore>, job: FetchJob) {
        let PendingFetch { status, cancel } = self;

        tokio::spawn(async move {
            let url = job.url.clone();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => FetchOutcome::Terminated,
                outcome = async {
                    let _permit = match pool.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return FetchOutcome::Failed("worker pool is closed".to_string()),
                    };
                    let sink = MetadataSink { status: status.clone() };
                    match fetcher.fetch(job, sink).await {
                        Ok(()) => FetchOutcome::Succeeded,
                        Err(e) => FetchOutcome::Failed(format!("{:#}", e)),
                    }
                } => outcome,
            };

            match &outcome {
                FetchOutcome::Succeeded => info!(url = %url, "Download finished"),
                FetchOutcome::Failed(reason) => warn!(url = %url, %reason, "Download failed"),
                FetchOutcome::Terminated => info!(url = %url, "Download terminated"),
            }
            status.send_modify(|s| s.outcome = Some(outcome));
        });
    }
}
