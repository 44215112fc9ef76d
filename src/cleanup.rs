use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::{ActiveSession, SessionInfo, SessionManager};
use crate::state::descriptor_tmp_path;

#[derive(Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Another cleanup for the same output path is already running.
    Skipped,
    Completed { removed: usize },
}

/// Post-stream reclamation. At most one cleanup runs per output path.
pub struct Cleaner {
    auto_delete: bool,
    in_flight: Mutex<HashSet<PathBuf>>,
}

struct Claim<'a> {
    cleaner: &'a Cleaner,
    path: PathBuf,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.cleaner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

impl Cleaner {
    pub fn new(auto_delete: bool) -> Self {
        Self {
            auto_delete,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, path: &Path) -> Option<Claim<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(path.to_path_buf()) {
            return None;
        }
        Some(Claim {
            cleaner: self,
            path: path.to_path_buf(),
        })
    }

    pub fn schedule(
        self: &Arc<Self>,
        session: Arc<SessionManager>,
        active: Arc<ActiveSession>,
    ) -> JoinHandle<CleanupOutcome> {
        let cleaner = self.clone();
        tokio::spawn(async move { cleaner.run(&session, &active).await })
    }

    /// Waits for the fetch to reach a terminal outcome, releases the session
    /// and, with auto-delete on, removes the output and its side files.
    pub async fn run(&self, session: &SessionManager, active: &ActiveSession) -> CleanupOutcome {
        let info = &active.info;
        let Some(_claim) = self.claim(&info.output_path) else {
            debug!(path = ?info.output_path, "Cleanup already running");
            return CleanupOutcome::Skipped;
        };

        let outcome = active.fetch.finished().await;
        debug!(url = %info.url, %outcome, "Fetch settled, cleaning up");
        session.release(active);

        if !self.auto_delete {
            return CleanupOutcome::Completed { removed: 0 };
        }

        info!("Cleanup of: {:?}", info.output_path);
        match remove_download_files(info).await {
            Ok(removed) => CleanupOutcome::Completed { removed },
            Err(e) => {
                warn!(path = ?info.output_path, "Cleanup failed: {}", e);
                CleanupOutcome::Completed { removed: 0 }
            }
        }
    }
}

/// Deletes the output file, descriptor and marker, plus a descriptor temp
/// file left by an interrupted save. Files that are already gone are not an
/// error. Returns how many files were removed.
pub async fn remove_download_files(info: &SessionInfo) -> io::Result<usize> {
    let descriptor_tmp = descriptor_tmp_path(&info.descriptor_path);
    let mut removed = 0;
    for path in [&info.marker_path, &descriptor_tmp, &info.descriptor_path, &info.output_path] {
        match fs::remove_file(path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}
