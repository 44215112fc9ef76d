//! Single-flight session controller.
//!
//! At most one download exists per process. Admission is one check-and-set
//! on `SessionState` under a mutex that is never held across an await; every
//! step that resumes after an await re-checks that the state still points at
//! the same fetch before touching it.

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use crate::errors::AdmissionError;
use crate::fetcher::{FetchHandle, FetchJob, FetchMetadata, Fetcher, PendingFetch};
use crate::proxy::ProxyController;

/// Fetch workers. Only one fetch is ever admitted; the second permit lets a
/// terminated fetch wind down while its successor starts.
pub const FETCH_WORKERS: usize = 2;

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub temp_dir: PathBuf,
    pub download_dir: PathBuf,
    pub overwrite: bool,
    pub connect_timeout: Duration,
    /// Keep the proxy running between downloads.
    pub keep_proxy: bool,
    /// `None` waits for negotiation indefinitely.
    pub negotiation_timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub url: String,
    pub filename: String,
    pub output_path: PathBuf,
    pub descriptor_path: PathBuf,
    pub marker_path: PathBuf,
    pub total_size: u64,
    pub parts: usize,
}

impl SessionInfo {
    fn new(fetch: &FetchHandle, metadata: FetchMetadata) -> Self {
        Self {
            url: fetch.url().to_string(),
            filename: metadata.filename,
            output_path: metadata.output_path,
            descriptor_path: metadata.descriptor_path,
            marker_path: metadata.marker_path,
            total_size: metadata.total_size,
            parts: fetch.parts(),
        }
    }
}

#[derive(Debug)]
pub struct ActiveSession {
    pub info: SessionInfo,
    pub fetch: Arc<FetchHandle>,
}

enum SessionState {
    Idle,
    Initiating(Arc<Initiation>),
    Active(Arc<ActiveSession>),
    /// Admits new sessions exactly like `Idle`; keeps the last failure around.
    Failed { url: String, reason: String },
}

type Admitted = Option<Result<SessionInfo, AdmissionError>>;

/// A fetch between admission and negotiation. The outcome is decided by a
/// task owned by the manager, so callers that give up waiting cannot leave
/// the slot behind.
struct Initiation {
    fetch: Arc<FetchHandle>,
    admitted: watch::Receiver<Admitted>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Initiating { url: String },
    Active { url: String },
    Failed { url: String, reason: String },
}

pub enum Lookup {
    NotInitiated,
    Mismatch { active: String },
    Active(Arc<ActiveSession>),
}

pub struct SessionManager {
    state: Mutex<SessionState>,
    fetcher: Arc<dyn Fetcher>,
    proxy: Arc<dyn ProxyController>,
    pool: Arc<Semaphore>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        proxy: Arc<dyn ProxyController>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            fetcher,
            proxy,
            pool: Arc::new(Semaphore::new(FETCH_WORKERS)),
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits `url`, starting a fetch if the slot is free, and waits until
    /// the file size is known. Dropping the returned future only stops the
    /// waiting; the admission itself still completes or rolls back.
    pub async fn initiate(
        self: &Arc<Self>,
        url: &str,
        parts: usize,
    ) -> Result<SessionInfo, AdmissionError> {
        let mut admitted = {
            let mut state = self.lock();
            match &*state {
                SessionState::Active(active) if active.info.url == url => {
                    debug!(url, "Re-attaching to active download");
                    return Ok(active.info.clone());
                }
                SessionState::Active(active) => {
                    return Err(AdmissionError::Busy { active: active.info.url.clone() });
                }
                SessionState::Initiating(initiation) if initiation.fetch.url() == url => {
                    debug!(url, "Joining pending negotiation");
                    initiation.admitted.clone()
                }
                SessionState::Initiating(initiation) => {
                    return Err(AdmissionError::Busy {
                        active: initiation.fetch.url().to_string(),
                    });
                }
                SessionState::Idle | SessionState::Failed { .. } => {
                    let (fetch, pending) = FetchHandle::prepare(url, parts);
                    let fetch = Arc::new(fetch);
                    let (tx, rx) = watch::channel(None);
                    *state = SessionState::Initiating(Arc::new(Initiation {
                        fetch: fetch.clone(),
                        admitted: rx.clone(),
                    }));

                    info!(url, parts, "Starting download");
                    tokio::spawn(self.clone().admit(fetch, pending, tx));
                    rx
                }
            }
        };

        let result = match admitted.wait_for(Option::is_some).await {
            Ok(settled) => (*settled).clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(AdmissionError::Unexpected {
                reason: "negotiation task ended without a result".to_string(),
            })
        })
    }

    /// Starts the fetch, waits for negotiation and settles the admission.
    async fn admit(
        self: Arc<Self>,
        fetch: Arc<FetchHandle>,
        pending: PendingFetch,
        admitted: watch::Sender<Admitted>,
    ) {
        let url = fetch.url().to_string();
        let result = match self.start(&fetch, pending).await {
            Err(e) => {
                warn!(url = %url, "{:#}", e);
                Err(self.roll_back(&fetch, format!("{:#}", e)))
            }
            Ok(()) => {
                let negotiated = match self.settings.negotiation_timeout {
                    Some(limit) => match tokio::time::timeout(limit, fetch.negotiated()).await {
                        Ok(result) => result,
                        Err(_) => Err(format!("negotiation did not finish within {:?}", limit)),
                    },
                    None => fetch.negotiated().await,
                };
                match negotiated {
                    Ok(metadata) => self.promote(&fetch, metadata),
                    Err(reason) => {
                        warn!(url = %url, %reason, "Download failed before its size was known");
                        Err(self.roll_back(&fetch, reason))
                    }
                }
            }
        };
        admitted.send_replace(Some(result));
    }

    async fn start(&self, fetch: &Arc<FetchHandle>, pending: PendingFetch) -> Result<()> {
        if !self.proxy.is_running() {
            self.proxy
                .launch()
                .await
                .context("Failed to launch the anonymizing proxy")?;
        }
        if !self.is_current(fetch) {
            // Terminated during the launch: nobody else stops what we started.
            if self.is_vacant() {
                self.stop_proxy();
            }
            bail!("session was released while the proxy was starting");
        }

        let job = FetchJob {
            url: fetch.url().to_string(),
            parts: fetch.parts(),
            temp_dir: self.settings.temp_dir.clone(),
            output_dir: self.settings.download_dir.clone(),
            overwrite: self.settings.overwrite,
            connect_timeout: self.settings.connect_timeout,
        };
        pending.dispatch(self.fetcher.clone(), self.pool.clone(), job);
        Ok(())
    }

    fn promote(
        &self,
        fetch: &Arc<FetchHandle>,
        metadata: FetchMetadata,
    ) -> Result<SessionInfo, AdmissionError> {
        let mut state = self.lock();
        match &*state {
            SessionState::Initiating(current) if Arc::ptr_eq(&current.fetch, fetch) => {
                let info = SessionInfo::new(fetch, metadata);
                info!(url = %info.url, file = %info.filename, size = info.total_size, "Download is active");
                *state = SessionState::Active(Arc::new(ActiveSession {
                    info: info.clone(),
                    fetch: fetch.clone(),
                }));
                Ok(info)
            }
            _ => {
                drop(state);
                fetch.terminate();
                Err(AdmissionError::Unexpected {
                    reason: "session was released while the download was negotiating".to_string(),
                })
            }
        }
    }

    /// Undoes an admission that failed. Only the caller that still finds its
    /// own fetch installed resets the state and stops the proxy.
    fn roll_back(&self, fetch: &Arc<FetchHandle>, reason: String) -> AdmissionError {
        fetch.terminate();
        let released = {
            let mut state = self.lock();
            if Self::holds(&state, fetch) {
                *state = SessionState::Failed {
                    url: fetch.url().to_string(),
                    reason: reason.clone(),
                };
                true
            } else {
                false
            }
        };
        if released {
            self.stop_proxy();
        }
        AdmissionError::RecoverableFetch { reason }
    }

    /// Stops whatever is in flight and resets to idle. Returns whether there
    /// was anything to stop.
    pub fn terminate(&self) -> bool {
        let previous = std::mem::replace(&mut *self.lock(), SessionState::Idle);
        let fetch = match previous {
            SessionState::Initiating(initiation) => Some(initiation.fetch.clone()),
            SessionState::Active(active) => Some(active.fetch.clone()),
            SessionState::Idle | SessionState::Failed { .. } => None,
        };

        if let Some(fetch) = &fetch {
            info!(url = fetch.url(), "Terminating download");
            fetch.terminate();
        }
        self.stop_proxy();
        fetch.is_some()
    }

    /// Releases `session` if it is still the current one. A newer session
    /// admitted in the meantime is left alone.
    pub fn release(&self, session: &ActiveSession) -> bool {
        let released = {
            let mut state = self.lock();
            match &*state {
                SessionState::Active(active) if Arc::ptr_eq(&active.fetch, &session.fetch) => {
                    *state = SessionState::Idle;
                    true
                }
                _ => false,
            }
        };

        if released {
            debug!(url = %session.info.url, "Released session");
            session.fetch.terminate();
            self.stop_proxy();
        }
        released
    }

    pub fn lookup(&self, url: &str) -> Lookup {
        match &*self.lock() {
            SessionState::Active(active) if active.info.url == url => Lookup::Active(active.clone()),
            SessionState::Active(active) => Lookup::Mismatch { active: active.info.url.clone() },
            SessionState::Initiating(initiation) if initiation.fetch.url() != url => {
                Lookup::Mismatch { active: initiation.fetch.url().to_string() }
            }
            _ => Lookup::NotInitiated,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match &*self.lock() {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Initiating(initiation) => SessionPhase::Initiating {
                url: initiation.fetch.url().to_string(),
            },
            SessionState::Active(active) => SessionPhase::Active { url: active.info.url.clone() },
            SessionState::Failed { url, reason } => SessionPhase::Failed {
                url: url.clone(),
                reason: reason.clone(),
            },
        }
    }

    fn is_current(&self, fetch: &Arc<FetchHandle>) -> bool {
        Self::holds(&self.lock(), fetch)
    }

    fn is_vacant(&self) -> bool {
        matches!(&*self.lock(), SessionState::Idle | SessionState::Failed { .. })
    }

    fn holds(state: &SessionState, fetch: &Arc<FetchHandle>) -> bool {
        match state {
            SessionState::Initiating(current) => Arc::ptr_eq(&current.fetch, fetch),
            SessionState::Active(active) => Arc::ptr_eq(&active.fetch, fetch),
            _ => false,
        }
    }

    fn stop_proxy(&self) {
        if !self.settings.keep_proxy {
            self.proxy.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchOutcome;
    use crate::testing::{RecordingProxy, Script, ScriptedFetcher, sample_data, settings};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    const X: &str = "http://source.example/files/X.bin";
    const Y: &str = "http://source.example/files/Y.bin";

    fn manager(
        dir: &TempDir,
        fetcher: &Arc<ScriptedFetcher>,
        proxy: &Arc<RecordingProxy>,
    ) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(fetcher.clone(), proxy.clone(), settings(dir.path())))
    }

    #[tokio::test]
    async fn initiate_returns_negotiated_info() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(sample_data(1000)));
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        let info = session.initiate(X, 4).await.unwrap();
        assert_eq!(info.url, X);
        assert_eq!(info.filename, "X.bin");
        assert_eq!(info.total_size, 1000);
        assert_eq!(info.parts, 4);
        assert_eq!(info.output_path, dir.path().join("downloads").join("X.bin"));
        assert_eq!(session.phase(), SessionPhase::Active { url: X.to_string() });
        assert_eq!(proxy.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_url_reattaches_without_second_fetch() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(sample_data(1000)));
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        let first = session.initiate(X, 4).await.unwrap();
        let second = session.initiate(X, 4).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn different_url_is_busy() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(sample_data(1000)));
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        session.initiate(X, 4).await.unwrap();
        let err = session.initiate(Y, 4).await.unwrap_err();
        assert_eq!(err, AdmissionError::Busy { active: X.to_string() });
        assert_eq!(session.phase(), SessionPhase::Active { url: X.to_string() });
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_differing_urls_admit_exactly_one() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            ScriptedFetcher::new(sample_data(1000)).negotiation_delay(Duration::from_millis(50)),
        );
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        let (a, b) = tokio::join!(session.initiate(X, 4), session.initiate(Y, 4));
        let admitted = [&a, &b].iter().filter(|r| r.is_ok()).count();
        let busy = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(AdmissionError::Busy { .. })))
            .count();
        assert_eq!((admitted, busy), (1, 1));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_same_url_shares_one_negotiation() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            ScriptedFetcher::new(sample_data(1000)).negotiation_delay(Duration::from_millis(50)),
        );
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        let (a, b) = tokio::join!(session.initiate(X, 4), session.initiate(X, 4));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn negotiation_failure_rolls_back_and_allows_retry() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            ScriptedFetcher::new(sample_data(1000)).script(Script::FailNegotiation("captcha rejected".into())),
        );
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        let err = session.initiate(X, 4).await.unwrap_err();
        assert!(matches!(err, AdmissionError::RecoverableFetch { ref reason } if reason.contains("captcha rejected")));
        assert!(matches!(session.phase(), SessionPhase::Failed { .. }));
        assert_eq!(proxy.stops.load(Ordering::SeqCst), 1);
        assert!(!proxy.is_running());

        // A different url is admitted after the failure, and so is a retry.
        assert!(session.initiate(Y, 4).await.is_err());
        assert!(session.initiate(X, 4).await.is_err());
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(proxy.launches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_proxy_survives_rollback() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            ScriptedFetcher::new(sample_data(10)).script(Script::FailNegotiation("gone".into())),
        );
        let proxy = Arc::new(RecordingProxy::default());
        let mut config = settings(dir.path());
        config.keep_proxy = true;
        let session = Arc::new(SessionManager::new(fetcher.clone(), proxy.clone(), config));

        assert!(session.initiate(X, 2).await.is_err());
        assert!(session.initiate(X, 2).await.is_err());
        assert_eq!(proxy.stops.load(Ordering::SeqCst), 0);
        assert_eq!(proxy.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn proxy_launch_failure_is_recoverable() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(sample_data(10)));
        let proxy = Arc::new(RecordingProxy::failing());
        let session = manager(&dir, &fetcher, &proxy);

        let err = session.initiate(X, 2).await.unwrap_err();
        assert!(matches!(err, AdmissionError::RecoverableFetch { .. }));
        assert_eq!(fetcher.calls(), 0);
        assert!(matches!(session.phase(), SessionPhase::Failed { .. }));
    }

    #[tokio::test]
    async fn negotiation_timeout_gives_up() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(sample_data(10)).script(Script::NeverNegotiate));
        let proxy = Arc::new(RecordingProxy::default());
        let mut config = settings(dir.path());
        config.negotiation_timeout = Some(Duration::from_millis(50));
        let session = Arc::new(SessionManager::new(fetcher.clone(), proxy.clone(), config));

        let err = session.initiate(X, 2).await.unwrap_err();
        assert!(matches!(err, AdmissionError::RecoverableFetch { ref reason } if reason.contains("negotiation")));
        assert!(matches!(session.phase(), SessionPhase::Failed { .. }));
    }

    #[tokio::test]
    async fn terminate_stops_fetch_and_resets() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(sample_data(1000)).script(Script::Hold));
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        session.initiate(X, 4).await.unwrap();
        let Lookup::Active(active) = session.lookup(X) else { panic!("session is not active") };

        assert!(session.terminate());
        assert_eq!(session.phase(), SessionPhase::Idle);
        let outcome = timeout(Duration::from_secs(1), active.fetch.finished()).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Terminated);
        assert!(!proxy.is_running());
        assert!(!session.terminate());
    }

    #[tokio::test]
    async fn release_ignores_a_replaced_session() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(sample_data(100)).script(Script::Hold));
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        session.initiate(X, 2).await.unwrap();
        let Lookup::Active(old) = session.lookup(X) else { panic!("session is not active") };
        session.terminate();
        session.initiate(X, 2).await.unwrap();

        assert!(!session.release(&old));
        assert_eq!(session.phase(), SessionPhase::Active { url: X.to_string() });
        let Lookup::Active(current) = session.lookup(X) else { panic!("session is not active") };
        assert!(session.release(&current));
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn lookup_distinguishes_missing_and_mismatched() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(sample_data(100)));
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        assert!(matches!(session.lookup(X), Lookup::NotInitiated));
        session.initiate(X, 2).await.unwrap();
        assert!(matches!(session.lookup(Y), Lookup::Mismatch { ref active } if active == X));
        assert!(matches!(session.lookup(X), Lookup::Active(_)));
    }

    #[tokio::test]
    async fn abandoned_initiate_still_rolls_back() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            ScriptedFetcher::new(sample_data(100))
                .negotiation_delay(Duration::from_millis(50))
                .script(Script::FailNegotiation("link expired".into())),
        );
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        assert!(timeout(Duration::from_millis(10), session.initiate(X, 2)).await.is_err());
        sleep(Duration::from_millis(150)).await;

        assert!(matches!(session.phase(), SessionPhase::Failed { ref url, .. } if url == X));
        assert!(!proxy.is_running());
        let err = session.initiate(Y, 2).await.unwrap_err();
        assert!(matches!(err, AdmissionError::RecoverableFetch { .. }));
    }

    #[tokio::test]
    async fn abandoned_initiate_still_becomes_active() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            ScriptedFetcher::new(sample_data(100)).negotiation_delay(Duration::from_millis(50)),
        );
        let proxy = Arc::new(RecordingProxy::default());
        let session = manager(&dir, &fetcher, &proxy);

        assert!(timeout(Duration::from_millis(10), session.initiate(X, 2)).await.is_err());
        sleep(Duration::from_millis(150)).await;

        assert_eq!(session.phase(), SessionPhase::Active { url: X.to_string() });
        assert_eq!(session.initiate(X, 2).await.unwrap().total_size, 100);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn terminate_during_proxy_launch_stops_the_proxy() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(sample_data(100)));
        let proxy = Arc::new(RecordingProxy::slow(Duration::from_millis(50)));
        let session = manager(&dir, &fetcher, &proxy);

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.initiate(X, 2).await }
        });
        sleep(Duration::from_millis(10)).await;
        assert!(session.terminate());

        let err = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, AdmissionError::RecoverableFetch { .. }));
        assert_eq!(proxy.launches.load(Ordering::SeqCst), 1);
        assert!(!proxy.is_running());
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(session.phase(), SessionPhase::Idle);
    }
}
