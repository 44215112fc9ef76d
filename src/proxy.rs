use anyhow::{Context, Result, bail};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const BOOTSTRAP_DONE: &str = "Bootstrapped 100%";
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(120);

/// Lifecycle of the anonymizing proxy the fetcher routes through.
pub trait ProxyController: Send + Sync {
    fn launch(&self) -> BoxFuture<'_, Result<()>>;
    fn stop(&self);
    fn is_running(&self) -> bool;
    /// Proxy url for the HTTP client, `None` for direct connections.
    fn socks_url(&self) -> Option<String>;
}

/// No proxy at all; the fetcher connects directly.
pub struct DirectConnection;

impl ProxyController for DirectConnection {
    fn launch(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) {}

    fn is_running(&self) -> bool {
        true
    }

    fn socks_url(&self) -> Option<String> {
        None
    }
}

/// A `tor` child process exposing a SOCKS port on localhost.
pub struct TorProxy {
    binary: String,
    data_dir: PathBuf,
    socks_port: u16,
    bootstrap_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl TorProxy {
    pub fn new(binary: String, data_dir: PathBuf, socks_port: u16) -> Self {
        Self {
            binary,
            data_dir,
            socks_port,
            bootstrap_timeout: BOOTSTRAP_TIMEOUT,
            child: Mutex::new(None),
        }
    }

    async fn spawn_and_bootstrap(&self) -> Result<Child> {
        fs::create_dir_all(&self.data_dir)
            .await
            .context("Failed to create tor data directory")?;

        let mut child = Command::new(&self.binary)
            .arg("--SocksPort")
            .arg(self.socks_port.to_string())
            .arg("--DataDirectory")
            .arg(&self.data_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.binary))?;

        let stdout = child.stdout.take().context("tor stdout was not captured")?;
        let mut lines = BufReader::new(stdout).lines();

        let bootstrap = async {
            while let Some(line) = lines.next_line().await? {
                debug!("[tor] {}", line);
                if line.contains(BOOTSTRAP_DONE) {
                    return Ok(true);
                }
            }
            Ok::<_, std::io::Error>(false)
        };

        let result = tokio::time::timeout(self.bootstrap_timeout, bootstrap).await;
        match result {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                let _ = child.start_kill();
                bail!("tor exited before bootstrapping");
            }
            Ok(Err(e)) => {
                let _ = child.start_kill();
                return Err(e).context("Failed to read tor output");
            }
            Err(_) => {
                let _ = child.start_kill();
                bail!("tor did not bootstrap within {:?}", self.bootstrap_timeout);
            }
        }

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[tor] {}", line);
            }
        });

        Ok(child)
    }
}

impl ProxyController for TorProxy {
    fn launch(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_running() {
                return Ok(());
            }
            info!(port = self.socks_port, "Starting tor proxy");
            let child = self.spawn_and_bootstrap().await?;
            info!(pid = ?child.id(), "Tor proxy is ready");
            *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
            Ok(())
        })
    }

    fn stop(&self) {
        let child = self.child.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut child) = child {
            info!(pid = ?child.id(), "Stopping tor proxy");
            if let Err(e) = child.start_kill() {
                warn!("Failed to stop tor proxy: {}", e);
            }
        }
    }

    fn is_running(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => true,
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }

    fn socks_url(&self) -> Option<String> {
        Some(format!("socks5h://127.0.0.1:{}", self.socks_port))
    }
}
