//! In-process stand-ins for the fetcher and the proxy.

use anyhow::{Result, bail};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::fetcher::{FetchJob, FetchMetadata, Fetcher, MetadataSink};
use crate::proxy::ProxyController;
use crate::session::SessionSettings;
use crate::state::{DownloadState, descriptor_path, marker_path};
use crate::utils::get_filename_from_url;

pub fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn settings(root: &Path) -> SessionSettings {
    SessionSettings {
        temp_dir: root.join("tmp"),
        download_dir: root.join("downloads"),
        overwrite: true,
        connect_timeout: Duration::from_secs(1),
        keep_proxy: false,
        negotiation_timeout: None,
    }
}

#[derive(Clone, Debug)]
pub enum Script {
    /// Write every segment, then succeed.
    Complete,
    /// Write every segment, then stay running until terminated.
    Hold,
    /// Fail before the size is known.
    FailNegotiation(String),
    /// Never get as far as knowing the size.
    NeverNegotiate,
}

/// Writes `data` the way a segmented fetch would: segments last-to-first, in
/// `step`-sized flushes, persisting the descriptor after each one.
pub struct ScriptedFetcher {
    data: Bytes,
    script: Script,
    negotiation_delay: Duration,
    step: usize,
    step_delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedFetcher {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
            script: Script::Complete,
            negotiation_delay: Duration::ZERO,
            step: 100,
            step_delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn script(mut self, script: Script) -> Self {
        self.script = script;
        self
    }

    pub fn negotiation_delay(mut self, delay: Duration) -> Self {
        self.negotiation_delay = delay;
        self
    }

    pub fn steps(mut self, step: usize, delay: Duration) -> Self {
        self.step = step.max(1);
        self.step_delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, job: FetchJob, sink: MetadataSink) -> BoxFuture<'static, Result<()>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let data = self.data.clone();
        let script = self.script.clone();
        let negotiation_delay = self.negotiation_delay;
        let step = self.step as u64;
        let step_delay = self.step_delay;

        Box::pin(async move {
            tokio::time::sleep(negotiation_delay).await;
            match &script {
                Script::FailNegotiation(reason) => bail!("{}", reason),
                Script::NeverNegotiate => futures::future::pending::<()>().await,
                Script::Complete | Script::Hold => {}
            }

            let filename = get_filename_from_url(&job.url)?;
            let output_path = job.output_dir.join(&filename);
            let descriptor = descriptor_path(&job.temp_dir.join(&filename));
            let marker = marker_path(&job.temp_dir.join(&filename));
            fs::create_dir_all(&job.output_dir).await?;
            fs::create_dir_all(&job.temp_dir).await?;
            fs::write(&output_path, vec![0u8; data.len()]).await?;
            fs::write(&marker, b"").await?;

            let mut state = DownloadState::new(&job.url, data.len() as u64, job.parts);
            state.save(&descriptor).await?;
            sink.publish(FetchMetadata {
                filename,
                output_path: output_path.clone(),
                descriptor_path: descriptor.clone(),
                marker_path: marker.clone(),
                total_size: data.len() as u64,
            });

            let mut file = OpenOptions::new().write(true).open(&output_path).await?;
            for index in (0..state.parts.len()).rev() {
                let end = state.parts[index].end_byte;
                while state.parts[index].current_byte < end {
                    let start = state.parts[index].current_byte;
                    let next = (start + step).min(end);
                    file.seek(SeekFrom::Start(start)).await?;
                    file.write_all(&data[start as usize..next as usize]).await?;
                    file.flush().await?;
                    state.parts[index].advance_to(next);
                    state.save(&descriptor).await?;
                    tokio::time::sleep(step_delay).await;
                }
            }

            if let Script::Hold = script {
                futures::future::pending::<()>().await;
            }
            fs::remove_file(&marker).await?;
            Ok(())
        })
    }
}

/// Proxy that only counts lifecycle calls.
#[derive(Default)]
pub struct RecordingProxy {
    pub launches: AtomicUsize,
    pub stops: AtomicUsize,
    running: AtomicBool,
    fail: bool,
    launch_delay: Duration,
}

impl RecordingProxy {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Takes `delay` to come up, like a bootstrapping tor.
    pub fn slow(delay: Duration) -> Self {
        Self {
            launch_delay: delay,
            ..Self::default()
        }
    }
}

impl ProxyController for RecordingProxy {
    fn launch(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.launches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.launch_delay).await;
            if self.fail {
                bail!("proxy failed to bootstrap");
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn socks_url(&self) -> Option<String> {
        None
    }
}
