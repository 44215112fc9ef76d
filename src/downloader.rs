use anyhow::{Context, Result, anyhow, bail};
use futures::StreamExt;
use futures::future::BoxFuture;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use indicatif::HumanBytes;
use reqwest::{Client, Proxy, StatusCode, header};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::fetcher::{FetchJob, FetchMetadata, Fetcher, MetadataSink};
use crate::proxy::ProxyController;
use crate::state::{DownloadState, PartState, descriptor_path, marker_path};
use crate::utils::{filename_from_disposition, get_filename_from_url, sanitize_filename};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone)]
struct Throttle {
    limiter: Arc<Limiter>,
    burst: NonZeroU32,
}

impl Throttle {
    async fn wait(&self, len: usize) -> Result<()> {
        let mut left = len as u64;
        while left > 0 {
            let n = left.min(self.burst.get() as u64) as u32;
            if let Some(cells) = NonZeroU32::new(n) {
                self.limiter
                    .until_n_ready(cells)
                    .await
                    .map_err(|e| anyhow!("rate limiter rejected {} bytes: {}", n, e))?;
            }
            left -= n as u64;
        }
        Ok(())
    }
}

/// Segmented HTTP fetcher: one ranged GET per segment, all writing into the
/// same preallocated output file.
pub struct HttpFetcher {
    proxy: Arc<dyn ProxyController>,
    throttle: Option<Throttle>,
}

impl HttpFetcher {
    pub fn new(proxy: Arc<dyn ProxyController>, rate_limit_bytes_per_sec: Option<u32>) -> Self {
        let throttle = rate_limit_bytes_per_sec.and_then(NonZeroU32::new).map(|limit| Throttle {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(limit))),
            burst: limit,
        });

        Self { proxy, throttle }
    }

    fn client(&self, connect_timeout: Duration) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent("rsl/0.1.0")
            .connect_timeout(connect_timeout);
        if let Some(url) = self.proxy.socks_url() {
            builder = builder.proxy(Proxy::all(url.as_str()).context("Invalid proxy url")?);
        }
        builder.build().context("Failed to build HTTP client")
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, job: FetchJob, sink: MetadataSink) -> BoxFuture<'static, Result<()>> {
        let client = self.client(job.connect_timeout);
        let throttle = self.throttle.clone();
        Box::pin(async move { download(client?, throttle, job, sink).await })
    }
}

async fn download(
    client: Client,
    throttle: Option<Throttle>,
    job: FetchJob,
    sink: MetadataSink,
) -> Result<()> {
    let (filename, total_size) = negotiate(&client, &job.url).await?;
    let output_path = job.output_dir.join(&filename);
    let side_base = job.temp_dir.join(&filename);
    let descriptor = descriptor_path(&side_base);
    let marker = marker_path(&side_base);

    fs::create_dir_all(&job.output_dir)
        .await
        .context("Failed to create output directory")?;
    fs::create_dir_all(&job.temp_dir)
        .await
        .context("Failed to create temp directory")?;

    if !job.overwrite && fs::try_exists(&output_path).await? {
        bail!("{:?} already exists", output_path);
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&output_path)
        .await
        .context("Failed to open output file")?;
    file.set_len(total_size).await?;
    fs::write(&marker, b"").await.context("Failed to create download marker")?;

    let state = DownloadState::new(&job.url, total_size, job.parts);
    state.save(&descriptor).await?;

    info!(
        file = %filename,
        size = %HumanBytes(total_size),
        parts = job.parts,
        "Negotiated download"
    );
    sink.publish(FetchMetadata {
        filename,
        output_path,
        descriptor_path: descriptor.clone(),
        marker_path: marker.clone(),
        total_size,
    });

    let pending: Vec<PartState> = state.parts.iter().filter(|p| p.len() > 0).cloned().collect();
    let file = Arc::new(Mutex::new(file));
    let state = Arc::new(Mutex::new(state));

    // Dropping the set aborts every segment, which is how termination reaches them.
    let mut segments = JoinSet::new();
    for part in pending {
        segments.spawn(fetch_part(
            client.clone(),
            job.url.clone(),
            part,
            file.clone(),
            state.clone(),
            descriptor.clone(),
            throttle.clone(),
        ));
    }

    while let Some(result) = segments.join_next().await {
        result.context("Segment task panicked")??;
    }

    if let Err(e) = fs::remove_file(&marker).await {
        debug!("Download marker already gone: {}", e);
    }
    Ok(())
}

async fn negotiate(client: &Client, url: &str) -> Result<(String, u64)> {
    let response = client
        .head(url)
        .send()
        .await
        .context("Failed to send request")?
        .error_for_status()?;

    let headers = response.headers();
    let total_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| anyhow!("{} did not report a content length", url))?;

    let filename = match headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition)
    {
        Some(name) => name,
        None => get_filename_from_url(response.url().as_str())?,
    };

    Ok((sanitize_filename(&filename), total_size))
}

async fn fetch_part(
    client: Client,
    url: String,
    part: PartState,
    file: Arc<Mutex<File>>,
    state: Arc<Mutex<DownloadState>>,
    descriptor: PathBuf,
    throttle: Option<Throttle>,
) -> Result<()> {
    let range_header = format!("bytes={}-{}", part.start_byte, part.end_byte - 1);
    let response = client
        .get(&url)
        .header(header::RANGE, range_header)
        .send()
        .await
        .context("Failed to send request")?
        .error_for_status()?;

    // A server that ignores Range sends the whole file, usable only for a
    // segment starting at zero.
    if response.status() != StatusCode::PARTIAL_CONTENT && part.start_byte != 0 {
        bail!("server ignored the range request for segment {}", part.index);
    }

    let mut stream = response.bytes_stream();
    let mut current_pos = part.start_byte;

    while let Some(item) = stream.next().await {
        let mut chunk = item.context("Error while downloading chunk")?;
        let remaining = (part.end_byte - current_pos) as usize;
        if chunk.len() > remaining {
            chunk.truncate(remaining);
        }
        if chunk.is_empty() {
            if current_pos == part.end_byte {
                break;
            }
            continue;
        }

        if let Some(throttle) = &throttle {
            throttle.wait(chunk.len()).await?;
        }

        {
            let mut f = file.lock().await;
            f.seek(SeekFrom::Start(current_pos)).await?;
            f.write_all(&chunk).await?;
            f.flush().await?;
        }
        current_pos += chunk.len() as u64;

        // The boundary is persisted only after the bytes below it are flushed.
        record_progress(&state, &descriptor, part.index, current_pos).await?;
    }

    if current_pos < part.end_byte {
        bail!(
            "segment {} ended at byte {} of {}",
            part.index,
            current_pos,
            part.end_byte
        );
    }
    Ok(())
}

/// Held under the state lock so concurrent segments never persist an older
/// snapshot over a newer one.
async fn record_progress(
    state: &Mutex<DownloadState>,
    descriptor: &Path,
    index: usize,
    offset: u64,
) -> Result<()> {
    let mut s = state.lock().await;
    if let Some(p) = s.parts.get_mut(index) {
        p.advance_to(offset);
    }
    s.save(descriptor).await
}
