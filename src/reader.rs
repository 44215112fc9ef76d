//! Tailing reader over a file that a segmented fetch is still writing.
//!
//! Segments are read strictly in order. Within a segment the reader never
//! goes past the boundary last seen in the progress descriptor; when nothing
//! new is readable it sleeps for the poll interval and reloads the descriptor.

use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::watch;

use crate::errors::StreamError;
use crate::fetcher::FetchStatus;
use crate::state::{DownloadState, PartState};

pub const CHUNK_SIZE: usize = 256 * 1024;
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug)]
pub struct ReaderSettings {
    /// Upper bound on the size of a single emitted chunk.
    pub chunk_size: usize,
    pub poll_interval: Duration,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            poll_interval: POLL_INTERVAL,
        }
    }
}

pub struct TailingReader {
    file: File,
    descriptor_path: PathBuf,
    plan: Vec<PartState>,
    /// Highest boundary observed per segment, clamped to the segment end.
    boundaries: Vec<u64>,
    status: watch::Receiver<FetchStatus>,
    settings: ReaderSettings,
}

impl TailingReader {
    /// Opens the output file and checks the descriptor against the expected
    /// layout. Nothing has been sent to the client when this fails.
    pub async fn open(
        output_path: &Path,
        descriptor_path: &Path,
        total_size: u64,
        parts: usize,
        status: watch::Receiver<FetchStatus>,
        settings: ReaderSettings,
    ) -> Result<Self, StreamError> {
        let state = DownloadState::load(descriptor_path)
            .await
            .map_err(StreamError::Descriptor)?;
        state.validate().map_err(StreamError::Descriptor)?;

        if state.total_size != total_size || state.parts.len() != parts {
            return Err(StreamError::PlanMismatch {
                reason: format!(
                    "expected {} bytes in {} segments, descriptor has {} bytes in {}",
                    total_size,
                    parts,
                    state.total_size,
                    state.parts.len()
                ),
            });
        }

        let file = File::open(output_path).await?;
        let boundaries = state.parts.iter().map(|p| p.current_byte).collect();

        Ok(Self {
            file,
            descriptor_path: descriptor_path.to_path_buf(),
            plan: state.parts,
            boundaries,
            status,
            settings: settings.sanitized(),
        })
    }

    /// Turns the reader into the ordered chunk stream covering the whole
    /// file. The stream is single use. Dropping it between items stops all
    /// reading and has no other effect.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static {
        try_stream! {
            let mut reader = self;

            for index in 0..reader.plan.len() {
                let end = reader.plan[index].end_byte;
                let mut position = reader.plan[index].start_byte;
                reader.file.seek(SeekFrom::Start(position)).await?;

                while position < end {
                    let readable = reader.boundaries[index].min(end).saturating_sub(position);
                    if readable == 0 {
                        reader.wait_for_progress(index, position).await?;
                        continue;
                    }

                    let len = readable.min(reader.settings.chunk_size as u64) as usize;
                    let mut buf = vec![0u8; len];
                    reader.file.read_exact(&mut buf).await?;
                    position += len as u64;
                    yield Bytes::from(buf);
                }
            }
        }
    }

    /// Sleeps once, then reloads the descriptor. Unbounded while the fetch
    /// runs; once it has ended without moving this segment, fails instead.
    async fn wait_for_progress(&mut self, index: usize, position: u64) -> Result<(), StreamError> {
        tokio::time::sleep(self.settings.poll_interval).await;

        // Read the outcome before the descriptor so a last-moment update is not missed.
        let outcome = self.status.borrow().outcome.clone();
        self.refresh().await?;

        if self.boundaries[index] > position {
            return Ok(());
        }
        match outcome {
            Some(outcome) => Err(StreamError::FetchEnded {
                outcome: outcome.to_string(),
                segment: index,
                position,
            }),
            None => Ok(()),
        }
    }

    async fn refresh(&mut self) -> Result<(), StreamError> {
        let state = DownloadState::load(&self.descriptor_path)
            .await
            .map_err(StreamError::Descriptor)?;
        if state.parts.len() != self.plan.len() {
            return Err(StreamError::PlanMismatch {
                reason: format!(
                    "descriptor now has {} segments instead of {}",
                    state.parts.len(),
                    self.plan.len()
                ),
            });
        }

        for ((boundary, planned), part) in self
            .boundaries
            .iter_mut()
            .zip(&self.plan)
            .zip(&state.parts)
        {
            let seen = part.current_byte.min(planned.end_byte);
            if seen > *boundary {
                *boundary = seen;
            }
        }
        Ok(())
    }
}

impl ReaderSettings {
    fn sanitized(self) -> Self {
        Self {
            chunk_size: self.chunk_size.max(1),
            poll_interval: self.poll_interval,
        }
    }
}
