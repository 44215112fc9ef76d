use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Persisted progress of a segmented fetch, stored next to the output file as
/// `<output>.part.json`. The fetcher owns it; readers only load it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    pub url: String,
    pub total_size: u64,
    pub parts: Vec<PartState>,
}

/// One segment of the output file. `end_byte` is exclusive and
/// `current_byte` is the highest offset confirmed written, so
/// `start_byte <= current_byte <= end_byte` always holds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartState {
    pub index: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub current_byte: u64,
    pub completed: bool,
}

impl PartState {
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte
    }

    /// Moves the boundary forward; never backwards and never past the end.
    pub fn advance_to(&mut self, offset: u64) {
        let offset = offset.min(self.end_byte);
        if offset > self.current_byte {
            self.current_byte = offset;
        }
        self.completed = self.current_byte == self.end_byte;
    }
}

impl DownloadState {
    pub fn new(url: &str, total_size: u64, parts: usize) -> Self {
        Self {
            url: url.to_string(),
            total_size,
            parts: plan_segments(total_size, parts),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(|p| p.completed)
    }

    pub fn downloaded(&self) -> u64 {
        self.parts.iter().map(|p| p.current_byte - p.start_byte).sum()
    }

    /// Checks that the parts tile `[0, total_size)` in order and that every
    /// boundary sits inside its segment.
    pub fn validate(&self) -> Result<()> {
        let mut expected_start = 0;
        for (i, part) in self.parts.iter().enumerate() {
            if part.index != i {
                bail!("segment {} is stored at position {}", part.index, i);
            }
            if part.start_byte != expected_start || part.end_byte < part.start_byte {
                bail!(
                    "segment {} covers [{}, {}) but should start at {}",
                    i, part.start_byte, part.end_byte, expected_start
                );
            }
            if part.current_byte < part.start_byte || part.current_byte > part.end_byte {
                bail!("segment {} boundary {} is out of range", i, part.current_byte);
            }
            expected_start = part.end_byte;
        }
        if expected_start != self.total_size {
            bail!("segments cover {} of {} bytes", expected_start, self.total_size);
        }
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read progress descriptor {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Malformed progress descriptor {:?}", path))
    }

    /// Writes to a sibling temp file and renames it over the descriptor so a
    /// concurrent `load` sees either the old or the new record.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let tmp = descriptor_tmp_path(path);
        let content = serde_json::to_vec(self)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace progress descriptor {:?}", path))?;
        Ok(())
    }
}

/// Splits `[0, total_size)` into `parts` contiguous ranges; the last one takes
/// the remainder.
pub fn plan_segments(total_size: u64, parts: usize) -> Vec<PartState> {
    let parts = parts.max(1);
    let part_size = total_size / parts as u64;

    (0..parts)
        .map(|i| {
            let start_byte = i as u64 * part_size;
            let end_byte = if i == parts - 1 {
                total_size
            } else {
                (i as u64 + 1) * part_size
            };
            PartState {
                index: i,
                start_byte,
                end_byte,
                current_byte: start_byte,
                completed: start_byte == end_byte,
            }
        })
        .collect()
}

pub fn descriptor_path(output: &Path) -> PathBuf {
    with_suffix(output, ".part.json")
}

/// Sibling `save` writes before renaming over the descriptor.
pub fn descriptor_tmp_path(descriptor: &Path) -> PathBuf {
    with_suffix(descriptor, ".tmp")
}

pub fn marker_path(output: &Path) -> PathBuf {
    with_suffix(output, ".part")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
