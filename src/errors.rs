//! Error types surfaced by the session controller and the stream reader.
//!
//! Fetcher, proxy and boot code use `anyhow` internally; these enums are the
//! boundary the HTTP layer maps onto status codes.

use thiserror::Error;

/// Reasons `initiate` refuses or abandons a download.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Another url already owns the single download slot
    #[error("Downloader is busy with {active}")]
    Busy { active: String },

    /// The fetcher failed before the file size was known
    #[error("Recoverable download error: {reason}")]
    RecoverableFetch { reason: String },

    /// The session was released by someone else while we were waiting on it
    #[error("Unexpected runtime error: {reason}")]
    Unexpected { reason: String },
}

/// Failures while tailing the output file.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("I/O error while reading the output file")]
    Io(#[from] std::io::Error),

    #[error("Invalid progress descriptor: {0:#}")]
    Descriptor(anyhow::Error),

    #[error("Progress descriptor does not match the session: {reason}")]
    PlanMismatch { reason: String },

    /// The fetch ended without completing the segment being read
    #[error("Fetch ended ({outcome}) with segment {segment} incomplete at byte {position}")]
    FetchEnded {
        outcome: String,
        segment: usize,
        position: u64,
    },
}
