use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionSettings;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyMode {
    /// Route every fetch through a local tor process
    Tor,
    /// Connect to the source directly
    Direct,
}

/// Accepts the spellings the environment has always used for "on".
fn parse_flag(value: &str) -> Result<bool, String> {
    Ok(matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "t" | "y" | "yes"
    ))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Streams a file to the client while it is still being downloaded", long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short = 'p', long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Directory for progress descriptors and partial-download markers
    #[arg(long = "temp-dir", env = "TEMP_FOLDER", default_value = ".")]
    pub temp_dir: PathBuf,

    /// Directory for the proxy's state, the pid file and the daemon log
    #[arg(long = "data-dir", env = "DATA_FOLDER", default_value = ".")]
    pub data_dir: PathBuf,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", env = "DOWNLOAD_FOLDER", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Default number of segments when a request does not ask for one
    #[arg(short = 's', long, env = "PARTS", default_value_t = 10)]
    pub parts: usize,

    /// Delete a download once it has been streamed completely
    #[arg(long = "auto-delete", env = "AUTO_DELETE_DOWNLOADS", value_parser = parse_flag,
          action = ArgAction::Set, num_args = 0..=1, default_value = "false", default_missing_value = "true")]
    pub auto_delete: bool,

    /// Start the proxy at boot and keep it running between downloads
    #[arg(long = "proxy-on-start", env = "TOR_ON_START", value_parser = parse_flag,
          action = ArgAction::Set, num_args = 0..=1, default_value = "false", default_missing_value = "true")]
    pub proxy_on_start: bool,

    /// Replace an existing file with the same name in the download directory
    #[arg(long, env = "OVERWRITE", value_parser = parse_flag,
          action = ArgAction::Set, num_args = 0..=1, default_value = "true", default_missing_value = "true")]
    pub overwrite: bool,

    /// How fetches reach the source
    #[arg(long, env = "PROXY", value_enum, default_value = "tor")]
    pub proxy: ProxyMode,

    /// Tor executable
    #[arg(long = "tor-binary", env = "TOR_BINARY", default_value = "tor")]
    pub tor_binary: String,

    /// Local SOCKS port tor listens on
    #[arg(long = "socks-port", env = "SOCKS_PORT", default_value_t = 9150)]
    pub socks_port: u16,

    /// Connect timeout for requests to the source, in seconds
    #[arg(long = "connect-timeout", env = "CONN_TIMEOUT", default_value_t = 5)]
    pub connect_timeout: u64,

    /// Give up on a download whose size is not known after this many seconds
    #[arg(long = "negotiation-timeout", env = "NEGOTIATION_TIMEOUT")]
    pub negotiation_timeout: Option<u64>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long = "rate-limit", env = "RATE_LIMIT")]
    pub rate_limit: Option<u32>,

    /// Run in background (daemon mode) [Unix only]
    #[arg(long)]
    pub daemon: bool,

    /// Stop the daemon process [Unix only]
    #[arg(short = 'x', long)]
    pub stop: bool,
}

impl Args {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            temp_dir: self.temp_dir.clone(),
            download_dir: self.download_dir.clone(),
            overwrite: self.overwrite,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            keep_proxy: self.proxy_on_start,
            negotiation_timeout: self.negotiation_timeout.map(Duration::from_secs),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Makes the directories absolute so they survive the daemon's chdir.
    pub fn resolve_dirs(&mut self) {
        let Ok(cwd) = std::env::current_dir() else { return };
        for dir in [&mut self.temp_dir, &mut self.data_dir, &mut self.download_dir] {
            if dir.is_relative() {
                *dir = cwd.join(&*dir);
            }
        }
    }
}
