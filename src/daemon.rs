use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use daemonize::Daemonize;
#[cfg(unix)]
use std::fs::File;
#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

const PID_FILE: &str = "rsl.pid";
const LOG_FILE: &str = "rsl.log";

pub fn pid_file(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE)
}

pub fn log_file(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_FILE)
}

#[cfg(unix)]
pub fn start_daemon(data_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;

    // Logs go to stderr, the daemon log collects both streams
    let stdout = File::create(log_file(data_dir)).context("Failed to create log file")?;
    let stderr = stdout.try_clone().context("Failed to clone log file handle")?;

    let daemonize = Daemonize::new()
        .pid_file(pid_file(data_dir))
        .chown_pid_file(true)
        .working_directory(data_dir)
        .stdout(stdout)
        .stderr(stderr);

    match daemonize.start() {
        Ok(_) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Error starting daemon: {}", e)),
    }
}

pub fn get_daemon_pid(data_dir: &Path) -> Result<Option<i32>> {
    let path = pid_file(data_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let pid = content
        .trim()
        .parse::<i32>()
        .with_context(|| format!("Malformed pid file {}", path.display()))?;
    Ok(Some(pid))
}

#[cfg(unix)]
pub fn send_signal(pid: i32, signal: Signal) -> Result<()> {
    signal::kill(Pid::from_raw(pid), signal)?;
    Ok(())
}

#[cfg(unix)]
pub fn stop_daemon(data_dir: &Path) -> Result<()> {
    if let Some(pid) = get_daemon_pid(data_dir)? {
        send_signal(pid, Signal::SIGTERM)?;
        println!("Stopped daemon (PID: {})", pid);
        cleanup_pid_file(data_dir);
    } else {
        println!("Daemon is not running.");
    }
    Ok(())
}

pub fn cleanup_pid_file(data_dir: &Path) {
    let _ = std::fs::remove_file(pid_file(data_dir));
}
