// ABOUTME: Background-service mode for the polling loop (Unix)
// ABOUTME: PID file management, daemonizing, and SIGTERM-based stop

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// Directory for daemon state files: `~/.table-relay/`.
pub fn daemon_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to determine home directory")?;
    let dir = home.join(".table-relay");

    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create daemon directory: {:?}", dir))?;
    }

    Ok(dir)
}

pub fn pid_file_path() -> Result<PathBuf> {
    Ok(daemon_dir()?.join("relay.pid"))
}

pub fn log_file_path() -> Result<PathBuf> {
    Ok(daemon_dir()?.join("relay.log"))
}

fn is_process_running(pid: i32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Read the PID from the PID file, if present.
pub fn read_pid() -> Result<Option<i32>> {
    let pid_file = pid_file_path()?;

    if !pid_file.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&pid_file)
        .with_context(|| format!("Failed to read PID file: {:?}", pid_file))?;
    let pid: i32 = content
        .trim()
        .parse()
        .with_context(|| format!("Invalid PID in file: {}", content.trim()))?;

    Ok(Some(pid))
}

pub fn remove_pid_file() -> Result<()> {
    let pid_file = pid_file_path()?;
    if pid_file.exists() {
        fs::remove_file(&pid_file)
            .with_context(|| format!("Failed to remove PID file: {:?}", pid_file))?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<i32>,
    pub pid_file_exists: bool,
}

pub fn check_status() -> Result<DaemonStatus> {
    let pid_file_exists = pid_file_path()?.exists();

    let (running, pid) = match read_pid()? {
        Some(pid) => (is_process_running(pid), Some(pid)),
        None => (false, None),
    };

    Ok(DaemonStatus {
        running,
        pid,
        pid_file_exists,
    })
}

/// Stop a running daemon with SIGTERM, escalating to SIGKILL after 10
/// seconds. Returns false when no daemon was running.
pub fn stop_daemon() -> Result<bool> {
    let status = check_status()?;

    if !status.running {
        if status.pid_file_exists {
            remove_pid_file()?;
            println!("Removed stale PID file (process was not running)");
        }
        return Ok(false);
    }

    let pid = status.pid.context("Daemon running without a PID")?;
    println!("Sending SIGTERM to daemon (PID: {})", pid);

    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        anyhow::bail!(
            "Failed to send SIGTERM to process {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }

    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_secs(10);
    while is_process_running(pid) {
        if start.elapsed() > timeout {
            println!("Process didn't exit within 10 seconds, sending SIGKILL");
            unsafe { libc::kill(pid, libc::SIGKILL) };
            std::thread::sleep(std::time::Duration::from_millis(500));
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    remove_pid_file()?;
    Ok(true)
}

/// Detach the current process into the background. Stdout and stderr go to
/// the daemon log file.
pub fn daemonize() -> Result<()> {
    use daemonize::Daemonize;
    use std::fs::OpenOptions;

    let pid_file = pid_file_path()?;
    let log_file = log_file_path()?;

    let status = check_status()?;
    if status.running {
        anyhow::bail!(
            "Daemon is already running (PID: {}). Use --stop to stop it first.",
            status.pid.unwrap_or(0)
        );
    }
    if status.pid_file_exists {
        remove_pid_file()?;
    }

    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to open log file: {:?}", log_file))?;
    let stderr = stdout
        .try_clone()
        .context("Failed to clone log file handle")?;

    println!("Starting daemon...");
    println!("PID file: {:?}", pid_file);
    println!("Log file: {:?}", log_file);

    Daemonize::new()
        .pid_file(&pid_file)
        .chown_pid_file(true)
        .working_directory(".")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize process")?;

    tracing::info!("Daemon started (PID: {})", std::process::id());
    Ok(())
}

/// Print daemon status to stdout.
pub fn print_status() -> Result<()> {
    let status = check_status()?;

    if status.running {
        println!("Daemon status: RUNNING");
        println!("PID: {}", status.pid.unwrap_or(0));
        println!("Log file: {:?}", log_file_path()?);
    } else {
        println!("Daemon status: NOT RUNNING");
        if status.pid_file_exists {
            println!(
                "Note: stale PID file exists (PID {} is not running); run with --stop to clean it up",
                status.pid.unwrap_or(0)
            );
        }
    }

    Ok(())
}

/// Clean up daemon resources on normal shutdown.
pub fn cleanup() -> Result<()> {
    remove_pid_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_path() {
        let path = pid_file_path().unwrap();
        assert!(path.to_string_lossy().ends_with("relay.pid"));
        assert!(path.to_string_lossy().contains(".table-relay"));
    }

    #[test]
    fn test_log_file_path() {
        let path = log_file_path().unwrap();
        assert!(path.to_string_lossy().ends_with("relay.log"));
    }

    #[test]
    fn test_check_status_without_daemon() {
        assert!(check_status().is_ok());
    }
}
