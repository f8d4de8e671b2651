//! Port reclamation before launch.
//!
//! A dev server left over from a previous session keeps its port bound and
//! makes the fresh instance fail. Before starting a process we probe its
//! port and, if something answers, find the listening process and kill it.
//! This is best-effort: the caller logs any error and starts the process
//! anyway, which then fails loudly on its own if the port is still taken.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Nothing was listening.
    Free,
    /// These processes held the port and were killed.
    Reclaimed { pids: Vec<u32> },
}

#[derive(Debug, Error)]
pub enum ReclaimError {
    #[error("port {port}: could not look up the owning process: {reason}")]
    Discovery { port: u16, reason: String },
    #[error("port {port} is in use but no owning process was found")]
    NoOwner { port: u16 },
    #[error("port {port}: failed to kill pid {pid}: {source}")]
    Kill {
        port: u16,
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Whether something accepts TCP connections on `localhost:port`.
pub async fn is_occupied(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("localhost", port))).await,
        Ok(Ok(_))
    )
}

/// Frees `port` by force-killing whatever listens on it, then waits `settle`.
pub async fn reclaim(port: u16, settle: Duration) -> Result<ReclaimOutcome, ReclaimError> {
    if !is_occupied(port).await {
        return Ok(ReclaimOutcome::Free);
    }
    tracing::debug!(port, "port is occupied, looking for owner");

    let own = std::process::id();
    let pids = tokio::task::spawn_blocking(move || find_listeners(port))
        .await
        .map_err(|err| ReclaimError::Discovery {
            port,
            reason: err.to_string(),
        })?
        .map_err(|reason| ReclaimError::Discovery { port, reason })?;
    let pids: Vec<u32> = pids.into_iter().filter(|pid| *pid != own && *pid != 0).collect();
    if pids.is_empty() {
        return Err(ReclaimError::NoOwner { port });
    }

    let mut first_error = None;
    for pid in &pids {
        tracing::debug!(port, pid, "killing port owner");
        if let Err(source) = force_kill(*pid) {
            first_error.get_or_insert(ReclaimError::Kill {
                port,
                pid: *pid,
                source,
            });
        }
    }
    tokio::time::sleep(settle).await;
    match first_error {
        Some(err) => Err(err),
        None => Ok(ReclaimOutcome::Reclaimed { pids }),
    }
}

#[cfg(target_os = "linux")]
fn find_listeners(port: u16) -> Result<Vec<u32>, String> {
    use std::collections::HashSet;

    use procfs::net::TcpState;
    use procfs::process::FDTarget;

    let mut inodes = HashSet::new();
    for table in [procfs::net::tcp(), procfs::net::tcp6()] {
        // tcp6 is missing on kernels without IPv6.
        let Ok(entries) = table else { continue };
        for entry in entries {
            if matches!(entry.state, TcpState::Listen) && entry.local_address.port() == port {
                inodes.insert(entry.inode);
            }
        }
    }
    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let processes = procfs::process::all_processes().map_err(|err| err.to_string())?;
    let mut pids = Vec::new();
    for process in processes.flatten() {
        let Ok(fds) = process.fd() else { continue };
        let owns = fds
            .flatten()
            .any(|fd| matches!(fd.target, FDTarget::Socket(inode) if inodes.contains(&inode)));
        if owns {
            pids.push(process.pid as u32);
        }
    }
    Ok(pids)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn find_listeners(port: u16) -> Result<Vec<u32>, String> {
    let output = std::process::Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
        .output()
        .map_err(|err| format!("lsof: {}", err))?;
    Ok(parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(windows)]
fn find_listeners(port: u16) -> Result<Vec<u32>, String> {
    let output = std::process::Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .output()
        .map_err(|err| format!("netstat: {}", err))?;
    Ok(parse_netstat_pids(&String::from_utf8_lossy(&output.stdout), port))
}

/// Parses `lsof -t` output: one pid per line.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Parses `netstat -ano` output for sockets listening on `port`.
#[cfg_attr(not(windows), allow(dead_code))]
pub fn parse_netstat_pids(stdout: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            // Proto  Local Address  Foreign Address  State  PID
            if parts.len() < 5 || parts[3] != "LISTENING" || !parts[1].ends_with(&suffix) {
                return None;
            }
            parts[4].parse().ok()
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(unix)]
fn force_kill(pid: u32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn force_kill(pid: u32) -> std::io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("taskkill exited with {}", status),
        ))
    }
}

/// A separate process that holds a port, for tests that need a squatter.
#[cfg(test)]
pub mod test_support {
    use std::process::{Child, Command, Stdio};
    use std::time::{Duration, Instant};

    pub const STUB_PORT_ENV: &str = "DEVRACK_STUB_PORT";

    /// Arguments that make the test binary run only the listener helper.
    pub fn stub_args() -> Vec<String> {
        vec![
            "--exact".into(),
            "reclaim::tests::stub_listener_helper".into(),
            "--ignored".into(),
            "--nocapture".into(),
            "--test-threads=1".into(),
        ]
    }

    pub fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    pub fn spawn_stub(port: u16) -> Child {
        Command::new(std::env::current_exe().unwrap())
            .args(stub_args())
            .env(STUB_PORT_ENV, port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    pub fn wait_until_listening(port: u16) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("stub listener never came up on {}", port);
    }
}
