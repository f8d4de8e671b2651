//! Cleanup of processes left behind by a stopped server.
//!
//! Dev servers often run behind wrappers (`npm run dev` → `ts-node-dev` →
//! `node`) and a grandchild can outlive the wrapper we terminated, keeping
//! file locks in the project directory. The server's process tree is
//! recorded before it is stopped; afterwards whatever is left of that tree
//! and still running from its working directory is killed. Processes the
//! server did not spawn are never touched, even when they share its
//! directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("could not enumerate processes under {}: {reason}", .dir.display())]
    Enumerate { dir: PathBuf, reason: String },
    #[error("could not list descendants of pid {pid}: {reason}")]
    Lineage { pid: u32, reason: String },
}

/// Every process below `leader` in the process tree, leader excluded.
///
/// Must be taken while `leader` is alive: once it exits its children are
/// reparented and can no longer be traced back to it.
pub async fn descendants(leader: u32) -> Result<Vec<u32>, CleanupError> {
    let pairs = tokio::task::spawn_blocking(parent_pairs)
        .await
        .map_err(|err| CleanupError::Lineage {
            pid: leader,
            reason: err.to_string(),
        })?
        .map_err(|reason| CleanupError::Lineage { pid: leader, reason })?;
    Ok(descendants_in(leader, &pairs))
}

/// Collects everything reachable from `leader` through `(pid, ppid)` pairs.
pub fn descendants_in(leader: u32, pairs: &[(u32, u32)]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, ppid) in pairs {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }
    let mut found = Vec::new();
    let mut queue = vec![leader];
    while let Some(parent) = queue.pop() {
        for &child in children.get(&parent).map(Vec::as_slice).unwrap_or_default() {
            if child != leader && !found.contains(&child) {
                found.push(child);
                queue.push(child);
            }
        }
    }
    found
}

/// Kills the group led by `leader` and the members of `lineage` still
/// running from inside `dir`.
///
/// Returns the pids that were signalled. The supervisor and its ancestors
/// (the shell it was started from) are never touched.
pub async fn kill_strays(
    dir: &Path,
    leader: Option<u32>,
    lineage: &[u32],
) -> Result<Vec<u32>, CleanupError> {
    if let Some(pid) = leader {
        crate::runner::kill_group(pid);
    }
    if lineage.is_empty() {
        return Ok(Vec::new());
    }
    let dir = dir.to_path_buf();
    let found = tokio::task::spawn_blocking({
        let dir = dir.clone();
        move || find_rooted_in(&dir)
    })
    .await
    .map_err(|err| CleanupError::Enumerate {
        dir: dir.clone(),
        reason: err.to_string(),
    })?
    .map_err(|reason| CleanupError::Enumerate {
        dir: dir.clone(),
        reason,
    })?;

    let protected = protected_pids();
    let mut killed = Vec::new();
    for pid in found
        .into_iter()
        .filter(|pid| *pid != 0 && lineage.contains(pid) && !protected.contains(pid))
    {
        if kill(pid) {
            killed.push(pid);
        }
    }
    if !killed.is_empty() {
        tracing::debug!(dir = %dir.display(), pids = ?killed, "killed stray processes");
    }
    Ok(killed)
}

#[cfg(target_os = "linux")]
fn parent_pairs() -> Result<Vec<(u32, u32)>, String> {
    let processes = procfs::process::all_processes().map_err(|err| err.to_string())?;
    Ok(processes
        .flatten()
        .filter_map(|process| process.stat().ok())
        .map(|stat| (stat.pid as u32, stat.ppid as u32))
        .collect())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn parent_pairs() -> Result<Vec<(u32, u32)>, String> {
    let output = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=", "-o", "ppid="])
        .output()
        .map_err(|err| format!("ps: {}", err))?;
    Ok(parse_pid_pairs(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(windows)]
fn parent_pairs() -> Result<Vec<(u32, u32)>, String> {
    let script = "Get-CimInstance Win32_Process | ForEach-Object { \"$($_.ProcessId) $($_.ParentProcessId)\" }";
    let output = std::process::Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .output()
        .map_err(|err| format!("powershell: {}", err))?;
    Ok(parse_pid_pairs(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses whitespace-separated `pid ppid` lines; malformed lines are skipped.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub fn parse_pid_pairs(stdout: &str) -> Vec<(u32, u32)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect()
}

/// The supervisor and the chain of processes that started it.
#[cfg(target_os = "linux")]
fn protected_pids() -> Vec<u32> {
    let mut pids = vec![std::process::id()];
    let mut current = procfs::process::Process::myself().ok();
    while let Some(process) = current {
        let Ok(stat) = process.stat() else { break };
        if stat.ppid <= 1 {
            break;
        }
        pids.push(stat.ppid as u32);
        current = procfs::process::Process::new(stat.ppid).ok();
    }
    pids
}

#[cfg(all(unix, not(target_os = "linux")))]
fn protected_pids() -> Vec<u32> {
    let parent = unsafe { libc::getppid() } as u32;
    vec![std::process::id(), parent]
}

#[cfg(windows)]
fn protected_pids() -> Vec<u32> {
    vec![std::process::id()]
}

#[cfg(target_os = "linux")]
fn find_rooted_in(dir: &Path) -> Result<Vec<u32>, String> {
    let root = std::fs::canonicalize(dir).map_err(|err| err.to_string())?;
    let processes = procfs::process::all_processes().map_err(|err| err.to_string())?;
    let mut pids = Vec::new();
    for process in processes.flatten() {
        let Ok(cwd) = process.cwd() else { continue };
        if cwd.starts_with(&root) {
            pids.push(process.pid as u32);
        }
    }
    Ok(pids)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn find_rooted_in(dir: &Path) -> Result<Vec<u32>, String> {
    // +d lists files open directly inside dir, which includes process cwds.
    let output = std::process::Command::new("lsof")
        .args(["-t", "-a", "-d", "cwd", "+d"])
        .arg(dir)
        .output()
        .map_err(|err| format!("lsof: {}", err))?;
    Ok(crate::reclaim::parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(windows)]
fn find_rooted_in(dir: &Path) -> Result<Vec<u32>, String> {
    // Windows exposes no cwd for other processes; match the directory in command lines.
    let needle = dir.display().to_string().replace('\'', "''");
    let script = format!(
        "Get-CimInstance Win32_Process | Where-Object {{ $_.CommandLine -like '*{}*' }} | ForEach-Object {{ $_.ProcessId }}",
        needle
    );
    let output = std::process::Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", &script])
        .output()
        .map_err(|err| format!("powershell: {}", err))?;
    Ok(crate::reclaim::parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(unix)]
fn kill(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 }
}

#[cfg(windows)]
fn kill(pid: u32) -> bool {
    std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_whole_tree() {
        // 10 -> 11 -> 12 -> 13, 10 -> 14; 20 is unrelated, 1 is init.
        let pairs = [(1, 0), (10, 1), (11, 10), (12, 11), (13, 12), (14, 10), (20, 1), (21, 20)];
        let mut found = descendants_in(10, &pairs);
        found.sort();
        assert_eq!(found, vec![11, 12, 13, 14]);
        assert!(descendants_in(21, &pairs).is_empty());
    }

    #[test]
    fn parses_ps_output() {
        let stdout = "    1     0\n  312     1\nbogus line\n  313   312\n";
        assert_eq!(parse_pid_pairs(stdout), vec![(1, 0), (312, 1), (313, 312)]);
    }
}

#[cfg(all(test, target_os = "linux"))]
mod linux_tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    fn is_gone(pid: u32) -> bool {
        match procfs::process::Process::new(pid as i32).and_then(|p| p.stat()) {
            Ok(stat) => stat.state == 'Z',
            Err(_) => true,
        }
    }

    fn wait_gone(pid: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if is_gone(pid) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[tokio::test]
    async fn kills_orphaned_descendants_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut wrapper = Command::new("sh")
            .args(["-c", "sleep 30 & echo $!; wait"])
            .current_dir(dir.path())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut line = String::new();
        BufReader::new(wrapper.stdout.take().unwrap()).read_line(&mut line).unwrap();
        let grandchild: u32 = line.trim().parse().unwrap();

        let lineage = descendants(wrapper.id()).await.unwrap();
        assert!(lineage.contains(&grandchild));

        // The wrapper dies first and leaves its child behind.
        wrapper.kill().unwrap();
        wrapper.wait().unwrap();
        assert!(!is_gone(grandchild));

        let killed = kill_strays(dir.path(), None, &lineage).await.unwrap();
        assert_eq!(killed, vec![grandchild]);
        assert!(wait_gone(grandchild));
    }

    #[tokio::test]
    async fn unrelated_process_in_directory_survives() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Command::new("sleep").arg("30").current_dir(dir.path()).spawn().unwrap();
        let mut editor = Command::new("sleep").arg("30").current_dir(dir.path()).spawn().unwrap();

        let lineage = descendants(server.id()).await.unwrap();
        assert!(!lineage.contains(&editor.id()));
        server.kill().unwrap();
        server.wait().unwrap();

        let killed = kill_strays(dir.path(), None, &lineage).await.unwrap();
        assert!(killed.is_empty());
        assert!(editor.try_wait().unwrap().is_none());
        let _ = editor.kill();
        let _ = editor.wait();
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let err = kill_strays(Path::new("/definitely/not/here"), None, &[42]).await.unwrap_err();
        assert!(matches!(err, CleanupError::Enumerate { .. }));
    }
}
