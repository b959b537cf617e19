//! Which processes listen on a TCP port.
//!
//! `lsof` first; on Linux, fall back to matching `/proc/net/tcp{,6}` socket
//! inodes against `/proc/<pid>/fd` when `lsof` is not installed.

use anyhow::{Context, Result, bail};
use devrunner_core::ProcessId;
use tokio::process::Command;
use tracing::debug;

pub async fn listening_pids(port: u16) -> Result<Vec<ProcessId>> {
    match lsof(port).await {
        Ok(pids) => Ok(pids),
        #[cfg(target_os = "linux")]
        Err(e) => {
            debug!(port, error = %e, "lsof unavailable, scanning /proc");
            tokio::task::spawn_blocking(move || procfs::listening_pids(port))
                .await
                .context("procfs scan panicked")?
        }
        #[cfg(not(target_os = "linux"))]
        Err(e) => Err(e),
    }
}

async fn lsof(port: u16) -> Result<Vec<ProcessId>> {
    let output = Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
        .await
        .context("failed to run lsof")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    // lsof exits 1 with no output at all when nothing matches
    let nothing_found = stdout.trim().is_empty() && output.stderr.is_empty();
    if !output.status.success() && !nothing_found {
        bail!(
            "lsof failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    debug!(port, output = %stdout.trim(), "lsof lookup");
    Ok(parse_pid_lines(&stdout))
}

/// One pid per line, deduplicated and sorted
pub(crate) fn parse_pid_lines(text: &str) -> Vec<ProcessId> {
    let mut pids: Vec<ProcessId> = text
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .map(ProcessId::from)
        .collect();
    pids.sort();
    pids.dedup();
    pids
}

#[cfg(target_os = "linux")]
pub(crate) mod procfs {
    use super::*;
    use std::collections::HashSet;
    use std::fs;

    /// TCP state code for LISTEN
    const TCP_LISTEN: &str = "0A";

    /// Socket inodes listening on `port` in one `/proc/net/tcp` style table
    pub(crate) fn parse_listening_inodes(table: &str, port: u16) -> HashSet<u64> {
        table
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 || fields[3] != TCP_LISTEN {
                    return None;
                }
                let (_, port_hex) = fields[1].rsplit_once(':')?;
                if u16::from_str_radix(port_hex, 16).ok()? != port {
                    return None;
                }
                fields[9].parse::<u64>().ok()
            })
            .collect()
    }

    pub(crate) fn listening_pids(port: u16) -> Result<Vec<ProcessId>> {
        let mut inodes = HashSet::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(contents) = fs::read_to_string(table) {
                inodes.extend(parse_listening_inodes(&contents, port));
            }
        }
        if inodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut pids = Vec::new();
        for entry in fs::read_dir("/proc").context("cannot read /proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Other users' fd tables are unreadable; skip them
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let holds_socket = fds.flatten().any(|fd| {
                fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| socket_inode(&target.to_string_lossy()))
                    .is_some_and(|inode| inodes.contains(&inode))
            });
            if holds_socket {
                pids.push(ProcessId(pid));
            }
        }
        pids.sort();
        Ok(pids)
    }

    /// `socket:[12345]` -> 12345
    fn socket_inode(link: &str) -> Option<u64> {
        link.strip_prefix("socket:[")?
            .strip_suffix(']')?
            .parse()
            .ok()
    }

}
