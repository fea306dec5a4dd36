//! Port reachability probes and reclamation.
//!
//! Reachability is a short TCP connect against both loopback families; a
//! service counts as reachable when either family answers. Reclamation only
//! ever signals PIDs that belong to the service being stopped (the recorded
//! PID or one of its descendants) so a foreign process squatting on the
//! port is left alone.

use anyhow::Result;
use log::{debug, info, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::net::TcpStream;

pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const TERM_GRACE: Duration = Duration::from_millis(1500);

/// TCP connect probe against `127.0.0.1` and `::1`.
pub async fn port_reachable(port: u16) -> bool {
    for addr in [format!("127.0.0.1:{port}"), format!("[::1]:{port}")] {
        if tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
        {
            return true;
        }
    }
    false
}

/// Signal-0 liveness probe.
pub fn process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// PIDs currently listening on the port (lsof; empty when lsof is absent).
pub async fn listener_pids(port: u16) -> Vec<u32> {
    let output = tokio::process::Command::new("lsof")
        .args(["-nP", &format!("-tiTCP:{port}"), "-sTCP:LISTEN"])
        .output()
        .await;
    match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect(),
        Err(e) => {
            debug!("lsof probe for port {port} failed: {e}");
            Vec::new()
        }
    }
}

/// Walks the parent chain of a PID (at most 16 hops).
pub fn ancestor_chain(pid: u32) -> Vec<u32> {
    let mut chain = Vec::new();
    let mut current = pid;
    for _ in 0..16 {
        let Some(parent) = parent_pid(current) else {
            break;
        };
        if parent <= 1 {
            break;
        }
        chain.push(parent);
        current = parent;
    }
    chain
}

fn parent_pid(pid: u32) -> Option<u32> {
    let output = std::process::Command::new("ps")
        .args(["-o", "ppid=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

/// Frees the port by terminating listeners owned by `owned_pid` (the PID
/// itself or any descendant). Returns the PIDs that were signalled.
pub async fn release_port(port: u16, owned_pid: Option<u32>) -> Result<Vec<u32>> {
    let listeners = listener_pids(port).await;
    if listeners.is_empty() {
        return Ok(Vec::new());
    }

    let mut signalled = Vec::new();
    for pid in listeners {
        let owned = match owned_pid {
            Some(owner) => pid == owner || ancestor_chain(pid).contains(&owner),
            None => false,
        };
        if !owned {
            warn!("Port {port} is held by foreign pid {pid}; leaving it alone");
            continue;
        }

        info!("Releasing port {port}: SIGTERM to pid {pid}");
        if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_err() {
            continue;
        }
        signalled.push(pid);
    }

    if signalled.is_empty() {
        return Ok(signalled);
    }

    tokio::time::sleep(TERM_GRACE).await;
    for pid in &signalled {
        if process_alive(*pid) {
            warn!("Pid {pid} survived SIGTERM grace window, sending SIGKILL");
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
        }
    }
    Ok(signalled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn implausible_pid_is_dead() {
        assert!(!process_alive(99_999_999));
    }

    #[tokio::test]
    async fn bound_port_is_reachable_within_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_reachable(port).await);
    }

    #[tokio::test]
    async fn unbound_port_is_unreachable() {
        // Bind-then-drop to get a port that is very likely free.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!port_reachable(port).await);
    }

    #[test]
    fn ancestor_chain_of_direct_child_contains_us() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let chain = ancestor_chain(child.id());
        assert!(chain.contains(&std::process::id()), "chain: {chain:?}");
        let _ = child.kill();
        let _ = child.wait();
    }

    #[tokio::test]
    async fn foreign_listener_is_not_killed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // We do not own the listener pid (it's this test process, but we
        // claim a different owner), so nothing may be signalled.
        let signalled = release_port(port, Some(1)).await.unwrap();
        assert!(signalled.is_empty());
        assert!(port_reachable(port).await, "listener must survive");
    }
}
