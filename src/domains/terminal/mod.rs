//! PTY session registries.
//!
//! Three registry instances back the shell, chat, and setup/service
//! terminals. Each session owns a child PTY, drains its output into a
//! bounded ring buffer, and fans chunks out on the Event Bus topic
//! `terminal:<key>`.

pub mod chat;
pub mod keys;
pub mod ring_buffer;

use crate::infrastructure::events::{BusEvent, EventBus, terminal_topic};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use ring_buffer::{RingBuffer, SOFT_CAP_CHARS};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Launch parameters; `ensure` reuses a running session only when these
/// match the previous launch exactly (size changes go through `resize`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl LaunchSpec {
    pub fn new(argv: Vec<String>, cwd: PathBuf) -> Self {
        Self {
            argv,
            cwd,
            env: Vec::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }

    fn launch_params_match(&self, other: &Self) -> bool {
        self.argv == other.argv && self.cwd == other.cwd && self.env == other.env
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Exited(Option<i32>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalHandle {
    pub session_id: String,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub status: String,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
}

struct Session {
    spec: LaunchSpec,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    buffer: Arc<Mutex<RingBuffer>>,
    status: watch::Receiver<SessionStatus>,
    size: Mutex<(u16, u16)>,
}

impl Session {
    fn status_now(&self) -> SessionStatus {
        *self.status.borrow()
    }

    fn handle(&self, key: &str) -> TerminalHandle {
        let (cols, rows) = *self.size.lock();
        let (status, exit_code) = match self.status_now() {
            SessionStatus::Running => ("running".to_string(), None),
            SessionStatus::Exited(code) => ("exited".to_string(), code),
        };
        TerminalHandle {
            session_id: key.to_string(),
            pid: self.pid,
            cols,
            rows,
            status,
            exit_code,
            started_at: self.started_at,
        }
    }
}

#[derive(Clone)]
pub struct TerminalRegistry {
    label: &'static str,
    sessions: Arc<DashMap<String, Arc<Session>>>,
    events: EventBus,
}

impl TerminalRegistry {
    pub fn new(label: &'static str, events: EventBus) -> Self {
        Self {
            label,
            sessions: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Returns the existing session when the launch parameters match and it
    /// is still running; otherwise kills any prior session for the key and
    /// spawns a fresh one. `preserve_buffer` carries the old scrollback into
    /// the new session (used by the setup PTY, which runs several commands
    /// in sequence).
    pub fn ensure_session(
        &self,
        key: &str,
        spec: LaunchSpec,
        preserve_buffer: bool,
    ) -> Result<TerminalHandle> {
        if let Some(existing) = self.sessions.get(key)
            && existing.status_now() == SessionStatus::Running
            && existing.spec.launch_params_match(&spec)
        {
            debug!("[{}] reusing running session {key}", self.label);
            return Ok(existing.handle(key));
        }

        let carried = if preserve_buffer {
            self.sessions
                .get(key)
                .map(|prior| prior.buffer.lock().snapshot())
        } else {
            None
        };

        if let Some((_, prior)) = self.sessions.remove(key) {
            if let Err(e) = prior.killer.lock().kill() {
                debug!("[{}] kill before respawn for {key}: {e}", self.label);
            }
        }

        let session = self.spawn(key, spec, carried)?;
        let handle = session.handle(key);
        self.sessions.insert(key.to_string(), session);
        info!(
            "[{}] spawned session {key} (pid {:?})",
            self.label, handle.pid
        );
        Ok(handle)
    }

    fn spawn(
        &self,
        key: &str,
        spec: LaunchSpec,
        carried: Option<(String, u64)>,
    ) -> Result<Arc<Session>> {
        if spec.argv.is_empty() {
            return Err(anyhow!("Cannot spawn terminal '{key}' with empty argv"));
        }

        let pty = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open pty")?;

        let mut cmd = CommandBuilder::new(&spec.argv[0]);
        cmd.args(&spec.argv[1..]);
        cmd.cwd(&spec.cwd);
        cmd.env("TERM", "xterm-256color");
        for (name, value) in &spec.env {
            cmd.env(name, value);
        }

        let mut child = pty
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn '{}'", spec.argv.join(" ")))?;
        drop(pty.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pty
            .master
            .try_clone_reader()
            .context("Failed to clone pty reader")?;
        let writer = pty.master.take_writer().context("Failed to take pty writer")?;

        let mut buffer = RingBuffer::new(SOFT_CAP_CHARS);
        if let Some((prior_data, _)) = carried {
            buffer.append(&prior_data);
        }
        let buffer = Arc::new(Mutex::new(buffer));

        let (status_tx, status_rx) = watch::channel(SessionStatus::Running);

        let topic = terminal_topic(key);
        let events = self.events.clone();
        let reader_buffer = buffer.clone();
        let thread_key = key.to_string();
        std::thread::Builder::new()
            .name(format!("pty-{key}"))
            .spawn(move || {
                let mut reader = reader;
                let mut chunk_buf = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk_buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&chunk_buf[..n]).to_string();
                            // Append and publish under the buffer lock so a
                            // snapshot's seq cleanly partitions the stream.
                            let mut locked = reader_buffer.lock();
                            let seq = locked.append(&chunk);
                            events.publish(
                                &topic,
                                BusEvent::new(
                                    "data",
                                    serde_json::json!({ "chunk": chunk, "seq": seq }),
                                ),
                            );
                            drop(locked);
                        }
                        Err(e) => {
                            debug!("pty reader for {thread_key} ended: {e}");
                            break;
                        }
                    }
                }

                let exit_code = child.wait().ok().map(|status| status.exit_code() as i32);
                let _ = status_tx.send(SessionStatus::Exited(exit_code));
                events.publish(
                    &topic,
                    BusEvent::new(
                        "exit",
                        serde_json::json!({ "exitCode": exit_code, "signal": null }),
                    ),
                );
            })
            .context("Failed to spawn pty reader thread")?;

        Ok(Arc::new(Session {
            size: Mutex::new((spec.cols, spec.rows)),
            spec,
            pid,
            started_at: Utc::now(),
            master: Mutex::new(pty.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            buffer,
            status: status_rx,
        }))
    }

    pub fn handle(&self, key: &str) -> Option<TerminalHandle> {
        self.sessions.get(key).map(|session| session.handle(key))
    }

    pub fn write(&self, key: &str, data: &str) -> Result<()> {
        let session = self
            .sessions
            .get(key)
            .ok_or_else(|| anyhow!("Terminal '{key}' not found"))?;
        if session.status_now() != SessionStatus::Running {
            return Err(anyhow!("Terminal '{key}' is not running"));
        }
        session
            .writer
            .lock()
            .write_all(data.as_bytes())
            .with_context(|| format!("Failed to write to terminal '{key}'"))?;
        Ok(())
    }

    pub fn resize(&self, key: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self
            .sessions
            .get(key)
            .ok_or_else(|| anyhow!("Terminal '{key}' not found"))?;
        if session.status_now() != SessionStatus::Running {
            return Err(anyhow!("Terminal '{key}' is not running"));
        }
        session
            .master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .with_context(|| format!("Failed to resize terminal '{key}'"))?;
        *session.size.lock() = (cols, rows);
        Ok(())
    }

    /// Snapshot of the ring buffer and the sequence number it covers.
    pub fn read_output(&self, key: &str) -> Option<(String, u64)> {
        self.sessions
            .get(key)
            .map(|session| session.buffer.lock().snapshot())
    }

    /// Blocks until the session exits; returns its exit code.
    pub async fn wait_for_exit(&self, key: &str) -> Result<Option<i32>> {
        let mut status = {
            let session = self
                .sessions
                .get(key)
                .ok_or_else(|| anyhow!("Terminal '{key}' not found"))?;
            session.status.clone()
        };
        loop {
            if let SessionStatus::Exited(code) = *status.borrow() {
                return Ok(code);
            }
            status
                .changed()
                .await
                .map_err(|_| anyhow!("Terminal '{key}' vanished while waiting for exit"))?;
        }
    }

    /// Kills the PTY (ignoring already-exited children) and forgets the
    /// session.
    pub fn close_session(&self, key: &str) {
        if let Some((_, session)) = self.sessions.remove(key) {
            if let Err(e) = session.killer.lock().kill() {
                debug!("[{}] close of {key}: {e}", self.label);
            }
            info!("[{}] closed session {key}", self.label);
        }
    }

    pub fn close_all(&self) {
        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.close_session(&key);
        }
    }
}

impl Drop for TerminalRegistry {
    fn drop(&mut self) {
        if Arc::strong_count(&self.sessions) == 1 && !self.sessions.is_empty() {
            warn!("[{}] dropping registry with live sessions", self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TerminalRegistry {
        TerminalRegistry::new("test", EventBus::new())
    }

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new(
            vec!["sh".into(), "-c".into(), script.into()],
            std::env::temp_dir(),
        )
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let reg = registry();
        reg.ensure_session("t1", sh("printf 'hello from pty'; exit 3"), false)
            .unwrap();

        let code = reg.wait_for_exit("t1").await.unwrap();
        assert_eq!(code, Some(3));

        let (output, seq) = reg.read_output("t1").unwrap();
        assert!(output.contains("hello from pty"), "got: {output:?}");
        assert!(seq > 0);
    }

    #[tokio::test]
    async fn ensure_is_idempotent_for_identical_running_spec() {
        let reg = registry();
        let first = reg.ensure_session("t1", sh("sleep 30"), false).unwrap();
        let second = reg.ensure_session("t1", sh("sleep 30"), false).unwrap();
        assert_eq!(first.pid, second.pid);

        let third = reg.ensure_session("t1", sh("sleep 31"), false).unwrap();
        assert_ne!(first.pid, third.pid, "changed argv must respawn");
        reg.close_session("t1");
    }

    #[tokio::test]
    async fn write_reaches_the_child() {
        let reg = registry();
        reg.ensure_session("t1", sh("read line; echo got:$line"), false)
            .unwrap();
        reg.write("t1", "ping\n").unwrap();
        let _ = reg.wait_for_exit("t1").await.unwrap();
        let (output, _) = reg.read_output("t1").unwrap();
        assert!(output.contains("got:ping"), "got: {output:?}");
    }

    #[tokio::test]
    async fn write_and_resize_fail_after_exit() {
        let reg = registry();
        reg.ensure_session("t1", sh("true"), false).unwrap();
        reg.wait_for_exit("t1").await.unwrap();
        assert!(reg.write("t1", "x").is_err());
        assert!(reg.resize("t1", 100, 40).is_err());
    }

    #[tokio::test]
    async fn exit_event_is_published() {
        let reg = registry();
        let mut rx = reg.events.subscribe(&terminal_topic("t1"));
        reg.ensure_session("t1", sh("exit 0"), false).unwrap();

        loop {
            let event = rx.recv().await.unwrap();
            if event.name == "exit" {
                assert_eq!(event.data["exitCode"], 0);
                break;
            }
        }
    }

    #[tokio::test]
    async fn preserve_buffer_carries_scrollback_across_respawn() {
        let reg = registry();
        reg.ensure_session("t1", sh("printf 'first run\n'"), false)
            .unwrap();
        reg.wait_for_exit("t1").await.unwrap();

        reg.ensure_session("t1", sh("printf 'second run\n'"), true)
            .unwrap();
        reg.wait_for_exit("t1").await.unwrap();

        let (output, _) = reg.read_output("t1").unwrap();
        assert!(output.contains("first run"));
        assert!(output.contains("second run"));
    }

    #[tokio::test]
    async fn close_session_forgets_the_key() {
        let reg = registry();
        reg.ensure_session("t1", sh("sleep 30"), false).unwrap();
        reg.close_session("t1");
        assert!(reg.handle("t1").is_none());
        assert!(reg.read_output("t1").is_none());
    }
}
