//! Terminal endpoints: ensure, stream, input, resize, restart for the
//! shell, chat, setup, and service PTYs.
//!
//! Streams replay the ring buffer as a `snapshot` before tailing; tail
//! `data` events carry a sequence number so chunks already covered by the
//! snapshot are dropped instead of duplicated.

use super::{ApiBody, AuditContext, error_response, json_response, read_json_body, sse};
use crate::domains::cells::entity::{Cell, CellStatus};
use crate::domains::terminal::chat::{ThemeMode, chat_launch_spec};
use crate::domains::terminal::keys::{
    chat_terminal_key, service_terminal_key, setup_terminal_key, shell_terminal_key,
};
use crate::domains::terminal::{DEFAULT_COLS, DEFAULT_ROWS, LaunchSpec, TerminalRegistry};
use crate::engine::Engine;
use crate::errors::HiveError;
use crate::infrastructure::database::{CellMethods, CellServiceMethods};
use crate::infrastructure::events::terminal_topic;
use bytes::Bytes;
use hyper::{Response, StatusCode};
use log::warn;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalFlavor {
    Shell,
    Chat,
    Setup,
    Service,
}

/// Resolves the registry and session key for a flavor. The `id` is a cell
/// id for shell/chat/setup and a service id for service terminals.
fn resolve(
    engine: &Arc<Engine>,
    flavor: TerminalFlavor,
    id: &str,
) -> Result<(TerminalRegistry, String), HiveError> {
    match flavor {
        TerminalFlavor::Shell => {
            require_cell(engine, id)?;
            Ok((engine.shell_terminals.clone(), shell_terminal_key(id)))
        }
        TerminalFlavor::Chat => {
            require_cell(engine, id)?;
            Ok((engine.chat_terminals.clone(), chat_terminal_key(id)))
        }
        TerminalFlavor::Setup => {
            require_cell(engine, id)?;
            Ok((engine.service_terminals.clone(), setup_terminal_key(id)))
        }
        TerminalFlavor::Service => {
            let service = engine
                .db
                .get_cell_service(id)
                .map_err(HiveError::internal)?
                .ok_or_else(|| HiveError::ServiceNotFound {
                    service_id: id.to_string(),
                })?;
            Ok((
                engine.service_terminals.clone(),
                service_terminal_key(&service.id),
            ))
        }
    }
}

fn require_cell(engine: &Arc<Engine>, cell_id: &str) -> Result<Cell, HiveError> {
    engine
        .db
        .get_cell(cell_id)
        .map_err(HiveError::internal)?
        .ok_or_else(|| HiveError::CellNotFound {
            cell_id: cell_id.to_string(),
        })
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct EnsureBody {
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
    #[serde(default)]
    theme: Option<ThemeMode>,
}

pub async fn ensure(
    engine: &Arc<Engine>,
    flavor: TerminalFlavor,
    cell_id: &str,
    body: &Bytes,
) -> Response<ApiBody> {
    let body: EnsureBody = match read_json_body(body) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };
    match ensure_inner(engine, flavor, cell_id, &body) {
        Ok(handle) => json_response(StatusCode::OK, &handle),
        Err(err) => error_response(&err),
    }
}

fn ensure_inner(
    engine: &Arc<Engine>,
    flavor: TerminalFlavor,
    cell_id: &str,
    body: &EnsureBody,
) -> Result<crate::domains::terminal::TerminalHandle, HiveError> {
    let cell = require_cell(engine, cell_id)?;

    match flavor {
        TerminalFlavor::Shell => {
            if !cell.workspace_path.exists() {
                return Err(HiveError::CellNotReady {
                    cell_id: cell_id.to_string(),
                    status: cell.status.as_str().to_string(),
                });
            }
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
            let mut spec = LaunchSpec::new(vec![shell, "-l".to_string()], cell.workspace_path);
            spec.cols = body.cols.unwrap_or(DEFAULT_COLS);
            spec.rows = body.rows.unwrap_or(DEFAULT_ROWS);
            engine
                .shell_terminals
                .ensure_session(&shell_terminal_key(cell_id), spec, false)
                .map_err(HiveError::internal)
        }
        TerminalFlavor::Chat => {
            // The chat terminal only exists once the agent session does.
            let session_id = match (&cell.status, &cell.opencode_session_id) {
                (CellStatus::Ready, Some(session_id)) => session_id.clone(),
                _ => {
                    return Err(HiveError::CellNotReady {
                        cell_id: cell_id.to_string(),
                        status: cell.status.as_str().to_string(),
                    });
                }
            };
            let spec = chat_launch_spec(
                &engine.config,
                &cell,
                &session_id,
                body.theme.unwrap_or_default(),
                body.cols,
                body.rows,
            )
            .map_err(HiveError::internal)?;
            engine
                .chat_terminals
                .ensure_session(&chat_terminal_key(cell_id), spec, false)
                .map_err(HiveError::internal)
        }
        TerminalFlavor::Setup | TerminalFlavor::Service => Err(HiveError::invalid_input(
            "flavor",
            "setup and service terminals are managed by the supervisor",
        )),
    }
}

pub async fn restart(
    engine: &Arc<Engine>,
    flavor: TerminalFlavor,
    cell_id: &str,
    body: &Bytes,
    audit: &AuditContext,
) -> Response<ApiBody> {
    let (registry, key) = match resolve(engine, flavor, cell_id) {
        Ok(resolved) => resolved,
        Err(err) => return error_response(&err),
    };
    registry.close_session(&key);
    engine.record_activity(audit.activity(cell_id, "terminal_restart", Some(key)));
    ensure(engine, flavor, cell_id, body).await
}

#[derive(Debug, Deserialize)]
struct InputBody {
    data: String,
}

pub async fn input(
    engine: &Arc<Engine>,
    flavor: TerminalFlavor,
    id: &str,
    body: &Bytes,
) -> Response<ApiBody> {
    let body: InputBody = match read_json_body(body) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };
    let (registry, key) = match resolve(engine, flavor, id) {
        Ok(resolved) => resolved,
        Err(err) => return error_response(&err),
    };
    match check_running(&registry, &key) {
        Ok(()) => {}
        Err(err) => return error_response(&err),
    }
    match registry.write(&key, &body.data) {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "ok": true })),
        Err(err) => error_response(&HiveError::internal(err)),
    }
}

#[derive(Debug, Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

pub async fn resize(
    engine: &Arc<Engine>,
    flavor: TerminalFlavor,
    id: &str,
    body: &Bytes,
) -> Response<ApiBody> {
    let body: ResizeBody = match read_json_body(body) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };
    let (registry, key) = match resolve(engine, flavor, id) {
        Ok(resolved) => resolved,
        Err(err) => return error_response(&err),
    };
    match check_running(&registry, &key) {
        Ok(()) => {}
        Err(err) => return error_response(&err),
    }
    match registry.resize(&key, body.cols, body.rows) {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "ok": true })),
        Err(err) => error_response(&HiveError::internal(err)),
    }
}

fn check_running(registry: &TerminalRegistry, key: &str) -> Result<(), HiveError> {
    match registry.handle(key) {
        None => Err(HiveError::TerminalNotFound {
            terminal_key: key.to_string(),
        }),
        Some(handle) if handle.status != "running" => Err(HiveError::TerminalNotRunning {
            terminal_key: key.to_string(),
        }),
        Some(_) => Ok(()),
    }
}

/// Terminal SSE stream: `ready` with the session handle, `snapshot` with
/// the ring buffer, then `data`/`exit` tail events. Chunks whose sequence
/// is already covered by the snapshot are skipped.
pub async fn stream(engine: &Arc<Engine>, flavor: TerminalFlavor, id: &str) -> Response<ApiBody> {
    let (registry, key) = match resolve(engine, flavor, id) {
        Ok(resolved) => resolved,
        Err(err) => return error_response(&err),
    };

    // Subscribe before snapshotting; the sequence numbers partition chunks
    // between the two.
    let mut rx = engine.events.subscribe(&terminal_topic(&key));
    let Some((snapshot_data, snapshot_seq)) = registry.read_output(&key) else {
        return error_response(&HiveError::TerminalNotFound { terminal_key: key });
    };
    let handle = registry.handle(&key);

    let (tx, response) = sse::channel();
    tokio::spawn(async move {
        if !tx.send("ready", &handle).await {
            return;
        }
        if !tx
            .send(
                "snapshot",
                &serde_json::json!({ "data": snapshot_data, "seq": snapshot_seq }),
            )
            .await
        {
            return;
        }

        let mut heartbeat = sse::heartbeat_interval();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => {
                        if event.name == "data" {
                            let seq = event.data.get("seq").and_then(|v| v.as_u64()).unwrap_or(0);
                            if seq <= snapshot_seq {
                                continue;
                            }
                        }
                        if !tx.send(&event.name, &event.data).await {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Terminal stream {key} lagged by {skipped} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = heartbeat.tick() => {
                    if !tx.heartbeat().await {
                        return;
                    }
                }
            }
        }
    });

    response
}
