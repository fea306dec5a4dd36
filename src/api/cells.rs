//! Cell CRUD, retry, setup log, and the workspace-wide status stream.

use super::{
    ApiBody, AuditContext, error_response, internal_error_response, json_response, read_json_body,
    sse,
};
use crate::domains::cells::entity::{CellStatus, StartMode};
use crate::domains::cells::provisioning::CreateCellRequest;
use crate::domains::terminal::keys::setup_terminal_key;
use crate::engine::Engine;
use crate::errors::HiveError;
use crate::infrastructure::database::CellMethods;
use crate::infrastructure::events::cell_status_topic;
use bytes::Bytes;
use hyper::{Response, StatusCode};
use log::warn;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const SETUP_LOG_TAIL_CHARS: usize = 4000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCellBody {
    name: String,
    template_id: String,
    workspace_id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    provider_id: Option<String>,
    #[serde(default)]
    start_mode: Option<StartMode>,
}

pub async fn create(
    engine: &Arc<Engine>,
    body: &Bytes,
    audit: &AuditContext,
) -> Response<ApiBody> {
    let body: CreateCellBody = match read_json_body(body) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };

    let result = engine
        .create_cell(CreateCellRequest {
            workspace_id: body.workspace_id,
            template_id: body.template_id,
            name: body.name,
            description: body.description,
            model_id_override: body.model_id,
            provider_id_override: body.provider_id,
            start_mode: body.start_mode,
        })
        .await;

    match result {
        Ok(cell) => {
            engine.record_activity(audit.activity(&cell.id, "cell_created", None));
            json_response(StatusCode::CREATED, &cell)
        }
        Err(err) => error_response(&err),
    }
}

pub async fn list(engine: &Arc<Engine>, query: &HashMap<String, String>) -> Response<ApiBody> {
    let Some(workspace_id) = query.get("workspaceId") else {
        return error_response(&HiveError::invalid_input(
            "workspaceId",
            "query parameter is required",
        ));
    };
    if engine.registry.workspace(workspace_id).is_none() {
        return error_response(&HiveError::WorkspaceNotFound {
            workspace_id: workspace_id.clone(),
        });
    }

    match engine.db.list_cells(workspace_id) {
        Ok(cells) => {
            let visible: Vec<_> = cells
                .into_iter()
                .filter(|cell| cell.status != CellStatus::Deleting)
                .collect();
            json_response(StatusCode::OK, &visible)
        }
        Err(err) => internal_error_response(&err),
    }
}

pub async fn get(
    engine: &Arc<Engine>,
    cell_id: &str,
    query: &HashMap<String, String>,
) -> Response<ApiBody> {
    let cell = match engine.db.get_cell(cell_id) {
        Ok(Some(cell)) => cell,
        Ok(None) => {
            return error_response(&HiveError::CellNotFound {
                cell_id: cell_id.to_string(),
            });
        }
        Err(err) => return internal_error_response(&err),
    };

    let mut payload = match serde_json::to_value(&cell) {
        Ok(payload) => payload,
        Err(e) => return internal_error_response(&anyhow::Error::new(e)),
    };
    if query.get("includeSetupLog").map(String::as_str) == Some("true") {
        let tail = engine
            .service_terminals
            .read_output(&setup_terminal_key(cell_id))
            .map(|(log, _)| tail_chars(&log, SETUP_LOG_TAIL_CHARS));
        payload["setupLog"] = serde_json::to_value(tail).unwrap_or(serde_json::Value::Null);
    }
    json_response(StatusCode::OK, &payload)
}

pub async fn delete(
    engine: &Arc<Engine>,
    cell_id: &str,
    _audit: &AuditContext,
) -> Response<ApiBody> {
    match engine.delete_cell(cell_id).await {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "id": cell_id })),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct BulkDeleteBody {
    ids: Vec<String>,
}

pub async fn bulk_delete(
    engine: &Arc<Engine>,
    body: &Bytes,
    _audit: &AuditContext,
) -> Response<ApiBody> {
    let body: BulkDeleteBody = match read_json_body(body) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };
    if body.ids.is_empty() {
        return error_response(&HiveError::invalid_input("ids", "must not be empty"));
    }

    let deleted = engine.delete_cells(&body.ids).await;
    if deleted.is_empty() {
        return error_response(&HiveError::CellNotFound {
            cell_id: body.ids.join(", "),
        });
    }
    json_response(StatusCode::OK, &serde_json::json!({ "deletedIds": deleted }))
}

pub async fn retry(engine: &Arc<Engine>, cell_id: &str, audit: &AuditContext) -> Response<ApiBody> {
    match engine.retry_setup(cell_id).await {
        Ok(cell) => {
            engine.record_activity(audit.activity(cell_id, "setup_retry", None));
            json_response(StatusCode::OK, &cell)
        }
        Err(err) => error_response(&err),
    }
}

pub async fn setup_log(
    engine: &Arc<Engine>,
    cell_id: &str,
    audit: &AuditContext,
) -> Response<ApiBody> {
    if matches!(engine.db.get_cell(cell_id), Ok(None)) {
        return error_response(&HiveError::CellNotFound {
            cell_id: cell_id.to_string(),
        });
    }
    engine.record_activity(audit.activity(cell_id, "setup_log_read", None));
    match engine
        .service_terminals
        .read_output(&setup_terminal_key(cell_id))
    {
        Some((log, seq)) => {
            json_response(StatusCode::OK, &serde_json::json!({ "log": log, "seq": seq }))
        }
        None => json_response(StatusCode::OK, &serde_json::json!({ "log": "", "seq": 0 })),
    }
}

/// Workspace-wide cell status stream: `ready`, one `cell` event per
/// existing cell (excluding `deleting`), `snapshot`, then tail. On each
/// status event the row is re-read; a missing or deleting row becomes
/// `cell_removed`.
pub async fn workspace_stream(engine: &Arc<Engine>, workspace_id: &str) -> Response<ApiBody> {
    if engine.registry.workspace(workspace_id).is_none() {
        return error_response(&HiveError::WorkspaceNotFound {
            workspace_id: workspace_id.to_string(),
        });
    }

    let (tx, response) = sse::channel();
    let mut rx = engine.events.subscribe(&cell_status_topic(workspace_id));
    let engine = engine.clone();
    let workspace_id = workspace_id.to_string();

    tokio::spawn(async move {
        if !tx
            .send("ready", &serde_json::json!({ "workspaceId": workspace_id }))
            .await
        {
            return;
        }

        let cells = engine.db.list_cells(&workspace_id).unwrap_or_default();
        let mut count = 0usize;
        for cell in cells
            .iter()
            .filter(|cell| cell.status != CellStatus::Deleting)
        {
            if !tx.send("cell", cell).await {
                return;
            }
            count += 1;
        }
        if !tx
            .send("snapshot", &serde_json::json!({ "cells": count }))
            .await
        {
            return;
        }

        let mut heartbeat = sse::heartbeat_interval();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => {
                        let id = event
                            .data
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        if event.name == "cell_removed" {
                            if !tx.send("cell_removed", &serde_json::json!({ "id": id })).await {
                                return;
                            }
                            continue;
                        }
                        match engine.db.get_cell(&id) {
                            Ok(Some(cell)) if cell.status != CellStatus::Deleting => {
                                if !tx.send("cell", &cell).await {
                                    return;
                                }
                            }
                            Ok(_) => {
                                if !tx
                                    .send("cell_removed", &serde_json::json!({ "id": id }))
                                    .await
                                {
                                    return;
                                }
                            }
                            Err(e) => warn!("Workspace stream re-read of cell {id} failed: {e}"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Workspace stream for {workspace_id} lagged by {skipped} events");
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

fn tail_chars(log: &str, max: usize) -> String {
    let count = log.chars().count();
    if count <= max {
        return log.to_string();
    }
    log.chars().skip(count - max).collect()
}
