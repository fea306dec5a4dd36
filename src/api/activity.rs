//! Activity feed and timing telemetry endpoints.

use super::{ApiBody, error_response, internal_error_response, json_response, sse};
use crate::domains::cells::entity::TimingWorkflow;
use crate::engine::Engine;
use crate::errors::HiveError;
use crate::infrastructure::database::{ActivityMethods, CellMethods, TimingMethods};
use hyper::{Response, StatusCode};
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const DEFAULT_ACTIVITY_PAGE: usize = 50;
const MAX_ACTIVITY_PAGE: usize = 200;
const DEFAULT_GLOBAL_TIMINGS: usize = 200;
const MAX_GLOBAL_TIMINGS: usize = 1000;

fn require_cell(engine: &Arc<Engine>, cell_id: &str) -> Result<(), HiveError> {
    match engine.db.get_cell(cell_id) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(HiveError::CellNotFound {
            cell_id: cell_id.to_string(),
        }),
        Err(e) => Err(HiveError::internal(e)),
    }
}

/// Cursor-paginated activity feed, newest first.
pub async fn list(
    engine: &Arc<Engine>,
    cell_id: &str,
    query: &HashMap<String, String>,
) -> Response<ApiBody> {
    if let Err(err) = require_cell(engine, cell_id) {
        return error_response(&err);
    }

    let limit = match query.get("limit") {
        None => DEFAULT_ACTIVITY_PAGE,
        Some(raw) => match raw.parse::<usize>() {
            Ok(value) if value >= 1 => value.min(MAX_ACTIVITY_PAGE),
            _ => {
                return error_response(&HiveError::invalid_input(
                    "limit",
                    "must be a positive integer",
                ));
            }
        },
    };

    match engine
        .db
        .list_activity_events(cell_id, query.get("cursor").map(String::as_str), limit)
    {
        Ok(page) => json_response(
            StatusCode::OK,
            &serde_json::json!({ "events": page.events, "nextCursor": page.next_cursor }),
        ),
        Err(_) => error_response(&HiveError::invalid_input("cursor", "malformed cursor")),
    }
}

fn parse_workflow(
    query: &HashMap<String, String>,
) -> Result<Option<TimingWorkflow>, HiveError> {
    match query.get("workflow").map(String::as_str) {
        None | Some("all") => Ok(None),
        Some(raw) => TimingWorkflow::parse(raw).map(Some).ok_or_else(|| {
            HiveError::invalid_input("workflow", "must be one of create, delete, all")
        }),
    }
}

pub async fn timings(
    engine: &Arc<Engine>,
    cell_id: &str,
    query: &HashMap<String, String>,
) -> Response<ApiBody> {
    if let Err(err) = require_cell(engine, cell_id) {
        return error_response(&err);
    }
    let workflow = match parse_workflow(query) {
        Ok(workflow) => workflow,
        Err(err) => return error_response(&err),
    };
    match engine.db.list_timing_events(cell_id, workflow) {
        Ok(events) => json_response(StatusCode::OK, &events),
        Err(err) => internal_error_response(&err),
    }
}

pub async fn global_timings(
    engine: &Arc<Engine>,
    query: &HashMap<String, String>,
) -> Response<ApiBody> {
    let limit = query
        .get("limit")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(DEFAULT_GLOBAL_TIMINGS)
        .min(MAX_GLOBAL_TIMINGS);
    match engine.db.list_global_timing_events(limit) {
        Ok(events) => json_response(StatusCode::OK, &events),
        Err(err) => internal_error_response(&err),
    }
}

/// Per-cell timing stream, filterable by workflow: `ready`, persisted
/// events as `timing`, `snapshot`, then live tail.
pub async fn timings_stream(
    engine: &Arc<Engine>,
    cell_id: &str,
    query: &HashMap<String, String>,
) -> Response<ApiBody> {
    if let Err(err) = require_cell(engine, cell_id) {
        return error_response(&err);
    }
    let workflow = match parse_workflow(query) {
        Ok(workflow) => workflow,
        Err(err) => return error_response(&err),
    };

    let (tx, response) = sse::channel();
    let mut rx = engine
        .events
        .subscribe(&crate::infrastructure::events::cell_timing_topic(cell_id));
    let engine = engine.clone();
    let cell_id = cell_id.to_string();

    tokio::spawn(async move {
        if !tx.send("ready", &serde_json::json!({ "cellId": cell_id })).await {
            return;
        }
        let existing = engine
            .db
            .list_timing_events(&cell_id, workflow)
            .unwrap_or_default();
        for event in &existing {
            if !tx.send("timing", event).await {
                return;
            }
        }
        if !tx
            .send("snapshot", &serde_json::json!({ "events": existing.len() }))
            .await
        {
            return;
        }

        let workflow_filter = workflow.map(|w| w.as_str().to_string());
        let mut heartbeat = sse::heartbeat_interval();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => {
                        if let Some(filter) = &workflow_filter {
                            let event_workflow = event
                                .data
                                .get("workflow")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default();
                            if event_workflow != filter {
                                continue;
                            }
                        }
                        if !tx.send(&event.name, &event.data).await {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Timing stream for {cell_id} lagged by {skipped} events");
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
