//! Service endpoints: reconciled listings, start/stop/restart fan-out and
//! per-service variants, and the per-cell service stream.

use super::{ApiBody, AuditContext, error_response, internal_error_response, json_response, sse};
use crate::engine::Engine;
use crate::errors::HiveError;
use crate::infrastructure::database::{CellMethods, CellServiceMethods};
use hyper::{Response, StatusCode};
use log::warn;
use std::sync::Arc;
use tokio::sync::broadcast;

fn require_cell(engine: &Arc<Engine>, cell_id: &str) -> Result<(), HiveError> {
    match engine.db.get_cell(cell_id) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(HiveError::CellNotFound {
            cell_id: cell_id.to_string(),
        }),
        Err(e) => Err(HiveError::internal(e)),
    }
}

/// Lists the cell's services, reconciled against the process table and
/// enriched with a port reachability probe.
pub async fn list(engine: &Arc<Engine>, cell_id: &str) -> Response<ApiBody> {
    if let Err(err) = require_cell(engine, cell_id) {
        return error_response(&err);
    }
    let services = match engine.supervisor.list_reconciled(cell_id) {
        Ok(services) => services,
        Err(err) => return internal_error_response(&err),
    };

    let mut snapshots = Vec::with_capacity(services.len());
    for service in &services {
        snapshots.push(engine.supervisor.snapshot(service).await);
    }
    json_response(StatusCode::OK, &snapshots)
}

pub async fn cell_action(
    engine: &Arc<Engine>,
    cell_id: &str,
    action: &str,
    audit: &AuditContext,
) -> Response<ApiBody> {
    if let Err(err) = require_cell(engine, cell_id) {
        return error_response(&err);
    }

    let result = match action {
        "start" => engine.supervisor.start_cell_services(cell_id).await,
        "stop" => engine.supervisor.stop_cell_services(cell_id, true).await,
        "restart" => {
            match engine.supervisor.stop_cell_services(cell_id, true).await {
                Ok(_) => engine.supervisor.start_cell_services(cell_id).await,
                Err(e) => Err(e),
            }
        }
        _ => return super::not_found_response(),
    };

    match result {
        Ok(services) => {
            engine.record_activity(audit.activity(cell_id, &format!("services_{action}"), None));
            json_response(StatusCode::OK, &services)
        }
        Err(err) => internal_error_response(&err),
    }
}

pub async fn service_action(
    engine: &Arc<Engine>,
    service_id: &str,
    action: &str,
    audit: &AuditContext,
) -> Response<ApiBody> {
    let service = match engine.db.get_cell_service(service_id) {
        Ok(Some(service)) => service,
        Ok(None) => {
            return error_response(&HiveError::ServiceNotFound {
                service_id: service_id.to_string(),
            });
        }
        Err(err) => return internal_error_response(&err),
    };

    let result = match action {
        "start" => engine.supervisor.start_cell_service(service_id).await,
        "stop" => engine.supervisor.stop_cell_service(service_id, true).await,
        "restart" => engine.supervisor.restart_cell_service(service_id).await,
        _ => return super::not_found_response(),
    };

    match result {
        Ok(updated) => {
            let mut activity =
                audit.activity(&service.cell_id, &format!("service_{action}"), None);
            activity.service_name.get_or_insert(service.name.clone());
            engine.record_activity(activity);
            json_response(StatusCode::OK, &updated)
        }
        Err(err) => internal_error_response(&err),
    }
}

/// Per-cell services stream: `ready`, one `service` snapshot per service,
/// `snapshot`, then tail events published by the supervisor.
pub async fn stream(engine: &Arc<Engine>, cell_id: &str) -> Response<ApiBody> {
    if let Err(err) = require_cell(engine, cell_id) {
        return error_response(&err);
    }

    let (tx, response) = sse::channel();
    let mut rx = engine
        .events
        .subscribe(&crate::infrastructure::events::service_topic(cell_id));
    let engine = engine.clone();
    let cell_id = cell_id.to_string();

    tokio::spawn(async move {
        if !tx.send("ready", &serde_json::json!({ "cellId": cell_id })).await {
            return;
        }
        let services = engine.supervisor.list_reconciled(&cell_id).unwrap_or_default();
        for service in &services {
            if !tx.send("service", service).await {
                return;
            }
        }
        if !tx
            .send("snapshot", &serde_json::json!({ "services": services.len() }))
            .await
        {
            return;
        }

        let mut heartbeat = sse::heartbeat_interval();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => {
                        if !tx.send(&event.name, &event.data).await {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Service stream for {cell_id} lagged by {skipped} events");
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
