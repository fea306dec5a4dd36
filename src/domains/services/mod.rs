//! Service supervision for cells.
//!
//! Materializes a template's services block into `cell_services` rows, runs
//! the one-time setup recipe inside a streamed setup PTY, and drives
//! individual services through their start/stop lifecycle. Service status
//! is reconciled against live OS state on every read.

pub mod ports;

use crate::config::RuntimeConfig;
use crate::domains::cells::entity::{Cell, CellService, ServiceStatus};
use crate::domains::templates::TemplateConfig;
use crate::domains::terminal::keys::{service_terminal_key, setup_terminal_key};
use crate::domains::terminal::{LaunchSpec, TerminalRegistry};
use crate::domains::worktrees::{TimingSample, TimingSink};
use crate::errors::{CommandExecutionError, TemplateSetupError};
use crate::infrastructure::database::{CellServiceMethods, Database};
use crate::infrastructure::events::{BusEvent, EventBus, service_topic};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

pub const UNEXPECTED_EXIT_ERROR: &str = "Process exited unexpectedly";

/// A service row enriched with derived runtime facts for API consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    #[serde(flatten)]
    pub service: CellService,
    pub port_reachable: Option<bool>,
    pub url: Option<String>,
}

#[derive(Clone)]
pub struct ServiceSupervisor {
    db: Database,
    events: EventBus,
    terminals: TerminalRegistry,
    config: RuntimeConfig,
}

impl ServiceSupervisor {
    pub fn new(
        db: Database,
        events: EventBus,
        terminals: TerminalRegistry,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            db,
            events,
            terminals,
            config,
        }
    }

    /// Idempotently inserts one row per declared service, then runs the
    /// template's setup commands sequentially inside the setup PTY. Services
    /// are left `pending`. A failing setup command surfaces as
    /// `TemplateSetupError` so the caller knows the worktree itself is valid.
    pub async fn ensure_cell_services(
        &self,
        cell: &Cell,
        template: &TemplateConfig,
        on_timing: Option<TimingSink<'_>>,
    ) -> Result<Vec<CellService>> {
        let started = Instant::now();
        for def in &template.services {
            let row = CellService {
                id: Uuid::new_v4().to_string(),
                cell_id: cell.id.clone(),
                name: def.name.clone(),
                kind: def.kind,
                command: def.command.clone(),
                cwd: def.cwd.clone(),
                env: def.env.clone(),
                port: def.port,
                pid: None,
                status: ServiceStatus::Pending,
                last_known_error: None,
                updated_at: Utc::now(),
            };
            self.db.insert_cell_service(&row)?;
        }
        emit(
            on_timing,
            "insert_services",
            started,
            serde_json::json!({ "declared": template.services.len() }),
        );

        for (index, command) in template.setup.iter().enumerate() {
            let started = Instant::now();
            let result = self.run_setup_command(cell, command).await;
            match result {
                Ok(()) => emit(
                    on_timing,
                    "setup_command",
                    started,
                    serde_json::json!({ "command": command, "index": index }),
                ),
                Err(cmd_err) => {
                    emit(
                        on_timing,
                        "setup_command",
                        started,
                        serde_json::json!({
                            "command": command,
                            "index": index,
                            "exitCode": cmd_err.exit_code,
                        }),
                    );
                    let setup = TemplateSetupError {
                        template_id: cell.template_id.clone(),
                        workspace_path: cell.workspace_path.to_string_lossy().to_string(),
                        command: command.clone(),
                        exit_code: cmd_err.exit_code,
                        cause: Some(cmd_err.to_string()),
                    };
                    return Err(anyhow::Error::new(cmd_err).context(setup));
                }
            }
        }

        let services = self.db.list_cell_services(&cell.id)?;
        for service in &services {
            self.publish_service(service);
        }
        Ok(services)
    }

    async fn run_setup_command(
        &self,
        cell: &Cell,
        command: &str,
    ) -> std::result::Result<(), CommandExecutionError> {
        let key = setup_terminal_key(&cell.id);
        let spec = LaunchSpec::new(
            vec!["sh".to_string(), "-lc".to_string(), command.to_string()],
            cell.workspace_path.clone(),
        );

        let failure = |exit_code| CommandExecutionError {
            command: command.to_string(),
            cwd: cell.workspace_path.to_string_lossy().to_string(),
            exit_code,
        };

        info!("Cell {}: running setup command: {command}", cell.id);
        self.terminals
            .ensure_session(&key, spec, true)
            .map_err(|_| failure(None))?;

        let exit_code = self
            .terminals
            .wait_for_exit(&key)
            .await
            .map_err(|_| failure(None))?;

        match exit_code {
            Some(0) => Ok(()),
            other => Err(failure(other)),
        }
    }

    /// Starts one service: `pending`/`error`/`stopped` -> `starting` ->
    /// `running`. A declared port already bound by a foreign process fails
    /// the start with a descriptive `last_known_error`.
    pub async fn start_cell_service(&self, service_id: &str) -> Result<CellService> {
        let service = self.require_service(service_id)?;
        let cell = self.require_cell(&service.cell_id)?;

        if service.status == ServiceStatus::Running
            && service.pid.is_some_and(ports::process_alive)
        {
            return Ok(service);
        }

        self.transition(&service.id, ServiceStatus::Starting, None, None)?;

        if let Some(port) = service.port
            && ports::port_reachable(port).await
        {
            let message = format!("Port {port} is already in use by another process");
            warn!("Service {}: {message}", service.name);
            return self.transition(&service.id, ServiceStatus::Error, None, Some(&message));
        }

        let cwd = match &service.cwd {
            Some(rel) => cell.workspace_path.join(rel),
            None => cell.workspace_path.clone(),
        };
        let mut spec = LaunchSpec::new(
            vec!["sh".to_string(), "-lc".to_string(), service.command.clone()],
            cwd,
        );
        let mut env: Vec<(String, String)> = service.env.clone().into_iter().collect();
        env.sort();
        if let Some(port) = service.port {
            env.push(("PORT".to_string(), port.to_string()));
        }
        spec.env = env;

        let key = service_terminal_key(&service.id);
        let handle = match self.terminals.ensure_session(&key, spec, false) {
            Ok(handle) => handle,
            Err(e) => {
                let message = format!("Failed to launch service: {e}");
                return self.transition(&service.id, ServiceStatus::Error, None, Some(&message));
            }
        };

        info!(
            "Started service '{}' for cell {} (pid {:?})",
            service.name, service.cell_id, handle.pid
        );
        self.transition(&service.id, ServiceStatus::Running, handle.pid, None)
    }

    /// Stops one service: `running` -> `stopping` -> `stopped`. With
    /// `release_ports` the declared port is scanned and listeners owned by
    /// this service are terminated.
    pub async fn stop_cell_service(
        &self,
        service_id: &str,
        release_ports: bool,
    ) -> Result<CellService> {
        let service = self.require_service(service_id)?;
        if matches!(
            service.status,
            ServiceStatus::Stopped | ServiceStatus::Pending
        ) {
            return Ok(service);
        }

        self.transition(&service.id, ServiceStatus::Stopping, service.pid, None)?;
        self.terminals
            .close_session(&service_terminal_key(&service.id));

        if release_ports
            && let Some(port) = service.port
        {
            match ports::release_port(port, service.pid).await {
                Ok(signalled) if !signalled.is_empty() => {
                    info!(
                        "Service '{}': reclaimed port {port} from pids {signalled:?}",
                        service.name
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Service '{}': port release failed: {e}", service.name),
            }
        }

        info!(
            "Stopped service '{}' for cell {}",
            service.name, service.cell_id
        );
        self.transition(&service.id, ServiceStatus::Stopped, None, None)
    }

    pub async fn restart_cell_service(&self, service_id: &str) -> Result<CellService> {
        self.stop_cell_service(service_id, true).await?;
        self.start_cell_service(service_id).await
    }

    /// Fan-out start over every service of the cell; failures are logged and
    /// do not abort the remaining services.
    pub async fn start_cell_services(&self, cell_id: &str) -> Result<Vec<CellService>> {
        let mut out = Vec::new();
        for service in self.db.list_cell_services(cell_id)? {
            match self.start_cell_service(&service.id).await {
                Ok(updated) => out.push(updated),
                Err(e) => warn!("Failed to start service '{}': {e}", service.name),
            }
        }
        Ok(out)
    }

    pub async fn stop_cell_services(
        &self,
        cell_id: &str,
        release_ports: bool,
    ) -> Result<Vec<CellService>> {
        let mut out = Vec::new();
        for service in self.db.list_cell_services(cell_id)? {
            match self.stop_cell_service(&service.id, release_ports).await {
                Ok(updated) => out.push(updated),
                Err(e) => warn!("Failed to stop service '{}': {e}", service.name),
            }
        }
        Ok(out)
    }

    /// Read-time status derivation against the live process table:
    /// `running` without a live pid degrades to `error`; `error` with a live
    /// pid recovers to `running`. Persisted only when the derived status
    /// differs.
    pub fn reconcile(&self, service: &CellService) -> Result<CellService> {
        let alive = service.pid.is_some_and(ports::process_alive);
        let derived = match (service.status, alive) {
            (ServiceStatus::Running, false) => Some((
                ServiceStatus::Error,
                service.pid,
                Some(UNEXPECTED_EXIT_ERROR),
            )),
            (ServiceStatus::Error, true) => Some((ServiceStatus::Running, service.pid, None)),
            _ => None,
        };

        match derived {
            Some((status, pid, error)) => {
                self.transition(&service.id, status, pid, error)
            }
            None => Ok(service.clone()),
        }
    }

    pub fn list_reconciled(&self, cell_id: &str) -> Result<Vec<CellService>> {
        self.db
            .list_cell_services(cell_id)?
            .iter()
            .map(|service| self.reconcile(service))
            .collect()
    }

    pub fn get_reconciled(&self, service_id: &str) -> Result<CellService> {
        let service = self.require_service(service_id)?;
        self.reconcile(&service)
    }

    /// Snapshot with reachability probe and derived URL.
    pub async fn snapshot(&self, service: &CellService) -> ServiceSnapshot {
        let port_reachable = match service.port {
            Some(port) => Some(ports::port_reachable(port).await),
            None => None,
        };
        ServiceSnapshot {
            url: service.port.map(|port| self.config.service_url(port)),
            service: service.clone(),
            port_reachable,
        }
    }

    fn require_service(&self, service_id: &str) -> Result<CellService> {
        self.db
            .get_cell_service(service_id)?
            .ok_or_else(|| anyhow!("Service '{service_id}' not found"))
    }

    fn require_cell(&self, cell_id: &str) -> Result<Cell> {
        use crate::infrastructure::database::CellMethods;
        self.db
            .get_cell(cell_id)?
            .ok_or_else(|| anyhow!("Cell '{cell_id}' not found"))
    }

    fn transition(
        &self,
        service_id: &str,
        status: ServiceStatus,
        pid: Option<u32>,
        error: Option<&str>,
    ) -> Result<CellService> {
        self.db
            .update_service_runtime(service_id, status, pid, error)
            .context("Failed to persist service transition")?;
        let updated = self.require_service(service_id)?;
        self.publish_service(&updated);
        Ok(updated)
    }

    fn publish_service(&self, service: &CellService) {
        self.events.publish(
            &service_topic(&service.cell_id),
            BusEvent::new("service", service),
        );
    }
}

fn emit(
    on_timing: Option<TimingSink<'_>>,
    step: &str,
    started: Instant,
    metadata: serde_json::Value,
) {
    if let Some(sink) = on_timing {
        sink(TimingSample {
            step: step.to_string(),
            duration_ms: started.elapsed().as_millis() as i64,
            metadata,
        });
    }
}
