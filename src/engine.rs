//! Process-wide engine state.
//!
//! Owns the database handle, the event bus, the three PTY registries, the
//! service supervisor, the agent runtime, and the single-flight bookkeeping
//! for provisioning workflows. Handlers receive an `Arc<Engine>`; nothing
//! here is a module-level global.

use crate::config::RuntimeConfig;
use crate::domains::agent::AgentRuntime;
use crate::domains::services::ServiceSupervisor;
use crate::domains::templates::Registry;
use crate::domains::terminal::TerminalRegistry;
use crate::domains::worktrees::WorktreeManager;
use crate::errors::CancellationReason;
use crate::infrastructure::database::{ActivityMethods, CellMethods, Database, NewActivityEvent};
use crate::infrastructure::events::{BusEvent, EventBus, cell_status_topic};
use anyhow::Result;
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::domains::cells::entity::CellStatus;

const SHUTDOWN_WORKFLOW_CAP: Duration = Duration::from_secs(15);

pub struct Engine {
    pub db: Database,
    pub events: EventBus,
    pub config: RuntimeConfig,
    pub registry: Registry,
    pub worktrees: WorktreeManager,
    pub supervisor: ServiceSupervisor,
    pub agent: Arc<dyn AgentRuntime>,
    pub shell_terminals: TerminalRegistry,
    pub chat_terminals: TerminalRegistry,
    /// Setup PTYs and service PTYs share one registry; their keys differ.
    pub service_terminals: TerminalRegistry,
    pub(crate) active_provisioning: DashMap<String, ()>,
    pub(crate) workflows: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: RuntimeConfig,
        registry: Registry,
        agent: Arc<dyn AgentRuntime>,
    ) -> Result<Arc<Self>> {
        let db = Database::new(Some(config.db_path.clone()))?;
        let events = EventBus::new();
        let service_terminals = TerminalRegistry::new("service", events.clone());
        let supervisor = ServiceSupervisor::new(
            db.clone(),
            events.clone(),
            service_terminals.clone(),
            config.clone(),
        );

        Ok(Arc::new(Self {
            worktrees: WorktreeManager::new(config.cells_root.clone()),
            shell_terminals: TerminalRegistry::new("shell", events.clone()),
            chat_terminals: TerminalRegistry::new("chat", events.clone()),
            service_terminals,
            supervisor,
            agent,
            registry,
            events,
            db,
            config,
            active_provisioning: DashMap::new(),
            workflows: Mutex::new(HashMap::new()),
        }))
    }

    #[cfg(test)]
    pub fn for_tests(
        config: RuntimeConfig,
        registry: Registry,
        agent: Arc<dyn AgentRuntime>,
    ) -> Arc<Self> {
        Self::new(config, registry, agent).expect("test engine")
    }

    /// `Some(reason)` when the cell was deleted or flipped to `deleting`;
    /// the provisioning workflow checks this between phases.
    pub fn resolve_provisioning_cancellation(
        &self,
        cell_id: &str,
    ) -> Result<Option<CancellationReason>> {
        match self.db.get_cell(cell_id)? {
            None => Ok(Some(CancellationReason::RowDeleted)),
            Some(cell) if cell.status == CellStatus::Deleting => {
                Ok(Some(CancellationReason::Deleting))
            }
            Some(_) => Ok(None),
        }
    }

    /// Nudges workspace streams: subscribers re-read the row and emit a
    /// `cell` or `cell_removed` snapshot.
    pub fn publish_cell_status(&self, workspace_id: &str, cell_id: &str) {
        self.events.publish(
            &cell_status_topic(workspace_id),
            BusEvent::new("cell", serde_json::json!({ "id": cell_id })),
        );
    }

    pub fn publish_cell_removed(&self, workspace_id: &str, cell_id: &str) {
        self.events.publish(
            &cell_status_topic(workspace_id),
            BusEvent::new("cell_removed", serde_json::json!({ "id": cell_id })),
        );
    }

    /// Best-effort audit insert; the feed must never fail a request.
    pub fn record_activity(&self, event: NewActivityEvent) {
        if let Err(e) = self.db.insert_activity_event(&event) {
            warn!(
                "Failed to record activity '{}' for cell {}: {e}",
                event.action, event.cell_id
            );
        }
    }

    pub fn provisioning_in_flight(&self, cell_id: &str) -> bool {
        self.active_provisioning.contains_key(cell_id)
    }

    /// Awaits outstanding workflows (bounded) and tears down every PTY.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> =
            self.workflows.lock().drain().collect();
        if !handles.is_empty() {
            info!("Waiting for {} outstanding workflow(s)", handles.len());
        }
        for (cell_id, handle) in handles {
            if tokio::time::timeout(SHUTDOWN_WORKFLOW_CAP, handle)
                .await
                .is_err()
            {
                warn!("Workflow for cell {cell_id} did not finish before shutdown cap");
            }
        }

        self.shell_terminals.close_all();
        self.chat_terminals.close_all();
        self.service_terminals.close_all();
        info!("Engine shut down");
    }
}
