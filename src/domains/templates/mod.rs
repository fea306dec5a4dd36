//! Workspace and template registry, loaded from a TOML file at boot.
//!
//! A template declares the services, one-time setup recipe, include
//! patterns, and default agent settings that every cell created from it
//! inherits.

use crate::domains::cells::entity::{ServiceKind, StartMode};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    pub id: String,
    pub name: String,
    pub root_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default = "default_service_kind")]
    pub kind: ServiceKind,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_service_kind() -> ServiceKind {
    ServiceKind::Process
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDefaults {
    #[serde(default)]
    pub start_mode: Option<StartMode>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// One-shot setup commands, run sequentially inside the setup PTY.
    #[serde(default)]
    pub setup: Vec<String>,
    /// Untracked files copied from the workspace root into a fresh worktree
    /// (exact relative paths or `dir/` prefixes).
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
    #[serde(default)]
    pub defaults: TemplateDefaults,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    workspaces: Vec<WorkspaceConfig>,
    #[serde(default)]
    templates: Vec<TemplateConfig>,
}

/// Immutable registry of workspaces and templates.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    workspaces: HashMap<String, WorkspaceConfig>,
    templates: HashMap<String, TemplateConfig>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read registry file {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(raw).context("Failed to parse registry TOML")?;

        let mut workspaces = HashMap::new();
        for workspace in file.workspaces {
            if workspaces
                .insert(workspace.id.clone(), workspace)
                .is_some()
            {
                return Err(anyhow!("Duplicate workspace id in registry"));
            }
        }

        let mut templates = HashMap::new();
        for template in file.templates {
            let mut names = std::collections::HashSet::new();
            for service in &template.services {
                if !names.insert(service.name.clone()) {
                    return Err(anyhow!(
                        "Template '{}' declares service '{}' twice",
                        template.id,
                        service.name
                    ));
                }
            }
            if templates.insert(template.id.clone(), template).is_some() {
                return Err(anyhow!("Duplicate template id in registry"));
            }
        }

        Ok(Self {
            workspaces,
            templates,
        })
    }

    pub fn workspace(&self, id: &str) -> Option<&WorkspaceConfig> {
        self.workspaces.get(id)
    }

    pub fn template(&self, id: &str) -> Option<&TemplateConfig> {
        self.templates.get(id)
    }

    pub fn workspaces(&self) -> impl Iterator<Item = &WorkspaceConfig> {
        self.workspaces.values()
    }
}

/// Start-mode precedence: request override, then template defaults, then
/// `plan`.
pub fn resolve_start_mode(
    requested: Option<StartMode>,
    template: &TemplateConfig,
) -> StartMode {
    requested
        .or(template.defaults.start_mode)
        .unwrap_or(StartMode::Plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[workspaces]]
        id = "w1"
        name = "Main"
        root_path = "/repo"

        [[templates]]
        id = "hive-dev"
        setup = ["pnpm install", "pnpm db:migrate"]
        include = [".env.local"]

        [templates.defaults]
        start_mode = "build"

        [[templates.services]]
        name = "web"
        command = "pnpm dev"
        cwd = "apps/web"
        port = 3000

        [templates.services.env]
        NODE_ENV = "development"

        [[templates.services]]
        name = "db"
        kind = "docker"
        command = "docker run --rm -p 5432:5432 postgres:16"
        port = 5432
    "#;

    #[test]
    fn parses_workspaces_and_templates() {
        let registry = Registry::parse(SAMPLE).unwrap();
        let workspace = registry.workspace("w1").unwrap();
        assert_eq!(workspace.root_path, PathBuf::from("/repo"));

        let template = registry.template("hive-dev").unwrap();
        assert_eq!(template.setup.len(), 2);
        assert_eq!(template.services.len(), 2);
        assert_eq!(template.services[0].port, Some(3000));
        assert_eq!(template.services[1].kind, ServiceKind::Docker);
        assert_eq!(
            template.services[0].env.get("NODE_ENV").map(String::as_str),
            Some("development")
        );
    }

    #[test]
    fn unknown_ids_resolve_to_none() {
        let registry = Registry::parse(SAMPLE).unwrap();
        assert!(registry.workspace("nope").is_none());
        assert!(registry.template("nope").is_none());
    }

    #[test]
    fn duplicate_service_names_are_rejected() {
        let raw = r#"
            [[templates]]
            id = "t"
            [[templates.services]]
            name = "web"
            command = "a"
            [[templates.services]]
            name = "web"
            command = "b"
        "#;
        assert!(Registry::parse(raw).is_err());
    }

    #[test]
    fn start_mode_precedence_is_request_then_template_then_plan() {
        let registry = Registry::parse(SAMPLE).unwrap();
        let template = registry.template("hive-dev").unwrap();
        assert_eq!(
            resolve_start_mode(Some(StartMode::Plan), template),
            StartMode::Plan
        );
        assert_eq!(resolve_start_mode(None, template), StartMode::Build);

        let bare = TemplateConfig {
            id: "bare".into(),
            name: None,
            setup: vec![],
            include: vec![],
            services: vec![],
            defaults: TemplateDefaults::default(),
        };
        assert_eq!(resolve_start_mode(None, &bare), StartMode::Plan);
    }
}
