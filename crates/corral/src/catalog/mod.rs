//! Declarative catalog model: server specs, runtime config, immutable
//! catalog snapshots with monotonic revisions.

mod diff;
mod fingerprint;
pub mod provider;

pub use diff::{CatalogDiff, PluginDiff, RuntimeDiff};
pub use fingerprint::spec_fingerprint;

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Deterministic fingerprint of the behavior-affecting fields of a spec.
/// Two specs with equal keys are interchangeable.
pub type SpecKey = ContentHash;

fn default_max_concurrent() -> u32 {
    4
}

fn default_idle_seconds() -> u64 {
    300
}

/// How a spec's warm pool reacts to reference-count transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationMode {
    /// Instances exist only while at least one client references the spec.
    #[default]
    OnDemand,
    /// Stay warm at the configured minimum even with zero references.
    AlwaysOn,
}

/// Child-process transport description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Streamable-HTTP transport description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Declarative description of one MCP server.
///
/// Exactly one of `command` / `http` is expected; catalog validation rejects
/// specs carrying both or neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub min_ready: u32,
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
    #[serde(default)]
    pub activation_mode: ActivationMode,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: None,
            http: None,
            env: BTreeMap::new(),
            cwd: None,
            tags: Vec::new(),
            max_concurrent: default_max_concurrent(),
            min_ready: 0,
            idle_seconds: default_idle_seconds(),
            activation_mode: ActivationMode::default(),
            disabled: false,
            protocol_version: None,
        }
    }
}

impl ServerSpec {
    pub fn spec_key(&self) -> SpecKey {
        spec_fingerprint(self)
    }

    /// Minimum ready instances to request on a 0→1 activation. Zero-configured
    /// specs still get one instance so the first call has something to route to.
    pub fn effective_min_ready(&self) -> u32 {
        self.min_ready.max(1)
    }

    pub fn always_on(&self) -> bool {
        self.activation_mode == ActivationMode::AlwaysOn
    }

    /// Structural validation, run when a catalog snapshot is built.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("spec has an empty name".into());
        }
        match (&self.command, &self.http) {
            (None, None) => Err(format!("server '{}' has neither command nor http", self.name)),
            (Some(_), Some(_)) => Err(format!("server '{}' has both command and http", self.name)),
            (Some(cmd), None) if cmd.command.is_empty() => {
                Err(format!("server '{}' has an empty command", self.name))
            }
            (None, Some(http)) if http.url.is_empty() => {
                Err(format!("server '{}' has an empty url", self.name))
            }
            _ => Ok(()),
        }
    }
}

/// Reload failure policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    /// Log the failure, keep serving the previous snapshot.
    #[default]
    Lenient,
    /// An apply failure is fatal to the process.
    Strict,
}

fn default_route_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    20
}

fn default_client_check_interval() -> u64 {
    5
}

fn default_client_inactive() -> u64 {
    30
}

fn default_tool_refresh() -> u64 {
    60
}

fn default_tool_refresh_concurrency() -> usize {
    4
}

fn default_idle_check_interval() -> u64 {
    30
}

/// Timeouts, intervals and limits shared by every subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default = "default_route_timeout")]
    pub route_timeout_seconds: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
    /// Heartbeat reap cadence; 0 disables the client monitor.
    #[serde(default = "default_client_check_interval")]
    pub client_check_interval_seconds: u64,
    #[serde(default = "default_client_inactive")]
    pub client_inactive_seconds: u64,
    /// Debounce tick for entity refresh; 0 disables timed refresh.
    #[serde(default = "default_tool_refresh")]
    pub tool_refresh_seconds: u64,
    #[serde(default = "default_tool_refresh_concurrency")]
    pub tool_refresh_concurrency: usize,
    /// Instance health-probe cadence; 0 disables the ping manager.
    #[serde(default)]
    pub ping_interval_seconds: u64,
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_seconds: u64,
    #[serde(default)]
    pub reload_mode: ReloadMode,
    #[serde(default)]
    pub default_activation_mode: ActivationMode,
    /// Route 0→1 activations through the bootstrap orchestrator.
    #[serde(default)]
    pub bootstrap_mode: bool,
    #[serde(default)]
    pub sub_agent_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            route_timeout_seconds: default_route_timeout(),
            handshake_timeout_seconds: default_handshake_timeout(),
            client_check_interval_seconds: default_client_check_interval(),
            client_inactive_seconds: default_client_inactive(),
            tool_refresh_seconds: default_tool_refresh(),
            tool_refresh_concurrency: default_tool_refresh_concurrency(),
            ping_interval_seconds: 0,
            idle_check_interval_seconds: default_idle_check_interval(),
            reload_mode: ReloadMode::default(),
            default_activation_mode: ActivationMode::default(),
            bootstrap_mode: false,
            sub_agent_enabled: false,
        }
    }
}

impl RuntimeConfig {
    pub fn route_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.route_timeout_seconds)
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.handshake_timeout_seconds)
    }
}

/// Out-of-process extension hooked into the reload pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginSpec {
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

/// The complete declarative state: all specs, runtime config, plugins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerSpec>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
}

impl Catalog {
    /// Parse a TOML catalog document, filling in spec names from map keys.
    pub fn from_toml(text: &str) -> Result<Self, crate::error::CoreError> {
        let mut catalog: Catalog = toml::from_str(text)
            .map_err(|e| crate::error::CoreError::InvalidArgument(format!("catalog: {e}")))?;
        for (name, spec) in catalog.servers.iter_mut() {
            if spec.name.is_empty() {
                spec.name = name.clone();
            }
        }
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<(), crate::error::CoreError> {
        for spec in self.servers.values() {
            spec.validate().map_err(crate::error::CoreError::InvalidArgument)?;
        }
        Ok(())
    }
}

/// Derived lookup tables for one catalog snapshot.
#[derive(Debug, Clone, Default)]
pub struct CatalogSummary {
    /// Enabled server name → spec key. Disabled specs are absent.
    pub server_spec_keys: BTreeMap<String, SpecKey>,
    /// Spec key → shared spec, for every enabled server.
    pub spec_registry: BTreeMap<SpecKey, Arc<ServerSpec>>,
    pub plugins: Vec<PluginSpec>,
    pub runtime: RuntimeConfig,
}

impl CatalogSummary {
    pub fn spec_for_key(&self, key: &SpecKey) -> Option<&Arc<ServerSpec>> {
        self.spec_registry.get(key)
    }

    pub fn server_name_for_key(&self, key: &SpecKey) -> Option<&str> {
        self.server_spec_keys
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(name, _)| name.as_str())
    }
}

/// Immutable catalog snapshot. A newer snapshot never has a smaller revision.
#[derive(Debug, Clone)]
pub struct CatalogState {
    pub catalog: Arc<Catalog>,
    pub revision: u64,
    pub created_at: Instant,
    pub summary: CatalogSummary,
}

impl CatalogState {
    pub fn new(catalog: Catalog, revision: u64) -> Self {
        let mut server_spec_keys = BTreeMap::new();
        let mut spec_registry = BTreeMap::new();
        for (name, spec) in &catalog.servers {
            if spec.disabled {
                continue;
            }
            let key = spec.spec_key();
            server_spec_keys.insert(name.clone(), key);
            spec_registry.insert(key, Arc::new(spec.clone()));
        }
        let summary = CatalogSummary {
            server_spec_keys,
            spec_registry,
            plugins: catalog.plugins.clone(),
            runtime: catalog.runtime.clone(),
        };
        Self {
            catalog: Arc::new(catalog),
            revision,
            created_at: Instant::now(),
            summary,
        }
    }

    /// An empty catalog at revision 0, the boot state before the provider
    /// delivers its first snapshot.
    pub fn empty() -> Self {
        Self::new(Catalog::default(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd_spec(name: &str) -> ServerSpec {
        ServerSpec {
            name: name.into(),
            command: Some(CommandSpec {
                command: "mcp-server".into(),
                args: vec![name.into()],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn toml_fills_names_from_keys() {
        let catalog = Catalog::from_toml(
            r#"
            [servers.git]
            command = { command = "uvx", args = ["mcp-server-git"] }
            tags = ["git"]

            [servers.docs]
            http = { url = "http://localhost:9000/mcp" }
            "#,
        )
        .unwrap();
        assert_eq!(catalog.servers["git"].name, "git");
        assert_eq!(catalog.servers["docs"].name, "docs");
        catalog.validate().unwrap();
    }

    #[test]
    fn validation_rejects_transportless_spec() {
        let spec = ServerSpec {
            name: "broken".into(),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn disabled_specs_are_absent_from_the_summary() {
        let mut disabled = cmd_spec("git");
        disabled.disabled = true;
        let mut servers = BTreeMap::new();
        servers.insert("git".to_string(), disabled);
        servers.insert("docker".to_string(), cmd_spec("docker"));
        let state = CatalogState::new(
            Catalog {
                servers,
                ..Default::default()
            },
            1,
        );
        assert!(!state.summary.server_spec_keys.contains_key("git"));
        assert!(state.summary.server_spec_keys.contains_key("docker"));
        assert_eq!(state.summary.spec_registry.len(), 1);
    }

    #[test]
    fn identical_catalogs_summarize_identically_across_revisions() {
        let mut servers = BTreeMap::new();
        servers.insert("git".to_string(), cmd_spec("git"));
        let catalog = Catalog {
            servers,
            ..Default::default()
        };
        let a = CatalogState::new(catalog.clone(), 1);
        let b = CatalogState::new(catalog, 7);
        assert_eq!(a.summary.server_spec_keys, b.summary.server_spec_keys);
        assert_eq!(
            a.summary.spec_registry.keys().collect::<Vec<_>>(),
            b.summary.spec_registry.keys().collect::<Vec<_>>()
        );
    }
}
