//! Merged tool catalog.
//!
//! Holds per-server runtime snapshots (status + declared tools) and produces
//! the downstream-visible tool list: server enable gate, group membership,
//! per-tool enable gate, group allow-lists, and description overlays, with
//! tools namespaced as `"<server>-<local>"`.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    error::HubResult,
    groups::{self, RouteTarget},
    settings::Settings,
};

pub type JsonObject = serde_json::Map<String, Value>;

/// A tool as declared by its upstream, under its local name.
#[derive(Debug, Clone)]
pub struct ToolDecl {
    pub local_name: String,
    pub description: Option<String>,
    pub input_schema: Arc<JsonObject>,
}

impl ToolDecl {
    /// Build from raw parts, stripping the `$schema` field on ingest.
    pub fn new(local_name: impl Into<String>, description: Option<String>, schema: JsonObject) -> Self {
        let mut schema = schema;
        schema.remove("$schema");
        Self {
            local_name: local_name.into(),
            description,
            input_schema: Arc::new(schema),
        }
    }

    pub fn from_rmcp(tool: &rmcp::model::Tool) -> Self {
        Self::new(
            tool.name.to_string(),
            tool.description.as_ref().map(|d| d.to_string()),
            tool.input_schema.as_ref().clone(),
        )
    }
}

/// A downstream-visible tool after filtering and overlay.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// Namespaced name, `"<server>-<local>"`.
    pub name: String,
    pub server: String,
    pub local_name: String,
    pub description: Option<String>,
    pub input_schema: Arc<JsonObject>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Connecting => "connecting",
            ServerStatus::Connected => "connected",
            ServerStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Runtime view of one upstream.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub name: String,
    pub status: ServerStatus,
    pub error: Option<String>,
    pub enabled: bool,
    pub tools: Vec<ToolDecl>,
    pub created_at: DateTime<Utc>,
}

/// Optional restriction imposed by the external auth layer.
#[derive(Debug, Clone, Default)]
pub struct ViewerScope {
    /// When set, only these servers are visible.
    pub servers: Option<std::collections::HashSet<String>>,
    /// When set, only these group ids/names are visible.
    pub groups: Option<std::collections::HashSet<String>>,
}

#[derive(Debug, Clone)]
pub enum CatalogEvent {
    ToolsChanged,
}

#[derive(Default)]
struct CatalogInner {
    /// Server declaration order, mirroring the settings document.
    order: Vec<String>,
    servers: HashMap<String, ServerSnapshot>,
}

/// Authoritative merged view of `{server -> [tools]}`.
///
/// Mutated only by the connection supervisor; read concurrently by sessions.
/// Every visible-set change fans out on a broadcast channel.
pub struct Catalog {
    inner: RwLock<CatalogInner>,
    changed: broadcast::Sender<CatalogEvent>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    const EVENT_CAPACITY: usize = 64;

    pub fn new() -> Self {
        let (changed, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Self {
            inner: RwLock::new(CatalogInner::default()),
            changed,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.changed.subscribe()
    }

    /// Announce a visible-set change to live sessions.
    pub fn notify_changed(&self) {
        let _ = self.changed.send(CatalogEvent::ToolsChanged);
    }

    /// Align server ordering with the settings document.
    pub fn set_order(&self, names: Vec<String>) {
        let mut inner = self.inner.write();
        // Servers not in the new order (about to be removed) keep a slot at
        // the end until eviction.
        let mut order = names;
        for existing in inner.order.clone() {
            if !order.contains(&existing) && inner.servers.contains_key(&existing) {
                order.push(existing);
            }
        }
        inner.order = order;
    }

    /// Create or update a server's status entry.
    pub fn upsert_status(
        &self,
        name: &str,
        status: ServerStatus,
        error: Option<String>,
        enabled: bool,
    ) {
        let mut notify = false;
        {
            let mut inner = self.inner.write();
            if !inner.order.iter().any(|n| n == name) {
                inner.order.push(name.to_string());
            }
            match inner.servers.get_mut(name) {
                Some(snapshot) => {
                    if snapshot.status != status || snapshot.enabled != enabled {
                        notify = true;
                    }
                    snapshot.status = status;
                    snapshot.error = error;
                    snapshot.enabled = enabled;
                }
                None => {
                    inner.servers.insert(
                        name.to_string(),
                        ServerSnapshot {
                            name: name.to_string(),
                            status,
                            error,
                            enabled,
                            tools: Vec::new(),
                            created_at: Utc::now(),
                        },
                    );
                    notify = true;
                }
            }
        }
        if notify {
            self.notify_changed();
        }
    }

    /// Replace a server's declared tools (declaration order preserved).
    pub fn set_tools(&self, name: &str, tools: Vec<ToolDecl>) {
        {
            let mut inner = self.inner.write();
            if let Some(snapshot) = inner.servers.get_mut(name) {
                debug!(server = %name, count = tools.len(), "Catalog tools updated");
                snapshot.tools = tools;
            }
        }
        self.notify_changed();
    }

    pub fn remove_server(&self, name: &str) {
        let removed = {
            let mut inner = self.inner.write();
            inner.order.retain(|n| n != name);
            inner.servers.remove(name).is_some()
        };
        if removed {
            self.notify_changed();
        }
    }

    pub fn status_of(&self, name: &str) -> Option<ServerStatus> {
        self.inner.read().servers.get(name).map(|s| s.status)
    }

    /// Ordered snapshots of every known server.
    pub fn snapshot(&self) -> Vec<ServerSnapshot> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.servers.get(name).cloned())
            .collect()
    }

    /// Names of servers that are enabled and connected, in catalog order.
    pub fn reachable_servers(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|s| s.enabled && s.status == ServerStatus::Connected)
            .map(|s| s.name)
            .collect()
    }

    /// The downstream-visible tool list for a selector (§4.5 pipeline).
    pub fn list_for_group(
        &self,
        settings: &Settings,
        selector: Option<&str>,
        viewer: Option<&ViewerScope>,
    ) -> HubResult<Vec<ToolInfo>> {
        let target = groups::resolve_selector(settings, selector)?;

        // Viewer scope may hide the whole group.
        if let (Some(scope), RouteTarget::Group(group)) = (viewer, &target) {
            if let Some(visible) = &scope.groups {
                if !visible.contains(&group.id) && !visible.contains(&group.name) {
                    return Ok(Vec::new());
                }
            }
        }

        let snapshots = self.snapshot();
        let (enabled, disabled): (Vec<_>, Vec<_>) =
            snapshots.into_iter().partition(|s| s.enabled);

        let mut out = Vec::new();
        for snapshot in enabled.into_iter().chain(disabled) {
            if let Some(scope) = viewer {
                if let Some(visible) = &scope.servers {
                    if !visible.contains(&snapshot.name) {
                        continue;
                    }
                }
            }

            let Some(config) = settings.mcp_servers.get(&snapshot.name) else {
                continue;
            };
            if !config.enabled || !snapshot.enabled {
                continue;
            }
            if snapshot.status != ServerStatus::Connected {
                continue;
            }

            let group_ref = match &target {
                RouteTarget::Global => None,
                RouteTarget::Server(name) => {
                    if *name != snapshot.name {
                        continue;
                    }
                    None
                }
                RouteTarget::Group(group) => {
                    match group.servers.iter().find(|r| r.name == snapshot.name) {
                        Some(r) => Some(r),
                        None => continue,
                    }
                }
            };

            for tool in &snapshot.tools {
                if !config.tool_enabled(&tool.local_name) {
                    continue;
                }
                if let Some(group_ref) = group_ref {
                    if !group_ref.allows(&tool.local_name) {
                        continue;
                    }
                }

                let description = config
                    .tool_description(&tool.local_name)
                    .map(|d| d.to_string())
                    .or_else(|| tool.description.clone());

                out.push(ToolInfo {
                    name: qualified_name(&snapshot.name, &tool.local_name),
                    server: snapshot.name.clone(),
                    local_name: tool.local_name.clone(),
                    description,
                    input_schema: Arc::clone(&tool.input_schema),
                    enabled: true,
                });
            }
        }

        Ok(out)
    }

    /// Effective tools for one server after enable gates and description
    /// overlays. This is what the similarity index sees.
    pub fn effective_tools(&self, settings: &Settings, server: &str) -> Vec<ToolInfo> {
        let inner = self.inner.read();
        let Some(snapshot) = inner.servers.get(server) else {
            return Vec::new();
        };
        let Some(config) = settings.mcp_servers.get(server) else {
            return Vec::new();
        };
        if !config.enabled {
            return Vec::new();
        }

        snapshot
            .tools
            .iter()
            .filter(|tool| config.tool_enabled(&tool.local_name))
            .map(|tool| ToolInfo {
                name: qualified_name(server, &tool.local_name),
                server: server.to_string(),
                local_name: tool.local_name.clone(),
                description: config
                    .tool_description(&tool.local_name)
                    .map(|d| d.to_string())
                    .or_else(|| tool.description.clone()),
                input_schema: Arc::clone(&tool.input_schema),
                enabled: true,
            })
            .collect()
    }

    /// Split a namespaced `"<server>-<local>"` name against known servers.
    ///
    /// Server names may themselves contain `-`, so match the longest known
    /// server prefix.
    pub fn resolve_qualified(&self, qualified: &str) -> Option<(String, String)> {
        let inner = self.inner.read();
        let mut best: Option<&str> = None;
        for name in inner.servers.keys() {
            if qualified.len() > name.len() + 1
                && qualified.starts_with(name.as_str())
                && qualified.as_bytes()[name.len()] == b'-'
                && best.map_or(true, |b| name.len() > b.len())
            {
                best = Some(name);
            }
        }
        best.map(|server| {
            (
                server.to_string(),
                qualified[server.len() + 1..].to_string(),
            )
        })
    }
}

pub fn qualified_name(server: &str, local: &str) -> String {
    format!("{}-{}", server, local)
}
