//! Settings document types.
//!
//! The hub is configured by a single JSON document: upstream server
//! definitions, groups, users, and system-wide routing/install/smart-routing
//! switches. Types here mirror the on-disk shape; [`store`] owns persistence
//! and change notification.

pub mod env;
pub mod store;

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HubError, HubResult};

pub use store::{SettingsEvent, SettingsStore};

/// Top-level settings document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Configured upstream servers, keyed by unique name.
    /// Declaration order is preserved and drives catalog ordering.
    #[serde(default)]
    pub mcp_servers: ServerMap,

    #[serde(default)]
    pub groups: Vec<Group>,

    /// Carried for document round-trip fidelity; authentication itself is
    /// handled outside the hub core.
    #[serde(default)]
    pub users: Vec<UserConfig>,

    #[serde(default)]
    pub system_config: SystemConfig,
}

impl Settings {
    /// Static validation applied before any mutation is persisted.
    pub fn validate(&self) -> HubResult<()> {
        for (name, config) in self.mcp_servers.iter() {
            config.validate(name)?;
        }

        let mut seen = std::collections::HashSet::new();
        for group in &self.groups {
            if group.name.is_empty() {
                return Err(HubError::ConfigInvalid("group name must not be empty".into()));
            }
            if !seen.insert(group.name.as_str()) {
                return Err(HubError::ConfigInvalid(format!(
                    "duplicate group name: {}",
                    group.name
                )));
            }
        }

        self.system_config.smart_routing.validate()?;
        Ok(())
    }

    /// Normalization applied on every write: bare-string group server refs
    /// are upgraded to full refs, and refs to unknown servers are dropped.
    pub fn normalize(&mut self) {
        let servers = &self.mcp_servers;
        for group in &mut self.groups {
            group
                .servers
                .retain(|server_ref| servers.contains_key(&server_ref.name));
        }
    }
}

/// Ordered map of server name to config.
///
/// The settings document stores servers as a JSON object; a plain `HashMap`
/// would lose declaration order, which the catalog exposes downstream, so
/// this wrapper keeps insertion order explicitly.
#[derive(Debug, Clone, Default)]
pub struct ServerMap {
    entries: Vec<(String, ServerConfig)>,
}

impl ServerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServerConfig> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert or replace, keeping the original position on replace.
    pub fn insert(&mut self, name: String, config: ServerConfig) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = config,
            None => self.entries.push((name, config)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ServerConfig> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        self.entries.iter().map(|(n, c)| (n, c))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ServerMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, config) in &self.entries {
            map.serialize_entry(name, config)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ServerMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::{MapAccess, Visitor};

        struct ServerMapVisitor;

        impl<'de> Visitor<'de> for ServerMapVisitor {
            type Value = ServerMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of server name to server config")
            }

            fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<Self::Value, M::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, config)) = map.next_entry::<String, ServerConfig>()? {
                    entries.push((name, config));
                }
                Ok(ServerMap { entries })
            }
        }

        deserializer.deserialize_map(ServerMapVisitor)
    }
}

/// Upstream transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerType {
    Stdio,
    Sse,
    StreamableHttp,
    Openapi,
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerType::Stdio => "stdio",
            ServerType::Sse => "sse",
            ServerType::StreamableHttp => "streamable-http",
            ServerType::Openapi => "openapi",
        };
        f.write_str(s)
    }
}

/// One configured upstream server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Explicit transport type. May be omitted; see [`ServerConfig::effective_type`].
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<ServerType>,

    // stdio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    // sse / streamable-http
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Keep-alive ping interval in milliseconds (SSE only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_interval: Option<u64>,

    // openapi
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openapi: Option<OpenApiConfig>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<RequestOptions>,

    /// Per-tool enable/description overlays, keyed by local tool name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<HashMap<String, ToolOverride>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_type: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            keep_alive_interval: None,
            openapi: None,
            enabled: true,
            owner: None,
            options: None,
            tools: None,
        }
    }
}

impl ServerConfig {
    /// Resolve the transport type, inferring it when `type` is omitted:
    /// openapi config wins, then a command means stdio, then a url means SSE.
    pub fn effective_type(&self) -> HubResult<ServerType> {
        if let Some(explicit) = self.server_type {
            return Ok(explicit);
        }
        if self.openapi.is_some() {
            return Ok(ServerType::Openapi);
        }
        if self.command.is_some() {
            return Ok(ServerType::Stdio);
        }
        if self.url.is_some() {
            return Ok(ServerType::Sse);
        }
        Err(HubError::ConfigInvalid(
            "server config has neither command, url, nor openapi".into(),
        ))
    }

    pub fn validate(&self, name: &str) -> HubResult<()> {
        if name.is_empty() {
            return Err(HubError::ConfigInvalid("server name must not be empty".into()));
        }
        let kind = self
            .effective_type()
            .map_err(|_| HubError::ConfigInvalid(format!("server '{}': no transport configured", name)))?;
        match kind {
            ServerType::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(HubError::ConfigInvalid(format!(
                        "server '{}': stdio requires a command",
                        name
                    )));
                }
            }
            ServerType::Sse | ServerType::StreamableHttp => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(HubError::ConfigInvalid(format!(
                        "server '{}': {} requires a url",
                        name, kind
                    )));
                }
            }
            ServerType::Openapi => {
                let openapi = self.openapi.as_ref().ok_or_else(|| {
                    HubError::ConfigInvalid(format!("server '{}': missing openapi config", name))
                })?;
                if openapi.url.is_none() && openapi.schema.is_none() {
                    return Err(HubError::ConfigInvalid(format!(
                        "server '{}': openapi requires a url or an inline schema",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Effective enable state for a local tool under this server's overlay.
    pub fn tool_enabled(&self, local_name: &str) -> bool {
        self.tools
            .as_ref()
            .and_then(|tools| tools.get(local_name))
            .map(|t| t.enabled)
            .unwrap_or(true)
    }

    /// Description override for a local tool, when configured.
    pub fn tool_description(&self, local_name: &str) -> Option<&str> {
        self.tools
            .as_ref()
            .and_then(|tools| tools.get(local_name))
            .and_then(|t| t.description.as_deref())
    }

    pub fn request_options(&self) -> RequestOptions {
        self.options.clone().unwrap_or_default()
    }
}

/// Per-tool overlay: hide the tool or replace its description.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverride {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for ToolOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            description: None,
        }
    }
}

/// Call budget options for one upstream.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    /// Call timeout in milliseconds. Default 60 000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Restart the timeout whenever the upstream reports progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_timeout_on_progress: Option<bool>,
    /// Absolute upper bound in milliseconds, regardless of progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_timeout: Option<u64>,
}

impl RequestOptions {
    pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.unwrap_or(Self::DEFAULT_TIMEOUT_MS)
    }
}

/// OpenAPI upstream definition: a spec source plus optional auth.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenApiConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<OpenApiSecurity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OpenApiSecurity {
    None,
    ApiKey {
        name: String,
        #[serde(rename = "in")]
        location: ApiKeyLocation,
        value: String,
    },
    Http {
        scheme: HttpAuthScheme,
        credentials: String,
    },
    Oauth2 {
        token: String,
    },
    OpenIdConnect {
        url: String,
        token: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    Header,
    Query,
    Cookie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpAuthScheme {
    Basic,
    Bearer,
    Digest,
}

/// Named grouping of servers with optional per-server tool allow-lists.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    #[serde(default = "new_group_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub servers: Vec<GroupServerRef>,
}

fn new_group_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Reference from a group to a server, with an optional tool allow-list.
///
/// Accepts either a bare server name or a full `{name, tools}` object; the
/// bare form normalizes to `{name, tools: "all"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupServerRef {
    pub name: String,
    #[serde(default)]
    pub tools: ToolsFilter,
}

impl GroupServerRef {
    pub fn all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: ToolsFilter::All,
        }
    }

    /// Whether a local tool passes this ref's allow-list.
    pub fn allows(&self, local_name: &str) -> bool {
        match &self.tools {
            ToolsFilter::All => true,
            ToolsFilter::Selected(names) => names.iter().any(|n| n == local_name),
        }
    }
}

impl<'de> Deserialize<'de> for GroupServerRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct FullRef {
            name: String,
            #[serde(default)]
            tools: ToolsFilter,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Full(FullRef),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Name(name) => GroupServerRef::all(name),
            Raw::Full(full) => GroupServerRef {
                name: full.name,
                tools: full.tools,
            },
        })
    }
}

/// `"all"` or an explicit list of local tool names.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ToolsFilter {
    #[default]
    All,
    Selected(Vec<String>),
}

impl Serialize for ToolsFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ToolsFilter::All => serializer.serialize_str("all"),
            ToolsFilter::Selected(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ToolsFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::{self, SeqAccess, Visitor};

        struct ToolsFilterVisitor;

        impl<'de> Visitor<'de> for ToolsFilterVisitor {
            type Value = ToolsFilter;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"all\" or a list of tool names")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                if v == "all" {
                    Ok(ToolsFilter::All)
                } else {
                    Err(E::unknown_variant(v, &["all"]))
                }
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut names = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(name) = seq.next_element::<String>()? {
                    names.push(name);
                }
                Ok(ToolsFilter::Selected(names))
            }
        }

        deserializer.deserialize_any(ToolsFilterVisitor)
    }
}

/// User entry; kept only so settings round-trip losslessly.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// System-wide switches.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub smart_routing: SmartRoutingConfig,
    /// Opaque router tuning section; carried for round-trip fidelity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_router: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default = "default_true")]
    pub enable_global_route: bool,
    #[serde(default = "default_true")]
    pub enable_group_name_route: bool,
    #[serde(default)]
    pub enable_bearer_auth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_auth_key: Option<String>,
    #[serde(default)]
    pub skip_auth: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enable_global_route: true,
            enable_group_name_route: true,
            enable_bearer_auth: false,
            bearer_auth_key: None,
            skip_auth: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_index_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npm_registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartRoutingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_embedding_model: Option<String>,
}

impl SmartRoutingConfig {
    pub fn validate(&self) -> HubResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.db_url.as_deref().unwrap_or("").is_empty() {
            return Err(HubError::ConfigInvalid(
                "smartRouting.dbUrl is required when smart routing is enabled".into(),
            ));
        }
        if self.openai_api_key.as_deref().unwrap_or("").is_empty() {
            return Err(HubError::ConfigInvalid(
                "smartRouting.openaiApiKey is required when smart routing is enabled".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_stdio_server() {
        let json = r#"{
            "mcpServers": {
                "fetch": { "command": "uvx", "args": ["mcp-server-fetch"] }
            }
        }"#;

        let settings: Settings = serde_json::from_str(json).expect("parse settings");
        assert_eq!(settings.mcp_servers.len(), 1);

        let server = settings.mcp_servers.get("fetch").unwrap();
        assert_eq!(server.effective_type().unwrap(), ServerType::Stdio);
        assert!(server.enabled);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_server_map_preserves_order() {
        let json = r#"{
            "zeta": { "url": "http://localhost:1/sse" },
            "alpha": { "url": "http://localhost:2/sse" },
            "mid": { "command": "npx" }
        }"#;

        let map: ServerMap = serde_json::from_str(json).expect("parse map");
        assert_eq!(map.names(), vec!["zeta", "alpha", "mid"]);

        // Round-trip keeps order.
        let out = serde_json::to_string(&map).unwrap();
        let reparsed: ServerMap = serde_json::from_str(&out).unwrap();
        assert_eq!(reparsed.names(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_type_inference() {
        let url_only: ServerConfig =
            serde_json::from_str(r#"{ "url": "http://localhost:3000/sse" }"#).unwrap();
        assert_eq!(url_only.effective_type().unwrap(), ServerType::Sse);

        let explicit: ServerConfig = serde_json::from_str(
            r#"{ "type": "streamable-http", "url": "http://localhost:3000/mcp" }"#,
        )
        .unwrap();
        assert_eq!(explicit.effective_type().unwrap(), ServerType::StreamableHttp);

        let openapi: ServerConfig =
            serde_json::from_str(r#"{ "openapi": { "url": "http://localhost/spec.json" } }"#)
                .unwrap();
        assert_eq!(openapi.effective_type().unwrap(), ServerType::Openapi);

        let empty: ServerConfig = serde_json::from_str(r#"{}"#).unwrap();
        assert!(empty.effective_type().is_err());
    }

    #[test]
    fn test_tool_overrides() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "command": "npx",
                "tools": {
                    "a1": { "enabled": false, "description": "X" },
                    "a2": { "description": "Y" }
                }
            }"#,
        )
        .unwrap();

        assert!(!config.tool_enabled("a1"));
        assert!(config.tool_enabled("a2"));
        assert!(config.tool_enabled("unlisted"));
        assert_eq!(config.tool_description("a1"), Some("X"));
        assert_eq!(config.tool_description("a2"), Some("Y"));
        assert_eq!(config.tool_description("unlisted"), None);
    }

    #[test]
    fn test_group_server_ref_bare_string() {
        let group: Group = serde_json::from_str(
            r#"{ "name": "dev", "servers": ["fetch", { "name": "time", "tools": ["now"] }] }"#,
        )
        .unwrap();

        assert_eq!(group.servers.len(), 2);
        assert_eq!(group.servers[0], GroupServerRef::all("fetch"));
        assert_eq!(group.servers[1].name, "time");
        assert!(group.servers[1].allows("now"));
        assert!(!group.servers[1].allows("other"));
        assert!(!group.id.is_empty());
    }

    #[test]
    fn test_tools_filter_serde() {
        let all: ToolsFilter = serde_json::from_str(r#""all""#).unwrap();
        assert_eq!(all, ToolsFilter::All);
        assert_eq!(serde_json::to_string(&all).unwrap(), r#""all""#);

        let selected: ToolsFilter = serde_json::from_str(r#"["a1", "a2"]"#).unwrap();
        assert_eq!(
            selected,
            ToolsFilter::Selected(vec!["a1".into(), "a2".into()])
        );
        assert_eq!(serde_json::to_string(&selected).unwrap(), r#"["a1","a2"]"#);

        assert!(serde_json::from_str::<ToolsFilter>(r#""some""#).is_err());
    }

    #[test]
    fn test_normalize_drops_unknown_servers() {
        let mut settings: Settings = serde_json::from_str(
            r#"{
                "mcpServers": { "real": { "command": "npx" } },
                "groups": [{ "name": "g", "servers": ["real", "ghost"] }]
            }"#,
        )
        .unwrap();

        settings.normalize();
        assert_eq!(settings.groups[0].servers.len(), 1);
        assert_eq!(settings.groups[0].servers[0].name, "real");
    }

    #[test]
    fn test_duplicate_group_name_rejected() {
        let settings: Settings = serde_json::from_str(
            r#"{ "groups": [{ "name": "g", "servers": [] }, { "name": "g", "servers": [] }] }"#,
        )
        .unwrap();
        assert!(matches!(
            settings.validate(),
            Err(HubError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_smart_routing_validation() {
        let disabled = SmartRoutingConfig::default();
        assert!(disabled.validate().is_ok());

        let incomplete = SmartRoutingConfig {
            enabled: true,
            db_url: Some("postgres://localhost/hub".into()),
            ..Default::default()
        };
        assert!(incomplete.validate().is_err());

        let complete = SmartRoutingConfig {
            enabled: true,
            db_url: Some("postgres://localhost/hub".into()),
            openai_api_key: Some("sk-test".into()),
            ..Default::default()
        };
        assert!(complete.validate().is_ok());
    }

    #[test]
    fn test_openapi_security_serde() {
        let api_key: OpenApiSecurity = serde_json::from_str(
            r#"{ "type": "apiKey", "name": "X-API-Key", "in": "header", "value": "secret" }"#,
        )
        .unwrap();
        assert_eq!(
            api_key,
            OpenApiSecurity::ApiKey {
                name: "X-API-Key".into(),
                location: ApiKeyLocation::Header,
                value: "secret".into(),
            }
        );

        let bearer: OpenApiSecurity = serde_json::from_str(
            r#"{ "type": "http", "scheme": "bearer", "credentials": "tok" }"#,
        )
        .unwrap();
        assert_eq!(
            bearer,
            OpenApiSecurity::Http {
                scheme: HttpAuthScheme::Bearer,
                credentials: "tok".into(),
            }
        );
    }

    #[test]
    fn test_routing_defaults() {
        let routing = RoutingConfig::default();
        assert!(routing.enable_global_route);
        assert!(routing.enable_group_name_route);
        assert!(!routing.enable_bearer_auth);
        assert!(!routing.skip_auth);
    }

    #[test]
    fn test_request_options_defaults() {
        let opts = RequestOptions::default();
        assert_eq!(opts.timeout_ms(), 60_000);

        let opts: RequestOptions =
            serde_json::from_str(r#"{ "timeout": 5000, "resetTimeoutOnProgress": true }"#).unwrap();
        assert_eq!(opts.timeout_ms(), 5000);
        assert_eq!(opts.reset_timeout_on_progress, Some(true));
    }
}
