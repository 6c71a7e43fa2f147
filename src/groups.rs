//! Group resolution and CRUD.
//!
//! A group selector is the path segment after `/sse/` or `/mcp/`. It resolves
//! to a group by id, then by name (when `enableGroupNameRoute` is on), then
//! falls back to a bare server name.

use std::sync::Arc;

use crate::{
    error::{HubError, HubResult},
    settings::{Group, GroupServerRef, Settings, SettingsStore, ToolsFilter},
};

/// What a selector resolves to.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// No selector: the whole catalog.
    Global,
    /// Selector matched a single server name.
    Server(String),
    /// Selector matched a group.
    Group(Group),
}

/// Resolve a selector against the current settings.
///
/// An empty selector requires `enableGlobalRoute`; otherwise resolution runs
/// id → name → server name and fails with `GroupNotFound` when nothing
/// matches.
pub fn resolve_selector(settings: &Settings, selector: Option<&str>) -> HubResult<RouteTarget> {
    let selector = selector.unwrap_or("").trim();
    if selector.is_empty() {
        if !settings.system_config.routing.enable_global_route {
            return Err(HubError::Forbidden("global route is disabled".into()));
        }
        return Ok(RouteTarget::Global);
    }

    if let Some(group) = settings.groups.iter().find(|g| g.id == selector) {
        return Ok(RouteTarget::Group(group.clone()));
    }

    if settings.system_config.routing.enable_group_name_route {
        if let Some(group) = settings.groups.iter().find(|g| g.name == selector) {
            return Ok(RouteTarget::Group(group.clone()));
        }
    }

    if settings.mcp_servers.contains_key(selector) {
        return Ok(RouteTarget::Server(selector.to_string()));
    }

    Err(HubError::GroupNotFound(selector.to_string()))
}

/// Group membership check used by the call path: does `server` belong to the
/// target, and does `local_name` pass its allow-list?
pub fn target_allows(target: &RouteTarget, server: &str, local_name: &str) -> bool {
    match target {
        RouteTarget::Global => true,
        RouteTarget::Server(name) => name == server,
        RouteTarget::Group(group) => group
            .servers
            .iter()
            .any(|r| r.name == server && r.allows(local_name)),
    }
}

/// Create a group. Fails if the name is taken.
pub async fn create_group(
    store: &Arc<SettingsStore>,
    name: String,
    description: Option<String>,
    servers: Vec<GroupServerRef>,
    owner: Option<String>,
) -> HubResult<Group> {
    let group = Group {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        description,
        owner,
        servers,
    };
    let created = group.clone();

    store
        .mutate(move |settings| {
            if settings.groups.iter().any(|g| g.name == group.name) {
                return Err(HubError::ConfigInvalid(format!(
                    "group name already exists: {}",
                    group.name
                )));
            }
            settings.groups.push(group);
            Ok(())
        })
        .await?;

    Ok(created)
}

/// Patch for a group update; `None` fields are left unchanged.
#[derive(Debug, Default, Clone)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub servers: Option<Vec<GroupServerRef>>,
}

/// Update a group by id. Validation failures leave the group unchanged.
pub async fn update_group(
    store: &Arc<SettingsStore>,
    id: &str,
    patch: GroupPatch,
) -> HubResult<Group> {
    let group_id = id.to_string();
    let closure_id = group_id.clone();

    let updated = store
        .mutate(move |settings| {
            if let Some(new_name) = &patch.name {
                if settings
                    .groups
                    .iter()
                    .any(|g| g.name == *new_name && g.id != closure_id)
                {
                    return Err(HubError::ConfigInvalid(format!(
                        "group name already exists: {}",
                        new_name
                    )));
                }
            }

            let group = settings
                .groups
                .iter_mut()
                .find(|g| g.id == closure_id)
                .ok_or_else(|| HubError::GroupNotFound(closure_id.clone()))?;

            if let Some(name) = patch.name {
                group.name = name;
            }
            if let Some(description) = patch.description {
                group.description = Some(description);
            }
            if let Some(servers) = patch.servers {
                group.servers = servers;
            }
            Ok(())
        })
        .await?;

    updated
        .groups
        .iter()
        .find(|g| g.id == group_id)
        .cloned()
        .ok_or(HubError::GroupNotFound(group_id))
}

/// Delete a group by id.
pub async fn delete_group(store: &Arc<SettingsStore>, id: &str) -> HubResult<()> {
    let id = id.to_string();
    store
        .mutate(move |settings| {
            let before = settings.groups.len();
            settings.groups.retain(|g| g.id != id);
            if settings.groups.len() == before {
                return Err(HubError::GroupNotFound(id.clone()));
            }
            Ok(())
        })
        .await?;
    Ok(())
}

/// Convenience for building allow-all refs from names.
pub fn refs_from_names(names: &[&str]) -> Vec<GroupServerRef> {
    names.iter().map(|n| GroupServerRef::all(*n)).collect()
}

/// Whether a group ref restricts tools at all.
pub fn is_restricted(filter: &ToolsFilter) -> bool {
    matches!(filter, ToolsFilter::Selected(_))
}
