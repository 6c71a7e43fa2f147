//! Downstream session tracking.
//!
//! Every live downstream connection registers its server-side peer here,
//! keyed by a generated session id. A background notifier fans catalog
//! changes out to every registered peer as `tools/list_changed`; unreachable
//! peers are dropped on the way.

pub mod service;
pub mod smart;

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use rmcp::{Peer, RoleServer, ServiceError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    catalog::Catalog,
    groups::{self, RouteTarget},
    settings::Settings,
};

pub use service::HubService;

/// Public view of one session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub selector: Option<String>,
}

struct SessionEntry {
    selector: Option<String>,
    peer: Peer<RoleServer>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session's peer; returns the generated session id.
    pub fn register(&self, selector: Option<String>, peer: Peer<RoleServer>) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!(session = %session_id, selector = ?selector, "Session registered");
        self.sessions
            .insert(session_id.clone(), SessionEntry { selector, peer });
        session_id
    }

    pub fn remove(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!(session = %session_id, "Session removed");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|e| SessionInfo {
                session_id: e.key().clone(),
                selector: e.value().selector.clone(),
            })
            .collect()
    }

    /// Send `tools/list_changed` to every live session. Send failures are
    /// logged; sessions whose transport is gone are evicted.
    pub async fn notify_tools_changed(&self) {
        let targets: Vec<(String, Peer<RoleServer>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().peer.clone()))
            .collect();

        let sends = targets.into_iter().map(|(session_id, peer)| async move {
            if peer.is_transport_closed() {
                return Some(session_id);
            }
            match peer.notify_tool_list_changed().await {
                Ok(()) => None,
                Err(ServiceError::TransportSend(_)) | Err(ServiceError::TransportClosed) => {
                    warn!(session = %session_id, "Session unreachable, dropping");
                    Some(session_id)
                }
                Err(e) => {
                    warn!(session = %session_id, error = %e, "Failed to notify session");
                    None
                }
            }
        });

        for dead in join_all(sends).await.into_iter().flatten() {
            self.remove(&dead);
        }
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}

/// Forward catalog changes to live sessions.
///
/// Events within a short window coalesce into a single notification so a
/// reconcile burst reaches each session as one `tools/list_changed`.
pub fn spawn_notifier(registry: Arc<SessionRegistry>, catalog: Arc<Catalog>) -> JoinHandle<()> {
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    const COALESCE_WINDOW: std::time::Duration = std::time::Duration::from_millis(50);

    let mut rx = catalog.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    tokio::time::sleep(COALESCE_WINDOW).await;
                    loop {
                        match rx.try_recv() {
                            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                        }
                    }
                    debug!(sessions = registry.len(), "Broadcasting tools/list_changed");
                    registry.notify_tools_changed().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Downstream-visible endpoint name for a selector: the hub name alone for
/// the global route, `<hub>_<selector>` for a single server, and
/// `<hub>_<selector>_group` for a group.
pub fn endpoint_name(hub_name: &str, settings: &Settings, selector: Option<&str>) -> String {
    let Some(selector) = selector.filter(|s| !s.is_empty()) else {
        return hub_name.to_string();
    };
    if selector == smart::SMART_SELECTOR {
        return format!("{}_{}", hub_name, selector);
    }
    match groups::resolve_selector(settings, Some(selector)) {
        Ok(RouteTarget::Group(_)) => format!("{}_{}_group", hub_name, selector),
        _ => format!("{}_{}", hub_name, selector),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Group, ServerConfig};

    #[test]
    fn test_endpoint_name() {
        let mut settings = Settings::default();
        settings.mcp_servers.insert(
            "fetch".into(),
            ServerConfig {
                command: Some("uvx".into()),
                ..Default::default()
            },
        );
        settings.groups.push(Group {
            id: "gid".into(),
            name: "dev".into(),
            description: None,
            owner: None,
            servers: vec![],
        });

        assert_eq!(endpoint_name("mcphub", &settings, None), "mcphub");
        assert_eq!(endpoint_name("mcphub", &settings, Some("")), "mcphub");
        assert_eq!(
            endpoint_name("mcphub", &settings, Some("fetch")),
            "mcphub_fetch"
        );
        assert_eq!(
            endpoint_name("mcphub", &settings, Some("dev")),
            "mcphub_dev_group"
        );
        assert_eq!(
            endpoint_name("mcphub", &settings, Some("$smart")),
            "mcphub_$smart"
        );
    }

    #[test]
    fn test_registry_tracks_sessions() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());
        // Peer construction needs a live transport, so registration itself is
        // covered by the service tests; here we only check bookkeeping of the
        // empty registry.
        assert_eq!(registry.sessions().len(), 0);
        registry.clear();
        assert!(registry.is_empty());
    }
}
