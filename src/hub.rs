//! The hub: one value owning every subsystem.
//!
//! Wiring: settings changes reconcile the supervisor, supervisor results
//! land in the catalog, catalog changes re-index the search backend and
//! notify live sessions. Nothing here is global; the binary holds the one
//! `Arc<Hub>` and passes it to the HTTP layer.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    catalog::{Catalog, ServerStatus},
    error::HubResult,
    groups,
    index::{OpenAiEmbeddings, ToolIndex},
    session::{self, SessionRegistry},
    settings::{
        GroupServerRef, ServerConfig, SettingsEvent, SettingsStore, ToolOverride,
    },
    upstream::Supervisor,
};

const HUB_NAME: &str = "mcphub";

pub struct Hub {
    name: String,
    settings: Arc<SettingsStore>,
    catalog: Arc<Catalog>,
    index: Arc<ToolIndex>,
    supervisor: Arc<Supervisor>,
    sessions: Arc<SessionRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Build the hub from a settings store and start the initial connection
    /// fan-out. Returns once reconciliation is scheduled; individual servers
    /// connect in parallel in the background.
    pub async fn new(settings: Arc<SettingsStore>) -> HubResult<Arc<Self>> {
        let current = settings.current();

        let smart = &current.system_config.smart_routing;
        let index = if smart.enabled {
            smart.validate()?;
            info!("Smart routing enabled");
            Arc::new(ToolIndex::new(Arc::new(OpenAiEmbeddings::from_config(smart)?)))
        } else {
            Arc::new(ToolIndex::disabled())
        };

        let catalog = Arc::new(Catalog::new());
        let sessions = Arc::new(SessionRegistry::new());
        let (supervisor, refresh_rx) =
            Supervisor::new(Arc::clone(&settings), Arc::clone(&catalog), Arc::clone(&index));

        let hub = Arc::new(Self {
            name: HUB_NAME.to_string(),
            settings,
            catalog,
            index,
            supervisor,
            sessions,
            tasks: Mutex::new(Vec::new()),
        });

        let refresh_task = hub.supervisor.spawn_refresh_loop(refresh_rx);
        let notifier_task =
            session::spawn_notifier(Arc::clone(&hub.sessions), Arc::clone(&hub.catalog));
        let reconcile_task = spawn_reconciler(
            Arc::clone(&hub.settings),
            Arc::clone(&hub.supervisor),
            Arc::clone(&hub.catalog),
        );
        hub.tasks
            .lock()
            .extend([refresh_task, notifier_task, reconcile_task]);

        hub.supervisor.apply_settings().await;
        Ok(hub)
    }

    /// Bare hub for tests: no background tasks, no initial connect fan-out,
    /// caller-supplied index. Tests seed the catalog directly.
    #[cfg(test)]
    pub(crate) fn new_test(
        settings: crate::settings::Settings,
        index: Arc<ToolIndex>,
    ) -> Arc<Self> {
        let settings = Arc::new(SettingsStore::in_memory(settings));
        let catalog = Arc::new(Catalog::new());
        let sessions = Arc::new(SessionRegistry::new());
        let (supervisor, _refresh_rx) =
            Supervisor::new(Arc::clone(&settings), Arc::clone(&catalog), Arc::clone(&index));
        Arc::new(Self {
            name: HUB_NAME.to_string(),
            settings,
            catalog,
            index,
            supervisor,
            sessions,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn index(&self) -> &Arc<ToolIndex> {
        &self.index
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    // --- Server CRUD (drives supervisor reconciliation via events) ---

    pub async fn add_server(&self, name: String, config: ServerConfig) -> HubResult<()> {
        self.settings
            .mutate(move |settings| {
                if settings.mcp_servers.contains_key(&name) {
                    return Err(crate::error::HubError::ConfigInvalid(format!(
                        "server name already exists: {}",
                        name
                    )));
                }
                settings.mcp_servers.insert(name, config);
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn remove_server(&self, name: &str) -> HubResult<()> {
        let name = name.to_string();
        self.settings
            .mutate(move |settings| {
                settings
                    .mcp_servers
                    .remove(&name)
                    .map(|_| ())
                    .ok_or(crate::error::HubError::ServerNotFound(name))
            })
            .await?;
        Ok(())
    }

    pub async fn set_server_enabled(&self, name: &str, enabled: bool) -> HubResult<()> {
        let name = name.to_string();
        self.settings
            .mutate(move |settings| {
                let config = settings
                    .mcp_servers
                    .get_mut(&name)
                    .ok_or(crate::error::HubError::ServerNotFound(name))?;
                config.enabled = enabled;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Set a per-tool enable/description overlay.
    pub async fn set_tool_override(
        &self,
        server: &str,
        local_name: &str,
        tool_override: ToolOverride,
    ) -> HubResult<()> {
        let server = server.to_string();
        let local_name = local_name.to_string();
        self.settings
            .mutate(move |settings| {
                let config = settings
                    .mcp_servers
                    .get_mut(&server)
                    .ok_or(crate::error::HubError::ServerNotFound(server))?;
                config
                    .tools
                    .get_or_insert_with(Default::default)
                    .insert(local_name, tool_override);
                Ok(())
            })
            .await?;
        Ok(())
    }

    // --- Group CRUD ---

    pub async fn create_group(
        &self,
        name: String,
        description: Option<String>,
        servers: Vec<GroupServerRef>,
        owner: Option<String>,
    ) -> HubResult<crate::settings::Group> {
        groups::create_group(&self.settings, name, description, servers, owner).await
    }

    pub async fn update_group(
        &self,
        id: &str,
        patch: groups::GroupPatch,
    ) -> HubResult<crate::settings::Group> {
        groups::update_group(&self.settings, id, patch).await
    }

    pub async fn delete_group(&self, id: &str) -> HubResult<()> {
        groups::delete_group(&self.settings, id).await
    }

    /// Snapshot of runtime counts, logged at startup and shutdown.
    pub fn stats(&self) -> HubStats {
        let snapshots = self.catalog.snapshot();
        let mut stats = HubStats {
            servers: snapshots.len(),
            sessions: self.sessions.len(),
            ..Default::default()
        };
        for snapshot in snapshots {
            match snapshot.status {
                ServerStatus::Connecting => stats.connecting += 1,
                ServerStatus::Connected => stats.connected += 1,
                ServerStatus::Disconnected => stats.disconnected += 1,
            }
            stats.tools += snapshot.tools.len();
        }
        stats
    }

    /// Global cleanup: stop background tasks, close every adapter, clear
    /// sessions.
    pub async fn shutdown(&self) {
        info!(stats = ?self.stats(), "Shutting down hub");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.supervisor.shutdown().await;
        self.sessions.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub servers: usize,
    pub connecting: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub tools: usize,
    pub sessions: usize,
}

/// React to settings mutations: servers/groups changes reconcile and
/// re-notify; smart-routing changes need a restart to swap the index.
fn spawn_reconciler(
    settings: Arc<SettingsStore>,
    supervisor: Arc<Supervisor>,
    catalog: Arc<Catalog>,
) -> JoinHandle<()> {
    let mut rx = settings.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SettingsEvent::ServersChanged) => {
                    supervisor.apply_settings().await;
                }
                Ok(SettingsEvent::GroupsChanged) => {
                    // Group membership changes the visible set without
                    // touching connections.
                    catalog.notify_changed();
                }
                Ok(SettingsEvent::SystemConfigChanged) => {
                    warn!("System config changed; smart-routing changes apply after restart");
                    catalog.notify_changed();
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    supervisor.apply_settings().await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::settings::Settings;

    pub(crate) async fn test_hub(settings: Settings) -> Arc<Hub> {
        let store = Arc::new(SettingsStore::in_memory(settings));
        Hub::new(store).await.unwrap()
    }

    #[tokio::test]
    async fn test_hub_starts_empty() {
        let hub = test_hub(Settings::default()).await;
        let stats = hub.stats();
        assert_eq!(stats.servers, 0);
        assert_eq!(stats.sessions, 0);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_crud_round_trip() {
        let hub = test_hub(Settings::default()).await;

        hub.add_server(
            "echo".into(),
            ServerConfig {
                command: Some("definitely-not-a-real-binary".into()),
                enabled: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Duplicate rejected.
        let dup = hub
            .add_server("echo".into(), ServerConfig::default())
            .await;
        assert!(dup.is_err());

        hub.set_tool_override(
            "echo",
            "say",
            ToolOverride {
                enabled: false,
                description: Some("quiet".into()),
            },
        )
        .await
        .unwrap();

        let settings = hub.settings().current();
        let config = settings.mcp_servers.get("echo").unwrap();
        assert!(!config.tool_enabled("say"));
        assert_eq!(config.tool_description("say"), Some("quiet"));

        hub.remove_server("echo").await.unwrap();
        assert!(hub.remove_server("echo").await.is_err());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_smart_routing_requires_config() {
        let mut settings = Settings::default();
        settings.system_config.smart_routing.enabled = true;
        // Missing dbUrl/openaiApiKey: the store itself would reject this via
        // validate(), so construct the hub directly to check Hub::new's gate.
        let store = Arc::new(SettingsStore::in_memory(settings));
        assert!(Hub::new(store).await.is_err());
    }

    #[tokio::test]
    async fn test_group_crud_through_hub() {
        let hub = test_hub(Settings::default()).await;
        hub.add_server(
            "a".into(),
            ServerConfig {
                command: Some("npx".into()),
                enabled: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let group = hub
            .create_group("dev".into(), None, vec![GroupServerRef::all("a")], None)
            .await
            .unwrap();
        assert_eq!(hub.settings().current().groups.len(), 1);

        hub.delete_group(&group.id).await.unwrap();
        assert!(hub.settings().current().groups.is_empty());
        hub.shutdown().await;
    }
}
