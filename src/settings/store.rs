//! Settings persistence with atomic writes and change notification.

use std::{path::PathBuf, sync::Arc};

use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use super::Settings;
use crate::error::{HubError, HubResult};

/// Which part of the document a mutation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsEvent {
    ServersChanged,
    GroupsChanged,
    SystemConfigChanged,
}

/// Single-writer store for the settings document.
///
/// Readers take cheap snapshots; writers serialize through `mutate`, which
/// validates, persists atomically (write-to-temp + rename), and only then
/// swaps the in-memory document and emits change events. A failed write
/// leaves both the file and memory untouched.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Arc<Settings>>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<SettingsEvent>,
}

impl SettingsStore {
    const EVENT_CAPACITY: usize = 64;

    /// Load the document from disk. A missing file yields defaults; the file
    /// is created on the first mutation.
    pub async fn load(path: impl Into<PathBuf>) -> HubResult<Self> {
        let path = path.into();
        let settings = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let mut settings: Settings = serde_json::from_str(&content)
                    .map_err(|e| HubError::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
                settings.normalize();
                settings.validate()?;
                info!(path = %path.display(), servers = settings.mcp_servers.len(), "Loaded settings");
                settings
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Settings file not found, starting with defaults");
                Settings::default()
            }
            Err(e) => return Err(e.into()),
        };

        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(settings)),
            write_lock: Mutex::new(()),
            events,
        })
    }

    /// In-memory store for tests and embedding.
    pub fn in_memory(settings: Settings) -> Self {
        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(settings)),
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// Snapshot of the current document.
    pub fn current(&self) -> Arc<Settings> {
        Arc::clone(&self.current.read())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsEvent> {
        self.events.subscribe()
    }

    /// Read-modify-write under the exclusive writer lock.
    ///
    /// The closure edits a copy; the result is normalized and validated
    /// before anything is persisted, so readers never observe a torn or
    /// invalid document.
    pub async fn mutate<F>(&self, f: F) -> HubResult<Arc<Settings>>
    where
        F: FnOnce(&mut Settings) -> HubResult<()>,
    {
        let _guard = self.write_lock.lock().await;

        let previous = self.current();
        let mut next = (*previous).clone();
        f(&mut next)?;
        next.normalize();
        next.validate()?;

        self.persist(&next).await?;

        let next = Arc::new(next);
        *self.current.write() = Arc::clone(&next);

        for event in diff_events(&previous, &next) {
            // Send fails only when nobody subscribes, which is fine.
            let _ = self.events.send(event);
        }

        Ok(next)
    }

    async fn persist(&self, settings: &Settings) -> HubResult<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }

        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| HubError::PersistenceFailed(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content.as_bytes())
            .await
            .map_err(|e| HubError::PersistenceFailed(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| HubError::PersistenceFailed(format!("rename {}: {}", tmp.display(), e)))?;
        Ok(())
    }
}

fn diff_events(previous: &Settings, next: &Settings) -> Vec<SettingsEvent> {
    let mut events = Vec::new();
    if serde_json::to_value(&previous.mcp_servers).ok()
        != serde_json::to_value(&next.mcp_servers).ok()
    {
        events.push(SettingsEvent::ServersChanged);
    }
    if serde_json::to_value(&previous.groups).ok() != serde_json::to_value(&next.groups).ok() {
        events.push(SettingsEvent::GroupsChanged);
    }
    if serde_json::to_value(&previous.system_config).ok()
        != serde_json::to_value(&next.system_config).ok()
    {
        events.push(SettingsEvent::SystemConfigChanged);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ServerConfig, SmartRoutingConfig};

    fn stdio_server(command: &str) -> ServerConfig {
        ServerConfig {
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_load_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json"))
            .await
            .unwrap();
        assert!(store.current().mcp_servers.is_empty());
    }

    #[tokio::test]
    async fn test_mutate_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::load(&path).await.unwrap();
        store
            .mutate(|s| {
                s.mcp_servers.insert("fetch".into(), stdio_server("uvx"));
                Ok(())
            })
            .await
            .unwrap();

        // A fresh store sees the persisted state.
        let reloaded = SettingsStore::load(&path).await.unwrap();
        assert!(reloaded.current().mcp_servers.contains_key("fetch"));
    }

    #[tokio::test]
    async fn test_mutate_rejects_invalid_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::load(&path).await.unwrap();

        store
            .mutate(|s| {
                s.mcp_servers.insert("ok".into(), stdio_server("npx"));
                Ok(())
            })
            .await
            .unwrap();

        // Enabling smart routing without its required fields must fail
        // validation and leave the document untouched.
        let result = store
            .mutate(|s| {
                s.system_config.smart_routing = SmartRoutingConfig {
                    enabled: true,
                    ..Default::default()
                };
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(HubError::ConfigInvalid(_))));
        assert!(!store.current().system_config.smart_routing.enabled);

        let reloaded = SettingsStore::load(&path).await.unwrap();
        assert!(!reloaded.current().system_config.smart_routing.enabled);
    }

    #[tokio::test]
    async fn test_change_events_are_scoped() {
        let store = SettingsStore::in_memory(Settings::default());
        let mut rx = store.subscribe();

        store
            .mutate(|s| {
                s.mcp_servers.insert("a".into(), stdio_server("npx"));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), SettingsEvent::ServersChanged);
        assert!(rx.try_recv().is_err());

        store
            .mutate(|s| {
                s.system_config.routing.enable_bearer_auth = true;
                s.system_config.routing.bearer_auth_key = Some("k".into());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), SettingsEvent::SystemConfigChanged);
    }

    #[tokio::test]
    async fn test_group_refs_normalized_on_write() {
        let store = SettingsStore::in_memory(Settings::default());

        store
            .mutate(|s| {
                s.mcp_servers.insert("real".into(), stdio_server("npx"));
                s.groups.push(crate::settings::Group {
                    id: "g1".into(),
                    name: "dev".into(),
                    description: None,
                    owner: None,
                    servers: vec![
                        crate::settings::GroupServerRef::all("real"),
                        crate::settings::GroupServerRef::all("missing"),
                    ],
                });
                Ok(())
            })
            .await
            .unwrap();

        let settings = store.current();
        assert_eq!(settings.groups[0].servers.len(), 1);
        assert_eq!(settings.groups[0].servers[0].name, "real");
    }
}
