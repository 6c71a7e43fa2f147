//! Connection supervisor.
//!
//! Drives every enabled server through connect / keep-alive / reconnect /
//! close, reconciling the runtime table against the settings document.
//! Connect and reconnect for one server serialize through that server's
//! mutex; different servers proceed in parallel.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::RwLock;
use rmcp::model::CallToolResult;
use serde_json::Value;
use tokio::{
    sync::{mpsc, Mutex, Notify},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{HubClientHandler, RefreshRequest, UpstreamClient};
use crate::{
    catalog::{Catalog, JsonObject, ServerStatus},
    error::{HubError, HubResult},
    index::ToolIndex,
    settings::{RequestOptions, ServerConfig, ServerType, SettingsStore},
};

/// Timeout for the very first initialization pass.
const INIT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

struct ServerRuntime {
    /// Config the connection was built from; compared on reconcile.
    config: RwLock<ServerConfig>,
    /// Serializes connect/reconnect. Calls clone the Arc out briefly, so a
    /// pending call sees either the old or the new client, never a torn one.
    conn: Mutex<Option<Arc<UpstreamClient>>>,
    /// Woken on upstream progress notifications.
    progress: Arc<Notify>,
    /// Cancelled on disable/removal; fails in-flight calls fast.
    cancel: CancellationToken,
    keepalive: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ServerRuntime {
    fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            conn: Mutex::new(None),
            progress: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            keepalive: parking_lot::Mutex::new(None),
        })
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
    }
}

pub struct Supervisor {
    servers: DashMap<String, Arc<ServerRuntime>>,
    settings: Arc<SettingsStore>,
    catalog: Arc<Catalog>,
    index: Arc<ToolIndex>,
    refresh_tx: mpsc::Sender<RefreshRequest>,
    first_init: AtomicBool,
}

impl Supervisor {
    const REFRESH_CAPACITY: usize = 100;

    pub fn new(
        settings: Arc<SettingsStore>,
        catalog: Arc<Catalog>,
        index: Arc<ToolIndex>,
    ) -> (Arc<Self>, mpsc::Receiver<RefreshRequest>) {
        let (refresh_tx, refresh_rx) = mpsc::channel(Self::REFRESH_CAPACITY);
        let supervisor = Arc::new(Self {
            servers: DashMap::new(),
            settings,
            catalog,
            index,
            refresh_tx,
            first_init: AtomicBool::new(true),
        });
        (supervisor, refresh_rx)
    }

    /// Consume upstream-initiated refresh requests.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<RefreshRequest>,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                supervisor.refresh_server_tools(&request.server).await;
            }
        })
    }

    /// Reconcile the runtime table against the current settings: close
    /// removed/disabled servers, connect new/enabled ones, rebuild changed
    /// ones, and refresh overlays for the rest.
    pub async fn apply_settings(self: &Arc<Self>) {
        let settings = self.settings.current();
        let names = settings.mcp_servers.names();
        self.catalog.set_order(names.clone());

        let stale: Vec<String> = self
            .servers
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| !settings.mcp_servers.contains_key(name))
            .collect();
        for name in stale {
            self.remove_server(&name).await;
        }

        let mut overlays_changed = false;
        for (name, config) in settings.mcp_servers.iter() {
            let existing = self.servers.get(name).map(|e| Arc::clone(e.value()));
            match existing {
                None => {
                    if config.enabled {
                        self.spawn_connect(name.clone());
                    } else {
                        self.catalog
                            .upsert_status(name, ServerStatus::Disconnected, None, false);
                    }
                }
                Some(runtime) => {
                    if !config.enabled {
                        self.disable_server(name).await;
                        continue;
                    }
                    let (transport_changed, overlay_changed) = {
                        let current = runtime.config.read();
                        (
                            connection_fingerprint(&current) != connection_fingerprint(config),
                            serde_json::to_value(&*current).ok()
                                != serde_json::to_value(config).ok(),
                        )
                    };
                    if transport_changed {
                        info!(server = %name, "Server config changed, rebuilding connection");
                        self.remove_server(name).await;
                        self.spawn_connect(name.clone());
                    } else if overlay_changed {
                        // Overlay-only change: re-publish effective tools.
                        *runtime.config.write() = config.clone();
                        self.reindex_effective(name).await;
                        overlays_changed = true;
                    }
                }
            }
        }
        if overlays_changed {
            self.catalog.notify_changed();
        }

        // Rebuilt servers were evicted and re-added above; restore the
        // document ordering.
        self.catalog.set_order(names);

        self.first_init.store(false, Ordering::SeqCst);
    }

    fn spawn_connect(self: &Arc<Self>, name: String) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.connect_server(&name).await;
        });
    }

    async fn connect_server(self: &Arc<Self>, name: &str) {
        let settings = self.settings.current();
        let Some(config) = settings.mcp_servers.get(name).cloned() else {
            return;
        };
        if !config.enabled {
            return;
        }

        let runtime = self
            .servers
            .entry(name.to_string())
            .or_insert_with(|| ServerRuntime::new(config.clone()))
            .clone();
        *runtime.config.write() = config.clone();

        let mut conn = runtime.conn.lock().await;
        if conn.is_some() || runtime.cancel.is_cancelled() {
            return;
        }

        self.catalog
            .upsert_status(name, ServerStatus::Connecting, None, true);

        let handler = HubClientHandler::new(name, Arc::clone(&runtime.progress))
            .with_refresh_channel(self.refresh_tx.clone());
        let budget = self.connect_timeout(&config);

        let connected = tokio::time::timeout(
            budget,
            UpstreamClient::connect(name, &config, &settings.system_config.install, handler),
        )
        .await
        .unwrap_or_else(|_| Err(HubError::Timeout(budget)));

        let client = match connected {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!(server = %name, error = %e, "Failed to connect");
                self.catalog
                    .upsert_status(name, ServerStatus::Disconnected, Some(e.to_string()), true);
                return;
            }
        };

        // The server may have been disabled or removed while the connect was
        // in flight; do not resurrect it.
        if runtime.cancel.is_cancelled() {
            drop(conn);
            close_client(name, client).await;
            return;
        }

        *conn = Some(Arc::clone(&client));
        drop(conn);

        self.catalog
            .upsert_status(name, ServerStatus::Connected, None, true);

        match client.list_tools(name).await {
            Ok(tools) => {
                info!(server = %name, count = tools.len(), "Discovered tools");
                self.catalog.set_tools(name, tools);
                self.reindex_effective(name).await;
            }
            Err(e) => {
                warn!(server = %name, error = %e, "Failed to list tools after connect");
            }
        }

        if client.kind() == ServerType::Sse {
            self.spawn_keepalive(name, &runtime, &config);
        }
    }

    /// Periodic keep-alive probe for SSE upstreams. A failed probe logs a
    /// warning and nothing else; a broken connection surfaces on the next
    /// call.
    fn spawn_keepalive(self: &Arc<Self>, name: &str, runtime: &Arc<ServerRuntime>, config: &ServerConfig) {
        runtime.stop_keepalive();

        let interval = config
            .keep_alive_interval
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_KEEP_ALIVE);
        let name = name.to_string();
        let runtime_ref = Arc::clone(runtime);
        let cancel = runtime.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let client = runtime_ref.conn.lock().await.clone();
                let Some(client) = client else { continue };
                if let Err(e) = client.ping(&name).await {
                    warn!(server = %name, error = %e, "Keep-alive ping failed");
                }
            }
        });

        *runtime.keepalive.lock() = Some(handle);
    }

    /// Close the connection but keep the server configured (disabled).
    pub async fn disable_server(&self, name: &str) {
        let Some((_, runtime)) = self.servers.remove(name) else {
            self.catalog
                .upsert_status(name, ServerStatus::Disconnected, None, false);
            return;
        };
        info!(server = %name, "Disabling server");
        runtime.cancel.cancel();
        runtime.stop_keepalive();
        if let Some(client) = runtime.conn.lock().await.take() {
            close_client(name, client).await;
        }
        self.index.remove_server(name);
        self.catalog
            .upsert_status(name, ServerStatus::Disconnected, None, false);
    }

    /// Close the connection and evict the server entirely.
    pub async fn remove_server(&self, name: &str) {
        if let Some((_, runtime)) = self.servers.remove(name) {
            info!(server = %name, "Removing server");
            runtime.cancel.cancel();
            runtime.stop_keepalive();
            if let Some(client) = runtime.conn.lock().await.take() {
                close_client(name, client).await;
            }
        }
        self.index.remove_server(name);
        self.catalog.remove_server(name);
    }

    /// Re-list one server's tools (upstream-initiated refresh). Failures log
    /// and leave the previous tool list standing.
    pub async fn refresh_server_tools(&self, name: &str) {
        let Some(runtime) = self.servers.get(name).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let client = runtime.conn.lock().await.clone();
        let Some(client) = client else { return };

        match client.list_tools(name).await {
            Ok(tools) => {
                debug!(server = %name, count = tools.len(), "Refreshed tools");
                self.catalog.set_tools(name, tools);
                self.reindex_effective(name).await;
            }
            Err(e) => warn!(server = %name, error = %e, "Tool refresh failed"),
        }
    }

    /// Route a call to the owning upstream, honoring the server's call
    /// budget. A transport-level 4xx from a streamable-HTTP upstream takes
    /// the in-band reconnect path and retries exactly once.
    pub async fn call_tool(
        self: &Arc<Self>,
        server: &str,
        local_name: &str,
        arguments: Option<JsonObject>,
    ) -> HubResult<CallToolResult> {
        let runtime = self
            .servers
            .get(server)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| HubError::ServerNotFound(server.to_string()))?;

        let client = runtime
            .conn
            .lock()
            .await
            .clone()
            .ok_or_else(|| HubError::call_failed(server, "server is not connected"))?;

        let options = runtime.config.read().request_options();
        let result = call_with_budget(
            server,
            client.call_tool(server, local_name, arguments.clone()),
            &options,
            &runtime.progress,
            &runtime.cancel,
        )
        .await;

        match result {
            Err(e) if reconnect_eligible(client.kind(), &e) => {
                warn!(server = %server, error = %e, "Transport-level 4xx, rebuilding connection");
                self.reconnect_and_retry(server, &runtime, local_name, arguments, &options)
                    .await
            }
            other => other,
        }
    }

    /// In-band reconnect: tear down the client, rebuild it from the current
    /// config, refresh the tool list, then retry the original call once.
    async fn reconnect_and_retry(
        self: &Arc<Self>,
        server: &str,
        runtime: &Arc<ServerRuntime>,
        local_name: &str,
        arguments: Option<JsonObject>,
        options: &RequestOptions,
    ) -> HubResult<CallToolResult> {
        let settings = self.settings.current();
        let config = runtime.config.read().clone();

        let mut conn = runtime.conn.lock().await;
        if let Some(old) = conn.take() {
            close_client(server, old).await;
        }
        self.catalog
            .upsert_status(server, ServerStatus::Connecting, None, true);

        let handler = HubClientHandler::new(server, Arc::clone(&runtime.progress))
            .with_refresh_channel(self.refresh_tx.clone());
        let budget = Duration::from_millis(options.timeout_ms());

        let reconnected = tokio::time::timeout(
            budget,
            UpstreamClient::connect(server, &config, &settings.system_config.install, handler),
        )
        .await
        .unwrap_or_else(|_| Err(HubError::Timeout(budget)));

        let client = match reconnected {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!(server = %server, error = %e, "Reconnect failed");
                self.catalog.upsert_status(
                    server,
                    ServerStatus::Disconnected,
                    Some(e.to_string()),
                    true,
                );
                return Err(e);
            }
        };

        *conn = Some(Arc::clone(&client));
        drop(conn);
        self.catalog
            .upsert_status(server, ServerStatus::Connected, None, true);

        // Refresh the tool list on the new connection; a failure here is
        // logged but does not tear the fresh connection down.
        match client.list_tools(server).await {
            Ok(tools) => {
                self.catalog.set_tools(server, tools);
                self.reindex_effective(server).await;
            }
            Err(e) => warn!(server = %server, error = %e, "Tool refresh after reconnect failed"),
        }

        info!(server = %server, "Reconnected, retrying call once");
        call_with_budget(
            server,
            client.call_tool(server, local_name, arguments),
            options,
            &runtime.progress,
            &runtime.cancel,
        )
        .await
    }

    async fn reindex_effective(&self, name: &str) {
        let settings = self.settings.current();
        let tools = self.catalog.effective_tools(&settings, name);
        self.index.index_server(name, &tools).await;
    }

    fn connect_timeout(&self, config: &ServerConfig) -> Duration {
        if self.first_init.load(Ordering::SeqCst) {
            INIT_TIMEOUT
        } else {
            Duration::from_millis(config.request_options().timeout_ms())
        }
    }

    /// Whether a server currently holds a live connection.
    pub async fn is_connected(&self, name: &str) -> bool {
        match self.servers.get(name).map(|e| Arc::clone(e.value())) {
            Some(runtime) => runtime.conn.lock().await.is_some(),
            None => false,
        }
    }

    /// Close every adapter and clear the table. Used on hub shutdown.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, runtime)) = self.servers.remove(&name) {
                runtime.cancel.cancel();
                runtime.stop_keepalive();
                if let Some(client) = runtime.conn.lock().await.take() {
                    close_client(&name, client).await;
                }
            }
        }
        info!("All upstream connections closed");
    }
}

async fn close_client(name: &str, client: Arc<UpstreamClient>) {
    match Arc::try_unwrap(client) {
        Ok(client) => client.close(name).await,
        Err(_) => {
            // In-flight calls still hold the old client; they fail on the
            // cancelled token and the transport closes on the last drop.
            warn!(server = %name, "Upstream client still referenced at close");
        }
    }
}

fn reconnect_eligible(kind: ServerType, error: &HubError) -> bool {
    kind == ServerType::StreamableHttp && error.is_reconnect_candidate()
}

/// Fields whose change requires rebuilding the connection (as opposed to
/// overlay fields, which only recompute the catalog).
fn connection_fingerprint(config: &ServerConfig) -> Value {
    serde_json::json!({
        "type": config.server_type,
        "command": config.command,
        "args": config.args,
        "env": config.env,
        "url": config.url,
        "headers": config.headers,
        "keepAliveInterval": config.keep_alive_interval,
        "openapi": config.openapi,
        "enabled": config.enabled,
    })
}

/// Await a call under the server's budget: base timeout, optional reset on
/// progress, and an absolute cap. Cancellation of the server token fails the
/// call with `SERVER_REMOVED`.
async fn call_with_budget<F>(
    server: &str,
    fut: F,
    options: &RequestOptions,
    progress: &Notify,
    cancel: &CancellationToken,
) -> HubResult<CallToolResult>
where
    F: std::future::Future<Output = HubResult<CallToolResult>>,
{
    let timeout = Duration::from_millis(options.timeout_ms());
    let reset_on_progress = options.reset_timeout_on_progress.unwrap_or(false);
    let hard_cap = options.max_total_timeout.map(Duration::from_millis);

    let start = Instant::now();
    let cap_deadline = hard_cap.map(|cap| start + cap);
    let mut deadline = start + timeout;
    if let Some(cap) = cap_deadline {
        deadline = deadline.min(cap);
    }

    tokio::pin!(fut);
    loop {
        tokio::select! {
            result = &mut fut => return result,
            _ = cancel.cancelled() => return Err(HubError::ServerRemoved(server.to_string())),
            _ = progress.notified(), if reset_on_progress => {
                let mut next = Instant::now() + timeout;
                if let Some(cap) = cap_deadline {
                    next = next.min(cap);
                }
                deadline = next;
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(HubError::Timeout(start.elapsed()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn success_result() -> CallToolResult {
        CallToolResult {
            content: vec![rmcp::model::Content::text("ok")],
            structured_content: None,
            is_error: Some(false),
            meta: None,
        }
    }

    fn budget(timeout_ms: u64, reset: bool, cap_ms: Option<u64>) -> RequestOptions {
        RequestOptions {
            timeout: Some(timeout_ms),
            reset_timeout_on_progress: Some(reset),
            max_total_timeout: cap_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_times_out() {
        let progress = Notify::new();
        let cancel = CancellationToken::new();
        let result = call_with_budget(
            "s",
            std::future::pending(),
            &budget(1_000, false, None),
            &progress,
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(HubError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_budget_passes_result_through() {
        let progress = Notify::new();
        let cancel = CancellationToken::new();
        let result = call_with_budget(
            "s",
            async { Ok(success_result()) },
            &budget(1_000, false, None),
            &progress,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(result.is_error, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_timer() {
        let progress = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        // Pinger fires every 800ms; with a 1s timeout that resets on
        // progress, the 2.5s worker should complete.
        let pinger = Arc::clone(&progress);
        let ping_task = tokio::spawn(async move {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_millis(800)).await;
                pinger.notify_waiters();
            }
        });

        let result = call_with_budget(
            "s",
            async {
                tokio::time::sleep(Duration::from_millis(2_500)).await;
                Ok(success_result())
            },
            &budget(1_000, true, None),
            &progress,
            &cancel,
        )
        .await;
        ping_task.abort();
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_total_caps_despite_progress() {
        let progress = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let pinger = Arc::clone(&progress);
        let ping_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                pinger.notify_waiters();
            }
        });

        let result = call_with_budget(
            "s",
            std::future::pending(),
            &budget(1_000, true, Some(3_000)),
            &progress,
            &cancel,
        )
        .await;
        ping_task.abort();
        assert!(matches!(result, Err(HubError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancel_fails_with_server_removed() {
        let progress = Notify::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = call_with_budget(
            "gone",
            std::future::pending(),
            &budget(60_000, false, None),
            &progress,
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(HubError::ServerRemoved(name)) if name == "gone"));
    }

    #[test]
    fn test_reconnect_eligibility() {
        let forty_one = HubError::call_failed("h", "HTTP status client error (401 Unauthorized)");
        assert!(reconnect_eligible(ServerType::StreamableHttp, &forty_one));
        assert!(!reconnect_eligible(ServerType::Sse, &forty_one));
        assert!(!reconnect_eligible(ServerType::Stdio, &forty_one));

        let five_hundred = HubError::call_failed("h", "HTTP 500 upstream exploded");
        assert!(!reconnect_eligible(ServerType::StreamableHttp, &five_hundred));
    }

    #[test]
    fn test_connection_fingerprint_ignores_overlays() {
        let mut a = ServerConfig {
            url: Some("http://localhost:3000/mcp".into()),
            server_type: Some(ServerType::StreamableHttp),
            ..Default::default()
        };
        let mut b = a.clone();

        // Tool overlays and options do not require a rebuild.
        b.tools = Some(std::collections::HashMap::from([(
            "t".to_string(),
            crate::settings::ToolOverride {
                enabled: false,
                description: None,
            },
        )]));
        b.options = Some(RequestOptions {
            timeout: Some(1),
            ..Default::default()
        });
        assert_eq!(connection_fingerprint(&a), connection_fingerprint(&b));

        // A transport change does.
        a.url = Some("http://localhost:4000/mcp".into());
        assert_ne!(connection_fingerprint(&a), connection_fingerprint(&b));
    }

    #[tokio::test]
    async fn test_apply_settings_disabled_server_never_connects() {
        let mut settings = Settings::default();
        settings.mcp_servers.insert(
            "off".into(),
            ServerConfig {
                command: Some("definitely-not-a-real-binary".into()),
                enabled: false,
                ..Default::default()
            },
        );

        let store = Arc::new(SettingsStore::in_memory(settings));
        let catalog = Arc::new(Catalog::new());
        let index = Arc::new(ToolIndex::disabled());
        let (supervisor, _rx) = Supervisor::new(store, Arc::clone(&catalog), index);

        supervisor.apply_settings().await;

        assert!(!supervisor.is_connected("off").await);
        assert_eq!(catalog.status_of("off"), Some(ServerStatus::Disconnected));
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].enabled);
    }

    #[tokio::test]
    async fn test_remove_server_evicts_catalog_entry() {
        let store = Arc::new(SettingsStore::in_memory(Settings::default()));
        let catalog = Arc::new(Catalog::new());
        catalog.upsert_status("ghost", ServerStatus::Connected, None, true);
        let index = Arc::new(ToolIndex::disabled());
        let (supervisor, _rx) = Supervisor::new(store, Arc::clone(&catalog), index);

        supervisor.remove_server("ghost").await;
        assert!(catalog.status_of("ghost").is_none());
        assert!(catalog.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_call_tool_unknown_server() {
        let store = Arc::new(SettingsStore::in_memory(Settings::default()));
        let catalog = Arc::new(Catalog::new());
        let index = Arc::new(ToolIndex::disabled());
        let (supervisor, _rx) = Supervisor::new(store, catalog, index);

        let result = supervisor.call_tool("missing", "t", None).await;
        assert!(matches!(result, Err(HubError::ServerNotFound(_))));
    }
}
