//! Upstream clients.
//!
//! One uniform surface over the four upstream kinds: stdio child processes,
//! SSE, streamable-HTTP (all three speaking MCP through the SDK), and
//! OpenAPI services wrapped to look like tool servers. Adapters emit *local*
//! tool names; namespacing happens in the catalog.

pub mod openapi;
pub mod supervisor;

use std::{borrow::Cow, sync::Arc, time::Duration};

use backoff::ExponentialBackoffBuilder;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, ClientInfo, LoggingLevel,
        LoggingMessageNotificationParam, ProgressNotificationParam,
    },
    service::{NotificationContext, RunningService},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    ClientHandler, RoleClient, ServiceExt,
};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::{
    catalog::{JsonObject, ToolDecl},
    error::{HubError, HubResult},
    settings::{env as settings_env, InstallConfig, ServerConfig, ServerType},
};

pub use openapi::OpenApiClient;
pub use supervisor::Supervisor;

type McpClient = RunningService<RoleClient, HubClientHandler>;

/// Ask the supervisor to re-list a server's tools.
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub server: String,
}

/// Client-side handler for upstream notifications.
///
/// Tool-list changes funnel into the supervisor's refresh channel; progress
/// notifications wake the per-server progress notifier so call timeouts can
/// reset; upstream log messages are forwarded to the hub's log stream.
#[derive(Clone)]
pub struct HubClientHandler {
    server: Arc<str>,
    refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
    progress: Arc<Notify>,
    client_info: ClientInfo,
}

impl HubClientHandler {
    pub fn new(server: impl AsRef<str>, progress: Arc<Notify>) -> Self {
        let mut client_info = ClientInfo::default();
        client_info.client_info.name = "mcp-hub".to_string();
        client_info.client_info.version = env!("CARGO_PKG_VERSION").to_string();

        Self {
            server: Arc::from(server.as_ref()),
            refresh_tx: None,
            progress,
            client_info,
        }
    }

    #[must_use]
    pub fn with_refresh_channel(mut self, tx: mpsc::Sender<RefreshRequest>) -> Self {
        self.refresh_tx = Some(tx);
        self
    }

    fn send_refresh(&self) {
        if let Some(tx) = &self.refresh_tx {
            if let Err(e) = tx.try_send(RefreshRequest {
                server: self.server.to_string(),
            }) {
                warn!(server = %self.server, error = %e, "Failed to queue tool refresh");
            }
        }
    }
}

impl ClientHandler for HubClientHandler {
    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(server = %self.server, "Upstream tool list changed");
        self.send_refresh();
    }

    async fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        debug!(
            server = %self.server,
            token = ?params.progress_token,
            progress = %params.progress,
            total = ?params.total,
            "Upstream progress"
        );
        self.progress.notify_waiters();
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        let logger = params.logger.as_deref().unwrap_or("mcp");
        match params.level {
            LoggingLevel::Emergency
            | LoggingLevel::Alert
            | LoggingLevel::Critical
            | LoggingLevel::Error => {
                error!(server = %self.server, logger = %logger, "Upstream: {}", params.data);
            }
            LoggingLevel::Warning => {
                warn!(server = %self.server, logger = %logger, "Upstream: {}", params.data);
            }
            LoggingLevel::Notice | LoggingLevel::Info => {
                info!(server = %self.server, logger = %logger, "Upstream: {}", params.data);
            }
            LoggingLevel::Debug => {
                debug!(server = %self.server, logger = %logger, "Upstream: {}", params.data);
            }
        }
    }

    fn get_info(&self) -> ClientInfo {
        self.client_info.clone()
    }
}

/// A live upstream connection.
pub enum UpstreamClient {
    Mcp { client: McpClient, kind: ServerType },
    OpenApi(OpenApiClient),
}

impl UpstreamClient {
    /// Connect per the config's transport. Remote MCP transports retry
    /// transient failures with exponential backoff; the caller bounds the
    /// whole attempt with its connect timeout.
    pub async fn connect(
        name: &str,
        config: &ServerConfig,
        install: &InstallConfig,
        handler: HubClientHandler,
    ) -> HubResult<Self> {
        let kind = config.effective_type()?;
        match kind {
            ServerType::Sse | ServerType::StreamableHttp => {
                connect_with_retry(name, config, kind, install, handler).await
            }
            _ => connect_once(name, config, kind, install, handler).await,
        }
    }

    pub fn kind(&self) -> ServerType {
        match self {
            UpstreamClient::Mcp { kind, .. } => *kind,
            UpstreamClient::OpenApi(_) => ServerType::Openapi,
        }
    }

    pub async fn list_tools(&self, server: &str) -> HubResult<Vec<ToolDecl>> {
        match self {
            UpstreamClient::Mcp { client, .. } => {
                let tools = client.peer().list_all_tools().await.map_err(|e| {
                    HubError::ListToolsFailed {
                        server: server.to_string(),
                        message: e.to_string(),
                    }
                })?;
                Ok(tools.iter().map(ToolDecl::from_rmcp).collect())
            }
            UpstreamClient::OpenApi(client) => Ok(client.tools()),
        }
    }

    pub async fn call_tool(
        &self,
        server: &str,
        local_name: &str,
        arguments: Option<JsonObject>,
    ) -> HubResult<CallToolResult> {
        match self {
            UpstreamClient::Mcp { client, .. } => client
                .call_tool(CallToolRequestParam {
                    name: Cow::Owned(local_name.to_string()),
                    arguments,
                })
                .await
                .map_err(|e| HubError::call_failed(server, e.to_string())),
            UpstreamClient::OpenApi(client) => client.call(local_name, arguments).await,
        }
    }

    /// Keep-alive probe: a minimal protocol round-trip.
    pub async fn ping(&self, server: &str) -> HubResult<()> {
        match self {
            UpstreamClient::Mcp { client, .. } => {
                client
                    .peer()
                    .list_tools(Default::default())
                    .await
                    .map_err(|e| HubError::call_failed(server, e.to_string()))?;
                Ok(())
            }
            UpstreamClient::OpenApi(_) => Ok(()),
        }
    }

    /// Tear the connection down. Idempotent from the caller's perspective:
    /// the client (and any stdio child) is gone afterwards.
    pub async fn close(self, server: &str) {
        match self {
            UpstreamClient::Mcp { client, .. } => {
                if let Err(e) = client.cancel().await {
                    warn!(server = %server, error = %e, "Error closing upstream client");
                }
            }
            UpstreamClient::OpenApi(_) => {}
        }
    }
}

/// Connect with exponential backoff for remote transports, mirroring the
/// transient/permanent split: config and auth problems fail fast.
async fn connect_with_retry(
    name: &str,
    config: &ServerConfig,
    kind: ServerType,
    install: &InstallConfig,
    handler: HubClientHandler,
) -> HubResult<UpstreamClient> {
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(30))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .build();

    backoff::future::retry(backoff, || {
        let handler = handler.clone();
        async move {
            match connect_once(name, config, kind, install, handler).await {
                Ok(client) => Ok(client),
                Err(e) => {
                    if is_permanent_connect_error(&e) {
                        error!(server = %name, error = %e, "Permanent connect error, not retrying");
                        Err(backoff::Error::permanent(e))
                    } else {
                        warn!(server = %name, error = %e, "Connect failed, retrying");
                        Err(backoff::Error::transient(e))
                    }
                }
            }
        }
    })
    .await
}

fn is_permanent_connect_error(error: &HubError) -> bool {
    match error {
        HubError::ConfigInvalid(_) => true,
        HubError::Forbidden(_) => true,
        HubError::ConnectFailed { message, .. } => {
            message.contains("401")
                || message.contains("403")
                || message.contains("invalid URL")
                || message.contains("builder error")
        }
        _ => false,
    }
}

async fn connect_once(
    name: &str,
    config: &ServerConfig,
    kind: ServerType,
    install: &InstallConfig,
    handler: HubClientHandler,
) -> HubResult<UpstreamClient> {
    info!(server = %name, kind = %kind, "Connecting to upstream");

    match kind {
        ServerType::Stdio => {
            let command = config
                .command
                .as_deref()
                .ok_or_else(|| HubError::ConfigInvalid(format!("server '{}': missing command", name)))?;
            let command = settings_env::expand_placeholders(command);
            let args = settings_env::expand_args(config);
            let env = settings_env::build_child_env(config, install);

            let transport = TokioChildProcess::new(
                tokio::process::Command::new(&command).configure(|cmd| {
                    cmd.args(&args)
                        .envs(env.iter())
                        .stderr(std::process::Stdio::inherit());
                }),
            )
            .map_err(|e| HubError::ConnectFailed {
                server: name.to_string(),
                message: format!("spawn '{}': {}", command, e),
            })?;

            let client = handler
                .serve(transport)
                .await
                .map_err(|e| HubError::ConnectFailed {
                    server: name.to_string(),
                    message: format!("initialize stdio client: {}", e),
                })?;

            info!(server = %name, command = %command, "Connected to stdio upstream");
            Ok(UpstreamClient::Mcp { client, kind })
        }

        ServerType::Sse => {
            let url = require_url(name, config)?;
            let http_client = http_client_with_headers(name, config)?;
            let transport = SseClientTransport::start_with_client(
                http_client,
                SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| HubError::ConnectFailed {
                server: name.to_string(),
                message: format!("create SSE transport: {}", e),
            })?;

            let client = handler
                .serve(transport)
                .await
                .map_err(|e| HubError::ConnectFailed {
                    server: name.to_string(),
                    message: format!("initialize SSE client: {}", e),
                })?;

            info!(server = %name, url = %url, "Connected to SSE upstream");
            Ok(UpstreamClient::Mcp { client, kind })
        }

        ServerType::StreamableHttp => {
            let url = require_url(name, config)?;
            let http_client = http_client_with_headers(name, config)?;
            let transport = StreamableHttpClientTransport::with_client(
                http_client,
                StreamableHttpClientTransportConfig::with_uri(url.as_str()),
            );

            let client = handler
                .serve(transport)
                .await
                .map_err(|e| HubError::ConnectFailed {
                    server: name.to_string(),
                    message: format!("initialize streamable client: {}", e),
                })?;

            info!(server = %name, url = %url, "Connected to streamable HTTP upstream");
            Ok(UpstreamClient::Mcp { client, kind })
        }

        ServerType::Openapi => {
            let openapi = config.openapi.as_ref().ok_or_else(|| {
                HubError::ConfigInvalid(format!("server '{}': missing openapi config", name))
            })?;
            let client = OpenApiClient::connect(name, openapi).await?;
            info!(server = %name, tools = client.tools().len(), "Connected to OpenAPI upstream");
            Ok(UpstreamClient::OpenApi(client))
        }
    }
}

fn require_url<'a>(name: &str, config: &'a ServerConfig) -> HubResult<&'a String> {
    config
        .url
        .as_ref()
        .ok_or_else(|| HubError::ConfigInvalid(format!("server '{}': missing url", name)))
}

/// Build a reqwest client carrying the configured headers on every request,
/// both the SSE stream and the message channel.
fn http_client_with_headers(name: &str, config: &ServerConfig) -> HubResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

    if !config.headers.is_empty() {
        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &config.headers {
            let header_name: reqwest::header::HeaderName = key.parse().map_err(|_| {
                HubError::ConfigInvalid(format!("server '{}': invalid header name '{}'", name, key))
            })?;
            let header_value = value.parse().map_err(|_| {
                HubError::ConfigInvalid(format!("server '{}': invalid value for header '{}'", name, key))
            })?;
            headers.insert(header_name, header_value);
        }
        builder = builder.default_headers(headers);
    }

    builder.build().map_err(|e| HubError::ConnectFailed {
        server: name.to_string(),
        message: format!("build HTTP client: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_client_info() {
        let handler = HubClientHandler::new("test", Arc::new(Notify::new()));
        let info = handler.get_info();
        assert_eq!(info.client_info.name, "mcp-hub");
    }

    #[test]
    fn test_permanent_connect_errors() {
        assert!(is_permanent_connect_error(&HubError::ConfigInvalid(
            "bad".into()
        )));
        assert!(is_permanent_connect_error(&HubError::ConnectFailed {
            server: "s".into(),
            message: "HTTP 401 Unauthorized".into(),
        }));
        assert!(!is_permanent_connect_error(&HubError::ConnectFailed {
            server: "s".into(),
            message: "connection refused".into(),
        }));
    }

    #[test]
    fn test_http_client_header_validation() {
        let mut config = ServerConfig {
            url: Some("http://localhost:3000/sse".into()),
            ..Default::default()
        };
        config
            .headers
            .insert("X-API-Key".to_string(), "secret".to_string());
        assert!(http_client_with_headers("s", &config).is_ok());

        config
            .headers
            .insert("bad header".to_string(), "v".to_string());
        assert!(matches!(
            http_client_with_headers("s", &config),
            Err(HubError::ConfigInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_config() {
        let config = ServerConfig::default();
        let handler = HubClientHandler::new("empty", Arc::new(Notify::new()));
        let result =
            UpstreamClient::connect("empty", &config, &InstallConfig::default(), handler).await;
        assert!(matches!(result, Err(HubError::ConfigInvalid(_))));
    }
}
