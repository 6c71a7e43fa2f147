//! Per-session MCP server.
//!
//! One `HubService` instance backs each downstream session, bound to the
//! session's group selector. Upstream failures surface as `isError` tool
//! results, never as protocol-level errors, so call-tool responses stay
//! well-formed.

use std::sync::Arc;

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, ErrorCode, ErrorData, Implementation,
        InitializeRequestParam, InitializeResult, ListToolsResult, PaginatedRequestParam,
        ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
    RoleServer, ServerHandler,
};
use tracing::debug;

use super::smart;
use crate::{
    catalog::{ServerStatus, ToolInfo},
    groups,
    hub::Hub,
};

#[derive(Clone)]
pub struct HubService {
    hub: Arc<Hub>,
    selector: Option<String>,
}

impl HubService {
    pub fn new(hub: Arc<Hub>, selector: Option<String>) -> Self {
        let selector = selector.filter(|s| !s.is_empty());
        Self { hub, selector }
    }

    fn is_smart(&self) -> bool {
        self.selector.as_deref() == Some(smart::SMART_SELECTOR)
    }

    fn visible_tools(&self) -> Result<Vec<ToolInfo>, ErrorData> {
        let settings = self.hub.settings().current();
        self.hub
            .catalog()
            .list_for_group(&settings, self.selector.as_deref(), None)
            .map_err(|e| ErrorData::new(ErrorCode::INVALID_REQUEST, e.to_string(), None))
    }

    async fn route_call(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, ErrorData> {
        let name = request.name.to_string();
        let Some((server, local_name)) = self.hub.catalog().resolve_qualified(&name) else {
            return Err(ErrorData::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("Tool {} not found", name),
                None,
            ));
        };

        let settings = self.hub.settings().current();

        // Group gate: the session's selector must admit this server + tool.
        match groups::resolve_selector(&settings, self.selector.as_deref()) {
            Ok(target) => {
                if !groups::target_allows(&target, &server, &local_name) {
                    return Ok(smart::error_result(format!(
                        "Tool {} is not available through this endpoint",
                        name
                    )));
                }
            }
            Err(e) => {
                return Err(ErrorData::new(ErrorCode::INVALID_REQUEST, e.to_string(), None))
            }
        }

        let enabled = settings
            .mcp_servers
            .get(&server)
            .map(|config| config.enabled && config.tool_enabled(&local_name))
            .unwrap_or(false);
        if !enabled {
            return Ok(smart::error_result(format!("Tool {} is disabled", name)));
        }

        if self.hub.catalog().status_of(&server) != Some(ServerStatus::Connected) {
            return Ok(smart::error_result(format!(
                "Server {} is not connected",
                server
            )));
        }

        debug!(session_selector = ?self.selector, server = %server, tool = %local_name, "Routing call");
        match self
            .hub
            .supervisor()
            .call_tool(&server, &local_name, request.arguments)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => Ok(smart::error_result(e.to_string())),
        }
    }
}

impl ServerHandler for HubService {
    async fn initialize(
        &self,
        request: InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, ErrorData> {
        let session_id = self
            .hub
            .sessions()
            .register(self.selector.clone(), context.peer.clone());
        debug!(
            session = %session_id,
            client = %request.client_info.name,
            selector = ?self.selector,
            "Downstream session initialized"
        );
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        let tools = if self.is_smart() {
            smart::smart_tools(&self.hub.catalog().reachable_servers())
        } else {
            self.visible_tools()?
                .into_iter()
                .map(|tool| {
                    Tool::new(
                        tool.name,
                        tool.description.unwrap_or_default(),
                        Arc::clone(&tool.input_schema),
                    )
                })
                .collect()
        };

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        if self.is_smart() {
            return match request.name.as_ref() {
                smart::SEARCH_TOOLS_NAME => Ok(smart::handle_search(&self.hub, request.arguments).await),
                smart::CALL_TOOL_NAME => Ok(smart::handle_call(&self.hub, request.arguments).await),
                other => Err(ErrorData::new(
                    ErrorCode::METHOD_NOT_FOUND,
                    format!("Tool {} not found", other),
                    None,
                )),
            };
        }

        self.route_call(request).await
    }

    fn get_info(&self) -> ServerInfo {
        let settings = self.hub.settings().current();
        let name = super::endpoint_name(self.hub.name(), &settings, self.selector.as_deref());

        ServerInfo {
            server_info: Implementation {
                name,
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                website_url: None,
                icons: None,
            },
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::test_hub;
    use crate::settings::Settings;

    #[tokio::test]
    async fn test_get_info_names_follow_selector() {
        let hub = test_hub(Settings::default()).await;

        let global = HubService::new(Arc::clone(&hub), None);
        assert_eq!(global.get_info().server_info.name, hub.name());

        let smart = HubService::new(Arc::clone(&hub), Some("$smart".into()));
        assert_eq!(
            smart.get_info().server_info.name,
            format!("{}_$smart", hub.name())
        );
    }

    #[tokio::test]
    async fn test_smart_session_lists_fixed_tools() {
        let hub = test_hub(Settings::default()).await;
        let service = HubService::new(hub, Some("$smart".into()));
        assert!(service.is_smart());
    }

    #[tokio::test]
    async fn test_empty_selector_is_global() {
        let hub = test_hub(Settings::default()).await;
        let service = HubService::new(hub, Some(String::new()));
        assert!(service.selector.is_none());
    }
}
