//! Smart mode: the `$smart` selector.
//!
//! Instead of the full catalog, a session opened with `$smart` sees exactly
//! two meta-tools: `search_tools` runs a similarity search over the indexed
//! catalog, and `call_tool` dispatches a tool found that way. The tool
//! descriptions and the metadata guidance strings steer the consuming LLM
//! and are part of the contract; change tests when changing them.

use rmcp::model::{CallToolResult, Content, Tool};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{error::HubResult, hub::Hub};

pub const SMART_SELECTOR: &str = "$smart";

pub const SEARCH_TOOLS_NAME: &str = "search_tools";
pub const CALL_TOOL_NAME: &str = "call_tool";

/// Guidance strings returned in `search_tools` metadata.
pub const GUIDANCE_RANKING: &str = "Results are ranked by semantic similarity to your query. \
     Inspect each tool's description and inputSchema before calling it; \
     the schema names the exact arguments the tool accepts.";
pub const GUIDANCE_NEXT_STEPS: &str = "Call the call_tool tool with toolName set to a result's \
     name and arguments matching its inputSchema. If nothing fits, search \
     again with more specific wording about the action you want to perform.";

const DEFAULT_LIMIT: u64 = 10;

/// Similarity threshold heuristic. Precision cues and long queries search
/// strictly; terse queries search loosely.
pub fn threshold_for_query(query: &str) -> f64 {
    let lowered = query.to_lowercase();
    let length = query.chars().count();
    if lowered.contains("specific") || lowered.contains("exact") || length > 30 {
        return 0.40;
    }
    if length < 10 || query.split_whitespace().count() <= 2 {
        return 0.20;
    }
    0.30
}

/// Clamp a requested result limit into `[1, 100]`.
pub fn clamp_limit(limit: Option<u64>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 100) as usize
}

fn tool_schema(properties: Value, required: &[&str]) -> serde_json::Map<String, Value> {
    let schema = json!({
        "type": "object",
        "properties": properties,
        "required": required,
    });
    schema.as_object().cloned().unwrap_or_default()
}

/// The fixed two-tool surface, with the reachable server list baked into the
/// `search_tools` description. Rebuilt from the live catalog on every
/// list-tools, so a catalog change is reflected immediately.
pub fn smart_tools(reachable_servers: &[String]) -> Vec<Tool> {
    let servers = if reachable_servers.is_empty() {
        "none currently connected".to_string()
    } else {
        reachable_servers.join(", ")
    };

    let search_description = format!(
        "Find tools relevant to a task before calling them. The hub aggregates \
         many tool servers (currently reachable: {}), and most of their tools are \
         not listed in this session; this search is how you discover them. \
         Describe the action you want to perform in a few words (for example \
         \"fetch a web page\" or \"query postgres\"), and the hub returns the \
         best-matching tools with their full input schemas plus search metadata. \
         Prefer wording about the task over tool-name guesses; add the word \
         \"specific\" or \"exact\" to tighten matching when results look noisy.",
        servers
    );

    let call_description = "Invoke a tool previously returned by search_tools. Pass the \
         result's name (either its full name from the search results or the bare \
         tool name) as toolName, and the tool's arguments as the arguments \
         object, matching the inputSchema from the search result. The call is \
         routed to the server that owns the tool and the tool's own result is \
         returned verbatim."
        .to_string();

    vec![
        Tool::new(
            SEARCH_TOOLS_NAME,
            search_description,
            tool_schema(
                json!({
                    "query": {
                        "type": "string",
                        "description": "What you want to do, in natural language"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of results (1-100, default 10)"
                    }
                }),
                &["query"],
            ),
        ),
        Tool::new(
            CALL_TOOL_NAME,
            call_description,
            tool_schema(
                json!({
                    "toolName": {
                        "type": "string",
                        "description": "Name of the tool to invoke, from search_tools results"
                    },
                    "arguments": {
                        "type": "object",
                        "description": "Arguments for the tool, per its inputSchema"
                    }
                }),
                &["toolName"],
            ),
        ),
    ]
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    limit: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallArgs {
    tool_name: String,
    #[serde(default)]
    arguments: Option<serde_json::Map<String, Value>>,
}

pub(crate) fn error_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(message.into())],
        structured_content: None,
        is_error: Some(true),
        meta: None,
    }
}

fn text_result(text: String) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(text)],
        structured_content: None,
        is_error: Some(false),
        meta: None,
    }
}

/// `search_tools`: query the index, re-apply enable gates against the
/// current settings, and return a JSON document with tools + metadata.
pub async fn handle_search(
    hub: &Hub,
    arguments: Option<serde_json::Map<String, Value>>,
) -> CallToolResult {
    let args: SearchArgs =
        match serde_json::from_value(Value::Object(arguments.unwrap_or_default())) {
            Ok(args) => args,
            Err(e) => return error_result(format!("invalid search_tools arguments: {}", e)),
        };

    let threshold = threshold_for_query(&args.query);
    let limit = clamp_limit(args.limit);
    let scope = hub.catalog().reachable_servers();

    let hits = match hub
        .index()
        .search(&args.query, limit, threshold as f32, Some(&scope))
        .await
    {
        Ok(hits) => hits,
        Err(e) => return error_result(format!("tool search failed: {}", e)),
    };

    // The index lags settings changes slightly; re-check the gates so a tool
    // disabled a moment ago cannot surface.
    let settings = hub.settings().current();
    let tools: Vec<Value> = hits
        .iter()
        .filter(|hit| {
            settings
                .mcp_servers
                .get(&hit.server_name)
                .map(|config| config.enabled && config.tool_enabled(&hit.tool_name))
                .unwrap_or(false)
        })
        .map(|hit| {
            json!({
                "name": crate::catalog::qualified_name(&hit.server_name, &hit.tool_name),
                "server": hit.server_name,
                "description": hit.description,
                "inputSchema": Value::Object(hit.input_schema.as_ref().clone()),
                "score": hit.score,
            })
        })
        .collect();

    debug!(query = %args.query, threshold, results = tools.len(), "Smart search");

    let document = json!({
        "tools": tools,
        "metadata": {
            "query": args.query,
            "threshold": threshold,
            "totalResults": tools.len(),
            "ranking": GUIDANCE_RANKING,
            "nextSteps": GUIDANCE_NEXT_STEPS,
        }
    });

    match serde_json::to_string_pretty(&document) {
        Ok(text) => text_result(text),
        Err(e) => error_result(format!("failed to serialize search results: {}", e)),
    }
}

/// `call_tool`: resolve the named tool to its owning server (first match in
/// catalog order, honoring enable gates) and dispatch through the regular
/// call path.
pub async fn handle_call(
    hub: &Hub,
    arguments: Option<serde_json::Map<String, Value>>,
) -> CallToolResult {
    let args: CallArgs = match serde_json::from_value(Value::Object(arguments.unwrap_or_default()))
    {
        Ok(args) => args,
        Err(e) => return error_result(format!("invalid call_tool arguments: {}", e)),
    };

    let resolved = match resolve_smart_tool(hub, &args.tool_name) {
        Ok(resolved) => resolved,
        Err(e) => return error_result(e.to_string()),
    };
    let (server, local_name) = resolved;

    match hub
        .supervisor()
        .call_tool(&server, &local_name, args.arguments)
        .await
    {
        Ok(result) => result,
        Err(e) => error_result(e.to_string()),
    }
}

/// Resolve a smart-mode tool name: a namespaced `"<server>-<local>"` name is
/// split (stripping the server prefix for the upstream call); a bare local
/// name goes to the first enabled server that declares it.
fn resolve_smart_tool(hub: &Hub, tool_name: &str) -> HubResult<(String, String)> {
    let settings = hub.settings().current();

    if let Some((server, local_name)) = hub.catalog().resolve_qualified(tool_name) {
        let allowed = settings
            .mcp_servers
            .get(&server)
            .map(|config| config.enabled && config.tool_enabled(&local_name))
            .unwrap_or(false);
        if allowed {
            return Ok((server, local_name));
        }
    }

    for snapshot in hub.catalog().snapshot() {
        if !snapshot.enabled || snapshot.status != crate::catalog::ServerStatus::Connected {
            continue;
        }
        let Some(config) = settings.mcp_servers.get(&snapshot.name) else {
            continue;
        };
        if !config.enabled {
            continue;
        }
        if snapshot
            .tools
            .iter()
            .any(|tool| tool.local_name == tool_name)
            && config.tool_enabled(tool_name)
        {
            return Ok((snapshot.name.clone(), tool_name.to_string()));
        }
    }

    Err(crate::error::HubError::ToolNotFound(tool_name.to_string()))
}
