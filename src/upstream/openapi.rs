//! OpenAPI upstream adapter.
//!
//! Wraps a REST service described by an OpenAPI v3 document as a tool
//! server: one tool per operation, with the input schema assembled from path
//! / query / header parameters and the JSON request body. Calls translate
//! arguments back into an HTTP request with the configured auth applied.

use std::sync::Arc;

use reqwest::Method;
use rmcp::model::{CallToolResult, Content};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{
    catalog::{JsonObject, ToolDecl},
    error::{HubError, HubResult},
    settings::{ApiKeyLocation, HttpAuthScheme, OpenApiConfig, OpenApiSecurity},
};

/// Render a JSON value as a plain string for use in headers, query params,
/// path segments, and cookies (strings pass through unquoted).
fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

const METHODS: &[(&str, Method)] = &[
    ("get", Method::GET),
    ("post", Method::POST),
    ("put", Method::PUT),
    ("delete", Method::DELETE),
    ("patch", Method::PATCH),
    ("head", Method::HEAD),
    ("options", Method::OPTIONS),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
}

#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    location: ParamLocation,
    required: bool,
}

#[derive(Debug, Clone)]
struct Operation {
    tool_name: String,
    method: Method,
    path: String,
    description: Option<String>,
    params: Vec<ParamSpec>,
    /// Top-level body property names when the body schema is an object;
    /// empty means the whole body travels under a single `body` argument.
    body_keys: Vec<String>,
    has_body: bool,
    input_schema: Arc<JsonObject>,
}

/// One connected OpenAPI upstream.
pub struct OpenApiClient {
    server: String,
    base_url: Url,
    security: Option<OpenApiSecurity>,
    client: reqwest::Client,
    operations: Vec<Operation>,
}

impl OpenApiClient {
    /// Load and parse the spec (from URL or inline) and synthesize tools.
    pub async fn connect(server: &str, config: &OpenApiConfig) -> HubResult<Self> {
        let client = reqwest::Client::new();

        let (document, spec_url) = match (&config.schema, &config.url) {
            (Some(schema), _) => (schema.clone(), None),
            (None, Some(url)) => {
                let document: Value = client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| HubError::ConnectFailed {
                        server: server.to_string(),
                        message: format!("fetch OpenAPI spec: {}", e),
                    })?
                    .error_for_status()
                    .map_err(|e| HubError::ConnectFailed {
                        server: server.to_string(),
                        message: format!("fetch OpenAPI spec: {}", e),
                    })?
                    .json()
                    .await
                    .map_err(|e| HubError::ConnectFailed {
                        server: server.to_string(),
                        message: format!("parse OpenAPI spec: {}", e),
                    })?;
                (document, Some(url.clone()))
            }
            (None, None) => {
                return Err(HubError::ConfigInvalid(format!(
                    "server '{}': openapi requires a url or inline schema",
                    server
                )))
            }
        };

        let base_url = resolve_base_url(server, &document, spec_url.as_deref())?;
        let operations = parse_operations(&document);
        if operations.is_empty() {
            return Err(HubError::ConnectFailed {
                server: server.to_string(),
                message: "OpenAPI spec declares no operations".into(),
            });
        }

        debug!(server = %server, operations = operations.len(), base = %base_url, "Parsed OpenAPI spec");
        Ok(Self {
            server: server.to_string(),
            base_url,
            security: config.security.clone(),
            client,
            operations,
        })
    }

    /// Synthesized tools, in spec declaration order.
    pub fn tools(&self) -> Vec<ToolDecl> {
        self.operations
            .iter()
            .map(|op| ToolDecl {
                local_name: op.tool_name.clone(),
                description: op.description.clone(),
                input_schema: Arc::clone(&op.input_schema),
            })
            .collect()
    }

    /// Execute one operation with the given arguments.
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: Option<JsonObject>,
    ) -> HubResult<CallToolResult> {
        let op = self
            .operations
            .iter()
            .find(|op| op.tool_name == tool_name)
            .ok_or_else(|| HubError::ToolNotFound(format!("{}:{}", self.server, tool_name)))?;
        let args = arguments.unwrap_or_default();

        let url = self.build_url(op, &args)?;
        let mut request = self.client.request(op.method.clone(), url);

        for param in op.params.iter().filter(|p| p.location == ParamLocation::Header) {
            if let Some(value) = args.get(&param.name) {
                request = request.header(&param.name, value_as_string(value));
            }
        }
        let cookies: Vec<String> = op
            .params
            .iter()
            .filter(|p| p.location == ParamLocation::Cookie)
            .filter_map(|p| args.get(&p.name).map(|v| format!("{}={}", p.name, value_as_string(v))))
            .collect();
        if !cookies.is_empty() {
            request = request.header(reqwest::header::COOKIE, cookies.join("; "));
        }

        if op.has_body {
            let body = if op.body_keys.is_empty() {
                args.get("body").cloned().unwrap_or(Value::Null)
            } else {
                let mut body = serde_json::Map::new();
                for key in &op.body_keys {
                    if let Some(value) = args.get(key) {
                        body.insert(key.clone(), value.clone());
                    }
                }
                Value::Object(body)
            };
            request = request.json(&body);
        }

        request = self.apply_security(request);

        let response = request
            .send()
            .await
            .map_err(|e| HubError::call_failed(&self.server, e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HubError::call_failed(&self.server, e.to_string()))?;

        if status.is_success() {
            Ok(CallToolResult {
                content: vec![Content::text(body)],
                structured_content: None,
                is_error: Some(false),
                meta: None,
            })
        } else {
            Ok(CallToolResult {
                content: vec![Content::text(format!("HTTP {}: {}", status.as_u16(), body))],
                structured_content: None,
                is_error: Some(true),
                meta: None,
            })
        }
    }

    fn build_url(&self, op: &Operation, args: &JsonObject) -> HubResult<Url> {
        let mut path = op.path.clone();
        for param in op.params.iter().filter(|p| p.location == ParamLocation::Path) {
            let value = args.get(&param.name).ok_or_else(|| {
                HubError::call_failed(
                    &self.server,
                    format!("missing required path parameter '{}'", param.name),
                )
            })?;
            path = path.replace(&format!("{{{}}}", param.name), &value_as_string(value));
        }

        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| HubError::call_failed(&self.server, format!("build url: {}", e)))?;

        {
            let mut query = url.query_pairs_mut();
            for param in op.params.iter().filter(|p| p.location == ParamLocation::Query) {
                if let Some(value) = args.get(&param.name) {
                    query.append_pair(&param.name, &value_as_string(value));
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    fn apply_security(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.security {
            None | Some(OpenApiSecurity::None) => request,
            Some(OpenApiSecurity::ApiKey {
                name,
                location,
                value,
            }) => match location {
                ApiKeyLocation::Header => request.header(name, value),
                ApiKeyLocation::Query => request.query(&[(name.as_str(), value.as_str())]),
                ApiKeyLocation::Cookie => {
                    request.header(reqwest::header::COOKIE, format!("{}={}", name, value))
                }
            },
            Some(OpenApiSecurity::Http {
                scheme,
                credentials,
            }) => match scheme {
                HttpAuthScheme::Basic => match credentials.split_once(':') {
                    Some((user, pass)) => request.basic_auth(user, Some(pass)),
                    None => request.basic_auth(credentials, None::<&str>),
                },
                HttpAuthScheme::Bearer => request.bearer_auth(credentials),
                HttpAuthScheme::Digest => {
                    request.header(reqwest::header::AUTHORIZATION, format!("Digest {}", credentials))
                }
            },
            Some(OpenApiSecurity::Oauth2 { token })
            | Some(OpenApiSecurity::OpenIdConnect { token, .. }) => request.bearer_auth(token),
        }
    }
}

fn resolve_base_url(server: &str, document: &Value, spec_url: Option<&str>) -> HubResult<Url> {
    if let Some(declared) = document
        .pointer("/servers/0/url")
        .and_then(Value::as_str)
    {
        // Absolute server url wins; relative ones resolve against the spec.
        if let Ok(url) = Url::parse(declared) {
            return Ok(ensure_trailing_slash(url));
        }
        if let Some(spec) = spec_url {
            let base = Url::parse(spec).map_err(|e| {
                HubError::ConfigInvalid(format!("server '{}': invalid spec url: {}", server, e))
            })?;
            let joined = base.join(declared).map_err(|e| {
                HubError::ConfigInvalid(format!("server '{}': invalid servers[0].url: {}", server, e))
            })?;
            return Ok(ensure_trailing_slash(joined));
        }
    }

    if let Some(spec) = spec_url {
        let mut url = Url::parse(spec).map_err(|e| {
            HubError::ConfigInvalid(format!("server '{}': invalid spec url: {}", server, e))
        })?;
        url.set_path("/");
        url.set_query(None);
        return Ok(url);
    }

    Err(HubError::ConfigInvalid(format!(
        "server '{}': OpenAPI spec has no servers[0].url and no spec url to infer from",
        server
    )))
}

fn ensure_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn parse_operations(document: &Value) -> Vec<Operation> {
    let Some(paths) = document.get("paths").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut operations = Vec::new();
    for (path, item) in paths {
        let common_params = item
            .get("parameters")
            .map(|p| parse_params(p))
            .unwrap_or_default();

        for (method_name, method) in METHODS {
            let Some(op) = item.get(*method_name) else {
                continue;
            };

            let mut params = common_params.clone();
            if let Some(own) = op.get("parameters") {
                params.extend(parse_params(own));
            }

            let tool_name = op
                .get("operationId")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("{}_{}", method_name, sanitize_path(path)));

            let description = op
                .get("summary")
                .or_else(|| op.get("description"))
                .and_then(Value::as_str)
                .map(|s| s.to_string());

            let body_schema = op.pointer("/requestBody/content/application~1json/schema");
            let (input_schema, body_keys, has_body) = build_input_schema(op, &params, body_schema);

            operations.push(Operation {
                tool_name,
                method: method.clone(),
                path: path.clone(),
                description,
                params,
                body_keys,
                has_body,
                input_schema: Arc::new(input_schema),
            });
        }
    }
    operations
}

fn parse_params(value: &Value) -> Vec<ParamSpec> {
    let Some(list) = value.as_array() else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|p| {
            let name = p.get("name")?.as_str()?.to_string();
            let location = match p.get("in").and_then(Value::as_str)? {
                "path" => ParamLocation::Path,
                "query" => ParamLocation::Query,
                "header" => ParamLocation::Header,
                "cookie" => ParamLocation::Cookie,
                _ => return None,
            };
            let required = p
                .get("required")
                .and_then(Value::as_bool)
                .unwrap_or(location == ParamLocation::Path);
            Some(ParamSpec {
                name,
                location,
                required,
            })
        })
        .collect()
}

/// Merge parameter schemas and the request-body schema into one flat input
/// object. An object-typed body contributes its properties at the top level;
/// anything else travels under a single `body` key.
fn build_input_schema(
    op: &Value,
    params: &[ParamSpec],
    body_schema: Option<&Value>,
) -> (JsonObject, Vec<String>, bool) {
    let mut properties = serde_json::Map::new();
    let mut required: Vec<Value> = Vec::new();

    let param_schemas: &Value = &op["parameters"];
    for param in params {
        let schema = param_schemas
            .as_array()
            .and_then(|list| {
                list.iter()
                    .find(|p| p.get("name").and_then(Value::as_str) == Some(param.name.as_str()))
            })
            .and_then(|p| p.get("schema"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "type": "string" }));
        properties.insert(param.name.clone(), schema);
        if param.required {
            required.push(Value::String(param.name.clone()));
        }
    }

    let mut body_keys = Vec::new();
    let mut has_body = false;
    if let Some(schema) = body_schema {
        has_body = true;
        match schema.get("properties").and_then(Value::as_object) {
            Some(body_props) => {
                for (key, prop) in body_props {
                    properties.insert(key.clone(), prop.clone());
                    body_keys.push(key.clone());
                }
                if let Some(body_required) = schema.get("required").and_then(Value::as_array) {
                    required.extend(body_required.iter().cloned());
                }
            }
            None => {
                properties.insert("body".to_string(), schema.clone());
                required.push(Value::String("body".to_string()));
            }
        }
    }

    let mut input_schema = serde_json::Map::new();
    input_schema.insert("type".to_string(), Value::String("object".to_string()));
    input_schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        input_schema.insert("required".to_string(), Value::Array(required));
    }

    (input_schema, body_keys, has_body)
}

fn sanitize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for ch in path.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn petstore_spec() -> Value {
        serde_json::json!({
            "openapi": "3.0.0",
            "servers": [{ "url": "https://api.example.com/v1" }],
            "paths": {
                "/pets": {
                    "get": {
                        "operationId": "listPets",
                        "summary": "List all pets",
                        "parameters": [
                            { "name": "limit", "in": "query", "schema": { "type": "integer" } }
                        ]
                    },
                    "post": {
                        "operationId": "createPet",
                        "requestBody": {
                            "content": {
                                "application/json": {
                                    "schema": {
                                        "type": "object",
                                        "properties": {
                                            "name": { "type": "string" },
                                            "tag": { "type": "string" }
                                        },
                                        "required": ["name"]
                                    }
                                }
                            }
                        }
                    }
                },
                "/pets/{petId}": {
                    "get": {
                        "summary": "Info for a pet",
                        "parameters": [
                            { "name": "petId", "in": "path", "required": true,
                              "schema": { "type": "string" } }
                        ]
                    }
                }
            }
        })
    }

    async fn client_from(spec: Value) -> OpenApiClient {
        let config = OpenApiConfig {
            url: None,
            schema: Some(spec),
            version: Some("3.0.0".into()),
            security: None,
        };
        OpenApiClient::connect("petstore", &config).await.unwrap()
    }

    #[tokio::test]
    async fn test_tool_synthesis() {
        let client = client_from(petstore_spec()).await;
        let tools = client.tools();
        let names: Vec<&str> = tools.iter().map(|t| t.local_name.as_str()).collect();

        assert!(names.contains(&"listPets"));
        assert!(names.contains(&"createPet"));
        // No operationId falls back to method + path.
        assert!(names.contains(&"get_pets_petId"));

        let list = tools.iter().find(|t| t.local_name == "listPets").unwrap();
        assert_eq!(list.description.as_deref(), Some("List all pets"));
        let props = list.input_schema.get("properties").unwrap().as_object().unwrap();
        assert!(props.contains_key("limit"));
    }

    #[tokio::test]
    async fn test_body_schema_flattened() {
        let client = client_from(petstore_spec()).await;
        let tools = client.tools();
        let create = tools.iter().find(|t| t.local_name == "createPet").unwrap();
        let props = create.input_schema.get("properties").unwrap().as_object().unwrap();
        assert!(props.contains_key("name"));
        assert!(props.contains_key("tag"));
        let required = create.input_schema.get("required").unwrap().as_array().unwrap();
        assert!(required.contains(&Value::String("name".into())));
    }

    #[tokio::test]
    async fn test_build_url_substitution() {
        let client = client_from(petstore_spec()).await;
        let op = client
            .operations
            .iter()
            .find(|op| op.tool_name == "get_pets_petId")
            .unwrap();

        let mut args = serde_json::Map::new();
        args.insert("petId".to_string(), Value::String("42".into()));
        let url = client.build_url(op, &args).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/pets/42");

        // Missing path parameter is an error.
        let err = client.build_url(op, &serde_json::Map::new());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_query_params_appended() {
        let client = client_from(petstore_spec()).await;
        let op = client
            .operations
            .iter()
            .find(|op| op.tool_name == "listPets")
            .unwrap();

        let mut args = serde_json::Map::new();
        args.insert("limit".to_string(), Value::Number(5.into()));
        let url = client.build_url(op, &args).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/pets?limit=5");
    }

    #[tokio::test]
    async fn test_empty_spec_rejected() {
        let config = OpenApiConfig {
            url: None,
            schema: Some(serde_json::json!({ "openapi": "3.0.0", "paths": {} })),
            version: None,
            security: None,
        };
        assert!(OpenApiClient::connect("empty", &config).await.is_err());
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/pets/{petId}"), "pets_petId");
        assert_eq!(sanitize_path("/a/b-c"), "a_b_c");
    }
}
