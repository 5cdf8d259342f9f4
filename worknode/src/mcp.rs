//! Cached client sessions to external MCP tool servers.
//!
//! The control plane ships the server connection details with every call;
//! sessions are cached by server name so repeated calls reuse one
//! connection. A failed call invalidates the cached session, forcing the
//! next call to reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientCapabilities, ClientInfo, Implementation,
    PaginatedRequestParam, RawContent,
};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::ServiceExt;
use tracing::{debug, info, warn};

use worknode_protocol::McpServerConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

type ClientService = RunningService<RoleClient, ClientInfo>;

/// Flattened result of a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

/// One advertised tool on a server.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Option<serde_json::Value>,
}

/// Manages one cached session per tool server, keyed by server name.
pub struct ToolServerManager {
    sessions: Mutex<HashMap<String, Arc<ClientService>>>,
}

impl Default for ToolServerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolServerManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Invoke a tool, reconnecting lazily. A failed or timed-out call drops
    /// the cached session so the next call starts fresh.
    pub async fn call_tool(
        &self,
        server: &McpServerConfig,
        tool_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ToolOutcome> {
        debug!(server_name = %server.name, tool_name, "tool server call");

        let session = self.get_session(server).await?;

        let call = session.call_tool(CallToolRequestParam {
            name: tool_name.to_string().into(),
            arguments,
        });

        match tokio::time::timeout(CALL_TIMEOUT, call).await {
            Ok(Ok(result)) => {
                debug!(
                    server_name = %server.name,
                    tool_name,
                    is_error = result.is_error.unwrap_or(false),
                    "tool call completed"
                );
                Ok(ToolOutcome {
                    content: extract_content(&result),
                    is_error: result.is_error.unwrap_or(false),
                })
            }
            Ok(Err(e)) => {
                warn!(server_name = %server.name, tool_name, error = %e, "tool call failed");
                self.invalidate(&server.name);
                Err(anyhow!("failed to call tool '{}': {}", tool_name, e))
            }
            Err(_) => {
                warn!(server_name = %server.name, tool_name, "tool call timed out");
                self.invalidate(&server.name);
                Err(anyhow!(
                    "tool call '{}' timed out after {:?}",
                    tool_name,
                    CALL_TIMEOUT
                ))
            }
        }
    }

    /// List every tool the server advertises, following pagination cursors.
    pub async fn list_tools(&self, server: &McpServerConfig) -> Result<Vec<ToolInfo>> {
        let session = self.get_session(server).await?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = match session
                .list_tools(Some(PaginatedRequestParam {
                    cursor: cursor.take(),
                }))
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    self.invalidate(&server.name);
                    return Err(anyhow!("failed to list tools: {}", e));
                }
            };

            tools.extend(page.tools.into_iter().map(|tool| ToolInfo {
                name: tool.name.to_string(),
                description: tool
                    .description
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
                input_schema: Some(serde_json::Value::Object((*tool.input_schema).clone())),
            }));

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Shut down every cached session.
    pub async fn close(&self) {
        let sessions: Vec<_> = {
            let mut guard = self.sessions.lock().unwrap();
            guard.drain().collect()
        };
        for (name, service) in sessions {
            debug!(server_name = %name, "closing tool server session");
            if let Ok(service) = Arc::try_unwrap(service) {
                let _ = service.cancel().await;
            }
        }
    }

    async fn get_session(&self, server: &McpServerConfig) -> Result<Arc<ClientService>> {
        if let Some(session) = self.sessions.lock().unwrap().get(&server.name) {
            debug!(server_name = %server.name, "reusing tool server session");
            return Ok(session.clone());
        }

        info!(
            server_name = %server.name,
            transport = %server.transport,
            "connecting to tool server"
        );
        let service = Arc::new(self.connect(server).await?);
        self.sessions
            .lock()
            .unwrap()
            .insert(server.name.clone(), service.clone());
        Ok(service)
    }

    async fn connect(&self, server: &McpServerConfig) -> Result<ClientService> {
        let info = client_info();

        let connect = async {
            match server.transport.as_str() {
                "stdio" => {
                    let command = server
                        .command
                        .as_deref()
                        .context("stdio transport requires a command")?;
                    let mut cmd = tokio::process::Command::new(command);
                    cmd.args(&server.args);
                    for (key, value) in &server.env {
                        if is_valid_env_key(key) {
                            cmd.env(key, value);
                        }
                    }
                    let transport =
                        TokioChildProcess::new(cmd).context("failed to spawn tool server")?;
                    info.serve(transport)
                        .await
                        .map_err(|e| anyhow!("initialize failed: {}", e))
                }
                "sse" => {
                    let url = server
                        .url
                        .as_deref()
                        .context("sse transport requires a url")?;
                    let client =
                        http_client_with_headers(&server.headers, &server.dynamic_headers)?;
                    let transport = StreamableHttpClientTransport::with_client(
                        client,
                        StreamableHttpClientTransportConfig::with_uri(url.to_string()),
                    );
                    info.serve(transport)
                        .await
                        .map_err(|e| anyhow!("initialize failed: {}", e))
                }
                other => bail!("unsupported transport type '{}'", other),
            }
        };

        tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                anyhow!(
                    "connect to tool server '{}' timed out after {:?}",
                    server.name,
                    CONNECT_TIMEOUT
                )
            })?
            .with_context(|| format!("failed to connect to tool server '{}'", server.name))
    }

    fn invalidate(&self, name: &str) {
        let removed = self.sessions.lock().unwrap().remove(name);
        if let Some(service) = removed {
            tokio::spawn(async move {
                if let Ok(service) = Arc::try_unwrap(service) {
                    let _ = service.cancel().await;
                }
            });
        }
    }
}

fn client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "worknode".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            ..Default::default()
        },
    }
}

/// Flatten text and image parts into a single string the control plane
/// can show to the model.
fn extract_content(result: &CallToolResult) -> String {
    let mut parts: Vec<String> = Vec::new();
    for item in &result.content {
        match &item.raw {
            RawContent::Text(text) => parts.push(text.text.clone()),
            RawContent::Image(image) => parts.push(format!("[Image: {}]", image.mime_type)),
            _ => {}
        }
    }
    parts.join("\n")
}

/// Keys containing `=` or NUL would corrupt the child environment.
fn is_valid_env_key(key: &str) -> bool {
    !key.contains('=') && !key.contains('\0')
}

/// Build a reqwest client that injects static and dynamic headers into
/// every request to the server.
fn http_client_with_headers(
    headers: &HashMap<String, String>,
    dynamic_headers: &HashMap<String, String>,
) -> Result<reqwest::Client> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (key, value) in headers.iter().chain(dynamic_headers.iter()) {
        let name = match reqwest::header::HeaderName::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                warn!(header = %key, "skipping invalid header name");
                continue;
            }
        };
        let value = match reqwest::header::HeaderValue::from_str(value) {
            Ok(value) => value,
            Err(_) => {
                warn!(header = %key, "skipping invalid header value");
                continue;
            }
        };
        header_map.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(header_map)
        .build()
        .context("failed to build http client for tool server")
}
