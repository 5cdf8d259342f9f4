//! Wire protocol between the worknode agent and the control plane.
//!
//! Every frame on the WebSocket is a JSON [`Envelope`] with an opaque id,
//! a type tag, a type-dependent payload object, and a unix-millisecond
//! timestamp. Payload schemas are defined here so both the session layer
//! and the task handler share one vocabulary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Prefix for outbound envelope ids, e.g. `msg_9f2c41d0a6b34e5c8d7e0f1a2b3c4d5e`.
pub const ENVELOPE_ID_PREFIX: &str = "msg_";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Message type tag. The set is closed on our side; anything else a future
/// control plane sends decodes as `Unknown` and is logged and dropped
/// rather than failing the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Control plane -> agent, first frame after connect.
    Welcome,

    /// Agent -> control plane, every 30s.
    Heartbeat,

    /// Agent -> control plane. Reserved for streamed stdout/stderr;
    /// declared in the wire vocabulary but not emitted today.
    TaskOutput,

    /// Agent -> control plane, terminal result for a task.
    TaskResult,

    /// Agent -> control plane, result of a proxied MCP call.
    McpResult,

    /// Control plane -> agent, a workspace operation to execute.
    TaskRequest,

    /// Control plane -> agent, cancel an in-flight task.
    TaskCancel,

    /// Control plane -> agent, invoke a tool on an external MCP server.
    McpCall,

    /// Any type tag this agent does not know.
    Unknown,
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "welcome" => MessageType::Welcome,
            "heartbeat" => MessageType::Heartbeat,
            "task.output" => MessageType::TaskOutput,
            "task.result" => MessageType::TaskResult,
            "mcp.result" => MessageType::McpResult,
            "task.request" => MessageType::TaskRequest,
            "task.cancel" => MessageType::TaskCancel,
            "mcp.call" => MessageType::McpCall,
            _ => MessageType::Unknown,
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.to_string()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::Welcome => "welcome",
            MessageType::Heartbeat => "heartbeat",
            MessageType::TaskOutput => "task.output",
            MessageType::TaskResult => "task.result",
            MessageType::McpResult => "mcp.result",
            MessageType::TaskRequest => "task.request",
            MessageType::TaskCancel => "task.cancel",
            MessageType::McpCall => "mcp.call",
            MessageType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// The base wire message. `payload` stays an untyped JSON object until the
/// handler knows which schema to decode it with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl Envelope {
    /// Build an outbound envelope with a fresh id and the current time.
    pub fn new<P: Serialize>(
        message_type: MessageType,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: generate_envelope_id(),
            message_type,
            payload: serde_json::to_value(payload)?,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Decode the payload into a concrete schema.
    pub fn parse_payload<P: serde::de::DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

fn generate_envelope_id() -> String {
    format!("{}{}", ENVELOPE_ID_PREFIX, uuid::Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Session payloads
// ---------------------------------------------------------------------------

/// First frame from the control plane: the identity this node was assigned
/// in the web console (id, display name, routing labels).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub worknode_id: String,
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub worknode_id: String,
    pub name: String,
    pub labels: Vec<String>,
    pub version: String,
    /// Static environment snapshot, sent once per connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HeartbeatMetrics>,
}

/// Environment snapshot attached to the first heartbeat of a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub hostname: String,
    pub shell: String,
    pub home_dir: String,
    pub workspace_root: String,
    pub username: String,
    pub num_cpu: usize,
    pub total_memory_mb: u64,
    /// RFC3339.
    pub current_time: String,
    pub timezone: String,
    /// e.g. "+08:00".
    pub utc_offset: String,
}

/// System metrics slot on the heartbeat. Reserved; the agent does not
/// populate it yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_percent: Option<f64>,
}

// ---------------------------------------------------------------------------
// Task payloads
// ---------------------------------------------------------------------------

/// Workspace operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Read,
    Write,
    List,
    Glob,
    Grep,
    Bash,
    Webfetch,
    McpCall,
    McpListTools,
    SyncSkill,
    /// Any operation tag this agent does not know.
    Unknown,
}

impl From<String> for Operation {
    fn from(s: String) -> Self {
        match s.as_str() {
            "read" => Operation::Read,
            "write" => Operation::Write,
            "list" => Operation::List,
            "glob" => Operation::Glob,
            "grep" => Operation::Grep,
            "bash" => Operation::Bash,
            "webfetch" => Operation::Webfetch,
            "mcp_call" => Operation::McpCall,
            "mcp_list_tools" => Operation::McpListTools,
            "sync_skill" => Operation::SyncSkill,
            _ => Operation::Unknown,
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.to_string()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::List => "list",
            Operation::Glob => "glob",
            Operation::Grep => "grep",
            Operation::Bash => "bash",
            Operation::Webfetch => "webfetch",
            Operation::McpCall => "mcp_call",
            Operation::McpListTools => "mcp_list_tools",
            Operation::SyncSkill => "sync_skill",
            Operation::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequestPayload {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_instance_id: Option<String>,
    pub operation: Operation,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelPayload {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_instance_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Reserved for streaming output; see [`MessageType::TaskOutput`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutputPayload {
    pub task_id: String,
    /// "stdout" or "stderr".
    pub stream: String,
    pub data: String,
}

// ---------------------------------------------------------------------------
// Operation arguments and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadArgs {
    pub path: String,
    #[serde(default)]
    pub offset: u64,
    /// 0 means "to end of file".
    #[serde(default)]
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResult {
    /// Base64-encoded file slice.
    pub content: String,
    pub total_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteArgs {
    pub path: String,
    /// Base64-encoded content.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListArgs {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub ignore: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult {
    pub entries: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobArgs {
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobResult {
    pub matches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrepArgs {
    pub pattern: String,
    #[serde(default)]
    pub include: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    pub line_number: u64,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrepResult {
    pub matches: Vec<GrepMatch>,
    /// `path:line:content` lines, possibly truncated.
    pub content: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub total_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BashArgs {
    pub command: String,
    #[serde(default)]
    pub workdir: String,
    /// Seconds; 0 means the agent default.
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BashResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub total_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebFetchArgs {
    pub url: String,
    /// "markdown" (default), "text", or "html".
    #[serde(default)]
    pub format: String,
    /// Seconds; 0 means the agent default.
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebFetchResult {
    pub content: String,
    /// Final URL after redirects.
    pub url: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub total_size: u64,
}

// ---------------------------------------------------------------------------
// MCP (tool server) payloads
// ---------------------------------------------------------------------------

/// Tool-server connection details, passed from the control plane per call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    /// "stdio" or "sse".
    pub transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub dynamic_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCallArgs {
    pub server: McpServerConfig,
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    /// Seconds; 0 means the agent default.
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpCallResult {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub total_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpListToolsArgs {
    pub server: McpServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpListToolsResult {
    pub tools: Vec<McpToolInfo>,
}

/// A tool invocation pushed by the control plane outside the task flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCallPayload {
    pub call_id: String,
    pub server: McpServerConfig,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResultPayload {
    pub call_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Skill sync payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSkillArgs {
    pub skill_name: String,
    /// Destination directory relative to the workspace root.
    pub skill_dir: String,
    /// Base64-encoded zip archive.
    pub zip_data: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSkillResult {
    pub success: bool,
    /// Workspace-relative path the skill was extracted to.
    pub path: String,
}
