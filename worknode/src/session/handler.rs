//! Inbound envelope dispatch and task lifecycle tracking.
//!
//! Every `task.request` gets its own execution task and cancellation
//! token; the token map doubles as the in-flight registry used for
//! graceful drain on shutdown. The handler never replies twice: exactly
//! one `task.result` goes out per request, success or failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use worknode_protocol::{
    Envelope, McpCallArgs, McpCallPayload, McpResultPayload, MessageType, Operation,
    TaskCancelPayload, TaskRequestPayload, TaskResultPayload,
};

use crate::session::Outbound;
use crate::workspace::Workspace;

/// Dispatches inbound envelopes to workspace operations.
pub struct TaskHandler {
    workspace: Arc<Workspace>,
    outbound: Outbound,
    running: Mutex<HashMap<String, CancellationToken>>,
    drained: Notify,
}

impl TaskHandler {
    pub fn new(workspace: Arc<Workspace>, outbound: Outbound) -> Arc<Self> {
        Arc::new(Self {
            workspace,
            outbound,
            running: Mutex::new(HashMap::new()),
            drained: Notify::new(),
        })
    }

    /// Handle one inbound envelope. Slow work is spawned so the caller's
    /// read loop never blocks.
    pub fn handle(self: Arc<Self>, ctx: &CancellationToken, envelope: Envelope) -> Result<()> {
        match envelope.message_type {
            MessageType::TaskRequest => self.handle_task_request(ctx, &envelope),
            MessageType::TaskCancel => self.handle_task_cancel(&envelope),
            MessageType::McpCall => self.handle_mcp_call(&envelope),
            other => {
                warn!(message_type = %other, "unknown message type");
                Ok(())
            }
        }
    }

    /// Number of tasks currently in flight.
    pub fn running_task_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Wait for all in-flight tasks to finish. Returns false on timeout.
    pub async fn wait_for_tasks(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.running.lock().unwrap().is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Cancel every in-flight task.
    pub fn cancel_all_tasks(&self) {
        let running = self.running.lock().unwrap();
        for (task_id, token) in running.iter() {
            info!(task_id = %task_id, "cancelling task due to shutdown");
            token.cancel();
        }
    }

    // -----------------------------------------------------------------------
    // task.request
    // -----------------------------------------------------------------------

    fn handle_task_request(self: Arc<Self>, ctx: &CancellationToken, envelope: &Envelope) -> Result<()> {
        let request: TaskRequestPayload = envelope
            .parse_payload()
            .context("failed to decode task request")?;

        info!(
            task_id = %request.task_id,
            operation = %request.operation,
            "received task request"
        );

        let token = ctx.child_token();
        self.running
            .lock()
            .unwrap()
            .insert(request.task_id.clone(), token.clone());

        tokio::spawn(async move {
            self.execute_and_send_result(token, request).await;
        });
        Ok(())
    }

    async fn execute_and_send_result(
        self: Arc<Self>,
        token: CancellationToken,
        request: TaskRequestPayload,
    ) {
        // Bash handles its own cancellation so partial output survives;
        // everything else is raced against the token.
        let outcome = if matches!(request.operation, Operation::Bash) {
            self.execute_task(&token, &request).await
        } else {
            tokio::select! {
                biased;
                outcome = self.execute_task(&token, &request) => outcome,
                _ = token.cancelled() => Err(anyhow!("task cancelled")),
            }
        };

        match outcome {
            Ok(result) => self.send_task_result(&request, true, Some(result), None),
            Err(e) => self.send_task_result(&request, false, None, Some(format!("{:#}", e))),
        }

        self.unregister_task(&request.task_id);
    }

    async fn execute_task(
        &self,
        token: &CancellationToken,
        request: &TaskRequestPayload,
    ) -> Result<serde_json::Value> {
        let ws = &self.workspace;
        match request.operation {
            Operation::Read => {
                let args = parse_args(&request.args, "read")?;
                to_result(ws.read(&args).await?)
            }
            Operation::Write => {
                let args = parse_args(&request.args, "write")?;
                ws.write(&args).await?;
                Ok(serde_json::json!({"success": true}))
            }
            Operation::List => {
                let args = parse_args(&request.args, "list")?;
                to_result(ws.list(&args).await?)
            }
            Operation::Glob => {
                let args = parse_args(&request.args, "glob")?;
                to_result(ws.glob(&args).await?)
            }
            Operation::Grep => {
                let args = parse_args(&request.args, "grep")?;
                to_result(ws.grep(&args).await?)
            }
            Operation::Bash => {
                let args = parse_args(&request.args, "bash")?;
                to_result(ws.bash(&args, token).await?)
            }
            Operation::Webfetch => {
                let args = parse_args(&request.args, "webfetch")?;
                to_result(ws.webfetch(&args).await?)
            }
            Operation::McpCall => {
                let args = parse_args(&request.args, "mcp_call")?;
                to_result(ws.mcp_call(&args).await?)
            }
            Operation::McpListTools => {
                let args = parse_args(&request.args, "mcp_list_tools")?;
                to_result(ws.mcp_list_tools(&args).await?)
            }
            Operation::SyncSkill => {
                let args = parse_args(&request.args, "sync_skill")?;
                to_result(ws.sync_skill(&args).await?)
            }
            Operation::Unknown => Err(anyhow!("unknown operation")),
        }
    }

    fn unregister_task(&self, task_id: &str) {
        self.running.lock().unwrap().remove(task_id);
        self.drained.notify_waiters();
    }

    fn send_task_result(
        &self,
        request: &TaskRequestPayload,
        success: bool,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) {
        let payload = TaskResultPayload {
            task_id: request.task_id.clone(),
            source_instance_id: request.source_instance_id.clone(),
            success,
            result,
            error: error_message,
            exit_code: if success { None } else { Some(1) },
        };
        if let Err(e) = self.outbound.send_payload(MessageType::TaskResult, &payload) {
            error!(task_id = %request.task_id, error = %e, "failed to send task result");
        }
    }

    // -----------------------------------------------------------------------
    // task.cancel
    // -----------------------------------------------------------------------

    fn handle_task_cancel(&self, envelope: &Envelope) -> Result<()> {
        let payload: TaskCancelPayload = envelope
            .parse_payload()
            .context("failed to decode task cancel")?;

        // Cancelling a finished or unknown task is a no-op.
        let token = self.running.lock().unwrap().get(&payload.task_id).cloned();
        if let Some(token) = token {
            info!(task_id = %payload.task_id, "cancelling task");
            token.cancel();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // mcp.call
    // -----------------------------------------------------------------------

    fn handle_mcp_call(self: Arc<Self>, envelope: &Envelope) -> Result<()> {
        let payload: McpCallPayload = envelope
            .parse_payload()
            .context("failed to decode mcp call")?;

        let handler = self;
        tokio::spawn(async move {
            let args = McpCallArgs {
                server: payload.server,
                tool_name: payload.tool_name,
                args: payload.arguments,
                timeout: 0,
            };
            let reply = match handler.workspace.mcp_call(&args).await {
                Ok(result) => McpResultPayload {
                    call_id: payload.call_id,
                    success: true,
                    result: serde_json::to_value(&result).ok(),
                    error: None,
                },
                Err(e) => McpResultPayload {
                    call_id: payload.call_id,
                    success: false,
                    result: None,
                    error: Some(format!("{:#}", e)),
                },
            };
            if let Err(e) = handler
                .outbound
                .send_payload(MessageType::McpResult, &reply)
            {
                error!(call_id = %reply.call_id, error = %e, "failed to send mcp result");
            }
        });
        Ok(())
    }
}

fn parse_args<T: DeserializeOwned>(args: &serde_json::Value, operation: &str) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| anyhow!("invalid {} args: {}", operation, e))
}

fn to_result<T: serde::Serialize>(value: T) -> Result<serde_json::Value> {
    serde_json::to_value(value).context("failed to marshal result")
}
