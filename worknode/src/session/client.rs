//! WebSocket client for the control-plane session.
//!
//! One connection at a time. Per connection the client runs a read loop
//! with an idle deadline, a send loop draining the bounded outbound
//! queue, and a heartbeat ticker; the environment snapshot rides on the
//! first heartbeat of each connection only. Reconnects use exponential
//! backoff with a hard attempt cap.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use worknode_protocol::{
    Envelope, EnvironmentInfo, HeartbeatPayload, MessageType, WelcomePayload,
};

use crate::session::TaskHandler;

/// Heartbeat interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Per-frame write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Read deadline, refreshed on every inbound frame.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long to wait for the welcome frame after connecting.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);
/// Reconnect attempt cap before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);
/// Outbound queue capacity. `send` fails fast when it is full.
const SEND_QUEUE_CAPACITY: usize = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handle for queueing frames onto the active connection.
///
/// Shared between the client (which installs a fresh queue per
/// connection) and the task handler (which sends results through it), so
/// neither needs a pointer to the other.
#[derive(Clone, Default)]
pub struct Outbound {
    sender: Arc<Mutex<Option<mpsc::Sender<Message>>>>,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marshal an envelope and queue it. Fails fast when no connection is
    /// active or the queue is full; callers log and drop.
    pub fn send_payload<P: Serialize>(&self, message_type: MessageType, payload: &P) -> Result<()> {
        let envelope =
            Envelope::new(message_type, payload).context("failed to create message")?;
        let text = serde_json::to_string(&envelope).context("failed to marshal message")?;
        self.send_raw(Message::Text(text.into()))
    }

    fn send_raw(&self, message: Message) -> Result<()> {
        let guard = self.sender.lock().unwrap();
        let Some(sender) = guard.as_ref() else {
            bail!("not connected");
        };
        sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("send queue full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("connection closed"),
        })
    }

    pub(crate) fn install(&self, sender: mpsc::Sender<Message>) {
        *self.sender.lock().unwrap() = Some(sender);
    }

    fn clear(&self) {
        *self.sender.lock().unwrap() = None;
    }
}

/// Identity assigned by the control plane in the welcome frame. Survives
/// reconnects.
#[derive(Debug, Clone, Default)]
struct Identity {
    worknode_id: String,
    name: String,
    labels: Vec<String>,
}

/// The WebSocket session client.
pub struct SessionClient {
    token: String,
    url: String,
    version: String,
    env_info: EnvironmentInfo,
    handler: Arc<TaskHandler>,
    outbound: Outbound,
    identity: Mutex<Identity>,
    stop: CancellationToken,
    closed: AtomicBool,
    draining: AtomicBool,
}

impl SessionClient {
    pub fn new(
        token: impl Into<String>,
        url: impl Into<String>,
        workspace_root: &Path,
        version: impl Into<String>,
        handler: Arc<TaskHandler>,
        outbound: Outbound,
    ) -> Self {
        Self {
            token: token.into(),
            url: url.into(),
            version: version.into(),
            env_info: collect_environment_info(workspace_root),
            handler,
            outbound,
            identity: Mutex::new(Identity::default()),
            stop: CancellationToken::new(),
            closed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        }
    }

    /// Token that descends to every in-flight task; cancelled by `close`.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run the session until `close` is called or reconnects are
    /// exhausted. Dial failures back off exponentially; a lost established
    /// connection reconnects immediately with the counters reset.
    pub async fn run_with_reconnect(&self) -> Result<()> {
        let mut attempt: u32 = 0;
        let mut delay = INITIAL_RECONNECT_DELAY;

        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }

            let ws = match self.connect().await {
                Ok(ws) => ws,
                Err(e) => {
                    attempt += 1;
                    if attempt > MAX_RECONNECT_ATTEMPTS {
                        return Err(e).context("max reconnect attempts exceeded");
                    }
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = format!("{:#}", e),
                        "connection failed, retrying"
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = next_delay(delay);
                    continue;
                }
            };

            attempt = 0;
            delay = INITIAL_RECONNECT_DELAY;

            if let Err(e) = self.run_connection(ws).await {
                warn!(error = format!("{:#}", e), "connection lost");
            }

            if self.stop.is_cancelled() {
                return Ok(());
            }
        }
    }

    /// Stop accepting new task requests while keeping the connection open,
    /// so in-flight tasks can still deliver their results. First step of
    /// graceful shutdown.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Close the session. Idempotent; outstanding sends observe the stop
    /// token and return cleanly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing session");
        self.stop.cancel();
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Dial and perform the welcome handshake. A missing or malformed
    /// welcome is logged but does not fail the connection.
    async fn connect(&self) -> Result<WsStream> {
        let url = compose_url(&self.url, &self.token);
        info!(url = %self.url, "connecting to control plane");

        let (mut ws, _response) =
            tokio_tungstenite::connect_async(url.as_str()).await.map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::Http(response) => {
                    anyhow!("failed to connect (status: {})", response.status())
                }
                other => anyhow!("failed to connect: {}", other),
            })?;

        match tokio::time::timeout(WELCOME_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) if envelope.message_type == MessageType::Welcome => {
                    match envelope.parse_payload::<WelcomePayload>() {
                        Ok(welcome) => {
                            let mut identity = self.identity.lock().unwrap();
                            identity.worknode_id = welcome.worknode_id;
                            identity.name = welcome.name;
                            identity.labels = welcome.labels;
                            info!(
                                worknode_id = %identity.worknode_id,
                                name = %identity.name,
                                labels = ?identity.labels,
                                "connected to control plane"
                            );
                        }
                        Err(e) => warn!(error = %e, "failed to parse welcome payload"),
                    }
                }
                Ok(envelope) => warn!(
                    message_type = %envelope.message_type,
                    "expected welcome message"
                ),
                Err(e) => warn!(error = %e, "failed to parse welcome message"),
            },
            Ok(_) => warn!("unexpected frame while waiting for welcome"),
            Err(_) => warn!("timed out waiting for welcome message"),
        }

        Ok(ws)
    }

    /// Drive one established connection: send loop, heartbeat ticker, and
    /// read loop with an idle deadline. Returns when the connection drops
    /// or the session is stopped.
    async fn run_connection(&self, ws: WsStream) -> Result<()> {
        let (mut sink, mut stream) = ws.split();

        // Connection-scoped state: fresh queue, fresh env-info flag.
        let (sender, mut receiver) = mpsc::channel::<Message>(SEND_QUEUE_CAPACITY);
        self.outbound.install(sender);
        let env_info_sent = AtomicBool::new(false);

        let send_task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match tokio::time::timeout(WRITE_TIMEOUT, sink.send(message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "failed to send message");
                        break;
                    }
                    Err(_) => {
                        error!("write deadline exceeded");
                        break;
                    }
                }
            }
        });

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut deadline = tokio::time::Instant::now() + READ_IDLE_TIMEOUT;

        let result = loop {
            tokio::select! {
                _ = self.stop.cancelled() => break Ok(()),
                // First tick fires immediately.
                _ = heartbeat.tick() => self.send_heartbeat(&env_info_sent),
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(anyhow!("read deadline exceeded"));
                }
                frame = stream.next() => {
                    // Any inbound frame refreshes the deadline.
                    deadline = tokio::time::Instant::now() + READ_IDLE_TIMEOUT;
                    match frame {
                        None => break Err(anyhow!("connection closed")),
                        Some(Err(e)) => break Err(anyhow!("read error: {}", e)),
                        Some(Ok(message)) => self.handle_frame(message),
                    }
                }
            }
        };

        self.outbound.clear();
        send_task.abort();
        result
    }

    fn handle_frame(&self, message: Message) {
        match message {
            Message::Text(text) => {
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "failed to unmarshal message");
                        return;
                    }
                };

                if self.draining.load(Ordering::SeqCst)
                    && envelope.message_type == MessageType::TaskRequest
                {
                    warn!("draining, rejecting new task request");
                    return;
                }

                // Handlers run in their own task so a slow operation never
                // blocks the read loop. The execution context descends from
                // the session so shutdown reaches in-flight work.
                let handler = self.handler.clone();
                let ctx = self.stop.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle(&ctx, envelope) {
                        error!(error = format!("{:#}", e), "failed to handle message");
                    }
                });
            }
            Message::Ping(data) => {
                if let Err(e) = self.outbound.send_raw(Message::Pong(data)) {
                    warn!(error = %e, "failed to queue pong");
                }
            }
            Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
            Message::Close(_) => debug!("received close frame"),
        }
    }

    fn send_heartbeat(&self, env_info_sent: &AtomicBool) {
        let identity = self.identity.lock().unwrap().clone();
        let mut payload = HeartbeatPayload {
            worknode_id: identity.worknode_id,
            name: identity.name,
            labels: identity.labels,
            version: self.version.clone(),
            environment: None,
            metrics: None,
        };

        // The snapshot is static; send it once per connection.
        if !env_info_sent.swap(true, Ordering::SeqCst) {
            debug!("sending environment info with first heartbeat");
            payload.environment = Some(self.env_info.clone());
        }

        if let Err(e) = self.outbound.send_payload(MessageType::Heartbeat, &payload) {
            warn!(error = %e, "failed to send heartbeat");
        }
    }

    #[cfg(test)]
    fn heartbeat_for_test(&self, env_info_sent: &AtomicBool) {
        self.send_heartbeat(env_info_sent)
    }
}

fn compose_url(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}token={}", url, separator, token)
}

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(MAX_RECONNECT_DELAY)
}

// ---------------------------------------------------------------------------
// Environment snapshot
// ---------------------------------------------------------------------------

/// Gather the static host snapshot attached to the first heartbeat of
/// each connection.
fn collect_environment_info(workspace_root: &Path) -> EnvironmentInfo {
    let system = sysinfo::System::new_all();
    let now = chrono::Local::now();

    EnvironmentInfo {
        os: std::env::consts::OS.to_string(),
        os_version: os_version(),
        arch: std::env::consts::ARCH.to_string(),
        hostname: sysinfo::System::host_name().unwrap_or_default(),
        shell: default_shell(),
        home_dir: std::env::var("HOME").unwrap_or_default(),
        workspace_root: workspace_root.to_string_lossy().into_owned(),
        username: std::env::var("USER").unwrap_or_default(),
        num_cpu: system.cpus().len(),
        total_memory_mb: system.total_memory() / (1024 * 1024),
        current_time: now.to_rfc3339(),
        timezone: std::env::var("TZ").unwrap_or_else(|_| "Local".to_string()),
        utc_offset: now.format("%:z").to_string(),
    }
}

fn os_version() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(release) = std::fs::read_to_string("/etc/os-release") {
            for line in release.lines() {
                if let Some(version) = line.strip_prefix("VERSION_ID=") {
                    return version.trim_matches('"').to_string();
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(version) = command_output("sw_vers", &["-productVersion"]) {
            return version;
        }
    }

    command_output("uname", &["-r"]).unwrap_or_default()
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    std::process::Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Checker;
    use crate::workspace::Workspace;
    use std::collections::BTreeMap;

    // -----------------------------------------------------------------------
    // URL composition
    // -----------------------------------------------------------------------

    #[test]
    fn compose_url_appends_token() {
        assert_eq!(
            compose_url("wss://api.example.com/worknode/ws", "wnt_abc"),
            "wss://api.example.com/worknode/ws?token=wnt_abc"
        );
    }

    #[test]
    fn compose_url_with_existing_query() {
        assert_eq!(
            compose_url("wss://api.example.com/ws?v=2", "wnt_abc"),
            "wss://api.example.com/ws?v=2&token=wnt_abc"
        );
    }

    // -----------------------------------------------------------------------
    // Backoff
    // -----------------------------------------------------------------------

    #[test]
    fn backoff_doubles_to_ceiling() {
        let mut delay = INITIAL_RECONNECT_DELAY;
        let mut observed = vec![delay];
        for _ in 0..12 {
            delay = next_delay(delay);
            observed.push(delay);
        }

        // Non-decreasing, doubling until the cap.
        for pair in observed.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(observed[0], Duration::from_secs(1));
        assert_eq!(observed[1], Duration::from_secs(2));
        assert_eq!(observed[2], Duration::from_secs(4));
        assert_eq!(*observed.last().unwrap(), MAX_RECONNECT_DELAY);
    }

    // -----------------------------------------------------------------------
    // Environment snapshot
    // -----------------------------------------------------------------------

    #[test]
    fn environment_snapshot_is_populated() {
        let info = collect_environment_info(Path::new("/tmp/ws"));
        assert_eq!(info.os, std::env::consts::OS);
        assert_eq!(info.arch, std::env::consts::ARCH);
        assert_eq!(info.workspace_root, "/tmp/ws");
        assert!(info.num_cpu > 0);
        assert!(!info.current_time.is_empty());
        assert!(!info.utc_offset.is_empty());
        assert!(!info.shell.is_empty());
    }

    // -----------------------------------------------------------------------
    // Heartbeat env one-shot
    // -----------------------------------------------------------------------

    fn test_client() -> (tempfile::TempDir, SessionClient, tokio::sync::mpsc::Receiver<Message>) {
        let dir = tempfile::tempdir().unwrap();
        let checker = Checker::new(&BTreeMap::from([("*".to_string(), "deny".to_string())]));
        let workspace = Arc::new(Workspace::new(dir.path(), checker).unwrap());
        let outbound = Outbound::new();
        let handler = TaskHandler::new(workspace, outbound.clone());

        let (tx, rx) = tokio::sync::mpsc::channel(100);
        outbound.install(tx);

        let client = SessionClient::new(
            "wnt_test",
            "wss://example.com/ws",
            dir.path(),
            "0.1.0",
            handler,
            outbound,
        );
        (dir, client, rx)
    }

    fn heartbeat_payload(message: Message) -> HeartbeatPayload {
        let Message::Text(text) = message else {
            panic!("expected text frame");
        };
        let envelope: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.message_type, MessageType::Heartbeat);
        envelope.parse_payload().unwrap()
    }

    #[tokio::test]
    async fn environment_rides_only_first_heartbeat() {
        let (_dir, client, mut rx) = test_client();
        let env_info_sent = AtomicBool::new(false);

        client.heartbeat_for_test(&env_info_sent);
        client.heartbeat_for_test(&env_info_sent);

        let first = heartbeat_payload(rx.recv().await.unwrap());
        let second = heartbeat_payload(rx.recv().await.unwrap());
        assert!(first.environment.is_some());
        assert!(second.environment.is_none());

        // Reconnect resets the connection-scoped flag and the cycle repeats.
        let env_info_sent = AtomicBool::new(false);
        client.heartbeat_for_test(&env_info_sent);
        let after_reconnect = heartbeat_payload(rx.recv().await.unwrap());
        assert!(after_reconnect.environment.is_some());
        assert_eq!(after_reconnect.version, "0.1.0");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_dir, client, _rx) = test_client();
        client.close();
        client.close();
        assert!(client.stop_token().is_cancelled());
    }

    #[tokio::test]
    async fn send_fails_fast_when_queue_full() {
        let outbound = Outbound::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        outbound.install(tx);

        let payload = worknode_protocol::TaskCancelPayload { task_id: "t".into() };
        assert!(outbound.send_payload(MessageType::TaskCancel, &payload).is_ok());
        let err = outbound
            .send_payload(MessageType::TaskCancel, &payload)
            .unwrap_err()
            .to_string();
        assert!(err.contains("send queue full"));
    }

    #[tokio::test]
    async fn send_fails_when_not_connected() {
        let outbound = Outbound::new();
        let payload = worknode_protocol::TaskCancelPayload { task_id: "t".into() };
        let err = outbound
            .send_payload(MessageType::TaskCancel, &payload)
            .unwrap_err()
            .to_string();
        assert!(err.contains("not connected"));
    }
}
