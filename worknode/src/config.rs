use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the worknode agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Authentication token for the control plane (required).
    pub token: String,
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub url: String,
    /// Display name reported on heartbeats. Defaults to the hostname.
    pub name: String,
    /// Custom labels for task routing. Built-in labels are appended on load.
    pub labels: Vec<String>,
    /// Root directory for all workspace operations.
    pub workspace_root: PathBuf,
    pub permission: PermissionConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            url: String::new(),
            name: hostname(),
            labels: Vec::new(),
            workspace_root: default_workspace_root(),
            permission: PermissionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Command permission rules for the bash operation.
///
/// Keys are glob patterns, values are "allow" or "deny". A `BTreeMap`
/// keeps pattern order deterministic (lexicographic), which the checker
/// relies on for last-match-wins evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    pub bash: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// debug, info, warn, error.
    pub level: String,
    /// "text" or "json".
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file (if present), then
    /// `WORKNODE_*` environment variables. CLI flags are applied by the
    /// caller on top of the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("parsing config: {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env();
        if config.permission.bash.is_empty() {
            config.permission.bash = default_rules();
        }
        Ok(config)
    }

    /// Environment variables override file values.
    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("WORKNODE_TOKEN") {
            self.token = token;
        }
        if let Ok(url) = std::env::var("WORKNODE_URL") {
            self.url = url;
        }
        if let Ok(root) = std::env::var("WORKNODE_WORKSPACE") {
            self.workspace_root = PathBuf::from(root);
        }
        if let Ok(level) = std::env::var("WORKNODE_LOG_LEVEL") {
            self.log.level = level;
        }
    }

    /// Validate required fields. Called after flags are merged in.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.token.is_empty(),
            "token is required: use --token or set WORKNODE_TOKEN"
        );
        anyhow::ensure!(
            !self.url.is_empty(),
            "url is required: use --url or set WORKNODE_URL"
        );
        anyhow::ensure!(
            self.url.starts_with("ws://") || self.url.starts_with("wss://"),
            "url must start with ws:// or wss://"
        );
        Ok(())
    }

    /// Labels detected from the host, appended to the configured ones.
    pub fn builtin_labels(&self) -> Vec<String> {
        vec![
            format!("os:{}", std::env::consts::OS),
            format!("arch:{}", std::env::consts::ARCH),
            format!("hostname:{}", hostname()),
        ]
    }

    /// Configured plus built-in labels, in that order.
    pub fn all_labels(&self) -> Vec<String> {
        let mut labels = self.labels.clone();
        labels.extend(self.builtin_labels());
        labels
    }
}

/// Deny everything until the operator opts in.
pub fn default_rules() -> BTreeMap<String, String> {
    BTreeMap::from([("*".to_string(), "deny".to_string())])
}

/// Rules that allow common read-only host inspection commands.
#[allow(dead_code)]
pub fn safe_read_only_rules() -> BTreeMap<String, String> {
    [
        ("*", "deny"),
        ("cat *", "allow"),
        ("head *", "allow"),
        ("tail *", "allow"),
        ("ls", "allow"),
        ("ls *", "allow"),
        ("pwd", "allow"),
        ("whoami", "allow"),
        ("date", "allow"),
        ("echo *", "allow"),
        ("grep *", "allow"),
        ("find *", "allow"),
        ("which *", "allow"),
        ("env", "allow"),
        ("uname", "allow"),
        ("uname *", "allow"),
        ("df", "allow"),
        ("df *", "allow"),
        ("du *", "allow"),
        ("free", "allow"),
        ("free *", "allow"),
        ("uptime", "allow"),
        ("ps", "allow"),
        ("ps *", "allow"),
        ("top -b *", "allow"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Rules for read-only Kubernetes inspection.
#[allow(dead_code)]
pub fn kubernetes_read_only_rules() -> BTreeMap<String, String> {
    [
        ("*", "deny"),
        ("kubectl get *", "allow"),
        ("kubectl describe *", "allow"),
        ("kubectl logs *", "allow"),
        ("kubectl top *", "allow"),
        ("kubectl version", "allow"),
        ("kubectl version *", "allow"),
        ("kubectl cluster-info", "allow"),
        ("kubectl api-resources", "allow"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn config_dir() -> PathBuf {
    home_dir().join(".worknode")
}

fn default_workspace_root() -> PathBuf {
    config_dir().join("workspace")
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_default()
}
