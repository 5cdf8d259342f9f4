//! Local workspace operations.
//!
//! Every path the control plane hands us resolves through [`Workspace::safe_path`]
//! before it touches the filesystem: first a lexical containment check
//! against the workspace root, then a symlink-resolved one for paths that
//! already exist. Bash commands additionally pass the permission checker
//! before a process is spawned.

pub mod large_output;
mod webfetch;

use std::io::Read as _;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use worknode_protocol::{
    BashArgs, BashResult, GlobArgs, GlobResult, GrepArgs, GrepMatch, GrepResult, ListArgs,
    ListEntry, ListResult, McpCallArgs, McpCallResult, McpListToolsArgs, McpListToolsResult,
    McpToolInfo, ReadArgs, ReadResult, SyncSkillArgs, SyncSkillResult, WriteArgs,
};

use crate::mcp::ToolServerManager;
use crate::permission::Checker;
use large_output::{should_skip_for_work_dir, LargeOutputConfig, LargeOutputProcessor};

/// Default bash timeout when the request does not specify one.
const DEFAULT_BASH_TIMEOUT: Duration = Duration::from_secs(120);
/// Per-stream capture cap for subprocess output. Excess is drained and
/// dropped so the child never blocks on a full pipe.
const MAX_STREAM_CAPTURE: usize = 10 * 1024 * 1024;
/// Per-file extraction cap for skill archives.
const MAX_SKILL_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Handles filesystem, subprocess, and proxied tool-server operations
/// inside one workspace root.
pub struct Workspace {
    root: PathBuf,
    checker: Checker,
    servers: Arc<ToolServerManager>,
}

impl Workspace {
    /// Create a workspace with its own tool-server manager.
    pub fn new(root: &Path, checker: Checker) -> Result<Self> {
        Self::with_tool_servers(root, checker, Arc::new(ToolServerManager::new()))
    }

    /// Create a workspace sharing an injected tool-server manager.
    pub fn with_tool_servers(
        root: &Path,
        checker: Checker,
        servers: Arc<ToolServerManager>,
    ) -> Result<Self> {
        let abs_root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .context("failed to get current directory")?
                .join(root)
        };

        std::fs::create_dir_all(&abs_root).context("failed to create workspace root")?;
        let root = abs_root
            .canonicalize()
            .context("failed to canonicalize workspace root")?;

        Ok(Self {
            root,
            checker,
            servers,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied path to an absolute path guaranteed to lie
    /// inside the workspace root.
    ///
    /// The lexical check catches textual escapes (`../../etc/passwd`); the
    /// canonicalized check catches symlinks pointing outside the root. A
    /// path that does not exist yet skips the symlink check so new files
    /// can be created.
    fn safe_path(&self, path: &str) -> Result<PathBuf> {
        let joined = self.root.join(path.trim_start_matches('/'));
        let normalized = normalize_path(&joined);

        if !normalized.starts_with(&self.root) {
            bail!("path is outside workspace root: {}", path);
        }

        if normalized.symlink_metadata().is_err() {
            return Ok(normalized);
        }

        match normalized.canonicalize() {
            Ok(real_path) => {
                let real_root = self
                    .root
                    .canonicalize()
                    .unwrap_or_else(|_| self.root.clone());
                if !real_path.starts_with(&real_root) {
                    bail!("path escapes workspace root via symlink: {}", path);
                }
                Ok(real_path)
            }
            // Dangling symlink: treat like the creation case.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(normalized),
            Err(e) => Err(e).context("failed to resolve symlinks"),
        }
    }

    // -----------------------------------------------------------------------
    // File operations
    // -----------------------------------------------------------------------

    /// Read a file slice. `offset` past the end returns empty content and
    /// the true size so the caller can tell the difference from an empty
    /// file.
    pub async fn read(&self, args: &ReadArgs) -> Result<ReadResult> {
        let real_path = self.safe_path(&args.path)?;

        let meta = tokio::fs::metadata(&real_path)
            .await
            .context("failed to stat file")?;
        if meta.is_dir() {
            bail!("cannot read a directory: {}", args.path);
        }

        let size = meta.len();
        if args.offset >= size {
            return Ok(ReadResult {
                content: String::new(),
                total_size: size,
            });
        }

        let mut limit = args.limit;
        if limit == 0 || args.offset.saturating_add(limit) > size {
            limit = size - args.offset;
        }

        let mut file = std::fs::File::open(&real_path).context("failed to open file")?;
        use std::io::Seek as _;
        file.seek(std::io::SeekFrom::Start(args.offset))
            .context("failed to seek file")?;
        let mut buf = Vec::with_capacity(limit as usize);
        file.take(limit)
            .read_to_end(&mut buf)
            .context("failed to read file")?;

        Ok(ReadResult {
            content: BASE64.encode(&buf),
            total_size: size,
        })
    }

    /// Write base64-decoded content, creating parent directories.
    pub async fn write(&self, args: &WriteArgs) -> Result<()> {
        let real_path = self.safe_path(&args.path)?;
        let content = BASE64
            .decode(&args.content)
            .context("failed to decode content")?;
        self.write_file(&real_path, &content).await
    }

    /// Write raw bytes to a workspace-relative path. Used internally for
    /// persisting large outputs.
    pub(crate) async fn write_raw(&self, path: &str, content: &[u8]) -> Result<()> {
        let real_path = self.safe_path(path)?;
        self.write_file(&real_path, content).await
    }

    async fn write_file(&self, real_path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = real_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create directory")?;
        }
        tokio::fs::write(real_path, content)
            .await
            .context("failed to write file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(real_path, std::fs::Permissions::from_mode(0o644));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Traversal and search
    // -----------------------------------------------------------------------

    /// List directory entries. Ignore patterns match the entry basename;
    /// a matching directory is pruned entirely.
    pub async fn list(&self, args: &ListArgs) -> Result<ListResult> {
        let real_path = self.safe_path(&args.path)?;

        let ignore: Vec<globset::GlobMatcher> = args
            .ignore
            .iter()
            .filter_map(|pattern| globset::Glob::new(pattern).ok())
            .map(|glob| glob.compile_matcher())
            .collect();

        let mut entries = Vec::new();
        let mut walker = walkdir::WalkDir::new(&real_path).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.context("failed to list directory")?;
            let path = entry.path();

            let rel = match path.strip_prefix(&self.root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                _ => continue,
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            if ignore.iter().any(|matcher| matcher.is_match(&name)) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let meta = entry.metadata().context("failed to stat entry")?;
            entries.push(ListEntry {
                path: rel.to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len(),
            });

            if !args.recursive && meta.is_dir() && path != real_path {
                walker.skip_current_dir();
            }
        }

        Ok(ListResult { entries })
    }

    /// Match a doublestar glob pattern against the workspace tree.
    pub async fn glob(&self, args: &GlobArgs) -> Result<GlobResult> {
        Ok(GlobResult {
            matches: self.glob_matches(&args.pattern)?,
        })
    }

    fn glob_matches(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = globset::GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("failed to glob: invalid pattern {}", pattern))?
            .compile_matcher();

        let mut matches = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };
            if matcher.is_match(rel) {
                matches.push(rel.to_string_lossy().into_owned());
            }
        }

        matches.sort();
        Ok(matches)
    }

    /// Search file contents. Prefers an external `rg` when present, falls
    /// back to an internal scan over globbed files.
    pub async fn grep(&self, args: &GrepArgs) -> Result<GrepResult> {
        let matches = match self.grep_with_ripgrep(args).await? {
            Some(matches) => matches,
            None => self.grep_internal(args)?,
        };

        let mut content = String::with_capacity(matches.len() * 64);
        for m in &matches {
            content.push_str(&format!("{}:{}:{}\n", m.path, m.line_number, m.content));
        }

        let processed = LargeOutputProcessor::new(self, LargeOutputConfig::default())
            .process(&content, "grep")
            .await;

        Ok(GrepResult {
            matches,
            content: processed.content,
            truncated: processed.truncated,
            file_path: processed.file_path,
            total_size: processed.total_size,
        })
    }

    /// Returns `Ok(None)` when ripgrep is not installed.
    async fn grep_with_ripgrep(&self, args: &GrepArgs) -> Result<Option<Vec<GrepMatch>>> {
        let mut cmd = tokio::process::Command::new("rg");
        cmd.args([
            "--column",
            "--line-number",
            "--no-heading",
            "--color",
            "never",
            "--smart-case",
        ]);
        for include in &args.include {
            cmd.arg("--glob").arg(include);
        }
        cmd.arg(&args.pattern)
            .arg(".")
            .current_dir(&self.root)
            .stdin(Stdio::null());

        // rg exits 1 when nothing matched; only a missing binary routes to
        // the internal fallback.
        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("failed to run rg"),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut matches = Vec::new();
        for line in stdout.lines() {
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(4, ':');
            let (Some(path), Some(line_number), Some(_column), Some(content)) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(line_number) = line_number.parse::<u64>() else {
                continue;
            };
            matches.push(GrepMatch {
                path: path.strip_prefix("./").unwrap_or(path).to_string(),
                line_number,
                content: content.to_string(),
            });
        }
        Ok(Some(matches))
    }

    fn grep_internal(&self, args: &GrepArgs) -> Result<Vec<GrepMatch>> {
        let default_include = vec!["**/*".to_string()];
        let include = if args.include.is_empty() {
            &default_include
        } else {
            &args.include
        };

        let mut matches = Vec::new();
        for pattern in include {
            let Ok(files) = self.glob_matches(pattern) else {
                continue;
            };
            for rel in files {
                let Ok(real_path) = self.safe_path(&rel) else {
                    continue;
                };
                let Ok(content) = std::fs::read_to_string(&real_path) else {
                    continue;
                };
                for (index, line) in content.lines().enumerate() {
                    if line.contains(args.pattern.as_str()) {
                        matches.push(GrepMatch {
                            path: rel.clone(),
                            line_number: index as u64 + 1,
                            content: line.to_string(),
                        });
                    }
                }
            }
        }
        Ok(matches)
    }

    // -----------------------------------------------------------------------
    // Bash
    // -----------------------------------------------------------------------

    /// Run a bash command after the permission check. Stdout and stderr are
    /// captured through a bounded collector; output above the cap is drained
    /// and dropped so the subprocess never stalls on a full pipe.
    pub async fn bash(&self, args: &BashArgs, cancel: &CancellationToken) -> Result<BashResult> {
        self.checker.check(&args.command)?;

        let workdir = if args.workdir.is_empty() {
            self.root.clone()
        } else {
            self.safe_path(&args.workdir)?
        };
        let timeout = if args.timeout > 0 {
            Duration::from_secs(args.timeout)
        } else {
            DEFAULT_BASH_TIMEOUT
        };

        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(&args.command)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to execute command")?;

        let stdout_task = tokio::spawn(read_bounded(
            child.stdout.take().context("missing child stdout")?,
        ));
        let stderr_task = tokio::spawn(read_bounded(
            child.stderr.take().context("missing child stderr")?,
        ));

        enum Outcome {
            Completed(std::process::ExitStatus),
            TimedOut,
            Cancelled,
        }

        let outcome = tokio::select! {
            biased;
            status = child.wait() => {
                Outcome::Completed(status.context("failed to wait for command")?)
            }
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        };

        let (stdout, stderr, kill_status) = if matches!(outcome, Outcome::Completed(_)) {
            (
                stdout_task.await.unwrap_or_default(),
                stderr_task.await.unwrap_or_default(),
                None,
            )
        } else {
            let _ = child.start_kill();
            let kill_status = child.wait().await.ok();
            // Orphaned grandchildren can keep the pipes open after the shell
            // is gone; cap how long we wait for EOF.
            let grace = Duration::from_secs(2);
            (
                tokio::time::timeout(grace, stdout_task)
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .unwrap_or_default(),
                tokio::time::timeout(grace, stderr_task)
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .unwrap_or_default(),
                kill_status,
            )
        };

        let result = match outcome {
            Outcome::Completed(status) => BashResult {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
                ..Default::default()
            },
            Outcome::TimedOut => {
                debug!(command = %args.command, "command timed out");
                BashResult {
                    stdout,
                    stderr: "command timed out".into(),
                    exit_code: 124,
                    ..Default::default()
                }
            }
            // Unlike timeout, cancellation returns whatever the process
            // produced until it was killed, with no synthetic message.
            Outcome::Cancelled => {
                debug!(command = %args.command, "command cancelled");
                BashResult {
                    stdout,
                    stderr,
                    exit_code: kill_status.and_then(|status| status.code()).unwrap_or(-1),
                    ..Default::default()
                }
            }
        };

        // Reading back a previously persisted output must not be truncated
        // again.
        if should_skip_for_work_dir(&args.command) {
            let total_size = result.stdout.len() as u64;
            return Ok(BashResult {
                total_size,
                ..result
            });
        }

        let processed = LargeOutputProcessor::new(self, LargeOutputConfig::default())
            .process(&result.stdout, "bash")
            .await;
        Ok(BashResult {
            stdout: processed.content,
            truncated: processed.truncated,
            file_path: processed.file_path,
            total_size: processed.total_size,
            ..result
        })
    }

    // -----------------------------------------------------------------------
    // Tool servers
    // -----------------------------------------------------------------------

    /// Invoke a tool on an external tool server and flatten its content.
    pub async fn mcp_call(&self, args: &McpCallArgs) -> Result<McpCallResult> {
        let arguments = match &args.args {
            serde_json::Value::Null => None,
            serde_json::Value::Object(map) => Some(map.clone()),
            _ => bail!("failed to parse tool arguments: expected a JSON object"),
        };

        let outcome = self
            .servers
            .call_tool(&args.server, &args.tool_name, arguments)
            .await?;

        let processed = LargeOutputProcessor::new(self, LargeOutputConfig::default())
            .process(&outcome.content, "mcp")
            .await;

        Ok(McpCallResult {
            content: processed.content,
            is_error: outcome.is_error,
            truncated: processed.truncated,
            file_path: processed.file_path,
            total_size: processed.total_size,
        })
    }

    /// List the tools an external tool server offers.
    pub async fn mcp_list_tools(&self, args: &McpListToolsArgs) -> Result<McpListToolsResult> {
        let tools = self.servers.list_tools(&args.server).await?;
        Ok(McpListToolsResult {
            tools: tools
                .into_iter()
                .map(|t| McpToolInfo {
                    name: t.name,
                    description: t.description,
                    input_schema: t.input_schema,
                })
                .collect(),
        })
    }

    // -----------------------------------------------------------------------
    // Skill sync
    // -----------------------------------------------------------------------

    /// Replace a skill directory with the contents of a base64 zip archive,
    /// then record its checksum. Entry names are validated against both
    /// `..`/absolute escapes and a post-join containment check.
    pub async fn sync_skill(&self, args: &SyncSkillArgs) -> Result<SyncSkillResult> {
        let skill_dir = self.safe_path(&args.skill_dir)?;

        let zip_data = BASE64
            .decode(&args.zip_data)
            .context("failed to decode zip data")?;

        self.unpack_skill(&zip_data, &skill_dir)
            .context("failed to unzip skill")?;

        let checksum_path = skill_dir.join(".checksum");
        tokio::fs::write(&checksum_path, args.checksum.as_bytes())
            .await
            .context("failed to write checksum")?;

        Ok(SyncSkillResult {
            success: true,
            path: args.skill_dir.clone(),
        })
    }

    fn unpack_skill(&self, data: &[u8], dest: &Path) -> Result<()> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(data))
            .context("failed to read zip archive")?;

        if dest.exists() {
            std::fs::remove_dir_all(dest).context("failed to remove existing directory")?;
        }
        std::fs::create_dir_all(dest).context("failed to create destination directory")?;

        for index in 0..archive.len() {
            let mut file = archive
                .by_index(index)
                .context("failed to read zip entry")?;
            let name = file.name().to_string();

            let clean = clean_zip_entry(Path::new(&name));
            if clean.starts_with("..") || clean.is_absolute() {
                bail!("invalid file path in zip: {}", name);
            }

            let target = normalize_path(&dest.join(&clean));
            if !target.starts_with(dest) {
                bail!("file path escapes destination: {}", name);
            }

            if file.is_dir() {
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("failed to create directory {}", clean.display()))?;
                continue;
            }

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).context("failed to create parent directory")?;
            }

            let mut out = std::fs::File::create(&target)
                .with_context(|| format!("failed to extract {}", clean.display()))?;
            // Per-file cap bounds decompression bombs.
            let mut limited = (&mut file).take(MAX_SKILL_FILE_SIZE);
            std::io::copy(&mut limited, &mut out)
                .with_context(|| format!("failed to extract {}", clean.display()))?;

            #[cfg(unix)]
            if let Some(mode) = file.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode));
            }
        }
        Ok(())
    }
}

/// Clean an archive entry name lexically. Unlike [`normalize_path`], a
/// leading `..` survives so the caller can reject it.
fn clean_zip_entry(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(parts.last(), Some(Component::Normal(_))) {
                    parts.pop();
                } else {
                    parts.push(component);
                }
            }
            other => parts.push(other),
        }
    }
    parts.iter().map(|c| c.as_os_str()).collect()
}

/// Resolve `.` and `..` components lexically, without touching the
/// filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}

/// Drain a child stream to completion, keeping at most
/// [`MAX_STREAM_CAPTURE`] bytes.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> String {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_STREAM_CAPTURE.saturating_sub(kept.len());
                let take = room.min(n);
                kept.extend_from_slice(&chunk[..take]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write as _;

    fn allow_all() -> Checker {
        Checker::new(&BTreeMap::from([("*".to_string(), "allow".to_string())]))
    }

    fn test_workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path(), allow_all()).unwrap();
        (dir, ws)
    }

    fn encode(content: &str) -> String {
        BASE64.encode(content.as_bytes())
    }

    fn decode(content: &str) -> String {
        String::from_utf8(BASE64.decode(content).unwrap()).unwrap()
    }

    // -----------------------------------------------------------------------
    // safe_path
    // -----------------------------------------------------------------------

    #[test]
    fn safe_path_resolves_inside_root() {
        let (_dir, ws) = test_workspace();
        let path = ws.safe_path("sub/file.txt").unwrap();
        assert!(path.starts_with(ws.root()));
    }

    #[test]
    fn safe_path_rejects_traversal() {
        let (_dir, ws) = test_workspace();
        let err = ws.safe_path("../../etc/passwd").unwrap_err().to_string();
        assert!(err.contains("outside workspace root"));
    }

    #[test]
    fn safe_path_treats_absolute_as_relative() {
        let (_dir, ws) = test_workspace();
        let path = ws.safe_path("/etc/passwd").unwrap();
        assert!(path.starts_with(ws.root()));
    }

    #[test]
    fn safe_path_allows_dotdot_within_root() {
        let (_dir, ws) = test_workspace();
        let path = ws.safe_path("a/b/../c.txt").unwrap();
        assert_eq!(path, ws.root().join("a/c.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn safe_path_rejects_symlink_escape() {
        let (_dir, ws) = test_workspace();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("secret.txt");
        std::fs::write(&target, b"secret").unwrap();
        std::os::unix::fs::symlink(&target, ws.root().join("link.txt")).unwrap();

        let err = ws.safe_path("link.txt").unwrap_err().to_string();
        assert!(err.contains("escapes workspace root via symlink"));
    }

    #[cfg(unix)]
    #[test]
    fn safe_path_allows_symlink_within_root() {
        let (_dir, ws) = test_workspace();
        std::fs::write(ws.root().join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink(ws.root().join("real.txt"), ws.root().join("alias.txt"))
            .unwrap();

        let path = ws.safe_path("alias.txt").unwrap();
        assert_eq!(path, ws.root().join("real.txt"));
    }

    // -----------------------------------------------------------------------
    // read / write
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let (_dir, ws) = test_workspace();
        ws.write(&WriteArgs {
            path: "notes/hello.txt".into(),
            content: encode("hello worknode"),
        })
        .await
        .unwrap();

        let result = ws
            .read(&ReadArgs {
                path: "notes/hello.txt".into(),
                offset: 0,
                limit: 0,
            })
            .await
            .unwrap();
        assert_eq!(decode(&result.content), "hello worknode");
        assert_eq!(result.total_size, 14);
    }

    #[tokio::test]
    async fn read_with_offset_and_limit() {
        let (_dir, ws) = test_workspace();
        std::fs::write(ws.root().join("data.txt"), b"0123456789").unwrap();

        let result = ws
            .read(&ReadArgs {
                path: "data.txt".into(),
                offset: 3,
                limit: 4,
            })
            .await
            .unwrap();
        assert_eq!(decode(&result.content), "3456");
        assert_eq!(result.total_size, 10);
    }

    #[tokio::test]
    async fn read_offset_past_end_returns_empty_and_size() {
        let (_dir, ws) = test_workspace();
        std::fs::write(ws.root().join("data.txt"), b"abc").unwrap();

        let result = ws
            .read(&ReadArgs {
                path: "data.txt".into(),
                offset: 100,
                limit: 10,
            })
            .await
            .unwrap();
        assert!(result.content.is_empty());
        assert_eq!(result.total_size, 3);
    }

    #[tokio::test]
    async fn read_limit_clamped_to_size() {
        let (_dir, ws) = test_workspace();
        std::fs::write(ws.root().join("data.txt"), b"abcdef").unwrap();

        let result = ws
            .read(&ReadArgs {
                path: "data.txt".into(),
                offset: 4,
                limit: 100,
            })
            .await
            .unwrap();
        assert_eq!(decode(&result.content), "ef");
    }

    #[tokio::test]
    async fn read_rejects_directory() {
        let (_dir, ws) = test_workspace();
        std::fs::create_dir(ws.root().join("subdir")).unwrap();

        let err = ws
            .read(&ReadArgs {
                path: "subdir".into(),
                offset: 0,
                limit: 0,
            })
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("cannot read a directory"));
    }

    #[tokio::test]
    async fn read_outside_root_rejected() {
        let (_dir, ws) = test_workspace();
        let err = ws
            .read(&ReadArgs {
                path: "../../etc/passwd".into(),
                offset: 0,
                limit: 0,
            })
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("outside workspace root"));
    }

    // -----------------------------------------------------------------------
    // list / glob
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn list_non_recursive_prunes_directories() {
        let (_dir, ws) = test_workspace();
        std::fs::write(ws.root().join("top.txt"), b"x").unwrap();
        std::fs::create_dir_all(ws.root().join("sub/inner")).unwrap();
        std::fs::write(ws.root().join("sub/nested.txt"), b"y").unwrap();

        let result = ws
            .list(&ListArgs {
                path: String::new(),
                recursive: false,
                ignore: vec![],
            })
            .await
            .unwrap();

        let paths: Vec<&str> = result.entries.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"top.txt"));
        assert!(paths.contains(&"sub"));
        assert!(!paths.iter().any(|p| p.contains("nested")));
    }

    #[tokio::test]
    async fn list_recursive_includes_nested() {
        let (_dir, ws) = test_workspace();
        std::fs::create_dir_all(ws.root().join("sub")).unwrap();
        std::fs::write(ws.root().join("sub/nested.txt"), b"y").unwrap();

        let result = ws
            .list(&ListArgs {
                path: String::new(),
                recursive: true,
                ignore: vec![],
            })
            .await
            .unwrap();
        let paths: Vec<&str> = result.entries.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"sub/nested.txt"));
    }

    #[tokio::test]
    async fn list_ignore_prunes_matching_directories() {
        let (_dir, ws) = test_workspace();
        std::fs::create_dir_all(ws.root().join("node_modules/pkg")).unwrap();
        std::fs::write(ws.root().join("node_modules/pkg/index.js"), b"x").unwrap();
        std::fs::write(ws.root().join("main.rs"), b"y").unwrap();

        let result = ws
            .list(&ListArgs {
                path: String::new(),
                recursive: true,
                ignore: vec!["node_modules".into()],
            })
            .await
            .unwrap();
        let paths: Vec<&str> = result.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["main.rs"]);
    }

    #[tokio::test]
    async fn glob_doublestar_matches_nested() {
        let (_dir, ws) = test_workspace();
        std::fs::create_dir_all(ws.root().join("src/deep")).unwrap();
        std::fs::write(ws.root().join("src/main.rs"), b"x").unwrap();
        std::fs::write(ws.root().join("src/deep/lib.rs"), b"y").unwrap();
        std::fs::write(ws.root().join("README.md"), b"z").unwrap();

        let result = ws
            .glob(&GlobArgs {
                pattern: "**/*.rs".into(),
            })
            .await
            .unwrap();
        assert_eq!(result.matches, vec!["src/deep/lib.rs", "src/main.rs"]);
    }

    #[tokio::test]
    async fn glob_single_star_stays_in_one_level() {
        let (_dir, ws) = test_workspace();
        std::fs::create_dir_all(ws.root().join("src")).unwrap();
        std::fs::write(ws.root().join("top.rs"), b"x").unwrap();
        std::fs::write(ws.root().join("src/nested.rs"), b"y").unwrap();

        let result = ws
            .glob(&GlobArgs {
                pattern: "*.rs".into(),
            })
            .await
            .unwrap();
        assert_eq!(result.matches, vec!["top.rs"]);
    }

    // -----------------------------------------------------------------------
    // grep
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn grep_finds_matches() {
        let (_dir, ws) = test_workspace();
        std::fs::write(ws.root().join("a.txt"), "hello\nTODO: fix\nbye\n").unwrap();
        std::fs::write(ws.root().join("b.txt"), "nothing here\n").unwrap();

        let result = ws
            .grep(&GrepArgs {
                pattern: "TODO".into(),
                include: vec![],
            })
            .await
            .unwrap();

        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].path, "a.txt");
        assert_eq!(result.matches[0].line_number, 2);
        assert!(result.content.contains("a.txt:2:"));
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn grep_internal_defaults_to_all_files() {
        let (_dir, ws) = test_workspace();
        std::fs::create_dir_all(ws.root().join("deep/deeper")).unwrap();
        std::fs::write(ws.root().join("deep/deeper/x.log"), "needle\n").unwrap();

        let matches = ws
            .grep_internal(&GrepArgs {
                pattern: "needle".into(),
                include: vec![],
            })
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "deep/deeper/x.log");
    }

    #[tokio::test]
    async fn grep_internal_honors_include() {
        let (_dir, ws) = test_workspace();
        std::fs::write(ws.root().join("a.rs"), "needle\n").unwrap();
        std::fs::write(ws.root().join("a.txt"), "needle\n").unwrap();

        let matches = ws
            .grep_internal(&GrepArgs {
                pattern: "needle".into(),
                include: vec!["*.rs".into()],
            })
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "a.rs");
    }

    // -----------------------------------------------------------------------
    // bash
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn bash_captures_stdout_and_exit_code() {
        let (_dir, ws) = test_workspace();
        let result = ws
            .bash(
                &BashArgs {
                    command: "echo hello".into(),
                    workdir: String::new(),
                    timeout: 0,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, 0);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn bash_nonzero_exit_code() {
        let (_dir, ws) = test_workspace();
        let result = ws
            .bash(
                &BashArgs {
                    command: "exit 3".into(),
                    workdir: String::new(),
                    timeout: 0,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn bash_runs_in_workspace_root() {
        let (_dir, ws) = test_workspace();
        let result = ws
            .bash(
                &BashArgs {
                    command: "pwd".into(),
                    workdir: String::new(),
                    timeout: 0,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), ws.root().to_string_lossy());
    }

    #[tokio::test]
    async fn bash_denied_by_checker() {
        let dir = tempfile::tempdir().unwrap();
        let checker = Checker::new(&BTreeMap::from([
            ("*".to_string(), "deny".to_string()),
            ("echo *".to_string(), "allow".to_string()),
        ]));
        let ws = Workspace::new(dir.path(), checker).unwrap();

        let err = ws
            .bash(
                &BashArgs {
                    command: "rm -rf /".into(),
                    workdir: String::new(),
                    timeout: 0,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("denied"));
    }

    #[tokio::test]
    async fn bash_timeout_returns_124() {
        let (_dir, ws) = test_workspace();
        let result = ws
            .bash(
                &BashArgs {
                    command: "sleep 5".into(),
                    workdir: String::new(),
                    timeout: 1,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 124);
        assert_eq!(result.stderr, "command timed out");
    }

    #[tokio::test]
    async fn bash_cancellation_returns_captured_output() {
        let (_dir, ws) = test_workspace();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let result = ws
            .bash(
                &BashArgs {
                    command: "echo started; echo oops >&2; exec sleep 30".into(),
                    workdir: String::new(),
                    timeout: 0,
                },
                &cancel,
            )
            .await
            .unwrap();
        // Output captured up to the kill comes back unmodified; no
        // synthetic message is added.
        assert_eq!(result.stdout, "started\n");
        assert_eq!(result.stderr, "oops\n");
        // Signal-terminated process has no exit code.
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn bash_large_output_is_truncated_and_persisted() {
        let (dir, ws) = test_workspace();
        let result = ws
            .bash(
                &BashArgs {
                    command: "seq 1 20000".into(),
                    workdir: String::new(),
                    timeout: 0,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.truncated);
        assert!(result.total_size > large_output::MAX_OUTPUT_SIZE as u64);
        let file_path = result.file_path.unwrap();
        let saved = std::fs::read_to_string(dir.path().join(&file_path)).unwrap();
        assert!(saved.ends_with("20000\n"));
    }

    #[tokio::test]
    async fn bash_workdir_outside_root_rejected() {
        let (_dir, ws) = test_workspace();
        let err = ws
            .bash(
                &BashArgs {
                    command: "pwd".into(),
                    workdir: "../..".into(),
                    timeout: 0,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("outside workspace root"));
    }

    // -----------------------------------------------------------------------
    // sync_skill
    // -----------------------------------------------------------------------

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in entries {
                writer.start_file(name.to_string(), options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[tokio::test]
    async fn sync_skill_extracts_and_writes_checksum() {
        let (dir, ws) = test_workspace();
        let zip_data = build_zip(&[("SKILL.md", "# deploy"), ("scripts/run.sh", "echo hi")]);

        let result = ws
            .sync_skill(&SyncSkillArgs {
                skill_name: "deploy".into(),
                skill_dir: "skills/deploy".into(),
                zip_data: BASE64.encode(&zip_data),
                checksum: "sha256:abc".into(),
            })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.path, "skills/deploy");
        let base = dir.path().join("skills/deploy");
        assert_eq!(std::fs::read_to_string(base.join("SKILL.md")).unwrap(), "# deploy");
        assert_eq!(
            std::fs::read_to_string(base.join("scripts/run.sh")).unwrap(),
            "echo hi"
        );
        assert_eq!(
            std::fs::read_to_string(base.join(".checksum")).unwrap(),
            "sha256:abc"
        );
    }

    #[tokio::test]
    async fn sync_skill_replaces_existing_directory() {
        let (dir, ws) = test_workspace();
        std::fs::create_dir_all(dir.path().join("skills/deploy")).unwrap();
        std::fs::write(dir.path().join("skills/deploy/stale.txt"), b"old").unwrap();

        let zip_data = build_zip(&[("SKILL.md", "# v2")]);
        ws.sync_skill(&SyncSkillArgs {
            skill_name: "deploy".into(),
            skill_dir: "skills/deploy".into(),
            zip_data: BASE64.encode(&zip_data),
            checksum: "c".into(),
        })
        .await
        .unwrap();

        assert!(!dir.path().join("skills/deploy/stale.txt").exists());
        assert!(dir.path().join("skills/deploy/SKILL.md").exists());
    }

    #[tokio::test]
    async fn sync_skill_rejects_zip_slip() {
        let (dir, ws) = test_workspace();
        let zip_data = build_zip(&[("../evil.txt", "pwned")]);

        let err = ws
            .sync_skill(&SyncSkillArgs {
                skill_name: "deploy".into(),
                skill_dir: "skills/deploy".into(),
                zip_data: BASE64.encode(&zip_data),
                checksum: "c".into(),
            })
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("failed to unzip skill"));
        assert!(!dir.path().join("skills/evil.txt").exists());
    }

    #[tokio::test]
    async fn sync_skill_rejects_absolute_entry() {
        let (_dir, ws) = test_workspace();
        let zip_data = build_zip(&[("/etc/pwned.txt", "pwned")]);

        let result = ws
            .sync_skill(&SyncSkillArgs {
                skill_name: "deploy".into(),
                skill_dir: "skills/deploy".into(),
                zip_data: BASE64.encode(&zip_data),
                checksum: "c".into(),
            })
            .await;
        assert!(result.is_err());
        assert!(!Path::new("/etc/pwned.txt").exists());
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    #[test]
    fn normalize_path_resolves_components() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(normalize_path(Path::new("a/../../b")), PathBuf::from("b"));
    }

    #[tokio::test]
    async fn read_bounded_caps_capture() {
        let data = vec![b'x'; 1000];
        let captured = read_bounded(std::io::Cursor::new(data.clone())).await;
        assert_eq!(captured.len(), 1000);
    }
}
