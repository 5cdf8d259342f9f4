//! Large output truncation and spill-to-file handling.
//!
//! Operation output above the size limit is persisted in full under
//! `.work/outputs/` inside the workspace and replaced on the wire by a
//! preview that names the saved file, so the caller can read the rest
//! back with the `read` operation.

use super::Workspace;

/// Character limit before truncation (roughly 7.5k tokens at 4 chars/token).
pub const MAX_OUTPUT_SIZE: usize = 30_000;
/// Maximum characters in the preview (roughly 2k tokens).
pub const PREVIEW_SIZE: usize = 8_000;
/// Lines shown in the preview.
pub const PREVIEW_LINES: usize = 20;
/// Directory for persisted outputs, relative to the workspace root.
pub const OUTPUTS_DIR: &str = ".work/outputs";
/// Base working directory for agent-internal files.
pub const WORK_DIR: &str = ".work";

#[derive(Debug, Clone, Copy)]
pub struct LargeOutputConfig {
    pub max_output_size: usize,
    pub preview_size: usize,
    pub preview_lines: usize,
}

impl Default for LargeOutputConfig {
    fn default() -> Self {
        Self {
            max_output_size: MAX_OUTPUT_SIZE,
            preview_size: PREVIEW_SIZE,
            preview_lines: PREVIEW_LINES,
        }
    }
}

/// Outcome of processing one operation output.
#[derive(Debug, Clone)]
pub struct ProcessedOutput {
    pub content: String,
    pub truncated: bool,
    pub file_path: Option<String>,
    pub total_size: u64,
}

/// Truncates oversized output and persists the full copy into the workspace.
pub struct LargeOutputProcessor<'a> {
    config: LargeOutputConfig,
    ws: &'a Workspace,
}

impl<'a> LargeOutputProcessor<'a> {
    pub fn new(ws: &'a Workspace, config: LargeOutputConfig) -> Self {
        Self { config, ws }
    }

    /// Pass small content through unchanged; spill large content to a file
    /// and return a preview. Persistence failure degrades to a preview
    /// without a file reference, it does not fail the operation.
    pub async fn process(&self, content: &str, prefix: &str) -> ProcessedOutput {
        let total_size = content.len() as u64;

        if content.len() <= self.config.max_output_size {
            return ProcessedOutput {
                content: content.to_string(),
                truncated: false,
                file_path: None,
                total_size,
            };
        }

        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let file_name = format!(
            "{}_{}_{}.txt",
            prefix,
            &short_id[..8],
            chrono::Utc::now().timestamp()
        );
        let file_path = format!("{}/{}", OUTPUTS_DIR, file_name);

        match self.ws.write_raw(&file_path, content.as_bytes()).await {
            Ok(()) => ProcessedOutput {
                content: self.truncate_content(content, Some(&file_path)),
                truncated: true,
                file_path: Some(file_path),
                total_size,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to persist large output");
                ProcessedOutput {
                    content: self.truncate_content(content, None),
                    truncated: true,
                    file_path: None,
                    total_size,
                }
            }
        }
    }

    fn truncate_content(&self, content: &str, file_path: Option<&str>) -> String {
        let lines: Vec<&str> = content.split('\n').collect();
        let total_lines = lines.len();

        let preview_lines = self.config.preview_lines.min(total_lines);
        let mut preview = lines[..preview_lines].join("\n");
        if preview.len() > self.config.preview_size {
            preview = format!(
                "{}\n... [preview truncated]",
                truncate_at_char_boundary(&preview, self.config.preview_size)
            );
        }

        let mut out = String::new();
        out.push_str("<output_truncated>\n");
        out.push_str(&format!(
            "Output too large ({} chars, {} lines).",
            content.len(),
            total_lines
        ));

        match file_path {
            Some(path) => out.push_str(&format!(" Full content saved to: {}\n\n", path)),
            None => out.push_str(" Could not save full content.\n\n"),
        }

        out.push_str(&format!(
            "Preview (first {} lines):\n```\n{}\n```\n\n",
            preview_lines, preview
        ));

        if let Some(path) = file_path {
            out.push_str(&format!(
                "To read more: read(\"{}\", offset={}, limit=100)\n",
                path, preview_lines
            ));
        }

        out.push_str("</output_truncated>");
        out
    }
}

/// Whether a bash command is reading back a previously persisted output
/// from `.work/`. Those reads bypass the processor so the caller does not
/// get a truncated view of an already-truncated file.
pub fn should_skip_for_work_dir(command: &str) -> bool {
    const READ_COMMANDS: [&str; 6] = ["cat ", "head ", "tail ", "less ", "more ", "bat "];
    let touches_work_dir = command.contains(&format!("{}/", WORK_DIR))
        || command.contains(&format!("{}\\", WORK_DIR));
    touches_work_dir && READ_COMMANDS.iter().any(|cmd| command.contains(cmd))
}

fn truncate_at_char_boundary(s: &str, mut max: usize) -> &str {
    if max >= s.len() {
        return s;
    }
    while !s.is_char_boundary(max) {
        max -= 1;
    }
    &s[..max]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Checker;
    use std::collections::BTreeMap;

    fn test_workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path(), Checker::new(&BTreeMap::new())).unwrap();
        (dir, ws)
    }

    #[tokio::test]
    async fn small_output_passes_through() {
        let (_dir, ws) = test_workspace();
        let processor = LargeOutputProcessor::new(&ws, LargeOutputConfig::default());

        let out = processor.process("hello world", "bash").await;
        assert_eq!(out.content, "hello world");
        assert!(!out.truncated);
        assert!(out.file_path.is_none());
        assert_eq!(out.total_size, 11);
    }

    #[tokio::test]
    async fn boundary_size_is_not_truncated() {
        let (_dir, ws) = test_workspace();
        let processor = LargeOutputProcessor::new(&ws, LargeOutputConfig::default());

        let content = "x".repeat(MAX_OUTPUT_SIZE);
        let out = processor.process(&content, "bash").await;
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn large_output_is_persisted_in_full() {
        let (dir, ws) = test_workspace();
        let processor = LargeOutputProcessor::new(&ws, LargeOutputConfig::default());

        let content: String = (0..5000)
            .map(|i| format!("line number {}\n", i))
            .collect();
        let out = processor.process(&content, "bash").await;

        assert!(out.truncated);
        assert_eq!(out.total_size, content.len() as u64);
        let file_path = out.file_path.expect("full content should be saved");
        assert!(file_path.starts_with(OUTPUTS_DIR));

        let saved = std::fs::read_to_string(dir.path().join(&file_path)).unwrap();
        assert_eq!(saved, content);

        // The preview envelope names the saved file and stays small.
        assert!(out.content.contains("<output_truncated>"));
        assert!(out.content.contains(&file_path));
        assert!(out.content.contains("Preview (first 20 lines):"));
        assert!(out.content.len() < content.len());
    }

    #[tokio::test]
    async fn preview_is_capped_by_size() {
        let (_dir, ws) = test_workspace();
        let processor = LargeOutputProcessor::new(&ws, LargeOutputConfig::default());

        // A single enormous line: the line cap does not help, the char cap must.
        let content = "z".repeat(MAX_OUTPUT_SIZE + 1);
        let out = processor.process(&content, "grep").await;
        assert!(out.truncated);
        assert!(out.content.contains("... [preview truncated]"));
        assert!(out.content.len() < content.len());
    }

    #[tokio::test]
    async fn output_file_name_carries_prefix() {
        let (_dir, ws) = test_workspace();
        let processor = LargeOutputProcessor::new(&ws, LargeOutputConfig::default());

        let content = "y".repeat(MAX_OUTPUT_SIZE + 1);
        let out = processor.process(&content, "webfetch").await;
        let file_path = out.file_path.unwrap();
        let file_name = file_path.rsplit('/').next().unwrap();
        assert!(file_name.starts_with("webfetch_"));
        assert!(file_name.ends_with(".txt"));
    }

    // -----------------------------------------------------------------------
    // Skip hint
    // -----------------------------------------------------------------------

    #[test]
    fn skip_for_work_dir_reads() {
        assert!(should_skip_for_work_dir("cat .work/outputs/bash_1.txt"));
        assert!(should_skip_for_work_dir("head -100 .work/outputs/grep_2.txt"));
        assert!(should_skip_for_work_dir("tail -f .work/outputs/x.txt"));
    }

    #[test]
    fn no_skip_outside_work_dir() {
        assert!(!should_skip_for_work_dir("cat README.md"));
        assert!(!should_skip_for_work_dir("ls .work/outputs"));
        assert!(!should_skip_for_work_dir("rm .work/outputs/bash_1.txt"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "aé漢字";
        for max in 0..=s.len() {
            let t = truncate_at_char_boundary(s, max);
            assert!(t.len() <= max || max >= s.len());
            assert!(s.starts_with(t));
        }
    }
}
