//! Sandbox tools: containerized execution plus host-side file operations on
//! the conversation volume.
//!
//! File tools never enter the container; they act on the mounted volume with
//! a traversal guard that pins every resolved path under the volume root. A
//! `/workspace/` prefix in arguments maps onto that root, matching what
//! executed code sees inside the container.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::provider::EventSink;
use crate::sandbox::{ContainerManager, ExecOutcome};
use crate::tools::{Tool, ToolOutcome, ToolSpec};

/// Guidance appended when the container was OOM-killed.
const OOM_GUIDANCE: &str = "OUT OF MEMORY: the sandbox is capped at 1 GiB. Process data in \
smaller chunks or stream instead of loading everything at once.";
/// Guidance appended when the exec hit the 5-minute kill.
const TIMEOUT_GUIDANCE: &str = "TIMED OUT: commands are killed after 5 minutes. Break the work \
into smaller steps or write intermediate results to /workspace.";

/// Normalizes `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out = PathBuf::from(p.as_os_str()),
            Component::RootDir => out.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(s) => out.push(s),
        }
    }
    out
}

/// Resolves a tool path argument under the volume root, rejecting escapes
/// before any filesystem access.
pub fn resolve_in_volume(volume: &Path, raw: &str) -> Result<PathBuf, ToolError> {
    let trimmed = raw.trim();
    let relative = trimmed
        .strip_prefix("/workspace/")
        .or_else(|| trimmed.strip_prefix("/workspace"))
        .unwrap_or(trimmed)
        .trim_start_matches('/');
    let relative = if relative.is_empty() { "." } else { relative };

    let joined = volume.join(relative);
    let normalized = normalize(&joined);
    if !normalized.starts_with(volume) {
        return Err(ToolError::InvalidInput(format!(
            "path escapes the workspace: {raw}"
        )));
    }
    Ok(normalized)
}

/// Which sandbox operation a tool instance performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxOp {
    Execute,
    WriteFile,
    ReadFile,
    ListFiles,
    DiffEdit,
    Stats,
}

/// One sandbox tool bound to a conversation.
pub struct SandboxTool {
    manager: Arc<ContainerManager>,
    conversation_id: String,
    user_id: String,
    /// Host-side volume root.
    volume: PathBuf,
    op: SandboxOp,
}

impl SandboxTool {
    pub fn new(
        manager: Arc<ContainerManager>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        volume: PathBuf,
        op: SandboxOp,
    ) -> Self {
        Self {
            manager,
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            volume,
            op,
        }
    }

    fn shape_exec(outcome: ExecOutcome) -> ToolOutcome {
        let mut text = String::new();
        if !outcome.stdout.is_empty() {
            text.push_str(&outcome.stdout);
        }
        if !outcome.stderr.is_empty() {
            text.push_str("\n--- stderr ---\n");
            text.push_str(&outcome.stderr);
        }
        text.push_str(&format!("\n(exit code {})", outcome.exit_code));

        if outcome.oom_killed {
            return ToolOutcome::err(format!("{text}\n{OOM_GUIDANCE}"))
                .with_status_done("Command killed: out of memory");
        }
        if outcome.timed_out {
            return ToolOutcome::err(format!("{text}\n{TIMEOUT_GUIDANCE}"))
                .with_status_done("Command killed: timeout");
        }
        if outcome.exit_code != 0 {
            return ToolOutcome::err(text)
                .with_status_done(format!("Command failed (exit {})", outcome.exit_code));
        }
        ToolOutcome::ok(text).with_status_done("Command finished")
    }

    async fn volume_usage(&self) -> (u64, u64) {
        fn walk(dir: &Path, files: &mut u64, bytes: &mut u64) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, files, bytes);
                } else if let Ok(meta) = entry.metadata() {
                    *files += 1;
                    *bytes += meta.len();
                }
            }
        }
        let volume = self.volume.clone();
        tokio::task::spawn_blocking(move || {
            let mut files = 0;
            let mut bytes = 0;
            walk(&volume, &mut files, &mut bytes);
            (files, bytes)
        })
        .await
        .unwrap_or((0, 0))
    }
}

#[async_trait]
impl Tool for SandboxTool {
    fn name(&self) -> &str {
        match self.op {
            SandboxOp::Execute => "sandbox_execute",
            SandboxOp::WriteFile => "sandbox_write_file",
            SandboxOp::ReadFile => "sandbox_read_file",
            SandboxOp::ListFiles => "sandbox_list_files",
            SandboxOp::DiffEdit => "sandbox_diff_edit",
            SandboxOp::Stats => "sandbox_stats",
        }
    }

    fn spec(&self) -> ToolSpec {
        let (description, schema) = match self.op {
            SandboxOp::Execute => (
                "Run a shell command in this conversation's isolated Linux sandbox. \
                 /workspace is the only writable, persistent directory.",
                json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string" },
                        "workdir": { "type": "string", "description": "Default /workspace" }
                    },
                    "required": ["command"]
                }),
            ),
            SandboxOp::WriteFile => (
                "Write a file under /workspace.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["path", "content"]
                }),
            ),
            SandboxOp::ReadFile => (
                "Read a file under /workspace.",
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
            ),
            SandboxOp::ListFiles => (
                "List a directory under /workspace.",
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string", "description": "Default the workspace root" } }
                }),
            ),
            SandboxOp::DiffEdit => (
                "Edit a file under /workspace by literal search-and-replace.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "search": { "type": "string", "description": "Exact text to find" },
                        "replace": { "type": "string" },
                        "global": { "type": "boolean", "description": "Replace every occurrence" }
                    },
                    "required": ["path", "search", "replace"]
                }),
            ),
            SandboxOp::Stats => (
                "Report sandbox status: container liveness and workspace usage.",
                json!({ "type": "object", "properties": {} }),
            ),
        };
        ToolSpec {
            name: self.name().to_string(),
            description: description.to_string(),
            input_schema: schema,
        }
    }

    fn describe_start(&self, args: &Value) -> String {
        match self.op {
            SandboxOp::Execute => format!(
                "Running: {}…",
                args["command"].as_str().unwrap_or_default()
            ),
            SandboxOp::WriteFile => format!(
                "Writing {}…",
                args["path"].as_str().unwrap_or_default()
            ),
            SandboxOp::ReadFile => format!(
                "Reading {}…",
                args["path"].as_str().unwrap_or_default()
            ),
            SandboxOp::ListFiles => "Listing workspace files…".to_string(),
            SandboxOp::DiffEdit => format!(
                "Editing {}…",
                args["path"].as_str().unwrap_or_default()
            ),
            SandboxOp::Stats => "Checking sandbox status…".to_string(),
        }
    }

    async fn call(&self, args: Value, sink: &EventSink) -> Result<ToolOutcome, ToolError> {
        match self.op {
            SandboxOp::Execute => {
                let command = args["command"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidInput("missing command".to_string()))?;
                let workdir = args["workdir"].as_str();
                let outcome = self
                    .manager
                    .exec(&self.conversation_id, &self.user_id, command, workdir, sink)
                    .await
                    .map_err(|e| ToolError::execution(e.to_string()))?;
                Ok(Self::shape_exec(outcome))
            }
            SandboxOp::WriteFile => {
                let raw = args["path"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidInput("missing path".to_string()))?;
                let content = args["content"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidInput("missing content".to_string()))?;
                let path = resolve_in_volume(&self.volume, raw)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| ToolError::execution(format!("create dir: {e}")))?;
                }
                tokio::fs::write(&path, content)
                    .await
                    .map_err(|e| ToolError::execution(format!("write {raw}: {e}")))?;
                Ok(ToolOutcome::ok(format!(
                    "Wrote {} bytes to {raw}",
                    content.len()
                )))
            }
            SandboxOp::ReadFile => {
                let raw = args["path"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidInput("missing path".to_string()))?;
                let path = resolve_in_volume(&self.volume, raw)?;
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| ToolError::execution(format!("read {raw}: {e}")))?;
                Ok(ToolOutcome::ok(content))
            }
            SandboxOp::ListFiles => {
                let raw = args["path"].as_str().unwrap_or("/workspace");
                let path = resolve_in_volume(&self.volume, raw)?;
                let mut entries = tokio::fs::read_dir(&path)
                    .await
                    .map_err(|e| ToolError::execution(format!("list {raw}: {e}")))?;
                let mut lines = Vec::new();
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let meta = entry.metadata().await.ok();
                    let suffix = match &meta {
                        Some(m) if m.is_dir() => "/".to_string(),
                        Some(m) => format!("  ({} bytes)", m.len()),
                        None => String::new(),
                    };
                    lines.push(format!("{name}{suffix}"));
                }
                lines.sort();
                if lines.is_empty() {
                    Ok(ToolOutcome::ok("(empty)"))
                } else {
                    Ok(ToolOutcome::ok(lines.join("\n")))
                }
            }
            SandboxOp::DiffEdit => {
                let raw = args["path"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidInput("missing path".to_string()))?;
                let search = args["search"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidInput("missing search".to_string()))?;
                let replace = args["replace"].as_str().unwrap_or_default();
                let global = args["global"].as_bool().unwrap_or(false);

                let path = resolve_in_volume(&self.volume, raw)?;
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| ToolError::execution(format!("read {raw}: {e}")))?;
                if !content.contains(search) {
                    return Err(ToolError::InvalidInput(format!(
                        "search text not found in {raw}: {search:?}"
                    )));
                }
                let (updated, count) = if global {
                    let count = content.matches(search).count();
                    (content.replace(search, replace), count)
                } else {
                    (content.replacen(search, replace, 1), 1)
                };
                tokio::fs::write(&path, updated)
                    .await
                    .map_err(|e| ToolError::execution(format!("write {raw}: {e}")))?;
                Ok(ToolOutcome::ok(format!(
                    "Replaced {count} occurrence(s) in {raw}"
                )))
            }
            SandboxOp::Stats => {
                let alive = self.manager.is_alive(&self.conversation_id).await;
                let (files, bytes) = self.volume_usage().await;
                Ok(ToolOutcome::ok(format!(
                    "container: {}\nworkspace files: {files}\nworkspace bytes: {bytes}",
                    if alive { "running" } else { "not running" }
                )))
            }
        }
    }
}

/// Registers the six sandbox tools for one conversation.
pub fn register_sandbox_tools(
    registry: &mut crate::tools::ToolRegistry,
    manager: &Arc<ContainerManager>,
    conversation_id: &str,
    user_id: &str,
    volume: &Path,
) {
    for op in [
        SandboxOp::Execute,
        SandboxOp::WriteFile,
        SandboxOp::ReadFile,
        SandboxOp::ListFiles,
        SandboxOp::DiffEdit,
        SandboxOp::Stats,
    ] {
        registry.register(Arc::new(SandboxTool::new(
            manager.clone(),
            conversation_id,
            user_id,
            volume.to_path_buf(),
            op,
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: /workspace prefixes map to the volume root; traversal
    /// attempts are rejected without touching the filesystem.
    #[test]
    fn path_guard() {
        let volume = Path::new("/data/u/c/volume");
        assert_eq!(
            resolve_in_volume(volume, "/workspace/a/b.txt").unwrap(),
            PathBuf::from("/data/u/c/volume/a/b.txt")
        );
        assert_eq!(
            resolve_in_volume(volume, "notes.md").unwrap(),
            PathBuf::from("/data/u/c/volume/notes.md")
        );
        assert_eq!(
            resolve_in_volume(volume, "/workspace").unwrap(),
            PathBuf::from("/data/u/c/volume")
        );
        assert!(resolve_in_volume(volume, "/workspace/../../etc/passwd").is_err());
        assert!(resolve_in_volume(volume, "../secrets").is_err());
        assert!(resolve_in_volume(volume, "a/../../b").is_err());
    }

    /// **Scenario**: OOM exits become error outcomes carrying guidance; a
    /// clean exit stays ok.
    #[test]
    fn exec_shaping() {
        let oom = SandboxTool::shape_exec(ExecOutcome {
            stdout: String::new(),
            stderr: "Killed".to_string(),
            exit_code: 137,
            oom_killed: true,
            timed_out: false,
        });
        assert!(oom.error.as_deref().unwrap_or("").contains("OUT OF MEMORY"));

        let timeout = SandboxTool::shape_exec(ExecOutcome {
            exit_code: 137,
            timed_out: true,
            ..Default::default()
        });
        assert!(timeout.error.as_deref().unwrap_or("").contains("TIMED OUT"));

        let ok = SandboxTool::shape_exec(ExecOutcome {
            stdout: "hello\n".to_string(),
            exit_code: 0,
            ..Default::default()
        });
        assert!(ok.error.is_none());
        assert!(ok.result.contains("hello"));
        assert!(ok.result.contains("exit code 0"));
    }

    /// **Scenario**: diff edit replaces one or all occurrences and reports a
    /// precise error when the search text is absent.
    #[tokio::test]
    async fn diff_edit_behaviour() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().to_path_buf();
        tokio::fs::write(volume.join("f.txt"), "aaa bbb aaa")
            .await
            .unwrap();

        let manager = match ContainerManager::connect(&volume, "img", "net") {
            Ok(m) => m,
            // No Docker socket in the test environment is fine: file tools
            // never talk to the daemon.
            Err(_) => return,
        };
        let tool = SandboxTool::new(
            manager,
            "conv",
            "user",
            volume.clone(),
            SandboxOp::DiffEdit,
        );
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let sink = EventSink::new(tx);

        tool.call(
            json!({"path": "f.txt", "search": "aaa", "replace": "zzz"}),
            &sink,
        )
        .await
        .unwrap();
        assert_eq!(
            tokio::fs::read_to_string(volume.join("f.txt")).await.unwrap(),
            "zzz bbb aaa"
        );

        tool.call(
            json!({"path": "f.txt", "search": "aaa", "replace": "zzz", "global": true}),
            &sink,
        )
        .await
        .unwrap();
        assert_eq!(
            tokio::fs::read_to_string(volume.join("f.txt")).await.unwrap(),
            "zzz bbb zzz"
        );

        let err = tool
            .call(json!({"path": "f.txt", "search": "missing", "replace": "x"}), &sink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
