//! 文件写入工具：在工作区内创建或覆盖文件
//!
//! 每次成功写入都附带撤销动作：原来存在的文件恢复旧内容，新建的文件被删除。

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::UndoAction;
use crate::tools::{input_schema, Tool, ToolContext, ToolResult};

const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Deserialize, JsonSchema)]
struct WriteFileArgs {
    /// 相对工作区根目录的路径
    path: String,
    /// 完整文件内容
    content: String,
    /// 文件已存在时是否覆盖（默认 true）
    #[serde(default)]
    overwrite: Option<bool>,
}

pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            root: root.canonicalize().unwrap_or_else(|_| root.to_path_buf()),
        }
    }

    /// 按字面规范化路径（目标文件可能还不存在，不能依赖 canonicalize），越出根目录即拒绝
    fn resolve(&self, file_path: &str) -> Result<PathBuf, String> {
        let path = Path::new(file_path);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(format!("Access denied: '{}' is outside the workspace", file_path));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }

        if !normalized.starts_with(&self.root) || normalized == self.root {
            return Err(format!("Access denied: '{}' is outside the workspace", file_path));
        }
        Ok(normalized)
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        r#"Create or overwrite a file inside the workspace. Parent directories are created automatically.

Example:
{"path": "src/lib.rs", "content": "pub fn hello() {}"}"#
    }

    fn parameters_schema(&self) -> Value {
        input_schema::<WriteFileArgs>()
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolResult {
        let args: WriteFileArgs = match serde_json::from_value(input) {
            Ok(args) => args,
            Err(e) => return ToolResult::error(format!("Invalid arguments: {e}")),
        };
        if args.content.len() > MAX_FILE_SIZE {
            return ToolResult::error(format!(
                "Content too large: {} bytes (max: {})",
                args.content.len(),
                MAX_FILE_SIZE
            ));
        }
        let path = match self.resolve(&args.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let previous = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return ToolResult::error(format!("Failed to read existing file: {e}")),
        };
        if previous.is_some() && !args.overwrite.unwrap_or(true) {
            return ToolResult::error(format!(
                "File already exists: {}. Use overwrite=true to overwrite.",
                args.path
            ));
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::error(format!("Failed to create parent directory: {e}"));
            }
        }
        if let Err(e) = tokio::fs::write(&path, args.content.as_bytes()).await {
            return ToolResult::error(format!("Failed to write file: {e}"));
        }

        let action = if previous.is_some() { "overwritten" } else { "created" };
        tracing::debug!(path = %path.display(), action, bytes = args.content.len(), "file written");

        let target = path.clone();
        let undo = UndoAction::new(move || async move {
            match previous {
                Some(bytes) => tokio::fs::write(&target, bytes)
                    .await
                    .with_context(|| format!("restore {}", target.display())),
                None => tokio::fs::remove_file(&target)
                    .await
                    .with_context(|| format!("remove {}", target.display())),
            }
        });

        ToolResult::ok(json!({
            "path": args.path,
            "action": action,
            "bytes": args.content.len(),
        }))
        .with_undo(undo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ToolContext {
        ToolContext {
            chat_id: "c1".into(),
            tool_call_id: "t1".into(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_undo_removes_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(dir.path());
        let result = tool
            .execute(json!({"path": "nested/a.txt", "content": "hello"}), &ctx())
            .await;
        assert!(result.success);
        let file = dir.path().join("nested/a.txt");
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "hello");

        result.undo.unwrap().run().await.unwrap();
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_undo_restores_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "old").unwrap();
        let tool = WriteFileTool::new(dir.path());

        let result = tool
            .execute(json!({"path": "a.txt", "content": "new"}), &ctx())
            .await;
        assert_eq!(result.output.as_ref().unwrap()["action"], "overwritten");
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "new");

        result.undo.unwrap().run().await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "old");
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(dir.path());
        let result = tool
            .execute(json!({"path": "../escape.txt", "content": "x"}), &ctx())
            .await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("outside the workspace"));
        assert!(result.undo.is_none());
    }

    #[tokio::test]
    async fn test_refuses_overwrite_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let tool = WriteFileTool::new(dir.path());
        let result = tool
            .execute(
                json!({"path": "a.txt", "content": "new", "overwrite": false}),
                &ctx(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old");
    }
}
