//! Per-user memory tools: retrieve, create, update, delete.
//!
//! Every mutation checks ownership (the store scopes rows by user id) and
//! the character budget; violations come back as tool errors that tell the
//! model how much budget remains.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{StoreError, ToolError};
use crate::provider::EventSink;
use crate::store::Store;
use crate::tools::{Tool, ToolOutcome, ToolSpec};

/// Which memory operation a tool instance performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    Retrieve,
    Create,
    Update,
    Delete,
}

/// One of the four memory tools, bound to the requesting user.
pub struct MemoryTool {
    store: Store,
    user_id: String,
    max_chars: usize,
    op: MemoryOp,
}

impl MemoryTool {
    pub fn new(store: Store, user_id: impl Into<String>, max_chars: usize, op: MemoryOp) -> Self {
        Self {
            store,
            user_id: user_id.into(),
            max_chars,
            op,
        }
    }

    /// Remaining budget after excluding `excluded_id` (the row being
    /// replaced on update).
    async fn remaining_budget(&self, excluded_id: Option<i64>) -> Result<usize, ToolError> {
        let rows = self
            .store
            .list_memories(&self.user_id)
            .await
            .map_err(|e| ToolError::execution(format!("memory store: {e}")))?;
        let used: usize = rows
            .iter()
            .filter(|r| Some(r.id) != excluded_id)
            .map(|r| r.content.chars().count())
            .sum();
        Ok(self.max_chars.saturating_sub(used))
    }

    fn map_store_error(e: StoreError) -> ToolError {
        match e {
            StoreError::NotFound(what) => {
                ToolError::InvalidInput(format!("no such memory: {what}"))
            }
            other => ToolError::execution(format!("memory store: {other}")),
        }
    }
}

#[async_trait]
impl Tool for MemoryTool {
    fn name(&self) -> &str {
        match self.op {
            MemoryOp::Retrieve => "memory_retrieve",
            MemoryOp::Create => "memory_create",
            MemoryOp::Update => "memory_update",
            MemoryOp::Delete => "memory_delete",
        }
    }

    fn spec(&self) -> ToolSpec {
        let (description, schema) = match self.op {
            MemoryOp::Retrieve => (
                "List everything remembered about this user.",
                json!({ "type": "object", "properties": {} }),
            ),
            MemoryOp::Create => (
                "Store a new long-term memory about this user.",
                json!({
                    "type": "object",
                    "properties": {
                        "content": { "type": "string", "description": "The fact to remember" }
                    },
                    "required": ["content"]
                }),
            ),
            MemoryOp::Update => (
                "Rewrite an existing memory by id.",
                json!({
                    "type": "object",
                    "properties": {
                        "id": { "type": "integer" },
                        "content": { "type": "string" }
                    },
                    "required": ["id", "content"]
                }),
            ),
            MemoryOp::Delete => (
                "Delete a memory by id.",
                json!({
                    "type": "object",
                    "properties": { "id": { "type": "integer" } },
                    "required": ["id"]
                }),
            ),
        };
        ToolSpec {
            name: self.name().to_string(),
            description: description.to_string(),
            input_schema: schema,
        }
    }

    fn describe_start(&self, _args: &Value) -> String {
        match self.op {
            MemoryOp::Retrieve => "Recalling memories…".to_string(),
            MemoryOp::Create => "Saving a memory…".to_string(),
            MemoryOp::Update => "Updating a memory…".to_string(),
            MemoryOp::Delete => "Deleting a memory…".to_string(),
        }
    }

    async fn call(&self, args: Value, _sink: &EventSink) -> Result<ToolOutcome, ToolError> {
        if self.user_id.is_empty() {
            return Err(ToolError::execution(
                "no user identity on this conversation; memory is unavailable",
            ));
        }
        match self.op {
            MemoryOp::Retrieve => {
                let rows = self
                    .store
                    .list_memories(&self.user_id)
                    .await
                    .map_err(Self::map_store_error)?;
                if rows.is_empty() {
                    return Ok(ToolOutcome::ok("No memories stored for this user."));
                }
                let mut text = String::new();
                for row in &rows {
                    text.push_str(&format!("[{}] {}\n", row.id, row.content));
                }
                Ok(ToolOutcome::ok(text)
                    .with_status_done(format!("Recalled {} memories", rows.len())))
            }
            MemoryOp::Create => {
                let content = args["content"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidInput("missing content".to_string()))?;
                let remaining = self.remaining_budget(None).await?;
                if content.chars().count() > remaining {
                    return Err(ToolError::InvalidInput(format!(
                        "memory budget exceeded: {} characters remaining of {}",
                        remaining, self.max_chars
                    )));
                }
                let id = self
                    .store
                    .create_memory(&self.user_id, content)
                    .await
                    .map_err(Self::map_store_error)?;
                Ok(ToolOutcome::ok(format!("Memory {id} saved.")))
            }
            MemoryOp::Update => {
                let id = args["id"]
                    .as_i64()
                    .ok_or_else(|| ToolError::InvalidInput("missing id".to_string()))?;
                let content = args["content"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidInput("missing content".to_string()))?;
                let remaining = self.remaining_budget(Some(id)).await?;
                if content.chars().count() > remaining {
                    return Err(ToolError::InvalidInput(format!(
                        "memory budget exceeded: {} characters remaining of {}",
                        remaining, self.max_chars
                    )));
                }
                self.store
                    .update_memory(&self.user_id, id, content)
                    .await
                    .map_err(Self::map_store_error)?;
                Ok(ToolOutcome::ok(format!("Memory {id} updated.")))
            }
            MemoryOp::Delete => {
                let id = args["id"]
                    .as_i64()
                    .ok_or_else(|| ToolError::InvalidInput("missing id".to_string()))?;
                self.store
                    .delete_memory(&self.user_id, id)
                    .await
                    .map_err(Self::map_store_error)?;
                Ok(ToolOutcome::ok(format!("Memory {id} deleted.")))
            }
        }
    }
}

/// Registers all four memory tools for one user.
pub fn register_memory_tools(
    registry: &mut crate::tools::ToolRegistry,
    store: &Store,
    user_id: &str,
    max_chars: usize,
) {
    for op in [
        MemoryOp::Retrieve,
        MemoryOp::Create,
        MemoryOp::Update,
        MemoryOp::Delete,
    ] {
        registry.register(std::sync::Arc::new(MemoryTool::new(
            store.clone(),
            user_id,
            max_chars,
            op,
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn setup() -> (tempfile::TempDir, Store, EventSink) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        (dir, store, EventSink::new(tx))
    }

    /// **Scenario**: create then retrieve round-trips the memory content.
    #[tokio::test]
    async fn create_and_retrieve() {
        let (_dir, store, sink) = setup().await;
        let create = MemoryTool::new(store.clone(), "alice", 2000, MemoryOp::Create);
        create
            .call(json!({"content": "prefers metric units"}), &sink)
            .await
            .unwrap();

        let retrieve = MemoryTool::new(store, "alice", 2000, MemoryOp::Retrieve);
        let outcome = retrieve.call(json!({}), &sink).await.unwrap();
        assert!(outcome.result.contains("prefers metric units"));
    }

    /// **Scenario**: a create that would blow the budget fails and names the
    /// remaining characters.
    #[tokio::test]
    async fn budget_enforced_with_remaining() {
        let (_dir, store, sink) = setup().await;
        let create = MemoryTool::new(store.clone(), "alice", 20, MemoryOp::Create);
        create.call(json!({"content": "12345"}), &sink).await.unwrap();

        let err = create
            .call(json!({"content": "x".repeat(16)}), &sink)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("15"), "remaining budget in message: {message}");

        // Updating the existing row to a size that fits (excluding itself) works.
        let update = MemoryTool::new(store.clone(), "alice", 20, MemoryOp::Update);
        let id = store.list_memories("alice").await.unwrap()[0].id;
        update
            .call(json!({"id": id, "content": "x".repeat(20)}), &sink)
            .await
            .unwrap();
    }

    /// **Scenario**: cross-user update is rejected as an invalid id.
    #[tokio::test]
    async fn ownership_check() {
        let (_dir, store, sink) = setup().await;
        let create = MemoryTool::new(store.clone(), "alice", 2000, MemoryOp::Create);
        create.call(json!({"content": "private"}), &sink).await.unwrap();
        let id = store.list_memories("alice").await.unwrap()[0].id;

        let bob_delete = MemoryTool::new(store, "bob", 2000, MemoryOp::Delete);
        let err = bob_delete.call(json!({"id": id}), &sink).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }
}
