//! Request metrics: one row per gateway request, with cascaded message and
//! tool-call rows. Created at turn start, finalized once at turn end.

use rusqlite::params;
use serde_json::Value;

use crate::error::StoreError;
use crate::provider::TokenUsage;

use super::{now_millis, Store};

/// Identity attributes captured when a request starts.
#[derive(Debug, Clone, Default)]
pub struct NewRequest {
    pub conversation_id: String,
    pub user_id: String,
    pub instance_id: String,
    pub model: String,
    pub provider: String,
}

/// A fully persisted request row.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: i64,
    pub conversation_id: String,
    pub user_id: String,
    pub instance_id: String,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub cost: f64,
    pub status: String,
    pub latency_ms: i64,
    pub created_at: i64,
}

/// Aggregate rollup per grouping key (user or model).
#[derive(Debug, Clone)]
pub struct RequestTotals {
    pub key: String,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
}

impl Store {
    /// Inserts the request row at turn start (status `failed` until
    /// finalized) and returns its id.
    pub async fn insert_request(&self, req: NewRequest) -> Result<i64, StoreError> {
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO requests
                    (conversation_id, user_id, instance_id, model, provider, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    req.conversation_id,
                    req.user_id,
                    req.instance_id,
                    req.model,
                    req.provider,
                    now_millis()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Finalizes a request with the authoritative usage, cost, and outcome.
    pub async fn finish_request(
        &self,
        id: i64,
        usage: &TokenUsage,
        cost: f64,
        status: &str,
        latency_ms: i64,
    ) -> Result<(), StoreError> {
        let usage = usage.clone();
        let status = status.to_string();
        self.write(move |conn| {
            let updated = conn.execute(
                "UPDATE requests SET
                    input_tokens = ?2, output_tokens = ?3,
                    cache_read_tokens = ?4, cache_write_tokens = ?5,
                    cost = ?6, status = ?7, latency_ms = ?8
                 WHERE id = ?1",
                params![
                    id,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.cache_read_tokens as i64,
                    usage.cache_write_tokens as i64,
                    cost,
                    status,
                    latency_ms
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("request {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Appends one (role, content) message row to a request.
    pub async fn add_message(
        &self,
        request_id: i64,
        role: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let role = role.to_string();
        let content = content.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO messages (request_id, role, content) VALUES (?1, ?2, ?3)",
                params![request_id, role, content],
            )?;
            Ok(())
        })
        .await
    }

    /// Appends one tool-call row (append-only).
    pub async fn add_tool_call(
        &self,
        request_id: i64,
        tool_name: &str,
        parameters: &Value,
        result: &str,
        success: bool,
        execution_ms: i64,
    ) -> Result<(), StoreError> {
        let tool_name = tool_name.to_string();
        let parameters = parameters.to_string();
        let result = result.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO tool_calls
                    (request_id, tool_name, parameters, result, success, execution_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    request_id,
                    tool_name,
                    parameters,
                    result,
                    success as i64,
                    execution_ms,
                    now_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Loads one request row.
    pub async fn get_request(&self, id: i64) -> Result<RequestRecord, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, user_id, instance_id, model, provider,
                        input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
                        cost, status, latency_ms, created_at
                 FROM requests WHERE id = ?1",
            )?;
            let record = stmt.query_row(params![id], |row| {
                Ok(RequestRecord {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    user_id: row.get(2)?,
                    instance_id: row.get(3)?,
                    model: row.get(4)?,
                    provider: row.get(5)?,
                    usage: TokenUsage {
                        input_tokens: row.get::<_, i64>(6)? as u64,
                        output_tokens: row.get::<_, i64>(7)? as u64,
                        cache_read_tokens: row.get::<_, i64>(8)? as u64,
                        cache_write_tokens: row.get::<_, i64>(9)? as u64,
                    },
                    cost: row.get(10)?,
                    status: row.get(11)?,
                    latency_ms: row.get(12)?,
                    created_at: row.get(13)?,
                })
            })?;
            Ok(record)
        })
        .await
    }

    /// Number of tool-call rows for a request (metrics inspection).
    pub async fn count_tool_calls(&self, request_id: i64) -> Result<i64, StoreError> {
        self.read(move |conn| {
            let mut stmt =
                conn.prepare("SELECT COUNT(*) FROM tool_calls WHERE request_id = ?1")?;
            Ok(stmt.query_row(params![request_id], |row| row.get(0))?)
        })
        .await
    }

    /// Per-user token/cost rollups over all completed requests.
    pub async fn totals_by_user(&self) -> Result<Vec<RequestTotals>, StoreError> {
        self.totals_grouped("user_id").await
    }

    /// Per-model token/cost rollups over all completed requests.
    pub async fn totals_by_model(&self) -> Result<Vec<RequestTotals>, StoreError> {
        self.totals_grouped("model").await
    }

    async fn totals_grouped(&self, column: &'static str) -> Result<Vec<RequestTotals>, StoreError> {
        self.read(move |conn| {
            let sql = format!(
                "SELECT {column}, COUNT(*), SUM(input_tokens), SUM(output_tokens), SUM(cost)
                 FROM requests GROUP BY {column} ORDER BY SUM(cost) DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(RequestTotals {
                    key: row.get(0)?,
                    requests: row.get(1)?,
                    input_tokens: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    output_tokens: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    cost: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).unwrap();
        (dir, store)
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            input_tokens: 120,
            output_tokens: 40,
            cache_read_tokens: 10,
            cache_write_tokens: 5,
        }
    }

    /// **Scenario**: a request starts as failed and finalizes with usage + cost.
    #[tokio::test]
    async fn request_lifecycle() {
        let (_dir, store) = store().await;
        let id = store
            .insert_request(NewRequest {
                conversation_id: "c1".into(),
                user_id: "u@example.com".into(),
                model: "claude-sonnet-4-5".into(),
                provider: "anthropic".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let before = store.get_request(id).await.unwrap();
        assert_eq!(before.status, "failed");

        store
            .finish_request(id, &usage(), 0.0123, "completed", 900)
            .await
            .unwrap();
        let after = store.get_request(id).await.unwrap();
        assert_eq!(after.status, "completed");
        assert_eq!(after.usage.input_tokens, 120);
        assert!((after.cost - 0.0123).abs() < 1e-12);
    }

    /// **Scenario**: deleting a request cascades its messages and tool calls.
    #[tokio::test]
    async fn cascade_delete() {
        let (_dir, store) = store().await;
        let id = store
            .insert_request(NewRequest {
                conversation_id: "c1".into(),
                model: "m".into(),
                provider: "openai".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store.add_message(id, "user", "hello").await.unwrap();
        store
            .add_tool_call(id, "web_search", &serde_json::json!({"query": "x"}), "ok", true, 12)
            .await
            .unwrap();
        assert_eq!(store.count_tool_calls(id).await.unwrap(), 1);

        store
            .write(move |conn| {
                conn.execute("DELETE FROM requests WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.count_tool_calls(id).await.unwrap(), 0);
    }

    /// **Scenario**: rollups aggregate tokens and cost per user.
    #[tokio::test]
    async fn totals_by_user_aggregates() {
        let (_dir, store) = store().await;
        for _ in 0..2 {
            let id = store
                .insert_request(NewRequest {
                    conversation_id: "c".into(),
                    user_id: "alice".into(),
                    model: "m".into(),
                    provider: "openai".into(),
                    ..Default::default()
                })
                .await
                .unwrap();
            store
                .finish_request(id, &usage(), 0.5, "completed", 10)
                .await
                .unwrap();
        }
        let totals = store.totals_by_user().await.unwrap();
        let alice = totals.iter().find(|t| t.key == "alice").unwrap();
        assert_eq!(alice.requests, 2);
        assert_eq!(alice.input_tokens, 240);
        assert!((alice.cost - 1.0).abs() < 1e-9);
    }
}
