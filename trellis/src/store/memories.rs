//! Per-user long-term memories, mutated only through the memory tools.
//!
//! Ownership is enforced here: update/delete on someone else's row reports
//! not-found. The character budget is enforced by the tool layer, which
//! needs the remaining budget for its error message.

use rusqlite::params;

use crate::error::StoreError;

use super::{now_millis, Store};

/// One memory row.
#[derive(Debug, Clone)]
pub struct MemoryRow {
    pub id: i64,
    pub user_id: String,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Store {
    /// All memories for one user, oldest first.
    pub async fn list_memories(&self, user_id: &str) -> Result<Vec<MemoryRow>, StoreError> {
        let user_id = user_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, content, created_at, updated_at
                 FROM user_memories WHERE user_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok(MemoryRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    content: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
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

    /// Total stored characters for one user (budget accounting).
    pub async fn memory_chars(&self, user_id: &str) -> Result<usize, StoreError> {
        let user_id = user_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT COALESCE(SUM(LENGTH(content)), 0) FROM user_memories WHERE user_id = ?1",
            )?;
            let total: i64 = stmt.query_row(params![user_id], |row| row.get(0))?;
            Ok(total as usize)
        })
        .await
    }

    /// Inserts a memory and returns its id.
    pub async fn create_memory(&self, user_id: &str, content: &str) -> Result<i64, StoreError> {
        let user_id = user_id.to_string();
        let content = content.to_string();
        self.write(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO user_memories (user_id, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![user_id, content, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Rewrites a memory owned by `user_id`; not-found when the id belongs
    /// to a different user.
    pub async fn update_memory(
        &self,
        user_id: &str,
        id: i64,
        content: &str,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        let content = content.to_string();
        self.write(move |conn| {
            let updated = conn.execute(
                "UPDATE user_memories SET content = ?3, updated_at = ?4
                 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id, content, now_millis()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("memory {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Deletes a memory owned by `user_id`.
    pub async fn delete_memory(&self, user_id: &str, id: i64) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        self.write(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM user_memories WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("memory {id}")));
            }
            Ok(())
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

    /// **Scenario**: create/list/update/delete round-trip for one user.
    #[tokio::test]
    async fn memory_crud() {
        let (_dir, store) = store().await;
        let id = store.create_memory("alice", "likes tacos").await.unwrap();
        let rows = store.list_memories("alice").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "likes tacos");

        store.update_memory("alice", id, "likes al pastor").await.unwrap();
        assert_eq!(store.memory_chars("alice").await.unwrap(), "likes al pastor".len());

        store.delete_memory("alice", id).await.unwrap();
        assert!(store.list_memories("alice").await.unwrap().is_empty());
    }

    /// **Scenario**: another user's id is invisible to update/delete.
    #[tokio::test]
    async fn ownership_enforced() {
        let (_dir, store) = store().await;
        let id = store.create_memory("alice", "secret").await.unwrap();
        let err = store.update_memory("bob", id, "stolen").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        let err = store.delete_memory("bob", id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        // Alice's row is untouched.
        assert_eq!(store.list_memories("alice").await.unwrap()[0].content, "secret");
    }
}
