//! File-recall rows: instances (tenants) and their content-addressed files.

use rusqlite::params;

use crate::error::StoreError;

use super::{now_millis, Store};

/// One recall tenant bound to an upstream vector-store credential.
#[derive(Debug, Clone)]
pub struct RecallInstanceRow {
    pub id: String,
    pub name: String,
    pub api_key: String,
    /// Null until the first upload lazily creates the upstream store.
    pub vector_store_id: Option<String>,
    pub access_token: String,
    pub created_at: i64,
}

/// One indexed file within an instance.
#[derive(Debug, Clone)]
pub struct RecallFileRow {
    pub id: String,
    pub instance_id: String,
    pub filename: String,
    pub storage_name: String,
    pub sha256: String,
    pub size: i64,
    pub media_type: String,
    pub upstream_file_id: Option<String>,
    pub upstream_vector_file_id: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub created_at: i64,
}

fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecallFileRow> {
    Ok(RecallFileRow {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        filename: row.get(2)?,
        storage_name: row.get(3)?,
        sha256: row.get(4)?,
        size: row.get(5)?,
        media_type: row.get(6)?,
        upstream_file_id: row.get(7)?,
        upstream_vector_file_id: row.get(8)?,
        status: row.get(9)?,
        error: row.get(10)?,
        created_at: row.get(11)?,
    })
}

const FILE_COLUMNS: &str = "id, instance_id, filename, storage_name, sha256, size, media_type,
    upstream_file_id, upstream_vector_file_id, status, error, created_at";

impl Store {
    /// Creates an instance row; conflict on an existing id reports storage
    /// failure which the API layer maps to 409.
    pub async fn create_recall_instance(
        &self,
        row: RecallInstanceRow,
    ) -> Result<(), StoreError> {
        self.write(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO recall_instances
                    (id, name, api_key, vector_store_id, access_token, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id,
                    row.name,
                    row.api_key,
                    row.vector_store_id,
                    row.access_token,
                    now_millis()
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Storage(format!(
                    "instance {} already exists",
                    row.id
                )));
            }
            Ok(())
        })
        .await
    }

    /// All instances, oldest first.
    pub async fn list_recall_instances(&self) -> Result<Vec<RecallInstanceRow>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, api_key, vector_store_id, access_token, created_at
                 FROM recall_instances ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RecallInstanceRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    api_key: row.get(2)?,
                    vector_store_id: row.get(3)?,
                    access_token: row.get(4)?,
                    created_at: row.get(5)?,
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

    /// One instance by id.
    pub async fn get_recall_instance(
        &self,
        id: &str,
    ) -> Result<Option<RecallInstanceRow>, StoreError> {
        let id = id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, api_key, vector_store_id, access_token, created_at
                 FROM recall_instances WHERE id = ?1",
            )?;
            match stmt.query_row(params![id], |row| {
                Ok(RecallInstanceRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    api_key: row.get(2)?,
                    vector_store_id: row.get(3)?,
                    access_token: row.get(4)?,
                    created_at: row.get(5)?,
                })
            }) {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Updates mutable instance fields (display name, credential).
    pub async fn update_recall_instance(
        &self,
        id: &str,
        name: Option<String>,
        api_key: Option<String>,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        self.write(move |conn| {
            let updated = conn.execute(
                "UPDATE recall_instances SET
                    name = COALESCE(?2, name),
                    api_key = COALESCE(?3, api_key)
                 WHERE id = ?1",
                params![id, name, api_key],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("instance {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Records the lazily created upstream vector store id.
    pub async fn set_recall_vector_store(
        &self,
        id: &str,
        vector_store_id: &str,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let vector_store_id = vector_store_id.to_string();
        self.write(move |conn| {
            conn.execute(
                "UPDATE recall_instances SET vector_store_id = ?2 WHERE id = ?1",
                params![id, vector_store_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Deletes an instance; file rows cascade.
    pub async fn delete_recall_instance(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.write(move |conn| {
            let deleted =
                conn.execute("DELETE FROM recall_instances WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("instance {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Inserts a file row (status `processing`).
    pub async fn insert_recall_file(&self, row: RecallFileRow) -> Result<(), StoreError> {
        self.write(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO recall_files ({FILE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    row.id,
                    row.instance_id,
                    row.filename,
                    row.storage_name,
                    row.sha256,
                    row.size,
                    row.media_type,
                    row.upstream_file_id,
                    row.upstream_vector_file_id,
                    row.status,
                    row.error,
                    now_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Finds a file by its content hash within one instance.
    pub async fn get_recall_file_by_hash(
        &self,
        instance_id: &str,
        sha256: &str,
    ) -> Result<Option<RecallFileRow>, StoreError> {
        let instance_id = instance_id.to_string();
        let sha256 = sha256.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILE_COLUMNS} FROM recall_files
                 WHERE instance_id = ?1 AND sha256 = ?2"
            ))?;
            match stmt.query_row(params![instance_id, sha256], file_from_row) {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// One file by id, scoped to its instance.
    pub async fn get_recall_file(
        &self,
        instance_id: &str,
        file_id: &str,
    ) -> Result<Option<RecallFileRow>, StoreError> {
        let instance_id = instance_id.to_string();
        let file_id = file_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILE_COLUMNS} FROM recall_files WHERE instance_id = ?1 AND id = ?2"
            ))?;
            match stmt.query_row(params![instance_id, file_id], file_from_row) {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// All files of one instance, oldest first.
    pub async fn list_recall_files(
        &self,
        instance_id: &str,
    ) -> Result<Vec<RecallFileRow>, StoreError> {
        let instance_id = instance_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILE_COLUMNS} FROM recall_files
                 WHERE instance_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![instance_id], file_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Marks a file ready with its upstream ids.
    pub async fn mark_recall_file_ready(
        &self,
        file_id: &str,
        upstream_file_id: &str,
        upstream_vector_file_id: &str,
    ) -> Result<(), StoreError> {
        let file_id = file_id.to_string();
        let upstream_file_id = upstream_file_id.to_string();
        let upstream_vector_file_id = upstream_vector_file_id.to_string();
        self.write(move |conn| {
            conn.execute(
                "UPDATE recall_files SET
                    status = 'ready', error = NULL,
                    upstream_file_id = ?2, upstream_vector_file_id = ?3
                 WHERE id = ?1",
                params![file_id, upstream_file_id, upstream_vector_file_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Marks a file failed with its error text.
    pub async fn mark_recall_file_error(
        &self,
        file_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let file_id = file_id.to_string();
        let error = error.to_string();
        self.write(move |conn| {
            conn.execute(
                "UPDATE recall_files SET status = 'error', error = ?2 WHERE id = ?1",
                params![file_id, error],
            )?;
            Ok(())
        })
        .await
    }

    /// Deletes one file row.
    pub async fn delete_recall_file(&self, file_id: &str) -> Result<(), StoreError> {
        let file_id = file_id.to_string();
        self.write(move |conn| {
            conn.execute("DELETE FROM recall_files WHERE id = ?1", params![file_id])?;
            Ok(())
        })
        .await
    }

    /// `(file_count, total_bytes)` over ready files of one instance.
    pub async fn recall_stats(&self, instance_id: &str) -> Result<(i64, i64), StoreError> {
        let instance_id = instance_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM recall_files
                 WHERE instance_id = ?1 AND status = 'ready'",
            )?;
            Ok(stmt.query_row(params![instance_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?)
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

    fn instance(id: &str) -> RecallInstanceRow {
        RecallInstanceRow {
            id: id.to_string(),
            name: "Acme".to_string(),
            api_key: "sk-test".to_string(),
            vector_store_id: None,
            access_token: "deadbeef".to_string(),
            created_at: 0,
        }
    }

    fn file(id: &str, instance: &str, sha: &str) -> RecallFileRow {
        RecallFileRow {
            id: id.to_string(),
            instance_id: instance.to_string(),
            filename: "doc.pdf".to_string(),
            storage_name: format!("{}.pdf", &sha[..16.min(sha.len())]),
            sha256: sha.to_string(),
            size: 1024,
            media_type: "application/pdf".to_string(),
            upstream_file_id: None,
            upstream_vector_file_id: None,
            status: "processing".to_string(),
            error: None,
            created_at: 0,
        }
    }

    /// **Scenario**: duplicate instance ids are rejected.
    #[tokio::test]
    async fn duplicate_instance_rejected() {
        let (_dir, store) = store().await;
        store.create_recall_instance(instance("acme")).await.unwrap();
        let err = store.create_recall_instance(instance("acme")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    /// **Scenario**: `(instance, sha256)` is unique; a second insert fails.
    #[tokio::test]
    async fn content_hash_unique_per_instance() {
        let (_dir, store) = store().await;
        store.create_recall_instance(instance("acme")).await.unwrap();
        let sha = "ab".repeat(32);
        store.insert_recall_file(file("f1", "acme", &sha)).await.unwrap();
        assert!(store.insert_recall_file(file("f2", "acme", &sha)).await.is_err());
        // Same hash in a different instance is fine.
        store.create_recall_instance(instance("beta")).await.unwrap();
        store.insert_recall_file(file("f3", "beta", &sha)).await.unwrap();
    }

    /// **Scenario**: deleting an instance cascades its file rows.
    #[tokio::test]
    async fn instance_delete_cascades_files() {
        let (_dir, store) = store().await;
        store.create_recall_instance(instance("acme")).await.unwrap();
        store
            .insert_recall_file(file("f1", "acme", &"cd".repeat(32)))
            .await
            .unwrap();
        store.delete_recall_instance("acme").await.unwrap();
        assert!(store
            .get_recall_file_by_hash("acme", &"cd".repeat(32))
            .await
            .unwrap()
            .is_none());
    }

    /// **Scenario**: stats count only ready files.
    #[tokio::test]
    async fn stats_count_ready_only() {
        let (_dir, store) = store().await;
        store.create_recall_instance(instance("acme")).await.unwrap();
        store.insert_recall_file(file("f1", "acme", &"11".repeat(32))).await.unwrap();
        store.insert_recall_file(file("f2", "acme", &"22".repeat(32))).await.unwrap();
        store.mark_recall_file_ready("f1", "file-up", "vf-up").await.unwrap();
        let (count, bytes) = store.recall_stats("acme").await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(bytes, 1024);
    }
}
