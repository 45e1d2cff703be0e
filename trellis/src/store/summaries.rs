//! Conversation summaries: the compaction cache, keyed by conversation id.
//!
//! Watermark = number of non-system messages already covered by the summary;
//! it never decreases for a conversation.

use rusqlite::params;

use crate::error::StoreError;

use super::{now_millis, Store};

/// One cached summary row.
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub conversation_id: String,
    pub summary: String,
    pub watermark: i64,
    pub compaction_count: i64,
    pub updated_at: i64,
}

impl Store {
    /// Loads the cached summary for a conversation, when one exists.
    pub async fn get_summary(
        &self,
        conversation_id: &str,
    ) -> Result<Option<SummaryRow>, StoreError> {
        let conversation_id = conversation_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, summary, watermark, compaction_count, updated_at
                 FROM conversation_summaries WHERE conversation_id = ?1",
            )?;
            match stmt.query_row(params![conversation_id], |row| {
                Ok(SummaryRow {
                    conversation_id: row.get(0)?,
                    summary: row.get(1)?,
                    watermark: row.get(2)?,
                    compaction_count: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            }) {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Inserts or rewrites the summary. The stored watermark never moves
    /// backwards; a lower incoming watermark keeps the existing one.
    pub async fn upsert_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        watermark: i64,
    ) -> Result<(), StoreError> {
        let conversation_id = conversation_id.to_string();
        let summary = summary.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO conversation_summaries
                    (conversation_id, summary, watermark, compaction_count, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    summary = excluded.summary,
                    watermark = MAX(watermark, excluded.watermark),
                    compaction_count = compaction_count + 1,
                    updated_at = excluded.updated_at",
                params![conversation_id, summary, watermark, now_millis()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: upsert creates, then rewrites and bumps the count.
    #[tokio::test]
    async fn upsert_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).unwrap();

        assert!(store.get_summary("c1").await.unwrap().is_none());
        store.upsert_summary("c1", "first", 10).await.unwrap();
        let row = store.get_summary("c1").await.unwrap().unwrap();
        assert_eq!(row.summary, "first");
        assert_eq!(row.watermark, 10);
        assert_eq!(row.compaction_count, 1);

        store.upsert_summary("c1", "second", 20).await.unwrap();
        let row = store.get_summary("c1").await.unwrap().unwrap();
        assert_eq!(row.summary, "second");
        assert_eq!(row.watermark, 20);
        assert_eq!(row.compaction_count, 2);
    }

    /// **Scenario**: the watermark is monotone; a lower value is ignored.
    #[tokio::test]
    async fn watermark_never_decreases() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).unwrap();
        store.upsert_summary("c1", "a", 30).await.unwrap();
        store.upsert_summary("c1", "b", 12).await.unwrap();
        let row = store.get_summary("c1").await.unwrap().unwrap();
        assert_eq!(row.watermark, 30);
        assert_eq!(row.summary, "b");
    }
}
