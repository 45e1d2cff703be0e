//! Key/value settings rows (pricing tables, operator overrides).

use std::collections::HashMap;

use rusqlite::params;

use crate::error::StoreError;

use super::Store;

impl Store {
    /// Returns one setting value, or `None` when absent.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
            match stmt.query_row(params![key], |row| row.get::<_, String>(0)) {
                Ok(v) => Ok(Some(v)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Inserts or replaces one setting.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    /// All settings whose key starts with `prefix`.
    pub async fn settings_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        let like = format!("{}%", prefix.replace('%', ""));
        self.read(move |conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings WHERE key LIKE ?1")?;
            let rows = stmt.query_map(params![like], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = HashMap::new();
            for row in rows {
                let (k, v) = row?;
                out.insert(k, v);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: set/get round-trips and replaces on duplicate keys.
    #[tokio::test]
    async fn set_get_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).unwrap();
        store.set_setting("a.b", "1").await.unwrap();
        store.set_setting("a.b", "2").await.unwrap();
        assert_eq!(store.get_setting("a.b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.get_setting("missing").await.unwrap(), None);
    }

    /// **Scenario**: prefix queries return only matching keys.
    #[tokio::test]
    async fn prefix_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).unwrap();
        store.set_setting("x.one", "1").await.unwrap();
        store.set_setting("y.two", "2").await.unwrap();
        let all = store.settings_with_prefix("x.").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all.get("x.one").map(String::as_str), Some("1"));
    }
}
