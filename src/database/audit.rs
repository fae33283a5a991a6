//! Audit log persistence. Entries are append-only; the chain itself is
//! verified in memory by [`crate::audit::AuditLogger::verify_chain`] once
//! read back out in insertion order.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::audit::AuditEntry;

use super::DatabaseManager;

fn entry_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let id: String = row.try_get("id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let details: String = row.try_get("details")?;
    Ok(AuditEntry {
        id: Uuid::parse_str(&id)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
        action: row.try_get("action")?,
        actor_id: row.try_get("actor_id")?,
        resource_id: row.try_get("resource_id")?,
        details: serde_json::from_str(&details)?,
        previous_checksum: row.try_get("previous_checksum")?,
        checksum: row.try_get("checksum")?,
    })
}

impl DatabaseManager {
    pub async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log
                (id, timestamp, action, actor_id, resource_id, details, previous_checksum, checksum)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(entry.timestamp.to_rfc3339())
        .bind(&entry.action)
        .bind(&entry.actor_id)
        .bind(&entry.resource_id)
        .bind(serde_json::to_string(&entry.details)?)
        .bind(&entry.previous_checksum)
        .bind(&entry.checksum)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_audit_entries_for_resource(&self, resource_id: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query("SELECT * FROM audit_log WHERE resource_id = ? ORDER BY timestamp ASC")
            .bind(resource_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// The checksum of the most recently inserted entry, for rehydrating an
    /// [`crate::audit::AuditLogger`] after a restart via `with_last_checksum`.
    pub async fn last_audit_checksum(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT checksum FROM audit_log ORDER BY rowid DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<String, _>("checksum")).transpose().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;

    #[tokio::test]
    async fn entries_read_back_in_chain_order_verify() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let logger = AuditLogger::new();
        let e1 = logger.log_event(Uuid::new_v4(), Utc::now(), "task_created", "system", "task-1", serde_json::json!({}));
        let e2 = logger.log_event(Uuid::new_v4(), Utc::now(), "task_assigned", "system", "task-1", serde_json::json!({}));
        db.insert_audit_entry(&e1).await.unwrap();
        db.insert_audit_entry(&e2).await.unwrap();

        let entries = db.list_audit_entries_for_resource("task-1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(AuditLogger::verify_chain(&entries).is_ok());

        let last = db.last_audit_checksum().await.unwrap().unwrap();
        assert_eq!(last, e2.checksum);
    }
}
