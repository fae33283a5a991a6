//! Worker persistence and the counter updates routing decisions require.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::routing::Worker;

use super::DatabaseManager;

fn worker_from_row(row: &SqliteRow) -> Result<Worker> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let department_id: Option<String> = row.try_get("department_id")?;
    let trade_categories: String = row.try_get("trade_categories")?;
    Ok(Worker {
        id: Uuid::parse_str(&id)?,
        tenant_id: Uuid::parse_str(&tenant_id)?,
        department_id: department_id.map(|d| Uuid::parse_str(&d)).transpose()?,
        trade_categories: serde_json::from_str(&trade_categories)?,
        active: row.try_get::<i64, _>("active")? != 0,
        available: row.try_get::<i64, _>("available")? != 0,
        current_task_count: row.try_get::<i64, _>("current_task_count")? as u32,
        max_tasks_per_day: row.try_get::<i64, _>("max_tasks_per_day")? as u32,
    })
}

impl DatabaseManager {
    pub async fn insert_worker(&self, worker: &Worker) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers
                (id, tenant_id, department_id, trade_categories, active, available,
                 current_task_count, max_tasks_per_day)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                department_id = excluded.department_id,
                trade_categories = excluded.trade_categories,
                active = excluded.active,
                available = excluded.available,
                max_tasks_per_day = excluded.max_tasks_per_day",
        )
        .bind(worker.id.to_string())
        .bind(worker.tenant_id.to_string())
        .bind(worker.department_id.map(|d| d.to_string()))
        .bind(serde_json::to_string(&worker.trade_categories)?)
        .bind(worker.active as i64)
        .bind(worker.available as i64)
        .bind(worker.current_task_count as i64)
        .bind(worker.max_tasks_per_day as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_workers(&self, tenant_id: Uuid) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers WHERE tenant_id = ? AND active = 1")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(worker_from_row).collect()
    }

    pub async fn list_department_workers(&self, department_id: Uuid) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers WHERE department_id = ? AND active = 1")
            .bind(department_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(worker_from_row).collect()
    }

    /// Increments a worker's daily task count by one, within its own
    /// transaction so a concurrent routing decision never double-assigns
    /// against a stale count.
    pub async fn increment_worker_task_count(&self, worker_id: Uuid) -> Result<()> {
        let mut tx = self.begin_transaction().await?;
        sqlx::query("UPDATE workers SET current_task_count = current_task_count + 1 WHERE id = ?")
            .bind(worker_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Decrements a worker's daily task count by one (floored at zero),
    /// used when a task is reassigned away from them. Runs in its own
    /// transaction for the same reason `increment_worker_task_count` does.
    pub async fn decrement_worker_task_count(&self, worker_id: Uuid) -> Result<()> {
        let mut tx = self.begin_transaction().await?;
        sqlx::query(
            "UPDATE workers SET current_task_count = MAX(current_task_count - 1, 0) WHERE id = ?",
        )
        .bind(worker_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn reset_daily_task_counts(&self, tenant_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE workers SET current_task_count = 0 WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tenants::Tenant;
    use chrono::Utc;

    async fn seed_tenant(db: &DatabaseManager) -> Uuid {
        let tenant_id = Uuid::new_v4();
        db.insert_tenant(&Tenant {
            id: tenant_id,
            name: "Praxis".to_string(),
            industry: "medical".to_string(),
            timezone: "Europe/Berlin".to_string(),
            active: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        tenant_id
    }

    #[tokio::test]
    async fn increment_task_count_persists() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let tenant_id = seed_tenant(&db).await;
        let worker = Worker {
            id: Uuid::new_v4(),
            tenant_id,
            department_id: None,
            trade_categories: vec![],
            active: true,
            available: true,
            current_task_count: 0,
            max_tasks_per_day: 5,
        };
        db.insert_worker(&worker).await.unwrap();
        db.increment_worker_task_count(worker.id).await.unwrap();
        let workers = db.list_workers(tenant_id).await.unwrap();
        assert_eq!(workers[0].current_task_count, 1);
    }

    #[tokio::test]
    async fn decrement_task_count_floors_at_zero() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let tenant_id = seed_tenant(&db).await;
        let worker = Worker {
            id: Uuid::new_v4(),
            tenant_id,
            department_id: None,
            trade_categories: vec![],
            active: true,
            available: true,
            current_task_count: 0,
            max_tasks_per_day: 5,
        };
        db.insert_worker(&worker).await.unwrap();
        db.decrement_worker_task_count(worker.id).await.unwrap();
        let workers = db.list_workers(tenant_id).await.unwrap();
        assert_eq!(workers[0].current_task_count, 0);
    }

    #[tokio::test]
    async fn reset_daily_task_counts_zeroes_tenant() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let tenant_id = seed_tenant(&db).await;
        let worker = Worker {
            id: Uuid::new_v4(),
            tenant_id,
            department_id: None,
            trade_categories: vec![],
            active: true,
            available: true,
            current_task_count: 4,
            max_tasks_per_day: 5,
        };
        db.insert_worker(&worker).await.unwrap();
        db.reset_daily_task_counts(tenant_id).await.unwrap();
        let workers = db.list_workers(tenant_id).await.unwrap();
        assert_eq!(workers[0].current_task_count, 0);
    }
}
