//! Routed task persistence (the `tasks` table backing the routing engine's `Task`).

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::routing::{Task, TaskStatus, Urgency};

use super::DatabaseManager;

fn urgency_from_str(s: &str) -> Result<Urgency> {
    Ok(match s {
        "notfall" => Urgency::Notfall,
        "dringend" => Urgency::Dringend,
        "normal" => Urgency::Normal,
        "routine" => Urgency::Routine,
        other => return Err(anyhow::anyhow!("unknown urgency: {other}")),
    })
}

fn urgency_to_str(u: Urgency) -> &'static str {
    match u {
        Urgency::Notfall => "notfall",
        Urgency::Dringend => "dringend",
        Urgency::Normal => "normal",
        Urgency::Routine => "routine",
    }
}

fn status_from_str(s: &str) -> Result<TaskStatus> {
    Ok(match s {
        "new" => TaskStatus::New,
        "assigned" => TaskStatus::Assigned,
        "in_progress" => TaskStatus::InProgress,
        "done" => TaskStatus::Done,
        "cancelled" => TaskStatus::Cancelled,
        other => return Err(anyhow::anyhow!("unknown task status: {other}")),
    })
}

fn status_to_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::New => "new",
        TaskStatus::Assigned => "assigned",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Done => "done",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let urgency: String = row.try_get("urgency")?;
    let status: String = row.try_get("status")?;
    let assigned_department_id: Option<String> = row.try_get("assigned_department_id")?;
    let assigned_worker_id: Option<String> = row.try_get("assigned_worker_id")?;
    let assigned_at: Option<String> = row.try_get("assigned_at")?;
    Ok(Task {
        id: Uuid::parse_str(&id)?,
        tenant_id: Uuid::parse_str(&tenant_id)?,
        source_type: row.try_get("source_type")?,
        source_id: row.try_get("source_id")?,
        task_type: row.try_get("task_type")?,
        urgency: urgency_from_str(&urgency)?,
        trade_category: row.try_get("trade_category")?,
        customer_plz: row.try_get("customer_plz")?,
        distance_km: row.try_get("distance_km")?,
        status: status_from_str(&status)?,
        assigned_department_id: assigned_department_id.map(|d| Uuid::parse_str(&d)).transpose()?,
        assigned_worker_id: assigned_worker_id.map(|w| Uuid::parse_str(&w)).transpose()?,
        assigned_at: assigned_at
            .map(|a| DateTime::parse_from_rfc3339(&a).map(|dt| dt.with_timezone(&Utc)))
            .transpose()?,
        assigned_by: row.try_get("assigned_by")?,
        routing_priority: row.try_get::<i64, _>("routing_priority")? as i32,
        routing_reason: row.try_get("routing_reason")?,
    })
}

impl DatabaseManager {
    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks
                (id, tenant_id, source_type, source_id, task_type, urgency, trade_category,
                 customer_plz, distance_km, status, assigned_department_id, assigned_worker_id,
                 assigned_at, assigned_by, routing_priority, routing_reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(task.tenant_id.to_string())
        .bind(&task.source_type)
        .bind(&task.source_id)
        .bind(&task.task_type)
        .bind(urgency_to_str(task.urgency))
        .bind(&task.trade_category)
        .bind(&task.customer_plz)
        .bind(task.distance_km)
        .bind(status_to_str(task.status))
        .bind(task.assigned_department_id.map(|d| d.to_string()))
        .bind(task.assigned_worker_id.map(|w| w.to_string()))
        .bind(task.assigned_at.map(|a| a.to_rfc3339()))
        .bind(&task.assigned_by)
        .bind(task.routing_priority as i64)
        .bind(&task.routing_reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persists the routing outcome of [`crate::routing::RoutingEngine::apply_decision`].
    pub async fn update_task_routing(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET
                status = ?, assigned_department_id = ?, assigned_worker_id = ?,
                assigned_at = ?, assigned_by = ?, routing_priority = ?, routing_reason = ?
             WHERE id = ?",
        )
        .bind(status_to_str(task.status))
        .bind(task.assigned_department_id.map(|d| d.to_string()))
        .bind(task.assigned_worker_id.map(|w| w.to_string()))
        .bind(task.assigned_at.map(|a| a.to_rfc3339()))
        .bind(&task.assigned_by)
        .bind(task.routing_priority as i64)
        .bind(&task.routing_reason)
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_tasks_by_status(&self, tenant_id: Uuid, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE tenant_id = ? AND status = ?")
            .bind(tenant_id.to_string())
            .bind(status_to_str(status))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }
}
