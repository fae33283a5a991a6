//! Persistence for the three campaign workflows, one table per task
//! shape matching `reminder_tasks` / `recall_tasks` / `noshow_tasks`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::campaigns::noshow::NoShowTask;
use crate::campaigns::recall::RecallTask;
use crate::campaigns::reminder::ReminderTask;
use crate::campaigns::CampaignTaskStatus;

use super::DatabaseManager;

fn status_from_str(s: &str) -> Result<CampaignTaskStatus> {
    Ok(match s {
        "pending" => CampaignTaskStatus::Pending,
        "calling" => CampaignTaskStatus::Calling,
        "completed" => CampaignTaskStatus::Completed,
        "no_answer" => CampaignTaskStatus::NoAnswer,
        "failed" => CampaignTaskStatus::Failed,
        "rescheduled" => CampaignTaskStatus::Rescheduled,
        "cancelled" => CampaignTaskStatus::Cancelled,
        other => return Err(anyhow::anyhow!("unknown campaign task status: {other}")),
    })
}

fn status_to_str(s: CampaignTaskStatus) -> &'static str {
    match s {
        CampaignTaskStatus::Pending => "pending",
        CampaignTaskStatus::Calling => "calling",
        CampaignTaskStatus::Completed => "completed",
        CampaignTaskStatus::NoAnswer => "no_answer",
        CampaignTaskStatus::Failed => "failed",
        CampaignTaskStatus::Rescheduled => "rescheduled",
        CampaignTaskStatus::Cancelled => "cancelled",
    }
}

fn reminder_from_row(row: &SqliteRow) -> Result<ReminderTask> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let appointment_id: String = row.try_get("appointment_id")?;
    let patient_id: String = row.try_get("patient_id")?;
    let starts_at: String = row.try_get("starts_at")?;
    let status: String = row.try_get("status")?;
    Ok(ReminderTask {
        id: Uuid::parse_str(&id)?,
        tenant_id: Uuid::parse_str(&tenant_id)?,
        appointment_id: Uuid::parse_str(&appointment_id)?,
        patient_id: Uuid::parse_str(&patient_id)?,
        phone_number: row.try_get("phone_number")?,
        starts_at: DateTime::parse_from_rfc3339(&starts_at)?.with_timezone(&Utc),
        provider_name: row.try_get("provider_name")?,
        status: status_from_str(&status)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        last_outcome: row.try_get("last_outcome")?,
    })
}

fn recall_from_row(row: &SqliteRow) -> Result<RecallTask> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let patient_id: String = row.try_get("patient_id")?;
    let status: String = row.try_get("status")?;
    Ok(RecallTask {
        id: Uuid::parse_str(&id)?,
        tenant_id: Uuid::parse_str(&tenant_id)?,
        patient_id: Uuid::parse_str(&patient_id)?,
        phone_number: row.try_get("phone_number")?,
        reason: row.try_get("reason")?,
        status: status_from_str(&status)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        last_outcome: row.try_get("last_outcome")?,
    })
}

fn noshow_from_row(row: &SqliteRow) -> Result<NoShowTask> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let appointment_id: String = row.try_get("appointment_id")?;
    let patient_id: String = row.try_get("patient_id")?;
    let no_show_at: String = row.try_get("no_show_at")?;
    let status: String = row.try_get("status")?;
    Ok(NoShowTask {
        id: Uuid::parse_str(&id)?,
        tenant_id: Uuid::parse_str(&tenant_id)?,
        appointment_id: Uuid::parse_str(&appointment_id)?,
        patient_id: Uuid::parse_str(&patient_id)?,
        phone_number: row.try_get("phone_number")?,
        appointment_type: row.try_get("appointment_type")?,
        no_show_at: DateTime::parse_from_rfc3339(&no_show_at)?.with_timezone(&Utc),
        status: status_from_str(&status)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        last_outcome: row.try_get("last_outcome")?,
        needs_manual_followup: row.try_get::<i64, _>("needs_manual_followup")? != 0,
    })
}

impl DatabaseManager {
    pub async fn upsert_reminder_task(&self, task: &ReminderTask) -> Result<()> {
        sqlx::query(
            "INSERT INTO reminder_tasks
                (id, tenant_id, appointment_id, patient_id, phone_number, starts_at,
                 provider_name, status, attempts, last_outcome)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status, attempts = excluded.attempts,
                last_outcome = excluded.last_outcome",
        )
        .bind(task.id.to_string())
        .bind(task.tenant_id.to_string())
        .bind(task.appointment_id.to_string())
        .bind(task.patient_id.to_string())
        .bind(&task.phone_number)
        .bind(task.starts_at.to_rfc3339())
        .bind(&task.provider_name)
        .bind(status_to_str(task.status))
        .bind(task.attempts as i64)
        .bind(&task.last_outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_reminder_tasks(&self, tenant_id: Uuid) -> Result<Vec<ReminderTask>> {
        let rows = sqlx::query("SELECT * FROM reminder_tasks WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(reminder_from_row).collect()
    }

    pub async fn upsert_recall_task(&self, task: &RecallTask) -> Result<()> {
        sqlx::query(
            "INSERT INTO recall_tasks
                (id, tenant_id, patient_id, phone_number, reason, status, attempts, last_outcome)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status, attempts = excluded.attempts,
                last_outcome = excluded.last_outcome",
        )
        .bind(task.id.to_string())
        .bind(task.tenant_id.to_string())
        .bind(task.patient_id.to_string())
        .bind(&task.phone_number)
        .bind(&task.reason)
        .bind(status_to_str(task.status))
        .bind(task.attempts as i64)
        .bind(&task.last_outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_recall_tasks(&self, tenant_id: Uuid) -> Result<Vec<RecallTask>> {
        let rows = sqlx::query("SELECT * FROM recall_tasks WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(recall_from_row).collect()
    }

    pub async fn upsert_noshow_task(&self, task: &NoShowTask) -> Result<()> {
        sqlx::query(
            "INSERT INTO noshow_tasks
                (id, tenant_id, appointment_id, patient_id, phone_number, appointment_type,
                 no_show_at, status, attempts, last_outcome, needs_manual_followup)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status, attempts = excluded.attempts,
                last_outcome = excluded.last_outcome,
                needs_manual_followup = excluded.needs_manual_followup",
        )
        .bind(task.id.to_string())
        .bind(task.tenant_id.to_string())
        .bind(task.appointment_id.to_string())
        .bind(task.patient_id.to_string())
        .bind(&task.phone_number)
        .bind(&task.appointment_type)
        .bind(task.no_show_at.to_rfc3339())
        .bind(status_to_str(task.status))
        .bind(task.attempts as i64)
        .bind(&task.last_outcome)
        .bind(task.needs_manual_followup as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_noshow_tasks(&self, tenant_id: Uuid) -> Result<Vec<NoShowTask>> {
        let rows = sqlx::query("SELECT * FROM noshow_tasks WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(noshow_from_row).collect()
    }
}
