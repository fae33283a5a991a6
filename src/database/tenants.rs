//! Tenant and department persistence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::routing::Department;

use super::DatabaseManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub industry: String,
    pub timezone: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

fn tenant_from_row(row: &SqliteRow) -> Result<Tenant> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Tenant {
        id: Uuid::parse_str(&id)?,
        name: row.try_get("name")?,
        industry: row.try_get("industry")?,
        timezone: row.try_get("timezone")?,
        active: row.try_get::<i64, _>("active")? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

fn department_from_row(row: &SqliteRow) -> Result<Department> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let handled_task_types: String = row.try_get("handled_task_types")?;
    Ok(Department {
        id: Uuid::parse_str(&id)?,
        tenant_id: Uuid::parse_str(&tenant_id)?,
        name: row.try_get("name")?,
        handled_task_types: serde_json::from_str(&handled_task_types)?,
        active: row.try_get::<i64, _>("active")? != 0,
    })
}

impl DatabaseManager {
    pub async fn insert_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenants (id, name, industry, timezone, active, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                industry = excluded.industry,
                timezone = excluded.timezone,
                active = excluded.active",
        )
        .bind(tenant.id.to_string())
        .bind(&tenant.name)
        .bind(&tenant.industry)
        .bind(&tenant.timezone)
        .bind(tenant.active as i64)
        .bind(tenant.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query("SELECT * FROM tenants WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(tenant_from_row).collect()
    }

    pub async fn insert_department(&self, department: &Department) -> Result<()> {
        sqlx::query(
            "INSERT INTO departments (id, tenant_id, name, handled_task_types, active)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                handled_task_types = excluded.handled_task_types,
                active = excluded.active",
        )
        .bind(department.id.to_string())
        .bind(department.tenant_id.to_string())
        .bind(&department.name)
        .bind(serde_json::to_string(&department.handled_task_types)?)
        .bind(department.active as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_departments(&self, tenant_id: Uuid) -> Result<Vec<Department>> {
        let rows = sqlx::query("SELECT * FROM departments WHERE tenant_id = ? AND active = 1")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(department_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_fetch_tenant_round_trips() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: "Praxis Dr. Weber".to_string(),
            industry: "medical".to_string(),
            timezone: "Europe/Berlin".to_string(),
            active: true,
            created_at: Utc::now(),
        };
        db.insert_tenant(&tenant).await.unwrap();
        let fetched = db.get_tenant(tenant.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, tenant.name);
        assert_eq!(fetched.timezone, tenant.timezone);
    }

    #[tokio::test]
    async fn departments_scope_to_tenant() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
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
        let department = Department {
            id: Uuid::new_v4(),
            tenant_id,
            name: "Kundendienst".to_string(),
            handled_task_types: vec!["repair".to_string()],
            active: true,
        };
        db.insert_department(&department).await.unwrap();
        let departments = db.list_departments(tenant_id).await.unwrap();
        assert_eq!(departments.len(), 1);
        assert_eq!(departments[0].name, "Kundendienst");
    }
}
