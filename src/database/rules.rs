//! Routing rule persistence, ordered ascending by priority for the engine.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::routing::{RoutingRule, RuleConditions};

use super::DatabaseManager;

fn rule_from_row(row: &SqliteRow) -> Result<RoutingRule> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let conditions: String = row.try_get("conditions")?;
    let route_to_department_id: Option<String> = row.try_get("route_to_department_id")?;
    let route_to_worker_id: Option<String> = row.try_get("route_to_worker_id")?;
    let notification_channels: String = row.try_get("notification_channels")?;
    Ok(RoutingRule {
        id: Uuid::parse_str(&id)?,
        tenant_id: Uuid::parse_str(&tenant_id)?,
        name: row.try_get("name")?,
        priority: row.try_get::<i64, _>("priority")? as i32,
        active: row.try_get::<i64, _>("active")? != 0,
        conditions: serde_json::from_str::<RuleConditions>(&conditions)?,
        route_to_department_id: route_to_department_id.map(|d| Uuid::parse_str(&d)).transpose()?,
        route_to_worker_id: route_to_worker_id.map(|w| Uuid::parse_str(&w)).transpose()?,
        set_priority: row.try_get::<Option<i64>, _>("set_priority")?.map(|v| v as i32),
        escalate_after_minutes: row.try_get("escalate_after_minutes")?,
        send_notification: row.try_get::<i64, _>("send_notification")? != 0,
        notification_channels: serde_json::from_str(&notification_channels)?,
    })
}

impl DatabaseManager {
    pub async fn insert_routing_rule(&self, rule: &RoutingRule) -> Result<()> {
        sqlx::query(
            "INSERT INTO routing_rules
                (id, tenant_id, name, priority, active, conditions, route_to_department_id,
                 route_to_worker_id, set_priority, escalate_after_minutes, send_notification,
                 notification_channels)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                priority = excluded.priority,
                active = excluded.active,
                conditions = excluded.conditions,
                route_to_department_id = excluded.route_to_department_id,
                route_to_worker_id = excluded.route_to_worker_id,
                set_priority = excluded.set_priority,
                escalate_after_minutes = excluded.escalate_after_minutes,
                send_notification = excluded.send_notification,
                notification_channels = excluded.notification_channels",
        )
        .bind(rule.id.to_string())
        .bind(rule.tenant_id.to_string())
        .bind(&rule.name)
        .bind(rule.priority as i64)
        .bind(rule.active as i64)
        .bind(serde_json::to_string(&rule.conditions)?)
        .bind(rule.route_to_department_id.map(|d| d.to_string()))
        .bind(rule.route_to_worker_id.map(|w| w.to_string()))
        .bind(rule.set_priority.map(|p| p as i64))
        .bind(rule.escalate_after_minutes)
        .bind(rule.send_notification as i64)
        .bind(serde_json::to_string(&rule.notification_channels)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Active rules for a tenant, ordered ascending by priority — the order
    /// `RoutingEngine::route` requires its caller to supply.
    pub async fn list_active_rules(&self, tenant_id: Uuid) -> Result<Vec<RoutingRule>> {
        let rows = sqlx::query(
            "SELECT * FROM routing_rules WHERE tenant_id = ? AND active = 1 ORDER BY priority ASC",
        )
        .bind(tenant_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }
}
