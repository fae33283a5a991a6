//! C10: Routing Engine.
//!
//! Grounded directly in `services/routing_engine.py` (`RoutingDecision`,
//! `_matches_conditions`, `_calculate_priority`, `_default_routing`,
//! `apply_routing`, `reassign_task`, `escalate_task`). `conditions` moves from
//! a `dict[str, Any]` (Design Note: "dynamic dict metadata") to a typed
//! `RuleConditions`, serialized to JSON only at the persistence boundary.

pub mod worker_selection;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PhoneAgentError, Result, RoutingError};

pub use worker_selection::{select_worker, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Urgency {
    Notfall,
    Dringend,
    Normal,
    Routine,
}

impl Urgency {
    /// `URGENCY_PRIORITY[urgency]` — smaller is more urgent.
    pub fn default_priority(self) -> i32 {
        match self {
            Urgency::Notfall => 0,
            Urgency::Dringend => 50,
            Urgency::Normal => 100,
            Urgency::Routine => 150,
        }
    }

    pub fn escalate_after_minutes(self) -> Option<i64> {
        match self {
            Urgency::Notfall => Some(15),
            Urgency::Dringend => Some(60),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    New,
    Assigned,
    InProgress,
    Done,
    Cancelled,
}

/// A condition value may match a scalar (equality) or a list (membership),
/// per the routing engine's second step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Scalar(String),
    List(Vec<String>),
    Number(f64),
}

impl ConditionValue {
    fn matches(&self, actual: &str) -> bool {
        match self {
            ConditionValue::Scalar(expected) => expected == actual,
            ConditionValue::List(expected) => expected.iter().any(|v| v == actual),
            ConditionValue::Number(_) => false,
        }
    }
}

/// Structured predicate evaluated against a `Task`. Field keys are either a
/// `Task` attribute name (`task_type`, `urgency`, `trade_category`, ...) or
/// one of the two special fields `customer_plz_starts` (prefix match) and
/// `distance_km_max` (numeric <=).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConditions {
    pub fields: HashMap<String, ConditionValue>,
}

impl RuleConditions {
    pub fn matches(&self, task: &Task) -> bool {
        self.fields.iter().all(|(field, expected)| match field.as_str() {
            "customer_plz_starts" => match (expected, &task.customer_plz) {
                (ConditionValue::Scalar(prefix), Some(plz)) => plz.starts_with(prefix.as_str()),
                _ => false,
            },
            "distance_km_max" => match (expected, task.distance_km) {
                (ConditionValue::Number(max), Some(actual)) => actual <= *max,
                _ => false,
            },
            "task_type" => expected.matches(&task.task_type),
            "urgency" => expected.matches(urgency_tag(task.urgency)),
            "trade_category" => match &task.trade_category {
                Some(tc) => expected.matches(tc),
                None => false,
            },
            "source_type" => expected.matches(&task.source_type),
            _ => false,
        })
    }
}

fn urgency_tag(u: Urgency) -> &'static str {
    match u {
        Urgency::Notfall => "notfall",
        Urgency::Dringend => "dringend",
        Urgency::Normal => "normal",
        Urgency::Routine => "routine",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub priority: i32,
    pub active: bool,
    pub conditions: RuleConditions,
    pub route_to_department_id: Option<Uuid>,
    pub route_to_worker_id: Option<Uuid>,
    pub set_priority: Option<i32>,
    pub escalate_after_minutes: Option<i64>,
    pub send_notification: bool,
    pub notification_channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Department {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub handled_task_types: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub source_type: String,
    pub source_id: String,
    pub task_type: String,
    pub urgency: Urgency,
    pub trade_category: Option<String>,
    pub customer_plz: Option<String>,
    pub distance_km: Option<f64>,
    pub status: TaskStatus,
    pub assigned_department_id: Option<Uuid>,
    pub assigned_worker_id: Option<Uuid>,
    pub assigned_at: Option<chrono::DateTime<chrono::Utc>>,
    pub assigned_by: Option<String>,
    pub routing_priority: i32,
    pub routing_reason: String,
}

impl Task {
    pub fn new(
        tenant_id: Uuid,
        source_type: impl Into<String>,
        source_id: impl Into<String>,
        task_type: impl Into<String>,
        urgency: Urgency,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            source_type: source_type.into(),
            source_id: source_id.into(),
            task_type: task_type.into(),
            urgency,
            trade_category: None,
            customer_plz: None,
            distance_km: None,
            status: TaskStatus::New,
            assigned_department_id: None,
            assigned_worker_id: None,
            assigned_at: None,
            assigned_by: None,
            routing_priority: urgency.default_priority(),
            routing_reason: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub department_id: Option<Uuid>,
    pub worker_id: Option<Uuid>,
    pub matched_rule_id: Option<Uuid>,
    pub matched_rule_name: Option<String>,
    pub routing_priority: i32,
    pub routing_reason: String,
    pub send_notification: bool,
    pub notification_channels: Vec<String>,
    pub escalate_after_minutes: Option<i64>,
}

/// Routing engine: evaluates a tenant's ordered active rules against a
/// not-yet-assigned task, falls back to default routing, then selects a
/// worker within the chosen department. Holds no state of its own — callers
/// supply rules/departments/workers explicitly so the engine stays testable
/// without a persistence handle (Design Note: no lazy singleton).
pub struct RoutingEngine;

impl Default for RoutingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingEngine {
    pub fn new() -> Self {
        Self
    }

    /// `rules` must already be filtered to the task's
    /// tenant and sorted ascending by `priority` (callers own that query);
    /// this keeps the engine a pure function of its inputs.
    pub fn route(
        &self,
        task: &Task,
        rules: &[RoutingRule],
        departments: &[Department],
        workers: &[Worker],
    ) -> Result<RoutingDecision> {
        if task.status != TaskStatus::New {
            return Err(PhoneAgentError::Conflict(
                RoutingError::AlreadyAssigned.to_string(),
            ));
        }

        let mut matched_rule: Option<&RoutingRule> = None;
        for rule in rules.iter().filter(|r| r.active) {
            if rule.conditions.matches(task) {
                matched_rule = Some(rule);
                break;
            }
        }

        let (department_id, reason, set_priority, send_notification, channels, escalate) =
            if let Some(rule) = matched_rule {
                (
                    rule.route_to_department_id,
                    format!("Matched rule: {}", rule.name),
                    rule.set_priority,
                    rule.send_notification,
                    rule.notification_channels.clone(),
                    rule.escalate_after_minutes,
                )
            } else {
                let dept = Self::default_department(task, departments);
                (
                    dept.map(|d| d.id),
                    if dept.is_some() {
                        "Default fallback: matched handled_task_types".to_string()
                    } else {
                        "Default fallback: no department matched".to_string()
                    },
                    None,
                    false,
                    Vec::new(),
                    None,
                )
            };

        let worker_id = match (matched_rule.and_then(|r| r.route_to_worker_id), department_id) {
            (Some(explicit_worker), _) => Some(explicit_worker),
            (None, Some(dept_id)) => select_worker(dept_id, task.trade_category.as_deref(), workers),
            (None, None) => None,
        };

        let routing_priority = set_priority.unwrap_or_else(|| task.urgency.default_priority());
        let escalate_after_minutes = escalate.or_else(|| task.urgency.escalate_after_minutes());

        // Step 6: notfall/dringend always notify on both channels, whether
        // or not the matched rule (or the default fallback) asked for it.
        let (send_notification, channels) = if matches!(task.urgency, Urgency::Notfall | Urgency::Dringend) {
            (true, vec!["sms".to_string(), "email".to_string()])
        } else {
            (send_notification, channels)
        };

        Ok(RoutingDecision {
            department_id,
            worker_id,
            matched_rule_id: matched_rule.map(|r| r.id),
            matched_rule_name: matched_rule.map(|r| r.name.clone()),
            routing_priority,
            routing_reason: reason,
            send_notification,
            notification_channels: channels,
            escalate_after_minutes,
        })
    }

    /// First active department whose `handled_task_types`
    /// contains the task's type; failing that, a department whose name
    /// case-insensitively contains "kundendienst".
    fn default_department<'a>(task: &Task, departments: &'a [Department]) -> Option<&'a Department> {
        departments
            .iter()
            .find(|d| d.active && d.handled_task_types.iter().any(|t| t == &task.task_type))
            .or_else(|| {
                departments
                    .iter()
                    .find(|d| d.active && d.name.to_lowercase().contains("kundendienst"))
            })
    }

    /// Applies a `RoutingDecision` to a task in place. Callers must bump the
    /// "Apply decision": status becomes `assigned` iff a worker was chosen.
    /// Does not mutate worker counters — callers must increment the chosen
    /// worker's `current_task_count` as part of the same transaction.
    pub fn apply_decision(
        &self,
        task: &mut Task,
        decision: &RoutingDecision,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        task.assigned_department_id = decision.department_id;
        task.assigned_worker_id = decision.worker_id;
        task.routing_priority = decision.routing_priority;
        task.routing_reason = decision.routing_reason.clone();
        if decision.worker_id.is_some() {
            task.status = TaskStatus::Assigned;
            task.assigned_at = Some(now);
            task.assigned_by = Some("auto_routing".to_string());
        } else {
            task.status = TaskStatus::New;
            task.assigned_at = None;
            task.assigned_by = None;
        }
    }

    /// Escalation halves the priority (floored at 0, a deliberate deviation
    /// from the Python source's flat `-50`) and prepends an
    /// `ESCALATED (reason)` tag.
    pub fn escalate(&self, task: &mut Task, reason: &str) {
        task.routing_priority = (task.routing_priority / 2).max(0);
        task.routing_reason = format!("ESCALATED ({reason}): {}", task.routing_reason);
    }

    /// Moves an already-assigned task to a new worker/department. Returns
    /// the former worker id so the caller can decrement its counter in the
    /// same transaction that increments the new one's — this method itself
    /// touches no persistence and holds no lock, matching `apply_decision`.
    pub fn reassign(
        &self,
        task: &mut Task,
        department_id: Option<Uuid>,
        worker_id: Option<Uuid>,
        reason: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<Uuid> {
        let previous_worker_id = task.assigned_worker_id;
        task.assigned_department_id = department_id;
        task.assigned_worker_id = worker_id;
        task.routing_reason = format!("Reassigned ({reason}): {}", task.routing_reason);
        if worker_id.is_some() {
            task.status = TaskStatus::Assigned;
            task.assigned_at = Some(now);
            task.assigned_by = Some("manual_reassignment".to_string());
        } else {
            task.status = TaskStatus::New;
            task.assigned_at = None;
            task.assigned_by = None;
        }
        previous_worker_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn dept(name: &str, handled: &[&str]) -> Department {
        Department {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: name.to_string(),
            handled_task_types: handled.iter().map(|s| s.to_string()).collect(),
            active: true,
        }
    }

    fn worker(dept_id: Uuid, current: u32, max: u32, trades: &[&str]) -> Worker {
        Worker {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            department_id: Some(dept_id),
            trade_categories: trades.iter().map(|s| s.to_string()).collect(),
            active: true,
            available: true,
            current_task_count: current,
            max_tasks_per_day: max,
        }
    }

    #[test]
    fn matching_rule_routes_to_department_and_trade_matched_worker() {
        let tenant_id = Uuid::new_v4();
        let department = dept("Handwerk", &["repair"]);
        let w1 = worker(department.id, 2, 10, &["shk"]);
        let w2 = worker(department.id, 0, 10, &["elektro"]);

        let mut conditions = RuleConditions::default();
        conditions.fields.insert(
            "task_type".to_string(),
            ConditionValue::List(vec!["repair".to_string()]),
        );
        conditions.fields.insert(
            "urgency".to_string(),
            ConditionValue::List(vec!["dringend".to_string()]),
        );
        let rule = RoutingRule {
            id: Uuid::new_v4(),
            tenant_id,
            name: "Dringende Reparatur".to_string(),
            priority: 10,
            active: true,
            conditions,
            route_to_department_id: Some(department.id),
            route_to_worker_id: None,
            set_priority: Some(20),
            escalate_after_minutes: None,
            send_notification: false,
            notification_channels: vec![],
        };

        let mut task = Task::new(tenant_id, "email", "msg-1", "repair", Urgency::Dringend);
        task.trade_category = Some("shk".to_string());

        let engine = RoutingEngine::new();
        let decision = engine
            .route(&task, &[rule], &[department.clone()], &[w1.clone(), w2.clone()])
            .unwrap();

        assert_eq!(decision.department_id, Some(department.id));
        assert_eq!(decision.worker_id, Some(w1.id));
        assert_eq!(decision.routing_priority, 20);
        assert!(decision.routing_reason.starts_with("Matched rule:"));
        assert!(decision.send_notification);
        assert_eq!(decision.notification_channels, vec!["sms", "email"]);
        assert_eq!(decision.escalate_after_minutes, Some(60));
    }

    #[test]
    fn default_routing_falls_back_to_kundendienst_by_name() {
        let tenant_id = Uuid::new_v4();
        let department = dept("Kundendienst", &["general"]);
        let task = Task::new(tenant_id, "email", "msg-2", "quote", Urgency::Normal);

        let engine = RoutingEngine::new();
        let decision = engine.route(&task, &[], &[department.clone()], &[]).unwrap();

        assert_eq!(decision.department_id, Some(department.id));
        assert!(decision.routing_reason.starts_with("Default fallback"));
    }

    #[test]
    fn no_matching_department_leaves_worker_unset() {
        let tenant_id = Uuid::new_v4();
        let task = Task::new(tenant_id, "phone", "call-1", "unknown", Urgency::Routine);
        let engine = RoutingEngine::new();
        let decision = engine.route(&task, &[], &[], &[]).unwrap();
        assert!(decision.department_id.is_none());
        assert!(decision.worker_id.is_none());
    }

    #[test]
    fn escalate_halves_priority_and_floors_at_zero() {
        let tenant_id = Uuid::new_v4();
        let mut task = Task::new(tenant_id, "phone", "call-2", "repair", Urgency::Routine);
        task.routing_priority = 1;
        let engine = RoutingEngine::new();
        engine.escalate(&mut task, "no response in 15 min");
        assert_eq!(task.routing_priority, 0);
        assert!(task.routing_reason.starts_with("ESCALATED (no response in 15 min):"));
    }

    #[test]
    fn reassign_returns_former_worker_and_assigns_new_one() {
        let tenant_id = Uuid::new_v4();
        let department = dept("Handwerk", &["repair"]);
        let old_worker = Uuid::new_v4();
        let new_worker = worker(department.id, 0, 10, &["shk"]);
        let mut task = Task::new(tenant_id, "phone", "call-4", "repair", Urgency::Normal);
        task.status = TaskStatus::Assigned;
        task.assigned_worker_id = Some(old_worker);

        let engine = RoutingEngine::new();
        let former = engine.reassign(&mut task, Some(department.id), Some(new_worker.id), "worker unavailable", Utc::now());

        assert_eq!(former, Some(old_worker));
        assert_eq!(task.assigned_worker_id, Some(new_worker.id));
        assert_eq!(task.status, TaskStatus::Assigned);
        assert!(task.routing_reason.starts_with("Reassigned (worker unavailable):"));
    }

    #[test]
    fn routing_an_already_assigned_task_is_rejected() {
        let tenant_id = Uuid::new_v4();
        let mut task = Task::new(tenant_id, "phone", "call-3", "repair", Urgency::Normal);
        task.status = TaskStatus::Assigned;
        let engine = RoutingEngine::new();
        assert!(engine.route(&task, &[], &[], &[]).is_err());
    }
}
