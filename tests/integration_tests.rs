//! End-to-end tests exercising `PhoneAgentServer` across module boundaries:
//! routing a task through to a persisted, worker-assigned state, and
//! driving the dialer/campaign/control-surface stack together rather than
//! each module in isolation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use phone_agent_core::prelude::*;
use phone_agent_core::campaigns::noshow::NoShowTarget;
use phone_agent_core::campaigns::recall::RecallTarget;
use phone_agent_core::campaigns::reminder::ReminderTarget;
use phone_agent_core::control::{AppointmentSource, RecallSource};
use phone_agent_core::database::DatabaseManager;
use phone_agent_core::database::tenants::Tenant;
use phone_agent_core::error::CollaboratorError;
use phone_agent_core::routing::{Department, RoutingRule, Task, Urgency};
use phone_agent_core::routing::worker_selection::Worker;
use phone_agent_core::server::PhoneAgentServerBuilder;
use phone_agent_core::sip::{CallDirection, SipCall, SipCallState};
use serde_json::Value;
use serial_test::serial;
use uuid::Uuid;

struct FakeSip;

#[async_trait]
impl SipClient for FakeSip {
    async fn originate_call(&self, destination: &str, _caller_id: Option<&str>, _metadata: Value) -> Result<SipCall, CollaboratorError> {
        Ok(SipCall {
            call_id: Uuid::new_v4(),
            sip_call_id: format!("out-{destination}"),
            direction: CallDirection::Outbound,
            state: SipCallState::Trying,
            caller_id: "agent".to_string(),
            callee_id: destination.to_string(),
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
        })
    }
    async fn wait_for_answer(&self, _call_id: Uuid, _timeout: Duration) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
    async fn hangup(&self, _call_id: Uuid) -> Result<(), CollaboratorError> {
        Ok(())
    }
    async fn send_dtmf(&self, _call_id: Uuid, _digits: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }
    fn get_call(&self, _call_id: Uuid) -> Option<SipCall> {
        None
    }
}

struct FakeSms;
#[async_trait]
impl SmsGateway for FakeSms {
    async fn send(&self, _to: &str, _body: &str) -> Result<String, CollaboratorError> {
        Ok("SM-fake".to_string())
    }
}

struct FakeEmail;
#[async_trait]
impl EmailGateway for FakeEmail {
    async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<String, CollaboratorError> {
        Ok("sg-fake".to_string())
    }
}

struct NoAppointments;
#[async_trait]
impl AppointmentSource for NoAppointments {
    async fn upcoming_reminders(&self, _tenant_id: Uuid, _target_date: Option<NaiveDate>, _types: Option<&[String]>) -> Result<Vec<ReminderTarget>, CollaboratorError> {
        Ok(vec![])
    }
    async fn recent_no_shows(&self, _tenant_id: Uuid, _target_date: Option<NaiveDate>) -> Result<Vec<NoShowTarget>, CollaboratorError> {
        Ok(vec![])
    }
}

struct NoRecalls;
#[async_trait]
impl RecallSource for NoRecalls {
    async fn due_recalls(&self, _tenant_id: Uuid, _campaign_id: Uuid, _max_calls: Option<usize>) -> Result<Vec<RecallTarget>, CollaboratorError> {
        Ok(vec![])
    }
}

async fn seed_tenant(db: &DatabaseManager) -> Uuid {
    let tenant_id = Uuid::new_v4();
    db.insert_tenant(&Tenant {
        id: tenant_id,
        name: "Handwerksbetrieb Mueller".to_string(),
        industry: "trade".to_string(),
        timezone: "Europe/Berlin".to_string(),
        active: true,
        created_at: Utc::now(),
    })
    .await
    .unwrap();
    tenant_id
}

#[tokio::test]
#[serial]
async fn server_builds_and_starts_against_an_in_memory_database() {
    let db = Arc::new(DatabaseManager::new_in_memory().await.unwrap());
    let tenant_id = seed_tenant(&db).await;

    let mut server = PhoneAgentServerBuilder::new()
        .with_tenant(tenant_id)
        .with_database(db)
        .with_sip_client(Arc::new(FakeSip))
        .with_sms_gateway(Arc::new(FakeSms))
        .with_email_gateway(Arc::new(FakeEmail))
        .with_appointment_source(Arc::new(NoAppointments))
        .with_recall_source(Arc::new(NoRecalls))
        .build()
        .await
        .expect("server should build with all required collaborators");

    server.start().await.unwrap();
    assert_eq!(server.dialer().stats().queue_size, 0);
    server.stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn routing_a_task_persists_the_assignment_and_increments_worker_load() {
    let db = DatabaseManager::new_in_memory().await.unwrap();
    let tenant_id = seed_tenant(&db).await;

    let department = Department {
        id: Uuid::new_v4(),
        tenant_id,
        name: "Kundendienst".to_string(),
        handled_task_types: vec!["repair".to_string()],
        active: true,
    };
    db.insert_department(&department).await.unwrap();

    let worker = Worker {
        id: Uuid::new_v4(),
        tenant_id,
        department_id: Some(department.id),
        trade_categories: vec!["shk".to_string()],
        active: true,
        available: true,
        current_task_count: 0,
        max_tasks_per_day: 8,
    };
    db.insert_worker(&worker).await.unwrap();

    let rule = RoutingRule {
        id: Uuid::new_v4(),
        tenant_id,
        name: "Dringende Reparatur".to_string(),
        priority: 10,
        active: true,
        conditions: Default::default(),
        route_to_department_id: Some(department.id),
        route_to_worker_id: None,
        set_priority: Some(20),
        escalate_after_minutes: None,
        send_notification: true,
        notification_channels: vec!["sms".to_string()],
    };
    db.insert_routing_rule(&rule).await.unwrap();

    let mut task = Task::new(tenant_id, "phone", "call-123", "repair", Urgency::Dringend);
    task.trade_category = Some("shk".to_string());

    let engine = RoutingEngine::new();
    let rules = db.list_active_rules(tenant_id).await.unwrap();
    let departments = db.list_departments(tenant_id).await.unwrap();
    let workers = db.list_workers(tenant_id).await.unwrap();
    let decision = engine.route(&task, &rules, &departments, &workers).unwrap();
    engine.apply_decision(&mut task, &decision, Utc::now());
    db.insert_task(&task).await.unwrap();
    if let Some(worker_id) = task.assigned_worker_id {
        db.increment_worker_task_count(worker_id).await.unwrap();
    }

    let persisted = db.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(persisted.assigned_worker_id, Some(worker.id));
    assert_eq!(persisted.routing_priority, 20);

    let workers_after = db.list_workers(tenant_id).await.unwrap();
    assert_eq!(workers_after[0].current_task_count, 1);
}

#[tokio::test]
#[serial]
async fn control_surface_reports_empty_reminder_stats_for_a_fresh_tenant() {
    let db = Arc::new(DatabaseManager::new_in_memory().await.unwrap());
    let tenant_id = seed_tenant(&db).await;

    let server = PhoneAgentServerBuilder::new()
        .with_tenant(tenant_id)
        .with_database(db)
        .with_sip_client(Arc::new(FakeSip))
        .with_sms_gateway(Arc::new(FakeSms))
        .with_email_gateway(Arc::new(FakeEmail))
        .with_appointment_source(Arc::new(NoAppointments))
        .with_recall_source(Arc::new(NoRecalls))
        .build()
        .await
        .unwrap();

    let stats = server.control().get_reminder_stats();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.confirmed, 0);
}
