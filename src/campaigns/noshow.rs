//! C9: No-show Follow-up workflow.
//!
//! Grounded in `noshow_workflow.py`: once an appointment is marked a no-show,
//! wait `follow_up_delay_minutes` and then call the patient to rebook.
//! Priority scales with elapsed time since the miss using the same
//! [`super::priority_from_hours`] table the reminder workflow uses — a
//! no-show followed up within the hour is worth more than one from three
//! days ago. `max_attempts` defaults to 1: a single missed follow-up call
//! escalates straight to a human (`needs_manual_followup`) rather than
//! retrying indefinitely, since an unreachable no-show patient is itself a
//! signal worth a person's attention.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::clock::SharedClock;
use crate::config::NoShowConfig;
use crate::consent::{ConsentPurpose, SharedConsentStore};
use crate::delivery::sms::{self, SmsMessage, SmsProvider};
use crate::dialer::{DialOutcome, OutboundDialer};
use crate::gateway::SmsGateway;

use super::{priority_from_hours, CampaignTaskStatus, CampaignTaskTable};

#[derive(Debug, Clone)]
pub struct NoShowTarget {
    pub tenant_id: Uuid,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub phone_number: String,
    pub appointment_type: String,
    pub no_show_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoShowTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub phone_number: String,
    pub appointment_type: String,
    pub no_show_at: DateTime<Utc>,
    pub status: CampaignTaskStatus,
    pub attempts: u32,
    pub last_outcome: Option<String>,
    pub needs_manual_followup: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoShowCampaignStats {
    pub queued: u64,
    pub skipped_no_consent: u64,
    pub rebooked: u64,
    pub needs_manual_followup: u64,
    pub barrier_identified: u64,
    pub sms_fallback_sent: u64,
    pub failed: u64,
}

pub struct NoShowWorkflow {
    config: NoShowConfig,
    clock: SharedClock,
    dialer: Arc<OutboundDialer>,
    sms_gateway: Arc<dyn SmsGateway>,
    consent: SharedConsentStore,
    audit: Arc<AuditLogger>,
    tasks: CampaignTaskTable<NoShowTask>,
    stats: Mutex<NoShowCampaignStats>,
    tx: mpsc::UnboundedSender<(Uuid, DialOutcome)>,
}

impl NoShowWorkflow {
    pub fn new(
        config: NoShowConfig,
        clock: SharedClock,
        dialer: Arc<OutboundDialer>,
        sms_gateway: Arc<dyn SmsGateway>,
        consent: SharedConsentStore,
        audit: Arc<AuditLogger>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let workflow = Arc::new(Self {
            config,
            clock,
            dialer,
            sms_gateway,
            consent,
            audit,
            tasks: CampaignTaskTable::default(),
            stats: Mutex::new(NoShowCampaignStats::default()),
            tx,
        });
        let drain = Arc::clone(&workflow);
        tokio::spawn(async move {
            while let Some((task_id, outcome)) = rx.recv().await {
                drain.handle_outcome(task_id, outcome).await;
            }
        });
        workflow
    }

    /// Schedules the follow-up call for `follow_up_delay_minutes` after the
    /// no-show rather than dialing immediately, matching the workflow's "give the
    /// front desk a chance to reach the patient directly first" rationale.
    pub fn enqueue(self: &Arc<Self>, target: &NoShowTarget, now: DateTime<Utc>) -> Option<Uuid> {
        if !self.consent.check(target.patient_id, ConsentPurpose::PhoneContact, now) {
            self.stats.lock().skipped_no_consent += 1;
            self.audit.log_event(
                Uuid::new_v4(),
                now,
                "noshow_skipped_no_consent",
                "system",
                &target.appointment_id.to_string(),
                serde_json::json!({}),
            );
            return None;
        }

        let task_id = Uuid::new_v4();
        self.tasks.insert(
            task_id,
            NoShowTask {
                id: task_id,
                tenant_id: target.tenant_id,
                appointment_id: target.appointment_id,
                patient_id: target.patient_id,
                phone_number: target.phone_number.clone(),
                appointment_type: target.appointment_type.clone(),
                no_show_at: target.no_show_at,
                status: CampaignTaskStatus::Pending,
                attempts: 0,
                last_outcome: None,
                needs_manual_followup: false,
            },
        );
        let fire_at = target.no_show_at + chrono::Duration::minutes(self.config.follow_up_delay_minutes);
        if fire_at <= now {
            self.dispatch(task_id, now);
        } else {
            self.tasks.schedule_retry(task_id, fire_at);
        }
        Some(task_id)
    }

    fn dispatch(self: &Arc<Self>, task_id: Uuid, now: DateTime<Utc>) {
        let task = match self.tasks.get(task_id) {
            Some(t) => t,
            None => return,
        };
        let hours_since = (now - task.no_show_at).num_minutes() as f64 / 60.0;
        let priority = priority_from_hours(hours_since.max(0.0));
        self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Calling);

        let tx = self.tx.clone();
        let metadata = serde_json::json!({ "campaign": "noshow", "task_id": task_id, "appointment_id": task.appointment_id });
        self.dialer.queue_call(
            task.patient_id,
            task.phone_number.clone(),
            priority,
            metadata,
            Arc::new(move |outcome| {
                let _ = tx.send((task_id, outcome));
            }),
        );
        self.stats.lock().queued += 1;
    }

    pub fn process_due_retries(self: &Arc<Self>, now: DateTime<Utc>) {
        for task_id in self.tasks.due_retries(now) {
            self.dispatch(task_id, now);
        }
    }

    async fn handle_outcome(self: &Arc<Self>, task_id: Uuid, outcome: DialOutcome) {
        let now = self.clock.now();
        let task = match self.tasks.get(task_id) {
            Some(t) => t,
            None => return,
        };
        self.tasks.update(task_id, |t| {
            t.attempts += 1;
            t.last_outcome = Some(outcome.outcome.clone());
        });
        self.audit.log_event(
            Uuid::new_v4(),
            now,
            "noshow_call_completed",
            "system",
            &task.appointment_id.to_string(),
            serde_json::json!({ "outcome": outcome.outcome, "call_id": outcome.call_id }),
        );

        let attempts = self.tasks.get(task_id).map(|t| t.attempts).unwrap_or(task.attempts + 1);

        match outcome.outcome.as_str() {
            "confirmed" => {
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Completed);
                self.stats.lock().rebooked += 1;
            }
            "barrier_identified" => {
                // A richer conversation driver classified a concrete obstacle
                // (transport, cost, scheduling conflict) — this always needs
                // a person, never a further automated retry.
                self.tasks.update(task_id, |t| {
                    t.status = CampaignTaskStatus::Completed;
                    t.needs_manual_followup = true;
                });
                self.stats.lock().barrier_identified += 1;
            }
            "cancelled" => {
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Cancelled);
            }
            "no_answer" | "failed" => {
                if attempts < self.config.max_attempts {
                    self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Pending);
                    self.tasks.schedule_retry(task_id, now + chrono::Duration::minutes(self.config.follow_up_delay_minutes));
                } else {
                    self.tasks.update(task_id, |t| {
                        t.status = CampaignTaskStatus::NoAnswer;
                        t.needs_manual_followup = true;
                    });
                    self.stats.lock().needs_manual_followup += 1;
                    if self.config.sms_enabled {
                        self.send_fallback_sms(&task, now).await;
                    }
                }
            }
            other => {
                warn!(task_id = %task_id, outcome = other, "unrecognized no-show call outcome");
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Failed);
                self.stats.lock().failed += 1;
            }
        }
    }

    async fn send_fallback_sms(&self, task: &NoShowTask, now: DateTime<Utc>) {
        let body = format!(
            "{}: Wir haben Sie zu Ihrem verpassten Termin ({}) nicht erreicht. Bitte rufen Sie uns unter {} zurück.",
            self.config.practice_name, task.appointment_type, self.config.practice_phone,
        );
        let mut message = SmsMessage::new(task.tenant_id, task.phone_number.clone(), body, SmsProvider::Twilio, now);
        if sms::send(self.sms_gateway.as_ref(), &mut message, now).await.is_ok() {
            self.stats.lock().sms_fallback_sent += 1;
            self.audit.log_event(
                Uuid::new_v4(),
                now,
                "noshow_fallback_sms_sent",
                "system",
                &task.appointment_id.to_string(),
                serde_json::json!({ "message_id": message.id }),
            );
        }
    }

    pub fn stats(&self) -> NoShowCampaignStats {
        self.stats.lock().clone()
    }

    pub fn task(&self, id: Uuid) -> Option<NoShowTask> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> Vec<NoShowTask> {
        self.tasks.all()
    }

    /// Tasks flagged for a human to pick up, regardless of the terminal
    /// reason (unreachable or a barrier the conversation couldn't resolve).
    pub fn needing_manual_followup(&self) -> Vec<NoShowTask> {
        self.tasks.all().into_iter().filter(|t| t.needs_manual_followup).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::CollaboratorError;
    use crate::sip::{CallDirection, SipCall, SipCallState, SipClient};
    use async_trait::async_trait;
    use serde_json::Value;

    struct FakeSip;

    #[async_trait]
    impl SipClient for FakeSip {
        async fn originate_call(&self, destination: &str, _caller_id: Option<&str>, _metadata: Value) -> std::result::Result<SipCall, CollaboratorError> {
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
        async fn wait_for_answer(&self, _call_id: Uuid, _timeout: std::time::Duration) -> std::result::Result<bool, CollaboratorError> {
            Ok(true)
        }
        async fn hangup(&self, _call_id: Uuid) -> std::result::Result<(), CollaboratorError> {
            Ok(())
        }
        async fn send_dtmf(&self, _call_id: Uuid, _digits: &str) -> std::result::Result<(), CollaboratorError> {
            Ok(())
        }
        fn get_call(&self, _call_id: Uuid) -> Option<SipCall> {
            None
        }
    }

    struct FakeSms;

    #[async_trait]
    impl SmsGateway for FakeSms {
        async fn send(&self, _to: &str, _body: &str) -> std::result::Result<String, CollaboratorError> {
            Ok("SM-fake".to_string())
        }
    }

    fn workflow(now: DateTime<Utc>, patient_id: Uuid) -> Arc<NoShowWorkflow> {
        let clock: SharedClock = Arc::new(FixedClock::new(now));
        let dialer = Arc::new(OutboundDialer::new(
            crate::config::DialerConfig::default(),
            clock.clone(),
            Arc::new(FakeSip),
            crate::config::BusinessHoursConfig::default(),
        ));
        let consent = crate::consent::ConsentStore::new();
        consent.grant(patient_id, ConsentPurpose::PhoneContact, "ivr", None, now);
        NoShowWorkflow::new(NoShowConfig::default(), clock, dialer, Arc::new(FakeSms), Arc::new(consent), Arc::new(AuditLogger::new()))
    }

    #[tokio::test]
    async fn follow_up_before_delay_elapses_is_scheduled_not_dialed_immediately() {
        let now = Utc::now();
        let patient_id = Uuid::new_v4();
        let wf = workflow(now, patient_id);
        let target = NoShowTarget {
            tenant_id: Uuid::new_v4(),
            appointment_id: Uuid::new_v4(),
            patient_id,
            phone_number: "+491701234567".to_string(),
            appointment_type: "Kontrolle".to_string(),
            no_show_at: now,
        };
        wf.enqueue(&target, now).unwrap();
        assert_eq!(wf.dialer.queue_depth(), 0);
        assert!(wf.tasks.due_retries(now + chrono::Duration::minutes(29)).is_empty());
    }

    #[tokio::test]
    async fn barrier_identified_flags_manual_followup_without_retry() {
        let now = Utc::now();
        let patient_id = Uuid::new_v4();
        let wf = workflow(now, patient_id);
        let target = NoShowTarget {
            tenant_id: Uuid::new_v4(),
            appointment_id: Uuid::new_v4(),
            patient_id,
            phone_number: "+491701234567".to_string(),
            appointment_type: "Kontrolle".to_string(),
            no_show_at: now - chrono::Duration::hours(1),
        };
        let task_id = wf.enqueue(&target, now).unwrap();
        wf.handle_outcome(task_id, DialOutcome { call_id: Uuid::new_v4(), outcome: "barrier_identified".to_string(), duration_seconds: Some(60) }).await;
        assert_eq!(wf.stats().barrier_identified, 1);
        assert_eq!(wf.needing_manual_followup().len(), 1);
    }
}
