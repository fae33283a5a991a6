//! C9: Appointment Reminder workflow.
//!
//! Grounded in `reminder_workflow.py`: for each upcoming appointment inside
//! the reminder window, gate on consent, queue a dial through the outbound
//! dialer, and react to the outcome — confirm-and-SMS, reschedule, or retry
//! until `max_attempts` is exhausted and fall back to an SMS with the
//! practice phone number. Outcomes arrive on an internal channel and are
//! drained by a single task so that two calls completing concurrently never
//! interleave their audit entries or SMS sends.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::clock::SharedClock;
use crate::config::ReminderCampaignConfig;
use crate::consent::{ConsentPurpose, SharedConsentStore};
use crate::delivery::sms::{self, SmsMessage, SmsProvider};
use crate::dialer::{DialOutcome, OutboundDialer};
use crate::gateway::SmsGateway;

use super::{priority_from_hours, CampaignTaskStatus, CampaignTaskTable};

#[derive(Debug, Clone)]
pub struct ReminderTarget {
    pub tenant_id: Uuid,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub phone_number: String,
    pub starts_at: DateTime<Utc>,
    pub provider_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub phone_number: String,
    pub starts_at: DateTime<Utc>,
    pub provider_name: String,
    pub status: CampaignTaskStatus,
    pub attempts: u32,
    pub last_outcome: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReminderCampaignStats {
    pub queued: u64,
    pub skipped_no_consent: u64,
    pub skipped_too_close: u64,
    pub confirmed: u64,
    pub rescheduled: u64,
    pub no_answer_exhausted: u64,
    pub sms_fallback_sent: u64,
    pub failed: u64,
}

pub struct ReminderWorkflow {
    config: ReminderCampaignConfig,
    clock: SharedClock,
    dialer: Arc<OutboundDialer>,
    sms_gateway: Arc<dyn SmsGateway>,
    consent: SharedConsentStore,
    audit: Arc<AuditLogger>,
    tasks: CampaignTaskTable<ReminderTask>,
    stats: Mutex<ReminderCampaignStats>,
    tx: mpsc::UnboundedSender<(Uuid, DialOutcome)>,
}

impl ReminderWorkflow {
    pub fn new(
        config: ReminderCampaignConfig,
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
            stats: Mutex::new(ReminderCampaignStats::default()),
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

    /// Evaluates eligibility (consent, window) and queues a dial if eligible.
    /// Returns `None` without touching the dialer when the target is skipped.
    pub fn enqueue(self: &Arc<Self>, target: &ReminderTarget, now: DateTime<Utc>) -> Option<Uuid> {
        let hours_until = (target.starts_at - now).num_minutes() as f64 / 60.0;
        if hours_until < self.config.min_hours_before as f64 {
            self.stats.lock().skipped_too_close += 1;
            return None;
        }
        if !self.consent.check(target.patient_id, ConsentPurpose::PhoneContact, now) {
            self.stats.lock().skipped_no_consent += 1;
            self.audit.log_event(
                Uuid::new_v4(),
                now,
                "reminder_skipped_no_consent",
                "system",
                &target.appointment_id.to_string(),
                serde_json::json!({ "patient_id": target.patient_id }),
            );
            return None;
        }

        let task_id = Uuid::new_v4();
        self.tasks.insert(
            task_id,
            ReminderTask {
                id: task_id,
                tenant_id: target.tenant_id,
                appointment_id: target.appointment_id,
                patient_id: target.patient_id,
                phone_number: target.phone_number.clone(),
                starts_at: target.starts_at,
                provider_name: target.provider_name.clone(),
                status: CampaignTaskStatus::Pending,
                attempts: 0,
                last_outcome: None,
            },
        );
        self.dispatch(task_id, now);
        Some(task_id)
    }

    fn dispatch(self: &Arc<Self>, task_id: Uuid, now: DateTime<Utc>) {
        let task = match self.tasks.get(task_id) {
            Some(t) => t,
            None => return,
        };
        let hours_until = (task.starts_at - now).num_minutes() as f64 / 60.0;
        let priority = priority_from_hours(hours_until);
        self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Calling);

        let tx = self.tx.clone();
        let metadata = serde_json::json!({ "campaign": "reminder", "task_id": task_id, "appointment_id": task.appointment_id });
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

    /// Drives any retries whose backoff has elapsed. Intended to be called
    /// from a periodic sweep alongside the dialer's dispatch loop.
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
            "reminder_call_completed",
            "system",
            &task.appointment_id.to_string(),
            serde_json::json!({ "outcome": outcome.outcome, "call_id": outcome.call_id }),
        );

        let attempts = self.tasks.get(task_id).map(|t| t.attempts).unwrap_or(task.attempts + 1);

        match outcome.outcome.as_str() {
            "confirmed" => {
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Completed);
                self.stats.lock().confirmed += 1;
                if self.config.sms_enabled {
                    self.send_confirmation_sms(&task, now).await;
                }
            }
            "rescheduled" => {
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Rescheduled);
                self.stats.lock().rescheduled += 1;
            }
            "cancelled" => {
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Cancelled);
            }
            "no_answer" | "failed" => {
                let hours_until = (task.starts_at - now).num_minutes() as f64 / 60.0;
                let retry_at = now + chrono::Duration::minutes(self.config.retry_delay_minutes);
                let retry_still_useful = hours_until > self.config.min_hours_before as f64;
                if attempts < self.config.max_attempts && retry_still_useful {
                    self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Pending);
                    self.tasks.schedule_retry(task_id, retry_at);
                } else {
                    self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::NoAnswer);
                    self.stats.lock().no_answer_exhausted += 1;
                    if self.config.sms_enabled && attempts >= self.config.sms_after_failed_attempts {
                        self.send_fallback_sms(&task, now).await;
                    }
                }
            }
            other => {
                warn!(task_id = %task_id, outcome = other, "unrecognized reminder call outcome");
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Failed);
                self.stats.lock().failed += 1;
            }
        }
    }

    async fn send_confirmation_sms(&self, task: &ReminderTask, now: DateTime<Utc>) {
        let body = format!(
            "{}: Ihr Termin am {} bei {} ist bestätigt.",
            self.config.practice_name,
            task.starts_at.format("%d.%m.%Y %H:%M"),
            task.provider_name,
        );
        let mut message = SmsMessage::new(task.tenant_id, task.phone_number.clone(), body, SmsProvider::Twilio, now);
        if sms::send(self.sms_gateway.as_ref(), &mut message, now).await.is_ok() {
            self.audit.log_event(
                Uuid::new_v4(),
                now,
                "reminder_confirmation_sms_sent",
                "system",
                &task.appointment_id.to_string(),
                serde_json::json!({ "message_id": message.id }),
            );
        }
    }

    async fn send_fallback_sms(&self, task: &ReminderTask, now: DateTime<Utc>) {
        let body = format!(
            "{}: Wir konnten Sie nicht erreichen. Bitte rufen Sie uns unter {} zurück, um Ihren Termin am {} zu bestätigen.",
            self.config.practice_name,
            self.config.practice_phone,
            task.starts_at.format("%d.%m.%Y %H:%M"),
        );
        let mut message = SmsMessage::new(task.tenant_id, task.phone_number.clone(), body, SmsProvider::Twilio, now);
        if sms::send(self.sms_gateway.as_ref(), &mut message, now).await.is_ok() {
            self.stats.lock().sms_fallback_sent += 1;
            self.audit.log_event(
                Uuid::new_v4(),
                now,
                "reminder_fallback_sms_sent",
                "system",
                &task.appointment_id.to_string(),
                serde_json::json!({ "message_id": message.id }),
            );
        }
    }

    pub fn stats(&self) -> ReminderCampaignStats {
        self.stats.lock().clone()
    }

    pub fn task(&self, id: Uuid) -> Option<ReminderTask> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> Vec<ReminderTask> {
        self.tasks.all()
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

    fn workflow(now: DateTime<Utc>) -> Arc<ReminderWorkflow> {
        let clock: SharedClock = Arc::new(FixedClock::new(now));
        let dialer = Arc::new(OutboundDialer::new(
            crate::config::DialerConfig::default(),
            clock.clone(),
            Arc::new(FakeSip),
            crate::config::BusinessHoursConfig {
                open_hour: 0,
                close_hour: 23,
                open_days: vec![
                    chrono::Weekday::Mon,
                    chrono::Weekday::Tue,
                    chrono::Weekday::Wed,
                    chrono::Weekday::Thu,
                    chrono::Weekday::Fri,
                    chrono::Weekday::Sat,
                    chrono::Weekday::Sun,
                ],
                ..Default::default()
            },
        ));
        ReminderWorkflow::new(
            ReminderCampaignConfig::default(),
            clock,
            dialer,
            Arc::new(FakeSms),
            Arc::new(crate::consent::ConsentStore::new()),
            Arc::new(AuditLogger::new()),
        )
    }

    fn target(now: DateTime<Utc>, tenant_id: Uuid, patient_id: Uuid) -> ReminderTarget {
        ReminderTarget {
            tenant_id,
            appointment_id: Uuid::new_v4(),
            patient_id,
            phone_number: "+491701234567".to_string(),
            starts_at: now + chrono::Duration::hours(10),
            provider_name: "Dr. Müller".to_string(),
        }
    }

    #[tokio::test]
    async fn no_consent_is_skipped_before_touching_dialer() {
        let now = Utc::now();
        let wf = workflow(now);
        let target = target(now, Uuid::new_v4(), Uuid::new_v4());
        assert!(wf.enqueue(&target, now).is_none());
        assert_eq!(wf.stats().skipped_no_consent, 1);
        assert_eq!(wf.dialer.queue_depth(), 0);
    }

    #[tokio::test]
    async fn confirmed_outcome_marks_completed_and_sends_sms() {
        let now = Utc::now();
        let wf = workflow(now);
        let patient_id = Uuid::new_v4();
        let consent = crate::consent::ConsentStore::new();
        consent.grant(patient_id, ConsentPurpose::PhoneContact, "ivr", None, now);
        let wf = ReminderWorkflow::new(
            ReminderCampaignConfig::default(),
            wf.clock.clone(),
            wf.dialer.clone(),
            wf.sms_gateway.clone(),
            Arc::new(consent),
            wf.audit.clone(),
        );
        let target = target(now, Uuid::new_v4(), patient_id);
        let task_id = wf.enqueue(&target, now).unwrap();
        wf.handle_outcome(task_id, DialOutcome { call_id: Uuid::new_v4(), outcome: "confirmed".to_string(), duration_seconds: Some(45) }).await;
        assert_eq!(wf.task(task_id).unwrap().status, CampaignTaskStatus::Completed);
        assert_eq!(wf.stats().confirmed, 1);
    }

    #[tokio::test]
    async fn no_answer_exhausts_then_sends_fallback_sms() {
        let now = Utc::now();
        let patient_id = Uuid::new_v4();
        let consent = crate::consent::ConsentStore::new();
        consent.grant(patient_id, ConsentPurpose::PhoneContact, "ivr", None, now);
        let clock: SharedClock = Arc::new(FixedClock::new(now));
        let dialer = Arc::new(OutboundDialer::new(
            crate::config::DialerConfig::default(),
            clock.clone(),
            Arc::new(FakeSip),
            crate::config::BusinessHoursConfig::default(),
        ));
        let wf = ReminderWorkflow::new(
            ReminderCampaignConfig { max_attempts: 1, sms_after_failed_attempts: 1, ..ReminderCampaignConfig::default() },
            clock,
            dialer,
            Arc::new(FakeSms),
            Arc::new(consent),
            Arc::new(AuditLogger::new()),
        );
        let target = target(now, Uuid::new_v4(), patient_id);
        let task_id = wf.enqueue(&target, now).unwrap();
        wf.handle_outcome(task_id, DialOutcome { call_id: Uuid::new_v4(), outcome: "no_answer".to_string(), duration_seconds: None }).await;
        assert_eq!(wf.task(task_id).unwrap().status, CampaignTaskStatus::NoAnswer);
        assert_eq!(wf.stats().no_answer_exhausted, 1);
        assert_eq!(wf.stats().sms_fallback_sent, 1);
    }
}
