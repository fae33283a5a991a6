//! C9: Patient Recall workflow.
//!
//! Grounded in `recall.py`: proactively reaches patients who are overdue for
//! a follow-up (routine checkup, lapsed treatment plan) and tries to get
//! them rebooked. Lower urgency than reminders — nothing here is tied to an
//! imminent appointment, so dials queue at `CallPriority::Low` by default —
//! but the same consent-gate / retry-then-SMS-fallback shape as
//! [`super::reminder`] applies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::clock::SharedClock;
use crate::config::RecallCampaignConfig;
use crate::consent::{ConsentPurpose, SharedConsentStore};
use crate::delivery::sms::{self, SmsMessage, SmsProvider};
use crate::dialer::{CallPriority, DialOutcome, OutboundDialer};
use crate::gateway::SmsGateway;

use super::{CampaignTaskStatus, CampaignTaskTable};

#[derive(Debug, Clone)]
pub struct RecallTarget {
    pub tenant_id: Uuid,
    pub patient_id: Uuid,
    pub phone_number: String,
    pub reason: String,
    pub last_visit_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub patient_id: Uuid,
    pub phone_number: String,
    pub reason: String,
    pub status: CampaignTaskStatus,
    pub attempts: u32,
    pub last_outcome: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallCampaignStats {
    pub queued: u64,
    pub skipped_no_consent: u64,
    pub appointment_made: u64,
    pub declined: u64,
    pub unreachable: u64,
    pub sms_fallback_sent: u64,
    pub failed: u64,
}

pub struct RecallWorkflow {
    config: RecallCampaignConfig,
    clock: SharedClock,
    dialer: Arc<OutboundDialer>,
    sms_gateway: Arc<dyn SmsGateway>,
    consent: SharedConsentStore,
    audit: Arc<AuditLogger>,
    tasks: CampaignTaskTable<RecallTask>,
    stats: Mutex<RecallCampaignStats>,
    tx: mpsc::UnboundedSender<(Uuid, DialOutcome)>,
    /// Gate on [`Self::dispatch`], toggled by the control surface's
    /// `pause_recall`/`resume_recall` commands. Pausing never drops
    /// queued patients — a paused dispatch just reschedules itself for the
    /// next due-retry sweep instead of calling the dialer.
    paused: AtomicBool,
}

impl RecallWorkflow {
    pub fn new(
        config: RecallCampaignConfig,
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
            stats: Mutex::new(RecallCampaignStats::default()),
            tx,
            paused: AtomicBool::new(false),
        });
        let drain = Arc::clone(&workflow);
        tokio::spawn(async move {
            while let Some((task_id, outcome)) = rx.recv().await {
                drain.handle_outcome(task_id, outcome).await;
            }
        });
        workflow
    }

    pub fn enqueue(self: &Arc<Self>, target: &RecallTarget, now: DateTime<Utc>) -> Option<Uuid> {
        if !self.consent.check(target.patient_id, ConsentPurpose::PhoneContact, now) {
            self.stats.lock().skipped_no_consent += 1;
            self.audit.log_event(
                Uuid::new_v4(),
                now,
                "recall_skipped_no_consent",
                "system",
                &target.patient_id.to_string(),
                serde_json::json!({ "reason": target.reason }),
            );
            return None;
        }

        let task_id = Uuid::new_v4();
        self.tasks.insert(
            task_id,
            RecallTask {
                id: task_id,
                tenant_id: target.tenant_id,
                patient_id: target.patient_id,
                phone_number: target.phone_number.clone(),
                reason: target.reason.clone(),
                status: CampaignTaskStatus::Pending,
                attempts: 0,
                last_outcome: None,
            },
        );
        self.dispatch(task_id);
        Some(task_id)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(self: &Arc<Self>) {
        self.paused.store(false, Ordering::SeqCst);
        for task in self.tasks.all() {
            if task.status == CampaignTaskStatus::Pending {
                self.dispatch(task.id);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn dispatch(self: &Arc<Self>, task_id: Uuid) {
        if self.paused.load(Ordering::SeqCst) {
            self.tasks.schedule_retry(task_id, self.clock.now());
            return;
        }
        let task = match self.tasks.get(task_id) {
            Some(t) => t,
            None => return,
        };
        self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Calling);

        let tx = self.tx.clone();
        let metadata = serde_json::json!({ "campaign": "recall", "task_id": task_id, "reason": task.reason });
        self.dialer.queue_call(
            task.patient_id,
            task.phone_number.clone(),
            CallPriority::Low,
            metadata,
            Arc::new(move |outcome| {
                let _ = tx.send((task_id, outcome));
            }),
        );
        self.stats.lock().queued += 1;
    }

    pub fn process_due_retries(self: &Arc<Self>, now: DateTime<Utc>) {
        for task_id in self.tasks.due_retries(now) {
            self.dispatch(task_id);
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
            "recall_call_completed",
            "system",
            &task.patient_id.to_string(),
            serde_json::json!({ "outcome": outcome.outcome, "call_id": outcome.call_id }),
        );

        let attempts = self.tasks.get(task_id).map(|t| t.attempts).unwrap_or(task.attempts + 1);

        match outcome.outcome.as_str() {
            "confirmed" => {
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Completed);
                self.stats.lock().appointment_made += 1;
            }
            "declined" => {
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Completed);
                self.stats.lock().declined += 1;
            }
            "cancelled" => {
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Cancelled);
            }
            "no_answer" | "failed" => {
                if attempts < self.config.max_attempts {
                    self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Pending);
                    self.tasks.schedule_retry(task_id, now + chrono::Duration::minutes(self.config.retry_delay_minutes));
                } else {
                    self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::NoAnswer);
                    self.stats.lock().unreachable += 1;
                    if self.config.sms_enabled {
                        self.send_fallback_sms(&task, now).await;
                    }
                }
            }
            other => {
                warn!(task_id = %task_id, outcome = other, "unrecognized recall call outcome");
                self.tasks.update(task_id, |t| t.status = CampaignTaskStatus::Failed);
                self.stats.lock().failed += 1;
            }
        }
    }

    async fn send_fallback_sms(&self, task: &RecallTask, now: DateTime<Utc>) {
        let body = format!(
            "{}: Wir würden Sie gerne für einen Termin ({}) erreichen. Bitte rufen Sie uns unter {} zurück.",
            self.config.practice_name, task.reason, self.config.practice_phone,
        );
        let mut message = SmsMessage::new(task.tenant_id, task.phone_number.clone(), body, SmsProvider::Twilio, now);
        if sms::send(self.sms_gateway.as_ref(), &mut message, now).await.is_ok() {
            self.stats.lock().sms_fallback_sent += 1;
            self.audit.log_event(
                Uuid::new_v4(),
                now,
                "recall_fallback_sms_sent",
                "system",
                &task.patient_id.to_string(),
                serde_json::json!({ "message_id": message.id }),
            );
        }
    }

    pub fn stats(&self) -> RecallCampaignStats {
        self.stats.lock().clone()
    }

    pub fn task(&self, id: Uuid) -> Option<RecallTask> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> Vec<RecallTask> {
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

    fn workflow(now: DateTime<Utc>, patient_id: Uuid, config: RecallCampaignConfig) -> Arc<RecallWorkflow> {
        let clock: SharedClock = Arc::new(FixedClock::new(now));
        let dialer = Arc::new(OutboundDialer::new(
            crate::config::DialerConfig::default(),
            clock.clone(),
            Arc::new(FakeSip),
            crate::config::BusinessHoursConfig::default(),
        ));
        let consent = crate::consent::ConsentStore::new();
        consent.grant(patient_id, ConsentPurpose::PhoneContact, "ivr", None, now);
        RecallWorkflow::new(config, clock, dialer, Arc::new(FakeSms), Arc::new(consent), Arc::new(AuditLogger::new()))
    }

    #[tokio::test]
    async fn unreachable_after_max_attempts_sends_fallback_sms() {
        let now = Utc::now();
        let patient_id = Uuid::new_v4();
        let wf = workflow(now, patient_id, RecallCampaignConfig { max_attempts: 1, ..RecallCampaignConfig::default() });
        let target = RecallTarget {
            tenant_id: Uuid::new_v4(),
            patient_id,
            phone_number: "+491701234567".to_string(),
            reason: "jahreskontrolle".to_string(),
            last_visit_at: Some(now - chrono::Duration::days(400)),
        };
        let task_id = wf.enqueue(&target, now).unwrap();
        wf.handle_outcome(task_id, DialOutcome { call_id: Uuid::new_v4(), outcome: "no_answer".to_string(), duration_seconds: None }).await;
        assert_eq!(wf.task(task_id).unwrap().status, CampaignTaskStatus::NoAnswer);
        assert_eq!(wf.stats().unreachable, 1);
        assert_eq!(wf.stats().sms_fallback_sent, 1);
    }

    #[tokio::test]
    async fn declined_is_terminal_without_retry() {
        let now = Utc::now();
        let patient_id = Uuid::new_v4();
        let wf = workflow(now, patient_id, RecallCampaignConfig::default());
        let target = RecallTarget {
            tenant_id: Uuid::new_v4(),
            patient_id,
            phone_number: "+491701234567".to_string(),
            reason: "nachsorge".to_string(),
            last_visit_at: None,
        };
        let task_id = wf.enqueue(&target, now).unwrap();
        wf.handle_outcome(task_id, DialOutcome { call_id: Uuid::new_v4(), outcome: "declined".to_string(), duration_seconds: Some(30) }).await;
        assert_eq!(wf.task(task_id).unwrap().status, CampaignTaskStatus::Completed);
        assert_eq!(wf.stats().declined, 1);
        assert!(wf.tasks.due_retries(now + chrono::Duration::days(1)).is_empty());
    }

    #[tokio::test]
    async fn paused_workflow_leaves_new_enqueues_pending() {
        let now = Utc::now();
        let patient_id = Uuid::new_v4();
        let wf = workflow(now, patient_id, RecallCampaignConfig::default());
        wf.pause();
        let target = RecallTarget {
            tenant_id: Uuid::new_v4(),
            patient_id,
            phone_number: "+491701234567".to_string(),
            reason: "kontrolle".to_string(),
            last_visit_at: None,
        };
        let task_id = wf.enqueue(&target, now).unwrap();
        assert_eq!(wf.task(task_id).unwrap().status, CampaignTaskStatus::Pending);
        assert_eq!(wf.stats().queued, 0);

        wf.resume();
        assert_eq!(wf.task(task_id).unwrap().status, CampaignTaskStatus::Calling);
        assert_eq!(wf.stats().queued, 1);
    }
}
