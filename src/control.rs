//! C12: Public Control Surface.
//!
//! Exposes every command as one flat surface rather than a tiered client
//! hierarchy — one doc comment per command describing inputs, the result,
//! and failure modes. A single `ControlSurface` is what a shell (an HTTP
//! layer, a CLI, a scheduler) drives — every command below is documented the
//! same way: what it does, what it returns, how it fails.
//!
//! `ControlSurface` itself holds no appointment or recall data — fetching
//! "which appointments need a reminder today" or "which patients are due a
//! recall call" is delegated to [`AppointmentSource`] / [`RecallSource`],
//! two small collaborator traits in the same style as [`crate::calendar::Calendar`]
//! or [`crate::email_intake::MailboxClient`]: the core stays a pure function
//! of what it's handed, and wiring to a concrete scheduling/EHR system is an
//! application concern.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::campaigns::noshow::{NoShowCampaignStats, NoShowTarget, NoShowWorkflow};
use crate::campaigns::recall::{RecallCampaignStats, RecallTarget, RecallWorkflow};
use crate::campaigns::reminder::{ReminderCampaignStats, ReminderTarget, ReminderWorkflow};
use crate::database::DatabaseManager;
use crate::delivery::email::{self as email_delivery};
use crate::delivery::sms::{self as sms_delivery};
use crate::dialer::{CallPriority, DialerStats, OutboundDialer, QueuedCall};
use crate::error::{CollaboratorError, PhoneAgentError, Result};
use crate::gateway::{SendGridEvent, SipgateStatusWebhook, TwilioStatusCallback};

/// Supplies the appointments due a reminder call or a no-show follow-up.
/// An application wires this to its own scheduling/EHR integration; the
/// control surface never queries a calendar directly.
#[async_trait]
pub trait AppointmentSource: Send + Sync {
    async fn upcoming_reminders(
        &self,
        tenant_id: Uuid,
        target_date: Option<NaiveDate>,
        appointment_types: Option<&[String]>,
    ) -> std::result::Result<Vec<ReminderTarget>, CollaboratorError>;

    async fn recent_no_shows(
        &self,
        tenant_id: Uuid,
        target_date: Option<NaiveDate>,
    ) -> std::result::Result<Vec<NoShowTarget>, CollaboratorError>;
}

/// Supplies the patients due a recall call for a given campaign.
#[async_trait]
pub trait RecallSource: Send + Sync {
    async fn due_recalls(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        max_calls: Option<usize>,
    ) -> std::result::Result<Vec<RecallTarget>, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmsWebhookProvider {
    Twilio,
    Sipgate,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedCallSummary {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub phone_number: String,
    pub priority: CallPriority,
    pub queued_at: chrono::DateTime<chrono::Utc>,
}

impl From<&QueuedCall> for QueuedCallSummary {
    fn from(call: &QueuedCall) -> Self {
        Self {
            id: call.id,
            contact_id: call.contact_id,
            phone_number: call.phone_number.clone(),
            priority: call.priority,
            queued_at: call.queued_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmailWebhookStats {
    pub applied: u64,
    pub unknown_message_id: u64,
    pub invalid_event: u64,
}

/// The single command surface a shell drives. One `ControlSurface` is
/// scoped to a tenant; an application hosting several tenants holds one per
/// tenant rather than threading a `tenant_id` argument through every call
/// (matching how `RoutingEngine`/`OutboundDialer` are already per-tenant
/// constructs upstream of this layer).
pub struct ControlSurface {
    tenant_id: Uuid,
    db: Arc<DatabaseManager>,
    audit: Arc<AuditLogger>,
    clock: crate::clock::SharedClock,
    dialer: Arc<OutboundDialer>,
    reminder: Arc<ReminderWorkflow>,
    recall: Arc<RecallWorkflow>,
    noshow: Arc<NoShowWorkflow>,
    appointments: Arc<dyn AppointmentSource>,
    recalls: Arc<dyn RecallSource>,
}

impl ControlSurface {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: Uuid,
        db: Arc<DatabaseManager>,
        audit: Arc<AuditLogger>,
        clock: crate::clock::SharedClock,
        dialer: Arc<OutboundDialer>,
        reminder: Arc<ReminderWorkflow>,
        recall: Arc<RecallWorkflow>,
        noshow: Arc<NoShowWorkflow>,
        appointments: Arc<dyn AppointmentSource>,
        recalls: Arc<dyn RecallSource>,
    ) -> Self {
        Self { tenant_id, db, audit, clock, dialer, reminder, recall, noshow, appointments, recalls }
    }

    /// Fetches reminder-eligible appointments for `target_date` (today if
    /// omitted, optionally restricted to `appointment_types`) and enqueues
    /// each through the reminder workflow. Returns a fresh stats snapshot
    /// afterward rather than a delta.
    pub async fn start_reminder_campaign(
        &self,
        target_date: Option<NaiveDate>,
        appointment_types: Option<Vec<String>>,
    ) -> Result<ReminderCampaignStats> {
        let targets = self
            .appointments
            .upcoming_reminders(self.tenant_id, target_date, appointment_types.as_deref())
            .await
            .map_err(|e| PhoneAgentError::TransientExternal(e.to_string()))?;

        let now = self.clock.now();
        for target in &targets {
            self.reminder.enqueue(target, now);
        }
        info!(tenant_id = %self.tenant_id, count = targets.len(), "started reminder campaign");
        Ok(self.reminder.stats())
    }

    pub fn get_reminder_stats(&self) -> ReminderCampaignStats {
        self.reminder.stats()
    }

    /// Fetches up to `max_calls` due recalls for `campaign_id` and enqueues
    /// them through the recall workflow.
    pub async fn start_recall_calling(
        &self,
        campaign_id: Uuid,
        max_calls: Option<usize>,
    ) -> Result<RecallCampaignStats> {
        let targets = self
            .recalls
            .due_recalls(self.tenant_id, campaign_id, max_calls)
            .await
            .map_err(|e| match e {
                CollaboratorError::EventNotFound => {
                    PhoneAgentError::NotFound(format!("recall campaign {campaign_id}"))
                }
                other => PhoneAgentError::TransientExternal(other.to_string()),
            })?;

        let now = self.clock.now();
        for target in &targets {
            self.recall.enqueue(target, now);
        }
        info!(tenant_id = %self.tenant_id, %campaign_id, count = targets.len(), "started recall calling");
        Ok(self.recall.stats())
    }

    pub fn pause_recall(&self, campaign_id: Uuid) -> bool {
        self.recall.pause();
        info!(%campaign_id, "paused recall campaign");
        true
    }

    pub fn resume_recall(&self, campaign_id: Uuid) -> bool {
        self.recall.resume();
        info!(%campaign_id, "resumed recall campaign");
        true
    }

    /// Fetches no-shows for `target_date` whose elapsed time since the miss
    /// falls within `[min_hours_after, max_hours_after]` and enqueues a
    /// follow-up for each; no-shows outside the window are skipped (they are
    /// either too fresh — the front desk hasn't had a chance yet — or too
    /// stale to act on automatically).
    pub async fn process_no_shows(
        &self,
        target_date: Option<NaiveDate>,
        min_hours_after: i64,
        max_hours_after: i64,
    ) -> Result<NoShowCampaignStats> {
        let candidates = self
            .appointments
            .recent_no_shows(self.tenant_id, target_date)
            .await
            .map_err(|e| PhoneAgentError::TransientExternal(e.to_string()))?;

        let now = self.clock.now();
        let mut enqueued = 0usize;
        for target in &candidates {
            let hours_since = (now - target.no_show_at).num_minutes() as f64 / 60.0;
            if hours_since < min_hours_after as f64 || hours_since > max_hours_after as f64 {
                continue;
            }
            self.noshow.enqueue(target, now);
            enqueued += 1;
        }
        info!(
            tenant_id = %self.tenant_id,
            candidates = candidates.len(),
            enqueued,
            "processed no-shows"
        );
        Ok(self.noshow.stats())
    }

    pub fn get_call_queue(&self) -> Vec<QueuedCallSummary> {
        self.dialer.snapshot().iter().map(QueuedCallSummary::from).collect()
    }

    pub fn pause_dialer(&self) {
        self.dialer.pause();
    }

    pub fn resume_dialer(&self) {
        self.dialer.start();
    }

    pub fn cancel_queued_call(&self, call_id: Uuid) -> bool {
        self.dialer.cancel_call(call_id)
    }

    pub fn clear_call_queue(&self) -> usize {
        self.dialer.clear_queue()
    }

    pub fn dialer_stats(&self) -> DialerStats {
        self.dialer.stats()
    }

    /// Applies an SMS delivery-status webhook to the message it
    /// references, looked up by provider message id, and persists the
    /// result. Unknown `provider_message_id`s and malformed payloads are
    /// reported as errors by the underlying `delivery::sms` functions; both
    /// are treated as client errors, never retried.
    pub async fn handle_sms_webhook(
        &self,
        provider: SmsWebhookProvider,
        payload: serde_json::Value,
    ) -> Result<()> {
        let now = self.clock.now();
        match provider {
            SmsWebhookProvider::Twilio => {
                let callback: TwilioStatusCallback = serde_json::from_value(payload)
                    .map_err(|e| PhoneAgentError::InvalidInput(e.to_string()))?;
                let mut message = self
                    .db
                    .get_sms_by_provider_id(&callback.message_sid)
                    .await?
                    .ok_or_else(|| PhoneAgentError::NotFound(callback.message_sid.clone()))?;
                sms_delivery::apply_twilio_callback(&mut message, &callback, now)?;
                self.db.upsert_sms_message(&message).await?;
                let entry = self.audit.log_event(
                    Uuid::new_v4(),
                    now,
                    "sms_delivery_status_updated",
                    "webhook:twilio",
                    &message.id.to_string(),
                    serde_json::json!({ "status": message.status }),
                );
                self.db.insert_audit_entry(&entry).await?;
            }
            SmsWebhookProvider::Sipgate => {
                let webhook: SipgateStatusWebhook = serde_json::from_value(payload)
                    .map_err(|e| PhoneAgentError::InvalidInput(e.to_string()))?;
                let mut message = self
                    .db
                    .get_sms_by_provider_id(&webhook.message_id)
                    .await?
                    .ok_or_else(|| PhoneAgentError::NotFound(webhook.message_id.clone()))?;
                sms_delivery::apply_sipgate_webhook(&mut message, &webhook, now)?;
                self.db.upsert_sms_message(&message).await?;
                let entry = self.audit.log_event(
                    Uuid::new_v4(),
                    now,
                    "sms_delivery_status_updated",
                    "webhook:sipgate",
                    &message.id.to_string(),
                    serde_json::json!({ "status": message.status }),
                );
                self.db.insert_audit_entry(&entry).await?;
            }
        }
        Ok(())
    }

    /// Applies a SendGrid event-webhook array to the email messages
    /// it references. Unlike `handle_sms_webhook`, a single request can
    /// carry many events; failures on individual events are tallied rather
    /// than aborting the batch, matching SendGrid's own at-least-once
    /// delivery semantics (a partially-applied batch is still progress).
    pub async fn handle_email_webhook(&self, events: Vec<SendGridEvent>) -> Result<EmailWebhookStats> {
        let mut stats = EmailWebhookStats::default();
        for event in events {
            let message = match self.db.get_email_by_provider_id(&event.sg_message_id).await? {
                Some(m) => m,
                None => {
                    stats.unknown_message_id += 1;
                    continue;
                }
            };
            let mut message = message;
            if email_delivery::apply_sendgrid_event(&mut message, &event).is_err() {
                stats.invalid_event += 1;
                continue;
            }
            self.db.upsert_email_message(&message).await?;
            let entry = self.audit.log_event(
                Uuid::new_v4(),
                self.clock.now(),
                "email_delivery_status_updated",
                "webhook:sendgrid",
                &message.id.to_string(),
                serde_json::json!({ "status": message.status }),
            );
            self.db.insert_audit_entry(&entry).await?;
            stats.applied += 1;
        }
        if stats.unknown_message_id > 0 || stats.invalid_event > 0 {
            warn!(
                unknown = stats.unknown_message_id,
                invalid = stats.invalid_event,
                "email webhook batch had unresolved events"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{BusinessHoursConfig, DialerConfig, NoShowConfig, RecallCampaignConfig, ReminderCampaignConfig};
    use crate::consent::{ConsentPurpose, ConsentStore};
    use crate::delivery::sms::{SmsMessage, SmsProvider};
    use crate::error::CollaboratorError as CErr;
    use crate::gateway::SmsGateway;
    use crate::sip::{CallDirection, SipCall, SipCallState, SipClient};
    use chrono::Utc;
    use serde_json::Value;

    struct FakeSip;

    #[async_trait]
    impl SipClient for FakeSip {
        async fn originate_call(&self, destination: &str, _caller_id: Option<&str>, _metadata: Value) -> std::result::Result<SipCall, CErr> {
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
        async fn wait_for_answer(&self, _call_id: Uuid, _timeout: std::time::Duration) -> std::result::Result<bool, CErr> {
            Ok(true)
        }
        async fn hangup(&self, _call_id: Uuid) -> std::result::Result<(), CErr> {
            Ok(())
        }
        async fn send_dtmf(&self, _call_id: Uuid, _digits: &str) -> std::result::Result<(), CErr> {
            Ok(())
        }
        fn get_call(&self, _call_id: Uuid) -> Option<SipCall> {
            None
        }
    }

    struct FakeSms;

    #[async_trait]
    impl SmsGateway for FakeSms {
        async fn send(&self, _to: &str, _body: &str) -> std::result::Result<String, CErr> {
            Ok("SM-fake".to_string())
        }
    }

    struct NoAppointments;

    #[async_trait]
    impl AppointmentSource for NoAppointments {
        async fn upcoming_reminders(
            &self,
            _tenant_id: Uuid,
            _target_date: Option<NaiveDate>,
            _appointment_types: Option<&[String]>,
        ) -> std::result::Result<Vec<ReminderTarget>, CErr> {
            Ok(vec![])
        }

        async fn recent_no_shows(&self, _tenant_id: Uuid, _target_date: Option<NaiveDate>) -> std::result::Result<Vec<NoShowTarget>, CErr> {
            Ok(vec![])
        }
    }

    struct NoRecalls;

    #[async_trait]
    impl RecallSource for NoRecalls {
        async fn due_recalls(&self, _tenant_id: Uuid, _campaign_id: Uuid, _max_calls: Option<usize>) -> std::result::Result<Vec<RecallTarget>, CErr> {
            Err(CErr::EventNotFound)
        }
    }

    async fn surface() -> ControlSurface {
        let tenant_id = Uuid::new_v4();
        let now = Utc::now();
        let clock: crate::clock::SharedClock = Arc::new(FixedClock::new(now));
        let db = Arc::new(DatabaseManager::new_in_memory().await.unwrap());
        let audit = Arc::new(AuditLogger::new());
        let dialer = Arc::new(OutboundDialer::new(DialerConfig::default(), clock.clone(), Arc::new(FakeSip), BusinessHoursConfig::default()));
        let consent: crate::consent::SharedConsentStore = Arc::new(ConsentStore::new());
        let reminder = ReminderWorkflow::new(ReminderCampaignConfig::default(), clock.clone(), dialer.clone(), Arc::new(FakeSms), consent.clone(), audit.clone());
        let recall = RecallWorkflow::new(RecallCampaignConfig::default(), clock.clone(), dialer.clone(), Arc::new(FakeSms), consent.clone(), audit.clone());
        let noshow = NoShowWorkflow::new(NoShowConfig::default(), clock.clone(), dialer.clone(), Arc::new(FakeSms), consent, audit.clone());
        ControlSurface::new(
            tenant_id,
            db,
            audit,
            clock,
            dialer,
            reminder,
            recall,
            noshow,
            Arc::new(NoAppointments),
            Arc::new(NoRecalls),
        )
    }

    #[tokio::test]
    async fn start_recall_calling_surfaces_not_found() {
        let surface = surface().await;
        let err = surface.start_recall_calling(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, PhoneAgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn pause_and_resume_dialer_round_trip_status() {
        let surface = surface().await;
        surface.resume_dialer();
        assert_eq!(surface.dialer_stats().status, crate::dialer::DialerStatus::Running);
        surface.pause_dialer();
        assert_eq!(surface.dialer_stats().status, crate::dialer::DialerStatus::Paused);
    }

    #[tokio::test]
    async fn handle_sms_webhook_updates_persisted_message() {
        let surface = surface().await;
        let mut message = SmsMessage::new(surface.tenant_id, "+491701234567".to_string(), "hi".to_string(), SmsProvider::Twilio, Utc::now());
        message.provider_message_id = Some("SM123".to_string());
        surface.db.upsert_sms_message(&message).await.unwrap();

        let payload = serde_json::json!({
            "MessageSid": "SM123",
            "MessageStatus": "delivered",
            "ErrorCode": null,
            "To": "+491701234567",
        });
        surface.handle_sms_webhook(SmsWebhookProvider::Twilio, payload).await.unwrap();

        let updated = surface.db.get_sms_by_provider_id("SM123").await.unwrap().unwrap();
        assert_eq!(updated.status, crate::delivery::DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn handle_email_webhook_counts_unknown_message_ids() {
        let surface = surface().await;
        let events = vec![SendGridEvent {
            email: "a@b.de".to_string(),
            event: "delivered".to_string(),
            sg_message_id: "unknown-id".to_string(),
            reason: None,
            timestamp: Utc::now().timestamp(),
        }];
        let stats = surface.handle_email_webhook(events).await.unwrap();
        assert_eq!(stats.unknown_message_id, 1);
        assert_eq!(stats.applied, 0);
    }

    #[tokio::test]
    async fn pause_recall_then_resume_reports_true() {
        let surface = surface().await;
        assert!(surface.pause_recall(Uuid::new_v4()));
        assert!(surface.resume_recall(Uuid::new_v4()));
    }
}
