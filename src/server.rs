//! Top-level wiring: [`PhoneAgentServer`] assembles every subsystem
//! (clock/business-hours, triage, scheduling, delivery tracking, audit,
//! consent, dialer, campaigns, routing, email intake, control surface)
//! behind one handle, the shape a hosting application (an HTTP layer,
//! scheduler, or CLI) actually constructs and drives.
//!
//! Grounded in `CallCenterServer`/`CallCenterServerBuilder`: a builder
//! collects collaborator handles and config, `build()` wires the owned
//! subsystems together, `start()` spawns the background loops (dialer
//! dispatch, email intake, delivery retry sweep) as independent
//! `tokio::spawn` tasks, and `stop()` tears them down. There is no
//! SIP-registrar/agent-registration surface here — outbound calling and
//! inbound routing are the whole of this server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::campaigns::noshow::{NoShowCampaignStats, NoShowWorkflow};
use crate::campaigns::recall::{RecallCampaignStats, RecallWorkflow};
use crate::campaigns::reminder::{ReminderCampaignStats, ReminderWorkflow};
use crate::clock::{SharedClock, SystemClock};
use crate::config::PhoneAgentConfig;
use crate::control::{AppointmentSource, ControlSurface, RecallSource};
use crate::database::DatabaseManager;
use crate::delivery::email as email_delivery;
use crate::delivery::sms as sms_delivery;
use crate::dialer::{run_dispatch_loop, OutboundDialer};
use crate::email_intake::{
    run_intake_loop, EmailClassifier, EmailIntakeLoop, EmailIntakeStats, MailboxClient, RoutingContext,
};
use crate::error::{PhoneAgentError, Result};
use crate::gateway::{EmailGateway, SmsGateway};
use crate::routing::worker_selection::Worker;
use crate::routing::{Department, RoutingRule, Task};
use crate::sip::SipClient;

/// [`RoutingContext`] backed directly by [`DatabaseManager`], the
/// implementation the email intake loop is wired against in practice. Kept
/// here rather than in `email_intake` so that module stays free of a
/// concrete persistence dependency (matching its own "collaborator, not
/// core" framing).
struct DbRoutingContext {
    db: Arc<DatabaseManager>,
}

#[async_trait]
impl RoutingContext for DbRoutingContext {
    async fn rules(&self, tenant_id: Uuid) -> Vec<RoutingRule> {
        self.db.list_active_rules(tenant_id).await.unwrap_or_else(|e| {
            warn!(%tenant_id, error = %e, "failed to load routing rules");
            Vec::new()
        })
    }

    async fn departments(&self, tenant_id: Uuid) -> Vec<Department> {
        self.db.list_departments(tenant_id).await.unwrap_or_else(|e| {
            warn!(%tenant_id, error = %e, "failed to load departments");
            Vec::new()
        })
    }

    async fn workers(&self, tenant_id: Uuid) -> Vec<Worker> {
        self.db.list_workers(tenant_id).await.unwrap_or_else(|e| {
            warn!(%tenant_id, error = %e, "failed to load workers");
            Vec::new()
        })
    }

    async fn save_task(&self, task: &Task) {
        if let Err(e) = self.db.insert_task(task).await {
            error!(task_id = %task.id, error = %e, "failed to persist routed email task");
        }
        if task.assigned_worker_id.is_some() {
            if let Some(worker_id) = task.assigned_worker_id {
                if let Err(e) = self.db.increment_worker_task_count(worker_id).await {
                    error!(%worker_id, error = %e, "failed to increment worker task count");
                }
            }
        }
    }
}

/// One tenant's fully-wired server: the dialer, the three campaign
/// workflows, the routing-backed email intake loop, and the
/// [`ControlSurface`] a shell drives, plus the background tasks that keep
/// them running.
pub struct PhoneAgentServer {
    tenant_id: Uuid,
    db: Arc<DatabaseManager>,
    audit: Arc<AuditLogger>,
    clock: SharedClock,
    config: PhoneAgentConfig,
    sms_gateway: Arc<dyn SmsGateway>,
    email_gateway: Arc<dyn EmailGateway>,
    dialer: Arc<OutboundDialer>,
    reminder: Arc<ReminderWorkflow>,
    recall: Arc<RecallWorkflow>,
    noshow: Arc<NoShowWorkflow>,
    email_intake: Option<Arc<EmailIntakeLoop>>,
    control: ControlSurface,
    cancel: Arc<AtomicBool>,
    dispatch_handle: Option<JoinHandle<()>>,
    intake_handle: Option<JoinHandle<()>>,
    sweep_handle: Option<JoinHandle<()>>,
}

impl PhoneAgentServer {
    /// Starts the background loops: dialer dispatch, the delivery-tracking
    /// retry sweeper, and (if configured) the email intake poller. Calling
    /// `start` twice without an intervening `stop` leaks the first set of
    /// tasks — this is a single-use lifecycle.
    pub async fn start(&mut self) -> Result<()> {
        self.dialer.start();
        self.cancel.store(false, Ordering::Relaxed);

        let dialer = self.dialer.clone();
        self.dispatch_handle = Some(tokio::spawn(run_dispatch_loop(dialer, Duration::from_millis(200))));

        let sweep = self.clone_for_sweep();
        self.sweep_handle = Some(tokio::spawn(async move {
            sweep.run_delivery_sweep_loop().await;
        }));

        if let Some(intake) = &self.email_intake {
            let intake = intake.clone();
            let clock = self.clock.clone();
            let cancel = self.cancel.clone();
            self.intake_handle = Some(tokio::spawn(run_intake_loop(intake, clock, cancel)));
        }

        info!(tenant_id = %self.tenant_id, "phone agent server started");
        Ok(())
    }

    /// Stops the server: pauses intake/sweep loops, then drains the
    /// dialer (in-flight calls finish, queued calls are cancelled with
    /// their callbacks fired).
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.intake_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = self.dispatch_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.dialer.stop_and_drain();
        info!(tenant_id = %self.tenant_id, "phone agent server stopped");
        Ok(())
    }

    /// Runs until cancelled, logging a periodic stats snapshot. A hosting
    /// application typically calls `start`, then either `run` (for a
    /// long-lived process) or drives `control()` directly from its own
    /// event loop / HTTP handlers.
    pub async fn run(&self) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let stats = self.dialer.stats();
            info!(
                tenant_id = %self.tenant_id,
                queue_size = stats.queue_size,
                active_calls = stats.active_calls,
                completed_today = stats.completed_today,
                business_hours_active = stats.business_hours_active,
                "dialer status"
            );
        }
    }

    /// The command surface a shell (HTTP layer, scheduler, CLI) drives.
    pub fn control(&self) -> &ControlSurface {
        &self.control
    }

    pub fn dialer(&self) -> &Arc<OutboundDialer> {
        &self.dialer
    }

    pub fn reminder_stats(&self) -> ReminderCampaignStats {
        self.reminder.stats()
    }

    pub fn recall_stats(&self) -> RecallCampaignStats {
        self.recall.stats()
    }

    pub fn noshow_stats(&self) -> NoShowCampaignStats {
        self.noshow.stats()
    }

    pub fn email_intake_stats(&self) -> Option<EmailIntakeStats> {
        self.email_intake.as_ref().map(|i| i.stats())
    }

    /// Lightweight clone of just the handles the delivery sweep loop
    /// needs, so the loop body doesn't have to borrow `self` across an
    /// `.await` inside a spawned task.
    fn clone_for_sweep(&self) -> DeliverySweep {
        DeliverySweep {
            tenant_id: self.tenant_id,
            db: self.db.clone(),
            audit: self.audit.clone(),
            clock: self.clock.clone(),
            config: self.config.delivery.clone(),
            sms_gateway: self.sms_gateway.clone(),
            email_gateway: self.email_gateway.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Drains retryable SMS/email messages on a fixed tick: re-sends through
/// the gateway, applies the resulting status, and reschedules or finalizes
/// per [`crate::delivery`]'s retry policy. A background sweep rather than a
/// blocking sleep per message — there is no lock held here at all, only
/// database round-trips.
struct DeliverySweep {
    tenant_id: Uuid,
    db: Arc<DatabaseManager>,
    audit: Arc<AuditLogger>,
    clock: SharedClock,
    config: crate::config::DeliveryConfig,
    sms_gateway: Arc<dyn SmsGateway>,
    email_gateway: Arc<dyn EmailGateway>,
    cancel: Arc<AtomicBool>,
}

impl DeliverySweep {
    async fn run_delivery_sweep_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            interval.tick().await;
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            self.sweep_once().await;
        }
    }

    async fn sweep_once(&self) {
        let now = self.clock.now();

        match self.db.list_retryable_sms(now, self.config.max_retries).await {
            Ok(messages) => {
                for mut message in messages {
                    let message_id = message.id;
                    let entry = match sms_delivery::send(self.sms_gateway.as_ref(), &mut message, now).await {
                        Ok(()) => Some(self.audit.log_event(
                            Uuid::new_v4(),
                            now,
                            "sms_retry_sent",
                            "system:delivery_sweep",
                            &message_id.to_string(),
                            serde_json::json!({ "retry_count": message.retry_count }),
                        )),
                        // Classified non-retryable: already left `failed` with no
                        // `next_retry_at` by `send`, so it falls out of future sweeps.
                        Err(PhoneAgentError::PermanentExternal(_)) => Some(self.audit.log_event(
                            Uuid::new_v4(),
                            now,
                            "sms_retry_permanent_failure",
                            "system:delivery_sweep",
                            &message_id.to_string(),
                            serde_json::json!({ "error_code": message.error_code }),
                        )),
                        Err(_) => {
                            if !message.mark_for_retry(&self.config, now) {
                                Some(self.audit.log_event(
                                    Uuid::new_v4(),
                                    now,
                                    "sms_retry_exhausted",
                                    "system:delivery_sweep",
                                    &message_id.to_string(),
                                    serde_json::json!({ "retry_count": message.retry_count }),
                                ))
                            } else {
                                None
                            }
                        }
                    };
                    if let Err(e) = self.db.upsert_sms_message(&message).await {
                        error!(tenant_id = %self.tenant_id, message_id = %message_id, error = %e, "failed to persist sms retry");
                    }
                    if let Some(entry) = entry {
                        if let Err(e) = self.db.insert_audit_entry(&entry).await {
                            error!(tenant_id = %self.tenant_id, message_id = %message_id, error = %e, "failed to persist audit entry for sms retry");
                        }
                    }
                }
            }
            Err(e) => warn!(tenant_id = %self.tenant_id, error = %e, "failed to list retryable sms messages"),
        }

        match self.db.list_retryable_email(now, self.config.max_retries).await {
            Ok(messages) => {
                for mut message in messages {
                    let message_id = message.id;
                    let entry = match email_delivery::send(self.email_gateway.as_ref(), &mut message, now).await {
                        Ok(()) => Some(self.audit.log_event(
                            Uuid::new_v4(),
                            now,
                            "email_retry_sent",
                            "system:delivery_sweep",
                            &message_id.to_string(),
                            serde_json::json!({ "retry_count": message.retry_count }),
                        )),
                        Err(PhoneAgentError::PermanentExternal(_)) => Some(self.audit.log_event(
                            Uuid::new_v4(),
                            now,
                            "email_retry_permanent_failure",
                            "system:delivery_sweep",
                            &message_id.to_string(),
                            serde_json::json!({ "bounce_reason": message.bounce_reason }),
                        )),
                        Err(_) => {
                            if !message.mark_for_retry(&self.config, now) {
                                Some(self.audit.log_event(
                                    Uuid::new_v4(),
                                    now,
                                    "email_retry_exhausted",
                                    "system:delivery_sweep",
                                    &message_id.to_string(),
                                    serde_json::json!({ "retry_count": message.retry_count }),
                                ))
                            } else {
                                None
                            }
                        }
                    };
                    if let Err(e) = self.db.upsert_email_message(&message).await {
                        error!(tenant_id = %self.tenant_id, message_id = %message_id, error = %e, "failed to persist email retry");
                    }
                    if let Some(entry) = entry {
                        if let Err(e) = self.db.insert_audit_entry(&entry).await {
                            error!(tenant_id = %self.tenant_id, message_id = %message_id, error = %e, "failed to persist audit entry for email retry");
                        }
                    }
                }
            }
            Err(e) => warn!(tenant_id = %self.tenant_id, error = %e, "failed to list retryable email messages"),
        }
    }
}

/// Fluent builder for [`PhoneAgentServer`]: collect collaborator handles
/// and configuration, then `build()` wires the owned subsystems.
pub struct PhoneAgentServerBuilder {
    tenant_id: Option<Uuid>,
    config: PhoneAgentConfig,
    db: Option<Arc<DatabaseManager>>,
    clock: Option<SharedClock>,
    sip: Option<Arc<dyn SipClient>>,
    sms_gateway: Option<Arc<dyn SmsGateway>>,
    email_gateway: Option<Arc<dyn EmailGateway>>,
    appointments: Option<Arc<dyn AppointmentSource>>,
    recalls: Option<Arc<dyn RecallSource>>,
    mailbox: Option<Arc<dyn MailboxClient>>,
    classifier: Option<Arc<dyn EmailClassifier>>,
}

impl PhoneAgentServerBuilder {
    pub fn new() -> Self {
        Self {
            tenant_id: None,
            config: PhoneAgentConfig::default(),
            db: None,
            clock: None,
            sip: None,
            sms_gateway: None,
            email_gateway: None,
            appointments: None,
            recalls: None,
            mailbox: None,
            classifier: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_config(mut self, config: PhoneAgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_database(mut self, db: Arc<DatabaseManager>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_sip_client(mut self, sip: Arc<dyn SipClient>) -> Self {
        self.sip = Some(sip);
        self
    }

    pub fn with_sms_gateway(mut self, gateway: Arc<dyn SmsGateway>) -> Self {
        self.sms_gateway = Some(gateway);
        self
    }

    pub fn with_email_gateway(mut self, gateway: Arc<dyn EmailGateway>) -> Self {
        self.email_gateway = Some(gateway);
        self
    }

    pub fn with_appointment_source(mut self, source: Arc<dyn AppointmentSource>) -> Self {
        self.appointments = Some(source);
        self
    }

    pub fn with_recall_source(mut self, source: Arc<dyn RecallSource>) -> Self {
        self.recalls = Some(source);
        self
    }

    /// Enables the email intake loop (C11). Optional: a tenant with no
    /// inbound mailbox simply never gets one spawned by `start()`.
    pub fn with_email_intake(mut self, mailbox: Arc<dyn MailboxClient>, classifier: Arc<dyn EmailClassifier>) -> Self {
        self.mailbox = Some(mailbox);
        self.classifier = Some(classifier);
        self
    }

    pub async fn build(self) -> Result<PhoneAgentServer> {
        let tenant_id = self
            .tenant_id
            .ok_or_else(|| PhoneAgentError::InvalidInput("tenant_id not provided".to_string()))?;
        let sip = self
            .sip
            .ok_or_else(|| PhoneAgentError::InvalidInput("sip client not provided".to_string()))?;
        let sms_gateway = self
            .sms_gateway
            .ok_or_else(|| PhoneAgentError::InvalidInput("sms gateway not provided".to_string()))?;
        let email_gateway = self
            .email_gateway
            .ok_or_else(|| PhoneAgentError::InvalidInput("email gateway not provided".to_string()))?;
        let appointments = self
            .appointments
            .ok_or_else(|| PhoneAgentError::InvalidInput("appointment source not provided".to_string()))?;
        let recalls = self
            .recalls
            .ok_or_else(|| PhoneAgentError::InvalidInput("recall source not provided".to_string()))?;

        let db = match self.db {
            Some(db) => db,
            None => Arc::new(DatabaseManager::new_in_memory().await.map_err(|e| PhoneAgentError::Database(
                crate::error::DatabaseError::Connection(e.to_string()),
            ))?),
        };
        let clock: SharedClock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new(self.config.business_hours.timezone.clone())));
        let audit = Arc::new(AuditLogger::new());
        let consent = Arc::new(crate::consent::ConsentStore::new());

        let dialer = Arc::new(OutboundDialer::new(
            self.config.dialer.clone(),
            clock.clone(),
            sip,
            self.config.business_hours.clone(),
        ));

        let reminder = ReminderWorkflow::new(
            self.config.reminder.clone(),
            clock.clone(),
            dialer.clone(),
            sms_gateway.clone(),
            consent.clone(),
            audit.clone(),
        );
        let recall = RecallWorkflow::new(
            self.config.recall.clone(),
            clock.clone(),
            dialer.clone(),
            sms_gateway.clone(),
            consent.clone(),
            audit.clone(),
        );
        let noshow = NoShowWorkflow::new(
            self.config.noshow.clone(),
            clock.clone(),
            dialer.clone(),
            sms_gateway.clone(),
            consent,
            audit.clone(),
        );

        let email_intake = match (self.mailbox, self.classifier) {
            (Some(mailbox), Some(classifier)) => {
                let routing_context: Arc<dyn RoutingContext> = Arc::new(DbRoutingContext { db: db.clone() });
                Some(Arc::new(EmailIntakeLoop::new(
                    tenant_id,
                    self.config.email_intake.clone(),
                    mailbox,
                    classifier,
                    email_gateway.clone(),
                    routing_context,
                    self.config.reminder.practice_name.clone(),
                )))
            }
            _ => None,
        };

        let control = ControlSurface::new(
            tenant_id,
            db.clone(),
            audit.clone(),
            clock.clone(),
            dialer.clone(),
            reminder.clone(),
            recall.clone(),
            noshow.clone(),
            appointments,
            recalls,
        );

        Ok(PhoneAgentServer {
            tenant_id,
            db,
            audit,
            clock,
            config: self.config,
            sms_gateway,
            email_gateway,
            dialer,
            reminder,
            recall,
            noshow,
            email_intake,
            control,
            cancel: Arc::new(AtomicBool::new(true)),
            dispatch_handle: None,
            intake_handle: None,
            sweep_handle: None,
        })
    }
}

impl Default for PhoneAgentServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
