//! Email delivery tracking, parallel to `delivery::sms` but driven by
//! SendGrid event-webhook arrays rather than single-callback POSTs.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::{CollaboratorError, DeliveryError, PhoneAgentError, Result};
use crate::gateway::{EmailGateway, SendGridEvent};

use super::DeliveryStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub to_address: String,
    pub subject: String,
    pub body: String,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub bounce_reason: Option<String>,
}

impl EmailMessage {
    pub fn new(tenant_id: Uuid, to_address: String, subject: String, body: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            to_address,
            subject,
            body,
            status: DeliveryStatus::Pending,
            provider_message_id: None,
            retry_count: 0,
            next_retry_at: None,
            queued_at: now,
            sent_at: None,
            delivered_at: None,
            bounce_reason: None,
        }
    }

    pub fn apply_status(&mut self, next: DeliveryStatus, at: DateTime<Utc>) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Ok(());
        }
        match next {
            DeliveryStatus::Sent => self.sent_at = Some(at),
            DeliveryStatus::Delivered => self.delivered_at = Some(at),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// See `sms::SmsMessage::mark_for_retry`: status stays `Failed` while a
    /// retry is pending, and the backoff is computed from the attempt count
    /// before incrementing it.
    pub fn mark_for_retry(&mut self, config: &DeliveryConfig, now: DateTime<Utc>) -> bool {
        if self.retry_count >= config.max_retries {
            return false;
        }
        let delay = super::next_retry_delay(config, self.retry_count);
        self.retry_count += 1;
        self.next_retry_at = Some(now + chrono::Duration::from_std(delay).unwrap());
        true
    }

    pub fn can_retry(&self, config: &DeliveryConfig, now: DateTime<Utc>) -> bool {
        super::can_retry(config, self.retry_count, self.next_retry_at, now)
    }
}

/// SendGrid's own taxonomy: a soft bounce (enhanced SMTP status in the
/// 4.x.x range, e.g. "mailbox full") is transient; anything else, or no
/// reason at all, is a hard/permanent bounce.
fn sendgrid_bounce_is_soft(reason: Option<&str>) -> bool {
    reason.map(|r| r.trim_start().starts_with("4.")).unwrap_or(false)
}

/// Classifies a gateway send failure the same way `sms::classify_send_failure`
/// does: `Permanent` never retries, `Transient` retries only for SendGrid's
/// own retryable reasons (soft-bounce-shaped or explicitly "deferred").
fn classify_send_failure(err: &CollaboratorError) -> (bool, String) {
    match err {
        CollaboratorError::Permanent(code) => (false, code.clone()),
        CollaboratorError::Transient(code) => {
            let retryable = code.contains("deferred") || sendgrid_bounce_is_soft(Some(code));
            (retryable, code.clone())
        }
        CollaboratorError::RateLimited | CollaboratorError::Timeout => (true, err.to_string()),
        other => (false, other.to_string()),
    }
}

pub async fn send(gateway: &dyn EmailGateway, message: &mut EmailMessage, now: DateTime<Utc>) -> Result<()> {
    match gateway.send(&message.to_address, &message.subject, &message.body).await {
        Ok(provider_id) => {
            message.provider_message_id = Some(provider_id);
            message.apply_status(DeliveryStatus::Queued, now)?;
            Ok(())
        }
        Err(e) => {
            let (retryable, code) = classify_send_failure(&e);
            message.bounce_reason = Some(code);
            message.apply_status(DeliveryStatus::Failed, now)?;
            if retryable {
                Err(PhoneAgentError::TransientExternal(e.to_string()))
            } else {
                Err(PhoneAgentError::PermanentExternal(e.to_string()))
            }
        }
    }
}

fn status_from_sendgrid(event: &str) -> Option<DeliveryStatus> {
    match event {
        "processed" => Some(DeliveryStatus::Queued),
        "delivered" => Some(DeliveryStatus::Delivered),
        "bounce" => Some(DeliveryStatus::Bounced),
        "dropped" => Some(DeliveryStatus::Failed),
        "spamreport" => Some(DeliveryStatus::Spam),
        "unsubscribe" => Some(DeliveryStatus::Unsubscribed),
        _ => None,
    }
}

/// Applies one SendGrid event. A soft ("deferred", or a bounce with a 4.x.x
/// enhanced status) failure is recorded but left eligible for the retry
/// sweep rather than moved to a terminal status; a hard bounce, drop, spam
/// report, or unsubscribe is terminal per `status_from_sendgrid`.
pub fn apply_sendgrid_event(message: &mut EmailMessage, event: &SendGridEvent) -> Result<()> {
    if message.provider_message_id.as_deref() != Some(event.sg_message_id.as_str()) {
        return Err(PhoneAgentError::NotFound(
            DeliveryError::UnknownProviderMessageId(event.sg_message_id.clone()).to_string(),
        ));
    }
    let at = Utc.timestamp_opt(event.timestamp, 0).single().unwrap_or_else(Utc::now);

    if event.event == "deferred" {
        message.bounce_reason = event.reason.clone();
        return Ok(());
    }
    if event.event == "bounce" && sendgrid_bounce_is_soft(event.reason.as_deref()) {
        message.bounce_reason = event.reason.clone();
        return message.apply_status(DeliveryStatus::Failed, at);
    }

    let status = status_from_sendgrid(&event.event)
        .ok_or_else(|| PhoneAgentError::InvalidInput(DeliveryError::InvalidWebhook(event.event.clone()).to_string()))?;
    if status == DeliveryStatus::Bounced {
        message.bounce_reason = event.reason.clone();
    }
    message.apply_status(status, at)
}
