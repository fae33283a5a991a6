//! SMS delivery tracking: message record, webhook-driven status updates,
//! retry scheduling. Grounded in `db/repositories/sms.py`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::{CollaboratorError, DeliveryError, PhoneAgentError, Result};
use crate::gateway::{SendGridEvent, SipgateStatusWebhook, SmsGateway, TwilioStatusCallback};

use super::DeliveryStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmsProvider {
    Twilio,
    Sipgate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub to_number: String,
    pub body: String,
    pub status: DeliveryStatus,
    pub provider: SmsProvider,
    pub provider_message_id: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
}

impl SmsMessage {
    pub fn new(tenant_id: Uuid, to_number: String, body: String, provider: SmsProvider, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            to_number,
            body,
            status: DeliveryStatus::Pending,
            provider,
            provider_message_id: None,
            retry_count: 0,
            next_retry_at: None,
            queued_at: now,
            sent_at: None,
            delivered_at: None,
            error_code: None,
        }
    }

    /// Applies a forward-only status transition; rejects backward moves
    /// (a late-arriving "queued" webhook after "delivered" is a no-op, not
    /// an error) per `DeliveryStatus::can_transition_to`.
    pub fn apply_status(&mut self, next: DeliveryStatus, at: DateTime<Utc>) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Ok(()); // stale/out-of-order webhook, silently ignored
        }
        match next {
            DeliveryStatus::Sent => self.sent_at = Some(at),
            DeliveryStatus::Delivered => self.delivered_at = Some(at),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Schedules the next retry attempt without disturbing `status`: a
    /// message that just failed stays `Failed` while it waits out its
    /// backoff, matching `get_retryable`'s `status in (failed, undelivered)`
    /// query rather than reverting to `pending`. The delay is computed from
    /// the attempt count *before* incrementing it, so the first retry uses
    /// the base backoff rather than one doubling ahead of it.
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

/// Twilio reports 30001 (queue overflow) and 30003 (unreachable handset) as
/// transient; any other code (e.g. 30005 invalid number, 30006 landline)
/// is treated as permanent.
fn twilio_code_is_retryable(code: &str) -> bool {
    matches!(code, "30001" | "30003")
}

/// sipgate's error payloads mark transient failures with the literal word
/// "temporary"; anything else is treated as permanent.
fn sipgate_error_is_retryable(message: &str) -> bool {
    message.contains("temporary")
}

/// Classifies a gateway send failure against this provider's own retryable-
/// error table, per §4.4, rather than a blanket transient/permanent split.
/// Returns whether the sweep should ever schedule a retry, and the code
/// recorded on the message.
fn classify_send_failure(provider: SmsProvider, err: &CollaboratorError) -> (bool, String) {
    match err {
        CollaboratorError::Permanent(code) => (false, code.clone()),
        CollaboratorError::Transient(code) => {
            let retryable = match provider {
                SmsProvider::Twilio => twilio_code_is_retryable(code),
                SmsProvider::Sipgate => sipgate_error_is_retryable(code),
            };
            (retryable, code.clone())
        }
        CollaboratorError::RateLimited | CollaboratorError::Timeout => (true, err.to_string()),
        other => (false, other.to_string()),
    }
}

/// Sends through the gateway and stamps the provider message id on success.
/// On failure, classifies the error against the provider's retryable-code
/// table, records `error_code` and `status=failed` on the message, and
/// returns `TransientExternal` (caller may schedule a retry) or
/// `PermanentExternal` (caller must not).
pub async fn send(gateway: &dyn SmsGateway, message: &mut SmsMessage, now: DateTime<Utc>) -> Result<()> {
    match gateway.send(&message.to_number, &message.body).await {
        Ok(provider_id) => {
            message.provider_message_id = Some(provider_id);
            message.apply_status(DeliveryStatus::Queued, now)?;
            Ok(())
        }
        Err(e) => {
            let (retryable, code) = classify_send_failure(message.provider, &e);
            message.error_code = Some(code);
            message.apply_status(DeliveryStatus::Failed, now)?;
            if retryable {
                Err(PhoneAgentError::TransientExternal(e.to_string()))
            } else {
                Err(PhoneAgentError::PermanentExternal(e.to_string()))
            }
        }
    }
}

pub fn status_from_twilio(status: &str) -> Option<DeliveryStatus> {
    match status {
        "queued" | "accepted" => Some(DeliveryStatus::Queued),
        "sent" => Some(DeliveryStatus::Sent),
        "delivered" => Some(DeliveryStatus::Delivered),
        "failed" | "undelivered" => Some(DeliveryStatus::Failed),
        _ => None,
    }
}

pub fn apply_twilio_callback(message: &mut SmsMessage, cb: &TwilioStatusCallback, at: DateTime<Utc>) -> Result<()> {
    if message.provider_message_id.as_deref() != Some(cb.message_sid.as_str()) {
        return Err(PhoneAgentError::NotFound(DeliveryError::UnknownProviderMessageId(cb.message_sid.clone()).to_string()));
    }
    let status = status_from_twilio(&cb.message_status)
        .ok_or_else(|| PhoneAgentError::InvalidInput(DeliveryError::InvalidWebhook(cb.message_status.clone()).to_string()))?;
    message.error_code = cb.error_code.clone();
    message.apply_status(status, at)
}

pub fn status_from_sipgate(status: &str) -> Option<DeliveryStatus> {
    match status {
        "SENT" => Some(DeliveryStatus::Sent),
        "DELIVERED" => Some(DeliveryStatus::Delivered),
        "FAILED" => Some(DeliveryStatus::Failed),
        _ => None,
    }
}

pub fn apply_sipgate_webhook(message: &mut SmsMessage, webhook: &SipgateStatusWebhook, at: DateTime<Utc>) -> Result<()> {
    if message.provider_message_id.as_deref() != Some(webhook.message_id.as_str()) {
        return Err(PhoneAgentError::NotFound(DeliveryError::UnknownProviderMessageId(webhook.message_id.clone()).to_string()));
    }
    let status = status_from_sipgate(&webhook.status)
        .ok_or_else(|| PhoneAgentError::InvalidInput(DeliveryError::InvalidWebhook(webhook.status.clone()).to_string()))?;
    message.apply_status(status, at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_transition_is_ignored() {
        let mut msg = SmsMessage::new(Uuid::new_v4(), "+491701234567".to_string(), "hi".to_string(), SmsProvider::Twilio, Utc::now());
        msg.provider_message_id = Some("SM123".to_string());
        msg.apply_status(DeliveryStatus::Delivered, Utc::now()).unwrap();
        msg.apply_status(DeliveryStatus::Queued, Utc::now()).unwrap();
        assert_eq!(msg.status, DeliveryStatus::Delivered);
    }

    #[test]
    fn retry_stops_after_max() {
        let config = DeliveryConfig { max_retries: 2, ..DeliveryConfig::default() };
        let mut msg = SmsMessage::new(Uuid::new_v4(), "+491701234567".to_string(), "hi".to_string(), SmsProvider::Twilio, Utc::now());
        assert!(msg.mark_for_retry(&config, Utc::now()));
        assert!(msg.mark_for_retry(&config, Utc::now()));
        assert!(!msg.mark_for_retry(&config, Utc::now()));
    }

    #[test]
    fn first_retry_uses_base_delay_not_doubled() {
        let config = DeliveryConfig { base_backoff: std::time::Duration::from_secs(60), ..DeliveryConfig::default() };
        let now = Utc::now();
        let mut msg = SmsMessage::new(Uuid::new_v4(), "+491701234567".to_string(), "hi".to_string(), SmsProvider::Twilio, now);
        assert!(msg.mark_for_retry(&config, now));
        assert_eq!(msg.next_retry_at, Some(now + chrono::Duration::seconds(60)));
        assert!(msg.mark_for_retry(&config, now));
        assert_eq!(msg.next_retry_at, Some(now + chrono::Duration::seconds(120)));
    }

    struct FakeGateway {
        result: std::result::Result<String, CollaboratorError>,
    }

    #[async_trait::async_trait]
    impl SmsGateway for FakeGateway {
        async fn send(&self, _to: &str, _body: &str) -> std::result::Result<String, CollaboratorError> {
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn retryable_twilio_error_marks_failed_and_stays_retryable() {
        let gateway = FakeGateway { result: Err(CollaboratorError::Transient("30003".to_string())) };
        let mut msg = SmsMessage::new(Uuid::new_v4(), "+491701234567".to_string(), "hi".to_string(), SmsProvider::Twilio, Utc::now());
        let now = Utc::now();
        let err = send(&gateway, &mut msg, now).await.unwrap_err();
        assert!(matches!(err, PhoneAgentError::TransientExternal(_)));
        assert_eq!(msg.status, DeliveryStatus::Failed);
        assert_eq!(msg.error_code.as_deref(), Some("30003"));

        let config = DeliveryConfig { base_backoff: std::time::Duration::from_secs(60), ..DeliveryConfig::default() };
        assert!(msg.mark_for_retry(&config, now));
        assert_eq!(msg.next_retry_at, Some(now + chrono::Duration::seconds(60)));
        assert_eq!(msg.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn non_retryable_twilio_error_is_permanent() {
        let gateway = FakeGateway { result: Err(CollaboratorError::Transient("30005".to_string())) };
        let mut msg = SmsMessage::new(Uuid::new_v4(), "+491701234567".to_string(), "hi".to_string(), SmsProvider::Twilio, Utc::now());
        let err = send(&gateway, &mut msg, Utc::now()).await.unwrap_err();
        assert!(matches!(err, PhoneAgentError::PermanentExternal(_)));
        assert_eq!(msg.status, DeliveryStatus::Failed);
        assert_eq!(msg.error_code.as_deref(), Some("30005"));
    }

    #[tokio::test]
    async fn explicit_permanent_collaborator_error_never_retries() {
        let gateway = FakeGateway { result: Err(CollaboratorError::Permanent("invalid number".to_string())) };
        let mut msg = SmsMessage::new(Uuid::new_v4(), "+491701234567".to_string(), "hi".to_string(), SmsProvider::Twilio, Utc::now());
        let err = send(&gateway, &mut msg, Utc::now()).await.unwrap_err();
        assert!(matches!(err, PhoneAgentError::PermanentExternal(_)));
        assert_eq!(msg.error_code.as_deref(), Some("invalid number"));
    }

    #[tokio::test]
    async fn sipgate_temporary_error_is_retryable() {
        let gateway = FakeGateway { result: Err(CollaboratorError::Transient("temporary network error".to_string())) };
        let mut msg = SmsMessage::new(Uuid::new_v4(), "+491701234567".to_string(), "hi".to_string(), SmsProvider::Sipgate, Utc::now());
        let err = send(&gateway, &mut msg, Utc::now()).await.unwrap_err();
        assert!(matches!(err, PhoneAgentError::TransientExternal(_)));
    }

    #[tokio::test]
    async fn successful_retry_resend_moves_failed_to_queued() {
        let gateway = FakeGateway { result: Ok("SM999".to_string()) };
        let mut msg = SmsMessage::new(Uuid::new_v4(), "+491701234567".to_string(), "hi".to_string(), SmsProvider::Twilio, Utc::now());
        msg.status = DeliveryStatus::Failed;
        send(&gateway, &mut msg, Utc::now()).await.unwrap();
        assert_eq!(msg.status, DeliveryStatus::Queued);
        assert_eq!(msg.provider_message_id.as_deref(), Some("SM999"));
    }
}
