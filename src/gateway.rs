//! External interfaces: SMS and email gateways, plus the wire shapes of
//! their delivery-status webhooks (Twilio, sipgate, SendGrid).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Returns the provider's message id on success, for later correlation
    /// with delivery-status webhooks.
    async fn send(&self, to: &str, body: &str) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait EmailGateway: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, CollaboratorError>;
}

/// Twilio status-callback form fields (`application/x-www-form-urlencoded`).
#[derive(Debug, Clone, Deserialize)]
pub struct TwilioStatusCallback {
    #[serde(rename = "MessageSid")]
    pub message_sid: String,
    #[serde(rename = "MessageStatus")]
    pub message_status: String,
    #[serde(rename = "ErrorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "To")]
    pub to: String,
}

/// sipgate SMS status webhook (JSON body).
#[derive(Debug, Clone, Deserialize)]
pub struct SipgateStatusWebhook {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub status: String,
    pub recipient: String,
}

/// One event in a SendGrid event-webhook JSON array.
#[derive(Debug, Clone, Deserialize)]
pub struct SendGridEvent {
    pub email: String,
    pub event: String,
    pub sg_message_id: String,
    pub reason: Option<String>,
    pub timestamp: i64,
}

/// Verifies a Twilio `X-Twilio-Signature` header against the request URL and
/// form body, per Twilio's HMAC-SHA1-then-base64 scheme.
pub fn verify_twilio_signature(
    auth_token: &str,
    url: &str,
    sorted_params: &[(String, String)],
    signature_header: &str,
) -> bool {
    use base64::Engine;
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    type HmacSha1 = Hmac<Sha1>;
    let mut data = url.to_string();
    for (k, v) in sorted_params {
        data.push_str(k);
        data.push_str(v);
    }
    let mut mac = match HmacSha1::new_from_slice(auth_token.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(data.as_bytes());
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    expected == signature_header
}
