//! External interface: SIP telephony.
//!
//! Grounded in `telephony/sip_client.py`'s `SIPCallState` state machine and
//! `SIPClient` method surface. The trait abstracts over the actual
//! signaling stack (sipgate trunk, FreeSWITCH ESL, etc.) the same way the
//! Python module anticipated ("In production: Send SIP INVITE via
//! FreeSWITCH ESL or webhook").

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CollaboratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SipCallState {
    Idle,
    Trying,
    Ringing,
    EarlyMedia,
    Confirmed,
    OnHold,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipCall {
    pub call_id: Uuid,
    pub sip_call_id: String,
    pub direction: CallDirection,
    pub state: SipCallState,
    pub caller_id: String,
    pub callee_id: String,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl SipCall {
    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.answered_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

/// SIP signaling collaborator. Callers originate, answer, transfer, and
/// hang up through this trait; state transitions are reported back via
/// `wait_for_answer`/`handle_outbound_progress` in the implementation.
#[async_trait]
pub trait SipClient: Send + Sync {
    async fn originate_call(
        &self,
        destination: &str,
        caller_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<SipCall, CollaboratorError>;

    /// Polls (or awaits a progress channel) until the call is confirmed,
    /// disconnected, or `timeout` elapses. Returns `true` only on
    /// confirmation — matches the Python's `wait_for_answer` contract.
    async fn wait_for_answer(
        &self,
        call_id: Uuid,
        timeout: std::time::Duration,
    ) -> Result<bool, CollaboratorError>;

    async fn hangup(&self, call_id: Uuid) -> Result<(), CollaboratorError>;

    async fn send_dtmf(&self, call_id: Uuid, digits: &str) -> Result<(), CollaboratorError>;

    fn get_call(&self, call_id: Uuid) -> Option<SipCall>;
}
