//! C4: Delivery-tracking state machines, shared skeleton for SMS and email.
//!
//! Grounded in `db/repositories/sms.py`'s status lifecycle
//! (`get_pending`/`get_retryable`/`mark_for_retry`) generalized into a
//! forward-only state machine: once a message reaches a terminal state it
//! cannot regress, matching the repository's `update_status` branches which
//! only ever move a message further along its lifecycle.

pub mod email;
pub mod sms;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DeliveryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Failed,
    Bounced,
    Spam,
    Unsubscribed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered
                | DeliveryStatus::Failed
                | DeliveryStatus::Bounced
                | DeliveryStatus::Spam
                | DeliveryStatus::Unsubscribed
        )
    }

    /// Forward-only transition table. Returns `false` for any backward or
    /// lateral move (e.g. `Delivered -> Sent`), including repeated identical
    /// transitions, which the webhook handler treats as idempotent no-ops
    /// rather than errors. `Failed -> Queued` is the one edge out of a
    /// terminal-looking state: a message stays `Failed` while its
    /// `retry_count` still allows another attempt, and a retried send that
    /// succeeds moves it forward from there rather than bouncing back
    /// through `Pending`.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Failed)
                | (Queued, Sent)
                | (Queued, Failed)
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Sent, Bounced)
                | (Sent, Spam)
                | (Sent, Unsubscribed)
                | (Failed, Queued)
        )
    }
}

/// Exponential-style backoff shared by SMS and email retry scheduling,
/// unifying what would otherwise be an inconsistent retry policy across
/// components into one formula.
pub fn next_retry_delay(config: &DeliveryConfig, retry_count: u32) -> std::time::Duration {
    let exp = config.base_backoff.as_secs().saturating_mul(1u64 << retry_count.min(10));
    std::time::Duration::from_secs(exp.min(config.max_backoff.as_secs()))
}

pub fn can_retry(config: &DeliveryConfig, retry_count: u32, next_retry_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    if retry_count >= config.max_retries {
        return false;
    }
    match next_retry_at {
        Some(at) => now >= at,
        None => true,
    }
}
