//! C5: Audit Logger.
//!
//! Grounded in `db/repositories/compliance.py`'s `create_with_chain` /
//! `verify_chain_integrity`. Each entry's checksum commits to the previous
//! entry's checksum, forming a hash chain. `verify_chain` walks the chain
//! oldest-to-newest, enforcing the forward-order chain invariant, rather
//! than the Python's newest-to-oldest traversal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AuditError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub actor_id: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub previous_checksum: String,
    pub checksum: String,
}

/// `checksum = SHA256(id ‖ ISO8601(timestamp) ‖ action ‖ actor_id ‖
/// resource_id ‖ previous_checksum)[..16 hex chars]`.
fn calculate_checksum(
    id: Uuid,
    timestamp: DateTime<Utc>,
    action: &str,
    actor_id: &str,
    resource_id: &str,
    previous_checksum: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_string().as_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(action.as_bytes());
    hasher.update(actor_id.as_bytes());
    hasher.update(resource_id.as_bytes());
    hasher.update(previous_checksum.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Minimal local hex encoder so we don't need to add the `hex` crate solely
/// for this; kept tiny and private to this module.
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

pub struct AuditLogger {
    last_checksum: parking_lot::Mutex<String>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self { last_checksum: parking_lot::Mutex::new(String::new()) }
    }

    /// Seeds the chain from the last-persisted entry's checksum, for a
    /// logger rehydrated after restart.
    pub fn with_last_checksum(last_checksum: String) -> Self {
        Self { last_checksum: parking_lot::Mutex::new(last_checksum) }
    }

    /// Builds and links the next entry; the caller is responsible for
    /// persisting it (this type holds no database handle, matching the
    /// "no lazy singleton" design note — persistence is a separate seam).
    pub fn log_event(
        &self,
        id: Uuid,
        timestamp: DateTime<Utc>,
        action: &str,
        actor_id: &str,
        resource_id: &str,
        details: serde_json::Value,
    ) -> AuditEntry {
        let mut last = self.last_checksum.lock();
        let checksum = calculate_checksum(id, timestamp, action, actor_id, resource_id, &last);
        let entry = AuditEntry {
            id,
            timestamp,
            action: action.to_string(),
            actor_id: actor_id.to_string(),
            resource_id: resource_id.to_string(),
            details,
            previous_checksum: last.clone(),
            checksum: checksum.clone(),
        };
        *last = checksum;
        entry
    }

    /// Verifies the chain oldest-to-newest: every entry's own checksum must
    /// recompute correctly, and every entry after the first must link to the
    /// one immediately before it in `entries`.
    pub fn verify_chain(entries: &[AuditEntry]) -> std::result::Result<(), AuditError> {
        for (i, entry) in entries.iter().enumerate() {
            let expected = calculate_checksum(
                entry.id,
                entry.timestamp,
                &entry.action,
                &entry.actor_id,
                &entry.resource_id,
                &entry.previous_checksum,
            );
            if expected != entry.checksum {
                return Err(AuditError::ChecksumMismatch(entry.id.to_string()));
            }
            if i > 0 {
                let previous = &entries[i - 1];
                if entry.previous_checksum != previous.checksum {
                    return Err(AuditError::BrokenChain(entry.id.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_sequential_entries() {
        let logger = AuditLogger::new();
        let e1 = logger.log_event(
            Uuid::new_v4(),
            Utc::now(),
            "call_completed",
            "system",
            "task-1",
            serde_json::json!({}),
        );
        let e2 = logger.log_event(
            Uuid::new_v4(),
            Utc::now(),
            "sms_sent",
            "system",
            "task-1",
            serde_json::json!({}),
        );
        assert_eq!(e2.previous_checksum, e1.checksum);
        assert!(AuditLogger::verify_chain(&[e1, e2]).is_ok());
    }

    #[test]
    fn tampered_entry_breaks_chain() {
        let logger = AuditLogger::new();
        let e1 = logger.log_event(Uuid::new_v4(), Utc::now(), "a", "s", "r1", serde_json::json!({}));
        let mut e2 = logger.log_event(Uuid::new_v4(), Utc::now(), "b", "s", "r2", serde_json::json!({}));
        e2.action = "tampered".to_string();
        assert!(AuditLogger::verify_chain(&[e1, e2]).is_err());
    }
}
