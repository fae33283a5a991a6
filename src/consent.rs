//! C6: Consent Store.
//!
//! Tracks per-subject, per-purpose consent state (DSGVO-style opt-in/opt-out)
//! so outbound workflows can gate contact attempts without reaching into a
//! repository directly — grounded in the Python workflows' uniform call to
//! `self._consent.check_consent(patient_id, ConsentType.PHONE_CONTACT)`
//! before queuing any outbound contact, generalized to the full consent
//! Consent model (status + expiry) rather than the simplified boolean the
//! earlier draft of this module used.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsentPurpose {
    PhoneContact,
    SmsContact,
    EmailContact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentStatus {
    Granted,
    Denied,
    Withdrawn,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consent {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub purpose: ConsentPurpose,
    pub status: ConsentStatus,
    pub granted_at: DateTime<Utc>,
    pub granted_by: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub withdrawn_at: Option<DateTime<Utc>>,
}

impl Consent {
    /// Invariant: `is_valid <=> status=granted && (expires_at is null || expires_at > now)`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.status == ConsentStatus::Granted && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

/// In-memory index keyed by (subject_id, purpose) -> the most recent
/// `Consent` for that pair; history of superseded grants is not retained in
/// this layer (the persistence collaborator owns the full append-only
/// history — this store only ever needs "what's current" to gate an
/// outbound attempt).
#[derive(Default)]
pub struct ConsentStore {
    records: DashMap<(Uuid, ConsentPurpose), Consent>,
}

impl ConsentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new granted consent, optionally expiring
    /// after `duration`. Overwrites any prior record for the pair — the
    /// most recent grant/withdrawal always wins.
    pub fn grant(
        &self,
        subject_id: Uuid,
        purpose: ConsentPurpose,
        granted_by: impl Into<String>,
        duration: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> Consent {
        let consent = Consent {
            id: Uuid::new_v4(),
            subject_id,
            purpose,
            status: ConsentStatus::Granted,
            granted_at: now,
            granted_by: granted_by.into(),
            expires_at: duration.map(|d| now + d),
            withdrawn_at: None,
        };
        self.records.insert((subject_id, purpose), consent.clone());
        consent
    }

    /// Sets status=withdrawn and stamps `withdrawn_at`.
    /// Never deletes; returns `None` if there was nothing to withdraw.
    pub fn withdraw(&self, subject_id: Uuid, purpose: ConsentPurpose, now: DateTime<Utc>) -> Option<Consent> {
        let mut entry = self.records.get_mut(&(subject_id, purpose))?;
        entry.status = ConsentStatus::Withdrawn;
        entry.withdrawn_at = Some(now);
        Some(entry.clone())
    }

    /// Absence of a record is treated as "no consent" — the
    /// store never assumes opt-in (fail-closed), matching the workflows'
    /// pattern of skipping a contact attempt when consent is missing.
    pub fn check(&self, subject_id: Uuid, purpose: ConsentPurpose, now: DateTime<Utc>) -> bool {
        self.records
            .get(&(subject_id, purpose))
            .map(|c| c.is_valid(now))
            .unwrap_or(false)
    }

    /// Back-compat convenience matching the workflows' call sites, which
    /// never need to pass `now` explicitly when wired to a live clock.
    pub fn check_consent(&self, subject_id: Uuid, purpose: ConsentPurpose) -> bool {
        self.check(subject_id, purpose, Utc::now())
    }

    pub fn record_denied(&self, subject_id: Uuid, purpose: ConsentPurpose, now: DateTime<Utc>) -> Consent {
        let consent = Consent {
            id: Uuid::new_v4(),
            subject_id,
            purpose,
            status: ConsentStatus::Denied,
            granted_at: now,
            granted_by: "explicit_denial".to_string(),
            expires_at: None,
            withdrawn_at: None,
        };
        self.records.insert((subject_id, purpose), consent.clone());
        consent
    }
}

/// Guards concurrent `grant`/`withdraw` calls for the same (subject,
/// purpose) pair from racing on the DashMap shard lock; kept as a thin
/// wrapper since `DashMap` entries already serialize per-key, but mirrors
/// the per-tenant mutex discipline used elsewhere in the crate.
pub type SharedConsentStore = std::sync::Arc<ConsentStore>;

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}
const _: fn() = || {
    _assert_send_sync::<ConsentStore>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_record_is_no_consent() {
        let store = ConsentStore::new();
        assert!(!store.check(Uuid::new_v4(), ConsentPurpose::PhoneContact, Utc::now()));
    }

    #[test]
    fn withdrawal_overrides_prior_grant() {
        let store = ConsentStore::new();
        let subject_id = Uuid::new_v4();
        let now = Utc::now();
        store.grant(subject_id, ConsentPurpose::PhoneContact, "ivr_opt_in", None, now);
        assert!(store.check(subject_id, ConsentPurpose::PhoneContact, now));
        store.withdraw(subject_id, ConsentPurpose::PhoneContact, now);
        assert!(!store.check(subject_id, ConsentPurpose::PhoneContact, now));
    }

    #[test]
    fn expired_grant_is_not_valid() {
        let store = ConsentStore::new();
        let subject_id = Uuid::new_v4();
        let now = Utc::now();
        store.grant(
            subject_id,
            ConsentPurpose::SmsContact,
            "form",
            Some(chrono::Duration::hours(1)),
            now,
        );
        assert!(store.check(subject_id, ConsentPurpose::SmsContact, now));
        assert!(!store.check(subject_id, ConsentPurpose::SmsContact, now + chrono::Duration::hours(2)));
    }
}
