//! External interface: Calendar. A trait seam so the scheduling module
//! never embeds a mock calendar directly (Design Note: "Calendar Mock
//! embedded in the core" — the Python workflow reached into
//! `self._scheduling._calendar._appointments` directly; here, callers only
//! ever see `dyn Calendar`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CollaboratorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    pub attendee_contact_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeBusySlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// External calendar collaborator (e.g. Google Calendar, per
/// `integrations/calendar/google.py`). Implementations own their own retry
/// and auth; the trait only distinguishes transient vs permanent failure
/// via `CollaboratorError`.
#[async_trait]
pub trait Calendar: Send + Sync {
    async fn free_busy(
        &self,
        provider_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<FreeBusySlot>, CollaboratorError>;

    async fn book(
        &self,
        provider_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        title: &str,
        attendee_contact_id: Option<Uuid>,
    ) -> Result<CalendarEvent, CollaboratorError>;

    async fn cancel(&self, event_id: Uuid) -> Result<(), CollaboratorError>;

    async fn reschedule(
        &self,
        event_id: Uuid,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
    ) -> Result<CalendarEvent, CollaboratorError>;

    async fn get(&self, event_id: Uuid) -> Result<CalendarEvent, CollaboratorError>;
}
