//! C9: Campaign Workflows — shared task skeleton.
//!
//! Each campaign (reminder, recall, no-show follow-up) tracks a set of
//! `CampaignTask`s driven through the `OutboundDialer`, in the style of the
//! Python workflow classes (`reminder_workflow.py`, `recall.py`,
//! `noshow_workflow.py`): build task, check consent, queue a dial, handle
//! the callback result, optionally schedule a retry. Unlike the Python,
//! retries are scheduled via `ScheduledRetry` entries drained by a timer
//! loop rather than `asyncio.sleep` blocking inside the result handler
//! (Design Note: async orchestration must not block a handler on a sleep).

pub mod noshow;
pub mod recall;
pub mod reminder;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::dialer::CallPriority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignTaskStatus {
    Pending,
    Calling,
    Completed,
    NoAnswer,
    Failed,
    Rescheduled,
    Cancelled,
}

/// A pending retry, scheduled for `fire_at` and drained by a caller-driven
/// sweep rather than a blocking sleep.
pub struct ScheduledRetry {
    pub task_id: Uuid,
    pub fire_at: DateTime<Utc>,
}

/// Generic in-memory task table shared by all three campaign workflows;
/// each workflow module defines its own richer task struct and keeps a
/// `CampaignTaskTable<TheirTaskType>` alongside a `Vec<ScheduledRetry>`.
pub struct CampaignTaskTable<T> {
    tasks: DashMap<Uuid, T>,
    retries: parking_lot::Mutex<Vec<ScheduledRetry>>,
}

impl<T: Clone> Default for CampaignTaskTable<T> {
    fn default() -> Self {
        Self { tasks: DashMap::new(), retries: parking_lot::Mutex::new(Vec::new()) }
    }
}

impl<T: Clone> CampaignTaskTable<T> {
    pub fn insert(&self, id: Uuid, task: T) {
        self.tasks.insert(id, task);
    }

    pub fn get(&self, id: Uuid) -> Option<T> {
        self.tasks.get(&id).map(|r| r.clone())
    }

    pub fn update<F: FnOnce(&mut T)>(&self, id: Uuid, f: F) {
        if let Some(mut entry) = self.tasks.get_mut(&id) {
            f(&mut entry);
        }
    }

    pub fn all(&self) -> Vec<T> {
        self.tasks.iter().map(|r| r.clone()).collect()
    }

    pub fn schedule_retry(&self, task_id: Uuid, fire_at: DateTime<Utc>) {
        self.retries.lock().push(ScheduledRetry { task_id, fire_at });
    }

    /// Pops every retry whose `fire_at` has passed, for the caller to act on.
    pub fn due_retries(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut retries = self.retries.lock();
        let (due, pending): (Vec<_>, Vec<_>) = retries.drain(..).partition(|r| r.fire_at <= now);
        *retries = pending;
        due.into_iter().map(|r| r.task_id).collect()
    }
}

/// Priority mapping shared by the reminder/recall/no-show workflows:
/// hours-until-event thresholds map to dialer `CallPriority` using
/// inclusive bounds (`<=4 -> Urgent, <=12 -> High, <=24 -> Normal, else
/// Low`) rather than the Python source's strict `<` comparisons.
pub fn priority_from_hours(hours: f64) -> CallPriority {
    if hours <= 4.0 {
        CallPriority::Urgent
    } else if hours <= 12.0 {
        CallPriority::High
    } else if hours <= 24.0 {
        CallPriority::Normal
    } else {
        CallPriority::Low
    }
}

pub type ResultCallback<T> = Arc<dyn Fn(T) + Send + Sync>;
