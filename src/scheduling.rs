//! C3: Slot Finder.
//!
//! Scores candidate free/busy gaps against the caller's stated preferences
//! (preferred time-of-day, preferred date, preferred provider, urgency) and
//! returns the top-scoring slots, grounded in the provider-preference scoring
//! style found across `industry/*/scheduling.py` (handwerk/gesundheit/gastro
//! all score candidate slots with additive/subtractive terms against a base).

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar::{Calendar, FreeBusySlot};
use crate::error::{CollaboratorError, PhoneAgentError, Result};
use crate::triage::UrgencyLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
}

impl TimeOfDay {
    fn matches_hour(self, hour: u32) -> bool {
        match self {
            TimeOfDay::Morning => (8..12).contains(&hour),
            TimeOfDay::Afternoon => (12..17).contains(&hour),
            TimeOfDay::Evening => (17..20).contains(&hour),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotPreferences {
    pub preferred_time_of_day: Option<TimeOfDay>,
    pub preferred_date: Option<chrono::NaiveDate>,
    pub preferred_provider_id: Option<Uuid>,
    pub urgency: Option<UrgencyLevel>,
    pub appointment_duration_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredSlot {
    pub provider_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub score: i64,
}

/// Wraps one or more `Calendar` collaborators (one per provider in the
/// simplest case) and produces ranked candidate slots.
pub struct SlotFinder<'a> {
    calendar: &'a dyn Calendar,
}

impl<'a> SlotFinder<'a> {
    pub fn new(calendar: &'a dyn Calendar) -> Self {
        Self { calendar }
    }

    /// Finds up to `limit` scored slots across `provider_ids` within
    /// `[window_start, window_end]`, honoring urgency-driven search-window
    /// tightening: an emergency/very-urgent caller only sees slots inside
    /// the next few hours even if the caller-provided window is wider.
    pub async fn find_slots(
        &self,
        provider_ids: &[Uuid],
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        prefs: &SlotPreferences,
        limit: usize,
    ) -> Result<Vec<ScoredSlot>> {
        if window_end <= window_start {
            return Err(PhoneAgentError::InvalidInput(
                "window_end must be after window_start".to_string(),
            ));
        }
        let effective_end = match prefs.urgency {
            Some(UrgencyLevel::Emergency) | Some(UrgencyLevel::VeryUrgent) => {
                window_end.min(window_start + ChronoDuration::hours(4))
            }
            Some(UrgencyLevel::Urgent) => window_end.min(window_start + ChronoDuration::hours(24)),
            _ => window_end,
        };

        let mut candidates = Vec::new();
        for provider_id in provider_ids {
            let free = match self.calendar.free_busy(*provider_id, window_start, effective_end).await
            {
                Ok(slots) => slots,
                Err(CollaboratorError::Transient(_)) | Err(CollaboratorError::Timeout) => {
                    continue; // skip this provider, try the others
                }
                Err(e) => return Err(PhoneAgentError::TransientExternal(e.to_string())),
            };
            for gap in free {
                for start in Self::quarter_hour_starts(gap, prefs.appointment_duration_minutes) {
                    let end = start + ChronoDuration::minutes(prefs.appointment_duration_minutes);
                    let score = Self::score(start, *provider_id, prefs);
                    candidates.push(ScoredSlot { provider_id: *provider_id, start, end, score });
                }
            }
        }

        candidates.sort_by(|a, b| b.score.cmp(&a.score).then(a.start.cmp(&b.start)));
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn quarter_hour_starts(gap: FreeBusySlot, duration_minutes: i64) -> Vec<DateTime<Utc>> {
        let mut starts = Vec::new();
        let mut cursor = gap.start;
        let step = ChronoDuration::minutes(15);
        let needed = ChronoDuration::minutes(duration_minutes.max(15));
        while cursor + needed <= gap.end {
            starts.push(cursor);
            cursor += step;
        }
        starts
    }

    /// Additive/subtractive scoring against a base of 100, mirroring the
    /// industry scheduling modules' style of stacking small bonuses/
    /// penalties rather than a single formula.
    fn score(start: DateTime<Utc>, provider_id: Uuid, prefs: &SlotPreferences) -> i64 {
        let mut score: i64 = 100;

        if let Some(tod) = prefs.preferred_time_of_day {
            if tod.matches_hour(start.hour()) {
                score += 20;
            } else {
                score -= 15;
            }
        }

        if let Some(date) = prefs.preferred_date {
            if start.date_naive() == date {
                score += 25;
            } else {
                let delta = (start.date_naive() - date).num_days().unsigned_abs();
                score -= (delta as i64).min(20) * 2;
            }
        }

        if let Some(preferred_provider) = prefs.preferred_provider_id {
            if preferred_provider == provider_id {
                score += 30;
            }
        }

        match prefs.urgency {
            Some(UrgencyLevel::Emergency) | Some(UrgencyLevel::VeryUrgent) => {
                let hours_out = (start - Utc::now()).num_hours();
                if hours_out <= 4 {
                    score += 40;
                }
            }
            Some(UrgencyLevel::Urgent) => {
                let hours_out = (start - Utc::now()).num_hours();
                if hours_out <= 24 {
                    score += 20;
                }
            }
            _ => {}
        }

        // Mild preference for standard weekday business hours over edges.
        if matches!(start.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
            score -= 10;
        }

        score
    }
}
