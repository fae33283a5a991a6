//! Typed configuration structs, loaded by the embedding application and
//! passed into constructors as plain typed structs, but nothing here reaches for a
//! global/lazy singleton. Every component takes its config by value at
//! construction time.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PhoneAgentConfig {
    pub database: DatabaseConfig,
    pub dialer: DialerConfig,
    pub delivery: DeliveryConfig,
    pub reminder: ReminderCampaignConfig,
    pub recall: RecallCampaignConfig,
    pub noshow: NoShowConfig,
    pub business_hours: BusinessHoursConfig,
    pub email_intake: EmailIntakeConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite::memory:".to_string(), max_connections: 5 }
    }
}

/// Outbound dialer tunables.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub max_concurrent_calls: usize,
    pub calls_per_minute: u32,
    pub ring_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff_base: Duration,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 8,
            calls_per_minute: 30,
            ring_timeout: Duration::from_secs(30),
            max_attempts: 2,
            retry_backoff_base: Duration::from_secs(60),
        }
    }
}

/// Delivery-tracking retry tunables, shared by SMS and email.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(900),
        }
    }
}

/// Appointment reminder campaign tunables, grounded in
/// `ReminderCampaignConfig` (reminder_workflow.py).
#[derive(Debug, Clone)]
pub struct ReminderCampaignConfig {
    pub reminder_hours_before: i64,
    pub min_hours_before: i64,
    pub max_attempts: u32,
    pub retry_delay_minutes: i64,
    pub sms_after_failed_attempts: u32,
    pub sms_enabled: bool,
    pub practice_name: String,
    pub practice_phone: String,
}

impl Default for ReminderCampaignConfig {
    fn default() -> Self {
        Self {
            reminder_hours_before: 24,
            min_hours_before: 2,
            max_attempts: 2,
            retry_delay_minutes: 60,
            sms_after_failed_attempts: 2,
            sms_enabled: true,
            practice_name: "Ihre Arztpraxis".to_string(),
            practice_phone: String::new(),
        }
    }
}

/// Recall campaign tunables.
#[derive(Debug, Clone)]
pub struct RecallCampaignConfig {
    pub max_attempts: u32,
    pub retry_delay_minutes: i64,
    pub sms_enabled: bool,
    pub practice_name: String,
    pub practice_phone: String,
}

impl Default for RecallCampaignConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_delay_minutes: 120,
            sms_enabled: true,
            practice_name: "Ihre Arztpraxis".to_string(),
            practice_phone: String::new(),
        }
    }
}

/// No-show follow-up tunables.
#[derive(Debug, Clone)]
pub struct NoShowConfig {
    pub follow_up_delay_minutes: i64,
    pub max_attempts: u32,
    pub sms_enabled: bool,
    pub practice_name: String,
    pub practice_phone: String,
}

impl Default for NoShowConfig {
    fn default() -> Self {
        Self {
            follow_up_delay_minutes: 30,
            max_attempts: 1,
            sms_enabled: true,
            practice_name: "Ihre Arztpraxis".to_string(),
            practice_phone: String::new(),
        }
    }
}

/// Business-hours gate tunables. Hours are in the tenant's local time
/// zone, resolved via `chrono-tz`.
#[derive(Debug, Clone)]
pub struct BusinessHoursConfig {
    pub timezone: String,
    pub open_hour: u32,
    pub close_hour: u32,
    pub open_days: Vec<chrono::Weekday>,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            timezone: "Europe/Berlin".to_string(),
            open_hour: 8,
            close_hour: 18,
            open_days: vec![
                chrono::Weekday::Mon,
                chrono::Weekday::Tue,
                chrono::Weekday::Wed,
                chrono::Weekday::Thu,
                chrono::Weekday::Fri,
            ],
        }
    }
}

/// Email intake loop tunables, grounded in the per-tenant IMAP poller.
#[derive(Debug, Clone)]
pub struct EmailIntakeConfig {
    pub poll_interval: Duration,
    pub inbox_folder: String,
    pub processed_folder: Option<String>,
    pub send_auto_reply: bool,
    pub mark_spam_as_read: bool,
}

impl Default for EmailIntakeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            inbox_folder: "INBOX".to_string(),
            processed_folder: Some("Processed".to_string()),
            send_auto_reply: true,
            mark_spam_as_read: true,
        }
    }
}

impl Default for PhoneAgentConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            dialer: DialerConfig::default(),
            delivery: DeliveryConfig::default(),
            reminder: ReminderCampaignConfig::default(),
            recall: RecallCampaignConfig::default(),
            noshow: NoShowConfig::default(),
            business_hours: BusinessHoursConfig::default(),
            email_intake: EmailIntakeConfig::default(),
        }
    }
}
