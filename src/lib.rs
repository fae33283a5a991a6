//! Phone-agent core: the call-handling, scheduling, and outreach engine
//! behind a small-business telephone assistant.
//!
//! One module per concern, a crate-wide `Result`/error enum, no
//! global/lazy singleton state, built around a business-hours gate
//! (C1), triage (C2), slot finding (C3), delivery tracking (C4), an audit
//! log (C5), consent (C6), an outbound dialer (C7), a conversation driver
//! (C8), campaign workflows (C9), a routing engine (C10), an email intake
//! loop (C11), and a public control surface (C12), all wired together by
//! [`server::PhoneAgentServer`].

pub mod audit;
pub mod calendar;
pub mod campaigns;
pub mod clock;
pub mod config;
pub mod consent;
pub mod control;
pub mod conversation;
pub mod database;
pub mod delivery;
pub mod dialer;
pub mod email_intake;
pub mod error;
pub mod gateway;
pub mod routing;
pub mod scheduling;
pub mod server;
pub mod sip;
pub mod triage;

/// Re-exports of the types most call sites need, so embedding applications
/// don't have to chase down each
/// submodule individually.
pub mod prelude {
    pub use crate::audit::{AuditEntry, AuditLogger};
    pub use crate::calendar::{Calendar, CalendarEvent, FreeBusySlot};
    pub use crate::clock::{BusinessHoursGate, Clock, FixedClock, SharedClock, SystemClock};
    pub use crate::config::PhoneAgentConfig;
    pub use crate::consent::{Consent, ConsentPurpose, ConsentStatus, ConsentStore, SharedConsentStore};
    pub use crate::control::ControlSurface;
    pub use crate::conversation::{ConversationDriver, DialogPolicy, SpeechToText, TextToSpeech};
    pub use crate::delivery::DeliveryStatus;
    pub use crate::dialer::{CallOutcomeResolver, CallPriority, DialOutcome, OutboundDialer};
    pub use crate::email_intake::{EmailIntakeLoop, InboundEmail};
    pub use crate::error::{PhoneAgentError, Result};
    pub use crate::gateway::{EmailGateway, SmsGateway};
    pub use crate::routing::{RoutingDecision, RoutingEngine, Task, Urgency};
    pub use crate::scheduling::SlotFinder;
    pub use crate::server::{PhoneAgentServer, PhoneAgentServerBuilder};
    pub use crate::sip::SipClient;
    pub use crate::triage::{PatientContext, Symptom, TriageAssessor, TriageResult, UrgencyLevel};
}
