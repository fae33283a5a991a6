//! C7: Outbound Dialer.
//!
//! Built around an `Arc<DashMap<..>>` call table and a background
//! `tokio::spawn` loop draining a queue, with `Arc`-only clones so handles
//! are cheap to pass into each spawned task, driving a priority dial queue
//! with rate limiting and bounded concurrency.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::DialerConfig;
use crate::error::{DialerError, PhoneAgentError, Result};
use crate::sip::SipClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CallPriority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialerStatus {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialOutcome {
    pub call_id: Uuid,
    pub outcome: String,
    pub duration_seconds: Option<i64>,
}

#[derive(Clone)]
pub struct QueuedCall {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub phone_number: String,
    pub priority: CallPriority,
    pub queued_at: DateTime<Utc>,
    pub metadata: Value,
    pub callback: Arc<dyn Fn(DialOutcome) + Send + Sync>,
}

/// Priority ASC... no: priority DESC (Urgent first), then queued_at ASC
/// (FIFO within a priority tier) — a max-heap on `(priority, Reverse(time))`.
struct HeapEntry {
    priority: CallPriority,
    queued_at: DateTime<Utc>,
    call: QueuedCall,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.queued_at == other.queued_at
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
    }
}

/// Token-bucket style rate limiter: at most `calls_per_minute` dial attempts
/// start in any rolling 60-second window.
struct RateLimiter {
    capacity: u32,
    tokens: Mutex<(u32, DateTime<Utc>)>,
}

impl RateLimiter {
    fn new(calls_per_minute: u32, now: DateTime<Utc>) -> Self {
        Self { capacity: calls_per_minute, tokens: Mutex::new((calls_per_minute, now)) }
    }

    fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.tokens.lock();
        let elapsed = (now - state.1).num_seconds().max(0) as u64;
        if elapsed > 0 {
            let refill = ((elapsed as f64 / 60.0) * self.capacity as f64) as u32;
            state.0 = (state.0 + refill).min(self.capacity);
            state.1 = now;
        }
        if state.0 > 0 {
            state.0 -= 1;
            true
        } else {
            false
        }
    }
}

/// Shared dial-queue state, cloned cheaply across spawned tasks the way
/// `CallCenterEngine::clone` only ever clones `Arc` handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialerStats {
    pub status: DialerStatus,
    pub queue_size: usize,
    pub active_calls: usize,
    pub completed_today: u64,
    pub business_hours_active: bool,
    pub next_business_start: Option<DateTime<Utc>>,
}

/// Resolves the rich campaign-level outcome of an answered call by handing
/// it to the conversation driver (C8) — a seam, not a concrete dependency,
/// matching the "opaque contract" non-goal for the STT/LLM/TTS
/// pipeline. Each campaign workflow supplies its own resolver so the dialer
/// stays ignorant of reminder/recall/no-show semantics.
#[async_trait::async_trait]
pub trait CallOutcomeResolver: Send + Sync {
    async fn resolve(&self, call_id: Uuid, contact_id: Uuid, metadata: &Value) -> String;
}

#[derive(Clone)]
pub struct OutboundDialer {
    config: DialerConfig,
    clock: SharedClock,
    business_hours: Arc<crate::clock::BusinessHoursGate>,
    queue: Arc<Mutex<BinaryHeap<HeapEntry>>>,
    in_flight: Arc<DashMap<Uuid, QueuedCall>>,
    completed_today: Arc<Mutex<(chrono::NaiveDate, u64)>>,
    rate_limiter: Arc<RateLimiter>,
    concurrency: Arc<Semaphore>,
    status: Arc<Mutex<DialerStatus>>,
    sip: Arc<dyn SipClient>,
    resolver: Option<Arc<dyn CallOutcomeResolver>>,
}

impl OutboundDialer {
    pub fn new(
        config: DialerConfig,
        clock: SharedClock,
        sip: Arc<dyn SipClient>,
        business_hours: crate::config::BusinessHoursConfig,
    ) -> Self {
        let now = clock.now();
        Self {
            rate_limiter: Arc::new(RateLimiter::new(config.calls_per_minute, now)),
            concurrency: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            completed_today: Arc::new(Mutex::new((now.date_naive(), 0))),
            business_hours: Arc::new(crate::clock::BusinessHoursGate::new(business_hours)),
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            in_flight: Arc::new(DashMap::new()),
            status: Arc::new(Mutex::new(DialerStatus::Stopped)),
            resolver: None,
            config,
            clock,
            sip,
        }
    }

    /// Installs the `CallOutcomeResolver` used to classify answered calls.
    /// Typically called once per campaign-scoped dialer handle.
    pub fn with_resolver(mut self, resolver: Arc<dyn CallOutcomeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn queue_call(
        &self,
        contact_id: Uuid,
        phone_number: String,
        priority: CallPriority,
        metadata: Value,
        callback: Arc<dyn Fn(DialOutcome) + Send + Sync>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let queued_at = self.clock.now();
        let call = QueuedCall { id, contact_id, phone_number, priority, queued_at, metadata, callback };
        self.queue.lock().push(HeapEntry { priority, queued_at, call });
        debug!(call_id = %id, "queued outbound call");
        id
    }

    /// Succeeds only while the call is still queued
    /// (not in-flight). O(n) rebuild of the heap, acceptable at this scale.
    pub fn cancel_call(&self, call_id: Uuid) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        let remaining: Vec<HeapEntry> = queue.drain().filter(|e| e.call.id != call_id).collect();
        let removed = remaining.len() != before;
        *queue = remaining.into_iter().collect();
        removed
    }

    /// Empties non-in-flight entries, returning the
    /// count removed. Does not invoke callbacks (unlike `stop_and_drain`,
    /// which explicitly fires `cancelled` outcomes) — a plain `clear` is a
    /// queue reset a caller may follow with fresh enqueues.
    pub fn clear_queue(&self) -> usize {
        let mut queue = self.queue.lock();
        let count = queue.len();
        queue.clear();
        count
    }

    /// Queued calls in priority order (does not include
    /// in-flight calls, which have left the queue).
    pub fn snapshot(&self) -> Vec<QueuedCall> {
        let queue = self.queue.lock();
        let mut entries: Vec<&HeapEntry> = queue.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.call.clone()).collect()
    }

    pub fn stats(&self) -> DialerStats {
        let now = self.clock.now();
        let business_hours_active = self.business_hours.is_open(now);
        DialerStats {
            status: self.status(),
            queue_size: self.queue_depth(),
            active_calls: self.in_flight_count(),
            completed_today: self.completed_today(),
            business_hours_active,
            next_business_start: if business_hours_active {
                None
            } else {
                Some(self.business_hours.next_open(now))
            },
        }
    }

    pub fn status(&self) -> DialerStatus {
        *self.status.lock()
    }

    pub fn start(&self) {
        *self.status.lock() = DialerStatus::Running;
    }

    pub fn pause(&self) {
        *self.status.lock() = DialerStatus::Paused;
    }

    /// Cancels all queued and in-flight calls; in-flight calls are allowed
    /// to finish (their callback fires normally), queued calls are dropped
    /// and their callback fires immediately with `outcome = "cancelled"`.
    pub fn stop_and_drain(&self) {
        *self.status.lock() = DialerStatus::Stopped;
        let mut queue = self.queue.lock();
        while let Some(entry) = queue.pop() {
            (entry.call.callback)(DialOutcome {
                call_id: entry.call.id,
                outcome: "cancelled".to_string(),
                duration_seconds: None,
            });
        }
    }

    pub fn completed_today(&self) -> u64 {
        let mut state = self.completed_today.lock();
        let today = self.clock.now().date_naive();
        if state.0 != today {
            state.0 = today;
            state.1 = 0;
        }
        state.1
    }

    /// Runs one dispatch iteration: if running, rate budget allows, and a
    /// concurrency permit is available, pops the highest-priority queued
    /// call and spawns its origination. Intended to be driven by a loop
    /// (see `run_dispatch_loop`) on a short tick, the same shape as the
    /// teacher's `process_all_queues`.
    pub async fn dispatch_once(self: &Arc<Self>) -> bool {
        if self.status() != DialerStatus::Running {
            return false;
        }
        let now = self.clock.now();
        if !self.business_hours.is_open(now) {
            return false;
        }
        if !self.rate_limiter.try_acquire(now) {
            return false;
        }
        let permit = match self.concurrency.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return false,
        };
        let next = self.queue.lock().pop();
        let entry = match next {
            Some(e) => e,
            None => return false,
        };
        let call = entry.call;
        self.in_flight.insert(call.id, call.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = this.originate_and_wait(&call).await;
            this.in_flight.remove(&call.id);
            {
                let mut state = this.completed_today.lock();
                let today = this.clock.now().date_naive();
                if state.0 != today {
                    state.0 = today;
                    state.1 = 0;
                }
                state.1 += 1;
            }
            (call.callback)(outcome);
        });
        true
    }

    async fn originate_and_wait(&self, call: &QueuedCall) -> DialOutcome {
        let metadata = call.metadata.clone();
        match self.sip.originate_call(&call.phone_number, None, metadata).await {
            Ok(sip_call) => {
                match self.sip.wait_for_answer(sip_call.call_id, self.config.ring_timeout).await {
                    Ok(true) => {
                        info!(call_id = %call.id, "call answered");
                        let outcome = match &self.resolver {
                            Some(resolver) => {
                                resolver.resolve(call.id, call.contact_id, &call.metadata).await
                            }
                            None => "confirmed".to_string(),
                        };
                        DialOutcome {
                            call_id: call.id,
                            outcome,
                            duration_seconds: sip_call.duration_seconds(),
                        }
                    }
                    Ok(false) => DialOutcome {
                        call_id: call.id,
                        outcome: "no_answer".to_string(),
                        duration_seconds: None,
                    },
                    Err(e) => {
                        warn!(call_id = %call.id, error = %e, "originate wait failed");
                        DialOutcome { call_id: call.id, outcome: "failed".to_string(), duration_seconds: None }
                    }
                }
            }
            Err(e) => {
                warn!(call_id = %call.id, error = %e, "originate failed");
                DialOutcome { call_id: call.id, outcome: "failed".to_string(), duration_seconds: None }
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// Drives `dispatch_once` on a fixed tick until `stop_and_drain` sets the
/// dialer to `Stopped`. Spawned once at startup as a background loop.
pub async fn run_dispatch_loop(dialer: Arc<OutboundDialer>, tick: std::time::Duration) {
    let mut interval = tokio::time::interval(tick);
    loop {
        interval.tick().await;
        if dialer.status() == DialerStatus::Stopped {
            break;
        }
        while dialer.dispatch_once().await {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::sip::{CallDirection, SipCall, SipCallState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct FakeSip {
        answer: bool,
    }

    #[async_trait]
    impl SipClient for FakeSip {
        async fn originate_call(
            &self,
            destination: &str,
            _caller_id: Option<&str>,
            _metadata: Value,
        ) -> std::result::Result<SipCall, crate::error::CollaboratorError> {
            Ok(SipCall {
                call_id: Uuid::new_v4(),
                sip_call_id: format!("out-{destination}"),
                direction: CallDirection::Outbound,
                state: SipCallState::Trying,
                caller_id: "agent".to_string(),
                callee_id: destination.to_string(),
                started_at: Utc::now(),
                answered_at: None,
                ended_at: None,
            })
        }

        async fn wait_for_answer(
            &self,
            _call_id: Uuid,
            _timeout: std::time::Duration,
        ) -> std::result::Result<bool, crate::error::CollaboratorError> {
            Ok(self.answer)
        }

        async fn hangup(&self, _call_id: Uuid) -> std::result::Result<(), crate::error::CollaboratorError> {
            Ok(())
        }

        async fn send_dtmf(&self, _call_id: Uuid, _digits: &str) -> std::result::Result<(), crate::error::CollaboratorError> {
            Ok(())
        }

        fn get_call(&self, _call_id: Uuid) -> Option<SipCall> {
            None
        }
    }

    #[tokio::test]
    async fn urgent_call_dispatches_before_normal() {
        let clock: SharedClock = Arc::new(FixedClock::new(Utc::now()));
        let sip = Arc::new(FakeSip { answer: true });
        let dialer = Arc::new(OutboundDialer::new(
            DialerConfig::default(),
            clock,
            sip,
            crate::config::BusinessHoursConfig {
                open_hour: 0,
                close_hour: 23,
                open_days: vec![
                    chrono::Weekday::Mon,
                    chrono::Weekday::Tue,
                    chrono::Weekday::Wed,
                    chrono::Weekday::Thu,
                    chrono::Weekday::Fri,
                    chrono::Weekday::Sat,
                    chrono::Weekday::Sun,
                ],
                ..Default::default()
            },
        ));
        dialer.start();

        let order = Arc::new(Mutex::new(Vec::new()));
        let order1 = order.clone();
        dialer.queue_call(Uuid::new_v4(), "+491".to_string(), CallPriority::Normal, serde_json::json!({}), Arc::new(move |o| order1.lock().push(o.call_id)));
        let order2 = order.clone();
        let urgent_id = dialer.queue_call(Uuid::new_v4(), "+492".to_string(), CallPriority::Urgent, serde_json::json!({}), Arc::new(move |o| order2.lock().push(o.call_id)));

        dialer.dispatch_once().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(order.lock()[0], urgent_id);
    }

    #[test]
    fn rate_limiter_blocks_after_capacity_exhausted() {
        let now = Utc::now();
        let limiter = RateLimiter::new(1, now);
        assert!(limiter.try_acquire(now));
        assert!(!limiter.try_acquire(now));
    }

    #[test]
    fn cancel_is_idempotent_and_removes_from_snapshot() {
        let clock: SharedClock = Arc::new(FixedClock::new(Utc::now()));
        let sip = Arc::new(FakeSip { answer: true });
        let dialer = OutboundDialer::new(
            DialerConfig::default(),
            clock,
            sip,
            crate::config::BusinessHoursConfig::default(),
        );
        let id = dialer.queue_call(
            Uuid::new_v4(),
            "+491".to_string(),
            CallPriority::Normal,
            serde_json::json!({}),
            Arc::new(|_| {}),
        );
        assert_eq!(dialer.snapshot().len(), 1);
        assert!(dialer.cancel_call(id));
        assert!(dialer.snapshot().is_empty());
        assert!(!dialer.cancel_call(id));
    }
}
