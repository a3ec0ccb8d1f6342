//! Analytics manager: the dispatcher between callers and the transport.
//!
//! Every logged event is stamped and queued, then the flush policy is
//! evaluated repeatedly, one batch per iteration, until it says stop. A
//! failed batch goes back into the queue unchanged and ends the current
//! flush loop; it becomes eligible again on the next trigger.
//!
//! An event the transport cannot encode is taken out of its batch and
//! kept aside in a quarantine list; the rest of the batch goes back into
//! the queue and the loop carries on without it.
//!
//! The manager holds no lock of its own around flushing. Concurrent `log`
//! calls and overlapping force flushes are safe because the queue hands
//! each event to exactly one `pop_batch` caller.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ConfigError;
use crate::event::{AnalyticsEvent, TimestampedEvent};
use crate::identity::{FixedUserId, UserIdentity};
use crate::policy::{FlushPolicy, ThresholdPolicy};
use crate::queue::{Batch, EventQueue};
use crate::transport::{Transport, TransportError};

/// Whether a flush loop is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Draining,
}

/// Counters describing manager activity since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Events accepted into the queue
    pub events_logged: u64,

    /// Events dropped because tracking was disabled or the name was empty
    pub events_ignored: u64,

    /// Batches the transport accepted
    pub batches_sent: u64,

    /// Events contained in accepted batches
    pub events_sent: u64,

    /// Failed send attempts
    pub send_failures: u64,

    /// Events put back into the queue after failed sends
    pub events_requeued: u64,

    /// Completion hooks that panicked
    pub hook_panics: u64,

    /// Events moved to quarantine because the transport cannot encode them
    pub events_unencodable: u64,
}

#[derive(Default)]
struct StatsCounters {
    events_logged: AtomicU64,
    events_ignored: AtomicU64,
    batches_sent: AtomicU64,
    events_sent: AtomicU64,
    send_failures: AtomicU64,
    events_requeued: AtomicU64,
    hook_panics: AtomicU64,
    events_unencodable: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ManagerStats {
        ManagerStats {
            events_logged: self.events_logged.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            events_requeued: self.events_requeued.load(Ordering::Relaxed),
            hook_panics: self.hook_panics.load(Ordering::Relaxed),
            events_unencodable: self.events_unencodable.load(Ordering::Relaxed),
        }
    }
}

/// Result of one flush loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches_sent: usize,
    pub events_sent: usize,
    /// Events re-enqueued because the final send of the loop failed.
    pub events_requeued: usize,
    /// Events moved to quarantine during the loop.
    pub events_quarantined: usize,
}

impl FlushReport {
    /// Whether the loop ended on a failed send.
    pub fn failed(&self) -> bool {
        self.events_requeued > 0
    }
}

/// Outcome of a single pop-and-send step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Empty,
    Sent(usize),
    Failed(usize),
    /// One event was quarantined; the rest of the batch is queued again.
    Quarantined,
}

/// Marks the manager as draining for as long as it is alive.
struct DrainGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> DrainGuard<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builder for `AnalyticsManager`.
pub struct ManagerBuilder {
    transport: Arc<dyn Transport>,
    queue: Option<Arc<EventQueue>>,
    policy: Arc<dyn FlushPolicy>,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn UserIdentity>,
}

impl ManagerBuilder {
    /// Share an existing queue instead of creating a new one.
    pub fn queue(mut self, queue: Arc<EventQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn policy(mut self, policy: impl FlushPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn identity(mut self, identity: impl UserIdentity + 'static) -> Self {
        self.identity = Arc::new(identity);
        self
    }

    /// # Errors
    ///
    /// Returns `ConfigError` if the transport reports a zero batch size.
    pub fn build(self) -> Result<AnalyticsManager, ConfigError> {
        let batch_size = self.transport.batch_size();
        if batch_size == 0 {
            return Err(ConfigError {
                message: "transport batch size must be greater than 0".to_string(),
                env_var: None,
            });
        }

        Ok(AnalyticsManager {
            queue: self.queue.unwrap_or_default(),
            transport: self.transport,
            batch_size,
            policy: self.policy,
            clock: self.clock,
            identity: self.identity,
            enabled: AtomicBool::new(true),
            active_flushes: AtomicUsize::new(0),
            stats: StatsCounters::default(),
            quarantine: Mutex::new(Vec::new()),
        })
    }
}

/// Queues events and delivers them in batches through a transport.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use telemetry_batcher::event::CustomEvent;
/// use telemetry_batcher::manager::AnalyticsManager;
/// use telemetry_batcher::transport::NoopTransport;
///
/// #[tokio::main]
/// async fn main() {
///     let manager = AnalyticsManager::builder(Arc::new(NoopTransport::default()))
///         .build()
///         .expect("Failed to build manager");
///
///     let event = CustomEvent::new("screen_view")
///         .expect("non-empty name")
///         .with_attribute("screen", "settings");
///     manager.log(event).await;
///
///     manager.force_flush_all().await;
/// }
/// ```
pub struct AnalyticsManager {
    queue: Arc<EventQueue>,
    transport: Arc<dyn Transport>,
    batch_size: usize,
    policy: Arc<dyn FlushPolicy>,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn UserIdentity>,
    enabled: AtomicBool,
    active_flushes: AtomicUsize,
    stats: StatsCounters,
    quarantine: Mutex<Vec<TimestampedEvent>>,
}

impl AnalyticsManager {
    /// Start building a manager around `transport`.
    ///
    /// Defaults: a fresh queue, `ThresholdPolicy::default()`, the system
    /// clock and a random user id.
    pub fn builder(transport: Arc<dyn Transport>) -> ManagerBuilder {
        ManagerBuilder {
            transport,
            queue: None,
            policy: Arc::new(ThresholdPolicy::default()),
            clock: Arc::new(SystemClock),
            identity: Arc::new(FixedUserId::random()),
        }
    }

    /// Log an event and wait for any flush it triggers.
    ///
    /// The event is queued before this returns. Delivery failures are
    /// logged and retried later; they never reach the caller.
    pub async fn log<E>(&self, event: E)
    where
        E: AnalyticsEvent + 'static,
    {
        self.log_shared(Arc::new(event)).await;
    }

    /// Same as `log` for an event that is already shared.
    pub async fn log_shared(&self, event: Arc<dyn AnalyticsEvent>) {
        if self.enqueue(event) {
            self.flush_when_necessary().await;
        }
    }

    /// Log an event without waiting for the flush it may trigger.
    ///
    /// The event is queued synchronously; the flush runs on the current
    /// tokio runtime. Outside a runtime the event simply stays queued until
    /// the next trigger.
    pub fn log_detached<E>(self: &Arc<Self>, event: E)
    where
        E: AnalyticsEvent + 'static,
    {
        if !self.enqueue(Arc::new(event)) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = Arc::clone(self);
                handle.spawn(async move {
                    manager.flush_when_necessary().await;
                });
            }
            Err(_) => {
                warn!("No tokio runtime available, event stays queued until the next flush");
            }
        }
    }

    /// Run the policy loop without logging a new event.
    ///
    /// Sends one batch per iteration while the policy asks for it. Stops at
    /// the first failed send.
    pub async fn flush_when_necessary(&self) -> FlushReport {
        let _guard = DrainGuard::enter(&self.active_flushes);
        let mut report = FlushReport::default();

        loop {
            let snapshot = self.queue.snapshot(self.clock.now());
            if !self.policy.should_flush(snapshot.count, snapshot.oldest_age) {
                break;
            }

            debug!(
                queued = snapshot.count,
                oldest_age_secs = snapshot.oldest_age.as_secs(),
                "Flush policy triggered"
            );

            if !self.apply(self.send_batch().await, &mut report) {
                break;
            }
        }

        report
    }

    /// Send everything in the queue regardless of policy.
    ///
    /// Intended for lifecycle signals after which the process may stop.
    /// Stops early if a send fails; the failed batch stays queued.
    pub async fn force_flush_all(&self) -> FlushReport {
        let _guard = DrainGuard::enter(&self.active_flushes);
        let mut report = FlushReport::default();

        info!(queued = self.queue.len(), "Force sending all events started");
        while self.apply(self.send_batch().await, &mut report) {}
        info!(
            batches_sent = report.batches_sent,
            events_sent = report.events_sent,
            events_requeued = report.events_requeued,
            "Force sending all events completed"
        );

        report
    }

    /// Turn tracking on or off. While off, new events are ignored; events
    /// already queued are still delivered by later flushes.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled = enabled, "Analytics tracking toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ManagerState {
        if self.active_flushes.load(Ordering::SeqCst) > 0 {
            ManagerState::Draining
        } else {
            ManagerState::Idle
        }
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats.snapshot()
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Events taken out of delivery because the transport cannot encode
    /// them, oldest first. Their completion hooks never run.
    pub fn unencodable_events(&self) -> Vec<TimestampedEvent> {
        self.quarantine.lock().clone()
    }

    /// Stamp and queue an event. Returns false when tracking is disabled.
    fn enqueue(&self, event: Arc<dyn AnalyticsEvent>) -> bool {
        if !self.is_enabled() {
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            debug!(event = event.name(), "Tracking disabled, event ignored");
            return false;
        }

        if event.name().trim().is_empty() {
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            warn!("Event without a name ignored");
            return false;
        }

        info!(
            event = event.name(),
            attributes = ?event.attributes(),
            "Event added to the queue"
        );
        self.queue.add(TimestampedEvent::new(event, self.clock.now()));
        self.stats.events_logged.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Fold a batch outcome into the report. Returns whether to continue.
    fn apply(&self, outcome: BatchOutcome, report: &mut FlushReport) -> bool {
        match outcome {
            BatchOutcome::Empty => false,
            BatchOutcome::Sent(count) => {
                report.batches_sent += 1;
                report.events_sent += count;
                true
            }
            BatchOutcome::Failed(count) => {
                report.events_requeued += count;
                false
            }
            BatchOutcome::Quarantined => {
                report.events_quarantined += 1;
                true
            }
        }
    }

    /// Pop one batch and hand it to the transport.
    async fn send_batch(&self) -> BatchOutcome {
        let batch = self.queue.pop_batch(self.batch_size);
        if batch.is_empty() {
            return BatchOutcome::Empty;
        }

        let count = batch.len();
        let user_id = self.identity.user_id();
        info!(count = count, "Sending events started");

        match self.transport.send(&batch, user_id).await {
            Ok(()) => {
                self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .events_sent
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.notify_sent(&batch);
                info!(count = count, "Sending events completed");
                BatchOutcome::Sent(count)
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                let (unencodable, batch) = match &e {
                    TransportError::Encoding { sequence, .. } => batch.remove_sequence(*sequence),
                    _ => (None, batch),
                };

                let requeued = batch.len();
                if requeued > 0 {
                    error!(
                        error = %e,
                        events = ?batch.names(),
                        "Sending events failed, re-enqueuing them"
                    );
                }
                self.stats
                    .events_requeued
                    .fetch_add(requeued as u64, Ordering::Relaxed);
                self.queue.reenqueue(batch);

                match unencodable {
                    Some(event) => {
                        self.quarantine_event(event, &e);
                        BatchOutcome::Quarantined
                    }
                    None => BatchOutcome::Failed(requeued),
                }
            }
        }
    }

    fn quarantine_event(&self, event: TimestampedEvent, cause: &TransportError) {
        error!(
            event = event.name(),
            sequence = event.sequence(),
            occurred_at = %event.occurred_at(),
            error = %cause,
            "Event cannot be encoded, moved to quarantine"
        );
        self.stats.events_unencodable.fetch_add(1, Ordering::Relaxed);
        self.quarantine.lock().push(event);
    }

    /// Run every completion hook in the batch. A panicking hook is logged
    /// and does not stop the remaining hooks.
    fn notify_sent(&self, batch: &Batch) {
        for event in batch {
            debug!(event = event.name(), "Event was sent");
            let result = catch_unwind(AssertUnwindSafe(|| event.event().was_sent()));
            if result.is_err() {
                self.stats.hook_panics.fetch_add(1, Ordering::Relaxed);
                warn!(event = event.name(), "Completion hook panicked");
            }
        }
    }
}
