//! Force-flush triggers wired to host lifecycle signals.
//!
//! After backgrounding, termination or memory pressure the process may stop
//! running, so every queued event is pushed out. The host decides where the
//! signals come from; this module only turns them into flushes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::manager::{AnalyticsManager, FlushReport};

/// Lifecycle events after which queued events should be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleSignal {
    /// The application moved to the background
    Background,

    /// The application is about to lose focus
    ResignActive,

    /// The process is about to exit
    Terminate,

    /// The host reported low memory
    MemoryPressure,
}

impl std::fmt::Display for LifecycleSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleSignal::Background => write!(f, "background"),
            LifecycleSignal::ResignActive => write!(f, "resign_active"),
            LifecycleSignal::Terminate => write!(f, "terminate"),
            LifecycleSignal::MemoryPressure => write!(f, "memory_pressure"),
        }
    }
}

/// Turns lifecycle signals into `force_flush_all` calls.
///
/// Overlapping signals are fine: each queued event is popped by exactly
/// one of the resulting flushes.
#[derive(Clone)]
pub struct ForceFlushTrigger {
    manager: Arc<AnalyticsManager>,
}

impl ForceFlushTrigger {
    pub fn new(manager: Arc<AnalyticsManager>) -> Self {
        Self { manager }
    }

    /// Start a force flush in the background and return immediately.
    pub fn fire(&self, signal: LifecycleSignal) -> JoinHandle<FlushReport> {
        info!(signal = %signal, "Lifecycle signal received, force flushing");
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move { manager.force_flush_all().await })
    }

    /// Force flush and wait for it to finish.
    pub async fn fire_and_wait(&self, signal: LifecycleSignal) -> FlushReport {
        info!(signal = %signal, "Lifecycle signal received, force flushing");
        self.manager.force_flush_all().await
    }

    pub fn manager(&self) -> &Arc<AnalyticsManager> {
        &self.manager
    }
}

/// Drive force flushes from a channel of lifecycle signals.
///
/// Runs until every sender is dropped, then performs one final flush so
/// nothing queued is left behind.
pub fn spawn_signal_listener(
    trigger: ForceFlushTrigger,
    mut rx: mpsc::Receiver<LifecycleSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            let report = trigger.fire_and_wait(signal).await;
            if report.failed() {
                warn!(
                    signal = %signal,
                    events_requeued = report.events_requeued,
                    "Force flush ended with a failed batch"
                );
            }
        }

        info!("Signal channel closed, performing final flush");
        trigger.manager().force_flush_all().await;
    })
}

/// Re-evaluate the flush policy on a fixed period.
///
/// Without this the staleness trigger only fires when a new event is
/// logged.
pub fn spawn_periodic_check(manager: Arc<AnalyticsManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = manager.flush_when_necessary().await;
            if report.batches_sent > 0 || report.failed() {
                debug!(
                    batches_sent = report.batches_sent,
                    events_sent = report.events_sent,
                    events_requeued = report.events_requeued,
                    "Periodic policy check flushed events"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::CustomEvent;
    use crate::transport::InMemoryTransport;
    use chrono::Utc;
    use tokio::time::timeout;

    fn create_manager(transport: Arc<InMemoryTransport>) -> Arc<AnalyticsManager> {
        Arc::new(AnalyticsManager::builder(transport).build().unwrap())
    }

    async fn log_events(manager: &AnalyticsManager, count: usize) {
        for i in 0..count {
            manager.log(CustomEvent::new(format!("event-{}", i)).unwrap()).await;
        }
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(format!("{}", LifecycleSignal::Background), "background");
        assert_eq!(format!("{}", LifecycleSignal::Terminate), "terminate");
        assert_eq!(format!("{}", LifecycleSignal::MemoryPressure), "memory_pressure");
    }

    #[tokio::test]
    async fn test_fire_and_wait_drains_queue() {
        let transport = Arc::new(InMemoryTransport::new(2));
        let manager = create_manager(transport.clone());
        log_events(&manager, 3).await;

        let trigger = ForceFlushTrigger::new(manager.clone());
        let report = trigger.fire_and_wait(LifecycleSignal::Background).await;

        assert_eq!(report.events_sent, 3);
        assert!(manager.queue().is_empty());
    }

    #[tokio::test]
    async fn test_fire_runs_in_background() {
        let transport = Arc::new(InMemoryTransport::new(5));
        let manager = create_manager(transport.clone());
        log_events(&manager, 4).await;

        let trigger = ForceFlushTrigger::new(manager.clone());
        let report = trigger.fire(LifecycleSignal::Terminate).await.unwrap();

        assert_eq!(report.events_sent, 4);
        assert_eq!(transport.send_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simultaneous_signals_do_not_duplicate() {
        let transport =
            Arc::new(InMemoryTransport::new(2).with_delay(Duration::from_millis(5)));
        let manager = create_manager(transport.clone());
        log_events(&manager, 9).await;

        let trigger = ForceFlushTrigger::new(manager.clone());
        let a = trigger.fire(LifecycleSignal::Background);
        let b = trigger.fire(LifecycleSignal::MemoryPressure);
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a.events_sent + b.events_sent, 9);
        assert_eq!(transport.delivered_event_count(), 9);
    }

    #[tokio::test]
    async fn test_signal_listener_flushes_and_final_flushes_on_close() {
        let transport = Arc::new(InMemoryTransport::new(10));
        let manager = create_manager(transport.clone());
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_signal_listener(ForceFlushTrigger::new(manager.clone()), rx);

        log_events(&manager, 2).await;
        tx.send(LifecycleSignal::Background).await.unwrap();

        for _ in 0..50 {
            if transport.delivered_event_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.delivered_event_count(), 2);

        log_events(&manager, 3).await;
        drop(tx);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener should stop")
            .unwrap();
        assert_eq!(transport.delivered_event_count(), 5);
        assert!(manager.queue().is_empty());
    }

    #[tokio::test]
    async fn test_periodic_check_fires_staleness_trigger() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(InMemoryTransport::new(10));
        let manager = Arc::new(
            AnalyticsManager::builder(transport.clone())
                .clock(clock.clone())
                .build()
                .unwrap(),
        );

        log_events(&manager, 1).await;
        let handle = spawn_periodic_check(manager.clone(), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.send_count(), 0);

        clock.advance_secs(301);
        for _ in 0..50 {
            if transport.delivered_event_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.delivered_event_count(), 1);

        handle.abort();
    }
}
