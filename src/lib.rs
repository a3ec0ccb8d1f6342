//! Telemetry Batcher Library
//!
//! Client-side batching for analytics events. Applications log named events
//! with typed attributes; the manager queues them, decides when a batch is
//! ready and hands it to a pluggable transport. Failed batches go back into
//! the queue and are retried on the next trigger.
//!
//! - **attribute**: closed set of attribute value types
//! - **event**: the event capability set and built-in events
//! - **queue**: thread-safe event queue with pop-oldest and re-enqueue
//! - **policy**: count and staleness flush triggers
//! - **transport**: delivery abstraction plus no-op and in-memory transports
//! - **http**: JSON-over-HTTP transport with retry and backoff
//! - **manager**: the dispatcher tying queue, policy and transport together
//! - **trigger**: lifecycle signals that force a full flush
//! - **config**: environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use telemetry_batcher::config::Config;
//! use telemetry_batcher::event::CustomEvent;
//! use telemetry_batcher::http::HttpTransport;
//! use telemetry_batcher::manager::AnalyticsManager;
//! use telemetry_batcher::trigger::{ForceFlushTrigger, LifecycleSignal};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let transport = HttpTransport::new(&config).expect("Failed to create transport");
//!
//!     let manager = Arc::new(
//!         AnalyticsManager::builder(Arc::new(transport))
//!             .policy(config.flush_policy().expect("Invalid flush policy"))
//!             .build()
//!             .expect("Failed to build manager"),
//!     );
//!
//!     let event = CustomEvent::new("settings_changed")
//!         .expect("non-empty name")
//!         .with_attribute("use_metric_units", true);
//!     manager.log(event).await;
//!
//!     // Wire this to the host's backgrounding / termination notifications.
//!     let trigger = ForceFlushTrigger::new(manager.clone());
//!     trigger.fire_and_wait(LifecycleSignal::Terminate).await;
//! }
//! ```

// Module declarations
pub mod attribute;
pub mod clock;
pub mod config;
pub mod event;
pub mod event_generator;
pub mod http;
pub mod identity;
pub mod manager;
pub mod policy;
pub mod queue;
pub mod transport;
pub mod trigger;

// Re-export commonly used types at crate root for convenience
pub use attribute::{AttributeValue, Attributes};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError};
pub use event::{
    AnalyticsEvent, AppLaunchEvent, AttributeProvider, CustomEvent, EventError, StaticAttributes,
    TimestampedEvent,
};
pub use http::{HttpError, HttpTransport, RetryBackoff};
pub use identity::{FixedUserId, UserIdentity};
pub use manager::{AnalyticsManager, FlushReport, ManagerBuilder, ManagerState, ManagerStats};
pub use policy::{FlushPolicy, ThresholdPolicy};
pub use queue::{Batch, EventQueue, QueueSnapshot};
pub use transport::{InMemoryTransport, NoopTransport, Transport, TransportError};
pub use trigger::{ForceFlushTrigger, LifecycleSignal};
