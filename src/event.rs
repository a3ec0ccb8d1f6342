//! Event types: the capability set callers implement, the built-in events,
//! and the timestamped wrapper stored by the queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::attribute::{AttributeValue, Attributes};

/// Errors raised while constructing events.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    /// Event names are shown in the analytics backend and must not be blank.
    #[error("event name must not be empty")]
    EmptyName,
}

/// Anything that can be logged as a discrete event.
///
/// For a settings change you might use `name = "settings_changed"` with
/// attributes such as `use_metric_units` and `sound_effects_enabled`.
/// Keep names stable over time; the backend groups by them.
pub trait AnalyticsEvent: Send + Sync {
    /// Name of the event. Must not be empty; the manager drops events
    /// whose name is empty or whitespace.
    fn name(&self) -> &str;

    /// Attributes attached to the event, if any.
    fn attributes(&self) -> Option<&Attributes> {
        None
    }

    /// Called by the manager once the batch holding this event was sent.
    ///
    /// May run on any thread. Use it to finalize work tied to the event
    /// instead of doing that work when the event is constructed.
    fn was_sent(&self) {}
}

/// Source of static device/app metadata merged into launch events.
pub trait AttributeProvider: Send + Sync {
    fn attributes(&self) -> Attributes;
}

/// Fixed attribute set, typically filled once at startup by the host.
#[derive(Debug, Clone, Default)]
pub struct StaticAttributes {
    attributes: Attributes,
}

impl StaticAttributes {
    pub fn new(attributes: Attributes) -> Self {
        Self { attributes }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl AttributeProvider for StaticAttributes {
    fn attributes(&self) -> Attributes {
        self.attributes.clone()
    }
}

type SentHook = Box<dyn Fn() + Send + Sync>;

/// General purpose event with builder-style attributes.
pub struct CustomEvent {
    name: String,
    attributes: Option<Attributes>,
    on_sent: Option<SentHook>,
}

impl CustomEvent {
    /// Create an event with the given name and no attributes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::EmptyName` if the name is empty or whitespace.
    pub fn new(name: impl Into<String>) -> Result<Self, EventError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EventError::EmptyName);
        }

        Ok(Self {
            name,
            attributes: None,
            on_sent: None,
        })
    }

    /// Add a single attribute, replacing any previous value for `key`.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes
            .get_or_insert_with(Attributes::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replace all attributes.
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Register a callback run after the event was delivered.
    pub fn on_sent<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_sent = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for CustomEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomEvent")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .field("has_hook", &self.on_sent.is_some())
            .finish()
    }
}

impl AnalyticsEvent for CustomEvent {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> Option<&Attributes> {
        self.attributes.as_ref()
    }

    fn was_sent(&self) {
        if let Some(hook) = &self.on_sent {
            hook();
        }
    }
}

/// Event logged every time the application launches.
///
/// Carries the provider's device/app attributes plus any extras the caller
/// passes in. Extras win when both define the same key.
#[derive(Debug, Clone)]
pub struct AppLaunchEvent {
    attributes: Attributes,
}

impl AppLaunchEvent {
    pub const NAME: &'static str = "app_launch";

    pub fn new(provider: &dyn AttributeProvider, extra: Attributes) -> Self {
        let mut attributes = provider.attributes();
        attributes.extend(extra);
        Self { attributes }
    }
}

impl AnalyticsEvent for AppLaunchEvent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn attributes(&self) -> Option<&Attributes> {
        Some(&self.attributes)
    }
}

/// An event together with the time it was logged.
///
/// `occurred_at` is captured when `log` is called, not when the event is
/// eventually flushed. `sequence` records arrival order and breaks ties
/// between equal timestamps.
#[derive(Clone)]
pub struct TimestampedEvent {
    event: Arc<dyn AnalyticsEvent>,
    occurred_at: DateTime<Utc>,
    pub(crate) sequence: u64,
}

impl TimestampedEvent {
    pub fn new(event: Arc<dyn AnalyticsEvent>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event,
            occurred_at,
            sequence: 0,
        }
    }

    pub fn event(&self) -> &dyn AnalyticsEvent {
        self.event.as_ref()
    }

    pub fn name(&self) -> &str {
        self.event.name()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Arrival order assigned by the queue on first insertion.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl std::fmt::Debug for TimestampedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampedEvent")
            .field("name", &self.event.name())
            .field("occurred_at", &self.occurred_at)
            .field("sequence", &self.sequence)
            .finish()
    }
}
