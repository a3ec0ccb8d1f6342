//! Simulated application events for the demo binary.
//!
//! Produces a plausible mix of user interactions (mostly screen views and
//! taps, occasionally purchases and errors) with typed attributes.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::event::{CustomEvent, EventError};

/// Kinds of simulated user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    ScreenView,
    ButtonTap,
    Search,
    Purchase,
    ErrorShown,
}

impl InteractionKind {
    /// All kinds with their relative frequency.
    pub fn weighted() -> &'static [(InteractionKind, u32)] {
        &[
            (InteractionKind::ScreenView, 45),
            (InteractionKind::ButtonTap, 35),
            (InteractionKind::Search, 12),
            (InteractionKind::Purchase, 5),
            (InteractionKind::ErrorShown, 3),
        ]
    }

    /// Event name reported to the backend.
    pub fn event_name(&self) -> &'static str {
        match self {
            InteractionKind::ScreenView => "screen_view",
            InteractionKind::ButtonTap => "button_tap",
            InteractionKind::Search => "search",
            InteractionKind::Purchase => "purchase",
            InteractionKind::ErrorShown => "error_shown",
        }
    }
}

const SCREENS: &[&str] = &["home", "settings", "profile", "checkout", "search"];
const BUTTONS: &[&str] = &["save", "cancel", "share", "like", "back"];
const ERRORS: &[&str] = &["network_unavailable", "invalid_input", "session_expired"];

/// Configuration for the event generator.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Whether to attach attributes to generated events
    pub include_attributes: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            include_attributes: true,
        }
    }
}

/// Generates random application events.
#[derive(Debug, Clone, Default)]
pub struct EventGenerator {
    config: GeneratorConfig,
}

impl EventGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Generate a single random event.
    pub fn generate(&self) -> Result<CustomEvent, EventError> {
        let mut rng = rand::thread_rng();
        let kind = InteractionKind::weighted()
            .choose_weighted(&mut rng, |(_, weight)| *weight)
            .map(|(kind, _)| *kind)
            .unwrap_or(InteractionKind::ScreenView);

        let event = CustomEvent::new(kind.event_name())?;
        if !self.config.include_attributes {
            return Ok(event);
        }

        Ok(self.with_attributes(&mut rng, kind, event))
    }

    /// Generate `count` random events.
    pub fn generate_batch(&self, count: usize) -> Result<Vec<CustomEvent>, EventError> {
        (0..count).map(|_| self.generate()).collect()
    }

    fn with_attributes(&self, rng: &mut impl Rng, kind: InteractionKind, event: CustomEvent) -> CustomEvent {
        let pick = |rng: &mut dyn rand::RngCore, options: &[&str]| -> String {
            options.choose(rng).copied().unwrap_or("unknown").to_string()
        };

        match kind {
            InteractionKind::ScreenView => event
                .with_attribute("screen", pick(rng, SCREENS))
                .with_attribute("load_ms", rng.gen_range(40_i64..1_200)),
            InteractionKind::ButtonTap => event
                .with_attribute("button", pick(rng, BUTTONS))
                .with_attribute("screen", pick(rng, SCREENS)),
            InteractionKind::Search => event
                .with_attribute("query_length", rng.gen_range(1_i64..40))
                .with_attribute("results", rng.gen_range(0_i64..200)),
            InteractionKind::Purchase => event
                .with_attribute("amount", (rng.gen_range(0.99..199.99_f64) * 100.0).round() / 100.0)
                .with_attribute("currency", "USD")
                .with_attribute("first_purchase", rng.gen_bool(0.2)),
            InteractionKind::ErrorShown => event
                .with_attribute("error", pick(rng, ERRORS))
                .with_attribute("recoverable", rng.gen_bool(0.7)),
        }
    }
}
