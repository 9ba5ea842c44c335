use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Market signal for spot instance classes.
///
/// Supplied by an external feed; the orchestrator only reads it.
pub trait SpotSignal: Send + Sync {
    /// Likelihood (0.0..=1.0) that an instance of `class` is interrupted soon.
    fn interruption_rate(&self, class: &str) -> f64;

    /// Whether the market currently has any capacity for `class`.
    fn has_capacity(&self, class: &str) -> bool {
        self.interruption_rate(class) < 1.0
    }

    /// Current spot price as a percentage of the on-demand price.
    fn price_percentage(&self, _class: &str) -> u32 {
        0
    }
}

/// Observation for one instance class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpotObservation {
    pub interruption_rate: f64,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub price_percentage: u32,
}

fn default_available() -> bool {
    true
}

/// Signal backed by a fixed table, loaded from configuration.
///
/// Unknown classes report a neutral 0.5 interruption rate.
#[derive(Debug, Clone, Default)]
pub struct StaticSpotSignal {
    observations: HashMap<String, SpotObservation>,
}

impl StaticSpotSignal {
    pub fn new(observations: HashMap<String, SpotObservation>) -> Self {
        Self { observations }
    }

    pub fn with_rate(mut self, class: impl Into<String>, interruption_rate: f64) -> Self {
        self.observations.insert(
            class.into(),
            SpotObservation {
                interruption_rate,
                available: true,
                price_percentage: 0,
            },
        );
        self
    }

    pub fn unavailable(mut self, class: impl Into<String>) -> Self {
        self.observations.insert(
            class.into(),
            SpotObservation {
                interruption_rate: 1.0,
                available: false,
                price_percentage: 0,
            },
        );
        self
    }
}

impl SpotSignal for StaticSpotSignal {
    fn interruption_rate(&self, class: &str) -> f64 {
        self.observations
            .get(class)
            .map(|o| o.interruption_rate)
            .unwrap_or(0.5)
    }

    fn has_capacity(&self, class: &str) -> bool {
        self.observations
            .get(class)
            .map(|o| o.available && o.interruption_rate < 1.0)
            .unwrap_or(true)
    }

    fn price_percentage(&self, class: &str) -> u32 {
        self.observations
            .get(class)
            .map(|o| o.price_percentage)
            .unwrap_or(0)
    }
}
