//! Coordinator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::ClassifierConfig;
use crate::renewal::{DEFAULT_MIN_DELAY, DEFAULT_SAFETY_MARGIN};

/// Default timeout for one renewal exchange (refresh + identity fetch).
pub const DEFAULT_RENEWAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Default cap on requests waiting for a renewal.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 256;

/// Default window after a successful renewal during which late expiries are
/// replayed without another exchange.
pub const DEFAULT_RENEWAL_COOLDOWN: Duration = Duration::from_secs(2);

/// Validity assumed when the backend does not report an expiry.
pub const DEFAULT_ASSUMED_VALIDITY: Duration = Duration::from_secs(15 * 60);

/// Tuning for the session coordinator.
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    #[serde(rename = "safety_margin_ms", with = "duration_ms")]
    pub safety_margin: Duration,
    #[serde(rename = "min_delay_ms", with = "duration_ms")]
    pub min_delay: Duration,
    #[serde(rename = "renewal_timeout_ms", with = "duration_ms")]
    pub renewal_timeout: Duration,
    #[serde(rename = "renewal_cooldown_ms", with = "duration_ms")]
    pub renewal_cooldown: Duration,
    #[serde(rename = "assumed_validity_ms", with = "duration_ms")]
    pub assumed_validity: Duration,
    pub max_queue_depth: usize,
    pub classifier: ClassifierConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            min_delay: DEFAULT_MIN_DELAY,
            renewal_timeout: DEFAULT_RENEWAL_TIMEOUT,
            renewal_cooldown: DEFAULT_RENEWAL_COOLDOWN,
            assumed_validity: DEFAULT_ASSUMED_VALIDITY,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            classifier: ClassifierConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn with_renewal_timeout(mut self, timeout: Duration) -> Self {
        self.renewal_timeout = timeout;
        self
    }

    pub fn with_renewal_cooldown(mut self, cooldown: Duration) -> Self {
        self.renewal_cooldown = cooldown;
        self
    }

    pub fn with_assumed_validity(mut self, validity: Duration) -> Self {
        self.assumed_validity = validity;
        self
    }

    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: CoordinatorConfig = serde_json::from_str(
            r#"{"safety_margin_ms": 5000, "max_queue_depth": 8, "classifier": {"require_explicit_signal": true}}"#,
        )
        .unwrap();

        assert_eq!(config.safety_margin, Duration::from_secs(5));
        assert_eq!(config.min_delay, DEFAULT_MIN_DELAY);
        assert_eq!(config.max_queue_depth, 8);
        assert!(config.classifier.require_explicit_signal);
        assert_eq!(config.classifier.expiry_status, 401);
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let value = serde_json::to_value(CoordinatorConfig::default()).unwrap();
        assert_eq!(value["safety_margin_ms"], 30_000);
        assert_eq!(value["renewal_timeout_ms"], 15_000);
    }
}
