//! Puller configuration.
//!
//! Configuration is built in code with [`SubscriptionConfig::builder`], loaded
//! from JSON with [`PullerConfig::from_json_str`], or read from the environment
//! with [`PullerConfig::from_env`]. Every path runs the same validation.
//!
//! # JSON Format
//!
//! ```json
//! {
//!   "shutdown_grace_secs": 30,
//!   "subscriptions": [
//!     {
//!       "topic": "orders",
//!       "subscription": "billing",
//!       "max_in_flight": 16,
//!       "retry_schedule_secs": [10, 60, 600],
//!       "receive_error_backoff_ms": 1000
//!     }
//!   ]
//! }
//! ```

use crate::error::RuntimeError;
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::time::Duration;

/// Default number of concurrently dispatched events per subscription.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1;

/// Default pause after a failed receive call.
pub const DEFAULT_RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Default time to wait for pullers to drain on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Environment variable holding a full JSON configuration.
pub const ENV_CONFIG: &str = "EVENT_PULLER_CONFIG";
/// Environment variable naming the topic of a single subscription.
pub const ENV_TOPIC: &str = "EVENT_PULLER_TOPIC";
/// Environment variable naming a single subscription.
pub const ENV_SUBSCRIPTION: &str = "EVENT_PULLER_SUBSCRIPTION";
/// Environment variable overriding `max_in_flight` of a single subscription.
pub const ENV_MAX_IN_FLIGHT: &str = "EVENT_PULLER_MAX_IN_FLIGHT";
/// Environment variable holding opaque broker credentials.
pub const ENV_CREDENTIALS: &str = "EVENT_PULLER_CREDENTIALS";

/// One subscription to pull from.
///
/// Immutable once built; construct with [`SubscriptionConfig::builder`].
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SubscriptionFile")]
pub struct SubscriptionConfig {
    topic: String,
    subscription: String,
    max_in_flight: usize,
    retry_policy: RetryPolicy,
    receive_error_backoff: Duration,
    credentials: Option<String>,
}

impl SubscriptionConfig {
    /// Start building a subscription descriptor.
    #[must_use]
    pub fn builder(
        topic: impl Into<String>,
        subscription: impl Into<String>,
    ) -> SubscriptionConfigBuilder {
        SubscriptionConfigBuilder {
            topic: topic.into(),
            subscription: subscription.into(),
            max_in_flight: None,
            retry_schedule: None,
            receive_error_backoff: None,
            credentials: None,
        }
    }

    /// Topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subscription name.
    #[must_use]
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Maximum number of concurrently dispatched events.
    #[must_use]
    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Release delay policy for transient failures.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Pause after a failed receive call.
    #[must_use]
    pub const fn receive_error_backoff(&self) -> Duration {
        self.receive_error_backoff
    }

    /// Opaque broker credentials, passed through to the broker client.
    #[must_use]
    pub fn credentials(&self) -> Option<&str> {
        self.credentials.as_deref()
    }

    /// `topic/subscription`, for logs.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.topic, self.subscription)
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field("max_in_flight", &self.max_in_flight)
            .field("retry_policy", &self.retry_policy)
            .field("receive_error_backoff", &self.receive_error_backoff)
            .field(
                "credentials",
                &self.credentials.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Builder for [`SubscriptionConfig`].
#[derive(Clone)]
pub struct SubscriptionConfigBuilder {
    topic: String,
    subscription: String,
    max_in_flight: Option<usize>,
    retry_schedule: Option<Vec<Duration>>,
    receive_error_backoff: Option<Duration>,
    credentials: Option<String>,
}

impl SubscriptionConfigBuilder {
    /// Set the maximum number of concurrently dispatched events.
    #[must_use]
    pub const fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight);
        self
    }

    /// Use an explicit release delay schedule instead of exponential backoff.
    #[must_use]
    pub fn retry_schedule(mut self, schedule: impl IntoIterator<Item = Duration>) -> Self {
        self.retry_schedule = Some(schedule.into_iter().collect());
        self
    }

    /// Set the pause after a failed receive call.
    #[must_use]
    pub const fn receive_error_backoff(mut self, backoff: Duration) -> Self {
        self.receive_error_backoff = Some(backoff);
        self
    }

    /// Set opaque broker credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    /// Build the [`SubscriptionConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if the topic or subscription is empty,
    /// `max_in_flight` is zero, or the retry schedule is empty.
    pub fn build(self) -> Result<SubscriptionConfig, RuntimeError> {
        if self.topic.trim().is_empty() {
            return Err(RuntimeError::Config("topic must not be empty".to_string()));
        }
        if self.subscription.trim().is_empty() {
            return Err(RuntimeError::Config(format!(
                "subscription on topic '{}' must not be empty",
                self.topic
            )));
        }

        let max_in_flight = self.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT);
        if max_in_flight == 0 {
            return Err(RuntimeError::Config(format!(
                "max_in_flight for {}/{} must be at least 1",
                self.topic, self.subscription
            )));
        }

        let retry_policy = match self.retry_schedule {
            Some(schedule) => RetryPolicy::scheduled(schedule)?,
            None => RetryPolicy::exponential(),
        };

        Ok(SubscriptionConfig {
            topic: self.topic,
            subscription: self.subscription,
            max_in_flight,
            retry_policy,
            receive_error_backoff: self
                .receive_error_backoff
                .unwrap_or(DEFAULT_RECEIVE_ERROR_BACKOFF),
            credentials: self.credentials,
        })
    }
}

impl fmt::Debug for SubscriptionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfigBuilder")
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

/// Serialized form of [`SubscriptionConfig`].
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SubscriptionFile {
    topic: String,
    subscription: String,
    #[serde(default)]
    max_in_flight: Option<usize>,
    #[serde(default)]
    retry_schedule_secs: Option<Vec<u64>>,
    #[serde(default)]
    receive_error_backoff_ms: Option<u64>,
    #[serde(default)]
    credentials: Option<String>,
}

impl TryFrom<SubscriptionFile> for SubscriptionConfig {
    type Error = RuntimeError;

    fn try_from(file: SubscriptionFile) -> Result<Self, Self::Error> {
        let mut builder = Self::builder(file.topic, file.subscription);
        if let Some(max_in_flight) = file.max_in_flight {
            builder = builder.max_in_flight(max_in_flight);
        }
        if let Some(schedule) = file.retry_schedule_secs {
            builder = builder.retry_schedule(schedule.into_iter().map(Duration::from_secs));
        }
        if let Some(backoff_ms) = file.receive_error_backoff_ms {
            builder = builder.receive_error_backoff(Duration::from_millis(backoff_ms));
        }
        if let Some(credentials) = file.credentials {
            builder = builder.credentials(credentials);
        }
        builder.build()
    }
}

/// Configuration of a whole puller service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "PullerFile")]
pub struct PullerConfig {
    /// Subscriptions to pull from, one puller each.
    pub subscriptions: Vec<SubscriptionConfig>,
    /// How long shutdown waits for pullers to drain before aborting settlement.
    pub shutdown_grace: Duration,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PullerFile {
    subscriptions: Vec<SubscriptionConfig>,
    #[serde(default)]
    shutdown_grace_secs: Option<u64>,
}

impl TryFrom<PullerFile> for PullerConfig {
    type Error = RuntimeError;

    fn try_from(file: PullerFile) -> Result<Self, Self::Error> {
        let config = Self {
            subscriptions: file.subscriptions,
            shutdown_grace: file
                .shutdown_grace_secs
                .map_or(DEFAULT_SHUTDOWN_GRACE, Duration::from_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

impl PullerConfig {
    /// Configuration with the default shutdown grace period.
    #[must_use]
    pub fn new(subscriptions: Vec<SubscriptionConfig>) -> Self {
        Self {
            subscriptions,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Override the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Check cross-subscription constraints.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if no subscription is configured or the
    /// same topic/subscription pair appears twice.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.subscriptions.is_empty() {
            return Err(RuntimeError::Config(
                "at least one subscription must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for subscription in &self.subscriptions {
            if !seen.insert((subscription.topic(), subscription.subscription())) {
                return Err(RuntimeError::Config(format!(
                    "subscription {} is configured twice",
                    subscription.name()
                )));
            }
        }
        Ok(())
    }

    /// Parse a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if the document is malformed or fails
    /// validation.
    pub fn from_json_str(json: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(json).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    /// Load configuration from environment variables.
    ///
    /// Either:
    /// - `EVENT_PULLER_CONFIG`: a full JSON document (see module docs)
    ///
    /// or a single subscription:
    /// - `EVENT_PULLER_TOPIC` (required)
    /// - `EVENT_PULLER_SUBSCRIPTION` (required)
    /// - `EVENT_PULLER_MAX_IN_FLIGHT` (default: 1)
    /// - `EVENT_PULLER_CREDENTIALS` (optional)
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if a required variable is missing or
    /// a value is invalid.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) against an arbitrary variable source.
    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RuntimeError> {
        if let Some(json) = lookup(ENV_CONFIG) {
            return Self::from_json_str(&json);
        }

        let topic = lookup(ENV_TOPIC)
            .ok_or_else(|| RuntimeError::Config(format!("{ENV_TOPIC} is not set")))?;
        let subscription = lookup(ENV_SUBSCRIPTION)
            .ok_or_else(|| RuntimeError::Config(format!("{ENV_SUBSCRIPTION} is not set")))?;

        let mut builder = SubscriptionConfig::builder(topic, subscription);
        if let Some(raw) = lookup(ENV_MAX_IN_FLIGHT) {
            let max_in_flight = raw.trim().parse::<usize>().map_err(|e| {
                RuntimeError::Config(format!("{ENV_MAX_IN_FLIGHT}='{raw}' is invalid: {e}"))
            })?;
            builder = builder.max_in_flight(max_in_flight);
        }
        if let Some(credentials) = lookup(ENV_CREDENTIALS) {
            builder = builder.credentials(credentials);
        }

        let config = Self::new(vec![builder.build()?]);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn builder_applies_defaults() {
        let config = SubscriptionConfig::builder("orders", "billing").build().unwrap();
        assert_eq!(config.max_in_flight(), 1);
        assert_eq!(config.retry_policy(), &RetryPolicy::exponential());
        assert_eq!(config.receive_error_backoff(), Duration::from_secs(1));
        assert_eq!(config.credentials(), None);
        assert_eq!(config.name(), "orders/billing");
    }

    #[test]
    fn builder_validates() {
        assert!(SubscriptionConfig::builder("", "billing").build().is_err());
        assert!(SubscriptionConfig::builder("orders", " ").build().is_err());
        assert!(SubscriptionConfig::builder("orders", "billing")
            .max_in_flight(0)
            .build()
            .is_err());
        assert!(SubscriptionConfig::builder("orders", "billing")
            .retry_schedule(Vec::new())
            .build()
            .is_err());
    }

    #[test]
    fn debug_redacts_credentials() {
        let config = SubscriptionConfig::builder("orders", "billing")
            .credentials("sas-key-123")
            .build()
            .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sas-key-123"));
        assert!(debug.contains("<redacted>"));
        assert_eq!(config.credentials(), Some("sas-key-123"));
    }

    #[test]
    fn parses_json_document() {
        let config = PullerConfig::from_json_str(
            r#"{
                "shutdown_grace_secs": 5,
                "subscriptions": [
                    {
                        "topic": "orders",
                        "subscription": "billing",
                        "max_in_flight": 16,
                        "retry_schedule_secs": [10, 60]
                    },
                    { "topic": "orders", "subscription": "audit" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.subscriptions.len(), 2);
        let billing = &config.subscriptions[0];
        assert_eq!(billing.max_in_flight(), 16);
        assert_eq!(
            billing.retry_policy().schedule(),
            Some(&[Duration::from_secs(10), Duration::from_secs(60)][..])
        );
        assert_eq!(config.subscriptions[1].max_in_flight(), 1);
    }

    #[test]
    fn json_validation_errors_are_config_errors() {
        let zero = r#"{"subscriptions":[{"topic":"t","subscription":"s","max_in_flight":0}]}"#;
        assert!(matches!(
            PullerConfig::from_json_str(zero),
            Err(RuntimeError::Config(message)) if message.contains("max_in_flight")
        ));

        let empty = r#"{"subscriptions":[]}"#;
        assert!(PullerConfig::from_json_str(empty).is_err());

        let duplicate = r#"{"subscriptions":[
            {"topic":"t","subscription":"s"},
            {"topic":"t","subscription":"s"}
        ]}"#;
        assert!(PullerConfig::from_json_str(duplicate).is_err());

        let unknown = r#"{"subscriptions":[{"topic":"t","subscription":"s","maxInFlight":2}]}"#;
        assert!(PullerConfig::from_json_str(unknown).is_err());
    }

    #[test]
    fn env_single_subscription() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_TOPIC, "orders"),
            (ENV_SUBSCRIPTION, "billing"),
            (ENV_MAX_IN_FLIGHT, "8"),
        ]);
        let config =
            PullerConfig::from_lookup(|key| vars.get(key).map(ToString::to_string)).unwrap();

        assert_eq!(config.subscriptions.len(), 1);
        assert_eq!(config.subscriptions[0].max_in_flight(), 8);
        assert_eq!(config.shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
    }

    #[test]
    fn env_json_document_wins() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (
                ENV_CONFIG,
                r#"{"subscriptions":[{"topic":"a","subscription":"b"}]}"#,
            ),
            (ENV_TOPIC, "ignored"),
        ]);
        let config =
            PullerConfig::from_lookup(|key| vars.get(key).map(ToString::to_string)).unwrap();
        assert_eq!(config.subscriptions[0].topic(), "a");
    }

    #[test]
    fn env_missing_or_invalid_values() {
        let none = PullerConfig::from_lookup(|_| None);
        assert!(matches!(none, Err(RuntimeError::Config(m)) if m.contains(ENV_TOPIC)));

        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_TOPIC, "orders"),
            (ENV_SUBSCRIPTION, "billing"),
            (ENV_MAX_IN_FLIGHT, "many"),
        ]);
        let invalid = PullerConfig::from_lookup(|key| vars.get(key).map(ToString::to_string));
        assert!(matches!(invalid, Err(RuntimeError::Config(m)) if m.contains(ENV_MAX_IN_FLIGHT)));
    }
}
