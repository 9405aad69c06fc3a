use std::{collections::BTreeSet, time::Duration};

use serde::{Deserialize, Serialize};

/// Errors detected while building or validating controller configurations.
#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    /// A required field is missing or empty.
    #[error("controller configuration is missing required field {0}")]
    MissingField(&'static str),
    /// The finalizer is not a qualified name like `example.com/finalizer`.
    #[error("invalid finalizer name {0:?}, expected <domain>/<name>")]
    InvalidFinalizer(String),
    #[error("invalid retry configuration: {0}")]
    InvalidRetry(String),
    #[error("invalid watch backoff configuration: {0}")]
    InvalidBackoff(String),
    #[error("maxConcurrentReconciles must be greater than zero")]
    InvalidConcurrency,
    /// Two configurations were registered for the same controller name.
    #[error("duplicate configuration for controller {0}")]
    Duplicate(String),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_reconciles() -> usize {
    5
}

/// Declarative configuration of one controller, supplied at registration and
/// immutable for the lifetime of the controller's pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfiguration {
    /// The controller name, used to look up the configuration of a reconciler.
    pub name: String,
    /// The CRD name (`<plural>.<group>`), derived from the resource type if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crd_name: Option<String>,
    /// The finalizer name, defaults to `<crdName>/finalizer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer_name: Option<String>,
    /// Skip reconciliation of updates which did not change `.metadata.generation`.
    #[serde(default = "default_true")]
    pub generation_aware: bool,
    /// Namespaces to watch, empty (or containing `*`) watches all namespaces.
    #[serde(default)]
    pub namespaces: BTreeSet<String>,
    /// Retry policy for failed reconciliations, no automatic retry if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfiguration>,
    #[serde(default)]
    pub watch_backoff: WatchBackoffConfiguration,
    /// Upper bound of concurrently running reconciliations of this controller.
    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,
}

impl ControllerConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            crd_name: None,
            finalizer_name: None,
            generation_aware: true,
            namespaces: Default::default(),
            retry: None,
            watch_backoff: Default::default(),
            max_concurrent_reconciles: default_max_concurrent_reconciles(),
        }
    }

    #[must_use]
    pub fn with_crd_name(mut self, crd_name: impl Into<String>) -> Self {
        self.crd_name = Some(crd_name.into());
        self
    }

    #[must_use]
    pub fn with_finalizer_name(mut self, finalizer_name: impl Into<String>) -> Self {
        self.finalizer_name = Some(finalizer_name.into());
        self
    }

    #[must_use]
    pub fn with_generation_aware(mut self, generation_aware: bool) -> Self {
        self.generation_aware = generation_aware;
        self
    }

    #[must_use]
    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfiguration) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_watch_backoff(mut self, watch_backoff: WatchBackoffConfiguration) -> Self {
        self.watch_backoff = watch_backoff;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_reconciles(mut self, max: usize) -> Self {
        self.max_concurrent_reconciles = max;
        self
    }

    /// The effective finalizer name.
    pub fn finalizer(&self) -> String {
        match &self.finalizer_name {
            Some(finalizer) => finalizer.clone(),
            None => default_finalizer_name(self.crd_name.as_deref().unwrap_or(&self.name)),
        }
    }

    /// `true` if the namespace set is empty or contains the wildcards `*` or `""`.
    pub fn watch_all_namespaces(&self) -> bool {
        self.namespaces.is_empty() || self.namespaces.contains("*") || self.namespaces.contains("")
    }

    /// The explicit set of target namespaces, `None` if all namespaces are watched.
    pub fn target_namespaces(&self) -> Option<&BTreeSet<String>> {
        if self.watch_all_namespaces() {
            None
        } else {
            Some(&self.namespaces)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::MissingField("name"));
        }
        if let Some(crd_name) = &self.crd_name {
            if crd_name.trim().is_empty() {
                return Err(ConfigurationError::MissingField("crdName"));
            }
        }
        let finalizer = self.finalizer();
        if !is_qualified_name(finalizer.as_str()) {
            return Err(ConfigurationError::InvalidFinalizer(finalizer));
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        self.watch_backoff.validate()?;
        if self.max_concurrent_reconciles == 0 {
            return Err(ConfigurationError::InvalidConcurrency);
        }
        Ok(())
    }
}

pub fn default_finalizer_name(crd_name: &str) -> String {
    format!("{}/finalizer", crd_name)
}

fn is_qualified_name(value: &str) -> bool {
    fn is_valid_part(part: &str) -> bool {
        !part.is_empty()
            && part.len() <= 253
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    }
    match value.split_once('/') {
        Some((prefix, name)) => is_valid_part(prefix) && is_valid_part(name),
        None => false,
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_interval_ms() -> u64 {
    2000
}

fn default_interval_multiplier() -> f64 {
    1.5
}

/// Retry policy configuration, a multiplier of `1.0` yields fixed-interval retries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfiguration {
    /// Total number of reconcile attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_interval_multiplier")]
    pub interval_multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_ms: Option<u64>,
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            interval_multiplier: default_interval_multiplier(),
            max_interval_ms: None,
        }
    }
}

impl RetryConfiguration {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval_ms: interval.as_millis() as u64,
            interval_multiplier: 1.0,
            max_interval_ms: None,
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Option<Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            max_attempts,
            initial_interval_ms: initial_interval.as_millis() as u64,
            interval_multiplier: multiplier,
            max_interval_ms: max_interval.map(|v| v.as_millis() as u64),
        }
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::InvalidRetry(
                "maxAttempts must be at least 1".to_string(),
            ));
        }
        if self.initial_interval_ms == 0 {
            return Err(ConfigurationError::InvalidRetry(
                "initialIntervalMs must be greater than zero".to_string(),
            ));
        }
        if !(self.interval_multiplier >= 1.0) {
            return Err(ConfigurationError::InvalidRetry(format!(
                "intervalMultiplier must be at least 1.0, got {}",
                self.interval_multiplier
            )));
        }
        match self.max_interval_ms {
            Some(max) if max < self.initial_interval_ms => {
                Err(ConfigurationError::InvalidRetry(format!(
                    "maxIntervalMs {} is smaller than initialIntervalMs {}",
                    max, self.initial_interval_ms
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Reconnect backoff of watch subscriptions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchBackoffConfiguration {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    /// A subscription which stayed connected at least this long resets the backoff.
    pub reset_after_ms: u64,
}

impl Default for WatchBackoffConfiguration {
    fn default() -> Self {
        Self {
            initial_interval_ms: 800,
            multiplier: 2.0,
            max_interval_ms: 30_000,
            reset_after_ms: 120_000,
        }
    }
}

impl WatchBackoffConfiguration {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.initial_interval_ms == 0 {
            return Err(ConfigurationError::InvalidBackoff(
                "initialIntervalMs must be greater than zero".to_string(),
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(ConfigurationError::InvalidBackoff(format!(
                "multiplier must be at least 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(ConfigurationError::InvalidBackoff(format!(
                "maxIntervalMs {} is smaller than initialIntervalMs {}",
                self.max_interval_ms, self.initial_interval_ms
            )));
        }
        Ok(())
    }
}

/// Top-level layout of a configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct OperatorConfiguration {
    #[serde(default)]
    pub controllers: Vec<ControllerConfiguration>,
}

impl OperatorConfiguration {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        let configuration: OperatorConfiguration = serde_yaml::from_str(yaml)?;
        for controller in &configuration.controllers {
            controller.validate()?;
        }
        Ok(configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c: ControllerConfiguration = serde_json::from_str(r#"{"name":"echo"}"#).unwrap();
        assert_eq!(ControllerConfiguration::new("echo"), c);
        assert!(c.generation_aware);
        assert!(c.watch_all_namespaces());
        assert!(c.retry.is_none());
        assert_eq!(5, c.max_concurrent_reconciles);
        assert_eq!("echo/finalizer", c.finalizer());
    }

    #[test]
    fn finalizer() {
        let c = ControllerConfiguration::new("echo").with_crd_name("echos.echo.rustrial.org");
        assert_eq!("echos.echo.rustrial.org/finalizer", c.finalizer());
        let c = c.with_finalizer_name("echo.rustrial.org/cleanup");
        assert_eq!("echo.rustrial.org/cleanup", c.finalizer());
        assert!(c.validate().is_ok());
        let c = c.with_finalizer_name("no-slash");
        assert!(matches!(
            c.validate(),
            Err(ConfigurationError::InvalidFinalizer(_))
        ));
    }

    #[test]
    fn namespaces() {
        let c = ControllerConfiguration::new("echo").with_namespaces(["ns1", "ns2"]);
        assert!(!c.watch_all_namespaces());
        assert_eq!(2, c.target_namespaces().unwrap().len());
        let c = c.with_namespaces(["ns1", "*"]);
        assert!(c.watch_all_namespaces());
        assert!(c.target_namespaces().is_none());
    }

    #[test]
    fn validation() {
        assert!(matches!(
            ControllerConfiguration::new(" ").validate(),
            Err(ConfigurationError::MissingField("name"))
        ));
        assert!(matches!(
            ControllerConfiguration::new("echo")
                .with_retry(RetryConfiguration::fixed(Duration::from_secs(1), 0))
                .validate(),
            Err(ConfigurationError::InvalidRetry(_))
        ));
        assert!(matches!(
            ControllerConfiguration::new("echo")
                .with_retry(RetryConfiguration::exponential(
                    Duration::from_secs(1),
                    0.5,
                    None,
                    3
                ))
                .validate(),
            Err(ConfigurationError::InvalidRetry(_))
        ));
        assert!(matches!(
            ControllerConfiguration::new("echo")
                .with_max_concurrent_reconciles(0)
                .validate(),
            Err(ConfigurationError::InvalidConcurrency)
        ));
        let backoff = WatchBackoffConfiguration {
            max_interval_ms: 10,
            ..Default::default()
        };
        assert!(matches!(
            ControllerConfiguration::new("echo")
                .with_watch_backoff(backoff)
                .validate(),
            Err(ConfigurationError::InvalidBackoff(_))
        ));
    }

    #[test]
    fn from_yaml() {
        let yaml = r#"
controllers:
  - name: echo
    crdName: echos.echo.rustrial.org
    generationAware: false
    namespaces: [ns1, ns2]
    retry:
      maxAttempts: 3
      initialIntervalMs: 100
      intervalMultiplier: 1.0
    watchBackoff:
      maxIntervalMs: 5000
"#;
        let configuration = OperatorConfiguration::from_yaml(yaml).unwrap();
        let c = &configuration.controllers[0];
        assert!(!c.generation_aware);
        assert_eq!(Some("echos.echo.rustrial.org"), c.crd_name.as_deref());
        let retry = c.retry.as_ref().unwrap();
        assert_eq!(3, retry.max_attempts);
        assert_eq!(Duration::from_millis(100), retry.initial_interval());
        assert_eq!(Duration::from_secs(5), c.watch_backoff.max_interval());
        assert_eq!(Duration::from_millis(800), c.watch_backoff.initial_interval());

        let invalid = "controllers:\n  - name: echo\n    finalizerName: nope\n";
        assert!(OperatorConfiguration::from_yaml(invalid).is_err());
    }
}
