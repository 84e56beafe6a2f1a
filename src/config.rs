//! Throttling configuration.
//!
//! [`ThrottleConfig`] can be built from defaults, deserialized (durations are fractional
//! seconds), or read from the environment. The retry policy keeps it in a [`DynamicConfig`] so
//! operators can retune increments and ceilings while a crawl is running.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::classify::DEFAULT_RETRY_HTTP_CODES;
use crate::delay::DEFAULT_INCREMENT;
use crate::error::ConfigError;
use crate::error_rate::DEFAULT_WINDOW;

/// Default identity probe endpoint.
pub const DEFAULT_PROBE_URL: &str = "https://check.torproject.org/";

/// Anonymity-network control port settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl ControlConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 9900, password: String::new() }
    }
}

impl fmt::Debug for ControlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identity probe settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub url: String,
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// Pause between rotation attempts.
    #[serde(with = "secs")]
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_PROBE_URL.into(),
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(100),
        }
    }
}

/// Everything the retry policy and its collaborators read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Sliding-window size `W` for the error rate.
    pub window_size: usize,
    /// Maximum per-adjustment delay change, seconds.
    pub base_increment: f64,
    /// Error-free time required before the delay is relaxed.
    #[serde(with = "secs")]
    pub without_error_threshold: Duration,
    /// Ceiling for transient failures.
    pub max_retries: u32,
    /// Ceiling once a request has been rate limited.
    pub rate_limited_max_retries: u32,
    /// Ceiling once a request has been blocked.
    pub blocked_max_retries: u32,
    pub retry_http_codes: Vec<u16>,
    #[serde(with = "secs")]
    pub backoff_base: Duration,
    #[serde(with = "secs")]
    pub backoff_max: Duration,
    /// Forwarding proxy attached to requests that carry none.
    pub proxy: Option<String>,
    /// Control port; identity rotation is disabled when absent.
    pub control: Option<ControlConfig>,
    pub probe: ProbeConfig,
    /// Upper bound on one identity rotation.
    #[serde(with = "opt_secs")]
    pub rotation_deadline: Option<Duration>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW,
            base_increment: DEFAULT_INCREMENT,
            without_error_threshold: Duration::from_secs(30),
            max_retries: 2,
            rate_limited_max_retries: 1000,
            blocked_max_retries: 30,
            retry_http_codes: DEFAULT_RETRY_HTTP_CODES.to_vec(),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            proxy: None,
            control: None,
            probe: ProbeConfig::default(),
            rotation_deadline: None,
        }
    }
}

impl ThrottleConfig {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`; each recognized key replaces one field.
    ///
    /// Keys: `TOR_PROXY`, `TOR_PASSWORD`, `TOR_CONTROL_HOST`, `TOR_CONTROL_PORT`,
    /// `CRAWLGUARD_WINDOW_SIZE`, `CRAWLGUARD_DELAY_INCREMENT`, `CRAWLGUARD_WITHOUT_ERROR_SECS`,
    /// `CRAWLGUARD_MAX_RETRIES`, `CRAWLGUARD_PROBE_URL`. Setting any `TOR_CONTROL_*` or
    /// `TOR_PASSWORD` key enables identity rotation.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(proxy) = lookup("TOR_PROXY").filter(|p| !p.trim().is_empty()) {
            cfg.proxy = Some(proxy.trim().to_string());
        }

        let password = lookup("TOR_PASSWORD");
        let host = lookup("TOR_CONTROL_HOST");
        let port = lookup("TOR_CONTROL_PORT");
        if password.is_some() || host.is_some() || port.is_some() {
            let mut control = ControlConfig::default();
            if let Some(password) = password {
                control.password = password;
            }
            if let Some(host) = host {
                control.host = host;
            }
            if let Some(port) = port {
                control.port = parse("TOR_CONTROL_PORT", &port)?;
            }
            cfg.control = Some(control);
        }

        if let Some(v) = lookup("CRAWLGUARD_WINDOW_SIZE") {
            cfg.window_size = parse("CRAWLGUARD_WINDOW_SIZE", &v)?;
        }
        if let Some(v) = lookup("CRAWLGUARD_DELAY_INCREMENT") {
            cfg.base_increment = parse("CRAWLGUARD_DELAY_INCREMENT", &v)?;
        }
        if let Some(v) = lookup("CRAWLGUARD_WITHOUT_ERROR_SECS") {
            let secs: f64 = parse("CRAWLGUARD_WITHOUT_ERROR_SECS", &v)?;
            cfg.without_error_threshold = Duration::try_from_secs_f64(secs).map_err(|_| {
                ConfigError::InvalidEnv { key: "CRAWLGUARD_WITHOUT_ERROR_SECS".into(), value: v }
            })?;
        }
        if let Some(v) = lookup("CRAWLGUARD_MAX_RETRIES") {
            cfg.max_retries = parse("CRAWLGUARD_MAX_RETRIES", &v)?;
        }
        if let Some(url) = lookup("CRAWLGUARD_PROBE_URL") {
            cfg.probe.url = url;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the controllers cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::Invalid("window_size must be > 0".into()));
        }
        if !(self.base_increment.is_finite() && self.base_increment > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "base_increment must be finite and > 0 (got {})",
                self.base_increment
            )));
        }
        if self.max_retries == 0
            || self.rate_limited_max_retries == 0
            || self.blocked_max_retries == 0
        {
            return Err(ConfigError::Invalid("retry ceilings must be > 0".into()));
        }
        if self.backoff_max.is_zero() || self.backoff_max < self.backoff_base {
            return Err(ConfigError::Invalid(format!(
                "backoff_max ({:?}) must be > 0 and >= backoff_base ({:?})",
                self.backoff_max, self.backoff_base
            )));
        }
        if self.probe.timeout.is_zero() {
            return Err(ConfigError::Invalid("probe timeout must be > 0".into()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key: key.to_string(), value: value.to_string() })
}

/// Shared, live-updatable configuration.
///
/// Reads are lock-free snapshots; updates swap in a whole new value. Clones share the value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Replace the value with `f(current)`, retrying if another writer raced us.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|cur| f(cur));
    }
}

impl DynamicConfig<ThrottleConfig> {
    /// Like [`update`](Self::update), but keeps the current value when the result fails
    /// [`ThrottleConfig::validate`].
    pub fn try_update<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: Fn(&ThrottleConfig) -> ThrottleConfig,
    {
        loop {
            let current = self.inner.load_full();
            let next = f(&current);
            next.validate()?;
            let previous = self.inner.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&*previous, &current) {
                return Ok(());
            }
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ThrottleConfig::default();
        assert_eq!(cfg.window_size, 10);
        assert_eq!(cfg.base_increment, 0.05);
        assert_eq!(cfg.without_error_threshold, Duration::from_secs(30));
        assert_eq!(cfg.rate_limited_max_retries, 1000);
        assert_eq!(cfg.probe.timeout, Duration::from_secs(5));
        assert_eq!(cfg.probe.interval, Duration::from_millis(100));
        assert!(cfg.control.is_none());
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn env_overrides_and_enables_control() {
        let cfg = ThrottleConfig::from_lookup(lookup(&[
            ("TOR_PROXY", "http://127.0.0.1:8118"),
            ("TOR_PASSWORD", "secret"),
            ("TOR_CONTROL_PORT", "9051"),
            ("CRAWLGUARD_WINDOW_SIZE", "20"),
            ("CRAWLGUARD_WITHOUT_ERROR_SECS", "12.5"),
        ]))
        .unwrap();
        assert_eq!(cfg.proxy.as_deref(), Some("http://127.0.0.1:8118"));
        let control = cfg.control.expect("control enabled");
        assert_eq!(control.password, "secret");
        assert_eq!(control.addr(), "127.0.0.1:9051");
        assert_eq!(cfg.window_size, 20);
        assert_eq!(cfg.without_error_threshold, Duration::from_millis(12_500));
    }

    #[test]
    fn env_rejects_garbage() {
        let err = ThrottleConfig::from_lookup(lookup(&[("TOR_CONTROL_PORT", "tor")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv { key: "TOR_CONTROL_PORT".into(), value: "tor".into() }
        );
        let err =
            ThrottleConfig::from_lookup(lookup(&[("CRAWLGUARD_WINDOW_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn deserializes_partial_json_with_second_durations() {
        let cfg: ThrottleConfig = serde_json::from_str(
            r#"{"base_increment": 0.1, "probe": {"interval": 0.25}, "rotation_deadline": 90}"#,
        )
        .unwrap();
        assert_eq!(cfg.base_increment, 0.1);
        assert_eq!(cfg.probe.interval, Duration::from_millis(250));
        assert_eq!(cfg.probe.url, DEFAULT_PROBE_URL);
        assert_eq!(cfg.rotation_deadline, Some(Duration::from_secs(90)));
        assert_eq!(cfg.window_size, 10);
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let control = ControlConfig { password: "hunter2".into(), ..Default::default() };
        assert!(!format!("{control:?}").contains("hunter2"));
    }

    #[test]
    fn dynamic_config_updates_are_shared() {
        let cfg = DynamicConfig::new(ThrottleConfig::default());
        let other = cfg.clone();
        other.update(|c| ThrottleConfig { base_increment: 0.2, ..c.clone() });
        assert_eq!(cfg.get().base_increment, 0.2);
        cfg.set(ThrottleConfig::default());
        assert_eq!(other.get().base_increment, 0.05);
    }
}
