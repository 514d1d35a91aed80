//! Client configuration

use crate::constants::{DEFAULT_AMI_HOST, DEFAULT_AMI_PORT, DEFAULT_TIMEOUT_MS, MAX_EVENT_QUEUE_SIZE};
use serde::Deserialize;
use std::time::Duration;

/// Settings fixed for the lifetime of an [`AmiClient`](crate::AmiClient).
///
/// Deserializes with defaults for every missing field, so an application can
/// load it from whatever format it already uses:
///
/// ```
/// # use asterisk_ami_tokio::AmiConfig;
/// let config = AmiConfig::new("pbx.example.com", 5038, "admin", "s3cret")
///     .with_reconnect_delay(std::time::Duration::from_secs(5))
///     .with_events(false);
/// assert_eq!(config.reconnect_delay(), Some(std::time::Duration::from_secs(5)));
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AmiConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Login secret. `password` is accepted as an alias.
    #[serde(alias = "password")]
    pub secret: String,
    /// Ask the manager to send unsolicited events (`Events: on`).
    pub events: bool,
    /// Log every wire frame at `debug` instead of `trace`.
    pub debug: bool,
    /// Delay before reconnecting after the socket closes. `None` disables
    /// reconnection.
    pub reconnect_delay_ms: Option<u64>,
    /// TCP connect timeout.
    pub connect_timeout_ms: u64,
    /// Capacity of the notification channel. Default: 1000.
    pub event_queue_size: usize,
    /// Span the session task runs in. Defaults to `ami{host, port}`.
    #[serde(skip)]
    pub span: Option<tracing::Span>,
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_AMI_HOST.to_string(),
            port: DEFAULT_AMI_PORT,
            username: String::new(),
            secret: String::new(),
            events: true,
            debug: false,
            reconnect_delay_ms: None,
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            span: None,
        }
    }
}

impl std::fmt::Debug for AmiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("events", &self.events)
            .field("debug", &self.debug)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("event_queue_size", &self.event_queue_size)
            .finish()
    }
}

impl AmiConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            secret: secret.into(),
            ..Default::default()
        }
    }

    /// Reconnect after this delay whenever the socket closes.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_events(mut self, on: bool) -> Self {
        self.events = on;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = size;
        self
    }

    /// Run the session task inside this span.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Reconnect delay; zero counts as disabled.
    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_delay_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// `on` / `off` as sent in the `Events` login field.
    pub fn events_flag(&self) -> &'static str {
        if self.events {
            "on"
        } else {
            "off"
        }
    }

    pub(crate) fn session_span(&self) -> tracing::Span {
        self.span
            .clone()
            .unwrap_or_else(|| tracing::info_span!("ami", host = %self.host, port = self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AmiConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5038);
        assert!(config.events);
        assert_eq!(config.events_flag(), "on");
        assert_eq!(config.reconnect_delay(), None);
    }

    #[test]
    fn zero_delay_disables_reconnect() {
        let config = AmiConfig::default().with_reconnect_delay(Duration::ZERO);
        assert_eq!(config.reconnect_delay(), None);
    }

    #[test]
    fn deserialize_with_password_alias() {
        let config: AmiConfig = serde_json::from_str(
            r#"{"host":"pbx","username":"admin","password":"pw","events":false,"reconnect_delay_ms":250}"#,
        )
        .unwrap();
        assert_eq!(config.host, "pbx");
        assert_eq!(config.port, 5038);
        assert_eq!(config.secret, "pw");
        assert_eq!(config.events_flag(), "off");
        assert_eq!(config.reconnect_delay(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn huge_durations_saturate() {
        let config = AmiConfig::default()
            .with_reconnect_delay(Duration::MAX)
            .with_connect_timeout(Duration::MAX);
        assert_eq!(config.reconnect_delay_ms, Some(u64::MAX));
        assert_eq!(config.connect_timeout_ms, u64::MAX);
    }

    #[test]
    fn debug_redacts_secret() {
        let config = AmiConfig::new("h", 1, "u", "topsecret");
        let out = format!("{:?}", config);
        assert!(!out.contains("topsecret"));
        assert!(out.contains("[REDACTED]"));
    }
}
