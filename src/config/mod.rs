//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`RADIOLINK_*`)
//! - CLI arguments (for the `radiolink` binary)
//!
//! Retry budgets and backoff schedules are operational tuning, so every one
//! of them lives here rather than in the state machine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LinkError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Service and characteristic identifiers shared with the peer firmware
    #[serde(default)]
    pub link: LinkIds,

    /// Handshake retry budget
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Transient transport error retries
    #[serde(default)]
    pub transport: TransportRetryConfig,

    /// Poll loop bounds
    #[serde(default)]
    pub poll: PollConfig,

    /// Session supervisor policy
    #[serde(default)]
    pub restart: RestartConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| LinkError::Config(format!("Failed to read config file {path:?}: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| LinkError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file location (`<config dir>/radiolink/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("radiolink").join("config.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("RADIOLINK_HANDSHAKE_MAX_ATTEMPTS") {
            config.handshake.max_attempts = v;
        }
        if let Some(v) = env_parse("RADIOLINK_HANDSHAKE_INITIAL_DELAY_MS") {
            config.handshake.initial_delay_ms = v;
        }
        if let Some(v) = env_parse("RADIOLINK_HANDSHAKE_MAX_DELAY_MS") {
            config.handshake.max_delay_ms = v;
        }
        if let Some(v) = env_parse("RADIOLINK_HANDSHAKE_BACKOFF_MULTIPLIER") {
            config.handshake.backoff_multiplier = v;
        }
        if let Some(v) = env_parse("RADIOLINK_HANDSHAKE_TIMEOUT_MS") {
            config.handshake.total_timeout_ms = v;
        }
        if let Some(v) = env_parse("RADIOLINK_TRANSPORT_MAX_RETRIES") {
            config.transport.max_retries = v;
        }
        if let Some(v) = env_parse("RADIOLINK_TRANSPORT_RETRY_DELAY_MS") {
            config.transport.retry_delay_ms = v;
        }
        if let Some(v) = env_parse("RADIOLINK_POLL_MAX_READS") {
            config.poll.max_reads_per_pull = v;
        }
        if let Some(v) = env_parse("RADIOLINK_MAX_RESTARTS") {
            config.restart.max_restarts = v;
        }
        if let Some(v) = env_parse("RADIOLINK_RESTART_DELAY_MS") {
            config.restart.delay_ms = v;
        }
        if let Some(v) = env_parse("RADIOLINK_RESTART_ON_INCOMPATIBLE") {
            config.restart.restart_on_incompatible = v;
        }

        config
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would make a session hang or never start
    pub fn validate(&self) -> Result<()> {
        let h = &self.handshake;
        if h.max_attempts == 0 {
            return Err(LinkError::Config(
                "handshake.max_attempts must be at least 1".to_string(),
            ));
        }
        if h.total_timeout_ms == 0 {
            return Err(LinkError::Config(
                "handshake.total_timeout_ms must be non-zero".to_string(),
            ));
        }
        if h.initial_delay_ms > h.max_delay_ms {
            return Err(LinkError::Config(format!(
                "handshake.initial_delay_ms ({}) exceeds max_delay_ms ({})",
                h.initial_delay_ms, h.max_delay_ms
            )));
        }
        if !h.backoff_multiplier.is_finite() || h.backoff_multiplier < 1.0 {
            return Err(LinkError::Config(format!(
                "handshake.backoff_multiplier must be finite and >= 1.0 (got {})",
                h.backoff_multiplier
            )));
        }
        if self.poll.max_reads_per_pull == 0 {
            return Err(LinkError::Config(
                "poll.max_reads_per_pull must be at least 1".to_string(),
            ));
        }

        let ids = [
            self.link.write_uuid,
            self.link.read_uuid,
            self.link.notify_uuid,
        ];
        for (i, a) in ids.iter().enumerate() {
            if ids[i + 1..].contains(a) {
                return Err(LinkError::Config(format!(
                    "characteristic {a} is configured for more than one role"
                )));
            }
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Stable addresses of the peer's radio service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkIds {
    /// Primary service
    pub service_uuid: Uuid,

    /// Host -> peer command characteristic
    pub write_uuid: Uuid,

    /// Peer -> host data pull characteristic
    pub read_uuid: Uuid,

    /// Peer -> host "data available" characteristic
    pub notify_uuid: Uuid,
}

impl Default for LinkIds {
    fn default() -> Self {
        Self {
            service_uuid: Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd),
            write_uuid: Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7),
            read_uuid: Uuid::from_u128(0x2c55e69e_4993_11ed_b878_0242ac120002),
            notify_uuid: Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453),
        }
    }
}

/// Handshake (configuration pull) retry budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Configuration reads allowed after the handshake write
    pub max_attempts: u32,

    /// Delay before the first re-read after an empty result
    pub initial_delay_ms: u64,

    /// Cap on the delay between re-reads
    pub max_delay_ms: u64,

    /// Growth factor applied to the delay after each empty read
    pub backoff_multiplier: f64,

    /// Wall-clock budget measured from the handshake write
    pub total_timeout_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            total_timeout_ms: 15_000,
        }
    }
}

impl HandshakeConfig {
    /// Initial backoff delay
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Backoff cap
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Total handshake budget
    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

/// Retry budget for transient transport errors on a single call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportRetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay between retries
    pub retry_delay_ms: u64,
}

impl Default for TransportRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 50,
        }
    }
}

impl TransportRetryConfig {
    /// Delay between retries
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Poll loop bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Reads issued in one drain cycle before yielding to a follow-up cycle
    pub max_reads_per_pull: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_reads_per_pull: 256,
        }
    }
}

/// Supervisor restart policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Fresh sessions opened after the first one fails
    pub max_restarts: u32,

    /// Delay before opening the next session
    pub delay_ms: u64,

    /// Restart after `IncompatiblePeer` (firmware may be mid-update)
    pub restart_on_incompatible: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            delay_ms: 1_000,
            restart_on_incompatible: false,
        }
    }
}

impl RestartConfig {
    /// Delay before a restart
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.handshake.max_attempts, 10);
        assert_eq!(config.transport.max_retries, 3);
        assert_eq!(
            config.link.read_uuid.to_string(),
            "2c55e69e-4993-11ed-b878-0242ac120002"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [handshake]
            max_attempts = 4
            initial_delay_ms = 20
            max_delay_ms = 80
            backoff_multiplier = 1.5
            total_timeout_ms = 1000

            [poll]
            max_reads_per_pull = 16
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.handshake.max_attempts, 4);
        assert_eq!(config.handshake.initial_delay(), Duration::from_millis(20));
        assert_eq!(config.poll.max_reads_per_pull, 16);
        // Untouched sections keep their defaults
        assert_eq!(config.link, LinkIds::default());
        assert_eq!(config.restart, RestartConfig::default());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[transport]\nmax_retries = 7\nretry_delay_ms = 5").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.transport.max_retries, 7);
        assert_eq!(config.transport.retry_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_config_toml_round_trip() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let mut config = Config::default();
        config.handshake.max_attempts = 0;
        assert!(matches!(config.validate(), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut config = Config::default();
        config.handshake.initial_delay_ms = 5_000;
        config.handshake.max_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_multiplier() {
        let mut config = Config::default();
        for multiplier in [f64::INFINITY, f64::NAN, 0.5] {
            config.handshake.backoff_multiplier = multiplier;
            assert!(matches!(config.validate(), Err(LinkError::Config(_))));
        }

        let parsed: Config = toml::from_str("[handshake]\nmax_attempts = 3\ninitial_delay_ms = 10\nmax_delay_ms = 20\nbackoff_multiplier = inf\ntotal_timeout_ms = 100").unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        // Keys unique to this test, so parallel tests are unaffected
        std::env::set_var("RADIOLINK_HANDSHAKE_BACKOFF_MULTIPLIER", "1.5");
        std::env::set_var("RADIOLINK_POLL_MAX_READS", "32");
        std::env::set_var("RADIOLINK_RESTART_DELAY_MS", "250");
        std::env::set_var("RADIOLINK_RESTART_ON_INCOMPATIBLE", "true");

        let config = Config::from_env();
        assert!((config.handshake.backoff_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.poll.max_reads_per_pull, 32);
        assert_eq!(config.restart.delay(), Duration::from_millis(250));
        assert!(config.restart.restart_on_incompatible);
        assert_eq!(config.handshake.max_attempts, 10);

        for key in [
            "RADIOLINK_HANDSHAKE_BACKOFF_MULTIPLIER",
            "RADIOLINK_POLL_MAX_READS",
            "RADIOLINK_RESTART_DELAY_MS",
            "RADIOLINK_RESTART_ON_INCOMPATIBLE",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_validate_rejects_shared_characteristic() {
        let mut config = Config::default();
        config.link.notify_uuid = config.link.read_uuid;
        assert!(config.validate().is_err());
    }
}
