//! TOML config file loading, environment overrides and validation.

use anyhow::{bail, Context, Result};
use rumqttc::MqttOptions;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use time::macros::format_description;
use time::UtcOffset;
use tracing::warn;

use crate::arbiter::Limits;
use crate::mqtt::Topics;
use crate::relay::Polarity;
use crate::supervisor::{LadderConfig, RetryPolicy};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerSection,
    pub storage: StorageSection,
    pub mqtt: MqttSection,
    pub network: NetworkSection,
    pub messaging: MessagingSection,
    pub isolated: IsolatedSection,
    pub web: WebSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    /// BCM pin per zone; the list length is the zone count.
    pub relay_pins: Vec<u8>,
    pub polarity: Polarity,
    pub tick_secs: u64,
    pub fallback_timer_min: u32,
    /// Local wall-clock offset, `+HH:MM`.
    pub utc_offset: String,
    pub max_timer_min: u32,
    pub max_rain_delay_days: u32,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            relay_pins: vec![16, 17, 18, 19, 20, 21, 22, 23],
            polarity: Polarity::ActiveLow,
            tick_secs: 1,
            fallback_timer_min: 60,
            utc_offset: "+00:00".into(),
            max_timer_min: 24 * 60,
            max_rain_delay_days: 365,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub db_url: String,
    pub timeout_ms: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_url: "sqlite:controller.db?mode=rwc".into(),
            timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub command_base: String,
    pub state_base: String,
    /// Empty disables Home Assistant discovery.
    pub discovery_prefix: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "sprinkler-controller".into(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            command_base: "cmnd/zones".into(),
            state_base: "stat/zones".into(),
            discovery_prefix: "homeassistant".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub probe_addr: String,
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            probe_addr: "8.8.8.8:53".into(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingSection {
    #[serde(flatten)]
    pub retry: RetryPolicy,
    /// NETWORK_ONLY re-probe period; 0 never retries.
    pub retry_after_secs: u64,
}

impl Default for MessagingSection {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retry_after_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IsolatedSection {
    pub restart_after_secs: u64,
}

impl Default for IsolatedSection {
    fn default() -> Self {
        Self {
            restart_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_storage(&mut errors);
        self.validate_links(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;

        if c.relay_pins.is_empty() {
            errors.push("controller.relay_pins: at least one zone is required".into());
        }
        let mut seen_pins: HashSet<u8> = HashSet::new();
        for (zone, pin) in c.relay_pins.iter().enumerate() {
            if !VALID_GPIO_PINS.contains(pin) {
                errors.push(format!(
                    "zone {zone}: relay pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(*pin) {
                errors.push(format!(
                    "zone {zone}: relay pin {pin} is already used by another zone"
                ));
            }
        }

        if !(1..=60).contains(&c.tick_secs) {
            errors.push(format!(
                "controller.tick_secs must be 1..=60, got {}",
                c.tick_secs
            ));
        }
        if c.fallback_timer_min == 0 {
            errors.push("controller.fallback_timer_min must be positive".into());
        }
        if c.max_timer_min == 0 {
            errors.push("controller.max_timer_min must be positive".into());
        }
        if let Err(e) = parse_offset(&c.utc_offset) {
            errors.push(format!("controller.utc_offset: {e:#}"));
        }
    }

    /// Writes happen under the controller lock, so one may not outlast a tick.
    fn validate_storage(&self, errors: &mut Vec<String>) {
        let ceiling = self.controller.tick_secs.clamp(1, 60) * 1_000;
        let t = self.storage.timeout_ms;
        if !(1..=ceiling).contains(&t) {
            errors.push(format!(
                "storage.timeout_ms must be 1..={ceiling} (one tick), got {t}"
            ));
        }
    }

    fn validate_links(&self, errors: &mut Vec<String>) {
        if self.network.probe_addr.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "network.probe_addr '{}' is not an ip:port address",
                self.network.probe_addr
            ));
        }

        for (name, p) in [("network", &self.network.retry), ("messaging", &self.messaging.retry)] {
            if p.attempts == 0 {
                errors.push(format!("{name}.attempts must be at least 1"));
            }
            if p.attempt_timeout_secs == 0 {
                errors.push(format!("{name}.attempt_timeout_secs must be positive"));
            }
            if p.base_delay_ms > p.max_delay_secs.saturating_mul(1000) {
                errors.push(format!(
                    "{name}.base_delay_ms ({}) exceeds max_delay_secs ({})",
                    p.base_delay_ms, p.max_delay_secs
                ));
            }
        }

        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        for (name, base) in [("command_base", &m.command_base), ("state_base", &m.state_base)] {
            if base.is_empty() || base.ends_with('/') {
                errors.push(format!(
                    "mqtt.{name} '{base}' must be non-empty without a trailing '/'"
                ));
            } else if base.contains(['+', '#']) {
                errors.push(format!("mqtt.{name} '{base}' must not contain MQTT wildcards"));
            }
        }
        if m.username.is_some() != m.password.is_some() {
            errors.push("mqtt.username and mqtt.password must be set together".into());
        }
    }
}

fn parse_offset(s: &str) -> Result<UtcOffset> {
    UtcOffset::parse(
        s,
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .with_context(|| format!("'{s}' is not a +HH:MM offset"))
}

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    pub fn zone_count(&self) -> usize {
        self.controller.relay_pins.len()
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        parse_offset(&self.controller.utc_offset)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.controller.tick_secs)
    }

    pub fn fallback_timer(&self) -> Duration {
        Duration::from_secs(u64::from(self.controller.fallback_timer_min) * 60)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_timer_min: self.controller.max_timer_min,
            max_rain_delay_days: self.controller.max_rain_delay_days,
        }
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.timeout_ms)
    }

    pub fn probe_addr(&self) -> Result<SocketAddr> {
        self.network
            .probe_addr
            .parse()
            .with_context(|| format!("invalid probe address: {}", self.network.probe_addr))
    }

    pub fn topics(&self) -> Topics {
        let m = &self.mqtt;
        Topics::new(
            m.command_base.clone(),
            m.state_base.clone(),
            Some(m.discovery_prefix.clone()),
            m.client_id.clone(),
        )
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let m = &self.mqtt;
        let mut options = MqttOptions::new(m.client_id.clone(), m.host.clone(), m.port);
        options.set_keep_alive(Duration::from_secs(m.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&m.username, &m.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        options
    }

    pub fn ladder(&self) -> LadderConfig {
        LadderConfig {
            network: self.network.retry.clone(),
            messaging: self.messaging.retry.clone(),
            messaging_retry_after: match self.messaging.retry_after_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            isolated_restart_after: Duration::from_secs(self.isolated.restart_after_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Load + environment
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file yields the built-in
/// defaults; a malformed one is an error. Not validated yet, so environment
/// overrides can be applied first.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        warn!(path, "config file not found; using built-in defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

impl Config {
    /// Apply `MQTT_HOST`, `MQTT_PORT`, `DB_URL`, `WEB_PORT` and
    /// `RELAY_ACTIVE_LOW` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("MQTT_PORT") {
            match port.parse() {
                Ok(p) => self.mqtt.port = p,
                Err(_) => warn!(value = %port, "ignoring unparsable MQTT_PORT"),
            }
        }
        if let Some(url) = var("DB_URL") {
            self.storage.db_url = url;
        }
        if let Some(port) = var("WEB_PORT") {
            match port.parse() {
                Ok(p) => self.web.port = p,
                Err(_) => warn!(value = %port, "ignoring unparsable WEB_PORT"),
            }
        }
        // Many common relay boards are active-low.
        if let Some(v) = var("RELAY_ACTIVE_LOW") {
            self.controller.polarity = if v == "1" || v.eq_ignore_ascii_case("true") {
                Polarity::ActiveLow
            } else {
                Polarity::ActiveHigh
            };
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.zone_count(), 8);
        assert_eq!(cfg.fallback_timer(), Duration::from_secs(3600));
        assert_eq!(cfg.utc_offset().unwrap(), UtcOffset::UTC);
    }

    #[test]
    fn parse_partial_config_keeps_other_defaults() {
        let toml_str = r#"
[controller]
relay_pins = [5, 6, 13]
polarity = "active_high"
utc_offset = "-05:00"

[mqtt]
host = "broker.lan"
discovery_prefix = ""

[network]
attempts = 3
probe_addr = "192.168.1.1:53"

[messaging]
retry_after_secs = 0
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.zone_count(), 3);
        assert_eq!(cfg.controller.polarity, Polarity::ActiveHigh);
        assert_eq!(cfg.controller.tick_secs, 1);
        assert_eq!(cfg.mqtt.host, "broker.lan");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.network.retry.attempts, 3);
        assert_eq!(cfg.network.retry.base_delay_ms, 2_000);
        assert_eq!(cfg.ladder().messaging_retry_after, None);
        assert_eq!(cfg.topics().discovery(0), None);
        assert_eq!(
            cfg.utc_offset().unwrap(),
            UtcOffset::from_hms(-5, 0, 0).unwrap()
        );
    }

    #[test]
    fn example_file_matches_defaults() {
        let cfg: Config = toml::from_str(include_str!("../controller.example.toml")).unwrap();
        cfg.validate().unwrap();
        let d = Config::default();
        assert_eq!(cfg.controller.relay_pins, d.controller.relay_pins);
        assert_eq!(cfg.network.retry, d.network.retry);
        assert_eq!(cfg.messaging.retry_after_secs, d.messaging.retry_after_secs);
        assert_eq!(cfg.mqtt.discovery_prefix, d.mqtt.discovery_prefix);
        assert_eq!(cfg.storage.timeout_ms, d.storage.timeout_ms);
    }

    #[test]
    fn parse_rejects_malformed_toml() {
        assert!(toml::from_str::<Config>("[controller\nrelay_pins = 1").is_err());
        assert!(toml::from_str::<Config>("[controller]\nrelay_pins = \"17\"").is_err());
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let cfg = load("/nonexistent/controller.toml").unwrap();
        assert_eq!(cfg.zone_count(), 8);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn reserved_and_out_of_range_pins_rejected() {
        let mut cfg = Config::default();
        cfg.controller.relay_pins = vec![0, 28];
        assert_validation_err(&cfg, "relay pin 0 is not a valid BCM GPIO pin");
        assert_validation_err(&cfg, "relay pin 28 is not a valid BCM GPIO pin");
    }

    #[test]
    fn duplicate_pin_rejected() {
        let mut cfg = Config::default();
        cfg.controller.relay_pins = vec![17, 18, 17];
        assert_validation_err(&cfg, "zone 2: relay pin 17 is already used");
    }

    #[test]
    fn no_zones_rejected() {
        let mut cfg = Config::default();
        cfg.controller.relay_pins.clear();
        assert_validation_err(&cfg, "at least one zone");
    }

    #[test]
    fn tick_period_bounded() {
        let mut cfg = Config::default();
        cfg.controller.tick_secs = 0;
        assert_validation_err(&cfg, "tick_secs must be 1..=60");
        cfg.controller.tick_secs = 61;
        assert_validation_err(&cfg, "tick_secs must be 1..=60");
        cfg.controller.tick_secs = 60;
        cfg.validate().unwrap();
    }

    #[test]
    fn storage_timeout_bounded_by_tick() {
        let mut cfg = Config::default();
        cfg.storage.timeout_ms = 0;
        assert_validation_err(&cfg, "storage.timeout_ms must be 1..=1000");
        cfg.storage.timeout_ms = 2_000;
        assert_validation_err(&cfg, "got 2000");
        cfg.controller.tick_secs = 5;
        cfg.validate().unwrap();
    }

    #[test]
    fn utc_offset_must_parse() {
        let mut cfg = Config::default();
        cfg.controller.utc_offset = "CET".into();
        assert_validation_err(&cfg, "controller.utc_offset");
    }

    #[test]
    fn wildcard_topic_base_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.command_base = "cmnd/+/zones".into();
        assert_validation_err(&cfg, "must not contain MQTT wildcards");
        cfg.mqtt.command_base = "cmnd/zones/".into();
        assert_validation_err(&cfg, "without a trailing '/'");
    }

    #[test]
    fn retry_policy_sanity() {
        let mut cfg = Config::default();
        cfg.messaging.retry.attempts = 0;
        cfg.network.retry.base_delay_ms = 120_000;
        assert_validation_err(&cfg, "messaging.attempts must be at least 1");
        assert_validation_err(&cfg, "network.base_delay_ms (120000) exceeds");
    }

    #[test]
    fn bad_probe_addr_rejected() {
        let mut cfg = Config::default();
        cfg.network.probe_addr = "gateway".into();
        assert_validation_err(&cfg, "network.probe_addr 'gateway'");
    }

    #[test]
    fn multiple_errors_reported_at_once() {
        let mut cfg = Config::default();
        cfg.controller.relay_pins = vec![1];
        cfg.controller.tick_secs = 0;
        cfg.mqtt.host = String::new();
        assert_validation_err(&cfg, "3 errors");
    }

    #[test]
    fn credentials_must_be_paired() {
        let mut cfg = Config::default();
        cfg.mqtt.username = Some("hass".into());
        assert_validation_err(&cfg, "must be set together");
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("MQTT_HOST", "10.0.0.5"),
            ("MQTT_PORT", "8883"),
            ("DB_URL", "sqlite::memory:"),
            ("WEB_PORT", "not-a-port"),
            ("RELAY_ACTIVE_LOW", "false"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.mqtt.host, "10.0.0.5");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.storage.db_url, "sqlite::memory:");
        assert_eq!(cfg.web.port, 8080);
        assert_eq!(cfg.controller.polarity, Polarity::ActiveHigh);
    }

    #[test]
    fn ladder_maps_retry_sections() {
        let cfg = Config::default();
        let ladder = cfg.ladder();
        assert_eq!(ladder.messaging_retry_after, Some(Duration::from_secs(600)));
        assert_eq!(ladder.isolated_restart_after, Duration::from_secs(300));
        assert_eq!(ladder.network, RetryPolicy::default());
    }
}
