//! Configuration document for a test run.
//!
//! The TOML file yields modem instances, handshake identity, test
//! parameters, CDR sources, sinks, and the optional directory API.
//! Validation happens once at startup; anything invalid is fatal
//! before a single call is placed.

use crate::cdr::CdrSourceConfig;
use crate::domain::operator::Operator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors; all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// How a modem drops an established call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HangupMethod {
    /// Drop DTR and hold it low.
    #[default]
    Dtr,
    /// `+++` escape guard then ATH.
    Escape,
}

/// USB identity for cable-level resets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbId {
    /// Hex vendor id, e.g. `"0572"`.
    pub vendor_id: String,
    /// Hex product id, e.g. `"1329"`.
    pub product_id: String,
}

/// Timing constants for one modem device. All fields have defaults
/// tuned for hardware modems on VoIP gateways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemTimings {
    pub dial_timeout_secs: u64,
    pub carrier_timeout_secs: u64,
    pub command_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub dtr_hold_ms: u64,
    pub dtr_wait_ms: u64,
    pub dtr_max_wait_ms: u64,
    pub dtr_stabilize_ms: u64,
    pub post_disconnect_delay_ms: u64,
}

impl Default for ModemTimings {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 90,
            carrier_timeout_secs: 60,
            command_timeout_ms: 3_000,
            read_timeout_ms: 500,
            dtr_hold_ms: 1_200,
            dtr_wait_ms: 500,
            dtr_max_wait_ms: 5_000,
            dtr_stabilize_ms: 300,
            post_disconnect_delay_ms: 1_500,
        }
    }
}

impl ModemTimings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn post_disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.post_disconnect_delay_ms)
    }
}

/// One physical modem instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemInstanceConfig {
    pub name: String,
    /// Serial device path, e.g. `/dev/ttyACM0`.
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Prepended to every dial string, e.g. `"T"` for tone dialing.
    #[serde(default)]
    pub dial_prefix: String,
    #[serde(default)]
    pub hangup_method: HangupMethod,
    #[serde(default)]
    pub timings: ModemTimings,
    #[serde(default)]
    pub init_commands: Vec<String>,
    #[serde(default)]
    pub post_disconnect_commands: Vec<String>,
    /// Stats parser profile name; `None` disables stats collection.
    #[serde(default)]
    pub stats_profile: Option<String>,
    /// Whether the chipset paginates long responses and needs paging
    /// keystrokes while reading statistics.
    #[serde(default)]
    pub pagination: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// USB identity for cable-level reset; `None` for on-board ports.
    #[serde(default)]
    pub usb: Option<UsbId>,
}

fn default_baud() -> u32 {
    115_200
}

fn default_true() -> bool {
    true
}

/// Session-layer handshake identity and settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmsiConfig {
    /// Our network address, e.g. `2:5020/9999`.
    pub address: String,
    pub system_name: String,
    pub sysop: String,
    pub location: String,
    #[serde(default = "default_emsi_timeout")]
    pub timeout_secs: u64,
    /// Protocols offered during the handshake, in preference order.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    /// Initial strategy: `"inquire"` sends EMSI_INQ first; `"listen"`
    /// waits for the remote to open.
    #[serde(default = "default_strategy")]
    pub initial_strategy: String,
}

fn default_emsi_timeout() -> u64 {
    60
}

fn default_protocols() -> Vec<String> {
    vec!["ZAP".to_string(), "ZMO".to_string()]
}

fn default_strategy() -> String {
    "inquire".to_string()
}

impl EmsiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Operator entry as written in config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prefix: String,
}

impl From<&OperatorConfig> for Operator {
    fn from(cfg: &OperatorConfig) -> Self {
        Operator {
            name: cfg.name.clone(),
            prefix: cfg.prefix.clone(),
        }
    }
}

/// Test-run parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Destination phone numbers: literals or `NNN-MMM` numeric
    /// ranges. May be empty when the directory API supplies the set.
    pub destinations: Vec<String>,
    /// Global operator list tried in order; empty means direct dial.
    pub operators: Vec<OperatorConfig>,
    /// Per-phone-prefix operator overrides; longest matching prefix
    /// wins, `+` is stripped before matching.
    pub prefix_operators: BTreeMap<String, Vec<OperatorConfig>>,
    /// Pause between tests on one modem, and the numerator of the
    /// submission pacing computation.
    pub inter_test_delay_secs: u64,
    /// Wait before CDR lookups, covering the switch's asynchronous
    /// write.
    pub cdr_lookup_delay_secs: u64,
    pub retry_count: u32,
    pub retry_delay_secs: u64,
    pub operator_cache_enabled: bool,
    pub operator_cache_path: Option<String>,
    pub operator_cache_ttl_days: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            operators: Vec::new(),
            prefix_operators: BTreeMap::new(),
            inter_test_delay_secs: 30,
            cdr_lookup_delay_secs: 2,
            retry_count: 2,
            retry_delay_secs: 30,
            operator_cache_enabled: true,
            operator_cache_path: None,
            operator_cache_ttl_days: 360,
        }
    }
}

impl TestConfig {
    pub fn inter_test_delay(&self) -> Duration {
        Duration::from_secs(self.inter_test_delay_secs)
    }

    pub fn cdr_lookup_delay(&self) -> Duration {
        Duration::from_secs(self.cdr_lookup_delay_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Record sink switches and settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    pub csv_path: Option<String>,
    pub postgres_dsn: Option<String>,
    pub mysql_dsn: Option<String>,
    pub sqlite_path: Option<String>,
    /// HTTP ingestion endpoint.
    pub api_url: Option<String>,
    pub api_token: Option<String>,
}

/// Directory API settings for auto-populating the destination set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub url: String,
    /// Phone prefixes to query for.
    #[serde(default)]
    pub prefixes: Vec<String>,
    /// Only include continuous-mail destinations.
    #[serde(default)]
    pub cm_only: bool,
    /// Phones matching these prefixes are excluded from the set
    /// before any operator override is considered.
    #[serde(default)]
    pub except_prefixes: Vec<String>,
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub modems: Vec<ModemInstanceConfig>,
    pub emsi: EmsiConfig,
    #[serde(default)]
    pub test: TestConfig,
    #[serde(default)]
    pub sinks: SinksConfig,
    /// Switch CDR source.
    #[serde(default)]
    pub cdr: Option<CdrSourceConfig>,
    /// VoIP gateway CDR source.
    #[serde(default)]
    pub voip_cdr: Option<CdrSourceConfig>,
    #[serde(default)]
    pub directory: Option<DirectoryConfig>,
    /// Pid-file path; `~` expands against the home directory.
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
}

fn default_pid_file() -> String {
    "~/.modem-test/modem-test.pid".to_string()
}

impl Config {
    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Enabled modem instances.
    pub fn enabled_modems(&self) -> impl Iterator<Item = &ModemInstanceConfig> {
        self.modems.iter().filter(|m| m.enabled)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_modems().next().is_none() {
            return Err(ConfigError::invalid("modems", "no enabled modem instances"));
        }

        let mut names = HashSet::new();
        let mut devices = HashSet::new();
        for modem in self.enabled_modems() {
            if modem.name.trim().is_empty() {
                return Err(ConfigError::invalid("modems.name", "modem name is empty"));
            }
            if !names.insert(modem.name.as_str()) {
                return Err(ConfigError::invalid(
                    "modems.name",
                    format!("duplicate modem name {:?}", modem.name),
                ));
            }
            if !devices.insert(modem.device.as_str()) {
                return Err(ConfigError::invalid(
                    "modems.device",
                    format!("duplicate modem device {:?}", modem.device),
                ));
            }
            if modem.device.trim().is_empty() {
                return Err(ConfigError::invalid("modems.device", "device path is empty"));
            }
            if modem.timings.dial_timeout_secs == 0 {
                return Err(ConfigError::invalid(
                    "modems.timings.dial_timeout_secs",
                    "must be positive",
                ));
            }
            if modem.stats_profile.is_some() && modem.post_disconnect_commands.is_empty() {
                return Err(ConfigError::invalid(
                    "modems.stats_profile",
                    "stats profile set but no post-disconnect commands configured",
                ));
            }
        }

        Self::validate_operators("test.operators", &self.test.operators)?;
        for (prefix, operators) in &self.test.prefix_operators {
            if prefix.trim_start_matches('+').is_empty() {
                return Err(ConfigError::invalid(
                    "test.prefix_operators",
                    "empty phone prefix",
                ));
            }
            Self::validate_operators("test.prefix_operators", operators)?;
        }

        if self.test.destinations.is_empty() && self.directory.is_none() {
            return Err(ConfigError::invalid(
                "test.destinations",
                "no destinations and no directory source configured",
            ));
        }

        if self.sinks.api_token.is_some() && self.sinks.api_url.is_none() {
            return Err(ConfigError::invalid(
                "sinks.api_token",
                "api_token set without api_url",
            ));
        }

        Ok(())
    }

    fn validate_operators(field: &str, operators: &[OperatorConfig]) -> Result<(), ConfigError> {
        if operators.len() > 1 && operators.iter().any(|op| op.name.trim().is_empty()) {
            return Err(ConfigError::invalid(
                field,
                "operator name required when more than one operator is configured",
            ));
        }
        let mut prefixes = HashSet::new();
        for op in operators {
            let normalized = op.prefix.trim_start_matches('+');
            if !prefixes.insert(normalized.to_string()) {
                return Err(ConfigError::invalid(
                    field,
                    format!("duplicate operator prefix {:?}", op.prefix),
                ));
            }
        }
        Ok(())
    }

    /// Global operator list as domain values.
    pub fn global_operators(&self) -> Vec<Operator> {
        self.test.operators.iter().map(Operator::from).collect()
    }
}

/// Largest number of phones one `A-B` range may expand to.
const MAX_RANGE_SPAN: u64 = 10_000;

/// Expands destination specs into plain phone numbers: literals pass
/// through, `A-B` all-digit ranges of equal length expand
/// inclusively.
pub fn expand_destination_specs(specs: &[String]) -> Result<Vec<String>, ConfigError> {
    let mut phones = Vec::new();
    for spec in specs {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        match spec.split_once('-') {
            Some((start, end))
                if !start.is_empty()
                    && start.chars().all(|c| c.is_ascii_digit())
                    && end.chars().all(|c| c.is_ascii_digit()) =>
            {
                if start.len() != end.len() {
                    return Err(ConfigError::invalid(
                        "test.destinations",
                        format!("range ends differ in length: {spec:?}"),
                    ));
                }
                let from: u64 = start.parse().map_err(|_| {
                    ConfigError::invalid("test.destinations", format!("bad range {spec:?}"))
                })?;
                let to: u64 = end.parse().map_err(|_| {
                    ConfigError::invalid("test.destinations", format!("bad range {spec:?}"))
                })?;
                if to < from || to - from >= MAX_RANGE_SPAN {
                    return Err(ConfigError::invalid(
                        "test.destinations",
                        format!("range {spec:?} is inverted or too wide"),
                    ));
                }
                let width = start.len();
                for n in from..=to {
                    phones.push(format!("{n:0width$}"));
                }
            }
            _ => phones.push(spec.to_string()),
        }
    }
    Ok(phones)
}
