/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Coupler configuration.
//!
//! Values come from three layers, later ones winning:
//!
//! 1. built-in defaults
//! 2. an optional YAML file (`--config`)
//! 3. command line switches
//!
//! The expected YAML structure is:
//! ```yaml
//! device: /dev/i2c-1
//! slave_address_list: ["0x58", "0x59"]    # or "0x58,0x59"
//! mode: 0                             # 0 = drive hardware, 1 = virtual
//! id: 1
//! heart_beat: true
//! heart_beat_interval: 250            # ms
//! heart_beat_timeout_interval: 1000   # ms, defaults to 4 x interval
//! heart_beat_id_list: "2,3"           # hex, like the CLI
//! network_address_url_data_type: opc.udp://224.0.0.22:4840/
//! network_interface: eth0
//! pubsub:
//!   publisher_id: 2234
//!   writer_group_id: 100
//!   dataset_writer_id: 62541
//! pulse_mode: keep-alive
//! pulse_gpio: /sys/class/gpio/gpio17/value
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::hardware::MAX_BOARDS;
use crate::heartbeat::PubSubIds;
use crate::liveness::CouplerId;
use crate::pulse::PulseMode;

pub const DEFAULT_DEVICE: &str = "/dev/i2c-1";
pub const DEFAULT_SLAVE_ADDRESS: u16 = 0x58;
pub const DEFAULT_HEART_BEAT_INTERVAL_MS: u64 = 250;
/// Timeout used when none is configured, as a multiple of the interval.
pub const DEFAULT_TIMEOUT_FACTOR: u64 = 4;
pub const DEFAULT_NETWORK_ADDRESS_URL: &str = "opc.udp://224.0.0.22:4840/";
/// Capacity of the dependency list.
pub const MAX_DEPENDENCIES: usize = 8;
/// Highest 7-bit I2C slave address.
const MAX_SLAVE_ADDRESS: u32 = 0x7F;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("'{0}' is not a hexadecimal number")]
    InvalidHex(String),

    #[error("{0} slave addresses configured, at most 8 are supported")]
    TooManyAddresses(usize),

    #[error("slave address {0:#x} is outside the 7-bit range")]
    AddressOutOfRange(u32),

    #[error("{0} dependencies configured, at most 8 are supported")]
    TooManyDependencies(usize),

    #[error("unsupported mode {0} (expected 0 or 1)")]
    InvalidMode(u8),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("publishing heart beats needs a non-zero coupler id")]
    MissingId,
}

// ── Hex lists ─────────────────────────────────────────────────────────────────

/// Parse one hexadecimal token; the `0x` prefix is optional (`"58"` and
/// `"0x58"` are both 88).
pub fn parse_hex(token: &str) -> Result<u32, ConfigError> {
    let t = token.trim();
    let digits = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);
    u32::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidHex(token.to_string()))
}

/// Parse a comma separated hex list.  Empty input yields an empty list.
pub fn parse_hex_list(list: &str) -> Result<Vec<u32>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(parse_hex)
        .collect()
}

/// A list as written in YAML: either the CLI's comma separated string or a
/// sequence.  Sequence entries may be integers (taken as-is) or hex strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HexList {
    Joined(String),
    Items(Vec<HexItem>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HexItem {
    Int(u32),
    Text(String),
}

impl HexList {
    pub fn values(&self) -> Result<Vec<u32>, ConfigError> {
        match self {
            HexList::Joined(s) => parse_hex_list(s),
            HexList::Items(items) => items
                .iter()
                .map(|item| match item {
                    HexItem::Int(v) => Ok(*v),
                    HexItem::Text(s) => parse_hex(s),
                })
                .collect(),
        }
    }
}

// ── File layer ────────────────────────────────────────────────────────────────

/// The YAML file as written; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub device: Option<PathBuf>,
    pub slave_address_list: Option<HexList>,
    pub mode: Option<u8>,
    pub id: Option<u32>,
    pub heart_beat: Option<bool>,
    pub heart_beat_interval: Option<u64>,
    pub heart_beat_timeout_interval: Option<u64>,
    pub heart_beat_id_list: Option<HexList>,
    pub network_address_url_data_type: Option<String>,
    pub network_interface: Option<String>,
    pub pubsub: Option<PubSubIds>,
    pub pulse_mode: Option<PulseMode>,
    pub pulse_gpio: Option<PathBuf>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading coupler configuration from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?file, "configuration file parsed");
        Ok(file)
    }
}

// ── CLI layer ─────────────────────────────────────────────────────────────────

/// Values given on the command line.  `None` leaves the lower layer alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub device: Option<PathBuf>,
    pub slave_address_list: Option<String>,
    pub mode: Option<u8>,
    pub id: Option<u32>,
    pub heart_beat: Option<bool>,
    pub heart_beat_interval: Option<u64>,
    pub heart_beat_timeout_interval: Option<u64>,
    pub heart_beat_id_list: Option<String>,
    pub network_address_url_data_type: Option<String>,
    pub network_interface: Option<String>,
    pub pulse_mode: Option<PulseMode>,
    pub pulse_gpio: Option<PathBuf>,
}

// ── CouplerConfig ─────────────────────────────────────────────────────────────

/// Effective configuration, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct CouplerConfig {
    pub device: PathBuf,
    /// Slave address per slot; `0` marks an unused slot.
    pub slave_addresses: Vec<u16>,
    /// Operator-requested virtual mode (`mode: 1`).
    pub virtual_mode: bool,
    pub id: CouplerId,
    /// Publish our own heart beat.
    pub heart_beat: bool,
    pub heart_beat_interval_ms: u64,
    pub heart_beat_timeout_interval_ms: u64,
    /// Couplers to watch; `0` marks an unused slot.
    pub heart_beat_id_list: Vec<CouplerId>,
    pub network_address_url: String,
    pub network_interface: String,
    pub pubsub: PubSubIds,
    pub pulse_mode: PulseMode,
    pub pulse_gpio: Option<PathBuf>,
}

impl Default for CouplerConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            slave_addresses: vec![DEFAULT_SLAVE_ADDRESS],
            virtual_mode: false,
            id: CouplerId::UNUSED,
            heart_beat: false,
            heart_beat_interval_ms: DEFAULT_HEART_BEAT_INTERVAL_MS,
            heart_beat_timeout_interval_ms: DEFAULT_TIMEOUT_FACTOR * DEFAULT_HEART_BEAT_INTERVAL_MS,
            heart_beat_id_list: Vec::new(),
            network_address_url: DEFAULT_NETWORK_ADDRESS_URL.to_string(),
            network_interface: String::new(),
            pubsub: PubSubIds::default(),
            pulse_mode: PulseMode::Off,
            pulse_gpio: None,
        }
    }
}

impl CouplerConfig {
    /// Merge defaults, `file` and `cli`, then validate.
    pub fn resolve(file: Option<ConfigFile>, cli: ConfigOverrides) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_default();
        let mut cfg = CouplerConfig::default();

        if let Some(device) = cli.device.or(file.device) {
            cfg.device = device;
        }

        let addresses = match (cli.slave_address_list, file.slave_address_list) {
            (Some(s), _) => Some(parse_hex_list(&s)?),
            (None, Some(list)) => Some(list.values()?),
            (None, None) => None,
        };
        if let Some(addresses) = addresses {
            if addresses.len() > MAX_BOARDS {
                return Err(ConfigError::TooManyAddresses(addresses.len()));
            }
            cfg.slave_addresses = addresses
                .into_iter()
                .map(|a| {
                    if a > MAX_SLAVE_ADDRESS {
                        Err(ConfigError::AddressOutOfRange(a))
                    } else {
                        Ok(a as u16)
                    }
                })
                .collect::<Result<_, _>>()?;
        }

        match cli.mode.or(file.mode) {
            None | Some(0) => {}
            Some(1) => cfg.virtual_mode = true,
            Some(other) => return Err(ConfigError::InvalidMode(other)),
        }

        if let Some(id) = cli.id.or(file.id) {
            cfg.id = CouplerId(id);
        }
        if let Some(hb) = cli.heart_beat.or(file.heart_beat) {
            cfg.heart_beat = hb;
        }
        if let Some(interval) = cli.heart_beat_interval.or(file.heart_beat_interval) {
            cfg.heart_beat_interval_ms = interval;
        }
        cfg.heart_beat_timeout_interval_ms = cli
            .heart_beat_timeout_interval
            .or(file.heart_beat_timeout_interval)
            .unwrap_or(DEFAULT_TIMEOUT_FACTOR.saturating_mul(cfg.heart_beat_interval_ms));

        let deps = match (cli.heart_beat_id_list, file.heart_beat_id_list) {
            (Some(s), _) => Some(parse_hex_list(&s)?),
            (None, Some(list)) => Some(list.values()?),
            (None, None) => None,
        };
        if let Some(deps) = deps {
            if deps.len() > MAX_DEPENDENCIES {
                return Err(ConfigError::TooManyDependencies(deps.len()));
            }
            cfg.heart_beat_id_list = deps.into_iter().map(CouplerId).collect();
        }

        if let Some(url) = cli
            .network_address_url_data_type
            .or(file.network_address_url_data_type)
        {
            cfg.network_address_url = url;
        }
        if let Some(ifname) = cli.network_interface.or(file.network_interface) {
            cfg.network_interface = ifname;
        }
        if let Some(ids) = file.pubsub {
            cfg.pubsub = ids;
        }
        if let Some(mode) = cli.pulse_mode.or(file.pulse_mode) {
            cfg.pulse_mode = mode;
        }
        cfg.pulse_gpio = cli.pulse_gpio.or(file.pulse_gpio);

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slave_addresses.len() > MAX_BOARDS {
            return Err(ConfigError::TooManyAddresses(self.slave_addresses.len()));
        }
        if let Some(a) = self
            .slave_addresses
            .iter()
            .find(|a| u32::from(**a) > MAX_SLAVE_ADDRESS)
        {
            return Err(ConfigError::AddressOutOfRange(u32::from(*a)));
        }
        if self.heart_beat_id_list.len() > MAX_DEPENDENCIES {
            return Err(ConfigError::TooManyDependencies(
                self.heart_beat_id_list.len(),
            ));
        }
        if self.heart_beat_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("heart beat interval"));
        }
        if self.heart_beat_timeout_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("heart beat timeout interval"));
        }
        if self.heart_beat && self.id.is_unused() {
            return Err(ConfigError::MissingId);
        }
        Ok(())
    }

    /// Watched couplers, unused slots removed.
    pub fn dependencies(&self) -> Vec<CouplerId> {
        self.heart_beat_id_list
            .iter()
            .copied()
            .filter(|id| !id.is_unused())
            .collect()
    }

    /// Checking is on as soon as one real dependency is configured.
    pub fn heart_beat_check_enabled(&self) -> bool {
        self.heart_beat_id_list.iter().any(|id| !id.is_unused())
    }

    pub fn log_summary(&self) {
        let addresses: Vec<String> = self
            .slave_addresses
            .iter()
            .map(|a| format!("{a:#04x}"))
            .collect();
        info!(
            device = %self.device.display(),
            slave_addresses = %addresses.join(","),
            virtual_mode = self.virtual_mode,
            id = %self.id,
            "Configuration"
        );
        info!(
            heart_beat = self.heart_beat,
            interval_ms = self.heart_beat_interval_ms,
            timeout_ms = self.heart_beat_timeout_interval_ms,
            check = self.heart_beat_check_enabled(),
            dependencies = ?self.dependencies(),
            url = %self.network_address_url,
            interface = %self.network_interface,
            "Heart beat"
        );
        debug!(pubsub = ?self.pubsub, pulse_mode = ?self.pulse_mode, pulse_gpio = ?self.pulse_gpio);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper: write a YAML string to a temp file and return it.
    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    fn load(content: &str) -> ConfigFile {
        let f = yaml_tempfile(content);
        ConfigFile::load(f.path()).unwrap()
    }

    // ── hex parsing ───────────────────────────────────────────────────────────

    #[test]
    fn hex_tokens_with_and_without_prefix() {
        assert_eq!(parse_hex("0x58").unwrap(), 0x58);
        assert_eq!(parse_hex("58").unwrap(), 0x58);
        assert_eq!(parse_hex(" 7 ").unwrap(), 7);
        assert_eq!(parse_hex("10").unwrap(), 16, "dependency ids are hex");
        assert!(matches!(parse_hex("zz"), Err(ConfigError::InvalidHex(_))));
    }

    #[test]
    fn hex_list_skips_empty_tokens() {
        assert_eq!(parse_hex_list("0x58,0x59").unwrap(), vec![0x58, 0x59]);
        assert_eq!(parse_hex_list("").unwrap(), Vec::<u32>::new());
        assert_eq!(parse_hex_list("2,,3,").unwrap(), vec![2, 3]);
    }

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn defaults_without_file_or_cli() {
        let cfg = CouplerConfig::resolve(None, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.device, PathBuf::from("/dev/i2c-1"));
        assert_eq!(cfg.slave_addresses, vec![0x58]);
        assert!(!cfg.virtual_mode);
        assert_eq!(cfg.heart_beat_interval_ms, 250);
        assert_eq!(cfg.heart_beat_timeout_interval_ms, 1000);
        assert!(!cfg.heart_beat_check_enabled());
        assert_eq!(cfg.network_address_url, "opc.udp://224.0.0.22:4840/");
        assert_eq!(cfg.pubsub, PubSubIds::default());
    }

    #[test]
    fn timeout_follows_configured_interval() {
        let cli = ConfigOverrides {
            heart_beat_interval: Some(500),
            ..Default::default()
        };
        let cfg = CouplerConfig::resolve(None, cli).unwrap();
        assert_eq!(cfg.heart_beat_timeout_interval_ms, 2000);
    }

    // ── file layer ────────────────────────────────────────────────────────────

    #[test]
    fn load_full_yaml() {
        let yaml = r#"
device: /dev/i2c-2
slave_address_list: ["0x58", 0, "59"]
mode: 1
id: 3
heart_beat: true
heart_beat_interval: 100
heart_beat_timeout_interval: 700
heart_beat_id_list: "1,2"
network_address_url_data_type: opc.udp://239.0.0.1:5000/
network_interface: eth0
pubsub:
  writer_group_id: 7
pulse_mode: keep-alive
pulse_gpio: /sys/class/gpio/gpio17/value
"#;
        let cfg = CouplerConfig::resolve(Some(load(yaml)), ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.device, PathBuf::from("/dev/i2c-2"));
        assert_eq!(cfg.slave_addresses, vec![0x58, 0, 0x59]);
        assert!(cfg.virtual_mode);
        assert_eq!(cfg.id, CouplerId(3));
        assert_eq!(cfg.heart_beat_timeout_interval_ms, 700);
        assert_eq!(cfg.dependencies(), vec![CouplerId(1), CouplerId(2)]);
        assert_eq!(cfg.network_interface, "eth0");
        assert_eq!(cfg.pubsub.writer_group_id, 7);
        assert_eq!(cfg.pubsub.publisher_id, 2234, "unset pubsub keys keep defaults");
        assert_eq!(cfg.pulse_mode, PulseMode::KeepAlive);
    }

    #[test]
    fn cli_overrides_file() {
        let file = load("id: 3\nheart_beat_interval: 100\nslave_address_list: \"0x58\"\n");
        let cli = ConfigOverrides {
            id: Some(9),
            slave_address_list: Some("0x20,0x21".into()),
            ..Default::default()
        };
        let cfg = CouplerConfig::resolve(Some(file), cli).unwrap();
        assert_eq!(cfg.id, CouplerId(9));
        assert_eq!(cfg.slave_addresses, vec![0x20, 0x21]);
        assert_eq!(cfg.heart_beat_interval_ms, 100, "file value kept when CLI is silent");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let f = yaml_tempfile("devcie: /dev/i2c-1\n");
        assert!(matches!(
            ConfigFile::load(f.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_returns_error() {
        assert!(matches!(
            ConfigFile::load(Path::new("/nonexistent/path/coupler.yaml")),
            Err(ConfigError::Read { .. })
        ));
    }

    // ── validation ────────────────────────────────────────────────────────────

    #[test]
    fn too_many_addresses() {
        let cli = ConfigOverrides {
            slave_address_list: Some("1,2,3,4,5,6,7,8,9".into()),
            ..Default::default()
        };
        assert!(matches!(
            CouplerConfig::resolve(None, cli),
            Err(ConfigError::TooManyAddresses(9))
        ));
    }

    #[test]
    fn address_must_fit_seven_bits() {
        let cli = ConfigOverrides {
            slave_address_list: Some("0x80".into()),
            ..Default::default()
        };
        assert!(matches!(
            CouplerConfig::resolve(None, cli),
            Err(ConfigError::AddressOutOfRange(0x80))
        ));
    }

    #[test]
    fn too_many_dependencies() {
        let cli = ConfigOverrides {
            heart_beat_id_list: Some("1,2,3,4,5,6,7,8,9".into()),
            ..Default::default()
        };
        assert!(matches!(
            CouplerConfig::resolve(None, cli),
            Err(ConfigError::TooManyDependencies(9))
        ));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let cli = ConfigOverrides {
            heart_beat_interval: Some(0),
            heart_beat_timeout_interval: Some(1000),
            ..Default::default()
        };
        assert!(matches!(
            CouplerConfig::resolve(None, cli),
            Err(ConfigError::ZeroInterval(_))
        ));
        let cli = ConfigOverrides {
            heart_beat_timeout_interval: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            CouplerConfig::resolve(None, cli),
            Err(ConfigError::ZeroInterval(_))
        ));
    }

    #[test]
    fn publishing_requires_an_id() {
        let cli = ConfigOverrides {
            heart_beat: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            CouplerConfig::resolve(None, cli),
            Err(ConfigError::MissingId)
        ));
    }

    #[test]
    fn bad_mode_is_rejected() {
        let cli = ConfigOverrides {
            mode: Some(2),
            ..Default::default()
        };
        assert!(matches!(
            CouplerConfig::resolve(None, cli),
            Err(ConfigError::InvalidMode(2))
        ));
    }

    #[test]
    fn zero_only_list_disables_checking() {
        let cli = ConfigOverrides {
            heart_beat_id_list: Some("0,0".into()),
            ..Default::default()
        };
        let cfg = CouplerConfig::resolve(None, cli).unwrap();
        assert!(!cfg.heart_beat_check_enabled());
        assert!(cfg.dependencies().is_empty());
    }
}
