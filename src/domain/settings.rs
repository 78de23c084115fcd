use crate::domain::models::{MacAddress, Tracker, MAX_TRACKERS};
use crate::infrastructure::bluetooth::protocol;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Built-in puck addresses used when no configuration has been saved.
pub const DEFAULT_MAC_ADDRESSES: [MacAddress; MAX_TRACKERS] = [
    MacAddress::new([0x3C, 0x38, 0xF4, 0xB4, 0x95, 0x01]),
    MacAddress::new([0x3C, 0x38, 0xF4, 0xB4, 0x95, 0x02]),
    MacAddress::new([0x3C, 0x38, 0xF4, 0xB4, 0x95, 0x03]),
    MacAddress::new([0x3C, 0x38, 0xF4, 0xB4, 0x95, 0x04]),
    MacAddress::new([0x3C, 0x38, 0xF4, 0xB4, 0x95, 0x05]),
    MacAddress::new([0x3C, 0x38, 0xF4, 0xB4, 0x95, 0x06]),
];

pub const CONFIG_FILE_NAME: &str = "config_six.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Receiving server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_address")]
    pub address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_handshake_delay_ms")]
    pub handshake_delay_ms: u64,
    #[serde(default = "default_notification_queue_depth")]
    pub notification_queue_depth: usize,
    #[serde(default = "default_data_uuid")]
    pub data_char_uuid: String,
    #[serde(default = "default_command_uuid")]
    pub command_char_uuid: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            handshake_delay_ms: default_handshake_delay_ms(),
            notification_queue_depth: default_notification_queue_depth(),
            data_char_uuid: default_data_uuid(),
            command_char_uuid: default_command_uuid(),
        }
    }
}

/// Identity the bridge reports in its handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareSettings {
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,
    #[serde(default = "default_firmware_version")]
    pub version: String,
}

impl Default for FirmwareSettings {
    fn default() -> Self {
        Self {
            bridge_name: default_bridge_name(),
            version: default_firmware_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_trackers")]
    pub trackers: Vec<String>,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub firmware: FirmwareSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            trackers: default_trackers(),
            server: ServerSettings::default(),
            connection: ConnectionSettings::default(),
            firmware: FirmwareSettings::default(),
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Resolve the six tracker identities.
    ///
    /// Missing or unparsable slots fall back to the built-in address for that
    /// slot; extra entries are ignored.
    pub fn tracker_list(&self) -> Vec<Tracker> {
        (0..MAX_TRACKERS)
            .map(|slot| {
                let address = self
                    .trackers
                    .get(slot)
                    .and_then(|text| match text.parse::<MacAddress>() {
                        Ok(mac) => Some(mac),
                        Err(e) => {
                            warn!("Tracker #{} has an invalid address, using default: {}", slot, e);
                            None
                        }
                    })
                    .unwrap_or(DEFAULT_MAC_ADDRESSES[slot]);
                Tracker {
                    sensor_id: slot as u8,
                    address,
                }
            })
            .collect()
    }

    pub fn set_trackers(&mut self, trackers: &[Tracker]) {
        self.trackers = trackers.iter().map(|t| t.address.to_string()).collect();
    }
}

fn default_trackers() -> Vec<String> {
    DEFAULT_MAC_ADDRESSES.iter().map(|mac| mac.to_string()).collect()
}
fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "moslime".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_server_address() -> String {
    "127.0.0.1:6969".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    2_000
}
fn default_handshake_delay_ms() -> u64 {
    300
}
fn default_notification_queue_depth() -> usize {
    32
}
fn default_data_uuid() -> String {
    protocol::DATA_CHAR_UUID.to_string()
}
fn default_command_uuid() -> String {
    protocol::COMMAND_CHAR_UUID.to_string()
}
fn default_bridge_name() -> String {
    "MoSlime".to_string()
}
fn default_firmware_version() -> String {
    "1.0.0".to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user configuration directory.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Self::open(settings_path)
    }

    /// Load from an explicit path. A missing file yields the defaults.
    pub fn open(settings_path: PathBuf) -> anyhow::Result<Self> {
        let settings = match Self::load_from_file(&settings_path)? {
            Some(settings) => {
                info!("Loaded configuration from {}", settings_path.display());
                settings
            }
            None => {
                info!(
                    "No configuration at {}, using default tracker addresses",
                    settings_path.display()
                );
                Settings::default()
            }
        };

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("MoSlime");
        path.push(CONFIG_FILE_NAME);
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Option<Settings>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let settings = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(Some(settings))
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)
            .with_context(|| format!("Failed to write {}", self.settings_path.display()))?;
        info!("Configuration saved to {}", self.settings_path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
