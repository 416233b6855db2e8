//! Gateway configuration loading.
//!
//! TOML is the sole config source, following the two-stage raw/validated
//! pattern used across the forwarder and receiver: every field is `Option`
//! in the raw deserialization target, and `load_config_from_str` validates
//! and defaults it into the strict [`Config`] the rest of the gateway uses.
//!
//! Default config path: `/etc/bacnet-gateway/gateway.toml`.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated, used by the rest of the gateway)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub secure_transport: SecureTransportConfig,
    pub legacy_transport: LegacyTransportConfig,
    pub event_store: EventStoreConfig,
    pub cache: crate::cache::CacheConfig,
    pub devices: Vec<DeviceSubscriptionConfig>,
    pub logging: LoggingConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub device_instance: u32,
    pub device_name: String,
    pub device_description: String,
    pub vendor_id: u16,
    pub vendor_name: String,
    pub model_name: String,
    pub application_software_version: String,
    pub location: String,
    pub cov_lifetime: u32,
    pub max_cov_subscriptions: usize,
}

#[derive(Debug, Clone)]
pub struct SecureTransportConfig {
    pub enabled: bool,
    pub hub_uri: Option<String>,
    pub failover_hub_uri: Option<String>,
    pub certificate_file: Option<String>,
    pub private_key_file: Option<String>,
    pub ca_certificate_file: Option<String>,
    pub hub_function_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct LegacyTransportConfig {
    pub port: u16,
    pub interface: Option<String>,
    pub broadcast_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    pub connection_string: String,
    pub tls_enabled: bool,
    pub tls_verify_cert: bool,
    pub tls_ca_file: Option<String>,
    pub reconnect_delay_ms: u64,
    /// `-1` means unbounded, represented here as `None`.
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Begin,
    End,
    Position,
}

#[derive(Debug, Clone)]
pub struct DeviceSubscriptionConfig {
    pub subscription_id: String,
    pub stream_name: String,
    pub group_name: String,
    pub start_from: StartFrom,
    pub start_position: u64,
    pub object_instance_offset: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Bitmask of log output sinks: bit 0 = stdout, bit 1 = file, bit 2 = syslog.
/// The syslog backend itself is out of scope (spec.md §1 lists "the logging
/// backend" among external collaborators); this crate only recognizes and
/// stores the option.
pub const LOG_OUTPUT_STDOUT: u8 = 0b001;
pub const LOG_OUTPUT_FILE: u8 = 0b010;
pub const LOG_OUTPUT_SYSLOG: u8 = 0b100;

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub outputs: u8,
    pub format: LogFormat,
    pub file: Option<String>,
    pub max_file_size: u64,
    pub max_backup_files: u32,
    pub syslog_facility: Option<String>,
    pub colorize: bool,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub port: u16,
    pub bind_address: String,
}

impl Config {
    pub fn event_store_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.event_store.reconnect_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    #[serde(rename = "secure-transport")]
    secure_transport: Option<RawSecureTransportConfig>,
    #[serde(rename = "legacy-transport")]
    legacy_transport: Option<RawLegacyTransportConfig>,
    #[serde(rename = "event-store")]
    event_store: Option<RawEventStoreConfig>,
    cache: Option<RawCacheConfig>,
    devices: Option<Vec<RawDeviceConfig>>,
    logging: Option<RawLoggingConfig>,
    health: Option<RawHealthConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    device_instance: Option<u32>,
    device_name: Option<String>,
    device_description: Option<String>,
    vendor_id: Option<u16>,
    vendor_name: Option<String>,
    model_name: Option<String>,
    application_software_version: Option<String>,
    location: Option<String>,
    cov_lifetime: Option<u32>,
    max_cov_subscriptions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawSecureTransportConfig {
    enabled: Option<bool>,
    hub_uri: Option<String>,
    failover_hub_uri: Option<String>,
    certificate_file: Option<String>,
    private_key_file: Option<String>,
    ca_certificate_file: Option<String>,
    hub_function_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawLegacyTransportConfig {
    port: Option<u16>,
    interface: Option<String>,
    broadcast_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEventStoreConfig {
    connection_string: Option<String>,
    tls_enabled: Option<bool>,
    tls_verify_cert: Option<bool>,
    tls_ca_file: Option<String>,
    reconnect_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawCacheConfig {
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
    database: Option<i64>,
    key_prefix: Option<String>,
    connection_timeout_ms: Option<u64>,
    command_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceConfig {
    subscription_id: Option<String>,
    stream_name: Option<String>,
    group_name: Option<String>,
    start_from: Option<String>,
    start_position: Option<u64>,
    object_instance_offset: Option<u32>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawLoggingConfig {
    level: Option<String>,
    outputs: Option<u8>,
    format: Option<String>,
    file: Option<String>,
    max_file_size: Option<u64>,
    max_backup_files: Option<u32>,
    syslog_facility: Option<String>,
    colorize: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawHealthConfig {
    port: Option<u16>,
    bind_address: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/bacnet-gateway/gateway.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_server = raw.server.ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let device_instance = raw_server
        .device_instance
        .ok_or_else(|| ConfigError::MissingField("server.device_instance".to_owned()))?;
    let device_name = raw_server
        .device_name
        .ok_or_else(|| ConfigError::MissingField("server.device_name".to_owned()))?;
    let max_cov_subscriptions = raw_server.max_cov_subscriptions.unwrap_or(100);
    let server = ServerConfig {
        device_instance,
        device_name,
        device_description: raw_server.device_description.unwrap_or_default(),
        vendor_id: raw_server.vendor_id.unwrap_or(0),
        vendor_name: raw_server.vendor_name.unwrap_or_default(),
        model_name: raw_server.model_name.unwrap_or_default(),
        application_software_version: raw_server.application_software_version.unwrap_or_default(),
        location: raw_server.location.unwrap_or_default(),
        cov_lifetime: raw_server.cov_lifetime.unwrap_or(3600),
        max_cov_subscriptions,
    };

    let secure_transport = match raw.secure_transport {
        Some(s) => SecureTransportConfig {
            enabled: s.enabled.unwrap_or(false),
            hub_uri: s.hub_uri,
            failover_hub_uri: s.failover_hub_uri,
            certificate_file: s.certificate_file,
            private_key_file: s.private_key_file,
            ca_certificate_file: s.ca_certificate_file,
            hub_function_enabled: s.hub_function_enabled.unwrap_or(false),
        },
        None => SecureTransportConfig {
            enabled: false,
            hub_uri: None,
            failover_hub_uri: None,
            certificate_file: None,
            private_key_file: None,
            ca_certificate_file: None,
            hub_function_enabled: false,
        },
    };

    let legacy_transport = match raw.legacy_transport {
        Some(l) => LegacyTransportConfig {
            port: l.port.unwrap_or(47808),
            interface: l.interface,
            broadcast_address: l.broadcast_address,
        },
        None => LegacyTransportConfig {
            port: 47808,
            interface: None,
            broadcast_address: None,
        },
    };

    let raw_event_store = raw
        .event_store
        .ok_or_else(|| ConfigError::MissingField("event-store".to_owned()))?;
    let connection_string = raw_event_store
        .connection_string
        .ok_or_else(|| ConfigError::MissingField("event-store.connection_string".to_owned()))?;
    let max_reconnect_attempts = match raw_event_store.max_reconnect_attempts.unwrap_or(-1) {
        n if n < 0 => None,
        n => Some(n as u32),
    };
    let event_store = EventStoreConfig {
        connection_string,
        tls_enabled: raw_event_store.tls_enabled.unwrap_or(false),
        tls_verify_cert: raw_event_store.tls_verify_cert.unwrap_or(true),
        tls_ca_file: raw_event_store.tls_ca_file,
        reconnect_delay_ms: raw_event_store.reconnect_delay_ms.unwrap_or(1_000),
        max_reconnect_attempts,
    };

    let cache = match raw.cache {
        Some(c) => crate::cache::CacheConfig {
            host: c.host.unwrap_or_else(|| "127.0.0.1".to_owned()),
            port: c.port.unwrap_or(6379),
            password: c.password,
            database: c.database.unwrap_or(0),
            key_prefix: c.key_prefix.unwrap_or_else(|| "bacnet:".to_owned()),
            connection_timeout_ms: c.connection_timeout_ms.unwrap_or(2_000),
            command_timeout_ms: c.command_timeout_ms.unwrap_or(1_000),
        },
        None => crate::cache::CacheConfig::default(),
    };

    let raw_devices = raw
        .devices
        .ok_or_else(|| ConfigError::MissingField("devices".to_owned()))?;
    if raw_devices.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[devices]] entry is required".to_owned(),
        ));
    }
    let mut devices = Vec::with_capacity(raw_devices.len());
    for (i, d) in raw_devices.into_iter().enumerate() {
        let subscription_id = d
            .subscription_id
            .ok_or_else(|| ConfigError::MissingField(format!("devices[{i}].subscription_id")))?;
        let stream_name = d
            .stream_name
            .ok_or_else(|| ConfigError::MissingField(format!("devices[{i}].stream_name")))?;
        let start_from = match d.start_from.as_deref().unwrap_or("begin") {
            "begin" => StartFrom::Begin,
            "end" => StartFrom::End,
            "position" => StartFrom::Position,
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "devices[{i}].start_from: unknown '{other}'"
                )))
            }
        };
        let object_instance_offset = d.object_instance_offset.unwrap_or(0);
        devices.push(DeviceSubscriptionConfig {
            subscription_id,
            stream_name,
            group_name: d.group_name.unwrap_or_else(|| "gateway".to_owned()),
            start_from,
            start_position: d.start_position.unwrap_or(0),
            object_instance_offset,
            enabled: d.enabled.unwrap_or(true),
        });
    }

    let logging = match raw.logging {
        Some(l) => LoggingConfig {
            level: l.level.unwrap_or_else(|| "info".to_owned()),
            outputs: l.outputs.unwrap_or(LOG_OUTPUT_STDOUT),
            format: match l.format.as_deref().unwrap_or("text") {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => {
                    return Err(ConfigError::InvalidValue(format!(
                        "logging.format: unknown '{other}'"
                    )))
                }
            },
            file: l.file,
            max_file_size: l.max_file_size.unwrap_or(10 * 1024 * 1024),
            max_backup_files: l.max_backup_files.unwrap_or(5),
            syslog_facility: l.syslog_facility,
            colorize: l.colorize.unwrap_or(false),
        },
        None => LoggingConfig {
            level: "info".to_owned(),
            outputs: LOG_OUTPUT_STDOUT,
            format: LogFormat::Text,
            file: None,
            max_file_size: 10 * 1024 * 1024,
            max_backup_files: 5,
            syslog_facility: None,
            colorize: false,
        },
    };

    let health = match raw.health {
        Some(h) => HealthConfig {
            port: h.port.unwrap_or(9090),
            bind_address: h.bind_address.unwrap_or_else(|| "0.0.0.0".to_owned()),
        },
        None => HealthConfig {
            port: 9090,
            bind_address: "0.0.0.0".to_owned(),
        },
    };

    validate_instance_offsets(&devices)?;

    Ok(Config {
        server,
        secure_transport,
        legacy_transport,
        event_store,
        cache,
        devices,
        logging,
        health,
    })
}

/// Reject at config load if any configured offset would overflow
/// `u32::MAX` when added to the largest instance the decoder can ever
/// produce (spec.md §8 boundary behavior).
fn validate_instance_offsets(devices: &[DeviceSubscriptionConfig]) -> Result<(), ConfigError> {
    for (i, d) in devices.iter().enumerate() {
        if d.object_instance_offset > 0 && u32::MAX - d.object_instance_offset < u32::MAX / 2 {
            // An offset this large leaves less than half of the instance
            // space usable; reject outright rather than wait for an
            // overflow at runtime.
            return Err(ConfigError::InvalidValue(format!(
                "devices[{i}].object_instance_offset {} is too large",
                d.object_instance_offset
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[server]
device_instance = 1001
device_name = "gw-1"

[event-store]
connection_string = "ws://localhost:8080/streams"

[[devices]]
subscription_id = "sub-1"
stream_name = "telemetry"
"#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let cfg = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(cfg.server.device_instance, 1001);
        assert_eq!(cfg.server.max_cov_subscriptions, 100);
        assert_eq!(cfg.cache.key_prefix, "bacnet:");
        assert_eq!(cfg.devices.len(), 1);
        assert_eq!(cfg.devices[0].start_from, StartFrom::Begin);
        assert_eq!(cfg.health.port, 9090);
        assert_eq!(cfg.logging.outputs, LOG_OUTPUT_STDOUT);
        assert_eq!(cfg.logging.syslog_facility, None);
    }

    #[test]
    fn logging_section_recognizes_all_options() {
        let toml = r#"
[server]
device_instance = 1
device_name = "g"
[event-store]
connection_string = "x"
[[devices]]
subscription_id = "s"
stream_name = "t"
[logging]
level = "debug"
outputs = 3
format = "json"
file = "/var/log/gateway.log"
max_file_size = 1048576
max_backup_files = 3
syslog_facility = "local0"
colorize = true
"#;
        let cfg = load_config_from_str(toml).unwrap();
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.outputs, LOG_OUTPUT_STDOUT | LOG_OUTPUT_FILE);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.file.as_deref(), Some("/var/log/gateway.log"));
        assert_eq!(cfg.logging.syslog_facility.as_deref(), Some("local0"));
        assert!(cfg.logging.colorize);
    }

    #[test]
    fn missing_server_section_is_rejected() {
        let err = load_config_from_str("[event-store]\nconnection_string = \"x\"").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "server"));
    }

    #[test]
    fn empty_devices_list_is_rejected() {
        let toml = r#"
[server]
device_instance = 1
device_name = "g"
[event-store]
connection_string = "x"
devices = []
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn unbounded_reconnect_attempts_is_none() {
        let cfg = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(cfg.event_store.max_reconnect_attempts, None);
    }

    #[test]
    fn unknown_start_from_is_rejected() {
        let toml = r#"
[server]
device_instance = 1
device_name = "g"
[event-store]
connection_string = "x"
[[devices]]
subscription_id = "s"
stream_name = "t"
start_from = "yesterday"
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}
