use gateway::config::{load_config_from_path, load_config_from_str, StartFrom};
use std::io::Write;

#[test]
fn full_config_loads_every_section() {
    let toml = r#"
[server]
device_instance = 4001
device_name = "Building A Gateway"
device_description = "presence gateway for building A"
vendor_id = 999
vendor_name = "Acme"
model_name = "gw-1000"
application_software_version = "1.0.0"
location = "Building A"
cov_lifetime = 7200
max_cov_subscriptions = 500

[secure-transport]
enabled = true
hub_uri = "wss://hub.example.com/bacnet"

[legacy-transport]
port = 47808

[event-store]
connection_string = "wss://events.example.com/streams"
tls_enabled = true
reconnect_delay_ms = 500
max_reconnect_attempts = 10

[cache]
host = "redis.internal"
port = 6380
database = 2

[[devices]]
subscription_id = "building-a"
stream_name = "telemetry"
group_name = "gateway"
start_from = "position"
start_position = 42
object_instance_offset = 1000

[logging]
level = "debug"
format = "json"

[health]
port = 9191
"#;
    let cfg = load_config_from_str(toml).unwrap();
    assert_eq!(cfg.server.device_instance, 4001);
    assert_eq!(cfg.server.max_cov_subscriptions, 500);
    assert!(cfg.secure_transport.enabled);
    assert_eq!(cfg.legacy_transport.port, 47808);
    assert_eq!(cfg.event_store.max_reconnect_attempts, Some(10));
    assert_eq!(cfg.cache.port, 6380);
    assert_eq!(cfg.devices.len(), 1);
    assert_eq!(cfg.devices[0].start_from, StartFrom::Position);
    assert_eq!(cfg.devices[0].start_position, 42);
    assert_eq!(cfg.devices[0].object_instance_offset, 1000);
    assert_eq!(cfg.health.port, 9191);
}

#[test]
fn load_config_from_path_reads_a_real_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[server]
device_instance = 1
device_name = "g"
[event-store]
connection_string = "ws://localhost:1"
[[devices]]
subscription_id = "s"
stream_name = "t"
"#
    )
    .unwrap();
    let cfg = load_config_from_path(file.path()).unwrap();
    assert_eq!(cfg.server.device_instance, 1);
}

#[test]
fn missing_file_is_an_io_error() {
    let err = load_config_from_path(std::path::Path::new("/nonexistent/gateway.toml")).unwrap_err();
    assert!(matches!(err, gateway::config::ConfigError::Io(_)));
}
