//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use relay_presence::config::{ConfigError, RelayConfig};
use relay_presence::presence::StickinessPolicy;
use relay_presence::protocol::PayloadCase;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://broker.hivemq.com:1883"
client_id_prefix = "dashboard"

[topics]
base = "smarthome"
presence = "smarthome/device/esp32s2mini/presence"
command_suffix = "perintah"
payload_case = "lower"

[presence]
heartbeat_interval_secs = 10
timeout_secs = 25
tick_interval_ms = 1000
stickiness = "relaxed"

[[channels]]
id = "lampu1"
name = "Lampu Teras"

[[channels]]
id = "stopkontak1"
"#,
    );

    let config = RelayConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.broker_url, "mqtt://broker.hivemq.com:1883");
    assert_eq!(config.mqtt.client_id_prefix, "dashboard");
    assert_eq!(config.topics.payload_case, PayloadCase::Lower);
    assert_eq!(config.presence.timeout_threshold(), Duration::from_secs(25));
    assert_eq!(config.presence.tick_interval(), Duration::from_secs(1));
    assert_eq!(config.presence.stickiness, StickinessPolicy::Relaxed);
    assert_eq!(config.channel_ids(), vec!["lampu1", "stopkontak1"]);
    assert_eq!(config.channel_name("lampu1"), "Lampu Teras");
    assert_eq!(config.channel_name("stopkontak1"), "stopkontak1");

    let layout = config.layout();
    assert_eq!(layout.command_topic("lampu1"), "smarthome/lampu1/perintah");
    assert_eq!(layout.status_filter(), "smarthome/+/status");
}

#[test]
fn test_config_defaults_match_deployed_device() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );

    let config = RelayConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.topics.base, "smarthome");
    assert_eq!(config.topics.presence, "smarthome/device/esp32s2mini/presence");
    assert_eq!(config.topics.command_suffix, "command");
    assert_eq!(config.presence.heartbeat_interval(), Duration::from_secs(10));
    assert_eq!(config.presence.timeout_threshold(), Duration::from_secs(20));
    assert_eq!(config.presence.tick_interval(), Duration::from_secs(2));
    assert_eq!(config.presence.stickiness, StickinessPolicy::Strict);
    assert_eq!(config.mqtt.reconnect.backoff_ms, vec![250, 500, 1000, 2000]);
    assert!(config.channels.is_empty());
}

#[test]
fn test_config_fails_with_missing_file() {
    let result = RelayConfig::load_from_file(std::path::Path::new("/nonexistent/relay.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_fails_with_invalid_toml() {
    let temp_file = write_config("[mqtt\nbroker_url = ");
    let result = RelayConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_fails_without_mqtt_section() {
    let temp_file = write_config("[presence]\nheartbeat_interval_secs = 5\n");
    let result = RelayConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_timeout_must_exceed_heartbeat_interval() {
    for timeout in [5, 10] {
        let temp_file = write_config(&format!(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[presence]
heartbeat_interval_secs = 10
timeout_secs = {timeout}
"#
        ));
        let result = RelayConfig::load_from_file(temp_file.path());
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(ref msg)) if msg.contains("timeout")),
            "timeout {timeout}s should be rejected: {result:?}"
        );
    }
}

#[test]
fn test_slow_tick_is_accepted() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[presence]
heartbeat_interval_secs = 10
tick_interval_ms = 15000
"#,
    );
    assert!(RelayConfig::load_from_file(temp_file.path()).is_ok());
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        ("broker_url = \"http://localhost\"", "", "scheme"),
        ("broker_url = \"mqtt://localhost\"\nkeep_alive_secs = 0", "", "keep_alive"),
        (
            "broker_url = \"mqtt://localhost\"\n[mqtt.reconnect]\nmax_attempts = 0",
            "",
            "reconnect",
        ),
        (
            "broker_url = \"mqtt://localhost\"",
            "[topics]\nstatus_suffix = \"state/now\"",
            "single topic level",
        ),
        (
            "broker_url = \"mqtt://localhost\"",
            "[topics]\ncommand_suffix = \"status\"",
            "must differ",
        ),
        (
            "broker_url = \"mqtt://localhost\"",
            "[[channels]]\nid = \"lampu1\"\n[[channels]]\nid = \"lampu1\"",
            "more than once",
        ),
    ];

    for (mqtt, rest, expected) in cases {
        let temp_file = write_config(&format!("[mqtt]\n{mqtt}\n{rest}\n"));
        match RelayConfig::load_from_file(temp_file.path()) {
            Err(ConfigError::InvalidConfig(msg)) => {
                assert!(msg.contains(expected), "'{msg}' should mention '{expected}'")
            }
            other => panic!("expected InvalidConfig mentioning '{expected}', got {other:?}"),
        }
    }
}

#[test]
fn test_wildcards_in_topics_are_rejected() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[topics]
presence = "smarthome/+/presence"
"#,
    );
    let result = RelayConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidTopic(_))));
}

#[test]
fn test_invalid_channel_id_is_rejected() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[[channels]]
id = "lampu 1"
"#,
    );
    let result = RelayConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidChannelId(_))));
}

#[test]
fn test_config_round_trips_through_toml() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtts://broker.example.com"
username_env = "RELAY_MQTT_USER"

[[channels]]
id = "lampu1"
name = "Lampu Teras"
"#,
    );
    let config = RelayConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = RelayConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}
