//! Configuration Vault – reads/writes `~/.skylink/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use skylink_middleware::{BridgeConfig, BrokerTarget, TopicSet};

/// Persisted operator configuration stored in `~/.skylink/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// MQTT broker hostname.
    #[serde(default = "default_broker_host")]
    pub broker_host: String,

    #[serde(default = "default_broker_port")]
    pub broker_port: u16,

    /// MQTT keepalive interval in seconds.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u16,

    #[serde(default = "default_command_topic")]
    pub command_topic: String,

    #[serde(default = "default_status_topic")]
    pub status_topic: String,

    #[serde(default = "default_telemetry_topic")]
    pub telemetry_topic: String,

    /// Identifier stamped into every command as `source`.
    #[serde(default = "default_source")]
    pub source: String,

    /// Pause between disconnect and connect on `/reconnect`.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Number of log lines shown by `/logs`.
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,
}

fn default_broker_host() -> String {
    "broker.emqx.io".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_keepalive_secs() -> u16 {
    60
}
fn default_command_topic() -> String {
    "mavsdk/command".to_string()
}
fn default_status_topic() -> String {
    "mavsdk/status".to_string()
}
fn default_telemetry_topic() -> String {
    "mavsdk/telemetry".to_string()
}
fn default_source() -> String {
    "skylink-cli".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_log_lines() -> usize {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            keepalive_secs: default_keepalive_secs(),
            command_topic: default_command_topic(),
            status_topic: default_status_topic(),
            telemetry_topic: default_telemetry_topic(),
            source: default_source(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            log_lines: default_log_lines(),
        }
    }
}

impl Config {
    /// Translate into the bridge's runtime configuration.
    ///
    /// The MQTT client id is derived fresh on every call
    /// (`skylink_<unix seconds>`).
    pub fn bridge_config(&self) -> BridgeConfig {
        let target = BrokerTarget::new(&self.broker_host, self.broker_port, self.keepalive_secs)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        BridgeConfig {
            target,
            source: self.source.clone(),
            topics: TopicSet {
                command: self.command_topic.clone(),
                status: self.status_topic.clone(),
                telemetry: self.telemetry_topic.clone(),
            },
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            ..BridgeConfig::default()
        }
    }
}

/// Return the path to `~/.skylink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".skylink").join("config.toml")
}

/// Load the config from disk and apply environment overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    Ok(load_from(&config_path())?.map(|mut cfg| {
        apply_env_overrides(&mut cfg);
        cfg
    }))
}

/// Load the config from a specific path, without environment overrides.
pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `SKYLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SKYLINK_BROKER_HOST` | `broker_host` |
/// | `SKYLINK_BROKER_PORT` | `broker_port` |
/// | `SKYLINK_KEEPALIVE_SECS` | `keepalive_secs` |
/// | `SKYLINK_SOURCE` | `source` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SKYLINK_BROKER_HOST") {
        cfg.broker_host = v;
    }
    if let Ok(v) = std::env::var("SKYLINK_BROKER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.broker_port = port;
    }
    if let Ok(v) = std::env::var("SKYLINK_KEEPALIVE_SECS")
        && let Ok(secs) = v.parse::<u16>()
    {
        cfg.keepalive_secs = secs;
    }
    if let Ok(v) = std::env::var("SKYLINK_SOURCE") {
        cfg.source = v;
    }
}

/// Save the config to disk, creating `~/.skylink/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_public_test_broker() {
        let cfg = Config::default();
        assert_eq!(cfg.broker_host, "broker.emqx.io");
        assert_eq!(cfg.broker_port, 1883);
        assert_eq!(cfg.keepalive_secs, 60);
        assert_eq!(cfg.log_lines, 20);
    }

    #[test]
    fn bridge_config_carries_every_field() {
        let cfg = Config {
            broker_host: "10.0.0.7".to_string(),
            broker_port: 8883,
            keepalive_secs: 30,
            command_topic: "uav1/cmd".to_string(),
            status_topic: "uav1/status".to_string(),
            telemetry_topic: "uav1/telem".to_string(),
            source: "ground-station".to_string(),
            reconnect_delay_ms: 250,
            connect_timeout_secs: 3,
            log_lines: 50,
        };
        let bridge = cfg.bridge_config();
        assert_eq!(bridge.target.addr(), "10.0.0.7:8883");
        assert_eq!(bridge.target.keepalive_secs, 30);
        assert_eq!(bridge.target.connect_timeout, Duration::from_secs(3));
        assert_eq!(bridge.topics.command, "uav1/cmd");
        assert_eq!(bridge.topics.subscriptions(), vec!["uav1/status", "uav1/telem"]);
        assert_eq!(bridge.source, "ground-station");
        assert_eq!(bridge.reconnect_delay, Duration::from_millis(250));
        assert!(bridge.client_id.starts_with("skylink_"));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "broker_host = \"mqtt.local\"\n").unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.broker_host, "mqtt.local");
        assert_eq!(cfg.broker_port, 1883);
        assert_eq!(cfg.status_topic, "mavsdk/status");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "broker_port = \"not a number\"").unwrap();

        let err = load_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            broker_host: "mqtt.field.local".to_string(),
            log_lines: 40,
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.broker_host, "mqtt.field.local");
        assert_eq!(loaded.log_lines, 40);
        assert_eq!(loaded.command_topic, "mavsdk/command");
    }

    #[test]
    fn config_path_points_to_skylink_dir() {
        let p = config_path_for_home("/home/pilot");
        assert!(p.to_string_lossy().contains(".skylink"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    // Env-var tests share process state; each uses its own variable.

    #[test]
    fn apply_env_overrides_changes_broker_host() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SKYLINK_BROKER_HOST", "mqtt.override.local") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker_host, "mqtt.override.local");
        unsafe { std::env::remove_var("SKYLINK_BROKER_HOST") };
    }

    #[test]
    fn apply_env_overrides_changes_port() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SKYLINK_BROKER_PORT", "8883") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker_port, 8883);
        unsafe { std::env::remove_var("SKYLINK_BROKER_PORT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_keepalive() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SKYLINK_KEEPALIVE_SECS", "forever") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.keepalive_secs, 60);
        unsafe { std::env::remove_var("SKYLINK_KEEPALIVE_SECS") };
    }

    #[test]
    fn apply_env_overrides_changes_source() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SKYLINK_SOURCE", "ops-console-2") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.source, "ops-console-2");
        unsafe { std::env::remove_var("SKYLINK_SOURCE") };
    }
}
