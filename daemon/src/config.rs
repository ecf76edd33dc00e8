use anyhow::{Context, bail};
use cdh_shared::{Catalog, MessageKind};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const CONFIG_PATH_ENV: &str = "CDH_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub client_socket_path: PathBuf,
    pub monitor_socket_path: PathBuf,
    pub driver_path: PathBuf,
    pub link_timeout_ms: u64,
    pub link_retries: u8,
    pub available_commands: Vec<u8>,
    pub source_tag: String,
    pub command_poll_ms: u64,
    pub reply_wait_ms: u64,
    pub sink_pop_wait_ms: u64,
    pub sink_capacity: usize,
    pub monitor_retry_secs: u64,
    pub local_log_enabled: bool,
    pub local_log_path: PathBuf,
    pub local_log_retry_secs: u64,
    pub join_timeout_secs: u64,
    pub liveness_interval_ms: u64,
    pub housekeeping: HousekeepingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HousekeepingConfig {
    pub enabled: bool,
    pub period_secs: u64,
    pub i2c_bus: u8,
    pub i2c_address: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            client_socket_path: PathBuf::from("/tmp/CDH.sock"),
            monitor_socket_path: PathBuf::from("/tmp/telegraf.sock"),
            driver_path: PathBuf::from("./serial/serialInterface.so"),
            link_timeout_ms: 100,
            link_retries: 2,
            available_commands: vec![0, 1],
            source_tag: "ADCS".to_string(),
            command_poll_ms: 20,
            reply_wait_ms: 100,
            sink_pop_wait_ms: 50,
            sink_capacity: 1024,
            monitor_retry_secs: 3,
            local_log_enabled: false,
            local_log_path: PathBuf::from("./data/telemetry_log.db"),
            local_log_retry_secs: 3,
            join_timeout_secs: 3,
            liveness_interval_ms: 1000,
            housekeeping: HousekeepingConfig::default(),
        }
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period_secs: 5,
            i2c_bus: 1,
            i2c_address: 0x48,
        }
    }
}

/// Parse one override; `Ok(None)` when the variable is unset.
fn parse_override<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value {raw:?} for {key}: {e}")),
    }
}

fn parse_bool_override(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> anyhow::Result<Option<bool>> {
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(None),
        Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some("0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(other) => bail!("invalid value {other:?} for {key}: expected a boolean"),
    }
}

fn parse_code_list(raw: &str) -> anyhow::Result<Vec<u8>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u8>()
                .with_context(|| format!("invalid command code {s:?}"))
        })
        .collect()
}

impl DaemonConfig {
    /// Defaults, then the file named by `CDH_CONFIG_PATH`, then env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// A missing file means defaults; an unreadable or malformed one is an error.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(?path, "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config file {path:?}"));
            }
        };
        Self::from_json(&raw).with_context(|| format!("invalid config file {path:?}"))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = parse_override(&lookup, "CDH_CLIENT_SOCKET")? {
            self.client_socket_path = v;
        }
        if let Some(v) = parse_override(&lookup, "CDH_MONITOR_SOCKET")? {
            self.monitor_socket_path = v;
        }
        if let Some(v) = parse_override(&lookup, "CDH_DRIVER_PATH")? {
            self.driver_path = v;
        }
        if let Some(v) = parse_override(&lookup, "CDH_LINK_TIMEOUT_MS")? {
            self.link_timeout_ms = v;
        }
        if let Some(v) = parse_override(&lookup, "CDH_LINK_RETRIES")? {
            self.link_retries = v;
        }
        if let Some(raw) = lookup("CDH_AVAILABLE_COMMANDS") {
            self.available_commands =
                parse_code_list(&raw).context("invalid value for CDH_AVAILABLE_COMMANDS")?;
        }
        if let Some(v) = parse_override(&lookup, "CDH_SOURCE_TAG")? {
            self.source_tag = v;
        }
        if let Some(v) = parse_override(&lookup, "CDH_SINK_CAPACITY")? {
            self.sink_capacity = v;
        }
        if let Some(v) = parse_bool_override(&lookup, "CDH_LOCAL_LOG")? {
            self.local_log_enabled = v;
        }
        if let Some(v) = parse_override(&lookup, "CDH_LOCAL_LOG_PATH")? {
            self.local_log_path = v;
        }
        if let Some(v) = parse_bool_override(&lookup, "CDH_HOUSEKEEPING")? {
            self.housekeeping.enabled = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.link_timeout_ms == 0 {
            bail!("link_timeout_ms must be positive");
        }
        if self.sink_capacity == 0 {
            bail!("sink_capacity must be positive");
        }
        if self.liveness_interval_ms == 0 || self.command_poll_ms == 0 {
            bail!("liveness_interval_ms and command_poll_ms must be positive");
        }
        if self.housekeeping.period_secs == 0 {
            bail!("housekeeping.period_secs must be positive");
        }
        if self.source_tag.trim().is_empty() {
            bail!("source_tag must not be empty");
        }
        Ok(())
    }

    /// Available codes that name catalog commands; anything else is logged and ignored.
    pub fn available_in(&self, catalog: &Catalog) -> Vec<u8> {
        let mut codes = Vec::with_capacity(self.available_commands.len());
        for &code in &self.available_commands {
            match catalog.get(code) {
                Some(layout) if layout.kind == MessageKind::Command => {
                    if !codes.contains(&code) {
                        codes.push(code);
                    }
                }
                Some(layout) => warn!(code, name = layout.name, "ignoring available code: not a command"),
                None => warn!(code, "ignoring available code: not in catalog"),
            }
        }
        codes
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }

    pub fn command_poll(&self) -> Duration {
        Duration::from_millis(self.command_poll_ms)
    }

    pub fn reply_wait(&self) -> Duration {
        Duration::from_millis(self.reply_wait_ms)
    }

    pub fn sink_pop_wait(&self) -> Duration {
        Duration::from_millis(self.sink_pop_wait_ms)
    }

    pub fn monitor_retry(&self) -> Duration {
        Duration::from_secs(self.monitor_retry_secs)
    }

    pub fn local_log_retry(&self) -> Duration {
        Duration::from_secs(self.local_log_retry_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = DaemonConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.client_socket_path, PathBuf::from("/tmp/CDH.sock"));
        assert_eq!(cfg.available_commands, vec![0, 1]);
        assert_eq!(cfg.link_timeout(), Duration::from_millis(100));
        assert_eq!(cfg.housekeeping.i2c_address, 0x48);
    }

    #[test]
    fn json_keeps_defaults_for_missing_keys() {
        let cfg = DaemonConfig::from_json(
            r#"{ "source_tag": "ADCS2", "link_retries": 5, "housekeeping": { "enabled": true } }"#,
        )
        .unwrap();
        assert_eq!(cfg.source_tag, "ADCS2");
        assert_eq!(cfg.link_retries, 5);
        assert!(cfg.housekeeping.enabled);
        assert_eq!(cfg.housekeeping.period_secs, 5);
        assert_eq!(cfg.sink_capacity, 1024);
    }

    #[test]
    fn json_rejects_unknown_keys_and_bad_types() {
        assert!(DaemonConfig::from_json(r#"{ "sauce_tag": "x" }"#).is_err());
        assert!(DaemonConfig::from_json(r#"{ "link_retries": -1 }"#).is_err());
        assert!(DaemonConfig::from_json("not json").is_err());
    }

    #[test]
    fn env_overrides_win() {
        let mut cfg = DaemonConfig::default();
        cfg.apply_overrides(env(&[
            ("CDH_CLIENT_SOCKET", "/run/cdh.sock"),
            ("CDH_LINK_TIMEOUT_MS", "250"),
            ("CDH_AVAILABLE_COMMANDS", "1, 0"),
            ("CDH_LOCAL_LOG", "true"),
            ("CDH_HOUSEKEEPING", "1"),
        ]))
        .unwrap();
        assert_eq!(cfg.client_socket_path, PathBuf::from("/run/cdh.sock"));
        assert_eq!(cfg.link_timeout_ms, 250);
        assert_eq!(cfg.available_commands, vec![1, 0]);
        assert!(cfg.local_log_enabled);
        assert!(cfg.housekeeping.enabled);
    }

    #[test]
    fn bad_env_override_names_the_key() {
        let mut cfg = DaemonConfig::default();
        let err = cfg
            .apply_overrides(env(&[("CDH_LINK_RETRIES", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("CDH_LINK_RETRIES"));

        let err = cfg
            .apply_overrides(env(&[("CDH_LOCAL_LOG", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("CDH_LOCAL_LOG"));
    }

    #[test]
    fn validation_rejects_zero_timeouts() {
        let cfg = DaemonConfig {
            link_timeout_ms: 0,
            ..DaemonConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn available_codes_are_filtered_against_catalog() {
        let cfg = DaemonConfig {
            available_commands: vec![1, 2, 99, 1, 0],
            ..DaemonConfig::default()
        };
        assert_eq!(cfg.available_in(Catalog::standard()), vec![1, 0]);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("cdh-config-does-not-exist.json");
        let _ = std::fs::remove_file(&path);
        assert_eq!(DaemonConfig::from_file(&path).unwrap(), DaemonConfig::default());
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("cdh-config-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let err = DaemonConfig::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config file"));
        let _ = std::fs::remove_file(&path);
    }
}
