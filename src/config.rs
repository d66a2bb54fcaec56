//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

use config::{ConfigError, Map, Source, Value};
use serde::{Deserialize, Serialize};

use crate::util::insert_into_config_map;

/// CONFIG_FILE_NAME is the name of the optional config file in the machined
/// home directory.
pub const CONFIG_FILE_NAME: &str = "machined.config.toml";
/// ENV_PREFIX should be used along side the config field name to set a
/// config field using environment variables, e.g. `MACHINED_PORT=1000` sets
/// `Config.port`.
pub const ENV_PREFIX: &str = "MACHINED";
pub const DEFAULT_PORT: u16 = 8909;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Port the HTTP surface listens on.
    pub port: u16,
    /// Prefix for the follow file name; lets several instances share a
    /// working directory.
    pub file_prefix: String,
    /// How long a reader waits for the writer's acknowledgement on `send`.
    pub ack_timeout_ms: u64,
    /// Poller tick period.
    pub poll_interval_ms: u64,
    /// Seconds of poll suppression after a pub/sub event on a reader.
    pub high_freq_window_secs: i64,
}

impl Config {
    pub fn new(port: u16, file_prefix: String) -> Self {
        Self {
            port,
            file_prefix,
            ..Self::default()
        }
    }

    pub fn follow_file_path(&self) -> PathBuf {
        PathBuf::from(format!("{}follows.json", self.file_prefix))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            file_prefix: String::new(),
            ack_timeout_ms: 4_000,
            poll_interval_ms: 1_000,
            high_freq_window_secs: 10,
        }
    }
}

impl Source for Config {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut map: Map<String, Value> = Map::new();
        // Some issue between deserializing u64 & u16, converting this to
        // an signed int fixes the issue
        insert_into_config_map(&mut map, "port", self.port as i32);
        insert_into_config_map(&mut map, "file_prefix", self.file_prefix.clone());
        insert_into_config_map(&mut map, "ack_timeout_ms", self.ack_timeout_ms as i64);
        insert_into_config_map(&mut map, "poll_interval_ms", self.poll_interval_ms as i64);
        insert_into_config_map(&mut map, "high_freq_window_secs", self.high_freq_window_secs);
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::util::make_config;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.follow_file_path(), PathBuf::from("follows.json"));
    }

    #[test]
    fn file_prefix_moves_the_follow_file() {
        let config = Config::new(DEFAULT_PORT, "/tmp/instance-a.".to_string());
        assert_eq!(
            config.follow_file_path(),
            PathBuf::from("/tmp/instance-a.follows.json")
        );
    }

    #[test]
    fn test_build_config_from_struct() {
        let expect = Config::default();
        let got: Config = config::Config::builder()
            .add_source(expect.clone())
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(expect, got);
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_file = dir.path().join("machined.config.toml");
        std::fs::write(
            &cfg_file,
            r#"
            port = 2001
            file_prefix = "b."
            ack_timeout_ms = 250
            "#,
        )
        .unwrap();
        let sources = [Some(cfg_file)];
        let cfg: Config = make_config(
            Config::default(),
            &sources,
            ENV_PREFIX,
            HashMap::<&str, String>::new(),
        )
        .unwrap();

        assert_eq!(cfg.port, 2001);
        assert_eq!(cfg.file_prefix, "b.");
        assert_eq!(cfg.ack_timeout_ms, 250);
        assert_eq!(cfg.poll_interval_ms, Config::default().poll_interval_ms);
    }
}
