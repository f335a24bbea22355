use std::{net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;

use crate::{error::ConfigError, frame::DEFAULT_FRAME_SIZE};

/// Server settings. Every field has a default, so a TOML file only needs the
/// keys it wants to change.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub frame_size: usize,
    pub handshake_timeout_secs: u64,
    pub max_username_len: usize,
    pub shutdown_timeout_secs: u64,
    pub event_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            frame_size: DEFAULT_FRAME_SIZE,
            handshake_timeout_secs: 30,
            max_username_len: 256,
            shutdown_timeout_secs: 5,
            event_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("frame_size", self.frame_size),
            ("max_username_len", self.max_username_len),
            ("event_capacity", self.event_capacity),
        ];
        if let Some((name, _)) = sizes.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            listen = "0.0.0.0:9000"
            frame_size = 8192
            "#,
        )
        .expect("parse");

        assert_eq!(config.listen, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.frame_size, 8192);
        assert_eq!(config.max_username_len, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let config = RelayConfig {
            frame_size: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("frame_size"))));

        let config = RelayConfig {
            event_capacity: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("event_capacity"))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let result = RelayConfig::load(Path::new("/nonexistent/relay.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
