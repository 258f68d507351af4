use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{NplError, Result};

/// The inclusive node-port range the table is allowed to allocate from.
///
/// Constructed only through [`PortRangeConfig::new`] so that an invalid
/// range (start above end, or either bound out of the valid port space)
/// is rejected once, at startup, rather than surfacing as a confusing
/// `NoFreePort` on the first `AddRule` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRangeConfig {
    pub start_port: u16,
    pub end_port: u16,
}

impl PortRangeConfig {
    pub fn new(start_port: u16, end_port: u16) -> Result<Self> {
        if start_port == 0 || end_port == 0 {
            return Err(NplError::Config(
                "start_port and end_port must be in [1, 65535]".to_string(),
            ));
        }
        if start_port > end_port {
            return Err(NplError::Config(format!(
                "start_port ({start_port}) must be <= end_port ({end_port})"
            )));
        }
        Ok(Self {
            start_port,
            end_port,
        })
    }

    pub fn len(&self) -> u32 {
        u32::from(self.end_port) - u32::from(self.start_port) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start_port..=self.end_port).contains(&port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Top-level configuration for the NPL agent: the port range the table
/// allocates from, plus logging setup. The packet-filter backend and
/// controller wiring are out of this crate's scope (§1) and have no
/// configuration surface here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub port_range: PortRangeConfig,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl AgentConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let config = if path.ends_with(".toml") {
            toml::from_str(&content)
                .map_err(|e| NplError::Config(format!("failed to parse TOML config: {e}")))?
        } else if path.ends_with(".json") {
            serde_json::from_str(&content)
                .map_err(|e| NplError::Config(format!("failed to parse JSON config: {e}")))?
        } else {
            return Err(NplError::Config(format!(
                "unsupported config file extension: {path}"
            )));
        };

        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content = if path.ends_with(".toml") {
            toml::to_string_pretty(self)
                .map_err(|e| NplError::Config(format!("failed to serialize TOML config: {e}")))?
        } else if path.ends_with(".json") {
            serde_json::to_string_pretty(self)
                .map_err(|e| NplError::Config(format!("failed to serialize JSON config: {e}")))?
        } else {
            return Err(NplError::Config(format!(
                "unsupported config file extension: {path}"
            )));
        };

        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_range() {
        assert!(PortRangeConfig::new(61005, 61000).is_err());
    }

    #[test]
    fn rejects_zero_bound() {
        assert!(PortRangeConfig::new(0, 100).is_err());
    }

    #[test]
    fn accepts_single_port_range() {
        let range = PortRangeConfig::new(61000, 61000).unwrap();
        assert_eq!(range.len(), 1);
        assert!(range.contains(61000));
        assert!(!range.contains(61001));
    }

    #[test]
    fn len_is_inclusive() {
        let range = PortRangeConfig::new(61000, 61005).unwrap();
        assert_eq!(range.len(), 6);
    }
}
