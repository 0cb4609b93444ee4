//! Daemon configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Worker process configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Control channel configuration
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Session record configuration
    #[serde(default)]
    pub record: RecordConfig,
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker.command.trim().is_empty() {
            anyhow::bail!("worker.command must not be empty");
        }

        if self.channel.socket_dir.as_os_str().is_empty() {
            anyhow::bail!("channel.socket_dir must not be empty");
        }

        if self.worker.stop_timeout_secs == 0 {
            anyhow::bail!("worker.stop_timeout_secs must be at least 1");
        }

        Ok(())
    }
}

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Command line for the privilege-separated authentication worker
    #[serde(default = "default_worker_command")]
    pub command: String,

    /// Extra environment passed to every worker, replacing the daemon's own
    /// environment when non-empty
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Seconds to wait for a signaled worker before escalating to SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            environment: HashMap::new(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

fn default_worker_command() -> String {
    "/usr/libexec/lucid-session-worker".to_string()
}

fn default_stop_timeout() -> u64 {
    5
}

/// Control channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Directory holding the per-instance private sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Additional uid allowed to connect besides root
    #[serde(default)]
    pub allowed_uid: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            allowed_uid: 0,
        }
    }
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/run/lucid-dm/private")
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Authentication service started by the daemon at boot
    #[serde(default = "default_service")]
    pub service: String,

    /// Session name used when the client selected none
    #[serde(default = "default_session_name")]
    pub default_session: String,

    /// Language used when the client selected none
    #[serde(default = "default_language")]
    pub fallback_language: String,

    /// Session type exported to the session environment
    #[serde(default = "default_session_type")]
    pub session_type: String,

    /// Command run as the user session when the client selected no program
    #[serde(default = "default_session_command")]
    pub session_command: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            default_session: default_session_name(),
            fallback_language: default_language(),
            session_type: default_session_type(),
            session_command: default_session_command(),
        }
    }
}

fn default_service() -> String {
    "password".to_string()
}

fn default_session_name() -> String {
    "default".to_string()
}

fn default_language() -> String {
    "en_US.UTF-8".to_string()
}

fn default_session_type() -> String {
    "x11".to_string()
}

fn default_session_command() -> String {
    "/usr/libexec/lucid-session-runner".to_string()
}

/// Session record configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Emit login/logout/failed-attempt records
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.worker.command, "/usr/libexec/lucid-session-worker");
        assert_eq!(config.worker.stop_timeout_secs, 5);
        assert_eq!(config.channel.allowed_uid, 0);
        assert_eq!(config.session.service, "password");
        assert!(config.record.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [worker]
            command = "/opt/dm/worker --debug"

            [channel]
            allowed_uid = 981
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.command, "/opt/dm/worker --debug");
        assert_eq!(config.channel.allowed_uid, 981);
        assert_eq!(config.worker.stop_timeout_secs, 5);
        assert_eq!(config.session.default_session, "default");
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let mut config = DaemonConfig::default();
        config.worker.command = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
