// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

//! YAML configuration parser with strict schema validation.
//!
//! Configuration is validated at startup; any invalid field is a
//! HardValidationError that prevents the daemon from coming up. Every
//! field has a default, so an absent config file yields a working local
//! setup.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{HardValidationError, StasisError, StasisResult};

/// Raw client/operation section as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawClientConfig {
    #[serde(default = "default_staging_dir")]
    staging_dir: String,
    #[serde(default = "default_checkpoint_dir")]
    checkpoint_dir: String,
    #[serde(default)]
    leave_running: bool,
    /// Overrides the pseudoterminal heuristic when set.
    #[serde(default)]
    shell_job: Option<bool>,
}

fn default_staging_dir() -> String {
    "/tmp/stasis".to_string()
}

fn default_checkpoint_dir() -> String {
    "/tmp/stasis/checkpoints".to_string()
}

impl Default for RawClientConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            checkpoint_dir: default_checkpoint_dir(),
            leave_running: false,
            shell_job: None,
        }
    }
}

/// Raw remote-store connection section.
#[derive(Debug, Default, Deserialize)]
struct RawConnectionConfig {
    #[serde(default)]
    server_url: Option<String>,
}

/// Raw state-index section.
#[derive(Debug, Deserialize)]
struct RawDbConfig {
    #[serde(default = "default_db_path")]
    path: String,
}

fn default_db_path() -> String {
    "/tmp/cedana.db".to_string()
}

impl Default for RawDbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Raw GPU coordination section.
#[derive(Debug, Deserialize)]
struct RawGpuConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_controller_path")]
    controller_path: String,
    #[serde(default = "default_agent_endpoint")]
    agent_endpoint: String,
    #[serde(default = "default_gpu_id")]
    uid: u32,
    #[serde(default = "default_gpu_id")]
    gid: u32,
    #[serde(default = "default_gpu_pidfile")]
    pidfile: String,
}

fn default_controller_path() -> String {
    "/usr/local/bin/gpu-controller".to_string()
}

fn default_agent_endpoint() -> String {
    "http://127.0.0.1:50051".to_string()
}

fn default_gpu_id() -> u32 {
    1000
}

fn default_gpu_pidfile() -> String {
    "/tmp/stasis-gpu-controller.pid".to_string()
}

impl Default for RawGpuConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            controller_path: default_controller_path(),
            agent_endpoint: default_agent_endpoint(),
            uid: default_gpu_id(),
            gid: default_gpu_id(),
            pidfile: default_gpu_pidfile(),
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    client: RawClientConfig,
    #[serde(default)]
    connection: RawConnectionConfig,
    #[serde(default)]
    db: RawDbConfig,
    #[serde(default)]
    gpu: RawGpuConfig,
}

/// Validated client/operation configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub staging_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub leave_running: bool,
    pub shell_job: Option<bool>,
}

/// Validated remote-store connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub server_url: Option<String>,
}

/// Validated state-index configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Validated GPU coordination configuration.
#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub enabled: bool,
    pub controller_path: PathBuf,
    pub agent_endpoint: String,
    pub uid: u32,
    pub gid: u32,
    pub pidfile: PathBuf,
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    pub connection: ConnectionConfig,
    pub db: DbConfig,
    pub gpu: GpuConfig,
}

impl Default for Config {
    fn default() -> Self {
        ConfigLoader::validate(RawConfig::default())
            .expect("built-in defaults must validate")
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> StasisResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(StasisError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| StasisError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load the file when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> StasisResult<Config> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_file(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> StasisResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| StasisError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> StasisResult<Config> {
        if raw.client.staging_dir.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "staging_dir",
                value: raw.client.staging_dir,
                reason: "Staging directory cannot be empty".to_string(),
            }
            .into());
        }

        if let Some(url) = &raw.connection.server_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "server_url",
                    value: url.clone(),
                    reason: "Server URL must be http(s)".to_string(),
                }
                .into());
            }
        }

        if !raw.gpu.agent_endpoint.starts_with("http://")
            && !raw.gpu.agent_endpoint.starts_with("https://")
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "agent_endpoint",
                value: raw.gpu.agent_endpoint,
                reason: "GPU agent endpoint must be http(s)".to_string(),
            }
            .into());
        }

        if raw.db.path.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "db.path",
                value: raw.db.path,
                reason: "State index path cannot be empty".to_string(),
            }
            .into());
        }

        Ok(Config {
            client: ClientConfig {
                staging_dir: PathBuf::from(raw.client.staging_dir),
                checkpoint_dir: PathBuf::from(raw.client.checkpoint_dir),
                leave_running: raw.client.leave_running,
                shell_job: raw.client.shell_job,
            },
            connection: ConnectionConfig {
                server_url: raw.connection.server_url,
            },
            db: DbConfig {
                path: PathBuf::from(raw.db.path),
            },
            gpu: GpuConfig {
                enabled: raw.gpu.enabled,
                controller_path: PathBuf::from(raw.gpu.controller_path),
                agent_endpoint: raw.gpu.agent_endpoint,
                uid: raw.gpu.uid,
                gid: raw.gpu.gid,
                pidfile: PathBuf::from(raw.gpu.pidfile),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"
client:
  staging_dir: /tmp/stasis
  leave_running: true
connection:
  server_url: https://store.example.com
db:
  path: /tmp/cedana.db
gpu:
  enabled: true
  uid: 1000
  gid: 1000
"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap();
        assert!(config.client.leave_running);
        assert_eq!(
            config.connection.server_url.as_deref(),
            Some("https://store.example.com")
        );
        assert!(config.gpu.enabled);
        assert_eq!(config.db.path, PathBuf::from("/tmp/cedana.db"));
    }

    #[test]
    fn test_defaults_applied() {
        let config = ConfigLoader::load_string("{}").unwrap();
        assert_eq!(config.db.path, PathBuf::from("/tmp/cedana.db"));
        assert_eq!(config.gpu.agent_endpoint, "http://127.0.0.1:50051");
        assert_eq!(config.gpu.uid, 1000);
        assert!(!config.gpu.enabled);
        assert!(config.connection.server_url.is_none());
    }

    #[test]
    fn test_invalid_server_url() {
        let yaml = r#"
connection:
  server_url: store.example.com
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_invalid_agent_endpoint() {
        let yaml = r#"
gpu:
  agent_endpoint: "127.0.0.1:50051"
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_shell_job_override() {
        let yaml = r#"
client:
  shell_job: false
"#;
        let config = ConfigLoader::load_string(yaml).unwrap();
        assert_eq!(config.client.shell_job, Some(false));
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(ConfigLoader::load_file("/nonexistent/stasis.yaml").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = ConfigLoader::load_or_default("/nonexistent/stasis.yaml").unwrap();
        assert_eq!(config.db.path, PathBuf::from("/tmp/cedana.db"));
    }
}
