// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Worker configuration: a TOML file provides defaults, individual CLI
//! flags override them. Neither source is required to provide every field;
//! [`WorkerConfig::resolve`] is where missing-required-field errors surface.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub metadata_base_url: Option<String>,
    pub metadata_token: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_username: Option<String>,
    pub ssh_private_key: Option<PathBuf>,
    pub job_output_dir: Option<String>,
    pub girder_client_path: Option<PathBuf>,
    pub girder_token: Option<String>,
    pub poll_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("could not parse config file {0}: {1}")]
    Parse(String, toml::de::Error),
    #[error("missing required config value: {0} (set it in the config file or pass the matching flag)")]
    Missing(&'static str),
}

pub struct WorkerConfig {
    pub metadata_base_url: url::Url,
    pub metadata_token: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    pub ssh_private_key: PathBuf,
    pub job_output_dir: String,
    /// Local filesystem path to the bundled girder data-transfer client
    /// script; staged onto the head node's `job_output_dir` before each
    /// download/upload, mirroring how the original implementation puts it
    /// fresh on every invocation rather than assuming it's already there.
    pub girder_client_path: PathBuf,
    pub girder_token: String,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        file: FileConfig,
        metadata_base_url: Option<String>,
        metadata_token: Option<String>,
        ssh_host: Option<String>,
        ssh_port: Option<u16>,
        ssh_username: Option<String>,
        ssh_private_key: Option<PathBuf>,
        job_output_dir: Option<String>,
        girder_client_path: Option<PathBuf>,
        girder_token: Option<String>,
        poll_interval_secs: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let metadata_base_url = metadata_base_url
            .or(file.metadata_base_url)
            .ok_or(ConfigError::Missing("metadata_base_url"))?;
        let metadata_base_url = url::Url::parse(&metadata_base_url)
            .map_err(|_| ConfigError::Missing("metadata_base_url (invalid URL)"))?;

        Ok(WorkerConfig {
            metadata_base_url,
            metadata_token: metadata_token
                .or(file.metadata_token)
                .ok_or(ConfigError::Missing("metadata_token"))?,
            ssh_host: ssh_host.or(file.ssh_host).ok_or(ConfigError::Missing("ssh_host"))?,
            ssh_port: ssh_port.or(file.ssh_port).unwrap_or(22),
            ssh_username: ssh_username
                .or(file.ssh_username)
                .ok_or(ConfigError::Missing("ssh_username"))?,
            ssh_private_key: ssh_private_key
                .or(file.ssh_private_key)
                .ok_or(ConfigError::Missing("ssh_private_key"))?,
            job_output_dir: job_output_dir
                .or(file.job_output_dir)
                .unwrap_or_else(|| "/data/jobs".to_string()),
            girder_client_path: girder_client_path
                .or(file.girder_client_path)
                .unwrap_or_else(|| PathBuf::from("girderclient.py")),
            girder_token: girder_token
                .or(file.girder_token)
                .ok_or(ConfigError::Missing("girder_token"))?,
            poll_interval: Duration::from_secs(
                poll_interval_secs.or(file.poll_interval_secs).unwrap_or(5),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(
        file: FileConfig,
        ssh_private_key: Option<PathBuf>,
    ) -> Result<WorkerConfig, ConfigError> {
        WorkerConfig::resolve(
            file,
            Some("https://metadata.example".to_string()),
            Some("token".to_string()),
            Some("head.example".to_string()),
            None,
            Some("alice".to_string()),
            ssh_private_key,
            None,
            None,
            Some("girder-token".to_string()),
            None,
        )
    }

    #[test]
    fn cli_flags_override_file_config() {
        let file = FileConfig {
            ssh_host: Some("file-host".to_string()),
            ssh_private_key: Some(PathBuf::from("/file/key")),
            ..FileConfig::default()
        };
        let config = resolve(file, Some(PathBuf::from("/cli/key"))).unwrap();
        assert_eq!(config.ssh_host, "head.example");
        assert_eq!(config.ssh_private_key, PathBuf::from("/cli/key"));
    }

    #[test]
    fn file_config_fills_in_when_cli_flag_absent() {
        let file = FileConfig {
            ssh_private_key: Some(PathBuf::from("/file/key")),
            ..FileConfig::default()
        };
        let config = resolve(file, None).unwrap();
        assert_eq!(config.ssh_private_key, PathBuf::from("/file/key"));
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let err = resolve(FileConfig::default(), None).unwrap_err();
        match err {
            ConfigError::Missing(field) => assert_eq!(field, "ssh_private_key"),
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn unset_optional_fields_fall_back_to_defaults() {
        let config = resolve(FileConfig::default(), Some(PathBuf::from("/key"))).unwrap();
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.job_output_dir, "/data/jobs");
        assert_eq!(config.girder_client_path, PathBuf::from("girderclient.py"));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }
}
