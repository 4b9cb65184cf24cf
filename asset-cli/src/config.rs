use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use session_coordinator::{CoordinatorConfig, HttpBackendConfig};
use tracing::debug;
use url::Url;

use crate::cli::Args;
use crate::error::{CliError, Result};

/// Contents of `config.toml`.
///
/// ```toml
/// base_url = "https://localhost:7036"
/// username = "alice"
/// request_timeout_secs = 30
///
/// [coordinator]
/// safety_margin_ms = 30000
/// max_queue_depth = 64
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub request_timeout_secs: Option<u64>,
    /// Path prefix of the asset endpoints.
    pub asset_path: Option<String>,
    pub coordinator: CoordinatorConfig,
}

/// Effective settings after merging the config file with the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: HttpBackendConfig,
    pub coordinator: CoordinatorConfig,
    pub asset_path: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub const DEFAULT_ASSET_PATH: &str = "/api/asset";

impl AppConfig {
    /// Default location: `<config_dir>/assetctl/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("assetctl").join("config.toml"))
    }

    /// Load the configuration file. A missing file at the default location
    /// yields the defaults; a missing explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(CliError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "No config file; using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Merge with command line arguments. Flags override file values.
    pub fn resolve(self, args: &Args) -> Result<Settings> {
        let base_url = args
            .base_url
            .clone()
            .or(self.base_url)
            .ok_or_else(|| {
                CliError::Config(
                    "no base URL (set base_url in the config file, ASSETCTL_BASE_URL, or --base-url)"
                        .to_string(),
                )
            })?;
        let base_url = Url::parse(&base_url)?;

        let mut backend = HttpBackendConfig::new(base_url);
        if let Some(secs) = args.timeout.or(self.request_timeout_secs) {
            backend = backend.with_request_timeout(Duration::from_secs(secs));
        }

        Ok(Settings {
            backend,
            coordinator: self.coordinator,
            asset_path: self
                .asset_path
                .unwrap_or_else(|| DEFAULT_ASSET_PATH.to_string()),
            username: args.username.clone().or(self.username),
            password: args.password.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["assetctl"];
        argv.extend_from_slice(extra);
        argv.push("whoami");
        Args::parse_from(argv)
    }

    #[test]
    fn test_parse_file() {
        let config = AppConfig::parse(
            r#"
            base_url = "https://assets.example.com"
            username = "alice"

            [coordinator]
            safety_margin_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.base_url.as_deref(), Some("https://assets.example.com"));
        assert_eq!(config.coordinator.safety_margin, Duration::from_secs(5));
        assert_eq!(config.coordinator.max_queue_depth, 256);
    }

    #[test]
    fn test_flags_override_file() {
        let config = AppConfig {
            base_url: Some("https://file.example.com".to_string()),
            username: Some("file-user".to_string()),
            request_timeout_secs: Some(10),
            ..AppConfig::default()
        };

        let settings = config
            .resolve(&args(&[
                "--base-url",
                "https://flag.example.com",
                "--username",
                "flag-user",
                "--timeout",
                "3",
            ]))
            .unwrap();

        assert_eq!(settings.backend.base_url.as_str(), "https://flag.example.com/");
        assert_eq!(settings.backend.request_timeout, Duration::from_secs(3));
        assert_eq!(settings.username.as_deref(), Some("flag-user"));
        assert_eq!(settings.asset_path, DEFAULT_ASSET_PATH);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/assetctl/config.toml")));
        assert!(matches!(result, Err(CliError::Config(_))));
    }
}
