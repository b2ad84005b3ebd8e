use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::output::DEFAULT_OUTPUT_CAPACITY;
use crate::registry::DEFAULT_NOTICE_CAPACITY;

pub const CONFIG_FILE_NAME: &str = "procvisor.toml";

pub const DEFAULT_STOP_CONFIRM_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MIN_HEIGHT: u32 = 200;
pub const DEFAULT_MAX_HEIGHT: u32 = 500;
pub const DEFAULT_PANEL_HEIGHT: u32 = 300;
pub const DEFAULT_HEIGHT_KEY: &str = "procvisor.panel.height";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {error}")]
    Read {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to parse config {path}: {error}")]
    Parse {
        path: PathBuf,
        #[source]
        error: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcvisorConfig {
    pub supervisor: SupervisorConfig,
    pub panel: PanelConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Lines kept per process.
    pub output_capacity: usize,
    /// 0 waits for stop confirmation indefinitely.
    pub stop_confirm_timeout_ms: u64,
    /// Undelivered change notices queued per subscriber.
    pub notice_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            stop_confirm_timeout_ms: DEFAULT_STOP_CONFIRM_TIMEOUT_MS,
            notice_capacity: DEFAULT_NOTICE_CAPACITY,
        }
    }
}

impl SupervisorConfig {
    pub fn stop_confirm_timeout(&self) -> Option<Duration> {
        (self.stop_confirm_timeout_ms > 0)
            .then(|| Duration::from_millis(self.stop_confirm_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PanelConfig {
    pub min_height: u32,
    pub max_height: u32,
    pub default_height: u32,
    pub height_key: String,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            min_height: DEFAULT_MIN_HEIGHT,
            max_height: DEFAULT_MAX_HEIGHT,
            default_height: DEFAULT_PANEL_HEIGHT,
            height_key: DEFAULT_HEIGHT_KEY.to_owned(),
        }
    }
}

impl PanelConfig {
    /// Inverted bounds are treated as the range between them.
    pub fn clamp_height(&self, height: i64) -> u32 {
        let low = self.min_height.min(self.max_height);
        let high = self.min_height.max(self.max_height);
        height.clamp(i64::from(low), i64::from(high)) as u32
    }
}

impl ProcvisorConfig {
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: ProcvisorConfig = toml::from_str(raw).map_err(|error| ConfigError::Parse {
            path: origin.to_path_buf(),
            error,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;
        Self::from_toml_str(&raw, path)
    }

    /// Loads `procvisor.toml` from `dir` when present, defaults otherwise.
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.output_capacity == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.output_capacity must be at least 1".to_owned(),
            ));
        }
        if self.supervisor.notice_capacity == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.notice_capacity must be at least 1".to_owned(),
            ));
        }
        let panel = &self.panel;
        if panel.min_height > panel.max_height {
            return Err(ConfigError::Invalid(format!(
                "panel.min_height ({}) exceeds panel.max_height ({})",
                panel.min_height, panel.max_height
            )));
        }
        if panel.height_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "panel.height_key must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn origin() -> PathBuf {
        PathBuf::from("procvisor.toml")
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = ProcvisorConfig::from_toml_str("", &origin()).expect("parse");
        assert_eq!(config, ProcvisorConfig::default());
        assert_eq!(
            config.supervisor.stop_confirm_timeout(),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = ProcvisorConfig::from_toml_str(
            "[supervisor]\noutput_capacity = 50\n\n[panel]\nmax_height = 800\n",
            &origin(),
        )
        .expect("parse");
        assert_eq!(config.supervisor.output_capacity, 50);
        assert_eq!(
            config.supervisor.stop_confirm_timeout_ms,
            DEFAULT_STOP_CONFIRM_TIMEOUT_MS
        );
        assert_eq!(config.panel.max_height, 800);
        assert_eq!(config.panel.min_height, DEFAULT_MIN_HEIGHT);
    }

    #[test]
    fn zero_timeout_means_wait_forever() {
        let config = ProcvisorConfig::from_toml_str(
            "[supervisor]\nstop_confirm_timeout_ms = 0\n",
            &origin(),
        )
        .expect("parse");
        assert_eq!(config.supervisor.stop_confirm_timeout(), None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = ProcvisorConfig::from_toml_str("[supervisor]\noutput_capacity = 0\n", &origin())
            .expect_err("zero capacity");
        assert!(err.to_string().contains("output_capacity"));

        let err = ProcvisorConfig::from_toml_str(
            "[panel]\nmin_height = 600\nmax_height = 400\n",
            &origin(),
        )
        .expect_err("inverted bounds");
        assert!(err.to_string().contains("min_height"));

        let err = ProcvisorConfig::from_toml_str("[panel]\nwidth = 3\n", &origin())
            .expect_err("unknown key");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn clamp_height_respects_bounds() {
        let panel = PanelConfig::default();
        assert_eq!(panel.clamp_height(650), 500);
        assert_eq!(panel.clamp_height(50), 200);
        assert_eq!(panel.clamp_height(-5), 200);
        assert_eq!(panel.clamp_height(320), 320);
    }

    #[test]
    fn clamp_height_tolerates_inverted_bounds() {
        let panel = PanelConfig {
            min_height: 500,
            max_height: 200,
            ..PanelConfig::default()
        };
        assert_eq!(panel.clamp_height(650), 500);
        assert_eq!(panel.clamp_height(50), 200);
        assert_eq!(panel.clamp_height(320), 320);
    }

    #[test]
    fn discover_falls_back_when_file_missing() {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("procvisor-config-{ts}"));
        fs::create_dir_all(&root).expect("mkdir");
        assert_eq!(
            ProcvisorConfig::discover(&root).expect("defaults"),
            ProcvisorConfig::default()
        );

        fs::write(
            root.join(CONFIG_FILE_NAME),
            "[panel]\ndefault_height = 250\n",
        )
        .expect("write");
        let config = ProcvisorConfig::discover(&root).expect("load");
        assert_eq!(config.panel.default_height, 250);
    }
}
