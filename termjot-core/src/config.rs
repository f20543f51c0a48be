//! Editor settings loaded from TOML.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::model::{Background, BackgroundKind, Color, PageTemplate};

pub const CONFIG_ENV: &str = "TERMJOT_CONFIG";
pub const CONFIG_FILE: &str = "termjot.toml";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("net", "termjot", "termjot")
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditorConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub autosave: AutosaveConfig,
    #[serde(default)]
    pub changes: ChangesConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub page: PageConfig,
}

impl EditorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolution order: `explicit`, then `$TERMJOT_CONFIG`, then
    /// `termjot.toml` in the platform config directory. Missing files fall back
    /// to the defaults; an explicitly named file must exist.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::from_file(PathBuf::from(path));
        }
        match project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE)) {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutosaveConfig {
    #[serde(default = "AutosaveConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "AutosaveConfig::default_interval")]
    pub interval_secs: u64,
    /// Where copies of never-saved documents go.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl AutosaveConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_interval() -> u64 {
        180
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn directory_or(&self, data_dir: &Path) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| data_dir.join("autosave"))
    }
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            interval_secs: Self::default_interval(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangesConfig {
    #[serde(default = "ChangesConfig::default_drain_interval")]
    pub drain_interval_ms: u64,
}

impl ChangesConfig {
    fn default_drain_interval() -> u64 {
        5000
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }
}

impl Default for ChangesConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: Self::default_drain_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "SchedulerConfig::default_workers")]
    pub workers: usize,
}

impl SchedulerConfig {
    fn default_workers() -> usize {
        1
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryConfig {
    /// 0 keeps everything.
    #[serde(default)]
    pub max_depth: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundStyle {
    #[default]
    Plain,
    Lined,
    Graph,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageConfig {
    #[serde(default = "PageConfig::default_width")]
    pub width: f64,
    #[serde(default = "PageConfig::default_height")]
    pub height: f64,
    #[serde(default)]
    pub background: BackgroundStyle,
    #[serde(default = "PageConfig::default_color")]
    pub color: Color,
}

impl PageConfig {
    fn default_width() -> f64 {
        595.275_59
    }

    fn default_height() -> f64 {
        841.889_76
    }

    fn default_color() -> Color {
        0xffffff
    }

    pub fn template(&self) -> PageTemplate {
        let kind = match self.background {
            BackgroundStyle::Plain => BackgroundKind::Plain,
            BackgroundStyle::Lined => BackgroundKind::Lined,
            BackgroundStyle::Graph => BackgroundKind::Graph,
        };
        PageTemplate {
            width: self.width,
            height: self.height,
            background: Background {
                kind,
                color: self.color,
            },
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            width: Self::default_width(),
            height: Self::default_height(),
            background: BackgroundStyle::default(),
            color: Self::default_color(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
