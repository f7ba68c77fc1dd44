use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::bridge::DEFAULT_FLUSH_INTERVAL;
use crate::poller::DEFAULT_POLL_INTERVAL;
use crate::sequencer::DEFAULT_SETTLE_DELAY;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".ocloop";

fn default_server_program() -> String {
    "opencode".to_string()
}

fn default_server_args() -> Vec<String> {
    vec!["serve".to_string()]
}

fn default_attach_program() -> String {
    "opencode".to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY.as_millis() as u64
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL.as_millis() as u64
}

fn default_sidebar_width() -> u16 {
    20
}

/// Backend server subprocess settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_program")]
    pub program: String,
    #[serde(default = "default_server_args")]
    pub args: Vec<String>,
    /// Program used for `attach` subprocesses (embedded and native).
    /// Usually the same binary as the server.
    #[serde(default = "default_attach_program")]
    pub attach_program: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: default_server_program(),
            args: default_server_args(),
            attach_program: default_attach_program(),
        }
    }
}

/// Timer cadences for the batch loop.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Status poll interval per busy session (ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause between observing an idle run and starting the next one (ms).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Fallback flush cadence for buffered pane output (ms).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Layout knobs for the terminal view.
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_sidebar_width")]
    pub sidebar_width: u16,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            sidebar_width: default_sidebar_width(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.ocloop/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}
