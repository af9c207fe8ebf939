//! YAML run configuration with CLI overrides.

use crate::capture::{CaptureConfig, DEFAULT_MAX_CONSECUTIVE_ERRORS};
use crate::processing::ProcessingMode;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Physical camera via the platform capture API
    #[default]
    Camera,
    /// Synthetic colour bars, no hardware needed
    TestPattern,
}

/// Where processed frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Display in a window (default)
    #[default]
    Window,
    /// No window; drain frames and log throughput
    Headless,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub mode: ProcessingMode,
    pub source: SourceKind,
    pub output: OutputMode,
    pub title: String,
    pub max_consecutive_errors: u32,
}

impl Default for Config {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            device_index: capture.device_index,
            width: capture.width,
            height: capture.height,
            fps: capture.fps,
            mode: ProcessingMode::default(),
            source: SourceKind::default(),
            output: OutputMode::default(),
            title: "flmap".to_string(),
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }
}

/// Values given on the command line; each one that is set wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub device_index: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub mode: Option<ProcessingMode>,
    pub source: Option<SourceKind>,
    pub output: Option<OutputMode>,
}

impl Config {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("in config file {:?}", path))
    }

    pub fn apply(mut self, overrides: &Overrides) -> Result<Self> {
        if let Some(v) = overrides.device_index {
            self.device_index = v;
        }
        if let Some(v) = overrides.width {
            self.width = v;
        }
        if let Some(v) = overrides.height {
            self.height = v;
        }
        if let Some(v) = overrides.fps {
            self.fps = v;
        }
        if let Some(v) = overrides.mode {
            self.mode = v;
        }
        if let Some(v) = overrides.source {
            self.source = v;
        }
        if let Some(v) = overrides.output {
            self.output = v;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("frame size must be non-zero, got {}x{}", self.width, self.height);
        }
        if self.fps == 0 {
            anyhow::bail!("fps must be at least 1");
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device_index: self.device_index,
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }
}
