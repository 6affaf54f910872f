//! TOML settings file
//!
//! Every section is optional; missing keys take their defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vigil_ai::{AiConfig, PromptLibrary, GENERAL_ANALYSIS_PROMPT};
use vigil_capture::WorkerConfig;

use crate::manager::{AnalysisSettings, ManagerConfig, ShutdownConfig};
use crate::scheduler::SchedulerConfig;

/// File name of the settings file inside the data directory
pub const SETTINGS_FILE: &str = "vigil.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub ai: AiSettings,

    #[serde(default)]
    pub analysis: AnalysisSection,

    #[serde(default)]
    pub capture: CaptureSettings,

    /// Extra or overriding prompt templates by name
    #[serde(default)]
    pub prompts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Database and settings location (defaults to the platform data dir)
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_analysis_interval")]
    pub analysis_interval_secs: u64,

    /// UI theme; kept for front ends, unused here
    #[serde(default = "default_theme")]
    pub theme: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiSettings {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_min_request_interval")]
    pub min_request_interval_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Keep a JPEG of every analysed frame here
    pub snapshot_dir: Option<PathBuf>,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Template for streams whose own template is unknown
    #[serde(default = "default_prompt")]
    pub default_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// How often blocked workers check for cancellation
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,

    #[serde(default = "default_read_retry_delay")]
    pub read_retry_delay_secs: u64,

    #[serde(default = "default_remove_grace")]
    pub remove_grace_secs: u64,

    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    #[serde(default = "default_stop_escalation")]
    pub stop_escalation_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_analysis_interval() -> u64 { 10 }
fn default_theme() -> String { "light".to_string() }
fn default_model() -> String { "gpt-4o".to_string() }
fn default_api_base() -> String { "https://api.openai.com/v1".to_string() }
fn default_min_request_interval() -> u64 { 10 }
fn default_request_timeout() -> u64 { 60 }
fn default_history_limit() -> usize { 10 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_backoff() -> u64 { 5 }
fn default_jpeg_quality() -> u8 { 85 }
fn default_prompt() -> String { GENERAL_ANALYSIS_PROMPT.to_string() }
fn default_poll_interval() -> u64 { 50 }
fn default_frame_interval() -> u64 { 10 }
fn default_read_retry_delay() -> u64 { 1 }
fn default_remove_grace() -> u64 { 5 }
fn default_stop_grace() -> u64 { 10 }
fn default_stop_escalation() -> u64 { 5 }
fn default_queue_capacity() -> usize { 1 }

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            analysis_interval_secs: default_analysis_interval(),
            theme: default_theme(),
        }
    }
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: String::new(),
            api_base: default_api_base(),
            min_request_interval_secs: default_min_request_interval(),
            request_timeout_secs: default_request_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff(),
            snapshot_dir: None,
            jpeg_quality: default_jpeg_quality(),
            default_prompt: default_prompt(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            frame_interval_ms: default_frame_interval(),
            read_retry_delay_secs: default_read_retry_delay(),
            remove_grace_secs: default_remove_grace(),
            stop_grace_secs: default_stop_grace(),
            stop_escalation_secs: default_stop_escalation(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("failed to parse settings file {:?}", path))
    }

    /// Load settings, falling back to defaults when the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
        let content = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(path, content).with_context(|| format!("failed to write settings file {:?}", path))
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Vigil")
    }

    pub fn default_path() -> PathBuf {
        Self::default_data_dir().join(SETTINGS_FILE)
    }

    /// Configured data directory or the platform default
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.general
            .data_dir
            .clone()
            .unwrap_or_else(Self::default_data_dir)
    }

    pub fn ai_config(&self) -> AiConfig {
        AiConfig {
            min_request_interval: Duration::from_secs(self.ai.min_request_interval_secs),
            request_timeout: Duration::from_secs(self.ai.request_timeout_secs),
            history_limit: self.ai.history_limit,
            ..AiConfig::new(&self.ai.model, &self.ai.api_key, &self.ai.api_base)
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let capture = &self.capture;
        ManagerConfig {
            queue_capacity: capture.queue_capacity,
            worker: WorkerConfig {
                frame_interval: Duration::from_millis(capture.frame_interval_ms),
                read_retry_delay: Duration::from_secs(capture.read_retry_delay_secs),
                cancel_poll: Duration::from_millis(capture.poll_interval_ms.max(1)),
            },
            shutdown: ShutdownConfig {
                remove_grace: Duration::from_secs(capture.remove_grace_secs),
                stop_grace: Duration::from_secs(capture.stop_grace_secs),
                stop_escalation: Duration::from_secs(capture.stop_escalation_secs),
            },
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_attempts: self.analysis.max_attempts,
            retry_backoff: Duration::from_secs(self.analysis.retry_backoff_secs),
            snapshot_dir: self.analysis.snapshot_dir.clone(),
            jpeg_quality: self.analysis.jpeg_quality,
        }
    }

    pub fn prompt_library(&self) -> PromptLibrary {
        PromptLibrary::new(self.prompts.clone())
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            interval: Duration::from_secs(self.general.analysis_interval_secs),
            default_prompt: self.analysis.default_prompt.clone(),
            ai: self.ai_config(),
            revision: 0,
        }
    }
}
