//! Persisted user settings.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sdhub_common::{CIVITAI_ENDPOINT, DEFAULT_DEBOUNCE, DEFAULT_HUB_ENDPOINT};

use crate::samplers::SchedulerPreferences;

const APP_DIR: &str = "sdhub";
const MAX_DEBOUNCE_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the single-file model folders.
    pub models_dir: PathBuf,
    /// Hugging Face cache holding diffusers repositories.
    pub diffusers_dir: PathBuf,
    /// Checkpoint folder searched in addition to `models_dir`.
    pub ckpt_dir: PathBuf,
    /// Extra search place passed on the command line, if any.
    pub command_path: Option<PathBuf>,
    pub scan_debounce_ms: u64,
    /// Never reach out to the hub when looking up models.
    pub no_download: bool,
    pub hub_endpoint: String,
    pub civitai_endpoint: String,
    /// Samplers offered to the user; empty keeps the built-in short list.
    pub show_samplers: Vec<String>,
    pub schedulers: SchedulerPreferences,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(APP_DIR))
}

fn endpoint_or(endpoint: &str, default: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        default.to_string()
    } else {
        endpoint.to_string()
    }
}

/// Where hf-hub keeps its cache unless told otherwise.
pub fn default_hub_cache() -> PathBuf {
    if let Ok(cache) = std::env::var("HF_HUB_CACHE") {
        return PathBuf::from(cache);
    }
    if let Ok(home) = std::env::var("HF_HOME") {
        return PathBuf::from(home).join("hub");
    }
    dirs::home_dir()
        .map(|home| home.join(".cache").join("huggingface").join("hub"))
        .unwrap_or_else(|| PathBuf::from("huggingface").join("hub"))
}

impl Default for Settings {
    fn default() -> Self {
        let models = data_dir().join("models");
        Self {
            ckpt_dir: models.join("Stable-diffusion"),
            models_dir: models,
            diffusers_dir: default_hub_cache(),
            command_path: None,
            scan_debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            no_download: false,
            hub_endpoint: DEFAULT_HUB_ENDPOINT.to_string(),
            civitai_endpoint: CIVITAI_ENDPOINT.to_string(),
            show_samplers: Vec::new(),
            schedulers: SchedulerPreferences::default(),
        }
    }
}

impl Settings {
    /// `settings.json` in the user's config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(APP_DIR))
            .join("settings.json")
    }

    /// Load settings, falling back to defaults when the file is missing or corrupt.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("failed to load settings, using defaults: {e:#}");
                Self::default()
            }
        }
    }

    pub fn try_load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!("settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut settings: Self = serde_json::from_str(&json)
            .with_context(|| format!("parsing {}", path.display()))?;
        settings.validate();
        debug!("loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!("saved settings to {}", path.display());
        Ok(())
    }

    pub fn validate(&mut self) {
        self.scan_debounce_ms = self.scan_debounce_ms.min(MAX_DEBOUNCE_MS);
        self.hub_endpoint = endpoint_or(&self.hub_endpoint, DEFAULT_HUB_ENDPOINT);
        self.civitai_endpoint = endpoint_or(&self.civitai_endpoint, CIVITAI_ENDPOINT);
        self.show_samplers.retain(|name| !name.trim().is_empty());
        self.show_samplers = sdhub_common::unique_paths(std::mem::take(&mut self.show_samplers));
        self.schedulers.validate();
    }

    pub fn scan_debounce(&self) -> Duration {
        Duration::from_millis(self.scan_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplers::{BetaSchedule, PredictionType};

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.json"));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.scan_debounce(), DEFAULT_DEBOUNCE);
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Settings::try_load(&path).is_err());
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn partial_file_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "hub_endpoint": "https://hf-mirror.example/ ",
                "civitai_endpoint": "  ",
                "show_samplers": ["Euler", "", "Euler", "DDIM"],
                "scan_debounce_ms": 999999,
                "schedulers": { "solver_order": 0, "prediction_type": "v_prediction", "beta_schedule": "bogus" }
            }"#,
        )
        .unwrap();
        let settings = Settings::load(&path);
        assert_eq!(settings.hub_endpoint, "https://hf-mirror.example");
        assert_eq!(settings.civitai_endpoint, CIVITAI_ENDPOINT);
        assert_eq!(settings.show_samplers, vec!["Euler", "DDIM"]);
        assert_eq!(settings.scan_debounce_ms, MAX_DEBOUNCE_MS);
        assert_eq!(settings.schedulers.solver_order, 1);
        assert_eq!(settings.schedulers.prediction_type, PredictionType::VPrediction);
        assert_eq!(settings.schedulers.beta_schedule, BetaSchedule::Default);
        assert!(!settings.no_download);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            no_download: true,
            command_path: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::try_load(&path).unwrap(), settings);
    }
}
