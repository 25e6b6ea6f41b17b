use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::detect::DEFAULT_STATS_WINDOW;
use crate::fit::{FitParams, TargetFeature};

pub const PROJECT_CONFIG_FILE: &str = ".meshprobe.project.yml";
const DEFAULT_INTERVAL_MS: u64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    pub align: bool,
    pub interval_ms: u64,
    pub stats_window: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            align: true,
            interval_ms: DEFAULT_INTERVAL_MS,
            stats_window: DEFAULT_STATS_WINDOW,
        }
    }
}

impl DetectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveConfig {
    pub fit: FitParams,
    pub detection: DetectionConfig,
    /// Database override; `None` keeps the default location.
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown fit target `{0}`")]
    InvalidTarget(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    fit: Option<RawFit>,
    #[serde(default)]
    detection: Option<RawDetection>,
    #[serde(default)]
    store: Option<RawStore>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFit {
    target: Option<String>,
    measurement_accuracy: Option<f32>,
    mean_distance: Option<f32>,
    seed_radius: Option<f32>,
    lateral_extension: Option<u8>,
    radial_expansion: Option<u8>,
    allow_cone_to_cylinder: Option<bool>,
    allow_torus_to_sphere: Option<bool>,
    allow_torus_to_cylinder: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDetection {
    align: Option<bool>,
    interval_ms: Option<u64>,
    stats_window: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStore {
    db_path: Option<String>,
}

/// One parsed file. Every field is optional so later layers only override what they set.
#[derive(Debug, Default)]
struct ConfigLayer {
    target: Option<TargetFeature>,
    fit: RawFit,
    detection: RawDetection,
    db_path: Option<String>,
}

/// Merges user, nearest project and repo config, in that order. Fit tunables are
/// clamped after merging.
pub fn load_effective_config(
    cwd: &Path,
    repo_config: Option<&Path>,
    user_config: Option<&Path>,
    home: &Path,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = EffectiveConfig::default();

    if let Some(path) = user_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_layer(path)?, home);
    }

    if let Some(path) = find_nearest_project_config(cwd) {
        merge_layer(&mut merged, load_config_layer(&path)?, home);
    }

    if let Some(path) = repo_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_layer(path)?, home);
    }

    merged.fit = merged.fit.clamped();
    Ok(merged)
}

pub fn find_nearest_project_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

fn merge_layer(merged: &mut EffectiveConfig, layer: ConfigLayer, home: &Path) {
    let fit = &mut merged.fit;
    if let Some(target) = layer.target {
        fit.target = target;
    }
    let raw = layer.fit;
    override_with(&mut fit.measurement_accuracy, raw.measurement_accuracy);
    override_with(&mut fit.mean_distance, raw.mean_distance);
    override_with(&mut fit.seed_radius, raw.seed_radius);
    override_with(&mut fit.lateral_extension, raw.lateral_extension);
    override_with(&mut fit.radial_expansion, raw.radial_expansion);
    override_with(&mut fit.allow_cone_to_cylinder, raw.allow_cone_to_cylinder);
    override_with(&mut fit.allow_torus_to_sphere, raw.allow_torus_to_sphere);
    override_with(&mut fit.allow_torus_to_cylinder, raw.allow_torus_to_cylinder);

    let detection = &mut merged.detection;
    override_with(&mut detection.align, layer.detection.align);
    override_with(&mut detection.interval_ms, layer.detection.interval_ms);
    override_with(&mut detection.stats_window, layer.detection.stats_window);

    if let Some(path) = layer.db_path {
        merged.db_path = Some(expand_tilde(&path, home));
    }
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn load_config_layer(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_layer(&content)
}

fn parse_config_layer(content: &str) -> Result<ConfigLayer, ConfigError> {
    if content.trim().is_empty() {
        return Ok(ConfigLayer::default());
    }
    let raw: Option<RawConfig> = serde_yaml::from_str(content)?;
    let raw = raw.unwrap_or_default();
    let fit = raw.fit.unwrap_or_default();
    let target = fit
        .target
        .as_deref()
        .map(|value| TargetFeature::parse(value).ok_or_else(|| ConfigError::InvalidTarget(value.to_string())))
        .transpose()?;
    Ok(ConfigLayer {
        target,
        fit,
        detection: raw.detection.unwrap_or_default(),
        db_path: raw.store.and_then(|store| store.db_path),
    })
}

pub fn load_config_file(path: &Path, home: &Path) -> Result<EffectiveConfig, ConfigError> {
    let mut config = EffectiveConfig::default();
    merge_layer(&mut config, load_config_layer(path)?, home);
    config.fit = config.fit.clamped();
    Ok(config)
}

pub fn default_config_yaml() -> String {
    r#"fit:
  target: plane
  measurement_accuracy: 0.015
  mean_distance: 0.15
  seed_radius: 0.15
  lateral_extension: 10
  radial_expansion: 5
  allow_cone_to_cylinder: true
  allow_torus_to_sphere: true
  allow_torus_to_cylinder: true
detection:
  align: true
  interval_ms: 2
  stats_window: 180
"#
    .to_string()
}

pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}
