use anyhow::{Context, Result};
use facecheck_core::{AggregatorConfig, AnalysisConfig, IngestLimits};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI settings: defaults, then an optional TOML file, then `FACECHECK_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub analysis: AnalysisConfig,
    pub aggregator: AggregatorConfig,
    pub ingest: IngestLimits,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_dir: facecheck_models::default_model_dir(),
            analysis: AnalysisConfig::default(),
            aggregator: AggregatorConfig::default(),
            ingest: IngestLimits::default(),
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `FACECHECK_*` variables. Unparseable values are logged and
    /// ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("FACECHECK_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        env_parse(&var, "FACECHECK_DETECTOR_BACKEND", &mut self.analysis.detector_backend);
        env_parse(&var, "FACECHECK_DISTANCE_METRIC", &mut self.analysis.distance_metric);
        if let Some(v) = var("FACECHECK_ENFORCE_DETECTION") {
            self.analysis.enforce_detection = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        let mut threshold = f32::NAN;
        if env_parse(&var, "FACECHECK_THRESHOLD", &mut threshold) {
            self.analysis.threshold = Some(threshold);
        }
        env_parse(&var, "FACECHECK_WORKERS", &mut self.aggregator.workers);
        env_parse(&var, "FACECHECK_TIMEOUT_SECS", &mut self.aggregator.timeout_secs);
        env_parse(&var, "FACECHECK_MAX_UPLOAD_BYTES", &mut self.ingest.max_upload_bytes);
    }

    fn validate(&self) -> Result<()> {
        if let Some(threshold) = self.analysis.threshold {
            anyhow::ensure!(
                threshold.is_finite() && threshold >= 0.0,
                "threshold must be a non-negative number, got {threshold}"
            );
        }
        anyhow::ensure!(self.aggregator.workers >= 1, "workers must be at least 1");
        anyhow::ensure!(self.aggregator.timeout_secs >= 1, "timeout_secs must be at least 1");
        Ok(())
    }
}

/// Parse `key` into `slot` if set and valid. Returns whether `slot` changed.
fn env_parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> bool
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = var(key) else {
        return false;
    };
    match raw.trim().parse() {
        Ok(value) => {
            *slot = value;
            true
        }
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment override");
            false
        }
    }
}
