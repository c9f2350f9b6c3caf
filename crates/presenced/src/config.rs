use presence_core::{CropConfig, ModelPaths, PipelineConfig, DEFAULT_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Daemon configuration.
///
/// Defaults, then the TOML file named by `PRESENCE_CONFIG` (if any), then
/// `PRESENCE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Gallery file (JSON).
    pub gallery_path: PathBuf,
    /// Enrollment corpus: one sub-directory of images per identity.
    pub corpus_dir: PathBuf,
    /// Scratch directory for per-request face crops.
    pub scratch_dir: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Minimum anti-spoof confidence for a live verdict.
    pub min_liveness_confidence: f32,
    /// Crop the detected face (plus margin) before embedding.
    pub crop_enabled: bool,
    pub crop_margin: u32,
    pub crop_size: u32,
    /// Fail embedding when the detector backend finds no face.
    pub enforce_detection: bool,
    /// Number of model worker threads, each with its own model set.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        let crop = CropConfig::default();
        Self {
            model_dir: data_dir.join("models"),
            gallery_path: data_dir.join("embeddings.json"),
            corpus_dir: data_dir.join("dataset"),
            scratch_dir: std::env::temp_dir(),
            similarity_threshold: DEFAULT_THRESHOLD,
            min_liveness_confidence: 0.0,
            crop_enabled: true,
            crop_margin: crop.margin,
            crop_size: crop.size,
            enforce_detection: true,
            workers: 2,
        }
    }
}

impl Config {
    /// Load from the optional config file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("PRESENCE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Override fields from `PRESENCE_*` variables. Unparseable values are ignored.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        let path = |key: &str| get(key).map(PathBuf::from);

        if let Some(v) = path("PRESENCE_MODEL_DIR") {
            self.model_dir = v;
        }
        if let Some(v) = path("PRESENCE_GALLERY_PATH") {
            self.gallery_path = v;
        }
        if let Some(v) = path("PRESENCE_CORPUS_DIR") {
            self.corpus_dir = v;
        }
        if let Some(v) = path("PRESENCE_SCRATCH_DIR") {
            self.scratch_dir = v;
        }
        env_parse(&get, "PRESENCE_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        env_parse(&get, "PRESENCE_MIN_LIVENESS_CONFIDENCE", &mut self.min_liveness_confidence);
        env_parse(&get, "PRESENCE_CROP_MARGIN", &mut self.crop_margin);
        env_parse(&get, "PRESENCE_CROP_SIZE", &mut self.crop_size);
        env_parse(&get, "PRESENCE_WORKERS", &mut self.workers);
        if let Some(v) = get("PRESENCE_CROP_ENABLED") {
            self.crop_enabled = v != "0";
        }
        if let Some(v) = get("PRESENCE_ENFORCE_DETECTION") {
            self.enforce_detection = v != "0";
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            threshold: self.similarity_threshold,
            min_liveness_confidence: self.min_liveness_confidence,
            crop: self.crop_enabled.then(|| CropConfig {
                margin: self.crop_margin,
                size: self.crop_size,
            }),
            scratch_dir: self.scratch_dir.clone(),
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }
}

/// `$XDG_DATA_HOME/presence`, falling back to `~/.local/share/presence`.
fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

fn env_parse<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(v) = get(key).and_then(|v| v.parse().ok()) {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.similarity_threshold, 0.75);
        assert_eq!((c.crop_margin, c.crop_size), (20, 250));
        assert!(c.enforce_detection);
        let p = c.pipeline_config();
        assert_eq!(p.crop, Some(CropConfig { margin: 20, size: 250 }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PRESENCE_SIMILARITY_THRESHOLD", "0.6"),
            ("PRESENCE_CROP_ENABLED", "0"),
            ("PRESENCE_WORKERS", "not-a-number"),
            ("PRESENCE_GALLERY_PATH", "/var/lib/presence/g.json"),
        ]
        .into_iter()
        .collect();

        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(c.similarity_threshold, 0.6);
        assert_eq!(c.workers, 2);
        assert_eq!(c.gallery_path, PathBuf::from("/var/lib/presence/g.json"));
        assert!(c.pipeline_config().crop.is_none());
    }

    #[test]
    fn test_toml_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.toml");
        std::fs::write(&path, "similarity_threshold = 0.8\ncorpus_dir = \"/srv/dataset\"\n").unwrap();

        let c = Config::from_file(&path).unwrap();
        assert_eq!(c.similarity_threshold, 0.8);
        assert_eq!(c.corpus_dir, PathBuf::from("/srv/dataset"));
        assert_eq!(c.crop_size, 250);
    }

    #[test]
    fn test_toml_file_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.toml");
        std::fs::write(&path, "workers = \"many\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Toml(_))));
    }
}
