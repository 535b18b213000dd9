use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration: defaults, overlaid by an optional TOML file,
/// overlaid by `VISAGER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the organised photo library (Inbox, Unsorted, person folders...).
    pub photos_root: PathBuf,
    /// Path to the identity store document.
    pub store_path: PathBuf,
    /// Embedding model tag; stores written under another tag are discarded.
    pub model_tag: String,
    /// Cosine distance below which a face matches an identity.
    pub match_threshold: f32,
    /// Recognizer program followed by its arguments.
    pub backend_command: Vec<String>,
    /// Longest a single recognition job may run before the backend is killed.
    pub job_timeout_secs: u64,
    /// Longest the backend may take to report ready after spawning.
    pub startup_timeout_secs: u64,
}

/// Keys accepted in the config file. All optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    photos_root: Option<PathBuf>,
    store_path: Option<PathBuf>,
    model_tag: Option<String>,
    match_threshold: Option<f32>,
    backend_command: Option<Vec<String>>,
    job_timeout_secs: Option<u64>,
    startup_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/share"))
            .join("visager");

        Self {
            photos_root: home.join("Pictures").join("Visager"),
            store_path: data_dir.join("identities.json"),
            model_tag: "ArcFace".to_string(),
            match_threshold: visager_core::DEFAULT_MATCH_THRESHOLD,
            backend_command: vec!["visager-recognizer".to_string()],
            job_timeout_secs: 300,
            startup_timeout_secs: 120,
        }
    }
}

impl Config {
    /// Load configuration from the config file (if present) and `VISAGER_*`
    /// environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let explicit = std::env::var("VISAGER_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(default_config_path);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                config.apply_file(&path, &text)?;
                tracing::info!(path = %path.display(), "config file loaded");
            }
            // Only an explicitly named file is required to exist.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {}
            Err(source) => return Err(ConfigError::Read { path, source }),
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path, text: &str) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(v) = file.photos_root {
            self.photos_root = v;
        }
        if let Some(v) = file.store_path {
            self.store_path = v;
        }
        if let Some(v) = file.model_tag {
            self.model_tag = v;
        }
        if let Some(v) = file.match_threshold {
            self.match_threshold = v;
        }
        if let Some(v) = file.backend_command.filter(|c| !c.is_empty()) {
            self.backend_command = v;
        }
        if let Some(v) = file.job_timeout_secs {
            self.job_timeout_secs = v;
        }
        if let Some(v) = file.startup_timeout_secs {
            self.startup_timeout_secs = v;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("VISAGER_PHOTOS_ROOT") {
            self.photos_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VISAGER_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VISAGER_MODEL_TAG") {
            self.model_tag = v;
        }
        if let Ok(v) = std::env::var("VISAGER_BACKEND_COMMAND") {
            let parts: Vec<String> = v.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                self.backend_command = parts;
            }
        }
        self.match_threshold = env_f32("VISAGER_MATCH_THRESHOLD", self.match_threshold);
        self.job_timeout_secs = env_u64("VISAGER_JOB_TIMEOUT_SECS", self.job_timeout_secs);
        self.startup_timeout_secs =
            env_u64("VISAGER_STARTUP_TIMEOUT_SECS", self.startup_timeout_secs);
    }

    /// Configuration rooted at `root`, for tests and embedding.
    pub fn with_root(root: &Path) -> Self {
        Self {
            photos_root: root.join("photos"),
            store_path: root.join("identities.json"),
            ..Self::default()
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("visager")
        .join("config.toml")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
