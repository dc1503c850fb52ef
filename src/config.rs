//! Configuration: a `config.yaml` created with defaults on first run,
//! validated on load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default embedding model (384 dimensions, matches the corpus embeddings)
const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
/// Default similarity threshold for section matching
const DEFAULT_MATCH_THRESHOLD: f32 = 0.78;
/// Default cap on matched sections before page aggregation
const DEFAULT_MATCH_LIMIT: usize = 10;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Remote backend credentials: an anonymous, read-scoped key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub anon_key: String,
}

/// Tuning for the local similarity search.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchTuning {
    /// Embedding model name (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,

    /// Sections must score strictly above this dot product to match
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,

    /// Maximum matched sections before page aggregation
    #[serde(default = "default_match_limit")]
    pub match_limit: usize,

    /// Keep sections flagged `rag_ignore` in results. The original
    /// retrieval query does not filter them, so this defaults to true;
    /// set false to exclude them.
    #[serde(default = "default_include_ignored")]
    pub include_ignored_sections: bool,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for SearchTuning {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            match_limit: DEFAULT_MATCH_LIMIT,
            include_ignored_sections: true,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_match_threshold() -> f32 {
    DEFAULT_MATCH_THRESHOLD
}

fn default_match_limit() -> usize {
    DEFAULT_MATCH_LIMIT
}

fn default_include_ignored() -> bool {
    true
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub search: SearchTuning,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) {
        let search = &self.search;

        if search.model.is_empty() {
            panic!("search.model must not be empty");
        }

        if !(-1.0..=1.0).contains(&search.match_threshold) {
            panic!(
                "search.match_threshold must be between -1.0 and 1.0, got {}",
                search.match_threshold
            );
        }

        if search.match_limit == 0 {
            panic!("search.match_limit must be greater than 0");
        }

        if search.download_timeout_secs == 0 {
            panic!("search.download_timeout_secs must be greater than 0");
        }
    }

    pub fn load_with(base_path: &Path) -> Self {
        let config_path = base_path.join("config.yaml");

        // create new if does not exist
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent).expect("cannot create config directory");
            }
            std::fs::write(
                &config_path,
                serde_yml::to_string(&Self::default()).unwrap().as_bytes(),
            )
            .expect("cannot write default config");
        }

        let config_str =
            std::fs::read_to_string(&config_path).expect("config file is not readable");
        let mut config: Self = serde_yml::from_str(&config_str).expect("config is malformed");

        config.base_path = base_path.to_path_buf();

        config.validate();

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config).unwrap() {
            config.save();
        }

        config
    }

    pub fn save(&self) {
        let config_str = serde_yml::to_string(&self).unwrap();
        std::fs::write(self.base_path.join("config.yaml"), config_str.as_bytes())
            .expect("cannot write config");
    }

    /// Directory for downloaded model files.
    pub fn cache_dir(&self) -> PathBuf {
        self.base_path.clone()
    }
}
