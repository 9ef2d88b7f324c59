use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const DEFAULT_MODEL_NAME: &str = "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF";
pub const DEFAULT_MODEL_FILE: &str = "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf";
pub const DEFAULT_TOKENIZER_REPO: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
pub const DEFAULT_MODEL_PATH: &str = "./models";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PORT must be a number between 0 and 65535, got `{0}`")]
    InvalidPort(String),
}

/// Startup configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Registry id of the repository holding the GGUF weights.
    pub model_name: String,
    pub model_file: String,
    pub tokenizer_repo: String,
    /// Root directory for the weight cache.
    pub model_path: String,
    pub port: u16,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw.clone()))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            model_name: get("MODEL_NAME", DEFAULT_MODEL_NAME),
            model_file: get("MODEL_FILE", DEFAULT_MODEL_FILE),
            tokenizer_repo: get("TOKENIZER_REPO", DEFAULT_TOKENIZER_REPO),
            model_path: get("MODEL_PATH", DEFAULT_MODEL_PATH),
            port,
            log_level: get("RUST_LOG", DEFAULT_LOG_LEVEL),
        })
    }

    /// Cache directory for this model: `<model_path>/<model_name with '/' -> '_'>`.
    pub fn model_location(&self) -> PathBuf {
        Path::new(&self.model_path).join(self.model_name.replace('/', "_"))
    }
}
