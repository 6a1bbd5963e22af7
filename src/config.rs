use std::{env, fs, path::PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::EngineError;

/// Well-known configuration keys the engine reads at bootstrap.
pub mod keys {
    pub const GATEWAY_URL: &str = "GATEWAY_URL";
    pub const GATEWAY_TOKEN: &str = "GATEWAY_TOKEN";
    pub const OLLAMA_URL: &str = "OLLAMA_URL";
    pub const OLLAMA_KEY: &str = "OLLAMA_KEY";
    pub const OLLAMA_MODEL: &str = "OLLAMA_MODEL";
}

/// Key/value configuration behind the engine: gateway credentials, LLM
/// endpoints, tuning knobs. Backends differ in durability only.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), EngineError>;
    async fn del(&self, key: &str);

    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                pairs.push((key, value));
            }
        }
        pairs
    }
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

/// Process-environment backend. Loads a `.env` file on construction and
/// mirrors writes back into it so restarts keep their settings.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(env_file.clone()).ok();
            info!("loaded .env from {}", env_file.display());
        } else {
            warn!("no .env at {}, starting from process env", env_file.display());
        }

        Box::new(Self { env_file })
    }

    /// `.env` content with `key` set to `value`, or removed when `None`.
    /// Unrelated lines, comments included, pass through untouched.
    fn rewritten(content: &str, key: &str, value: Option<&str>) -> String {
        let mut lines: Vec<String> = content
            .lines()
            .filter_map(|line| match line.split_once('=') {
                Some((k, _)) if k.trim() == key => None,
                _ => Some(line.to_string()),
            })
            .collect();
        if let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
        lines.join("\n")
    }

    fn persist(&self, key: &str, value: Option<&str>) -> Result<(), EngineError> {
        let current = fs::read_to_string(&self.env_file).unwrap_or_default();
        let next = Self::rewritten(&current, key, value);
        fs::write(&self.env_file, next).map_err(|e| {
            EngineError::Configuration(format!(
                "could not rewrite {}: {e}",
                self.env_file.display()
            ))
        })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
        unsafe {
            env::set_var(key, value);
        };
        self.persist(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if let Err(e) = self.persist(key, None) {
            warn!(key, error = %e, "could not remove key from .env");
        }
    }
}

/// In-memory backend for tests and embedding.
#[derive(Debug, Clone)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            map: DashMap::new(),
        })
    }

    pub fn with(pairs: &[(&str, &str)]) -> Box<Self> {
        let mgr = Self::new();
        for (k, v) in pairs {
            mgr.map.insert((*k).to_string(), (*v).to_string());
        }
        mgr
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.value().clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }
}
