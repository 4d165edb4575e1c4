use crate::error::{GatewayError, Result};
use crate::server::GatewayOptions;
use crate::upstream::{EchoClient, GenerationClient, Model, StaticModelCatalog};
use crate::usage::{JsonlUsageSink, TracingUsageSink, UsageSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Generation backend. Only `"echo"` is built in; leave unset to run without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    /// JSONL file receiving one usage record per completed generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default = "default_owner")]
    pub owned_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl ModelEntry {
    fn to_model(&self) -> Model {
        Model {
            id: self.id.clone(),
            owned_by: self.owned_by.clone(),
            display_name: self.display_name.clone().unwrap_or_else(|| self.id.clone()),
            created: self.created.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4222
}

fn default_owner() -> String {
    "modelgate".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backend: None,
            models: Vec::new(),
            usage_log: None,
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir. Defaults apply when none exists.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Wire the configured collaborators.
    pub fn build_options(&self) -> Result<GatewayOptions> {
        let mut options = GatewayOptions::default();

        if let Some(backend) = self.backend.as_deref() {
            let client: Arc<dyn GenerationClient> = match backend {
                "echo" => Arc::new(EchoClient),
                other => {
                    return Err(GatewayError::config(format!(
                        "Unknown backend '{other}'. Known backends: echo"
                    )));
                }
            };
            options = options.with_upstream(client);
        }

        if !self.models.is_empty() {
            let models = self.models.iter().map(ModelEntry::to_model).collect();
            options = options.with_catalog(Arc::new(StaticModelCatalog::new(models)));
        }

        let sink: Arc<dyn UsageSink> = match &self.usage_log {
            Some(path) => Arc::new(JsonlUsageSink::open(path)?),
            None => Arc::new(TracingUsageSink),
        };
        Ok(options.with_usage_sink(sink))
    }
}

/// Candidate config files, highest priority first.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("modelgate.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("modelgate")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("modelgate").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("modelgate").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".modelgate.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
