//! Application configuration.
//!
//! Settings come from an optional TOML file; every field has a default so the
//! binary runs with no config at all. Extra agent variants can be declared in
//! the file, which keeps adding a domain a data change rather than a code
//! change.

use crate::domain::variant::{self, VariantDescriptor};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DEFAULT_CONFIG_PATH: &str = "config/ds-agents.toml";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ENDPOINT: &str = "https://api.openai.com";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_LAUNCHER: &str = "ds-mcp/scripts/run_mcp_server.sh";
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 180;
const DEFAULT_MAX_TOOL_STEPS: usize = 8;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key_env: String,
    /// Launcher script for the MCP tool server, `~`-expanded.
    pub launcher: PathBuf,
    /// Interpreter identity exported to the tool-server subprocess.
    pub python: Option<String>,
    /// Bounds the handshake and each individual tool call.
    pub session_timeout: Duration,
    pub max_tool_steps: usize,
    /// Variants declared in the config file, keyed by CLI alias.
    pub variants: Vec<(String, VariantDescriptor)>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            launcher: PathBuf::from(DEFAULT_LAUNCHER),
            python: None,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            max_tool_steps: DEFAULT_MAX_TOOL_STEPS,
            variants: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    model: Option<String>,
    endpoint: Option<String>,
    api_key_env: Option<String>,
    launcher: Option<String>,
    python: Option<String>,
    session_timeout_secs: Option<u64>,
    max_tool_steps: Option<usize>,
    #[serde(default)]
    variants: Vec<RawVariant>,
}

#[derive(Debug, Deserialize)]
struct RawVariant {
    alias: String,
    name: Option<String>,
    #[serde(default)]
    instructions: String,
    base_tools: Option<Vec<String>>,
    #[serde(default)]
    extra_tools: Vec<String>,
    launch_key: Option<String>,
}

impl AppConfig {
    /// Load from an explicit path, or from the default path when it exists,
    /// or fall back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!("No config file found; using built-in defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err),
        }
    }

    /// Resolve a variant by CLI alias: config-declared first, then built-ins.
    pub fn find_variant(&self, alias: &str) -> Option<VariantDescriptor> {
        self.variants
            .iter()
            .find(|(key, _)| key == alias)
            .map(|(_, variant)| variant.clone())
            .or_else(|| variant::builtin(alias))
    }

    /// Aliases available for `--agent`, config-declared ones first.
    pub fn variant_aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.variants.iter().map(|(key, _)| key.clone()).collect();
        for (key, _) in variant::builtin_variants() {
            if !aliases.iter().any(|a| a == key) {
                aliases.push(key.to_string());
            }
        }
        aliases
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(from_raw(raw))
}

fn from_raw(raw: RawConfig) -> AppConfig {
    let defaults = AppConfig::default();
    let launcher = raw
        .launcher
        .map(|value| PathBuf::from(shellexpand::tilde(&value).into_owned()))
        .unwrap_or(defaults.launcher);
    let variants = raw
        .variants
        .into_iter()
        .map(|entry| {
            let descriptor = VariantDescriptor {
                name: entry.name.unwrap_or_else(|| entry.alias.clone()),
                instructions: entry.instructions,
                base_tools: entry.base_tools.unwrap_or_else(|| {
                    variant::BASE_TOOLS.iter().map(|t| t.to_string()).collect()
                }),
                extra_tools: entry.extra_tools,
                launch_key: entry.launch_key,
            };
            (entry.alias, descriptor)
        })
        .collect();

    AppConfig {
        model: raw.model.unwrap_or(defaults.model),
        endpoint: raw.endpoint.unwrap_or(defaults.endpoint),
        api_key_env: raw.api_key_env.unwrap_or(defaults.api_key_env),
        launcher,
        python: raw.python,
        session_timeout: raw
            .session_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.session_timeout),
        max_tool_steps: raw.max_tool_steps.unwrap_or(defaults.max_tool_steps),
        variants,
    }
}
