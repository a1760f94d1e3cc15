//! Project configuration discovery and resolution.
//!
//! A lakeloop project is a directory with a `data/` subtree whose top-level
//! directories are the managed data resources. Configuration is resolved in
//! layers: defaults, then a project-local `lakeloop.toml` (searched upward to
//! the git root), then `LAKELOOP_*` environment variables, then command-line
//! overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Default local port for the service front.
pub const DEFAULT_API_PORT: u16 = 8000;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Resolved project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Human-readable project name
    pub project_name: String,
    /// Normalized identifier used to name provisioned resources
    pub project_slug: String,
    /// Cloud region handed to the infra driver
    pub region: String,
    /// Stack name (one control plane per stack)
    pub stack_name: String,
    /// Project root directory
    pub project_dir: PathBuf,
    /// Watched data root; its immediate children are the managed resources
    pub data_dir: PathBuf,
    /// Local port for the service front
    pub api_port: u16,
}

impl ProjectConfig {
    fn defaults(project_dir: &Path) -> Self {
        Self {
            project_name: "default".to_string(),
            project_slug: "default".to_string(),
            region: "us-east-1".to_string(),
            stack_name: "dev".to_string(),
            project_dir: project_dir.to_path_buf(),
            data_dir: project_dir.join("data"),
            api_port: DEFAULT_API_PORT,
        }
    }

    /// Directory where the local driver keeps its stack state.
    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(".lakeloop")
    }
}

/// Optional fields as they appear in `lakeloop.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    project_name: Option<String>,
    project_slug: Option<String>,
    region: Option<String>,
    stack_name: Option<String>,
    data_dir: Option<PathBuf>,
    api_port: Option<u16>,
}

/// Command-line overrides for configuration
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Path to config file override
    pub config_path: Option<PathBuf>,
    /// Override watched data root
    pub data_dir: Option<PathBuf>,
    /// Override service front port
    pub port: Option<u16>,
    /// Override stack name
    pub stack: Option<String>,
}

/// Resolve configuration from all sources.
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables (`LAKELOOP_*`)
/// 3. Project-local `lakeloop.toml` (current dir, walking up to git root)
/// 4. Defaults
pub fn resolve_config(
    overrides: &ConfigOverrides,
    current_dir: &Path,
) -> Result<ProjectConfig, ConfigError> {
    let mut config = ProjectConfig::defaults(current_dir);

    // 3. Project-local config file
    let file_path = match overrides.config_path {
        Some(ref path) => Some(path.clone()),
        None => find_project_config(current_dir),
    };
    if let Some(path) = file_path {
        match load_config_file(&path) {
            Ok(file_config) => {
                // The config file's directory is the project root
                if overrides.config_path.is_none()
                    && let Some(parent) = path.parent()
                {
                    config.project_dir = parent.to_path_buf();
                    config.data_dir = parent.join("data");
                }
                merge_config(&mut config, file_config);
            }
            Err(e) => warn!("Failed to parse config at {}: {e}", path.display()),
        }
    }

    // 2. Environment variables
    apply_env_overrides(&mut config);

    // 1. Command-line overrides
    apply_cli_overrides(&mut config, overrides);

    Ok(config)
}

/// Find a project-local `lakeloop.toml`, searching current directory and
/// parents up to the git root.
fn find_project_config(current_dir: &Path) -> Option<PathBuf> {
    let mut dir = current_dir;

    loop {
        let config_path = dir.join("lakeloop.toml");
        if config_path.exists() {
            return Some(config_path);
        }

        // Stop at git root
        if dir.join(".git").exists() {
            break;
        }

        dir = dir.parent()?;
    }

    None
}

fn load_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: FileConfig = toml::from_str(&contents)?;
    Ok(config)
}

fn merge_config(base: &mut ProjectConfig, file: FileConfig) {
    if let Some(name) = file.project_name {
        // Slug tracks the name unless explicitly configured
        base.project_slug = slugify(&name);
        base.project_name = name;
    }
    if let Some(slug) = file.project_slug {
        base.project_slug = slug;
    }
    if let Some(region) = file.region {
        base.region = region;
    }
    if let Some(stack) = file.stack_name {
        base.stack_name = stack;
    }
    if let Some(data_dir) = file.data_dir {
        base.data_dir = if data_dir.is_absolute() {
            data_dir
        } else {
            base.project_dir.join(data_dir)
        };
    }
    if let Some(port) = file.api_port {
        base.api_port = port;
    }
}

fn apply_env_overrides(config: &mut ProjectConfig) {
    if let Ok(name) = std::env::var("LAKELOOP_PROJECT_NAME") {
        config.project_slug = slugify(&name);
        config.project_name = name;
    }
    if let Ok(slug) = std::env::var("LAKELOOP_PROJECT_SLUG") {
        config.project_slug = slug;
    }
    if let Ok(region) = std::env::var("LAKELOOP_REGION") {
        config.region = region;
    }
    if let Ok(stack) = std::env::var("LAKELOOP_STACK") {
        config.stack_name = stack;
    }
    if let Ok(port) = std::env::var("LAKELOOP_API_PORT")
        && let Ok(port) = port.parse()
    {
        config.api_port = port;
    }
}

fn apply_cli_overrides(config: &mut ProjectConfig, overrides: &ConfigOverrides) {
    if let Some(ref data_dir) = overrides.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(port) = overrides.port {
        config.api_port = port;
    }
    if let Some(ref stack) = overrides.stack {
        config.stack_name = stack.clone();
    }
}

/// Lowercase a project name and collapse everything non-alphanumeric to `_`,
/// suitable for resource naming.
fn slugify(raw: &str) -> String {
    crate::stack::normalize_resource_name(raw)
}
