//! Configuration file management for swarm.
//!
//! Provides a TOML-based config file at `~/.config/swarm/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use swarm_core::config::SwarmConfig;
use swarm_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub orchestrator: SwarmConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PlannerSection {
    /// Endpoint of the HTTP planner service. When absent, every submission
    /// decomposes through the single-subtask fallback.
    pub url: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the swarm config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/swarm` or `~/.config/swarm`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("swarm");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("swarm")
}

/// Return the path to the swarm config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Set permissions to 0600 (owner read/write only) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct SwarmCliConfig {
    pub db_config: DbConfig,
    pub planner_url: Option<String>,
    pub orchestrator: SwarmConfig,
}

impl SwarmCliConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `SWARM_DATABASE_URL` env >
    ///   `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Planner URL: `SWARM_PLANNER_URL` env > `config_file.planner.url` >
    ///   none (fallback decomposition only)
    /// - Orchestrator knobs: `config_file.orchestrator` > defaults
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        // DB URL resolution.
        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("SWARM_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        // Planner URL resolution.
        let planner_url = if let Ok(url) = std::env::var("SWARM_PLANNER_URL") {
            Some(url)
        } else {
            file_config
                .as_ref()
                .and_then(|cfg| cfg.planner.url.clone())
        };

        let orchestrator = file_config
            .map(|cfg| cfg.orchestrator)
            .unwrap_or_default();

        let db_config = DbConfig::new(db_url).with_pool_bounds(
            orchestrator.durable_store_pool_min,
            orchestrator.durable_store_pool_max,
        );

        Ok(Self {
            db_config,
            planner_url,
            orchestrator,
        })
    }
}
