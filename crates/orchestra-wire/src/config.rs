//! Configuration loading.

use orchestra_types::OrchestrationConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable that overrides the configured port.
pub const PORT_ENV: &str = "ORCHESTRA_PORT";

/// Load configuration from a TOML file, falling back to defaults for a
/// missing or unreadable file, then apply environment overrides.
pub fn load_config(path: Option<&Path>) -> OrchestrationConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    let config = if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<OrchestrationConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    config
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                    OrchestrationConfig::default()
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
                OrchestrationConfig::default()
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        OrchestrationConfig::default()
    };

    apply_env_overrides(config, |name| std::env::var(name).ok())
}

fn apply_env_overrides(
    mut config: OrchestrationConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> OrchestrationConfig {
    if let Some(raw) = lookup(PORT_ENV) {
        match raw.trim().parse::<u16>() {
            Ok(port) => config.port = port,
            Err(e) => warn!(value = %raw, "Ignoring invalid {PORT_ENV}: {e}"),
        }
    }
    config
}

/// `~/.orchestra/config.toml`.
pub fn default_config_path() -> PathBuf {
    orchestra_home().join("config.toml")
}

/// `~/.orchestra`, or a temp directory when there is no home.
pub fn orchestra_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".orchestra")
}
