use anyhow::{Context, Result};
use std::path::PathBuf;

use pulse_types::config::PulseConfig;

/// Returns the Pulse home directory (~/.pulse/)
pub fn pulse_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".pulse"))
}

/// Returns the path to the config file (~/.pulse/config.toml)
pub fn config_path() -> Result<PathBuf> {
    Ok(pulse_home()?.join("config.toml"))
}

/// Returns the client storage database path (~/.pulse/client.db)
pub fn client_db_path() -> Result<PathBuf> {
    Ok(pulse_home()?.join("client.db"))
}

/// Load config from disk, creating default if it doesn't exist.
pub fn load_config() -> Result<PulseConfig> {
    let path = config_path()?;

    if !path.exists() {
        let home = pulse_home()?;
        std::fs::create_dir_all(&home)
            .with_context(|| format!("Failed to create {}", home.display()))?;

        let default = PulseConfig::default();
        save_config_to(&default, &path)?;
        return Ok(default);
    }

    load_config_from(&path)
}

pub fn load_config_from(path: &std::path::Path) -> Result<PulseConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: PulseConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// Save config to disk, overwriting the existing file.
pub fn save_config_to(config: &PulseConfig, path: &std::path::Path) -> Result<()> {
    let toml_str = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}
