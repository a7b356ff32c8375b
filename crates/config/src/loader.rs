use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::RecordsealConfig, validate};

/// Config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["recordseal.toml", "recordseal.json"];

/// Load config from the given path (`.toml` or `.json`).
pub fn load_config(path: &Path) -> anyhow::Result<RecordsealConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(&raw)?),
        "json" => Ok(serde_json::from_str(&raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Discover and load config from standard locations.
///
/// Search order: `./recordseal.{toml,json}`, then the user config dir.
/// Falls back to defaults when nothing is found, the file does not parse,
/// or validation reports errors.
pub fn discover_and_load() -> RecordsealConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return RecordsealConfig::default();
    };

    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => {
            let result = validate(&cfg);
            for d in &result.diagnostics {
                warn!(path = %d.path, severity = %d.severity, "{}", d.message);
            }
            if result.has_errors() {
                warn!(path = %path.display(), "invalid config, using defaults");
                return RecordsealConfig::default();
            }
            cfg
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            RecordsealConfig::default()
        },
    }
}

/// First existing config file in the standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists());
    if local.is_some() {
        return local;
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// User-global config directory (`~/.config/recordseal/` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "recordseal").map(|d| d.config_dir().to_path_buf())
}

/// Data directory holding the database. Falls back to `./.recordseal`.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "recordseal")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".recordseal"))
}

/// Resolve the database file for `config`.
pub fn default_database_path(config: &RecordsealConfig) -> PathBuf {
    config
        .storage
        .database_path
        .clone()
        .unwrap_or_else(|| data_dir().join("recordseal.db"))
}
