//! Loads/saves the one persisted record (spec.md §6 "Persisted state") as
//! JSON under the OS config directory.

use directories::ProjectDirs;
use sharefile_protocol::{Configuration, PersistedConfig};
use tracing::warn;

fn config_path() -> Option<std::path::PathBuf> {
    let dirs = ProjectDirs::from("", "", "sharefile")?;
    Some(dirs.config_dir().join("config.json"))
}

/// Load the persisted configuration. Any failure — no config directory, a
/// missing file, corrupt JSON — falls back to [`Configuration::default`]
/// and logs a warning; this is never a fatal error.
pub fn load() -> Configuration {
    let Some(path) = config_path() else {
        return Configuration::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str::<PersistedConfig>(&raw) {
            Ok(persisted) => persisted.into(),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "corrupt config, using defaults");
                Configuration::default()
            }
        },
        Err(e) => {
            warn!(error = %e, path = %path.display(), "no config on disk, using defaults");
            Configuration::default()
        }
    }
}

/// Persist `cfg`. Failures are logged and swallowed — losing the save is
/// never worse than the transfer it would have interrupted.
pub fn save(cfg: &Configuration) {
    let Some(path) = config_path() else {
        return;
    };
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(error = %e, "failed to create config directory");
            return;
        }
    }
    let persisted: PersistedConfig = cfg.clone().into();
    match serde_json::to_string_pretty(&persisted) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&path, json) {
                warn!(error = %e, path = %path.display(), "failed to write config");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize config"),
    }
}
