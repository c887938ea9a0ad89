use std::{
    error::Error,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, ensure};
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

use crate::{error::EngineError, models::Settings};

const SETTINGS_FILE: &str = "settings.json";

/// Owns `settings.json` and broadcasts the active settings.
#[derive(Debug)]
pub struct SettingsHandler {
    settings_file_path: PathBuf,
    watch_tx: watch::Sender<Settings>,
}

impl SettingsHandler {
    /// Loads settings from `app_dir`, falling back to defaults when the file is missing or broken.
    #[instrument(skip(app_dir))]
    pub fn new(app_dir: &Path) -> Arc<Self> {
        let handler = Arc::new(Self {
            settings_file_path: app_dir.join(SETTINGS_FILE),
            watch_tx: watch::Sender::new(Settings::default()),
        });

        let settings = match handler.load_settings() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, "Failed to load settings, using defaults");
                handler.load_default_settings()
            }
        };
        handler.on_settings_change(settings);
        handler
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.watch_tx.subscribe()
    }

    pub fn current(&self) -> Settings {
        self.watch_tx.borrow().clone()
    }

    /// Validates, persists and activates new settings.
    #[instrument(skip(self, settings), err)]
    pub fn update(&self, settings: Settings) -> Result<()> {
        validate(&settings)?;
        self.save_settings(&settings)?;
        self.on_settings_change(settings);
        Ok(())
    }

    fn on_settings_change(&self, settings: Settings) {
        self.watch_tx.send_if_modified(|s| {
            if s != &settings {
                debug!(settings = ?settings, "Active settings changed");
                *s = settings;
                true
            } else {
                trace!("Settings unchanged");
                false
            }
        });
    }

    #[instrument(skip(self))]
    fn load_settings(&self) -> Result<Settings> {
        if !self.settings_file_path.exists() {
            info!(path = %self.settings_file_path.display(), "Settings file doesn't exist, using defaults");
            return Ok(self.load_default_settings());
        }

        info!(path = %self.settings_file_path.display(), "Loading settings from file");
        let content = fs_err::read_to_string(&self.settings_file_path)?;
        let raw: serde_json::Value =
            serde_json::from_str(&content).context("Failed to parse settings file")?;
        let settings: Settings =
            serde_json::from_value(raw.clone()).context("Failed to parse settings file")?;
        validate(&settings)?;

        // The installation id must stay stable once generated
        if raw.get("installation_id").is_none() {
            debug!("Persisting newly generated installation id");
            self.save_settings(&settings)?;
        }

        debug!("Loaded application settings successfully");
        Ok(settings)
    }

    #[instrument(skip(self, settings), err)]
    fn save_settings(&self, settings: &Settings) -> Result<()> {
        info!(path = %self.settings_file_path.display(), "Saving settings to file");
        let settings_json =
            serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;

        if let Some(parent) = self.settings_file_path.parent()
            && !parent.exists()
        {
            info!(path = %parent.display(), "Creating settings directory");
            fs_err::create_dir_all(parent)?;
        }

        // Written next to the target first so a crash never leaves a truncated file
        let tmp_path = self.settings_file_path.with_extension("json.tmp");
        fs_err::write(&tmp_path, settings_json)?;
        fs_err::rename(&tmp_path, &self.settings_file_path)?;
        Ok(())
    }

    /// Defaults, persisted when possible so the installation id survives restarts.
    fn load_default_settings(&self) -> Settings {
        let settings = Settings::default();
        if let Err(e) = self.save_settings(&settings) {
            warn!(error = e.as_ref() as &dyn Error, "Failed to persist default settings");
        }
        settings
    }
}

fn validate(settings: &Settings) -> Result<()> {
    ensure!(
        !settings.downloads_location.trim().is_empty(),
        EngineError::validation("Downloads location must not be empty")
    );
    ensure!(
        !settings.backups_location.trim().is_empty(),
        EngineError::validation("Backups location must not be empty")
    );
    ensure!(
        settings.recent_tasks_limit > 0,
        EngineError::validation("Recent tasks limit must be at least 1")
    );
    ensure!(
        !settings.installation_id.trim().is_empty(),
        EngineError::validation("Installation id must not be empty")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, kind_of};

    #[test]
    fn defaults_are_persisted_with_a_stable_installation_id() {
        let dir = tempfile::tempdir().unwrap();
        let handler = SettingsHandler::new(dir.path());
        let first = handler.current();
        assert!(dir.path().join(SETTINGS_FILE).exists());

        let reloaded = SettingsHandler::new(dir.path()).current();
        assert_eq!(reloaded.installation_id, first.installation_id);
    }

    #[test]
    fn update_persists_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let handler = SettingsHandler::new(dir.path());
        let mut rx = handler.subscribe();
        rx.mark_unchanged();

        let settings = Settings { adb_path: "/opt/adb".into(), ..handler.current() };
        handler.update(settings.clone()).unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().adb_path, "/opt/adb");
        assert_eq!(SettingsHandler::new(dir.path()).current(), settings);
        assert!(!dir.path().join("settings.json.tmp").exists());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handler = SettingsHandler::new(dir.path());
        let before = handler.current();

        let err = handler
            .update(Settings { downloads_location: " ".into(), ..before.clone() })
            .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Validation));
        assert_eq!(handler.current(), before);
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "{ not json").unwrap();

        let settings = SettingsHandler::new(dir.path()).current();
        assert_eq!(settings.network_retry_attempts, Settings::default().network_retry_attempts);
        let saved = std::fs::read_to_string(dir.path().join(SETTINGS_FILE)).unwrap();
        assert!(saved.contains(&settings.installation_id));
    }

    #[test]
    fn missing_installation_id_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), r#"{"adb_path": "/opt/adb"}"#).unwrap();

        let first = SettingsHandler::new(dir.path()).current();
        let second = SettingsHandler::new(dir.path()).current();
        assert_eq!(first.adb_path, "/opt/adb");
        assert_eq!(first.installation_id, second.installation_id);
    }
}
