// SettingsManager Service
// Handles relay settings persistence

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;

use crate::models::Settings;

pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Manages relay settings storage and retrieval
pub struct SettingsManager {
    settings_path: PathBuf,
    cache: RwLock<Option<Settings>>,
}

impl SettingsManager {
    /// Create a new SettingsManager with the given data directory
    pub fn new(data_dir: &Path) -> Self {
        Self {
            settings_path: data_dir.join(SETTINGS_FILE_NAME),
            cache: RwLock::new(None),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Load settings from disk, or return defaults if not found
    ///
    /// Keys missing from the file are filled from defaults and written back.
    pub fn load(&self) -> Result<Settings, String> {
        if let Ok(cache) = self.cache.read() {
            if let Some(ref settings) = *cache {
                return Ok(settings.clone());
            }
        }

        let settings = if self.settings_path.exists() {
            let content = std::fs::read_to_string(&self.settings_path)
                .map_err(|e| format!("Failed to read settings: {e}"))?;

            let mut user_value: Value = serde_json::from_str(&content)
                .map_err(|e| format!("Failed to parse settings: {e}"))?;

            let defaults_value = serde_json::to_value(Settings::default())
                .map_err(|e| format!("Failed to build default settings: {e}"))?;

            let changed = merge_missing_settings(&mut user_value, &defaults_value);
            let settings: Settings = serde_json::from_value(user_value)
                .map_err(|e| format!("Failed to parse settings: {e}"))?;

            if changed {
                log::info!("[Settings] Filled missing keys in {:?}", self.settings_path);
                self.save_internal(&settings)?;
            }
            settings
        } else {
            let defaults = Settings::default();
            self.save_internal(&defaults)?;
            defaults
        };

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }

        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self, settings: &Settings) -> Result<(), String> {
        self.save_internal(settings)?;

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }

        Ok(())
    }

    fn save_internal(&self, settings: &Settings) -> Result<(), String> {
        if let Some(parent) = self.settings_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {e}"))?;
        }

        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| format!("Failed to serialize settings: {e}"))?;

        std::fs::write(&self.settings_path, content)
            .map_err(|e| format!("Failed to write settings: {e}"))
    }

    /// Drop the cached copy so the next load re-reads the file
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.write() {
            *cache = None;
        }
    }
}

/// Recursively insert keys present in `defaults` but missing from `target`
fn merge_missing_settings(target: &mut Value, defaults: &Value) -> bool {
    match (target, defaults) {
        (Value::Object(target_map), Value::Object(defaults_map)) => {
            let mut changed = false;
            for (key, default_value) in defaults_map {
                match target_map.get_mut(key) {
                    Some(target_value) => {
                        if merge_missing_settings(target_value, default_value) {
                            changed = true;
                        }
                    }
                    None => {
                        target_map.insert(key.clone(), default_value.clone());
                        changed = true;
                    }
                }
            }
            changed
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_load_creates_defaults() {
        let temp = tempdir().unwrap();
        let manager = SettingsManager::new(temp.path());

        let settings = manager.load().unwrap();
        assert_eq!(settings, Settings::default());
        assert!(manager.settings_path().exists());
    }

    #[test]
    fn test_missing_keys_written_back() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"twitch":{"enabled":true,"key":"live_1"},"general":{"port":1940}}"#)
            .unwrap();

        let manager = SettingsManager::new(temp.path());
        let settings = manager.load().unwrap();
        assert!(settings.twitch.enabled);
        assert_eq!(settings.twitch.key.expose(), "live_1");
        assert_eq!(settings.general.port, 1940);
        assert_eq!(settings.quality.bitrate, 6000);

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["advanced"]["ffmpeg_args"], json!("-tune zerolatency"));
        assert_eq!(on_disk["general"]["log_retention_days"], json!(30));
    }

    #[test]
    fn test_save_updates_cache_and_disk() {
        let temp = tempdir().unwrap();
        let manager = SettingsManager::new(temp.path());

        let mut settings = manager.load().unwrap();
        settings.kick.enabled = true;
        settings.kick.key = "sk_kick".into();
        manager.save(&settings).unwrap();

        assert!(manager.load().unwrap().kick.enabled);
        let reloaded = SettingsManager::new(temp.path()).load().unwrap();
        assert_eq!(reloaded.kick.key.expose(), "sk_kick");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join(SETTINGS_FILE_NAME), "{ not json").unwrap();
        let err = SettingsManager::new(temp.path()).load().unwrap_err();
        assert!(err.starts_with("Failed to parse settings"));
    }

    #[test]
    fn test_merge_missing_settings_keeps_user_values() {
        let mut target = json!({"quality": {"bitrate": 3000}});
        let defaults = json!({"quality": {"bitrate": 6000, "preset": "Very Fast"}});
        assert!(merge_missing_settings(&mut target, &defaults));
        assert_eq!(target, json!({"quality": {"bitrate": 3000, "preset": "Very Fast"}}));
        assert!(!merge_missing_settings(&mut target, &defaults));
    }
}
