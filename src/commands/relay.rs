// Relay Commands
// Configuration checks and read-only relay queries

use crate::models::{PipelineSummary, PlatformTarget, QualityPreset, RelayConfig, RelayLogLine};
use crate::services::{RelayController, SettingsManager};

/// Use the supplied configuration, or build one from the saved settings
pub fn resolve_relay_config(
    settings_manager: &SettingsManager,
    config: Option<RelayConfig>,
) -> Result<RelayConfig, String> {
    match config {
        Some(config) => Ok(config),
        None => Ok(settings_manager.load()?.to_relay_config()),
    }
}

pub fn get_relay_log(controller: &RelayController, max_lines: usize) -> Vec<RelayLogLine> {
    controller.recent_log(max_lines)
}

/// Validate without starting anything
pub fn test_relay_config(
    controller: &RelayController,
    settings_manager: &SettingsManager,
    config: Option<RelayConfig>,
) -> Result<Vec<PipelineSummary>, String> {
    let config = resolve_relay_config(settings_manager, config)?;
    controller.test_connection(&config).map_err(|e| e.to_string())
}

pub fn preview_relay_config(
    controller: &RelayController,
    settings_manager: &SettingsManager,
    config: Option<RelayConfig>,
) -> Result<String, String> {
    let config = resolve_relay_config(settings_manager, config)?;
    controller.preview_config(&config).map_err(|e| e.to_string())
}

pub fn get_platforms(controller: &RelayController) -> Vec<PlatformTarget> {
    controller.catalog().entries().to_vec()
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PresetInfo {
    pub id: QualityPreset,
    pub label: &'static str,
}

pub fn get_quality_presets() -> Vec<PresetInfo> {
    QualityPreset::ALL
        .iter()
        .map(|preset| PresetInfo {
            id: *preset,
            label: preset.label(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlatformId;
    use crate::services::{ControllerOptions, NoopEventSink, PlatformCatalog};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_config_falls_back_to_saved_settings() {
        let temp = tempdir().unwrap();
        let manager = SettingsManager::new(temp.path());
        let mut settings = manager.load().unwrap();
        settings.youtube.enabled = true;
        settings.youtube.key = "yt_saved".into();
        manager.save(&settings).unwrap();

        let config = resolve_relay_config(&manager, None).unwrap();
        assert_eq!(config.enabled_platforms(), vec![PlatformId::Youtube]);

        let explicit = RelayConfig::default().with_destination(PlatformId::Kick, "k");
        let config = resolve_relay_config(&manager, Some(explicit)).unwrap();
        assert_eq!(config.enabled_platforms(), vec![PlatformId::Kick]);
    }

    #[test]
    fn test_validation_errors_are_strings() {
        let temp = tempdir().unwrap();
        let manager = SettingsManager::new(temp.path());
        let controller = RelayController::new(
            PlatformCatalog::builtin(),
            ControllerOptions::new(temp.path().join("nginx"), PathBuf::from("nginx")),
            Arc::new(NoopEventSink),
        );

        let err = test_relay_config(&controller, &manager, None).unwrap_err();
        assert!(err.contains("No platforms"), "unexpected error: {err}");
        assert_eq!(get_platforms(&controller).len(), 4);
        assert_eq!(get_quality_presets().len(), QualityPreset::ALL.len());
    }
}
