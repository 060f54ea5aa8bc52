// Settings Model
// Persisted relay settings, grouped the way the settings file stores them

use serde::{Deserialize, Serialize};

use super::{DestinationConfig, PlatformId, QualityPreset, ReconnectPolicy, RelayConfig, StreamKey};

fn default_port() -> u32 {
    1935
}

fn default_log_retention_days() -> u32 {
    30
}

fn default_preset() -> String {
    QualityPreset::VeryFast.label().to_string()
}

fn default_bitrate() -> u32 {
    6000
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_logging() -> bool {
    true
}

fn default_ffmpeg_args() -> String {
    "-tune zerolatency".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

/// `<platform>.enabled` / `<platform>.key`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key: StreamKey,
}

/// `general.*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

/// `quality.*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySettings {
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            bitrate: default_bitrate(),
        }
    }
}

/// `advanced.*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvancedSettings {
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    #[serde(default = "default_logging")]
    pub logging: bool,
    #[serde(default = "default_ffmpeg_args")]
    pub ffmpeg_args: String,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: default_auto_reconnect(),
            logging: default_logging(),
            ffmpeg_args: default_ffmpeg_args(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

/// Relay settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub twitch: PlatformSettings,
    #[serde(default)]
    pub youtube: PlatformSettings,
    #[serde(default)]
    pub kick: PlatformSettings,
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub quality: QualitySettings,
    #[serde(default)]
    pub advanced: AdvancedSettings,
}

impl Settings {
    pub fn platform(&self, platform: PlatformId) -> Option<&PlatformSettings> {
        match platform {
            PlatformId::Twitch => Some(&self.twitch),
            PlatformId::Youtube => Some(&self.youtube),
            PlatformId::Kick => Some(&self.kick),
            PlatformId::Custom => None,
        }
    }

    /// Build a relay configuration snapshot from the saved settings
    pub fn to_relay_config(&self) -> RelayConfig {
        let preset = QualityPreset::parse(&self.quality.preset).unwrap_or_else(|| {
            log::warn!(
                "Unknown quality preset '{}', using {}",
                self.quality.preset,
                QualityPreset::default()
            );
            QualityPreset::default()
        });

        let mut config = RelayConfig {
            port: self.general.port,
            preset,
            bitrate_kbps: self.quality.bitrate,
            custom_args: self.advanced.ffmpeg_args.clone(),
            reconnect: ReconnectPolicy {
                auto_reconnect: self.advanced.auto_reconnect,
                max_attempts: self.advanced.max_reconnect_attempts,
                delay_secs: self.advanced.reconnect_delay_secs,
            },
            log_output: self.advanced.logging,
            ..RelayConfig::default()
        };

        for platform in PlatformId::ALL {
            if let Some(saved) = self.platform(platform) {
                config.destinations.insert(
                    platform,
                    DestinationConfig {
                        enabled: saved.enabled,
                        stream_key: saved.key.clone(),
                        server_url: None,
                    },
                );
            }
        }

        config
    }
}
