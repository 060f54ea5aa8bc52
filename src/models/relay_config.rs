// RelayConfig Model
// User-facing relay configuration, snapshotted at relay start

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{PlatformId, StreamKey};

pub const MIN_LISTEN_PORT: u32 = 1024;
pub const MAX_LISTEN_PORT: u32 = 65535;
pub const MIN_BITRATE_KBPS: u32 = 500;
pub const MAX_BITRATE_KBPS: u32 = 50_000;
pub const MIN_CHUNK_SIZE: u32 = 128;
pub const MAX_CHUNK_SIZE: u32 = 65_536;
pub const MAX_STREAM_KEY_LEN: usize = 256;
pub const MAX_CUSTOM_ARGS_LEN: usize = 512;

fn default_port() -> u32 {
    1935
}

fn default_chunk_size() -> u32 {
    4096
}

fn default_bitrate() -> u32 {
    6000
}

fn default_custom_args() -> String {
    "-tune zerolatency".to_string()
}

fn default_log_output() -> bool {
    true
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

/// x264 speed/quality preset, fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    UltraFast,
    SuperFast,
    #[default]
    VeryFast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    VerySlow,
}

impl QualityPreset {
    pub const ALL: [QualityPreset; 9] = [
        QualityPreset::UltraFast,
        QualityPreset::SuperFast,
        QualityPreset::VeryFast,
        QualityPreset::Faster,
        QualityPreset::Fast,
        QualityPreset::Medium,
        QualityPreset::Slow,
        QualityPreset::Slower,
        QualityPreset::VerySlow,
    ];

    /// Value passed to `-preset`
    pub fn as_ffmpeg(&self) -> &'static str {
        match self {
            QualityPreset::UltraFast => "ultrafast",
            QualityPreset::SuperFast => "superfast",
            QualityPreset::VeryFast => "veryfast",
            QualityPreset::Faster => "faster",
            QualityPreset::Fast => "fast",
            QualityPreset::Medium => "medium",
            QualityPreset::Slow => "slow",
            QualityPreset::Slower => "slower",
            QualityPreset::VerySlow => "veryslow",
        }
    }

    /// Human-readable label, as stored in settings ("Very Fast")
    pub fn label(&self) -> &'static str {
        match self {
            QualityPreset::UltraFast => "Ultra Fast",
            QualityPreset::SuperFast => "Super Fast",
            QualityPreset::VeryFast => "Very Fast",
            QualityPreset::Faster => "Faster",
            QualityPreset::Fast => "Fast",
            QualityPreset::Medium => "Medium",
            QualityPreset::Slow => "Slow",
            QualityPreset::Slower => "Slower",
            QualityPreset::VerySlow => "Very Slow",
        }
    }

    /// Accepts either the label or the ffmpeg name, case and space insensitive
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_ffmpeg() == normalized)
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-destination settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub stream_key: StreamKey,
    /// Server URL override. Required for `custom`, ignored by catalog
    /// platforms unless set.
    #[serde(default)]
    pub server_url: Option<String>,
}

impl DestinationConfig {
    pub fn enabled(stream_key: impl Into<StreamKey>) -> Self {
        Self {
            enabled: true,
            stream_key: stream_key.into(),
            server_url: None,
        }
    }
}

/// Restart policy applied by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reconnect_delay_secs")]
    pub delay_secs: u64,
}

impl ReconnectPolicy {
    /// Upper bound on any single backoff delay
    pub const MAX_DELAY: Duration = Duration::from_secs(120);

    /// Delay before restart number `attempt` (1-based): delay * 2^(attempt-1), capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(6);
        let secs = self.delay_secs.saturating_mul(1 << exponent);
        Duration::from_secs(secs).min(Self::MAX_DELAY)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: default_auto_reconnect(),
            max_attempts: default_max_attempts(),
            delay_secs: default_reconnect_delay_secs(),
        }
    }
}

/// Complete relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Local RTMP listen port
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default)]
    pub destinations: BTreeMap<PlatformId, DestinationConfig>,
    #[serde(default)]
    pub preset: QualityPreset,
    /// Base video bitrate in kbps, scaled per platform
    #[serde(default = "default_bitrate")]
    pub bitrate_kbps: u32,
    /// Extra encoder arguments inserted verbatim before the output
    #[serde(default = "default_custom_args")]
    pub custom_args: String,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Forward ingest server stderr into the application log
    #[serde(default = "default_log_output")]
    pub log_output: bool,
}

impl RelayConfig {
    /// Enable a destination with a stream key
    pub fn with_destination(mut self, platform: PlatformId, stream_key: impl Into<StreamKey>) -> Self {
        self.destinations
            .insert(platform, DestinationConfig::enabled(stream_key));
        self
    }

    pub fn destination(&self, platform: PlatformId) -> Option<&DestinationConfig> {
        self.destinations.get(&platform)
    }

    pub fn enabled_platforms(&self) -> Vec<PlatformId> {
        self.destinations
            .iter()
            .filter(|(_, dest)| dest.enabled)
            .map(|(id, _)| *id)
            .collect()
    }

    /// URL the local encoder publishes to
    pub fn publish_url(&self) -> String {
        format!("rtmp://localhost:{}/live", self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            chunk_size: default_chunk_size(),
            destinations: BTreeMap::new(),
            preset: QualityPreset::default(),
            bitrate_kbps: default_bitrate(),
            custom_args: default_custom_args(),
            reconnect: ReconnectPolicy::default(),
            log_output: default_log_output(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_parse_accepts_labels_and_names() {
        assert_eq!(QualityPreset::parse("Very Fast"), Some(QualityPreset::VeryFast));
        assert_eq!(QualityPreset::parse("veryslow"), Some(QualityPreset::VerySlow));
        assert_eq!(QualityPreset::parse("ULTRA FAST"), Some(QualityPreset::UltraFast));
        assert_eq!(QualityPreset::parse("placebo"), None);
    }

    #[test]
    fn test_preset_order() {
        assert!(QualityPreset::UltraFast < QualityPreset::Medium);
        assert!(QualityPreset::Slower < QualityPreset::VerySlow);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ReconnectPolicy {
            auto_reconnect: true,
            max_attempts: 10,
            delay_secs: 5,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(9), ReconnectPolicy::MAX_DELAY);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RelayConfig = serde_json::from_str(
            r#"{"destinations":{"twitch":{"enabled":true,"streamKey":"abc"}}}"#,
        )
        .unwrap();
        assert_eq!(config.port, 1935);
        assert_eq!(config.bitrate_kbps, 6000);
        assert_eq!(config.preset, QualityPreset::VeryFast);
        assert_eq!(config.enabled_platforms(), vec![PlatformId::Twitch]);
        assert_eq!(config.publish_url(), "rtmp://localhost:1935/live");
    }
}
