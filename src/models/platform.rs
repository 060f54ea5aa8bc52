// Platform Model
// Destination identifiers and bitrate scaling rules

use serde::{Deserialize, Serialize};
use std::fmt;

/// Streaming destination identifier
///
/// Declaration order is the fan-out order used everywhere a topology is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformId {
    Twitch,
    Youtube,
    Kick,
    /// User-supplied RTMP(S) server
    Custom,
}

impl PlatformId {
    pub const ALL: [PlatformId; 4] = [
        PlatformId::Twitch,
        PlatformId::Youtube,
        PlatformId::Kick,
        PlatformId::Custom,
    ];

    /// Identifier used for settings groups and ingest application names
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformId::Twitch => "twitch",
            PlatformId::Youtube => "youtube",
            PlatformId::Kick => "kick",
            PlatformId::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a platform derives its video bitrate from the configured base bitrate
///
/// These are catalog policy, not bandwidth facts. They can be replaced per
/// platform through the catalog override file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "lowercase")]
pub enum ScalingRule {
    /// Use the base bitrate unchanged
    Identity,
    /// Multiply the base bitrate by a factor
    Multiply(u32),
    /// Add a fixed number of kbps to the base bitrate
    Offset(u32),
}

impl ScalingRule {
    /// Resolve the target bitrate (kbps) for a base bitrate (kbps)
    pub fn apply(&self, base_kbps: u32) -> u32 {
        match *self {
            ScalingRule::Identity => base_kbps,
            ScalingRule::Multiply(factor) => base_kbps.saturating_mul(factor),
            ScalingRule::Offset(delta) => base_kbps.saturating_add(delta),
        }
    }
}

impl Default for ScalingRule {
    fn default() -> Self {
        ScalingRule::Identity
    }
}

/// Catalog entry describing one known destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformTarget {
    pub id: PlatformId,
    pub display_name: String,
    /// Ingest URL the stream key is appended to. Empty for `custom`, which
    /// takes its server from the user configuration.
    pub ingest_url: String,
    pub scaling: ScalingRule,
}

impl PlatformTarget {
    pub fn new(id: PlatformId, display_name: &str, ingest_url: &str, scaling: ScalingRule) -> Self {
        Self {
            id,
            display_name: display_name.to_string(),
            ingest_url: ingest_url.to_string(),
            scaling,
        }
    }

    /// Internal application name inside the ingest server
    pub fn app_name(&self) -> &'static str {
        self.id.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling_rules() {
        assert_eq!(ScalingRule::Identity.apply(6000), 6000);
        assert_eq!(ScalingRule::Multiply(2).apply(6000), 12000);
        assert_eq!(ScalingRule::Offset(4000).apply(6000), 10000);
        assert_eq!(ScalingRule::Multiply(2).apply(u32::MAX), u32::MAX);
    }

    #[test]
    fn test_scaling_rule_serde() {
        let rule: ScalingRule = serde_json::from_str(r#"{"rule":"multiply","value":3}"#).unwrap();
        assert_eq!(rule, ScalingRule::Multiply(3));

        let identity: ScalingRule = serde_json::from_str(r#"{"rule":"identity"}"#).unwrap();
        assert_eq!(identity, ScalingRule::Identity);
    }

    #[test]
    fn test_platform_id_parse() {
        assert_eq!(PlatformId::parse("YouTube"), Some(PlatformId::Youtube));
        assert_eq!(PlatformId::parse(" kick "), Some(PlatformId::Kick));
        assert_eq!(PlatformId::parse("facebook"), None);
        assert!(PlatformId::Twitch < PlatformId::Youtube);
    }
}
