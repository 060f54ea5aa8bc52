// Platform Catalog
// Centralized knowledge of supported destinations and their bitrate policy

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{PlatformId, PlatformTarget, ScalingRule};

/// Errors raised while loading catalog overrides
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse catalog file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid ingest URL for {platform}: {url} (expected rtmp:// or rtmps://)")]
    InvalidIngestUrl { platform: PlatformId, url: String },

    #[error("Invalid scaling rule for {0}: multiplier must be at least 1")]
    InvalidRule(PlatformId),
}

/// Partial entry from the override file; unset fields keep the built-in value
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogOverride {
    id: PlatformId,
    display_name: Option<String>,
    ingest_url: Option<String>,
    scaling: Option<ScalingRule>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    platforms: Vec<CatalogOverride>,
}

/// Ordered set of destinations the relay can fan out to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformCatalog {
    entries: Vec<PlatformTarget>,
}

impl PlatformCatalog {
    /// Built-in destinations
    ///
    /// The per-platform bitrate rules mirror the relay's historical defaults
    /// (YouTube doubled, Kick +4000 kbps). They are policy and may be revised
    /// through `platforms.json`.
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                PlatformTarget::new(
                    PlatformId::Twitch,
                    "Twitch",
                    "rtmp://live.twitch.tv/app",
                    ScalingRule::Identity,
                ),
                PlatformTarget::new(
                    PlatformId::Youtube,
                    "YouTube",
                    "rtmp://a.rtmp.youtube.com/live2",
                    ScalingRule::Multiply(2),
                ),
                PlatformTarget::new(
                    PlatformId::Kick,
                    "Kick",
                    "rtmp://ingest.kick.com/live",
                    ScalingRule::Offset(4000),
                ),
                PlatformTarget::new(PlatformId::Custom, "Custom RTMP", "", ScalingRule::Identity),
            ],
        }
    }

    /// Built-in catalog with overrides applied from a JSON document
    pub fn with_overrides_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        let mut catalog = Self::builtin();

        for entry in file.platforms {
            if let Some(ScalingRule::Multiply(0)) = entry.scaling {
                return Err(CatalogError::InvalidRule(entry.id));
            }
            if let Some(url) = &entry.ingest_url {
                if !is_rtmp_url(url) {
                    return Err(CatalogError::InvalidIngestUrl {
                        platform: entry.id,
                        url: url.clone(),
                    });
                }
            }

            if let Some(target) = catalog.entries.iter_mut().find(|t| t.id == entry.id) {
                if let Some(name) = entry.display_name {
                    target.display_name = name;
                }
                if let Some(url) = entry.ingest_url {
                    target.ingest_url = url.trim_end_matches('/').to_string();
                }
                if let Some(rule) = entry.scaling {
                    log::info!("[Catalog] {} bitrate rule overridden: {:?}", entry.id, rule);
                    target.scaling = rule;
                }
            }
        }

        Ok(catalog)
    }

    /// Load overrides from a file, falling back to the built-in catalog when absent
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let content = std::fs::read_to_string(path)?;
        log::info!("[Catalog] Loading platform overrides from {path:?}");
        Self::with_overrides_json(&content)
    }

    pub fn get(&self, platform: PlatformId) -> Option<&PlatformTarget> {
        self.entries.iter().find(|t| t.id == platform)
    }

    /// Entries in fan-out order
    pub fn entries(&self) -> &[PlatformTarget] {
        &self.entries
    }

    /// Append a stream key to a server URL: rtmp://server/app + /key
    pub fn build_url_with_key(base_url: &str, stream_key: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), stream_key)
    }

    /// Redact the stream key (last path segment) from an RTMP URL
    pub fn redact_url(url: &str) -> String {
        if !is_rtmp_url(url) {
            return url.to_string();
        }

        let (scheme, rest) = match url.split_once("://") {
            Some(parts) => parts,
            None => return url.to_string(),
        };

        let (host, path) = match rest.split_once('/') {
            Some(parts) => parts,
            None => return url.to_string(),
        };

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            return url.to_string();
        }

        let safe_path = segments[..segments.len() - 1].join("/");
        format!("{scheme}://{host}/{safe_path}/***")
    }

    /// Redact every remote RTMP URL key inside a free-form line (process output)
    pub fn redact_line(line: &str) -> String {
        static RTMP_KEY: OnceLock<Option<Regex>> = OnceLock::new();
        let pattern = RTMP_KEY.get_or_init(|| {
            Regex::new(r"(rtmps?://[^\s/]+/[^\s/;]+/)[^\s;]+").ok()
        });

        match pattern {
            Some(re) if !line.contains("rtmp://localhost") => {
                re.replace_all(line, "${1}***").into_owned()
            }
            Some(re) => {
                // Keep local relay paths readable, redact everything else
                line.split(' ')
                    .map(|word| {
                        if word.contains("rtmp://localhost") {
                            word.to_string()
                        } else {
                            re.replace_all(word, "${1}***").into_owned()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            None => line.to_string(),
        }
    }
}

impl Default for PlatformCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

pub(crate) fn is_rtmp_url(url: &str) -> bool {
    url.starts_with("rtmp://") || url.starts_with("rtmps://")
}
