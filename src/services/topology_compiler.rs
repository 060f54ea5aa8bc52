// Relay Topology Compiler
// Turns a RelayConfig snapshot into the concrete push pipelines

use thiserror::Error;

use crate::models::{
    AudioParams, PlatformId, PushPipeline, RelayConfig, RelayTopology, FRAME_RATE, GOP_LENGTH,
    MAX_BITRATE_KBPS, MAX_CHUNK_SIZE, MAX_CUSTOM_ARGS_LEN, MAX_LISTEN_PORT, MAX_STREAM_KEY_LEN,
    MIN_BITRATE_KBPS, MIN_CHUNK_SIZE, MIN_LISTEN_PORT,
};
use crate::services::platform_catalog::is_rtmp_url;
use crate::services::PlatformCatalog;

/// Invalid or incomplete relay configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No platforms enabled: enable at least one destination")]
    NoPlatformsEnabled,

    #[error("Stream key required for {0}")]
    MissingStreamKey(PlatformId),

    #[error("Stream key for {platform} is {len} characters (max {max})")]
    StreamKeyTooLong { platform: PlatformId, len: usize, max: usize },

    #[error("Stream key for {0} contains whitespace or reserved characters")]
    InvalidStreamKey(PlatformId),

    #[error("Server URL required for {0}")]
    MissingServerUrl(PlatformId),

    #[error("Invalid server URL for {platform}: {url} (expected rtmp:// or rtmps://)")]
    InvalidServerUrl { platform: PlatformId, url: String },

    #[error("Port {port} out of range ({min}-{max})")]
    PortOutOfRange { port: u32, min: u32, max: u32 },

    #[error("Bitrate {bitrate} kbps out of range ({min}-{max} kbps)")]
    BitrateOutOfRange { bitrate: u32, min: u32, max: u32 },

    #[error("Chunk size {chunk_size} out of range ({min}-{max})")]
    ChunkSizeOutOfRange { chunk_size: u32, min: u32, max: u32 },

    #[error("Custom encoder arguments are {len} characters (max {max})")]
    CustomArgsTooLong { len: usize, max: usize },

    #[error("Custom encoder arguments may not contain ';', braces or line breaks")]
    InvalidCustomArgs,

    #[error("Platform {0} is not in the catalog")]
    UnknownPlatform(PlatformId),
}

/// Characters that would break out of an ingest server directive
fn has_reserved_chars(value: &str) -> bool {
    value
        .chars()
        .any(|c| c == ';' || c == '{' || c == '}' || c == '\n' || c == '\r')
}

fn validate_bounds(config: &RelayConfig) -> Result<u16, ConfigError> {
    if !(MIN_LISTEN_PORT..=MAX_LISTEN_PORT).contains(&config.port) {
        return Err(ConfigError::PortOutOfRange {
            port: config.port,
            min: MIN_LISTEN_PORT,
            max: MAX_LISTEN_PORT,
        });
    }
    if !(MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&config.bitrate_kbps) {
        return Err(ConfigError::BitrateOutOfRange {
            bitrate: config.bitrate_kbps,
            min: MIN_BITRATE_KBPS,
            max: MAX_BITRATE_KBPS,
        });
    }
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&config.chunk_size) {
        return Err(ConfigError::ChunkSizeOutOfRange {
            chunk_size: config.chunk_size,
            min: MIN_CHUNK_SIZE,
            max: MAX_CHUNK_SIZE,
        });
    }

    let args_len = config.custom_args.chars().count();
    if args_len > MAX_CUSTOM_ARGS_LEN {
        return Err(ConfigError::CustomArgsTooLong {
            len: args_len,
            max: MAX_CUSTOM_ARGS_LEN,
        });
    }
    if has_reserved_chars(&config.custom_args) {
        return Err(ConfigError::InvalidCustomArgs);
    }

    // Range checked above
    u16::try_from(config.port).map_err(|_| ConfigError::PortOutOfRange {
        port: config.port,
        min: MIN_LISTEN_PORT,
        max: MAX_LISTEN_PORT,
    })
}

/// Compile against the built-in catalog
pub fn compile(config: &RelayConfig) -> Result<RelayTopology, ConfigError> {
    compile_with(&PlatformCatalog::builtin(), config)
}

/// Compile a configuration into a topology
///
/// Pure: no I/O, deterministic for equal inputs. Pipelines follow catalog
/// order regardless of how the configuration lists its destinations.
pub fn compile_with(catalog: &PlatformCatalog, config: &RelayConfig) -> Result<RelayTopology, ConfigError> {
    let enabled = config.enabled_platforms();
    if enabled.is_empty() {
        return Err(ConfigError::NoPlatformsEnabled);
    }
    let port = validate_bounds(config)?;

    if let Some(missing) = enabled.iter().find(|id| catalog.get(**id).is_none()) {
        return Err(ConfigError::UnknownPlatform(*missing));
    }

    let mut pipelines = Vec::with_capacity(enabled.len());
    for target in catalog.entries() {
        let Some(dest) = config.destination(target.id).filter(|d| d.enabled) else {
            continue;
        };

        if dest.stream_key.is_empty() {
            return Err(ConfigError::MissingStreamKey(target.id));
        }
        let key_len = dest.stream_key.len();
        if key_len > MAX_STREAM_KEY_LEN {
            return Err(ConfigError::StreamKeyTooLong {
                platform: target.id,
                len: key_len,
                max: MAX_STREAM_KEY_LEN,
            });
        }
        let key = dest.stream_key.expose();
        if key.chars().any(char::is_whitespace) || has_reserved_chars(key) {
            return Err(ConfigError::InvalidStreamKey(target.id));
        }

        let server = match dest.server_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => url,
            None if target.ingest_url.is_empty() => {
                return Err(ConfigError::MissingServerUrl(target.id));
            }
            None => target.ingest_url.as_str(),
        };
        if !is_rtmp_url(server) || server.chars().any(char::is_whitespace) || has_reserved_chars(server) {
            return Err(ConfigError::InvalidServerUrl {
                platform: target.id,
                url: server.to_string(),
            });
        }

        pipelines.push(PushPipeline {
            platform: target.id,
            app_name: target.app_name().to_string(),
            ingest_base: server.trim_end_matches('/').to_string(),
            stream_key: dest.stream_key.clone(),
            video_bitrate_kbps: target.scaling.apply(config.bitrate_kbps),
            preset: config.preset.as_ffmpeg().to_string(),
            gop: GOP_LENGTH,
            frame_rate: FRAME_RATE,
            audio: AudioParams::default(),
            custom_args: config.custom_args.trim().to_string(),
        });
    }

    Ok(RelayTopology {
        port,
        chunk_size: config.chunk_size,
        pipelines,
    })
}
