// RelayTopology Model
// Resolved process topology derived from a RelayConfig

use serde::Serialize;

use super::{PlatformId, StreamKey};

/// Fixed keyframe interval (frames)
pub const GOP_LENGTH: u32 = 50;
/// Fixed output frame rate
pub const FRAME_RATE: u32 = 30;
pub const VIDEO_CODEC: &str = "libx264";
pub const PIXEL_FORMAT: &str = "yuv420p";

/// Audio encoding parameters, fixed for every pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioParams {
    pub codec: &'static str,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub channels: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            codec: "aac",
            bitrate_kbps: 160,
            sample_rate: 44_100,
            channels: 2,
        }
    }
}

/// One transcode-and-push leg of the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPipeline {
    pub platform: PlatformId,
    /// Ingest server application that receives the local push
    pub app_name: String,
    /// Destination without the key, no trailing slash
    pub ingest_base: String,
    pub stream_key: StreamKey,
    pub video_bitrate_kbps: u32,
    pub preset: String,
    pub gop: u32,
    pub frame_rate: u32,
    pub audio: AudioParams,
    pub custom_args: String,
}

impl PushPipeline {
    /// Full destination, key appended as the last path segment
    pub fn destination_url(&self) -> String {
        format!("{}/{}", self.ingest_base, self.stream_key.expose())
    }

    /// Destination with the key masked, safe for logs
    pub fn redacted_destination(&self) -> String {
        format!("{}/***", self.ingest_base)
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            platform: self.platform,
            video_bitrate_kbps: self.video_bitrate_kbps,
            preset: self.preset.clone(),
            destination: self.redacted_destination(),
        }
    }
}

/// Key-free view of a pipeline for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    pub platform: PlatformId,
    pub video_bitrate_kbps: u32,
    pub preset: String,
    pub destination: String,
}

/// Immutable relay topology, rebuilt on every start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTopology {
    pub port: u16,
    pub chunk_size: u32,
    /// One entry per enabled platform, catalog order
    pub pipelines: Vec<PushPipeline>,
}

impl RelayTopology {
    pub fn pipeline(&self, platform: PlatformId) -> Option<&PushPipeline> {
        self.pipelines.iter().find(|p| p.platform == platform)
    }

    pub fn publish_url(&self) -> String {
        format!("rtmp://localhost:{}/live", self.port)
    }

    /// Internal RTMP path the `live` application pushes a pipeline's copy to
    pub fn relay_url(&self, pipeline: &PushPipeline) -> String {
        format!("rtmp://localhost:{}/{}", self.port, pipeline.app_name)
    }

    pub fn summaries(&self) -> Vec<PipelineSummary> {
        self.pipelines.iter().map(PushPipeline::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> PushPipeline {
        PushPipeline {
            platform: PlatformId::Twitch,
            app_name: "twitch".to_string(),
            ingest_base: "rtmp://live.twitch.tv/app".to_string(),
            stream_key: StreamKey::new("live_abc"),
            video_bitrate_kbps: 6000,
            preset: "veryfast".to_string(),
            gop: GOP_LENGTH,
            frame_rate: FRAME_RATE,
            audio: AudioParams::default(),
            custom_args: String::new(),
        }
    }

    #[test]
    fn test_destination_urls() {
        let p = pipeline();
        assert_eq!(p.destination_url(), "rtmp://live.twitch.tv/app/live_abc");
        assert_eq!(p.redacted_destination(), "rtmp://live.twitch.tv/app/***");

        let topology = RelayTopology { port: 1940, chunk_size: 4096, pipelines: vec![p.clone()] };
        assert_eq!(topology.relay_url(&p), "rtmp://localhost:1940/twitch");
        assert_eq!(topology.publish_url(), "rtmp://localhost:1940/live");
    }

    #[test]
    fn test_debug_never_contains_key() {
        let p = pipeline();
        assert!(!format!("{p:?}").contains("live_abc"));
        let summary = serde_json::to_string(&p.summary()).unwrap();
        assert!(!summary.contains("live_abc"));
    }
}
