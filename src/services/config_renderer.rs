// Config Renderer
// Serializes a RelayTopology into the nginx-rtmp configuration format

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::models::{PushPipeline, RelayTopology, PIXEL_FORMAT, VIDEO_CODEC};

/// File name of the rendered ingest server configuration
pub const CONFIG_FILE_NAME: &str = "nginx.conf";

/// Failure persisting rendered configuration
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to write ingest config {path:?}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Rendering knobs that do not come from the topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Transcoder executable invoked by each platform application
    pub ffmpeg_bin: String,
    /// Where the ingest server writes its pid file
    pub pid_file: Option<PathBuf>,
    /// Mask stream keys (config previews)
    pub redact_keys: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            pid_file: None,
            redact_keys: false,
        }
    }
}

impl RenderOptions {
    pub fn redacted(&self) -> Self {
        Self {
            redact_keys: true,
            ..self.clone()
        }
    }
}

/// Render with default options
pub fn render(topology: &RelayTopology) -> String {
    render_with(topology, &RenderOptions::default())
}

/// Render the ingest server configuration
///
/// Output is byte-identical for equal inputs. Pipelines appear in topology order.
pub fn render_with(topology: &RelayTopology, options: &RenderOptions) -> String {
    let mut out = String::with_capacity(1024 + topology.pipelines.len() * 512);

    // The supervisor watches this process, so it must not daemonize
    out.push_str("daemon off;\n");
    out.push_str("worker_processes 1;\n");
    if let Some(pid_file) = &options.pid_file {
        let _ = writeln!(out, "pid {};", pid_file.display());
    }
    out.push_str("error_log stderr warn;\n");
    out.push_str("events { worker_connections 1024; }\n\n");

    out.push_str("rtmp {\n");
    out.push_str("    server {\n");
    let _ = writeln!(out, "        listen {};", topology.port);
    let _ = writeln!(out, "        chunk_size {};", topology.chunk_size);
    out.push_str("        allow publish all;\n");
    out.push_str("        allow play all;\n\n");

    out.push_str("        application live {\n");
    out.push_str("            live on;\n");
    out.push_str("            record off;\n\n");
    for pipeline in &topology.pipelines {
        let _ = writeln!(out, "            push {};", topology.relay_url(pipeline));
    }
    out.push_str("        }\n\n");

    for pipeline in &topology.pipelines {
        render_application(&mut out, topology, pipeline, options);
    }

    out.push_str("    }\n");
    out.push_str("}\n");
    out
}

fn render_application(
    out: &mut String,
    topology: &RelayTopology,
    pipeline: &PushPipeline,
    options: &RenderOptions,
) {
    let bitrate = pipeline.video_bitrate_kbps;
    let audio = &pipeline.audio;
    let destination = if options.redact_keys {
        pipeline.redacted_destination()
    } else {
        pipeline.destination_url()
    };

    let _ = writeln!(out, "        application {} {{", pipeline.app_name);
    out.push_str("            live on;\n");
    out.push_str("            record off;\n");
    out.push_str("            allow publish 127.0.0.1;\n");
    out.push_str("            deny publish all;\n\n");
    let _ = writeln!(
        out,
        "            exec {} -i {}/$name",
        options.ffmpeg_bin,
        topology.relay_url(pipeline)
    );
    let _ = writeln!(out, "                -c:v {VIDEO_CODEC} -preset {}", pipeline.preset);
    let _ = writeln!(out, "                -b:v {bitrate}k -maxrate {bitrate}k -bufsize {bitrate}k");
    let _ = writeln!(
        out,
        "                -pix_fmt {PIXEL_FORMAT} -g {} -r {}",
        pipeline.gop, pipeline.frame_rate
    );
    let _ = writeln!(
        out,
        "                -c:a {} -b:a {}k -ar {} -ac {}",
        audio.codec, audio.bitrate_kbps, audio.sample_rate, audio.channels
    );
    if !pipeline.custom_args.is_empty() {
        let _ = writeln!(out, "                {}", pipeline.custom_args);
    }
    let _ = writeln!(out, "                -f flv {destination};");
    out.push_str("        }\n\n");
}

/// Path of the rendered config inside a configuration directory
pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Persist rendered configuration, creating the directory if needed
pub fn write_config(path: &Path, contents: &str) -> Result<(), RenderError> {
    let io_failure = |source| RenderError::IoFailure {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_failure)?;
    }

    // Skip the write when nothing changed so restarts leave the file untouched
    if let Ok(existing) = std::fs::read_to_string(path) {
        if existing == contents {
            return Ok(());
        }
    }

    std::fs::write(path, contents).map_err(io_failure)?;
    log::debug!("[Renderer] Ingest config written to {path:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlatformId, RelayConfig};
    use crate::services::compile;
    use tempfile::tempdir;

    fn topology() -> RelayTopology {
        let config = RelayConfig::default()
            .with_destination(PlatformId::Twitch, "tw_key")
            .with_destination(PlatformId::Youtube, "yt_key")
            .with_destination(PlatformId::Kick, "kick_key");
        compile(&config).unwrap()
    }

    #[test]
    fn test_render_is_deterministic() {
        let first = render(&topology());
        let second = render(&topology());
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn test_listener_and_pushes() {
        let text = render(&topology());
        assert!(text.contains("daemon off;\n"));
        assert!(text.contains("        listen 1935;\n"));
        assert!(text.contains("        chunk_size 4096;\n"));
        assert!(text.contains("            push rtmp://localhost:1935/twitch;\n"));
        assert!(text.contains("            push rtmp://localhost:1935/youtube;\n"));
        assert!(text.contains("            push rtmp://localhost:1935/kick;\n"));
    }

    #[test]
    fn test_applications_preserve_order() {
        let text = render(&topology());
        let twitch = text.find("application twitch {").unwrap();
        let youtube = text.find("application youtube {").unwrap();
        let kick = text.find("application kick {").unwrap();
        assert!(twitch < youtube && youtube < kick);
    }

    #[test]
    fn test_exec_parameters() {
        let text = render(&topology());
        assert!(text.contains("exec ffmpeg -i rtmp://localhost:1935/youtube/$name\n"));
        assert!(text.contains("-b:v 12000k -maxrate 12000k -bufsize 12000k\n"));
        assert!(text.contains("-b:v 10000k -maxrate 10000k -bufsize 10000k\n"));
        assert!(text.contains("-c:v libx264 -preset veryfast\n"));
        assert!(text.contains("-pix_fmt yuv420p -g 50 -r 30\n"));
        assert!(text.contains("-c:a aac -b:a 160k -ar 44100 -ac 2\n"));
        assert!(text.contains("                -tune zerolatency\n"));
        assert!(text.contains("-f flv rtmp://a.rtmp.youtube.com/live2/yt_key;\n"));
        assert!(text.ends_with("    }\n}\n"));
    }

    #[test]
    fn test_redacted_render_hides_keys() {
        let text = render_with(&topology(), &RenderOptions::default().redacted());
        assert!(!text.contains("tw_key"));
        assert!(!text.contains("yt_key"));
        assert!(text.contains("-f flv rtmp://live.twitch.tv/app/***;"));
    }

    #[test]
    fn test_options_change_output() {
        let options = RenderOptions {
            ffmpeg_bin: "/opt/ffmpeg/bin/ffmpeg".to_string(),
            pid_file: Some(PathBuf::from("/tmp/relay/nginx.pid")),
            redact_keys: false,
        };
        let text = render_with(&topology(), &options);
        assert!(text.contains("pid /tmp/relay/nginx.pid;\n"));
        assert!(text.contains("exec /opt/ffmpeg/bin/ffmpeg -i "));
    }

    #[test]
    fn test_write_config_creates_directory() {
        let temp = tempdir().unwrap();
        let path = config_path(&temp.path().join("nginx"));
        write_config(&path, "listen 1935;\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "listen 1935;\n");

        write_config(&path, "listen 1936;\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "listen 1936;\n");
    }

    #[test]
    fn test_write_config_reports_io_failure() {
        let temp = tempdir().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let err = write_config(&blocker.join("nginx.conf"), "x").unwrap_err();
        assert!(matches!(err, RenderError::IoFailure { .. }));
    }
}
