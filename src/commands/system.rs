// System Commands
// External binary checks and destination reachability

use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use crate::services::{probe_ingest_server, BinaryLocator, IngestServerInfo};

/// Locate the ingest server and confirm it was built with RTMP support
pub fn test_ingest_server(locator: &BinaryLocator) -> Result<IngestServerInfo, String> {
    let path = locator
        .find()
        .ok_or_else(|| "nginx binary not found (set STREAMRELAY_NGINX_PATH)".to_string())?;

    let info = probe_ingest_server(&path)?;
    if !info.rtmp_module {
        return Err(format!(
            "{} ({}) was built without the RTMP module",
            info.path.display(),
            info.version
        ));
    }
    Ok(info)
}

/// Test FFmpeg installation and return version string
pub fn test_ffmpeg(path: &Path) -> Result<String, String> {
    let output = Command::new(path)
        .arg("-version")
        .output()
        .map_err(|e| format!("Failed to run {}: {e}", path.display()))?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", path.display(), output.status));
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| "FFmpeg returned no version output".to_string())
}

/// Result of testing an RTMP target
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtmpTestResult {
    pub url: String,
    pub success: bool,
    pub message: String,
    /// Time taken in milliseconds
    pub latency_ms: Option<u64>,
}

/// TCP connectivity test to an RTMP destination's host:port
///
/// Pass a redacted URL; only the host and port are used.
pub fn test_rtmp_target(url: &str) -> RtmpTestResult {
    let start = Instant::now();
    let result = |success: bool, message: String| RtmpTestResult {
        url: url.to_string(),
        success,
        message,
        latency_ms: Some(start.elapsed().as_millis() as u64),
    };

    let (host, port) = match parse_rtmp_url(url) {
        Ok(parts) => parts,
        Err(e) => return result(false, e),
    };
    let addr = format!("{host}:{port}");

    let resolved = match addr.to_socket_addrs().map(|mut addrs| addrs.next()) {
        Ok(Some(resolved)) => resolved,
        Ok(None) => return result(false, format!("No address found for {addr}")),
        Err(e) => return result(false, format!("Cannot resolve {addr} - {e}")),
    };

    match TcpStream::connect_timeout(&resolved, Duration::from_secs(5)) {
        Ok(_) => {
            log::info!("TCP connection to {addr} successful");
            result(true, "TCP connection successful".to_string())
        }
        Err(e) => result(false, format!("Cannot reach {addr} - {e}")),
    }
}

/// Parse an RTMP URL to extract host and port
fn parse_rtmp_url(url: &str) -> Result<(String, u16), String> {
    let url = url.trim();

    let (is_secure, rest) = if let Some(rest) = url.strip_prefix("rtmps://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("rtmp://") {
        (false, rest)
    } else {
        return Err("Invalid RTMP URL: must start with rtmp:// or rtmps://".to_string());
    };

    let host_port = rest.split('/').next().unwrap_or(rest);

    let (host, port) = match host_port.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| format!("Invalid port in URL: {port}"))?;
            (host.to_string(), port)
        }
        None => {
            let default_port = if is_secure { 443 } else { 1935 };
            (host_port.to_string(), default_port)
        }
    };

    if host.is_empty() {
        return Err("Empty host in RTMP URL".to_string());
    }

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rtmp_url() {
        assert_eq!(
            parse_rtmp_url("rtmp://live.twitch.tv/app/***").unwrap(),
            ("live.twitch.tv".to_string(), 1935)
        );
        assert_eq!(
            parse_rtmp_url("rtmps://global-live.mux.com/app").unwrap(),
            ("global-live.mux.com".to_string(), 443)
        );
        assert_eq!(
            parse_rtmp_url("rtmp://localhost:1940/live").unwrap(),
            ("localhost".to_string(), 1940)
        );
        assert!(parse_rtmp_url("http://example.com").is_err());
        assert!(parse_rtmp_url("rtmp://:1935/app").is_err());
        assert!(parse_rtmp_url("rtmp://host:notaport/app").is_err());
    }

    #[test]
    fn test_local_listener_is_reachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = test_rtmp_target(&format!("rtmp://127.0.0.1:{port}/live"));
        assert!(result.success, "{}", result.message);

        let result = test_rtmp_target("ftp://127.0.0.1/live");
        assert!(!result.success);
    }

    #[test]
    fn test_missing_ffmpeg_reports_error() {
        let err = test_ffmpeg(Path::new("/nonexistent/ffmpeg")).unwrap_err();
        assert!(err.starts_with("Failed to run"));
    }
}
