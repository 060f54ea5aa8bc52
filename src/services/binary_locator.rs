// Binary Locator
// Finds the external ingest server and transcoder executables

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;

/// Env var overriding the ingest server location
pub const NGINX_PATH_ENV: &str = "STREAMRELAY_NGINX_PATH";
/// Env var overriding the transcoder location
pub const FFMPEG_PATH_ENV: &str = "STREAMRELAY_FFMPEG_PATH";

/// Search rules for one external executable
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    name: &'static str,
    env_var: &'static str,
    explicit: Option<PathBuf>,
}

impl BinaryLocator {
    pub fn nginx() -> Self {
        Self {
            name: "nginx",
            env_var: NGINX_PATH_ENV,
            explicit: None,
        }
    }

    pub fn ffmpeg() -> Self {
        Self {
            name: "ffmpeg",
            env_var: FFMPEG_PATH_ENV,
            explicit: None,
        }
    }

    pub fn with_explicit(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    fn file_names(&self) -> Vec<String> {
        if cfg!(target_os = "windows") {
            vec![format!("{}.exe", self.name)]
        } else {
            vec![self.name.to_string()]
        }
    }

    fn find_in(&self, dir: &Path) -> Option<PathBuf> {
        self.file_names()
            .into_iter()
            .flat_map(|name| [dir.join(&name), dir.join(self.name).join(&name)])
            .find(|candidate| candidate.is_file())
    }

    /// Resolve the executable
    ///
    /// Order: env var, explicit path, next to the running executable (or in a
    /// `<name>/` folder there), the working directory, then `PATH`.
    pub fn find(&self) -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var(self.env_var) {
            let path = PathBuf::from(&env_path);
            if path.is_file() {
                log::debug!("Found {} via {}: {:?}", self.name, self.env_var, path);
                return Some(path);
            }
            log::warn!("{} points to a missing file: {env_path}", self.env_var);
        }

        if let Some(ref path) = self.explicit {
            if path.is_file() {
                return Some(path.clone());
            }
        }

        if let Some(exe_dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
            if let Some(path) = self.find_in(&exe_dir) {
                log::debug!("Found {} as sidecar: {:?}", self.name, path);
                return Some(path);
            }
        }

        if let Ok(cwd) = std::env::current_dir() {
            if let Some(path) = self.find_in(&cwd) {
                log::debug!("Found {} relative to cwd: {:?}", self.name, path);
                return Some(path);
            }
        }

        if let Ok(which_path) = which::which(self.name) {
            log::debug!("Found {} in PATH: {:?}", self.name, which_path);
            return Some(which_path);
        }

        log::warn!("{} binary not found in any location", self.name);
        None
    }

    /// Resolved path, or the bare name so spawn errors name the missing binary
    pub fn find_or_default(&self) -> PathBuf {
        self.find().unwrap_or_else(|| PathBuf::from(self.name))
    }
}

/// Result of probing the ingest server build
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestServerInfo {
    pub path: PathBuf,
    pub version: String,
    pub rtmp_module: bool,
}

/// Run `nginx -V` and check the build includes the RTMP module
pub fn probe_ingest_server(path: &Path) -> Result<IngestServerInfo, String> {
    let output = Command::new(path)
        .arg("-V")
        .output()
        .map_err(|e| format!("Failed to run {}: {e}", path.display()))?;

    // nginx prints its version banner to stderr
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stderr),
        String::from_utf8_lossy(&output.stdout)
    );
    parse_build_info(path, &text)
}

fn parse_build_info(path: &Path, text: &str) -> Result<IngestServerInfo, String> {
    let version = text
        .lines()
        .find_map(|line| line.split_once("version:").map(|(_, v)| v.trim().to_string()))
        .ok_or_else(|| format!("{} did not report a version", path.display()))?;

    let rtmp_module = text
        .lines()
        .filter(|line| line.contains("configure arguments:"))
        .any(|line| line.contains("rtmp"));

    Ok(IngestServerInfo {
        path: path.to_path_buf(),
        version,
        rtmp_module,
    })
}
