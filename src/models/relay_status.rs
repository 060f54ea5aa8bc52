// RelayStatus Model
// Lifecycle states and read-only status snapshots

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::process::ExitStatus;
use uuid::Uuid;

use super::PipelineSummary;

/// Supervised process lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    #[default]
    Stopped,
    Starting,
    Running,
    /// Exited cleanly (status 0) without being asked to
    Exited,
    /// Exited with a failure status or signal
    Crashed,
    /// Waiting out the backoff delay before the next start
    Restarting,
    /// Restart budget exhausted or unrecoverable spawn failure
    FailedPermanently,
}

impl LifecycleState {
    /// A process is (or is about to be) alive in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Restarting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::FailedPermanently)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Exited => "exited",
            LifecycleState::Crashed => "crashed",
            LifecycleState::Restarting => "restarting",
            LifecycleState::FailedPermanently => "failed permanently",
        };
        f.write_str(label)
    }
}

/// Last observed process exit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
}

impl ExitInfo {
    pub fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            success: status.success(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Consistent snapshot of the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSnapshot {
    pub state: LifecycleState,
    pub pid: Option<u32>,
    pub attempt: u32,
    pub last_exit: Option<ExitInfo>,
    pub started_at: Option<DateTime<Local>>,
}

impl SupervisorSnapshot {
    pub fn uptime_secs(&self) -> u64 {
        match (self.state, self.started_at) {
            (LifecycleState::Running, Some(started)) => {
                (Local::now() - started).num_seconds().max(0) as u64
            }
            _ => 0,
        }
    }
}

/// Timestamped line for the relay monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayLogLine {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl RelayLogLine {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RelayLogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Handle returned by a successful relay start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySession {
    pub id: Uuid,
    pub publish_url: String,
    pub started_at: DateTime<Local>,
    pub pipelines: Vec<PipelineSummary>,
}

/// Status exposed to callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub state: LifecycleState,
    pub uptime_secs: u64,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub pid: Option<u32>,
    pub last_exit: Option<ExitInfo>,
    pub last_log_line: Option<String>,
    pub session: Option<RelaySession>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_format() {
        let line = RelayLogLine::now("Multi-stream relay started");
        let rendered = line.to_string();
        assert!(rendered.starts_with('['));
        assert!(rendered.ends_with("] Multi-stream relay started"));
        assert_eq!(rendered.find(']'), Some(9));
    }

    #[test]
    fn test_uptime_only_while_running() {
        let mut snapshot = SupervisorSnapshot {
            state: LifecycleState::Crashed,
            pid: None,
            attempt: 1,
            last_exit: None,
            started_at: Some(Local::now() - chrono::Duration::seconds(30)),
        };
        assert_eq!(snapshot.uptime_secs(), 0);

        snapshot.state = LifecycleState::Running;
        assert!(snapshot.uptime_secs() >= 29);
    }

    #[test]
    fn test_exit_info_display() {
        let info = ExitInfo { code: Some(1), signal: None, success: false };
        assert_eq!(info.to_string(), "exit code 1");
        let info = ExitInfo { code: None, signal: Some(9), success: false };
        assert_eq!(info.to_string(), "signal 9");
    }
}
