// Relay Controller
// Single entry point for starting, stopping and inspecting the relay

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Local;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use uuid::Uuid;

use crate::models::{
    LifecycleState, PipelineSummary, RelayConfig, RelayLogLine, RelaySession, RelayStatus,
};
use crate::services::config_renderer::{config_path, render_with, write_config, RenderError, RenderOptions};
use crate::services::events::{emit_event, EventSink, EVENT_RELAY_LOG, EVENT_RELAY_STATE};
use crate::services::process_supervisor::{
    ExecutableSpec, PollOutcome, ProcessSupervisor, RenderedConfig, SupervisorError, SupervisorOptions,
};
use crate::services::topology_compiler::{compile_with, ConfigError};
use crate::services::PlatformCatalog;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
/// Lines kept for the status monitor
pub const LOG_RING_CAPACITY: usize = 200;
const PID_FILE_NAME: &str = "nginx.pid";

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Relay is already running")]
    AlreadyRunning,

    #[error("Relay is not running")]
    NotRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Directory holding the rendered config, pid file and ingest logs
    pub config_dir: PathBuf,
    pub ingest_binary: PathBuf,
    pub ffmpeg_binary: String,
    pub health_interval: Duration,
    pub startup_timeout: Duration,
    pub grace_period: Duration,
}

impl ControllerOptions {
    pub fn new(config_dir: PathBuf, ingest_binary: PathBuf) -> Self {
        let defaults = SupervisorOptions::default();
        Self {
            config_dir,
            ingest_binary,
            ffmpeg_binary: "ffmpeg".to_string(),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            startup_timeout: defaults.startup_timeout,
            grace_period: defaults.grace_period,
        }
    }
}

/// Bounded ring of timestamped monitor lines
struct RelayLog {
    lines: Mutex<VecDeque<RelayLogLine>>,
    sink: Arc<dyn EventSink>,
}

impl RelayLog {
    fn lock(&self) -> MutexGuard<'_, VecDeque<RelayLogLine>> {
        self.lines.lock().unwrap_or_else(|poisoned| {
            log::warn!("[Relay] Log lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn push(&self, message: impl Into<String>) {
        let line = RelayLogLine::now(message);
        {
            let mut lines = self.lock();
            if lines.len() == LOG_RING_CAPACITY {
                lines.pop_front();
            }
            lines.push_back(line.clone());
        }
        emit_event(self.sink.as_ref(), EVENT_RELAY_LOG, &line);
    }

    fn last(&self) -> Option<RelayLogLine> {
        self.lock().back().cloned()
    }

    fn recent(&self, max_lines: usize) -> Vec<RelayLogLine> {
        let lines = self.lock();
        let start = lines.len().saturating_sub(max_lines);
        lines.iter().skip(start).cloned().collect()
    }
}

/// Turns supervisor transitions into monitor lines before forwarding them
struct MonitorSink {
    log: Arc<RelayLog>,
    outer: Arc<dyn EventSink>,
}

impl EventSink for MonitorSink {
    fn emit(&self, event: &str, payload: Value) {
        if event == EVENT_RELAY_STATE {
            if let Some(message) = payload.get("message").and_then(Value::as_str) {
                self.log.push(message);
            }
        }
        self.outer.emit(event, payload);
    }
}

struct ActiveSession {
    info: RelaySession,
    config: RelayConfig,
    supervisor: Arc<ProcessSupervisor>,
    health_task: Option<JoinHandle<()>>,
}

pub struct RelayController {
    catalog: PlatformCatalog,
    options: ControllerOptions,
    event_sink: Arc<dyn EventSink>,
    log: Arc<RelayLog>,
    session: Mutex<Option<ActiveSession>>,
}

impl RelayController {
    pub fn new(catalog: PlatformCatalog, options: ControllerOptions, event_sink: Arc<dyn EventSink>) -> Self {
        let log = Arc::new(RelayLog {
            lines: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
            sink: Arc::clone(&event_sink),
        });
        Self {
            catalog,
            options,
            event_sink,
            log,
            session: Mutex::new(None),
        }
    }

    pub fn catalog(&self) -> &PlatformCatalog {
        &self.catalog
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(|poisoned| {
            log::warn!("[Relay] Session lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn record(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("[Relay] {message}");
        self.log.push(message);
    }

    fn render_options(&self) -> RenderOptions {
        RenderOptions {
            ffmpeg_bin: self.options.ffmpeg_binary.clone(),
            pid_file: Some(self.options.config_dir.join(PID_FILE_NAME)),
            redact_keys: false,
        }
    }

    fn ingest_spec(&self, contents: String) -> ExecutableSpec {
        let dir = &self.options.config_dir;
        let path = config_path(dir);
        ExecutableSpec {
            program: self.options.ingest_binary.clone(),
            args: vec![
                "-p".to_string(),
                dir.display().to_string(),
                "-c".to_string(),
                path.display().to_string(),
            ],
            working_dir: Some(dir.clone()),
            config: Some(RenderedConfig { path, contents }),
        }
    }

    fn ingest_program(&self) -> String {
        ExecutableSpec::new(self.options.ingest_binary.clone()).display_name()
    }

    /// Validate, render and launch a relay session
    pub async fn start(&self, config: RelayConfig) -> Result<RelaySession, ControllerError> {
        let topology = compile_with(&self.catalog, &config).map_err(|e| {
            self.record(format!("Invalid relay configuration: {e}"));
            e
        })?;
        let rendered = render_with(&topology, &self.render_options());

        let (supervisor, reservation, info) = {
            let mut session = self.lock_session();
            if let Some(active) = session.as_ref() {
                if !active.supervisor.state().is_terminal() {
                    return Err(ControllerError::AlreadyRunning);
                }
            }
            // Replace a session that failed permanently
            if let Some(mut previous) = session.take() {
                if let Some(task) = previous.health_task.take() {
                    task.abort();
                }
            }

            // nginx opens <prefix>/logs/error.log before reading the config
            let logs_dir = self.options.config_dir.join("logs");
            std::fs::create_dir_all(&logs_dir).map_err(|source| RenderError::IoFailure {
                path: logs_dir,
                source,
            })?;
            write_config(&config_path(&self.options.config_dir), &rendered)?;

            let supervisor = Arc::new(ProcessSupervisor::new(
                SupervisorOptions {
                    startup_timeout: self.options.startup_timeout,
                    grace_period: self.options.grace_period,
                    policy: config.reconnect,
                    forward_output: config.log_output,
                },
                Arc::new(MonitorSink {
                    log: Arc::clone(&self.log),
                    outer: Arc::clone(&self.event_sink),
                }),
            ));
            // Reserved under the session lock so an overlapping start is
            // rejected and an overlapping stop cancels this launch
            let reservation = supervisor.reserve(self.ingest_spec(rendered))?;
            let info = RelaySession {
                id: Uuid::new_v4(),
                publish_url: topology.publish_url(),
                started_at: Local::now(),
                pipelines: topology.summaries(),
            };
            *session = Some(ActiveSession {
                info: info.clone(),
                config: config.clone(),
                supervisor: Arc::clone(&supervisor),
                health_task: None,
            });
            (supervisor, reservation, info)
        };

        self.record(format!(
            "Starting multi-stream relay on port {} ({} destination(s))",
            topology.port,
            topology.pipelines.len()
        ));
        for pipeline in &info.pipelines {
            self.record(format!(
                "{}: {}k -> {}",
                pipeline.platform, pipeline.video_bitrate_kbps, pipeline.destination
            ));
        }

        if let Err(e) = supervisor.start_reserved(reservation).await {
            self.record(format!("Failed to start relay: {e}"));
            return Err(e.into());
        }

        let attached = {
            let mut session = self.lock_session();
            match session.as_mut() {
                Some(active) if Arc::ptr_eq(&active.supervisor, &supervisor) => {
                    active.health_task = Some(spawn_health_loop(
                        Arc::clone(&supervisor),
                        self.options.health_interval,
                    ));
                    true
                }
                _ => false,
            }
        };
        if !attached {
            // Stopped or replaced between promotion and here
            supervisor.stop().await;
            return Err(SupervisorError::Cancelled {
                program: self.ingest_program(),
            }
            .into());
        }

        self.record(format!("Multi-stream relay started. Publish to {}", info.publish_url));
        Ok(info)
    }

    /// Stop the active session; a no-op when nothing is running
    pub async fn stop(&self) {
        let session = self.lock_session().take();
        let Some(mut active) = session else {
            log::debug!("[Relay] Stop requested with no active session");
            return;
        };

        active.supervisor.stop().await;
        if let Some(mut task) = active.health_task.take() {
            if timeout(Duration::from_secs(2), &mut task).await.is_err() {
                task.abort();
            }
        }

        self.record("Multi-stream relay stopped");
    }

    /// Stop and start again with the active session's configuration
    pub async fn restart(&self) -> Result<RelaySession, ControllerError> {
        let config = self
            .lock_session()
            .as_ref()
            .map(|active| active.config.clone())
            .ok_or(ControllerError::NotRunning)?;

        self.record("Restarting relay");
        self.stop().await;
        self.start(config).await
    }

    pub fn is_running(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(|active| active.supervisor.state().is_active())
    }

    /// Consistent snapshot of the relay
    pub fn status(&self) -> RelayStatus {
        let last_log_line = self.log.last().map(|line| line.to_string());
        let session = self.lock_session();

        match session.as_ref() {
            Some(active) => {
                let snapshot = active.supervisor.snapshot();
                RelayStatus {
                    state: snapshot.state,
                    uptime_secs: snapshot.uptime_secs(),
                    reconnect_attempts: snapshot.attempt,
                    max_reconnect_attempts: active.supervisor.options().policy.max_attempts,
                    pid: snapshot.pid,
                    last_exit: snapshot.last_exit,
                    last_log_line,
                    session: Some(active.info.clone()),
                }
            }
            None => RelayStatus {
                state: LifecycleState::Stopped,
                uptime_secs: 0,
                reconnect_attempts: 0,
                max_reconnect_attempts: 0,
                pid: None,
                last_exit: None,
                last_log_line,
                session: None,
            },
        }
    }

    pub fn recent_log(&self, max_lines: usize) -> Vec<RelayLogLine> {
        self.log.recent(max_lines)
    }

    /// Validate a configuration without touching any process
    pub fn test_connection(&self, config: &RelayConfig) -> Result<Vec<PipelineSummary>, ConfigError> {
        match compile_with(&self.catalog, config) {
            Ok(topology) => {
                self.record(format!(
                    "Configuration valid for {} platform(s)",
                    topology.pipelines.len()
                ));
                Ok(topology.summaries())
            }
            Err(e) => {
                self.record(format!("Configuration check failed: {e}"));
                Err(e)
            }
        }
    }

    /// Rendered ingest config with stream keys masked
    pub fn preview_config(&self, config: &RelayConfig) -> Result<String, ConfigError> {
        let topology = compile_with(&self.catalog, config)?;
        Ok(render_with(&topology, &self.render_options().redacted()))
    }
}

impl Drop for RelayController {
    fn drop(&mut self) {
        let session = match self.session.get_mut() {
            Ok(session) => session.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut active) = session {
            if let Some(task) = active.health_task.take() {
                task.abort();
            }
        }
    }
}

fn spawn_health_loop(supervisor: Arc<ProcessSupervisor>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match supervisor.poll().await {
                PollOutcome::Alive => {}
                PollOutcome::Restarted { attempt } => {
                    log::debug!("[Relay] Health check performed restart {attempt}");
                }
                PollOutcome::Failed(_) | PollOutcome::Idle => break,
            }
        }
        log::debug!("[Relay] Health monitor exited");
    })
}
