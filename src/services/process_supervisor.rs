// Process Supervisor
// Owns the ingest server process: spawn, startup window, liveness, restart policy, shutdown

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::{sleep, timeout, Instant};

use crate::models::{ExitInfo, LifecycleState, ReconnectPolicy, SupervisorSnapshot};
use crate::services::config_renderer::write_config;
use crate::services::events::{
    emit_event, EventSink, EVENT_RELAY_FAILED, EVENT_RELAY_RECONNECTING, EVENT_RELAY_STATE,
};
use crate::services::PlatformCatalog;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RECENT_OUTPUT_LINES: usize = 20;

/// Supervisor failures surfaced to the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Failed to start {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("{program} crashed during startup ({exit})")]
    Crashed { program: String, exit: ExitInfo },

    #[error("{program} failed permanently after {attempts} restart attempts ({reason})")]
    RestartsExhausted {
        program: String,
        attempts: u32,
        reason: String,
    },

    #[error("Start of {program} was cancelled by a stop request")]
    Cancelled { program: String },

    #[error("{program} is already running")]
    AlreadyRunning { program: String },
}

/// Rendered configuration rewritten before every spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub path: PathBuf,
    pub contents: String,
}

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub config: Option<RenderedConfig>,
}

impl ExecutableSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            config: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// File name of the program, for messages
    pub fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// A start is only successful once the process survives this window
    pub startup_timeout: Duration,
    /// Time allowed for a graceful exit before the process is killed
    pub grace_period: Duration,
    pub policy: ReconnectPolicy,
    /// Log process stderr at warn level instead of debug
    pub forward_output: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            policy: ReconnectPolicy::default(),
            forward_output: true,
        }
    }
}

/// Result of a liveness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Stopped or failed, nothing to supervise
    Idle,
    /// Process alive, or a start is in flight elsewhere
    Alive,
    /// A restart was performed; check the snapshot for its result
    Restarted { attempt: u32 },
    /// The supervisor entered FailedPermanently during this poll
    Failed(SupervisorError),
}

/// Payload of `relay_state` events
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub pid: Option<u32>,
    pub message: String,
}

/// Claim on a supervisor taken by `reserve`
#[derive(Debug)]
#[must_use = "a reservation does nothing until passed to start_reserved"]
pub struct StartReservation {
    generation: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReconnectingEvent {
    attempt: u32,
    max_attempts: u32,
    delay_secs: u64,
}

#[derive(Debug, Default)]
struct SupervisorState {
    state: LifecycleState,
    pid: Option<u32>,
    attempt: u32,
    last_exit: Option<ExitInfo>,
    started_at: Option<DateTime<Local>>,
    /// Bumped by every start and stop; stale work compares against it
    generation: u64,
    spec: Option<ExecutableSpec>,
}

pub struct ProcessSupervisor {
    options: SupervisorOptions,
    state: Mutex<SupervisorState>,
    child: tokio::sync::Mutex<Option<Child>>,
    recent_output: Arc<Mutex<VecDeque<String>>>,
    event_sink: Arc<dyn EventSink>,
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions, event_sink: Arc<dyn EventSink>) -> Self {
        Self {
            options,
            state: Mutex::new(SupervisorState::default()),
            child: tokio::sync::Mutex::new(None),
            recent_output: Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_OUTPUT_LINES))),
            event_sink,
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            log::warn!("[Supervisor] State lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let state = self.lock_state();
        SupervisorSnapshot {
            state: state.state,
            pid: state.pid,
            attempt: state.attempt,
            last_exit: state.last_exit.clone(),
            started_at: state.started_at,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lock_state().state
    }

    /// Last lines the process wrote to stderr, keys redacted
    pub fn recent_output(&self) -> Vec<String> {
        match self.recent_output.lock() {
            Ok(lines) => lines.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    fn generation(&self) -> u64 {
        self.lock_state().generation
    }

    fn program_name(&self) -> String {
        self.lock_state()
            .spec
            .as_ref()
            .map(ExecutableSpec::display_name)
            .unwrap_or_else(|| "process".to_string())
    }

    /// Apply a transition unless a newer start/stop superseded `generation`
    fn transition(
        &self,
        generation: u64,
        to: LifecycleState,
        message: String,
        update: impl FnOnce(&mut SupervisorState),
    ) -> bool {
        let event = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return false;
            }
            let from = state.state;
            state.state = to;
            update(&mut state);
            TransitionEvent {
                from,
                to,
                attempt: state.attempt,
                max_attempts: self.options.policy.max_attempts,
                pid: state.pid,
                message,
            }
        };

        log::info!("[Supervisor] {} -> {}: {}", event.from, event.to, event.message);
        emit_event(self.event_sink.as_ref(), EVENT_RELAY_STATE, &event);
        true
    }

    fn fail_permanently(&self, generation: u64, error: &SupervisorError) {
        let message = error.to_string();
        if self.transition(generation, LifecycleState::FailedPermanently, message.clone(), |state| {
            state.pid = None;
            state.started_at = None;
        }) {
            log::error!("[Supervisor] {message}");
            emit_event(
                self.event_sink.as_ref(),
                EVENT_RELAY_FAILED,
                &serde_json::json!({ "error": message }),
            );
        }
    }

    /// Launch the process and wait out the startup window
    ///
    /// Returns once the process is Running, or with the reason it is not.
    pub async fn start(&self, spec: ExecutableSpec) -> Result<(), SupervisorError> {
        let reservation = self.reserve(spec)?;
        self.start_reserved(reservation).await
    }

    /// Claim the supervisor for a start without launching anything yet
    ///
    /// The supervisor moves to Starting, so a second start is rejected and a
    /// stop issued before `start_reserved` cancels the launch.
    pub fn reserve(&self, spec: ExecutableSpec) -> Result<StartReservation, SupervisorError> {
        let program = spec.display_name();
        let generation = {
            let mut state = self.lock_state();
            if !state.state.is_terminal() {
                return Err(SupervisorError::AlreadyRunning { program });
            }
            state.generation += 1;
            state.attempt = 0;
            state.last_exit = None;
            state.spec = Some(spec);
            state.generation
        };

        self.transition(
            generation,
            LifecycleState::Starting,
            format!("Starting {program}"),
            |state| {
                state.pid = None;
                state.started_at = None;
            },
        );
        Ok(StartReservation { generation })
    }

    /// Launch a reserved start
    pub async fn start_reserved(&self, reservation: StartReservation) -> Result<(), SupervisorError> {
        self.launch(reservation.generation, true).await
    }

    async fn launch(&self, generation: u64, fresh: bool) -> Result<(), SupervisorError> {
        let spec = match self.lock_state().spec.clone() {
            Some(spec) => spec,
            None => {
                return Err(SupervisorError::SpawnFailed {
                    program: "process".to_string(),
                    reason: "no executable configured".to_string(),
                })
            }
        };
        let program = spec.display_name();

        // A fresh start entered Starting when it was reserved
        let current = if fresh {
            self.generation() == generation
        } else {
            self.transition(
                generation,
                LifecycleState::Starting,
                format!("Starting {program}"),
                |state| {
                    state.pid = None;
                    state.started_at = None;
                },
            )
        };
        if !current {
            return Err(SupervisorError::Cancelled { program });
        }

        if let Some(config) = &spec.config {
            if let Err(e) = write_config(&config.path, &config.contents) {
                let error = SupervisorError::SpawnFailed {
                    program,
                    reason: e.to_string(),
                };
                self.fail_permanently(generation, &error);
                return Err(error);
            }
        }

        // Spawn under the slot lock: a stop either cancels before the spawn or
        // waits for the child to be installed and then terminates it
        {
            let mut slot = self.child.lock().await;
            if self.generation() != generation {
                return Err(SupervisorError::Cancelled { program });
            }

            let mut child = match self.build_command(&spec).spawn() {
                Ok(child) => child,
                Err(e) => {
                    drop(slot);
                    let error = SupervisorError::SpawnFailed {
                        program,
                        reason: e.to_string(),
                    };
                    self.fail_permanently(generation, &error);
                    return Err(error);
                }
            };

            let pid = child.id();
            log::info!("[Supervisor] Spawned {program} (pid {pid:?})");
            self.clear_recent_output();
            if let Some(stderr) = child.stderr.take() {
                self.spawn_output_reader(stderr, program.clone());
            }
            *slot = Some(child);
            self.lock_state().pid = pid;
        }

        let deadline = Instant::now() + self.options.startup_timeout;
        loop {
            if self.generation() != generation {
                return Err(SupervisorError::Cancelled { program });
            }

            let exited = {
                let mut slot = self.child.lock().await;
                match slot.as_mut().map(Child::try_wait) {
                    Some(Ok(Some(status))) => {
                        slot.take();
                        Some(ExitInfo::from_status(&status))
                    }
                    Some(Ok(None)) => None,
                    Some(Err(e)) => {
                        log::warn!("[Supervisor] Failed to query {program} status: {e}");
                        None
                    }
                    // Taken by a concurrent stop
                    None => return Err(SupervisorError::Cancelled { program }),
                }
            };

            if let Some(exit) = exited {
                return Err(self.handle_startup_exit(generation, fresh, program, exit));
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }

        let promoted = self.transition(
            generation,
            LifecycleState::Running,
            format!("{program} running"),
            |state| {
                state.attempt = 0;
                state.started_at = Some(Local::now());
            },
        );
        if promoted {
            Ok(())
        } else {
            Err(SupervisorError::Cancelled { program })
        }
    }

    fn handle_startup_exit(
        &self,
        generation: u64,
        fresh: bool,
        program: String,
        exit: ExitInfo,
    ) -> SupervisorError {
        let detail = self
            .recent_output()
            .last()
            .map(|line| format!(": {line}"))
            .unwrap_or_default();

        if fresh {
            let error = SupervisorError::SpawnFailed {
                program,
                reason: format!("exited during startup ({exit}){detail}"),
            };
            self.lock_state().last_exit = Some(exit);
            self.fail_permanently(generation, &error);
            return error;
        }

        let message = format!("{program} crashed during startup ({exit}){detail}");
        let error = SupervisorError::Crashed { program, exit: exit.clone() };
        self.transition(generation, LifecycleState::Crashed, message, |state| {
            state.pid = None;
            state.started_at = None;
            state.last_exit = Some(exit);
        });
        error
    }

    fn build_command(&self, spec: &ExecutableSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // Own process group so workers and transcoders go down with the master
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        cmd
    }

    fn spawn_output_reader(&self, stderr: ChildStderr, program: String) {
        let recent = Arc::clone(&self.recent_output);
        let forward = self.options.forward_output;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = PlatformCatalog::redact_line(line.trim_end());
                if line.is_empty() {
                    continue;
                }
                if forward {
                    log::warn!("[{program}] {line}");
                } else {
                    log::debug!("[{program}] {line}");
                }

                let mut recent = match recent.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if recent.len() == RECENT_OUTPUT_LINES {
                    recent.pop_front();
                }
                recent.push_back(line);
            }
        });
    }

    fn clear_recent_output(&self) {
        match self.recent_output.lock() {
            Ok(mut lines) => lines.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// Non-blocking liveness check that applies the restart policy on exit
    ///
    /// When a restart is due this waits out the backoff delay and the startup
    /// window before returning.
    pub async fn poll(&self) -> PollOutcome {
        let (current, generation) = {
            let state = self.lock_state();
            (state.state, state.generation)
        };

        match current {
            LifecycleState::Stopped | LifecycleState::FailedPermanently => return PollOutcome::Idle,
            LifecycleState::Starting | LifecycleState::Restarting => return PollOutcome::Alive,
            LifecycleState::Running => {
                let exited = {
                    let mut slot = self.child.lock().await;
                    match slot.as_mut().map(Child::try_wait) {
                        Some(Ok(Some(status))) => {
                            slot.take();
                            Some(ExitInfo::from_status(&status))
                        }
                        Some(Ok(None)) => None,
                        Some(Err(e)) => {
                            log::warn!("[Supervisor] Failed to query process status: {e}");
                            None
                        }
                        None => return PollOutcome::Idle,
                    }
                };

                let Some(exit) = exited else {
                    return PollOutcome::Alive;
                };

                let program = self.program_name();
                let (to, message) = if exit.success {
                    (LifecycleState::Exited, format!("{program} exited unexpectedly ({exit})"))
                } else {
                    (LifecycleState::Crashed, format!("{program} crashed ({exit})"))
                };
                if !self.transition(generation, to, message, |state| {
                    state.pid = None;
                    state.started_at = None;
                    state.last_exit = Some(exit);
                }) {
                    return PollOutcome::Idle;
                }
            }
            LifecycleState::Exited | LifecycleState::Crashed => {}
        }

        self.restart_or_fail(generation).await
    }

    async fn restart_or_fail(&self, generation: u64) -> PollOutcome {
        let policy = &self.options.policy;
        let (attempt, last_exit) = {
            let state = self.lock_state();
            (state.attempt, state.last_exit.clone())
        };
        let program = self.program_name();

        if !policy.auto_reconnect || attempt >= policy.max_attempts {
            let reason = last_exit
                .map(|exit| format!("last exit: {exit}"))
                .unwrap_or_else(|| "no exit status".to_string());
            let error = if policy.auto_reconnect {
                SupervisorError::RestartsExhausted {
                    program,
                    attempts: attempt,
                    reason,
                }
            } else {
                SupervisorError::RestartsExhausted {
                    program,
                    attempts: 0,
                    reason: format!("auto-reconnect disabled, {reason}"),
                }
            };
            self.fail_permanently(generation, &error);
            return PollOutcome::Failed(error);
        }

        let attempt = attempt + 1;
        let delay = policy.delay_for_attempt(attempt);
        if !self.transition(
            generation,
            LifecycleState::Restarting,
            format!(
                "Restarting {program} in {}s (attempt {attempt}/{})",
                delay.as_secs(),
                policy.max_attempts
            ),
            |state| state.attempt = attempt,
        ) {
            return PollOutcome::Idle;
        }
        emit_event(
            self.event_sink.as_ref(),
            EVENT_RELAY_RECONNECTING,
            &ReconnectingEvent {
                attempt,
                max_attempts: policy.max_attempts,
                delay_secs: delay.as_secs(),
            },
        );

        if !self.wait_unless_stopped(generation, delay).await {
            return PollOutcome::Idle;
        }

        match self.launch(generation, false).await {
            Ok(()) | Err(SupervisorError::Crashed { .. }) => PollOutcome::Restarted { attempt },
            Err(SupervisorError::Cancelled { .. }) => PollOutcome::Idle,
            Err(error) => PollOutcome::Failed(error),
        }
    }

    /// Sleep for `duration`, returning false early if a stop superseded `generation`
    async fn wait_unless_stopped(&self, generation: u64, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.generation() != generation {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Terminate the process and end in Stopped
    ///
    /// Idempotent. Cancels an in-flight start or pending restart. No process
    /// from this supervisor is alive when it returns.
    pub async fn stop(&self) {
        {
            let mut state = self.lock_state();
            if state.state == LifecycleState::Stopped && state.pid.is_none() {
                log::debug!("[Supervisor] Stop requested while already stopped");
                return;
            }
            state.generation += 1;
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            log::info!("[Supervisor] Stopping process (pid {:?})", child.id());
            terminate_child(&mut child, self.options.grace_period).await;
        }

        let event = {
            let mut state = self.lock_state();
            let from = state.state;
            state.state = LifecycleState::Stopped;
            state.pid = None;
            state.started_at = None;
            state.attempt = 0;
            TransitionEvent {
                from,
                to: LifecycleState::Stopped,
                attempt: 0,
                max_attempts: self.options.policy.max_attempts,
                pid: None,
                message: "Process stopped".to_string(),
            }
        };
        log::info!("[Supervisor] {} -> stopped", event.from);
        emit_event(self.event_sink.as_ref(), EVENT_RELAY_STATE, &event);
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.child.try_lock() {
            if let Some(child) = slot.as_mut() {
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                }
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) => killpg(Pid::from_raw(raw), signal).is_ok(),
        Err(_) => false,
    }
}

/// Ask the process (group) to exit, kill it if it has not after `grace`
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if !grace.is_zero() {
        if let Some(pid) = child.id() {
            if signal_group(pid, nix::sys::signal::Signal::SIGTERM) {
                match timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        log::debug!("[Supervisor] Process exited gracefully ({status})");
                        return;
                    }
                    Ok(Err(e)) => log::warn!("[Supervisor] Failed waiting for process: {e}"),
                    Err(_) => log::warn!(
                        "[Supervisor] Process did not exit within {}s, killing",
                        grace.as_secs_f32()
                    ),
                }
            }
        }
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }

    if let Err(e) = child.start_kill() {
        log::debug!("[Supervisor] Kill failed (process likely gone): {e}");
    }
    match timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => log::warn!("[Supervisor] Failed to reap process: {e}"),
        Err(_) => log::error!("[Supervisor] Process did not exit after kill"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::services::events::NoopEventSink;
    use tempfile::tempdir;

    fn options(startup_ms: u64, policy: ReconnectPolicy) -> SupervisorOptions {
        SupervisorOptions {
            startup_timeout: Duration::from_millis(startup_ms),
            grace_period: Duration::from_secs(2),
            policy,
            forward_output: false,
        }
    }

    fn supervisor(startup_ms: u64, policy: ReconnectPolicy) -> ProcessSupervisor {
        ProcessSupervisor::new(options(startup_ms, policy), Arc::new(NoopEventSink))
    }

    fn shell(script: &str) -> ExecutableSpec {
        ExecutableSpec::new("sh").arg("-c").arg(script)
    }

    fn process_exists(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    async fn poll_until_settled(supervisor: &ProcessSupervisor) -> (u32, PollOutcome) {
        let mut restarts = 0;
        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            match supervisor.poll().await {
                PollOutcome::Restarted { .. } => restarts += 1,
                PollOutcome::Alive => sleep(Duration::from_millis(50)).await,
                outcome => return (restarts, outcome),
            }
        }
        (restarts, PollOutcome::Alive)
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let supervisor = supervisor(100, ReconnectPolicy::default());
        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
        assert_eq!(supervisor.poll().await, PollOutcome::Idle);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_permanently() {
        let supervisor = supervisor(100, ReconnectPolicy::default());
        let err = supervisor
            .start(ExecutableSpec::new("/nonexistent/streamrelay-nginx"))
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
        assert_eq!(supervisor.state(), LifecycleState::FailedPermanently);
        assert_eq!(supervisor.poll().await, PollOutcome::Idle);
    }

    #[tokio::test]
    async fn test_exit_during_first_startup_is_spawn_failure() {
        let supervisor = supervisor(500, ReconnectPolicy::default());
        let err = supervisor
            .start(shell("echo 'bind() to 0.0.0.0:1935 failed' >&2; exit 2"))
            .await
            .unwrap_err();

        match err {
            SupervisorError::SpawnFailed { reason, .. } => assert!(reason.contains("exit code 2")),
            other => panic!("unexpected error: {other:?}"),
        }
        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, LifecycleState::FailedPermanently);
        assert_eq!(snapshot.last_exit.unwrap().code, Some(2));
    }

    #[tokio::test]
    async fn test_start_then_stop_leaves_no_process() {
        let supervisor = supervisor(100, ReconnectPolicy::default());
        supervisor.start(shell("sleep 30")).await.unwrap();

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Running);
        assert!(snapshot.started_at.is_some());
        let pid = snapshot.pid.unwrap();
        assert!(process_exists(pid));
        assert_eq!(supervisor.poll().await, PollOutcome::Alive);

        supervisor.stop().await;
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
        assert!(supervisor.snapshot().pid.is_none());
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let supervisor = supervisor(100, ReconnectPolicy::default());
        supervisor.start(shell("sleep 30")).await.unwrap();
        let err = supervisor.start(shell("sleep 30")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning { .. }));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_start_in_progress() {
        let supervisor = Arc::new(supervisor(3000, ReconnectPolicy::default()));
        let starter = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.start(shell("sleep 30")).await })
        };

        sleep(Duration::from_millis(300)).await;
        let pid = supervisor.snapshot().pid;
        supervisor.stop().await;

        let result = starter.await.unwrap();
        assert!(matches!(result, Err(SupervisorError::Cancelled { .. })));
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
        if let Some(pid) = pid {
            assert!(!process_exists(pid));
        }
    }

    #[tokio::test]
    async fn test_stop_after_reserve_cancels_launch() {
        let temp = tempdir().unwrap();
        let marker = temp.path().join("spawned");
        let spec = shell("touch \"$0\"; exec sleep 30").arg(marker.to_string_lossy().into_owned());

        let supervisor = supervisor(100, ReconnectPolicy::default());
        let reservation = supervisor.reserve(spec.clone()).unwrap();
        assert_eq!(supervisor.state(), LifecycleState::Starting);
        assert!(matches!(
            supervisor.reserve(spec),
            Err(SupervisorError::AlreadyRunning { .. })
        ));

        supervisor.stop().await;
        assert_eq!(supervisor.state(), LifecycleState::Stopped);

        let err = supervisor.start_reserved(reservation).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Cancelled { .. }));
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
        sleep(Duration::from_millis(200)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_three_crashes_exhaust_restart_budget() {
        let temp = tempdir().unwrap();
        let marker = temp.path().join("started");
        // First run survives the startup window, every restart dies immediately
        let spec = shell("if [ -f \"$0\" ]; then exit 3; fi; touch \"$0\"; sleep 0.5; exit 3")
            .arg(marker.to_string_lossy().into_owned());

        let policy = ReconnectPolicy {
            auto_reconnect: true,
            max_attempts: 3,
            delay_secs: 0,
        };
        let supervisor = supervisor(200, policy);
        supervisor.start(spec).await.unwrap();

        let (restarts, outcome) = poll_until_settled(&supervisor).await;
        assert_eq!(restarts, 3);
        assert!(matches!(
            outcome,
            PollOutcome::Failed(SupervisorError::RestartsExhausted { attempts: 3, .. })
        ));

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, LifecycleState::FailedPermanently);
        assert_eq!(snapshot.last_exit.unwrap().code, Some(3));
        assert_eq!(supervisor.poll().await, PollOutcome::Idle);
    }

    #[tokio::test]
    async fn test_successful_restart_resets_attempts() {
        let policy = ReconnectPolicy {
            auto_reconnect: true,
            max_attempts: 2,
            delay_secs: 0,
        };
        let supervisor = supervisor(100, policy);
        supervisor.start(shell("sleep 0.4; exit 1")).await.unwrap();

        sleep(Duration::from_millis(600)).await;
        assert_eq!(supervisor.poll().await, PollOutcome::Restarted { attempt: 1 });

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Running);
        assert_eq!(snapshot.attempt, 0);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_no_restart_without_auto_reconnect() {
        let policy = ReconnectPolicy {
            auto_reconnect: false,
            ..ReconnectPolicy::default()
        };
        let supervisor = supervisor(100, policy);
        supervisor.start(shell("sleep 0.3; exit 0")).await.unwrap();

        sleep(Duration::from_millis(500)).await;
        let outcome = supervisor.poll().await;
        assert!(matches!(outcome, PollOutcome::Failed(SupervisorError::RestartsExhausted { .. })));

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, LifecycleState::FailedPermanently);
        assert!(snapshot.last_exit.unwrap().success);
    }

    #[tokio::test]
    async fn test_stop_during_backoff_prevents_restart() {
        let policy = ReconnectPolicy {
            auto_reconnect: true,
            max_attempts: 5,
            delay_secs: 2,
        };
        let supervisor = Arc::new(supervisor(100, policy));
        supervisor.start(shell("sleep 0.2; exit 1")).await.unwrap();
        sleep(Duration::from_millis(400)).await;

        let poller = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.poll().await })
        };
        sleep(Duration::from_millis(200)).await;
        assert_eq!(supervisor.state(), LifecycleState::Restarting);

        supervisor.stop().await;
        assert_eq!(poller.await.unwrap(), PollOutcome::Idle);
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
        assert!(supervisor.snapshot().pid.is_none());
    }

    #[tokio::test]
    async fn test_config_written_before_spawn() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nginx").join("nginx.conf");
        let mut spec = shell("sleep 30");
        spec.config = Some(RenderedConfig {
            path: path.clone(),
            contents: "daemon off;\n".to_string(),
        });

        let supervisor = supervisor(100, ReconnectPolicy::default());
        supervisor.start(spec).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "daemon off;\n");
        supervisor.stop().await;
    }
}
