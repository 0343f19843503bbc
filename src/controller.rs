//! Orchestration of one test run.
//!
//! ```text
//! reset/clear → patch options → launch ─┬─ exit watcher ─┐
//!                                       └─ tail watcher ─┤
//! warmup → navigate → load wait → trigger → await status → quit → cleanup → verdict
//! ```
//!
//! The warmup, load wait and status wait are cancellation points: a crash
//! seen by the exit watcher or an interrupt ends the run there. Key sequences
//! always run to completion once started. Cleanup runs on every path through
//! the [`LaunchedAut`] guard.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::TestRunConfig;
use crate::input::InputDriver;
use crate::log::{LogEvent, RunLog};
use crate::options;
use crate::status::{StatusState, StatusTracker};
use crate::supervisor::{self, ExitWatcher, RunState, SupervisedProcess};
use crate::tail::{LogCursor, TailWatcher};
use crate::verdict::{ResultStore, TestVerdict};

/// Longest uninterrupted sleep inside a cancellable wait.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Failures that end a run early.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("AUT exited unexpectedly (exit code {code:?})")]
    Crashed { code: Option<i32> },
    #[error("run interrupted")]
    Interrupted,
    #[error("failed to launch AUT")]
    Launch(#[source] anyhow::Error),
    #[error("failed to inject input")]
    Input(#[source] anyhow::Error),
}

/// Why a run ended with its verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictReason {
    Passed,
    Failed,
    TimedOut,
    Crashed { code: Option<i32> },
    Interrupted,
    Error(String),
}

impl VerdictReason {
    pub fn verdict(&self) -> TestVerdict {
        match self {
            VerdictReason::Passed => TestVerdict::Pass,
            _ => TestVerdict::Fail,
        }
    }
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictReason::Passed => f.write_str("all tests passed"),
            VerdictReason::Failed => f.write_str("tests failed"),
            VerdictReason::TimedOut => f.write_str("timed out waiting for test results"),
            VerdictReason::Crashed { code: Some(code) } => {
                write!(f, "AUT crashed with exit code {code}")
            }
            VerdictReason::Crashed { code: None } => f.write_str("AUT was killed by a signal"),
            VerdictReason::Interrupted => f.write_str("interrupted"),
            VerdictReason::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

impl From<RunError> for VerdictReason {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Crashed { code } => VerdictReason::Crashed { code },
            RunError::Interrupted => VerdictReason::Interrupted,
            other => VerdictReason::Error(format!("{:#}", anyhow::Error::from(other))),
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub verdict: TestVerdict,
    pub reason: VerdictReason,
    /// Whether the verdict reached the result artifact.
    pub persisted: bool,
}

/// One-shot record of an unexpected AUT exit.
#[derive(Debug, Clone, Default)]
struct CrashSignal(Arc<Mutex<Option<Option<i32>>>>);

impl CrashSignal {
    fn trigger(&self, code: Option<i32>) {
        self.0.lock().unwrap().get_or_insert(code);
    }

    fn get(&self) -> Option<Option<i32>> {
        *self.0.lock().unwrap()
    }

    fn clear(&self) {
        *self.0.lock().unwrap() = None;
    }
}

/// The running AUT plus its watchers. Dropping it tears everything down.
struct LaunchedAut<'a> {
    config: &'a TestRunConfig,
    process: SupervisedProcess,
    exit_watcher: Option<ExitWatcher>,
    tail_watcher: Option<TailWatcher>,
    cleaned_up: bool,
}

impl<'a> LaunchedAut<'a> {
    fn new(config: &'a TestRunConfig, process: SupervisedProcess) -> Self {
        Self {
            config,
            process,
            exit_watcher: None,
            tail_watcher: None,
            cleaned_up: false,
        }
    }

    /// Stop the watchers, terminate the AUT and sweep build-tool daemons.
    fn cleanup(&mut self) -> (RunState, usize) {
        self.cleaned_up = true;
        self.process.request_shutdown();
        if let Some(watcher) = self.exit_watcher.take() {
            watcher.stop();
        }
        self.process.terminate(self.config.terminate_grace);
        if let Some(watcher) = self.tail_watcher.take() {
            watcher.stop();
        }

        let killed = supervisor::kill_sibling_daemons(&self.config.daemon_fragments);
        supervisor::stop_daemon(
            &self.config.daemon_stop_command,
            &self.config.work_dir,
            self.config.daemon_stop_timeout,
        );

        let state = self.process.state();
        info!(state = ?state, daemons_killed = killed, "cleanup complete");
        (state, killed)
    }
}

impl Drop for LaunchedAut<'_> {
    fn drop(&mut self) {
        if !self.cleaned_up {
            self.cleanup();
        }
    }
}

/// Drives one AUT through launch, test trigger and shutdown.
pub struct Controller {
    config: TestRunConfig,
    tracker: StatusTracker,
    store: ResultStore,
    input: InputDriver,
    run_log: RunLog,
    cursor: LogCursor,
    crash: CrashSignal,
    interrupt: Arc<AtomicBool>,
}

impl Controller {
    /// `interrupt` is polled at every cancellation point; setting it ends the
    /// run with FAIL after cleanup.
    pub fn new(config: TestRunConfig, input: InputDriver, interrupt: Arc<AtomicBool>) -> Self {
        let run_log = RunLog::open(&config.run_log_path).unwrap_or_else(|e| {
            warn!(error = %e, "execution log disabled");
            RunLog::disabled()
        });
        Self {
            tracker: StatusTracker::new(config.patterns.clone()),
            store: ResultStore::new(config.result_path.clone()),
            input,
            run_log,
            cursor: LogCursor::at_end_of(&config.log_path),
            crash: CrashSignal::default(),
            interrupt,
            config,
        }
    }

    pub fn run_id(&self) -> &str {
        self.run_log.run_id()
    }

    /// Perform a complete run and persist its verdict. Never fails: every
    /// error, and any panic below this point, becomes a FAIL verdict.
    pub fn run(&mut self) -> RunOutcome {
        let started = Instant::now();
        info!(
            run_id = %self.run_log.run_id(),
            program = %self.config.program,
            "starting automated test run"
        );
        self.run_log.record(LogEvent::RunStarted {
            program: self.config.program.clone(),
            log_path: self.config.log_path.display().to_string(),
            result_path: self.config.result_path.display().to_string(),
            completion_timeout_ms: self.config.completion_timeout.as_millis() as u64,
        });

        self.tracker.reset();
        self.crash.clear();
        self.store.clear();
        self.patch_options();

        let reason = match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(Ok(reason)) => reason,
            Err(payload) => {
                let msg = format!("run panicked: {}", panic_message(payload.as_ref()));
                error!(error = %msg, "run failed");
                VerdictReason::Error(msg)
            }
            Ok(Err(err)) => {
                if let RunError::Crashed { code } = err {
                    self.run_log
                        .record(LogEvent::CrashDetected { exit_code: code });
                }
                let reason = VerdictReason::from(err);
                match &reason {
                    VerdictReason::Error(msg) => error!(error = %msg, "run failed"),
                    other => warn!(reason = %other, "run ended early"),
                }
                reason
            }
        };

        let verdict = reason.verdict();
        let persisted = self.store.write(verdict);
        self.run_log.record(LogEvent::VerdictWritten {
            verdict,
            path: self.store.path().display().to_string(),
            persisted,
        });
        self.run_log.record(LogEvent::RunFinished {
            verdict,
            reason: reason.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        info!(verdict = %verdict, reason = %reason, "run finished");

        RunOutcome {
            verdict,
            reason,
            persisted,
        }
    }

    fn patch_options(&self) {
        let path = &self.config.options_path;
        match options::ensure_option(path, &self.config.display_key, &self.config.display_value) {
            Ok(outcome) => self.run_log.record(LogEvent::OptionPatched {
                path: path.display().to_string(),
                key: self.config.display_key.clone(),
                value: self.config.display_value.clone(),
                outcome,
            }),
            Err(e) => warn!(path = %path.display(), error = %e, "could not patch option file"),
        }
    }

    fn execute(&mut self) -> Result<VerdictReason, RunError> {
        let process =
            supervisor::launch(&self.config.launch_spec()).map_err(RunError::Launch)?;
        self.run_log.record(LogEvent::AutLaunched {
            pid: process.pid(),
            program: self.config.program.clone(),
            args: self.config.args.clone(),
        });

        // Watchers are owned by the guard, so they are joined on every path.
        let config = self.config.clone();
        let mut aut = LaunchedAut::new(&config, process);
        let crash = self.crash.clone();
        aut.exit_watcher = Some(
            supervisor::watch_exit(&aut.process, config.poll_interval, move |code| {
                crash.trigger(code)
            })
            .map_err(RunError::Launch)?,
        );
        aut.tail_watcher = Some(
            TailWatcher::start(
                &config.log_path,
                self.cursor.clone(),
                self.tracker.clone(),
                config.poll_interval,
            )
            .map_err(RunError::Launch)?,
        );

        let result = self.drive(&aut.process);

        let (run_state, daemons_killed) = aut.cleanup();
        self.run_log.record(LogEvent::CleanupCompleted {
            run_state: Some(run_state),
            daemons_killed,
        });
        result
    }

    fn drive(&mut self, process: &SupervisedProcess) -> Result<VerdictReason, RunError> {
        info!(
            wait_ms = self.config.launch_timeout.as_millis() as u64,
            "waiting for AUT to start"
        );
        self.pause(self.config.launch_timeout)?;

        self.navigate()?;

        info!(
            wait_ms = self.config.world_load_timeout.as_millis() as u64,
            "waiting for session to load"
        );
        self.pause(self.config.world_load_timeout)?;

        self.send_trigger()?;
        let reason = self.await_status()?;

        process.request_shutdown();
        self.request_quit();
        Ok(reason)
    }

    fn navigate(&mut self) -> Result<(), RunError> {
        self.check_abort()?;
        info!(steps = self.config.navigation.len(), "navigating to session");
        sleep(self.config.navigation_settle);
        for (key, wait) in &self.config.navigation {
            self.input.send_key(*key).map_err(RunError::Input)?;
            sleep(*wait);
        }
        self.run_log.record(LogEvent::NavigationCompleted {
            steps: self.config.navigation.len(),
        });
        Ok(())
    }

    fn send_trigger(&mut self) -> Result<(), RunError> {
        self.check_abort()?;
        sleep(self.config.pre_trigger_wait);
        info!(command = %self.config.trigger_command, "triggering test suite");
        let command = self.config.trigger_command.clone();
        self.send_command(&command).map_err(RunError::Input)?;
        sleep(self.config.submit_wait);
        self.run_log.record(LogEvent::TriggerSent { command });
        Ok(())
    }

    /// Open the console, type `command`, submit it.
    fn send_command(&mut self, command: &str) -> anyhow::Result<()> {
        self.input.send_key(self.config.open_console_key)?;
        sleep(self.config.console_open_wait);
        self.input.send_text(command)?;
        sleep(self.config.typed_wait);
        self.input.send_key(crate::input::Key::Enter)
    }

    fn await_status(&self) -> Result<VerdictReason, RunError> {
        let started = Instant::now();
        let deadline = started + self.config.completion_timeout;
        info!(
            timeout_ms = self.config.completion_timeout.as_millis() as u64,
            "waiting for test results"
        );

        loop {
            self.check_abort()?;
            let state = self.tracker.get();
            if state != StatusState::Unknown {
                self.run_log.record(LogEvent::StatusObserved {
                    state,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                return Ok(if state == StatusState::Pass {
                    info!("tests completed successfully");
                    VerdictReason::Passed
                } else {
                    warn!("tests reported failure");
                    VerdictReason::Failed
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("no test result before the completion timeout");
                self.run_log.record(LogEvent::TimedOut {
                    timeout_ms: self.config.completion_timeout.as_millis() as u64,
                });
                return Ok(VerdictReason::TimedOut);
            }
            self.pause(self.config.poll_interval.min(deadline - now))?;
        }
    }

    /// Best-effort graceful quit through the console.
    fn request_quit(&mut self) {
        let command = self.config.quit_command.clone();
        if command.is_empty() {
            return;
        }
        info!(command = %command, "requesting graceful quit");
        match self.send_command(&command) {
            Ok(()) => self.run_log.record(LogEvent::QuitRequested { command }),
            Err(e) => warn!(error = %e, "could not send quit command"),
        }
        if self.pause(self.config.quit_wait).is_err() {
            info!("quit wait cut short");
        }
    }

    fn check_abort(&self) -> Result<(), RunError> {
        if self.interrupt.load(Ordering::SeqCst) {
            return Err(RunError::Interrupted);
        }
        if let Some(code) = self.crash.get() {
            return Err(RunError::Crashed { code });
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early on crash or interrupt.
    fn pause(&self, duration: Duration) -> Result<(), RunError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_abort()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

fn sleep(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
