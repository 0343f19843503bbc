use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::input::{InputBackend, Key};
use crate::status::StatusPatterns;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".autorun";

fn default_program() -> String {
    "./gradlew".to_string()
}

fn default_args() -> Vec<String> {
    vec!["runClient".to_string()]
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "ORG_GRADLE_PROJECT_JVM_ARGS".to_string(),
        "-Dapple.awt.UIElement=true -Djava.awt.headless=false".to_string(),
    )])
}

fn default_startup_grace_ms() -> u64 {
    2000
}

fn default_launch_timeout_ms() -> u64 {
    10_000
}

fn default_world_load_timeout_ms() -> u64 {
    2000
}

fn default_completion_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_terminate_grace_ms() -> u64 {
    5000
}

fn default_quit_wait_ms() -> u64 {
    2000
}

fn default_log_path() -> PathBuf {
    PathBuf::from("run/logs/latest.log")
}

fn default_options_path() -> PathBuf {
    PathBuf::from("run/options.txt")
}

fn default_result_path() -> PathBuf {
    PathBuf::from("test-result.txt")
}

fn default_run_log_path() -> PathBuf {
    PathBuf::from(".autorun/logs/runs.jsonl")
}

fn default_success_patterns() -> Vec<String> {
    StatusPatterns::default().success().to_vec()
}

fn default_failure_patterns() -> Vec<String> {
    StatusPatterns::default().failure().to_vec()
}

fn default_display_key() -> String {
    "fullscreen".to_string()
}

fn default_display_value() -> String {
    "false".to_string()
}

fn default_key_delay_ms() -> u64 {
    10
}

fn default_settle_ms() -> u64 {
    500
}

fn default_navigation_steps() -> Vec<NavigationStep> {
    // Tab past a focus-stealing prompt, enter the first menu entry, select
    // the first session, enter it.
    vec![
        NavigationStep::new(Key::Tab, 100),
        NavigationStep::new(Key::Enter, 1200),
        NavigationStep::new(Key::Tab, 600),
        NavigationStep::new(Key::Enter, 1500),
    ]
}

fn default_open_console_key() -> Key {
    Key::Char('t')
}

fn default_trigger() -> String {
    "/runalltests".to_string()
}

fn default_quit() -> String {
    "/clientquit".to_string()
}

fn default_pre_trigger_wait_ms() -> u64 {
    1000
}

fn default_console_open_wait_ms() -> u64 {
    300
}

fn default_typed_wait_ms() -> u64 {
    500
}

fn default_submit_wait_ms() -> u64 {
    1000
}

fn default_daemon_fragments() -> Vec<String> {
    vec!["gradle".to_string(), "gradlew".to_string()]
}

fn default_stop_command() -> Vec<String> {
    vec!["./gradlew".to_string(), "--stop".to_string()]
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LaunchConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Applied only when the variable is not already set.
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            work_dir: default_work_dir(),
            env: default_env(),
            startup_grace_ms: default_startup_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    #[serde(default = "default_world_load_timeout_ms")]
    pub world_load_timeout_ms: u64,
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default = "default_quit_wait_ms")]
    pub quit_wait_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            launch_timeout_ms: default_launch_timeout_ms(),
            world_load_timeout_ms: default_world_load_timeout_ms(),
            completion_timeout_ms: default_completion_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            quit_wait_ms: default_quit_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_log_path")]
    pub log: PathBuf,
    #[serde(default = "default_options_path")]
    pub options: PathBuf,
    #[serde(default = "default_result_path")]
    pub result: PathBuf,
    #[serde(default = "default_run_log_path")]
    pub run_log: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log: default_log_path(),
            options: default_options_path(),
            result: default_result_path(),
            run_log: default_run_log_path(),
        }
    }
}

/// Log substrings announcing the suite's outcome.
///
/// ```toml
/// [patterns]
/// success = ["All tests passed"]
/// failure = ["Some tests failed", "Test execution failed"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatternsConfig {
    #[serde(default = "default_success_patterns")]
    pub success: Vec<String>,
    #[serde(default = "default_failure_patterns")]
    pub failure: Vec<String>,
}

impl Default for PatternsConfig {
    fn default() -> Self {
        Self {
            success: default_success_patterns(),
            failure: default_failure_patterns(),
        }
    }
}

/// The single option line patched before launch.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_key")]
    pub key: String,
    #[serde(default = "default_display_value")]
    pub value: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            key: default_display_key(),
            value: default_display_value(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputConfig {
    #[serde(default)]
    pub backend: InputBackend,
    #[serde(default = "default_key_delay_ms")]
    pub key_delay_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            backend: InputBackend::default(),
            key_delay_ms: default_key_delay_ms(),
        }
    }
}

/// One key press in the menu-to-session sequence, followed by a wait.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NavigationStep {
    pub key: Key,
    #[serde(default)]
    pub wait_ms: u64,
}

impl NavigationStep {
    pub fn new(key: Key, wait_ms: u64) -> Self {
        Self { key, wait_ms }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NavigationConfig {
    /// Wait before the first step.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_navigation_steps")]
    pub steps: Vec<NavigationStep>,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            steps: default_navigation_steps(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandsConfig {
    #[serde(default = "default_open_console_key")]
    pub open_console_key: Key,
    #[serde(default = "default_trigger")]
    pub trigger: String,
    #[serde(default = "default_quit")]
    pub quit: String,
    #[serde(default = "default_pre_trigger_wait_ms")]
    pub pre_trigger_wait_ms: u64,
    #[serde(default = "default_console_open_wait_ms")]
    pub console_open_wait_ms: u64,
    #[serde(default = "default_typed_wait_ms")]
    pub typed_wait_ms: u64,
    #[serde(default = "default_submit_wait_ms")]
    pub submit_wait_ms: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            open_console_key: default_open_console_key(),
            trigger: default_trigger(),
            quit: default_quit(),
            pre_trigger_wait_ms: default_pre_trigger_wait_ms(),
            console_open_wait_ms: default_console_open_wait_ms(),
            typed_wait_ms: default_typed_wait_ms(),
            submit_wait_ms: default_submit_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Command-line substrings identifying lingering build-tool daemons.
    #[serde(default = "default_daemon_fragments")]
    pub fragments: Vec<String>,
    /// Empty disables the stop command.
    #[serde(default = "default_stop_command")]
    pub stop_command: Vec<String>,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            fragments: default_daemon_fragments(),
            stop_command: default_stop_command(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RunConfig {
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub patterns: PatternsConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub navigation: NavigationConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl RunConfig {
    /// Search upward from `start` for a `.autorun/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let config = Self::load_from(&path)?;
            Ok((config, Some(path)))
        } else {
            Ok((RunConfig::default(), None))
        }
    }

    /// Load an explicit config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: RunConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.launch.program.trim().is_empty() {
            bail!("launch.program must not be empty");
        }
        if self.timing.poll_interval_ms == 0 {
            bail!("timing.poll_interval_ms must be greater than zero");
        }
        if self.patterns.success.iter().all(|p| p.is_empty()) {
            bail!("patterns.success must contain at least one non-empty pattern");
        }
        if self.display.key.trim().is_empty() {
            bail!("display.key must not be empty");
        }
        Ok(())
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Directory that relative paths resolve against: the parent of the
    /// `.autorun/` directory holding `config_path`, or `cwd` without one.
    pub fn project_root(config_path: Option<&Path>, cwd: &Path) -> PathBuf {
        config_path
            .and_then(Path::parent)
            .filter(|dir| dir.file_name().is_some_and(|n| n == CONFIG_DIR))
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf())
    }

    /// Resolve into the immutable view the controller runs with.
    pub fn resolve(&self, root: &Path) -> TestRunConfig {
        let at_root = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };
        let ms = Duration::from_millis;

        TestRunConfig {
            program: self.launch.program.clone(),
            args: self.launch.args.clone(),
            work_dir: at_root(&self.launch.work_dir),
            env: self
                .launch
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            startup_grace: ms(self.launch.startup_grace_ms),
            launch_timeout: ms(self.timing.launch_timeout_ms),
            world_load_timeout: ms(self.timing.world_load_timeout_ms),
            completion_timeout: ms(self.timing.completion_timeout_ms),
            poll_interval: ms(self.timing.poll_interval_ms.max(1)),
            terminate_grace: ms(self.timing.terminate_grace_ms),
            quit_wait: ms(self.timing.quit_wait_ms),
            log_path: at_root(&self.paths.log),
            options_path: at_root(&self.paths.options),
            result_path: at_root(&self.paths.result),
            run_log_path: at_root(&self.paths.run_log),
            patterns: StatusPatterns::new(
                self.patterns.success.clone(),
                self.patterns.failure.clone(),
            ),
            display_key: self.display.key.clone(),
            display_value: self.display.value.clone(),
            input_backend: self.input.backend,
            key_delay: ms(self.input.key_delay_ms),
            navigation_settle: ms(self.navigation.settle_ms),
            navigation: self
                .navigation
                .steps
                .iter()
                .map(|s| (s.key, ms(s.wait_ms)))
                .collect(),
            open_console_key: self.commands.open_console_key,
            trigger_command: self.commands.trigger.clone(),
            quit_command: self.commands.quit.clone(),
            pre_trigger_wait: ms(self.commands.pre_trigger_wait_ms),
            console_open_wait: ms(self.commands.console_open_wait_ms),
            typed_wait: ms(self.commands.typed_wait_ms),
            submit_wait: ms(self.commands.submit_wait_ms),
            daemon_fragments: self.daemon.fragments.clone(),
            daemon_stop_command: self.daemon.stop_command.clone(),
            daemon_stop_timeout: ms(self.daemon.stop_timeout_ms),
        }
    }
}

/// Immutable tunables for one run, with paths resolved and durations typed.
#[derive(Debug, Clone)]
pub struct TestRunConfig {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub startup_grace: Duration,
    pub launch_timeout: Duration,
    pub world_load_timeout: Duration,
    pub completion_timeout: Duration,
    pub poll_interval: Duration,
    pub terminate_grace: Duration,
    pub quit_wait: Duration,
    pub log_path: PathBuf,
    pub options_path: PathBuf,
    pub result_path: PathBuf,
    pub run_log_path: PathBuf,
    pub patterns: StatusPatterns,
    pub display_key: String,
    pub display_value: String,
    pub input_backend: InputBackend,
    pub key_delay: Duration,
    pub navigation_settle: Duration,
    pub navigation: Vec<(Key, Duration)>,
    pub open_console_key: Key,
    pub trigger_command: String,
    pub quit_command: String,
    pub pre_trigger_wait: Duration,
    pub console_open_wait: Duration,
    pub typed_wait: Duration,
    pub submit_wait: Duration,
    pub daemon_fragments: Vec<String>,
    pub daemon_stop_command: Vec<String>,
    pub daemon_stop_timeout: Duration,
}

impl TestRunConfig {
    pub fn launch_spec(&self) -> crate::supervisor::LaunchSpec {
        crate::supervisor::LaunchSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            work_dir: self.work_dir.clone(),
            env: self.env.clone(),
            startup_grace: self.startup_grace,
        }
    }
}
