mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use autorun::config::RunConfig;
use autorun::controller::Controller;
use autorun::input::{InputBackend, InputDriver};
use autorun::verdict::{ResultStore, TestVerdict};
use cli::{Cli, Command};

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults; no .autorun/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn render_config_human(config: &RunConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Launch\n");
    push_kv(&mut output, "program", &config.launch.program);
    push_kv(&mut output, "args", list_or_none(&config.launch.args));
    push_kv(&mut output, "work_dir", config.launch.work_dir.display());
    if config.launch.env.is_empty() {
        push_kv(&mut output, "env", "(none)");
    }
    for (key, value) in &config.launch.env {
        push_kv(&mut output, &format!("env.{key}"), value);
    }
    push_kv(&mut output, "startup_grace_ms", config.launch.startup_grace_ms);
    output.push('\n');

    output.push_str("Timing\n");
    push_kv(&mut output, "launch_timeout_ms", config.timing.launch_timeout_ms);
    push_kv(
        &mut output,
        "world_load_timeout_ms",
        config.timing.world_load_timeout_ms,
    );
    push_kv(
        &mut output,
        "completion_timeout_ms",
        config.timing.completion_timeout_ms,
    );
    push_kv(&mut output, "poll_interval_ms", config.timing.poll_interval_ms);
    push_kv(&mut output, "terminate_grace_ms", config.timing.terminate_grace_ms);
    push_kv(&mut output, "quit_wait_ms", config.timing.quit_wait_ms);
    output.push('\n');

    output.push_str("Paths\n");
    push_kv(&mut output, "log", config.paths.log.display());
    push_kv(&mut output, "options", config.paths.options.display());
    push_kv(&mut output, "result", config.paths.result.display());
    push_kv(&mut output, "run_log", config.paths.run_log.display());
    output.push('\n');

    output.push_str("Patterns\n");
    push_kv(&mut output, "success", list_or_none(&config.patterns.success));
    push_kv(&mut output, "failure", list_or_none(&config.patterns.failure));
    output.push('\n');

    output.push_str("Display\n");
    push_kv(
        &mut output,
        "option",
        format!("{}:{}", config.display.key, config.display.value),
    );
    output.push('\n');

    output.push_str("Input\n");
    push_kv(&mut output, "backend", config.input.backend.as_str());
    push_kv(&mut output, "key_delay_ms", config.input.key_delay_ms);
    push_kv(&mut output, "settle_ms", config.navigation.settle_ms);
    let steps: Vec<String> = config
        .navigation
        .steps
        .iter()
        .map(|s| format!("{} (+{}ms)", s.key, s.wait_ms))
        .collect();
    push_kv(&mut output, "navigation", list_or_none(&steps));
    output.push('\n');

    output.push_str("Commands\n");
    push_kv(&mut output, "open_console_key", config.commands.open_console_key);
    push_kv(&mut output, "trigger", &config.commands.trigger);
    push_kv(&mut output, "quit", &config.commands.quit);
    output.push('\n');

    output.push_str("Daemon\n");
    push_kv(&mut output, "fragments", list_or_none(&config.daemon.fragments));
    push_kv(
        &mut output,
        "stop_command",
        if config.daemon.stop_command.is_empty() {
            "(none)".to_string()
        } else {
            config.daemon.stop_command.join(" ")
        },
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "config", config_source_label(config_path));
    output
}

fn render_config_json(config: &RunConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            "source_path".to_string(),
            serde_json::Value::String(config_source_label(config_path)),
        );
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn load_config(explicit: Option<&Path>, cwd: &Path) -> Result<(RunConfig, Option<PathBuf>)> {
    match explicit {
        Some(path) => {
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                cwd.join(path)
            };
            Ok((RunConfig::load_from(&path)?, Some(path)))
        }
        None => RunConfig::load(cwd),
    }
}

/// Write FAIL where a consumer expects the verdict when the run never got
/// far enough to do it itself.
fn fail_early(result_path: &Path, err: anyhow::Error) -> Result<ExitCode> {
    ResultStore::new(result_path).write(TestVerdict::Fail);
    Err(err)
}

fn run(
    config_path: Option<&Path>,
    cwd: &Path,
    no_input: bool,
    completion_timeout: Option<u64>,
) -> Result<ExitCode> {
    let (mut config, source) = match load_config(config_path, cwd) {
        Ok(loaded) => loaded,
        Err(e) => {
            let fallback = RunConfig::default().resolve(cwd).result_path;
            return fail_early(&fallback, e);
        }
    };
    match source {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .autorun/config.toml found, using defaults"),
    }

    if no_input {
        config.input.backend = InputBackend::None;
    }
    if let Some(secs) = completion_timeout {
        config.timing.completion_timeout_ms = secs.saturating_mul(1000);
    }

    let root = RunConfig::project_root(source.as_deref(), cwd);
    let resolved = config.resolve(&root);

    let injector = match resolved.input_backend.injector() {
        Ok(injector) => injector,
        Err(e) => return fail_early(&resolved.result_path, e),
    };
    let input = InputDriver::new(injector, resolved.key_delay);
    info!(backend = input.backend(), "input backend ready");

    let interrupt = Arc::new(AtomicBool::new(false));
    let interrupt_flag = interrupt.clone();
    ctrlc::set_handler(move || {
        interrupt_flag.store(true, Ordering::SeqCst);
    })
    .ok(); // best-effort; fails if a handler is already installed

    let mut controller = Controller::new(resolved, input, interrupt);
    let outcome = controller.run();
    if !outcome.persisted {
        warn!("verdict could not be persisted; consumers will read FAIL");
    }
    println!(
        "{} ({}) [run {}]",
        outcome.verdict,
        outcome.reason,
        controller.run_id()
    );
    Ok(ExitCode::from(outcome.verdict.exit_code()))
}

fn read_verdict(config_path: Option<&Path>, cwd: &Path) -> Result<TestVerdict> {
    let (config, source) = load_config(config_path, cwd)?;
    let root = RunConfig::project_root(source.as_deref(), cwd);
    Ok(ResultStore::new(config.resolve(&root).result_path).read())
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let cwd =
        std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Run {
            no_input,
            completion_timeout,
        } => run(config_path, &cwd, no_input, completion_timeout),
        Command::Config { json } => {
            let (config, source) = load_config(config_path, &cwd)?;
            if json {
                println!("{}", render_config_json(&config, source.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, source.as_deref()));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Verdict => {
            let verdict = read_verdict(config_path, &cwd)?;
            println!("{verdict}");
            Ok(ExitCode::from(verdict.exit_code()))
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let quiet = matches!(cli.command, Command::Config { .. } | Command::Verdict);

    let filter = match cli.verbose {
        0 if quiet => "autorun=warn",
        0 => "autorun=info",
        1 => "autorun=debug",
        _ => "autorun=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_config_human_groups_sections() {
        let config = RunConfig::default();
        let rendered = render_config_human(&config, None);

        for section in [
            "Launch", "Timing", "Paths", "Patterns", "Display", "Input", "Commands", "Daemon",
            "Source Path",
        ] {
            assert!(rendered.contains(section), "missing section {section}");
        }
        assert!(rendered.contains("runClient"));
        assert!(rendered.contains("fullscreen:false"));
        assert!(rendered.contains("tab (+100ms), enter (+1200ms)"));
        assert!(rendered.contains("./gradlew --stop"));
        assert!(rendered.contains("(defaults; no .autorun/config.toml found)"));
    }

    #[test]
    fn render_config_human_marks_empty_lists() {
        let mut config = RunConfig::default();
        config.launch.args.clear();
        config.launch.env.clear();
        config.daemon.stop_command.clear();
        let rendered = render_config_human(&config, Some(Path::new("/p/.autorun/config.toml")));
        assert!(rendered.contains("(none)"));
        assert!(rendered.contains("/p/.autorun/config.toml"));
    }

    #[test]
    fn render_config_json_is_valid_and_contains_expected_fields() {
        let config = RunConfig::default();
        let json = render_config_json(&config, None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["launch"]["program"], "./gradlew");
        assert_eq!(value["timing"]["completion_timeout_ms"], 30_000);
        assert_eq!(value["paths"]["result"], "test-result.txt");
        assert!(value["patterns"]["failure"].is_array());
        assert_eq!(value["input"]["backend"], "xdotool");
        assert_eq!(
            value["source_path"],
            "(defaults; no .autorun/config.toml found)"
        );
    }

    #[test]
    fn load_config_prefers_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".autorun")).unwrap();
        std::fs::write(
            tmp.path().join(".autorun").join("config.toml"),
            "[commands]\ntrigger = \"/found\"\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("ci.toml"), "[commands]\ntrigger = \"/explicit\"\n")
            .unwrap();

        let (config, path) = load_config(Some(Path::new("ci.toml")), tmp.path()).unwrap();
        assert_eq!(config.commands.trigger, "/explicit");
        assert_eq!(path.unwrap(), tmp.path().join("ci.toml"));

        let (config, _) = load_config(None, tmp.path()).unwrap();
        assert_eq!(config.commands.trigger, "/found");
    }

    #[test]
    fn load_config_missing_explicit_path_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_config(Some(Path::new("absent.toml")), tmp.path()).is_err());
    }

    #[test]
    fn fail_early_writes_fail_and_returns_error() {
        let tmp = tempfile::tempdir().unwrap();
        let result = tmp.path().join("test-result.txt");
        std::fs::write(&result, "PASS").unwrap();

        let err = fail_early(&result, anyhow::anyhow!("bad config")).unwrap_err();
        assert_eq!(err.to_string(), "bad config");
        assert_eq!(std::fs::read_to_string(&result).unwrap(), "FAIL");
    }

    #[test]
    fn run_with_broken_config_writes_fail() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("broken.toml"), "[timing\n").unwrap();

        let result = run(Some(Path::new("broken.toml")), tmp.path(), true, None);
        assert!(result.is_err());
        assert_eq!(
            ResultStore::new(tmp.path().join("test-result.txt")).read(),
            TestVerdict::Fail
        );
        assert!(tmp.path().join("test-result.txt").exists());
    }

    #[test]
    fn read_verdict_uses_result_store() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_verdict(None, tmp.path()).unwrap(), TestVerdict::Fail);

        std::fs::write(tmp.path().join("test-result.txt"), "PASS\n").unwrap();
        assert_eq!(read_verdict(None, tmp.path()).unwrap(), TestVerdict::Pass);
    }
}
