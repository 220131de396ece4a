mod activity;
mod cli;
mod config;
mod escalation;
mod fallback;
mod host;
mod log;
mod probe;
mod prompt;
mod tmux;
mod visual;
mod watcher;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::info;

use cli::{Cli, Command};
use config::ProjectConfig;
use host::{FileHost, HostSession, TmuxHost};
use prompt::PromptMatcher;
use visual::capture::{self, CommandCapture};
use visual::click::{self, NativeClicker};
use visual::ocr::TesseractLocator;
use visual::{Clicker, ScreenCapture};
use watcher::{LogFileObserver, Watcher, spawn_stdin_commands};

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .keepgoing/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn or_label<'a>(value: &'a str, empty: &'a str) -> &'a str {
    if value.trim().is_empty() { empty } else { value }
}

fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("General\n");
    push_kv(&mut output, "enabled", config.general.enabled);
    push_kv(
        &mut output,
        "poll_interval",
        format!("{}ms", config.general.poll_interval_millis),
    );
    push_kv(
        &mut output,
        "change_poll",
        format!("{}ms", config.general.change_poll_millis),
    );
    push_kv(
        &mut output,
        "answer_delay",
        format!("{}ms", config.general.answer_delay_millis),
    );
    push_kv(
        &mut output,
        "retrigger_cooldown",
        format!("{}ms", config.general.retrigger_cooldown_millis),
    );
    push_kv(
        &mut output,
        "show_notifications",
        config.general.show_notifications,
    );
    output.push('\n');

    output.push_str("Matcher\n");
    push_kv(
        &mut output,
        "extra_patterns",
        list_or_none(&config.matcher.extra_patterns),
    );
    output.push('\n');

    output.push_str("Escalation\n");
    let e = &config.escalation;
    push_kv(&mut output, "min_interval", format!("{}s", e.min_interval_secs));
    push_kv(
        &mut output,
        "success_cooldown",
        format!("{}s", e.success_cooldown_secs),
    );
    push_kv(&mut output, "max_failures", e.max_failures);
    push_kv(&mut output, "suppression", format!("{}s", e.suppression_secs));
    push_kv(&mut output, "long_idle", format!("{}s", e.long_idle_secs));
    push_kv(
        &mut output,
        "human_input_window",
        format!("{}s", e.human_input_window_secs),
    );
    output.push('\n');

    output.push_str("Probe\n");
    let steps: Vec<String> = config.probe.steps.iter().map(|s| s.label()).collect();
    push_kv(&mut output, "steps", list_or_none(&steps));
    push_kv(
        &mut output,
        "settle",
        format!("{}ms", config.probe.settle_millis),
    );
    output.push('\n');

    output.push_str("Visual\n");
    push_kv(&mut output, "enabled", config.visual.enabled);
    push_kv(&mut output, "ocr_program", &config.visual.ocr_program);
    push_kv(&mut output, "capture_dir", config.capture_dir().display());
    push_kv(&mut output, "scale", config.visual.scale);
    output.push('\n');

    output.push_str("Focus\n");
    push_kv(
        &mut output,
        "window_title",
        or_label(&config.focus.window_title, "(any, assume focused)"),
    );
    output.push('\n');

    output.push_str("Fallback\n");
    push_kv(&mut output, "enabled", config.fallback.enabled);
    push_kv(
        &mut output,
        "program",
        or_label(&config.fallback.program, "(none, notify only)"),
    );
    push_kv(&mut output, "args", list_or_none(&config.fallback.args));
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "general": {
            "enabled": config.general.enabled,
            "poll_interval_millis": config.general.poll_interval_millis,
            "change_poll_millis": config.general.change_poll_millis,
            "answer_delay_millis": config.general.answer_delay_millis,
            "retrigger_cooldown_millis": config.general.retrigger_cooldown_millis,
            "show_notifications": config.general.show_notifications
        },
        "matcher": {
            "extra_patterns": &config.matcher.extra_patterns
        },
        "escalation": {
            "min_interval_secs": config.escalation.min_interval_secs,
            "success_cooldown_secs": config.escalation.success_cooldown_secs,
            "max_failures": config.escalation.max_failures,
            "suppression_secs": config.escalation.suppression_secs,
            "long_idle_secs": config.escalation.long_idle_secs,
            "human_input_window_secs": config.escalation.human_input_window_secs
        },
        "probe": {
            "steps": &config.probe.steps,
            "settle_millis": config.probe.settle_millis
        },
        "visual": {
            "enabled": config.visual.enabled,
            "ocr_program": &config.visual.ocr_program,
            "capture_dir": config.capture_dir().display().to_string(),
            "scale": config.visual.scale
        },
        "focus": {
            "window_title": &config.focus.window_title
        },
        "fallback": {
            "enabled": config.fallback.enabled,
            "program": &config.fallback.program,
            "args": &config.fallback.args
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

/// Directory that owns `.keepgoing/`: the config's project, or `cwd`.
fn project_root(cwd: &Path, config_path: Option<&Path>) -> PathBuf {
    config_path
        .and_then(|p| p.parent())
        .and_then(|dir| dir.parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf())
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| {
            let exe = dir.join(format!("{program}{}", std::env::consts::EXE_SUFFIX));
            [dir.join(program), exe]
        })
        .find(|candidate| candidate.is_file())
}

fn tool_line(program: &str) -> String {
    match find_on_path(program) {
        Some(path) => format!("✓ {program} ({})", path.display()),
        None => format!("✗ {program} (not found)"),
    }
}

fn render_doctor(config: &ProjectConfig) -> String {
    let mut output = String::new();
    output.push_str("Platform\n");
    push_kv(&mut output, "os", std::env::consts::OS);
    push_kv(&mut output, "native clicks", click::is_supported());
    output.push('\n');

    output.push_str("Text host\n");
    let tmux_status = match tmux::check_tmux() {
        Ok(version) => match tmux::parse_tmux_version(&version) {
            Some((major, minor)) => format!("✓ tmux {major}.{minor}"),
            None => format!("✓ {version}"),
        },
        Err(e) => format!("✗ {e}"),
    };
    push_kv(&mut output, "tmux", tmux_status);
    output.push('\n');

    output.push_str("Visual tier\n");
    push_kv(&mut output, "ocr", tool_line(&config.visual.ocr_program));
    for strategy in capture::platform_strategies() {
        if let Some(program) = strategy.argv.first() {
            push_kv(&mut output, "capture", tool_line(program));
        }
    }
    for strategy in click::platform_strategies() {
        if let Some(program) = strategy.commands.first().and_then(|argv| argv.first()) {
            push_kv(&mut output, "click", tool_line(program));
        }
    }
    match click::mouse_position() {
        Some(p) => push_kv(&mut output, "pointer", p),
        None => push_kv(&mut output, "pointer", "(unavailable)"),
    }
    output.push('\n');

    output.push_str("Requirements\n");
    for requirement in click::requirements() {
        output.push_str(&format!("  - {requirement}\n"));
    }
    output
}

fn read_check_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("failed to read stdin")?;
            Ok(text)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_quiet_command = matches!(
        &cli.command,
        Command::Config { .. } | Command::Check { .. } | Command::Doctor
    );

    let filter = match cli.verbose {
        0 if is_quiet_command => "keepgoing=warn",
        0 => "keepgoing=info",
        1 => "keepgoing=debug",
        _ => "keepgoing=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_quiet_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .keepgoing/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Watch {
            pane,
            file,
            no_visual,
            activity_log,
        } => {
            let host: Box<dyn HostSession> = match (pane, file) {
                (Some(target), None) => Box::new(TmuxHost::attach(&target)?),
                (None, Some(path)) => {
                    if !path.is_file() {
                        bail!("transcript file not found: {}", path.display());
                    }
                    Box::new(FileHost::new(&path))
                }
                _ => bail!("specify the agent with --pane <tmux target> or --file <transcript>"),
            };

            let session = log::new_session_id();
            let log_path = log::session_log_path(&project_root(&cwd, config_path.as_deref()), &session);
            let execution_log = log::ExecutionLog::new(&log_path)?;

            let mut watcher = Watcher::new(host, &config)?
                .with_execution_log(execution_log)
                .with_config_path(config_path.as_deref());
            if no_visual {
                watcher = watcher.with_visual(None);
            }
            if let Some(path) = activity_log {
                watcher = watcher.with_observer(Box::new(LogFileObserver::new(&path)?));
            }

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            ctrlc::set_handler(move || {
                stop_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .ok(); // a handler may already be installed

            println!(
                "\x1b[36m[keepgoing]\x1b[0m watching {} (log: {})",
                watcher.host().describe(),
                log_path.display()
            );
            let commands = spawn_stdin_commands();
            let end = watcher.run(&stop, &commands)?;
            println!(
                "\x1b[36m[keepgoing]\x1b[0m stopped ({end}); {} auto-continue attempts",
                watcher.activity().total_triggers()
            );
        }
        Command::Check { file } => {
            let text = read_check_input(file.as_deref())?;
            let matcher = PromptMatcher::continue_prompts()
                .with_extra_patterns(&config.matcher.extra_patterns)?;
            match matcher.first_match(&text) {
                Some(found) => println!(
                    "continuation prompt (pattern #{}): {}",
                    found.pattern_index, found.matched_text
                ),
                None => {
                    println!("no continuation prompt");
                    std::process::exit(1);
                }
            }
        }
        Command::Ocr { click, keep_image } => {
            let capture = CommandCapture::for_platform(config.capture_dir());
            let locator = TesseractLocator::new(&config.visual.ocr_program, config.visual.scale);

            let image = capture.capture()?;
            let words = locator.recognize(&image)?;
            println!("recognized {} words", words.len());

            match locator.locate(&words) {
                Some(target) => {
                    println!(
                        "continue control \"{}\" at {} (confidence {:.2})",
                        target.text, target.location, target.confidence
                    );
                    if click {
                        let result = NativeClicker::for_platform()
                            .click_at(target.location.x, target.location.y)
                            .into_result()?;
                        println!("clicked via {}", result.method);
                    }
                }
                None => println!("no continue control on screen"),
            }

            if keep_image {
                println!("screenshot: {}", image.keep().display());
            }
        }
        Command::Click { x, y } => {
            let result = NativeClicker::for_platform().click_at(x, y).into_result()?;
            println!("clicked {} via {}", result.location, result.method);
        }
        Command::Doctor => {
            print!("{}", render_doctor(&config));
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_config_human_groups_sections() {
        let config = ProjectConfig::default();
        let rendered = render_config_human(&config, None);

        for section in [
            "General", "Matcher", "Escalation", "Probe", "Visual", "Focus", "Fallback",
            "Source Path",
        ] {
            assert!(rendered.contains(section), "missing section {section}");
        }
        assert!(rendered.contains("keys:continue+enter"));
        assert!(rendered.contains("(none, notify only)"));
        assert!(rendered.contains("(defaults, no .keepgoing/config.toml found)"));
        assert!(rendered.contains("(any, assume focused)"));
        assert!(!rendered.contains('\u{2014}'));
    }

    #[test]
    fn render_config_json_is_valid_and_contains_expected_fields() {
        let config = ProjectConfig::default();
        let json = render_config_json(&config, None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["general"]["poll_interval_millis"], 2000);
        assert_eq!(value["escalation"]["max_failures"], 3);
        assert_eq!(value["probe"]["steps"][0]["keys"], "continue");
        assert_eq!(value["probe"]["steps"][0]["enter"], true);
        assert_eq!(value["visual"]["ocr_program"], "tesseract");
        assert!(value["fallback"]["args"].is_array());
        assert_eq!(
            value["source_path"],
            "(defaults, no .keepgoing/config.toml found)"
        );
    }

    #[test]
    fn render_config_uses_source_path() {
        let config = ProjectConfig::default();
        let path = Path::new("/work/.keepgoing/config.toml");
        assert!(render_config_human(&config, Some(path)).contains("/work/.keepgoing/config.toml"));
    }

    #[test]
    fn project_root_is_config_owner() {
        let cwd = Path::new("/work/src/deep");
        assert_eq!(
            project_root(cwd, Some(Path::new("/work/.keepgoing/config.toml"))),
            PathBuf::from("/work")
        );
        assert_eq!(project_root(cwd, None), PathBuf::from("/work/src/deep"));
    }

    #[test]
    fn doctor_lists_requirements() {
        let rendered = render_doctor(&ProjectConfig::default());
        assert!(rendered.contains("Platform"));
        assert!(rendered.contains("Requirements"));
        assert!(rendered.contains("ocr"));
    }

    #[test]
    fn check_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.txt");
        std::fs::write(&path, "Shall I continue?").unwrap();
        assert_eq!(read_check_input(Some(&path)).unwrap(), "Shall I continue?");
        assert!(read_check_input(Some(&tmp.path().join("missing"))).is_err());
    }
}
