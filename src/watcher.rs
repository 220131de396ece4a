//! Watcher — the polling loop that keeps an agent going.
//!
//! It:
//! 1. Polls the host for changed text every `change_poll_millis`
//! 2. Re-derives everything from current text every `poll_interval_millis`
//! 3. Runs the cheap probe for each new continuation prompt
//! 4. Escalates to visual detection when the controller allows it
//! 5. Falls back to the configured command plus a visible notification
//! 6. Applies operator commands typed on stdin between ticks
//!
//! The operator keeps full control of the agent; keepgoing only types into
//! the host or clicks its continue control when a prompt is showing.

use std::fmt;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Local;
use tracing::{debug, info, warn};

use crate::activity::{ActivityLog, InputTracker};
use crate::config::ProjectConfig;
use crate::escalation::{Clock, EscalationController, SystemClock, TriggerConditions};
use crate::fallback::{FallbackConfig, FallbackOutcome, run_fallback};
use crate::host::{AssumeFocused, FocusProbe, HostSession, WindowTitleProbe};
use crate::log::{ExecutionLog, LogEvent};
use crate::probe::CheapProbe;
use crate::prompt::{PromptMatch, PromptMatcher};
use crate::visual::{AttemptOutcome, VisualPipeline};

/// Callback for watcher events (terminal output, activity file, ...).
pub trait WatchObserver {
    fn on_auto_continue(&mut self, tier: &str, detail: &str);
    fn on_needs_attention(&mut self, prompt: &str, detail: &str);
    fn on_event(&mut self, message: &str);
}

/// Prints watcher events to stderr.
pub struct StderrObserver {
    show_notifications: bool,
}

impl StderrObserver {
    pub fn new(show_notifications: bool) -> Self {
        Self { show_notifications }
    }
}

impl WatchObserver for StderrObserver {
    fn on_auto_continue(&mut self, tier: &str, detail: &str) {
        if self.show_notifications {
            eprintln!("[keepgoing] ✓ auto-continued via {tier}: {detail}");
        }
    }

    fn on_needs_attention(&mut self, prompt: &str, detail: &str) {
        eprintln!("[keepgoing] ⚠ NEEDS ATTENTION: \"{prompt}\" ({detail})");
    }

    fn on_event(&mut self, message: &str) {
        if self.show_notifications {
            eprintln!("[keepgoing] {message}");
        }
    }
}

/// Appends watcher events to a plain-text file.
pub struct LogFileObserver {
    log_path: PathBuf,
}

impl LogFileObserver {
    pub fn new(log_path: &Path) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir: {}", parent.display()))?;
        }
        Ok(Self {
            log_path: log_path.to_path_buf(),
        })
    }

    fn append(&self, line: &str) {
        use std::io::Write;
        if let Ok(mut f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        {
            let _ = writeln!(f, "{} {line}", Local::now().format("%H:%M:%S"));
        }
    }
}

impl WatchObserver for LogFileObserver {
    fn on_auto_continue(&mut self, tier: &str, detail: &str) {
        self.append(&format!("[keepgoing] ✓ auto-continued via {tier}: {detail}"));
    }

    fn on_needs_attention(&mut self, prompt: &str, detail: &str) {
        self.append(&format!("[keepgoing] ⚠ NEEDS ATTENTION: \"{prompt}\" ({detail})"));
    }

    fn on_event(&mut self, message: &str) {
        self.append(&format!("[keepgoing] {message}"));
    }
}

/// Where a detection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    Change,
    Poll,
    Manual,
}

impl fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Change => write!(f, "change"),
            Self::Poll => write!(f, "poll"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// What the watcher did with one piece of host text.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptHandling {
    /// Nothing to do.
    Ignored(&'static str),
    /// The prompt went away during the answer delay.
    Cleared,
    ResolvedByProbe,
    ResolvedByVisual,
    /// Neither tier resolved the prompt. `None` if the fallback already ran
    /// for this prompt.
    Unresolved { fallback: Option<FallbackOutcome> },
}

impl fmt::Display for PromptHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ignored(why) => write!(f, "ignored: {why}"),
            Self::Cleared => write!(f, "prompt cleared before acting"),
            Self::ResolvedByProbe => write!(f, "resolved by cheap probe"),
            Self::ResolvedByVisual => write!(f, "resolved by visual click"),
            Self::Unresolved { fallback: Some(o) } => write!(f, "unresolved; {}", o.summary()),
            Self::Unresolved { fallback: None } => write!(f, "unresolved; fallback already ran"),
        }
    }
}

/// Commands typed on the watcher's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Toggle,
    Enable,
    Disable,
    Trigger,
    Reset,
    Force,
    Status,
    Log,
    Help,
    Quit,
}

impl FromStr for OperatorCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "toggle" => Self::Toggle,
            "enable" | "on" => Self::Enable,
            "disable" | "off" => Self::Disable,
            "trigger" | "continue" => Self::Trigger,
            "reset" => Self::Reset,
            "force" => Self::Force,
            "status" => Self::Status,
            "log" => Self::Log,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => bail!("unknown command '{other}' (try 'help')"),
        })
    }
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Toggle => "toggle",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Trigger => "trigger",
            Self::Reset => "reset",
            Self::Force => "force",
            Self::Status => "status",
            Self::Log => "log",
            Self::Help => "help",
            Self::Quit => "quit",
        };
        f.write_str(name)
    }
}

const HELP: &str = "\
commands:
  toggle     switch auto-continue on or off
  enable     turn auto-continue on
  disable    turn auto-continue off
  trigger    handle the current host text now
  reset      clear visual detection state
  force      lift suppression and the attempt lock
  status     show watcher and visual detection state
  log        show recent activity
  quit       stop watching
";

/// Result of applying an operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandFlow {
    Continue(String),
    Quit,
}

/// Why [`Watcher::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    Interrupted,
    Quit,
    HostExited,
}

impl fmt::Display for WatchEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => write!(f, "interrupted"),
            Self::Quit => write!(f, "quit"),
            Self::HostExited => write!(f, "host exited"),
        }
    }
}

/// Watches one host and drives the tiers.
pub struct Watcher<C: Clock = SystemClock> {
    host: Box<dyn HostSession>,
    focus: Box<dyn FocusProbe>,
    matcher: PromptMatcher,
    probe: CheapProbe,
    visual: Option<VisualPipeline>,
    fallback: FallbackConfig,
    controller: EscalationController<C>,
    input: InputTracker,
    activity: ActivityLog,
    observer: Box<dyn WatchObserver>,
    log: Option<ExecutionLog>,
    config_path: Option<PathBuf>,
    enabled: bool,
    poll_interval: Duration,
    change_poll: Duration,
    answer_delay: Duration,
    retrigger_cooldown: Duration,
    last_text: Option<String>,
    last_handled: Option<(String, Instant)>,
    fallback_fired: bool,
}

impl Watcher<SystemClock> {
    pub fn new(host: Box<dyn HostSession>, config: &ProjectConfig) -> Result<Self> {
        Self::with_clock(host, config, SystemClock)
    }
}

impl<C: Clock> Watcher<C> {
    pub fn with_clock(host: Box<dyn HostSession>, config: &ProjectConfig, clock: C) -> Result<Self> {
        let matcher = PromptMatcher::continue_prompts()
            .with_extra_patterns(&config.matcher.extra_patterns)?;

        let visual = config.visual.enabled.then(|| {
            VisualPipeline::for_platform(
                &config.visual.ocr_program,
                config.capture_dir(),
                config.visual.scale,
            )
        });

        let focus: Box<dyn FocusProbe> = if config.focus.window_title.trim().is_empty() {
            Box::new(AssumeFocused)
        } else {
            Box::new(WindowTitleProbe::new(&config.focus.window_title))
        };

        let general = &config.general;
        Ok(Self {
            host,
            focus,
            matcher,
            probe: CheapProbe::new(
                config.probe.steps.clone(),
                Duration::from_millis(config.probe.settle_millis),
            ),
            visual,
            fallback: config.fallback_config(),
            controller: EscalationController::with_clock(config.escalation_config(), clock),
            input: InputTracker::new(Duration::from_secs(
                config.escalation.human_input_window_secs,
            )),
            activity: ActivityLog::new(),
            observer: Box::new(StderrObserver::new(general.show_notifications)),
            log: None,
            config_path: None,
            enabled: general.enabled,
            poll_interval: Duration::from_millis(general.poll_interval_millis),
            change_poll: Duration::from_millis(general.change_poll_millis),
            answer_delay: Duration::from_millis(general.answer_delay_millis),
            retrigger_cooldown: Duration::from_millis(general.retrigger_cooldown_millis),
            last_text: None,
            last_handled: None,
            fallback_fired: false,
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn WatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_execution_log(mut self, log: ExecutionLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Recorded in the session log.
    pub fn with_config_path(mut self, path: Option<&Path>) -> Self {
        self.config_path = path.map(Path::to_path_buf);
        self
    }

    pub fn with_visual(mut self, visual: Option<VisualPipeline>) -> Self {
        self.visual = visual;
        self
    }

    #[cfg(test)]
    pub fn with_focus(mut self, focus: Box<dyn FocusProbe>) -> Self {
        self.focus = focus;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[cfg(test)]
    pub fn controller(&self) -> &EscalationController<C> {
        &self.controller
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn host(&self) -> &dyn HostSession {
        self.host.as_ref()
    }

    fn log_event(&self, event: LogEvent) {
        if let Some(log) = &self.log {
            if let Err(e) = log.log(event) {
                warn!(error = %e, "failed to write execution log");
            }
        }
    }

    /// Host text changed.
    pub fn on_text_observed(&mut self, text: &str) -> PromptHandling {
        self.last_text = Some(text.to_string());
        self.process(text, DetectionSource::Change, false)
    }

    /// Re-derive everything from the host's current text.
    pub fn on_poll_tick(&mut self) -> PromptHandling {
        match self.host.visible_text() {
            Ok(text) => {
                let handling = self.process(&text, DetectionSource::Poll, false);
                self.last_text = Some(text);
                handling
            }
            Err(e) => {
                debug!(error = %e, "host text unavailable on poll");
                PromptHandling::Ignored("host text unavailable")
            }
        }
    }

    fn process(&mut self, text: &str, source: DetectionSource, force: bool) -> PromptHandling {
        if !self.enabled && !force {
            return PromptHandling::Ignored("auto-continue disabled");
        }

        let Some(found) = self.matcher.first_match(text) else {
            self.fallback_fired = false;
            return PromptHandling::Ignored("no prompt");
        };

        if !force {
            if let Some((prev, at)) = &self.last_handled {
                if prev == text && at.elapsed() < self.retrigger_cooldown {
                    debug!(source = %source, "prompt already handled");
                    return PromptHandling::Ignored("already handled");
                }
            }
        }
        self.last_handled = Some((text.to_string(), Instant::now()));

        self.handle_prompt(&found, source)
    }

    fn prompt_still_shown(&self) -> bool {
        self.host
            .visible_text()
            .map(|t| self.matcher.matches(&t))
            .unwrap_or(true)
    }

    fn handle_prompt(&mut self, found: &PromptMatch, source: DetectionSource) -> PromptHandling {
        info!(
            source = %source,
            pattern = found.pattern_index,
            text = %found.matched_text,
            "continuation prompt detected"
        );
        self.log_event(LogEvent::PromptDetected {
            pattern_index: found.pattern_index,
            matched_text: found.matched_text.clone(),
            source: source.to_string(),
        });
        self.observer
            .on_event(&format!("prompt detected: \"{}\"", found.matched_text));

        if !self.answer_delay.is_zero() {
            thread::sleep(self.answer_delay);
            if !self.prompt_still_shown() {
                info!("prompt cleared during answer delay");
                return PromptHandling::Cleared;
            }
        }
        self.activity.mark_triggered();

        // Tier 1
        let probe = self.probe.run(self.host.as_ref(), &self.matcher);
        self.log_event(LogEvent::ProbeResult {
            resolved: probe.resolved(),
            detail: probe.to_string(),
        });
        if probe.resolved() {
            self.activity.record("Cheap Probe", &probe.to_string());
            self.observer.on_auto_continue("cheap probe", &probe.to_string());
            return PromptHandling::ResolvedByProbe;
        }
        if let Some(label) = probe.failure_label() {
            self.controller.record_probe_failure(label);
        }

        // Tier 2
        if let Some(visual) = &self.visual {
            let conditions = TriggerConditions {
                prompt_text_detected: self.prompt_still_shown(),
                cheap_probe_failed: true,
                elapsed_since_last_attempt: self.controller.elapsed_since_last_attempt(),
                host_window_active: self.focus.host_window_active(),
                recent_failure_streak: self.controller.has_recent_failure_streak(),
                recent_human_input: self.input.is_recent(),
            };
            let decision = self.controller.should_trigger(&conditions);
            self.log_event(LogEvent::EscalationDecision {
                trigger: decision.trigger(),
                reason: decision.reason(),
                skip_reason: decision.skip_reason(),
            });

            if decision.trigger() {
                let outcome = visual.run_attempt(&mut self.controller);
                self.log_event(LogEvent::VisualAttempt {
                    succeeded: outcome.succeeded(),
                    target_found: outcome.target_found(),
                    detail: outcome.to_string(),
                });
                if let AttemptOutcome::Clicked { click, .. } | AttemptOutcome::ClickFailed { click, .. } =
                    &outcome
                {
                    self.log_event(LogEvent::Click {
                        x: click.location.x,
                        y: click.location.y,
                        method: click.method.clone(),
                        succeeded: click.succeeded,
                    });
                }
                self.activity.record("Visual Detection", &outcome.to_string());
                if outcome.resolved() {
                    self.observer.on_auto_continue("visual click", &outcome.to_string());
                    return PromptHandling::ResolvedByVisual;
                }
            }
        }

        // Tier 3
        self.escalate(found)
    }

    fn escalate(&mut self, found: &PromptMatch) -> PromptHandling {
        if self.fallback_fired {
            debug!("fallback already ran for this prompt");
            return PromptHandling::Unresolved { fallback: None };
        }
        self.fallback_fired = true;

        let outcome = match run_fallback(&self.fallback, &self.host.describe(), &found.matched_text) {
            Ok(outcome) => outcome,
            Err(e) => FallbackOutcome::Failed {
                error: format!("{e:#}"),
            },
        };
        let summary = outcome.summary();
        warn!(prompt = %found.matched_text, fallback = %summary, "prompt not resolved automatically");
        self.observer.on_needs_attention(&found.matched_text, &summary);
        self.activity.record("Fallback", &summary);
        self.log_event(LogEvent::Fallback {
            outcome: summary.clone(),
        });
        PromptHandling::Unresolved {
            fallback: Some(outcome),
        }
    }

    /// Apply one operator command. Every command except `trigger` counts as
    /// human input.
    pub fn apply_command(&mut self, command: OperatorCommand) -> CommandFlow {
        info!(command = %command, "operator command");
        self.log_event(LogEvent::OperatorCommand {
            command: command.to_string(),
        });
        if command != OperatorCommand::Trigger {
            self.input.record_human_input();
        }

        let message = match command {
            OperatorCommand::Toggle => {
                self.enabled = !self.enabled;
                self.enabled_message()
            }
            OperatorCommand::Enable => {
                self.enabled = true;
                self.enabled_message()
            }
            OperatorCommand::Disable => {
                self.enabled = false;
                self.enabled_message()
            }
            OperatorCommand::Trigger => match self.host.visible_text() {
                Ok(text) => self.process(&text, DetectionSource::Manual, true).to_string(),
                Err(e) => format!("cannot read {}: {e:#}", self.host.describe()),
            },
            OperatorCommand::Reset => {
                self.controller.reset();
                "visual detection state reset".to_string()
            }
            OperatorCommand::Force => {
                self.controller.force_enable();
                "visual detection force-enabled".to_string()
            }
            OperatorCommand::Status => self.render_status(),
            OperatorCommand::Log => self.activity.render(),
            OperatorCommand::Help => HELP.to_string(),
            OperatorCommand::Quit => return CommandFlow::Quit,
        };
        self.activity.record("Command", &command.to_string());
        CommandFlow::Continue(message)
    }

    fn enabled_message(&self) -> String {
        if self.enabled {
            "auto-continue enabled".to_string()
        } else {
            "auto-continue disabled".to_string()
        }
    }

    pub fn render_status(&self) -> String {
        fn push_kv(out: &mut String, key: &str, value: impl fmt::Display) {
            out.push_str(&format!("  {key:<22} {value}\n"));
        }

        let mut out = String::from("keepgoing status\n");
        push_kv(&mut out, "host", self.host.describe());
        push_kv(
            &mut out,
            "auto-continue",
            if self.is_enabled() { "enabled" } else { "disabled" },
        );
        push_kv(
            &mut out,
            "visual detection",
            if self.visual.is_some() { "on" } else { "off" },
        );
        push_kv(&mut out, "total triggers", self.activity.total_triggers());
        push_kv(
            &mut out,
            "last triggered",
            self.activity
                .last_triggered()
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "Never".to_string()),
        );
        push_kv(&mut out, "recent human input", self.input.is_recent());
        out.push_str("visual detection state\n");
        out.push_str(&self.controller.status().to_string());
        out
    }

    /// Poll the host until stopped, the operator quits, or the host goes away.
    pub fn run(&mut self, stop: &AtomicBool, commands: &Receiver<String>) -> Result<WatchEnd> {
        info!(host = %self.host.describe(), "watching");
        self.log_event(LogEvent::SessionStarted {
            host: self.host.describe(),
            config_path: self.config_path.as_ref().map(|p| p.display().to_string()),
        });
        self.observer
            .on_event(&format!("watching {} (type 'help' for commands)", self.host.describe()));

        let mut last_poll = Instant::now();
        let end = loop {
            if stop.load(Ordering::SeqCst) {
                break WatchEnd::Interrupted;
            }

            let mut quit = false;
            while let Ok(line) = commands.try_recv() {
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<OperatorCommand>() {
                    Ok(command) => match self.apply_command(command) {
                        CommandFlow::Continue(message) => println!("{}", message.trim_end()),
                        CommandFlow::Quit => quit = true,
                    },
                    Err(e) => println!("{e}"),
                }
            }
            if quit {
                break WatchEnd::Quit;
            }

            if !self.host.is_alive() {
                break WatchEnd::HostExited;
            }

            if last_poll.elapsed() >= self.poll_interval {
                last_poll = Instant::now();
                self.on_poll_tick();
            } else {
                match self.host.visible_text() {
                    Ok(text) if self.last_text.as_deref() != Some(text.as_str()) => {
                        self.on_text_observed(&text);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "host text unavailable"),
                }
            }

            thread::sleep(self.change_poll);
        };

        info!(reason = %end, triggers = self.activity.total_triggers(), "watch ended");
        self.log_event(LogEvent::SessionEnded {
            reason: end.to_string(),
        });
        self.observer.on_event(&format!("stopped: {end}"));
        Ok(end)
    }
}

/// Forward stdin lines to a channel from a background thread.
pub fn spawn_stdin_commands() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::escalation::ManualClock;
    use crate::host::fakes::{FakeHost, FakeHostState, FixedFocus};
    use crate::visual::fakes::{button, pipeline};

    const PROMPT: &str = "Tool budget reached.\nWould you like to continue?\n";

    #[derive(Clone, Default)]
    struct RecordingObserver(Rc<RefCell<Vec<String>>>);

    impl RecordingObserver {
        fn lines(&self) -> Vec<String> {
            self.0.borrow().clone()
        }
    }

    impl WatchObserver for RecordingObserver {
        fn on_auto_continue(&mut self, tier: &str, detail: &str) {
            self.0.borrow_mut().push(format!("continued:{tier}:{detail}"));
        }

        fn on_needs_attention(&mut self, prompt: &str, detail: &str) {
            self.0.borrow_mut().push(format!("attention:{prompt}:{detail}"));
        }

        fn on_event(&mut self, message: &str) {
            self.0.borrow_mut().push(format!("event:{message}"));
        }
    }

    fn quiet_config() -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.general.answer_delay_millis = 0;
        config.probe.settle_millis = 0;
        config.visual.enabled = false;
        config
    }

    fn watcher(host: &FakeHost, config: &ProjectConfig) -> (Watcher<ManualClock>, RecordingObserver) {
        let observer = RecordingObserver::default();
        let w = Watcher::with_clock(Box::new(host.clone()), config, ManualClock::new())
            .unwrap()
            .with_observer(Box::new(observer.clone()))
            .with_focus(Box::new(FixedFocus(true)));
        (w, observer)
    }

    fn stubborn_host() -> FakeHost {
        FakeHost::showing(PROMPT)
    }

    fn obliging_host() -> FakeHost {
        let host = FakeHost::with_state(FakeHostState {
            text_after_input: Some("Running cargo test...".to_string()),
            ..Default::default()
        });
        host.set_text(PROMPT);
        host
    }

    #[test]
    fn text_without_prompt_is_ignored() {
        let host = FakeHost::showing("Compiling keepgoing v0.3.2");
        let (mut w, _) = watcher(&host, &quiet_config());
        assert_eq!(
            w.on_text_observed("Compiling keepgoing v0.3.2"),
            PromptHandling::Ignored("no prompt")
        );
        assert!(host.sent().is_empty());
        assert_eq!(w.activity().total_triggers(), 0);
    }

    #[test]
    fn probe_resolution_stops_escalation() {
        let host = obliging_host();
        let (visual, clicks) = pipeline(false, Some(button()), true);
        let (w, observer) = watcher(&host, &quiet_config());
        let mut w = w.with_visual(Some(visual));

        assert_eq!(w.on_text_observed(PROMPT), PromptHandling::ResolvedByProbe);
        assert_eq!(host.sent(), vec![("continue".to_string(), true)]);
        assert_eq!(clicks.get(), 0);
        assert_eq!(w.activity().latest().unwrap().action, "Cheap Probe");
        assert!(observer.lines().iter().any(|l| l.starts_with("continued:cheap probe")));
    }

    #[test]
    fn failed_probe_escalates_to_visual() {
        let host = stubborn_host();
        let (visual, clicks) = pipeline(false, Some(button()), true);
        let (w, _) = watcher(&host, &quiet_config());
        let mut w = w.with_visual(Some(visual));

        assert_eq!(w.on_text_observed(PROMPT), PromptHandling::ResolvedByVisual);
        assert_eq!(clicks.get(), 1);
        let status = w.controller().status();
        assert_eq!(status.recent_probe_failures, vec!["keys:continue+enter"]);
        assert!(status.last_success_at.is_some());
        assert_eq!(w.activity().latest().unwrap().action, "Visual Detection");
    }

    #[test]
    fn inactive_window_skips_visual_and_notifies() {
        let host = stubborn_host();
        let (visual, clicks) = pipeline(false, Some(button()), true);
        let (w, observer) = watcher(&host, &quiet_config());
        let mut w = w.with_visual(Some(visual)).with_focus(Box::new(FixedFocus(false)));

        let handling = w.on_text_observed(PROMPT);
        assert_eq!(
            handling,
            PromptHandling::Unresolved {
                fallback: Some(FallbackOutcome::NotifyOnly)
            }
        );
        assert_eq!(clicks.get(), 0);
        assert!(w.controller().status().last_attempt_at.is_none());
        assert!(
            observer
                .lines()
                .iter()
                .any(|l| l.starts_with("attention:Would you like to continue"))
        );
        assert_eq!(w.activity().latest().unwrap().action, "Fallback");
    }

    #[test]
    fn fallback_runs_once_per_prompt() {
        let host = stubborn_host();
        let mut config = quiet_config();
        config.general.retrigger_cooldown_millis = 0;
        let (mut w, _) = watcher(&host, &config);

        assert!(matches!(
            w.on_text_observed(PROMPT),
            PromptHandling::Unresolved { fallback: Some(_) }
        ));
        assert_eq!(
            w.on_text_observed(PROMPT),
            PromptHandling::Unresolved { fallback: None }
        );

        w.on_text_observed("agent resumed");
        assert!(matches!(
            w.on_text_observed(PROMPT),
            PromptHandling::Unresolved { fallback: Some(_) }
        ));
    }

    #[test]
    fn same_text_is_not_handled_twice_within_cooldown() {
        let host = stubborn_host();
        let (mut w, _) = watcher(&host, &quiet_config());

        assert!(matches!(w.on_text_observed(PROMPT), PromptHandling::Unresolved { .. }));
        assert_eq!(
            w.on_text_observed(PROMPT),
            PromptHandling::Ignored("already handled")
        );
        assert_eq!(host.sent().len(), 1);
        assert_eq!(w.activity().total_triggers(), 1);
    }

    #[test]
    fn poll_tick_reads_current_host_text() {
        let host = obliging_host();
        let (mut w, _) = watcher(&host, &quiet_config());
        assert_eq!(w.on_poll_tick(), PromptHandling::ResolvedByProbe);
        assert_eq!(w.on_poll_tick(), PromptHandling::Ignored("no prompt"));
    }

    #[test]
    fn disabled_watcher_ignores_prompts_until_enabled() {
        let host = obliging_host();
        let mut config = quiet_config();
        config.general.enabled = false;
        let (mut w, _) = watcher(&host, &config);

        assert_eq!(
            w.on_text_observed(PROMPT),
            PromptHandling::Ignored("auto-continue disabled")
        );
        assert!(host.sent().is_empty());

        assert_eq!(
            w.apply_command(OperatorCommand::Toggle),
            CommandFlow::Continue("auto-continue enabled".to_string())
        );
        assert!(w.is_enabled());
        assert_eq!(w.on_text_observed(PROMPT), PromptHandling::ResolvedByProbe);
    }

    #[test]
    fn operator_input_blocks_visual_detection() {
        let host = stubborn_host();
        let (visual, clicks) = pipeline(false, Some(button()), true);
        let (w, _) = watcher(&host, &quiet_config());
        let mut w = w.with_visual(Some(visual));

        w.apply_command(OperatorCommand::Status);
        assert!(matches!(w.on_text_observed(PROMPT), PromptHandling::Unresolved { .. }));
        assert_eq!(clicks.get(), 0);
    }

    #[test]
    fn manual_trigger_bypasses_disable_and_dedup() {
        let host = stubborn_host();
        let (visual, clicks) = pipeline(false, Some(button()), true);
        let (w, _) = watcher(&host, &quiet_config());
        let mut w = w.with_visual(Some(visual));
        w.apply_command(OperatorCommand::Disable);

        // Wait out the human-input window the disable command opened.
        w.input.clear();
        match w.apply_command(OperatorCommand::Trigger) {
            CommandFlow::Continue(message) => assert_eq!(message, "resolved by visual click"),
            CommandFlow::Quit => panic!("trigger should not quit"),
        }
        assert_eq!(clicks.get(), 1);
    }

    #[test]
    fn visual_failures_enter_suppression() {
        let host = stubborn_host();
        let mut config = quiet_config();
        config.general.retrigger_cooldown_millis = 0;
        config.escalation.min_interval_secs = 0;
        config.escalation.max_failures = 2;
        let (visual, clicks) = pipeline(false, None, true);
        let (w, _) = watcher(&host, &config);
        let mut w = w.with_visual(Some(visual));

        for _ in 0..3 {
            w.on_text_observed(PROMPT);
        }
        let status = w.controller().status();
        assert_eq!(status.consecutive_failures, 2);
        assert!(status.suppressed_until.is_some());
        assert_eq!(clicks.get(), 0);
        assert!(
            w.activity()
                .entries()
                .any(|e| e.details.contains("no continue control found"))
        );
    }

    #[test]
    fn reset_and_force_commands_reach_controller() {
        let host = stubborn_host();
        let (visual, _) = pipeline(false, None, true);
        let (w, _) = watcher(&host, &quiet_config());
        let mut w = w.with_visual(Some(visual));
        w.on_text_observed(PROMPT);
        assert_eq!(w.controller().status().consecutive_failures, 1);

        w.apply_command(OperatorCommand::Force);
        assert_eq!(w.controller().status().consecutive_failures, 0);
        assert!(w.controller().status().last_attempt_at.is_some());

        w.apply_command(OperatorCommand::Reset);
        assert!(w.controller().status().last_attempt_at.is_none());
        assert!(w.controller().status().recent_probe_failures.is_empty());
    }

    #[test]
    fn status_and_log_render() {
        let host = obliging_host();
        let (mut w, _) = watcher(&host, &quiet_config());
        w.on_text_observed(PROMPT);

        let CommandFlow::Continue(status) = w.apply_command(OperatorCommand::Status) else {
            panic!("status should not quit");
        };
        assert!(status.contains("fake host"));
        assert!(status.contains("total triggers         1"));
        assert!(status.contains("consecutive failures"));

        let CommandFlow::Continue(log) = w.apply_command(OperatorCommand::Log) else {
            panic!("log should not quit");
        };
        assert!(log.contains("Cheap Probe"));
        assert_eq!(w.apply_command(OperatorCommand::Quit), CommandFlow::Quit);
    }

    #[test]
    fn parses_operator_commands() {
        assert_eq!("toggle".parse::<OperatorCommand>().unwrap(), OperatorCommand::Toggle);
        assert_eq!(" STATUS \n".parse::<OperatorCommand>().unwrap(), OperatorCommand::Status);
        assert_eq!("q".parse::<OperatorCommand>().unwrap(), OperatorCommand::Quit);
        assert_eq!("off".parse::<OperatorCommand>().unwrap(), OperatorCommand::Disable);
        let err = "dance".parse::<OperatorCommand>().unwrap_err();
        assert!(err.to_string().contains("unknown command 'dance'"));
    }

    #[test]
    fn run_stops_on_quit_and_logs_session() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("session.jsonl");
        let host = FakeHost::showing("idle");
        let mut config = quiet_config();
        config.general.change_poll_millis = 1;
        let (w, _) = watcher(&host, &config);
        let mut w = w.with_execution_log(ExecutionLog::new(&log_path).unwrap());

        let (tx, rx) = mpsc::channel();
        tx.send("status".to_string()).unwrap();
        tx.send("quit".to_string()).unwrap();
        let stop = AtomicBool::new(false);

        assert_eq!(w.run(&stop, &rx).unwrap(), WatchEnd::Quit);
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("\"event\":\"session_started\""));
        assert!(content.contains("\"command\":\"status\""));
        assert!(content.contains("\"event\":\"session_ended\""));
    }

    #[test]
    fn run_stops_when_flag_set() {
        let host = FakeHost::showing("idle");
        let (mut w, _) = watcher(&host, &quiet_config());
        let (_tx, rx) = mpsc::channel();
        let stop = AtomicBool::new(true);
        assert_eq!(w.run(&stop, &rx).unwrap(), WatchEnd::Interrupted);
    }

    #[test]
    fn observer_file_gets_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join("activity.log");
        let mut obs = LogFileObserver::new(&path).unwrap();
        obs.on_auto_continue("cheap probe", "prompt cleared");
        obs.on_needs_attention("shall I continue", "no fallback command configured");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[keepgoing] ✓ auto-continued via cheap probe"));
        assert!(content.contains("NEEDS ATTENTION"));
    }
}
