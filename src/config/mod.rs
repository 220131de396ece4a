use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::escalation::EscalationConfig;
use crate::fallback::FallbackConfig;
use crate::probe::ProbeStep;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".keepgoing";

fn default_true() -> bool {
    true
}

fn default_poll_interval_millis() -> u64 {
    2000
}

fn default_change_poll_millis() -> u64 {
    200
}

fn default_answer_delay_millis() -> u64 {
    1000
}

fn default_retrigger_cooldown_millis() -> u64 {
    5000
}

fn default_min_interval_secs() -> u64 {
    5
}

fn default_success_cooldown_secs() -> u64 {
    15
}

fn default_max_failures() -> u32 {
    3
}

fn default_suppression_secs() -> u64 {
    30
}

fn default_long_idle_secs() -> u64 {
    30
}

fn default_human_input_window_secs() -> u64 {
    10
}

fn default_probe_steps() -> Vec<ProbeStep> {
    vec![ProbeStep::new("continue", true)]
}

fn default_probe_settle_millis() -> u64 {
    1500
}

fn default_ocr_program() -> String {
    "tesseract".to_string()
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Full re-derivation from current host text.
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    /// How often the host is checked for changed text.
    #[serde(default = "default_change_poll_millis")]
    pub change_poll_millis: u64,
    /// Wait between detecting a prompt and acting on it.
    #[serde(default = "default_answer_delay_millis")]
    pub answer_delay_millis: u64,
    /// The same prompt text is not handled twice within this window.
    #[serde(default = "default_retrigger_cooldown_millis")]
    pub retrigger_cooldown_millis: u64,
    #[serde(default = "default_true")]
    pub show_notifications: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_millis: default_poll_interval_millis(),
            change_poll_millis: default_change_poll_millis(),
            answer_delay_millis: default_answer_delay_millis(),
            retrigger_cooldown_millis: default_retrigger_cooldown_millis(),
            show_notifications: true,
        }
    }
}

/// Extra prompt recognizers appended after the built-in ones.
///
/// ```toml
/// [matcher]
/// extra_patterns = ["keep going\\?"]
/// ```
#[derive(Debug, Deserialize, Default)]
pub struct MatcherConfig {
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct EscalationSettings {
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    #[serde(default = "default_success_cooldown_secs")]
    pub success_cooldown_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_suppression_secs")]
    pub suppression_secs: u64,
    #[serde(default = "default_long_idle_secs")]
    pub long_idle_secs: u64,
    #[serde(default = "default_human_input_window_secs")]
    pub human_input_window_secs: u64,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval_secs(),
            success_cooldown_secs: default_success_cooldown_secs(),
            max_failures: default_max_failures(),
            suppression_secs: default_suppression_secs(),
            long_idle_secs: default_long_idle_secs(),
            human_input_window_secs: default_human_input_window_secs(),
        }
    }
}

/// Key sequences for the cheap probe, tried in order.
///
/// ```toml
/// [probe]
/// steps = [{ keys = "continue" }, { keys = "y", enter = false }]
/// ```
#[derive(Debug, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_steps")]
    pub steps: Vec<ProbeStep>,
    #[serde(default = "default_probe_settle_millis")]
    pub settle_millis: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            steps: default_probe_steps(),
            settle_millis: default_probe_settle_millis(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VisualSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ocr_program")]
    pub ocr_program: String,
    /// Empty means the system temp dir.
    #[serde(default)]
    pub capture_dir: String,
    /// Screenshot pixels per click unit.
    #[serde(default = "default_scale")]
    pub scale: f32,
}

impl Default for VisualSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ocr_program: default_ocr_program(),
            capture_dir: String::new(),
            scale: default_scale(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FocusSettings {
    /// Substring of the host window title. Empty means always focused.
    #[serde(default)]
    pub window_title: String,
}

#[derive(Debug, Deserialize)]
pub struct FallbackSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Empty means notification only.
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            program: String::new(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub escalation: EscalationSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub visual: VisualSettings,
    #[serde(default)]
    pub focus: FocusSettings,
    #[serde(default)]
    pub fallback: FallbackSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.keepgoing/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            config
                .validate()
                .with_context(|| format!("invalid config {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
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

    pub fn validate(&self) -> Result<()> {
        if self.general.change_poll_millis == 0 {
            bail!("general.change_poll_millis must be greater than 0");
        }
        if self.general.poll_interval_millis == 0 {
            bail!("general.poll_interval_millis must be greater than 0");
        }
        if self.escalation.max_failures == 0 {
            bail!("escalation.max_failures must be at least 1");
        }
        if self.visual.scale.is_nan() || self.visual.scale <= 0.0 {
            bail!("visual.scale must be positive, got {}", self.visual.scale);
        }
        if let Some(step) = self.probe.steps.iter().find(|s| s.keys.is_empty() && !s.enter) {
            bail!("probe step {:?} sends nothing", step);
        }
        Ok(())
    }

    pub fn escalation_config(&self) -> EscalationConfig {
        let e = &self.escalation;
        EscalationConfig {
            min_interval: Duration::from_secs(e.min_interval_secs),
            success_cooldown: Duration::from_secs(e.success_cooldown_secs),
            max_failures: e.max_failures,
            suppression: Duration::from_secs(e.suppression_secs),
            long_idle: Duration::from_secs(e.long_idle_secs),
            ..EscalationConfig::default()
        }
    }

    pub fn fallback_config(&self) -> FallbackConfig {
        FallbackConfig {
            enabled: self.fallback.enabled,
            program: self.fallback.program.clone(),
            args: self.fallback.args.clone(),
        }
    }

    /// Where screenshots are written.
    pub fn capture_dir(&self) -> PathBuf {
        if self.visual.capture_dir.trim().is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.visual.capture_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert!(config.general.enabled);
        assert_eq!(config.general.poll_interval_millis, 2000);
        assert_eq!(config.general.change_poll_millis, 200);
        assert_eq!(config.general.answer_delay_millis, 1000);
        assert_eq!(config.general.retrigger_cooldown_millis, 5000);
        assert!(config.general.show_notifications);
        assert!(config.matcher.extra_patterns.is_empty());
        assert_eq!(config.escalation.min_interval_secs, 5);
        assert_eq!(config.escalation.success_cooldown_secs, 15);
        assert_eq!(config.escalation.max_failures, 3);
        assert_eq!(config.escalation.suppression_secs, 30);
        assert_eq!(config.escalation.long_idle_secs, 30);
        assert_eq!(config.escalation.human_input_window_secs, 10);
        assert_eq!(config.probe.steps, vec![ProbeStep::new("continue", true)]);
        assert_eq!(config.probe.settle_millis, 1500);
        assert!(config.visual.enabled);
        assert_eq!(config.visual.ocr_program, "tesseract");
        assert_eq!(config.visual.scale, 1.0);
        assert!(config.focus.window_title.is_empty());
        assert!(config.fallback.enabled);
        assert!(config.fallback.program.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[general]
enabled = false
poll_interval_millis = 3000
change_poll_millis = 100
answer_delay_millis = 0
retrigger_cooldown_millis = 8000
show_notifications = false

[matcher]
extra_patterns = ["keep going\\?"]

[escalation]
min_interval_secs = 10
success_cooldown_secs = 20
max_failures = 5
suppression_secs = 60
long_idle_secs = 45
human_input_window_secs = 3

[probe]
steps = [{ keys = "continue" }, { keys = "y", enter = false }]
settle_millis = 500

[visual]
enabled = false
ocr_program = "/opt/bin/tesseract"
capture_dir = "/tmp/shots"
scale = 2.0

[focus]
window_title = "Cursor"

[fallback]
enabled = true
program = "notify-send"
args = ["keepgoing", "agent needs attention"]
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert!(!config.general.enabled);
        assert_eq!(config.general.poll_interval_millis, 3000);
        assert_eq!(config.general.change_poll_millis, 100);
        assert_eq!(config.general.answer_delay_millis, 0);
        assert_eq!(config.general.retrigger_cooldown_millis, 8000);
        assert!(!config.general.show_notifications);
        assert_eq!(config.matcher.extra_patterns, vec!["keep going\\?"]);
        assert_eq!(config.escalation.max_failures, 5);
        assert_eq!(config.escalation.human_input_window_secs, 3);
        assert_eq!(
            config.probe.steps,
            vec![ProbeStep::new("continue", true), ProbeStep::new("y", false)]
        );
        assert_eq!(config.probe.settle_millis, 500);
        assert!(!config.visual.enabled);
        assert_eq!(config.visual.ocr_program, "/opt/bin/tesseract");
        assert_eq!(config.capture_dir(), PathBuf::from("/tmp/shots"));
        assert_eq!(config.visual.scale, 2.0);
        assert_eq!(config.focus.window_title, "Cursor");
        assert_eq!(config.fallback.program, "notify-send");
        assert_eq!(config.fallback.args.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[escalation]
max_failures = 1
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.escalation.max_failures, 1);
        assert_eq!(config.escalation.min_interval_secs, 5);
        assert_eq!(config.general.poll_interval_millis, 2000);
        assert_eq!(config.probe.steps.len(), 1);
        assert_eq!(config.capture_dir(), std::env::temp_dir());
    }

    #[test]
    fn escalation_config_converts_units() {
        let toml = r#"
[escalation]
min_interval_secs = 7
success_cooldown_secs = 11
max_failures = 4
suppression_secs = 90
long_idle_secs = 40
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        let esc = config.escalation_config();
        assert_eq!(esc.min_interval, Duration::from_secs(7));
        assert_eq!(esc.success_cooldown, Duration::from_secs(11));
        assert_eq!(esc.max_failures, 4);
        assert_eq!(esc.suppression, Duration::from_secs(90));
        assert_eq!(esc.long_idle, Duration::from_secs(40));
        assert_eq!(esc.probe_failure_capacity, 5);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let config: ProjectConfig = toml::from_str("[escalation]\nmax_failures = 0\n").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("max_failures"));

        let config: ProjectConfig = toml::from_str("[general]\nchange_poll_millis = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config: ProjectConfig = toml::from_str("[visual]\nscale = 0.0\n").unwrap();
        assert!(config.validate().is_err());

        let config: ProjectConfig =
            toml::from_str("[probe]\nsteps = [{ keys = \"\", enter = false }]\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".keepgoing");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[focus]
window_title = "Cursor"

[fallback]
program = "say"
"#,
        )
        .unwrap();

        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_some());
        assert_eq!(config.focus.window_title, "Cursor");
        assert_eq!(config.fallback_config().program, "say");
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.escalation.max_failures, 3);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".keepgoing");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.toml"), "[escalation]\nmax_failures = 0\n").unwrap();

        let err = ProjectConfig::load(tmp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("max_failures"));
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".keepgoing");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[general]
answer_delay_millis = 250
"#,
        )
        .unwrap();

        let nested = tmp.path().join("src").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.general.answer_delay_millis, 250);
    }
}
