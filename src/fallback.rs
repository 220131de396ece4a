//! Command fallback: the last tier, run when neither the probe nor the visual
//! tier resolved a prompt.
//!
//! The configured program receives the host description and the matched
//! prompt through `KEEPGOING_HOST` and `KEEPGOING_PROMPT`. With no program
//! configured the fallback is a notification only.

use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackOutcome {
    /// The command ran and exited successfully.
    Ran { stdout: String },
    /// No command configured; only the notification was raised.
    NotifyOnly,
    /// The command ran but exited with an error.
    Failed { error: String },
    /// Fallback is turned off.
    Disabled,
}

impl FallbackOutcome {
    pub fn summary(&self) -> String {
        match self {
            Self::Ran { stdout } if stdout.is_empty() => "fallback command ran".to_string(),
            Self::Ran { stdout } => format!("fallback command ran: {stdout}"),
            Self::NotifyOnly => "no fallback command configured".to_string(),
            Self::Failed { error } => format!("fallback command failed: {error}"),
            Self::Disabled => "fallback disabled".to_string(),
        }
    }
}

/// Run the fallback command for an unresolved prompt.
///
/// Returns `Err` only when the program cannot be started.
pub fn run_fallback(config: &FallbackConfig, host: &str, prompt: &str) -> Result<FallbackOutcome> {
    if !config.enabled {
        return Ok(FallbackOutcome::Disabled);
    }
    if config.program.trim().is_empty() {
        return Ok(FallbackOutcome::NotifyOnly);
    }

    info!(program = %config.program, "running fallback command");
    let output = Command::new(&config.program)
        .args(&config.args)
        .env("KEEPGOING_HOST", host)
        .env("KEEPGOING_PROMPT", prompt)
        .output()
        .with_context(|| format!("failed to run fallback command: {}", config.program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(status = %output.status, stderr = %stderr, "fallback command failed");
        return Ok(FallbackOutcome::Failed {
            error: format!("exited with {}: {stderr}", output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(stdout = %stdout, "fallback command output");
    Ok(FallbackOutcome::Ran { stdout })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(program: &str, args: &[&str]) -> FallbackConfig {
        FallbackConfig {
            enabled: true,
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn disabled_does_nothing() {
        let cfg = FallbackConfig {
            enabled: false,
            ..config("false", &[])
        };
        assert_eq!(run_fallback(&cfg, "h", "p").unwrap(), FallbackOutcome::Disabled);
    }

    #[test]
    fn empty_program_is_notify_only() {
        let outcome = run_fallback(&config("  ", &[]), "h", "p").unwrap();
        assert_eq!(outcome, FallbackOutcome::NotifyOnly);
        assert!(outcome.summary().contains("no fallback command"));
    }

    #[test]
    fn command_sees_prompt_environment() {
        let cfg = config("sh", &["-c", "printf '%s|%s' \"$KEEPGOING_HOST\" \"$KEEPGOING_PROMPT\""]);
        let outcome = run_fallback(&cfg, "tmux pane %3", "shall I continue").unwrap();
        assert_eq!(
            outcome,
            FallbackOutcome::Ran {
                stdout: "tmux pane %3|shall I continue".to_string()
            }
        );
    }

    #[test]
    fn nonzero_exit_is_failed_outcome() {
        let cfg = config("sh", &["-c", "echo boom >&2; exit 3"]);
        match run_fallback(&cfg, "h", "p").unwrap() {
            FallbackOutcome::Failed { error } => assert!(error.contains("boom")),
            other => panic!("expected Failed, got: {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_error() {
        let err = run_fallback(&config("keepgoing-no-such-fallback", &[]), "h", "p").unwrap_err();
        assert!(err.to_string().contains("failed to run fallback command"));
    }
}
