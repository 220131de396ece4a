//! Cheap probe: type into the host and see whether the prompt goes away.
//!
//! This is the first thing tried for every detected prompt. Steps are sent
//! in order; after each one the host text is re-read once it has had time to
//! settle, and the probe stops as soon as the prompt is gone.

use std::fmt;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::host::HostSession;
use crate::prompt::PromptMatcher;

/// One key sequence to type into the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeStep {
    pub keys: String,
    #[serde(default = "default_enter")]
    pub enter: bool,
}

fn default_enter() -> bool {
    true
}

impl ProbeStep {
    pub fn new(keys: &str, enter: bool) -> Self {
        Self {
            keys: keys.to_string(),
            enter,
        }
    }

    /// Short label recorded as a probe failure.
    pub fn label(&self) -> String {
        if self.enter {
            format!("keys:{}+enter", self.keys)
        } else {
            format!("keys:{}", self.keys)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// The prompt disappeared after `step`.
    Resolved { step: String },
    /// Every step was delivered but the prompt is still shown.
    Unresolved { label: String },
    /// No step could be delivered.
    Unavailable { label: String, error: String },
}

impl ProbeOutcome {
    pub fn resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    /// Label to record with the escalation controller, if the probe failed.
    pub fn failure_label(&self) -> Option<&str> {
        match self {
            Self::Resolved { .. } => None,
            Self::Unresolved { label } | Self::Unavailable { label, .. } => Some(label),
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved { step } => write!(f, "prompt cleared after {step}"),
            Self::Unresolved { label } => write!(f, "prompt still shown after {label}"),
            Self::Unavailable { label, error } => write!(f, "could not send {label}: {error}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheapProbe {
    steps: Vec<ProbeStep>,
    settle: Duration,
}

impl CheapProbe {
    pub fn new(steps: Vec<ProbeStep>, settle: Duration) -> Self {
        Self { steps, settle }
    }

    pub fn run(&self, host: &dyn HostSession, matcher: &PromptMatcher) -> ProbeOutcome {
        let mut last_label = "keys:none".to_string();
        let mut last_error: Option<String> = None;
        let mut delivered = false;

        for step in &self.steps {
            last_label = step.label();
            if let Err(e) = host.send_input(&step.keys, step.enter) {
                debug!(step = %last_label, error = %e, "probe step not delivered");
                last_error = Some(format!("{e:#}"));
                continue;
            }
            delivered = true;

            if !self.settle.is_zero() {
                thread::sleep(self.settle);
            }

            match host.visible_text() {
                Ok(text) if !matcher.matches(&text) => {
                    info!(step = %last_label, host = %host.describe(), "prompt resolved by cheap probe");
                    return ProbeOutcome::Resolved { step: last_label };
                }
                Ok(_) => debug!(step = %last_label, "prompt still shown after probe step"),
                Err(e) => debug!(step = %last_label, error = %e, "failed to re-read host after probe"),
            }
        }

        if delivered {
            ProbeOutcome::Unresolved { label: last_label }
        } else {
            ProbeOutcome::Unavailable {
                label: last_label,
                error: last_error.unwrap_or_else(|| "no probe steps configured".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fakes::{FakeHost, FakeHostState};

    const PROMPT: &str = "Would you like to continue?";

    fn probe(steps: Vec<ProbeStep>) -> CheapProbe {
        CheapProbe::new(steps, Duration::ZERO)
    }

    #[test]
    fn resolves_when_prompt_disappears() {
        let host = FakeHost::with_state(FakeHostState {
            text_after_input: Some("Running tests...".to_string()),
            ..Default::default()
        });
        host.set_text(PROMPT);

        let outcome = probe(vec![ProbeStep::new("continue", true)])
            .run(&host, &PromptMatcher::continue_prompts());
        assert_eq!(
            outcome,
            ProbeOutcome::Resolved {
                step: "keys:continue+enter".to_string()
            }
        );
        assert_eq!(host.sent(), vec![("continue".to_string(), true)]);
        assert!(outcome.failure_label().is_none());
    }

    #[test]
    fn tries_every_step_while_prompt_stays() {
        let host = FakeHost::showing(PROMPT);
        let outcome = probe(vec![ProbeStep::new("continue", true), ProbeStep::new("y", false)])
            .run(&host, &PromptMatcher::continue_prompts());

        assert_eq!(outcome.failure_label(), Some("keys:y"));
        assert!(!outcome.resolved());
        assert_eq!(host.sent().len(), 2);
    }

    #[test]
    fn undeliverable_input_is_unavailable() {
        let host = FakeHost::with_state(FakeHostState {
            rejects_input: true,
            ..Default::default()
        });
        host.set_text(PROMPT);

        let outcome = probe(vec![ProbeStep::new("continue", true)])
            .run(&host, &PromptMatcher::continue_prompts());
        match outcome {
            ProbeOutcome::Unavailable { label, error } => {
                assert_eq!(label, "keys:continue+enter");
                assert!(error.contains("no input channel"));
            }
            other => panic!("expected Unavailable, got: {other:?}"),
        }
    }

    #[test]
    fn no_steps_is_unavailable() {
        let host = FakeHost::showing(PROMPT);
        let outcome = probe(vec![]).run(&host, &PromptMatcher::continue_prompts());
        assert!(matches!(outcome, ProbeOutcome::Unavailable { .. }));
        assert_eq!(outcome.failure_label(), Some("keys:none"));
    }

    #[test]
    fn step_enter_defaults_to_true() {
        let step: ProbeStep = toml::from_str(r#"keys = "continue""#).unwrap();
        assert!(step.enter);
    }
}
