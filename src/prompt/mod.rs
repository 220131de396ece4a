//! Continuation prompt recognizers.
//!
//! Coding agents that stop after a fixed tool-call budget print a small family
//! of "should I keep going?" messages. This module holds the compiled
//! recognizers for those messages plus the two smaller sets the visual tier
//! needs: prompt text as it appears after OCR, and the words printed on the
//! control that resumes the agent.
//!
//! ## Design notes
//!
//! Matching runs on every text-change event, so a matcher is a flat ordered
//! list of case-insensitive regexes with no per-call allocation beyond ANSI
//! stripping. Matching never fails: empty or unrelated text is simply "no
//! match".

use anyhow::{Context, Result};
use regex::Regex;

/// Host text that means the agent is waiting to be told to continue.
const CONTINUE_PROMPTS: &[&str] = &[
    r"we default stop the agent after \d+ tool calls",
    r"please ask the agent to continue manually",
    r"would you like to continue",
    r"press continue to proceed",
    r"click continue to resume",
    r"do you want to continue",
    r"shall i continue",
    r"continue with the next step",
];

/// The same prompt as it tends to come back from OCR (partial, reflowed).
const SCREEN_PROMPTS: &[&str] = &[
    r"we default stop the agent after \d+ tool calls",
    r"reached.*tool call limit",
    r"25 tool calls",
    r"tool call limit",
    r"please ask.*continue manually",
];

/// Words printed on the control that resumes the agent.
const CONTINUE_CONTROLS: &[&str] = &[
    r"continue",
    r"resume",
    r"proceed",
    r"yes.*continue",
    r"skip.*continue",
];

/// A recognizer hit, kept for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMatch {
    /// Index of the recognizer that fired.
    pub pattern_index: usize,
    /// The text the recognizer matched.
    pub matched_text: String,
}

/// Ordered set of case-insensitive recognizers.
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    patterns: Vec<Regex>,
}

impl PromptMatcher {
    /// Recognizers for continuation prompts in host text.
    pub fn continue_prompts() -> Self {
        Self::from_static(CONTINUE_PROMPTS)
    }

    /// Recognizers for continuation prompts in OCR output.
    pub fn screen_prompts() -> Self {
        Self::from_static(SCREEN_PROMPTS)
    }

    /// Recognizers for a single OCR word naming the continue control.
    pub fn continue_controls() -> Self {
        Self::from_static(CONTINUE_CONTROLS)
    }

    fn from_static(sources: &[&str]) -> Self {
        Self {
            patterns: sources
                .iter()
                .map(|src| Regex::new(&format!("(?i){src}")).unwrap())
                .collect(),
        }
    }

    /// Append user-supplied recognizers after the built-in ones.
    ///
    /// Patterns are compiled case-insensitively. A pattern that does not
    /// compile is rejected with the offending source in the error.
    pub fn with_extra_patterns(mut self, extra: &[String]) -> Result<Self> {
        for src in extra {
            let regex = Regex::new(&format!("(?i){src}"))
                .with_context(|| format!("invalid prompt pattern '{src}'"))?;
            self.patterns.push(regex);
        }
        Ok(self)
    }

    /// Whether any recognizer matches anywhere in `text`.
    pub fn matches(&self, text: &str) -> bool {
        self.first_match(text).is_some()
    }

    /// The first recognizer (in order) that matches `text`, if any.
    pub fn first_match(&self, text: &str) -> Option<PromptMatch> {
        if text.is_empty() {
            return None;
        }
        let clean = strip_ansi(text);
        self.patterns.iter().enumerate().find_map(|(i, regex)| {
            regex.find(&clean).map(|m| PromptMatch {
                pattern_index: i,
                matched_text: m.as_str().to_string(),
            })
        })
    }
}

/// Strip ANSI escape sequences from terminal output.
pub fn strip_ansi(input: &str) -> String {
    // CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").into_owned()
}
