//! Text recognition on screenshots via the `tesseract` CLI.
//!
//! Tesseract's TSV output gives one row per recognized word with its bounding
//! box, so locating a control is a matter of finding a word that matches a
//! continue-control pattern once the screen as a whole shows a prompt.

use std::process::Command;

use tracing::debug;

use super::{CapturedImage, Point, Target, TargetLocator, VisualError, VisualResult};
use crate::prompt::PromptMatcher;

/// Word rows in TSV output.
const WORD_LEVEL: u32 = 5;
/// Button labels are short; longer lines are prose that merely mentions them.
const MAX_BUTTON_LINE_WORDS: usize = 3;
/// Used when tesseract reports no confidence for a word.
const DEFAULT_CONFIDENCE: f32 = 0.5;

/// One recognized word with its bounding box in image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedWord {
    pub text: String,
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
    /// 0.0..=1.0
    pub confidence: f32,
    /// `(block, paragraph, line)`
    pub line: (u32, u32, u32),
}

/// Parse `tesseract ... tsv` output into word rows. Malformed rows are skipped.
pub fn parse_tsv(tsv: &str) -> Vec<RecognizedWord> {
    tsv.lines()
        .filter(|l| !l.starts_with("level"))
        .filter_map(parse_row)
        .collect()
}

fn parse_row(row: &str) -> Option<RecognizedWord> {
    let cols: Vec<&str> = row.splitn(12, '\t').collect();
    if cols.len() < 12 {
        return None;
    }
    let level: u32 = cols[0].parse().ok()?;
    let text = cols[11].trim();
    if level != WORD_LEVEL || text.is_empty() {
        return None;
    }
    let conf: f32 = cols[10].trim().parse().ok()?;
    let confidence = if conf < 0.0 {
        DEFAULT_CONFIDENCE
    } else {
        (conf / 100.0).clamp(0.0, 1.0)
    };
    Some(RecognizedWord {
        text: text.to_string(),
        left: cols[6].parse().ok()?,
        top: cols[7].parse().ok()?,
        width: cols[8].parse().ok()?,
        height: cols[9].parse().ok()?,
        confidence,
        line: (cols[2].parse().ok()?, cols[3].parse().ok()?, cols[4].parse().ok()?),
    })
}

/// Locates continue controls with tesseract.
pub struct TesseractLocator {
    program: String,
    screen_prompts: PromptMatcher,
    controls: PromptMatcher,
    /// Image pixels per click unit (2.0 on HiDPI displays).
    scale: f32,
}

impl TesseractLocator {
    pub fn new(program: &str, scale: f32) -> Self {
        Self {
            program: program.to_string(),
            screen_prompts: PromptMatcher::screen_prompts(),
            controls: PromptMatcher::continue_controls(),
            scale: if scale > 0.0 { scale } else { 1.0 },
        }
    }

    /// Run tesseract on `image` and return its word rows.
    pub fn recognize(&self, image: &CapturedImage) -> VisualResult<Vec<RecognizedWord>> {
        let output = Command::new(&self.program)
            .arg(image.path())
            .args(["stdout", "tsv"])
            .output()
            .map_err(|e| VisualError::Recognition(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(VisualError::Recognition(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let words = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        debug!(words = words.len(), "text recognized");
        Ok(words)
    }

    /// Pick the control to click from recognized words.
    ///
    /// Nothing is returned unless the screen text as a whole matches a screen
    /// prompt. Among matching words, one on a short line wins; otherwise the
    /// first match is used at half confidence.
    pub fn locate(&self, words: &[RecognizedWord]) -> Option<Target> {
        let screen_text = words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if !self.screen_prompts.matches(&screen_text) {
            return None;
        }

        let candidates: Vec<&RecognizedWord> = words
            .iter()
            .filter(|w| self.controls.matches(&w.text))
            .collect();

        let line_len = |word: &RecognizedWord| words.iter().filter(|w| w.line == word.line).count();

        if let Some(word) = candidates
            .iter()
            .find(|w| line_len(**w) <= MAX_BUTTON_LINE_WORDS)
        {
            return Some(self.target_for(word, word.confidence));
        }
        candidates
            .first()
            .map(|word| self.target_for(word, word.confidence * 0.5))
    }

    fn target_for(&self, word: &RecognizedWord, confidence: f32) -> Target {
        let cx = word.left as f32 + word.width as f32 / 2.0;
        let cy = word.top as f32 + word.height as f32 / 2.0;
        Target {
            location: Point {
                x: (cx / self.scale).round() as i32,
                y: (cy / self.scale).round() as i32,
            },
            width: (word.width as f32 / self.scale).round() as u32,
            height: (word.height as f32 / self.scale).round() as u32,
            confidence,
            text: word.text.clone(),
        }
    }
}

impl TargetLocator for TesseractLocator {
    fn locate_target(&self, image: &CapturedImage) -> VisualResult<Option<Target>> {
        let words = self.recognize(image)?;
        Ok(self.locate(&words))
    }
}
