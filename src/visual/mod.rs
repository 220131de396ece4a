//! Visual tier: screen capture → text recognition → native click.
//!
//! Each stage sits behind a trait so the pipeline can be driven by platform
//! tools in production and by fakes in tests. The pipeline never lets an
//! error escape an attempt: capture and recognition errors, recognition
//! misses, and click failures are all folded into an [`AttemptOutcome`] and
//! reported to the escalation controller through an attempt guard.

pub mod capture;
pub mod click;
pub mod ocr;

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::escalation::{Clock, EscalationController};

#[derive(Debug, Error)]
pub enum VisualError {
    #[error("screen capture failed: {0}")]
    Capture(String),

    #[error("text recognition failed: {0}")]
    Recognition(String),

    #[error("click via {method} failed: {error}")]
    Actuation { method: String, error: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VisualResult<T> = Result<T, VisualError>;

/// A screenshot on disk. The file is removed on drop unless kept.
#[derive(Debug)]
pub struct CapturedImage {
    path: PathBuf,
    keep: bool,
}

impl CapturedImage {
    pub fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the file in place and return its path.
    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for CapturedImage {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Screen coordinates in the clicker's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A located continue control.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Center of the control.
    pub location: Point,
    pub width: u32,
    pub height: u32,
    /// 0.0..=1.0
    pub confidence: f32,
    /// The recognized label.
    pub text: String,
}

/// Result of one native click.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickResult {
    pub succeeded: bool,
    /// Mechanism that succeeded, or the last one tried.
    pub method: String,
    pub error: Option<String>,
    pub location: Point,
}

impl ClickResult {
    /// Turn a failed click into [`VisualError::Actuation`].
    pub fn into_result(self) -> VisualResult<ClickResult> {
        if self.succeeded {
            Ok(self)
        } else {
            Err(VisualError::Actuation {
                error: self.error.unwrap_or_else(|| "unknown error".to_string()),
                method: self.method,
            })
        }
    }
}

pub trait ScreenCapture {
    fn capture(&self) -> VisualResult<CapturedImage>;
}

pub trait TargetLocator {
    fn locate_target(&self, image: &CapturedImage) -> VisualResult<Option<Target>>;
}

pub trait Clicker {
    /// Never fails; a failed click is reported in the result.
    fn click_at(&self, x: i32, y: i32) -> ClickResult;
}

/// How a visual attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Target located and clicked.
    Clicked { target: Target, click: ClickResult },
    /// Capture and recognition worked but nothing actionable was on screen.
    NotFound,
    /// Target located but every click mechanism failed.
    ClickFailed { target: Target, click: ClickResult },
    /// Capture or recognition raised.
    Error(String),
}

impl AttemptOutcome {
    /// Whether the pipeline itself ran to completion without an error.
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Clicked { .. } | Self::NotFound)
    }

    pub fn target_found(&self) -> bool {
        matches!(self, Self::Clicked { .. } | Self::ClickFailed { .. })
    }

    pub fn resolved(&self) -> bool {
        matches!(self, Self::Clicked { .. })
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clicked { target, click } => write!(
                f,
                "clicked \"{}\" at {} via {} (confidence {:.2})",
                target.text, click.location, click.method, target.confidence
            ),
            Self::NotFound => write!(f, "no continue control found on screen"),
            Self::ClickFailed { target, click } => write!(
                f,
                "found \"{}\" at {} but click failed: {}",
                target.text,
                target.location,
                click.error.as_deref().unwrap_or("unknown error")
            ),
            Self::Error(e) => write!(f, "visual detection error: {e}"),
        }
    }
}

/// Capture, locate, and click, in that order.
pub struct VisualPipeline {
    capture: Box<dyn ScreenCapture>,
    locator: Box<dyn TargetLocator>,
    clicker: Box<dyn Clicker>,
}

impl VisualPipeline {
    pub fn new(
        capture: Box<dyn ScreenCapture>,
        locator: Box<dyn TargetLocator>,
        clicker: Box<dyn Clicker>,
    ) -> Self {
        Self {
            capture,
            locator,
            clicker,
        }
    }

    /// Platform screenshot and click tools with tesseract recognition.
    pub fn for_platform(ocr_program: &str, capture_dir: PathBuf, scale: f32) -> Self {
        Self::new(
            Box::new(capture::CommandCapture::for_platform(capture_dir)),
            Box::new(ocr::TesseractLocator::new(ocr_program, scale)),
            Box::new(click::NativeClicker::for_platform()),
        )
    }

    /// Run one attempt under the controller's attempt lock.
    ///
    /// The outcome is reported to the controller exactly once, whatever
    /// happens inside the pipeline.
    pub fn run_attempt<C: Clock>(&self, controller: &mut EscalationController<C>) -> AttemptOutcome {
        let guard = controller.begin_attempt();
        let outcome = self.detect_and_click();
        guard.finish(outcome.succeeded(), outcome.target_found());
        outcome
    }

    /// Run capture → locate → click without touching any controller.
    pub fn detect_and_click(&self) -> AttemptOutcome {
        let outcome = match self.locate() {
            Ok(Some(target)) => {
                let click = self.clicker.click_at(target.location.x, target.location.y);
                if click.succeeded {
                    AttemptOutcome::Clicked { target, click }
                } else {
                    AttemptOutcome::ClickFailed { target, click }
                }
            }
            Ok(None) => AttemptOutcome::NotFound,
            Err(e) => AttemptOutcome::Error(e.to_string()),
        };

        match &outcome {
            AttemptOutcome::Clicked { .. } => info!(outcome = %outcome, "visual attempt"),
            AttemptOutcome::NotFound => debug!(outcome = %outcome, "visual attempt"),
            _ => warn!(outcome = %outcome, "visual attempt"),
        }
        outcome
    }

    /// Capture and locate only.
    pub fn locate(&self) -> VisualResult<Option<Target>> {
        let image = self.capture.capture()?;
        debug!(image = %image.path().display(), "screen captured");
        self.locator.locate_target(&image)
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    pub(crate) struct FakeCapture {
        pub fail: bool,
    }

    impl ScreenCapture for FakeCapture {
        fn capture(&self) -> VisualResult<CapturedImage> {
            if self.fail {
                return Err(VisualError::Capture("no display".to_string()));
            }
            Ok(CapturedImage::new(PathBuf::from(
                "/nonexistent/keepgoing-fake.png",
            )))
        }
    }

    pub(crate) struct FakeLocator {
        pub target: Option<Target>,
    }

    impl TargetLocator for FakeLocator {
        fn locate_target(&self, _image: &CapturedImage) -> VisualResult<Option<Target>> {
            Ok(self.target.clone())
        }
    }

    pub(crate) struct FakeClicker {
        pub succeed: bool,
        pub clicks: Rc<Cell<u32>>,
    }

    impl Clicker for FakeClicker {
        fn click_at(&self, x: i32, y: i32) -> ClickResult {
            self.clicks.set(self.clicks.get() + 1);
            ClickResult {
                succeeded: self.succeed,
                method: "fake".to_string(),
                error: (!self.succeed).then(|| "fake click refused".to_string()),
                location: Point { x, y },
            }
        }
    }

    pub(crate) fn button() -> Target {
        Target {
            location: Point { x: 640, y: 480 },
            width: 80,
            height: 24,
            confidence: 0.9,
            text: "Continue".to_string(),
        }
    }

    pub(crate) fn pipeline(
        capture_fails: bool,
        target: Option<Target>,
        click_succeeds: bool,
    ) -> (VisualPipeline, Rc<Cell<u32>>) {
        let clicks = Rc::new(Cell::new(0));
        let pipeline = VisualPipeline::new(
            Box::new(FakeCapture {
                fail: capture_fails,
            }),
            Box::new(FakeLocator { target }),
            Box::new(FakeClicker {
                succeed: click_succeeds,
                clicks: clicks.clone(),
            }),
        );
        (pipeline, clicks)
    }
}
