//! Screenshot capture through platform screenshot tools.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use super::{CapturedImage, ScreenCapture, VisualError, VisualResult};

const PATH_PLACEHOLDER: &str = "{path}";

/// One screenshot tool invocation. `{path}` in an argument is replaced by the
/// output file.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStrategy {
    pub name: String,
    pub argv: Vec<String>,
}

impl CaptureStrategy {
    fn new(name: &str, argv: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn command_for(&self, path: &Path) -> Option<Command> {
        let path = path.display().to_string();
        let (program, args) = self.argv.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|a| a.replace(PATH_PLACEHOLDER, &path)));
        Some(cmd)
    }
}

/// Screenshot tools for the current platform, most preferred first.
pub fn platform_strategies() -> Vec<CaptureStrategy> {
    match std::env::consts::OS {
        "macos" => vec![CaptureStrategy::new(
            "screencapture",
            &["screencapture", "-x", "-t", "png", PATH_PLACEHOLDER],
        )],
        "linux" => vec![
            CaptureStrategy::new("grim", &["grim", PATH_PLACEHOLDER]),
            CaptureStrategy::new(
                "gnome-screenshot",
                &["gnome-screenshot", "-f", PATH_PLACEHOLDER],
            ),
            CaptureStrategy::new("import", &["import", "-window", "root", PATH_PLACEHOLDER]),
        ],
        "windows" => vec![CaptureStrategy::new(
            "powershell",
            &[
                "powershell",
                "-NoProfile",
                "-Command",
                "Add-Type -AssemblyName System.Windows.Forms,System.Drawing; \
                 $b = [System.Windows.Forms.Screen]::PrimaryScreen.Bounds; \
                 $img = New-Object System.Drawing.Bitmap $b.Width, $b.Height; \
                 $g = [System.Drawing.Graphics]::FromImage($img); \
                 $g.CopyFromScreen($b.Location, [System.Drawing.Point]::Empty, $b.Size); \
                 $img.Save('{path}', [System.Drawing.Imaging.ImageFormat]::Png)",
            ],
        )],
        _ => Vec::new(),
    }
}

/// Tries each strategy until one writes a non-empty image.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    strategies: Vec<CaptureStrategy>,
    dir: PathBuf,
}

impl CommandCapture {
    pub fn new(strategies: Vec<CaptureStrategy>, dir: PathBuf) -> Self {
        Self { strategies, dir }
    }

    /// Platform tools writing into `dir`.
    pub fn for_platform(dir: PathBuf) -> Self {
        Self::new(platform_strategies(), dir)
    }
}

impl ScreenCapture for CommandCapture {
    fn capture(&self) -> VisualResult<CapturedImage> {
        if self.strategies.is_empty() {
            return Err(VisualError::Capture(format!(
                "no screenshot tool known for platform {}",
                std::env::consts::OS
            )));
        }
        std::fs::create_dir_all(&self.dir)?;

        let path = self.dir.join(format!("keepgoing-{}.png", uuid::Uuid::new_v4()));
        let mut last_error = String::new();

        for strategy in &self.strategies {
            let Some(mut cmd) = strategy.command_for(&path) else {
                continue;
            };
            match cmd.output() {
                Ok(output) if output.status.success() => {
                    let written = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    if written > 0 {
                        debug!(tool = %strategy.name, bytes = written, "screenshot written");
                        return Ok(CapturedImage::new(path));
                    }
                    last_error = format!("{} produced no image", strategy.name);
                }
                Ok(output) => {
                    last_error = format!(
                        "{} exited with {}: {}",
                        strategy.name,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Err(e) => last_error = format!("{} unavailable: {e}", strategy.name),
            }
            debug!(error = %last_error, "screenshot tool failed");
        }

        let _ = std::fs::remove_file(&path);
        Err(VisualError::Capture(last_error))
    }
}
