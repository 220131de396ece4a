//! Native mouse clicks through platform automation tools.
//!
//! Each platform has an ordered list of strategies. A strategy is one or more
//! commands run in sequence; the first strategy whose commands all succeed
//! wins. `{x}` and `{y}` in arguments are replaced by the click coordinates.

use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::{ClickResult, Clicker, Point};

const UNSUPPORTED: &str = "unsupported";

#[derive(Debug, Clone, PartialEq)]
pub struct ClickStrategy {
    pub method: String,
    pub commands: Vec<Vec<String>>,
}

impl ClickStrategy {
    fn new(method: &str, commands: &[&[&str]]) -> Self {
        Self {
            method: method.to_string(),
            commands: commands
                .iter()
                .map(|argv| argv.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }

    fn run(&self, x: i32, y: i32) -> Result<(), String> {
        let (xs, ys) = (x.to_string(), y.to_string());
        for argv in &self.commands {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            let args = args
                .iter()
                .map(|a| a.replace("{x}", &xs).replace("{y}", &ys));
            match Command::new(program).args(args).output() {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    return Err(format!(
                        "{}: {program} exited with {}: {}",
                        self.method,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ));
                }
                Err(e) => return Err(format!("{}: {program} unavailable: {e}", self.method)),
            }
        }
        Ok(())
    }
}

const QUARTZ_CLICK: &str = "import sys, Quartz
x, y = float(sys.argv[1]), float(sys.argv[2])
for kind in (Quartz.kCGEventLeftMouseDown, Quartz.kCGEventLeftMouseUp):
    e = Quartz.CGEventCreateMouseEvent(None, kind, (x, y), Quartz.kCGMouseButtonLeft)
    Quartz.CGEventPost(Quartz.kCGHIDEventTap, e)
";

const POWERSHELL_CLICK: &str = "Add-Type -AssemblyName System.Windows.Forms; \
[System.Windows.Forms.Cursor]::Position = New-Object System.Drawing.Point({x}, {y}); \
Add-Type -MemberDefinition '[DllImport(\"user32.dll\")] public static extern void mouse_event(int f, int x, int y, int d, int i);' -Name M -Namespace W; \
[W.M]::mouse_event(2, 0, 0, 0, 0); [W.M]::mouse_event(4, 0, 0, 0, 0)";

/// Click strategies for the current platform, most preferred first.
pub fn platform_strategies() -> Vec<ClickStrategy> {
    match std::env::consts::OS {
        "macos" => vec![
            ClickStrategy::new(
                "applescript",
                &[&[
                    "osascript",
                    "-e",
                    "tell application \"System Events\" to click at {{x}, {y}}",
                ]],
            ),
            ClickStrategy::new("quartz", &[&["python3", "-c", QUARTZ_CLICK, "{x}", "{y}"]]),
        ],
        "linux" => vec![
            ClickStrategy::new(
                "xdotool",
                &[&["xdotool", "mousemove", "{x}", "{y}", "click", "1"]],
            ),
            ClickStrategy::new(
                "xte",
                &[&["xte", "mousemove {x} {y}"], &["xte", "mouseclick 1"]],
            ),
        ],
        "windows" => vec![ClickStrategy::new(
            "powershell",
            &[&["powershell", "-NoProfile", "-Command", POWERSHELL_CLICK]],
        )],
        _ => Vec::new(),
    }
}

/// Tools a user must install for clicking to work on this platform.
pub fn requirements() -> Vec<&'static str> {
    match std::env::consts::OS {
        "macos" => vec![
            "osascript (built in); grant Accessibility permission to your terminal",
            "python3 with pyobjc-framework-Quartz (fallback)",
        ],
        "linux" => vec![
            "xdotool (apt install xdotool)",
            "xte from xautomation (fallback)",
        ],
        "windows" => vec!["powershell (built in)"],
        _ => vec!["no native click support on this platform"],
    }
}

pub fn is_supported() -> bool {
    !platform_strategies().is_empty()
}

static XDOTOOL_POSITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"x:(-?\d+)\s+y:(-?\d+)").unwrap());

/// Parse `xdotool getmouselocation` output (`x:123 y:456 screen:0 window:1`).
pub fn parse_mouse_location(output: &str) -> Option<Point> {
    let caps = XDOTOOL_POSITION.captures(output)?;
    Some(Point {
        x: caps[1].parse().ok()?,
        y: caps[2].parse().ok()?,
    })
}

/// Current pointer position, where the platform can report it.
pub fn mouse_position() -> Option<Point> {
    if std::env::consts::OS != "linux" {
        return None;
    }
    let output = Command::new("xdotool")
        .arg("getmouselocation")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_mouse_location(&String::from_utf8_lossy(&output.stdout))
}

/// Runs click strategies in order until one succeeds.
#[derive(Debug, Clone)]
pub struct NativeClicker {
    strategies: Vec<ClickStrategy>,
}

impl NativeClicker {
    pub fn new(strategies: Vec<ClickStrategy>) -> Self {
        Self { strategies }
    }

    pub fn for_platform() -> Self {
        Self::new(platform_strategies())
    }
}

impl Clicker for NativeClicker {
    fn click_at(&self, x: i32, y: i32) -> ClickResult {
        let location = Point { x, y };
        let mut last: Option<(String, String)> = None;

        for strategy in &self.strategies {
            match strategy.run(x, y) {
                Ok(()) => {
                    debug!(method = %strategy.method, x, y, "clicked");
                    return ClickResult {
                        succeeded: true,
                        method: strategy.method.clone(),
                        error: None,
                        location,
                    };
                }
                Err(e) => {
                    debug!(error = %e, "click strategy failed");
                    last = Some((strategy.method.clone(), e));
                }
            }
        }

        let (method, error) = last.unwrap_or_else(|| {
            (
                UNSUPPORTED.to_string(),
                format!("no click method for platform {}", std::env::consts::OS),
            )
        });
        ClickResult {
            succeeded: false,
            method,
            error: Some(error),
            location,
        }
    }
}
