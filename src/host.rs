//! The watched host: where prompt text comes from, where cheap-probe input
//! goes, and whether its window currently has focus.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::tmux;

/// Largest tail of a file host that is read per observation.
const FILE_TAIL_BYTES: u64 = 64 * 1024;

/// A UI showing the agent's output.
pub trait HostSession {
    /// Human-readable name for logs.
    fn describe(&self) -> String;
    /// The text the host currently shows.
    fn visible_text(&self) -> Result<String>;
    /// Type into the host. Hosts without an input channel return an error.
    fn send_input(&self, keys: &str, press_enter: bool) -> Result<()>;
    /// Whether the host still exists.
    fn is_alive(&self) -> bool;
}

/// An agent running in a tmux pane.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    pane: String,
}

impl TmuxHost {
    /// Resolve `target` (session, window, or pane) to a pinned pane id.
    pub fn attach(target: &str) -> Result<Self> {
        tmux::check_tmux()?;
        let pane = tmux::pane_id(target)
            .with_context(|| format!("tmux target '{target}' not found"))?;
        Ok(Self { pane })
    }
}

impl HostSession for TmuxHost {
    fn describe(&self) -> String {
        format!("tmux pane {}", self.pane)
    }

    fn visible_text(&self) -> Result<String> {
        tmux::capture_pane(&self.pane)
    }

    fn send_input(&self, keys: &str, press_enter: bool) -> Result<()> {
        tmux::send_keys(&self.pane, keys, press_enter)
    }

    fn is_alive(&self) -> bool {
        tmux::pane_exists(&self.pane) && !tmux::pane_dead(&self.pane).unwrap_or(false)
    }
}

/// An agent that writes its transcript to a file. Read-only.
#[derive(Debug, Clone)]
pub struct FileHost {
    path: PathBuf,
}

impl FileHost {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl HostSession for FileHost {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn visible_text(&self) -> Result<String> {
        let mut file = std::fs::File::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let len = file.metadata()?.len();
        if len > FILE_TAIL_BYTES {
            file.seek(SeekFrom::Start(len - FILE_TAIL_BYTES))?;
        }
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn send_input(&self, _keys: &str, _press_enter: bool) -> Result<()> {
        bail!("{} has no input channel", self.describe())
    }

    fn is_alive(&self) -> bool {
        self.path.is_file()
    }
}

/// Reports whether the target application has focus.
pub trait FocusProbe {
    fn host_window_active(&self) -> bool;
}

/// Used when no window title is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeFocused;

impl FocusProbe for AssumeFocused {
    fn host_window_active(&self) -> bool {
        true
    }
}

/// Compares the active window's title against a configured substring.
#[derive(Debug, Clone)]
pub struct WindowTitleProbe {
    title: String,
    commands: Vec<Vec<String>>,
}

impl WindowTitleProbe {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_lowercase(),
            commands: active_window_commands(),
        }
    }

    #[cfg(test)]
    fn with_commands(title: &str, commands: Vec<Vec<String>>) -> Self {
        Self {
            title: title.to_lowercase(),
            commands,
        }
    }

    fn active_title(&self) -> Option<String> {
        for argv in &self.commands {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            match Command::new(program).args(args).output() {
                Ok(output) if output.status.success() => {
                    return Some(String::from_utf8_lossy(&output.stdout).trim().to_string());
                }
                Ok(output) => debug!(
                    program = %program,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "active window query failed"
                ),
                Err(e) => debug!(program = %program, error = %e, "active window query unavailable"),
            }
        }
        None
    }
}

impl FocusProbe for WindowTitleProbe {
    fn host_window_active(&self) -> bool {
        self.active_title()
            .is_some_and(|t| t.to_lowercase().contains(&self.title))
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn active_window_commands() -> Vec<Vec<String>> {
    match std::env::consts::OS {
        "macos" => vec![argv(&[
            "osascript",
            "-e",
            "tell application \"System Events\" to get name of first application process whose frontmost is true",
        ])],
        "linux" => vec![argv(&["xdotool", "getactivewindow", "getwindowname"])],
        "windows" => vec![argv(&[
            "powershell",
            "-NoProfile",
            "-Command",
            "(Get-Process | Where-Object { $_.MainWindowHandle -eq (Add-Type -MemberDefinition '[DllImport(\"user32.dll\")] public static extern IntPtr GetForegroundWindow();' -Name W -PassThru)::GetForegroundWindow() }).MainWindowTitle",
        ])],
        _ => Vec::new(),
    }
}
