//! Thin wrappers over the tmux CLI for the watched agent pane.
//!
//! keepgoing never owns the agent's session; it only reads what the pane
//! shows (`capture-pane`) and types into it (`send-keys`).

use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Check that tmux is installed and reachable. Returns the version line.
pub fn check_tmux() -> Result<String> {
    let output = Command::new("tmux").arg("-V").output().context(
        "tmux not found — install tmux (e.g., `apt install tmux` or `brew install tmux`)",
    )?;

    if !output.status.success() {
        bail!(
            "tmux -V failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(version = %version, "tmux found");
    Ok(version)
}

/// Parse `tmux 3.3a` into `(3, 3)`.
pub fn parse_tmux_version(version_raw: &str) -> Option<(u32, u32)> {
    let ver = version_raw.trim().strip_prefix("tmux ")?;
    let (major, rest) = ver.split_once('.')?;
    let minor: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn run_tmux<I, S>(args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    Command::new("tmux")
        .args(args)
        .output()
        .context("failed to run tmux command")
}

/// Check if a pane target exists.
pub fn pane_exists(target: &str) -> bool {
    run_tmux(["display-message", "-p", "-t", target, "#{pane_id}"])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check whether a pane target is dead (`remain-on-exit` pane).
pub fn pane_dead(target: &str) -> Result<bool> {
    let output = run_tmux(["display-message", "-p", "-t", target, "#{pane_dead}"])
        .with_context(|| format!("failed to query pane_dead for target '{target}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tmux display-message pane_dead failed: {stderr}");
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim() == "1")
}

/// Resolve a session or window target to a stable pane id (for example `%3`).
pub fn pane_id(target: &str) -> Result<String> {
    let output = run_tmux(["display-message", "-p", "-t", target, "#{pane_id}"])
        .with_context(|| format!("failed to resolve pane id for target '{target}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tmux display-message failed: {stderr}");
    }

    let pane = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if pane.is_empty() {
        bail!("tmux returned empty pane id for target '{target}'");
    }
    Ok(pane)
}

/// Capture the text currently visible in a pane.
pub fn capture_pane(target: &str) -> Result<String> {
    let output = run_tmux(["capture-pane", "-t", target, "-p"])
        .with_context(|| format!("failed to capture pane for target '{target}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tmux capture-pane failed: {stderr}");
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Type `keys` into a pane, followed by Enter if `press_enter` is true.
///
/// Text is sent with `-l` so punctuation is never read as a tmux key name.
pub fn send_keys(target: &str, keys: &str, press_enter: bool) -> Result<()> {
    if !keys.is_empty() {
        let output = run_tmux(["send-keys", "-t", target, "-l", "--", keys])
            .with_context(|| format!("failed to send keys to target '{target}'"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux send-keys failed: {stderr}");
        }
    }

    if press_enter {
        let output = run_tmux(["send-keys", "-t", target, "C-m"])
            .with_context(|| format!("failed to send Enter to target '{target}'"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux send-keys Enter failed: {stderr}");
        }
    }

    debug!(target = target, keys = keys, press_enter, "sent keys");
    Ok(())
}
