use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "keepgoing",
    about = "Keeps coding agents running past their continuation prompts",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch an agent and continue it whenever it stops to ask
    Watch {
        /// tmux target (session, window, or pane) running the agent
        #[arg(long, conflicts_with = "file")]
        pane: Option<String>,

        /// Transcript file the agent writes to (read-only host)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Never use screen capture and clicking
        #[arg(long)]
        no_visual: bool,

        /// Write activity lines to this file instead of stderr
        #[arg(long)]
        activity_log: Option<PathBuf>,
    },

    /// Check text for a continuation prompt (exit 1 if none)
    Check {
        /// File to check; reads stdin when omitted
        file: Option<PathBuf>,
    },

    /// Capture the screen once and look for a continue control
    Ocr {
        /// Click the control if one is found
        #[arg(long)]
        click: bool,

        /// Keep the screenshot and print its path
        #[arg(long)]
        keep_image: bool,
    },

    /// Click at screen coordinates
    Click {
        x: i32,
        y: i32,
    },

    /// Check platform tools needed for each tier
    Doctor,

    /// Show effective configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long)]
        json: bool,
    },
}
