use clap::Parser;
use std::path::PathBuf;

/// Command-line surface of the worker daemon.
///
/// The daemon takes no subcommands; it connects to the control plane and
/// runs until interrupted. Everything else is environment-driven.
#[derive(Parser, Debug)]
#[command(name = "dockhand")]
#[command(version)]
#[command(about = "Resilient agent worker for conversation-driven coding jobs")]
#[command(long_about = "Dockhand connects to a central control plane over an event socket, \
                       receives conversation jobs, and executes them with an external \
                       AI coding CLI against isolated git worktrees. Jobs survive process \
                       crashes and transport disconnects.")]
pub struct Cli {
    /// Agent CLI adapter to execute conversations with
    #[arg(long, default_value = "claude", help = "Agent adapter: claude, codex")]
    pub agent: String,

    /// Run the agent CLI without permission prompts
    #[arg(
        long,
        help = "Switch the adapter to unrestricted mode; the agent may modify files and run commands without confirmation"
    )]
    pub bypass_permissions: bool,

    /// Model passed through to the agent CLI
    #[arg(long, help = "Model identifier; validated by the selected adapter")]
    pub model: Option<String>,

    /// Path to the git repository to operate on
    #[arg(
        long,
        help = "Explicit repository path; defaults to auto-detection from the working directory"
    )]
    pub repo: Option<PathBuf>,
}
