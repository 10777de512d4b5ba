use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ambassadord",
    version,
    about = "MCP Ambassador: a single proxy identity between AI host tools and a fleet of backend MCP servers"
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/ambassador.yaml")]
    pub config: PathBuf,

    /// Overrides `data_dir` from the config file and `MCP_AMBASSADOR_DATA_DIR`.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Boot the HTTP surface and run until a shutdown signal arrives (default).
    Serve,
    /// One-shot audit maintenance.
    Audit {
        #[command(subcommand)]
        action: AuditCommand,
    },
    /// One-shot session maintenance.
    Session {
        #[command(subcommand)]
        action: SessionCommand,
    },
}

#[derive(Subcommand)]
pub enum AuditCommand {
    /// Delete audit log files older than the configured retention window.
    Prune,
}

#[derive(Subcommand)]
pub enum SessionCommand {
    /// Replace the session-token HMAC secret, invalidating every
    /// outstanding session token immediately.
    RotateSecret,
}
