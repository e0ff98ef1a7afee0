use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "polychat", about = "Chat with several models side by side")]
pub struct Cli {
    /// Path to settings.json (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides the configured API base URL
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Disables ANSI colors
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Logs request activity to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Interactive chat with every configured model (default)
    Chat {
        /// Forward each reply to the other selected models
        #[arg(long)]
        forward: bool,

        /// Skip loading previous messages at startup
        #[arg(long)]
        no_history: bool,
    },
    /// List the kins available for the configured blueprint
    Kins,
    /// One-time setup of kins on the remote API
    Provision {
        #[command(subcommand)]
        action: ProvisionCommand,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum ProvisionCommand {
    /// Create a kin for each model (defaults to every configured model)
    CreateKins { kins: Vec<String> },
    /// Link kins to their source repositories
    LinkRepo {
        kins: Vec<String>,

        /// Repository URL template, `{model}` is replaced by the kin id
        #[arg(long)]
        template: Option<String>,

        /// Seconds to wait between kins
        #[arg(long, default_value = "5")]
        pause_secs: u64,
    },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Chat {
            forward: false,
            no_history: false,
        })
    }

    /// Chat keeps stderr quiet unless asked; one-shot commands report progress.
    pub fn log_level(&self) -> tracing::Level {
        match (self.verbose, self.command()) {
            (true, _) | (false, Command::Provision { .. }) => tracing::Level::INFO,
            (false, _) => tracing::Level::WARN,
        }
    }
}
