//! # Draft Harness CLI (`draft`)
//!
//! ## Usage
//!
//! ```bash
//! draft --config ./config/draft.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `draft analyze <file>` | Print the structure of a text file |
//! | `draft rules` | List configured rules with their trigger and delay |
//! | `draft run <file>` | Run every enabled rule (or one with `--rule`) once |
//! | `draft watch <file>` | Re-analyze the file on every change until Ctrl-C |
//! | `draft associations show` | Print the saved association table |
//! | `draft associations clear` | Empty the saved association table |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `warn`), e.g. `RUST_LOG=draft_harness=debug draft watch notes.md`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use draft_harness::commands;
use draft_harness::config;
use draft_harness::report::ReportMode;

/// Draft Harness CLI: structure analysis and scheduled AI feedback for
/// text you are writing.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/draft.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "draft",
    about = "Draft Harness: incremental structure analysis and scheduled AI feedback for writing",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/draft.toml`. A missing file means built-in
    /// defaults and no rules.
    #[arg(long, global = true, default_value = "./config/draft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the paragraph/sentence/word structure of a file.
    Analyze {
        file: PathBuf,

        /// Print the full snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List configured rules.
    Rules,

    /// Run rules once against a file and print their feedback.
    ///
    /// Failing rules are reported but do not fail the command.
    Run {
        file: PathBuf,

        /// Run only this rule (enabled or not).
        #[arg(long)]
        rule: Option<String>,
    },

    /// Watch a file and run rules as it changes.
    ///
    /// The association table is saved to the configured store on Ctrl-C.
    Watch {
        file: PathBuf,

        /// Polling interval in milliseconds.
        #[arg(long, default_value_t = 250)]
        poll_ms: u64,

        /// Event output on stderr.
        #[arg(long, value_enum, default_value = "human")]
        report: ReportMode,
    },

    /// Inspect or reset the saved association table.
    Associations {
        #[command(subcommand)]
        action: AssociationsAction,
    },
}

#[derive(Subcommand)]
enum AssociationsAction {
    /// Print every saved association and its visible feedback.
    Show,
    /// Replace the saved table with an empty one.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Analyze { file, json } => {
            commands::run_analyze(&cfg, &file, json)?;
        }
        Commands::Rules => {
            commands::list_rules(&cfg)?;
        }
        Commands::Run { file, rule } => {
            commands::run_rules(&cfg, &file, rule.as_deref()).await?;
        }
        Commands::Watch {
            file,
            poll_ms,
            report,
        } => {
            commands::run_watch(&cfg, &file, poll_ms, report).await?;
        }
        Commands::Associations { action } => match action {
            AssociationsAction::Show => commands::show_associations(&cfg)?,
            AssociationsAction::Clear => commands::clear_associations(&cfg)?,
        },
    }

    Ok(())
}
