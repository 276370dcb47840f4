use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use indexdeck_core::ResetKind;

#[derive(Parser, Debug)]
#[command(name = "indexdeck")]
#[command(about = "Drive and inspect content-indexing jobs")]
pub struct Cli {
    /// JSON fixture to seed the simulated index service (built-in sample if omitted)
    #[arg(long, global = true)]
    pub fixture: Option<PathBuf>,

    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Simulated work per item, in milliseconds
    #[arg(long, global = true, default_value_t = 50)]
    pub item_delay_ms: u64,

    /// Log filter directives, e.g. `indexdeck_core=debug`
    #[arg(long, global = true, default_value = "indexdeck_core=info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Index every pending resource: text batch first, then multimodal
    Run,
    /// Show the reconciled index status
    Status,
    /// Print the diagnostic report and the embedding dimension table
    Diagnose,
    /// Reset index state
    Reset {
        #[arg(value_enum)]
        scope: ResetScope,
    },
    /// Toggle text indexing on or off for a resource
    Toggle { resource_id: String },
    /// Re-index one resource's text
    Reindex { resource_id: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Every resource back to pending
    All,
    /// Disabled resources back to pending
    Disabled,
    /// Indexed resources without stored chunks back to pending
    NoEmbeddings,
}

impl From<ResetScope> for ResetKind {
    fn from(scope: ResetScope) -> Self {
        match scope {
            ResetScope::All => ResetKind::All,
            ResetScope::Disabled => ResetKind::Disabled,
            ResetScope::NoEmbeddings => ResetKind::NoEmbeddings,
        }
    }
}
