use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use plinth_deploy::MANIFEST_FILENAME;
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "plinth")]
#[command(
    author,
    version,
    about = "Deploy interdependent smart contracts in dependency order, exactly once"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "PLINTH_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the manifest, or to a directory containing a Plinth.toml.
    #[arg(short, long, global = true, alias = "conf", env = "PLINTH_CONFIG", default_value = MANIFEST_FILENAME)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy every contract of the manifest that is not yet recorded for the network.
    Deploy(DeployArgs),

    /// Print the deployment order without touching the chain.
    Plan,

    /// Print the deployments recorded for the configured network, and the journaled ones that
    /// are not recorded yet.
    Status {
        #[arg(short, long, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// Drop the journaled deployment of a contract.
    ///
    /// Use this after checking on-chain that the journaled deployment will never confirm, or
    /// that its contract should not be adopted.
    ForgetPending {
        /// Name of the contract.
        name: String,
    },
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Blocks required on top of the inclusion block. Overrides the manifest.
    #[arg(long, env = "PLINTH_CONFIRMATION_DEPTH")]
    pub confirmation_depth: Option<u64>,

    /// Maximum wait for a single confirmation, in milliseconds. Overrides the manifest.
    #[arg(long, alias = "timeout", env = "PLINTH_CONFIRMATION_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    #[arg(short, long, default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,
}
