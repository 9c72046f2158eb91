use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, about, long_about = None)]
#[command(version(crate::FLEET_VERSION))]
#[command(disable_help_subcommand(true))]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to the cluster configuration file (JSON, YAML or TOML)
    #[arg(
        long,
        global = true,
        env = "SLURM_FLEET_CONFIG",
        default_value = "/etc/slurm-fleet/config.yml"
    )]
    pub config: PathBuf,

    /// Turn on a more detailed log output
    #[arg(long, global = true, env = "SLURM_FLEET_DEBUG")]
    pub debug: bool,

    /// Append the log into this file instead of printing it to stderr
    #[arg(long, global = true, env = "SLURM_FLEET_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Parser)]
pub struct HostlistOpts {
    /// Slurm hostlist expression, e.g. `am2-x86-c6i-l-[0-3]`
    pub hostlist: String,
}

#[derive(Subcommand)]
pub enum SubCommand {
    /// Create or start the given nodes (Slurm `ResumeProgram`)
    Resume(HostlistOpts),
    /// Stop the given nodes, spot nodes are terminated (Slurm `SuspendProgram`)
    #[command(alias = "suspend")]
    Stop(HostlistOpts),
    /// Terminate instances of the given nodes
    Terminate(HostlistOpts),
    /// Clean up nodes that failed to resume (Slurm `ResumeFailProgram`)
    ResumeFail(HostlistOpts),
    /// Observe the whole fleet and terminate outdated stopped instances
    Reconcile,
    /// Publish job, node and license counts of the scheduler
    PublishMetrics,
    /// Print Slurm node definitions for the configured instance types
    NodeConfig,
    /// Print the hostnames of a hostlist expression, one per line
    ExpandHostlist(HostlistOpts),
}
