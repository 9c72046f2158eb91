use clap::Parser;

use slurm_fleet::common::cli::{CommonOpts, HostlistOpts, RootOptions, SubCommand};
use slurm_fleet::common::hostlist::expand_hostlist;
use slurm_fleet::common::setup::setup_logging;
use slurm_fleet::config::ClusterConfig;
use slurm_fleet::context::{FleetContext, run_entry_point};
use slurm_fleet::fleet::engine::{Verb, reconcile, run_verb};
use slurm_fleet::nodeconf::generate_node_config;
use slurm_fleet::telemetry::publish::publish_scheduler_metrics;

async fn load_context(common: &CommonOpts) -> anyhow::Result<FleetContext> {
    let config = ClusterConfig::load(&common.config)?;
    Ok(FleetContext::from_config(config).await)
}

async fn command_verb(ctx: &FleetContext, verb: Verb, opts: HostlistOpts) -> anyhow::Result<()> {
    let hostnames = expand_hostlist(&opts.hostlist)?;
    run_verb(ctx, verb, &hostnames).await?;
    Ok(())
}

async fn command_reconcile(ctx: &FleetContext) -> anyhow::Result<()> {
    reconcile(ctx).await?;
    Ok(())
}

async fn command_node_config(ctx: &FleetContext) -> anyhow::Result<()> {
    let config = generate_node_config(ctx).await?;
    print!("{config}");
    Ok(())
}

fn command_expand_hostlist(opts: HostlistOpts) -> anyhow::Result<()> {
    for hostname in expand_hostlist(&opts.hostlist)? {
        println!("{hostname}");
    }
    Ok(())
}

async fn run(opts: RootOptions) -> anyhow::Result<()> {
    let RootOptions { common, subcmd } = opts;
    let (verb, opts) = match subcmd {
        SubCommand::Resume(opts) => (Verb::Resume, opts),
        SubCommand::Stop(opts) => (Verb::Stop, opts),
        SubCommand::Terminate(opts) => (Verb::Terminate, opts),
        SubCommand::ResumeFail(opts) => (Verb::ResumeFail, opts),
        SubCommand::Reconcile => {
            let ctx = load_context(&common).await?;
            return run_entry_point(&ctx, "reconcile", command_reconcile(&ctx)).await;
        }
        SubCommand::PublishMetrics => {
            let ctx = load_context(&common).await?;
            return run_entry_point(&ctx, "publish_metrics", publish_scheduler_metrics(&ctx))
                .await;
        }
        SubCommand::NodeConfig => {
            let ctx = load_context(&common).await?;
            return run_entry_point(&ctx, "node_config", command_node_config(&ctx)).await;
        }
        SubCommand::ExpandHostlist(opts) => return command_expand_hostlist(opts),
    };
    let ctx = load_context(&common).await?;
    run_entry_point(&ctx, verb.name(), command_verb(&ctx, verb, opts)).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opts = RootOptions::parse();
    if let Err(error) = setup_logging(opts.common.debug, opts.common.log_file.as_deref()) {
        eprintln!("{error:?}");
        std::process::exit(1);
    }

    if let Err(error) = run(opts).await {
        log::error!("{error:?}");
        std::process::exit(1);
    }
}
