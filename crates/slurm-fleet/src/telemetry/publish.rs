//! Scheduler statistics published as metrics.
use anyhow::Context;
use itertools::Itertools;

use crate::context::FleetContext;
use crate::telemetry::names;

/// Publishes job counts per state, node counts per state and license usage.
///
/// All three queries are attempted. The call fails if any of them failed.
pub async fn publish_scheduler_metrics(ctx: &FleetContext) -> anyhow::Result<()> {
    let scheduler = ctx.scheduler.as_ref();
    let mut failed = vec![];

    match scheduler.job_states().await.context("Cannot list jobs") {
        Ok(states) => {
            for (state, count) in states.iter().map(|s| s.as_str()).counts().into_iter().sorted() {
                ctx.metrics
                    .emit(names::JOB_COUNT, count as f64, &[("State", state)]);
            }
        }
        Err(error) => failed.push(error),
    }

    match scheduler.node_states().await.context("Cannot list nodes") {
        Ok(nodes) => {
            let counts = nodes.iter().map(|node| node.state.as_str()).counts();
            for (state, count) in counts.into_iter().sorted() {
                ctx.metrics
                    .emit(names::SCHEDULER_NODE_COUNT, count as f64, &[("State", state)]);
            }
        }
        Err(error) => failed.push(error),
    }

    match scheduler.licenses().await.context("Cannot list licenses") {
        Ok(licenses) => {
            for license in licenses {
                let dimensions = [("License", license.name.as_str())];
                ctx.metrics
                    .emit(names::LICENSES_TOTAL, license.total as f64, &dimensions);
                ctx.metrics
                    .emit(names::LICENSES_USED, license.used as f64, &dimensions);
            }
        }
        Err(error) => failed.push(error),
    }

    for error in &failed {
        log::error!("{error:?}");
    }
    match failed.into_iter().next() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
