//! Generates scheduler node definitions for the configured fleet.
use std::fmt::Write;

use crate::config::RegionConfig;
use crate::context::FleetContext;
use crate::fleet::catalog::{InstanceCatalog, InstanceTypeInfo, instance_family};
use crate::fleet::hostname::NodeIdentity;

/// Share of instance memory offered to jobs.
const REAL_MEMORY_PERCENT: u64 = 90;

/// One `NodeName=` line per configured instance type and image (and per market when spot
/// nodes are enabled).
///
/// Lower weights are preferred by the scheduler. On-demand nodes are weighted by their core
/// count, spot nodes by their current price in thousandths per hour.
pub async fn generate_node_config(ctx: &FleetContext) -> anyhow::Result<String> {
    let regions: Vec<String> = ctx.config.region_names().map(|name| name.to_string()).collect();
    let catalog = InstanceCatalog::refresh(ctx, &regions).await;

    let mut output = String::new();
    writeln!(output, "# Compute nodes of cluster {}", ctx.config.cluster_name)?;
    for region in &ctx.config.regions {
        for instance_type in &region.instance_types {
            let info = match catalog.get(&region.name, instance_type) {
                Ok(info) => info,
                Err(error) => {
                    log::warn!("Skipping node definitions: {error}");
                    continue;
                }
            };
            for line in node_lines(ctx, region, instance_type, info).await {
                writeln!(output, "{line}")?;
            }
        }
    }
    Ok(output)
}

async fn node_lines(
    ctx: &FleetContext,
    region: &RegionConfig,
    instance_type: &str,
    info: &InstanceTypeInfo,
) -> Vec<String> {
    let Some((_, size)) = instance_type.split_once('.') else {
        return vec![];
    };
    let markets: &[bool] = if ctx.config.spot_enabled {
        &[false, true]
    } else {
        &[false]
    };

    let mut lines = vec![];
    for image in region
        .images
        .iter()
        .filter(|image| image.architecture == info.architecture)
    {
        for &spot in markets {
            let identity = NodeIdentity {
                distribution: image.distribution,
                distribution_version: image.version,
                architecture: info.architecture,
                instance_family: instance_family(instance_type).to_string(),
                instance_size: size.to_string(),
                spot,
                index: 0,
            };
            let weight = if spot {
                spot_weight(ctx, &region.name, instance_type, info).await
            } else {
                info.core_count.into()
            };
            lines.push(format!(
                "NodeName={} CPUs={} RealMemory={} Feature={}{},{},{},{} Weight={} State=CLOUD",
                node_range(&identity, ctx.config.max_nodes_per_instance_type),
                info.core_count * info.threads_per_core,
                info.memory_mib * REAL_MEMORY_PERCENT / 100,
                image.distribution.code(),
                image.version,
                info.architecture,
                instance_type,
                if spot { "spot" } else { "ondemand" },
                weight
            ));
        }
    }
    lines
}

/// `am2-x86-c6i-l-[0-99]`
fn node_range(identity: &NodeIdentity, count: u32) -> String {
    match count {
        0 | 1 => format!("{}0", identity.name_prefix()),
        count => format!("{}[0-{}]", identity.name_prefix(), count - 1),
    }
}

async fn spot_weight(
    ctx: &FleetContext,
    region: &str,
    instance_type: &str,
    info: &InstanceTypeInfo,
) -> u64 {
    let price = ctx
        .retry
        .run("get spot price", || ctx.provider.spot_price(region, instance_type))
        .await;
    match price {
        Ok(Some(price)) => ((price * 1000.0).round() as u64).max(1),
        Ok(None) => info.core_count.into(),
        Err(error) => {
            log::warn!("Cannot get spot price of {instance_type} in {region}: {error:?}");
            info.core_count.into()
        }
    }
}
