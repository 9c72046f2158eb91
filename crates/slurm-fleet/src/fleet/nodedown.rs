use crate::Set;
use crate::context::FleetContext;
use crate::fleet::hostname::decode_hostname;
use crate::telemetry::names;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The provider has no capacity for the instance type of the host.
    Capacity { instance_type: String },
    Other,
}

/// Takes failed hosts out of the scheduler.
///
/// Every step is attempted even when a previous one fails. Failures are logged and counted,
/// never returned.
#[derive(Default)]
pub struct NodeDownHandler {
    /// Instance types whose powered down nodes were already drained in this invocation.
    drained_instance_types: Set<String>,
    marked_down: Vec<(String, String)>,
}

impl NodeDownHandler {
    pub fn into_marked_down(self) -> Vec<(String, String)> {
        self.marked_down
    }

    pub async fn mark_node_down(
        &mut self,
        ctx: &FleetContext,
        hostname: &str,
        reason: &str,
        kind: FailureKind,
    ) {
        log::warn!("Marking node {hostname} down: {reason}");
        let scheduler = ctx.scheduler.as_ref();
        let hostnames = [hostname.to_string()];

        let step_failed = |step: &str, error: anyhow::Error| {
            log::error!("Cannot {step} node {hostname}: {error:?}");
            ctx.metrics
                .count(names::MARK_NODE_DOWN_FAILED, &[("Step", step)]);
        };

        if let Err(error) = scheduler.drain(&hostnames, reason).await {
            step_failed("drain", error);
        }
        if let FailureKind::Capacity { instance_type } = &kind {
            if self.drained_instance_types.insert(instance_type.clone()) {
                if let Err(error) = self
                    .drain_powered_down_siblings(ctx, hostname, instance_type, reason)
                    .await
                {
                    step_failed("drain siblings of", error);
                }
            }
        }
        match scheduler.requeue_jobs(hostname, reason).await {
            Ok(jobs) if !jobs.is_empty() => {
                log::info!("Requeued jobs {} of node {hostname}", jobs.join(","))
            }
            Ok(_) => {}
            Err(error) => step_failed("requeue jobs of", error),
        }
        if let Err(error) = scheduler.mark_down(hostname, reason).await {
            step_failed("mark down", error);
        }
        if let Err(error) = scheduler.power_down(hostname, reason).await {
            step_failed("power down", error);
        }

        ctx.metrics.count(names::MARK_NODE_DOWN, &[]);
        self.marked_down
            .push((hostname.to_string(), reason.to_string()));
    }

    /// Drains powered down nodes of the same instance type, so the scheduler does not
    /// immediately try to resume them into the same exhausted capacity pool.
    async fn drain_powered_down_siblings(
        &self,
        ctx: &FleetContext,
        hostname: &str,
        instance_type: &str,
        reason: &str,
    ) -> anyhow::Result<()> {
        let siblings: Vec<String> = ctx
            .scheduler
            .node_states()
            .await?
            .into_iter()
            .filter(|node| node.powered_down && node.name != hostname)
            .filter(|node| {
                decode_hostname(&node.name)
                    .map(|identity| identity.instance_type() == instance_type)
                    .unwrap_or(false)
            })
            .map(|node| node.name)
            .collect();
        if siblings.is_empty() {
            return Ok(());
        }
        log::info!(
            "Draining {} powered down nodes of instance type {instance_type}",
            siblings.len()
        );
        ctx.scheduler.drain(&siblings, reason).await
    }
}
