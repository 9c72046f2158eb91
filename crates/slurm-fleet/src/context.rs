use std::future::Future;

use chrono::{DateTime, Utc};

use crate::config::ClusterConfig;
use crate::fleet::retry::RetryPolicy;
use crate::provider::ComputeProvider;
use crate::provider::ec2::Ec2Provider;
use crate::scheduler::SchedulerControl;
use crate::scheduler::slurm::SlurmControl;
use crate::telemetry::{EmfFileSink, LogSink, MetricsEmitter, MetricsSink, names};

/// Everything an invocation needs, constructed once at startup and passed by reference.
pub struct FleetContext {
    pub config: ClusterConfig,
    pub provider: Box<dyn ComputeProvider>,
    pub scheduler: Box<dyn SchedulerControl>,
    pub metrics: MetricsEmitter,
    pub retry: RetryPolicy,
    /// Reference time of the invocation, used for instance age checks.
    pub now: DateTime<Utc>,
}

impl FleetContext {
    pub fn new(
        config: ClusterConfig,
        provider: Box<dyn ComputeProvider>,
        scheduler: Box<dyn SchedulerControl>,
        sink: Box<dyn MetricsSink>,
    ) -> Self {
        let metrics = MetricsEmitter::new(
            config.metrics.namespace.clone(),
            config.cluster_name.clone(),
            sink,
        );
        let retry = RetryPolicy::new(&config.retry);
        Self {
            config,
            provider,
            scheduler,
            metrics,
            retry,
            now: Utc::now(),
        }
    }

    /// Context backed by the EC2 API and the Slurm commands.
    pub async fn from_config(config: ClusterConfig) -> Self {
        let provider = Box::new(Ec2Provider::connect(&config.provider, &config.regions).await);
        let scheduler = Box::new(SlurmControl::new(config.scheduler.bin_dir.clone()));
        let sink: Box<dyn MetricsSink> = match &config.metrics.emf_log_file {
            Some(path) => Box::new(EmfFileSink::new(path.clone())),
            None => Box::new(LogSink),
        };
        Self::new(config, provider, scheduler, sink)
    }
}

/// Runs a top-level entry point. Its failure is logged and counted before it is returned.
pub async fn run_entry_point<T, Fut>(
    ctx: &FleetContext,
    entry_point: &str,
    future: Fut,
) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    let result = future.await;
    if let Err(error) = &result {
        log::error!("Unhandled error in {entry_point}: {error:?}");
        ctx.metrics
            .count(names::UNHANDLED_EXCEPTION, &[("EntryPoint", entry_point)]);
    }
    result
}
