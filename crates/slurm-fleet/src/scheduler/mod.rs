//! Control surface of the batch scheduler that owns the compute nodes.
pub mod slurm;

use std::future::Future;
use std::pin::Pin;

pub type SchedulerFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>>>>;

/// State of a single scheduler node, as listed by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub name: String,
    /// Base state without flag suffixes, e.g. `idle` or `down`.
    pub state: String,
    /// The node is powered down (it has no backing instance).
    pub powered_down: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseUsage {
    pub name: String,
    pub total: u64,
    pub used: u64,
}

/// Handler that can change the state of scheduler nodes and query scheduler statistics.
///
/// Methods return boxed futures that own their inputs.
pub trait SchedulerControl {
    /// Prevent new jobs from being scheduled onto the given nodes.
    fn drain(&self, hostnames: &[String], reason: &str) -> SchedulerFuture<()>;

    /// Requeue jobs that are running on the node. Returns the ids of the requeued jobs.
    fn requeue_jobs(&self, hostname: &str, reason: &str) -> SchedulerFuture<Vec<String>>;

    fn mark_down(&self, hostname: &str, reason: &str) -> SchedulerFuture<()>;

    /// Ask the scheduler to power down the node, which resets it to the cloud (powered down) state.
    fn power_down(&self, hostname: &str, reason: &str) -> SchedulerFuture<()>;

    fn node_states(&self) -> SchedulerFuture<Vec<NodeStatus>>;

    /// State of every job known to the scheduler.
    fn job_states(&self) -> SchedulerFuture<Vec<String>>;

    fn licenses(&self) -> SchedulerFuture<Vec<LicenseUsage>>;
}
