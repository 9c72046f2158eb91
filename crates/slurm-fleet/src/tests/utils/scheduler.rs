use crate::scheduler::{LicenseUsage, NodeStatus, SchedulerControl, SchedulerFuture};
use crate::{Map, Set, WrappedRcRefCell};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCall {
    Drain(Vec<String>, String),
    Requeue(String),
    MarkDown(String, String),
    PowerDown(String),
}

#[derive(Default)]
pub struct SchedulerState {
    pub calls: Vec<SchedulerCall>,
    pub nodes: Vec<NodeStatus>,
    /// Ids of jobs running on each node.
    pub running_jobs: Map<String, Vec<String>>,
    pub job_states: Vec<String>,
    pub licenses: Vec<LicenseUsage>,
    /// Operations that fail: `drain`, `requeue`, `down`, `power_down`, `nodes`, `jobs`
    /// or `licenses`.
    pub failing_steps: Set<&'static str>,
}

impl SchedulerState {
    fn check(&self, step: &str) -> anyhow::Result<()> {
        if self.failing_steps.contains(step) {
            anyhow::bail!("scheduler command `{step}` failed");
        }
        Ok(())
    }
}

fn ready<T: 'static>(result: anyhow::Result<T>) -> SchedulerFuture<T> {
    Box::pin(futures::future::ready(result))
}

/// Scheduler that records every change of node state.
pub struct FakeScheduler {
    state: WrappedRcRefCell<SchedulerState>,
}

impl FakeScheduler {
    pub fn new(state: WrappedRcRefCell<SchedulerState>) -> Self {
        Self { state }
    }
}

impl SchedulerControl for FakeScheduler {
    fn drain(&self, hostnames: &[String], reason: &str) -> SchedulerFuture<()> {
        let mut state = self.state.get_mut();
        state
            .calls
            .push(SchedulerCall::Drain(hostnames.to_vec(), reason.to_string()));
        ready(state.check("drain"))
    }

    fn requeue_jobs(&self, hostname: &str, _reason: &str) -> SchedulerFuture<Vec<String>> {
        let mut state = self.state.get_mut();
        state.calls.push(SchedulerCall::Requeue(hostname.to_string()));
        let result = state.check("requeue").map(|_| {
            state
                .running_jobs
                .remove(hostname)
                .unwrap_or_default()
        });
        ready(result)
    }

    fn mark_down(&self, hostname: &str, reason: &str) -> SchedulerFuture<()> {
        let mut state = self.state.get_mut();
        state.calls.push(SchedulerCall::MarkDown(
            hostname.to_string(),
            reason.to_string(),
        ));
        ready(state.check("down"))
    }

    fn power_down(&self, hostname: &str, _reason: &str) -> SchedulerFuture<()> {
        let mut state = self.state.get_mut();
        state
            .calls
            .push(SchedulerCall::PowerDown(hostname.to_string()));
        ready(state.check("power_down"))
    }

    fn node_states(&self) -> SchedulerFuture<Vec<NodeStatus>> {
        let state = self.state.get();
        ready(state.check("nodes").map(|_| state.nodes.clone()))
    }

    fn job_states(&self) -> SchedulerFuture<Vec<String>> {
        let state = self.state.get();
        ready(state.check("jobs").map(|_| state.job_states.clone()))
    }

    fn licenses(&self) -> SchedulerFuture<Vec<LicenseUsage>> {
        let state = self.state.get();
        ready(state.check("licenses").map(|_| state.licenses.clone()))
    }
}
