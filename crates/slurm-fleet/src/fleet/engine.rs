//! Decides and performs the provider actions of one scheduler callback.
use std::collections::BTreeMap;

use chrono::TimeDelta;
use futures::future::join_all;
use itertools::Itertools;
use thiserror::Error;

use crate::context::FleetContext;
use crate::fleet::catalog::{InstanceCatalog, UnknownInstanceTypeError};
use crate::fleet::hostname::Architecture;
use crate::fleet::nodedown::{FailureKind, NodeDownHandler};
use crate::fleet::reconcile::{FleetView, HostInfo, HostState, ObservedInstance, collect};
use crate::provider::{
    ComputeProvider, INSUFFICIENT_CAPACITY_CODE, Instance, InstanceFilter, InstanceState,
    LaunchRequest, MarketType, ProviderError, ProviderFuture, ProviderResult,
    describe_all_instances,
};
use crate::telemetry::names;
use crate::{HOSTNAME_TAG, Map, Set};

const DUPLICATE_REASON: &str = "Multiple instances are bound to the node";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Resume,
    Stop,
    Terminate,
    ResumeFail,
}

impl Verb {
    pub fn name(&self) -> &'static str {
        match self {
            Verb::Resume => "resume",
            Verb::Stop => "stop",
            Verb::Terminate => "terminate",
            Verb::ResumeFail => "resume_fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAction {
    Nothing,
    Create,
    Start,
    /// Wait until the instance is stopped, then start it.
    WaitThenStart,
    Stop,
    Terminate,
    /// Replace the bound instance, which runs an outdated image.
    TerminateAndCreate,
    MarkDown(&'static str),
}

pub fn plan_action(verb: Verb, host: &HostInfo) -> HostAction {
    if host.state == HostState::Duplicate {
        return HostAction::MarkDown(DUPLICATE_REASON);
    }
    let drifted = host.is_image_drifted();
    match verb {
        Verb::Resume => match host.state {
            HostState::None => HostAction::Create,
            _ if drifted => HostAction::TerminateAndCreate,
            HostState::Pending | HostState::Running => HostAction::Nothing,
            HostState::Stopping => HostAction::WaitThenStart,
            HostState::Stopped => HostAction::Start,
            HostState::Duplicate => HostAction::MarkDown(DUPLICATE_REASON),
        },
        Verb::Stop => match host.state {
            // Spot instances cannot be stopped.
            HostState::Running if host.identity.spot || drifted => HostAction::Terminate,
            HostState::Running => HostAction::Stop,
            _ => HostAction::Nothing,
        },
        Verb::Terminate => match host.state {
            HostState::None => HostAction::Nothing,
            _ => HostAction::Terminate,
        },
        Verb::ResumeFail => match host.state {
            HostState::Pending => HostAction::Terminate,
            _ => HostAction::Nothing,
        },
    }
}

/// Outcome of an invocation. Hosts are identified by their hostnames.
#[derive(Debug, Default)]
pub struct InvocationReport {
    /// Hostnames and ids of newly created instances.
    pub created: Vec<(String, String)>,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub terminated: Vec<String>,
    /// Hostnames and reasons.
    pub marked_down: Vec<(String, String)>,
    /// Ids of old stopped instances terminated by the sweep.
    pub swept: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum BulkOperation {
    Start,
    Stop,
    Terminate,
}

impl BulkOperation {
    fn description(&self) -> &'static str {
        match self {
            BulkOperation::Start => "start instances",
            BulkOperation::Stop => "stop instances",
            BulkOperation::Terminate => "terminate instances",
        }
    }

    fn metric(&self) -> &'static str {
        match self {
            BulkOperation::Start => names::START_INSTANCES,
            BulkOperation::Stop => names::STOP_INSTANCES,
            BulkOperation::Terminate => names::TERMINATE_INSTANCES,
        }
    }

    fn failed_metric(&self) -> &'static str {
        match self {
            BulkOperation::Start => names::START_INSTANCES_FAILED,
            BulkOperation::Stop => names::STOP_INSTANCES_FAILED,
            BulkOperation::Terminate => names::TERMINATE_INSTANCES_FAILED,
        }
    }

    /// The instance is still in a state the operation should have moved it out of.
    fn is_pre_action_state(&self, state: InstanceState) -> bool {
        match self {
            BulkOperation::Start => state == InstanceState::Stopped,
            BulkOperation::Stop => matches!(state, InstanceState::Running | InstanceState::Pending),
            BulkOperation::Terminate => state.is_alive(),
        }
    }

    fn issue(
        &self,
        provider: &dyn ComputeProvider,
        region: &str,
        instance_ids: &[String],
    ) -> ProviderFuture<()> {
        match self {
            BulkOperation::Start => provider.start_instances(region, instance_ids),
            BulkOperation::Stop => provider.stop_instances(region, instance_ids),
            BulkOperation::Terminate => provider.terminate_instances(region, instance_ids),
        }
    }
}

#[derive(Debug, Error)]
enum CreateError {
    #[error("no image is configured for {0}")]
    NoImage(String),
    #[error(transparent)]
    UnknownInstanceType(#[from] UnknownInstanceTypeError),
    #[error("instance type {instance_type} is not an {architecture} instance type")]
    ArchitectureMismatch {
        instance_type: String,
        architecture: Architecture,
    },
    #[error("insufficient capacity in every subnet: {0}")]
    Capacity(ProviderError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Default)]
struct RegionPlan<'h> {
    terminate: Vec<&'h HostInfo>,
    stop: Vec<&'h HostInfo>,
    start: Vec<&'h HostInfo>,
    wait_then_start: Vec<&'h HostInfo>,
}

struct Invocation<'a> {
    ctx: &'a FleetContext,
    node_down: NodeDownHandler,
    report: InvocationReport,
    /// Instances that received an action in this invocation.
    touched: Set<String>,
}

/// Brings the given hosts into the state requested by the verb.
pub async fn run_verb(
    ctx: &FleetContext,
    verb: Verb,
    hostnames: &[String],
) -> anyhow::Result<InvocationReport> {
    log::info!("Running {} of {} node(s)", verb.name(), hostnames.len());
    let view = collect(ctx, hostnames).await?;
    let mut invocation = Invocation::new(ctx);

    for error in &view.invalid {
        log::error!("{error}");
        ctx.metrics.count(names::INVALID_HOSTNAME, &[]);
        invocation
            .node_down
            .mark_node_down(ctx, &error.hostname, "Invalid hostname", FailureKind::Other)
            .await;
    }

    let mut plans: BTreeMap<&str, RegionPlan> = BTreeMap::new();
    let mut creates: Vec<&HostInfo> = vec![];
    let mut recreates: Set<&str> = Set::new();
    for host in &view.hosts {
        let action = plan_action(verb, host);
        log::debug!(
            "Node {} is {:?} with instance {:?}: {:?}",
            host.hostname,
            host.state,
            host.instance_id(),
            action
        );
        let plan = plans.entry(host.region.as_str()).or_default();
        match action {
            HostAction::Nothing => {}
            HostAction::Create => creates.push(host),
            HostAction::Start => plan.start.push(host),
            HostAction::WaitThenStart => plan.wait_then_start.push(host),
            HostAction::Stop => plan.stop.push(host),
            HostAction::Terminate => plan.terminate.push(host),
            HostAction::TerminateAndCreate => {
                log::info!(
                    "Node {} runs image {:?} instead of {:?}, replacing its instance",
                    host.hostname,
                    host.current_image(),
                    host.expected_image
                );
                plan.terminate.push(host);
                recreates.insert(host.hostname.as_str());
            }
            HostAction::MarkDown(reason) => {
                ctx.metrics.count(names::DUPLICATE_INSTANCE, &[]);
                invocation
                    .node_down
                    .mark_node_down(ctx, &host.hostname, reason, FailureKind::Other)
                    .await;
            }
        }
    }

    for (region, plan) in plans {
        let terminated = invocation
            .run_bulk(region, BulkOperation::Terminate, plan.terminate)
            .await;
        for host in terminated {
            invocation.report.terminated.push(host.hostname.clone());
            if recreates.contains(host.hostname.as_str()) {
                creates.push(host);
            }
        }

        let stopped = invocation
            .run_bulk(region, BulkOperation::Stop, plan.stop)
            .await;
        invocation
            .report
            .stopped
            .extend(stopped.into_iter().map(|host| host.hostname.clone()));

        let mut start = plan.start;
        start.extend(
            invocation
                .wait_for_stopped(region, plan.wait_then_start)
                .await,
        );
        let started = invocation
            .run_bulk(region, BulkOperation::Start, start)
            .await;
        invocation
            .report
            .started
            .extend(started.into_iter().map(|host| host.hostname.clone()));
    }

    if !creates.is_empty() {
        let regions: Vec<String> = creates
            .iter()
            .map(|host| host.region.clone())
            .unique()
            .collect();
        let catalog = InstanceCatalog::refresh(ctx, &regions).await;
        invocation.create_all(creates, &catalog).await;
    }

    if verb != Verb::ResumeFail {
        invocation.sweep(&view).await;
    }
    Ok(invocation.finish())
}

/// Observes the whole fleet and terminates outdated stopped instances.
pub async fn reconcile(ctx: &FleetContext) -> anyhow::Result<InvocationReport> {
    let view = collect(ctx, &[]).await?;
    let mut invocation = Invocation::new(ctx);
    invocation.sweep(&view).await;
    Ok(invocation.finish())
}

impl<'a> Invocation<'a> {
    fn new(ctx: &'a FleetContext) -> Self {
        Self {
            ctx,
            node_down: NodeDownHandler::default(),
            report: InvocationReport::default(),
            touched: Set::new(),
        }
    }

    fn finish(self) -> InvocationReport {
        let mut report = self.report;
        report.marked_down = self.node_down.into_marked_down();
        log::info!(
            "Created {}, started {}, stopped {}, terminated {}, marked down {} node(s), terminated {} old instance(s)",
            report.created.len(),
            report.started.len(),
            report.stopped.len(),
            report.terminated.len(),
            report.marked_down.len(),
            report.swept.len()
        );
        report
    }

    /// Applies the operation in chunks and returns the hosts for which it succeeded.
    async fn run_bulk<'h>(
        &mut self,
        region: &str,
        operation: BulkOperation,
        hosts: Vec<&'h HostInfo>,
    ) -> Vec<&'h HostInfo> {
        let ctx = self.ctx;
        let mut succeeded = Vec::with_capacity(hosts.len());
        for chunk in hosts.chunks(ctx.config.max_instances_per_call) {
            let instance_ids: Vec<String> = chunk
                .iter()
                .filter_map(|host| host.instance_id().map(|id| id.to_string()))
                .collect();
            self.touched.extend(instance_ids.iter().cloned());
            log::info!(
                "Calling {} in {region} for {}",
                operation.description(),
                instance_ids.join(", ")
            );

            let mut error = match self.issue_bulk(region, operation, &instance_ids).await {
                Ok(()) => {
                    ctx.metrics.emit(operation.metric(), chunk.len() as f64, &[]);
                    succeeded.extend(chunk.iter().copied());
                    continue;
                }
                Err(error) => error,
            };
            log::error!("Cannot {} in {region}: {error:?}", operation.description());
            let mut failed = self
                .still_in_pre_action_state(region, operation, &instance_ids)
                .await;

            if matches!(operation, BulkOperation::Terminate) && error.is_not_found() {
                // Instances removed in the meantime fail the whole call.
                let remaining: Vec<String> = instance_ids
                    .iter()
                    .filter(|id| failed.contains(*id))
                    .cloned()
                    .collect();
                log::info!(
                    "Some instances in {region} no longer exist, terminating the remaining {}",
                    remaining.len()
                );
                if remaining.is_empty() {
                    failed.clear();
                } else {
                    match self.issue_bulk(region, operation, &remaining).await {
                        Ok(()) => failed.clear(),
                        Err(retry_error) => {
                            log::error!("Cannot terminate instances in {region}: {retry_error:?}");
                            error = retry_error;
                            failed = self
                                .still_in_pre_action_state(region, operation, &remaining)
                                .await;
                        }
                    }
                }
            }

            let mut done = 0;
            for host in chunk {
                let still_failing = host
                    .instance_id()
                    .map(|id| failed.contains(id))
                    .unwrap_or(false);
                if !still_failing {
                    succeeded.push(*host);
                    done += 1;
                } else if error.is_capacity_error() {
                    let instance_type = host.identity.instance_type();
                    ctx.metrics.count(
                        names::INSUFFICIENT_CAPACITY,
                        &[("InstanceType", instance_type.as_str())],
                    );
                    let reason = format!("{INSUFFICIENT_CAPACITY_CODE} for {instance_type}");
                    self.node_down
                        .mark_node_down(
                            ctx,
                            &host.hostname,
                            &reason,
                            FailureKind::Capacity { instance_type },
                        )
                        .await;
                } else {
                    ctx.metrics.count(operation.failed_metric(), &[]);
                    let reason = format!(
                        "Cannot {} ({})",
                        operation.description(),
                        error.code().unwrap_or("provider error")
                    );
                    self.node_down
                        .mark_node_down(ctx, &host.hostname, &reason, FailureKind::Other)
                        .await;
                }
            }
            if done > 0 {
                ctx.metrics.emit(operation.metric(), done as f64, &[]);
            }
        }
        succeeded
    }

    async fn issue_bulk(
        &self,
        region: &str,
        operation: BulkOperation,
        instance_ids: &[String],
    ) -> ProviderResult<()> {
        let ctx = self.ctx;
        ctx.retry
            .run(operation.description(), || {
                operation.issue(ctx.provider.as_ref(), region, instance_ids)
            })
            .await
    }

    /// Those of `instance_ids` that are still in a pre-action state of the operation. When
    /// the state cannot be found out, all of them are.
    async fn still_in_pre_action_state(
        &self,
        region: &str,
        operation: BulkOperation,
        instance_ids: &[String],
    ) -> Set<String> {
        let ctx = self.ctx;
        let filter = cluster_filter(ctx);
        match describe_all_instances(ctx.provider.as_ref(), &ctx.retry, region, &filter).await {
            Ok(instances) => instances
                .into_iter()
                .filter(|instance| {
                    operation.is_pre_action_state(instance.state)
                        && instance_ids.contains(&instance.instance_id)
                })
                .map(|instance| instance.instance_id)
                .collect(),
            Err(error) => {
                log::error!("Cannot find out the state of instances: {error:?}");
                instance_ids.iter().cloned().collect()
            }
        }
    }

    /// Polls stopping instances until they stop. Returns the hosts whose instance is stopped;
    /// hosts that do not get there in time are marked down.
    async fn wait_for_stopped<'h>(
        &mut self,
        region: &str,
        hosts: Vec<&'h HostInfo>,
    ) -> Vec<&'h HostInfo> {
        if hosts.is_empty() {
            return hosts;
        }
        let ctx = self.ctx;
        let deadline = tokio::time::Instant::now() + ctx.config.stopping_wait;
        let mut waiting = hosts;
        let mut stopped = vec![];
        let mut poll_failed = false;
        loop {
            let ids: Vec<String> = waiting
                .iter()
                .filter_map(|host| host.instance_id().map(|id| id.to_string()))
                .collect();
            let provider = ctx.provider.as_ref();
            let instances = match describe_all_instances(
                provider,
                &ctx.retry,
                region,
                &InstanceFilter::Ids(ids),
            )
            .await
            {
                Ok(instances) => Ok(instances),
                Err(error) => {
                    // A single unknown id fails the whole call.
                    log::warn!("Cannot poll instances by id ({error}), listing the cluster");
                    let filter = cluster_filter(ctx);
                    describe_all_instances(provider, &ctx.retry, region, &filter).await
                }
            };
            let states: Map<String, InstanceState> = match instances {
                Ok(instances) => instances
                    .into_iter()
                    .map(|instance| (instance.instance_id, instance.state))
                    .collect(),
                Err(error) => {
                    log::error!("Cannot poll stopping instances: {error:?}");
                    poll_failed = true;
                    break;
                }
            };

            let mut still_stopping = vec![];
            for host in waiting {
                let state = host.instance_id().and_then(|id| states.get(id)).copied();
                match state {
                    Some(InstanceState::Stopped) => stopped.push(host),
                    Some(InstanceState::Stopping) => still_stopping.push(host),
                    Some(InstanceState::Pending | InstanceState::Running) => {
                        log::info!("Instance of node {} is already running", host.hostname);
                    }
                    _ => {
                        self.node_down
                            .mark_node_down(
                                ctx,
                                &host.hostname,
                                "Instance was terminated while stopping",
                                FailureKind::Other,
                            )
                            .await;
                    }
                }
            }
            waiting = still_stopping;
            if waiting.is_empty() || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(ctx.config.stopping_poll_interval).await;
        }

        let (metric, reason) = if poll_failed {
            (
                names::STOPPING_POLL_FAILED,
                "Cannot find out whether the instance stopped",
            )
        } else {
            (names::STOPPING_TIMEOUT, "Instance did not stop in time")
        };
        for host in waiting {
            ctx.metrics.count(metric, &[]);
            self.node_down
                .mark_node_down(ctx, &host.hostname, reason, FailureKind::Other)
                .await;
        }
        stopped
    }

    /// Creates an instance for every host concurrently, bounded by the resume timeout.
    async fn create_all(&mut self, hosts: Vec<&HostInfo>, catalog: &InstanceCatalog) {
        let ctx = self.ctx;
        let deadline = tokio::time::Instant::now() + ctx.config.resume_timeout;
        let results = join_all(hosts.iter().map(|host| async move {
            tokio::time::timeout_at(deadline, create_instance(ctx, catalog, host)).await
        }))
        .await;

        for (host, result) in hosts.into_iter().zip(results) {
            let instance_type = host.identity.instance_type();
            let dimensions = [("InstanceType", instance_type.as_str())];
            match result {
                Ok(Ok(instance)) => {
                    log::info!(
                        "Created instance {} for node {}",
                        instance.instance_id,
                        host.hostname
                    );
                    ctx.metrics.count(names::CREATE_INSTANCE, &dimensions);
                    self.touched.insert(instance.instance_id.clone());
                    self.report
                        .created
                        .push((host.hostname.clone(), instance.instance_id));
                }
                Ok(Err(CreateError::Capacity(error))) => {
                    log::warn!("Cannot create node {}: {error}", host.hostname);
                    ctx.metrics.count(names::INSUFFICIENT_CAPACITY, &dimensions);
                    let reason = format!("{INSUFFICIENT_CAPACITY_CODE} for {instance_type}");
                    self.node_down
                        .mark_node_down(
                            ctx,
                            &host.hostname,
                            &reason,
                            FailureKind::Capacity {
                                instance_type: instance_type.clone(),
                            },
                        )
                        .await;
                }
                Ok(Err(error)) => {
                    log::error!("Cannot create node {}: {error:?}", host.hostname);
                    ctx.metrics.count(names::CREATE_INSTANCE_FAILED, &dimensions);
                    self.node_down
                        .mark_node_down(
                            ctx,
                            &host.hostname,
                            &format!("Cannot create instance: {error}"),
                            FailureKind::Other,
                        )
                        .await;
                }
                Err(_) => {
                    log::error!(
                        "Creation of node {} did not finish within {:?}",
                        host.hostname,
                        ctx.config.resume_timeout
                    );
                    ctx.metrics.count(names::CREATE_INSTANCE_TIMEOUT, &dimensions);
                    self.node_down
                        .mark_node_down(
                            ctx,
                            &host.hostname,
                            "Instance creation timed out",
                            FailureKind::Other,
                        )
                        .await;
                }
            }
        }
    }

    /// Terminates stopped instances that run an outdated image or were launched longer than
    /// `max_stopped_duration` ago.
    async fn sweep(&mut self, view: &FleetView) {
        let ctx = self.ctx;
        let max_age =
            TimeDelta::from_std(ctx.config.max_stopped_duration).unwrap_or(TimeDelta::MAX);
        let mut candidates: BTreeMap<&str, Vec<&ObservedInstance>> = BTreeMap::new();
        for observed in &view.instances {
            let instance = &observed.instance;
            if self.touched.contains(&instance.instance_id)
                || !matches!(
                    instance.state,
                    InstanceState::Stopped | InstanceState::Stopping
                )
            {
                continue;
            }
            let too_old = ctx.now - instance.launch_time > max_age;
            let drifted = observed.is_image_drifted();
            if too_old || drifted {
                log::info!(
                    "Terminating {} instance {} of node {:?} (launched at {}, image {})",
                    instance.state,
                    instance.instance_id,
                    observed.hostname,
                    instance.launch_time,
                    instance.image_id
                );
                candidates
                    .entry(observed.region.as_str())
                    .or_default()
                    .push(observed);
            }
        }

        for (region, instances) in candidates {
            for chunk in instances.chunks(ctx.config.max_instances_per_call) {
                let instance_ids: Vec<String> = chunk
                    .iter()
                    .map(|observed| observed.instance.instance_id.clone())
                    .collect();
                let result = ctx
                    .retry
                    .run("terminate old instances", || {
                        ctx.provider.terminate_instances(region, &instance_ids)
                    })
                    .await;
                match result {
                    Ok(()) => {
                        ctx.metrics.emit(
                            names::TERMINATE_OLD_INSTANCES,
                            instance_ids.len() as f64,
                            &[],
                        );
                        self.touched.extend(instance_ids.iter().cloned());
                        self.report.swept.extend(instance_ids);
                    }
                    Err(error) => {
                        log::error!("Cannot terminate old instances in {region}: {error:?}");
                        ctx.metrics.count(names::TERMINATE_INSTANCES_FAILED, &[]);
                    }
                }
            }
        }
    }
}

fn cluster_filter(ctx: &FleetContext) -> InstanceFilter {
    InstanceFilter::Cluster {
        tag_key: ctx.config.cluster_tag_key.clone(),
        cluster_name: ctx.config.cluster_name.clone(),
    }
}

async fn create_instance(
    ctx: &FleetContext,
    catalog: &InstanceCatalog,
    host: &HostInfo,
) -> Result<Instance, CreateError> {
    let instance_type = host.identity.instance_type();
    let region = ctx.config.region_for_instance_type(&instance_type);
    let image_id = host
        .expected_image
        .clone()
        .ok_or_else(|| CreateError::NoImage(host.hostname.clone()))?;
    if catalog.has_region(&region.name) {
        let info = catalog.get(&region.name, &instance_type)?;
        if info.architecture != host.identity.architecture {
            return Err(CreateError::ArchitectureMismatch {
                instance_type,
                architecture: host.identity.architecture,
            });
        }
    }

    let market = if host.identity.spot {
        MarketType::Spot
    } else {
        MarketType::OnDemand
    };
    let mut capacity_error = None;
    for subnet in &region.subnets {
        let request = LaunchRequest {
            instance_type: instance_type.clone(),
            image_id: image_id.clone(),
            subnet_id: subnet.id.clone(),
            security_group_ids: region.security_group_ids.clone(),
            instance_profile: region.instance_profile.clone(),
            key_name: region.key_name.clone(),
            launch_template: region.launch_template.clone(),
            market,
            tags: vec![
                ("Name".to_string(), host.hostname.clone()),
                (HOSTNAME_TAG.to_string(), host.hostname.clone()),
                (
                    ctx.config.cluster_tag_key.clone(),
                    ctx.config.cluster_name.clone(),
                ),
            ],
        };
        let result = ctx
            .retry
            .run("run instance", || {
                ctx.provider.run_instance(&region.name, &request)
            })
            .await;
        match result {
            Ok(instance) => return Ok(instance),
            Err(error) if error.is_capacity_error() => {
                log::warn!(
                    "No {instance_type} capacity for node {} in subnet {} ({})",
                    host.hostname,
                    subnet.id,
                    subnet.availability_zone
                );
                capacity_error = Some(error);
            }
            Err(error) => return Err(error.into()),
        }
    }
    Err(CreateError::Capacity(capacity_error.unwrap_or_else(|| {
        ProviderError::api(INSUFFICIENT_CAPACITY_CODE, "no subnet is configured")
    })))
}
