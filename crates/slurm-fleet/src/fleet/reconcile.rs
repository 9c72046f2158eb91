//! Builds the observed state of scheduler hosts out of the instances reported by the provider.
use itertools::Itertools;

use crate::context::FleetContext;
use crate::fleet::hostname::{InvalidHostnameError, NodeIdentity, decode_hostname};
use crate::provider::{Instance, InstanceFilter, InstanceState, describe_all_instances};
use crate::telemetry::names;
use crate::{HOSTNAME_TAG, Map};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostState {
    /// No instance is bound to the host.
    None,
    Pending,
    Running,
    Stopping,
    Stopped,
    /// More than one alive instance carries the hostname.
    Duplicate,
}

impl HostState {
    fn from_instance_state(state: InstanceState) -> Option<Self> {
        match state {
            InstanceState::Pending => Some(HostState::Pending),
            InstanceState::Running => Some(HostState::Running),
            InstanceState::Stopping => Some(HostState::Stopping),
            InstanceState::Stopped => Some(HostState::Stopped),
            InstanceState::ShuttingDown | InstanceState::Terminated => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostInfo {
    pub hostname: String,
    pub identity: NodeIdentity,
    /// Region that hosts (or will host) the instance.
    pub region: String,
    /// Image configured for the identity of the host in its region.
    pub expected_image: Option<String>,
    pub state: HostState,
    /// Instance bound to the hostname. For duplicates, the first one seen.
    pub instance: Option<Instance>,
    /// Ids of all alive instances that carry the hostname.
    pub instance_ids: Vec<String>,
}

impl HostInfo {
    fn unbound(ctx: &FleetContext, hostname: String, identity: NodeIdentity) -> Self {
        let region = ctx.config.region_for_instance_type(&identity.instance_type());
        Self {
            expected_image: region.expected_image(&identity).map(|s| s.to_string()),
            region: region.name.clone(),
            hostname,
            identity,
            state: HostState::None,
            instance: None,
            instance_ids: vec![],
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance
            .as_ref()
            .map(|instance| instance.instance_id.as_str())
    }

    pub fn current_image(&self) -> Option<&str> {
        self.instance.as_ref().map(|instance| instance.image_id.as_str())
    }

    /// The bound instance runs a different image than the one configured for the host.
    pub fn is_image_drifted(&self) -> bool {
        match (self.current_image(), self.expected_image.as_deref()) {
            (Some(current), Some(expected)) => current != expected,
            _ => false,
        }
    }
}

/// An alive cluster instance, whether or not its host was requested.
#[derive(Debug, Clone)]
pub struct ObservedInstance {
    pub region: String,
    pub instance: Instance,
    pub hostname: Option<String>,
    pub expected_image: Option<String>,
}

impl ObservedInstance {
    pub fn is_image_drifted(&self) -> bool {
        self.expected_image
            .as_deref()
            .map(|expected| expected != self.instance.image_id)
            .unwrap_or(false)
    }
}

/// Observed state of the fleet at the start of an invocation.
#[derive(Debug, Default)]
pub struct FleetView {
    /// Requested hosts, in the requested order.
    pub hosts: Vec<HostInfo>,
    /// Requested hostnames that cannot be decoded.
    pub invalid: Vec<InvalidHostnameError>,
    pub instances: Vec<ObservedInstance>,
}

/// Queries all alive instances of the cluster in every configured region and joins them with
/// the requested hostnames.
pub async fn collect(ctx: &FleetContext, hostnames: &[String]) -> anyhow::Result<FleetView> {
    let filter = InstanceFilter::Cluster {
        tag_key: ctx.config.cluster_tag_key.clone(),
        cluster_name: ctx.config.cluster_name.clone(),
    };

    let mut view = FleetView::default();
    let mut bound: Map<String, HostInfo> = Map::new();
    for region in &ctx.config.regions {
        let instances =
            describe_all_instances(ctx.provider.as_ref(), &ctx.retry, &region.name, &filter)
                .await?;
        log::debug!(
            "Region {} has {} alive cluster instances",
            region.name,
            instances.len()
        );
        for instance in instances {
            let Some(state) = HostState::from_instance_state(instance.state) else {
                continue;
            };
            let mut observed = ObservedInstance {
                region: region.name.clone(),
                hostname: instance.tag(HOSTNAME_TAG).map(|s| s.to_string()),
                expected_image: None,
                instance,
            };
            match observed.hostname.as_deref().map(decode_hostname) {
                Some(Ok(identity)) => {
                    observed.expected_image =
                        region.expected_image(&identity).map(|s| s.to_string());
                    bind_instance(&mut bound, &observed, identity, state);
                }
                Some(Err(error)) => {
                    log::warn!(
                        "Instance {} carries an invalid hostname tag: {error}",
                        observed.instance.instance_id
                    );
                }
                None => log::warn!(
                    "Instance {} has no {HOSTNAME_TAG} tag",
                    observed.instance.instance_id
                ),
            }
            view.instances.push(observed);
        }
    }

    emit_node_counts(ctx, &view.instances);

    for hostname in hostnames {
        match bound.get(hostname) {
            Some(host) => view.hosts.push(host.clone()),
            None => match decode_hostname(hostname) {
                Ok(identity) => view
                    .hosts
                    .push(HostInfo::unbound(ctx, hostname.clone(), identity)),
                Err(error) => view.invalid.push(error),
            },
        }
    }
    Ok(view)
}

fn bind_instance(
    bound: &mut Map<String, HostInfo>,
    observed: &ObservedInstance,
    identity: NodeIdentity,
    state: HostState,
) {
    let Some(hostname) = &observed.hostname else {
        return;
    };
    match bound.get_mut(hostname) {
        Some(host) => {
            log::error!(
                "Host {hostname} is bound to multiple instances: {} and {}",
                host.instance_ids.join(", "),
                observed.instance.instance_id
            );
            host.state = HostState::Duplicate;
            host.instance_ids.push(observed.instance.instance_id.clone());
        }
        None => {
            bound.insert(
                hostname.clone(),
                HostInfo {
                    hostname: hostname.clone(),
                    identity,
                    region: observed.region.clone(),
                    expected_image: observed.expected_image.clone(),
                    state,
                    instance: Some(observed.instance.clone()),
                    instance_ids: vec![observed.instance.instance_id.clone()],
                },
            );
        }
    }
}

fn emit_node_counts(ctx: &FleetContext, instances: &[ObservedInstance]) {
    let counts = instances
        .iter()
        .map(|observed| {
            (
                observed.instance.state.name(),
                observed.instance.instance_type.as_str(),
            )
        })
        .counts();
    for ((state, instance_type), count) in counts.into_iter().sorted() {
        ctx.metrics.emit(
            names::NODE_COUNT,
            count as f64,
            &[("State", state), ("InstanceType", instance_type)],
        );
    }
}
