use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_builder::Builder;

use crate::provider::{
    ComputeProvider, Instance, InstanceFilter, InstanceState, InstanceTypeRecord, LaunchRequest,
    MarketType, Page, ProviderError, ProviderFuture, ProviderResult,
};
use crate::{HOSTNAME_TAG, Map, Set, WrappedRcRefCell};

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    DescribeInstanceTypes {
        region: String,
        next_token: Option<String>,
    },
    DescribeInstances {
        region: String,
        instance_ids: Option<Vec<String>>,
    },
    Run {
        region: String,
        hostname: String,
        instance_type: String,
        image_id: String,
        subnet_id: String,
        market: MarketType,
    },
    Start {
        region: String,
        instance_ids: Vec<String>,
    },
    Stop {
        region: String,
        instance_ids: Vec<String>,
    },
    Terminate {
        region: String,
        instance_ids: Vec<String>,
    },
    SpotPrice {
        region: String,
        instance_type: String,
    },
}

impl ProviderCall {
    /// The call changes the state of instances.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            ProviderCall::Run { .. }
                | ProviderCall::Start { .. }
                | ProviderCall::Stop { .. }
                | ProviderCall::Terminate { .. }
        )
    }
}

pub type DescribeTypesHook = Box<dyn FnMut(&str) -> Option<ProviderError>>;
pub type DescribeInstancesHook = Box<dyn FnMut() -> Option<ProviderError>>;
pub type RunHook = Box<dyn FnMut(&LaunchRequest) -> Option<ProviderError>>;
/// Receives the operation name and instance ids. Returning `Some((applied, error))` applies the
/// operation only to `applied` and fails the call with `error`.
pub type BulkHook = Box<dyn FnMut(&str, &[String]) -> Option<(Vec<String>, ProviderError)>>;

/// In-memory compute provider.
#[derive(Default)]
pub struct FakeCloud {
    /// Instances of each region, in launch order.
    pub instances: Map<String, Vec<Instance>>,
    pub instance_types: Map<String, Vec<InstanceTypeRecord>>,
    pub spot_prices: Map<(String, String), f64>,
    pub calls: Vec<ProviderCall>,
    /// Items per page of describe calls, zero means everything at once.
    pub page_size: usize,
    pub describe_types_hook: Option<DescribeTypesHook>,
    pub describe_instances_hook: Option<DescribeInstancesHook>,
    pub run_hook: Option<RunHook>,
    pub bulk_hook: Option<BulkHook>,
    /// Creation of these hosts takes the given time.
    pub slow_hosts: Map<String, Duration>,
    /// Stopping instances never finish stopping.
    pub stopping_is_sticky: bool,
    /// Instances that disappear right after they are listed by the cluster filter, as if
    /// another invocation removed them.
    pub vanishing: Set<String>,
    instance_counter: u32,
}

impl FakeCloud {
    pub fn new_instance_id(&mut self) -> String {
        self.instance_counter += 1;
        format!("i-{:05}", self.instance_counter)
    }

    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.instances
            .values()
            .flatten()
            .find(|instance| instance.instance_id == instance_id)
            .cloned()
    }

    fn instance_mut(&mut self, region: &str, instance_id: &str) -> Option<&mut Instance> {
        self.instances
            .get_mut(region)?
            .iter_mut()
            .find(|instance| instance.instance_id == instance_id)
    }

    fn apply(&mut self, region: &str, operation: &str, instance_ids: &[String]) {
        let state = match operation {
            "start" => InstanceState::Running,
            "stop" => InstanceState::Stopped,
            _ => InstanceState::Terminated,
        };
        for instance_id in instance_ids {
            if let Some(instance) = self.instance_mut(region, instance_id) {
                instance.state = state;
            }
        }
    }

    fn bulk(
        &mut self,
        region: &str,
        operation: &str,
        instance_ids: &[String],
    ) -> ProviderResult<()> {
        let missing = instance_ids
            .iter()
            .find(|id| self.instance_mut(region, id).is_none());
        if let Some(instance_id) = missing {
            return Err(ProviderError::api(
                "InvalidInstanceID.NotFound",
                &format!("The instance ID '{instance_id}' does not exist"),
            ));
        }
        if let Some(hook) = self.bulk_hook.as_mut() {
            if let Some((applied, error)) = hook(operation, instance_ids) {
                self.apply(region, operation, &applied);
                return Err(error);
            }
        }
        self.apply(region, operation, instance_ids);
        Ok(())
    }
}

fn paginate<T: Clone>(
    items: &[T],
    page_size: usize,
    next_token: Option<String>,
) -> ProviderResult<Page<T>> {
    let start = match next_token {
        Some(token) => token
            .parse::<usize>()
            .map_err(|error| ProviderError::Other(error.into()))?,
        None => 0,
    };
    let start = start.min(items.len());
    let end = if page_size == 0 {
        items.len()
    } else {
        (start + page_size).min(items.len())
    };
    Ok(Page {
        items: items[start..end].to_vec(),
        next_token: (end < items.len()).then(|| end.to_string()),
    })
}

fn ready<T: 'static>(result: ProviderResult<T>) -> ProviderFuture<T> {
    Box::pin(futures::future::ready(result))
}

pub struct FakeProvider {
    cloud: WrappedRcRefCell<FakeCloud>,
}

impl FakeProvider {
    pub fn new(cloud: WrappedRcRefCell<FakeCloud>) -> Self {
        Self { cloud }
    }
}

impl ComputeProvider for FakeProvider {
    fn describe_instance_types(
        &self,
        region: &str,
        next_token: Option<String>,
    ) -> ProviderFuture<Page<InstanceTypeRecord>> {
        let mut cloud = self.cloud.get_mut();
        cloud.calls.push(ProviderCall::DescribeInstanceTypes {
            region: region.to_string(),
            next_token: next_token.clone(),
        });
        if let Some(error) = cloud.describe_types_hook.as_mut().and_then(|hook| hook(region)) {
            return ready(Err(error));
        }
        let types = cloud.instance_types.get(region).cloned().unwrap_or_default();
        ready(paginate(&types, cloud.page_size, next_token))
    }

    fn describe_instances(
        &self,
        region: &str,
        filter: &InstanceFilter,
        next_token: Option<String>,
    ) -> ProviderFuture<Page<Instance>> {
        let mut cloud = self.cloud.get_mut();
        cloud.calls.push(ProviderCall::DescribeInstances {
            region: region.to_string(),
            instance_ids: match filter {
                InstanceFilter::Ids(ids) => Some(ids.clone()),
                InstanceFilter::Cluster { .. } => None,
            },
        });
        if let Some(error) = cloud.describe_instances_hook.as_mut().and_then(|hook| hook()) {
            return ready(Err(error));
        }

        let sticky = cloud.stopping_is_sticky;
        let vanishing = cloud.vanishing.clone();
        let instances = cloud.instances.entry(region.to_string()).or_default();
        let selected: Vec<Instance> = match filter {
            InstanceFilter::Cluster {
                tag_key,
                cluster_name,
            } => {
                let selected = instances
                    .iter()
                    .filter(|instance| {
                        instance.state.is_alive()
                            && instance.tag(tag_key) == Some(cluster_name.as_str())
                    })
                    .cloned()
                    .collect();
                instances.retain(|instance| !vanishing.contains(&instance.instance_id));
                selected
            }
            InstanceFilter::Ids(ids) => instances
                .iter_mut()
                .filter(|instance| ids.contains(&instance.instance_id))
                .map(|instance| {
                    // Each poll finishes the stop of stopping instances.
                    if !sticky && instance.state == InstanceState::Stopping {
                        instance.state = InstanceState::Stopped;
                    }
                    instance.clone()
                })
                .collect(),
        };
        ready(paginate(&selected, cloud.page_size, next_token))
    }

    fn run_instance(&self, region: &str, request: &LaunchRequest) -> ProviderFuture<Instance> {
        let mut cloud = self.cloud.get_mut();
        let hostname = request
            .tags
            .iter()
            .find(|(key, _)| key == HOSTNAME_TAG)
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        cloud.calls.push(ProviderCall::Run {
            region: region.to_string(),
            hostname: hostname.clone(),
            instance_type: request.instance_type.clone(),
            image_id: request.image_id.clone(),
            subnet_id: request.subnet_id.clone(),
            market: request.market,
        });
        if let Some(error) = cloud.run_hook.as_mut().and_then(|hook| hook(request)) {
            return ready(Err(error));
        }

        let instance = Instance {
            instance_id: cloud.new_instance_id(),
            instance_type: request.instance_type.clone(),
            state: InstanceState::Running,
            image_id: request.image_id.clone(),
            launch_time: Utc::now(),
            tags: request.tags.iter().cloned().collect(),
        };
        cloud
            .instances
            .entry(region.to_string())
            .or_default()
            .push(instance.clone());

        match cloud.slow_hosts.get(&hostname).copied() {
            Some(delay) => Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(instance)
            }),
            None => ready(Ok(instance)),
        }
    }

    fn start_instances(&self, region: &str, instance_ids: &[String]) -> ProviderFuture<()> {
        let mut cloud = self.cloud.get_mut();
        cloud.calls.push(ProviderCall::Start {
            region: region.to_string(),
            instance_ids: instance_ids.to_vec(),
        });
        ready(cloud.bulk(region, "start", instance_ids))
    }

    fn stop_instances(&self, region: &str, instance_ids: &[String]) -> ProviderFuture<()> {
        let mut cloud = self.cloud.get_mut();
        cloud.calls.push(ProviderCall::Stop {
            region: region.to_string(),
            instance_ids: instance_ids.to_vec(),
        });
        ready(cloud.bulk(region, "stop", instance_ids))
    }

    fn terminate_instances(&self, region: &str, instance_ids: &[String]) -> ProviderFuture<()> {
        let mut cloud = self.cloud.get_mut();
        cloud.calls.push(ProviderCall::Terminate {
            region: region.to_string(),
            instance_ids: instance_ids.to_vec(),
        });
        ready(cloud.bulk(region, "terminate", instance_ids))
    }

    fn spot_price(&self, region: &str, instance_type: &str) -> ProviderFuture<Option<f64>> {
        let mut cloud = self.cloud.get_mut();
        cloud.calls.push(ProviderCall::SpotPrice {
            region: region.to_string(),
            instance_type: instance_type.to_string(),
        });
        let price = cloud
            .spot_prices
            .get(&(region.to_string(), instance_type.to_string()))
            .copied();
        ready(Ok(price))
    }
}

#[derive(Builder, Clone)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct InstanceSpec {
    #[builder(setter(into))]
    hostname: String,
    #[builder(default = "InstanceState::Running")]
    state: InstanceState,
    #[builder(default = "\"c6i.large\".to_string()", setter(into))]
    instance_type: String,
    #[builder(default = "\"ami-x86\".to_string()", setter(into))]
    image_id: String,
    #[builder(default = "\"us-east-1\".to_string()", setter(into))]
    region: String,
    /// Value of the cluster tag.
    #[builder(default = "\"eda\".to_string()", setter(into))]
    cluster: String,
    #[builder(default = "Utc::now()")]
    launch_time: DateTime<Utc>,
}

impl InstanceSpecBuilder {
    /// Returns the region of the instance and the instance itself, with a placeholder id.
    pub fn build(self) -> (String, Instance) {
        let spec = self.finish().unwrap();
        let tags: Map<String, String> = [
            ("Name".to_string(), spec.hostname.clone()),
            (HOSTNAME_TAG.to_string(), spec.hostname),
            ("ClusterName".to_string(), spec.cluster),
        ]
        .into_iter()
        .collect();
        let instance = Instance {
            instance_id: "i-00000".to_string(),
            instance_type: spec.instance_type,
            state: spec.state,
            image_id: spec.image_id,
            launch_time: spec.launch_time,
            tags,
        };
        (spec.region, instance)
    }
}
