//! Compute provider backed by the EC2 API.
use aws_config::BehaviorVersion;
use aws_config::retry::RetryConfig;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::config::Region;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::primitives::DateTime as AwsDateTime;
use aws_sdk_ec2::types;
use chrono::{DateTime, Utc};

use crate::Map;
use crate::config::{ProviderConfig, RegionConfig};
use crate::provider::{
    ComputeProvider, Instance, InstanceFilter, InstanceState, InstanceTypeRecord, LaunchRequest,
    MarketType, Page, ProviderError, ProviderFuture, ProviderResult,
};

/// Upper bound of `MaxResults` accepted by `DescribeInstanceTypes`.
const MAX_INSTANCE_TYPES_PAGE: i32 = 100;
/// Upper bound of `MaxResults` accepted by `DescribeInstances`.
const MAX_INSTANCES_PAGE: i32 = 1000;
const MIN_PAGE: i32 = 5;

/// EC2 clients of all configured regions.
///
/// The SDK's own retries are disabled, `RetryPolicy` is the only retry mechanism.
pub struct Ec2Provider {
    clients: Map<String, Client>,
    page_size: i32,
}

impl Ec2Provider {
    pub async fn connect(config: &ProviderConfig, regions: &[RegionConfig]) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).retry_config(RetryConfig::disabled());
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        let sdk_config = loader.load().await;
        let clients = regions
            .iter()
            .map(|region| {
                let client_config = aws_sdk_ec2::config::Builder::from(&sdk_config)
                    .region(Region::new(region.name.clone()))
                    .build();
                (region.name.clone(), Client::from_conf(client_config))
            })
            .collect();
        Self {
            clients,
            page_size: i32::try_from(config.page_size).unwrap_or(i32::MAX),
        }
    }

    fn client(&self, region: &str) -> ProviderResult<Client> {
        self.clients
            .get(region)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Region {region} is not configured").into())
    }
}

/// Maps an SDK failure to a provider error. Service errors keep their API error code.
fn provider_error<E, R>(error: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if let Some(error) = error.as_service_error().and_then(api_error) {
        return error;
    }
    ProviderError::Other(anyhow::anyhow!("{}", DisplayErrorContext(&error)))
}

fn api_error(metadata: &impl ProvideErrorMetadata) -> Option<ProviderError> {
    let code = metadata.code()?;
    Some(ProviderError::api(code, metadata.message().unwrap_or_default()))
}

fn to_chrono(time: &AwsDateTime) -> ProviderResult<DateTime<Utc>> {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos())
        .ok_or_else(|| anyhow::anyhow!("Invalid timestamp {time}").into())
}

fn convert_instance_type(info: &types::InstanceTypeInfo) -> Option<InstanceTypeRecord> {
    let instance_type = info.instance_type()?.as_str().to_string();
    let vcpus = info.v_cpu_info();
    let threads_per_core = vcpus
        .and_then(|v| v.default_threads_per_core())
        .unwrap_or(1)
        .max(1) as u32;
    let core_count = vcpus
        .and_then(|v| v.default_cores())
        .map(|cores| cores as u32)
        .unwrap_or_else(|| {
            vcpus.and_then(|v| v.default_v_cpus()).unwrap_or(0) as u32 / threads_per_core
        });
    let (ssd_count, ssd_total_size_gb) = match info.instance_storage_info() {
        Some(storage) => (
            storage
                .disks()
                .iter()
                .map(|disk| disk.count().unwrap_or(0) as u32)
                .sum(),
            storage.total_size_in_gb().unwrap_or(0) as u64,
        ),
        None => (0, 0),
    };
    Some(InstanceTypeRecord {
        instance_type,
        architectures: info
            .processor_info()
            .map(|p| {
                p.supported_architectures()
                    .iter()
                    .map(|arch| arch.as_str().to_string())
                    .collect()
            })
            .unwrap_or_default(),
        core_count,
        threads_per_core,
        memory_mib: info
            .memory_info()
            .and_then(|m| m.size_in_mib())
            .unwrap_or(0) as u64,
        ssd_count,
        ssd_total_size_gb,
    })
}

fn convert_instance(instance: &types::Instance) -> ProviderResult<Instance> {
    let instance_id = instance
        .instance_id()
        .ok_or_else(|| anyhow::anyhow!("Instance without an id"))?;
    let state_name = instance
        .state()
        .and_then(|state| state.name())
        .map(|name| name.as_str())
        .unwrap_or_default();
    let state = InstanceState::from_name(state_name)
        .ok_or_else(|| anyhow::anyhow!("Unknown state {state_name} of instance {instance_id}"))?;
    let launch_time = match instance.launch_time() {
        Some(time) => to_chrono(time)?,
        None => Utc::now(),
    };
    Ok(Instance {
        instance_id: instance_id.to_string(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        state,
        image_id: instance.image_id().unwrap_or_default().to_string(),
        launch_time,
        tags: instance
            .tags()
            .iter()
            .filter_map(|tag| Some((tag.key()?.to_string(), tag.value()?.to_string())))
            .collect::<Map<_, _>>(),
    })
}

fn tag_specification(tags: &[(String, String)]) -> types::TagSpecification {
    types::TagSpecification::builder()
        .resource_type(types::ResourceType::Instance)
        .set_tags(Some(
            tags.iter()
                .map(|(key, value)| types::Tag::builder().key(key).value(value).build())
                .collect(),
        ))
        .build()
}

fn market_options(market: MarketType) -> Option<types::InstanceMarketOptionsRequest> {
    match market {
        MarketType::OnDemand => None,
        MarketType::Spot => Some(
            types::InstanceMarketOptionsRequest::builder()
                .market_type(types::MarketType::Spot)
                .spot_options(
                    types::SpotMarketOptions::builder()
                        .spot_instance_type(types::SpotInstanceType::OneTime)
                        .build(),
                )
                .build(),
        ),
    }
}

fn filter(name: &str, values: &[&str]) -> types::Filter {
    types::Filter::builder()
        .name(name)
        .set_values(Some(values.iter().map(|v| v.to_string()).collect()))
        .build()
}

fn page_token(token: Option<&str>) -> Option<String> {
    token.filter(|t| !t.is_empty()).map(|t| t.to_string())
}

enum StateChange {
    Start,
    Stop,
    Terminate,
}

impl Ec2Provider {
    fn change_instance_states(
        &self,
        region: &str,
        change: StateChange,
        instance_ids: &[String],
    ) -> ProviderFuture<()> {
        let client = self.client(region);
        let instance_ids = instance_ids.to_vec();
        Box::pin(async move {
            let client = client?;
            let ids = Some(instance_ids);
            match change {
                StateChange::Start => client
                    .start_instances()
                    .set_instance_ids(ids)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(provider_error),
                StateChange::Stop => client
                    .stop_instances()
                    .set_instance_ids(ids)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(provider_error),
                StateChange::Terminate => client
                    .terminate_instances()
                    .set_instance_ids(ids)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(provider_error),
            }
        })
    }
}

impl ComputeProvider for Ec2Provider {
    fn describe_instance_types(
        &self,
        region: &str,
        next_token: Option<String>,
    ) -> ProviderFuture<Page<InstanceTypeRecord>> {
        let client = self.client(region);
        let page_size = self.page_size.clamp(MIN_PAGE, MAX_INSTANCE_TYPES_PAGE);
        Box::pin(async move {
            let output = client?
                .describe_instance_types()
                .filters(filter("current-generation", &["true"]))
                .max_results(page_size)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(provider_error)?;
            Ok(Page {
                items: output
                    .instance_types()
                    .iter()
                    .filter_map(convert_instance_type)
                    .collect(),
                next_token: page_token(output.next_token()),
            })
        })
    }

    fn describe_instances(
        &self,
        region: &str,
        filter_by: &InstanceFilter,
        next_token: Option<String>,
    ) -> ProviderFuture<Page<Instance>> {
        let client = self.client(region);
        let filter_by = filter_by.clone();
        let page_size = self.page_size.clamp(MIN_PAGE, MAX_INSTANCES_PAGE);
        Box::pin(async move {
            let request = client?.describe_instances().set_next_token(next_token);
            // MaxResults cannot be combined with explicit instance ids.
            let request = match &filter_by {
                InstanceFilter::Cluster {
                    tag_key,
                    cluster_name,
                } => request
                    .filters(filter(&format!("tag:{tag_key}"), &[cluster_name.as_str()]))
                    .filters(filter(
                        "instance-state-name",
                        &["pending", "running", "stopping", "stopped"],
                    ))
                    .max_results(page_size),
                InstanceFilter::Ids(ids) => request.set_instance_ids(Some(ids.clone())),
            };
            let output = request.send().await.map_err(provider_error)?;
            let items = output
                .reservations()
                .iter()
                .flat_map(|reservation| reservation.instances())
                .map(convert_instance)
                .collect::<ProviderResult<Vec<_>>>()?;
            Ok(Page {
                items,
                next_token: page_token(output.next_token()),
            })
        })
    }

    fn run_instance(&self, region: &str, request: &LaunchRequest) -> ProviderFuture<Instance> {
        let client = self.client(region);
        let request = request.clone();
        Box::pin(async move {
            let mut call = client?
                .run_instances()
                .min_count(1)
                .max_count(1)
                .instance_type(types::InstanceType::from(request.instance_type.as_str()))
                .image_id(request.image_id)
                .subnet_id(request.subnet_id)
                .tag_specifications(tag_specification(&request.tags))
                .set_instance_market_options(market_options(request.market))
                .set_key_name(request.key_name);
            if !request.security_group_ids.is_empty() {
                call = call.set_security_group_ids(Some(request.security_group_ids));
            }
            if let Some(profile) = request.instance_profile {
                call = call.iam_instance_profile(
                    types::IamInstanceProfileSpecification::builder()
                        .name(profile)
                        .build(),
                );
            }
            if let Some(template) = request.launch_template {
                call = call.launch_template(
                    types::LaunchTemplateSpecification::builder()
                        .launch_template_name(template)
                        .build(),
                );
            }
            let output = call.send().await.map_err(provider_error)?;
            let instance = output
                .instances()
                .first()
                .ok_or_else(|| anyhow::anyhow!("RunInstances returned no instance"))?;
            convert_instance(instance)
        })
    }

    fn start_instances(&self, region: &str, instance_ids: &[String]) -> ProviderFuture<()> {
        self.change_instance_states(region, StateChange::Start, instance_ids)
    }

    fn stop_instances(&self, region: &str, instance_ids: &[String]) -> ProviderFuture<()> {
        self.change_instance_states(region, StateChange::Stop, instance_ids)
    }

    fn terminate_instances(&self, region: &str, instance_ids: &[String]) -> ProviderFuture<()> {
        self.change_instance_states(region, StateChange::Terminate, instance_ids)
    }

    fn spot_price(&self, region: &str, instance_type: &str) -> ProviderFuture<Option<f64>> {
        let client = self.client(region);
        let instance_type = types::InstanceType::from(instance_type);
        Box::pin(async move {
            let output = client?
                .describe_spot_price_history()
                .instance_types(instance_type)
                .product_descriptions("Linux/UNIX")
                .start_time(AwsDateTime::from_secs(Utc::now().timestamp()))
                .send()
                .await
                .map_err(provider_error)?;
            Ok(output
                .spot_price_history()
                .iter()
                .filter_map(|entry| entry.spot_price()?.parse::<f64>().ok())
                .reduce(f64::min))
        })
    }
}
