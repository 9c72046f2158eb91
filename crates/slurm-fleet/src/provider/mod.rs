//! Interface to the compute provider that hosts the elastic fleet.
pub mod ec2;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Map;
use crate::fleet::retry::RetryPolicy;

/// Error code returned when the provider has no capacity for the requested instance type.
pub const INSUFFICIENT_CAPACITY_CODE: &str = "InsufficientInstanceCapacity";

/// Error codes returned for instances that do not exist (anymore).
const NOT_FOUND_CODES: [&str; 2] = ["InvalidInstanceID.NotFound", "InvalidInstanceID.Malformed"];

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{code}: {message}")]
    Api { code: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn api(code: &str, message: &str) -> Self {
        Self::Api {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::Api { code, .. } => Some(code),
            ProviderError::Other(_) => None,
        }
    }

    pub fn is_capacity_error(&self) -> bool {
        self.code() == Some(INSUFFICIENT_CAPACITY_CODE)
    }

    pub fn is_not_found(&self) -> bool {
        self.code()
            .map(|code| NOT_FOUND_CODES.contains(&code))
            .unwrap_or(false)
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
pub type ProviderFuture<T> = Pin<Box<dyn Future<Output = ProviderResult<T>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "shutting-down" => Some(InstanceState::ShuttingDown),
            "terminated" => Some(InstanceState::Terminated),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }

    /// States of instances that still occupy their hostname.
    pub fn is_alive(&self) -> bool {
        !matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub instance_id: String,
    pub instance_type: String,
    pub state: InstanceState,
    pub image_id: String,
    pub launch_time: DateTime<Utc>,
    pub tags: Map<String, String>,
}

impl Instance {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|value| value.as_str())
    }
}

/// Hardware description of an instance type as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTypeRecord {
    pub instance_type: String,
    pub architectures: Vec<String>,
    pub core_count: u32,
    pub threads_per_core: u32,
    pub memory_mib: u64,
    pub ssd_count: u32,
    pub ssd_total_size_gb: u64,
}

#[derive(Debug, Clone)]
pub enum InstanceFilter {
    /// Alive (pending, running, stopping, stopped) instances carrying the cluster tag.
    Cluster { tag_key: String, cluster_name: String },
    /// Instances with the given ids, in any state.
    Ids(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketType {
    OnDemand,
    Spot,
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub instance_type: String,
    pub image_id: String,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    pub instance_profile: Option<String>,
    pub key_name: Option<String>,
    pub launch_template: Option<String>,
    pub market: MarketType,
    pub tags: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// Handler that can manage instances of a compute provider.
///
/// All methods return boxed futures that own their inputs, so they can be driven concurrently
/// on a single thread.
pub trait ComputeProvider {
    /// Get one page of current generation instance types.
    fn describe_instance_types(
        &self,
        region: &str,
        next_token: Option<String>,
    ) -> ProviderFuture<Page<InstanceTypeRecord>>;

    fn describe_instances(
        &self,
        region: &str,
        filter: &InstanceFilter,
        next_token: Option<String>,
    ) -> ProviderFuture<Page<Instance>>;

    /// Launch a single instance.
    fn run_instance(&self, region: &str, request: &LaunchRequest) -> ProviderFuture<Instance>;

    fn start_instances(&self, region: &str, instance_ids: &[String]) -> ProviderFuture<()>;

    fn stop_instances(&self, region: &str, instance_ids: &[String]) -> ProviderFuture<()>;

    fn terminate_instances(&self, region: &str, instance_ids: &[String]) -> ProviderFuture<()>;

    /// Most recent spot price (per hour) of the instance type, if the provider reports one.
    fn spot_price(&self, region: &str, instance_type: &str) -> ProviderFuture<Option<f64>>;
}

/// Fetch all pages of a paginated provider call. Every page request is protected by `retry`.
pub async fn fetch_all_pages<T, F>(
    retry: &RetryPolicy,
    description: &str,
    mut fetch_page: F,
) -> ProviderResult<Vec<T>>
where
    F: FnMut(Option<String>) -> ProviderFuture<Page<T>>,
{
    let mut items = Vec::new();
    let mut next_token = None;
    loop {
        let token = next_token.clone();
        let page = retry.run(description, || fetch_page(token.clone())).await?;
        items.extend(page.items);
        match page.next_token {
            Some(token) if !token.is_empty() => next_token = Some(token),
            _ => return Ok(items),
        }
    }
}

/// Describe instances matching `filter` across all pages.
pub async fn describe_all_instances(
    provider: &dyn ComputeProvider,
    retry: &RetryPolicy,
    region: &str,
    filter: &InstanceFilter,
) -> ProviderResult<Vec<Instance>> {
    fetch_all_pages(retry, "describe instances", |token| {
        provider.describe_instances(region, filter, token)
    })
    .await
}
