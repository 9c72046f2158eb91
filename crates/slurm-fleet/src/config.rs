//! Typed cluster configuration, loaded once at process start and never mutated.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::error::FleetError;
use crate::fleet::hostname::{Architecture, Distribution, NodeIdentity};
use crate::{Map, Set};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub regions: Vec<RegionConfig>,
    /// Tag that marks instances belonging to this cluster.
    #[serde(default = "default_cluster_tag_key")]
    pub cluster_tag_key: String,
    /// Generate spot node definitions next to the on-demand ones.
    #[serde(default)]
    pub spot_enabled: bool,
    /// Stopped instances launched longer ago than this are terminated.
    #[serde(default = "default_max_stopped_duration", with = "duration_format")]
    pub max_stopped_duration: Duration,
    /// Deadline for concurrent instance creation within one resume invocation.
    #[serde(default = "default_resume_timeout", with = "duration_format")]
    pub resume_timeout: Duration,
    /// How long resume waits for stopping instances before giving up on them.
    #[serde(default = "default_stopping_wait", with = "duration_format")]
    pub stopping_wait: Duration,
    #[serde(default = "default_stopping_poll_interval", with = "duration_format")]
    pub stopping_poll_interval: Duration,
    /// Maximum number of instance ids passed to a single start/stop/terminate call.
    #[serde(default = "default_max_instances_per_call")]
    pub max_instances_per_call: usize,
    /// Size of the node range generated for each instance type.
    #[serde(default = "default_max_nodes_per_instance_type")]
    pub max_nodes_per_instance_type: u32,
    /// Optional snapshot of the instance type catalog.
    #[serde(default)]
    pub instance_type_cache: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    pub name: String,
    pub instance_types: Vec<String>,
    pub images: Vec<ImageConfig>,
    pub subnets: Vec<SubnetConfig>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub instance_profile: Option<String>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub launch_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    pub distribution: Distribution,
    pub version: u32,
    pub architecture: Architecture,
    pub image_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubnetConfig {
    pub id: String,
    pub availability_zone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_retry_min_delay", with = "duration_format")]
    pub min_delay: Duration,
    #[serde(default = "default_retry_max_delay", with = "duration_format")]
    pub max_delay: Duration,
    #[serde(default = "default_retry_base_delay", with = "duration_format")]
    pub base_delay: Duration,
    /// Once the sum of all retry delays exceeds this, one last attempt is made.
    #[serde(default = "default_retry_max_elapsed", with = "duration_format")]
    pub max_elapsed: Duration,
    #[serde(default = "default_transient_error_codes")]
    pub transient_error_codes: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: default_retry_min_delay(),
            max_delay: default_retry_max_delay(),
            base_delay: default_retry_base_delay(),
            max_elapsed: default_retry_max_elapsed(),
            transient_error_codes: default_transient_error_codes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Directory with `scontrol`, `squeue` and `sinfo`. Resolved from `PATH` if missing.
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Named profile of the shared AWS configuration used for credentials.
    #[serde(default)]
    pub profile: Option<String>,
    /// Number of items requested per page of describe calls.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            profile: None,
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_namespace")]
    pub namespace: String,
    /// File that receives metrics in the embedded metric format. Metrics are only logged
    /// when it is missing.
    #[serde(default)]
    pub emf_log_file: Option<PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: default_metrics_namespace(),
            emf_log_file: None,
        }
    }
}

fn default_cluster_tag_key() -> String {
    "ClusterName".to_string()
}
fn default_max_stopped_duration() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}
fn default_resume_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}
fn default_stopping_wait() -> Duration {
    Duration::from_secs(3 * 60)
}
fn default_stopping_poll_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_max_instances_per_call() -> usize {
    1000
}
fn default_max_nodes_per_instance_type() -> u32 {
    100
}
fn default_retry_min_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_retry_max_delay() -> Duration {
    Duration::from_secs(10)
}
fn default_retry_base_delay() -> Duration {
    Duration::from_millis(250)
}
fn default_retry_max_elapsed() -> Duration {
    Duration::from_secs(60)
}
fn default_transient_error_codes() -> Vec<String> {
    [
        "RequestLimitExceeded",
        "Throttling",
        "ThrottlingException",
        "InternalError",
        "ServiceUnavailable",
        "Unavailable",
    ]
    .into_iter()
    .map(|code| code.to_string())
    .collect()
}
fn default_page_size() -> u32 {
    500
}
fn default_metrics_namespace() -> String {
    "SlurmFleet".to_string()
}

/// (De)serializes durations in the humantime format, e.g. `30days` or `5m 30s`.
mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(ConfigFormat::Json),
            "yml" | "yaml" => Some(ConfigFormat::Yaml),
            "toml" => Some(ConfigFormat::Toml),
            _ => None,
        }
    }
}

impl ClusterConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let format = ConfigFormat::from_path(path).ok_or_else(|| {
            FleetError::ConfigError(format!(
                "Cannot determine the format of {}, use a .json, .yml or .toml file",
                path.display()
            ))
        })?;
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content, format)?;
        log::debug!(
            "Loaded configuration of cluster {} from {}",
            config.cluster_name,
            path.display()
        );
        Ok(config)
    }

    pub fn parse(content: &str, format: ConfigFormat) -> crate::Result<Self> {
        let config: ClusterConfig = match format {
            ConfigFormat::Json => serde_json::from_str(content)?,
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
            ConfigFormat::Toml => toml::from_str(content)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::Result<()> {
        let fail = |message: String| Err(FleetError::ConfigError(message));
        if self.cluster_name.trim().is_empty() {
            return fail("cluster_name must not be empty".to_string());
        }
        if self.regions.is_empty() {
            return fail("at least one region has to be configured".to_string());
        }
        if self.max_instances_per_call == 0 {
            return fail("max_instances_per_call must be positive".to_string());
        }
        if self.retry.min_delay > self.retry.max_delay {
            return fail("retry.min_delay must not be larger than retry.max_delay".to_string());
        }

        let mut region_names = Set::new();
        let mut zones: Map<&str, &str> = Map::new();
        for region in &self.regions {
            if !region_names.insert(region.name.as_str()) {
                return fail(format!("region {} is configured more than once", region.name));
            }
            if region.subnets.is_empty() {
                return fail(format!("region {} has no subnets", region.name));
            }
            let mut instance_types = Set::new();
            for instance_type in &region.instance_types {
                if !instance_type.contains('.') {
                    return fail(format!("invalid instance type {instance_type}"));
                }
                if !instance_types.insert(instance_type.as_str()) {
                    return fail(format!(
                        "instance type {instance_type} is listed more than once in region {}",
                        region.name
                    ));
                }
            }
            for subnet in &region.subnets {
                let zone = subnet.availability_zone.as_str();
                if let Some(other) = zones.insert(zone, region.name.as_str()) {
                    if other != region.name {
                        return fail(format!(
                            "availability zone {zone} is used by regions {other} and {}",
                            region.name
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn region_names(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(|region| region.name.as_str())
    }

    /// Region that hosts the given instance type. Falls back to the first region.
    pub fn region_for_instance_type(&self, instance_type: &str) -> &RegionConfig {
        self.regions
            .iter()
            .find(|region| region.instance_types.iter().any(|t| t == instance_type))
            .unwrap_or(&self.regions[0])
    }
}

impl RegionConfig {
    /// Image that nodes with the given identity should run in this region.
    pub fn expected_image(&self, identity: &NodeIdentity) -> Option<&str> {
        self.images
            .iter()
            .find(|image| {
                image.distribution == identity.distribution
                    && image.version == identity.distribution_version
                    && image.architecture == identity.architecture
            })
            .map(|image| image.image_id.as_str())
    }
}
