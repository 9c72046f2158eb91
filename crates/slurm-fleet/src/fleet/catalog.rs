use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::Map;
use crate::context::FleetContext;
use crate::fleet::hostname::Architecture;
use crate::provider::{InstanceTypeRecord, fetch_all_pages};
use crate::telemetry::names;

/// Hardware attributes of an instance type. Field names follow the cache file schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTypeInfo {
    pub architecture: Architecture,
    #[serde(rename = "CoreCount")]
    pub core_count: u32,
    #[serde(rename = "ThreadsPerCore")]
    pub threads_per_core: u32,
    #[serde(rename = "MemoryInMiB")]
    pub memory_mib: u64,
    #[serde(rename = "SSDCount", default)]
    pub ssd_count: u32,
    #[serde(rename = "SSDTotalSizeGB", default)]
    pub ssd_total_size_gb: u64,
}

impl InstanceTypeInfo {
    fn from_record(record: &InstanceTypeRecord) -> Option<Self> {
        let architecture = record
            .architectures
            .iter()
            .find_map(|name| Architecture::from_provider_name(name))?;
        Some(Self {
            architecture,
            core_count: record.core_count,
            threads_per_core: record.threads_per_core,
            memory_mib: record.memory_mib,
            ssd_count: record.ssd_count,
            ssd_total_size_gb: record.ssd_total_size_gb,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceFamilyInfo {
    /// Sorted by name.
    pub instance_types: Vec<String>,
    /// Member with the most cores (ties broken by memory).
    pub max_instance_type: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Instance type {instance_type} is not known in region {region}")]
pub struct UnknownInstanceTypeError {
    pub region: String,
    pub instance_type: String,
}

/// Instance types of a single region, in the cache file layout.
pub type RegionInstanceTypes = BTreeMap<String, InstanceTypeInfo>;
type CacheContent = BTreeMap<String, RegionInstanceTypes>;

#[derive(Default)]
struct RegionCatalog {
    instance_types: RegionInstanceTypes,
    families: Map<String, InstanceFamilyInfo>,
}

impl RegionCatalog {
    fn new(instance_types: RegionInstanceTypes) -> Self {
        let mut members: Map<String, Vec<String>> = Map::new();
        for name in instance_types.keys() {
            members
                .entry(instance_family(name).to_string())
                .or_default()
                .push(name.clone());
        }
        let families = members
            .into_iter()
            .filter_map(|(family, mut names)| {
                names.sort();
                let max_instance_type = names
                    .iter()
                    .max_by(|a, b| {
                        let (a_info, b_info) = (&instance_types[*a], &instance_types[*b]);
                        (a_info.core_count, a_info.memory_mib)
                            .cmp(&(b_info.core_count, b_info.memory_mib))
                            .then_with(|| b.cmp(a))
                    })?
                    .clone();
                Some((
                    family,
                    InstanceFamilyInfo {
                        instance_types: names,
                        max_instance_type,
                    },
                ))
            })
            .collect();
        Self {
            instance_types,
            families,
        }
    }
}

/// `c6i.2xlarge` -> `c6i`
pub fn instance_family(instance_type: &str) -> &str {
    instance_type
        .split_once('.')
        .map(|(family, _)| family)
        .unwrap_or(instance_type)
}

/// Instance types available in each region.
#[derive(Default)]
pub struct InstanceCatalog {
    regions: Map<String, RegionCatalog>,
}

impl InstanceCatalog {
    /// Populates the catalog for the given regions.
    ///
    /// Regions present in the cache file are taken from it as they are. The others are fetched
    /// from the provider and written back into the cache one by one. A region that cannot be
    /// fetched is left out of the catalog.
    pub async fn refresh(ctx: &FleetContext, regions: &[String]) -> Self {
        let cache_path = ctx.config.instance_type_cache.as_deref();
        let mut cached = cache_path.map(read_cache).unwrap_or_default();

        let mut catalog = InstanceCatalog::default();
        for region in regions {
            if catalog.has_region(region) {
                continue;
            }
            if let Some(instance_types) = cached.get(region) {
                log::debug!("Using cached instance types of region {region}");
                catalog.insert_region(region, instance_types.clone());
                continue;
            }
            match fetch_region(ctx, region).await {
                Ok(instance_types) => {
                    log::debug!(
                        "Fetched {} instance types of region {region}",
                        instance_types.len()
                    );
                    if let Some(path) = cache_path {
                        cached.insert(region.clone(), instance_types.clone());
                        if let Err(error) = write_cache(path, &cached) {
                            log::warn!("Cannot update instance type cache: {error:?}");
                        }
                    }
                    catalog.insert_region(region, instance_types);
                }
                Err(error) => {
                    log::error!("Cannot fetch instance types of region {region}: {error:?}");
                    ctx.metrics
                        .count(names::CATALOG_REFRESH_FAILED, &[("Region", region)]);
                }
            }
        }
        catalog
    }

    pub fn insert_region(&mut self, region: &str, instance_types: RegionInstanceTypes) {
        self.regions
            .insert(region.to_string(), RegionCatalog::new(instance_types));
    }

    pub fn has_region(&self, region: &str) -> bool {
        self.regions.contains_key(region)
    }

    pub fn get(
        &self,
        region: &str,
        instance_type: &str,
    ) -> Result<&InstanceTypeInfo, UnknownInstanceTypeError> {
        self.regions
            .get(region)
            .and_then(|catalog| catalog.instance_types.get(instance_type))
            .ok_or_else(|| UnknownInstanceTypeError {
                region: region.to_string(),
                instance_type: instance_type.to_string(),
            })
    }

    pub fn get_family(
        &self,
        region: &str,
        family: &str,
    ) -> Result<&InstanceFamilyInfo, UnknownInstanceTypeError> {
        self.regions
            .get(region)
            .and_then(|catalog| catalog.families.get(family))
            .ok_or_else(|| UnknownInstanceTypeError {
                region: region.to_string(),
                instance_type: format!("{family}.*"),
            })
    }

    pub fn get_family_max(
        &self,
        region: &str,
        family: &str,
    ) -> Result<&str, UnknownInstanceTypeError> {
        self.get_family(region, family)
            .map(|info| info.max_instance_type.as_str())
    }
}

async fn fetch_region(ctx: &FleetContext, region: &str) -> anyhow::Result<RegionInstanceTypes> {
    let records = fetch_all_pages(&ctx.retry, "describe instance types", |token| {
        ctx.provider.describe_instance_types(region, token)
    })
    .await?;
    let mut instance_types = RegionInstanceTypes::new();
    for record in records {
        match InstanceTypeInfo::from_record(&record) {
            Some(info) => {
                instance_types.insert(record.instance_type, info);
            }
            None => log::debug!(
                "Skipping instance type {} with architectures {:?}",
                record.instance_type,
                record.architectures
            ),
        }
    }
    Ok(instance_types)
}

fn read_cache(path: &Path) -> CacheContent {
    if !path.exists() {
        return CacheContent::new();
    }
    let content: anyhow::Result<CacheContent> = std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|content| Ok(serde_json::from_str(&content)?));
    match content {
        Ok(content) => content,
        Err(error) => {
            log::warn!(
                "Ignoring invalid instance type cache {}: {error:?}",
                path.display()
            );
            CacheContent::new()
        }
    }
}

/// Replaces the cache file atomically, so readers never observe a partially written file.
fn write_cache(path: &Path, content: &CacheContent) -> anyhow::Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(directory)
        .with_context(|| format!("Cannot create a temporary file in {}", directory.display()))?;
    serde_json::to_writer_pretty(&mut file, content)?;
    file.write_all(b"\n")?;
    file.persist(path)
        .map_err(|error| error.error)
        .with_context(|| format!("Cannot write instance type cache {}", path.display()))?;
    Ok(())
}
