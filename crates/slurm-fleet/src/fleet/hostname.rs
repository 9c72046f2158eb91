//! Compute node names encode the identity of the node:
//! `<distribution><version>-<architecture>-<family>-<short size>[-sp]-<index>`,
//! e.g. `am2-x86-c6i-l-0` or `r8-arm-c7g-2xl-sp-12`.
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Marker field of spot nodes.
pub const SPOT_MARKER: &str = "sp";

/// Long instance size suffixes and their shortened forms.
const SIZE_SUFFIXES: [(&str, &str); 5] = [
    ("large", "l"),
    ("medium", "m"),
    ("micro", "u"),
    ("nano", "n"),
    ("small", "s"),
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid hostname `{hostname}`: {reason}")]
pub struct InvalidHostnameError {
    pub hostname: String,
    pub reason: String,
}

impl InvalidHostnameError {
    fn new(hostname: &str, reason: impl Into<String>) -> Self {
        Self {
            hostname: hostname.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distribution {
    AlmaLinux,
    Amazon,
    CentOS,
    RedHat,
    Rocky,
}

impl Distribution {
    pub fn code(&self) -> &'static str {
        match self {
            Distribution::AlmaLinux => "a",
            Distribution::Amazon => "am",
            Distribution::CentOS => "c",
            Distribution::RedHat => "rh",
            Distribution::Rocky => "r",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "a" => Some(Distribution::AlmaLinux),
            "am" => Some(Distribution::Amazon),
            "c" => Some(Distribution::CentOS),
            "rh" => Some(Distribution::RedHat),
            "r" => Some(Distribution::Rocky),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Architecture {
    /// Three character tag used in hostnames.
    pub fn short_name(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86",
            Architecture::Arm64 => "arm",
        }
    }

    pub fn from_short_name(name: &str) -> Option<Self> {
        match name {
            "x86" => Some(Architecture::X86_64),
            "arm" => Some(Architecture::Arm64),
            _ => None,
        }
    }

    /// Name used by the compute provider.
    pub fn provider_name(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }

    pub fn from_provider_name(name: &str) -> Option<Self> {
        match name {
            "x86_64" => Some(Architecture::X86_64),
            "arm64" => Some(Architecture::Arm64),
            _ => None,
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.provider_name())
    }
}

/// Everything that can be read out of a compute node name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub distribution: Distribution,
    pub distribution_version: u32,
    pub architecture: Architecture,
    pub instance_family: String,
    pub instance_size: String,
    pub spot: bool,
    pub index: u32,
}

impl NodeIdentity {
    pub fn instance_type(&self) -> String {
        format!("{}.{}", self.instance_family, self.instance_size)
    }

    /// Hostname without the trailing index, e.g. `am2-x86-c6i-l-`.
    pub fn name_prefix(&self) -> String {
        let mut prefix = format!(
            "{}{}-{}-{}-{}-",
            self.distribution.code(),
            self.distribution_version,
            self.architecture.short_name(),
            self.instance_family,
            shorten_instance_size(&self.instance_size)
        );
        if self.spot {
            prefix.push_str(SPOT_MARKER);
            prefix.push('-');
        }
        prefix
    }
}

/// `2xlarge` -> `2xl`, `medium` -> `m`. Sizes with an unknown suffix are returned unchanged.
pub fn shorten_instance_size(size: &str) -> String {
    for (long, short) in SIZE_SUFFIXES {
        if let Some(multiplier) = size.strip_suffix(long) {
            if is_size_multiplier(multiplier) {
                return format!("{multiplier}{short}");
            }
        }
    }
    size.to_string()
}

/// Inverse of [`shorten_instance_size`].
pub fn expand_instance_size(size: &str) -> String {
    for (long, short) in SIZE_SUFFIXES {
        if let Some(multiplier) = size.strip_suffix(short) {
            if is_size_multiplier(multiplier) {
                return format!("{multiplier}{long}");
            }
        }
    }
    size.to_string()
}

/// Sizes are either bare (`large`) or prefixed with an optional count and `x`
/// (`xlarge`, `24xlarge`).
fn is_size_multiplier(prefix: &str) -> bool {
    match prefix.strip_suffix('x') {
        Some(count) => count.chars().all(|c| c.is_ascii_digit()),
        None => prefix.is_empty(),
    }
}

fn decode_distribution(
    hostname: &str,
    field: &str,
) -> Result<(Distribution, u32), InvalidHostnameError> {
    let split = field
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| InvalidHostnameError::new(hostname, "missing distribution version"))?;
    let (code, version) = field.split_at(split);
    let distribution = Distribution::from_code(code).ok_or_else(|| {
        InvalidHostnameError::new(hostname, format!("unknown distribution code `{code}`"))
    })?;
    let version = version.parse().map_err(|_| {
        InvalidHostnameError::new(hostname, format!("invalid distribution version `{version}`"))
    })?;
    Ok((distribution, version))
}

pub fn decode_hostname(hostname: &str) -> Result<NodeIdentity, InvalidHostnameError> {
    let fields: Vec<&str> = hostname.split('-').collect();
    let spot = match fields.len() {
        5 => false,
        6 if fields[4] == SPOT_MARKER => true,
        6 => {
            return Err(InvalidHostnameError::new(
                hostname,
                format!("expected spot marker `{SPOT_MARKER}`, found `{}`", fields[4]),
            ));
        }
        count => {
            return Err(InvalidHostnameError::new(
                hostname,
                format!("expected 5 or 6 fields, found {count}"),
            ));
        }
    };

    let (distribution, distribution_version) = decode_distribution(hostname, fields[0])?;
    let architecture = Architecture::from_short_name(fields[1]).ok_or_else(|| {
        InvalidHostnameError::new(hostname, format!("unknown architecture `{}`", fields[1]))
    })?;
    let instance_family = fields[2];
    if instance_family.is_empty() || !instance_family.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(InvalidHostnameError::new(hostname, "invalid instance family"));
    }
    let instance_size = fields[3];
    if instance_size.is_empty() {
        return Err(InvalidHostnameError::new(hostname, "empty instance size"));
    }
    let index_field = fields[fields.len() - 1];
    let index = index_field.parse().map_err(|_| {
        InvalidHostnameError::new(hostname, format!("invalid node index `{index_field}`"))
    })?;

    Ok(NodeIdentity {
        distribution,
        distribution_version,
        architecture,
        instance_family: instance_family.to_string(),
        instance_size: expand_instance_size(instance_size),
        spot,
        index,
    })
}

pub fn encode_hostname(identity: &NodeIdentity) -> String {
    format!("{}{}", identity.name_prefix(), identity.index)
}
