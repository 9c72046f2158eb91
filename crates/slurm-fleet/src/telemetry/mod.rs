//! Operational metrics of the fleet controller.
//!
//! Every component reports through [`MetricsEmitter`], which tags each datum with the cluster
//! name and swallows sink failures, so reporting can never fail an invocation.
pub mod publish;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::json;

pub const CLUSTER_DIMENSION: &str = "Cluster";

/// Names of the emitted metrics.
pub mod names {
    pub const NODE_COUNT: &str = "NodeCount";
    pub const INVALID_HOSTNAME: &str = "InvalidHostname";
    pub const DUPLICATE_INSTANCE: &str = "DuplicateInstance";
    pub const INSUFFICIENT_CAPACITY: &str = "InsufficientCapacity";
    pub const CREATE_INSTANCE: &str = "CreateInstance";
    pub const CREATE_INSTANCE_FAILED: &str = "CreateInstanceFailed";
    pub const CREATE_INSTANCE_TIMEOUT: &str = "CreateInstanceTimeout";
    pub const START_INSTANCES: &str = "StartInstances";
    pub const START_INSTANCES_FAILED: &str = "StartInstancesFailed";
    pub const STOP_INSTANCES: &str = "StopInstances";
    pub const STOP_INSTANCES_FAILED: &str = "StopInstancesFailed";
    pub const TERMINATE_INSTANCES: &str = "TerminateInstances";
    pub const TERMINATE_INSTANCES_FAILED: &str = "TerminateInstancesFailed";
    pub const TERMINATE_OLD_INSTANCES: &str = "TerminateOldInstances";
    pub const STOPPING_TIMEOUT: &str = "StoppingTimeout";
    pub const STOPPING_POLL_FAILED: &str = "StoppingPollFailed";
    pub const MARK_NODE_DOWN: &str = "MarkNodeDown";
    pub const MARK_NODE_DOWN_FAILED: &str = "MarkNodeDownFailed";
    pub const CATALOG_REFRESH_FAILED: &str = "InstanceTypeRefreshFailed";
    pub const UNHANDLED_EXCEPTION: &str = "UnhandledException";
    pub const JOB_COUNT: &str = "JobCount";
    pub const SCHEDULER_NODE_COUNT: &str = "SchedulerNodeCount";
    pub const LICENSES_TOTAL: &str = "LicensesTotal";
    pub const LICENSES_USED: &str = "LicensesUsed";
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDatum {
    pub name: String,
    pub value: f64,
    pub dimensions: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

impl MetricDatum {
    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Destination of metric data.
pub trait MetricsSink {
    fn publish(&self, namespace: &str, datum: &MetricDatum) -> anyhow::Result<()>;
}

/// Appends every datum as one line in the CloudWatch embedded metric format.
pub struct EmfFileSink {
    path: PathBuf,
}

impl EmfFileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

fn emf_record(namespace: &str, datum: &MetricDatum) -> serde_json::Value {
    let dimension_names: Vec<&str> = datum.dimensions.iter().map(|(key, _)| key.as_str()).collect();
    let mut record = json!({
        "_aws": {
            "Timestamp": datum.timestamp.timestamp_millis(),
            "CloudWatchMetrics": [{
                "Namespace": namespace,
                "Dimensions": [dimension_names],
                "Metrics": [{"Name": datum.name, "Unit": "Count"}],
            }],
        },
    });
    if let Some(fields) = record.as_object_mut() {
        for (key, value) in &datum.dimensions {
            fields.insert(key.clone(), json!(value));
        }
        fields.insert(datum.name.clone(), json!(datum.value));
    }
    record
}

impl MetricsSink for EmfFileSink {
    fn publish(&self, namespace: &str, datum: &MetricDatum) -> anyhow::Result<()> {
        let line = serde_json::to_string(&emf_record(namespace, datum))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Cannot open metrics file {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Only logs the metrics.
pub struct LogSink;

impl MetricsSink for LogSink {
    fn publish(&self, namespace: &str, datum: &MetricDatum) -> anyhow::Result<()> {
        let dimensions: Vec<String> = datum
            .dimensions
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        log::info!(
            "Metric {namespace}/{} = {} [{}]",
            datum.name,
            datum.value,
            dimensions.join(", ")
        );
        Ok(())
    }
}

pub struct MetricsEmitter {
    namespace: String,
    cluster_name: String,
    sink: Box<dyn MetricsSink>,
}

impl MetricsEmitter {
    pub fn new(namespace: String, cluster_name: String, sink: Box<dyn MetricsSink>) -> Self {
        Self {
            namespace,
            cluster_name,
            sink,
        }
    }

    pub fn emit(&self, name: &str, value: f64, dimensions: &[(&str, &str)]) {
        let mut all_dimensions = vec![(CLUSTER_DIMENSION.to_string(), self.cluster_name.clone())];
        all_dimensions.extend(
            dimensions
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        );
        let datum = MetricDatum {
            name: name.to_string(),
            value,
            dimensions: all_dimensions,
            timestamp: Utc::now(),
        };
        if let Err(error) = self.sink.publish(&self.namespace, &datum) {
            log::warn!("Cannot publish metric {name}: {error:?}");
        }
    }

    pub fn count(&self, name: &str, dimensions: &[(&str, &str)]) {
        self.emit(name, 1.0, dimensions);
    }
}
