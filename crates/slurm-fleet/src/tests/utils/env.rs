use crate::config::{ClusterConfig, ConfigFormat};
use crate::context::FleetContext;
use crate::provider::InstanceTypeRecord;
use crate::telemetry::{MetricDatum, MetricsSink};
use crate::tests::utils::cloud::{FakeCloud, FakeProvider, InstanceSpecBuilder};
use crate::tests::utils::scheduler::{FakeScheduler, SchedulerState};
use crate::WrappedRcRefCell;

const TEST_CONFIG: &str = r#"
cluster_name: eda
resume_timeout: 5s
stopping_wait: 50ms
stopping_poll_interval: 10ms
max_instances_per_call: 10
max_nodes_per_instance_type: 4
retry:
  min_delay: 1ms
  max_delay: 2ms
  base_delay: 1ms
  max_elapsed: 10ms
regions:
  - name: us-east-1
    instance_types: [c6i.large, c7g.xlarge]
    images:
      - distribution: Amazon
        version: 2
        architecture: x86_64
        image_id: ami-x86
      - distribution: Amazon
        version: 2
        architecture: arm64
        image_id: ami-arm
    subnets:
      - id: subnet-1a
        availability_zone: us-east-1a
      - id: subnet-1b
        availability_zone: us-east-1b
  - name: us-west-2
    instance_types: [m6i.large]
    images:
      - distribution: Amazon
        version: 2
        architecture: x86_64
        image_id: ami-west
    subnets:
      - id: subnet-2a
        availability_zone: us-west-2a
"#;

pub fn test_config() -> ClusterConfig {
    ClusterConfig::parse(TEST_CONFIG, ConfigFormat::Yaml).unwrap()
}

pub fn instance_type_record(
    instance_type: &str,
    architecture: &str,
    core_count: u32,
    memory_mib: u64,
) -> InstanceTypeRecord {
    InstanceTypeRecord {
        instance_type: instance_type.to_string(),
        architectures: vec![architecture.to_string()],
        core_count,
        threads_per_core: 2,
        memory_mib,
        ssd_count: 0,
        ssd_total_size_gb: 0,
    }
}

/// Metrics sink that keeps everything in memory.
#[derive(Default, Clone)]
pub struct MemorySink {
    data: WrappedRcRefCell<Vec<MetricDatum>>,
}

impl MemorySink {
    pub fn data(&self) -> Vec<MetricDatum> {
        self.data.get().clone()
    }

    /// Sum of all values published under the metric name.
    pub fn total(&self, name: &str) -> f64 {
        self.data
            .get()
            .iter()
            .filter(|datum| datum.name == name)
            .map(|datum| datum.value)
            .sum()
    }
}

impl MetricsSink for MemorySink {
    fn publish(&self, _namespace: &str, datum: &MetricDatum) -> anyhow::Result<()> {
        self.data.get_mut().push(datum.clone());
        Ok(())
    }
}

pub struct TestEnv {
    pub ctx: FleetContext,
    pub cloud: WrappedRcRefCell<FakeCloud>,
    pub scheduler: WrappedRcRefCell<SchedulerState>,
    pub metrics: MemorySink,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ClusterConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let cloud = WrappedRcRefCell::wrap(FakeCloud::default());
        {
            let mut cloud = cloud.get_mut();
            cloud.page_size = 100;
            cloud.instance_types.insert(
                "us-east-1".to_string(),
                vec![
                    instance_type_record("c6i.large", "x86_64", 1, 4096),
                    instance_type_record("c7g.xlarge", "arm64", 4, 8192),
                ],
            );
            cloud.instance_types.insert(
                "us-west-2".to_string(),
                vec![instance_type_record("m6i.large", "x86_64", 1, 8192)],
            );
        }
        let scheduler = WrappedRcRefCell::wrap(SchedulerState::default());
        let metrics = MemorySink::default();
        let ctx = FleetContext::new(
            config,
            Box::new(FakeProvider::new(cloud.clone())),
            Box::new(FakeScheduler::new(scheduler.clone())),
            Box::new(metrics.clone()),
        );
        Self {
            ctx,
            cloud,
            scheduler,
            metrics,
        }
    }

    /// Launches an instance into the fake cloud and returns its id.
    pub fn add_instance(&self, spec: InstanceSpecBuilder) -> String {
        let (region, mut instance) = spec.build();
        let mut cloud = self.cloud.get_mut();
        instance.instance_id = cloud.new_instance_id();
        let instance_id = instance.instance_id.clone();
        cloud.instances.entry(region).or_default().push(instance);
        instance_id
    }
}
