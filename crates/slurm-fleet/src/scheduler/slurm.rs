use std::path::PathBuf;

use anyhow::Context;

use crate::common::command::execute_command;
use crate::scheduler::{LicenseUsage, NodeStatus, SchedulerControl, SchedulerFuture};
use crate::{Map, Set};

/// Drives Slurm through `scontrol`, `squeue` and `sinfo`.
pub struct SlurmControl {
    bin_dir: Option<PathBuf>,
}

impl SlurmControl {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    fn program(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    fn update_nodes(&self, hostnames: &[String], state: &str, reason: &str) -> SchedulerFuture<()> {
        let program = self.program("scontrol");
        let arguments = vec![
            "update".to_string(),
            format!("nodename={}", hostnames.join(",")),
            format!("state={state}"),
            format!("reason={reason}"),
        ];
        Box::pin(async move {
            execute_command(&program, &arguments).await?;
            Ok(())
        })
    }
}

impl SchedulerControl for SlurmControl {
    fn drain(&self, hostnames: &[String], reason: &str) -> SchedulerFuture<()> {
        self.update_nodes(hostnames, "DRAIN", reason)
    }

    fn requeue_jobs(&self, hostname: &str, reason: &str) -> SchedulerFuture<Vec<String>> {
        let squeue = self.program("squeue");
        let scontrol = self.program("scontrol");
        let hostname = hostname.to_string();
        let reason = reason.to_string();
        Box::pin(async move {
            let output = execute_command(
                &squeue,
                &[
                    "--noheader".to_string(),
                    format!("--nodelist={hostname}"),
                    "--format=%A".to_string(),
                ],
            )
            .await?;
            let job_ids = parse_job_ids(&output);
            if job_ids.is_empty() {
                return Ok(job_ids);
            }
            log::info!(
                "Requeueing jobs {} of node {hostname}: {reason}",
                job_ids.join(",")
            );
            execute_command(&scontrol, &["requeue".to_string(), job_ids.join(",")])
                .await
                .with_context(|| format!("Cannot requeue jobs of node {hostname}"))?;
            Ok(job_ids)
        })
    }

    fn mark_down(&self, hostname: &str, reason: &str) -> SchedulerFuture<()> {
        self.update_nodes(&[hostname.to_string()], "DOWN", reason)
    }

    fn power_down(&self, hostname: &str, reason: &str) -> SchedulerFuture<()> {
        self.update_nodes(&[hostname.to_string()], "POWER_DOWN_FORCE", reason)
    }

    fn node_states(&self) -> SchedulerFuture<Vec<NodeStatus>> {
        let program = self.program("sinfo");
        Box::pin(async move {
            let output = execute_command(
                &program,
                &[
                    "--noheader".to_string(),
                    "--Node".to_string(),
                    "--format=%N %t".to_string(),
                ],
            )
            .await?;
            Ok(parse_node_states(&output))
        })
    }

    fn job_states(&self) -> SchedulerFuture<Vec<String>> {
        let program = self.program("squeue");
        Box::pin(async move {
            let output = execute_command(
                &program,
                &[
                    "--noheader".to_string(),
                    "--all".to_string(),
                    "--format=%T".to_string(),
                ],
            )
            .await?;
            Ok(output
                .lines()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
                .map(|line| line.to_string())
                .collect())
        })
    }

    fn licenses(&self) -> SchedulerFuture<Vec<LicenseUsage>> {
        let program = self.program("scontrol");
        Box::pin(async move {
            let output = execute_command(
                &program,
                &["show".to_string(), "lic".to_string(), "-o".to_string()],
            )
            .await?;
            parse_licenses(&output)
        })
    }
}

/// Parses `key=value` pairs separated by whitespace.
pub fn get_scontrol_items(output: &str) -> Map<&str, &str> {
    let mut map = Map::new();
    for line in output.lines() {
        for item in line.split_whitespace() {
            if let Some((key, value)) = item.split_once('=') {
                map.insert(key, value);
            }
        }
    }
    map
}

fn parse_job_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}

/// Parses `sinfo --Node --format="%N %t"` output. Nodes that are members of several
/// partitions are listed only once.
fn parse_node_states(output: &str) -> Vec<NodeStatus> {
    let mut seen = Set::new();
    let mut nodes = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(state)) = (fields.next(), fields.next()) else {
            continue;
        };
        if !seen.insert(name.to_string()) {
            continue;
        }
        nodes.push(NodeStatus {
            name: name.to_string(),
            state: state
                .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
                .to_string(),
            powered_down: state.contains('~'),
        });
    }
    nodes
}

fn parse_licenses(output: &str) -> anyhow::Result<Vec<LicenseUsage>> {
    let mut licenses = Vec::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let items = get_scontrol_items(line);
        let get_key = |key: &str| -> anyhow::Result<&str> {
            items
                .get(key)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("Missing key {key} in scontrol license output"))
        };
        let parse_count = |key: &str| -> anyhow::Result<u64> {
            let value = get_key(key)?;
            value.parse().map_err(|_| {
                anyhow::anyhow!("Invalid {key} value {value} in scontrol license output")
            })
        };
        licenses.push(LicenseUsage {
            name: get_key("LicenseName")?.to_string(),
            total: parse_count("Total")?,
            used: parse_count("Used")?,
        });
    }
    Ok(licenses)
}
