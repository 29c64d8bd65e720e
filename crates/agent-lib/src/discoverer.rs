//! `/alloy-targets` service discovery.
//!
//! Grafana Alloy (and any other Prometheus-compatible `http_sd_config`
//! consumer) polls this to learn which pids it should attach its own
//! per-process profiler to, one target per member process of a discovered
//! compute unit. Filtering is identical to the cgroup manager's own
//! discovery pass — this is deliberately not a second independent walk of
//! `/proc`, it reuses the same `CgroupManager`.

use crate::cgroup::CgroupManager;
use crate::error::Result;
use crate::models::ComputeUnit;
use serde::Serialize;

/// One `http_sd_config` target group: a single pid, labeled with the
/// owning unit's uuid so Alloy can join profiles back to it.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    pub targets: Vec<String>,
    pub labels: TargetLabels,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetLabels {
    pub service_name: String,
    #[serde(rename = "__process_pid__")]
    pub process_pid: String,
}

/// The internal id used for the exporter's own self-profiling target,
/// distinguishing it from any real compute unit that happens to have an
/// empty id.
const SELF_PROFILE_UNIT_ID: &str = "__internal_ceems_exporter";

pub struct TargetDiscoverer {
    cgroup_manager: CgroupManager,
    self_profiler: bool,
}

impl TargetDiscoverer {
    pub fn new(cgroup_manager: CgroupManager, self_profiler: bool) -> Self {
        Self {
            cgroup_manager,
            self_profiler,
        }
    }

    /// Re-runs unit discovery and flattens it into one target per member
    /// process. A unit with no live processes contributes nothing, same as
    /// the metrics path drops it before attribution.
    pub async fn discover(&self) -> Result<Vec<Target>> {
        let units = self.cgroup_manager.discover().await?;
        Ok(Self::targets_for(&units, self.self_profiler))
    }

    fn targets_for(units: &[ComputeUnit], self_profiler: bool) -> Vec<Target> {
        let mut targets = Vec::new();
        for unit in units {
            for process in &unit.processes {
                targets.push(Target {
                    targets: vec![unit.id.clone()],
                    labels: TargetLabels {
                        service_name: unit.uuid.clone(),
                        process_pid: process.pid.to_string(),
                    },
                });
            }
        }

        if self_profiler {
            targets.push(Target {
                targets: vec![SELF_PROFILE_UNIT_ID.to_string()],
                labels: TargetLabels {
                    service_name: SELF_PROFILE_UNIT_ID.to_string(),
                    process_pid: std::process::id().to_string(),
                },
            });
        }

        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Process;

    fn unit(id: &str, pids: &[u32]) -> ComputeUnit {
        ComputeUnit {
            id: id.into(),
            uuid: format!("uuid-{id}"),
            processes: pids
                .iter()
                .map(|&pid| Process {
                    pid,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn one_target_per_member_process() {
        let units = vec![unit("job_1", &[100, 101]), unit("job_2", &[200])];
        let targets = TargetDiscoverer::targets_for(&units, false);
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].targets, vec!["job_1".to_string()]);
        assert_eq!(targets[0].labels.service_name, "uuid-job_1");
        assert_eq!(targets[0].labels.process_pid, "100");
    }

    #[test]
    fn empty_unit_contributes_nothing() {
        let units = vec![unit("job_1", &[])];
        let targets = TargetDiscoverer::targets_for(&units, false);
        assert!(targets.is_empty());
    }

    #[test]
    fn self_profiler_appends_one_synthetic_target() {
        let units = vec![unit("job_1", &[100])];
        let targets = TargetDiscoverer::targets_for(&units, true);
        assert_eq!(targets.len(), 2);
        let synthetic = &targets[1];
        assert_eq!(synthetic.targets, vec![SELF_PROFILE_UNIT_ID.to_string()]);
        assert_eq!(synthetic.labels.process_pid, std::process::id().to_string());
    }

    #[test]
    fn target_serializes_with_prometheus_sd_shape() {
        let targets = TargetDiscoverer::targets_for(&[unit("job_1", &[100])], false);
        let json = serde_json::to_value(&targets[0]).unwrap();
        assert_eq!(json["targets"], serde_json::json!(["job_1"]));
        assert_eq!(json["labels"]["service_name"], "uuid-job_1");
        assert_eq!(json["labels"]["__process_pid__"], "100");
    }
}
