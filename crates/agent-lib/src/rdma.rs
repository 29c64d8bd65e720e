//! Per-device/port RDMA hardware counters, plus per-process resource (MR,
//! CQ, QP) attribution to owning compute units.
//!
//! Two independent sources are combined each scrape: the
//! `/sys/class/infiniband/<dev>/ports/<p>/{counters,hw_counters}/*` sysfs
//! tree (host-wide, no unit scoping), and the `rdma` netlink CLI's
//! per-resource process listing, cross-referenced to the owning unit by
//! pid via the attribution pid index — the same shell-out-and-parse idiom
//! the GPU SMI discovery uses for `nvidia-smi`/`rocm-smi`.

use crate::attribution;
use crate::models::{ComputeUnit, MetricSample};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(10);
const RESOURCE_KINDS: &[&str] = &["mr", "cq", "qp"];

pub struct RdmaCollector {
    sysfs_root: PathBuf,
}

impl RdmaCollector {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }

    pub async fn collect(&self, units: &[ComputeUnit]) -> Vec<MetricSample> {
        let mut samples = self.collect_port_counters().await;
        samples.extend(self.collect_process_resources(units).await);
        samples
    }

    /// Host-wide per-port counters, scoped with no unit label
    /// (`unit_uuid: None`).
    async fn collect_port_counters(&self) -> Vec<MetricSample> {
        let mut samples = Vec::new();

        let mut devices = match tokio::fs::read_dir(&self.sysfs_root).await {
            Ok(e) => e,
            Err(e) => {
                debug!(root = %self.sysfs_root.display(), error = %e, "no RDMA devices present, skipping");
                return samples;
            }
        };

        while let Ok(Some(dev_entry)) = devices.next_entry().await {
            let device = dev_entry.file_name().to_string_lossy().to_string();
            let ports_dir = dev_entry.path().join("ports");
            let Ok(mut ports) = tokio::fs::read_dir(&ports_dir).await else {
                continue;
            };

            while let Ok(Some(port_entry)) = ports.next_entry().await {
                let Ok(port) = port_entry.file_name().to_string_lossy().parse::<u32>() else {
                    continue;
                };
                for subdir in ["counters", "hw_counters"] {
                    self.read_counter_dir(&device, port, &port_entry.path().join(subdir), &mut samples)
                        .await;
                }
            }
        }

        samples
    }

    async fn read_counter_dir(&self, device: &str, port: u32, dir: &std::path::Path, samples: &mut Vec<MetricSample>) {
        let Ok(mut files) = tokio::fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(file_entry)) = files.next_entry().await {
            if !matches!(file_entry.file_type().await, Ok(ft) if ft.is_file()) {
                continue;
            }
            let name = file_entry.file_name().to_string_lossy().to_string();
            let Ok(content) = tokio::fs::read_to_string(file_entry.path()).await else {
                continue;
            };
            let Ok(value) = content.trim().parse::<u64>() else {
                continue;
            };
            samples.push(MetricSample::RdmaCounter {
                unit_uuid: None,
                device: device.to_string(),
                port: Some(port),
                counter: name,
                value,
            });
        }
    }

    /// Per-process MR/CQ/QP counts, attributed to a unit via the pid
    /// cross-reference and summed to one `{kind}_count` sample per
    /// `(unit, device)`.
    async fn collect_process_resources(&self, units: &[ComputeUnit]) -> Vec<MetricSample> {
        let pid_to_unit = attribution::pid_to_unit_index(units);
        let mut samples = Vec::new();

        for &kind in RESOURCE_KINDS {
            let resources = match run_rdma_resource_show(kind).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(kind, error = %e, "rdma resource show failed, no counts for this kind this scrape");
                    continue;
                }
            };

            let mut per_unit_device: HashMap<(String, String), u64> = HashMap::new();
            for resource in resources {
                let Some(unit_uuid) = pid_to_unit.get(&resource.pid) else {
                    continue;
                };
                *per_unit_device
                    .entry((unit_uuid.clone(), resource.dev.clone()))
                    .or_insert(0) += 1;
            }

            for ((unit_uuid, device), count) in per_unit_device {
                samples.push(MetricSample::RdmaCounter {
                    unit_uuid: Some(unit_uuid),
                    device,
                    port: None,
                    counter: format!("{kind}_count"),
                    value: count,
                });
            }
        }

        samples
    }
}

#[derive(Debug, Deserialize)]
struct RdmaResource {
    #[serde(default)]
    dev: String,
    #[serde(default)]
    pid: u32,
}

async fn run_rdma_resource_show(kind: &str) -> anyhow::Result<Vec<RdmaResource>> {
    let output = timeout(
        SUBPROCESS_TIMEOUT,
        Command::new("rdma").args(["-j", "resource", "show", kind]).output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("rdma resource show {kind} timed out"))??;

    if !output.status.success() {
        anyhow::bail!("rdma resource show {kind} exited with {}", output.status);
    }

    parse_resource_show(&String::from_utf8_lossy(&output.stdout))
}

/// `rdma -j resource show {mr,cq,qp}` emits a JSON array of objects; this
/// only reads the `dev`/`pid` fields it needs, ignoring the rest.
fn parse_resource_show(json: &str) -> anyhow::Result<Vec<RdmaResource>> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Process;
    use tempfile::tempdir;
    use tokio::fs as tfs;

    fn unit(uuid: &str, pids: &[u32]) -> ComputeUnit {
        ComputeUnit {
            id: uuid.into(),
            uuid: uuid.into(),
            processes: pids
                .iter()
                .map(|p| Process {
                    pid: *p,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_rdma_resource_show_json() {
        let json = r#"[{"dev":"mlx5_0","pid":1234,"type":"qp"},{"dev":"mlx5_0","pid":1234,"type":"qp"}]"#;
        let resources = parse_resource_show(json).unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].dev, "mlx5_0");
        assert_eq!(resources[0].pid, 1234);
    }

    #[test]
    fn parses_empty_resource_list() {
        let resources = parse_resource_show("[]").unwrap();
        assert!(resources.is_empty());
    }

    #[tokio::test]
    async fn collects_port_counters_from_sysfs_tree() {
        let dir = tempdir().unwrap();
        let port_dir = dir.path().join("mlx5_0/ports/1/counters");
        tfs::create_dir_all(&port_dir).await.unwrap();
        tfs::write(port_dir.join("port_xmit_data"), "1024\n").await.unwrap();
        tfs::write(port_dir.join("port_rcv_data"), "2048\n").await.unwrap();

        let collector = RdmaCollector::new(dir.path());
        let samples = collector.collect_port_counters().await;

        assert_eq!(samples.len(), 2);
        for sample in &samples {
            match sample {
                MetricSample::RdmaCounter { unit_uuid, device, port, .. } => {
                    assert!(unit_uuid.is_none());
                    assert_eq!(device, "mlx5_0");
                    assert_eq!(*port, Some(1));
                }
                _ => panic!("expected RdmaCounter sample"),
            }
        }
    }

    #[tokio::test]
    async fn missing_sysfs_root_yields_no_samples() {
        let collector = RdmaCollector::new("/nonexistent-infiniband-root-xyz");
        let samples = collector.collect_port_counters().await;
        assert!(samples.is_empty());
    }

    #[test]
    fn pid_cross_reference_groups_by_unit_and_device() {
        let units = vec![unit("job-1", &[100, 101]), unit("job-2", &[200])];
        let index = attribution::pid_to_unit_index(&units);
        assert_eq!(index.get(&100), Some(&"job-1".to_string()));
        assert_eq!(index.get(&200), Some(&"job-2".to_string()));
    }
}
