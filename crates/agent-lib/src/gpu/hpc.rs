//! HPC (Slurm) GPU binding source: a job-properties file listing the GPU
//! ordinals allocated to one job, written by the prolog/scheduler outside
//! this crate's scope. One file per unit, named after the unit id, holding
//! newline- or comma-separated ordinals of the form `device_index` or
//! `device_index.gpu_instance_id` (MIG partition).

use super::GpuTarget;
use crate::models::ComputeUnit;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Reads `{dir}/{unit.id}` for every unit and returns one `(target,
/// unit_uuid)` pair per listed ordinal. A missing file means the unit has
/// no GPU allocation and is silently skipped — most jobs on a GPU partition
/// don't request one.
pub async fn read_bindings(dir: &Path, units: &[ComputeUnit]) -> Vec<(GpuTarget, String)> {
    let mut bindings = Vec::new();
    for unit in units {
        let path = dir.join(&unit.id);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => continue,
        };
        for token in content.split(|c: char| c == ',' || c == '\n' || c == '\r') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match parse_ordinal(token) {
                Some(target) => bindings.push((target, unit.uuid.clone())),
                None => debug!(unit = %unit.id, token, "unparseable gpu ordinal, skipping"),
            }
        }
    }
    bindings
}

fn parse_ordinal(token: &str) -> Option<GpuTarget> {
    match token.split_once('.') {
        Some((device, instance)) => Some(GpuTarget::Ordinal {
            device_local_index: device.parse().ok()?,
            gpu_instance_id: Some(instance.parse().ok()?),
        }),
        None => Some(GpuTarget::Ordinal {
            device_local_index: token.parse().ok()?,
            gpu_instance_id: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Process;
    use tempfile::tempdir;

    fn unit(id: &str) -> ComputeUnit {
        ComputeUnit {
            id: id.into(),
            uuid: id.into(),
            processes: vec![Process::default()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reads_plain_and_mig_ordinals() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("1009248"), "0,1.3\n2\n")
            .await
            .unwrap();

        let bindings = read_bindings(dir.path(), &[unit("1009248")]).await;
        assert_eq!(bindings.len(), 3);
        assert!(bindings.iter().any(|(t, u)| matches!(t, GpuTarget::Ordinal { device_local_index: 0, gpu_instance_id: None }) && u == "1009248"));
        assert!(bindings.iter().any(|(t, _)| matches!(t, GpuTarget::Ordinal { device_local_index: 1, gpu_instance_id: Some(3) })));
    }

    #[tokio::test]
    async fn missing_file_yields_no_bindings() {
        let dir = tempdir().unwrap();
        let bindings = read_bindings(dir.path(), &[unit("no-gpu-job")]).await;
        assert!(bindings.is_empty());
    }
}
