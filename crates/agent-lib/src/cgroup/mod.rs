//! Cgroup discovery: walks a workload manager's configured mount roots and
//! enumerates the compute units (and their member processes) active right
//! now.
//!
//! Resolution of "which processes does this compute unit own" crosses two
//! kernel APIs depending on cgroup version (`cgroup.procs` for v2, the union
//! of each controller's `tasks`/`cgroup.procs` for v1); `version` picks
//! between them per mount root.

pub mod stats;
mod v1;
mod v2;

pub use v1::CgroupV1Reader;
pub use v2::CgroupV2Reader;

use crate::error::{CollectError, Result};
use crate::manager::Manager;
use crate::models::{ComputeUnit, Process};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Which on-disk cgroup layout a mount root uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

/// Detects the cgroup version in effect for `root` by probing for the v2
/// unified-hierarchy marker file, falling back to v1's per-controller
/// directories.
pub async fn detect_version(root: &Path) -> Option<CgroupVersion> {
    if fs::metadata(root.join("cgroup.controllers")).await.is_ok() {
        return Some(CgroupVersion::V2);
    }
    if fs::metadata(root.join("cpuacct")).await.is_ok() || fs::metadata(root.join("memory")).await.is_ok() {
        return Some(CgroupVersion::V1);
    }
    None
}

/// Override for `--collector.cgroups.force-version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionOverride {
    #[default]
    Auto,
    V1,
    V2,
}

#[derive(Clone)]
pub struct CgroupManager {
    manager: Manager,
    version_override: VersionOverride,
    target_env_vars: Vec<String>,
}

impl CgroupManager {
    pub fn new(manager: Manager, version_override: VersionOverride, target_env_vars: Vec<String>) -> Self {
        Self {
            manager,
            version_override,
            target_env_vars,
        }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Walks every configured mount root breadth-first, keeping the
    /// top-level cgroup of each unit (basename matches the id regex, and
    /// the child-cgroup predicate rejects it — i.e. it's not a per-step
    /// subtree). For each kept cgroup, reads member pids and builds one
    /// `ComputeUnit` record.
    ///
    /// A single unreadable cgroup is logged and skipped. A mount root that
    /// doesn't exist at all returns `NoData` for *that root only*; other
    /// roots are still walked. If every configured root is absent, the
    /// overall scrape returns `NoData`.
    pub async fn discover(&self) -> Result<Vec<ComputeUnit>> {
        let mut units = Vec::new();
        let mut any_root_present = false;

        for root in self.manager.mount_roots() {
            match fs::metadata(root).await {
                Ok(_) => any_root_present = true,
                Err(_) => {
                    debug!(root = %root.display(), "mount root absent, skipping");
                    continue;
                }
            }

            let version = match self.version_override {
                VersionOverride::V1 => CgroupVersion::V1,
                VersionOverride::V2 => CgroupVersion::V2,
                VersionOverride::Auto => match detect_version(root).await {
                    Some(v) => v,
                    None => {
                        warn!(root = %root.display(), "could not detect cgroup version, skipping root");
                        continue;
                    }
                },
            };

            self.walk_root(root, version, &mut units).await;
        }

        if !any_root_present {
            return Err(CollectError::NoData(
                "no configured cgroup mount root is present".into(),
            ));
        }

        Ok(units)
    }

    async fn walk_root(&self, root: &Path, version: CgroupVersion, units: &mut Vec<ComputeUnit>) {
        let mut queue = VecDeque::new();
        queue.push_back(root.to_path_buf());

        while let Some(dir) = queue.pop_front() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "unreadable cgroup directory, skipping");
                    continue;
                }
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if !matches!(entry.file_type().await, Ok(ft) if ft.is_dir()) {
                    continue;
                }

                let path_str = path.to_string_lossy();
                let basename = entry.file_name().to_string_lossy().to_string();

                if self.manager.is_child_cgroup(&path_str) {
                    // Per-step/per-task subtree: walk into it but it's not a unit itself.
                    queue.push_back(path.clone());
                    continue;
                }

                if let Some(caps) = self.manager.id_regex().captures(&basename) {
                    let id = caps.get(1).map(|m| m.as_str()).unwrap_or(&basename).to_string();
                    match self.read_unit(&path, &id, version).await {
                        Ok(unit) => units.push(unit),
                        Err(e) => debug!(cgroup = %path.display(), error = %e, "failed to read unit, skipping"),
                    }
                } else {
                    // Not a unit's own cgroup yet; descend in case units nest deeper.
                    queue.push_back(path);
                }
            }
        }
    }

    async fn read_unit(&self, cgroup_path: &Path, id: &str, version: CgroupVersion) -> anyhow::Result<ComputeUnit> {
        let pids = match version {
            CgroupVersion::V2 => v2::CgroupV2Reader::member_pids(cgroup_path).await?,
            CgroupVersion::V1 => v1::CgroupV1Reader::member_pids(cgroup_path).await?,
        };

        let mut processes = Vec::with_capacity(pids.len());
        for pid in pids {
            match self.read_process(pid).await {
                Ok(Some(p)) => processes.push(p),
                Ok(None) => {} // filtered out
                Err(e) => debug!(pid, error = %e, "failed to read process, skipping"),
            }
        }

        let cgroup_stats = stats::collect_unit_stats(cgroup_path, version).await;

        Ok(ComputeUnit {
            id: id.to_string(),
            uuid: id.to_string(),
            cgroup_paths: vec![cgroup_path.to_string_lossy().to_string()],
            processes,
            gpu_bindings: Vec::new(),
            cgroup_stats,
        })
    }

    /// Reads `/proc/<pid>/{cmdline,status,environ,cgroup}`, applies the
    /// ignore-process and target-env-var filters, and returns `None` when
    /// the process should be dropped from attribution.
    async fn read_process(&self, pid: u32) -> anyhow::Result<Option<Process>> {
        let proc_dir = PathBuf::from("/proc").join(pid.to_string());

        let cmdline_raw = fs::read(proc_dir.join("cmdline")).await?;
        let cmdline: Vec<String> = cmdline_raw
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();

        let joined = cmdline.join(" ");
        if self.manager.ignore_process_regex().as_str() != "^$"
            && self.manager.ignore_process_regex().is_match(&joined)
        {
            return Ok(None);
        }

        let uids = read_uids(&proc_dir).await.unwrap_or_default();
        let cgroups = read_cgroup_lines(&proc_dir).await.unwrap_or_default();

        let environ = if !self.target_env_vars.is_empty() {
            Some(read_environ(&proc_dir).await.unwrap_or_default())
        } else {
            None
        };

        let process = Process {
            pid,
            cmdline,
            environ,
            uids,
            cgroups,
        };

        if !self.target_env_vars.is_empty() && !process.has_any_env_var(&self.target_env_vars) {
            return Ok(None);
        }

        Ok(Some(process))
    }
}

async fn read_uids(proc_dir: &Path) -> anyhow::Result<Vec<u32>> {
    let content = fs::read_to_string(proc_dir.join("status")).await?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            return Ok(rest
                .split_whitespace()
                .filter_map(|t| t.parse().ok())
                .collect());
        }
    }
    Ok(Vec::new())
}

async fn read_environ(proc_dir: &Path) -> anyhow::Result<std::collections::HashMap<String, String>> {
    let raw = fs::read(proc_dir.join("environ")).await?;
    Ok(raw
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let s = String::from_utf8_lossy(s);
            s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect())
}

async fn read_cgroup_lines(proc_dir: &Path) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(proc_dir.join("cgroup")).await?;
    Ok(content.lines().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SlurmLayout;
    use tempfile::tempdir;
    use tokio::fs as tfs;

    async fn make_v2_job_cgroup(root: &Path, job_id: &str, pids: &[u32]) -> PathBuf {
        let job_dir = root
            .join("system.slice/slurmstepd.scope")
            .join(format!("job_{job_id}"));
        tfs::create_dir_all(&job_dir).await.unwrap();
        tfs::write(root.join("cgroup.controllers"), "cpu memory io\n")
            .await
            .unwrap();
        let procs = pids.iter().map(|p| p.to_string()).collect::<Vec<_>>().join("\n");
        tfs::write(job_dir.join("cgroup.procs"), procs).await.unwrap();
        job_dir
    }

    #[tokio::test]
    async fn discover_returns_nodata_when_root_absent() {
        let manager = Manager::Slurm(SlurmLayout::new("/nonexistent-root-xyz", "/nonexistent-root-xyz"));
        let cm = CgroupManager::new(manager, VersionOverride::Auto, vec![]);
        let result = cm.discover().await;
        assert!(matches!(result, Err(CollectError::NoData(_))));
    }

    #[tokio::test]
    async fn discover_finds_slurm_job_cgroup_v2() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        make_v2_job_cgroup(root, "1009248", &[]).await;

        let manager = Manager::Slurm(SlurmLayout::new(root.to_str().unwrap(), "/nonexistent"));
        let cm = CgroupManager::new(manager, VersionOverride::V2, vec![]);
        let units = cm.discover().await.unwrap();

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, "1009248");
    }

    #[tokio::test]
    async fn discover_skips_step_subtree() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let job_dir = make_v2_job_cgroup(root, "1009249", &[]).await;
        let step_dir = job_dir.join("step_0");
        tfs::create_dir_all(&step_dir).await.unwrap();
        tfs::write(step_dir.join("cgroup.procs"), "").await.unwrap();

        let manager = Manager::Slurm(SlurmLayout::new(root.to_str().unwrap(), "/nonexistent"));
        let cm = CgroupManager::new(manager, VersionOverride::V2, vec![]);
        let units = cm.discover().await.unwrap();

        // Only the job cgroup itself is a unit, not its step_0 child.
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, "1009249");
    }
}
