//! cgroup v1 legacy-hierarchy reads. Member pids are the union of every
//! controller's `cgroup.procs` (or `tasks` on controllers that predate it)
//! for the unit's relative path, since v1 splits one unit across several
//! independent controller hierarchies.

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;

const CONTROLLERS: &[&str] = &["cpuacct", "memory", "cpu", "blkio", "devices"];

pub struct CgroupV1Reader;

impl CgroupV1Reader {
    /// `cgroup_path` here is the already-resolved path under one
    /// controller (e.g. `.../cpuacct/slurm/uid_1000/job_123`); mirror
    /// relative paths are tried under the other controllers rooted at the
    /// same ancestor.
    pub async fn member_pids(cgroup_path: &Path) -> Result<Vec<u32>> {
        let mut pids = HashSet::new();
        let candidates = Self::sibling_controller_paths(cgroup_path);

        for candidate in candidates {
            for filename in ["cgroup.procs", "tasks"] {
                if let Ok(content) = fs::read_to_string(candidate.join(filename)).await {
                    pids.extend(content.lines().filter_map(|l| l.trim().parse::<u32>().ok()));
                    break;
                }
            }
        }

        // If no sibling path resolution applied (path already IS the leaf
        // the caller wants to read) fall back to reading it directly.
        if pids.is_empty() {
            for filename in ["cgroup.procs", "tasks"] {
                if let Ok(content) = fs::read_to_string(cgroup_path.join(filename)).await {
                    pids.extend(content.lines().filter_map(|l| l.trim().parse::<u32>().ok()));
                    break;
                }
            }
        }

        Ok(pids.into_iter().collect())
    }

    /// Given `.../cpuacct/slurm/uid_1000/job_123`, returns the equivalent
    /// path under every other known controller:
    /// `.../memory/slurm/uid_1000/job_123`, etc.
    pub fn sibling_controller_paths(cgroup_path: &Path) -> Vec<std::path::PathBuf> {
        let components: Vec<_> = cgroup_path.components().collect();
        let Some(controller_idx) = components.iter().position(|c| {
            CONTROLLERS.iter().any(|ctrl| c.as_os_str() == *ctrl)
        }) else {
            return vec![];
        };

        let prefix: std::path::PathBuf = components[..controller_idx].iter().collect();
        let suffix: std::path::PathBuf = components[controller_idx + 1..].iter().collect();

        CONTROLLERS
            .iter()
            .map(|ctrl| prefix.join(ctrl).join(&suffix))
            .collect()
    }

    /// The path this unit's cgroup would have under `controller`, derived
    /// by swapping out whichever controller segment `cgroup_path` carries.
    /// Returns `cgroup_path` unchanged if no known controller segment is
    /// found (the path is assumed to already be relative to `controller`).
    pub fn controller_path(cgroup_path: &Path, controller: &str) -> std::path::PathBuf {
        let components: Vec<_> = cgroup_path.components().collect();
        let Some(controller_idx) = components
            .iter()
            .position(|c| CONTROLLERS.iter().any(|ctrl| c.as_os_str() == *ctrl))
        else {
            return cgroup_path.to_path_buf();
        };

        let prefix: std::path::PathBuf = components[..controller_idx].iter().collect();
        let suffix: std::path::PathBuf = components[controller_idx + 1..].iter().collect();
        prefix.join(controller).join(suffix)
    }

    /// Parses `cpu.stat` (v1 format: `nr_periods`/`nr_throttled`/`throttled_time`).
    pub fn parse_cpu_stat(content: &str) -> (u64, u64) {
        let mut nr_periods = 0u64;
        let mut nr_throttled = 0u64;
        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                continue;
            }
            match parts[0] {
                "nr_periods" => nr_periods = parts[1].parse().unwrap_or(0),
                "nr_throttled" => nr_throttled = parts[1].parse().unwrap_or(0),
                _ => {}
            }
        }
        (nr_periods, nr_throttled)
    }

    /// Parses `cpuacct.stat`'s `user`/`system` fields, given in USER_HZ
    /// ticks (conventionally 100/sec), converted to seconds.
    pub fn parse_cpuacct_stat_seconds(content: &str, user_hz: u64) -> (f64, f64) {
        let mut user_ticks = 0u64;
        let mut system_ticks = 0u64;
        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                continue;
            }
            match parts[0] {
                "user" => user_ticks = parts[1].parse().unwrap_or(0),
                "system" => system_ticks = parts[1].parse().unwrap_or(0),
                _ => {}
            }
        }
        (
            user_ticks as f64 / user_hz as f64,
            system_ticks as f64 / user_hz as f64,
        )
    }

    /// Parses `memory.stat`'s `rss`/`cache` keys into a name -> value map,
    /// the v1 analogue of v2's `anon`/`file`.
    pub fn parse_memory_stat(content: &str) -> std::collections::HashMap<String, u64> {
        content
            .lines()
            .filter_map(|l| {
                let mut it = l.split_whitespace();
                let key = it.next()?;
                let val: u64 = it.next()?.parse().ok()?;
                Some((key.to_string(), val))
            })
            .collect()
    }

    /// Parses `blkio.throttle.io_service_bytes`/`io_serviced`, whose lines
    /// are `<major>:<minor> Read|Write|Sync|Async|Total <value>`. Only
    /// `Read`/`Write` rows are kept; `Total` is derivable and ignored here.
    pub fn parse_blkio_throttle(
        io_service_bytes: &str,
        io_serviced: &str,
    ) -> Vec<crate::models::BlkioDeviceStats> {
        use std::collections::HashMap;
        let mut by_device: HashMap<String, crate::models::BlkioDeviceStats> = HashMap::new();

        let apply = |content: &str, by_device: &mut HashMap<String, crate::models::BlkioDeviceStats>, bytes: bool| {
            for line in content.lines() {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() != 3 {
                    continue;
                }
                let (device, op, value) = (parts[0], parts[1], parts[2]);
                let value: u64 = value.parse().unwrap_or(0);
                let entry = by_device.entry(device.to_string()).or_insert_with(|| {
                    crate::models::BlkioDeviceStats {
                        device: device.to_string(),
                        ..Default::default()
                    }
                });
                match (op, bytes) {
                    ("Read", true) => entry.read_bytes = value,
                    ("Write", true) => entry.write_bytes = value,
                    ("Read", false) => entry.read_ops = value,
                    ("Write", false) => entry.write_ops = value,
                    _ => {}
                }
            }
        };

        apply(io_service_bytes, &mut by_device, true);
        apply(io_serviced, &mut by_device, false);

        by_device.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::fs as tfs;

    #[tokio::test]
    async fn reads_procs_across_sibling_controllers() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        for ctrl in ["cpuacct", "memory"] {
            let p = root.join(ctrl).join("slurm/uid_1000/job_5");
            tfs::create_dir_all(&p).await.unwrap();
        }
        tfs::write(
            root.join("cpuacct/slurm/uid_1000/job_5/cgroup.procs"),
            "111\n222\n",
        )
        .await
        .unwrap();
        tfs::write(
            root.join("memory/slurm/uid_1000/job_5/cgroup.procs"),
            "222\n333\n",
        )
        .await
        .unwrap();

        let mut pids = CgroupV1Reader::member_pids(&root.join("cpuacct/slurm/uid_1000/job_5"))
            .await
            .unwrap();
        pids.sort_unstable();
        assert_eq!(pids, vec![111, 222, 333]);
    }

    #[test]
    fn parses_v1_cpu_stat() {
        let content = "nr_periods 500\nnr_throttled 10\nthrottled_time 1000\n";
        let (periods, throttled) = CgroupV1Reader::parse_cpu_stat(content);
        assert_eq!(periods, 500);
        assert_eq!(throttled, 10);
    }

    #[test]
    fn parses_cpuacct_stat_seconds() {
        let content = "user 200\nsystem 100\n";
        let (user, system) = CgroupV1Reader::parse_cpuacct_stat_seconds(content, 100);
        assert_eq!(user, 2.0);
        assert_eq!(system, 1.0);
    }

    #[test]
    fn parses_v1_memory_stat() {
        let content = "cache 52428800\nrss 104857600\nmapped_file 1024\n";
        let stats = CgroupV1Reader::parse_memory_stat(content);
        assert_eq!(stats.get("rss"), Some(&104857600));
    }

    #[test]
    fn parses_blkio_throttle() {
        let bytes = "8:0 Read 1024\n8:0 Write 2048\n8:0 Total 3072\n";
        let ops = "8:0 Read 4\n8:0 Write 8\n8:0 Total 12\n";
        let stats = CgroupV1Reader::parse_blkio_throttle(bytes, ops);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].device, "8:0");
        assert_eq!(stats[0].read_bytes, 1024);
        assert_eq!(stats[0].write_bytes, 2048);
        assert_eq!(stats[0].read_ops, 4);
        assert_eq!(stats[0].write_ops, 8);
    }
}
