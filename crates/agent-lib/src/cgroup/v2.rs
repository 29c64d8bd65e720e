//! cgroup v2 unified-hierarchy reads.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

pub struct CgroupV2Reader;

impl CgroupV2Reader {
    /// Reads `cgroup.procs`, one pid per line.
    pub async fn member_pids(cgroup_path: &Path) -> Result<Vec<u32>> {
        let content = fs::read_to_string(cgroup_path.join("cgroup.procs"))
            .await
            .with_context(|| format!("reading cgroup.procs under {}", cgroup_path.display()))?;

        Ok(content
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect())
    }

    /// Parses `cpu.stat`, returning `(usage_usec, nr_throttled)`.
    pub fn parse_cpu_stat(content: &str) -> (u64, u64) {
        let mut usage_usec = 0u64;
        let mut nr_throttled = 0u64;
        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                continue;
            }
            match parts[0] {
                "usage_usec" => usage_usec = parts[1].parse().unwrap_or(0),
                "nr_throttled" => nr_throttled = parts[1].parse().unwrap_or(0),
                _ => {}
            }
        }
        (usage_usec, nr_throttled)
    }

    /// Parses `cpu.stat`'s `user_usec`/`system_usec` fields, returned in
    /// seconds for the `cpu_user_seconds`/`cpu_system_seconds` families.
    pub fn parse_cpu_user_system_seconds(content: &str) -> (f64, f64) {
        let mut user_usec = 0u64;
        let mut system_usec = 0u64;
        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                continue;
            }
            match parts[0] {
                "user_usec" => user_usec = parts[1].parse().unwrap_or(0),
                "system_usec" => system_usec = parts[1].parse().unwrap_or(0),
                _ => {}
            }
        }
        (user_usec as f64 / 1_000_000.0, system_usec as f64 / 1_000_000.0)
    }

    /// Parses `memory.events`' `oom`+`oom_kill` counts into a single
    /// failure count for the `memory_fail_count` family.
    pub fn parse_memory_events_fail_count(content: &str) -> u64 {
        let mut total = 0u64;
        for line in content.lines() {
            let mut it = line.split_whitespace();
            let Some(key) = it.next() else { continue };
            let Some(val) = it.next().and_then(|v| v.parse::<u64>().ok()) else {
                continue;
            };
            if key == "oom" || key == "oom_kill" {
                total += val;
            }
        }
        total
    }

    /// Parses `io.stat`: one line per device, `<major>:<minor> rbytes=.. wbytes=.. rios=.. wios=..`.
    pub fn parse_io_stat(content: &str) -> Vec<crate::models::BlkioDeviceStats> {
        let mut out = Vec::new();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let Some(device) = parts.next() else { continue };
            let mut stats = crate::models::BlkioDeviceStats {
                device: device.to_string(),
                ..Default::default()
            };
            for kv in parts {
                let Some((k, v)) = kv.split_once('=') else { continue };
                let v: u64 = v.parse().unwrap_or(0);
                match k {
                    "rbytes" => stats.read_bytes = v,
                    "wbytes" => stats.write_bytes = v,
                    "rios" => stats.read_ops = v,
                    "wios" => stats.write_ops = v,
                    _ => {}
                }
            }
            out.push(stats);
        }
        out
    }

    /// Parses `memory.stat` into a name -> value map.
    pub fn parse_memory_stat(content: &str) -> HashMap<String, u64> {
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

    /// Parses the PSI format shared by `cpu.pressure`/`memory.pressure`/`io.pressure`:
    /// `some avg10=0.00 avg60=0.00 avg300=0.00 total=0` (+ an optional `full` line).
    /// Returns the `some avg10` fraction (as a 0..1 ratio, not a percentage).
    pub fn parse_psi_some_avg10(content: &str) -> Option<f64> {
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("some ") {
                for kv in rest.split_whitespace() {
                    if let Some(v) = kv.strip_prefix("avg10=") {
                        return v.parse::<f64>().ok().map(|pct| pct / 100.0);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_stat() {
        let content = "usage_usec 123456789\nnr_periods 1000\nnr_throttled 50\n";
        let (usage, throttled) = CgroupV2Reader::parse_cpu_stat(content);
        assert_eq!(usage, 123456789);
        assert_eq!(throttled, 50);
    }

    #[test]
    fn parses_memory_stat() {
        let content = "anon 104857600\nfile 52428800\ninactive_file 26214400\n";
        let stats = CgroupV2Reader::parse_memory_stat(content);
        assert_eq!(stats.get("file"), Some(&52428800));
    }

    #[test]
    fn parses_psi() {
        let content = "some avg10=1.50 avg60=0.80 avg300=0.20 total=12345\nfull avg10=0.10 avg60=0.05 avg300=0.01 total=100\n";
        assert_eq!(CgroupV2Reader::parse_psi_some_avg10(content), Some(0.015));
    }

    #[test]
    fn parses_cpu_user_system_seconds() {
        let content = "usage_usec 3000000\nuser_usec 2000000\nsystem_usec 1000000\n";
        let (user, system) = CgroupV2Reader::parse_cpu_user_system_seconds(content);
        assert_eq!(user, 2.0);
        assert_eq!(system, 1.0);
    }

    #[test]
    fn parses_memory_events_fail_count() {
        let content = "low 0\nhigh 0\nmax 3\noom 2\noom_kill 1\n";
        assert_eq!(CgroupV2Reader::parse_memory_events_fail_count(content), 3);
    }

    #[test]
    fn parses_io_stat() {
        let content = "8:0 rbytes=1024 wbytes=2048 rios=4 wios=8\n8:16 rbytes=0 wbytes=0 rios=0 wios=0\n";
        let stats = CgroupV2Reader::parse_io_stat(content);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].device, "8:0");
        assert_eq!(stats[0].read_bytes, 1024);
        assert_eq!(stats[0].write_ops, 8);
    }
}
