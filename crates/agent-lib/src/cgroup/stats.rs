//! Per-unit cgroup resource accounting: the `cpu_*`/`memory_*`/`*_pressure`/
//! blkio families. These live in the same cgroup subtree
//! `CgroupManager::discover` already walked, so reading them is a second,
//! independent read pass over each unit's cgroup path rather than a
//! separate sub-collector.

use super::{v1::CgroupV1Reader, v2::CgroupV2Reader, CgroupVersion};
use crate::models::UnitCgroupStats;
use std::path::Path;
use tokio::fs;

const USER_HZ: u64 = 100;

/// Reads `UnitCgroupStats` for one unit's top-level cgroup directory.
/// Best-effort: any single missing/unreadable file just leaves that field
/// at its zero default rather than failing the whole read.
pub async fn collect_unit_stats(cgroup_path: &Path, version: CgroupVersion) -> UnitCgroupStats {
    match version {
        CgroupVersion::V2 => collect_v2(cgroup_path).await,
        CgroupVersion::V1 => collect_v1(cgroup_path).await,
    }
}

async fn collect_v2(path: &Path) -> UnitCgroupStats {
    let mut stats = UnitCgroupStats::default();

    if let Ok(content) = fs::read_to_string(path.join("cpu.stat")).await {
        let (user, system) = CgroupV2Reader::parse_cpu_user_system_seconds(&content);
        stats.cpu_user_seconds = user;
        stats.cpu_system_seconds = system;
    }

    if let Ok(content) = fs::read_to_string(path.join("memory.stat")).await {
        let mem = CgroupV2Reader::parse_memory_stat(&content);
        stats.memory_rss_bytes = mem.get("anon").copied().unwrap_or(0);
        stats.memory_cache_bytes = mem.get("file").copied().unwrap_or(0);
    }

    if let Ok(content) = fs::read_to_string(path.join("memory.current")).await {
        stats.memory_used_bytes = content.trim().parse().unwrap_or(0);
    }

    if let Ok(content) = fs::read_to_string(path.join("memory.max")).await {
        let trimmed = content.trim();
        if trimmed != "max" {
            stats.memory_total_bytes = trimmed.parse().unwrap_or(0);
        }
    }

    if let Ok(content) = fs::read_to_string(path.join("memory.events")).await {
        stats.memory_fail_count = CgroupV2Reader::parse_memory_events_fail_count(&content);
    }

    if let Ok(content) = fs::read_to_string(path.join("cpu.pressure")).await {
        stats.cpu_pressure = CgroupV2Reader::parse_psi_some_avg10(&content).unwrap_or(0.0);
    }
    if let Ok(content) = fs::read_to_string(path.join("memory.pressure")).await {
        stats.memory_pressure = CgroupV2Reader::parse_psi_some_avg10(&content).unwrap_or(0.0);
    }
    if let Ok(content) = fs::read_to_string(path.join("io.pressure")).await {
        stats.io_pressure = CgroupV2Reader::parse_psi_some_avg10(&content).unwrap_or(0.0);
    }

    if let Ok(content) = fs::read_to_string(path.join("io.stat")).await {
        stats.blkio = CgroupV2Reader::parse_io_stat(&content);
    }

    stats
}

async fn collect_v1(path: &Path) -> UnitCgroupStats {
    let mut stats = UnitCgroupStats::default();

    let cpuacct_path = CgroupV1Reader::controller_path(path, "cpuacct");
    if let Ok(content) = fs::read_to_string(cpuacct_path.join("cpuacct.stat")).await {
        let (user, system) = CgroupV1Reader::parse_cpuacct_stat_seconds(&content, USER_HZ);
        stats.cpu_user_seconds = user;
        stats.cpu_system_seconds = system;
    }

    let memory_path = CgroupV1Reader::controller_path(path, "memory");
    if let Ok(content) = fs::read_to_string(memory_path.join("memory.stat")).await {
        let mem = CgroupV1Reader::parse_memory_stat(&content);
        stats.memory_rss_bytes = mem.get("rss").copied().unwrap_or(0);
        stats.memory_cache_bytes = mem.get("cache").copied().unwrap_or(0);
    }
    if let Ok(content) = fs::read_to_string(memory_path.join("memory.usage_in_bytes")).await {
        stats.memory_used_bytes = content.trim().parse().unwrap_or(0);
    }
    if let Ok(content) = fs::read_to_string(memory_path.join("memory.limit_in_bytes")).await {
        stats.memory_total_bytes = content.trim().parse().unwrap_or(0);
    }
    if let Ok(content) = fs::read_to_string(memory_path.join("memory.failcnt")).await {
        stats.memory_fail_count = content.trim().parse().unwrap_or(0);
    }

    let blkio_path = CgroupV1Reader::controller_path(path, "blkio");
    let service_bytes = fs::read_to_string(blkio_path.join("blkio.throttle.io_service_bytes"))
        .await
        .unwrap_or_default();
    let serviced = fs::read_to_string(blkio_path.join("blkio.throttle.io_serviced"))
        .await
        .unwrap_or_default();
    if !service_bytes.is_empty() || !serviced.is_empty() {
        stats.blkio = CgroupV1Reader::parse_blkio_throttle(&service_bytes, &serviced);
    }

    // v1 has no per-cgroup PSI in general; pressure fields stay at 0.0.
    stats
}
