//! Cgroup-scoped I/O and network byte/op accounting via eBPF.
//!
//! The kernel-side programs live in the sibling `ceems-ebpf` crate and are
//! compiled ahead of time to a separate BPF target (see the workspace's
//! `xtask`); this module only owns the userspace half: loading the object,
//! attaching its four programs, and reading the two maps it exposes back
//! into per-unit samples. Both maps are keyed by cgroup inode id, so the
//! join against a `ComputeUnit` is a `stat(2)` of its cgroup path rather
//! than a second id-allocation scheme shared across the kernel/userspace
//! boundary.

use crate::error::{CollectError, Result};
use crate::models::{ComputeUnit, MetricSample};
use crate::security::SecurityContext;
use aya::maps::HashMap as BpfHashMap;
use aya::programs::{CgroupAttachMode, CgroupSkb, CgroupSkbAttachType, KProbe};
use aya::Ebpf;
use ceems_ebpf_common::{IoCounters, NetCounters};
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use tracing::{debug, warn};

static BPF_OBJ: &[u8] =
    aya::include_bytes_aligned!("../../ceems-ebpf/target/bpfel-unknown-none/release/ceems-ebpf");

pub struct EbpfCollector {
    ebpf: Ebpf,
    cgroup_fs_root: PathBuf,
}

impl EbpfCollector {
    /// Loads `ceems-ebpf`, attaches the `vfs_read`/`vfs_write` kretprobes
    /// and the egress/ingress `cgroup_skb` programs against `cgroup_fs_root`
    /// (normally `/sys/fs/cgroup`, the v2 unified mount — attaching at the
    /// root observes every descendant cgroup). Program load and attach both
    /// require `CAP_BPF`/`CAP_PERFMON` (or root); failure here is fatal at
    /// startup, same as the perf paranoid-level check, since there's no
    /// degraded mode for a collector whose kernel half never attached.
    pub fn load(security: &SecurityContext, cgroup_fs_root: impl Into<PathBuf>) -> Result<Self> {
        let cgroup_fs_root = cgroup_fs_root.into();
        let root_for_closure = cgroup_fs_root.clone();

        security.exec(move || -> anyhow::Result<Ebpf> {
            let mut ebpf = Ebpf::load(BPF_OBJ)?;

            let read_probe: &mut KProbe = ebpf.program_mut("vfs_read_exit").unwrap().try_into()?;
            read_probe.load()?;
            read_probe.attach("vfs_read", 0)?;

            let write_probe: &mut KProbe = ebpf.program_mut("vfs_write_exit").unwrap().try_into()?;
            write_probe.load()?;
            write_probe.attach("vfs_write", 0)?;

            let cgroup = File::open(&root_for_closure)?;

            let egress: &mut CgroupSkb = ebpf.program_mut("ceems_egress").unwrap().try_into()?;
            egress.load()?;
            egress.attach(&cgroup, CgroupSkbAttachType::Egress, CgroupAttachMode::Single)?;

            let ingress: &mut CgroupSkb = ebpf.program_mut("ceems_ingress").unwrap().try_into()?;
            ingress.load()?;
            ingress.attach(&cgroup, CgroupSkbAttachType::Ingress, CgroupAttachMode::Single)?;

            Ok(ebpf)
        })
        .map(|ebpf| Self { ebpf, cgroup_fs_root })
        .map_err(|e| CollectError::KernelCapability(format!("loading ceems-ebpf: {e}")))
    }

    /// Reads and clears both counter maps for each unit's cgroup inode.
    /// An inode with no entry yet (no I/O or network activity observed
    /// since the last scrape, or since load) contributes nothing for that
    /// unit this round — the zero is implicit, not emitted.
    pub async fn collect(&mut self, units: &[ComputeUnit]) -> Vec<MetricSample> {
        let mut samples = Vec::new();

        let mut io_map = match BpfHashMap::<_, u64, IoCounters>::try_from(self.ebpf.map_mut("IO_COUNTERS").unwrap())
        {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "IO_COUNTERS map unavailable");
                return samples;
            }
        };
        let mut net_map =
            match BpfHashMap::<_, u64, NetCounters>::try_from(self.ebpf.map_mut("NET_COUNTERS").unwrap()) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "NET_COUNTERS map unavailable");
                    return samples;
                }
            };

        for unit in units {
            let Some(cgroup_path) = unit.cgroup_paths.first() else {
                continue;
            };
            let ino = match std::fs::metadata(cgroup_path) {
                Ok(meta) => meta.ino(),
                Err(e) => {
                    debug!(path = %cgroup_path, error = %e, "cannot stat unit cgroup for eBPF join");
                    continue;
                }
            };

            if let Ok(counters) = io_map.get(&ino, 0) {
                push_nonzero(&mut samples, &unit.uuid, "io_read_bytes_total", counters.read_bytes);
                push_nonzero(&mut samples, &unit.uuid, "io_write_bytes_total", counters.write_bytes);
                push_nonzero(&mut samples, &unit.uuid, "io_read_ops_total", counters.read_ops);
                push_nonzero(&mut samples, &unit.uuid, "io_write_ops_total", counters.write_ops);
                let _ = io_map.remove(&ino);
            }

            if let Ok(counters) = net_map.get(&ino, 0) {
                push_nonzero(&mut samples, &unit.uuid, "net_rx_bytes_total", counters.rx_bytes);
                push_nonzero(&mut samples, &unit.uuid, "net_tx_bytes_total", counters.tx_bytes);
                push_nonzero(&mut samples, &unit.uuid, "net_rx_packets_total", counters.rx_packets);
                push_nonzero(&mut samples, &unit.uuid, "net_tx_packets_total", counters.tx_packets);
                let _ = net_map.remove(&ino);
            }
        }

        samples
    }

    pub fn cgroup_fs_root(&self) -> &PathBuf {
        &self.cgroup_fs_root
    }
}

fn push_nonzero(samples: &mut Vec<MetricSample>, unit_uuid: &str, metric: &str, value: u64) {
    if value == 0 {
        return;
    }
    samples.push(MetricSample::EbpfCounter {
        unit_uuid: unit_uuid.to_string(),
        metric: metric.to_string(),
        value,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_nonzero_skips_zero_values() {
        let mut samples = Vec::new();
        push_nonzero(&mut samples, "unit-a", "io_read_bytes_total", 0);
        assert!(samples.is_empty());
        push_nonzero(&mut samples, "unit-a", "io_read_bytes_total", 42);
        assert_eq!(samples.len(), 1);
        match &samples[0] {
            MetricSample::EbpfCounter { unit_uuid, metric, value } => {
                assert_eq!(unit_uuid, "unit-a");
                assert_eq!(metric, "io_read_bytes_total");
                assert_eq!(*value, 42);
            }
            _ => panic!("wrong variant"),
        }
    }
}
