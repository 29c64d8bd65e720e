//! Core data model for compute-unit attribution
//!
//! A `ComputeUnit` is a workload externally scheduled by a workload manager
//! (a Slurm job, a libvirt-managed VM, or a Kubernetes pod). Everything this
//! crate collects is ultimately attributed back to one of these.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// A compute unit discovered by the cgroup manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeUnit {
    /// Opaque id extracted from the cgroup path by a manager-specific regex.
    pub id: String,
    /// Stable identifier supplied by the manager; equals `id` when the
    /// manager has no separate identifier (e.g. Slurm job id).
    pub uuid: String,
    /// Cgroup subtree root(s) owning this unit's processes.
    pub cgroup_paths: Vec<String>,
    /// Member processes observed in the current discovery pass.
    pub processes: Vec<Process>,
    /// Device bindings derived by the GPU mapper, empty until populated.
    #[serde(default)]
    pub gpu_bindings: Vec<ComputeUnitBinding>,
    /// cgroup-derived resource usage, read by `CgroupManager::discover`
    /// alongside process enumeration since both come from the same
    /// cgroup subtree.
    #[serde(skip, default)]
    pub cgroup_stats: UnitCgroupStats,
}

impl ComputeUnit {
    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().map(|p| p.pid).collect()
    }
}

/// A process attributed to exactly one `ComputeUnit` for this scrape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Process {
    pub pid: u32,
    pub cmdline: Vec<String>,
    /// Lazily populated; only read when `target_env_vars` filtering is enabled.
    #[serde(default)]
    pub environ: Option<HashMap<String, String>>,
    pub uids: Vec<u32>,
    /// Cgroup membership lines as read from `/proc/<pid>/cgroup`.
    #[serde(default)]
    pub cgroups: Vec<String>,
}

impl Process {
    pub fn cmdline_joined(&self) -> String {
        self.cmdline.join(" ")
    }

    pub fn has_any_env_var(&self, vars: &[String]) -> bool {
        match &self.environ {
            Some(env) => vars.iter().any(|v| env.contains_key(v)),
            None => false,
        }
    }
}

/// GPU partitioning modes. A device with `Instance` partitioning is not
/// itself bindable; only its `GpuInstance`s bind to compute units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitioningMode {
    None,
    Instance,
    Mediated,
}

/// A physical (or, for AMD, logical) GPU device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Vendor tool enumeration order (`nvidia-smi`/`rocm-smi` index).
    pub local_index: u32,
    /// Monotonic index across physical devices and partitions. Empty when
    /// `partitioning_mode == Instance` (the device itself isn't bindable).
    pub global_index: Option<u32>,
    pub uuid: String,
    pub pci_bus_id: BusId,
    pub name: String,
    pub partitioning_mode: PartitioningMode,
    pub instances: Vec<GpuInstance>,
    pub mediator_uuids: Vec<String>,
    pub compute_units: Vec<String>,
    pub current_shares: u64,
}

impl GpuDevice {
    pub fn is_mig(&self) -> bool {
        self.partitioning_mode == PartitioningMode::Instance
    }

    /// Sum of fractional SM shares across instances; should be ~1.0 for a
    /// fully-partitioned MIG device.
    pub fn instance_sm_fraction_sum(&self) -> f64 {
        self.instances.iter().map(|i| i.sm_fraction).sum()
    }
}

/// A GPU hardware partition (NVIDIA MIG instance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInstance {
    pub local_index: u32,
    pub global_index: Option<u32>,
    /// MIG partition UUID (`MIG-…`), when the vendor tool reports one.
    /// Empty when unavailable; kubelet PodResources binding falls back to
    /// matching by `gpu_instance_id` in that case.
    #[serde(default)]
    pub uuid: String,
    pub gpu_instance_id: u32,
    pub compute_instance_id: u32,
    /// Fraction of the parent device's SMs this instance owns, in (0, 1].
    pub sm_fraction: f64,
    pub mediator_uuids: Vec<String>,
    pub compute_units: Vec<String>,
    pub current_shares: u64,
}

/// A unit's claim on a device or instance. A device may carry several
/// bindings when time-sliced across units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeUnitBinding {
    pub uuid: String,
    pub num_shares: u64,
}

impl ComputeUnitBinding {
    /// Effective metric weight: `num_shares / current_shares`, or 1 when
    /// nothing else currently holds the device.
    pub fn effective_weight(&self, current_shares: u64) -> f64 {
        if current_shares > 0 {
            self.num_shares as f64 / current_shares as f64
        } else {
            1.0
        }
    }
}

/// One perf-event sample as read from the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSample {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
}

impl CounterSample {
    /// Scale `value` for the fraction of the interval the event was
    /// actually scheduled on a PMU (`perf_event_open(2)` multiplexing).
    /// Returns the raw value unscaled when `time_running == 0` (event
    /// never ran, e.g. immediately after open).
    pub fn scaled_value(&self) -> u64 {
        if self.time_running == 0 {
            return 0;
        }
        if self.time_running >= self.time_enabled {
            return self.value;
        }
        ((self.value as u128 * self.time_enabled as u128) / self.time_running as u128) as u64
    }
}

/// Per-device block I/O counters, one entry per `(unit, device)` pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlkioDeviceStats {
    pub device: String,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

/// Cgroup-derived resource usage for one compute unit, read directly from
/// its cgroup subtree (`cpu.stat`, `memory.stat`, the PSI files, and the
/// blkio/io accounting files) rather than from any sub-collector below.
#[derive(Debug, Clone, Default)]
pub struct UnitCgroupStats {
    pub cpu_user_seconds: f64,
    pub cpu_system_seconds: f64,
    pub memory_rss_bytes: u64,
    pub memory_cache_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_fail_count: u64,
    pub cpu_pressure: f64,
    pub memory_pressure: f64,
    pub io_pressure: f64,
    pub blkio: Vec<BlkioDeviceStats>,
}

/// One emitted sample, carried on the Coordinator's shared channel from a
/// sub-collector to the metrics registry. Each variant maps to one
/// metric family.
#[derive(Debug, Clone)]
pub enum MetricSample {
    CgroupStats {
        unit: ComputeUnit,
        stats: UnitCgroupStats,
    },
    PerfCounter {
        unit_uuid: String,
        event: String,
        value: u64,
    },
    EbpfCounter {
        unit_uuid: String,
        metric: String,
        value: u64,
    },
    RdmaCounter {
        unit_uuid: Option<String>,
        device: String,
        port: Option<u32>,
        counter: String,
        value: u64,
    },
    GpuBinding {
        unit_uuid: String,
        index: String,
        hindex: String,
        gpu_uuid: String,
        gpu_instance_id: String,
        weight: f64,
    },
    CollectError {
        scope: String,
        failed: bool,
    },
}

/// A cached value together with the instant it was last refreshed, used by
/// caches that evict on a TTL (GPU binding cache, unit cache).
#[derive(Debug, Clone)]
pub struct TimedEntry<T> {
    pub value: T,
    pub refreshed_at: Instant,
}

impl<T> TimedEntry<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            refreshed_at: Instant::now(),
        }
    }

    pub fn is_stale(&self, ttl: std::time::Duration) -> bool {
        self.refreshed_at.elapsed() >= ttl
    }
}

/// A PCI bus address, `DDDD:BB:DD.F` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusId {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl BusId {
    pub fn parse(s: &str) -> Option<Self> {
        let (domain_bus_dev, function) = s.split_once('.')?;
        let mut parts = domain_bus_dev.split(':');
        let domain = u16::from_str_radix(parts.next()?, 16).ok()?;
        let bus = u8::from_str_radix(parts.next()?, 16).ok()?;
        let device = u8::from_str_radix(parts.next()?, 16).ok()?;
        if parts.next().is_some() {
            return None;
        }
        let function = u8::from_str_radix(function, 16).ok()?;
        Some(Self {
            domain,
            bus,
            device,
            function,
        })
    }
}

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busid_round_trip() {
        for (s, expected) in [
            (
                "0000:3b:00.0",
                BusId {
                    domain: 0,
                    bus: 0x3b,
                    device: 0,
                    function: 0,
                },
            ),
            (
                "ffff:ff:1f.7",
                BusId {
                    domain: 0xffff,
                    bus: 0xff,
                    device: 0x1f,
                    function: 7,
                },
            ),
        ] {
            let parsed = BusId::parse(s).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(BusId::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn busid_rejects_malformed() {
        assert!(BusId::parse("not-a-busid").is_none());
        assert!(BusId::parse("0000:3b:00").is_none());
    }

    #[test]
    fn counter_sample_scaling() {
        let s = CounterSample {
            value: 1000,
            time_enabled: 200,
            time_running: 100,
        };
        assert_eq!(s.scaled_value(), 2000);

        let full = CounterSample {
            value: 500,
            time_enabled: 100,
            time_running: 100,
        };
        assert_eq!(full.scaled_value(), 500);

        let never_ran = CounterSample {
            value: 0,
            time_enabled: 100,
            time_running: 0,
        };
        assert_eq!(never_ran.scaled_value(), 0);
    }

    #[test]
    fn binding_effective_weight() {
        let b = ComputeUnitBinding {
            uuid: "pod-a".into(),
            num_shares: 2,
        };
        assert_eq!(b.effective_weight(4), 0.5);
        assert_eq!(b.effective_weight(0), 1.0);
    }
}
