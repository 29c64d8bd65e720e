#![cfg_attr(not(feature = "userspace"), no_std)]

//! Map value types shared between the `ceems-ebpf` kernel programs and the
//! userspace `EbpfCollector`. Every map here is keyed by cgroup inode id
//! (`u64`), the same identifier `stat(2)` returns for a cgroupfs directory,
//! so userspace can look a unit's counters up by `metadata(cgroup_path).ino()`
//! with no separate id-allocation handshake.

/// VFS read/write byte and operation counts for one cgroup.
#[repr(C)]
#[derive(Clone, Copy, Default)]
#[cfg_attr(feature = "userspace", derive(Debug))]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

/// TCP/UDP ingress/egress byte and packet counts for one cgroup.
#[repr(C)]
#[derive(Clone, Copy, Default)]
#[cfg_attr(feature = "userspace", derive(Debug))]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for IoCounters {}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for NetCounters {}
