//! Core compute-unit discovery and attribution engine for the CEEMS
//! exporter.
//!
//! Walks a kernel cgroup hierarchy to find active compute units (Slurm
//! jobs, libvirt VMs, Kubernetes pods), attributes processes to them, opens
//! and aggregates per-process performance counters and eBPF-based
//! accounting bound to each unit's lifecycle, and maps GPU device ordinals
//! back to owning units. The HTTP exposition, CLI parsing and structured
//! logging init live in the `agent` binary crate; this crate is pure
//! collection logic.

pub mod attribution;
pub mod cgroup;
pub mod coordinator;
pub mod discoverer;
pub mod ebpf;
pub mod error;
pub mod gpu;
pub mod health;
pub mod manager;
pub mod models;
pub mod observability;
pub mod perf;
pub mod rdma;
pub mod security;

pub use cgroup::CgroupManager;
pub use coordinator::Coordinator;
pub use discoverer::TargetDiscoverer;
pub use ebpf::EbpfCollector;
pub use error::{CollectError, Result};
pub use gpu::GpuTopology;
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use manager::Manager;
pub use models::*;
pub use observability::{ExporterMetrics, StructuredLogger};
pub use perf::PerfCollector;
pub use rdma::RdmaCollector;
pub use security::SecurityContext;
