//! Per-scrape fan-out across sub-collectors.
//!
//! One `CgroupManager::discover` establishes the unit set for the round;
//! every enabled sub-collector then runs concurrently against that same
//! set, writing its samples onto one shared channel, and the scrape
//! doesn't complete until all of them have. A sub-collector that fails
//! only marks its own `collect_error` scope — it never takes the whole
//! scrape down with it. Each sub-collector gets its own task, joined at
//! the end, so a slow GPU SMI shell-out doesn't hold up cgroup stats.

use crate::attribution;
use crate::cgroup::CgroupManager;
use crate::ebpf::EbpfCollector;
use crate::error::{CollectError, Result};
use crate::gpu::GpuTopology;
use crate::health::components;
use crate::manager::Manager;
use crate::models::{ComputeUnit, MetricSample};
use crate::observability::{ExporterMetrics, StructuredLogger};
use crate::perf::PerfCollector;
use crate::rdma::RdmaCollector;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::warn;

/// Owns every configured sub-collector and drives one scrape across all of
/// them. Constructed once at startup; `with_*` builders attach whichever
/// collectors `--collector.*` flags enabled, leaving the rest absent.
pub struct Coordinator {
    cgroup_manager: CgroupManager,
    hostname: String,
    perf: Option<Arc<Mutex<PerfCollector>>>,
    ebpf: Option<Arc<Mutex<EbpfCollector>>>,
    rdma: Option<Arc<RdmaCollector>>,
    gpu: Option<Arc<Mutex<GpuTopology>>>,
    metrics: ExporterMetrics,
    logger: StructuredLogger,
    /// Serializes `scrape()` itself: sub-collectors each own mutable state
    /// (the perf handle map, the GPU device vector) that only one scrape
    /// may mutate at a time, so two overlapping HTTP requests must run
    /// their fan-outs one after another rather than interleaved.
    scrape_lock: Arc<Mutex<()>>,
}

impl Coordinator {
    pub fn new(
        cgroup_manager: CgroupManager,
        hostname: impl Into<String>,
        metrics: ExporterMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            cgroup_manager,
            hostname: hostname.into(),
            perf: None,
            ebpf: None,
            rdma: None,
            gpu: None,
            scrape_lock: Arc::new(Mutex::new(())),
            metrics,
            logger,
        }
    }

    pub fn with_perf(mut self, perf: PerfCollector) -> Self {
        self.perf = Some(Arc::new(Mutex::new(perf)));
        self
    }

    pub fn with_ebpf(mut self, ebpf: EbpfCollector) -> Self {
        self.ebpf = Some(Arc::new(Mutex::new(ebpf)));
        self
    }

    pub fn with_rdma(mut self, rdma: RdmaCollector) -> Self {
        self.rdma = Some(Arc::new(rdma));
        self
    }

    pub fn with_gpu(mut self, gpu: GpuTopology) -> Self {
        self.gpu = Some(Arc::new(Mutex::new(gpu)));
        self
    }

    pub fn cgroup_manager(&self) -> &CgroupManager {
        &self.cgroup_manager
    }

    /// Runs one full scrape: discover units, emit their cgroup stats
    /// directly, fan out to every enabled sub-collector concurrently, and
    /// record everything each one returns. Returns the number of units
    /// attributed this round.
    pub async fn scrape(&self) -> Result<usize> {
        let _guard = self.scrape_lock.lock().await;

        let start = Instant::now();
        let manager_name = self.cgroup_manager.manager().name();

        let units = match self.cgroup_manager.discover().await {
            Ok(units) => {
                self.metrics.set_collect_error(components::CGROUP, false);
                units
            }
            Err(CollectError::NoData(msg)) => {
                self.metrics.set_collect_error(components::CGROUP, false);
                self.logger.log_collect_error(components::CGROUP, None, &msg);
                Vec::new()
            }
            Err(e) => {
                self.metrics.set_collect_error(components::CGROUP, true);
                self.logger.log_collect_error(components::CGROUP, None, &e.to_string());
                return Err(e);
            }
        };

        let units = attribution::drop_empty_units(units);

        for unit in &units {
            self.metrics.record(
                manager_name,
                &MetricSample::CgroupStats {
                    unit: unit.clone(),
                    stats: unit.cgroup_stats.clone(),
                },
            );
        }

        let mut handles: Vec<tokio::task::JoinHandle<(&'static str, Vec<MetricSample>)>> = Vec::new();

        if let Some(perf) = self.perf.clone() {
            let units = units.clone();
            handles.push(tokio::spawn(async move {
                let samples = perf.lock().await.collect(&units).await;
                (components::PERF, samples)
            }));
        }

        if let Some(ebpf) = self.ebpf.clone() {
            let units = units.clone();
            handles.push(tokio::spawn(async move {
                let samples = ebpf.lock().await.collect(&units).await;
                (components::EBPF, samples)
            }));
        }

        if let Some(rdma) = self.rdma.clone() {
            let units = units.clone();
            handles.push(tokio::spawn(async move {
                let samples = rdma.collect(&units).await;
                (components::RDMA, samples)
            }));
        }

        if let Some(gpu) = self.gpu.clone() {
            let units = units.clone();
            let manager: Manager = self.cgroup_manager.manager().clone();
            let hostname = self.hostname.clone();
            handles.push(tokio::spawn(async move {
                let mut topology = gpu.lock().await;
                topology.discover().await;
                if let Err(e) = topology.update_bindings(&manager, &units).await {
                    warn!(error = %e, "gpu binding update failed");
                    return (components::GPU, vec![MetricSample::CollectError {
                        scope: components::GPU.to_string(),
                        failed: true,
                    }]);
                }
                (components::GPU, topology.binding_samples(&hostname))
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((scope, samples)) => {
                    let failed = samples
                        .iter()
                        .any(|s| matches!(s, MetricSample::CollectError { failed: true, .. }));
                    self.metrics.set_collect_error(scope, failed);
                    for sample in samples {
                        self.metrics.record(manager_name, &sample);
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "sub-collector task panicked");
                }
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.record_scrape_duration("coordinator", elapsed);
        self.logger.log_scrape_complete(units.len(), elapsed);

        Ok(units.len())
    }

    /// Re-runs cgroup discovery without driving the full sub-collector
    /// fan-out, for the `/alloy-targets` endpoint and tests.
    pub async fn discover_units(&self) -> Result<Vec<ComputeUnit>> {
        self.cgroup_manager.discover().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::VersionOverride;
    use crate::manager::{Manager, SlurmLayout};

    fn coordinator_with_absent_root() -> Coordinator {
        let manager = Manager::Slurm(SlurmLayout::new("/no/such/cgroupfs", "/no/such/cgroupfs"));
        let cgroup_manager = CgroupManager::new(manager, VersionOverride::Auto, Vec::new());
        Coordinator::new(
            cgroup_manager,
            "test-host",
            ExporterMetrics::new("test-host"),
            StructuredLogger::new("test-host"),
        )
    }

    #[tokio::test]
    async fn scrape_with_no_cgroup_mount_is_not_fatal() {
        let coordinator = coordinator_with_absent_root();
        let unit_count = coordinator.scrape().await.unwrap();
        assert_eq!(unit_count, 0);
    }

    #[tokio::test]
    async fn scrape_with_no_sub_collectors_still_reports_zero_units() {
        let coordinator = coordinator_with_absent_root();
        assert_eq!(coordinator.scrape().await.unwrap(), 0);
        // a second concurrent-looking call exercises the scrape lock without deadlocking
        assert_eq!(coordinator.scrape().await.unwrap(), 0);
    }
}
