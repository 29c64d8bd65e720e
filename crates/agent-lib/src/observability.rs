//! Observability infrastructure for the exporter: the Prometheus metric
//! families and structured startup/shutdown/collection event logging.

use crate::models::{ComputeUnit, MetricSample};
use prometheus::{register_gauge_vec, register_int_counter_vec, register_int_gauge_vec, GaugeVec, IntCounterVec, IntGaugeVec};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Labels required on every unit-scoped sample: `manager`, `hostname`,
/// `uuid`.
const UNIT_LABELS: &[&str] = &["manager", "hostname", "uuid"];

static GLOBAL_METRICS: OnceLock<ExporterMetricsInner> = OnceLock::new();

struct ExporterMetricsInner {
    cpu_user_seconds: GaugeVec,
    cpu_system_seconds: GaugeVec,
    memory_rss_bytes: IntGaugeVec,
    memory_cache_bytes: IntGaugeVec,
    memory_used_bytes: IntGaugeVec,
    memory_total_bytes: IntGaugeVec,
    memory_fail_count: IntGaugeVec,
    cpu_pressure: GaugeVec,
    memory_pressure: GaugeVec,
    io_pressure: GaugeVec,
    blkio_read_bytes: IntGaugeVec,
    blkio_write_bytes: IntGaugeVec,
    blkio_read_ops: IntGaugeVec,
    blkio_write_ops: IntGaugeVec,
    perf_events: IntGaugeVec,
    ebpf_counters: IntCounterVec,
    rdma_counters: IntGaugeVec,
    unit_gpu_index_flag: GaugeVec,
    collect_error: IntGaugeVec,
    scrape_duration_seconds: GaugeVec,
}

impl ExporterMetricsInner {
    fn new() -> Self {
        Self {
            cpu_user_seconds: register_gauge_vec!(
                "cpu_user_seconds",
                "Cumulative user CPU time consumed by a compute unit, in seconds",
                UNIT_LABELS
            )
            .expect("register cpu_user_seconds"),

            cpu_system_seconds: register_gauge_vec!(
                "cpu_system_seconds",
                "Cumulative system CPU time consumed by a compute unit, in seconds",
                UNIT_LABELS
            )
            .expect("register cpu_system_seconds"),

            memory_rss_bytes: register_int_gauge_vec!(
                "memory_rss_bytes",
                "Resident set size of a compute unit's cgroup, in bytes",
                UNIT_LABELS
            )
            .expect("register memory_rss_bytes"),

            memory_cache_bytes: register_int_gauge_vec!(
                "memory_cache_bytes",
                "Page cache usage of a compute unit's cgroup, in bytes",
                UNIT_LABELS
            )
            .expect("register memory_cache_bytes"),

            memory_used_bytes: register_int_gauge_vec!(
                "memory_used_bytes",
                "Current memory usage of a compute unit's cgroup, in bytes",
                UNIT_LABELS
            )
            .expect("register memory_used_bytes"),

            memory_total_bytes: register_int_gauge_vec!(
                "memory_total_bytes",
                "Memory limit of a compute unit's cgroup, in bytes (0 when unlimited)",
                UNIT_LABELS
            )
            .expect("register memory_total_bytes"),

            // Read straight from the kernel's own cumulative oom/failcnt
            // counter each scrape (not a per-scrape delta), so this is a
            // gauge set to that value rather than a self-accumulating
            // counter incremented by it - see the `record` note below.
            memory_fail_count: register_int_gauge_vec!(
                "memory_fail_count",
                "Count of memory allocation failures (OOM events) for a compute unit",
                UNIT_LABELS
            )
            .expect("register memory_fail_count"),

            cpu_pressure: register_gauge_vec!(
                "cpu_pressure",
                "Linux PSI 'some avg10' CPU stall fraction for a compute unit's cgroup",
                UNIT_LABELS
            )
            .expect("register cpu_pressure"),

            memory_pressure: register_gauge_vec!(
                "memory_pressure",
                "Linux PSI 'some avg10' memory stall fraction for a compute unit's cgroup",
                UNIT_LABELS
            )
            .expect("register memory_pressure"),

            io_pressure: register_gauge_vec!(
                "io_pressure",
                "Linux PSI 'some avg10' I/O stall fraction for a compute unit's cgroup",
                UNIT_LABELS
            )
            .expect("register io_pressure"),

            // blkio.throttle.io_service_bytes/io.stat are themselves
            // cumulative since cgroup creation; set rather than inc_by for
            // the same reason as memory_fail_count above.
            blkio_read_bytes: register_int_gauge_vec!(
                "blkio_read_bytes_total",
                "Cumulative bytes read from block devices by a compute unit",
                &["manager", "hostname", "uuid", "device"]
            )
            .expect("register blkio_read_bytes_total"),

            blkio_write_bytes: register_int_gauge_vec!(
                "blkio_write_bytes_total",
                "Cumulative bytes written to block devices by a compute unit",
                &["manager", "hostname", "uuid", "device"]
            )
            .expect("register blkio_write_bytes_total"),

            blkio_read_ops: register_int_gauge_vec!(
                "blkio_read_ops_total",
                "Cumulative block device read operations by a compute unit",
                &["manager", "hostname", "uuid", "device"]
            )
            .expect("register blkio_read_ops_total"),

            blkio_write_ops: register_int_gauge_vec!(
                "blkio_write_ops_total",
                "Cumulative block device write operations by a compute unit",
                &["manager", "hostname", "uuid", "device"]
            )
            .expect("register blkio_write_ops_total"),

            // PerfCollector already folds each scrape's scaled delta into
            // its own running total and hands us that total directly, so
            // this is set, not inc_by (inc_by would re-add the whole
            // cumulative value on top of itself every scrape).
            perf_events: register_int_gauge_vec!(
                "perf_event_total",
                "Cumulative scaled perf hardware/software/cache counter value for a compute unit",
                &["manager", "hostname", "uuid", "event"]
            )
            .expect("register perf_event_total"),

            ebpf_counters: register_int_counter_vec!(
                "ebpf_counter_total",
                "Cumulative eBPF-accounted VFS/network bytes or operations for a compute unit",
                &["manager", "hostname", "uuid", "metric"]
            )
            .expect("register ebpf_counter_total"),

            rdma_counters: register_int_gauge_vec!(
                "rdma_counter",
                "RDMA device/port hardware counter value, unit-scoped when attributable",
                &["manager", "hostname", "uuid", "device", "port", "counter"]
            )
            .expect("register rdma_counter"),

            unit_gpu_index_flag: register_gauge_vec!(
                "unit_gpu_index_flag",
                "Effective share weight of a compute unit's binding to a GPU device or instance",
                &["manager", "hostname", "uuid", "index", "hindex", "gpuuuid", "gpuiid"]
            )
            .expect("register unit_gpu_index_flag"),

            collect_error: register_int_gauge_vec!(
                "collect_error",
                "1 if the named collection scope failed during the last scrape, else 0",
                &["uuid"]
            )
            .expect("register collect_error"),

            scrape_duration_seconds: register_gauge_vec!(
                "scrape_duration_seconds",
                "Wall-clock duration of the last full scrape",
                &["collector"]
            )
            .expect("register scrape_duration_seconds"),
        }
    }
}

/// Handle to the process-wide Prometheus registry. Cheap to clone; all
/// clones share the same underlying metric families.
#[derive(Clone)]
pub struct ExporterMetrics {
    hostname: String,
}

impl ExporterMetrics {
    pub fn new(hostname: impl Into<String>) -> Self {
        GLOBAL_METRICS.get_or_init(ExporterMetricsInner::new);
        Self {
            hostname: hostname.into(),
        }
    }

    fn inner(&self) -> &ExporterMetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    /// Routes one collector-emitted sample to its Prometheus family. This
    /// is the sink end of the Coordinator's shared scrape channel.
    pub fn record(&self, manager: &str, sample: &MetricSample) {
        let inner = self.inner();
        match sample {
            MetricSample::CgroupStats { unit, stats } => {
                let labels = [manager, self.hostname.as_str(), unit.uuid.as_str()];
                inner.cpu_user_seconds.with_label_values(&labels).set(stats.cpu_user_seconds);
                inner.cpu_system_seconds.with_label_values(&labels).set(stats.cpu_system_seconds);
                inner.memory_rss_bytes.with_label_values(&labels).set(stats.memory_rss_bytes as i64);
                inner.memory_cache_bytes.with_label_values(&labels).set(stats.memory_cache_bytes as i64);
                inner.memory_used_bytes.with_label_values(&labels).set(stats.memory_used_bytes as i64);
                inner.memory_total_bytes.with_label_values(&labels).set(stats.memory_total_bytes as i64);
                inner.memory_fail_count.with_label_values(&labels).set(stats.memory_fail_count as i64);
                inner.cpu_pressure.with_label_values(&labels).set(stats.cpu_pressure);
                inner.memory_pressure.with_label_values(&labels).set(stats.memory_pressure);
                inner.io_pressure.with_label_values(&labels).set(stats.io_pressure);
                for dev in &stats.blkio {
                    let dev_labels = [manager, self.hostname.as_str(), unit.uuid.as_str(), dev.device.as_str()];
                    inner.blkio_read_bytes.with_label_values(&dev_labels).set(dev.read_bytes as i64);
                    inner.blkio_write_bytes.with_label_values(&dev_labels).set(dev.write_bytes as i64);
                    inner.blkio_read_ops.with_label_values(&dev_labels).set(dev.read_ops as i64);
                    inner.blkio_write_ops.with_label_values(&dev_labels).set(dev.write_ops as i64);
                }
            }
            MetricSample::PerfCounter { unit_uuid, event, value } => {
                inner
                    .perf_events
                    .with_label_values(&[manager, self.hostname.as_str(), unit_uuid, event])
                    .set(*value as i64);
            }
            MetricSample::EbpfCounter { unit_uuid, metric, value } => {
                inner
                    .ebpf_counters
                    .with_label_values(&[manager, self.hostname.as_str(), unit_uuid, metric])
                    .inc_by(*value);
            }
            MetricSample::RdmaCounter { unit_uuid, device, port, counter, value } => {
                let uuid = unit_uuid.as_deref().unwrap_or("");
                let port = port.map(|p| p.to_string()).unwrap_or_default();
                inner
                    .rdma_counters
                    .with_label_values(&[manager, self.hostname.as_str(), uuid, device, &port, counter])
                    .set(*value as i64);
            }
            MetricSample::GpuBinding { unit_uuid, index, hindex, gpu_uuid, gpu_instance_id, weight } => {
                inner
                    .unit_gpu_index_flag
                    .with_label_values(&[
                        manager,
                        self.hostname.as_str(),
                        unit_uuid,
                        index,
                        hindex,
                        gpu_uuid,
                        gpu_instance_id,
                    ])
                    .set(*weight);
            }
            MetricSample::CollectError { scope, failed } => {
                inner
                    .collect_error
                    .with_label_values(&[scope])
                    .set(if *failed { 1 } else { 0 });
            }
        }
    }

    pub fn record_scrape_duration(&self, collector: &str, seconds: f64) {
        self.inner()
            .scrape_duration_seconds
            .with_label_values(&[collector])
            .set(seconds);
    }

    pub fn set_collect_error(&self, scope: &str, failed: bool) {
        self.record(
            "",
            &MetricSample::CollectError {
                scope: scope.to_string(),
                failed,
            },
        );
    }
}

/// Structured logger for exporter lifecycle and per-scrape collection
/// events, one `StructuredLogger` per node.
#[derive(Clone)]
pub struct StructuredLogger {
    hostname: String,
}

impl StructuredLogger {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    pub fn log_startup(&self, version: &str, manager: &str) {
        info!(
            event = "exporter_started",
            hostname = %self.hostname,
            exporter_version = %version,
            manager = %manager,
            "CEEMS exporter started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            hostname = %self.hostname,
            reason = %reason,
            "CEEMS exporter shutting down"
        );
    }

    pub fn log_scrape_complete(&self, units: usize, duration_secs: f64) {
        info!(
            event = "scrape_complete",
            hostname = %self.hostname,
            units = units,
            duration_secs = duration_secs,
            "Scrape complete"
        );
    }

    /// Logs a sub-collector failure: local to the scrape and to that
    /// sub-collector, never fatal.
    pub fn log_collect_error(&self, scope: &str, unit: Option<&ComputeUnit>, error: &str) {
        warn!(
            event = "collect_error",
            hostname = %self.hostname,
            scope = %scope,
            unit = unit.map(|u| u.uuid.as_str()).unwrap_or(""),
            error = %error,
            "Sub-collector failed for this scrape"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UnitCgroupStats;

    fn sample_unit(uuid: &str) -> ComputeUnit {
        ComputeUnit {
            id: uuid.into(),
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    #[test]
    fn records_cgroup_stats_sample() {
        let metrics = ExporterMetrics::new("node-a");
        let unit = sample_unit("1009248");
        let stats = UnitCgroupStats {
            cpu_user_seconds: 12.5,
            memory_rss_bytes: 1024,
            ..Default::default()
        };
        metrics.record("slurm", &MetricSample::CgroupStats { unit, stats });
    }

    #[test]
    fn records_gpu_binding_sample() {
        let metrics = ExporterMetrics::new("node-a");
        metrics.record(
            "k8s",
            &MetricSample::GpuBinding {
                unit_uuid: "pod-a".into(),
                index: "0".into(),
                hindex: "node-a/gpu-0".into(),
                gpu_uuid: "GPU-abc".into(),
                gpu_instance_id: "".into(),
                weight: 1.0,
            },
        );
    }

    #[test]
    fn structured_logger_records_events() {
        let logger = StructuredLogger::new("node-a");
        logger.log_startup("0.1.0", "slurm");
        logger.log_scrape_complete(3, 0.25);
        logger.log_collect_error("gpu", None, "nvidia-smi exited non-zero");
        logger.log_shutdown("SIGTERM received");
    }
}
