//! CEEMS Exporter - per-node compute-unit resource exporter
//!
//! Runs as a daemon on each node, attributing cgroup, perf, eBPF, RDMA and
//! GPU resource consumption to Slurm jobs, libvirt VMs or Kubernetes pods
//! and exposing the result as Prometheus metrics plus a service-discovery
//! feed for per-process profilers.

use agent_lib::cgroup::CgroupManager;
use agent_lib::gpu::GpuTopology;
use agent_lib::health::{components, HealthRegistry};
use agent_lib::observability::{ExporterMetrics, StructuredLogger};
use agent_lib::perf::{EnabledFamilies, PerfCollector};
use agent_lib::rdma::RdmaCollector;
use agent_lib::security::SecurityContext;
use agent_lib::{Coordinator, EbpfCollector, TargetDiscoverer};
use anyhow::{Context, Result};
use caps::Capability;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reads the kernel hostname via the raw `gethostname(2)` syscall, since no
/// higher-level hostname crate is already part of the dependency set.
fn system_hostname() -> Option<String> {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }
    let nul = buf.iter().position(|&b| b == 0)?;
    buf.truncate(nul);
    String::from_utf8(buf).ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cfg = config::Config::load();
    if let Err(e) = config::validate(&cfg) {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let hostname = std::env::var("NODE_NAME")
        .ok()
        .or_else(system_hostname)
        .unwrap_or_else(|| "unknown".to_string());

    let manager = cfg.build_manager();
    let manager_name = manager.name();
    info!(manager = %manager_name, hostname = %hostname, "exporter configured");

    let cgroup_manager = CgroupManager::new(manager.clone(), cfg.version_override(), cfg.perf_env_vars.clone());

    // Fail fast if the cgroup mount is entirely unreadable at startup - every
    // other collector depends on this discovery pass succeeding at least once.
    if let Err(e) = cgroup_manager.discover().await {
        if !matches!(e, agent_lib::CollectError::NoData(_)) {
            error!(error = %e, "cgroup discovery failed at startup");
            std::process::exit(1);
        }
    }

    let health_registry = HealthRegistry::new();
    health_registry.register(components::CGROUP).await;
    health_registry.register(components::ATTRIBUTION).await;
    health_registry.register(components::COORDINATOR).await;

    let metrics = ExporterMetrics::new(&hostname);
    let logger = StructuredLogger::new(&hostname);
    logger.log_startup(EXPORTER_VERSION, manager_name);

    let mut coordinator = Coordinator::new(cgroup_manager.clone(), &hostname, metrics.clone(), logger.clone());

    if cfg.perf_enabled() {
        health_registry.register(components::PERF).await;
        let security = SecurityContext::new(vec![Capability::CAP_SYS_PTRACE, Capability::CAP_PERFMON]);
        let families = EnabledFamilies {
            hardware: cfg.perf_hardware_events,
            software: cfg.perf_software_events,
            cache: cfg.perf_hardware_cache_events,
        };
        match PerfCollector::new(security, families) {
            Ok(perf) => coordinator = coordinator.with_perf(perf),
            Err(e) => {
                error!(error = %e, "perf collector unavailable at startup");
                std::process::exit(1);
            }
        }
    }

    if cfg.ebpf {
        health_registry.register(components::EBPF).await;
        let security = SecurityContext::new(vec![Capability::CAP_BPF, Capability::CAP_PERFMON]);
        match EbpfCollector::load(&security, cfg.cgroupfs.clone()) {
            Ok(ebpf) => coordinator = coordinator.with_ebpf(ebpf),
            Err(e) => {
                error!(error = %e, "eBPF collector unavailable at startup");
                std::process::exit(1);
            }
        }
    }

    if cfg.rdma {
        health_registry.register(components::RDMA).await;
        coordinator = coordinator.with_rdma(RdmaCollector::new(cfg.sysfs.join("class/infiniband")));
    }

    if let Some(vendor) = cfg.gpu_vendor() {
        health_registry.register(components::GPU).await;
        coordinator = coordinator.with_gpu(GpuTopology::new(vendor, cfg.gpu_order_map.clone(), &manager));
    }

    let discoverer = if cfg.alloy_targets {
        Some(Arc::new(TargetDiscoverer::new(
            cgroup_manager.clone(),
            cfg.alloy_targets_self_profiler,
        )))
    } else {
        None
    };

    if let Some(path) = &cfg.web_config_file {
        match cfg.web_config() {
            Ok(web_config) => {
                if !web_config.basic_auth_users.is_empty() || web_config.tls_cert_file.is_some() {
                    info!(
                        path = %path.display(),
                        users = web_config.basic_auth_users.len(),
                        tls = web_config.tls_cert_file.is_some(),
                        "web config loaded (authentication and TLS are not enforced by this exporter)"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to load --web.config.file");
                std::process::exit(1);
            }
        }
    }

    let coordinator = Arc::new(coordinator);
    let app_state = Arc::new(api::AppState::new(
        coordinator.clone(),
        discoverer,
        health_registry.clone(),
        cfg.web_max_requests,
    ));

    health_registry.set_ready(true).await;

    if cfg.drop_privileges {
        let user = cfg
            .run_as_user
            .as_ref()
            .context("--security.drop-privileges requires --security.run-as-user")?;
        agent_lib::security::drop_privileges(user)?;
        info!(user = %user, "dropped privileges");
    }

    let listen_address = cfg.web_listen_address.clone();
    let api_handle = tokio::spawn(api::serve(listen_address, app_state));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("shutting down");
    api_handle.abort();

    Ok(())
}
