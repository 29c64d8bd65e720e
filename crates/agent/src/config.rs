//! CLI configuration
//!
//! `--web.config.file` is the one flag whose value isn't itself a runtime
//! knob but a path to a small YAML document (TLS cert/key, basic-auth user
//! list) loaded through the `config` crate — everything else is a clap
//! flag with an `env` fallback, so a flag always overrides its matching
//! environment variable, which in turn overrides the field's default.

use agent_lib::cgroup::VersionOverride;
use agent_lib::gpu::GpuVendor;
use agent_lib::manager::{K8sLayout, LibvirtLayout, Manager, SlurmLayout};
use anyhow::{bail, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "ceems-exporter", version, about = "Per-node compute-unit resource exporter")]
#[command(group(ArgGroup::new("manager").args(["slurm", "libvirt", "k8s"]).required(true)))]
pub struct Config {
    /// Attribute compute units as Slurm jobs
    #[arg(long = "collector.slurm", env = "CEEMS_COLLECTOR_SLURM")]
    pub slurm: bool,

    /// Attribute compute units as libvirt-managed VMs
    #[arg(long = "collector.libvirt", env = "CEEMS_COLLECTOR_LIBVIRT")]
    pub libvirt: bool,

    /// Attribute compute units as Kubernetes pods
    #[arg(long = "collector.k8s", env = "CEEMS_COLLECTOR_K8S")]
    pub k8s: bool,

    /// Override cgroup version auto-detection
    #[arg(
        long = "collector.cgroups.force-version",
        value_enum,
        default_value_t = ForceVersion::Auto,
        env = "CEEMS_COLLECTOR_CGROUPS_FORCE_VERSION"
    )]
    pub cgroups_force_version: ForceVersion,

    /// Enable the hardware perf event family
    #[arg(long = "collector.perf.hardware-events", env = "CEEMS_COLLECTOR_PERF_HARDWARE_EVENTS")]
    pub perf_hardware_events: bool,

    /// Enable the software perf event family
    #[arg(long = "collector.perf.software-events", env = "CEEMS_COLLECTOR_PERF_SOFTWARE_EVENTS")]
    pub perf_software_events: bool,

    /// Enable the hardware-cache perf event family
    #[arg(long = "collector.perf.hardware-cache-events", env = "CEEMS_COLLECTOR_PERF_HARDWARE_CACHE_EVENTS")]
    pub perf_hardware_cache_events: bool,

    /// Only profile processes with one of these environment variables set (repeatable)
    #[arg(long = "collector.perf.env-var", env = "CEEMS_COLLECTOR_PERF_ENV_VAR", value_delimiter = ',')]
    pub perf_env_vars: Vec<String>,

    /// Enable the eBPF-based I/O and network accounting collector
    #[arg(long = "collector.ebpf", env = "CEEMS_COLLECTOR_EBPF")]
    pub ebpf: bool,

    /// Enable the RDMA device/resource collector
    #[arg(long = "collector.rdma", env = "CEEMS_COLLECTOR_RDMA")]
    pub rdma: bool,

    /// Force the GPU vendor instead of probing for nvidia-smi/rocm-smi
    #[arg(long = "collector.gpu.type", value_enum, env = "CEEMS_COLLECTOR_GPU_TYPE")]
    pub gpu_type: Option<GpuTypeArg>,

    /// Reindex map applied to discovered GPU devices/instances, `new:local[.instance],...`
    #[arg(long = "collector.gpu.order-map", default_value = "", env = "CEEMS_COLLECTOR_GPU_ORDER_MAP")]
    pub gpu_order_map: String,

    /// Serve the /alloy-targets service-discovery endpoint
    #[arg(long = "discoverer.alloy-targets", env = "CEEMS_DISCOVERER_ALLOY_TARGETS")]
    pub alloy_targets: bool,

    /// Append a synthetic self-profiling target to /alloy-targets
    #[arg(
        long = "discoverer.alloy-targets.self-profiler",
        env = "CEEMS_DISCOVERER_ALLOY_TARGETS_SELF_PROFILER"
    )]
    pub alloy_targets_self_profiler: bool,

    /// User to drop privileges to after startup
    #[arg(long = "security.run-as-user", env = "CEEMS_SECURITY_RUN_AS_USER")]
    pub run_as_user: Option<String>,

    /// Drop privileges to --security.run-as-user once all privileged setup has run
    #[arg(long = "security.drop-privileges", env = "CEEMS_SECURITY_DROP_PRIVILEGES")]
    pub drop_privileges: bool,

    /// Address the HTTP server listens on
    #[arg(long = "web.listen-address", default_value = "0.0.0.0:9979", env = "CEEMS_WEB_LISTEN_ADDRESS")]
    pub web_listen_address: String,

    /// Optional web-config.yml-style file (TLS cert/key, basic-auth users)
    #[arg(long = "web.config.file", env = "CEEMS_WEB_CONFIG_FILE")]
    pub web_config_file: Option<PathBuf>,

    /// Maximum concurrent in-flight /metrics or /alloy-targets requests
    #[arg(long = "web.max-requests", default_value_t = 40, env = "CEEMS_WEB_MAX_REQUESTS")]
    pub web_max_requests: usize,

    /// cgroup filesystem root
    #[arg(long = "path.cgroupfs", default_value = "/sys/fs/cgroup", env = "CEEMS_PATH_CGROUPFS")]
    pub cgroupfs: String,

    /// procfs root
    #[arg(long = "path.procfs", default_value = "/proc", env = "CEEMS_PATH_PROCFS")]
    pub procfs: PathBuf,

    /// sysfs root
    #[arg(long = "path.sysfs", default_value = "/sys", env = "CEEMS_PATH_SYSFS")]
    pub sysfs: PathBuf,

    /// Directory of `<instance-id>.xml` libvirt domain XML files
    #[arg(
        long = "collector.libvirt.xml-dir",
        default_value = "/etc/libvirt/qemu",
        env = "CEEMS_COLLECTOR_LIBVIRT_XML_DIR"
    )]
    pub libvirt_xml_dir: PathBuf,

    /// Kubelet PodResources gRPC unix socket
    #[arg(
        long = "collector.k8s.kubelet-podresources-socket.file",
        default_value = "/var/lib/kubelet/pod-resources/kubelet.sock",
        env = "CEEMS_COLLECTOR_K8S_KUBELET_PODRESOURCES_SOCKET"
    )]
    pub kubelet_podresources_socket: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ForceVersion {
    Auto,
    V1,
    V2,
}

impl std::fmt::Display for ForceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ForceVersion::Auto => "auto",
            ForceVersion::V1 => "v1",
            ForceVersion::V2 => "v2",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GpuTypeArg {
    Nvidia,
    Amd,
}

impl Config {
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn build_manager(&self) -> Manager {
        if self.slurm {
            Manager::Slurm(SlurmLayout::new(&self.cgroupfs, &self.cgroupfs))
        } else if self.libvirt {
            Manager::Libvirt(LibvirtLayout::new(&self.cgroupfs, self.libvirt_xml_dir.clone()))
        } else {
            Manager::K8s(K8sLayout::new(&self.cgroupfs, self.kubelet_podresources_socket.clone()))
        }
    }

    pub fn version_override(&self) -> VersionOverride {
        match self.cgroups_force_version {
            ForceVersion::Auto => VersionOverride::Auto,
            ForceVersion::V1 => VersionOverride::V1,
            ForceVersion::V2 => VersionOverride::V2,
        }
    }

    pub fn gpu_vendor(&self) -> Option<GpuVendor> {
        self.gpu_type.map(|v| match v {
            GpuTypeArg::Nvidia => GpuVendor::Nvidia,
            GpuTypeArg::Amd => GpuVendor::Amd,
        })
    }

    pub fn perf_enabled(&self) -> bool {
        self.perf_hardware_events || self.perf_software_events || self.perf_hardware_cache_events
    }

    pub fn web_config(&self) -> Result<WebConfig> {
        let Some(path) = &self.web_config_file else {
            return Ok(WebConfig::default());
        };

        let source = config::Config::builder()
            .add_source(config::File::from(path.as_path()).required(true))
            .build()?;

        source.try_deserialize().map_err(Into::into)
    }
}

/// TLS/basic-auth config for the exporter's own HTTP server. Authentication
/// of the scrape endpoint is out of scope for this exporter, so a present
/// `basic_auth_users` table is parsed and logged but never enforced.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebConfig {
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    #[serde(default)]
    pub basic_auth_users: std::collections::HashMap<String, String>,
}

pub fn validate(config: &Config) -> Result<()> {
    if config.drop_privileges && config.run_as_user.is_none() {
        bail!("--security.drop-privileges requires --security.run-as-user");
    }
    Ok(())
}
