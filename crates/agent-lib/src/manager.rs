//! Workload-manager configuration
//!
//! Dynamic dispatch across unit managers (the source's Go interfaces) is
//! replaced by a tagged sum type: one `Manager` value carries everything
//! `CgroupManager` needs (mount roots, id regex, ignore-process regex,
//! child-cgroup predicate) for its flavor. `CgroupManager` itself has a
//! single implementation that consumes whichever `Manager` was configured
//! at startup.

use regex::Regex;
use std::path::PathBuf;

/// Which workload manager this node is attributing units for. Mutually
/// exclusive at startup (`--collector.{slurm,libvirt,k8s}`).
#[derive(Clone)]
pub enum Manager {
    Slurm(SlurmLayout),
    Libvirt(LibvirtLayout),
    K8s(K8sLayout),
}

impl Manager {
    pub fn name(&self) -> &'static str {
        match self {
            Manager::Slurm(_) => "slurm",
            Manager::Libvirt(_) => "libvirt",
            Manager::K8s(_) => "k8s",
        }
    }

    /// Cgroup mount roots to walk breadth-first during discovery.
    pub fn mount_roots(&self) -> &[PathBuf] {
        match self {
            Manager::Slurm(l) => &l.mount_roots,
            Manager::Libvirt(l) => &l.mount_roots,
            Manager::K8s(l) => &l.mount_roots,
        }
    }

    /// Extracts the unit id from a kept cgroup's basename. `None` means the
    /// cgroup does not belong to this manager.
    pub fn id_regex(&self) -> &Regex {
        match self {
            Manager::Slurm(l) => &l.id_regex,
            Manager::Libvirt(l) => &l.id_regex,
            Manager::K8s(l) => &l.id_regex,
        }
    }

    /// Processes whose cmdline matches this are dropped from attribution
    /// (manager housekeeping processes, not workload processes).
    pub fn ignore_process_regex(&self) -> &Regex {
        match self {
            Manager::Slurm(l) => &l.ignore_process_regex,
            Manager::Libvirt(l) => &l.ignore_process_regex,
            Manager::K8s(l) => &l.ignore_process_regex,
        }
    }

    /// True when `path` is a per-step/per-task subtree of a unit rather
    /// than the unit's own top-level cgroup; such paths are walked into but
    /// not themselves kept as units.
    pub fn is_child_cgroup(&self, path: &str) -> bool {
        match self {
            Manager::Slurm(_) => path.contains("/step_") || path.contains("/task_"),
            Manager::Libvirt(_) => path.contains("/libvirt"),
            Manager::K8s(_) => false,
        }
    }
}

#[derive(Clone)]
pub struct SlurmLayout {
    pub mount_roots: Vec<PathBuf>,
    pub id_regex: Regex,
    pub ignore_process_regex: Regex,
}

impl SlurmLayout {
    pub fn new(cgroup_v2_root: &str, cgroup_v1_root: &str) -> Self {
        Self {
            mount_roots: vec![
                PathBuf::from(format!("{cgroup_v2_root}/system.slice/slurmstepd.scope")),
                PathBuf::from(format!(
                    "{cgroup_v1_root}/cpuacct/slurm"
                )),
            ],
            id_regex: Regex::new(r"job_([0-9]+)").expect("static slurm id regex"),
            ignore_process_regex: Regex::new(
                r"^slurmstepd:.*|^sleep\s+\d+$|^/bin/bash\s+.*/slurm_script.*",
            )
            .expect("static slurm ignore regex"),
        }
    }
}

#[derive(Clone)]
pub struct LibvirtLayout {
    pub mount_roots: Vec<PathBuf>,
    pub id_regex: Regex,
    pub ignore_process_regex: Regex,
    /// Directory of `<instance-id>.xml` libvirt domain XML files.
    pub xml_dir: PathBuf,
}

impl LibvirtLayout {
    pub fn new(cgroup_root: &str, xml_dir: impl Into<PathBuf>) -> Self {
        Self {
            mount_roots: vec![PathBuf::from(format!("{cgroup_root}/machine.slice"))],
            id_regex: Regex::new(r"machine-qemu\\x2d\d+\\x2dinstance\\x2d([^.]+)\.scope")
                .expect("static libvirt id regex"),
            ignore_process_regex: Regex::new(r"^$").expect("static libvirt ignore regex (none)"),
            xml_dir: xml_dir.into(),
        }
    }
}

#[derive(Clone)]
pub struct K8sLayout {
    pub mount_roots: Vec<PathBuf>,
    pub id_regex: Regex,
    pub ignore_process_regex: Regex,
    /// Kubelet PodResources gRPC unix socket.
    pub kubelet_podresources_socket: PathBuf,
}

impl K8sLayout {
    pub fn new(cgroup_root: &str, kubelet_podresources_socket: impl Into<PathBuf>) -> Self {
        Self {
            mount_roots: vec![
                PathBuf::from(format!("{cgroup_root}/kubepods.slice")),
                PathBuf::from(format!("{cgroup_root}/kubepods")),
            ],
            id_regex: Regex::new(r"pod([0-9a-fA-F-]{36})").expect("static k8s id regex"),
            ignore_process_regex: Regex::new(r"^$").expect("static k8s ignore regex (none)"),
            kubelet_podresources_socket: kubelet_podresources_socket.into(),
        }
    }
}
