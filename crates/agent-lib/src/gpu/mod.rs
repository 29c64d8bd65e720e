//! GPU topology ownership: vendor discovery, global reindexing, and
//! per-scrape binding updates mapping device/instance ordinals to the
//! compute units currently holding them.

pub mod amd;
pub mod hpc;
pub mod libvirt;
pub mod nvidia;
pub mod podresources;
pub mod reindex;

use crate::error::Result;
use crate::manager::Manager;
use crate::models::{BusId, ComputeUnit, ComputeUnitBinding, GpuDevice, MetricSample, TimedEntry};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

const POD_BINDING_TTL: Duration = Duration::from_secs(15 * 60);
const VM_BINDING_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Directory of per-job GPU ordinal files written by the Slurm
/// prolog/epilog outside this crate's scope — no standard path is named
/// for this file, so this is this implementation's chosen convention.
const HPC_GPU_JOB_MAP_DIR: &str = "/run/ceems_exporter/gpu_job_map";

/// Which vendor tool to shell out to during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Amd,
}

/// A binding-source target: identifies one device or instance without
/// reference to its position in the `devices` vector, since sources never
/// see that vector directly (HPC job files name ordinals, libvirt XML
/// names bus/mediator addresses, kubelet names uuids).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuTarget {
    /// HPC job-properties ordinal, `device_local_index[.gpu_instance_id]`.
    Ordinal {
        device_local_index: u32,
        gpu_instance_id: Option<u32>,
    },
    /// VM `hostdev type='pci'`.
    Bus(BusId),
    /// VM `hostdev type='mdev'`, or an NVIDIA vGPU mediator uuid.
    MediatorUuid(String),
    /// k8s kubelet device id, physical device (`GPU-…`).
    DeviceUuid(String),
    /// k8s kubelet device id, MIG partition (`MIG-…`).
    InstanceUuid(String),
}

pub struct GpuTopology {
    vendor: GpuVendor,
    order_map: String,
    devices: Vec<GpuDevice>,
    last_binding: Option<TimedEntry<HashSet<String>>>,
    binding_ttl: Duration,
}

impl GpuTopology {
    pub fn new(vendor: GpuVendor, order_map: String, manager: &Manager) -> Self {
        let binding_ttl = match manager {
            Manager::Libvirt(_) => VM_BINDING_TTL,
            _ => POD_BINDING_TTL,
        };
        Self {
            vendor,
            order_map,
            devices: Vec::new(),
            last_binding: None,
            binding_ttl,
        }
    }

    pub fn devices(&self) -> &[GpuDevice] {
        &self.devices
    }

    /// Runs vendor discovery and applies the configured reindex map. On
    /// subprocess failure, the previous topology is kept: reuse last
    /// successful discovery, log at warn, and let the caller continue with
    /// stale-but-valid data.
    pub async fn discover(&mut self) {
        let discovered = match self.vendor {
            GpuVendor::Nvidia => nvidia::discover().await,
            GpuVendor::Amd => amd::discover().await,
        };
        match discovered {
            Ok(mut devices) => {
                reindex::apply(&mut devices, &self.order_map);
                self.devices = devices;
            }
            Err(e) => {
                warn!(error = %e, "gpu discovery subprocess failed, reusing last topology");
            }
        }
    }

    /// Rebuilds device/instance bindings for the current unit set. Skips
    /// the (expensive) rebuild when the unit-id set is unchanged and the
    /// cache is still fresh.
    pub async fn update_bindings(&mut self, manager: &Manager, units: &[ComputeUnit]) -> Result<()> {
        let unit_ids: HashSet<String> = units.iter().map(|u| u.uuid.clone()).collect();

        if let Some(cached) = &self.last_binding {
            if cached.value == unit_ids && !cached.is_stale(self.binding_ttl) {
                debug!("gpu binding cache fresh, skipping rebuild");
                return Ok(());
            }
        }

        reset_bindings(&mut self.devices);

        let raw_bindings = match manager {
            Manager::Slurm(_) => {
                hpc::read_bindings(std::path::Path::new(HPC_GPU_JOB_MAP_DIR), units).await
            }
            Manager::Libvirt(layout) => libvirt::read_bindings(&layout.xml_dir, units).await,
            Manager::K8s(layout) => match podresources::PodResourcesClient::connect(&layout.kubelet_podresources_socket).await {
                Ok(mut client) => match client.list_pod_resources().await {
                    Ok(response) => k8s_bindings(&response, units),
                    Err(e) => {
                        warn!(error = %e, "kubelet ListPodResources failed, no gpu bindings this scrape");
                        Vec::new()
                    }
                },
                Err(e) => {
                    warn!(error = %e, "could not connect to kubelet podresources socket");
                    Vec::new()
                }
            },
        };

        resolve_and_apply(&mut self.devices, raw_bindings);
        self.last_binding = Some(TimedEntry::new(unit_ids));
        Ok(())
    }

    /// Flattens current device/instance bindings into emission-ready
    /// samples for the metrics registry.
    pub fn binding_samples(&self, hostname: &str) -> Vec<MetricSample> {
        let mut samples = Vec::new();
        for device in &self.devices {
            for binding in bindings_of(&device.compute_units, device.current_shares) {
                samples.push(MetricSample::GpuBinding {
                    unit_uuid: binding.uuid,
                    index: device.global_index.map(|i| i.to_string()).unwrap_or_default(),
                    hindex: format!("{hostname}/gpu-{}", device.global_index.map(|i| i.to_string()).unwrap_or_default()),
                    gpu_uuid: device.uuid.clone(),
                    gpu_instance_id: String::new(),
                    weight: binding.effective_weight(device.current_shares),
                });
            }
            for instance in &device.instances {
                for binding in bindings_of(&instance.compute_units, instance.current_shares) {
                    samples.push(MetricSample::GpuBinding {
                        unit_uuid: binding.uuid,
                        index: instance.global_index.map(|i| i.to_string()).unwrap_or_default(),
                        hindex: format!("{hostname}/gpu-{}", instance.global_index.map(|i| i.to_string()).unwrap_or_default()),
                        gpu_uuid: device.uuid.clone(),
                        gpu_instance_id: instance.gpu_instance_id.to_string(),
                        weight: binding.effective_weight(instance.current_shares),
                    });
                }
            }
        }
        samples
    }
}

/// Groups a raw (possibly repeated) unit-uuid list into one
/// `ComputeUnitBinding` per distinct uuid, `num_shares` = occurrence count.
fn bindings_of(compute_units: &[String], _current_shares: u64) -> Vec<ComputeUnitBinding> {
    let mut counts: std::collections::HashMap<&str, u64> = std::collections::HashMap::new();
    for uuid in compute_units {
        *counts.entry(uuid.as_str()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(uuid, num_shares)| ComputeUnitBinding {
            uuid: uuid.to_string(),
            num_shares,
        })
        .collect()
}

fn reset_bindings(devices: &mut [GpuDevice]) {
    for device in devices.iter_mut() {
        device.compute_units.clear();
        device.current_shares = 0;
        for instance in device.instances.iter_mut() {
            instance.compute_units.clear();
            instance.current_shares = 0;
        }
    }
}

fn resolve_and_apply(devices: &mut [GpuDevice], bindings: Vec<(GpuTarget, String)>) {
    for (target, unit_uuid) in bindings {
        match resolve_target(devices, &target) {
            Some((device_idx, Some(instance_idx))) => {
                devices[device_idx].instances[instance_idx].compute_units.push(unit_uuid);
            }
            Some((device_idx, None)) => {
                devices[device_idx].compute_units.push(unit_uuid);
            }
            None => debug!(?target, "gpu binding target matched no discovered device, skipping"),
        }
    }

    for device in devices.iter_mut() {
        device.current_shares = device.compute_units.len() as u64;
        for instance in device.instances.iter_mut() {
            instance.current_shares = instance.compute_units.len() as u64;
        }
    }
}

fn resolve_target(devices: &[GpuDevice], target: &GpuTarget) -> Option<(usize, Option<usize>)> {
    match target {
        GpuTarget::Ordinal {
            device_local_index,
            gpu_instance_id,
        } => {
            let device_idx = devices.iter().position(|d| d.local_index == *device_local_index)?;
            match gpu_instance_id {
                Some(giid) => {
                    let instance_idx = devices[device_idx].instances.iter().position(|i| i.gpu_instance_id == *giid)?;
                    Some((device_idx, Some(instance_idx)))
                }
                None => Some((device_idx, None)),
            }
        }
        GpuTarget::Bus(bus) => devices.iter().position(|d| d.pci_bus_id == *bus).map(|i| (i, None)),
        GpuTarget::MediatorUuid(uuid) => {
            for (device_idx, device) in devices.iter().enumerate() {
                if device.is_mig() {
                    if let Some(instance_idx) = device.instances.iter().position(|i| i.mediator_uuids.contains(uuid)) {
                        return Some((device_idx, Some(instance_idx)));
                    }
                } else if device.mediator_uuids.contains(uuid) {
                    return Some((device_idx, None));
                }
            }
            None
        }
        GpuTarget::DeviceUuid(uuid) => devices.iter().position(|d| &d.uuid == uuid).map(|i| (i, None)),
        GpuTarget::InstanceUuid(uuid) => {
            for (device_idx, device) in devices.iter().enumerate() {
                if let Some(instance_idx) = device.instances.iter().position(|i| &i.uuid == uuid) {
                    return Some((device_idx, Some(instance_idx)));
                }
            }
            None
        }
    }
}

/// kubelet device ids are lower-cased and split on `::` (the time-slice
/// suffix); the remainder indexes a device uuid (`GPU-…`) or instance uuid
/// (`MIG-…`). Each container's device id list contributes one occurrence
/// per id to the owning pod's binding — two containers each holding one
/// slice of the same device yield `current_shares = 2` (S6).
fn k8s_bindings(response: &crate::gpu::podresources::proto::ListPodResourcesResponse, units: &[ComputeUnit]) -> Vec<(GpuTarget, String)> {
    let mut bindings = Vec::new();
    for pod in &response.pod_resources {
        let Some(unit) = units.iter().find(|u| u.id == pod.name || u.uuid == pod.name) else {
            continue;
        };
        for container in &pod.containers {
            for device in &container.devices {
                for device_id in &device.device_ids {
                    let lowered = device_id.to_ascii_lowercase();
                    let uuid = lowered.split("::").next().unwrap_or(&lowered);
                    let target = if uuid.starts_with("mig-") {
                        GpuTarget::InstanceUuid(uuid.to_string())
                    } else {
                        GpuTarget::DeviceUuid(uuid.to_string())
                    };
                    bindings.push((target, unit.uuid.clone()));
                }
            }
        }
    }
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GpuInstance, PartitioningMode, Process};

    fn device_with_uuid(local_index: u32, uuid: &str) -> GpuDevice {
        GpuDevice {
            local_index,
            global_index: Some(local_index),
            uuid: uuid.to_string(),
            pci_bus_id: BusId {
                domain: 0,
                bus: 0,
                device: 0,
                function: 0,
            },
            name: "Test GPU".into(),
            partitioning_mode: PartitioningMode::None,
            instances: Vec::new(),
            mediator_uuids: Vec::new(),
            compute_units: Vec::new(),
            current_shares: 0,
        }
    }

    fn unit(id: &str) -> ComputeUnit {
        ComputeUnit {
            id: id.into(),
            uuid: id.into(),
            processes: vec![Process::default()],
            ..Default::default()
        }
    }

    /// S6: kubelet returns two device ids for one uuid across two
    /// containers of one pod; the device ends up with current_shares=2 and
    /// one binding {uuid=pod-uid, num_shares=2}.
    #[test]
    fn s6_k8s_time_slicing_scenario() {
        use crate::gpu::podresources::proto::{ContainerDevices, ContainerResources, ListPodResourcesResponse, PodResources};

        let mut devices = vec![device_with_uuid(0, "GPU-abc")];
        let units = vec![unit("pod-uid-1")];

        let response = ListPodResourcesResponse {
            pod_resources: vec![PodResources {
                name: "pod-uid-1".into(),
                namespace: "default".into(),
                containers: vec![
                    ContainerResources {
                        name: "c1".into(),
                        devices: vec![ContainerDevices {
                            resource_name: "nvidia.com/gpu".into(),
                            device_ids: vec!["GPU-abc::1".into()],
                        }],
                    },
                    ContainerResources {
                        name: "c2".into(),
                        devices: vec![ContainerDevices {
                            resource_name: "nvidia.com/gpu".into(),
                            device_ids: vec!["GPU-abc::2".into()],
                        }],
                    },
                ],
            }],
        };

        let raw = k8s_bindings(&response, &units);
        resolve_and_apply(&mut devices, raw);

        assert_eq!(devices[0].current_shares, 2);
        let bindings = bindings_of(&devices[0].compute_units, devices[0].current_shares);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].uuid, "pod-uid-1");
        assert_eq!(bindings[0].num_shares, 2);
    }

    #[test]
    fn resolves_mig_instance_by_mediator_uuid() {
        let mut device = device_with_uuid(0, "GPU-xyz");
        device.partitioning_mode = PartitioningMode::Instance;
        device.global_index = None;
        device.instances.push(GpuInstance {
            local_index: 0,
            global_index: Some(0),
            uuid: String::new(),
            gpu_instance_id: 3,
            compute_instance_id: 0,
            sm_fraction: 1.0,
            mediator_uuids: vec!["mdev-1".to_string()],
            compute_units: Vec::new(),
            current_shares: 0,
        });

        let mut devices = vec![device];
        resolve_and_apply(
            &mut devices,
            vec![(GpuTarget::MediatorUuid("mdev-1".to_string()), "vm-1".to_string())],
        );
        assert_eq!(devices[0].instances[0].current_shares, 1);
    }
}
