//! NVIDIA GPU discovery via `nvidia-smi --query --xml-format` and vGPU
//! mediator discovery via `nvidia-smi vgpu --query`.

use crate::models::{BusId, GpuDevice, GpuInstance, PartitioningMode};
use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Shells out to `nvidia-smi --query --xml-format`, parses the result, and
/// attaches any vGPU mediator uuids found via `nvidia-smi vgpu --query`.
/// On subprocess failure, the caller should reuse the last successful
/// discovery rather than propagate the error; this function itself
/// always returns the freshly parsed set or an error.
pub async fn discover() -> Result<Vec<GpuDevice>> {
    let xml = run_smi(&["--query", "--xml-format"]).await?;
    let mut devices = parse_xml(&xml)?;

    if devices.iter().any(|d| d.partitioning_mode == PartitioningMode::Mediated) {
        if let Ok(vgpu_out) = run_smi(&["vgpu", "--query"]).await {
            attach_mediators(&mut devices, &vgpu_out);
        }
    }

    Ok(devices)
}

async fn run_smi(args: &[&str]) -> Result<String> {
    let output = timeout(SUBPROCESS_TIMEOUT, Command::new("nvidia-smi").args(args).output())
        .await
        .context("nvidia-smi timed out")??;
    if !output.status.success() {
        anyhow::bail!("nvidia-smi exited with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Deserialize)]
struct NvidiaSmiLog {
    #[serde(rename = "gpu", default)]
    gpus: Vec<GpuXml>,
}

#[derive(Debug, Deserialize)]
struct GpuXml {
    #[serde(rename = "@id")]
    id: String,
    product_name: String,
    uuid: String,
    #[serde(default)]
    pci: Option<PciXml>,
    #[serde(default)]
    mig_mode: Option<MigModeXml>,
    #[serde(default)]
    virtualization_mode: Option<String>,
    #[serde(default)]
    mig_devices: Option<MigDevicesXml>,
}

#[derive(Debug, Deserialize)]
struct PciXml {
    pci_bus_id: String,
}

#[derive(Debug, Deserialize)]
struct MigModeXml {
    current_mig: String,
}

#[derive(Debug, Deserialize)]
struct MigDevicesXml {
    #[serde(rename = "mig_device", default)]
    devices: Vec<MigDeviceXml>,
}

#[derive(Debug, Deserialize)]
struct MigDeviceXml {
    #[serde(default)]
    uuid: Option<String>,
    gpu_instance_id: u32,
    compute_instance_id: u32,
    device_attributes: DeviceAttributesXml,
}

#[derive(Debug, Deserialize)]
struct DeviceAttributesXml {
    shared: SharedXml,
}

#[derive(Debug, Deserialize)]
struct SharedXml {
    multiprocessor_count: u32,
}

/// Parses `nvidia-smi --query --xml-format` output into `GpuDevice`
/// records. `local_index` is assigned in document order, matching the
/// vendor tool's own enumeration order. `global_index` is left `None`
/// here; the caller reindexes per §4.2's ordering rules.
pub fn parse_xml(xml: &str) -> Result<Vec<GpuDevice>> {
    let parsed: NvidiaSmiLog = quick_xml::de::from_str(xml).context("parsing nvidia-smi XML")?;

    let mut devices = Vec::with_capacity(parsed.gpus.len());
    for (local_index, gpu) in parsed.gpus.into_iter().enumerate() {
        let local_index = local_index as u32;
        let pci_bus_id = gpu
            .pci
            .map(|p| p.pci_bus_id)
            .unwrap_or(gpu.id.clone());
        let bus_id = BusId::parse(&pci_bus_id).unwrap_or(BusId {
            domain: 0,
            bus: 0,
            device: 0,
            function: 0,
        });

        let mig_enabled = gpu
            .mig_mode
            .as_ref()
            .map(|m| m.current_mig.eq_ignore_ascii_case("enabled"))
            .unwrap_or(false);
        let mediated = gpu
            .virtualization_mode
            .as_deref()
            .map(|v| v.to_ascii_uppercase().contains("VGPU"))
            .unwrap_or(false);

        let partitioning_mode = if mig_enabled {
            PartitioningMode::Instance
        } else if mediated {
            PartitioningMode::Mediated
        } else {
            PartitioningMode::None
        };

        let mut instances = Vec::new();
        if let Some(mig_devices) = gpu.mig_devices {
            let total_sm: u32 = mig_devices
                .devices
                .iter()
                .map(|d| d.device_attributes.shared.multiprocessor_count)
                .sum();
            for (instance_local_index, mig) in mig_devices.devices.into_iter().enumerate() {
                let sm_count = mig.device_attributes.shared.multiprocessor_count;
                let sm_fraction = if total_sm > 0 {
                    sm_count as f64 / total_sm as f64
                } else {
                    0.0
                };
                instances.push(GpuInstance {
                    local_index: instance_local_index as u32,
                    global_index: None,
                    uuid: mig.uuid.clone().unwrap_or_default(),
                    gpu_instance_id: mig.gpu_instance_id,
                    compute_instance_id: mig.compute_instance_id,
                    sm_fraction,
                    mediator_uuids: Vec::new(),
                    compute_units: Vec::new(),
                    current_shares: 0,
                });
            }
        }

        devices.push(GpuDevice {
            local_index,
            // A MIG-partitioned device is never itself bindable (§3
            // invariant); only its instances carry a global_index.
            global_index: if partitioning_mode == PartitioningMode::Instance {
                None
            } else {
                Some(local_index)
            },
            uuid: gpu.uuid,
            pci_bus_id: bus_id,
            name: gpu.product_name,
            partitioning_mode,
            instances,
            mediator_uuids: Vec::new(),
            compute_units: Vec::new(),
            current_shares: 0,
        });
    }

    Ok(devices)
}

/// Parses `nvidia-smi vgpu --query` text output, which is a flat
/// `Key : Value` block format with a `GPU <bus-id>` header line starting
/// each device's block, and attaches mediator uuids to the matching
/// device (or, under MIG, the instance whose `gpu_instance_id` matches).
pub fn attach_mediators(devices: &mut [GpuDevice], vgpu_output: &str) {
    let mut current_bus: Option<String> = None;
    let mut current_gpu_instance_id: Option<u32> = None;

    for line in vgpu_output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("GPU ") {
            current_bus = Some(rest.trim().to_string());
            current_gpu_instance_id = None;
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key.eq_ignore_ascii_case("GPU Instance ID") {
            current_gpu_instance_id = value.parse().ok();
        }

        if key.eq_ignore_ascii_case("MDEV UUID") || key.eq_ignore_ascii_case("vGPU UUID") {
            let Some(bus) = &current_bus else { continue };
            let Some(device) = devices
                .iter_mut()
                .find(|d| d.pci_bus_id.to_string().eq_ignore_ascii_case(bus) || d.pci_bus_id == bus_id_or_default(bus))
            else {
                continue;
            };

            if device.is_mig() {
                if let Some(giid) = current_gpu_instance_id {
                    if let Some(inst) = device.instances.iter_mut().find(|i| i.gpu_instance_id == giid) {
                        if !inst.mediator_uuids.contains(&value.to_string()) {
                            inst.mediator_uuids.push(value.to_string());
                        }
                    }
                }
            } else if !device.mediator_uuids.contains(&value.to_string()) {
                device.mediator_uuids.push(value.to_string());
            }
        }
    }
}

fn bus_id_or_default(s: &str) -> BusId {
    BusId::parse(s).unwrap_or(BusId {
        domain: 0,
        bus: 0,
        device: 0,
        function: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_XML: &str = r#"<?xml version="1.0" ?>
<nvidia_smi_log>
  <gpu id="00000000:3B:00.0">
    <product_name>NVIDIA A100-SXM4-40GB</product_name>
    <uuid>GPU-aaaa</uuid>
    <pci>
      <pci_bus_id>00000000:3B:00.0</pci_bus_id>
    </pci>
    <mig_mode>
      <current_mig>Disabled</current_mig>
    </mig_mode>
    <virtualization_mode>None</virtualization_mode>
  </gpu>
  <gpu id="00000000:5E:00.0">
    <product_name>NVIDIA A100-SXM4-40GB</product_name>
    <uuid>GPU-bbbb</uuid>
    <pci>
      <pci_bus_id>00000000:5E:00.0</pci_bus_id>
    </pci>
    <mig_mode>
      <current_mig>Enabled</current_mig>
    </mig_mode>
    <virtualization_mode>None</virtualization_mode>
    <mig_devices>
      <mig_device>
        <gpu_instance_id>3</gpu_instance_id>
        <compute_instance_id>0</compute_instance_id>
        <device_attributes>
          <shared>
            <multiprocessor_count>14</multiprocessor_count>
          </shared>
        </device_attributes>
      </mig_device>
      <mig_device>
        <gpu_instance_id>5</gpu_instance_id>
        <compute_instance_id>0</compute_instance_id>
        <device_attributes>
          <shared>
            <multiprocessor_count>14</multiprocessor_count>
          </shared>
        </device_attributes>
      </mig_device>
    </mig_devices>
  </gpu>
</nvidia_smi_log>"#;

    #[test]
    fn parses_non_mig_device() {
        let devices = parse_xml(SAMPLE_XML).unwrap();
        assert_eq!(devices[0].local_index, 0);
        assert_eq!(devices[0].global_index, Some(0));
        assert_eq!(devices[0].uuid, "GPU-aaaa");
        assert_eq!(devices[0].partitioning_mode, PartitioningMode::None);
        assert!(devices[0].instances.is_empty());
    }

    #[test]
    fn parses_mig_device_with_instances() {
        let devices = parse_xml(SAMPLE_XML).unwrap();
        let mig = &devices[1];
        assert_eq!(mig.partitioning_mode, PartitioningMode::Instance);
        // MIG devices are not themselves bindable.
        assert_eq!(mig.global_index, None);
        assert_eq!(mig.instances.len(), 2);
        let sum: f64 = mig.instance_sm_fraction_sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(mig.instances[0].gpu_instance_id, 3);
        assert_eq!(mig.instances[1].gpu_instance_id, 5);
    }

    #[test]
    fn attaches_mediator_to_physical_device() {
        let mut devices = parse_xml(SAMPLE_XML).unwrap();
        let vgpu_output = "GPU 00000000:3B:00.0\n    MDEV UUID                        : 11111111-2222-3333-4444-555555555555\n";
        attach_mediators(&mut devices, vgpu_output);
        assert_eq!(devices[0].mediator_uuids, vec!["11111111-2222-3333-4444-555555555555"]);
    }

    #[test]
    fn attaches_mediator_to_mig_instance_by_gpu_instance_id() {
        let mut devices = parse_xml(SAMPLE_XML).unwrap();
        let vgpu_output = "GPU 00000000:5E:00.0\n    GPU Instance ID                  : 5\n    MDEV UUID                        : 66666666-7777-8888-9999-000000000000\n";
        attach_mediators(&mut devices, vgpu_output);
        let inst = devices[1].instances.iter().find(|i| i.gpu_instance_id == 5).unwrap();
        assert_eq!(inst.mediator_uuids, vec!["66666666-7777-8888-9999-000000000000"]);
    }
}
