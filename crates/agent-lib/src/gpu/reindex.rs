//! Global reindexing of discovered GPU devices/instances.
//!
//! Vendor tools only know local enumeration order. An operator can override
//! that with an explicit `order_map` (e.g. to match an external scheduler's
//! device numbering); anything left unmapped keeps a monotonically assigned
//! index in discovery order, skipping whatever the map already claimed.

use crate::models::GpuDevice;
use std::collections::{HashMap, HashSet};

/// One `new_index:device_index[.gpu_instance_id]` pair from an `order_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OrderMapEntry {
    new_index: u32,
    device_local_index: u32,
    gpu_instance_id: Option<u32>,
}

fn parse_order_map(order_map: &str) -> Vec<OrderMapEntry> {
    let mut entries = Vec::new();
    for pair in order_map.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((new_index_str, rest)) = pair.split_once(':') else {
            continue;
        };
        let Ok(new_index) = new_index_str.trim().parse() else {
            continue;
        };
        let rest = rest.trim();
        let (device_str, instance_str) = match rest.split_once('.') {
            Some((d, i)) => (d, Some(i)),
            None => (rest, None),
        };
        let Ok(device_local_index) = device_str.parse() else {
            continue;
        };
        let gpu_instance_id = match instance_str {
            Some(i) => match i.parse() {
                Ok(v) => Some(v),
                Err(_) => continue,
            },
            None => None,
        };
        entries.push(OrderMapEntry {
            new_index,
            device_local_index,
            gpu_instance_id,
        });
    }
    entries
}

/// Applies `order_map` to `devices`, reassigning `global_index` on both
/// devices and their instances. Idempotent: applying the same map twice to
/// an already-reindexed set yields the same assignment, since mapped
/// entries are keyed by `(local_index, gpu_instance_id)` rather than by the
/// current `global_index`.
pub fn apply(devices: &mut [GpuDevice], order_map: &str) {
    let entries = parse_order_map(order_map);
    let mapped: HashMap<(u32, Option<u32>), u32> = entries
        .iter()
        .map(|e| ((e.device_local_index, e.gpu_instance_id), e.new_index))
        .collect();
    let mut used: HashSet<u32> = mapped.values().copied().collect();

    for device in devices.iter_mut() {
        if device.is_mig() {
            device.global_index = None;
            for inst in device.instances.iter_mut() {
                inst.global_index = mapped
                    .get(&(device.local_index, Some(inst.gpu_instance_id)))
                    .copied();
            }
        } else {
            device.global_index = mapped.get(&(device.local_index, None)).copied();
        }
    }

    let mut next_candidate = 0u32;
    let mut assign_next = |used: &mut HashSet<u32>| {
        while used.contains(&next_candidate) {
            next_candidate += 1;
        }
        let idx = next_candidate;
        used.insert(idx);
        next_candidate += 1;
        idx
    };

    for device in devices.iter_mut() {
        if device.is_mig() {
            for inst in device.instances.iter_mut() {
                if inst.global_index.is_none() {
                    inst.global_index = Some(assign_next(&mut used));
                }
            }
        } else if device.global_index.is_none() {
            device.global_index = Some(assign_next(&mut used));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BusId, GpuInstance, PartitioningMode};

    fn plain_device(local_index: u32) -> GpuDevice {
        GpuDevice {
            local_index,
            global_index: Some(local_index),
            uuid: format!("GPU-{local_index}"),
            pci_bus_id: BusId {
                domain: 0,
                bus: local_index as u8,
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

    fn mig_device(local_index: u32, instance_giids: &[u32]) -> GpuDevice {
        let mut device = plain_device(local_index);
        device.partitioning_mode = PartitioningMode::Instance;
        device.global_index = None;
        device.instances = instance_giids
            .iter()
            .enumerate()
            .map(|(i, giid)| GpuInstance {
                local_index: i as u32,
                global_index: None,
                uuid: String::new(),
                gpu_instance_id: *giid,
                compute_instance_id: 0,
                sm_fraction: 1.0 / instance_giids.len() as f64,
                mediator_uuids: Vec::new(),
                compute_units: Vec::new(),
                current_shares: 0,
            })
            .collect();
        device
    }

    /// S4: three physical devices, local 0 is MIG-enabled with instances
    /// {3,5,9}, local 1 and 2 are plain. Map `"0:1,1:0.3,2:0.5,3:0.9"`.
    #[test]
    fn s4_gpu_reindex_scenario() {
        let mut devices = vec![mig_device(0, &[3, 5, 9]), plain_device(1), plain_device(2)];
        apply(&mut devices, "0:1,1:0.3,2:0.5,3:0.9");

        let local1 = devices.iter().find(|d| d.local_index == 1).unwrap();
        assert_eq!(local1.global_index, Some(0));

        let mig = devices.iter().find(|d| d.local_index == 0).unwrap();
        assert_eq!(mig.global_index, None);
        let by_giid = |giid: u32| mig.instances.iter().find(|i| i.gpu_instance_id == giid).unwrap();
        assert_eq!(by_giid(3).global_index, Some(1));
        assert_eq!(by_giid(5).global_index, Some(2));
        assert_eq!(by_giid(9).global_index, Some(3));

        // local=2 is unmapped; it still gets a global index, just not one
        // already claimed by the map.
        let local2 = devices.iter().find(|d| d.local_index == 2).unwrap();
        assert!(local2.global_index.is_some());
        assert!(![0, 1, 2, 3].contains(&local2.global_index.unwrap()));
    }

    #[test]
    fn empty_order_map_compacts_indices_in_discovery_order() {
        let mut devices = vec![mig_device(0, &[3, 5]), plain_device(1)];
        apply(&mut devices, "");
        let mig = &devices[0];
        assert_eq!(mig.instances[0].global_index, Some(0));
        assert_eq!(mig.instances[1].global_index, Some(1));
        assert_eq!(devices[1].global_index, Some(2));
    }

    #[test]
    fn reindexing_is_idempotent() {
        let mut devices = vec![mig_device(0, &[3, 5, 9]), plain_device(1), plain_device(2)];
        apply(&mut devices, "0:1,1:0.3,2:0.5,3:0.9");
        let first_pass: Vec<Option<u32>> = devices
            .iter()
            .flat_map(|d| {
                if d.is_mig() {
                    d.instances.iter().map(|i| i.global_index).collect::<Vec<_>>()
                } else {
                    vec![d.global_index]
                }
            })
            .collect();

        apply(&mut devices, "0:1,1:0.3,2:0.5,3:0.9");
        let second_pass: Vec<Option<u32>> = devices
            .iter()
            .flat_map(|d| {
                if d.is_mig() {
                    d.instances.iter().map(|i| i.global_index).collect::<Vec<_>>()
                } else {
                    vec![d.global_index]
                }
            })
            .collect();

        assert_eq!(first_pass, second_pass);
    }
}
