//! AMD GPU discovery via `rocm-smi --showproductname --showserial --showbus --csv`.
//! Each CSV row is one device; AMD GPUs carry no partitioning in this
//! design.

use crate::models::{BusId, GpuDevice, PartitioningMode};
use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn discover() -> Result<Vec<GpuDevice>> {
    let output = timeout(
        SUBPROCESS_TIMEOUT,
        Command::new("rocm-smi")
            .args(["--showproductname", "--showserial", "--showbus", "--csv"])
            .output(),
    )
    .await
    .context("rocm-smi timed out")??;

    if !output.status.success() {
        anyhow::bail!("rocm-smi exited with {}", output.status);
    }

    parse_csv(&String::from_utf8_lossy(&output.stdout))
}

/// `rocm-smi --csv` emits one header row (`device,Serial Number,Card series,...`)
/// followed by one row per GPU. Column presence/order varies by rocm-smi
/// version, so columns are matched by header name rather than position.
pub fn parse_csv(csv: &str) -> Result<Vec<GpuDevice>> {
    let mut lines = csv.lines();
    let header = lines.next().context("rocm-smi csv: missing header row")?;
    let columns: Vec<&str> = header.split(',').map(|c| c.trim()).collect();

    let col_index = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));
    let serial_idx = col_index("Serial Number");
    let name_idx = col_index("Card series").or_else(|| col_index("Card Model"));
    let bus_idx = col_index("PCI Bus").or_else(|| col_index("Bus"));

    let mut devices = Vec::new();
    for (local_index, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        let get = |idx: Option<usize>| idx.and_then(|i| fields.get(i)).map(|s| s.to_string()).unwrap_or_default();

        let uuid = get(serial_idx);
        let name = get(name_idx);
        let bus = get(bus_idx);
        let pci_bus_id = BusId::parse(&bus).unwrap_or(BusId {
            domain: 0,
            bus: 0,
            device: 0,
            function: 0,
        });

        devices.push(GpuDevice {
            local_index: local_index as u32,
            global_index: Some(local_index as u32),
            uuid,
            pci_bus_id,
            name,
            partitioning_mode: PartitioningMode::None,
            instances: Vec::new(),
            mediator_uuids: Vec::new(),
            compute_units: Vec::new(),
            current_shares: 0,
        });
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rocm_smi_csv() {
        let csv = "device,Serial Number,Card series,PCI Bus\n\
                    card0,SN-1234,Instinct MI250,0000:43:00.0\n\
                    card1,SN-5678,Instinct MI250,0000:44:00.0\n";
        let devices = parse_csv(csv).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].uuid, "SN-1234");
        assert_eq!(devices[0].name, "Instinct MI250");
        assert_eq!(devices[1].local_index, 1);
        assert_eq!(devices[0].partitioning_mode, PartitioningMode::None);
    }
}
