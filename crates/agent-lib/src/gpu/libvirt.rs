//! VM (libvirt) GPU binding source: parses `<xml-dir>/<instance-id>.xml`
//! domain XML, reading `hostdev` elements to bind `type=pci` devices by bus
//! address and `type=mdev` devices by mediator uuid.

use super::GpuTarget;
use crate::models::{BusId, ComputeUnit};
use serde::Deserialize;
use std::path::Path;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Domain {
    devices: Devices,
}

#[derive(Debug, Deserialize, Default)]
struct Devices {
    #[serde(rename = "hostdev", default)]
    hostdevs: Vec<Hostdev>,
}

#[derive(Debug, Deserialize)]
struct Hostdev {
    #[serde(rename = "@type", default)]
    device_type: String,
    source: HostdevSource,
}

#[derive(Debug, Deserialize)]
struct HostdevSource {
    address: HostdevAddress,
}

#[derive(Debug, Deserialize, Default)]
struct HostdevAddress {
    #[serde(rename = "@domain", default)]
    domain: Option<String>,
    #[serde(rename = "@bus", default)]
    bus: Option<String>,
    #[serde(rename = "@slot", default)]
    slot: Option<String>,
    #[serde(rename = "@function", default)]
    function: Option<String>,
    #[serde(rename = "@uuid", default)]
    uuid: Option<String>,
}

/// Reads `{xml_dir}/{unit.id}.xml` for every unit and returns one `(target,
/// unit_uuid)` pair per `hostdev`. A missing or malformed domain XML is
/// logged and skipped (not every VM has a GPU hostdev).
pub async fn read_bindings(xml_dir: &Path, units: &[ComputeUnit]) -> Vec<(GpuTarget, String)> {
    let mut bindings = Vec::new();
    for unit in units {
        let path = xml_dir.join(format!("{}.xml", unit.id));
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => continue,
        };
        let domain: Domain = match quick_xml::de::from_str(&content) {
            Ok(d) => d,
            Err(e) => {
                debug!(unit = %unit.id, error = %e, "failed to parse libvirt domain xml, skipping");
                continue;
            }
        };
        for hostdev in domain.devices.hostdevs {
            match hostdev.device_type.as_str() {
                "pci" => {
                    if let Some(bus) = pci_bus_id(&hostdev.source.address) {
                        bindings.push((GpuTarget::Bus(bus), unit.uuid.clone()));
                    }
                }
                "mdev" => {
                    if let Some(uuid) = hostdev.source.address.uuid {
                        bindings.push((GpuTarget::MediatorUuid(uuid), unit.uuid.clone()));
                    }
                }
                other => debug!(unit = %unit.id, kind = other, "unsupported hostdev type, skipping"),
            }
        }
    }
    bindings
}

fn pci_bus_id(addr: &HostdevAddress) -> Option<BusId> {
    let domain = parse_hex_attr(addr.domain.as_deref()?)?;
    let bus = parse_hex_attr(addr.bus.as_deref()?)? as u8;
    let device = parse_hex_attr(addr.slot.as_deref()?)? as u8;
    let function = parse_hex_attr(addr.function.as_deref()?)? as u8;
    Some(BusId {
        domain: domain as u16,
        bus,
        device,
        function,
    })
}

fn parse_hex_attr(s: &str) -> Option<u32> {
    let s = s.trim().strip_prefix("0x").unwrap_or(s.trim());
    u32::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Process;
    use tempfile::tempdir;

    fn unit(id: &str) -> ComputeUnit {
        ComputeUnit {
            id: id.into(),
            uuid: id.into(),
            processes: vec![Process::default()],
            ..Default::default()
        }
    }

    const PCI_DOMAIN_XML: &str = r#"<domain type='kvm'>
  <devices>
    <hostdev mode='subsystem' type='pci' managed='yes'>
      <source>
        <address domain='0x0000' bus='0x3b' slot='0x00' function='0x0'/>
      </source>
    </hostdev>
  </devices>
</domain>"#;

    const MDEV_DOMAIN_XML: &str = r#"<domain type='kvm'>
  <devices>
    <hostdev mode='subsystem' type='mdev' managed='yes' model='vfio-pci'>
      <source>
        <address uuid='11111111-2222-3333-4444-555555555555'/>
      </source>
    </hostdev>
  </devices>
</domain>"#;

    #[tokio::test]
    async fn binds_pci_hostdev_by_bus_address() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("00000012.xml"), PCI_DOMAIN_XML).await.unwrap();

        let bindings = read_bindings(dir.path(), &[unit("00000012")]).await;
        assert_eq!(bindings.len(), 1);
        assert!(matches!(
            &bindings[0].0,
            GpuTarget::Bus(b) if *b == BusId { domain: 0, bus: 0x3b, device: 0, function: 0 }
        ));
    }

    #[tokio::test]
    async fn binds_mdev_hostdev_by_mediator_uuid() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("00000013.xml"), MDEV_DOMAIN_XML).await.unwrap();

        let bindings = read_bindings(dir.path(), &[unit("00000013")]).await;
        assert_eq!(bindings.len(), 1);
        assert!(matches!(
            &bindings[0].0,
            GpuTarget::MediatorUuid(u) if u == "11111111-2222-3333-4444-555555555555"
        ));
    }
}
