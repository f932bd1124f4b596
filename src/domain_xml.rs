//! The parts of libvirt domain XML that fleet provisioning touches: network
//! interfaces and disk sources. Read and written with facet-xml.

use facet::Facet;
use facet_xml as xml;

use crate::error::HerdError;

// ── read model ─────────────────────────────────────────────

/// Only the elements herd inspects; everything else in the domain is ignored.
#[derive(Debug, Default, Facet)]
#[facet(rename = "domain")]
struct DomainDef {
    #[facet(default)]
    devices: Devices,
}

#[derive(Debug, Default, Facet)]
#[facet(traits(Default))]
struct Devices {
    #[facet(xml::elements, rename = "disk", default)]
    disks: Vec<DiskDef>,
    #[facet(xml::elements, rename = "interface", default)]
    interfaces: Vec<InterfaceDef>,
}

#[derive(Debug, Facet)]
struct DiskDef {
    #[facet(xml::attribute, rename = "type", default)]
    kind: Option<String>,
    #[facet(xml::attribute, default)]
    device: Option<String>,
    #[facet(default)]
    source: Option<DiskSourceDef>,
}

#[derive(Debug, Facet)]
struct DiskSourceDef {
    #[facet(xml::attribute, default)]
    file: Option<String>,
    #[facet(xml::attribute, default)]
    dev: Option<String>,
}

#[derive(Debug, Facet)]
struct InterfaceDef {
    #[facet(xml::attribute, rename = "type")]
    kind: String,
    #[facet(default)]
    mac: Option<MacDef>,
    #[facet(default)]
    source: Option<InterfaceSourceDef>,
}

#[derive(Debug, Facet)]
struct MacDef {
    #[facet(xml::attribute)]
    address: String,
}

#[derive(Debug, Facet)]
struct InterfaceSourceDef {
    #[facet(xml::attribute, default)]
    network: Option<String>,
    #[facet(xml::attribute, default)]
    bridge: Option<String>,
}

// ── device XML ─────────────────────────────────────────────

#[derive(Debug, Facet)]
#[facet(rename = "interface")]
struct BridgeInterface {
    #[facet(xml::attribute, rename = "type")]
    kind: String,
    source: BridgeSource,
    model: Model,
}

#[derive(Debug, Facet)]
struct BridgeSource {
    #[facet(xml::attribute)]
    bridge: String,
}

#[derive(Debug, Facet)]
struct Model {
    #[facet(xml::attribute, rename = "type")]
    kind: String,
}

#[derive(Debug, Facet)]
#[facet(rename = "interface")]
struct NetworkInterface {
    #[facet(xml::attribute, rename = "type")]
    kind: String,
    mac: MacDef,
    source: NetworkSource,
}

#[derive(Debug, Facet)]
struct NetworkSource {
    #[facet(xml::attribute)]
    network: String,
}

// ── public API ─────────────────────────────────────────────

/// How a disk's backing storage is addressed on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    /// Image file, e.g. a qcow2 under the default pool.
    File(String),
    /// Block device, e.g. an LVM volume.
    Block(String),
}

impl DiskSource {
    pub fn path(&self) -> &str {
        match self {
            DiskSource::File(p) | DiskSource::Block(p) => p,
        }
    }
}

/// Parsed view of a domain definition.
#[derive(Debug)]
pub struct DomainDevices {
    def: DomainDef,
}

impl DomainDevices {
    pub fn parse(domain_xml: &str) -> Result<Self, HerdError> {
        let def = facet_xml::from_str::<DomainDef>(domain_xml).map_err(|e| HerdError::Libvirt {
            message: format!("unreadable domain XML: {e}"),
            hint: "check `virsh dumpxml` output for the domain".into(),
        })?;
        Ok(Self { def })
    }

    /// MAC addresses of NICs attached to libvirt network `network`.
    pub fn network_interface_macs(&self, network: &str) -> Vec<String> {
        self.def
            .devices
            .interfaces
            .iter()
            .filter(|iface| iface.kind == "network")
            .filter(|iface| {
                iface.source.as_ref().and_then(|s| s.network.as_deref()) == Some(network)
            })
            .filter_map(|iface| iface.mac.as_ref().map(|m| m.address.clone()))
            .collect()
    }

    /// Whether a NIC on host bridge `bridge` is already defined.
    pub fn has_bridge_interface(&self, bridge: &str) -> bool {
        self.def
            .devices
            .interfaces
            .iter()
            .filter(|iface| iface.kind == "bridge")
            .any(|iface| iface.source.as_ref().and_then(|s| s.bridge.as_deref()) == Some(bridge))
    }

    /// Backing storage of the domain's disks. Cdroms and floppies are
    /// shared media and are left alone.
    pub fn disk_sources(&self) -> Vec<DiskSource> {
        self.def
            .devices
            .disks
            .iter()
            .filter(|disk| disk.device.as_deref().unwrap_or("disk") == "disk")
            .filter_map(|disk| {
                let source = disk.source.as_ref()?;
                match disk.kind.as_deref() {
                    Some("block") => source.dev.clone().map(DiskSource::Block),
                    _ => source.file.clone().map(DiskSource::File),
                }
            })
            .collect()
    }
}

/// Device XML for a virtio NIC on a host bridge.
pub fn bridge_interface_xml(bridge: &str) -> Result<String, HerdError> {
    let iface = BridgeInterface {
        kind: "bridge".into(),
        source: BridgeSource {
            bridge: bridge.into(),
        },
        model: Model {
            kind: "virtio".into(),
        },
    };
    facet_xml::to_string(&iface).map_err(serialize_err)
}

/// Device XML matching a NIC on a libvirt network by MAC, for detaching.
pub fn network_interface_xml(network: &str, mac: &str) -> Result<String, HerdError> {
    let iface = NetworkInterface {
        kind: "network".into(),
        mac: MacDef {
            address: mac.into(),
        },
        source: NetworkSource {
            network: network.into(),
        },
    };
    facet_xml::to_string(&iface).map_err(serialize_err)
}

fn serialize_err(e: impl std::fmt::Display) -> HerdError {
    HerdError::Libvirt {
        message: format!("building device XML: {e}"),
        hint: "this is a bug in herd".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"<domain type='kvm'>
  <name>lab01</name>
  <memory unit='KiB'>2097152</memory>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/lab01.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type="file" device="cdrom">
      <source file="/var/lib/libvirt/images/seed.iso"/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <disk type='block' device='disk'>
      <source dev='/dev/vg0/lab01-data'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <controller type='usb' index='0' model='qemu-xhci'/>
    <interface type='network'>
      <mac address='52:54:00:aa:bb:cc'/>
      <source network='default' portid='1234'/>
      <model type='virtio'/>
    </interface>
    <interface type='network'>
      <mac address='52:54:00:11:22:33'/>
      <source network='isolated'/>
    </interface>
    <interface type='bridge'>
      <mac address='52:54:00:dd:ee:ff'/>
      <source bridge='br0'/>
      <model type='virtio'/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn finds_default_network_macs() {
        let dom = DomainDevices::parse(DOMAIN).unwrap();
        assert_eq!(dom.network_interface_macs("default"), vec!["52:54:00:aa:bb:cc"]);
        assert!(dom.network_interface_macs("nope").is_empty());
    }

    #[test]
    fn detects_existing_bridge() {
        let dom = DomainDevices::parse(DOMAIN).unwrap();
        assert!(dom.has_bridge_interface("br0"));
        assert!(!dom.has_bridge_interface("br1"));
    }

    #[test]
    fn disk_sources_skip_cdrom() {
        let dom = DomainDevices::parse(DOMAIN).unwrap();
        assert_eq!(
            dom.disk_sources(),
            vec![
                DiskSource::File("/var/lib/libvirt/images/lab01.qcow2".into()),
                DiskSource::Block("/dev/vg0/lab01-data".into()),
            ]
        );
    }

    #[test]
    fn disk_paths_are_unescaped() {
        let xml = "<domain type='kvm'><devices>\
            <disk type='file' device='disk'>\
            <source file='/var/lib/libvirt/images/r&amp;d-lab01.qcow2'/>\
            </disk></devices></domain>";
        let dom = DomainDevices::parse(xml).unwrap();
        assert_eq!(
            dom.disk_sources(),
            vec![DiskSource::File(
                "/var/lib/libvirt/images/r&d-lab01.qcow2".into()
            )]
        );
    }

    #[test]
    fn domain_without_devices() {
        let dom = DomainDevices::parse("<domain type='kvm'><name>x</name></domain>").unwrap();
        assert!(dom.disk_sources().is_empty());
        assert!(!dom.has_bridge_interface("br0"));
    }

    #[test]
    fn generated_device_xml() {
        let xml = bridge_interface_xml("br7").unwrap();
        assert!(xml.contains(r#"type="bridge""#));
        assert!(xml.contains(r#"bridge="br7""#));
        assert!(xml.contains(r#"type="virtio""#));

        let xml = network_interface_xml("default", "52:54:00:00:00:01").unwrap();
        assert!(xml.contains(r#"type="network""#));
        assert!(xml.contains(r#"address="52:54:00:00:00:01""#));
        assert!(xml.contains(r#"network="default""#));
    }

    #[test]
    fn generated_device_xml_reads_back() {
        let xml = format!(
            "<domain><devices>{}{}</devices></domain>",
            bridge_interface_xml("br7").unwrap(),
            network_interface_xml("default", "52:54:00:00:00:01").unwrap()
        );
        let dom = DomainDevices::parse(&xml).unwrap();
        assert!(dom.has_bridge_interface("br7"));
        assert_eq!(dom.network_interface_macs("default"), vec!["52:54:00:00:00:01"]);
    }
}
