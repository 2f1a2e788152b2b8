//! OVF descriptor parsing.
//!
//! This module decodes an OVF descriptor into an [`Envelope`]: the file
//! references, virtual disks, logical networks and virtual systems the
//! package declares. Parsing is event based and only keeps the parts of the
//! descriptor the import pipeline needs; the raw descriptor text is what gets
//! sent to the platform.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};

/// Disk format URI for streamOptimized VMDK payloads.
pub const STREAM_OPTIMIZED_FORMAT: &str =
    "http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized";

/// CIM resource types used in virtual hardware items.
pub mod resource_type {
    /// Virtual CPU.
    pub const PROCESSOR: u32 = 3;
    /// Memory.
    pub const MEMORY: u32 = 4;
    /// IDE controller.
    pub const IDE_CONTROLLER: u32 = 5;
    /// Parallel SCSI HBA.
    pub const SCSI_CONTROLLER: u32 = 6;
    /// Ethernet adapter.
    pub const ETHERNET_ADAPTER: u32 = 10;
    /// CD drive.
    pub const CD_DRIVE: u32 = 15;
    /// Disk drive.
    pub const DISK_DRIVE: u32 = 17;
}

/// A file listed in the descriptor's `References` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    /// The `ovf:id` used by disks to point at this file.
    pub id: String,
    /// Location of the file relative to the descriptor.
    pub href: String,
    /// Declared size in bytes, if present.
    pub size: Option<u64>,
    /// `ovf:compression`, e.g. `gzip`.
    pub compression: Option<String>,
}

/// A virtual disk from the descriptor's `DiskSection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDisk {
    /// The `ovf:diskId` identifier.
    pub disk_id: String,
    /// The `ovf:fileRef` pointing into the references, if the disk has content.
    pub file_ref: Option<String>,
    /// Raw capacity value (may be a property reference).
    pub capacity: String,
    /// Capacity allocation units (e.g. `byte * 2^30`).
    pub capacity_units: Option<String>,
    /// Populated size in bytes, if declared.
    pub populated_size: Option<u64>,
    /// Disk format URI.
    pub format: Option<String>,
}

impl VirtualDisk {
    /// Capacity in bytes, if the capacity is numeric and the units are known.
    pub fn capacity_bytes(&self) -> Option<u64> {
        let value: u64 = self.capacity.trim().parse().ok()?;
        let multiplier = match &self.capacity_units {
            Some(units) => allocation_unit_multiplier(units)?,
            None => 1,
        };
        value.checked_mul(multiplier)
    }

    /// True if the disk payload is declared as a streamOptimized VMDK.
    pub fn is_stream_optimized(&self) -> bool {
        self.format
            .as_deref()
            .map(|f| f.ends_with("#streamOptimized"))
            .unwrap_or(false)
    }
}

/// A logical network declared in the descriptor's `NetworkSection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDefinition {
    /// The `ovf:name` of the network.
    pub name: String,
    /// Human-readable description, if any.
    pub description: Option<String>,
}

/// One `Item` of a `VirtualHardwareSection`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareItem {
    pub instance_id: String,
    pub resource_type: Option<u32>,
    pub resource_sub_type: Option<String>,
    pub element_name: String,
    pub virtual_quantity: Option<u64>,
    pub allocation_units: Option<String>,
    pub parent: Option<String>,
    pub address_on_parent: Option<String>,
    /// Network names for ethernet adapters.
    pub connections: Vec<String>,
    /// Host resources, e.g. `ovf:/disk/vmdisk1`.
    pub host_resources: Vec<String>,
}

/// A `VirtualSystem` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualSystem {
    /// The `ovf:id` of the system.
    pub id: String,
    /// The display name, if declared.
    pub name: Option<String>,
    /// Guest OS type from `OperatingSystemSection` (`vmw:osType`).
    pub os_type: Option<String>,
    /// Virtual hardware items in declaration order.
    pub hardware: Vec<HardwareItem>,
}

impl VirtualSystem {
    /// Number of virtual CPUs declared.
    pub fn cpu_count(&self) -> u64 {
        self.hardware
            .iter()
            .filter(|item| item.resource_type == Some(resource_type::PROCESSOR))
            .filter_map(|item| item.virtual_quantity)
            .sum()
    }

    /// Memory in megabytes, if declared.
    pub fn memory_mb(&self) -> Option<u64> {
        let item = self
            .hardware
            .iter()
            .find(|item| item.resource_type == Some(resource_type::MEMORY))?;
        let quantity = item.virtual_quantity?;
        let bytes = match &item.allocation_units {
            Some(units) => quantity.checked_mul(allocation_unit_multiplier(units)?)?,
            // CIM default for memory is megabytes.
            None => return Some(quantity),
        };
        Some(bytes / (1024 * 1024))
    }
}

/// Parsed OVF descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Files referenced by the package, in declaration order.
    pub references: Vec<FileReference>,
    /// Virtual disks, in declaration order.
    pub disks: Vec<VirtualDisk>,
    /// Logical networks, in declaration order.
    pub networks: Vec<NetworkDefinition>,
    /// Virtual systems (one, or several for a collection).
    pub virtual_systems: Vec<VirtualSystem>,
}

impl Envelope {
    /// Declared network names in declaration order.
    pub fn network_names(&self) -> impl Iterator<Item = &str> {
        self.networks.iter().map(|n| n.name.as_str())
    }

    /// Look up a file reference by its `ovf:id`.
    pub fn reference(&self, id: &str) -> Option<&FileReference> {
        self.references.iter().find(|r| r.id == id)
    }

    /// Look up a file reference by its `ovf:href`.
    pub fn file_for_href(&self, href: &str) -> Option<&FileReference> {
        self.references.iter().find(|r| r.href == href)
    }

    /// Find the disk whose content lives at `href`.
    pub fn disk_for_href(&self, href: &str) -> Option<&VirtualDisk> {
        let reference = self.file_for_href(href)?;
        self.disks
            .iter()
            .find(|d| d.file_ref.as_deref() == Some(reference.id.as_str()))
    }

    /// Sum of all declared file sizes.
    pub fn total_declared_size(&self) -> u64 {
        self.references.iter().filter_map(|r| r.size).sum()
    }

    /// Name of the first virtual system, falling back to its id.
    pub fn system_name(&self) -> Option<&str> {
        let system = self.virtual_systems.first()?;
        Some(system.name.as_deref().unwrap_or(system.id.as_str()))
    }
}

/// Parse an OVF descriptor from raw bytes.
///
/// # Arguments
///
/// * `bytes` - The descriptor contents.
///
/// # Errors
///
/// Returns [`Error::MalformedDescriptor`] if the bytes are not UTF-8, are
/// not well-formed XML, are not an OVF `Envelope`, lack a virtual system, or
/// miss required attributes.
pub fn parse_envelope(bytes: &[u8]) -> Result<Envelope> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::malformed(format!("descriptor is not valid UTF-8: {}", e)))?;
    parse_envelope_str(text.trim_start_matches('\u{feff}'))
}

/// Parse an OVF descriptor from a string.
pub fn parse_envelope_str(xml: &str) -> Result<Envelope> {
    let mut reader = Reader::from_str(xml);
    let mut envelope = Envelope::default();

    let mut stack: Vec<String> = Vec::new();
    let mut saw_root = false;
    // Virtual systems can nest inside a collection, so keep a stack of them.
    let mut systems: Vec<VirtualSystem> = Vec::new();
    let mut item: Option<HardwareItem> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::malformed(format!("XML error at byte {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let tag = local_name(e);

                if !saw_root {
                    if tag != "Envelope" {
                        return Err(Error::malformed(format!(
                            "root element is '{}', expected 'Envelope'",
                            tag
                        )));
                    }
                    saw_root = true;
                }

                let parent = stack.last().map(|s| s.as_str()).unwrap_or("");
                match tag.as_str() {
                    "File" if parent == "References" => {
                        envelope.references.push(FileReference {
                            id: required_attr(e, "id", "File")?,
                            href: required_attr(e, "href", "File")?,
                            size: optional_u64(e, "size")?,
                            compression: attr(e, "compression")?.filter(|c| c != "identity"),
                        });
                    }
                    "Disk" if parent == "DiskSection" => {
                        envelope.disks.push(VirtualDisk {
                            disk_id: required_attr(e, "diskId", "Disk")?,
                            file_ref: attr(e, "fileRef")?,
                            capacity: required_attr(e, "capacity", "Disk")?,
                            capacity_units: attr(e, "capacityAllocationUnits")?,
                            populated_size: optional_u64(e, "populatedSize")?,
                            format: attr(e, "format")?,
                        });
                    }
                    "Network" if parent == "NetworkSection" => {
                        envelope.networks.push(NetworkDefinition {
                            name: required_attr(e, "name", "Network")?,
                            description: None,
                        });
                    }
                    "VirtualSystem" => {
                        let system = VirtualSystem {
                            id: required_attr(e, "id", "VirtualSystem")?,
                            ..VirtualSystem::default()
                        };
                        if is_empty {
                            envelope.virtual_systems.push(system);
                        } else {
                            systems.push(system);
                        }
                    }
                    "OperatingSystemSection" => {
                        if let Some(system) = systems.last_mut() {
                            system.os_type = attr(e, "osType")?;
                        }
                    }
                    "Item" | "StorageItem" | "EthernetPortItem"
                        if parent == "VirtualHardwareSection" && !is_empty =>
                    {
                        item = Some(HardwareItem::default());
                    }
                    _ => {}
                }

                if !is_empty {
                    stack.push(tag);
                }
            }
            Event::Text(ref t) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::malformed(format!("invalid text content: {}", e)))?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                capture_text(&stack, text, &mut envelope, &mut systems, item.as_mut())?;
            }
            Event::CData(ref c) => {
                let text = String::from_utf8_lossy(c).trim().to_string();
                if !text.is_empty() {
                    capture_text(&stack, &text, &mut envelope, &mut systems, item.as_mut())?;
                }
            }
            Event::End(_) => {
                let tag = stack
                    .pop()
                    .ok_or_else(|| Error::malformed("unbalanced closing tag"))?;
                match tag.as_str() {
                    "VirtualSystem" => {
                        if let Some(system) = systems.pop() {
                            envelope.virtual_systems.push(system);
                        }
                    }
                    "Item" | "StorageItem" | "EthernetPortItem" => {
                        if let (Some(done), Some(system)) = (item.take(), systems.last_mut()) {
                            system.hardware.push(done);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(Error::malformed("document has no root element"));
    }
    if !stack.is_empty() {
        return Err(Error::malformed(format!(
            "unexpected end of document inside '{}'",
            stack.join("/")
        )));
    }
    if envelope.virtual_systems.is_empty() {
        return Err(Error::malformed("envelope contains no VirtualSystem"));
    }

    Ok(envelope)
}

/// Route a text node to the field it belongs to, based on the element stack.
fn capture_text(
    stack: &[String],
    text: &str,
    envelope: &mut Envelope,
    systems: &mut [VirtualSystem],
    item: Option<&mut HardwareItem>,
) -> Result<()> {
    let Some(tag) = stack.last() else {
        return Ok(());
    };
    let parent = stack
        .len()
        .checked_sub(2)
        .map(|i| stack[i].as_str())
        .unwrap_or("");

    if let Some(item) = item {
        match tag.as_str() {
            "InstanceID" => item.instance_id = text.to_string(),
            "ResourceType" => {
                let value = parse_u64(text, "ResourceType")?;
                let resource_type = u32::try_from(value).map_err(|_| {
                    Error::malformed(format!("ResourceType {} is out of range", value))
                })?;
                item.resource_type = Some(resource_type);
            }
            "ResourceSubType" => item.resource_sub_type = Some(text.to_string()),
            "ElementName" => item.element_name = text.to_string(),
            "VirtualQuantity" => {
                item.virtual_quantity = Some(parse_u64(text, "VirtualQuantity")?);
            }
            "AllocationUnits" => item.allocation_units = Some(text.to_string()),
            "Parent" => item.parent = Some(text.to_string()),
            "AddressOnParent" => item.address_on_parent = Some(text.to_string()),
            "Connection" => item.connections.push(text.to_string()),
            "HostResource" => item.host_resources.push(text.to_string()),
            _ => {}
        }
        return Ok(());
    }

    match (tag.as_str(), parent) {
        ("Name", "VirtualSystem") => {
            if let Some(system) = systems.last_mut() {
                system.name = Some(text.to_string());
            }
        }
        ("Description", "Network") => {
            if let Some(network) = envelope.networks.last_mut() {
                network.description = Some(text.to_string());
            }
        }
        _ => {}
    }
    Ok(())
}

/// Convert a CIM allocation unit string to a byte multiplier.
///
/// Accepts `byte`, `byte * 2^N`, `byte * N` and the `KiloBytes` /
/// `MegaBytes` / `GigaBytes` spellings.
pub fn allocation_unit_multiplier(units: &str) -> Option<u64> {
    let compact: String = units
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    match compact.as_str() {
        "byte" | "bytes" => Some(1),
        "kilobytes" | "kb" => Some(1 << 10),
        "megabytes" | "mb" => Some(1 << 20),
        "gigabytes" | "gb" => Some(1 << 30),
        other => {
            let factor = other.strip_prefix("byte*")?;
            match factor.strip_prefix("2^") {
                Some(exponent) => 1u64.checked_shl(exponent.parse().ok()?),
                None => factor.parse().ok(),
            }
        }
    }
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_string()
}

/// Read an attribute by local name, ignoring its namespace prefix.
fn attr(e: &BytesStart, name: &str) -> Result<Option<String>> {
    for attribute in e.attributes() {
        let attribute =
            attribute.map_err(|err| Error::malformed(format!("invalid attribute: {}", err)))?;
        if attribute.key.local_name().as_ref() == name.as_bytes() {
            let value = attribute
                .unescape_value()
                .map_err(|err| Error::malformed(format!("invalid attribute value: {}", err)))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn required_attr(e: &BytesStart, name: &str, element: &str) -> Result<String> {
    attr(e, name)?.ok_or_else(|| {
        Error::malformed(format!("{} element is missing required attribute '{}'", element, name))
    })
}

fn optional_u64(e: &BytesStart, name: &str) -> Result<Option<u64>> {
    attr(e, name)?.map(|v| parse_u64(&v, name)).transpose()
}

fn parse_u64(value: &str, what: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::malformed(format!("'{}' is not a valid {}", value, what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1">
  <References/>
  <VirtualSystem ovf:id="vm">
    <Name>vm</Name>
  </VirtualSystem>
</Envelope>"#;

    #[test]
    fn test_allocation_units_power_of_two() {
        assert_eq!(allocation_unit_multiplier("byte * 2^30"), Some(1 << 30));
        assert_eq!(allocation_unit_multiplier("byte*2^20"), Some(1 << 20));
    }

    #[test]
    fn test_allocation_units_named() {
        assert_eq!(allocation_unit_multiplier("byte"), Some(1));
        assert_eq!(allocation_unit_multiplier("MegaBytes"), Some(1 << 20));
        assert_eq!(allocation_unit_multiplier("byte * 1024"), Some(1024));
    }

    #[test]
    fn test_allocation_units_unknown() {
        assert_eq!(allocation_unit_multiplier("hertz * 10^6"), None);
        assert_eq!(allocation_unit_multiplier("byte * 2^99"), None);
    }

    #[test]
    fn test_capacity_bytes() {
        let disk = VirtualDisk {
            disk_id: "vmdisk1".to_string(),
            file_ref: Some("file1".to_string()),
            capacity: "16".to_string(),
            capacity_units: Some("byte * 2^30".to_string()),
            populated_size: None,
            format: Some(STREAM_OPTIMIZED_FORMAT.to_string()),
        };
        assert_eq!(disk.capacity_bytes(), Some(16 * (1 << 30)));
        assert!(disk.is_stream_optimized());
    }

    #[test]
    fn test_capacity_property_reference() {
        let disk = VirtualDisk {
            disk_id: "vmdisk1".to_string(),
            file_ref: None,
            capacity: "${disk.size}".to_string(),
            capacity_units: None,
            populated_size: None,
            format: None,
        };
        assert_eq!(disk.capacity_bytes(), None);
        assert!(!disk.is_stream_optimized());
    }

    #[test]
    fn test_minimal_envelope() {
        let envelope = parse_envelope_str(MINIMAL).unwrap();
        assert!(envelope.references.is_empty());
        assert!(envelope.networks.is_empty());
        assert_eq!(envelope.virtual_systems.len(), 1);
        assert_eq!(envelope.system_name(), Some("vm"));
    }

    #[test]
    fn test_byte_order_mark_is_ignored() {
        let mut bytes = "\u{feff}".as_bytes().to_vec();
        bytes.extend_from_slice(MINIMAL.as_bytes());
        assert!(parse_envelope(&bytes).is_ok());
    }

    #[test]
    fn test_invalid_utf8() {
        let err = parse_envelope(&[0x3c, 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, Error::MalformedDescriptor { .. }));
    }

    #[test]
    fn test_wrong_root() {
        let err = parse_envelope_str("<Project/>").unwrap_err();
        assert!(err.to_string().contains("expected 'Envelope'"));
    }

    #[test]
    fn test_mismatched_tags() {
        let err = parse_envelope_str("<Envelope><VirtualSystem></Envelope>").unwrap_err();
        assert!(matches!(err, Error::MalformedDescriptor { .. }));
    }

    #[test]
    fn test_truncated_document() {
        let err = parse_envelope_str("<Envelope><VirtualSystem ovf:id=\"a\">").unwrap_err();
        assert!(matches!(err, Error::MalformedDescriptor { .. }));
    }

    #[test]
    fn test_missing_virtual_system() {
        let err = parse_envelope_str("<Envelope><References/></Envelope>").unwrap_err();
        assert!(err.to_string().contains("no VirtualSystem"));
    }
}
