//! Virtual machine lookup by UUID.
//!
//! Older platforms cannot find templates through the search index, so the
//! lookup strategy is chosen from the platform version: the search index for
//! 6.5.0 and newer, a full container-view scan before that. Both strategies
//! implement [`ResolveByUuid`].

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Error, Result};
use crate::inventory::{Inventory, InventoryObject, ManagedObjectReference, VirtualMachine};

/// A three-component platform version with a total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlatformVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// First version whose search index finds templates by UUID.
pub const UUID_SEARCH_INDEX_VERSION: PlatformVersion = PlatformVersion::new(6, 5, 0);

impl PlatformVersion {
    /// Create a version.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// True if `self` sorts strictly before `other`.
    pub fn is_older_than(&self, other: &PlatformVersion) -> bool {
        self < other
    }
}

impl FromStr for PlatformVersion {
    type Err = Error;

    /// Parse `major.minor.patch`. Exactly three numeric components are accepted.
    fn from_str(s: &str) -> Result<Self> {
        let parse_error = || Error::VersionParse {
            version: s.to_string(),
        };

        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(parse_error());
        }
        let component = |i: usize| parts[i].parse::<u32>().map_err(|_| parse_error());

        Ok(Self::new(component(0)?, component(1)?, component(2)?))
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Resolve a virtual machine (or template) by its BIOS UUID.
pub trait ResolveByUuid {
    fn resolve_by_uuid(&self, uuid: &str) -> Result<VirtualMachine>;
}

/// Lookup through the platform's search index.
pub struct SearchIndexLookup<'a> {
    inventory: &'a dyn Inventory,
}

impl<'a> SearchIndexLookup<'a> {
    pub fn new(inventory: &'a dyn Inventory) -> Self {
        Self { inventory }
    }
}

impl ResolveByUuid for SearchIndexLookup<'_> {
    fn resolve_by_uuid(&self, uuid: &str) -> Result<VirtualMachine> {
        debug!(uuid, "using search index to look up UUID");
        let reference = self
            .inventory
            .find_vm_by_uuid(uuid)?
            .ok_or_else(|| vm_not_found(uuid))?;
        InventoryObject::from_reference(reference, None).into_virtual_machine()
    }
}

/// Lookup by scanning every virtual machine's config UUID.
pub struct ContainerViewLookup<'a> {
    inventory: &'a dyn Inventory,
}

impl<'a> ContainerViewLookup<'a> {
    pub fn new(inventory: &'a dyn Inventory) -> Self {
        Self { inventory }
    }
}

impl ResolveByUuid for ContainerViewLookup<'_> {
    fn resolve_by_uuid(&self, uuid: &str) -> Result<VirtualMachine> {
        debug!(uuid, "using container view to look up UUID");
        let matches: Vec<ManagedObjectReference> = self
            .inventory
            .virtual_machine_uuids()?
            .into_iter()
            .filter(|(_, vm_uuid)| vm_uuid.as_deref() == Some(uuid))
            .map(|(reference, _)| reference)
            .collect();

        match matches.len() {
            0 => Err(vm_not_found(uuid)),
            1 => {
                let reference = matches.into_iter().next().ok_or_else(|| vm_not_found(uuid))?;
                InventoryObject::from_reference(reference, None).into_virtual_machine()
            }
            _ => Err(Error::api(format!(
                "multiple virtual machines with UUID \"{}\" found",
                uuid
            ))),
        }
    }
}

/// Which lookup strategy a platform version calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidStrategy {
    SearchIndex,
    ContainerView,
}

impl UuidStrategy {
    /// Select the strategy for a platform version.
    pub fn for_version(version: &PlatformVersion) -> Self {
        if version.is_older_than(&UUID_SEARCH_INDEX_VERSION) {
            UuidStrategy::ContainerView
        } else {
            UuidStrategy::SearchIndex
        }
    }
}

/// Find a virtual machine by UUID using the strategy the platform supports.
pub fn virtual_machine_from_uuid(inventory: &dyn Inventory, uuid: &str) -> Result<VirtualMachine> {
    debug!(uuid, "locating virtual machine");
    let version: PlatformVersion = inventory.platform_version()?.parse()?;

    let vm = match UuidStrategy::for_version(&version) {
        UuidStrategy::SearchIndex => SearchIndexLookup::new(inventory).resolve_by_uuid(uuid)?,
        UuidStrategy::ContainerView => ContainerViewLookup::new(inventory).resolve_by_uuid(uuid)?,
    };

    debug!(uuid, vm = %vm, "virtual machine found");
    Ok(vm)
}

fn vm_not_found(uuid: &str) -> Error {
    Error::api(format!("virtual machine with UUID \"{}\" not found", uuid))
}
