//! Inventory objects and lookup.
//!
//! The import pipeline never inspects the vSphere object model directly.
//! It works with typed handles (`ResourcePool`, `Datastore`, ...) obtained
//! through the [`Inventory`] capability. Lookups by id return an
//! [`InventoryObject`] tagged with its kind, so callers pattern-match instead
//! of assuming the type of whatever the platform handed back.

use std::fmt;

use crate::error::{Error, Result};

/// A managed object reference: the platform's `(type, value)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagedObjectReference {
    /// The managed object type, e.g. `ResourcePool`.
    pub kind: String,
    /// The object id, e.g. `resgroup-42`.
    pub value: String,
}

impl ManagedObjectReference {
    /// Create a new reference.
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ManagedObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// The kinds of inventory object the importer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Datacenter,
    Datastore,
    Folder,
    Network,
    ResourcePool,
    VirtualMachine,
}

impl ObjectKind {
    /// The managed object type name used by the platform.
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectKind::Datacenter => "Datacenter",
            ObjectKind::Datastore => "Datastore",
            ObjectKind::Folder => "Folder",
            ObjectKind::Network => "Network",
            ObjectKind::ResourcePool => "ResourcePool",
            ObjectKind::VirtualMachine => "VirtualMachine",
        }
    }

    /// Classify a managed object type name.
    ///
    /// Subtypes map to their base kind: a `VirtualApp` is a resource pool, and
    /// distributed port groups and opaque networks are networks.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "Datacenter" => Some(ObjectKind::Datacenter),
            "Datastore" => Some(ObjectKind::Datastore),
            "Folder" => Some(ObjectKind::Folder),
            "Network" | "DistributedVirtualPortgroup" | "OpaqueNetwork" => {
                Some(ObjectKind::Network)
            }
            "ResourcePool" | "VirtualApp" => Some(ObjectKind::ResourcePool),
            "VirtualMachine" => Some(ObjectKind::VirtualMachine),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name {
            reference: ManagedObjectReference,
            name: Option<String>,
        }

        impl $name {
            /// Wrap a reference without checking its type.
            pub fn new(reference: ManagedObjectReference) -> Self {
                Self { reference, name: None }
            }

            /// Attach the object's display name or inventory path.
            pub fn with_name(mut self, name: impl Into<String>) -> Self {
                self.name = Some(name.into());
                self
            }

            /// The underlying managed object reference.
            pub fn reference(&self) -> &ManagedObjectReference {
                &self.reference
            }

            /// Display name or inventory path, if known.
            pub fn name(&self) -> Option<&str> {
                self.name.as_deref()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match &self.name {
                    Some(name) => write!(f, "{} ({})", name, self.reference),
                    None => write!(f, "{}", self.reference),
                }
            }
        }
    };
}

typed_handle!(
    /// A datacenter handle.
    Datacenter
);
typed_handle!(
    /// A datastore handle.
    Datastore
);
typed_handle!(
    /// A VM folder handle.
    Folder
);
typed_handle!(
    /// A network, distributed port group or opaque network handle.
    Network
);
typed_handle!(
    /// A resource pool (or vApp) handle.
    ResourcePool
);
typed_handle!(
    /// A virtual machine or template handle.
    VirtualMachine
);

/// The typed result of resolving a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryObject {
    Datacenter(Datacenter),
    Datastore(Datastore),
    Folder(Folder),
    Network(Network),
    ResourcePool(ResourcePool),
    VirtualMachine(VirtualMachine),
    /// A reference of a type the importer does not model.
    Other(ManagedObjectReference),
}

macro_rules! into_typed {
    ($fn_name:ident, $variant:ident) => {
        #[doc = concat!("Convert into a [`", stringify!($variant), "`] or fail with [`Error::UnexpectedType`].")]
        pub fn $fn_name(self) -> Result<$variant> {
            match self {
                InventoryObject::$variant(handle) => Ok(handle),
                other => Err(Error::UnexpectedType {
                    expected: ObjectKind::$variant,
                    actual: other.type_name().to_string(),
                }),
            }
        }
    };
}

impl InventoryObject {
    /// Tag a reference by its managed object type.
    pub fn from_reference(reference: ManagedObjectReference, name: Option<String>) -> Self {
        let kind = ObjectKind::from_type_name(&reference.kind);
        macro_rules! wrap {
            ($ty:ident) => {{
                let handle = $ty::new(reference);
                InventoryObject::$ty(match name {
                    Some(name) => handle.with_name(name),
                    None => handle,
                })
            }};
        }
        match kind {
            Some(ObjectKind::Datacenter) => wrap!(Datacenter),
            Some(ObjectKind::Datastore) => wrap!(Datastore),
            Some(ObjectKind::Folder) => wrap!(Folder),
            Some(ObjectKind::Network) => wrap!(Network),
            Some(ObjectKind::ResourcePool) => wrap!(ResourcePool),
            Some(ObjectKind::VirtualMachine) => wrap!(VirtualMachine),
            None => InventoryObject::Other(reference),
        }
    }

    /// The managed object reference behind this object.
    pub fn reference(&self) -> &ManagedObjectReference {
        match self {
            InventoryObject::Datacenter(h) => h.reference(),
            InventoryObject::Datastore(h) => h.reference(),
            InventoryObject::Folder(h) => h.reference(),
            InventoryObject::Network(h) => h.reference(),
            InventoryObject::ResourcePool(h) => h.reference(),
            InventoryObject::VirtualMachine(h) => h.reference(),
            InventoryObject::Other(r) => r,
        }
    }

    /// The platform type name of the referenced object.
    pub fn type_name(&self) -> &str {
        &self.reference().kind
    }

    into_typed!(into_datacenter, Datacenter);
    into_typed!(into_datastore, Datastore);
    into_typed!(into_folder, Folder);
    into_typed!(into_network, Network);
    into_typed!(into_resource_pool, ResourcePool);
    into_typed!(into_virtual_machine, VirtualMachine);
}

/// Where an imported template lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub resource_pool: ResourcePool,
    pub datastore: Datastore,
    pub folder: Folder,
    pub datacenter: Datacenter,
}

/// Inventory lookups needed by the importer.
///
/// Implementations talk to the platform; the importer only consumes the
/// typed results.
pub trait Inventory: Send + Sync {
    /// Resolve an object by kind and id. The result is tagged with the kind
    /// the platform reports, which may differ from `kind`.
    fn object_by_id(&self, kind: ObjectKind, id: &str) -> Result<InventoryObject>;

    /// Resolve an object by inventory path (e.g. `dc1/vm/templates`).
    fn object_by_path(&self, path: &str) -> Result<InventoryObject>;

    /// The folder holding `datacenter`'s virtual machines and templates.
    fn vm_folder(&self, datacenter: &Datacenter) -> Result<Folder>;

    /// All networks in `datacenter` whose name is `name`.
    fn networks_named(&self, datacenter: &Datacenter, name: &str) -> Result<Vec<Network>>;

    /// The platform's version string, e.g. `6.7.0`.
    fn platform_version(&self) -> Result<String>;

    /// Look up a virtual machine by BIOS UUID through the search index.
    fn find_vm_by_uuid(&self, uuid: &str) -> Result<Option<ManagedObjectReference>>;

    /// Every virtual machine with its BIOS UUID, if it has a config.
    fn virtual_machine_uuids(&self) -> Result<Vec<(ManagedObjectReference, Option<String>)>>;
}

/// Resolve a resource pool by id.
pub fn resource_pool_from_id(inventory: &dyn Inventory, id: &str) -> Result<ResourcePool> {
    inventory
        .object_by_id(ObjectKind::ResourcePool, id)?
        .into_resource_pool()
}

/// Resolve a datastore by id.
pub fn datastore_from_id(inventory: &dyn Inventory, id: &str) -> Result<Datastore> {
    inventory
        .object_by_id(ObjectKind::Datastore, id)?
        .into_datastore()
}

/// Resolve a datacenter by name or path.
pub fn datacenter_from_path(inventory: &dyn Inventory, path: &str) -> Result<Datacenter> {
    inventory
        .object_by_path(&normalize_path(path))?
        .into_datacenter()
}

/// Resolve a folder by absolute inventory path.
pub fn folder_from_path(inventory: &dyn Inventory, path: &str) -> Result<Folder> {
    inventory.object_by_path(&normalize_path(path))?.into_folder()
}

/// Resolve the full placement tuple from ids and paths.
///
/// An empty folder path (`""` or `"/"`) means the datacenter's VM folder.
pub fn resolve_placement(
    inventory: &dyn Inventory,
    resource_pool_id: &str,
    datastore_id: &str,
    datacenter: &str,
    folder: &str,
) -> Result<Placement> {
    let resource_pool = resource_pool_from_id(inventory, resource_pool_id)?;
    let datastore = datastore_from_id(inventory, datastore_id)?;
    let datacenter = datacenter_from_path(inventory, datacenter)?;
    let folder = if normalize_path(folder).is_empty() {
        inventory.vm_folder(&datacenter)?
    } else {
        folder_from_path(inventory, folder)?
    };
    Ok(Placement {
        resource_pool,
        datastore,
        folder,
        datacenter,
    })
}

/// True if a folder path would resolve to the inventory root (`""` or `"/"`).
pub fn path_is_empty(path: &str) -> bool {
    path.is_empty() || path == "/"
}

/// Normalize an inventory path: collapse `.`/`..`/duplicate separators and
/// drop the leading slash.
pub fn normalize_path(path: &str) -> String {
    if path_is_empty(path) {
        return String::new();
    }
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}
