//! Shared fixtures for integration tests: package builders and fake
//! collaborators that record every call they receive.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use ovfimport_core::api::{
    DeviceUrl, FileItem, ImportSpec, ImportSpecParams, LeaseInfo, LeaseState, LeaseStatus,
    ManagementApi, UploadBody,
};
use ovfimport_core::inventory::{
    Datacenter, Datastore, Folder, Inventory, InventoryObject, ManagedObjectReference, Network,
    ObjectKind, Placement, ResourcePool, VirtualMachine,
};
use ovfimport_core::{CancelToken, Error, ImportOptions, Result};
use url::Url;

pub const STREAM_OPTIMIZED: &str =
    "http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized";

/// Build an OVF descriptor declaring `networks` and one streamOptimized disk
/// per file.
pub fn descriptor(networks: &[&str], files: &[(&str, u64)]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData"
          xmlns:vmw="http://www.vmware.com/schema/ovf">
  <References>
"#,
    );
    for (i, (href, size)) in files.iter().enumerate() {
        xml.push_str(&format!(
            "    <File ovf:id=\"file{}\" ovf:href=\"{}\" ovf:size=\"{}\"/>\n",
            i, href, size
        ));
    }
    xml.push_str("  </References>\n  <DiskSection>\n    <Info>Virtual disk information</Info>\n");
    for (i, _) in files.iter().enumerate() {
        xml.push_str(&format!(
            "    <Disk ovf:capacity=\"1\" ovf:capacityAllocationUnits=\"byte * 2^30\" ovf:diskId=\"vmdisk{}\" ovf:fileRef=\"file{}\" ovf:format=\"{}\"/>\n",
            i, i, STREAM_OPTIMIZED
        ));
    }
    xml.push_str("  </DiskSection>\n");
    if !networks.is_empty() {
        xml.push_str("  <NetworkSection>\n    <Info>The list of logical networks</Info>\n");
        for name in networks {
            xml.push_str(&format!(
                "    <Network ovf:name=\"{0}\">\n      <Description>The {0} network</Description>\n    </Network>\n",
                name
            ));
        }
        xml.push_str("  </NetworkSection>\n");
    }
    xml.push_str(
        r#"  <VirtualSystem ovf:id="photon">
    <Info>A virtual machine</Info>
    <Name>photon</Name>
    <OperatingSystemSection ovf:id="36" vmw:osType="other3xLinux64Guest">
      <Info>The kind of installed guest operating system</Info>
    </OperatingSystemSection>
    <VirtualHardwareSection>
      <Info>Virtual hardware requirements</Info>
      <Item>
        <rasd:AllocationUnits>hertz * 10^6</rasd:AllocationUnits>
        <rasd:ElementName>2 virtual CPU(s)</rasd:ElementName>
        <rasd:InstanceID>1</rasd:InstanceID>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>2</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:AllocationUnits>byte * 2^20</rasd:AllocationUnits>
        <rasd:ElementName>2048MB of memory</rasd:ElementName>
        <rasd:InstanceID>2</rasd:InstanceID>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>2048</rasd:VirtualQuantity>
      </Item>
"#,
    );
    for name in networks {
        xml.push_str(&format!(
            "      <Item>\n        <rasd:Connection>{}</rasd:Connection>\n        <rasd:ElementName>Ethernet</rasd:ElementName>\n        <rasd:InstanceID>10</rasd:InstanceID>\n        <rasd:ResourceType>10</rasd:ResourceType>\n      </Item>\n",
            name
        ));
    }
    xml.push_str("    </VirtualHardwareSection>\n  </VirtualSystem>\n</Envelope>\n");
    xml
}

/// A streamOptimized VMDK payload of exactly `len` bytes (at least 512).
pub fn stream_vmdk(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len.max(512)];
    data[0..4].copy_from_slice(&0x564D_444Bu32.to_le_bytes());
    data[4..8].copy_from_slice(&3u32.to_le_bytes());
    data[8..12].copy_from_slice(&((1u32 << 16) | (1u32 << 17) | 1).to_le_bytes());
    data[12..20].copy_from_slice(&2048u64.to_le_bytes());
    data[20..28].copy_from_slice(&128u64.to_le_bytes());
    data[44..48].copy_from_slice(&512u32.to_le_bytes());
    data[77..79].copy_from_slice(&1u16.to_le_bytes());
    for (i, byte) in data.iter_mut().enumerate().skip(512) {
        *byte = (i % 251) as u8;
    }
    data
}

/// Write a loose OVF package into `dir` and return the descriptor path.
pub fn write_ovf_package(dir: &Path, networks: &[&str], payloads: &[(&str, Vec<u8>)]) -> PathBuf {
    let files: Vec<(&str, u64)> = payloads
        .iter()
        .map(|(name, data)| (*name, data.len() as u64))
        .collect();
    let path = dir.join("photon.ovf");
    fs::write(&path, descriptor(networks, &files)).unwrap();
    for (name, data) in payloads {
        fs::write(dir.join(name), data).unwrap();
    }
    path
}

/// File items matching a set of payloads, with their real sizes.
pub fn file_items(payloads: &[(&str, Vec<u8>)]) -> Vec<FileItem> {
    payloads
        .iter()
        .enumerate()
        .map(|(i, (name, data))| FileItem {
            device_id: format!("/photon/VirtualLsiLogicController0:{}", i),
            path: name.to_string(),
            size: Some(data.len() as u64),
            create: false,
        })
        .collect()
}

pub fn placement() -> Placement {
    Placement {
        resource_pool: ResourcePool::new(ManagedObjectReference::new("ResourcePool", "resgroup-8")),
        datastore: Datastore::new(ManagedObjectReference::new("Datastore", "datastore-11")),
        folder: Folder::new(ManagedObjectReference::new("Folder", "group-v3")),
        datacenter: Datacenter::new(ManagedObjectReference::new("Datacenter", "datacenter-2"))
            .with_name("dc1"),
    }
}

/// Options that poll quickly and only send the initial keepalive report.
pub fn test_options() -> ImportOptions {
    ImportOptions::new(
        Duration::from_secs(5),
        Duration::from_millis(1),
        Duration::from_secs(3600),
    )
}

/// A call received by [`FakeApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateImportSpec {
        entity_name: Option<String>,
        networks: Vec<(String, String)>,
    },
    ImportVApp,
    LeaseStatus,
    Progress(u8),
    Upload {
        file: String,
        bytes: u64,
        content_length: u64,
    },
    Complete,
    Abort(String),
    MarkAsTemplate(String),
}

/// Scriptable in-memory management API.
pub struct FakeApi {
    calls: Mutex<Vec<Call>>,
    file_items: Vec<FileItem>,
    spec_errors: Vec<String>,
    spec_warnings: Vec<String>,
    open_error: Option<String>,
    lease_states: Mutex<VecDeque<LeaseState>>,
    lease_error: Option<String>,
    entity: Option<ManagedObjectReference>,
    fail_upload: Option<usize>,
    cancel_during_upload: Option<(usize, CancelToken)>,
    upload_delay: Duration,
    panic_upload: Option<usize>,
    uploads: AtomicUsize,
}

impl FakeApi {
    pub fn new(file_items: Vec<FileItem>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            file_items,
            spec_errors: Vec::new(),
            spec_warnings: Vec::new(),
            open_error: None,
            lease_states: Mutex::new(VecDeque::from([
                LeaseState::Initializing,
                LeaseState::Ready,
            ])),
            lease_error: None,
            entity: Some(ManagedObjectReference::new("VirtualMachine", "vm-42")),
            fail_upload: None,
            cancel_during_upload: None,
            upload_delay: Duration::ZERO,
            panic_upload: None,
            uploads: AtomicUsize::new(0),
        }
    }

    pub fn with_spec_errors(mut self, errors: &[&str]) -> Self {
        self.spec_errors = errors.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn with_spec_warnings(mut self, warnings: &[&str]) -> Self {
        self.spec_warnings = warnings.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn with_open_error(mut self, message: &str) -> Self {
        self.open_error = Some(message.to_string());
        self
    }

    /// States returned by successive polls; the last one repeats.
    pub fn with_lease_states(self, states: &[LeaseState]) -> Self {
        *self.lease_states.lock().unwrap() = states.iter().copied().collect();
        self
    }

    pub fn with_lease_error(mut self, message: &str) -> Self {
        self.lease_error = Some(message.to_string());
        self
    }

    pub fn with_entity(mut self, entity: Option<ManagedObjectReference>) -> Self {
        self.entity = entity;
        self
    }

    /// Fail the upload with this zero-based index after reading its body.
    pub fn fail_upload_at(mut self, index: usize) -> Self {
        self.fail_upload = Some(index);
        self
    }

    /// Cancel `token` when the upload with this index starts.
    pub fn cancel_during_upload(mut self, index: usize, token: CancelToken) -> Self {
        self.cancel_during_upload = Some((index, token));
        self
    }

    /// Panic inside the upload with this index, before reading its body.
    pub fn panic_upload_at(mut self, index: usize) -> Self {
        self.panic_upload = Some(index);
        self
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    pub fn position(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls().iter().position(predicate)
    }

    pub fn last_position(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls().iter().rposition(predicate)
    }

    pub fn uploaded_files(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Upload { file, .. } => Some(file),
                _ => None,
            })
            .collect()
    }

    fn device_urls(&self) -> Vec<DeviceUrl> {
        self.file_items
            .iter()
            .map(|item| DeviceUrl {
                import_key: item.device_id.clone(),
                url: Url::parse(&format!("https://esx-01.example.com/nfc/52ab/{}", item.path))
                    .unwrap(),
                ssl_thumbprint: None,
            })
            .collect()
    }
}

impl ManagementApi for FakeApi {
    fn create_import_spec(
        &self,
        _descriptor: &str,
        _pool: &ResourcePool,
        _datastore: &Datastore,
        params: &ImportSpecParams<'_>,
    ) -> Result<ImportSpec> {
        self.record(Call::CreateImportSpec {
            entity_name: params.entity_name.map(str::to_string),
            networks: params
                .network_mapping
                .iter()
                .map(|m| (m.name.clone(), m.network.reference().value.clone()))
                .collect(),
        });
        Ok(ImportSpec {
            handle: "<spec/>".to_string(),
            file_items: self.file_items.clone(),
            errors: self.spec_errors.clone(),
            warnings: self.spec_warnings.clone(),
        })
    }

    fn import_vapp(
        &self,
        _pool: &ResourcePool,
        _spec: &ImportSpec,
        _folder: &Folder,
    ) -> Result<ManagedObjectReference> {
        self.record(Call::ImportVApp);
        match &self.open_error {
            Some(message) => Err(Error::api(message.clone())),
            None => Ok(ManagedObjectReference::new("HttpNfcLease", "session[52ab]lease-1")),
        }
    }

    fn lease_status(&self, _lease: &ManagedObjectReference) -> Result<LeaseStatus> {
        self.record(Call::LeaseStatus);
        let state = {
            let mut states = self.lease_states.lock().unwrap();
            if states.len() > 1 {
                states.pop_front().unwrap()
            } else {
                states.front().copied().unwrap_or(LeaseState::Ready)
            }
        };
        Ok(LeaseStatus {
            state,
            error: match state {
                LeaseState::Error => self.lease_error.clone(),
                _ => None,
            },
            info: match state {
                LeaseState::Ready => Some(LeaseInfo {
                    entity: self.entity.clone(),
                    device_urls: self.device_urls(),
                }),
                _ => None,
            },
        })
    }

    fn lease_progress(&self, _lease: &ManagedObjectReference, percent: u8) -> Result<()> {
        self.record(Call::Progress(percent));
        Ok(())
    }

    fn lease_complete(&self, _lease: &ManagedObjectReference) -> Result<()> {
        self.record(Call::Complete);
        Ok(())
    }

    fn lease_abort(&self, _lease: &ManagedObjectReference, reason: &str) -> Result<()> {
        self.record(Call::Abort(reason.to_string()));
        Ok(())
    }

    fn upload(
        &self,
        url: &Url,
        _create: bool,
        body: UploadBody,
        _cancel: &CancelToken,
    ) -> Result<()> {
        let index = self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.panic_upload == Some(index) {
            panic!("transport crashed during upload {}", index);
        }
        if let Some((at, token)) = &self.cancel_during_upload {
            if *at == index {
                token.cancel();
            }
        }
        if !self.upload_delay.is_zero() {
            std::thread::sleep(self.upload_delay);
        }

        let mut reader = body.reader;
        let mut data = Vec::new();
        let read = reader.read_to_end(&mut data);

        self.record(Call::Upload {
            file: url.path().rsplit('/').next().unwrap_or_default().to_string(),
            bytes: data.len() as u64,
            content_length: body.content_length,
        });

        if let Err(e) = read {
            return Err(Error::api(format!("connection reset: {}", e)));
        }
        if self.fail_upload == Some(index) {
            return Err(Error::api("HTTP 500 Internal Server Error"));
        }
        Ok(())
    }

    fn mark_as_template(&self, vm: &VirtualMachine) -> Result<()> {
        self.record(Call::MarkAsTemplate(vm.reference().value.clone()));
        Ok(())
    }
}

/// In-memory inventory.
pub struct FakeInventory {
    networks: Vec<(String, ManagedObjectReference)>,
    objects: Vec<(ManagedObjectReference, String)>,
    paths: Vec<(String, ManagedObjectReference)>,
    version: String,
    search_index: Vec<(String, ManagedObjectReference)>,
    vm_uuids: Vec<(ManagedObjectReference, Option<String>)>,
    vm_folders: Vec<(String, ManagedObjectReference)>,
    lookups: Mutex<Vec<String>>,
}

impl FakeInventory {
    pub fn new() -> Self {
        Self {
            networks: Vec::new(),
            objects: Vec::new(),
            paths: Vec::new(),
            version: "7.0.3".to_string(),
            search_index: Vec::new(),
            vm_uuids: Vec::new(),
            vm_folders: Vec::new(),
            lookups: Mutex::new(Vec::new()),
        }
    }

    pub fn with_network(mut self, name: &str, kind: &str, id: &str) -> Self {
        self.networks
            .push((name.to_string(), ManagedObjectReference::new(kind, id)));
        self
    }

    pub fn with_object(mut self, kind: &str, id: &str, name: &str) -> Self {
        self.objects
            .push((ManagedObjectReference::new(kind, id), name.to_string()));
        self
    }

    pub fn with_path(mut self, path: &str, kind: &str, id: &str) -> Self {
        self.paths
            .push((path.to_string(), ManagedObjectReference::new(kind, id)));
        self
    }

    pub fn with_vm_folder(mut self, datacenter_id: &str, folder_id: &str) -> Self {
        self.vm_folders.push((
            datacenter_id.to_string(),
            ManagedObjectReference::new("Folder", folder_id),
        ));
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Register a VM visible to the search index and the container scan.
    pub fn with_vm(mut self, id: &str, uuid: &str, indexed: bool) -> Self {
        let reference = ManagedObjectReference::new("VirtualMachine", id);
        if indexed {
            self.search_index.push((uuid.to_string(), reference.clone()));
        }
        self.vm_uuids.push((reference, Some(uuid.to_string())));
        self
    }

    pub fn with_unconfigured_vm(mut self, id: &str) -> Self {
        self.vm_uuids
            .push((ManagedObjectReference::new("VirtualMachine", id), None));
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }

    fn log(&self, entry: String) {
        self.lookups.lock().unwrap().push(entry);
    }
}

impl Inventory for FakeInventory {
    fn object_by_id(&self, kind: ObjectKind, id: &str) -> Result<InventoryObject> {
        self.log(format!("id:{}", id));
        self.objects
            .iter()
            .find(|(reference, _)| reference.value == id)
            .map(|(reference, name)| {
                InventoryObject::from_reference(reference.clone(), Some(name.clone()))
            })
            .ok_or_else(|| Error::ObjectNotFound {
                kind,
                id: id.to_string(),
            })
    }

    fn object_by_path(&self, path: &str) -> Result<InventoryObject> {
        self.log(format!("path:{}", path));
        self.paths
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, reference)| InventoryObject::from_reference(reference.clone(), None))
            .ok_or_else(|| Error::api(format!("no object at inventory path '{}'", path)))
    }

    fn vm_folder(&self, datacenter: &Datacenter) -> Result<Folder> {
        let id = &datacenter.reference().value;
        self.log(format!("vm-folder:{}", id));
        self.vm_folders
            .iter()
            .find(|(dc, _)| dc == id)
            .map(|(_, reference)| Folder::new(reference.clone()))
            .ok_or_else(|| Error::api(format!("{} has no vmFolder", id)))
    }

    fn networks_named(&self, _datacenter: &Datacenter, name: &str) -> Result<Vec<Network>> {
        self.log(format!("network:{}", name));
        Ok(self
            .networks
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(n, reference)| Network::new(reference.clone()).with_name(n.clone()))
            .collect())
    }

    fn platform_version(&self) -> Result<String> {
        Ok(self.version.clone())
    }

    fn find_vm_by_uuid(&self, uuid: &str) -> Result<Option<ManagedObjectReference>> {
        self.log(format!("search-index:{}", uuid));
        Ok(self
            .search_index
            .iter()
            .find(|(u, _)| u == uuid)
            .map(|(_, reference)| reference.clone()))
    }

    fn virtual_machine_uuids(&self) -> Result<Vec<(ManagedObjectReference, Option<String>)>> {
        self.log("container-view".to_string());
        Ok(self.vm_uuids.clone())
    }
}
