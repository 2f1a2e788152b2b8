//! Management API surface used by the import pipeline.
//!
//! [`ManagementApi`] covers the remote calls needed to negotiate an import
//! spec, drive a transfer lease and push payload bytes. The SOAP client in
//! [`crate::vsphere`] is the production implementation; tests use fakes.

use std::fmt;
use std::io::Read;

use url::Url;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::inventory::{Datastore, Folder, ManagedObjectReference, ResourcePool, VirtualMachine};
use crate::network::NetworkMap;

/// Parameters for an import spec request.
#[derive(Debug, Clone)]
pub struct ImportSpecParams<'a> {
    /// Name for the imported entity; the descriptor's name when `None`.
    pub entity_name: Option<&'a str>,
    /// Declared network name to inventory network.
    pub network_mapping: &'a NetworkMap,
}

/// One file the platform expects to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileItem {
    /// Device key matched against the lease's device URLs.
    pub device_id: String,
    /// Payload path relative to the descriptor.
    pub path: String,
    /// Declared size in bytes, when the descriptor states one.
    pub size: Option<u64>,
    /// True if the upload creates the file (PUT) rather than appending (POST).
    pub create: bool,
}

/// A negotiated import spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSpec {
    /// Opaque platform representation, passed back when opening the lease.
    pub handle: String,
    pub file_items: Vec<FileItem>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Remote lease state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Initializing,
    Ready,
    Done,
    Error,
}

impl LeaseState {
    /// Parse the platform's state name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "initializing" => Some(LeaseState::Initializing),
            "ready" => Some(LeaseState::Ready),
            "done" => Some(LeaseState::Done),
            "error" => Some(LeaseState::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseState::Initializing => write!(f, "initializing"),
            LeaseState::Ready => write!(f, "ready"),
            LeaseState::Done => write!(f, "done"),
            LeaseState::Error => write!(f, "error"),
        }
    }
}

/// Upload endpoint for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUrl {
    pub import_key: String,
    pub url: Url,
    pub ssl_thumbprint: Option<String>,
}

/// Lease details available once the lease is ready.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseInfo {
    /// The entity being imported.
    pub entity: Option<ManagedObjectReference>,
    pub device_urls: Vec<DeviceUrl>,
}

/// A lease status poll result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatus {
    pub state: LeaseState,
    /// Platform error message in the error state.
    pub error: Option<String>,
    /// Present once the lease is ready.
    pub info: Option<LeaseInfo>,
}

/// Payload body for one upload.
pub struct UploadBody {
    pub reader: Box<dyn Read + Send + 'static>,
    pub content_length: u64,
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadBody")
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Remote management operations.
pub trait ManagementApi: Send + Sync {
    /// Validate a descriptor against a pool and datastore.
    fn create_import_spec(
        &self,
        descriptor: &str,
        pool: &ResourcePool,
        datastore: &Datastore,
        params: &ImportSpecParams<'_>,
    ) -> Result<ImportSpec>;

    /// Open a transfer lease for an import spec.
    fn import_vapp(
        &self,
        pool: &ResourcePool,
        spec: &ImportSpec,
        folder: &Folder,
    ) -> Result<ManagedObjectReference>;

    /// Poll a lease.
    fn lease_status(&self, lease: &ManagedObjectReference) -> Result<LeaseStatus>;

    /// Report progress (0..=100) and keep the lease alive.
    fn lease_progress(&self, lease: &ManagedObjectReference, percent: u8) -> Result<()>;

    /// Mark the lease successful.
    fn lease_complete(&self, lease: &ManagedObjectReference) -> Result<()>;

    /// Abort the lease.
    fn lease_abort(&self, lease: &ManagedObjectReference, reason: &str) -> Result<()>;

    /// Stream one payload to a device URL.
    ///
    /// Must return [`crate::Error::Cancelled`] rather than block past the
    /// token's deadline, including while waiting for the response.
    fn upload(
        &self,
        url: &Url,
        create: bool,
        body: UploadBody,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Convert an imported virtual machine into a template.
    fn mark_as_template(&self, vm: &VirtualMachine) -> Result<()>;
}
