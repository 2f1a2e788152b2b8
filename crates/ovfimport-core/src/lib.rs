//! ovfimport Core Library
//!
//! This crate provides the core functionality for provisioning vSphere
//! templates from OVF/OVA packages.
//!
//! # Overview
//!
//! An import reads the package descriptor, maps its networks onto the target
//! datacenter, negotiates an import spec, opens a transfer lease and streams
//! every payload over it. The main entry point is
//! [`Importer::import_template`].
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`ovf`] - OVF descriptor parsing
//! - [`package`] - OVF directory and OVA archive access
//! - [`manifest`] - Manifest parsing and digest verification
//! - [`disk`] - streamOptimized VMDK header checks
//! - [`inventory`] - Typed inventory handles and lookups
//! - [`search`] - Virtual machine lookup by UUID
//! - [`network`] - Network mapping resolution
//! - [`api`] - Management API trait and transfer types
//! - [`negotiate`] - Import spec negotiation
//! - [`lease`] - Lease lifecycle and keepalive
//! - [`upload`] - Payload upload engine
//! - [`cancel`] - Cancellation and deadlines
//! - [`import`] - Import orchestrator coordinating the full pipeline
//! - [`vsphere`] - vim25 SOAP client
//!
//! # Quick Start
//!
//! ```no_run
//! use ovfimport_core::{resolve_placement, CancelToken, ConnectionConfig, ImportRequest, Importer, VsphereClient};
//!
//! let client = VsphereClient::connect(ConnectionConfig::new("vcenter", "admin", "secret")).unwrap();
//! let placement = resolve_placement(&client, "resgroup-8", "datastore-11", "dc1", "/dc1/vm").unwrap();
//! let request = ImportRequest::new("/images/appliance.ovf", placement);
//!
//! Importer::new(&client, &client)
//!     .import_template(&request, &CancelToken::new())
//!     .unwrap();
//! ```

pub mod api;
pub mod cancel;
pub mod disk;
pub mod error;
pub mod import;
pub mod inventory;
pub mod lease;
pub mod manifest;
pub mod negotiate;
pub mod network;
pub mod ovf;
pub mod package;
pub mod search;
pub mod upload;
pub mod vsphere;

pub use error::{Error, Result};

// Re-export main import functionality for convenience
pub use cancel::CancelToken;
pub use import::{
    ImportError, ImportOptions, ImportOutcome, ImportPhase, ImportProgress, ImportRequest,
    Importer, ProgressCallback, DEFAULT_LEASE_READY_TIMEOUT,
};
pub use inventory::{resolve_placement, Inventory, Placement};
pub use search::{virtual_machine_from_uuid, PlatformVersion};
pub use vsphere::{ConnectionConfig, VsphereClient};
