//! Import orchestrator for OVF/OVA to template provisioning.
//!
//! This module sequences the full import pipeline:
//! 1. Open the package and parse the descriptor (verifying the manifest)
//! 2. Resolve every declared network in the target datacenter
//! 3. Negotiate an import spec with the platform
//! 4. Open a lease and wait for it to become ready
//! 5. Upload each payload while a keepalive reports progress
//! 6. Finalize the lease and optionally mark the result as a template
//!
//! # Example
//!
//! ```no_run
//! use ovfimport_core::cancel::CancelToken;
//! use ovfimport_core::import::{ImportOptions, ImportRequest, Importer};
//! use ovfimport_core::inventory::resolve_placement;
//! use ovfimport_core::vsphere::{ConnectionConfig, VsphereClient};
//!
//! let config = ConnectionConfig::new("https://vcenter.example.com", "admin", "secret");
//! let client = VsphereClient::connect(config).unwrap();
//! let placement = resolve_placement(&client, "resgroup-8", "datastore-11", "dc1", "/dc1/vm").unwrap();
//!
//! let request = ImportRequest::new("/images/appliance.ova", placement);
//! let importer = Importer::new(&client, &client).with_options(ImportOptions::default());
//! let outcome = importer.import_template(&request, &CancelToken::new()).unwrap();
//! println!("uploaded {} files", outcome.urls.len());
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::api::ManagementApi;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::inventory::{Inventory, InventoryObject, ManagedObjectReference, Placement};
use crate::lease::{
    LeaseManager, LeaseOutcome, TransferCounter, DEFAULT_KEEPALIVE_INTERVAL,
    DEFAULT_POLL_INTERVAL,
};
use crate::network::{NetworkOverrides, NetworkResolver};
use crate::negotiate::SpecNegotiator;
use crate::ovf::parse_envelope;
use crate::package::Package;
use crate::upload::{UploadEngine, UploadObserver, UploadTick};

/// Default time to wait for a lease to become ready (5 minutes).
pub const DEFAULT_LEASE_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Options for the import process.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// How long to wait for the lease to become ready.
    pub lease_ready_timeout: Duration,
    /// Interval between lease status polls.
    pub lease_poll_interval: Duration,
    /// Interval between keepalive progress reports.
    pub keepalive_interval: Duration,
    /// Verify payload digests against the package manifest.
    pub verify_manifest: bool,
    /// Check streamOptimized disk headers before upload.
    pub check_disk_format: bool,
    /// Mark the imported virtual machine as a template.
    pub mark_as_template: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            lease_ready_timeout: DEFAULT_LEASE_READY_TIMEOUT,
            lease_poll_interval: DEFAULT_POLL_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            verify_manifest: true,
            check_disk_format: true,
            mark_as_template: true,
        }
    }
}

impl ImportOptions {
    /// Create import options with the given lease timings.
    pub fn new(
        lease_ready_timeout: Duration,
        lease_poll_interval: Duration,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            lease_ready_timeout,
            lease_poll_interval,
            keepalive_interval,
            ..Self::default()
        }
    }

    /// Create options that skip local payload checks.
    pub fn unchecked() -> Self {
        Self {
            verify_manifest: false,
            check_disk_format: false,
            ..Self::default()
        }
    }

    /// Create options that leave the import as a virtual machine.
    pub fn virtual_machine() -> Self {
        Self {
            mark_as_template: false,
            ..Self::default()
        }
    }
}

/// Phase of the import process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    /// Opening the package and parsing the descriptor.
    Parsing,
    /// Mapping declared networks to inventory networks.
    ResolvingNetworks,
    /// Negotiating the import spec.
    Negotiating,
    /// Waiting for the lease to become ready.
    WaitingForLease,
    /// Uploading payloads.
    Uploading,
    /// Finalizing the lease.
    Completing,
    /// Import complete.
    Complete,
}

impl std::fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportPhase::Parsing => write!(f, "Parsing"),
            ImportPhase::ResolvingNetworks => write!(f, "Resolving networks"),
            ImportPhase::Negotiating => write!(f, "Negotiating"),
            ImportPhase::WaitingForLease => write!(f, "Waiting for lease"),
            ImportPhase::Uploading => write!(f, "Uploading"),
            ImportPhase::Completing => write!(f, "Completing"),
            ImportPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Progress information for the import.
#[derive(Debug, Clone)]
pub struct ImportProgress {
    /// Current phase of the import.
    pub phase: ImportPhase,
    /// Bytes uploaded so far.
    pub bytes_processed: u64,
    /// Total bytes to upload.
    pub bytes_total: u64,
    /// Current item being uploaded (1-indexed).
    pub current_item: usize,
    /// Total number of items.
    pub total_items: usize,
}

impl ImportProgress {
    /// Create new progress information.
    pub fn new(phase: ImportPhase, total_bytes: u64, total_items: usize) -> Self {
        Self {
            phase,
            bytes_processed: 0,
            bytes_total: total_bytes,
            current_item: 0,
            total_items,
        }
    }

    /// Calculate overall percentage complete.
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            return match self.phase {
                ImportPhase::Complete => 100.0,
                _ => 0.0,
            };
        }
        (self.bytes_processed as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Type alias for the progress callback function. Upload progress is
/// reported from the thread that reads the payload, so the callback must be
/// shareable.
pub type ProgressCallback = Arc<dyn Fn(ImportProgress) + Send + Sync>;

/// What to import and where.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    /// Path to a `.ovf` descriptor or `.ova` archive.
    pub descriptor_path: PathBuf,
    /// Name for the imported entity; the descriptor's name when `None`.
    pub entity_name: Option<String>,
    pub placement: Placement,
    pub network_overrides: NetworkOverrides,
}

impl ImportRequest {
    pub fn new(descriptor_path: impl Into<PathBuf>, placement: Placement) -> Self {
        Self {
            descriptor_path: descriptor_path.into(),
            entity_name: None,
            placement,
            network_overrides: NetworkOverrides::new(),
        }
    }

    pub fn with_entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    /// Map the declared network `from` to the inventory network `to`.
    pub fn with_network_override(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.network_overrides.insert(from.into(), to.into());
        self
    }
}

/// A successful import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Device URLs of the uploaded items, in import spec order.
    pub urls: Vec<Url>,
    /// The imported entity, when the lease reported one.
    pub entity: Option<ManagedObjectReference>,
}

/// A failed import, with whatever was uploaded before the failure.
#[derive(Debug, thiserror::Error)]
#[error("import failed{}", in_flight.as_ref().map(|p| format!(" while uploading '{}'", p)).unwrap_or_default())]
pub struct ImportError {
    #[source]
    pub error: Error,
    /// URLs of items uploaded before the failure.
    pub partial_urls: Vec<Url>,
    /// The item being uploaded when the import failed.
    pub in_flight: Option<String>,
}

impl From<Error> for ImportError {
    fn from(error: Error) -> Self {
        Self {
            error,
            partial_urls: Vec::new(),
            in_flight: None,
        }
    }
}

/// Runs imports against a management API and inventory.
pub struct Importer<'a> {
    api: &'a dyn ManagementApi,
    inventory: &'a dyn Inventory,
    options: ImportOptions,
    progress: Option<ProgressCallback>,
}

impl<'a> Importer<'a> {
    pub fn new(api: &'a dyn ManagementApi, inventory: &'a dyn Inventory) -> Self {
        Self {
            api,
            inventory,
            options: ImportOptions::default(),
            progress: None,
        }
    }

    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    fn report(&self, progress: ImportProgress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }

    /// Import a package as a template.
    ///
    /// # Arguments
    ///
    /// * `request` - The package path, placement and network overrides.
    /// * `cancel` - Cancellation and deadline for the whole import.
    ///
    /// # Returns
    ///
    /// The uploaded item URLs in import spec order, plus the imported entity.
    ///
    /// # Errors
    ///
    /// Returns an [`ImportError`] wrapping the first failure. Once a lease is
    /// open, every failure aborts it; the error carries the URLs uploaded so
    /// far and the item in flight.
    pub fn import_template(
        &self,
        request: &ImportRequest,
        cancel: &CancelToken,
    ) -> std::result::Result<ImportOutcome, ImportError> {
        let placement = &request.placement;

        // Phase 1: Parsing
        self.report(ImportProgress::new(ImportPhase::Parsing, 0, 0));
        let package = Package::open(&request.descriptor_path)?;
        let envelope = parse_envelope(package.descriptor())?;
        let descriptor = package.descriptor_text()?;
        info!(
            descriptor = %request.descriptor_path.display(),
            networks = envelope.networks.len(),
            files = envelope.references.len(),
            "descriptor parsed"
        );
        self.verify_package(&package)?;
        cancel.check()?;

        // Phase 2: Networks
        self.report(ImportProgress::new(ImportPhase::ResolvingNetworks, 0, 0));
        let networks = NetworkResolver::new(self.inventory).resolve(
            &envelope,
            &placement.datacenter,
            &request.network_overrides,
        )?;
        cancel.check()?;

        // Phase 3: Negotiation
        self.report(ImportProgress::new(ImportPhase::Negotiating, 0, 0));
        let spec = SpecNegotiator::new(self.api).negotiate(
            descriptor,
            &envelope,
            &placement.resource_pool,
            &placement.datastore,
            &networks,
            request.entity_name.as_deref(),
        )?;
        cancel.check()?;

        // Phase 4: Lease
        let total_items = spec.file_items.len();
        self.report(ImportProgress::new(ImportPhase::WaitingForLease, 0, total_items));
        let manager = LeaseManager::new(self.api)
            .with_poll_interval(self.options.lease_poll_interval)
            .with_keepalive_interval(self.options.keepalive_interval);
        let mut lease = manager.open(&spec, &placement.resource_pool, &placement.folder)?;

        let plan = match lease.await_ready(self.options.lease_ready_timeout, cancel) {
            Ok(plan) => plan,
            Err(error) => {
                finalize_after_failure(lease, &error);
                return Err(error.into());
            }
        };
        if let Err(error) = lease.begin_upload() {
            finalize_after_failure(lease, &error);
            return Err(error.into());
        }

        // Phase 5: Upload
        let bytes_total = match plan.declared_bytes() {
            0 => envelope.total_declared_size(),
            declared => declared,
        };
        let counter = Arc::new(TransferCounter::new(bytes_total));
        self.report(ImportProgress::new(ImportPhase::Uploading, bytes_total, total_items));

        let mut engine = UploadEngine::new(self.api, &package, &envelope)
            .with_disk_check(self.options.check_disk_format);
        if let Some(observer) = self.upload_observer(bytes_total, total_items) {
            engine = engine.with_observer(observer);
        }

        let report = thread::scope(|scope| {
            let keepalive = lease.start_keepalive(scope, Arc::clone(&counter));
            let report = engine.upload_all(&plan, &counter, cancel);
            keepalive.stop();
            report
        });

        if let Some(failure) = report.failure {
            warn!(
                item = %failure.path,
                index = failure.index,
                error = %failure.error,
                "upload failed"
            );
            finalize_after_failure(lease, &failure.error);
            return Err(ImportError {
                error: failure.error,
                partial_urls: report.urls,
                in_flight: Some(failure.path),
            });
        }

        // Phase 6: Completion
        self.report(ImportProgress {
            phase: ImportPhase::Completing,
            bytes_processed: counter.transferred(),
            bytes_total,
            current_item: total_items,
            total_items,
        });
        if let Err(error) = lease.finalize(LeaseOutcome::Success) {
            return Err(ImportError {
                error,
                partial_urls: report.urls,
                in_flight: None,
            });
        }

        if self.options.mark_as_template {
            if let Err(error) = self.mark_as_template(plan.entity.as_ref()) {
                return Err(ImportError {
                    error,
                    partial_urls: report.urls,
                    in_flight: None,
                });
            }
        }

        self.report(ImportProgress {
            phase: ImportPhase::Complete,
            bytes_processed: counter.transferred(),
            bytes_total,
            current_item: total_items,
            total_items,
        });
        info!(items = report.urls.len(), "import complete");

        Ok(ImportOutcome {
            urls: report.urls,
            entity: plan.entity,
        })
    }

    fn verify_package(&self, package: &Package) -> Result<()> {
        if !self.options.verify_manifest {
            return Ok(());
        }
        match package.manifest() {
            Some(manifest) => {
                let report = manifest.verify(package)?;
                info!(verified = report.verified, skipped = report.skipped, "manifest verified");
                Ok(())
            }
            None => {
                debug!("package has no manifest");
                Ok(())
            }
        }
    }

    fn upload_observer(&self, bytes_total: u64, total_items: usize) -> Option<UploadObserver> {
        let callback = Arc::clone(self.progress.as_ref()?);
        Some(Arc::new(move |tick: UploadTick| {
            callback(ImportProgress {
                phase: ImportPhase::Uploading,
                bytes_processed: tick.transferred,
                bytes_total,
                current_item: tick.item + 1,
                total_items,
            })
        }))
    }

    fn mark_as_template(&self, entity: Option<&ManagedObjectReference>) -> Result<()> {
        let Some(entity) = entity else {
            warn!("lease reported no entity; not marking as template");
            return Ok(());
        };
        match InventoryObject::from_reference(entity.clone(), None) {
            InventoryObject::VirtualMachine(vm) => {
                self.api.mark_as_template(&vm)?;
                info!(vm = %vm, "marked as template");
                Ok(())
            }
            other => {
                debug!(entity = %other.reference(), "entity is not a virtual machine; not marking as template");
                Ok(())
            }
        }
    }
}

fn finalize_after_failure(lease: crate::lease::Lease<'_>, error: &Error) {
    if let Err(e) = lease.finalize(LeaseOutcome::Failure(error.to_string())) {
        warn!(error = %e, "failed to finalize lease");
    }
}
