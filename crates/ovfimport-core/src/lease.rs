//! Transfer lease lifecycle.
//!
//! A [`Lease`] is opened from a negotiated import spec, polled until the
//! platform reports it ready, kept alive by a [`Keepalive`] thread while
//! payloads upload, and finalized exactly once. Dropping a lease that was
//! never finalized aborts it on the platform.
//!
//! Local phases follow
//! `Opening -> Ready -> Uploading -> Completing -> Completed`, and any
//! non-terminal phase may move to `Aborted`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{FileItem, ImportSpec, LeaseInfo, LeaseState, ManagementApi};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::inventory::{Folder, ManagedObjectReference, ResourcePool};

/// Default interval between lease status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default interval between keepalive progress reports.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Local view of the lease lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePhase {
    Opening,
    Ready,
    Uploading,
    Completing,
    Completed,
    Aborted,
}

impl LeasePhase {
    /// True for `Completed` and `Aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeasePhase::Completed | LeasePhase::Aborted)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: LeasePhase) -> bool {
        use LeasePhase::*;
        match (self, next) {
            (Opening, Ready) | (Ready, Uploading) | (Uploading, Completing) => true,
            (Completing, Completed) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for LeasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeasePhase::Opening => "opening",
            LeasePhase::Ready => "ready",
            LeasePhase::Uploading => "uploading",
            LeasePhase::Completing => "completing",
            LeasePhase::Completed => "completed",
            LeasePhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// How a lease is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// Every upload succeeded.
    Success,
    /// The import failed; the reason is sent with the abort.
    Failure(String),
}

/// One upload in a transfer plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    /// Position in the import spec's file items.
    pub index: usize,
    /// Payload path relative to the descriptor.
    pub path: String,
    pub device_id: String,
    pub url: Url,
    pub declared_size: Option<u64>,
    pub create: bool,
}

/// Uploads to perform, in import spec order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    pub items: Vec<TransferItem>,
    /// The entity the lease is importing, when reported.
    pub entity: Option<ManagedObjectReference>,
}

impl TransferPlan {
    /// Sum of declared sizes.
    pub fn declared_bytes(&self) -> u64 {
        self.items.iter().filter_map(|item| item.declared_size).sum()
    }
}

/// Build the plan by pairing each file item with its device URL.
fn build_plan(file_items: &[FileItem], info: LeaseInfo) -> Result<TransferPlan> {
    let mut items = Vec::with_capacity(file_items.len());

    for (index, file_item) in file_items.iter().enumerate() {
        let device = info
            .device_urls
            .iter()
            .find(|device| device.import_key == file_item.device_id)
            .ok_or_else(|| {
                Error::lease(format!(
                    "no device URL for '{}' (device key {})",
                    file_item.path, file_item.device_id
                ))
            })?;

        items.push(TransferItem {
            index,
            path: file_item.path.clone(),
            device_id: file_item.device_id.clone(),
            url: device.url.clone(),
            declared_size: file_item.size,
            create: file_item.create,
        });
    }

    Ok(TransferPlan {
        items,
        entity: info.entity,
    })
}

/// Bytes moved so far against the total expected.
#[derive(Debug, Default)]
pub struct TransferCounter {
    transferred: AtomicU64,
    total: u64,
}

impl TransferCounter {
    pub fn new(total: u64) -> Self {
        Self {
            transferred: AtomicU64::new(0),
            total,
        }
    }

    pub fn add(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Progress as a whole percentage, capped at 100.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let percent = (self.transferred() as u128 * 100) / self.total as u128;
        percent.min(100) as u8
    }
}

/// Opens leases against the management API.
pub struct LeaseManager<'a> {
    api: &'a dyn ManagementApi,
    poll_interval: Duration,
    keepalive_interval: Duration,
}

impl<'a> LeaseManager<'a> {
    pub fn new(api: &'a dyn ManagementApi) -> Self {
        Self {
            api,
            poll_interval: DEFAULT_POLL_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Open a lease for `spec`, importing into `pool` and `folder`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseOpenFailed`] if the platform refuses the lease.
    pub fn open(&self, spec: &ImportSpec, pool: &ResourcePool, folder: &Folder) -> Result<Lease<'a>> {
        let reference = self.api.import_vapp(pool, spec, folder).map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            other => Error::LeaseOpenFailed {
                message: other.to_string(),
            },
        })?;
        info!(lease = %reference, "lease opened");

        Ok(Lease {
            api: self.api,
            reference,
            phase: LeasePhase::Opening,
            file_items: spec.file_items.clone(),
            poll_interval: self.poll_interval,
            keepalive_interval: self.keepalive_interval,
        })
    }
}

/// An open transfer lease.
pub struct Lease<'a> {
    api: &'a dyn ManagementApi,
    reference: ManagedObjectReference,
    phase: LeasePhase,
    file_items: Vec<FileItem>,
    poll_interval: Duration,
    keepalive_interval: Duration,
}

impl fmt::Debug for Lease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("reference", &self.reference)
            .field("phase", &self.phase)
            .finish()
    }
}

impl<'a> Lease<'a> {
    pub fn reference(&self) -> &ManagedObjectReference {
        &self.reference
    }

    pub fn phase(&self) -> LeasePhase {
        self.phase
    }

    fn transition(&mut self, next: LeasePhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::lease(format!(
                "invalid lease transition {} -> {}",
                self.phase, next
            )));
        }
        debug!(lease = %self.reference, from = %self.phase, to = %next, "lease phase");
        self.phase = next;
        Ok(())
    }

    /// Poll until the lease is ready and return the transfer plan.
    ///
    /// # Errors
    ///
    /// * [`Error::LeaseTimeout`] if the lease is not ready within `timeout`.
    /// * [`Error::LeaseError`] if the lease enters the error state or a file
    ///   item has no device URL.
    /// * [`Error::Cancelled`] if `cancel` fires while waiting.
    pub fn await_ready(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<TransferPlan> {
        let started = Instant::now();

        loop {
            cancel.check()?;
            let status = self.api.lease_status(&self.reference)?;

            match status.state {
                LeaseState::Ready => {
                    let info = status
                        .info
                        .ok_or_else(|| Error::lease("ready lease reported no transfer info"))?;
                    let plan = build_plan(&self.file_items, info)?;
                    self.transition(LeasePhase::Ready)?;
                    info!(lease = %self.reference, items = plan.items.len(), "lease ready");
                    return Ok(plan);
                }
                LeaseState::Error => {
                    let message = status
                        .error
                        .unwrap_or_else(|| "lease entered the error state".to_string());
                    return Err(Error::lease(message));
                }
                LeaseState::Done => {
                    return Err(Error::lease("lease finished before any upload started"));
                }
                LeaseState::Initializing => {}
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::LeaseTimeout { waited });
            }
            cancel.sleep(self.poll_interval.min(timeout - waited))?;
        }
    }

    /// Move from `Ready` to `Uploading`.
    pub fn begin_upload(&mut self) -> Result<()> {
        self.transition(LeasePhase::Uploading)
    }

    /// Start the keepalive thread inside `scope`.
    ///
    /// An initial progress report is sent before this returns; afterwards the
    /// thread reports `counter`'s percentage every keepalive interval until
    /// the returned guard is stopped or dropped.
    pub fn start_keepalive<'scope>(
        &self,
        scope: &'scope Scope<'scope, '_>,
        counter: Arc<TransferCounter>,
    ) -> Keepalive<'scope>
    where
        'a: 'scope,
    {
        let api = self.api;
        let reference = self.reference.clone();
        let interval = self.keepalive_interval;
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        let handle = scope.spawn(move || {
            report_progress(api, &reference, counter.percent());
            let _ = started_tx.send(());

            let ticker = tick(interval);
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => report_progress(api, &reference, counter.percent()),
                }
            }
            debug!(lease = %reference, "keepalive stopped");
        });

        // A closed channel means the thread died before reporting; the guard
        // still joins it.
        let _ = started_rx.recv();

        Keepalive {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Finalize the lease: complete on success, abort otherwise.
    ///
    /// A lease that never reached `Uploading` is always aborted, and
    /// finalizing it with [`LeaseOutcome::Success`] is reported as an error.
    pub fn finalize(mut self, outcome: LeaseOutcome) -> Result<()> {
        match outcome {
            LeaseOutcome::Success if self.phase == LeasePhase::Uploading => {
                self.transition(LeasePhase::Completing)?;
                match self.api.lease_complete(&self.reference) {
                    Ok(()) => {
                        self.transition(LeasePhase::Completed)?;
                        info!(lease = %self.reference, "lease completed");
                        Ok(())
                    }
                    Err(e) => {
                        self.abort(&format!("completion failed: {}", e));
                        Err(e)
                    }
                }
            }
            LeaseOutcome::Success => {
                let phase = self.phase;
                self.abort("lease finalized before uploads started");
                Err(Error::lease(format!(
                    "cannot complete a lease in the {} phase",
                    phase
                )))
            }
            LeaseOutcome::Failure(reason) => {
                self.abort(&reason);
                Ok(())
            }
        }
    }

    /// Abort on the platform and mark the lease aborted. Best effort.
    fn abort(&mut self, reason: &str) {
        if self.phase.is_terminal() {
            return;
        }
        if let Err(e) = self.api.lease_abort(&self.reference, reason) {
            warn!(lease = %self.reference, error = %e, "failed to abort lease");
        }
        self.phase = LeasePhase::Aborted;
        info!(lease = %self.reference, reason, "lease aborted");
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if !self.phase.is_terminal() {
            self.abort("import abandoned");
        }
    }
}

fn report_progress(api: &dyn ManagementApi, lease: &ManagedObjectReference, percent: u8) {
    if let Err(e) = api.lease_progress(lease, percent) {
        warn!(lease = %lease, error = %e, "keepalive progress report failed");
    }
}

/// Guard for a running keepalive thread. Stopping or dropping it joins the
/// thread.
pub struct Keepalive<'scope> {
    stop: Option<Sender<()>>,
    handle: Option<ScopedJoinHandle<'scope, ()>>,
}

impl Keepalive<'_> {
    /// Stop the keepalive and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the stop channel.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("keepalive thread panicked");
            }
        }
    }
}

impl Drop for Keepalive<'_> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
