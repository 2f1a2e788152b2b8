//! Payload upload engine.
//!
//! Streams each transfer item's local payload to its device URL, in plan
//! order, stopping at the first failure.

use std::io::{self, Read};
use std::sync::Arc;

use tracing::{debug, info};
use url::Url;

use crate::api::{ManagementApi, UploadBody};
use crate::cancel::CancelToken;
use crate::disk::verify_stream_optimized;
use crate::error::{Error, Result};
use crate::lease::{TransferCounter, TransferItem, TransferPlan};
use crate::ovf::Envelope;
use crate::package::Package;

/// A progress sample taken while uploading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTick {
    /// Index of the item being uploaded.
    pub item: usize,
    /// Bytes sent so far across all items.
    pub transferred: u64,
}

/// Receives upload progress. Called from whichever thread reads the payload.
pub type UploadObserver = Arc<dyn Fn(UploadTick) + Send + Sync>;

/// The item that stopped an upload run.
#[derive(Debug)]
pub struct UploadFailure {
    pub index: usize,
    pub path: String,
    pub error: Error,
}

/// Result of an upload run.
#[derive(Debug, Default)]
pub struct UploadReport {
    /// URLs of the items uploaded successfully, in plan order.
    pub urls: Vec<Url>,
    pub failure: Option<UploadFailure>,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Counts bytes as they are read and fails once the import is cancelled.
struct TrackedReader {
    inner: Box<dyn Read + Send>,
    item: usize,
    counter: Arc<TransferCounter>,
    cancel: CancelToken,
    observer: Option<UploadObserver>,
}

impl Read for TrackedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "import cancelled"));
        }
        let n = self.inner.read(buf)?;
        self.counter.add(n as u64);
        if let Some(observer) = &self.observer {
            observer(UploadTick {
                item: self.item,
                transferred: self.counter.transferred(),
            });
        }
        Ok(n)
    }
}

/// Uploads transfer plan items from a package.
pub struct UploadEngine<'a> {
    api: &'a dyn ManagementApi,
    package: &'a Package,
    envelope: &'a Envelope,
    check_disk_format: bool,
    observer: Option<UploadObserver>,
}

impl<'a> UploadEngine<'a> {
    pub fn new(api: &'a dyn ManagementApi, package: &'a Package, envelope: &'a Envelope) -> Self {
        Self {
            api,
            package,
            envelope,
            check_disk_format: true,
            observer: None,
        }
    }

    /// Enable or disable the streamOptimized header check.
    pub fn with_disk_check(mut self, enabled: bool) -> Self {
        self.check_disk_format = enabled;
        self
    }

    pub fn with_observer(mut self, observer: UploadObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Upload every item in `plan`, in order.
    ///
    /// Stops at the first failure. The report holds the URLs uploaded before
    /// the failure and the failing item.
    pub fn upload_all(
        &self,
        plan: &TransferPlan,
        counter: &Arc<TransferCounter>,
        cancel: &CancelToken,
    ) -> UploadReport {
        let mut report = UploadReport::default();

        for item in &plan.items {
            if let Err(error) = self.upload_item(item, counter, cancel) {
                report.failure = Some(UploadFailure {
                    index: item.index,
                    path: item.path.clone(),
                    error,
                });
                break;
            }
            report.urls.push(item.url.clone());
        }

        report
    }

    /// Upload a single item.
    ///
    /// # Errors
    ///
    /// * [`Error::Cancelled`] if `cancel` fires before or during the upload.
    /// * [`Error::LocalFileMissing`] if the payload cannot be opened.
    /// * [`Error::UploadSizeMismatch`] if the payload length differs from its
    ///   declared size.
    /// * [`Error::DiskFormat`] if the payload is declared compressed or a
    ///   streamOptimized disk has a bad header.
    /// * [`Error::UploadFailed`] on transport failure.
    pub fn upload_item(
        &self,
        item: &TransferItem,
        counter: &Arc<TransferCounter>,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;

        let reference = self.envelope.file_for_href(&item.path);
        if let Some(compression) = reference.and_then(|f| f.compression.as_deref()) {
            return Err(Error::DiskFormat {
                path: item.path.clone(),
                message: format!("{} compressed payloads are not supported", compression),
            });
        }

        let payload = self.package.open_payload(&item.path)?;
        let declared = item.declared_size.or_else(|| reference.and_then(|f| f.size));
        if let Some(declared) = declared {
            if payload.len != declared {
                return Err(Error::UploadSizeMismatch {
                    path: item.path.clone(),
                    declared,
                    actual: payload.len,
                });
            }
        }

        let content_length = payload.len;
        let mut reader = payload.into_reader();
        let stream_optimized = self
            .envelope
            .disk_for_href(&item.path)
            .map(|disk| disk.is_stream_optimized())
            .unwrap_or(false);
        if self.check_disk_format && stream_optimized {
            reader = verify_stream_optimized(&item.path, reader)?;
        }

        if let Some(observer) = &self.observer {
            observer(UploadTick {
                item: item.index,
                transferred: counter.transferred(),
            });
        }

        let body = UploadBody {
            reader: Box::new(TrackedReader {
                inner: reader,
                item: item.index,
                counter: Arc::clone(counter),
                cancel: cancel.clone(),
                observer: self.observer.clone(),
            }),
            content_length,
        };

        debug!(item = %item.path, url = %item.url, bytes = content_length, "uploading");
        match self.api.upload(&item.url, item.create, body, cancel) {
            Ok(()) => {
                info!(item = %item.path, bytes = content_length, "uploaded");
                Ok(())
            }
            Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
            Err(e @ (Error::Cancelled | Error::UploadFailed { .. })) => Err(e),
            Err(e) => Err(Error::upload(&item.path, e.to_string())),
        }
    }
}
