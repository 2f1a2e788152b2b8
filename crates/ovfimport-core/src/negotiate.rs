//! Import spec negotiation.

use tracing::{debug, warn};

use crate::api::{ImportSpec, ImportSpecParams, ManagementApi};
use crate::error::{Error, Result};
use crate::inventory::{Datastore, ResourcePool};
use crate::network::NetworkMap;
use crate::ovf::Envelope;

/// Obtains a validated import spec from the platform.
pub struct SpecNegotiator<'a> {
    api: &'a dyn ManagementApi,
}

impl<'a> SpecNegotiator<'a> {
    pub fn new(api: &'a dyn ManagementApi) -> Self {
        Self { api }
    }

    /// Negotiate an import spec for `descriptor`.
    ///
    /// The network map must cover every network declared in `envelope`; this
    /// is checked before the remote call. Warnings returned by the platform
    /// are logged; errors reject the spec. Nothing is retried.
    ///
    /// # Errors
    ///
    /// * [`Error::NetworkNotFound`] if a declared network is unmapped.
    /// * [`Error::SpecRejected`] if the platform reports validation errors.
    /// * Any error from the remote call.
    pub fn negotiate(
        &self,
        descriptor: &str,
        envelope: &Envelope,
        pool: &ResourcePool,
        datastore: &Datastore,
        networks: &NetworkMap,
        entity_name: Option<&str>,
    ) -> Result<ImportSpec> {
        networks.ensure_covers(envelope)?;

        let params = ImportSpecParams {
            entity_name,
            network_mapping: networks,
        };
        debug!(pool = %pool, datastore = %datastore, "creating import spec");
        let spec = self
            .api
            .create_import_spec(descriptor, pool, datastore, &params)?;

        for warning in &spec.warnings {
            warn!(warning = %warning, "import spec warning");
        }
        if !spec.errors.is_empty() {
            return Err(Error::SpecRejected {
                errors: spec.errors,
            });
        }

        debug!(items = spec.file_items.len(), "import spec accepted");
        Ok(spec)
    }
}
