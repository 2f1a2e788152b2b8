//! Network mapping resolution.
//!
//! Every network declared in the envelope is mapped to exactly one network in
//! the target datacenter. Names resolve to themselves unless the caller
//! supplies an override.

use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::inventory::{Datacenter, Inventory, Network};
use crate::ovf::Envelope;

/// Caller-supplied renames: declared network name to inventory network name.
pub type NetworkOverrides = BTreeMap<String, String>;

/// One resolved mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMapping {
    /// Name as declared in the descriptor.
    pub name: String,
    /// Network the name resolved to.
    pub network: Network,
}

/// Declared network names mapped to inventory networks, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkMap {
    entries: Vec<NetworkMapping>,
}

impl NetworkMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapping, replacing an existing one for the same name.
    pub fn insert(&mut self, name: impl Into<String>, network: Network) {
        let name = name.into();
        match self.entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => entry.network = network,
            None => self.entries.push(NetworkMapping { name, network }),
        }
    }

    /// Look up the network for a declared name.
    pub fn get(&self, name: &str) -> Option<&Network> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.network)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkMapping> {
        self.entries.iter()
    }

    /// Check that every network declared in `envelope` is mapped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NetworkNotFound`] for the first unmapped name in
    /// declaration order.
    pub fn ensure_covers(&self, envelope: &Envelope) -> Result<()> {
        match envelope.network_names().find(|name| self.get(name).is_none()) {
            Some(name) => Err(Error::NetworkNotFound {
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Resolves declared networks against an inventory.
pub struct NetworkResolver<'a> {
    inventory: &'a dyn Inventory,
}

impl<'a> NetworkResolver<'a> {
    pub fn new(inventory: &'a dyn Inventory) -> Self {
        Self { inventory }
    }

    /// Resolve every declared network in `datacenter`.
    ///
    /// Lookups run in parallel; the first failure in declaration order is
    /// returned.
    ///
    /// # Errors
    ///
    /// * [`Error::NetworkNotFound`] if a name matches no network.
    /// * [`Error::AmbiguousNetwork`] if a name matches more than one.
    /// * Any inventory error from the lookup itself.
    pub fn resolve(
        &self,
        envelope: &Envelope,
        datacenter: &Datacenter,
        overrides: &NetworkOverrides,
    ) -> Result<NetworkMap> {
        let mut declared: Vec<&str> = Vec::new();
        for name in envelope.network_names() {
            if !declared.contains(&name) {
                declared.push(name);
            }
        }

        for unused in overrides.keys().filter(|key| !declared.contains(&key.as_str())) {
            warn!(network = %unused, "ignoring override for undeclared network");
        }

        let results: Vec<Result<Network>> = declared
            .par_iter()
            .map(|name| {
                let target = overrides.get(*name).map(String::as_str).unwrap_or(*name);
                self.resolve_one(datacenter, name, target)
            })
            .collect();

        let mut map = NetworkMap::new();
        for (name, result) in declared.iter().zip(results) {
            map.insert(*name, result?);
        }
        Ok(map)
    }

    fn resolve_one(&self, datacenter: &Datacenter, declared: &str, target: &str) -> Result<Network> {
        let mut matches = self.inventory.networks_named(datacenter, target)?;
        match matches.len() {
            0 => Err(Error::NetworkNotFound {
                name: declared.to_string(),
            }),
            1 => {
                let network = matches.remove(0);
                debug!(declared, target, network = %network, "network resolved");
                Ok(network)
            }
            count => Err(Error::AmbiguousNetwork {
                name: declared.to_string(),
                count,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ManagedObjectReference;

    fn network(id: &str, name: &str) -> Network {
        Network::new(ManagedObjectReference::new("Network", id)).with_name(name)
    }

    #[test]
    fn test_insert_replaces() {
        let mut map = NetworkMap::new();
        map.insert("VM Network", network("network-1", "VM Network"));
        map.insert("VM Network", network("network-2", "VM Network"));
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get("VM Network").map(|n| n.reference().value.as_str()),
            Some("network-2")
        );
    }

    #[test]
    fn test_empty_map() {
        let map = NetworkMap::new();
        assert!(map.is_empty());
        assert!(map.get("anything").is_none());
    }
}
