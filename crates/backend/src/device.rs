//! Device and handle entries
//!
//! The device table owns every device resource the bridge has seen, keyed
//! by client [`DeviceId`] and indexed by the host's [`ResourceId`] so that
//! repeated listings and hotplug arrivals of the same physical attachment
//! share one entry.

use crate::error::{BackendError, Result};
use crate::registry::{DeviceId, Registry};
use host::{DeviceInfo, HostDevice, ResourceId};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Highest interface number (exclusive) a handle may claim
pub const MAX_INTERFACES: u8 = 32;

/// One discovered device
pub struct DeviceEntry<D> {
    pub resource: D,
    pub resource_id: ResourceId,
    pub info: DeviceInfo,
    /// Client references, including one per open handle
    pub refs: usize,
    pub disconnected: bool,
}

/// One open session on a device
pub struct HandleEntry<Hd> {
    pub resource: Hd,
    pub device: DeviceId,
    pub claimed: BTreeSet<u8>,
    /// Last configuration value read from or written to the device
    pub configuration: Option<u8>,
}

impl<Hd> HandleEntry<Hd> {
    pub fn new(resource: Hd, device: DeviceId) -> Self {
        Self {
            resource,
            device,
            claimed: BTreeSet::new(),
            configuration: None,
        }
    }

    pub fn is_claimed(&self, interface: u8) -> bool {
        self.claimed.contains(&interface)
    }
}

/// Check an interface number against the claim bitmap width
pub fn check_interface(interface: u8) -> Result<()> {
    if interface >= MAX_INTERFACES {
        return Err(BackendError::invalid_argument(format!(
            "interface number {} out of range (must be < {})",
            interface, MAX_INTERFACES
        )));
    }
    Ok(())
}

/// Device registry plus the identity index
pub struct DeviceTable<D> {
    entries: Registry<DeviceId, DeviceEntry<D>>,
    by_resource: HashMap<ResourceId, DeviceId>,
}

impl<D> Default for DeviceTable<D> {
    fn default() -> Self {
        Self {
            entries: Registry::new(),
            by_resource: HashMap::new(),
        }
    }
}

impl<D> DeviceTable<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listed or arrived device, reusing the entry of a known
    /// attachment
    pub fn observe(&mut self, device: HostDevice<D>) -> DeviceId {
        if let Some(id) = self.by_resource.get(&device.id) {
            return *id;
        }

        let resource_id = device.id;
        let id = self.entries.register(DeviceEntry {
            resource: device.device,
            resource_id,
            info: device.info,
            refs: 0,
            disconnected: false,
        });
        self.by_resource.insert(resource_id, id);
        debug!("Registered device {:?} for host resource {:?}", id, resource_id);
        id
    }

    /// Apply a removal; returns the affected device and its last snapshot
    ///
    /// Removals of attachments never observed return `None`.
    pub fn depart(&mut self, resource_id: ResourceId) -> Option<(DeviceId, DeviceInfo)> {
        let id = self.by_resource.remove(&resource_id)?;
        let info = self.disconnect(id)?;
        Some((id, info))
    }

    /// Mark every indexed device absent from `present` as disconnected
    pub fn retain_present(&mut self, present: &HashSet<ResourceId>) -> Vec<DeviceId> {
        let missing: Vec<(ResourceId, DeviceId)> = self
            .by_resource
            .iter()
            .filter(|(resource_id, _)| !present.contains(resource_id))
            .map(|(resource_id, id)| (*resource_id, *id))
            .collect();

        missing
            .into_iter()
            .filter_map(|(resource_id, id)| {
                self.by_resource.remove(&resource_id);
                self.disconnect(id).map(|_| id)
            })
            .collect()
    }

    fn disconnect(&mut self, id: DeviceId) -> Option<DeviceInfo> {
        let entry = self.entries.resolve_mut(id).ok()?;
        entry.disconnected = true;
        let info = entry.info.clone();
        let refs = entry.refs;

        if refs == 0 {
            debug!("Destroying unreferenced departed device {:?}", id);
            let _ = self.entries.release(id);
        } else {
            debug!(
                "Device {:?} departed with {} reference(s) outstanding",
                id, refs
            );
        }
        Some(info)
    }

    pub fn get(&self, id: DeviceId) -> Result<&DeviceEntry<D>> {
        self.entries.resolve(id)
    }

    /// Resolve a device that must still be attached
    pub fn connected(&self, id: DeviceId) -> Result<&DeviceEntry<D>> {
        let entry = self.entries.resolve(id)?;
        if entry.disconnected {
            return Err(BackendError::DeviceDisconnected);
        }
        Ok(entry)
    }

    pub fn add_ref(&mut self, id: DeviceId) -> Result<()> {
        self.entries.resolve_mut(id)?.refs += 1;
        Ok(())
    }

    /// Drop one reference, destroying the entry once it is unreferenced
    /// and gone
    pub fn remove_ref(&mut self, id: DeviceId) -> Result<()> {
        let entry = self.entries.resolve_mut(id)?;
        if entry.refs == 0 {
            return Err(BackendError::invalid_argument(format!(
                "device {:?} has no outstanding references",
                id
            )));
        }

        entry.refs -= 1;
        if entry.refs == 0 && entry.disconnected {
            debug!("Destroying released departed device {:?}", id);
            self.entries.release(id)?;
        }
        Ok(())
    }

    /// Connected devices, in registration order
    pub fn connected_ids(&self) -> Vec<DeviceId> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.disconnected)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every entry
    pub fn drain(&mut self) -> Vec<(DeviceId, DeviceEntry<D>)> {
        self.by_resource.clear();
        self.entries.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listed(id: u64, address: u8) -> HostDevice<()> {
        HostDevice {
            id: ResourceId(id),
            info: DeviceInfo::new(1, address, 0x1234, 0x5678),
            device: (),
        }
    }

    #[test]
    fn test_observe_reuses_known_attachment() {
        let mut table = DeviceTable::new();
        let first = table.observe(listed(7, 2));
        let second = table.observe(listed(7, 2));

        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_departed_referenced_device_survives() {
        let mut table = DeviceTable::new();
        let id = table.observe(listed(7, 2));
        table.add_ref(id).unwrap();

        let (departed, info) = table.depart(ResourceId(7)).unwrap();
        assert_eq!(departed, id);
        assert_eq!(info.device_address, 2);
        assert!(table.get(id).unwrap().disconnected);
        assert_eq!(
            table.connected(id).err(),
            Some(BackendError::DeviceDisconnected)
        );

        table.remove_ref(id).unwrap();
        assert!(table.get(id).is_err());
    }

    #[test]
    fn test_departed_unreferenced_device_is_destroyed() {
        let mut table = DeviceTable::new();
        let id = table.observe(listed(7, 2));

        assert!(table.depart(ResourceId(7)).is_some());
        assert!(table.get(id).is_err());
        assert!(table.depart(ResourceId(7)).is_none());
    }

    #[test]
    fn test_unknown_departure_is_dropped() {
        let mut table: DeviceTable<()> = DeviceTable::new();
        assert!(table.depart(ResourceId(99)).is_none());
    }

    #[test]
    fn test_rearrival_is_new_identity() {
        let mut table = DeviceTable::new();
        let first = table.observe(listed(7, 2));
        table.add_ref(first).unwrap();
        table.depart(ResourceId(7));

        let second = table.observe(listed(8, 2));
        assert_ne!(first, second);
    }

    #[test]
    fn test_retain_present() {
        let mut table = DeviceTable::new();
        let kept = table.observe(listed(1, 2));
        let gone = table.observe(listed(2, 3));
        table.add_ref(gone).unwrap();

        let missing = table.retain_present(&HashSet::from([ResourceId(1)]));
        assert_eq!(missing, vec![gone]);
        assert_eq!(table.connected_ids(), vec![kept]);
        assert!(table.get(gone).unwrap().disconnected);
    }

    #[test]
    fn test_remove_ref_underflow() {
        let mut table = DeviceTable::new();
        let id = table.observe(listed(1, 2));
        assert!(matches!(
            table.remove_ref(id),
            Err(BackendError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_check_interface() {
        assert!(check_interface(0).is_ok());
        assert!(check_interface(31).is_ok());
        assert!(check_interface(32).is_err());
    }
}
