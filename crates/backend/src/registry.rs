//! Resource registry
//!
//! Maps client-visible handles to the opaque host resources they stand for.
//! Each table is a [`SlotMap`]: removing an entry bumps its slot's version,
//! so a stale key can never resolve to whatever later reuses the slot.

use crate::error::BackendError;
use slotmap::{Key, SlotMap};

/// Typed key for one registry table
pub trait RegistryKey: Key {
    /// Name used in `NotFound` contract violations
    const KIND: &'static str;
}

macro_rules! registry_key {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        slotmap::new_key_type! {
            $(#[$meta])*
            pub struct $name;
        }

        impl RegistryKey for $name {
            const KIND: &'static str = $kind;
        }
    };
}

registry_key!(
    /// Client handle for a discovered device
    DeviceId,
    "device"
);
registry_key!(
    /// Client handle for an open device session
    HandleId,
    "device handle"
);
registry_key!(
    /// Client handle for a transfer
    TransferId,
    "transfer"
);

/// Arena owning one kind of resource
pub struct Registry<K: Key, T> {
    entries: SlotMap<K, T>,
}

impl<K: RegistryKey, T> Default for Registry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: RegistryKey, T> Registry<K, T> {
    pub fn new() -> Self {
        Self {
            entries: SlotMap::with_key(),
        }
    }

    /// Bind a new key to `resource`
    pub fn register(&mut self, resource: T) -> K {
        self.entries.insert(resource)
    }

    /// Look up the resource bound to `key`
    pub fn resolve(&self, key: K) -> Result<&T, BackendError> {
        self.entries
            .get(key)
            .ok_or_else(|| BackendError::not_found(K::KIND))
    }

    pub fn resolve_mut(&mut self, key: K) -> Result<&mut T, BackendError> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| BackendError::not_found(K::KIND))
    }

    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove the entry and hand its resource back to the caller
    ///
    /// Releasing an already released key is reported as `NotFound`.
    pub fn release(&mut self, key: K) -> Result<T, BackendError> {
        self.entries
            .remove(key)
            .ok_or_else(|| BackendError::not_found(K::KIND))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.entries.iter_mut()
    }

    /// Release every entry, returning the resources in slot order
    pub fn drain(&mut self) -> Vec<(K, T)> {
        self.entries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_register_resolve_release() {
        let mut registry: Registry<DeviceId, &str> = Registry::new();
        let key = registry.register("first");

        assert_eq!(*registry.resolve(key).unwrap(), "first");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.release(key).unwrap(), "first");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_double_release_is_not_found() {
        let mut registry: Registry<TransferId, u32> = Registry::new();
        let key = registry.register(7);
        registry.release(key).unwrap();

        let err = registry.release(key).unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(err, BackendError::not_found("transfer"));
    }

    #[test]
    fn test_stale_key_does_not_alias_reused_slot() {
        let mut registry: Registry<HandleId, u32> = Registry::new();
        let old = registry.register(1);
        registry.release(old).unwrap();
        let new = registry.register(2);

        assert_ne!(old, new);
        assert!(registry.resolve(old).is_err());
        assert_eq!(
            registry.resolve_mut(old).unwrap_err(),
            BackendError::not_found("device handle")
        );
        assert_eq!(*registry.resolve(new).unwrap(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry: Registry<DeviceId, u32> = Registry::new();
        let a = registry.register(1);
        let b = registry.register(2);

        let drained = registry.drain();
        assert_eq!(drained, vec![(a, 1), (b, 2)]);
        assert!(registry.is_empty());
        assert!(!registry.contains(a));
    }

    #[test]
    fn test_null_key_never_resolves() {
        let mut registry: Registry<DeviceId, ()> = Registry::new();
        registry.register(());
        assert!(registry.resolve(DeviceId::null()).is_err());
        assert!(format!("{:?}", DeviceId::null()).starts_with("DeviceId"));
    }

    proptest! {
        // Any interleaving of registers and releases keeps live keys unique
        // and makes released keys unresolvable.
        #[test]
        fn prop_released_keys_never_resolve(ops in proptest::collection::vec(any::<(bool, u8)>(), 1..200)) {
            let mut registry: Registry<TransferId, usize> = Registry::new();
            let mut live: Vec<TransferId> = Vec::new();
            let mut dead: Vec<TransferId> = Vec::new();

            for (step, (register, pick)) in ops.into_iter().enumerate() {
                if register || live.is_empty() {
                    live.push(registry.register(step));
                } else {
                    let key = live.remove(pick as usize % live.len());
                    registry.release(key).unwrap();
                    dead.push(key);
                }
            }

            prop_assert_eq!(registry.len(), live.len());
            for key in &dead {
                prop_assert!(registry.resolve(*key).is_err());
            }
            let mut seen = std::collections::HashSet::new();
            for key in &live {
                prop_assert!(registry.resolve(*key).is_ok());
                prop_assert!(seen.insert(*key));
            }
        }
    }
}
