//! Capability registry for inter-plugin communication.
//!
//! A plugin publishes an implementation of a capability (usually an
//! `Arc<dyn Trait>` whose trait lives in a library every plugin resolves to
//! the same definition) and other plugins query it by type. Entries are
//! tagged with the publishing plugin so its unload can withdraw them.
//!
//! A withdrawn instance may still be held by whoever queried it. Such
//! entries are retained, with the publisher's [`ModuleLease`], until the last
//! outside reference is gone, so the code behind the instance stays loaded.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::domain::ModuleLease;
use crate::plugin::PluginId;

/// Thread-safe, type-keyed capability table.
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<TypeId, CapabilityEntry>>,
    /// Withdrawn entries whose instance is still referenced elsewhere
    retained: Mutex<Vec<CapabilityEntry>>,
}

struct CapabilityEntry {
    type_name: &'static str,
    owner: Option<PluginId>,
    /// Always an `Arc<C>` for the key's `C`. Declared before `lease` so it
    /// is dropped first.
    instance: Box<dyn Any + Send + Sync>,
    lease: Option<ModuleLease>,
    strong_count: fn(&(dyn Any + Send + Sync)) -> usize,
}

impl CapabilityEntry {
    /// References to the instance held outside this entry.
    fn outside_refs(&self) -> usize {
        (self.strong_count)(self.instance.as_ref()).saturating_sub(1)
    }
}

fn arc_strong_count<C>(instance: &(dyn Any + Send + Sync)) -> usize
where
    C: ?Sized + Send + Sync + 'static,
{
    instance
        .downcast_ref::<Arc<C>>()
        .map_or(0, Arc::strong_count)
}

/// Description of a published capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityInfo {
    pub type_name: &'static str,
    pub owner: Option<PluginId>,
}

impl CapabilityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retained: Mutex::new(Vec::new()),
        }
    }

    /// Publish a host-owned implementation, replacing any existing one.
    pub fn publish<C>(&self, instance: Arc<C>)
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.insert(None, None, instance);
    }

    /// Publish an implementation owned by `owner`, replacing any existing one.
    pub fn publish_owned<C>(&self, owner: PluginId, instance: Arc<C>)
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.insert(Some(owner), None, instance);
    }

    /// Publish an implementation whose code lives in `lease`'s generation.
    pub(crate) fn publish_leased<C>(&self, owner: PluginId, lease: ModuleLease, instance: Arc<C>)
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.insert(Some(owner), Some(lease), instance);
    }

    fn insert<C>(&self, owner: Option<PluginId>, lease: Option<ModuleLease>, instance: Arc<C>)
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<C>();
        let entry = CapabilityEntry {
            type_name,
            owner,
            instance: Box::new(instance),
            lease,
            strong_count: arc_strong_count::<C>,
        };

        let previous = match self.entries.write() {
            Ok(mut entries) => entries.insert(TypeId::of::<C>(), entry),
            Err(_) => {
                tracing::error!("Capability registry lock poisoned; dropped {}", type_name);
                return;
            }
        };

        match previous {
            Some(prev) => {
                tracing::debug!(
                    "Replaced capability {} (was owned by {:?})",
                    type_name,
                    prev.owner
                );
                self.retire(prev);
            }
            None => tracing::debug!("Published capability {}", type_name),
        }
    }

    /// Remove the implementation of `C`. Returns whether one was present.
    pub fn withdraw<C>(&self) -> bool
    where
        C: ?Sized + 'static,
    {
        let removed = self
            .entries
            .write()
            .ok()
            .and_then(|mut e| e.remove(&TypeId::of::<C>()));
        match removed {
            Some(entry) => {
                self.retire(entry);
                true
            }
            None => false,
        }
    }

    /// The current implementation of `C`.
    pub fn query<C>(&self) -> Option<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.entries
            .read()
            .ok()?
            .get(&TypeId::of::<C>())
            .and_then(|entry| entry.instance.downcast_ref::<Arc<C>>())
            .cloned()
    }

    /// Check if `C` has an implementation.
    pub fn has<C>(&self) -> bool
    where
        C: ?Sized + 'static,
    {
        self.entries
            .read()
            .map(|e| e.contains_key(&TypeId::of::<C>()))
            .unwrap_or(false)
    }

    /// Plugin that published the current implementation of `C`.
    pub fn owner_of<C>(&self) -> Option<PluginId>
    where
        C: ?Sized + 'static,
    {
        self.entries
            .read()
            .ok()?
            .get(&TypeId::of::<C>())
            .and_then(|entry| entry.owner)
    }

    /// Withdraw every capability published by `owner`.
    pub fn withdraw_owned_by(&self, owner: PluginId) -> usize {
        let removed: Vec<CapabilityEntry> = match self.entries.write() {
            Ok(mut entries) => {
                let keys: Vec<TypeId> = entries
                    .iter()
                    .filter(|(_, entry)| entry.owner == Some(owner))
                    .map(|(key, _)| *key)
                    .collect();
                keys.iter().filter_map(|key| entries.remove(key)).collect()
            }
            Err(_) => {
                tracing::error!("Capability registry lock poisoned; nothing withdrawn");
                return 0;
            }
        };

        let count = removed.len();
        for entry in removed {
            tracing::info!("Withdrew capability {} from plugin #{}", entry.type_name, owner);
            self.retire(entry);
        }
        count
    }

    /// Number of withdrawn instances still referenced elsewhere. Entries
    /// whose last outside reference is gone are released first.
    pub fn retained(&self) -> usize {
        let mut retained = self.retained.lock().unwrap_or_else(PoisonError::into_inner);
        retained.retain(|entry| entry.outside_refs() > 0);
        retained.len()
    }

    fn retire(&self, entry: CapabilityEntry) {
        let mut retained = self.retained.lock().unwrap_or_else(PoisonError::into_inner);
        retained.retain(|entry| entry.outside_refs() > 0);

        if entry.lease.is_some() && entry.outside_refs() > 0 {
            tracing::warn!(
                capability = entry.type_name,
                references = entry.outside_refs(),
                "Withdrawn capability is still referenced; keeping its module loaded"
            );
            retained.push(entry);
        }
    }

    /// List all published capabilities.
    pub fn list(&self) -> Vec<CapabilityInfo> {
        self.entries
            .read()
            .map(|e| {
                e.values()
                    .map(|entry| CapabilityInfo {
                        type_name: entry.type_name,
                        owner: entry.owner,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the number of published capabilities.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
