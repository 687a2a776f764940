//! Host services handed to a plugin's lifecycle hooks.

use std::sync::Arc;

use crate::capabilities::CapabilityRegistry;
use crate::domain::{DomainScope, ModuleLease, ResolvedLibrary};
use crate::error::{HostError, Result};
use crate::listeners::{ListenerDefinition, ListenerId, ListenerRegistry};
use crate::plugin::PluginId;

/// What a plugin can do to the host.
///
/// Listener subscriptions and capabilities made through this handle are
/// tagged with the plugin's id; whatever the plugin does not remove itself
/// is removed when it unloads.
///
/// A handle is bound to one module generation. Once that generation is torn
/// down every registering call fails with [`HostError::DomainUnloaded`],
/// even on clones the plugin kept.
#[derive(Clone)]
pub struct HostServices {
    plugin_id: PluginId,
    plugin_name: String,
    scope: Arc<DomainScope>,
    lease: ModuleLease,
    capabilities: Arc<CapabilityRegistry>,
    listeners: Arc<ListenerRegistry>,
}

impl HostServices {
    pub(crate) fn new(
        plugin_id: PluginId,
        plugin_name: impl Into<String>,
        scope: Arc<DomainScope>,
        lease: ModuleLease,
        capabilities: Arc<CapabilityRegistry>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            plugin_id,
            plugin_name: plugin_name.into(),
            scope,
            lease,
            capabilities,
            listeners,
        }
    }

    pub fn plugin_id(&self) -> PluginId {
        self.plugin_id
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Generation of the module domain this handle belongs to.
    pub fn generation(&self) -> u64 {
        self.scope.generation()
    }

    fn ensure_live(&self, operation: &str) -> Result<()> {
        if self.scope.is_torn_down() {
            tracing::warn!(
                plugin = %self.plugin_name,
                generation = self.scope.generation(),
                "Rejected {} from an unloaded module generation",
                operation
            );
            return Err(HostError::DomainUnloaded(self.scope.generation()));
        }
        Ok(())
    }

    // === Listeners ===

    /// Subscribe a handler to a host event.
    pub fn register_listener<H>(
        &self,
        definition: &'static ListenerDefinition<H>,
        handler: Arc<H>,
    ) -> Result<ListenerId>
    where
        H: ?Sized + Send + Sync + 'static,
    {
        self.ensure_live("listener registration")?;
        Ok(self
            .listeners
            .subscribe_leased(self.plugin_id, self.lease.clone(), definition, handler))
    }

    /// Remove a subscription made earlier.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    // === Capabilities ===

    /// Publish an implementation of `C`, replacing any existing one.
    pub fn publish<C>(&self, instance: Arc<C>) -> Result<()>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.ensure_live("capability publication")?;
        self.capabilities
            .publish_leased(self.plugin_id, self.lease.clone(), instance);
        Ok(())
    }

    /// Remove the implementation of `C`, whoever published it.
    pub fn withdraw<C>(&self) -> bool
    where
        C: ?Sized + 'static,
    {
        self.capabilities.withdraw::<C>()
    }

    pub fn query<C>(&self) -> Option<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.capabilities.query::<C>()
    }

    pub fn has<C>(&self) -> bool
    where
        C: ?Sized + 'static,
    {
        self.capabilities.has::<C>()
    }

    // === Libraries ===

    /// Resolve a library from the plugin's domain. Fails once the domain
    /// has been torn down.
    pub fn resolve_library(&self, name: &str) -> Result<ResolvedLibrary> {
        self.scope.resolve(name)
    }

    // === Logging ===

    /// Log a message. Level: 0=trace, 1=debug, 2=info, 3=warn, 4=error
    pub fn log(&self, level: u8, message: &str) {
        let plugin = self.plugin_name.as_str();
        match level {
            0 => tracing::trace!(plugin, "[plugin] {}", message),
            1 => tracing::debug!(plugin, "[plugin] {}", message),
            2 => tracing::info!(plugin, "[plugin] {}", message),
            3 => tracing::warn!(plugin, "[plugin] {}", message),
            _ => tracing::error!(plugin, "[plugin] {}", message),
        }
    }
}
