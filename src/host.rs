//! Main plugin host.

use std::path::Path;
use std::sync::Arc;

use crate::capabilities::CapabilityRegistry;
use crate::commands::{self, CommandReply, PluginCommand};
use crate::config::PluginConfig;
use crate::context::HostEnv;
use crate::domain::DependencyResolver;
use crate::error::{HostError, Result};
use crate::listeners::{DispatchReport, EventContext, ListenerRegistry};
use crate::loader::{ModuleLoader, NativeLoader};
use crate::registry::{PluginRegistry, PluginSummary};
use crate::shared::SharedLibrarySet;

/// Owns every plugin subsystem for the lifetime of the server process.
///
/// Construct one at startup, call [`init`](Self::init), drive events through
/// [`raise_event`](Self::raise_event) and administrative commands through
/// [`execute_command`](Self::execute_command), and call
/// [`on_native_unload`](Self::on_native_unload) at shutdown. All of these run
/// on the host's event pump; lifecycle operations take `&mut self` and so
/// never interleave.
pub struct PluginHost {
    config: PluginConfig,
    loader: Arc<dyn ModuleLoader>,
    resolver: Arc<DependencyResolver>,
    registry: PluginRegistry,
    initialized: bool,
}

impl PluginHost {
    /// Create a host that loads native libraries.
    pub fn new(config: PluginConfig) -> Self {
        let loader = Arc::new(NativeLoader::new(config.shadow_dir.clone()));
        Self::with_loader(config, loader)
    }

    /// Create a host with a custom code loader.
    pub fn with_loader(config: PluginConfig, loader: Arc<dyn ModuleLoader>) -> Self {
        let resolver = Arc::new(DependencyResolver::new(config.host_exports.clone()));
        let env = HostEnv::new(loader.clone(), resolver.clone());

        Self {
            config,
            loader,
            resolver,
            registry: PluginRegistry::new(env),
            initialized: false,
        }
    }

    /// Load shared libraries, then every plugin under the plugins directory.
    /// Returns the number of plugins loaded. Runs once; later calls do nothing.
    pub fn init(&mut self) -> Result<usize> {
        if self.initialized {
            tracing::warn!("Plugin host already initialized");
            return Ok(0);
        }
        self.initialized = true;

        let shared = SharedLibrarySet::load_all(
            self.loader.as_ref(),
            &self.config.shared_dir(),
            &self.config.library_extension,
        )?;
        tracing::info!("Loaded {} shared libraries", shared.len());
        if self.resolver.install_shared(shared).is_err() {
            tracing::warn!("Shared libraries were already installed");
        }

        tracing::info!("Loading plugins from {:?}", self.config.plugins_dir());
        let count = self
            .registry
            .load_all_from_directory(&self.config.plugins_dir(), &self.config.library_extension);
        tracing::info!("All plugin modules were loaded. {} plugins loaded.", count);

        Ok(count)
    }

    /// Unload every plugin. Called once at process shutdown.
    pub fn on_native_unload(&mut self) {
        tracing::info!("Unloading {} plugins", self.registry.len());
        self.registry.unload_all();
    }

    /// Get the configuration.
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.registry.env().capabilities
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.registry.env().listeners
    }

    pub fn shared_libraries(&self) -> Option<&SharedLibrarySet> {
        self.resolver.shared()
    }

    // === Lifecycle ===

    /// Load one plugin file.
    pub fn load_plugin(&mut self, path: &Path) -> Result<PluginSummary> {
        let id = self.registry.load_one(path)?;
        self.registry
            .find_by_id(id)
            .map(PluginSummary::from)
            .ok_or_else(|| HostError::NotFound(id.to_string()))
    }

    /// Unload a plugin by id or name.
    pub fn unload_plugin(&mut self, query: &str) -> Result<PluginSummary> {
        self.registry.unload(query)
    }

    /// Reload a plugin by id or name.
    pub fn reload_plugin(&mut self, query: &str) -> Result<PluginSummary> {
        self.registry.reload(query)
    }

    // === Runtime ===

    /// Deliver a host event to every subscribed handler of a loaded plugin.
    pub fn raise_event(&self, event: &str, ctx: &EventContext) -> DispatchReport {
        self.listeners().dispatch(event, ctx)
    }

    /// Run an administrative command line such as `plugins reload 2`.
    pub fn execute_command(&mut self, line: &str, reply: &mut dyn CommandReply) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first() {
            Some(&"plugins") => {
                let command = PluginCommand::parse(&tokens[1..]);
                commands::execute(self, command, reply);
            }
            Some(other) => reply.reply(&format!("Unknown command \"{}\"", other)),
            None => {}
        }
    }
}
