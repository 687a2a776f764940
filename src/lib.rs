//! Runtime for hot-loadable server plugins.
//!
//! Plugins are dynamic libraries found under `<root>/plugins/<Name>/<Name>.<ext>`.
//! Each one is loaded into its own module domain so it can be unloaded and
//! reloaded while the host keeps running. Libraries under `<root>/shared/`
//! are loaded once at startup and are visible to every plugin.
//!
//! # Example
//!
//! ```rust,ignore
//! use plugin_runtime::{EventContext, PluginConfig, PluginHost};
//!
//! let mut host = PluginHost::new(PluginConfig::new("/srv/game".into()));
//! host.init()?;
//!
//! host.raise_event("OnMapStart", &EventContext::new().with_arg("de_dust2"));
//!
//! let mut replies = Vec::new();
//! host.execute_command("plugins list", &mut replies);
//!
//! host.on_native_unload();
//! ```
//!
//! A plugin implements [`Plugin`] and exports itself with [`declare_plugin!`]:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use plugin_runtime::{listeners::ON_TICK, HostServices, Plugin, PluginError, PluginMetadata};
//!
//! #[derive(Default)]
//! struct Heartbeat;
//!
//! impl Plugin for Heartbeat {
//!     fn metadata(&self) -> PluginMetadata {
//!         PluginMetadata::new("Heartbeat", "1.0.0")
//!     }
//!
//!     fn load(&mut self, host: &HostServices, _hot_reload: bool) -> Result<(), PluginError> {
//!         host.register_listener(&ON_TICK, Arc::new(|| {}))?;
//!         Ok(())
//!     }
//! }
//!
//! fn create() -> Result<Heartbeat, PluginError> {
//!     Ok(Heartbeat)
//! }
//!
//! plugin_runtime::declare_plugin!(create);
//! ```

pub mod commands;
pub mod listeners;

mod capabilities;
mod config;
mod context;
mod domain;
mod error;
mod host;
mod loader;
mod plugin;
mod registry;
mod services;
mod shared;

pub use capabilities::*;
pub use commands::{CommandReply, PluginCommand, PLUGIN_ADMIN_PERMISSION};
pub use config::*;
pub use context::{HostEnv, PluginContext, PluginState};
pub use domain::*;
pub use error::*;
pub use host::*;
pub use listeners::{DispatchReport, EventContext, ListenerDefinition, ListenerId, ListenerRegistry};
pub use loader::*;
pub use plugin::*;
pub use registry::*;
pub use services::*;
pub use shared::*;

// Re-export dependencies for convenience
pub use serde_json;
