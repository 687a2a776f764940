//! The contract between the runtime and a plugin module.
//!
//! A plugin is any type implementing [`Plugin`]. Native plugins export it
//! from a dynamic library with [`declare_plugin!`]; in-process plugins are
//! registered on a [`StaticLoader`](crate::StaticLoader).

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::HostError;
use crate::services::HostServices;

/// Version of the host API that plugins are compiled against.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Symbol returning [`PLUGIN_API_VERSION`] as seen by the plugin.
pub const PLUGIN_API_VERSION_SYMBOL: &[u8] = b"plugin_api_version";

/// Symbol constructing the plugin's entry type.
pub const PLUGIN_CREATE_SYMBOL: &[u8] = b"plugin_create";

/// Optional symbol listing the libraries the plugin depends on.
pub const PLUGIN_DEPENDENCIES_SYMBOL: &[u8] = b"plugin_dependencies";

/// Optional symbol exported by shared libraries to report their version.
pub const SHARED_VERSION_SYMBOL: &[u8] = b"shared_library_version";

/// Signature of [`PLUGIN_CREATE_SYMBOL`].
pub type PluginCreateFn = fn() -> Result<Box<dyn Plugin>, PluginError>;

/// Signature of [`PLUGIN_DEPENDENCIES_SYMBOL`].
pub type PluginDependenciesFn = fn() -> Vec<String>;

/// Sequential plugin id, unique within one process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PluginId(pub u32);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptive metadata a plugin reports once instantiated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Error reported by a plugin constructor or lifecycle hook.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PluginError {
    message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for PluginError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for PluginError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<HostError> for PluginError {
    fn from(e: HostError) -> Self {
        Self::new(e.to_string())
    }
}

/// A loadable plugin module.
///
/// `load` runs once per load cycle after construction; it is where the
/// plugin subscribes listeners and publishes capabilities. `unload` runs
/// before the module's domain is torn down. Both receive `hot_reload = true`
/// when the cycle is part of a reload.
pub trait Plugin: Any + Send {
    /// Metadata shown in listings.
    fn metadata(&self) -> PluginMetadata;

    /// Startup hook.
    fn load(&mut self, host: &HostServices, hot_reload: bool) -> Result<(), PluginError>;

    /// Shutdown hook.
    fn unload(&mut self, _host: &HostServices, _hot_reload: bool) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Export a plugin type from a dynamic library.
///
/// ```rust,ignore
/// plugin_runtime::declare_plugin!(MyPlugin::new);
/// plugin_runtime::declare_plugin!(MyPlugin::new, ["json_helpers"]);
/// ```
///
/// The constructor must be a `fn() -> Result<T, PluginError>` where `T: Plugin`.
#[macro_export]
macro_rules! declare_plugin {
    ($ctor:path) => {
        $crate::declare_plugin!($ctor, []);
    };
    ($ctor:path, [$($dep:expr),* $(,)?]) => {
        #[no_mangle]
        pub extern "C" fn plugin_api_version() -> u32 {
            $crate::PLUGIN_API_VERSION
        }

        #[no_mangle]
        pub fn plugin_create(
        ) -> ::std::result::Result<::std::boxed::Box<dyn $crate::Plugin>, $crate::PluginError> {
            $ctor().map(|plugin| ::std::boxed::Box::new(plugin) as ::std::boxed::Box<dyn $crate::Plugin>)
        }

        #[no_mangle]
        pub fn plugin_dependencies() -> ::std::vec::Vec<::std::string::String> {
            ::std::vec![$(::std::string::String::from($dep)),*]
        }
    };
}
