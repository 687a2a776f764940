//! Error types for plugin runtime operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while managing plugins.
#[derive(Debug, Error)]
pub enum HostError {
    /// A live plugin was already loaded from this path
    #[error("Plugin is already loaded: {0}")]
    AlreadyLoaded(PathBuf),

    /// Plugin (or its module type) not found
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Constructor or `load` hook failed
    #[error("Failed to load plugin {plugin}: {reason}")]
    LoadFailed { plugin: String, reason: String },

    /// A dependency could not be resolved against the host or the shared set
    #[error("Could not resolve library: {library}")]
    Resolution { library: String },

    /// The module domain has already been torn down
    #[error("Module domain {0} has been unloaded")]
    DomainUnloaded(u64),

    /// Operation not valid in the current lifecycle state
    #[error("Cannot {operation} plugin {plugin} while {state}")]
    InvalidState {
        plugin: String,
        state: String,
        operation: &'static str,
    },

    /// Failed to open a library file
    #[error("Failed to load library: {0}")]
    LibraryLoad(String),

    /// Library entry symbol not found
    #[error("Entry symbol not found: {0}")]
    SymbolNotFound(String),

    /// Incompatible API version
    #[error("Incompatible API version: expected {expected}, got {actual}")]
    IncompatibleApiVersion { expected: u32, actual: u32 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    pub(crate) fn load_failed(plugin: impl Into<String>, reason: impl ToString) -> Self {
        HostError::LoadFailed {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for plugin runtime operations
pub type Result<T> = std::result::Result<T, HostError>;
