//! Plugin runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the plugin runtime.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Install root; holds `plugins/` and `shared/`
    pub root_dir: PathBuf,

    /// Library file extension without the dot (`so`, `dylib`, `dll`)
    pub library_extension: String,

    /// Where native plugin libraries are copied before being opened
    /// (None = open them in place)
    pub shadow_dir: Option<PathBuf>,

    /// Library names satisfied by the host's own code
    pub host_exports: Vec<String>,

    /// Rate of the `OnTick` event raised by the event pump
    pub tick_rate: u32,
}

impl PluginConfig {
    /// Create a new configuration rooted at `root_dir`.
    pub fn new(root_dir: PathBuf) -> Self {
        Self {
            root_dir,
            library_extension: std::env::consts::DLL_EXTENSION.to_string(),
            shadow_dir: None,
            host_exports: vec![env!("CARGO_PKG_NAME").replace('-', "_")],
            tick_rate: 64,
        }
    }

    /// Set the library file extension.
    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.library_extension = ext.into().trim_start_matches('.').to_string();
        self
    }

    /// Copy plugin libraries into `dir` before loading them.
    pub fn with_shadow_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shadow_dir = Some(dir.into());
        self
    }

    /// Add a library name that resolves to the host.
    pub fn with_host_export(mut self, name: impl Into<String>) -> Self {
        self.host_exports.push(name.into());
        self
    }

    /// Set the tick rate (ticks per second, clamped to at least 1).
    pub fn with_tick_rate(mut self, rate: u32) -> Self {
        self.tick_rate = rate.max(1);
        self
    }

    /// Directory scanned for plugins.
    pub fn plugins_dir(&self) -> PathBuf {
        self.root_dir.join("plugins")
    }

    /// Directory scanned for shared libraries.
    pub fn shared_dir(&self) -> PathBuf {
        self.root_dir.join("shared")
    }

    /// Interval between two ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }

    /// File name of a module living in a directory named `name`.
    pub fn library_file_name(&self, name: &str) -> String {
        format!("{}.{}", name, self.library_extension)
    }

    /// Ensure directories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.plugins_dir())?;
        std::fs::create_dir_all(self.shared_dir())?;
        if let Some(shadow) = &self.shadow_dir {
            std::fs::create_dir_all(shadow)?;
        }
        Ok(())
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));

        Self::new(data_dir.join("plugin-runtime"))
            .with_shadow_dir(cache_dir.join("plugin-runtime").join("shadow"))
    }
}
