//! Code loaders.
//!
//! A [`ModuleLoader`] turns a file path into loaded code. [`NativeLoader`]
//! opens dynamic libraries with `libloading`; [`StaticLoader`] serves plugins
//! linked into the host binary, keyed by module name.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::error::{HostError, Result};
use crate::plugin::{
    Plugin, PluginCreateFn, PluginDependenciesFn, PluginError, PLUGIN_API_VERSION,
    PLUGIN_API_VERSION_SYMBOL, PLUGIN_CREATE_SYMBOL, PLUGIN_DEPENDENCIES_SYMBOL,
    SHARED_VERSION_SYMBOL,
};

/// Handle to a library loaded into the neutral (shared) domain.
pub struct LibraryHandle {
    path: PathBuf,
    version: Option<String>,
    /// None for libraries linked into the host
    library: Option<Library>,
}

impl LibraryHandle {
    /// Wrap an opened native library.
    pub fn native(path: impl Into<PathBuf>, library: Library, version: Option<String>) -> Self {
        Self {
            path: path.into(),
            version,
            library: Some(library),
        }
    }

    /// A handle for code already present in the host process.
    pub fn linked(path: impl Into<PathBuf>, version: Option<String>) -> Self {
        Self {
            path: path.into(),
            version,
            library: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn is_native(&self) -> bool {
        self.library.is_some()
    }

    /// Look up a symbol in the library.
    ///
    /// # Safety
    /// `T` must match the actual type of the exported symbol.
    pub unsafe fn get<T>(&self, symbol: &[u8]) -> Result<Symbol<'_, T>> {
        let library = self.library.as_ref().ok_or_else(|| {
            HostError::SymbolNotFound(format!(
                "{} is linked into the host",
                String::from_utf8_lossy(symbol)
            ))
        })?;
        library
            .get(symbol)
            .map_err(|e| HostError::SymbolNotFound(e.to_string()))
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("native", &self.is_native())
            .finish()
    }
}

/// Plugin code loaded into one module domain.
pub trait ModuleCode: Send + Sync {
    /// File the code was loaded from.
    fn path(&self) -> &Path;

    /// Library names the module needs resolved before construction.
    fn dependencies(&self) -> Vec<String>;

    /// Construct the module's entry type.
    fn instantiate(&self) -> std::result::Result<Box<dyn Plugin>, PluginError>;
}

/// Strategy for bringing code into the process.
pub trait ModuleLoader: Send + Sync {
    /// Load a library into the neutral domain shared by every plugin.
    fn load_shared(&self, path: &Path) -> Result<LibraryHandle>;

    /// Load plugin code into a fresh, private domain. `generation` is unique
    /// per call and may be used to keep generations apart.
    fn load_module(&self, path: &Path, generation: u64) -> Result<Arc<dyn ModuleCode>>;
}

fn module_name(path: &Path) -> Result<&str> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| HostError::NotFound(format!("invalid module path {:?}", path)))
}

// === Native ===

/// Loads dynamic libraries.
///
/// Shared libraries are opened with global symbol visibility so a single
/// copy serves every plugin. Plugins are opened with local visibility, each
/// into its own handle; with a shadow directory configured, every generation
/// is opened from its own copy so the dynamic linker cannot hand back an
/// image from a previous load.
#[derive(Debug, Clone, Default)]
pub struct NativeLoader {
    shadow_dir: Option<PathBuf>,
}

impl NativeLoader {
    pub fn new(shadow_dir: Option<PathBuf>) -> Self {
        Self { shadow_dir }
    }

    fn shadow_copy(&self, path: &Path, generation: u64) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.shadow_dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir)?;

        let stem = module_name(path)?;
        let file_name = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}-{}.{}", stem, generation, ext),
            None => format!("{}-{}", stem, generation),
        };
        let target = dir.join(file_name);
        std::fs::copy(path, &target)?;
        tracing::debug!("Shadow copy {:?} -> {:?}", path, target);
        Ok(Some(target))
    }

    #[cfg(unix)]
    unsafe fn open(path: &Path, global: bool) -> Result<Library> {
        use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_LOCAL, RTLD_NOW};

        let flags = if global {
            RTLD_NOW | RTLD_GLOBAL
        } else {
            RTLD_NOW | RTLD_LOCAL
        };
        UnixLibrary::open(Some(path), flags)
            .map(Library::from)
            .map_err(|e| HostError::LibraryLoad(format!("{:?}: {}", path, e)))
    }

    #[cfg(not(unix))]
    unsafe fn open(path: &Path, _global: bool) -> Result<Library> {
        Library::new(path).map_err(|e| HostError::LibraryLoad(format!("{:?}: {}", path, e)))
    }
}

impl ModuleLoader for NativeLoader {
    fn load_shared(&self, path: &Path) -> Result<LibraryHandle> {
        // SAFETY: shared libraries come from the operator-controlled install root.
        let library = unsafe { Self::open(path, true)? };

        let version = unsafe {
            library
                .get::<fn() -> &'static str>(SHARED_VERSION_SYMBOL)
                .ok()
                .map(|f| f().to_string())
        };

        Ok(LibraryHandle::native(path, library, version))
    }

    fn load_module(&self, path: &Path, generation: u64) -> Result<Arc<dyn ModuleCode>> {
        let shadow = self.shadow_copy(path, generation)?;
        let open_path = shadow.as_deref().unwrap_or(path);

        // SAFETY: plugins are trusted native code from the install root.
        let library = match unsafe { Self::open(open_path, false) } {
            Ok(library) => library,
            Err(e) => {
                remove_shadow(shadow.as_deref());
                return Err(e);
            }
        };

        match unsafe { read_entry_points(&library) } {
            Ok((create, dependencies)) => Ok(Arc::new(NativeModule {
                path: path.to_path_buf(),
                shadow,
                create,
                dependencies,
                library: Some(library),
            })),
            Err(e) => {
                drop(library);
                remove_shadow(shadow.as_deref());
                Err(e)
            }
        }
    }
}

unsafe fn read_entry_points(library: &Library) -> Result<(PluginCreateFn, Vec<String>)> {
    let api_version: Symbol<extern "C" fn() -> u32> = library
        .get(PLUGIN_API_VERSION_SYMBOL)
        .map_err(|e| HostError::SymbolNotFound(e.to_string()))?;
    let actual = api_version();
    if actual != PLUGIN_API_VERSION {
        return Err(HostError::IncompatibleApiVersion {
            expected: PLUGIN_API_VERSION,
            actual,
        });
    }

    let create: Symbol<PluginCreateFn> = library
        .get(PLUGIN_CREATE_SYMBOL)
        .map_err(|e| HostError::NotFound(format!("no plugin entry type: {}", e)))?;

    let dependencies = library
        .get::<PluginDependenciesFn>(PLUGIN_DEPENDENCIES_SYMBOL)
        .map(|f| f())
        .unwrap_or_default();

    Ok((*create, dependencies))
}

fn remove_shadow(shadow: Option<&Path>) {
    if let Some(path) = shadow {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!("Failed to remove shadow copy {:?}: {}", path, e);
        }
    }
}

struct NativeModule {
    path: PathBuf,
    shadow: Option<PathBuf>,
    /// Points into `library`; never called after the library is dropped
    create: PluginCreateFn,
    dependencies: Vec<String>,
    library: Option<Library>,
}

impl ModuleCode for NativeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn instantiate(&self) -> std::result::Result<Box<dyn Plugin>, PluginError> {
        (self.create)()
    }
}

impl Drop for NativeModule {
    fn drop(&mut self) {
        drop(self.library.take());
        remove_shadow(self.shadow.as_deref());
        tracing::debug!("Closed module library {:?}", self.path);
    }
}

// === Static ===

type Constructor =
    Arc<dyn Fn() -> std::result::Result<Box<dyn Plugin>, PluginError> + Send + Sync>;

#[derive(Clone)]
struct StaticEntry {
    dependencies: Vec<String>,
    constructor: Constructor,
}

/// Serves plugins compiled into the host.
///
/// A module path resolves to the entry registered under its file stem, so
/// `plugins/Greeter/Greeter.so` maps to the module named `Greeter`. Shared
/// library paths always resolve to code already linked into the process.
#[derive(Clone, Default)]
pub struct StaticLoader {
    modules: HashMap<String, StaticEntry>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module constructor under `name`.
    pub fn with_module<F>(self, name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> std::result::Result<Box<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        self.with_module_deps(name, Vec::<String>::new(), constructor)
    }

    /// Register a module constructor that needs `dependencies` resolved.
    pub fn with_module_deps<F>(
        mut self,
        name: impl Into<String>,
        dependencies: impl IntoIterator<Item = impl Into<String>>,
        constructor: F,
    ) -> Self
    where
        F: Fn() -> std::result::Result<Box<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        self.modules.insert(
            name.into(),
            StaticEntry {
                dependencies: dependencies.into_iter().map(Into::into).collect(),
                constructor: Arc::new(constructor),
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }
}

impl ModuleLoader for StaticLoader {
    fn load_shared(&self, path: &Path) -> Result<LibraryHandle> {
        Ok(LibraryHandle::linked(path, None))
    }

    fn load_module(&self, path: &Path, _generation: u64) -> Result<Arc<dyn ModuleCode>> {
        let name = module_name(path)?;
        let entry = self
            .modules
            .get(name)
            .ok_or_else(|| HostError::NotFound(format!("no plugin entry type in {:?}", path)))?;

        Ok(Arc::new(StaticModule {
            path: path.to_path_buf(),
            entry: entry.clone(),
        }))
    }
}

struct StaticModule {
    path: PathBuf,
    entry: StaticEntry,
}

impl ModuleCode for StaticModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn dependencies(&self) -> Vec<String> {
        self.entry.dependencies.clone()
    }

    fn instantiate(&self) -> std::result::Result<Box<dyn Plugin>, PluginError> {
        (self.entry.constructor)()
    }
}
