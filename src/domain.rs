//! Isolated module domains.
//!
//! Every loaded plugin generation lives in its own [`ModuleDomain`]: the
//! domain owns the module's code and its resolved dependency closure, and is
//! torn down as a unit. Dependency names resolve first against the host's
//! own code and then against the [`SharedLibrarySet`], so host API types
//! have a single definition across all plugins and shared code is loaded
//! once.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use crate::error::{HostError, Result};
use crate::loader::{ModuleCode, ModuleLoader};
use crate::plugin::{panic_message, Plugin};
use crate::shared::{SharedLibraryRecord, SharedLibrarySet};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Where a dependency name was satisfied.
#[derive(Debug, Clone)]
pub enum ResolvedLibrary {
    /// Provided by the host's own code
    Host(String),
    /// Provided by the shared library set
    Shared(Arc<SharedLibraryRecord>),
}

impl ResolvedLibrary {
    pub fn name(&self) -> &str {
        match self {
            ResolvedLibrary::Host(name) => name,
            ResolvedLibrary::Shared(record) => record.name(),
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, ResolvedLibrary::Host(_))
    }
}

/// Two-tier dependency resolution shared by all domains.
#[derive(Debug)]
pub struct DependencyResolver {
    host_exports: Vec<String>,
    shared: OnceLock<SharedLibrarySet>,
}

impl DependencyResolver {
    pub fn new(host_exports: Vec<String>) -> Self {
        Self {
            host_exports,
            shared: OnceLock::new(),
        }
    }

    /// Install the shared set. It can only be installed once; a second set
    /// is handed back.
    pub fn install_shared(&self, set: SharedLibrarySet) -> std::result::Result<(), SharedLibrarySet> {
        self.shared.set(set)
    }

    pub fn shared(&self) -> Option<&SharedLibrarySet> {
        self.shared.get()
    }

    /// Resolve `name`: host code first, then a by-name scan of the shared set.
    pub fn resolve(&self, name: &str) -> Result<ResolvedLibrary> {
        if self.host_exports.iter().any(|n| n == name) {
            return Ok(ResolvedLibrary::Host(name.to_string()));
        }

        self.shared
            .get()
            .and_then(|set| set.resolve(name))
            .map(ResolvedLibrary::Shared)
            .ok_or_else(|| HostError::Resolution {
                library: name.to_string(),
            })
    }
}

/// Resolution scope of one domain. Outlives the code only as a tombstone:
/// once torn down it rejects every request.
#[derive(Debug)]
pub struct DomainScope {
    generation: u64,
    resolver: Arc<DependencyResolver>,
    closure: RwLock<Vec<ResolvedLibrary>>,
    torn_down: AtomicBool,
}

impl DomainScope {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Resolve a library for code running in this domain.
    pub fn resolve(&self, name: &str) -> Result<ResolvedLibrary> {
        if self.is_torn_down() {
            return Err(HostError::DomainUnloaded(self.generation));
        }

        if let Some(found) = self
            .closure
            .read()
            .ok()
            .and_then(|c| c.iter().find(|lib| lib.name() == name).cloned())
        {
            return Ok(found);
        }

        self.resolver.resolve(name)
    }

    /// Names in the domain's resolved dependency closure.
    pub fn dependencies(&self) -> Vec<String> {
        self.closure
            .read()
            .map(|c| c.iter().map(|lib| lib.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Reject all further resolution. Idempotent.
    pub(crate) fn tear_down(&self) {
        self.torn_down.store(true, Ordering::Release);
        if let Ok(mut closure) = self.closure.write() {
            closure.clear();
        }
    }
}

/// Keeps one generation's code loaded while held.
///
/// Handed to everything that can outlive a plugin's hooks: its
/// [`HostServices`](crate::HostServices), its listener subscriptions and its
/// published capabilities. The code (and, for native modules, the library)
/// is released only once the domain and every lease are gone.
#[derive(Clone)]
pub struct ModuleLease {
    generation: u64,
    _code: Arc<dyn ModuleCode>,
}

impl ModuleLease {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for ModuleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLease")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Observes whether a domain's code is still reachable.
#[derive(Clone)]
pub struct DomainWatch {
    generation: u64,
    code: Weak<dyn ModuleCode>,
}

impl DomainWatch {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while anything still holds the domain's code.
    pub fn is_alive(&self) -> bool {
        self.code.strong_count() > 0
    }

    /// Number of outstanding holders (the domain itself plus leases).
    pub fn holders(&self) -> usize {
        self.code.strong_count()
    }
}

/// An isolated resolution context owning one module's code.
pub struct ModuleDomain {
    path: PathBuf,
    scope: Arc<DomainScope>,
    code: Option<Arc<dyn ModuleCode>>,
}

impl ModuleDomain {
    /// Load the code at `path` into a fresh domain and resolve its
    /// declared dependencies.
    pub fn create(
        loader: &dyn ModuleLoader,
        resolver: Arc<DependencyResolver>,
        path: &Path,
    ) -> Result<Self> {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let code = loader.load_module(path, generation)?;

        let closure = code
            .dependencies()
            .iter()
            .map(|name| resolver.resolve(name))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            generation,
            dependencies = closure.len(),
            "Created module domain for {:?}",
            path
        );

        Ok(Self {
            path: path.to_path_buf(),
            scope: Arc::new(DomainScope {
                generation,
                resolver,
                closure: RwLock::new(closure),
                torn_down: AtomicBool::new(false),
            }),
            code: Some(code),
        })
    }

    pub fn generation(&self) -> u64 {
        self.scope.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scope(&self) -> &Arc<DomainScope> {
        &self.scope
    }

    pub fn is_unloaded(&self) -> bool {
        self.code.is_none()
    }

    pub fn watch(&self) -> Option<DomainWatch> {
        self.code.as_ref().map(|code| DomainWatch {
            generation: self.scope.generation,
            code: Arc::downgrade(code),
        })
    }

    /// A keep-alive token for this generation's code.
    pub fn lease(&self) -> Option<ModuleLease> {
        self.code.as_ref().map(|code| ModuleLease {
            generation: self.scope.generation,
            _code: code.clone(),
        })
    }

    /// Resolve a dependency name from inside this domain.
    pub fn resolve(&self, name: &str) -> Result<ResolvedLibrary> {
        self.scope.resolve(name)
    }

    /// Construct the module's entry type. Panics in the constructor are
    /// reported as load failures.
    pub fn instantiate(&self) -> Result<Box<dyn Plugin>> {
        let code = self
            .code
            .as_ref()
            .ok_or(HostError::DomainUnloaded(self.scope.generation))?;
        let name = self.display_name();

        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| code.instantiate())) {
            Ok(Ok(plugin)) => Ok(plugin),
            Ok(Err(e)) => Err(HostError::load_failed(name, e)),
            Err(payload) => Err(HostError::load_failed(
                name,
                format!("constructor panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    }

    /// Tear the domain down and release its code.
    ///
    /// Returns whether the code became unreachable. Outstanding
    /// [`ModuleLease`]s (a capability another plugin still holds, a cloned
    /// services handle) keep it loaded until they are dropped; that is
    /// logged and the domain still rejects further resolution.
    pub fn unload(&mut self) -> bool {
        let Some(code) = self.code.take() else {
            return true;
        };

        self.scope.tear_down();

        let weak = Arc::downgrade(&code);
        drop(code);
        let reclaimed = weak.strong_count() == 0;

        if reclaimed {
            tracing::debug!(generation = self.scope.generation, "Module domain reclaimed");
        } else {
            tracing::warn!(
                generation = self.scope.generation,
                leases = weak.strong_count(),
                "Module domain still referenced after unload: {:?}",
                self.path
            );
        }
        reclaimed
    }

    fn display_name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

impl Drop for ModuleDomain {
    fn drop(&mut self) {
        self.unload();
    }
}
