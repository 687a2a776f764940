//! Lifecycle of one plugin.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::capabilities::CapabilityRegistry;
use crate::domain::{DependencyResolver, DomainWatch, ModuleDomain};
use crate::error::{HostError, Result};
use crate::listeners::ListenerRegistry;
use crate::loader::ModuleLoader;
use crate::plugin::{panic_message, Plugin, PluginId, PluginMetadata};
use crate::services::HostServices;

/// Collaborators every plugin context needs.
#[derive(Clone)]
pub struct HostEnv {
    pub loader: Arc<dyn ModuleLoader>,
    pub resolver: Arc<DependencyResolver>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub listeners: Arc<ListenerRegistry>,
}

impl HostEnv {
    pub fn new(loader: Arc<dyn ModuleLoader>, resolver: Arc<DependencyResolver>) -> Self {
        Self {
            loader,
            resolver,
            capabilities: Arc::new(CapabilityRegistry::new()),
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }
}

/// Lifecycle state of a plugin context.
///
/// A fresh context starts `Unloaded` (no instance). `instantiate` moves it
/// to `Instantiated`, `load` to `Loaded`, `unload` back to `Unloaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Unloaded,
    Instantiated,
    Loaded,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginState::Unloaded => write!(f, "unloaded"),
            PluginState::Instantiated => write!(f, "instantiated"),
            PluginState::Loaded => write!(f, "loaded"),
        }
    }
}

/// One generation of a plugin: its object and the domain its code lives in.
struct PluginInstance {
    plugin: Box<dyn Plugin>,
    services: HostServices,
    domain: ModuleDomain,
}

/// Lifecycle wrapper around one plugin file.
///
/// The id and path persist across reloads; the instance and its domain
/// are recreated on every load cycle.
pub struct PluginContext {
    id: PluginId,
    path: PathBuf,
    metadata: PluginMetadata,
    state: PluginState,
    instance: Option<PluginInstance>,
    env: HostEnv,
}

impl PluginContext {
    /// A context with nothing loaded yet.
    pub fn new(id: PluginId, path: impl Into<PathBuf>, env: HostEnv) -> Self {
        let path = path.into();
        let metadata = PluginMetadata {
            name: file_stem(&path),
            ..Default::default()
        };

        Self {
            id,
            path,
            metadata,
            state: PluginState::Unloaded,
            instance: None,
            env,
        }
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Metadata of the most recent instance (the file stem before any).
    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    pub fn author(&self) -> &str {
        &self.metadata.author
    }

    pub fn description(&self) -> &str {
        &self.metadata.description
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == PluginState::Loaded
    }

    /// Generation of the current module domain.
    pub fn generation(&self) -> Option<u64> {
        self.instance.as_ref().map(|i| i.domain.generation())
    }

    /// Watch the current domain's code for reclamation.
    pub fn domain_watch(&self) -> Option<DomainWatch> {
        self.instance.as_ref().and_then(|i| i.domain.watch())
    }

    /// Load the code into a fresh domain and construct the plugin.
    pub fn instantiate(&mut self) -> Result<()> {
        if self.state != PluginState::Unloaded {
            return Err(self.invalid_state("instantiate"));
        }

        let domain =
            ModuleDomain::create(self.env.loader.as_ref(), self.env.resolver.clone(), &self.path)?;
        let plugin = domain.instantiate()?;

        let mut metadata = match catch_unwind(AssertUnwindSafe(|| plugin.metadata())) {
            Ok(metadata) => metadata,
            Err(payload) => {
                let reason = format!("metadata panicked: {}", panic_message(payload.as_ref()));
                drop_guarded(plugin, &self.metadata.name);
                return Err(HostError::load_failed(self.metadata.name.clone(), reason));
            }
        };
        if metadata.name.is_empty() {
            metadata.name = file_stem(&self.path);
        }
        self.metadata = metadata;

        let lease = domain
            .lease()
            .ok_or(HostError::DomainUnloaded(domain.generation()))?;
        let services = HostServices::new(
            self.id,
            self.metadata.name.clone(),
            domain.scope().clone(),
            lease,
            self.env.capabilities.clone(),
            self.env.listeners.clone(),
        );

        tracing::info!(
            plugin = %self.metadata.name,
            id = %self.id,
            generation = domain.generation(),
            "Plugin instantiated"
        );

        self.instance = Some(PluginInstance {
            plugin,
            services,
            domain,
        });
        self.state = PluginState::Instantiated;
        Ok(())
    }

    /// Run the plugin's `load` hook.
    ///
    /// On failure the context stays `Instantiated` and anything the hook
    /// registered before failing is removed.
    pub fn load(&mut self, hot_reload: bool) -> Result<()> {
        if self.state != PluginState::Instantiated {
            return Err(self.invalid_state("load"));
        }
        let Some(PluginInstance {
            plugin,
            services,
            domain,
        }) = self.instance.as_mut()
        else {
            return Err(self.invalid_state("load"));
        };
        let generation = domain.generation();

        let outcome = match catch_unwind(AssertUnwindSafe(|| plugin.load(services, hot_reload))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(format!("load panicked: {}", panic_message(payload.as_ref()))),
        };

        match outcome {
            Ok(()) => {
                self.env
                    .listeners
                    .activate_generation(self.id, generation);
                self.state = PluginState::Loaded;
                tracing::info!(
                    plugin = %self.metadata.name,
                    id = %self.id,
                    version = %self.metadata.version,
                    hot_reload,
                    "Plugin loaded"
                );
                Ok(())
            }
            Err(reason) => {
                self.release_registrations();
                Err(HostError::load_failed(self.metadata.name.clone(), reason))
            }
        }
    }

    /// Run the shutdown hook (if loaded) and tear the domain down.
    ///
    /// A failing hook is logged and unloading continues. Unloading an
    /// already unloaded context does nothing.
    pub fn unload(&mut self, hot_reload: bool) {
        let Some(instance) = self.instance.take() else {
            tracing::debug!(plugin = %self.metadata.name, "Plugin already unloaded");
            return;
        };
        let PluginInstance {
            mut plugin,
            services,
            mut domain,
        } = instance;

        self.env.listeners.deactivate(self.id);

        if self.state == PluginState::Loaded {
            match catch_unwind(AssertUnwindSafe(|| plugin.unload(&services, hot_reload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    plugin = %self.metadata.name,
                    error = %e,
                    "Plugin unload hook returned error"
                ),
                Err(payload) => tracing::error!(
                    plugin = %self.metadata.name,
                    "Plugin panicked in unload hook: {}",
                    panic_message(payload.as_ref())
                ),
            }
        }

        // Stale handles must not register anything from here on.
        domain.scope().tear_down();
        self.release_registrations();

        // The instance's code lives in the domain; drop it first.
        drop_guarded(plugin, &self.metadata.name);
        drop(services);
        domain.unload();

        self.state = PluginState::Unloaded;
        tracing::info!(plugin = %self.metadata.name, id = %self.id, hot_reload, "Plugin unloaded");
    }

    /// Instantiate then load as one step. If `load` fails the fresh
    /// instance is torn down and the context is left `Unloaded`.
    pub fn full_load(&mut self, hot_reload: bool) -> Result<()> {
        self.instantiate()?;
        if let Err(e) = self.load(hot_reload) {
            self.unload(hot_reload);
            return Err(e);
        }
        Ok(())
    }

    fn release_registrations(&self) {
        let listeners = self.env.listeners.remove_owned_by(self.id);
        let capabilities = self.env.capabilities.withdraw_owned_by(self.id);
        if listeners + capabilities > 0 {
            tracing::debug!(
                plugin = %self.metadata.name,
                listeners,
                capabilities,
                "Released plugin registrations"
            );
        }
    }

    fn invalid_state(&self, operation: &'static str) -> HostError {
        HostError::InvalidState {
            plugin: self.metadata.name.clone(),
            state: self.state.to_string(),
            operation,
        }
    }
}

impl Drop for PluginContext {
    fn drop(&mut self) {
        self.unload(false);
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("name", &self.metadata.name)
            .field("state", &self.state)
            .finish()
    }
}

/// Drop a plugin instance, containing any panic from its `Drop`.
fn drop_guarded(plugin: Box<dyn Plugin>, name: &str) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || drop(plugin))) {
        tracing::error!(
            plugin = %name,
            "Plugin panicked while being dropped: {}",
            panic_message(payload.as_ref())
        );
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::listeners::{EventContext, ON_TICK};
    use crate::loader::StaticLoader;
    use crate::plugin::PluginError;

    pub(crate) trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Hello(u64);

    impl Greeter for Hello {
        fn greet(&self) -> String {
            format!("hello from generation {}", self.0)
        }
    }

    /// Records every hook call into a shared log.
    pub(crate) struct Probe {
        pub name: &'static str,
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail_load: bool,
        pub fail_unload: bool,
    }

    impl Plugin for Probe {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new(self.name, "1.0.0").with_author("tests")
        }

        fn load(&mut self, host: &HostServices, hot_reload: bool) -> std::result::Result<(), PluginError> {
            self.log.lock().unwrap().push(format!("load:{hot_reload}"));
            let log = self.log.clone();
            host.register_listener(&ON_TICK, Arc::new(move || {
                log.lock().unwrap().push("tick".into());
            }))?;
            host.publish::<dyn Greeter>(Arc::new(Hello(host.generation())))?;
            if self.fail_load {
                return Err(PluginError::new("refusing to load"));
            }
            Ok(())
        }

        fn unload(&mut self, _host: &HostServices, hot_reload: bool) -> std::result::Result<(), PluginError> {
            self.log.lock().unwrap().push(format!("unload:{hot_reload}"));
            if self.fail_unload {
                panic!("unload exploded");
            }
            Ok(())
        }
    }

    fn env_with(loader: StaticLoader) -> HostEnv {
        HostEnv::new(
            Arc::new(loader),
            Arc::new(DependencyResolver::new(vec!["plugin_runtime".into()])),
        )
    }

    fn probe_env(log: &Arc<Mutex<Vec<String>>>, fail_load: bool, fail_unload: bool) -> HostEnv {
        let log = log.clone();
        env_with(StaticLoader::new().with_module("Probe", move || {
            Ok(Box::new(Probe {
                name: "Probe",
                log: log.clone(),
                fail_load,
                fail_unload,
            }))
        }))
    }

    fn path() -> PathBuf {
        PathBuf::from("/srv/plugins/Probe/Probe.so")
    }

    #[test]
    fn test_lifecycle_states() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let env = probe_env(&log, false, false);
        let mut ctx = PluginContext::new(PluginId(1), path(), env.clone());

        assert_eq!(ctx.state(), PluginState::Unloaded);
        assert_eq!(ctx.name(), "Probe");

        ctx.instantiate().unwrap();
        assert_eq!(ctx.state(), PluginState::Instantiated);
        assert_eq!(ctx.author(), "tests");
        assert!(!env.capabilities.has::<dyn Greeter>());

        ctx.load(false).unwrap();
        assert!(ctx.is_loaded());
        assert!(env.capabilities.has::<dyn Greeter>());
        assert!(env.listeners.is_active(PluginId(1)));

        ctx.unload(false);
        assert_eq!(ctx.state(), PluginState::Unloaded);
        assert!(!env.capabilities.has::<dyn Greeter>());
        assert_eq!(env.listeners.handler_count("OnTick"), 0);
        assert_eq!(*log.lock().unwrap(), vec!["load:false", "unload:false"]);
    }

    #[test]
    fn test_double_unload_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = PluginContext::new(PluginId(1), path(), probe_env(&log, false, false));
        ctx.full_load(false).unwrap();

        ctx.unload(false);
        ctx.unload(false);
        assert_eq!(log.lock().unwrap().iter().filter(|l| l.starts_with("unload")).count(), 1);
    }

    #[test]
    fn test_load_requires_instantiation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = PluginContext::new(PluginId(1), path(), probe_env(&log, false, false));
        assert!(matches!(ctx.load(false), Err(HostError::InvalidState { .. })));

        ctx.instantiate().unwrap();
        assert!(matches!(ctx.instantiate(), Err(HostError::InvalidState { .. })));
    }

    #[test]
    fn test_failed_load_keeps_instantiated_and_cleans_up() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let env = probe_env(&log, true, false);
        let mut ctx = PluginContext::new(PluginId(1), path(), env.clone());

        ctx.instantiate().unwrap();
        let err = ctx.load(false).unwrap_err();
        assert!(matches!(err, HostError::LoadFailed { .. }));
        assert_eq!(ctx.state(), PluginState::Instantiated);
        assert!(!env.capabilities.has::<dyn Greeter>());
        assert_eq!(env.listeners.handler_count("OnTick"), 0);

        // never loaded: no unload hook
        ctx.unload(false);
        assert_eq!(*log.lock().unwrap(), vec!["load:false"]);
    }

    #[test]
    fn test_failed_full_load_tears_down() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = PluginContext::new(PluginId(1), path(), probe_env(&log, true, false));

        assert!(ctx.full_load(false).is_err());
        assert_eq!(ctx.state(), PluginState::Unloaded);
        assert!(ctx.generation().is_none());
    }

    #[test]
    fn test_panicking_unload_hook_still_tears_down() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let env = probe_env(&log, false, true);
        let mut ctx = PluginContext::new(PluginId(1), path(), env.clone());
        ctx.full_load(false).unwrap();
        let watch = ctx.domain_watch().unwrap();

        ctx.unload(false);

        assert_eq!(ctx.state(), PluginState::Unloaded);
        assert!(!watch.is_alive());
        assert!(env.capabilities.is_empty());
    }

    #[test]
    fn test_panicking_drop_still_tears_down() {
        struct Grumpy;

        impl Plugin for Grumpy {
            fn metadata(&self) -> PluginMetadata {
                PluginMetadata::new("Probe", "1.0.0")
            }

            fn load(&mut self, _host: &HostServices, _hot_reload: bool) -> std::result::Result<(), PluginError> {
                Ok(())
            }
        }

        impl Drop for Grumpy {
            fn drop(&mut self) {
                panic!("drop exploded");
            }
        }

        let env = env_with(StaticLoader::new().with_module("Probe", || {
            Ok(Box::new(Grumpy))
        }));
        let mut ctx = PluginContext::new(PluginId(1), path(), env);
        ctx.full_load(false).unwrap();
        let watch = ctx.domain_watch().unwrap();

        ctx.unload(false);

        assert_eq!(ctx.state(), PluginState::Unloaded);
        assert!(!watch.is_alive());
    }

    #[test]
    fn test_queried_capability_keeps_module_loaded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let env = probe_env(&log, false, false);
        let mut ctx = PluginContext::new(PluginId(1), path(), env.clone());
        ctx.full_load(false).unwrap();
        let watch = ctx.domain_watch().unwrap();

        let greeter = env.capabilities.query::<dyn Greeter>().unwrap();
        ctx.unload(false);

        assert!(!env.capabilities.has::<dyn Greeter>());
        assert_eq!(env.capabilities.retained(), 1);
        assert!(watch.is_alive());
        assert!(greeter.greet().starts_with("hello"));

        drop(greeter);
        assert_eq!(env.capabilities.retained(), 0);
        assert!(!watch.is_alive());
    }

    #[test]
    fn test_reload_creates_new_generation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let env = probe_env(&log, false, false);
        let mut ctx = PluginContext::new(PluginId(7), path(), env.clone());
        ctx.full_load(false).unwrap();

        let first_gen = ctx.generation().unwrap();
        let first_watch = ctx.domain_watch().unwrap();
        let first_greeting = env.capabilities.query::<dyn Greeter>().unwrap().greet();

        ctx.unload(true);
        ctx.full_load(true).unwrap();

        assert_eq!(ctx.id(), PluginId(7));
        assert_eq!(ctx.path(), path().as_path());
        assert_eq!(ctx.name(), "Probe");
        assert!(ctx.generation().unwrap() > first_gen);
        assert!(!first_watch.is_alive());
        assert_ne!(
            env.capabilities.query::<dyn Greeter>().unwrap().greet(),
            first_greeting
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec!["load:false", "unload:true", "load:true"]
        );
    }

    #[test]
    fn test_constructor_error_is_load_error() {
        let env = env_with(
            StaticLoader::new().with_module("Probe", || Err(PluginError::new("bad config"))),
        );
        let mut ctx = PluginContext::new(PluginId(1), path(), env);

        let err = ctx.instantiate().unwrap_err();
        assert!(matches!(err, HostError::LoadFailed { .. }));
        assert_eq!(ctx.state(), PluginState::Unloaded);
    }

    #[test]
    fn test_missing_module_type_is_not_found() {
        let mut ctx = PluginContext::new(PluginId(1), path(), env_with(StaticLoader::new()));
        assert!(matches!(ctx.instantiate(), Err(HostError::NotFound(_))));
    }

    #[test]
    fn test_listeners_fire_only_while_loaded() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let env = probe_env(&log, false, false);
        let t = ticks.clone();
        let _counter = env.listeners.subscribe(PluginId(1), &ON_TICK, Arc::new(move || {
            t.fetch_add(1, Ordering::SeqCst);
        }));

        let mut ctx = PluginContext::new(PluginId(1), path(), env.clone());
        ctx.instantiate().unwrap();
        env.listeners.dispatch("OnTick", &EventContext::new());
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        ctx.load(false).unwrap();
        env.listeners.dispatch("OnTick", &EventContext::new());
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}
