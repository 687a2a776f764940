//! The table of active plugin contexts.

use std::path::{Path, PathBuf};

use crate::context::{HostEnv, PluginContext, PluginState};
use crate::error::{HostError, Result};
use crate::plugin::{PluginId, PluginMetadata};

/// Snapshot of one registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSummary {
    pub id: PluginId,
    pub path: PathBuf,
    pub metadata: PluginMetadata,
    pub state: PluginState,
}

impl From<&PluginContext> for PluginSummary {
    fn from(ctx: &PluginContext) -> Self {
        Self {
            id: ctx.id(),
            path: ctx.path().to_path_buf(),
            metadata: ctx.metadata().clone(),
            state: ctx.state(),
        }
    }
}

/// Active plugins, in load order. At most one context per path.
pub struct PluginRegistry {
    contexts: Vec<PluginContext>,
    env: HostEnv,
    last_id: u32,
}

impl PluginRegistry {
    pub fn new(env: HostEnv) -> Self {
        Self {
            contexts: Vec::new(),
            env,
            last_id: 0,
        }
    }

    pub fn env(&self) -> &HostEnv {
        &self.env
    }

    /// Create an unattached context for `path`.
    ///
    /// Ids increase strictly and are never handed out twice, even after the
    /// highest-numbered plugin is unloaded.
    pub fn create_context(&mut self, path: &Path) -> Result<PluginContext> {
        if self.find_by_path(path).is_some() {
            return Err(HostError::AlreadyLoaded(path.to_path_buf()));
        }

        let max_live = self.contexts.iter().map(|c| c.id().0).max().unwrap_or(0);
        self.last_id = self.last_id.max(max_live) + 1;

        Ok(PluginContext::new(
            PluginId(self.last_id),
            path,
            self.env.clone(),
        ))
    }

    /// Create, fully load and register the plugin at `path`.
    /// Nothing is registered if any step fails.
    pub fn load_one(&mut self, path: &Path) -> Result<PluginId> {
        let mut ctx = self.create_context(path)?;
        ctx.full_load(false)?;

        let id = ctx.id();
        self.contexts.push(ctx);
        Ok(id)
    }

    /// Load every `<dir>/<dir>.<ext>` under `plugins_root`.
    ///
    /// All modules are instantiated first, then each successfully
    /// instantiated one is loaded. A failure in either phase is logged and
    /// only excludes that module. Returns the number of plugins loaded.
    pub fn load_all_from_directory(&mut self, plugins_root: &Path, extension: &str) -> usize {
        let entries = match std::fs::read_dir(plugins_root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot read plugins directory {:?}: {}", plugins_root, e);
                return 0;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter_map(|dir| {
                let name = dir.file_name()?.to_str()?.to_string();
                Some(dir.join(format!("{}.{}", name, extension)))
            })
            .filter(|path| path.exists())
            .collect();
        paths.sort();

        let mut instantiated = Vec::with_capacity(paths.len());
        for path in paths {
            tracing::info!("Plugin path: {:?}", path);
            if instantiated.iter().any(|c: &PluginContext| c.path() == path) {
                continue;
            }
            let result = self.create_context(&path).and_then(|mut ctx| {
                ctx.instantiate()?;
                Ok(ctx)
            });
            match result {
                Ok(ctx) => instantiated.push(ctx),
                Err(e) => tracing::error!(error = %e, "Failed to load plugin {:?}", path),
            }
        }

        let mut loaded = 0;
        for mut ctx in instantiated {
            match ctx.load(false) {
                Ok(()) => {
                    self.contexts.push(ctx);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::error!(plugin = %ctx.name(), error = %e, "Failed to load plugin");
                }
            }
        }

        loaded
    }

    pub fn find_by_id(&self, id: PluginId) -> Option<&PluginContext> {
        self.contexts.iter().find(|c| c.id() == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&PluginContext> {
        self.contexts.iter().find(|c| c.name() == name)
    }

    pub fn find_by_path(&self, path: &Path) -> Option<&PluginContext> {
        self.contexts.iter().find(|c| c.path() == path)
    }

    /// Look up by numeric id (optionally written `#id`), falling back to name.
    pub fn find_by_id_or_name(&self, query: &str) -> Option<&PluginContext> {
        self.position_by_id_or_name(query).map(|i| &self.contexts[i])
    }

    fn position_by_id_or_name(&self, query: &str) -> Option<usize> {
        if let Ok(id) = query.trim_start_matches('#').parse::<u32>() {
            if let Some(pos) = self.contexts.iter().position(|c| c.id() == PluginId(id)) {
                return Some(pos);
            }
        }
        self.contexts.iter().position(|c| c.name() == query)
    }

    /// Unload and remove a plugin.
    pub fn unload(&mut self, query: &str) -> Result<PluginSummary> {
        let pos = self
            .position_by_id_or_name(query)
            .ok_or_else(|| HostError::NotFound(query.to_string()))?;

        let mut ctx = self.contexts.remove(pos);
        ctx.unload(false);
        Ok(PluginSummary::from(&ctx))
    }

    /// Unload a plugin and load it again from the same path.
    ///
    /// Not transactional: if the fresh load fails, the plugin stays
    /// registered in the `Unloaded` state.
    pub fn reload(&mut self, query: &str) -> Result<PluginSummary> {
        let pos = self
            .position_by_id_or_name(query)
            .ok_or_else(|| HostError::NotFound(query.to_string()))?;

        let ctx = &mut self.contexts[pos];
        ctx.unload(true);
        ctx.full_load(true)?;
        Ok(PluginSummary::from(&*ctx))
    }

    /// Unload and remove every plugin, in load order.
    pub fn unload_all(&mut self) {
        for mut ctx in self.contexts.drain(..) {
            ctx.unload(false);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginContext> {
        self.contexts.iter()
    }

    pub fn summaries(&self) -> Vec<PluginSummary> {
        self.contexts.iter().map(PluginSummary::from).collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl Drop for PluginRegistry {
    fn drop(&mut self) {
        self.unload_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::context::tests::Probe;
    use crate::domain::DependencyResolver;
    use crate::loader::StaticLoader;
    use crate::plugin::PluginError;

    type Ctor = Box<dyn Fn() -> std::result::Result<Box<dyn crate::Plugin>, PluginError> + Send + Sync>;

    fn probe(name: &'static str, log: &Arc<Mutex<Vec<String>>>, fail_load: bool) -> Ctor {
        let log = log.clone();
        Box::new(move || -> std::result::Result<Box<dyn crate::Plugin>, PluginError> {
            Ok(Box::new(Probe {
                name,
                log: log.clone(),
                fail_load,
                fail_unload: false,
            }))
        })
    }

    fn registry(loader: StaticLoader) -> PluginRegistry {
        PluginRegistry::new(HostEnv::new(
            Arc::new(loader),
            Arc::new(DependencyResolver::new(vec![])),
        ))
    }

    fn touch(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name).join(format!("{name}.so"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_ids_strictly_increase() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = registry(
            StaticLoader::new()
                .with_module("A", probe("A", &log, false))
                .with_module("B", probe("B", &log, false))
                .with_module("C", probe("C", &log, false)),
        );

        let a = reg.load_one(Path::new("/p/A/A.so")).unwrap();
        let b = reg.load_one(Path::new("/p/B/B.so")).unwrap();
        assert!(b > a);

        reg.unload("B").unwrap();
        let c = reg.load_one(Path::new("/p/C/C.so")).unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_same_path_twice_is_already_loaded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = registry(StaticLoader::new().with_module("A", probe("A", &log, false)));

        reg.load_one(Path::new("/p/A/A.so")).unwrap();
        assert!(matches!(
            reg.load_one(Path::new("/p/A/A.so")),
            Err(HostError::AlreadyLoaded(_))
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_failed_load_one_leaves_registry_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = registry(StaticLoader::new().with_module("A", probe("A", &log, true)));

        assert!(reg.load_one(Path::new("/p/A/A.so")).is_err());
        assert!(reg.is_empty());
        assert!(reg.env().capabilities.is_empty());
    }

    #[test]
    fn test_load_all_isolates_failures() {
        let root = tempfile::tempdir().unwrap();
        touch(root.path(), "Good");
        touch(root.path(), "BadCtor");
        touch(root.path(), "BadLoad");
        touch(root.path(), "Unknown");
        std::fs::create_dir_all(root.path().join("Empty")).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = registry(
            StaticLoader::new()
                .with_module("Good", probe("Good", &log, false))
                .with_module("BadCtor", || Err(PluginError::new("ctor failed")))
                .with_module("BadLoad", probe("BadLoad", &log, true)),
        );

        let loaded = reg.load_all_from_directory(root.path(), "so");

        assert_eq!(loaded, 1);
        assert_eq!(reg.len(), 1);
        assert!(reg.find_by_name("Good").unwrap().is_loaded());
        assert!(reg.find_by_name("BadLoad").is_none());
    }

    #[test]
    fn test_load_all_survives_panicking_metadata() {
        struct Nameless;

        impl crate::Plugin for Nameless {
            fn metadata(&self) -> PluginMetadata {
                panic!("metadata boom")
            }

            fn load(
                &mut self,
                _host: &crate::HostServices,
                _hot_reload: bool,
            ) -> std::result::Result<(), PluginError> {
                Ok(())
            }
        }

        let root = tempfile::tempdir().unwrap();
        touch(root.path(), "A");
        touch(root.path(), "B");

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = registry(
            StaticLoader::new()
                .with_module("A", || -> std::result::Result<Box<dyn crate::Plugin>, PluginError> {
                    Ok(Box::new(Nameless))
                })
                .with_module("B", probe("B", &log, false)),
        );

        assert_eq!(reg.load_all_from_directory(root.path(), "so"), 1);
        assert!(reg.find_by_name("A").is_none());
        assert!(reg.find_by_name("B").unwrap().is_loaded());

        let err = reg.load_one(&root.path().join("A/A.so")).unwrap_err();
        assert!(err.to_string().contains("metadata boom"));
    }

    #[test]
    fn test_load_all_instantiates_before_loading() {
        let root = tempfile::tempdir().unwrap();
        touch(root.path(), "A");
        touch(root.path(), "B");

        let order = Arc::new(Mutex::new(Vec::new()));
        let ctor = |name: &'static str, order: &Arc<Mutex<Vec<String>>>| {
            let order = order.clone();
            move || -> std::result::Result<Box<dyn crate::Plugin>, PluginError> {
                order.lock().unwrap().push(format!("new:{name}"));
                Ok(Box::new(Probe {
                    name,
                    log: order.clone(),
                    fail_load: false,
                    fail_unload: false,
                }))
            }
        };
        let mut reg = registry(
            StaticLoader::new()
                .with_module("A", ctor("A", &order))
                .with_module("B", ctor("B", &order)),
        );

        assert_eq!(reg.load_all_from_directory(root.path(), "so"), 2);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["new:A", "new:B", "load:false", "load:false"]
        );
    }

    #[test]
    fn test_load_all_missing_dir() {
        let root = tempfile::tempdir().unwrap();
        let mut reg = registry(StaticLoader::new());
        assert_eq!(reg.load_all_from_directory(&root.path().join("nope"), "so"), 0);
    }

    #[test]
    fn test_lookup_by_id_or_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = registry(
            StaticLoader::new()
                .with_module("A", probe("A", &log, false))
                .with_module("2", probe("2", &log, false)),
        );
        let a = reg.load_one(Path::new("/p/A/A.so")).unwrap();
        let two = reg.load_one(Path::new("/p/2/2.so")).unwrap();

        assert_eq!(reg.find_by_id_or_name("1").unwrap().id(), a);
        assert_eq!(reg.find_by_id_or_name("#2").unwrap().id(), two);
        assert_eq!(reg.find_by_id_or_name("A").unwrap().id(), a);
        assert!(reg.find_by_id_or_name("9").is_none());
        assert!(reg.find_by_path(Path::new("/p/A/A.so")).is_some());
    }

    #[test]
    fn test_reload_preserves_identity() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = registry(StaticLoader::new().with_module("A", probe("A", &log, false)));
        let id = reg.load_one(Path::new("/p/A/A.so")).unwrap();
        let gen = reg.find_by_id(id).unwrap().generation().unwrap();

        let summary = reg.reload("A").unwrap();

        assert_eq!(summary.id, id);
        assert_eq!(summary.path, PathBuf::from("/p/A/A.so"));
        assert_eq!(summary.metadata.name, "A");
        assert_eq!(summary.state, PluginState::Loaded);
        assert!(reg.find_by_id(id).unwrap().generation().unwrap() > gen);
    }

    #[test]
    fn test_unload_missing_is_not_found() {
        let mut reg = registry(StaticLoader::new());
        assert!(matches!(reg.unload("ghost"), Err(HostError::NotFound(_))));
        assert!(matches!(reg.reload("ghost"), Err(HostError::NotFound(_))));
    }

    #[test]
    fn test_unload_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = registry(
            StaticLoader::new()
                .with_module("A", probe("A", &log, false))
                .with_module("B", probe("B", &log, false)),
        );
        reg.load_one(Path::new("/p/A/A.so")).unwrap();
        reg.load_one(Path::new("/p/B/B.so")).unwrap();

        reg.unload_all();

        assert!(reg.is_empty());
        assert_eq!(
            log.lock().unwrap().iter().filter(|l| l.starts_with("unload")).count(),
            2
        );
    }
}
