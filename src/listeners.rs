//! Listener dispatch.
//!
//! A [`ListenerDefinition`] names a host event and knows how to pull that
//! event's typed arguments out of an [`EventContext`] and hand them to a
//! handler. Plugins subscribe handlers through the [`ListenerRegistry`];
//! the host event pump calls [`ListenerRegistry::dispatch`] with the event
//! name and the raw arguments.
//!
//! Handlers run on the caller's thread. Keep them short: a slow handler
//! stalls the pump.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::ModuleLease;
use crate::plugin::{panic_message, PluginId};

/// Failure to deliver an event to one handler.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Missing argument {index}")]
    MissingArgument { index: usize },

    #[error("Invalid argument {index}: {reason}")]
    InvalidArgument { index: usize, reason: String },

    #[error("Malformed event arguments: {0}")]
    Malformed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Raw arguments of one event occurrence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventContext {
    args: Vec<Value>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_args(args: Vec<Value>) -> Self {
        Self { args }
    }

    /// Parse a JSON array of arguments.
    pub fn parse(json: &str) -> Result<Self, ListenerError> {
        match serde_json::from_str(json) {
            Ok(Value::Array(args)) => Ok(Self { args }),
            Ok(other) => Err(ListenerError::Malformed(format!(
                "expected an array, got {}",
                other
            ))),
            Err(e) => Err(ListenerError::Malformed(e.to_string())),
        }
    }

    /// Append an argument.
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Typed argument at `index`.
    pub fn get_argument<T: DeserializeOwned>(&self, index: usize) -> Result<T, ListenerError> {
        let value = self
            .args
            .get(index)
            .ok_or(ListenerError::MissingArgument { index })?;
        T::deserialize(value).map_err(|e| ListenerError::InvalidArgument {
            index,
            reason: e.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Handle to an engine entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRef(pub u32);

impl From<EntityRef> for Value {
    fn from(entity: EntityRef) -> Self {
        Value::from(entity.0)
    }
}

/// 64-bit Steam account id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SteamId(pub u64);

impl From<SteamId> for Value {
    fn from(id: SteamId) -> Self {
        Value::from(id.0)
    }
}

/// A named event and its argument adapter.
pub struct ListenerDefinition<H: ?Sized + 'static> {
    name: &'static str,
    call: fn(&EventContext, &H) -> Result<(), ListenerError>,
}

impl<H: ?Sized + 'static> ListenerDefinition<H> {
    pub const fn new(
        name: &'static str,
        call: fn(&EventContext, &H) -> Result<(), ListenerError>,
    ) -> Self {
        Self { name, call }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Extract the arguments from `ctx` and invoke `handler`.
    pub fn call(&self, ctx: &EventContext, handler: &H) -> Result<(), ListenerError> {
        (self.call)(ctx, handler)
    }
}

impl<H: ?Sized + 'static> fmt::Debug for ListenerDefinition<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerDefinition")
            .field("name", &self.name)
            .finish()
    }
}

pub type SimpleHandler = dyn Fn() + Send + Sync;
pub type EntityHandler = dyn Fn(EntityRef) + Send + Sync;
pub type EntityParentHandler = dyn Fn(EntityRef, EntityRef) + Send + Sync;
pub type TextHandler = dyn Fn(String) + Send + Sync;
pub type SlotHandler = dyn Fn(i32) + Send + Sync;
pub type ClientConnectHandler = dyn Fn(i32, String, String) + Send + Sync;
pub type ClientAuthorizedHandler = dyn Fn(i32, SteamId) + Send + Sync;
pub type FlagHandler = dyn Fn(bool) + Send + Sync;
pub type FrameTimeHandler = dyn Fn(f32) + Send + Sync;

/// Entity spawned.
pub static ON_ENTITY_SPAWNED: ListenerDefinition<EntityHandler> =
    ListenerDefinition::new("OnEntitySpawned", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Entity created.
pub static ON_ENTITY_CREATED: ListenerDefinition<EntityHandler> =
    ListenerDefinition::new("OnEntityCreated", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Entity deleted.
pub static ON_ENTITY_DELETED: ListenerDefinition<EntityHandler> =
    ListenerDefinition::new("OnEntityDeleted", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Entity parent changed: `(entity, new_parent)`.
pub static ON_ENTITY_PARENT_CHANGED: ListenerDefinition<EntityParentHandler> =
    ListenerDefinition::new("OnEntityParentChanged", |ctx, f| {
        f(ctx.get_argument(0)?, ctx.get_argument(1)?);
        Ok(())
    });

/// Every server tick. Avoid expensive work here.
pub static ON_TICK: ListenerDefinition<SimpleHandler> =
    ListenerDefinition::new("OnTick", |_, f| {
        f();
        Ok(())
    });

/// New map loaded: `(map_name)`.
pub static ON_MAP_START: ListenerDefinition<TextHandler> =
    ListenerDefinition::new("OnMapStart", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Current map about to end.
pub static ON_MAP_END: ListenerDefinition<SimpleHandler> =
    ListenerDefinition::new("OnMapEnd", |_, f| {
        f();
        Ok(())
    });

/// Client connecting: `(slot, name, ip_address)`.
pub static ON_CLIENT_CONNECT: ListenerDefinition<ClientConnectHandler> =
    ListenerDefinition::new("OnClientConnect", |ctx, f| {
        f(ctx.get_argument(0)?, ctx.get_argument(1)?, ctx.get_argument(2)?);
        Ok(())
    });

/// Client fully connected: `(slot)`.
pub static ON_CLIENT_CONNECTED: ListenerDefinition<SlotHandler> =
    ListenerDefinition::new("OnClientConnected", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Client put in server: `(slot)`.
pub static ON_CLIENT_PUT_IN_SERVER: ListenerDefinition<SlotHandler> =
    ListenerDefinition::new("OnClientPutInServer", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Client disconnecting: `(slot)`.
pub static ON_CLIENT_DISCONNECT: ListenerDefinition<SlotHandler> =
    ListenerDefinition::new("OnClientDisconnect", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Client disconnected: `(slot)`.
pub static ON_CLIENT_DISCONNECT_POST: ListenerDefinition<SlotHandler> =
    ListenerDefinition::new("OnClientDisconnectPost", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Client speaking: `(slot)`.
pub static ON_CLIENT_VOICE: ListenerDefinition<SlotHandler> =
    ListenerDefinition::new("OnClientVoice", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Client authorized: `(slot, steam_id)`.
pub static ON_CLIENT_AUTHORIZED: ListenerDefinition<ClientAuthorizedHandler> =
    ListenerDefinition::new("OnClientAuthorized", |ctx, f| {
        f(ctx.get_argument(0)?, SteamId(ctx.get_argument(1)?));
        Ok(())
    });

/// Hibernation state changed: `(is_hibernating)`.
pub static ON_SERVER_HIBERNATION_UPDATE: ListenerDefinition<FlagHandler> =
    ListenerDefinition::new("OnServerHibernationUpdate", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

pub static ON_GAME_SERVER_STEAM_API_ACTIVATED: ListenerDefinition<SimpleHandler> =
    ListenerDefinition::new("OnGameServerSteamAPIActivated", |_, f| {
        f();
        Ok(())
    });

pub static ON_GAME_SERVER_STEAM_API_DEACTIVATED: ListenerDefinition<SimpleHandler> =
    ListenerDefinition::new("OnGameServerSteamAPIDeactivated", |_, f| {
        f();
        Ok(())
    });

/// Host name changed: `(hostname)`.
pub static ON_HOST_NAME_CHANGED: ListenerDefinition<TextHandler> =
    ListenerDefinition::new("OnHostNameChanged", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Server about to enter fatal shutdown.
pub static ON_SERVER_PRE_FATAL_SHUTDOWN: ListenerDefinition<SimpleHandler> =
    ListenerDefinition::new("OnServerPreFatalShutdown", |_, f| {
        f();
        Ok(())
    });

/// Server in a loading stage: `(frame_time)`.
pub static ON_UPDATE_WHEN_NOT_IN_GAME: ListenerDefinition<FrameTimeHandler> =
    ListenerDefinition::new("OnUpdateWhenNotInGame", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Before the world updates, even while hibernating: `(simulating)`.
pub static ON_SERVER_PRE_WORLD_UPDATE: ListenerDefinition<FlagHandler> =
    ListenerDefinition::new("OnServerPreWorldUpdate", |ctx, f| {
        f(ctx.get_argument(0)?);
        Ok(())
    });

/// Names of every event in the built-in catalog.
pub const EVENT_NAMES: &[&str] = &[
    "OnEntitySpawned",
    "OnEntityCreated",
    "OnEntityDeleted",
    "OnEntityParentChanged",
    "OnTick",
    "OnMapStart",
    "OnMapEnd",
    "OnClientConnect",
    "OnClientConnected",
    "OnClientPutInServer",
    "OnClientDisconnect",
    "OnClientDisconnectPost",
    "OnClientVoice",
    "OnClientAuthorized",
    "OnServerHibernationUpdate",
    "OnGameServerSteamAPIActivated",
    "OnGameServerSteamAPIDeactivated",
    "OnHostNameChanged",
    "OnServerPreFatalShutdown",
    "OnUpdateWhenNotInGame",
    "OnServerPreWorldUpdate",
];

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Invoker = Arc<dyn Fn(&EventContext) -> Result<(), ListenerError> + Send + Sync>;

struct Subscription {
    id: ListenerId,
    owner: PluginId,
    /// Generation of the module that subscribed, if known
    generation: Option<u64>,
    invoke: Invoker,
    lease: Option<ModuleLease>,
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    events: HashMap<&'static str, Vec<Subscription>>,
    /// Active owners, with the generation allowed to receive events
    /// (None accepts any)
    active: HashMap<PluginId, Option<u64>>,
}

impl ListenerTable {
    fn find(&self, event: &str, id: ListenerId) -> Option<&Subscription> {
        self.events.get(event)?.iter().find(|s| s.id == id)
    }

    fn is_live(&self, event: &str, id: ListenerId) -> bool {
        let Some(sub) = self.find(event, id) else {
            return false;
        };
        match self.active.get(&sub.owner) {
            Some(None) => true,
            Some(Some(active)) => sub.generation.map_or(true, |g| g == *active),
            None => false,
        }
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that ran to completion
    pub invoked: usize,
    /// Handlers that failed or panicked
    pub failed: usize,
}

/// Per-event handler lists, in subscription order.
///
/// Only handlers of *active* owners are invoked; the plugin lifecycle
/// activates an owner's current generation once its `load` hook succeeds
/// and deactivates it at the start of its unload. A subscription made by
/// another generation of the same owner is never invoked.
pub struct ListenerRegistry {
    table: RwLock<ListenerTable>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(ListenerTable::default()),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, ListenerTable> {
        self.table.write().unwrap_or_else(|poisoned| {
            tracing::error!("Listener table lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, ListenerTable> {
        self.table.read().unwrap_or_else(|poisoned| {
            tracing::error!("Listener table lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Subscribe `handler` to the event described by `definition`.
    pub fn subscribe<H>(
        &self,
        owner: PluginId,
        definition: &'static ListenerDefinition<H>,
        handler: Arc<H>,
    ) -> ListenerId
    where
        H: ?Sized + Send + Sync + 'static,
    {
        self.insert(owner, None, definition, handler)
    }

    /// Subscribe on behalf of the module generation holding `lease`. The
    /// handler only fires while that generation is the active one, and its
    /// code stays loaded until the subscription is removed.
    pub(crate) fn subscribe_leased<H>(
        &self,
        owner: PluginId,
        lease: ModuleLease,
        definition: &'static ListenerDefinition<H>,
        handler: Arc<H>,
    ) -> ListenerId
    where
        H: ?Sized + Send + Sync + 'static,
    {
        self.insert(owner, Some(lease), definition, handler)
    }

    fn insert<H>(
        &self,
        owner: PluginId,
        lease: Option<ModuleLease>,
        definition: &'static ListenerDefinition<H>,
        handler: Arc<H>,
    ) -> ListenerId
    where
        H: ?Sized + Send + Sync + 'static,
    {
        let invoke: Invoker = Arc::new(move |ctx: &EventContext| definition.call(ctx, &*handler));

        let mut table = self.write();
        table.next_id += 1;
        let id = ListenerId(table.next_id);
        table
            .events
            .entry(definition.name())
            .or_default()
            .push(Subscription {
                id,
                owner,
                generation: lease.as_ref().map(ModuleLease::generation),
                invoke,
                lease,
            });

        tracing::debug!(event = definition.name(), owner = %owner, "Listener subscribed");
        id
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut table = self.write();
        let mut removed = false;
        for subs in table.events.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
        }
        removed
    }

    /// Remove every subscription made by `owner`.
    pub fn remove_owned_by(&self, owner: PluginId) -> usize {
        let mut table = self.write();
        let mut removed = 0;
        for subs in table.events.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.owner != owner);
            removed += before - subs.len();
        }
        removed
    }

    /// Let every subscription of `owner` receive events.
    pub fn activate(&self, owner: PluginId) {
        self.write().active.insert(owner, None);
    }

    /// Let only subscriptions made by `generation` of `owner` receive events.
    pub(crate) fn activate_generation(&self, owner: PluginId, generation: u64) {
        self.write().active.insert(owner, Some(generation));
    }

    pub fn deactivate(&self, owner: PluginId) {
        self.write().active.remove(&owner);
    }

    pub fn is_active(&self, owner: PluginId) -> bool {
        self.read().active.contains_key(&owner)
    }

    /// Number of subscriptions for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.read().events.get(event).map_or(0, Vec::len)
    }

    /// Invoke every live handler for `event`, in subscription order.
    ///
    /// Liveness is re-checked before each invocation, so a handler removed
    /// (or an owner deactivated) by an earlier handler in the same dispatch
    /// is not called. A failing handler is logged and does not stop the rest.
    pub fn dispatch(&self, event: &str, ctx: &EventContext) -> DispatchReport {
        let mut report = DispatchReport::default();

        let pending: Vec<(ListenerId, PluginId, Invoker, Option<ModuleLease>)> = {
            let table = self.read();
            match table.events.get(event) {
                Some(subs) => subs
                    .iter()
                    .map(|s| (s.id, s.owner, s.invoke.clone(), s.lease.clone()))
                    .collect(),
                None => return report,
            }
        };

        for (id, owner, invoke, _lease) in pending {
            if !self.read().is_live(event, id) {
                continue;
            }

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| invoke(ctx)))
                .unwrap_or_else(|payload| {
                    Err(ListenerError::Panicked(panic_message(payload.as_ref())))
                });

            match result {
                Ok(()) => report.invoked += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(event, plugin = %owner, error = %e, "Listener failed");
                }
            }
        }

        report
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn counter() -> (Arc<AtomicUsize>, Arc<SimpleHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_event_context_arguments() {
        let ctx = EventContext::new()
            .with_arg(3)
            .with_arg("Alice")
            .with_arg(EntityRef(42));

        assert_eq!(ctx.get_argument::<i32>(0).unwrap(), 3);
        assert_eq!(ctx.get_argument::<String>(1).unwrap(), "Alice");
        assert_eq!(ctx.get_argument::<EntityRef>(2).unwrap(), EntityRef(42));
        assert!(matches!(
            ctx.get_argument::<i32>(1),
            Err(ListenerError::InvalidArgument { index: 1, .. })
        ));
        assert!(matches!(
            ctx.get_argument::<i32>(5),
            Err(ListenerError::MissingArgument { index: 5 })
        ));
    }

    #[test]
    fn test_parse_json_args() {
        let ctx = EventContext::parse(r#"[1, "Bob", "10.0.0.1"]"#).unwrap();
        assert_eq!(ctx.len(), 3);
        assert!(EventContext::parse(r#"{"slot": 1}"#).is_err());
        assert!(EventContext::parse("not json").is_err());
    }

    #[test]
    fn test_definition_extracts_typed_args() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let handler = move |slot: i32, name: String, ip: String| {
            *s.lock().unwrap() = Some((slot, name, ip));
        };

        let ctx = EventContext::new().with_arg(2).with_arg("Carol").with_arg("127.0.0.1");
        ON_CLIENT_CONNECT.call(&ctx, &handler).unwrap();

        assert_eq!(
            seen.lock().unwrap().clone(),
            Some((2, "Carol".to_string(), "127.0.0.1".to_string()))
        );
    }

    #[test]
    fn test_steam_id_wrapping() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let handler = move |slot: i32, id: SteamId| {
            *s.lock().unwrap() = Some((slot, id));
        };

        let ctx = EventContext::new().with_arg(4).with_arg(76561197960287930u64);
        ON_CLIENT_AUTHORIZED.call(&ctx, &handler).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((4, SteamId(76561197960287930))));
    }

    #[test]
    fn test_catalog_names_match_definitions() {
        assert!(EVENT_NAMES.contains(&ON_TICK.name()));
        assert!(EVENT_NAMES.contains(&ON_SERVER_PRE_WORLD_UPDATE.name()));
        assert_eq!(EVENT_NAMES.len(), 21);
    }

    #[test]
    fn test_dispatch_in_subscription_order() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (owner, tag) in [(PluginId(2), "b"), (PluginId(1), "a"), (PluginId(2), "c")] {
            let o = order.clone();
            registry.subscribe(owner, &ON_MAP_START, Arc::new(move |map: String| {
                o.lock().unwrap().push(format!("{tag}:{map}"));
            }));
        }
        registry.activate(PluginId(1));
        registry.activate(PluginId(2));

        let report = registry.dispatch("OnMapStart", &EventContext::new().with_arg("de_dust2"));

        assert_eq!(report.invoked, 3);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["b:de_dust2", "a:de_dust2", "c:de_dust2"]
        );
    }

    #[test]
    fn test_inactive_owner_not_invoked() {
        let registry = ListenerRegistry::new();
        let (count, handler) = counter();
        registry.subscribe(PluginId(1), &ON_TICK, handler);

        assert_eq!(registry.dispatch("OnTick", &EventContext::new()).invoked, 0);

        registry.activate(PluginId(1));
        registry.dispatch("OnTick", &EventContext::new());
        registry.deactivate(PluginId(1));
        registry.dispatch("OnTick", &EventContext::new());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handler_is_isolated() {
        let registry = ListenerRegistry::new();
        let (count, handler) = counter();

        registry.subscribe(PluginId(1), &ON_TICK, Arc::new(|| panic!("handler bug")));
        registry.subscribe(PluginId(1), &ON_TICK, handler);
        registry.activate(PluginId(1));

        let report = registry.dispatch("OnTick", &EventContext::new());
        assert_eq!(report, DispatchReport { invoked: 1, failed: 1 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bad_arguments_are_isolated() {
        let registry = ListenerRegistry::new();
        let (count, handler) = counter();
        registry.subscribe(PluginId(1), &ON_CLIENT_VOICE, Arc::new(|_slot: i32| {}));
        registry.subscribe(PluginId(1), &ON_MAP_END, handler);
        registry.activate(PluginId(1));

        let report = registry.dispatch("OnClientVoice", &EventContext::new().with_arg("x"));
        assert_eq!(report.failed, 1);

        registry.dispatch("OnMapEnd", &EventContext::new());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removal_during_dispatch_takes_effect() {
        let registry = Arc::new(ListenerRegistry::new());
        let (count, handler) = counter();

        let r = registry.clone();
        registry.subscribe(PluginId(1), &ON_TICK, Arc::new(move || {
            r.remove_owned_by(PluginId(2));
        }));
        registry.subscribe(PluginId(2), &ON_TICK, handler);
        registry.activate(PluginId(1));
        registry.activate(PluginId(2));

        let report = registry.dispatch("OnTick", &EventContext::new());
        assert_eq!(report.invoked, 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(registry.handler_count("OnTick"), 1);
    }

    #[test]
    fn test_poisoned_table_still_subscribes() {
        let registry = Arc::new(ListenerRegistry::new());
        let r = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = r.table.write().unwrap();
            panic!("poison the table");
        })
        .join();
        assert!(registry.table.is_poisoned());

        let (count, handler) = counter();
        let id = registry.subscribe(PluginId(1), &ON_TICK, handler);
        registry.activate(PluginId(1));
        registry.dispatch("OnTick", &EventContext::new());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.unsubscribe(id));
    }

    #[test]
    fn test_unsubscribe_and_remove_owned() {
        let registry = ListenerRegistry::new();
        let (_, a) = counter();
        let (_, b) = counter();
        let id = registry.subscribe(PluginId(1), &ON_TICK, a);
        registry.subscribe(PluginId(1), &ON_MAP_END, b);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert_eq!(registry.remove_owned_by(PluginId(1)), 1);
        assert_eq!(registry.handler_count("OnMapEnd"), 0);
    }
}
