//! Handler scopes
//!
//! A [`HandlerScope`] owns a map from effect to one composed handler, plus
//! the callbacks that tear it down. Scopes nest: each one keeps a weak link
//! to the scope that was active when it was created and delegates to it.
//!
//! Resolution of an effect at a scope:
//!
//! 1. If the scope has a handler for the effect, run it. A resolved value is
//!    returned; a refusal escalates to the parent with the forwarded payload.
//! 2. Otherwise delegate to the parent unchanged.
//! 3. With no parent left, fail with [`EffectError::NoTerminalHandler`] if
//!    any scope on the way had a handler, or [`EffectError::Unhandled`] if
//!    none did.
//!
//! Registration, disposal and effect resolution may interleave across
//! awaits, but structural changes to a scope (adding handlers, disposing)
//! should happen while nothing is resolving against it. Handlers are cloned
//! out of the map before they run, so a registration made mid-resolution only
//! affects later resolutions.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, trace, warn};

use crate::context;
use crate::dispose::{self, AsyncDispose, DisposeCallback};
use crate::effect::{Effect, EffectId};
use crate::error::{EffectError, Result};
use crate::handler::{AnyHandler, CleanupHook, ErasedHandler, Handler, Step};
use crate::plugin::Plugin;

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Something a scope can be built from: a plugin or a loose handler.
#[derive(Debug)]
pub enum ScopeEntry {
    /// A bundle of handlers with an optional dispose hook.
    Plugin(Plugin),
    /// A single handler.
    Handler(AnyHandler),
}

impl From<Plugin> for ScopeEntry {
    fn from(plugin: Plugin) -> Self {
        ScopeEntry::Plugin(plugin)
    }
}

impl From<AnyHandler> for ScopeEntry {
    fn from(handler: AnyHandler) -> Self {
        ScopeEntry::Handler(handler)
    }
}

impl<P, R> From<Handler<P, R>> for ScopeEntry
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn from(handler: Handler<P, R>) -> Self {
        ScopeEntry::Handler(handler.into())
    }
}

pub(crate) struct ScopeInner {
    seq: u64,
    depth: usize,
    parent: Option<Weak<ScopeInner>>,
    handlers: RwLock<HashMap<EffectId, Box<dyn ErasedHandler>>>,
    callbacks: Mutex<Vec<DisposeCallback>>,
    disposed: AtomicBool,
}

impl ScopeInner {
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether `ancestor` is on this scope's parent chain.
    pub(crate) fn descends_from(&self, ancestor: &Arc<ScopeInner>) -> bool {
        let mut next = self.parent.clone();
        while let Some(parent) = next {
            if std::ptr::eq(parent.as_ptr(), Arc::as_ptr(ancestor)) {
                return true;
            }
            next = match parent.upgrade() {
                Some(parent) => parent.parent.clone(),
                None => return false,
            };
        }
        false
    }

    fn lookup<P, R>(&self, id: &EffectId) -> Result<Option<Handler<P, R>>>
    where
        P: Send + 'static,
        R: Send + 'static,
    {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        match handlers.get(id) {
            None => Ok(None),
            Some(handler) => handler
                .as_any()
                .downcast_ref::<Handler<P, R>>()
                .cloned()
                .map(Some)
                .ok_or_else(|| EffectError::SignatureMismatch(id.clone())),
        }
    }

    fn parent(&self, id: &EffectId) -> Result<Option<Arc<ScopeInner>>> {
        match &self.parent {
            None => Ok(None),
            Some(parent) => parent
                .upgrade()
                .map(Some)
                .ok_or_else(|| EffectError::ScopeReleased(id.clone())),
        }
    }

    /// Resolve `effect` starting at this scope and climbing the parent chain.
    pub(crate) async fn resolve<P, R>(
        self: Arc<Self>,
        effect: &Effect<P, R>,
        payload: P,
    ) -> Result<R>
    where
        P: Send + 'static,
        R: Send + 'static,
    {
        let id = effect.id();
        let mut scope = self;
        let mut payload = payload;
        let mut claimed = false;
        loop {
            if let Some(handler) = scope.lookup::<P, R>(id)? {
                claimed = true;
                trace!(effect = %id, scope = scope.seq, depth = scope.depth, "running handler");
                match handler.run(payload).await? {
                    Step::Resolved(value) => return Ok(value),
                    Step::Continue(forwarded) => payload = forwarded,
                }
                trace!(effect = %id, scope = scope.seq, "handler chain declined");
            }
            scope = match scope.parent(id)? {
                Some(parent) => parent,
                None => break,
            };
        }
        if claimed {
            Err(EffectError::NoTerminalHandler(id.clone()))
        } else {
            Err(EffectError::Unhandled(id.clone()))
        }
    }

    /// Fold new handlers in front of whatever the scope already has.
    ///
    /// Handlers for the same effect keep their relative order: the first one
    /// listed gets first refusal, the previous registration goes last.
    pub(crate) fn register(&self, handlers: Vec<AnyHandler>) {
        let mut groups: Vec<(EffectId, Vec<Box<dyn ErasedHandler>>)> = Vec::new();
        let mut hooks: Vec<CleanupHook> = Vec::new();
        for AnyHandler(mut handler) in handlers {
            hooks.extend(handler.take_cleanups());
            let id = handler.effect().clone();
            match groups.iter_mut().find(|(group, _)| *group == id) {
                Some((_, group)) => group.push(handler),
                None => groups.push((id, vec![handler])),
            }
        }

        if self.is_disposed() {
            warn!(scope = self.seq, "handlers registered on a disposed scope are discarded");
            hooks.iter().for_each(CleanupHook::run);
            return;
        }

        {
            let mut map = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
            for (id, group) in groups {
                let composed = group
                    .into_iter()
                    .rev()
                    .fold(map.remove(&id), |fallback, handler| {
                        Some(match fallback {
                            Some(fallback) => handler.layer_over(fallback),
                            None => handler,
                        })
                    });
                if let Some(composed) = composed {
                    trace!(effect = %id, scope = self.seq, "registered handlers");
                    map.insert(id, composed);
                }
            }
        }

        for hook in hooks {
            self.push_callback(DisposeCallback::sync(move || {
                hook.run();
                Ok(())
            }));
        }
    }

    fn push_callback(&self, callback: DisposeCallback) {
        if self.is_disposed() {
            // Too late to defer: run it right away.
            if let Err(e) = dispose::run_blocking(vec![callback]) {
                warn!(scope = self.seq, error = %e, "dispose callback on a disposed scope failed");
            }
            return;
        }
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Mark disposed, leave the active stack, and hand back the callbacks.
    /// Returns `None` if the scope was already disposed.
    fn begin_dispose(self: &Arc<Self>) -> Option<Vec<DisposeCallback>> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        context::remove(self);
        let callbacks = std::mem::take(
            &mut *self
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        debug!(scope = self.seq, callbacks = callbacks.len(), "disposing scope");
        Some(callbacks)
    }

    fn finish_dispose(&self) {
        let handlers = std::mem::take(
            &mut *self
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        drop(handlers);
        debug!(scope = self.seq, "scope disposed");
    }
}

/// A disposable registry of handlers, nested under the scope that was active
/// when it was created.
///
/// Creating a scope makes it the active scope; disposing it (explicitly or by
/// dropping it) removes it again. Scopes must be disposed in reverse order of
/// creation.
pub struct HandlerScope {
    inner: Arc<ScopeInner>,
}

impl HandlerScope {
    /// Create a scope from plugins and loose handlers and make it active.
    ///
    /// All handlers are folded once per effect, in the order given: earlier
    /// entries get first refusal. Plugin dispose hooks and handler cleanup
    /// hooks become dispose callbacks of the scope.
    pub fn new(entries: impl IntoIterator<Item = ScopeEntry>) -> Self {
        let parent = context::current_scope();
        let depth = parent.as_ref().map_or(0, |parent| parent.depth + 1);
        let inner = Arc::new(ScopeInner {
            seq: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            depth,
            parent: parent.as_ref().map(Arc::downgrade),
            handlers: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        let mut handlers = Vec::new();
        let mut hooks = Vec::new();
        for entry in entries {
            match entry {
                ScopeEntry::Handler(handler) => handlers.push(handler),
                ScopeEntry::Plugin(plugin) => {
                    let (name, plugin_handlers, on_dispose) = plugin.into_parts();
                    debug!(
                        scope = inner.seq,
                        plugin = %name,
                        handlers = plugin_handlers.len(),
                        "absorbing plugin"
                    );
                    handlers.extend(plugin_handlers);
                    hooks.extend(on_dispose);
                }
            }
        }
        inner.register(handlers);
        for hook in hooks {
            inner.push_callback(hook);
        }

        debug!(scope = inner.seq, depth, "scope created");
        context::push(Arc::clone(&inner));
        Self { inner }
    }

    /// An empty scope, nested under the current one.
    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    /// Register more handlers; they take priority over existing ones for the
    /// same effect.
    pub fn add_handlers(&self, handlers: impl IntoIterator<Item = AnyHandler>) {
        self.inner.register(handlers.into_iter().collect());
    }

    /// Register a teardown callback, run when the scope disposes.
    pub fn on_dispose(&self, f: impl FnOnce() -> anyhow::Result<()> + Send + 'static) {
        self.inner.push_callback(DisposeCallback::sync(f));
    }

    /// Register an asynchronous teardown callback.
    pub fn on_dispose_async<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.push_callback(DisposeCallback::from_async(f));
    }

    /// Tie a resource's asynchronous shutdown to this scope.
    pub fn adopt<D: AsyncDispose + 'static>(&self, resource: D) {
        self.on_dispose_async(move || async move {
            let mut resource = resource;
            resource.dispose().await
        });
    }

    /// Whether the scope has a handler for `effect` itself, ignoring parents.
    pub fn contains<P, R>(&self, effect: &Effect<P, R>) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(effect.id())
    }

    /// Whether the scope has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Whether the scope was created under another scope that is still alive.
    pub fn has_parent(&self) -> bool {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|parent| !parent.is_disposed())
    }

    /// Nesting depth; a scope created with no active scope has depth 0.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    /// Dispose synchronously.
    ///
    /// Leaves the active stack, runs dispose callbacks newest first, then
    /// releases the handler map. Disposing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::Dispose`] with every callback failure once
    /// teardown has completed.
    pub fn dispose(&self) -> Result<()> {
        let Some(callbacks) = self.inner.begin_dispose() else {
            return Ok(());
        };
        let outcome = dispose::run_blocking(callbacks);
        self.inner.finish_dispose();
        outcome.map_err(EffectError::from)
    }

    /// Dispose, awaiting asynchronous callbacks in sequence.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::Dispose`] with every callback failure once
    /// teardown has completed.
    pub async fn dispose_async(&self) -> Result<()> {
        let Some(callbacks) = self.inner.begin_dispose() else {
            return Ok(());
        };
        let outcome = dispose::run_async(callbacks).await;
        self.inner.finish_dispose();
        outcome.map_err(EffectError::from)
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        if self.inner.is_disposed() {
            return;
        }
        if let Err(e) = self.dispose() {
            warn!(scope = self.inner.seq, error = %e, "scope teardown failed on drop");
        }
    }
}

impl fmt::Debug for HandlerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let effects = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("HandlerScope")
            .field("seq", &self.inner.seq)
            .field("depth", &self.inner.depth)
            .field("effects", &effects)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_becomes_active_and_leaves_on_drop() {
        context::detach(async {
            assert_eq!(context::depth(), 0);
            let outer = HandlerScope::empty();
            {
                let inner = HandlerScope::empty();
                assert_eq!(inner.depth(), 1);
                assert_eq!(context::depth(), 2);
            }
            assert_eq!(context::depth(), 1);
            drop(outer);
            assert!(!context::has_active_scope());
        })
        .await;
    }

    #[tokio::test]
    async fn out_of_order_disposal_drops_nested_scopes() {
        context::detach(async {
            let outer = HandlerScope::empty();
            let inner = HandlerScope::empty();
            outer.dispose().unwrap();
            assert_eq!(context::depth(), 0);
            assert!(!inner.is_disposed());
        })
        .await;
    }

    #[tokio::test]
    async fn contains_ignores_parents() {
        let effect: Effect<(), ()> = Effect::define("ping");
        context::detach(async {
            let parent = HandlerScope::new([effect.terminal(|()| async { Ok(()) }).into()]);
            let child = HandlerScope::empty();
            assert!(parent.contains(&effect));
            assert!(!child.contains(&effect));
        })
        .await;
    }
}
