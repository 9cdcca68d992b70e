//! Effect context: the active-scope stack
//!
//! Every unit of work sees a stack of live [`HandlerScope`]s; effects resolve
//! against its top. The stack lives in tokio task-local storage inside a
//! context region. Outside any region each tokio task gets a default stack of
//! its own, and code running outside a task falls back to a per-thread stack.
//!
//! Regions are entered by [`isolate`], [`detach`], [`Snapshot::restore`] and
//! [`Snapshot::run`]. Futures joined within one task share that task's stack;
//! ones that create their own scopes should each run in their own region,
//! otherwise they observe each other's scopes across awaits.
//!
//! Work that leaves the current task (a spawned task, a timer callback)
//! does not carry the region with it. Capture a [`Snapshot`] before handing
//! the work off and restore it on the other side:
//!
//! ```
//! use aura_effects::{context, Effect, HandlerScope, Snapshot};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let tick: Effect<(), u32> = Effect::define("tick");
//! context::detach(async {
//!     let _scope = HandlerScope::new([tick.terminal(|()| async { Ok(7) }).into()]);
//!     let snapshot = Snapshot::capture();
//!     let tick = tick.clone();
//!     let deferred = tokio::spawn(async move { snapshot.restore(tick.perform(())).await });
//!     assert_eq!(deferred.await.unwrap().unwrap().unwrap(), 7);
//! })
//! .await;
//! # }
//! ```
//!
//! [`HandlerScope`]: crate::HandlerScope

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tokio::task;
use tracing::{trace, warn};

use crate::error::{EffectError, Result};
use crate::handler::AnyHandler;
use crate::scope::ScopeInner;

tokio::task_local! {
    static ACTIVE: RefCell<ScopeStack>;
    static SUSPENDED: Vec<u64>;
}

thread_local! {
    static DEFAULT_STACK: RefCell<ScopeStack> = RefCell::new(ScopeStack::default());
}

/// Default stacks of tokio tasks running outside any region. A task's entry
/// goes away once its stack is empty.
fn task_stacks() -> &'static Mutex<HashMap<task::Id, ScopeStack>> {
    static STACKS: OnceLock<Mutex<HashMap<task::Id, ScopeStack>>> = OnceLock::new();
    STACKS.get_or_init(Default::default)
}

fn lock_task_stacks() -> std::sync::MutexGuard<'static, HashMap<task::Id, ScopeStack>> {
    task_stacks().lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live scopes, bottom first. Read bottom to top it mirrors the parent
/// chain of the top scope.
#[derive(Clone, Default)]
pub(crate) struct ScopeStack {
    scopes: Vec<Arc<ScopeInner>>,
}

impl ScopeStack {
    fn top(&mut self) -> Option<Arc<ScopeInner>> {
        // Scopes disposed from another thread or region may linger here.
        while let Some(top) = self.scopes.last() {
            if top.is_disposed() {
                self.scopes.pop();
            } else {
                return Some(Arc::clone(top));
            }
        }
        None
    }

    /// Take `scope` off the stack, along with the scopes above it that were
    /// nested under it. Returns what was taken off, or `None` if `scope` is
    /// not on this stack.
    fn remove(&mut self, scope: &Arc<ScopeInner>) -> Option<Vec<Arc<ScopeInner>>> {
        let position = self.scopes.iter().rposition(|s| Arc::ptr_eq(s, scope))?;
        let above = self.scopes.split_off(position + 1);
        let mut removed = self.scopes.split_off(position);
        let (nested, unrelated): (Vec<_>, Vec<_>) =
            above.into_iter().partition(|s| s.descends_from(scope));
        let nested_count = nested.len();
        if nested_count > 0 {
            warn!(
                scope = scope.seq(),
                nested = nested_count,
                "scope disposed out of nesting order; dropping its inner scopes from the stack"
            );
        }
        self.scopes.extend(unrelated);
        removed.extend(nested);
        Some(removed)
    }
}

fn with_stack<T>(f: impl FnOnce(&mut ScopeStack) -> T) -> T {
    if ACTIVE.try_with(|_| ()).is_ok() {
        ACTIVE.with(|stack| f(&mut stack.borrow_mut()))
    } else if let Some(id) = task::try_id() {
        // Taken out while `f` runs so the lock is never held across it.
        let mut stack = lock_task_stacks().remove(&id).unwrap_or_default();
        let out = f(&mut stack);
        if !stack.scopes.is_empty() {
            lock_task_stacks().insert(id, stack);
        }
        out
    } else {
        DEFAULT_STACK.with(|stack| f(&mut stack.borrow_mut()))
    }
}

pub(crate) fn current_scope() -> Option<Arc<ScopeInner>> {
    with_stack(ScopeStack::top)
}

pub(crate) fn push(scope: Arc<ScopeInner>) {
    with_stack(|stack| stack.scopes.push(scope));
}

/// Remove a disposed scope, and the scopes nested under it, from the active
/// stack. A scope disposed away from the task that created it is looked up in
/// the other tasks' default stacks too.
pub(crate) fn remove(scope: &Arc<ScopeInner>) {
    // Removed scopes are dropped only after the stack is released.
    let removed = with_stack(|stack| stack.remove(scope)).or_else(|| {
        let mut stacks = lock_task_stacks();
        let removed = stacks.values_mut().find_map(|stack| stack.remove(scope));
        stacks.retain(|_, stack| !stack.scopes.is_empty());
        removed
    });
    drop(removed);
}

/// Number of scopes on the active stack.
pub fn depth() -> usize {
    with_stack(|stack| stack.scopes.len())
}

/// Whether effects performed here have a scope to resolve against.
pub fn has_active_scope() -> bool {
    current_scope().is_some()
}

/// Register handlers into whatever scope is currently active.
///
/// New handlers take priority over anything that scope already had for the
/// same effect.
///
/// # Errors
///
/// Returns [`EffectError::NoActiveScope`] outside any scope.
pub fn add_handlers(handlers: impl IntoIterator<Item = AnyHandler>) -> Result<()> {
    let scope = current_scope().ok_or(EffectError::NoActiveScope)?;
    scope.register(handlers.into_iter().collect());
    Ok(())
}

/// Run `fut` in its own region, starting from a copy of the current stack.
///
/// Scopes `fut` creates are visible only to itself.
pub async fn isolate<F: Future>(fut: F) -> F::Output {
    let stack = with_stack(|stack| stack.clone());
    ACTIVE.scope(RefCell::new(stack), fut).await
}

/// Run `fut` in its own region, starting from an empty stack.
pub async fn detach<F: Future>(fut: F) -> F::Output {
    ACTIVE.scope(RefCell::new(ScopeStack::default()), fut).await
}

pub(crate) fn is_suspended(guard: u64) -> bool {
    SUSPENDED
        .try_with(|suspended| suspended.contains(&guard))
        .unwrap_or(false)
}

/// Run `fut` with `guard` marked as suspended for everything it awaits.
pub(crate) async fn suspend<F: Future>(guard: u64, fut: F) -> F::Output {
    let mut suspended = SUSPENDED.try_with(|s| s.clone()).unwrap_or_default();
    suspended.push(guard);
    SUSPENDED.scope(suspended, fut).await
}

/// A captured active-scope stack.
///
/// Holds the scopes by weak reference: keeping a snapshot does not keep its
/// scopes alive, and restoring one after its scopes are disposed fails.
#[derive(Clone, Default)]
pub struct Snapshot {
    scopes: Vec<Weak<ScopeInner>>,
}

impl Snapshot {
    /// Capture the current active stack.
    pub fn capture() -> Self {
        let scopes = with_stack(|stack| stack.scopes.iter().map(Arc::downgrade).collect());
        Self { scopes }
    }

    /// Number of scopes captured.
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Whether nothing was active at capture time.
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Whether every captured scope is still alive and not disposed.
    pub fn is_live(&self) -> bool {
        self.upgrade().is_ok()
    }

    fn upgrade(&self) -> Result<ScopeStack> {
        let scopes = self
            .scopes
            .iter()
            .map(|scope| scope.upgrade().filter(|scope| !scope.is_disposed()))
            .collect::<Option<Vec<_>>>()
            .ok_or(EffectError::StaleSnapshot)?;
        Ok(ScopeStack { scopes })
    }

    /// Run `fut` with the captured stack reinstated as the active stack.
    ///
    /// Whatever stack was active before is back in force once `fut`
    /// completes; scopes created inside `fut` do not leak out.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::StaleSnapshot`] if a captured scope has been
    /// disposed. `fut` is not run in that case.
    pub async fn restore<F: Future>(&self, fut: F) -> Result<F::Output> {
        let stack = self.upgrade()?;
        trace!(depth = stack.scopes.len(), "restoring snapshot");
        Ok(ACTIVE.scope(RefCell::new(stack), fut).await)
    }

    /// Synchronous counterpart of [`restore`](Self::restore).
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::StaleSnapshot`] if a captured scope has been
    /// disposed.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        let stack = self.upgrade()?;
        Ok(ACTIVE.sync_scope(RefCell::new(stack), f))
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("depth", &self.scopes.len())
            .field("live", &self.is_live())
            .finish()
    }
}
