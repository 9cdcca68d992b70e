//! Handlers and their composition algebra
//!
//! A [`Handler`] is a possibly partial, asynchronous interpretation of one
//! effect. Running it yields either a final value ([`Step::Resolved`]) or a
//! refusal that hands a (possibly transformed) payload to whatever comes next
//! ([`Step::Continue`]).
//!
//! Handlers compose:
//!
//! - [`Handler::flat_map`] sequences two handlers: the second only runs when
//!   the first declines, and receives the payload the first forwarded.
//! - [`Handler::fold`] reduces a list left to right with `flat_map`. The
//!   first element gets first refusal; the operation is not commutative.
//!
//! Two modifiers change how a handler takes part in resolution:
//!
//! - [`Handler::non_reentrant`]: while the handler runs, performing the same
//!   effect from inside its own execution skips it, reaching its fallback.
//! - [`Handler::once`]: the handler is consumed by its first successful
//!   match and is transparent from then on.
//!
//! A handler that steps aside behaves exactly like one that declines with the
//! payload unchanged, so guarded handlers compose like any other.

use async_recursion::async_recursion;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::context;
use crate::effect::EffectId;
use crate::error::Result;

static NEXT_GUARD: AtomicU64 = AtomicU64::new(1);

/// Outcome of running a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<P, R> {
    /// A final result for the caller.
    Resolved(R),
    /// The handler declines; the next candidate receives this payload.
    Continue(P),
}

impl<P, R> Step<P, R> {
    /// Whether this is a final result.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Step::Resolved(_))
    }

    /// Map the resolved value, leaving a refusal untouched.
    pub fn map<T>(self, f: impl FnOnce(R) -> T) -> Step<P, T> {
        match self {
            Step::Resolved(value) => Step::Resolved(f(value)),
            Step::Continue(payload) => Step::Continue(payload),
        }
    }
}

type HandlerFn<P, R> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<Step<P, R>>> + Send + Sync>;

enum Node<P, R> {
    Leaf(HandlerFn<P, R>),
    Then(Arc<Node<P, R>>, Arc<Node<P, R>>),
    Once {
        inner: Arc<Node<P, R>>,
        claimed: AtomicBool,
    },
    NonReentrant {
        inner: Arc<Node<P, R>>,
        guard: u64,
    },
}

#[async_recursion]
async fn run_node<P, R>(node: Arc<Node<P, R>>, payload: P) -> Result<Step<P, R>>
where
    P: Send + 'static,
    R: Send + 'static,
{
    match node.as_ref() {
        Node::Leaf(f) => (f.as_ref())(payload).await,
        Node::Then(first, next) => match run_node(Arc::clone(first), payload).await? {
            Step::Continue(payload) => run_node(Arc::clone(next), payload).await,
            resolved => Ok(resolved),
        },
        Node::Once { inner, claimed } => {
            // Claimed while in flight, released again unless it resolves.
            if claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(Step::Continue(payload));
            }
            let outcome = run_node(Arc::clone(inner), payload).await;
            if !matches!(outcome, Ok(Step::Resolved(_))) {
                claimed.store(false, Ordering::Release);
            }
            outcome
        }
        Node::NonReentrant { inner, guard } => {
            if context::is_suspended(*guard) {
                return Ok(Step::Continue(payload));
            }
            context::suspend(*guard, run_node(Arc::clone(inner), payload)).await
        }
    }
}

type CleanupFn = Box<dyn FnOnce() + Send>;

/// A cleanup hook shared by every clone of the handler that declared it.
/// It runs at most once.
#[derive(Clone)]
pub(crate) struct CleanupHook(Arc<Mutex<Option<CleanupFn>>>);

impl CleanupHook {
    fn new(f: CleanupFn) -> Self {
        Self(Arc::new(Mutex::new(Some(f))))
    }

    pub(crate) fn run(&self) {
        let hook = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// A composed, immutable interpretation of one effect.
pub struct Handler<P, R> {
    effect: EffectId,
    node: Arc<Node<P, R>>,
    cleanups: Vec<CleanupHook>,
}

impl<P, R> Clone for Handler<P, R> {
    fn clone(&self) -> Self {
        Self {
            effect: self.effect.clone(),
            node: Arc::clone(&self.node),
            cleanups: self.cleanups.clone(),
        }
    }
}

impl<P, R> fmt::Debug for Handler<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("effect", &self.effect)
            .field("cleanups", &self.cleanups.len())
            .finish()
    }
}

impl<P, R> Handler<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn from_fn<F, Fut>(effect: EffectId, f: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Step<P, R>>> + Send + 'static,
    {
        let run: HandlerFn<P, R> = Arc::new(move |payload| f(payload).boxed());
        Self {
            effect,
            node: Arc::new(Node::Leaf(run)),
            cleanups: Vec::new(),
        }
    }

    /// The effect this handler interprets.
    pub fn effect(&self) -> &EffectId {
        &self.effect
    }

    /// Run the handler on a payload.
    pub fn run(&self, payload: P) -> BoxFuture<'static, Result<Step<P, R>>> {
        run_node(Arc::clone(&self.node), payload)
    }

    /// Run `self`; if it declines, feed the forwarded payload into `next`.
    ///
    /// # Panics
    ///
    /// Panics if `next` handles a different effect.
    pub fn flat_map(mut self, next: Handler<P, R>) -> Self {
        assert_eq!(
            self.effect, next.effect,
            "cannot sequence handlers of different effects"
        );
        self.node = Arc::new(Node::Then(self.node, next.node));
        self.cleanups.extend(next.cleanups);
        self
    }

    /// Fold handlers left to right with [`flat_map`](Self::flat_map).
    ///
    /// # Panics
    ///
    /// Panics if the list is empty or the handlers do not all share one
    /// effect.
    pub fn fold(handlers: impl IntoIterator<Item = Handler<P, R>>) -> Self {
        let mut handlers = handlers.into_iter();
        let first = match handlers.next() {
            Some(first) => first,
            None => panic!("cannot fold an empty list of handlers"),
        };
        handlers.fold(first, Handler::flat_map)
    }

    /// Make the handler one-shot: it is consumed by its first successful
    /// match and falls through afterwards.
    pub fn once(mut self) -> Self {
        self.node = Arc::new(Node::Once {
            inner: self.node,
            claimed: AtomicBool::new(false),
        });
        self
    }

    /// Make the handler non-reentrant: performing the same effect from inside
    /// its own execution skips it and reaches its fallback.
    pub fn non_reentrant(mut self) -> Self {
        self.node = Arc::new(Node::NonReentrant {
            inner: self.node,
            guard: NEXT_GUARD.fetch_add(1, Ordering::Relaxed),
        });
        self
    }

    /// Attach a hook that runs when the scope owning this handler disposes.
    pub fn on_cleanup(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.cleanups.push(CleanupHook::new(Box::new(f)));
        self
    }

    /// Wrap the handler in middleware.
    ///
    /// `f` receives the wrapped handler and the payload, and decides whether,
    /// when and how to run it. Cleanup hooks carry over to the result.
    pub fn decorate<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Handler<P, R>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Step<P, R>>> + Send + 'static,
    {
        let (inner, cleanups) = self.split_cleanups();
        let effect = inner.effect.clone();
        let mut outer = Handler::from_fn(effect, move |payload| f(inner.clone(), payload));
        outer.cleanups = cleanups;
        outer
    }

    pub(crate) fn split_cleanups(mut self) -> (Self, Vec<CleanupHook>) {
        let cleanups = std::mem::take(&mut self.cleanups);
        (self, cleanups)
    }
}

/// Type-erased handler, as stored in a scope's handler map.
pub(crate) trait ErasedHandler: Send + Sync {
    fn effect(&self) -> &EffectId;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    /// Compose `[self, fallback]`: `self` gets first refusal.
    fn layer_over(self: Box<Self>, fallback: Box<dyn ErasedHandler>) -> Box<dyn ErasedHandler>;

    fn take_cleanups(&mut self) -> Vec<CleanupHook>;
}

impl<P, R> ErasedHandler for Handler<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn effect(&self) -> &EffectId {
        &self.effect
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn layer_over(self: Box<Self>, fallback: Box<dyn ErasedHandler>) -> Box<dyn ErasedHandler> {
        let effect = self.effect.clone();
        match fallback.into_any().downcast::<Handler<P, R>>() {
            Ok(fallback) => Box::new((*self).flat_map(*fallback)),
            Err(_) => panic!("handlers registered for {effect:?} have different signatures"),
        }
    }

    fn take_cleanups(&mut self) -> Vec<CleanupHook> {
        std::mem::take(&mut self.cleanups)
    }
}

/// A handler for any effect, ready to be registered in a scope.
pub struct AnyHandler(pub(crate) Box<dyn ErasedHandler>);

impl AnyHandler {
    /// The effect this handler is for.
    pub fn effect(&self) -> &EffectId {
        self.0.effect()
    }
}

impl fmt::Debug for AnyHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AnyHandler").field(self.effect()).finish()
    }
}

impl<P, R> From<Handler<P, R>> for AnyHandler
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn from(handler: Handler<P, R>) -> Self {
        AnyHandler(Box::new(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use std::sync::atomic::AtomicUsize;

    type Trail = Vec<&'static str>;

    fn labelled(
        effect: &Effect<Trail, String>,
        label: &'static str,
        resolve: bool,
    ) -> Handler<Trail, String> {
        effect.handler(move |mut trail: Trail| async move {
            trail.push(label);
            if resolve {
                Ok(Step::Resolved(trail.join(",")))
            } else {
                Ok(Step::Continue(trail))
            }
        })
    }

    #[tokio::test]
    async fn flat_map_forwards_the_declined_payload() {
        let effect: Effect<Trail, String> = Effect::define("trail");
        let handler = labelled(&effect, "a", false).flat_map(labelled(&effect, "b", true));
        let step = handler.run(vec![]).await.unwrap();
        assert_eq!(step, Step::Resolved("a,b".to_string()));
    }

    #[tokio::test]
    async fn fold_gives_first_refusal_to_the_head() {
        let effect: Effect<Trail, String> = Effect::define("trail");
        let handler = Handler::fold([
            labelled(&effect, "a", false),
            labelled(&effect, "b", true),
            labelled(&effect, "c", true),
        ]);
        assert_eq!(
            handler.run(vec![]).await.unwrap(),
            Step::Resolved("a,b".to_string())
        );
    }

    #[tokio::test]
    async fn fully_declining_fold_continues() {
        let effect: Effect<Trail, String> = Effect::define("trail");
        let handler = Handler::fold([labelled(&effect, "a", false), labelled(&effect, "b", false)]);
        assert_eq!(
            handler.run(vec![]).await.unwrap(),
            Step::Continue(vec!["a", "b"])
        );
    }

    #[tokio::test]
    async fn once_is_consumed_only_by_a_resolution() {
        let effect: Effect<bool, &'static str> = Effect::define("flip");
        let handler = effect
            .handler(|resolve: bool| async move {
                Ok(if resolve {
                    Step::Resolved("once")
                } else {
                    Step::Continue(resolve)
                })
            })
            .once();

        assert_eq!(handler.run(false).await.unwrap(), Step::Continue(false));
        assert_eq!(handler.run(true).await.unwrap(), Step::Resolved("once"));
        assert_eq!(handler.run(true).await.unwrap(), Step::Continue(true));
    }

    #[test]
    fn cleanup_hook_runs_once_across_clones() {
        let effect: Effect<(), ()> = Effect::define("noop");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = effect
            .terminal(|()| async { Ok(()) })
            .on_cleanup(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let copy = handler.clone();

        let (_, hooks) = handler.split_cleanups();
        let (_, copied) = copy.split_cleanups();
        hooks.iter().chain(copied.iter()).for_each(CleanupHook::run);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "different effects")]
    fn folding_mismatched_effects_panics() {
        let a: Effect<(), ()> = Effect::define("a");
        let b: Effect<(), ()> = Effect::define("b");
        let _ = Handler::fold([
            a.terminal(|()| async { Ok(()) }),
            b.terminal(|()| async { Ok(()) }),
        ]);
    }

    #[test]
    #[should_panic(expected = "empty list")]
    fn folding_nothing_panics() {
        let _ = Handler::<(), ()>::fold(Vec::new());
    }
}
