//! Effect definitions
//!
//! An [`Effect`] is an opaque, strongly-typed token naming an abstract
//! operation with payload `P` and result `R`. Tokens are minted by
//! [`Effect::define`]; every definition gets a fresh identity, so two
//! unrelated operations can never end up sharing handlers by accident, even
//! when they are given the same name.
//!
//! # Example
//!
//! ```
//! use aura_effects::{Effect, HandlerScope};
//!
//! # futures::executor::block_on(async {
//! let greet: Effect<String, String> = Effect::define("greet");
//! let _scope = HandlerScope::new([greet
//!     .terminal(|name: String| async move { Ok(format!("hello {name}")) })
//!     .into()]);
//!
//! assert_eq!(greet.perform("bob".into()).await.unwrap(), "hello bob");
//! # });
//! ```

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context;
use crate::error::{EffectError, Result};
use crate::handler::{Handler, Step};

static NEXT_EFFECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an effect.
///
/// Equality and hashing use the numeric identity only; the name is carried
/// for diagnostics.
#[derive(Clone)]
pub struct EffectId {
    seq: u64,
    name: Arc<str>,
}

impl EffectId {
    fn fresh(name: &str) -> Self {
        Self {
            seq: NEXT_EFFECT_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name),
        }
    }

    /// The name the effect was defined with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The numeric identity, unique for the lifetime of the process.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl PartialEq for EffectId {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for EffectId {}

impl Hash for EffectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.seq.hash(state);
    }
}

impl fmt::Debug for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.seq)
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A typed handle to an abstract operation taking `P` and producing `R`.
pub struct Effect<P, R> {
    id: EffectId,
    _signature: PhantomData<fn(P) -> R>,
}

impl<P, R> Clone for Effect<P, R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _signature: PhantomData,
        }
    }
}

impl<P, R> fmt::Debug for Effect<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.id).finish()
    }
}

impl<P, R> Effect<P, R> {
    /// Define a new effect. The name is used in logs and error messages.
    pub fn define(name: impl AsRef<str>) -> Self {
        Self {
            id: EffectId::fresh(name.as_ref()),
            _signature: PhantomData,
        }
    }

    /// Identity used to key handlers.
    pub fn id(&self) -> &EffectId {
        &self.id
    }

    /// The name given at definition.
    pub fn name(&self) -> &str {
        self.id.name()
    }
}

impl<P, R> Effect<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Perform the effect against the innermost active scope.
    ///
    /// # Errors
    ///
    /// - [`EffectError::NoActiveScope`] outside any scope.
    /// - [`EffectError::Unhandled`] when nothing in the scope chain handles
    ///   this effect.
    /// - [`EffectError::NoTerminalHandler`] when every registered handler
    ///   declined.
    /// - Whatever a handler itself fails with.
    pub async fn perform(&self, payload: P) -> Result<R> {
        let top = context::current_scope().ok_or(EffectError::NoActiveScope)?;
        top.resolve(self, payload).await
    }

    /// Wrap a partial handler: it may resolve the effect or decline with
    /// [`Step::Continue`], handing a (possibly transformed) payload on.
    pub fn handler<F, Fut>(&self, f: F) -> Handler<P, R>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Step<P, R>>> + Send + 'static,
    {
        Handler::from_fn(self.id.clone(), f)
    }

    /// Wrap a total handler that always produces a result.
    pub fn terminal<F, Fut>(&self, f: F) -> Handler<P, R>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Handler::from_fn(self.id.clone(), move |payload| {
            let fut = f(payload);
            async move { fut.await.map(Step::Resolved) }
        })
    }
}
