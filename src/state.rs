//! Scoped state cells
//!
//! [`create_state`] gives a unit of work a private mutable value, exposed as
//! three effects registered into the scope active when the cell is created.
//! Concurrent operations that each create their own cell (even under the same
//! key) never see each other's writes, unlike a variable captured by a shared
//! closure.
//!
//! ```
//! use aura_effects::{context, create_state, HandlerScope};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> aura_effects::Result<()> {
//! context::detach(async {
//!     let _scope = HandlerScope::empty();
//!     let hits = create_state("hits", 0u32)?;
//!     hits.update(|n| n + 1).await?;
//!     assert_eq!(hits.get().await?, 1);
//!     Ok::<_, aura_effects::EffectError>(())
//! })
//! .await
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;
use uuid::Uuid;

use crate::context;
use crate::effect::Effect;
use crate::error::Result;

/// Transformation applied by [`State::update`].
pub type Updater<T> = Box<dyn FnOnce(T) -> T + Send>;

/// Handle to a scoped state cell.
///
/// Every operation performs one of the cell's effects, so reads and writes
/// resolve through the scope chain like any other effect and can be
/// intercepted by handlers registered in nested scopes.
pub struct State<T> {
    key: String,
    get: Effect<(), T>,
    set: Effect<T, ()>,
    update: Effect<Updater<T>, T>,
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            get: self.get.clone(),
            set: self.set.clone(),
            update: self.update.clone(),
        }
    }
}

impl<T> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State").field("key", &self.key).finish()
    }
}

/// Create a cell holding `initial`, registered into the active scope.
///
/// The cell lives until that scope disposes.
///
/// # Errors
///
/// Returns [`EffectError::NoActiveScope`](crate::EffectError::NoActiveScope)
/// outside any scope.
pub fn create_state<T>(key: &str, initial: T) -> Result<State<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let key = format!("{key}:{}", Uuid::new_v4().simple());
    let cell = Arc::new(Mutex::new(initial));
    let state = State {
        get: Effect::define(format!("{key}.get")),
        set: Effect::define(format!("{key}.set")),
        update: Effect::define(format!("{key}.update")),
        key,
    };

    let get = {
        let cell = Arc::clone(&cell);
        state.get.terminal(move |()| {
            let value = cell.lock().unwrap_or_else(PoisonError::into_inner).clone();
            async move { Ok(value) }
        })
    };
    let set = {
        let cell = Arc::clone(&cell);
        state.set.terminal(move |value: T| {
            *cell.lock().unwrap_or_else(PoisonError::into_inner) = value;
            async { Ok(()) }
        })
    };
    let update = state.update.terminal(move |f: Updater<T>| {
        let mut slot = cell.lock().unwrap_or_else(PoisonError::into_inner);
        let next = f(slot.clone());
        *slot = next.clone();
        async move { Ok(next) }
    });

    context::add_handlers([get.into(), set.into(), update.into()])?;
    trace!(key = %state.key, "created state cell");
    Ok(state)
}

impl<T> State<T>
where
    T: Send + 'static,
{
    /// The unique key of this cell, including its suffix.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the current value.
    pub async fn get(&self) -> Result<T> {
        self.get.perform(()).await
    }

    /// Replace the value.
    pub async fn set(&self, value: T) -> Result<()> {
        self.set.perform(value).await
    }

    /// Replace the value with `f(current)` and return the new value.
    pub async fn update(&self, f: impl FnOnce(T) -> T + Send + 'static) -> Result<T> {
        self.update.perform(Box::new(f)).await
    }

    /// The effect behind [`get`](Self::get).
    pub fn get_effect(&self) -> &Effect<(), T> {
        &self.get
    }

    /// The effect behind [`set`](Self::set).
    pub fn set_effect(&self) -> &Effect<T, ()> {
        &self.set
    }

    /// The effect behind [`update`](Self::update).
    pub fn update_effect(&self) -> &Effect<Updater<T>, T> {
        &self.update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EffectError;
    use crate::scope::HandlerScope;

    #[tokio::test]
    async fn needs_an_active_scope() {
        let err = context::detach(async { create_state("orphan", 0u8) })
            .await
            .unwrap_err();
        assert!(matches!(err, EffectError::NoActiveScope));
    }

    #[tokio::test]
    async fn keys_are_unique_per_cell() {
        context::detach(async {
            let _scope = HandlerScope::empty();
            let a = create_state("counter", 0u8).unwrap();
            let b = create_state("counter", 0u8).unwrap();
            assert!(a.key().starts_with("counter:"));
            assert_ne!(a.key(), b.key());
        })
        .await;
    }

    #[tokio::test]
    async fn set_then_update() {
        context::detach(async {
            let _scope = HandlerScope::empty();
            let name = create_state("name", String::from("a")).unwrap();
            name.set("b".into()).await.unwrap();
            let next = name.update(|s| s + "c").await.unwrap();
            assert_eq!(next, "bc");
            assert_eq!(name.get().await.unwrap(), "bc");
        })
        .await;
    }

    #[tokio::test]
    async fn cell_dies_with_its_scope() {
        context::detach(async {
            let _outer = HandlerScope::empty();
            let inner = HandlerScope::empty();
            let cell = create_state("short", 1u8).unwrap();
            inner.dispose().unwrap();
            let err = cell.get().await.unwrap_err();
            assert!(matches!(err, EffectError::Unhandled(_)));
        })
        .await;
    }
}
