//! Memoizing handler
//!
//! Caches results per payload for as long as the owning scope lives. On a
//! miss it performs its own effect again; being non-reentrant, it steps aside
//! for that nested call, so the result comes from whatever it was layered
//! over.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

use crate::effect::Effect;
use crate::handler::{Handler, Step};

type Cache<P, R> = Arc<Mutex<HashMap<P, R>>>;

/// A caching handler for `effect`.
///
/// The cache is cleared when the scope it is registered in disposes.
pub fn memoize<P, R>(effect: &Effect<P, R>) -> Handler<P, R>
where
    P: Clone + Eq + Hash + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    let cache: Cache<P, R> = Arc::new(Mutex::new(HashMap::new()));
    let lookup = Arc::clone(&cache);
    let target = effect.clone();
    effect
        .handler(move |payload: P| {
            let hit = lookup
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&payload)
                .cloned();
            let cache = Arc::clone(&lookup);
            let effect = target.clone();
            async move {
                if let Some(value) = hit {
                    trace!(effect = %effect.id(), "memo: hit");
                    return Ok(Step::Resolved(value));
                }
                trace!(effect = %effect.id(), "memo: miss");
                let value = effect.perform(payload.clone()).await?;
                cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(payload, value.clone());
                Ok(Step::Resolved(value))
            }
        })
        .non_reentrant()
        .on_cleanup(move || {
            cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
        })
}
