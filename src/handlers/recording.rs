//! Recording handler for tests

use std::sync::{Arc, Mutex, PoisonError};

use crate::effect::Effect;
use crate::handler::{Handler, Step};

/// Spy that captures every payload it sees for later verification.
///
/// Its handler always declines with the payload unchanged, so it can be
/// layered in front of any existing composition without changing results.
#[derive(Debug)]
pub struct Recorder<P> {
    events: Arc<Mutex<Vec<P>>>,
}

impl<P> Clone for Recorder<P> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<P> Default for Recorder<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Recorder<P> {
    /// An empty recorder.
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of payloads recorded so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget everything recorded.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<P>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: Clone> Recorder<P> {
    /// The recorded payloads, oldest first.
    pub fn events(&self) -> Vec<P> {
        self.lock().clone()
    }
}

impl<P> Recorder<P>
where
    P: Clone + Send + 'static,
{
    /// A declining handler for `effect` that records into this recorder.
    pub fn handler<R: Send + 'static>(&self, effect: &Effect<P, R>) -> Handler<P, R> {
        let recorder = self.clone();
        effect.handler(move |payload: P| {
            recorder.lock().push(payload.clone());
            async move { Ok(Step::Continue(payload)) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_declines() {
        let effect: Effect<u32, u32> = Effect::define("spied");
        let recorder = Recorder::new();
        let handler = recorder
            .handler(&effect)
            .flat_map(effect.terminal(|n: u32| async move { Ok(n + 1) }));

        assert_eq!(handler.run(1).await.unwrap(), Step::Resolved(2));
        assert_eq!(handler.run(5).await.unwrap(), Step::Resolved(6));
        assert_eq!(recorder.events(), vec![1, 5]);

        recorder.clear();
        assert!(recorder.is_empty());
    }
}
