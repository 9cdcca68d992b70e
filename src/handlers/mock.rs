//! Mock handlers

use std::sync::Arc;

use crate::effect::Effect;
use crate::error::EffectError;
use crate::handler::Handler;

/// A terminal handler that ignores its payload and returns `value`.
pub fn constant<P, R>(effect: &Effect<P, R>, value: R) -> Handler<P, R>
where
    P: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    effect.terminal(move |_| {
        let value = value.clone();
        async move { Ok(value) }
    })
}

/// A terminal handler that always fails with `message`.
pub fn failing<P, R>(effect: &Effect<P, R>, message: impl Into<String>) -> Handler<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    let message: Arc<str> = Arc::from(message.into());
    effect.terminal(move |_| {
        let message = Arc::clone(&message);
        async move { Err(EffectError::Other(anyhow::anyhow!("{message}"))) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Step;

    #[tokio::test]
    async fn constant_ignores_the_payload() {
        let effect: Effect<String, usize> = Effect::define("len");
        let handler = constant(&effect, 42);
        assert_eq!(handler.run("abc".into()).await.unwrap(), Step::Resolved(42));
    }

    #[tokio::test]
    async fn failing_reports_its_message() {
        let effect: Effect<(), ()> = Effect::define("broken");
        let err = failing(&effect, "disk on fire").run(()).await.unwrap_err();
        assert_eq!(err.to_string(), "disk on fire");
    }
}
