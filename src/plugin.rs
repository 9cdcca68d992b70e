//! Plugins: named bundles of handlers
//!
//! A plugin is a plain value. Supplying it to `HandlerScope::new` moves its
//! handlers and dispose hook into that scope; the plugin itself is never
//! disposed.

use std::borrow::Cow;
use std::future::Future;

use crate::dispose::DisposeCallback;
use crate::handler::AnyHandler;

pub(crate) type PluginParts = (Cow<'static, str>, Vec<AnyHandler>, Option<DisposeCallback>);

/// A reusable bundle of handlers with optional teardown.
///
/// ```
/// use aura_effects::{Effect, HandlerScope, Plugin};
///
/// let read: Effect<String, String> = Effect::define("fs.read");
/// let plugin = Plugin::new("fs")
///     .with_handler(read.terminal(|path: String| async move { Ok(format!("<{path}>")) }))
///     .on_dispose(|| Ok(()));
///
/// let scope = HandlerScope::new([plugin.into()]);
/// assert!(scope.contains(&read));
/// ```
#[derive(Debug)]
pub struct Plugin {
    name: Cow<'static, str>,
    handlers: Vec<AnyHandler>,
    on_dispose: Option<DisposeCallback>,
}

impl Plugin {
    /// An empty plugin called `name`.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
            on_dispose: None,
        }
    }

    /// The name given at construction, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of handlers bundled so far.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the plugin has no handlers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Add a handler. Handlers for the same effect keep the order they were
    /// added in: the first gets first refusal.
    pub fn with_handler(mut self, handler: impl Into<AnyHandler>) -> Self {
        self.handlers.push(handler.into());
        self
    }

    /// Add several handlers, in priority order.
    pub fn with_handlers(mut self, handlers: impl IntoIterator<Item = AnyHandler>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Set the teardown hook, replacing any previous one.
    pub fn on_dispose(mut self, f: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> Self {
        self.on_dispose = Some(DisposeCallback::sync(f));
        self
    }

    /// Set an asynchronous teardown hook, replacing any previous one.
    pub fn on_dispose_async<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_dispose = Some(DisposeCallback::from_async(f));
        self
    }

    pub(crate) fn into_parts(self) -> PluginParts {
        (self.name, self.handlers, self.on_dispose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;

    #[test]
    fn builder_collects_handlers_in_order() {
        let a: Effect<(), u8> = Effect::define("a");
        let b: Effect<(), u8> = Effect::define("b");
        let plugin = Plugin::new("pair")
            .with_handler(a.terminal(|()| async { Ok(1) }))
            .with_handlers([b.terminal(|()| async { Ok(2) }).into()]);

        assert_eq!(plugin.name(), "pair");
        assert_eq!(plugin.len(), 2);
        let (_, handlers, hook) = plugin.into_parts();
        assert_eq!(handlers[0].effect(), a.id());
        assert_eq!(handlers[1].effect(), b.id());
        assert!(hook.is_none());
    }

    #[test]
    fn later_hook_replaces_earlier() {
        let plugin = Plugin::new(String::from("hooks"))
            .on_dispose(|| Ok(()))
            .on_dispose_async(|| async { Ok(()) });
        let (_, _, hook) = plugin.into_parts();
        assert!(matches!(hook, Some(DisposeCallback::Async(_))));
    }
}
