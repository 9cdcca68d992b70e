//! Teardown callbacks for handler scopes
//!
//! Callbacks run newest first. Teardown is best-effort: a failing callback
//! never stops the ones after it; failures are collected into a DisposeError.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use tracing::warn;

use crate::error::DisposeError;

type SyncCallback = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
type AsyncCallback = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A teardown step registered on a scope.
pub enum DisposeCallback {
    /// Runs in place.
    Sync(SyncCallback),
    /// Produces a future that has to be driven to completion.
    Async(AsyncCallback),
}

impl DisposeCallback {
    /// Wrap a synchronous callback.
    pub fn sync(f: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> Self {
        DisposeCallback::Sync(Box::new(f))
    }

    /// Wrap a callback that returns a future.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        DisposeCallback::Async(Box::new(move || f().boxed()))
    }
}

impl std::fmt::Debug for DisposeCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisposeCallback::Sync(_) => f.write_str("DisposeCallback::Sync"),
            DisposeCallback::Async(_) => f.write_str("DisposeCallback::Async"),
        }
    }
}

/// A resource that needs asynchronous shutdown, such as a listener.
///
/// Hand it to [`HandlerScope::adopt`](crate::HandlerScope::adopt) to tie its
/// shutdown to the scope.
#[async_trait]
pub trait AsyncDispose: Send {
    /// Shut the resource down.
    async fn dispose(&mut self) -> anyhow::Result<()>;
}

/// Run callbacks newest first, awaiting asynchronous ones in sequence.
pub(crate) async fn run_async(callbacks: Vec<DisposeCallback>) -> Result<(), DisposeError> {
    let mut errors = DisposeError::default();
    for callback in callbacks.into_iter().rev() {
        let outcome = match callback {
            DisposeCallback::Sync(f) => f(),
            DisposeCallback::Async(f) => f().await,
        };
        if let Err(e) = outcome {
            errors.push(e);
        }
    }
    errors.into_result()
}

/// Run callbacks newest first without awaiting.
///
/// Asynchronous callbacks are driven to completion in place when no tokio
/// runtime is running on this thread. Inside a runtime they cannot be
/// blocked on, so they are handed to the runtime and their failures are
/// only logged; use `dispose_async` when their completion matters. Inside
/// some other executor they get a single poll, see [`drive_in_place`].
pub(crate) fn run_blocking(callbacks: Vec<DisposeCallback>) -> Result<(), DisposeError> {
    let mut errors = DisposeError::default();
    for callback in callbacks.into_iter().rev() {
        let outcome = match callback {
            DisposeCallback::Sync(f) => f(),
            DisposeCallback::Async(f) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    warn!("async dispose callback detached onto the runtime during synchronous disposal");
                    runtime.spawn(async move {
                        if let Err(e) = f().await {
                            warn!(error = %e, "detached dispose callback failed");
                        }
                    });
                    Ok(())
                }
                Err(_) => drive_in_place(f()),
            },
        };
        if let Err(e) = outcome {
            errors.push(e);
        }
    }
    errors.into_result()
}

/// Block on `fut` unless this thread is already running an executor.
///
/// Executors do not nest, so in that case the future is polled once and
/// counted as failed if it is not ready by then.
fn drive_in_place(fut: BoxFuture<'static, anyhow::Result<()>>) -> anyhow::Result<()> {
    match futures::executor::enter() {
        Ok(enter) => {
            drop(enter);
            futures::executor::block_on(fut)
        }
        Err(_) => fut.now_or_never().unwrap_or_else(|| {
            Err(anyhow::anyhow!(
                "async dispose callback could not complete inside a running executor; \
                 use dispose_async"
            ))
        }),
    }
}
