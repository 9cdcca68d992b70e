//! Middleware for effect handlers
//!
//! Each middleware wraps a handler and returns a handler for the same effect,
//! so cross-cutting concerns like tracing, metrics, retries and fault
//! injection can be layered onto plugins without touching their handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::handler::{Handler, Step};

/// A reusable handler decorator.
pub trait Middleware {
    /// Decorate `handler`, keeping its effect.
    fn wrap<P, R>(&self, handler: Handler<P, R>) -> Handler<P, R>
    where
        P: Clone + Send + 'static,
        R: Send + 'static;
}

impl<P, R> Handler<P, R>
where
    P: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Wrap the handler in `middleware`. Middleware may re-run a handler, so
    /// the payload must be cloneable.
    pub fn with(self, middleware: &impl Middleware) -> Self {
        middleware.wrap(self)
    }
}

/// Tracing middleware that logs every run with its duration and outcome
#[derive(Debug, Clone)]
pub struct Trace {
    prefix: Arc<str>,
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace {
    /// Trace under the `effect` prefix.
    pub fn new() -> Self {
        Self::with_prefix("effect")
    }

    /// Trace under a custom prefix.
    pub fn with_prefix(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: Arc::from(prefix.as_ref()),
        }
    }
}

impl Middleware for Trace {
    fn wrap<P, R>(&self, handler: Handler<P, R>) -> Handler<P, R>
    where
        P: Clone + Send + 'static,
        R: Send + 'static,
    {
        let prefix = Arc::clone(&self.prefix);
        handler.decorate(move |inner, payload| {
            let prefix = Arc::clone(&prefix);
            async move {
                let effect = inner.effect().clone();
                let start = Instant::now();
                trace!(%prefix, %effect, "run: start");
                let result = inner.run(payload).await;
                let duration = start.elapsed();
                match &result {
                    Ok(Step::Resolved(_)) => debug!(%prefix, %effect, ?duration, "run: resolved"),
                    Ok(Step::Continue(_)) => debug!(%prefix, %effect, ?duration, "run: declined"),
                    Err(e) => warn!(%prefix, %effect, ?duration, error = %e, "run: failed"),
                }
                result
            }
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    resolved: AtomicU64,
    declined: AtomicU64,
    errors: AtomicU64,
}

/// Metrics collection middleware
///
/// Clones share counters, so one `Metrics` can wrap several handlers and
/// report their totals.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    counters: Arc<Counters>,
}

impl Metrics {
    /// Fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs that resolved.
    pub fn resolved_count(&self) -> u64 {
        self.counters.resolved.load(Ordering::Relaxed)
    }

    /// Runs that declined.
    pub fn declined_count(&self) -> u64 {
        self.counters.declined.load(Ordering::Relaxed)
    }

    /// Runs that failed.
    pub fn error_count(&self) -> u64 {
        self.counters.errors.load(Ordering::Relaxed)
    }
}

impl Middleware for Metrics {
    fn wrap<P, R>(&self, handler: Handler<P, R>) -> Handler<P, R>
    where
        P: Clone + Send + 'static,
        R: Send + 'static,
    {
        let counters = Arc::clone(&self.counters);
        handler.decorate(move |inner, payload| {
            let counters = Arc::clone(&counters);
            async move {
                let result = inner.run(payload).await;
                let counter = match &result {
                    Ok(Step::Resolved(_)) => &counters.resolved,
                    Ok(Step::Continue(_)) => &counters.declined,
                    Err(_) => &counters.errors,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                result
            }
        })
    }
}

/// Retry middleware with exponential backoff
///
/// Only failed runs are retried; a refusal is passed on as is.
#[derive(Debug, Clone)]
pub struct Retry {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self::new()
    }
}

impl Retry {
    /// Three retries starting at 100ms.
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }

    /// Custom retry count and initial delay.
    pub fn with_config(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }
}

/// `base * 2^(attempt - 1)`, saturating instead of overflowing.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

impl Middleware for Retry {
    fn wrap<P, R>(&self, handler: Handler<P, R>) -> Handler<P, R>
    where
        P: Clone + Send + 'static,
        R: Send + 'static,
    {
        let Retry {
            max_retries,
            base_delay,
        } = *self;
        handler.decorate(move |inner, payload| async move {
            let mut retries = 0;
            loop {
                match inner.run(payload.clone()).await {
                    Err(e) if retries < max_retries => {
                        retries += 1;
                        let delay = backoff(base_delay, retries);
                        debug!(
                            effect = %inner.effect(),
                            retries,
                            ?delay,
                            error = %e,
                            "run failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    result => return result,
                }
            }
        })
    }
}

/// Fault injection middleware for testing
#[cfg(feature = "test-utils")]
#[derive(Debug, Clone)]
pub struct FaultInjection {
    failure_rate: f32,
    delay_range: Option<(Duration, Duration)>,
    rng: Arc<std::sync::Mutex<rand::rngs::StdRng>>,
}

#[cfg(feature = "test-utils")]
impl FaultInjection {
    /// Fail roughly `failure_rate` of runs, seeded from entropy.
    pub fn new(failure_rate: f32) -> Self {
        use rand::SeedableRng;
        Self::with_rng(failure_rate, rand::rngs::StdRng::from_entropy())
    }

    /// Deterministic fault injection, for reproducible tests.
    pub fn with_seed(failure_rate: f32, seed: u64) -> Self {
        use rand::SeedableRng;
        Self::with_rng(failure_rate, rand::rngs::StdRng::seed_from_u64(seed))
    }

    fn with_rng(failure_rate: f32, rng: rand::rngs::StdRng) -> Self {
        Self {
            failure_rate,
            delay_range: None,
            rng: Arc::new(std::sync::Mutex::new(rng)),
        }
    }

    /// Also sleep a random duration in `min..=max` before each run.
    pub fn with_delays(mut self, min: Duration, max: Duration) -> Self {
        self.delay_range = Some((min, max));
        self
    }
}

#[cfg(feature = "test-utils")]
impl Middleware for FaultInjection {
    fn wrap<P, R>(&self, handler: Handler<P, R>) -> Handler<P, R>
    where
        P: Clone + Send + 'static,
        R: Send + 'static,
    {
        let this = self.clone();
        handler.decorate(move |inner, payload| {
            use rand::Rng;

            // Draw before awaiting so the lock is never held across a suspension.
            let (delay, fail) = {
                let mut rng = this
                    .rng
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let delay = this.delay_range.map(|(min, max)| {
                    let ms = rng.gen_range(min.as_millis()..=max.as_millis());
                    Duration::from_millis(ms as u64)
                });
                (delay, rng.gen::<f32>() < this.failure_rate)
            };
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if fail {
                    let effect = inner.effect();
                    let fault = anyhow::anyhow!("injected fault in {effect}");
                    return Err(crate::error::EffectError::Other(fault));
                }
                inner.run(payload).await
            }
        })
    }
}
