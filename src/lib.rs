//! Scoped effect handlers for async Rust
//!
//! This crate separates *what* an operation is from *how* it is carried out.
//! An [`Effect`] names an abstract operation; [`Handler`]s interpret it; a
//! tree of [`HandlerScope`]s decides which handler answers an effect at any
//! given moment. Handlers can decline and delegate, be layered over each
//! other, be decorated with middleware, and be swapped per test, per plugin,
//! or per nested scope without touching the code that performs the effect.
//!
//! - [`effect`]: effect tokens and `perform`.
//! - [`handler`]: the handler algebra (`flat_map`, `fold`, `once`,
//!   `non_reentrant`).
//! - [`scope`] and [`plugin`]: scopes, their lifecycle, plugin bundles.
//! - [`context`]: the active-scope stack, isolation and snapshots.
//! - [`state`]: scoped state cells.
//! - [`middleware`] and [`handlers`]: ready-made decorators and handlers.

pub mod context;
pub mod dispose;
pub mod effect;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod middleware;
pub mod plugin;
pub mod scope;
pub mod state;

// Re-export main APIs
pub use context::Snapshot;
pub use dispose::{AsyncDispose, DisposeCallback};
pub use effect::{Effect, EffectId};
pub use error::{DisposeError, EffectError, Result};
pub use handler::{AnyHandler, Handler, Step};
pub use middleware::{Metrics, Middleware, Retry, Trace};
pub use plugin::Plugin;
pub use scope::{HandlerScope, ScopeEntry};
pub use state::{create_state, State};

#[cfg(feature = "test-utils")]
pub use middleware::FaultInjection;
