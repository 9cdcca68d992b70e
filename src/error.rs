//! Error types for the effect runtime
//!
//! Resolution failures, scope misuse, and aggregated teardown failures.
//! Handler code reports its own failures through `EffectError::Other`.

use std::fmt;
use thiserror::Error;

use crate::effect::EffectId;

/// Errors that can occur while performing effects or tearing down scopes
#[derive(Debug, Error)]
pub enum EffectError {
    /// No scope in the active chain has any registration for the effect.
    #[error("unhandled effect: {0}")]
    Unhandled(EffectId),

    /// At least one scope registered a handler, but every chain declined
    /// and no parent was left to fall back on.
    #[error("no terminal handler for effect: {0}")]
    NoTerminalHandler(EffectId),

    /// An effect was performed, or handlers registered, outside any scope.
    #[error("no active handler scope")]
    NoActiveScope,

    /// A snapshot was restored after one of its scopes was disposed.
    #[error("snapshot refers to a disposed handler scope")]
    StaleSnapshot,

    /// A parent scope was released while a child still delegates to it.
    #[error("parent scope released while resolving {0}")]
    ScopeReleased(EffectId),

    /// The handler stored for an effect does not have the effect's signature.
    #[error("handler registered for {0} has a different signature")]
    SignatureMismatch(EffectId),

    /// One or more dispose callbacks failed.
    #[error(transparent)]
    Dispose(#[from] DisposeError),

    /// Failure raised by handler code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for effect operations
pub type Result<T> = std::result::Result<T, EffectError>;

/// Failures collected during a best-effort teardown.
///
/// Every dispose callback of a scope runs even when an earlier one fails;
/// the failures are reported together once teardown has completed.
#[derive(Debug, Default)]
pub struct DisposeError {
    failures: Vec<anyhow::Error>,
}

impl DisposeError {
    pub(crate) fn push(&mut self, error: anyhow::Error) {
        self.failures.push(error);
    }

    pub(crate) fn into_result(self) -> std::result::Result<(), Self> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// The individual callback failures, in the order they happened.
    pub fn failures(&self) -> &[anyhow::Error] {
        &self.failures
    }

    /// Number of failed callbacks.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no callback failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for DisposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dispose callback(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DisposeError {}
