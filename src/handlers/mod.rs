//! Reusable handlers
//!
//! Ready-made handlers for common jobs:
//!
//! - recording: a spy that records payloads and declines
//! - memo: caches results of an effect for the lifetime of a scope
//! - mock: fixed results for tests

pub mod memo;
pub mod mock;
pub mod recording;

pub use memo::memoize;
pub use mock::{constant, failing};
pub use recording::Recorder;
