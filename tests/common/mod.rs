// Shared test helpers

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use aura_effects::{Effect, Handler, Step};
use tracing_subscriber::EnvFilter;

/// Install a subscriber once; set `RUST_LOG` to see runtime logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Payload that accumulates the labels of the handlers it passed through.
pub type Trail = Vec<&'static str>;

pub type Log = Arc<Mutex<Vec<&'static str>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<&'static str> {
    log.lock().unwrap().clone()
}

/// A handler that appends `label` to the trail, then declines.
pub fn passing(effect: &Effect<Trail, String>, label: &'static str) -> Handler<Trail, String> {
    effect.handler(move |mut trail: Trail| async move {
        trail.push(label);
        Ok(Step::Continue(trail))
    })
}

/// A handler that appends `label` and resolves with the joined trail.
pub fn resolving(effect: &Effect<Trail, String>, label: &'static str) -> Handler<Trail, String> {
    effect.terminal(move |mut trail: Trail| async move {
        trail.push(label);
        Ok(trail.join(">"))
    })
}
