// Property tests for handler priority
//
// Registering batches of handlers into one scope (each batch decorating the
// previous ones) and nesting each batch in its own child scope must both
// resolve in the same priority order: latest batch first, and within a batch
// in the order given.

use aura_effects::{
    context, AnyHandler, Effect, EffectError, Handler, HandlerScope, Result, ScopeEntry, Step,
};
use proptest::prelude::*;

type Trail = Vec<usize>;

fn step(effect: &Effect<Trail, Trail>, label: usize, resolves: bool) -> Handler<Trail, Trail> {
    effect.handler(move |mut trail: Trail| async move {
        trail.push(label);
        Ok(if resolves {
            Step::Resolved(trail)
        } else {
            Step::Continue(trail)
        })
    })
}

fn expected(batches: &[Vec<(usize, bool)>]) -> Option<Trail> {
    let mut trail = Vec::new();
    for batch in batches.iter().rev() {
        for &(label, resolves) in batch {
            trail.push(label);
            if resolves {
                return Some(trail);
            }
        }
    }
    None
}

fn decorated(effect: &Effect<Trail, Trail>, batches: &[Vec<(usize, bool)>]) -> Result<Trail> {
    futures::executor::block_on(context::detach(async {
        let scope = HandlerScope::empty();
        for batch in batches {
            scope.add_handlers(
                batch
                    .iter()
                    .map(|&(label, resolves)| AnyHandler::from(step(effect, label, resolves))),
            );
        }
        effect.perform(Vec::new()).await
    }))
}

fn nested(effect: &Effect<Trail, Trail>, batches: &[Vec<(usize, bool)>]) -> Result<Trail> {
    futures::executor::block_on(context::detach(async {
        let mut scopes = Vec::new();
        for batch in batches {
            scopes.push(HandlerScope::new(
                batch
                    .iter()
                    .map(|&(label, resolves)| ScopeEntry::from(step(effect, label, resolves))),
            ));
        }
        let outcome = effect.perform(Vec::new()).await;
        while let Some(scope) = scopes.pop() {
            scope.dispose()?;
        }
        outcome
    }))
}

fn arb_batches() -> impl Strategy<Value = Vec<Vec<(usize, bool)>>> {
    prop::collection::vec(prop::collection::vec(any::<bool>(), 1..4), 1..5).prop_map(|batches| {
        let mut label = 0;
        batches
            .into_iter()
            .map(|batch| {
                batch
                    .into_iter()
                    .map(|resolves| {
                        label += 1;
                        (label, resolves)
                    })
                    .collect()
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn decoration_and_nesting_agree_on_priority(batches in arb_batches()) {
        let effect: Effect<Trail, Trail> = Effect::define("priority");
        let want = expected(&batches);

        for outcome in [decorated(&effect, &batches), nested(&effect, &batches)] {
            match &want {
                Some(trail) => prop_assert_eq!(outcome.unwrap(), trail.clone()),
                None => prop_assert!(matches!(outcome, Err(EffectError::NoTerminalHandler(_)))),
            }
        }
    }
}
