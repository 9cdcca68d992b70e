// Capturing and restoring the active-scope stack

mod common;

use std::time::Duration;

use aura_effects::{context, Effect, EffectError, HandlerScope, Snapshot, Step};

fn layered(effect: &Effect<String, String>) -> (HandlerScope, HandlerScope) {
    let s1 = HandlerScope::new([effect
        .terminal(|name: String| async move { Ok(format!("s1:{name}")) })
        .into()]);
    let s2 = HandlerScope::new([effect
        .handler(|name: String| async move {
            if name == "override" {
                Ok(Step::Resolved("s2".to_string()))
            } else {
                Ok(Step::Continue(name))
            }
        })
        .into()]);
    (s1, s2)
}

#[tokio::test]
async fn restored_snapshot_resolves_like_the_captured_stack() {
    common::init_tracing();
    let effect: Effect<String, String> = Effect::define("lookup");

    context::detach(async {
        let (_s1, _s2) = layered(&effect);
        let snapshot = Snapshot::capture();
        assert_eq!(snapshot.len(), 2);

        let deferred = tokio::spawn({
            let effect = effect.clone();
            context::detach(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert!(matches!(
                    effect.perform("x".into()).await,
                    Err(EffectError::NoActiveScope)
                ));

                let restored = snapshot
                    .restore(async {
                        let a = effect.perform("override".into()).await.unwrap();
                        let b = effect.perform("plain".into()).await.unwrap();
                        (a, b)
                    })
                    .await
                    .unwrap();

                // Nothing leaks past the restored block.
                assert!(!context::has_active_scope());
                restored
            })
        });

        let (a, b) = deferred.await.unwrap();
        assert_eq!(a, "s2");
        assert_eq!(b, "s1:plain");
    })
    .await;
}

#[tokio::test]
async fn scopes_created_inside_a_restore_stay_inside() {
    let effect: Effect<String, String> = Effect::define("lookup");

    context::detach(async {
        let (_s1, _s2) = layered(&effect);
        let snapshot = Snapshot::capture();

        let inner = snapshot
            .restore(async {
                let _s3 = HandlerScope::new([effect
                    .terminal(|_| async { Ok("s3".to_string()) })
                    .into()]);
                assert_eq!(context::depth(), 3);
                effect.perform("plain".into()).await.unwrap()
            })
            .await
            .unwrap();

        assert_eq!(inner, "s3");
        assert_eq!(context::depth(), 2);
        assert_eq!(effect.perform("plain".into()).await.unwrap(), "s1:plain");
    })
    .await;
}

#[tokio::test]
async fn restoring_a_disposed_scope_is_an_error() {
    let effect: Effect<String, String> = Effect::define("lookup");

    context::detach(async {
        let (_s1, s2) = layered(&effect);
        let snapshot = Snapshot::capture();
        assert!(snapshot.is_live());

        s2.dispose().unwrap();
        assert!(!snapshot.is_live());

        let mut ran = false;
        let err = snapshot.restore(async { ran = true }).await.unwrap_err();
        assert!(matches!(err, EffectError::StaleSnapshot));
        assert!(!ran);
    })
    .await;
}

#[tokio::test]
async fn snapshots_do_not_keep_scopes_alive() {
    let effect: Effect<String, String> = Effect::define("lookup");

    let snapshot = context::detach(async {
        let (_s1, _s2) = layered(&effect);
        Snapshot::capture()
    })
    .await;

    assert_eq!(snapshot.len(), 2);
    assert!(!snapshot.is_live());
    assert!(matches!(
        snapshot.run(context::depth),
        Err(EffectError::StaleSnapshot)
    ));
}

#[tokio::test]
async fn isolated_regions_do_not_see_each_other() {
    context::detach(async {
        let _base = HandlerScope::empty();
        let (a, b) = futures::join!(
            context::isolate(async {
                let _mine = HandlerScope::empty();
                tokio::task::yield_now().await;
                context::depth()
            }),
            context::isolate(async {
                tokio::task::yield_now().await;
                context::depth()
            }),
        );
        assert_eq!((a, b), (2, 1));
        assert_eq!(context::depth(), 1);
    })
    .await;
}

#[test]
fn synchronous_callbacks_run_against_the_snapshot() {
    let effect: Effect<String, String> = Effect::define("lookup");

    let (snapshot, scopes) = futures::executor::block_on(context::detach(async {
        let scopes = layered(&effect);
        (Snapshot::capture(), scopes)
    }));

    // A callback fired by something outside the async world, such as a timer.
    let callback = || futures::executor::block_on(effect.perform("plain".into()));
    assert!(matches!(callback(), Err(EffectError::NoActiveScope)));
    assert_eq!(snapshot.run(callback).unwrap().unwrap(), "s1:plain");
    assert!(matches!(callback(), Err(EffectError::NoActiveScope)));
    drop(scopes);
}
