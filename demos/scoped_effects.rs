//! A small build pipeline expressed with scoped effects
//!
//! Run with `RUST_LOG=debug cargo run --example scoped_effects` to watch the
//! runtime resolve effects and tear scopes down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aura_effects::handlers::{constant, memoize, Recorder};
use aura_effects::{
    context, create_state, AsyncDispose, Effect, HandlerScope, Metrics, Plugin, Snapshot, Step,
    Trace,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Collaborator effects the pipeline is written against.
struct Effects {
    read: Effect<String, String>,
    build: Effect<Vec<String>, String>,
}

impl Effects {
    fn define() -> Self {
        Self {
            read: Effect::define("fs.read"),
            build: Effect::define("manifest.build"),
        }
    }
}

fn fs_plugin(effects: &Effects, files: HashMap<String, String>) -> Plugin {
    let files = Arc::new(files);
    Plugin::new("fs")
        .with_handler(effects.read.handler(move |path: String| {
            let contents = files.get(&path).cloned();
            async move {
                Ok(match contents {
                    Some(contents) => Step::Resolved(contents),
                    None => Step::Continue(path),
                })
            }
        }))
        .on_dispose(|| {
            info!("fs plugin unloaded");
            Ok(())
        })
}

fn manifest_plugin(effects: &Effects, metrics: &Metrics) -> Plugin {
    let read = effects.read.clone();
    let build = effects.build.handler(move |paths: Vec<String>| {
        let read = read.clone();
        async move {
            let mut lines = Vec::with_capacity(paths.len());
            for path in paths {
                let contents = read.perform(path.clone()).await?;
                lines.push(format!("{path}: {} bytes", contents.len()));
            }
            Ok(Step::Resolved(lines.join("\n")))
        }
    });
    let build = build.with(&Trace::with_prefix("manifest")).with(metrics);
    Plugin::new("manifest").with_handler(build)
}

/// Stands in for a file watcher that needs an async shutdown.
struct Watcher;

#[async_trait]
impl AsyncDispose for Watcher {
    async fn dispose(&mut self) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        info!("watcher stopped");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let effects = Effects::define();
    let metrics = Metrics::new();
    let files = HashMap::from([
        ("index.html".to_string(), "<h1>hello</h1>".to_string()),
        ("style.css".to_string(), "h1 { color: teal }".to_string()),
    ]);

    context::detach(async {
        let app = HandlerScope::new([
            fs_plugin(&effects, files).into(),
            manifest_plugin(&effects, &metrics).into(),
        ]);
        app.adopt(Watcher);

        // Cache reads for the rest of the session, and record every miss.
        let misses = Recorder::new();
        app.add_handlers([
            memoize(&effects.read).into(),
            misses.handler(&effects.read).into(),
        ]);

        let builds = create_state("builds", 0u32)?;
        let paths = vec!["index.html".to_string(), "style.css".to_string()];
        println!("{}", effects.build.perform(paths.clone()).await?);
        builds.update(|n| n + 1).await?;

        // A test-style override: pretend a file changed on disk.
        {
            let draft = constant(&effects.read, "<h1>draft</h1>".to_string());
            let _preview = HandlerScope::new([draft.into()]);
            println!("{}", effects.build.perform(vec!["index.html".to_string()]).await?);
            builds.update(|n| n + 1).await?;
        }

        // Deferred work loses the context unless it carries a snapshot.
        let snapshot = Snapshot::capture();
        let rebuild = tokio::spawn({
            let build = effects.build.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                snapshot.restore(build.perform(paths)).await
            }
        });
        println!("{}", rebuild.await???);

        let total = builds.get().await?;
        info!(
            builds = total,
            misses = misses.len(),
            resolved = metrics.resolved_count(),
            "pipeline finished"
        );

        app.dispose_async().await?;
        Ok::<_, anyhow::Error>(())
    })
    .await
}
