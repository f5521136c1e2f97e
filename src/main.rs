use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::future::join_all;
use hearth::{
    batch::{BatchOptions, BatchProcessor},
    cache::{CacheConfig, TaggedCache, generate_cache_key},
    clock::{Clock, SystemClock},
    coalesce::{CoalesceConfig, Coalescer, DistributedCoalescer},
    config::{self, Command, DemoArgs, InvalidateArgs, KeyArgs, Settings},
    infra::{self, error::InfraError, telemetry},
    sink::{MetricsSink, RecorderSink},
    store::SharedStore,
};
use serde::{Deserialize, Serialize};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "hearth error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "hearth error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args
        .command
        .unwrap_or(Command::Demo(DemoArgs::default()))
    {
        Command::Demo(args) => run_demo(&settings, args).await,
        Command::Key(args) => {
            run_key(args);
            Ok(())
        }
        Command::Invalidate(args) => run_invalidate(&settings, args).await,
    }
}

fn run_key(args: KeyArgs) {
    println!("{}", generate_cache_key(&args.base, args.params));
}

async fn run_invalidate(settings: &Settings, args: InvalidateArgs) -> Result<(), InfraError> {
    let store = infra::store::connect(&settings.store).await?;
    let cache = build_cache(
        settings,
        store,
        Arc::new(SystemClock::new()),
        Arc::new(RecorderSink),
    );

    let report = cache.invalidate_by_tag(&args.tag).await?;
    println!(
        "tag `{}`: {} key(s) deleted, {} failed",
        report.tag,
        report.deleted.len(),
        report.failed.len()
    );
    for (key, err) in &report.failed {
        println!("  {key}: {err}");
    }

    match report.failed.into_iter().next() {
        Some((_, err)) => Err(err.into()),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Recipe {
    id: usize,
    title: String,
}

impl Recipe {
    fn load(id: usize) -> Self {
        Self {
            id,
            title: format!("Recipe #{id}"),
        }
    }
}

/// Many callers ask for a handful of recipes at once. The cache answers what
/// it can, the coalescer folds identical misses into one load, and the batch
/// processor folds the loads into as few downstream calls as possible.
async fn run_demo(settings: &Settings, args: DemoArgs) -> Result<(), InfraError> {
    let store = infra::store::connect(&settings.store).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let sink: Arc<dyn MetricsSink> = Arc::new(RecorderSink);

    let cache = build_cache(settings, store.clone(), clock.clone(), sink.clone());
    let coalesce_config = CoalesceConfig::from(&settings.coalesce);
    let coalescer: Coalescer<Recipe, String> =
        Coalescer::new(clock.clone(), sink.clone(), &coalesce_config);

    let downstream_calls = Arc::new(AtomicUsize::new(0));
    let batch = {
        let downstream_calls = downstream_calls.clone();
        BatchProcessor::new(
            move |ids: Vec<usize>| {
                let downstream_calls = downstream_calls.clone();
                async move {
                    downstream_calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(ids.into_iter().map(Recipe::load).collect::<Vec<_>>())
                }
            },
            BatchOptions::from(&settings.batch),
            sink.clone(),
        )
    };

    let keys = args.keys.max(1);
    let options = cache.options().tag("recipe");
    let local = coalesce_config.local_options();

    for round in ["cold", "warm"] {
        let lookups = (0..args.callers).map(|caller| {
            let id = caller % keys;
            let key = generate_cache_key("recipe", [("id", id)]);
            let (cache, coalescer, batch, options) =
                (cache.clone(), coalescer.clone(), batch.clone(), options.clone());
            async move {
                if let Some(recipe) = cache.get::<Recipe>(&key, &options).await {
                    return Ok(recipe);
                }
                let recipe = coalescer
                    .coalesce(
                        &key,
                        move || {
                            let pending = batch.add(id);
                            async move { pending.await.map_err(|err| err.to_string()) }
                        },
                        &local,
                    )
                    .await?;
                cache.set(&key, &recipe, &options).await;
                Ok::<_, String>(recipe)
            }
        });

        let results = join_all(lookups).await;
        let failed = results.iter().filter(|result| result.is_err()).count();
        info!(
            round,
            callers = args.callers,
            keys,
            failed,
            downstream_calls = downstream_calls.load(Ordering::SeqCst),
            "Demo round finished"
        );
    }

    let summary = DistributedCoalescer::new(store, sink, &coalesce_config)
        .coalesce(
            "recipe:summary",
            move || async move { Ok::<_, String>(format!("{keys} recipes cached")) },
            &coalesce_config.distributed_options(),
        )
        .await;
    match summary {
        Ok(summary) => info!(summary = %summary, "Distributed coalesce finished"),
        Err(err) => warn!(error = %err, "Distributed coalesce failed"),
    }

    let report = cache.invalidate_by_tag("recipe").await?;
    info!(
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Invalidated demo entries"
    );

    batch.shutdown();
    Ok(())
}

fn build_cache(
    settings: &Settings,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
) -> TaggedCache {
    TaggedCache::new(store, clock, sink, CacheConfig::from(&settings.cache))
}
