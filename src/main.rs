use std::{error::Error as StdError, process, sync::Arc, time::Duration};

use pagecache::{
    application::error::AppError,
    cache::{
        BodyStore, CacheConfig, CacheConsumer, CacheIndex, CacheTrigger, ContentUnitId,
        EventQueue, FsBodyStore, MemoryCacheIndex, PageCache,
    },
    config::{self, IndexBackend},
    infra::{
        db::PostgresCacheIndex,
        error::InfraError,
        http::{self, AdminState},
        telemetry,
    },
};
use tokio::task::JoinHandle;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let chain = error_chain(error);
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?chain, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?chain, "application error");
    });
}

fn error_chain(error: &AppError) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = StdError::source(error);
    while let Some(inner) = current {
        chain.push(inner.to_string());
        current = inner.source();
    }
    chain
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Flush(_) => run_flush(settings).await,
        config::Command::Invalidate(args) => run_invalidate(settings, args.units).await,
        config::Command::Sweep(_) => run_sweep(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = build_page_cache(&settings).await?;

    let queue = Arc::new(EventQueue::new());
    let consumer = Arc::new(CacheConsumer::new(
        cache.config().clone(),
        queue.clone(),
        cache.invalidator(),
    ));
    let trigger = Arc::new(CacheTrigger::new(queue, consumer.clone()));

    let consume_handle = spawn_consumer(
        consumer.clone(),
        Duration::from_millis(cache.config().auto_consume_interval_ms),
    );
    let sweep_handle = cache
        .config()
        .sweep_interval
        .map(|every| spawn_sweeper(cache.clone(), every));

    let result = serve_admin(&settings, AdminState { cache, trigger }).await;

    consume_handle.abort();
    let _ = consume_handle.await;
    if let Some(handle) = sweep_handle {
        handle.abort();
        let _ = handle.await;
    }

    // Apply whatever was queued before the listener stopped.
    match tokio::time::timeout(settings.server.graceful_shutdown, consumer.consume_all()).await {
        Ok(batches) => info!(batches, "Pending cache events drained"),
        Err(_) => warn!(
            pending = consumer.queue().len(),
            "Timed out draining cache events on shutdown"
        ),
    }

    result
}

async fn run_flush(settings: config::Settings) -> Result<(), AppError> {
    if settings.cache.index == IndexBackend::Memory {
        warn!("Memory cache index: only bodies on disk are flushed, a running server keeps its entries");
    }
    let cache = build_page_cache(&settings).await?;
    cache.invalidator().clear_all().await?;
    info!(directory = %cache.config().directory.display(), "Page cache flushed");
    Ok(())
}

async fn run_invalidate(settings: config::Settings, units: Vec<String>) -> Result<(), AppError> {
    settings.cache.require_shared_index("invalidate")?;
    let cache = build_page_cache(&settings).await?;
    let invalidator = cache.invalidator();

    let mut entries_removed = 0;
    for unit in units {
        let unit = unit.trim();
        if unit.is_empty() {
            return Err(AppError::validation("content unit id must not be empty"));
        }
        let report = invalidator
            .on_content_unit_changed(&ContentUnitId::new(unit))
            .await?;
        entries_removed += report.entries_removed;
    }

    info!(entries_removed, "Content units invalidated");
    Ok(())
}

async fn run_sweep(settings: config::Settings) -> Result<(), AppError> {
    let cache = build_page_cache(&settings).await?;
    let duration = cache.config().effective_duration().await;
    let report = cache.invalidator().sweep(duration).await?;
    info!(
        expired_removed = report.expired_removed,
        orphans_removed = report.orphans_removed,
        "Page cache swept"
    );
    Ok(())
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let index = PostgresCacheIndex::open(&settings.database).await?;
    index.health_check().await.map_err(InfraError::from)?;
    info!("Cache index migrations applied");
    Ok(())
}

async fn build_page_cache(settings: &config::Settings) -> Result<Arc<PageCache>, AppError> {
    let config = CacheConfig::from(&settings.cache);
    let store: Arc<dyn BodyStore> = Arc::new(FsBodyStore::new(config.directory.clone()));

    let index: Arc<dyn CacheIndex> = match settings.cache.index {
        IndexBackend::Postgres => Arc::new(PostgresCacheIndex::open(&settings.database).await?),
        IndexBackend::Memory => {
            warn!("Using the in-memory cache index; entries do not survive a restart");
            Arc::new(MemoryCacheIndex::new())
        }
    };

    Ok(Arc::new(PageCache::new(config, store, index)))
}

fn spawn_consumer(consumer: Arc<CacheConsumer>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            consumer.consume().await;
        }
    })
}

fn spawn_sweeper(cache: Arc<PageCache>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let invalidator = cache.invalidator();
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let duration = cache.config().effective_duration().await;
            if let Err(err) = invalidator.sweep(duration).await {
                warn!(error = %err, "Background page cache sweep failed");
            }
        }
    })
}

async fn serve_admin(settings: &config::Settings, state: AdminState) -> Result<(), AppError> {
    let router = http::build_admin_router(state);

    let addr = settings.server.admin_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| InfraError::bind(addr, err))?;
    info!(addr = %addr, "Admin surface listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(InfraError::Serve)?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
