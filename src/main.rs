//! clobgate: execution gateway for the Polymarket CTF Exchange CLOB.
//!
//! Clients speak plain JSON over HTTP; the gateway signs EIP-712 orders,
//! enforces per-tenant risk and rate limits, mirrors exchange books over
//! WebSocket, and guarantees at-most-once submission per idempotency key.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clobgate::audit::{AuditRepo, AuditSink};
use clobgate::config::Config;
use clobgate::feed::MarketFeed;
use clobgate::gateway::GatewayService;
use clobgate::idempotency::{
    IdempotencyStore, MemoryIdempotencyStore, PostgresIdempotencyStore, RedisIdempotencyStore,
};
use clobgate::metrics;
use clobgate::nonce::NonceManager;
use clobgate::registry::{TenantRegistry, TenantRepo};
use clobgate::repository::{
    connect_postgres, PostgresAuditRepo, PostgresTenantRepo, PostgresUsageRepo, RedisUsageStore,
    RetentionCleaner,
};
use clobgate::risk::{MemoryUsageStore, RiskEngine, UsageStore};
use clobgate::server::{build_router, AppState};
use clobgate::user_stream::UserStream;

const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    metrics::register_metrics();

    let config = Arc::new(Config::load().unwrap_or_else(|e| {
        warn!("config file load failed ({e}), using defaults with env vars");
        Config::load_with_defaults()
    }));
    info!(port = config.server.port, "starting clobgate");

    // --- Persistence backends (all optional; memory fallbacks otherwise) ---
    let pg_available = !config.database.dsn.is_empty();
    let redis_client = config
        .redis
        .url()
        .and_then(|url| redis::Client::open(url).ok());

    let mut tenant_repo: Option<Arc<dyn TenantRepo>> = None;
    let mut audit_repo: Option<Arc<dyn AuditRepo>> = None;
    let mut usage_pg: Option<Arc<PostgresUsageRepo>> = None;
    let mut idempotency: Option<Arc<dyn IdempotencyStore>> = None;

    if pg_available {
        match setup_postgres(&config.database.dsn).await {
            Ok((tenants, audit, usage, idem)) => {
                tenant_repo = Some(tenants);
                audit_repo = Some(audit);
                usage_pg = Some(usage);
                idempotency = Some(idem);
                info!("postgres persistence enabled");
            }
            Err(e) => error!(error = %e, "postgres unavailable, continuing without it"),
        }
    }

    // Redis overrides Postgres for the latency-sensitive stores.
    if let Some(client) = &redis_client {
        idempotency = Some(Arc::new(RedisIdempotencyStore::new(
            client.clone(),
            Duration::from_secs(config.redis.idempotency_ttl_seconds),
        )));
        info!("redis idempotency store enabled");
    }
    let idempotency: Arc<dyn IdempotencyStore> = match idempotency {
        Some(store) => store,
        None => Arc::new(MemoryIdempotencyStore::new()),
    };

    let usage: Arc<dyn UsageStore> = if let Some(client) = &redis_client {
        Arc::new(RedisUsageStore::new(client.clone()))
    } else if let Some(pg) = &usage_pg {
        pg.clone()
    } else {
        Arc::new(MemoryUsageStore::new())
    };

    // --- Core components ---
    let registry = Arc::new(TenantRegistry::new(config.clone(), tenant_repo));

    let feed = MarketFeed::new(config.exchange.ws_url.clone());
    feed.start();

    let user_stream = if config.credentials.has_l2() {
        let stream = UserStream::new(
            config.exchange.ws_url.clone(),
            config.credentials.l2_api_key.clone(),
            config.credentials.l2_api_secret.clone(),
            config.credentials.l2_api_passphrase.clone(),
        );
        stream.start();
        Some(stream)
    } else {
        None
    };

    let risk = Arc::new(RiskEngine::new(usage, feed.clone()));
    let nonce = Arc::new(NonceManager::new(
        config.chain.rpc_url.clone(),
        config.exchange.contract.parse()?,
    ));

    let (audit_sink, audit_handle) = AuditSink::new(&config.audit.log_dir, audit_repo.clone())?;

    let gateway = Arc::new(GatewayService::new(
        config.clone(),
        registry.clone(),
        risk,
        nonce,
        feed.clone(),
        user_stream.clone(),
    )?);

    let cleaner = RetentionCleaner {
        idempotency: idempotency.clone(),
        audit: audit_repo,
        usage: usage_pg,
        idempotency_retention: Duration::from_secs(
            config.database.idempotency_retention_hours * 3600,
        ),
        audit_retention: Duration::from_secs(config.database.audit_retention_days * 86_400),
        usage_retention: Duration::from_secs(config.database.usage_retention_days * 86_400),
        interval: Duration::from_secs(config.database.cleanup_interval_minutes * 60),
    };
    let cleaner_handle = cleaner.spawn();

    // --- Serve ---
    let state = AppState {
        config: config.clone(),
        gateway,
        registry,
        audit: audit_sink.clone(),
        idempotency,
    };
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Teardown (5 s budget) ---
    info!("shutting down");
    feed.stop();
    if let Some(stream) = &user_stream {
        stream.stop();
    }
    cleaner_handle.abort();
    drop(audit_sink);
    if tokio::time::timeout(SHUTDOWN_BUDGET, audit_handle)
        .await
        .is_err()
    {
        warn!("audit sink did not drain within the shutdown budget");
    }
    info!("goodbye");
    Ok(())
}

type PostgresBackends = (
    Arc<dyn TenantRepo>,
    Arc<dyn AuditRepo>,
    Arc<PostgresUsageRepo>,
    Arc<dyn IdempotencyStore>,
);

/// Each repository drives its own connection; statements never contend on a
/// shared session.
async fn setup_postgres(dsn: &str) -> anyhow::Result<PostgresBackends> {
    let tenants = PostgresTenantRepo::new(connect_postgres(dsn).await?).await?;
    let audit = PostgresAuditRepo::new(connect_postgres(dsn).await?).await?;
    let usage = PostgresUsageRepo::new(connect_postgres(dsn).await?).await?;
    let idem = PostgresIdempotencyStore::new(connect_postgres(dsn).await?).await?;
    Ok((
        Arc::new(tenants),
        Arc::new(audit),
        Arc::new(usage),
        Arc::new(idem),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
