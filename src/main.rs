use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

use gatekeeper::authz::loader::PolicyDir;
use gatekeeper::authz::predicates::builtin_registry;
use gatekeeper::authz::web::{router, AppState};
use gatekeeper::authz::{Authorizer, MokaBackend, OrgDescendantCache};
use gatekeeper::errors::ServiceError;
use gatekeeper::settings::Settings;

#[derive(Parser, Debug)]
#[command(
    name = "gatekeeper",
    version,
    about = "Authorization decision engine"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Load and index the policies, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    let store = Arc::new(PolicyDir::open(&settings.policies.dir).map_err(ServiceError::from)?);
    let types = Arc::new(store.load_type_registry().map_err(ServiceError::from)?);

    let backend = Arc::new(MokaBackend::new(
        Duration::from_secs(settings.org_cache.ttl_secs),
        settings.org_cache.max_capacity,
    ));
    let org_cache = Arc::new(OrgDescendantCache::new(
        &settings.org_cache.name,
        store.clone(),
        backend,
    ));
    org_cache.invalidate().map_err(ServiceError::from)?;

    let predicates = builtin_registry(store.clone(), org_cache.clone());
    let authorizer = Authorizer::new(store.clone(), types.clone(), predicates)
        .map_err(ServiceError::from)?
        .with_method_call_default(settings.method_calls.default);
    let stats = authorizer.index().stats();
    tracing::info!(
        types = types.entity_count(),
        entries = stats.entries,
        org_generation = org_cache.generation(),
        "Policies loaded"
    );

    if cli.check {
        return Ok(());
    }

    let addr: SocketAddr = settings
        .listen_addr()
        .parse()
        .map_err(|_| ServiceError::BadAddress(settings.listen_addr()))?;
    let app = router(AppState {
        authorizer: Arc::new(authorizer),
        org_cache,
    });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(ServiceError::from)?;
    tracing::info!(%addr, "Admin API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
