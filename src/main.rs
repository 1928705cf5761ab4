use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use migration::MigratorTrait;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

use warden::authz::cache::{DecisionCache, DistributedCache, MemoryDistributedCache, RedisCache};
use warden::authz::remote::{LocalOnly, OpaEvaluator, RemotePolicyEvaluator};
use warden::authz::{loader, web};
use warden::authz::{AuthorizationService, DatabasePolicyStore, PolicyStore};
use warden::settings::{PolicySource, Settings, SharedBackend};
use warden::{jobs, storage};

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    version,
    about = "Authorization decision engine"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the authorization API (default)
    Serve,
    /// Load a directory of KDL policy documents into the database
    Import {
        /// Directory containing `.kdl` files
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        Command::Import { dir } => import(settings, &dir).await,
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let store = policy_store(&settings).await?;
    let cache = Arc::new(DecisionCache::new(
        settings.cache_config(),
        shared_cache(&settings).await,
    ));
    let remote = remote_evaluator(&settings).await;

    // keep the scheduler alive for the lifetime of the server
    let _scheduler = jobs::init_scheduler(cache.clone(), &settings.cache.sweep_schedule).await?;

    let service = Arc::new(AuthorizationService::new(
        store,
        cache,
        remote,
        settings.service_config(),
    ));

    let addr: SocketAddr = settings.bind_addr().parse().into_diagnostic()?;
    web::serve(addr, web::router(service)).await
}

async fn import(settings: Settings, dir: &std::path::Path) -> Result<()> {
    let db = storage::init(&settings.database).await?;
    migration::Migrator::up(&db, None).await.into_diagnostic()?;

    let parsed = loader::read_policy_dir(dir)?;
    let summary = storage::import_policies(&db, parsed).await?;
    tracing::info!(
        roles = summary.roles,
        permissions = summary.permissions,
        bindings = summary.bindings,
        assignments = summary.assignments,
        overrides = summary.overrides,
        "Imported policies into the database"
    );
    Ok(())
}

async fn policy_store(settings: &Settings) -> Result<Arc<dyn PolicyStore>> {
    match settings.policy.source {
        PolicySource::Database => {
            let db = storage::init(&settings.database).await?;
            migration::Migrator::up(&db, None).await.into_diagnostic()?;
            tracing::info!("Using database policy store");
            Ok(Arc::new(DatabasePolicyStore::new(db)))
        }
        PolicySource::Files => {
            let store = loader::load_policies(&settings.policy.policies_dir)?;
            Ok(Arc::new(store))
        }
    }
}

/// A shared tier that cannot be reached at startup is skipped; decisions are
/// still served from the local tier and the store.
async fn shared_cache(settings: &Settings) -> Option<Box<dyn DistributedCache>> {
    match settings.cache.shared {
        SharedBackend::None => None,
        SharedBackend::Memory => Some(Box::new(MemoryDistributedCache::new())),
        SharedBackend::Redis => {
            let url = settings.cache.redis_url.as_deref()?;
            match RedisCache::connect(url).await {
                Ok(redis) => {
                    tracing::info!(url, "Connected to shared decision cache");
                    Some(Box::new(redis))
                }
                Err(e) => {
                    tracing::warn!(url, error = %e, "Shared decision cache unavailable; running with local tier only");
                    None
                }
            }
        }
    }
}

async fn remote_evaluator(settings: &Settings) -> Arc<dyn RemotePolicyEvaluator> {
    let Some(url) = settings.remote.url.as_deref().filter(|_| settings.remote.enabled) else {
        return Arc::new(LocalOnly);
    };
    let opa = OpaEvaluator::new(url, &settings.remote.policy_path);
    let probe = std::time::Duration::from_millis(settings.remote.timeout_ms);
    if let Err(e) = opa.health(probe).await {
        tracing::warn!(url, error = %e, "Remote policy engine not healthy at startup");
    }
    Arc::new(opa)
}
