use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use userkv::{Config, KvStore, RedbStore, RedisStore, StoreBackend, UserRepository};

/// Summary of the index audit, printed as JSON
#[derive(Debug, Serialize)]
struct AuditReport {
    environment: String,
    live_users: usize,
    orphaned: Vec<String>,
    undecodable: Vec<String>,
    pruned: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "userkv=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting user index audit...");

    // Load configuration
    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(
        "Environment: {}, Backend: {:?}",
        config.environment,
        config.store_backend
    );

    let report = match config.store_backend {
        StoreBackend::Redb => {
            let store = RedbStore::open(&config.database_path)?;
            audit(UserRepository::new(store), &config).await?
        }
        StoreBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("REDIS_URL is not set"))?;
            let store = RedisStore::open(url)?;
            audit(UserRepository::new(store), &config).await?
        }
        // A fresh in-process store is always empty
        StoreBackend::Memory => {
            anyhow::bail!("STORE_BACKEND=memory has no persisted data to audit")
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

/// Check that every index entry resolves, optionally pruning the ones that don't
async fn audit<S: KvStore>(repo: UserRepository<S>, config: &Config) -> anyhow::Result<AuditReport> {
    let repo = repo.with_timeout(config.op_timeout());
    let listing = repo.read_all_lenient().await?;

    tracing::info!(
        "Index audit: {} live users, {} orphaned, {} undecodable",
        listing.users.len(),
        listing.orphaned.len(),
        listing.undecodable.len()
    );

    let pruned = if config.prune_orphans && !listing.orphaned.is_empty() {
        repo.prune_orphans().await?
    } else {
        0
    };

    Ok(AuditReport {
        environment: config.environment.clone(),
        live_users: listing.users.len(),
        orphaned: listing.orphaned,
        undecodable: listing.undecodable,
        pruned,
    })
}
