use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::broker::{BrokerHandle, MemoryBroker, PgBroker};
use crate::config::{BrokerConfig, BrokerKind, Config, Environment};

/// Build the Postgres pool behind [`PgBroker`].
///
/// Development connects plainly. Every other environment adds credentials,
/// a connect timeout, keep-alive, lazy connect and a bounded connect retry.
pub async fn make_pool(cfg: &BrokerConfig, environment: Environment) -> anyhow::Result<PgPool> {
    let mut connect = match &cfg.database_url {
        Some(url) => PgConnectOptions::from_str(url)?,
        None => PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .database(&cfg.database),
    };

    let mut opts = PgPoolOptions::new().max_connections(cfg.max_connections);

    if environment.is_development() {
        return Ok(opts.connect_with(connect).await?);
    }

    if let Some(username) = &cfg.username {
        connect = connect.username(username);
    }
    if let Some(password) = &cfg.password {
        connect = connect.password(password);
    }

    opts = opts.acquire_timeout(cfg.connect_timeout);

    if cfg.keep_alive {
        // one warm connection, checked before every acquire
        opts = opts
            .min_connections(1)
            .test_before_acquire(true)
            .idle_timeout(None);
    }

    if cfg.lazy_connect {
        return Ok(opts.connect_lazy_with(connect));
    }

    connect_with_retry(opts, connect, cfg.max_retries_per_request).await
}

async fn connect_with_retry(
    opts: PgPoolOptions,
    connect: PgConnectOptions,
    max_retries: u32,
) -> anyhow::Result<PgPool> {
    let mut attempt = 0;
    loop {
        match opts.clone().connect_with(connect.clone()).await {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(attempt, max_retries, error = %e, "broker connect failed, retrying");
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Open the broker selected by config, running migrations when asked to.
pub async fn open_broker(cfg: &Config) -> anyhow::Result<BrokerHandle> {
    match cfg.broker.kind {
        BrokerKind::Memory => {
            tracing::warn!("using in-memory broker; jobs do not survive a restart");
            Ok(BrokerHandle::new(MemoryBroker::new()))
        }
        BrokerKind::Postgres => {
            let pool = make_pool(&cfg.broker, cfg.environment).await?;
            if cfg.migrate_on_startup {
                run_migrations(&pool).await?;
            }
            Ok(BrokerHandle::new(PgBroker::new(pool)))
        }
    }
}
