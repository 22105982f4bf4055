use std::time::Duration;

use crate::queue::QueueSettings;
use crate::shutdown::DrainConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "" | "dev" | "development" | "local" => Environment::Development,
            _ => Environment::Production,
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerKind {
    Postgres,
    Memory,
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub max_retries_per_request: u32,
    pub max_connections: u32,
    pub lazy_connect: bool,
    pub keep_alive: bool,
}

#[derive(Clone, Debug)]
pub struct DashboardConfig {
    pub addr: Option<String>,
    pub base_path: String,
}

// Central place for runtime configuration, loaded from environment variables
// into a typed struct instead of raw strings everywhere.
#[derive(Clone, Debug)]
pub struct Config {
    pub environment: Environment,
    pub worker_id: String,
    pub broker: BrokerConfig,
    pub queue: QueueSettings,
    pub dashboard: DashboardConfig,
    pub migrate_on_startup: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env { lookup: &lookup };

        let environment = Environment::parse(
            &env.or_fallback("QUEUEKIT_ENV", "APP_ENV")
                .unwrap_or_else(|| "development".to_string()),
        );

        let worker_id = env
            .or_fallback("QUEUEKIT_WORKER_ID", "WORKER_ID")
            .or_else(|| env.get("HOSTNAME"))
            .unwrap_or_else(|| "worker-1".to_string());

        let kind = match env.get("QUEUEKIT_BROKER").as_deref().map(str::trim) {
            None | Some("postgres") | Some("pg") => BrokerKind::Postgres,
            Some("memory") => BrokerKind::Memory,
            Some(other) => anyhow::bail!("QUEUEKIT_BROKER must be postgres or memory, got {other}"),
        };

        let database_url = env.or_fallback("QUEUEKIT_DATABASE_URL", "DATABASE_URL");

        let broker = BrokerConfig {
            kind,
            database_url,
            host: env
                .get("QUEUEKIT_BROKER_HOST")
                .unwrap_or_else(|| "localhost".to_string()),
            port: env.parse("QUEUEKIT_BROKER_PORT")?.unwrap_or(5432),
            database: env
                .get("QUEUEKIT_BROKER_DATABASE")
                .unwrap_or_else(|| "queuekit".to_string()),
            username: env.get("QUEUEKIT_BROKER_USERNAME"),
            password: env.get("QUEUEKIT_BROKER_PASSWORD"),
            connect_timeout: Duration::from_secs(
                env.parse::<u64>("QUEUEKIT_CONNECT_TIMEOUT_SECS")?
                    .unwrap_or(10)
                    .clamp(1, 120),
            ),
            max_retries_per_request: env
                .parse("QUEUEKIT_MAX_RETRIES_PER_REQUEST")?
                .unwrap_or(3),
            max_connections: env
                .parse::<u32>("QUEUEKIT_DB_MAX_CONNECTIONS")?
                .unwrap_or(8)
                .clamp(1, 64),
            lazy_connect: true,
            keep_alive: true,
        };

        if kind == BrokerKind::Postgres
            && broker.database_url.is_none()
            && env.get("QUEUEKIT_BROKER_HOST").is_none()
        {
            anyhow::bail!("DATABASE_URL or QUEUEKIT_BROKER_HOST is required for the postgres broker");
        }

        let defaults = QueueSettings::default();
        let lock_duration = env
            .parse::<u64>("QUEUEKIT_LOCK_DURATION_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.lock_duration);
        let drain = DrainConfig {
            max_wait: env
                .parse::<u64>("QUEUEKIT_SHUTDOWN_MAX_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain.max_wait),
            ..defaults.drain.clone()
        };
        let queue = QueueSettings {
            lock_duration,
            lock_renew_time: lock_duration / 2,
            stalled_interval: env
                .parse::<u64>("QUEUEKIT_STALLED_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stalled_interval),
            max_stalled_count: env
                .parse("QUEUEKIT_MAX_STALLED_COUNT")?
                .unwrap_or(defaults.max_stalled_count),
            drain,
            ..defaults
        };

        let dashboard = DashboardConfig {
            addr: env
                .get("QUEUEKIT_DASHBOARD_ADDR")
                .and_then(|s| normalize_optional_addr(&s)),
            base_path: env
                .get("QUEUEKIT_DASHBOARD_BASE_PATH")
                .unwrap_or_else(|| "/admin/queues".to_string()),
        };

        let migrate_on_startup = env.bool("QUEUEKIT_MIGRATE_ON_STARTUP").unwrap_or(false);

        Ok(Self {
            environment,
            worker_id,
            broker,
            queue,
            dashboard,
            migrate_on_startup,
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|s| !s.trim().is_empty())
    }

    fn or_fallback(&self, primary: &str, fallback: &str) -> Option<String> {
        self.get(primary).or_else(|| self.get(fallback))
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| anyhow::anyhow!("{key} has an invalid value: {raw}")),
            None => Ok(None),
        }
    }
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
