use std::env;

use queuekit::broker::{Broker, PgBroker};
use queuekit::config::{BrokerKind, Config};
use queuekit::jobs::JobId;
use queuekit::{db, policy, DeadLetterEntry};

const USAGE: &str = "queuectl <command>\n\
     Commands:\n\
     - migrate\n\
     - counts <queue>\n\
     - status <queue> <job_id>\n\
     - pause <queue>\n\
     - resume <queue>\n\
     - clear <queue>\n\
     - dlq <dlq-queue> [limit]\n\
     \n\
     Uses DATABASE_URL (or QUEUEKIT_BROKER_HOST and friends).\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let cfg = Config::from_env()?;
    if cfg.broker.kind != BrokerKind::Postgres {
        anyhow::bail!("queuectl only works against the postgres broker");
    }
    let pool = db::make_pool(&cfg.broker, cfg.environment).await?;

    if args[1] == "migrate" {
        db::run_migrations(&pool).await?;
        println!("migrations OK");
        return Ok(());
    }

    let broker = PgBroker::new(pool);
    let queue = arg(&args, 2, "queue")?;

    match args[1].as_str() {
        "counts" => {
            let c = broker.counts(queue).await?;
            println!(
                "{queue}: waiting={} active={} delayed={} paused={} completed={} failed={}",
                c.waiting, c.active, c.delayed, c.paused, c.completed, c.failed
            );
        }
        "status" => {
            let id: JobId = arg(&args, 3, "job_id")?.parse()?;
            match broker.get(queue, id).await? {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => println!("job {id} not found in {queue}"),
            }
        }
        "pause" => {
            broker.pause(queue).await?;
            println!("{queue} paused");
        }
        "resume" => {
            broker.resume(queue).await?;
            println!("{queue} resumed");
        }
        "clear" => {
            let removed = broker.clear(queue).await?;
            println!("{queue}: removed {removed} waiting/delayed jobs");
        }
        "dlq" => {
            let limit: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(20);
            print_dead_letters(&broker, queue, limit).await?;
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    broker.close().await?;
    Ok(())
}

fn arg<'a>(args: &'a [String], idx: usize, name: &str) -> anyhow::Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing <{name}>\n\n{USAGE}"))
}

async fn print_dead_letters(broker: &PgBroker, queue: &str, limit: usize) -> anyhow::Result<()> {
    let jobs = policy::pending_entries(broker, queue, limit).await?;
    if jobs.is_empty() {
        println!("{queue}: no dead-letter entries");
        return Ok(());
    }

    for job in jobs {
        match serde_json::from_value::<DeadLetterEntry>(job.payload.clone()) {
            Ok(entry) => println!(
                "#{} {} from {}#{} attempts={} at={} reason={}",
                job.id,
                job.name,
                entry.original_queue_name,
                entry.original_job_id,
                entry.attempts_made,
                entry.failure_timestamp.to_rfc3339(),
                entry.failure_reason
            ),
            Err(_) => println!("#{} {} (not a dead-letter entry) {}", job.id, job.name, job.payload),
        }
    }
    Ok(())
}
