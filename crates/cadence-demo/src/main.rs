use std::time::Duration;

use cadence_scheduler::{JobArgs, JobFn, JobResult, Scheduler, SchedulerConfig};
use chrono::Utc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_scheduler=info,cadence_demo=info".into()),
        )
        .init();

    // load config: CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = std::env::var("CADENCE_CONFIG").ok();
    let config = SchedulerConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        SchedulerConfig::default()
    });

    let (scheduler, mut failures) = Scheduler::with_failure_observer(config);

    // failure observer: log every report until the scheduler goes away
    let observer = tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            tracing::warn!(
                job_id = %failure.job_id,
                run = failure.run,
                "observed failure: {}",
                failure.error
            );
        }
    });

    scheduler.add_timestamp_job(
        "greeting",
        vec![0, 500, 1_500],
        JobFn::blocking(|args| {
            let name = args.get_kw("name").and_then(|v| v.as_str()).unwrap_or("world");
            info!("hello, {name}");
            Ok(())
        }),
        JobArgs::new().kwarg("name", "cadence"),
    )?;

    scheduler.add_interval_job(
        "heartbeat",
        1.0,
        Some(5),
        None,
        JobFn::from_async(heartbeat),
        JobArgs::new(),
    )?;

    scheduler.add_one_time_job(
        "flaky",
        Utc::now() + chrono::Duration::seconds(2),
        JobFn::blocking(|_| Err("upstream unavailable".into())),
        JobArgs::new(),
    )?;

    scheduler.add_cron_job(
        "every-two-seconds",
        "*/2 * * * * *",
        Some(3),
        "UTC",
        None,
        JobFn::blocking(|args| {
            info!(label = ?args.get(0), "cron tick");
            Ok(())
        }),
        JobArgs::new().arg("even second"),
    )?;

    tokio::time::sleep(Duration::from_millis(2_500)).await;

    scheduler.pause_job("heartbeat")?;
    print_statuses(&scheduler)?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    scheduler.resume_job("heartbeat")?;

    tokio::time::sleep(Duration::from_secs(4)).await;
    print_statuses(&scheduler)?;

    let removed = scheduler.remove_job("every-two-seconds")?;
    info!(runs = removed.execution_count, "removed cron job");

    scheduler.shutdown().await;
    drop(scheduler);
    observer.await?;
    Ok(())
}

async fn heartbeat(_args: JobArgs) -> JobResult {
    info!(at = %Utc::now().format("%H:%M:%S%.3f"), "heartbeat");
    Ok(())
}

fn print_statuses(scheduler: &Scheduler) -> anyhow::Result<()> {
    let statuses = scheduler.get_all_statuses();
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}
