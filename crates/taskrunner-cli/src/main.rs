use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use taskrunner_core::{TaskOptions, TaskRunnerConfig};
use taskrunner_engine::TaskRunner;
use taskrunner_store::TaskFilter;
use tokio::sync::watch;
use tracing::{info, warn};

mod cli;
mod handlers;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskrunner=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // load config: --config > TASKRUNNER_CONFIG env > ~/.taskrunner/taskrunner.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("TASKRUNNER_CONFIG").ok());
    let mut config = TaskRunnerConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TaskRunnerConfig::default()
    });
    if let Some(uri) = cli.store {
        config.store.uri = uri;
    }

    let runner = TaskRunner::connect(&config.store.uri)
        .await
        .with_context(|| format!("opening task store {}", config.store.uri))?;

    let result = dispatch(&runner, cli.command, config).await;
    runner.close().await?;
    result
}

async fn dispatch(
    runner: &TaskRunner,
    command: Commands,
    config: TaskRunnerConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Schedule {
            name,
            data,
            task_id,
            group,
            repeat_every,
            start_at,
        } => {
            let data: serde_json::Value =
                serde_json::from_str(&data).context("--data must be valid JSON")?;
            let options = TaskOptions {
                task_id,
                group,
                repeat_every,
                start_at,
            };
            let task = runner.schedule(&name, data, options).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Commands::List {
            name,
            group,
            pending,
        } => {
            let mut filter = TaskFilter::all();
            if let Some(name) = name {
                filter = filter.with_name(name);
            }
            if let Some(group) = group {
                filter = filter.in_group(group);
            }
            if pending {
                filter = filter.processed(false);
            }
            for task in runner.list(&filter).await? {
                println!("{}", serde_json::to_string(&task)?);
            }
        }
        Commands::Remove {
            task_id,
            processed,
        } => {
            let filter = match task_id {
                Some(id) => TaskFilter::by_id(id),
                None if processed => TaskFilter::all().processed(true),
                None => anyhow::bail!("nothing to remove: pass a task id or --processed"),
            };
            println!("{}", runner.remove(&filter).await?);
        }
        Commands::Work { concurrency } => {
            work(runner, config, concurrency).await?;
        }
    }
    Ok(())
}

/// Run `concurrency` workers over the built-in handlers until Ctrl-C.
async fn work(
    runner: &TaskRunner,
    config: TaskRunnerConfig,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    let registry = Arc::new(handlers::builtin_registry());
    let count = concurrency.unwrap_or(config.worker.concurrency).max(1);
    let base_id = config.worker.worker_id();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = Vec::with_capacity(count);
    for n in 0..count {
        let id = if count == 1 {
            base_id.clone()
        } else {
            format!("{base_id}-{n}")
        };
        let worker = runner.worker(id, registry.clone(), &config.worker);
        loops.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }
    info!(workers = count, store = %config.store.uri, "taskrunner working, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;
    info!("shutdown requested");
    // receivers are still held by the loops, so this cannot fail
    let _ = shutdown_tx.send(true);

    for handle in loops {
        if let Err(e) = handle.await {
            warn!("worker task ended abnormally: {e}");
        }
    }
    Ok(())
}
