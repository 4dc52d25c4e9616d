use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use tokio::time::sleep;

use foreman_core::{
    BackoffPolicy, Configuration, Data, ExistingWorkPolicy, InputMerger, WorkId, WorkManager,
    WorkRequest, WorkResult, WorkState, Worker, WorkerContext, worker_fn,
};

/// Run a small chain of work through the scheduler.
#[derive(Debug, Parser)]
#[command(name = "foreman", version)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name greeted by the first step
    #[arg(long, default_value = "world")]
    name: String,

    /// How many attempts of the first step ask to be retried
    #[arg(long, default_value_t = 2)]
    failures: u32,

    /// Attempts before giving up on the first step
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,
}

#[derive(Debug, Deserialize)]
struct HelloInput {
    name: String,
}

struct HelloWorker {
    remaining_failures: AtomicU32,
}

impl HelloWorker {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Worker for HelloWorker {
    async fn do_work(&self, ctx: WorkerContext) -> WorkResult {
        let input: HelloInput = match serde_json::to_value(&ctx.input)
            .and_then(serde_json::from_value)
        {
            Ok(input) => input,
            Err(e) => {
                tracing::error!(error = %e, "bad input");
                return WorkResult::failure();
            }
        };

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!(attempt = ctx.run_attempt_count, left, "intentional failure");
            return WorkResult::Retry;
        }

        println!("Hello, {}!", input.name);
        WorkResult::Success(Data::empty().with("greeted", input.name))
    }
}

fn setup_logging(config: &Configuration) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

async fn wait_finished(manager: &WorkManager, id: &WorkId) -> anyhow::Result<WorkState> {
    loop {
        let info = manager
            .get_work_info_by_id(id)?
            .with_context(|| format!("work {id} disappeared"))?;
        if info.state.is_finished() {
            return Ok(info.state);
        }
        sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Configuration::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Configuration::default(),
    };
    setup_logging(&config);

    let manager = WorkManager::builder(config)
        .register("hello", Arc::new(HelloWorker::new(args.failures)))?
        .register(
            "report",
            worker_fn(|ctx| async move {
                println!("report: {}", serde_json::to_string(&ctx.input).unwrap_or_default());
                WorkResult::Success(ctx.input)
            }),
        )?
        .expect_workers(&["hello", "report"])
        .build()?;

    let hello = WorkRequest::one_time("hello")
        .with_input(Data::empty().with("name", args.name.clone()))
        .with_backoff(BackoffPolicy::Linear, Duration::from_secs(10))
        .with_max_attempts(args.max_attempts)
        .build();
    let report = WorkRequest::one_time("report")
        .with_input(Data::empty().with("step", "report"))
        .with_input_merger(InputMerger::ArrayCreating)
        .build();
    let report_id = report.id();

    manager
        .begin_unique_work("demo", ExistingWorkPolicy::Replace, vec![hello])
        .then(vec![report])
        .enqueue()?;

    let state = tokio::select! {
        state = wait_finished(&manager, &report_id) => state?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            manager.shutdown().await;
            return Ok(());
        }
    };

    for info in manager.get_work_infos_for_unique_work("demo")? {
        tracing::info!(work_id = %info.id, state = %info.state, attempts = info.run_attempt_count, "final state");
    }
    println!("chain finished: {state}");
    manager.shutdown().await;
    Ok(())
}
