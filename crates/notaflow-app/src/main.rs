use std::process;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::{filter::LevelFilter, fmt};

use notaflow_app::cli::{Cli, Commands, RunArgs};
use notaflow_app::config::{self, AppConfig};
use notaflow_app::error::AppError;
use notaflow_app::pipeline::extract::{PdfTableExtractor, SectionMarkers};
use notaflow_app::pipeline::transform::{FieldRule, RuleTransformer};
use notaflow_app::pipeline::worker::{spawn_workers, PipelineWorker};
use notaflow_app::services::{PgRepository, S3ObjectStore, SqsQueueClient};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(&cli));

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = config::load()?;

    match cli.command {
        Commands::Run(args) => run_workers(config, args).await,
        Commands::InitDb => init_db(config).await,
    }
}

async fn init_db(config: AppConfig) -> Result<(), AppError> {
    let pool = connect_pool(&config).await?;
    PgRepository::new(pool).ensure_schema().await?;
    tracing::info!("schema ready");
    Ok(())
}

async fn run_workers(config: AppConfig, args: RunArgs) -> Result<(), AppError> {
    let aws = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await;
    let store = Arc::new(S3ObjectStore::new(
        aws_sdk_s3::Client::new(&aws),
        config.store.bucket.clone(),
    ));
    let queue = Arc::new(SqsQueueClient::new(
        aws_sdk_sqs::Client::new(&aws),
        config.queue.url.clone(),
        config.queue.dead_letter_url.clone(),
    ));
    let repository = Arc::new(PgRepository::new(connect_pool(&config).await?));

    let extractor = Arc::new(PdfTableExtractor::new(SectionMarkers {
        start: config.extract.section_start.clone(),
        end: config.extract.section_end.clone(),
    }));
    let transformer = Arc::new(RuleTransformer::new(
        load_field_rules(&config)?,
        config.transform.date_format.clone(),
    ));

    let concurrency = args.concurrency.unwrap_or(config.worker.concurrency).max(1);
    let worker = Arc::new(PipelineWorker::new(
        store,
        queue,
        repository,
        extractor,
        transformer,
        config.worker_options(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_workers(worker, concurrency, shutdown_rx);
    tracing::info!(concurrency, queue = %config.queue.url, bucket = %config.store.bucket, "workers started");

    tokio::signal::ctrl_c().await.map_err(AppError::Signal)?;
    tracing::info!("shutdown requested; draining in-flight messages");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("all workers stopped");
    Ok(())
}

async fn connect_pool(config: &AppConfig) -> Result<sqlx::PgPool, AppError> {
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(AppError::DatabaseConnect)
}

fn load_field_rules(config: &AppConfig) -> Result<Vec<FieldRule>, AppError> {
    let Some(path) = &config.transform.rules_path else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path).map_err(|source| AppError::RulesFile {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| AppError::RulesParse {
        path: path.clone(),
        source,
    })
}
