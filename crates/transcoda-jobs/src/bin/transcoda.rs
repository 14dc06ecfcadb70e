//! transcoda: command-line entry point for the conversion pipeline.
//!
//! Runs migrations, the queue worker, and a few operator commands against the
//! configured PostgreSQL database and object store.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use transcoda_db::{Database, FilesystemObjectStore, ObjectStoreConfig, PoolConfig, QueueConfig};
use transcoda_jobs::defaults::PRESIGN_TTL_SECS;
use transcoda_jobs::{
    CommandEncoder, ConversionLimiter, Converter, ConverterConfig, EncoderConfig, JobQueue,
    JobStore, ObjectStore, QueueWorker, SubmitRequest, Submitter, UserStore, WorkerConfig,
    WorkerEvent,
};

#[derive(Parser)]
#[command(name = "transcoda")]
#[command(author, version, about = "Asynchronous audio conversion pipeline")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Consume the conversion queue until interrupted
    Worker,

    /// Upload a file and enqueue its conversion
    Submit {
        /// Username of the requesting user
        #[arg(short, long)]
        user: String,

        /// Target format, e.g. "wav"
        #[arg(short, long)]
        target: String,

        /// Source format (default: the file extension)
        #[arg(short, long)]
        source_format: Option<String>,

        /// Audio file to convert
        path: PathBuf,
    },

    /// List a user's conversion requests, oldest first
    History {
        /// Username
        #[arg(short, long)]
        user: String,
    },

    /// Show an audio record and a download URL for it
    Audio {
        /// Audio id
        id: Uuid,
    },

    /// Show queue depth, and optionally one request
    Status {
        /// Request id
        #[arg(short, long)]
        request: Option<Uuid>,
    },

    /// Create a user account
    AddUser {
        /// Username (must be unique)
        username: String,

        /// Already-hashed password to store
        #[arg(long)]
        password_hash: String,
    },
}

const POOL_USAGE_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "transcoda=info,transcoda_jobs=info,transcoda_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("transcoda.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Logs go to stderr so command output on stdout stays parseable.
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}

fn scratch_dir() -> PathBuf {
    ConverterConfig::from_env().scratch_dir
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn connect(pool: PoolConfig) -> anyhow::Result<Database> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = Database::connect_with_config(&url, pool)
        .await
        .context("failed to connect to database")?;
    Ok(db)
}

fn object_store() -> anyhow::Result<Arc<FilesystemObjectStore>> {
    let config = ObjectStoreConfig::from_env()?;
    Ok(Arc::new(FilesystemObjectStore::new(config)))
}

async fn run_worker() -> anyhow::Result<()> {
    let limiter = ConversionLimiter::from_env();
    let worker_config = WorkerConfig::from_env();
    let queue_config = QueueConfig::from_env();
    let converter_config = ConverterConfig::from_env().bounded_by_lease(queue_config.lease);

    let pool = PoolConfig::from_env().for_worker(limiter.capacity(), worker_config.consumers);
    let db = connect(pool).await?;
    let objects = object_store()?;
    let encoder = CommandEncoder::new(EncoderConfig::from_env())?;
    let queue = Arc::new(db.queue(queue_config));

    let converter = Arc::new(Converter::new(
        Arc::new(db.requests.clone()),
        objects,
        Arc::new(encoder),
        converter_config,
    ));
    let worker = QueueWorker::new(queue.clone(), converter, limiter, worker_config);
    let handle = worker.start();

    let mut events = handle.events();
    let reporter = tokio::spawn(async move {
        let mut usage = tokio::time::interval(POOL_USAGE_INTERVAL);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(WorkerEvent::JobFailed { request_id, error }) => {
                        error!(request_id = %request_id, error = %error, "Conversion job failed");
                        db.log_pool_usage();
                    }
                    Ok(WorkerEvent::WorkerStopped) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                },
                _ = usage.tick() => {
                    db.log_pool_usage();
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested, draining in-flight jobs");
    handle.shutdown();
    queue.close();
    handle.join().await?;
    reporter.abort();
    info!("Worker exited");
    Ok(())
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        // Connects on its own, with a pool sized for its concurrency.
        Commands::Worker => run_worker().await,
        command => run_command(connect(PoolConfig::from_env()).await?, command).await,
    }
}

async fn run_command(db: Database, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Migrate => {
            db.migrate().await.context("migration failed")?;
            info!("Migrations applied");
        }

        Commands::Worker => run_worker().await?,

        Commands::Submit {
            user,
            target,
            source_format,
            path,
        } => {
            let source_format = match source_format {
                Some(format) => format,
                None => path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase())
                    .context("cannot infer source format; pass --source-format")?,
            };
            let filename = path
                .file_name()
                .and_then(|f| f.to_str())
                .context("path has no file name")?
                .to_string();
            let user = db.users.get_user_credentials(&user).await?;

            let submitter = Submitter::new(
                Arc::new(db.requests.clone()),
                object_store()?,
                Arc::new(db.queue(QueueConfig::from_env())),
                scratch_dir(),
            );
            let request_id = submitter
                .submit(SubmitRequest {
                    source_path: path,
                    filename,
                    source_format,
                    target_format: target.to_ascii_lowercase(),
                    user_id: user.id,
                })
                .await?;
            print_json(&serde_json::json!({ "request_id": request_id }))?;
        }

        Commands::History { user } => {
            let user = db.users.get_user_credentials(&user).await?;
            let history = db.requests.get_request_history(user.id).await?;
            print_json(&history)?;
        }

        Commands::Audio { id } => {
            let audio = db.requests.get_audio_by_id(id).await?;
            let url = object_store()?
                .presigned_url(&audio.object_key(), Duration::from_secs(presign_ttl_secs()))?;
            print_json(&serde_json::json!({ "audio": audio, "url": url }))?;
        }

        Commands::Status { request } => {
            let depth = db.queue(QueueConfig::from_env()).depth().await?;
            let request = match request {
                Some(id) => Some(db.requests.get_request(id).await?),
                None => None,
            };
            print_json(&serde_json::json!({ "queue": depth, "request": request }))?;
        }

        Commands::AddUser {
            username,
            password_hash,
        } => {
            let id = db.users.insert_user(&username, &password_hash).await?;
            print_json(&serde_json::json!({ "user_id": id }))?;
        }
    }

    Ok(())
}

fn presign_ttl_secs() -> u64 {
    std::env::var("PRESIGN_TTL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(PRESIGN_TTL_SECS)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format!("{:#}", e);
            error!(error = %message, "Command failed");
            eprintln!("Error: {}", message);
            ExitCode::FAILURE
        }
    }
}
