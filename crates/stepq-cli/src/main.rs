mod logging;
mod metrics_server;
mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use logging::LogFormat;
use output::OutputFormat;
use std::path::PathBuf;
use std::sync::Arc;
use stepq_bridge::{DetachedRunStore, DispatchBridge, HandlerRegistry, ProcessHandler, TaskHandler};
use stepq_broker::{BrokerConfig, ObjectStoreKind};
use stepq_core::TaskKind;
use stepq_worker::{Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "stepq")]
#[command(about = "Run orchestrator steps on a cloud queue", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML); `STEPQ_*` variables override it
    #[arg(short, long, global = true, env = "STEPQ_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Worker commands
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Request cooperative cancellation of a task
    Cancel {
        /// Task ID
        task_id: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum WorkerCommands {
    /// Poll the queues and execute tasks until interrupted
    Start {
        /// Maximum tasks executing at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Serve Prometheus metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,

        /// Command run per task; arguments arrive on stdin
        #[arg(long)]
        handler_command: Option<String>,
    },

    /// Show the configured queues and their approximate depth
    List {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.log_format);
    let config_path = args.config.as_deref();

    match args.command {
        Commands::Worker {
            command:
                WorkerCommands::Start {
                    concurrency,
                    metrics_port,
                    handler_command,
                },
        } => {
            let broker_config = BrokerConfig::load(config_path)?;
            let mut worker_config = WorkerConfig::load(config_path)?;
            if let Some(concurrency) = concurrency {
                worker_config.max_in_flight = concurrency;
            }
            if metrics_port.is_some() {
                worker_config.metrics_port = metrics_port;
            }
            if handler_command.is_some() {
                worker_config.handler_command = handler_command;
            }
            worker_config.validate()?;
            start_worker(broker_config, worker_config).await
        }

        Commands::Worker {
            command: WorkerCommands::List { format },
        } => {
            let broker = stepq_broker::connect(BrokerConfig::load(config_path)?).await?;
            let depths = broker.queue_depths().await?;
            println!("{}", output::render_depths(&depths, format)?);
            Ok(())
        }

        Commands::Cancel { task_id } => {
            let config = BrokerConfig::load(config_path)?;
            if config.object_store == ObjectStoreKind::Memory {
                warn!("object_store is memory; the marker is invisible to other processes");
            }
            let broker = stepq_broker::connect(config).await?;
            broker.cancel(task_id).await?;
            println!("Cancellation requested for {task_id}");
            Ok(())
        }
    }
}

async fn start_worker(broker_config: BrokerConfig, worker_config: WorkerConfig) -> anyhow::Result<()> {
    let handler = worker_config
        .handler_command
        .as_deref()
        .and_then(ProcessHandler::parse)
        .context("a handler command is required (--handler-command or STEPQ_HANDLER_COMMAND)")?;

    let broker = Arc::new(stepq_broker::connect(broker_config).await?);

    let handlers = Arc::new(HandlerRegistry::new());
    let handler: Arc<dyn TaskHandler> = Arc::new(handler);
    for kind in TaskKind::ALL {
        handlers.register_shared(kind.as_str(), handler.clone());
    }
    let bridge = Arc::new(DispatchBridge::new(
        broker.clone(),
        Arc::new(DetachedRunStore),
        handlers,
    ));

    let shutdown = CancellationToken::new();
    if let Some(port) = worker_config.metrics_port {
        let broker = broker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server::serve(broker, port, shutdown).await {
                error!(error = %e, "metrics server failed");
            }
        });
    }
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    Worker::new(worker_config, bridge).run(shutdown).await
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT; shutting down"),
        _ = terminate => info!("received SIGTERM; shutting down"),
    }
    shutdown.cancel();
}
