mod agent_runner;
mod channel;
mod ipc_watcher;
mod message_loop;
mod process_group;
mod queue;
mod scheduler;
mod scheduler_wiring;
mod secrets;
mod telegram;
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use intercom_core::config::load_config;
use intercom_core::store::Store;
use tracing::info;

use channel::{Channel, InboundMessage};
use telegram::TelegramBridge;

#[derive(Parser, Debug)]
#[command(name = "intercomd", version, about = "Orchestrator core for a personal-assistant platform")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the orchestrator (GroupQueue, IPC watcher, scheduler, channel).
    Serve(ServeArgs),
    /// Print the effective config as JSON.
    PrintConfig(PrintConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/intercom.toml")]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "config/intercom.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/intercom.toml"),
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let project_root = std::env::current_dir().context("failed to resolve current working directory")?;
    let groups_dir = project_root.join(&config.storage.groups_dir);
    let data_dir = project_root.join(&config.storage.data_dir);

    let store = Arc::new(
        Store::open(project_root.join(&config.storage.path))
            .with_context(|| format!("failed to open store at {}", config.storage.path))?,
    );

    let assistant_name = std::env::var("ASSISTANT_NAME").unwrap_or_else(|_| "Amtiskaw".to_string());
    let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
    let telegram = Arc::new(TelegramBridge::new(bot_token, store.clone()));
    let channel: Arc<dyn Channel> = telegram.clone();
    if channel.is_enabled() {
        channel.connect().await.context("failed to connect telegram channel")?;
    } else {
        tracing::warn!("telegram channel disabled: no bot token configured");
    }

    let queue = Arc::new(queue::GroupQueue::new(config.orchestrator.max_concurrent, data_dir.clone()));

    let process_ctx = process_group::ProcessGroupContext {
        store: store.clone(),
        queue: queue.clone(),
        channel: channel.clone(),
        agent_config: config.agent.clone(),
        idle_timeout_ms: config.orchestrator.idle_timeout_ms,
        groups_dir: groups_dir.clone(),
        data_dir: data_dir.clone(),
        assistant_name: assistant_name.clone(),
        main_group_folder: config.orchestrator.main_group_folder.clone(),
    };
    queue
        .set_process_messages_fn(process_group::build_process_messages_fn(process_ctx))
        .await;

    message_loop::recover_pending_cursors(&store, &queue)
        .await
        .context("failed to recover pending cursors at startup")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    if config.orchestrator.enabled {
        let ml_store = store.clone();
        let ml_queue = queue.clone();
        let ml_config = message_loop::MessageLoopConfig {
            assistant_name: assistant_name.clone(),
            main_group_folder: config.orchestrator.main_group_folder.clone(),
        };
        let on_message: channel::OnMessage = Box::new(move |msg: InboundMessage| {
            let store = ml_store.clone();
            let queue = ml_queue.clone();
            let config = ml_config.clone();
            Box::pin(async move {
                if let Err(e) = message_loop::route_inbound_message(&store, &queue, &config, &msg).await {
                    tracing::error!(err = %e, "failed to route inbound message");
                }
            })
        });

        let polling_telegram = telegram.clone();
        let poll_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            polling_telegram.run_polling_loop(on_message, poll_shutdown).await;
        }));

        let ipc_config = ipc_watcher::IpcWatcherConfig {
            ipc_base_dir: data_dir.join("ipc"),
            poll_interval: Duration::from_millis(config.orchestrator.poll_interval_ms),
            main_group_folder: config.orchestrator.main_group_folder.clone(),
        };
        let watcher = Arc::new(ipc_watcher::IpcWatcher::new(ipc_config, store.clone(), channel.clone()));
        let ipc_shutdown = shutdown_rx.clone();
        let run_watcher = watcher.clone();
        handles.push(tokio::spawn(async move {
            run_watcher.run(ipc_shutdown).await;
        }));

        let sweep_watcher = watcher.clone();
        let mut sweep_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep_watcher.sweep_errors_dir(Duration::from_secs(7 * 24 * 3600), 50);
                    }
                    _ = sweep_shutdown.changed() => {
                        if *sweep_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        let retention_store = store.clone();
        let message_retention_days = config.storage.message_retention_days;
        let task_log_retention_days = config.storage.task_log_retention_days;
        let mut retention_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match retention_store
                            .run_retention_sweep(message_retention_days, task_log_retention_days)
                            .await
                        {
                            Ok((messages, logs)) => {
                                info!(messages, logs, "retention sweep complete");
                            }
                            Err(e) => tracing::error!(err = %e, "retention sweep failed"),
                        }
                    }
                    _ = retention_shutdown.changed() => {
                        if *retention_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        if config.scheduler.enabled {
            let sched_ctx = scheduler_wiring::SchedulerWiringContext {
                store: store.clone(),
                queue: queue.clone(),
                channel: channel.clone(),
                agent_config: config.agent.clone(),
                idle_timeout_ms: config.orchestrator.idle_timeout_ms,
                groups_dir: groups_dir.clone(),
                data_dir: data_dir.clone(),
                assistant_name: assistant_name.clone(),
                timezone: config.scheduler.timezone.clone(),
            };
            let task_callback = scheduler_wiring::build_task_callback(sched_ctx);
            let sched_store = store.clone();
            let sched_shutdown = shutdown_rx.clone();
            let poll_interval = Duration::from_millis(config.scheduler.poll_interval_ms);
            handles.push(tokio::spawn(async move {
                scheduler::run_scheduler_loop(poll_interval, sched_store, task_callback, sched_shutdown).await;
            }));
        }

        info!("orchestrator enabled: channel polling, IPC watcher, and scheduler wired");
    } else {
        tracing::warn!("orchestrator.enabled=false: no agent dispatch will occur");
    }

    info!("intercomd running, waiting for shutdown signal");
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("SIGINT received");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received");
        }
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    queue.shutdown(config.orchestrator.idle_timeout_ms.min(30_000)).await;
    let _ = channel.disconnect().await;

    Ok(())
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let cfg = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}
