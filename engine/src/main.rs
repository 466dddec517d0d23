use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use shunt_agents::{ClientContext, ProviderRotation, QuotaSignature};
use shunt_core::{
    ActivityCoordinator, HeartbeatRunner, HistoryStore, Notifier, NullNotifier, Orchestrator,
    Settings, SettingsStore, TelegramNotifier, Vault,
};
use shunt_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "shunt-engine")]
#[command(about = "Headless agent execution and coordination engine")]
struct Cli {
    /// Path to config.json (defaults to ~/.shunt/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the long-lived daemon: heartbeat scheduling and idle triggers.
    Daemon,
    /// Run exactly one heartbeat cycle and exit.
    Heartbeat,
    /// Execute one detached prompt (cron contract: JSON result on stdout,
    /// logs on stderr, exit 0/1).
    Run { prompt: String },
    /// Execute one chat turn, streaming classified events as JSON lines.
    Chat {
        prompt: String,
        /// Resume an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
    },
    /// Inspect or edit the secret vault.
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },
    /// Browse stored conversations.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand, Debug)]
enum VaultAction {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    Show,
}

#[derive(Subcommand, Debug)]
enum HistoryAction {
    List {
        #[arg(long, default_value_t = 30)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    Show {
        session_id: String,
    },
}

struct Runtime {
    settings: Settings,
    activity: Arc<ActivityCoordinator>,
    orchestrator: Arc<Orchestrator>,
    heartbeat: Arc<HeartbeatRunner>,
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shunt")
        .join("config.json")
}

async fn load_settings(config: Option<PathBuf>) -> anyhow::Result<Settings> {
    let config_path = config.unwrap_or_else(default_config_path);
    let store = SettingsStore::load(&config_path).await?;
    Ok(store.get().await)
}

fn build_runtime(settings: Settings) -> anyhow::Result<Runtime> {
    std::fs::create_dir_all(&settings.agent_home_path)
        .context("creating agent home directory")?;
    std::fs::create_dir_all(&settings.storage_path).context("creating storage directory")?;

    let vault = Vault::new(&settings.vault_path);
    let ctx = ClientContext {
        storage_path: settings.storage_path.clone(),
        agent_home: settings.agent_home_path.clone(),
        template_dir: Some(settings.storage_path.join("templates")),
        env: vault.to_env()?,
    };

    let rotation = Arc::new(ProviderRotation::from_order(
        &settings.agent_use_order,
        QuotaSignature::defaults(),
    )?);
    let notifier: Arc<dyn Notifier> = if settings.enable_telegram {
        Arc::new(TelegramNotifier::new(vault)?)
    } else {
        Arc::new(NullNotifier)
    };
    let activity = ActivityCoordinator::new(
        Duration::from_secs(settings.heartbeat_cooldown_seconds),
        Duration::from_secs(settings.on_demand_cooldown_seconds),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        rotation,
        ctx,
        HistoryStore::new(settings.agent_home_path.join("history")),
        Arc::clone(&activity),
        notifier,
    ));
    let heartbeat = HeartbeatRunner::new(
        Arc::clone(&orchestrator),
        HistoryStore::new(settings.agent_home_path.join("heartbeat")),
        Arc::clone(&activity),
        settings.agent_home_path.clone(),
    );
    activity.set_trigger(heartbeat.as_trigger());

    Ok(Runtime {
        settings,
        activity,
        orchestrator,
        heartbeat,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Daemon => {
            let settings = load_settings(cli.config).await?;
            let logs_dir = canonical_logs_dir_from_root(&settings.storage_path);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            info!("logging initialized: {:?}", log_info);

            let runtime = build_runtime(settings)?;
            info!(
                "daemon starting (providers: {}, heartbeat cooldown: {}s)",
                runtime.settings.agent_use_order,
                runtime.settings.heartbeat_cooldown_seconds
            );
            runtime.activity.schedule_initial_trigger(Duration::from_secs(
                runtime.settings.initial_idle_seconds,
            ));
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
        }
        Command::Heartbeat => {
            let settings = load_settings(cli.config).await?;
            let logs_dir = canonical_logs_dir_from_root(&settings.storage_path);
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Worker, &logs_dir, LOG_RETENTION_DAYS)?;
            let runtime = build_runtime(settings)?;
            runtime.heartbeat.run_cycle().await;
        }
        Command::Run { prompt } => {
            let settings = load_settings(cli.config).await?;
            let logs_dir = canonical_logs_dir_from_root(&settings.storage_path);
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Worker, &logs_dir, LOG_RETENTION_DAYS)?;
            let runtime = build_runtime(settings)?;
            let cancel = CancellationToken::new();
            match runtime.orchestrator.run_detached(&prompt, &cancel).await {
                Ok(outcome) => {
                    // The one stdout line consumers parse.
                    println!("{}", serde_json::to_string(&outcome)?);
                }
                Err(err) => {
                    tracing::error!("detached run failed: {err:#}");
                    std::process::exit(1);
                }
            }
        }
        Command::Chat { prompt, session } => {
            let settings = load_settings(cli.config).await?;
            let logs_dir = canonical_logs_dir_from_root(&settings.storage_path);
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            let runtime = build_runtime(settings)?;
            let cancel = CancellationToken::new();
            let (tx, mut rx) = mpsc::channel(64);

            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(err) => tracing::warn!("unprintable event: {err}"),
                    }
                }
            });

            let outcome = runtime
                .orchestrator
                .run_chat(&prompt, session, &cancel, Some(&tx))
                .await;
            drop(tx);
            printer.await.ok();

            let outcome = outcome?;
            println!(
                "{}",
                serde_json::json!({
                    "session_id": outcome.session_id,
                    "success": outcome.success,
                })
            );
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Command::Vault { action } => {
            let settings = load_settings(cli.config).await?;
            let vault = Vault::new(settings.vault_path);
            match action {
                VaultAction::Get { key } => match vault.get(&key)? {
                    Some(value) => println!("{value}"),
                    None => std::process::exit(1),
                },
                VaultAction::Set { key, value } => vault.set(&key, &value)?,
                VaultAction::Delete { key } => {
                    if !vault.delete(&key)? {
                        std::process::exit(1);
                    }
                }
                VaultAction::Show => {
                    println!("{}", serde_json::to_string_pretty(&vault.to_map()?)?);
                }
            }
        }
        Command::History { action } => {
            let settings = load_settings(cli.config).await?;
            let history = HistoryStore::new(settings.agent_home_path.join("history"));
            match action {
                HistoryAction::List { limit, offset } => {
                    let summaries = history.list(limit, offset)?;
                    println!("{}", serde_json::to_string_pretty(&summaries)?);
                }
                HistoryAction::Show { session_id } => match history.load(&session_id)? {
                    Some(convo) => println!("{}", serde_json::to_string_pretty(&convo)?),
                    None => {
                        eprintln!("no conversation found for {session_id}");
                        std::process::exit(1);
                    }
                },
            }
        }
    }

    Ok(())
}
