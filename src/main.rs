use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use taskledger::config::{AppConfig, LoggingConfig};
use taskledger::scheduler::cron::{parse_timezone, CronSpec};
use taskledger::scheduler::{NewTask, TriggerType};

#[derive(Parser)]
#[command(
    name = "taskledger",
    about = "Scheduled-task execution ledger for freight back-office workflows",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + dispatch engine)
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage scheduled tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List all tasks
    List,

    /// Register a new task
    Add {
        /// Unique task code
        #[arg(long)]
        code: String,

        /// Display name
        #[arg(long)]
        name: String,

        /// Cron expression (5-field, or 6-field with seconds)
        #[arg(long)]
        cron: String,

        /// IANA timezone (defaults to executor.default_timezone)
        #[arg(long)]
        timezone: Option<String>,

        /// Workflow webhook URL
        #[arg(long)]
        webhook: Option<String>,

        /// Workflow identifier in the automation engine
        #[arg(long)]
        workflow_id: Option<String>,

        /// Register the task disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Enable a task and recompute its next run
    Enable {
        #[arg(long)]
        code: String,
    },

    /// Disable a task
    Disable {
        #[arg(long)]
        code: String,
    },

    /// Run a task now, outside its schedule
    Trigger {
        #[arg(long)]
        code: String,
    },

    /// Retry a task whose last run failed
    Retry {
        #[arg(long)]
        code: String,
    },

    /// Show recent executions of a task
    History {
        #[arg(long)]
        code: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Insert the built-in back-office task profiles
    Seed,

    /// Preview upcoming firing times of a cron expression
    Next {
        #[arg(long)]
        cron: String,

        #[arg(long)]
        timezone: Option<String>,

        #[arg(long, default_value = "5")]
        count: usize,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn fmt_time(t: Option<chrono::DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            tracing::info!(%bind, "Starting taskledger daemon");
            taskledger::serve(&config, &bind).await?;
        }
        Commands::Task { action } => run_task(action, &config).await?,
    }

    Ok(())
}

async fn run_task(action: TaskAction, config: &AppConfig) -> Result<()> {
    // `next` needs no database; every other action opens it.
    let open = || taskledger::build_scheduler(config);

    match action {
        TaskAction::Next { cron, timezone, count } => {
            let tz = timezone.unwrap_or_else(|| config.executor.default_timezone.clone());
            let spec = CronSpec::parse(&cron, &tz)?;
            let zone = parse_timezone(&tz)?;
            let runs = spec.upcoming(Utc::now(), count);
            if runs.is_empty() {
                println!("'{}' never fires.", cron);
            } else {
                println!("Upcoming runs of '{}' ({}):", cron, tz);
                for run in runs {
                    println!("{}", run.with_timezone(&zone).to_rfc3339());
                }
            }
        }
        TaskAction::List => {
            let list = open()?.list_tasks().await?;
            if list.is_empty() {
                println!("No tasks found.");
            } else {
                println!(
                    "{:<22} | {:<15} | {:<8} | {:<10} | Next run",
                    "Code", "Cron", "Active", "Last"
                );
                println!("{:-<22}-|-{:-<15}-|-{:-<8}-|-{:-<10}-|-{:-<25}", "", "", "", "", "");
                for t in list {
                    let last = t
                        .last_run_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<22} | {:<15} | {:<8} | {:<10} | {}",
                        t.code,
                        t.cron_expression,
                        t.is_active,
                        last,
                        fmt_time(t.next_run_at)
                    );
                }
            }
        }
        TaskAction::Add {
            code,
            name,
            cron,
            timezone,
            webhook,
            workflow_id,
            disabled,
        } => {
            let task = open()?
                .register_task(NewTask {
                    code,
                    name,
                    description: None,
                    cron_expression: cron,
                    timezone: timezone.unwrap_or_else(|| config.executor.default_timezone.clone()),
                    workflow_id,
                    webhook_url: webhook,
                    is_active: !disabled,
                })
                .await?;
            println!("Task '{}' added (next run: {}).", task.code, fmt_time(task.next_run_at));
        }
        TaskAction::Enable { code } => {
            let scheduler = open()?;
            let task = scheduler.get_task_by_code(&code).await?;
            let task = scheduler.enable_task(&task.id).await?;
            println!("Task '{}' enabled (next run: {}).", task.code, fmt_time(task.next_run_at));
        }
        TaskAction::Disable { code } => {
            let scheduler = open()?;
            let task = scheduler.get_task_by_code(&code).await?;
            scheduler.disable_task(&task.id).await?;
            println!("Task '{}' disabled.", code);
        }
        TaskAction::Trigger { code } => {
            let exec = open()?.run_out_of_band(&code, TriggerType::Manual).await?;
            println!(
                "Task '{}' triggered (execution {}, status {}).",
                code, exec.id, exec.status
            );
        }
        TaskAction::Retry { code } => {
            let scheduler = open()?;
            let task = scheduler.get_task_by_code(&code).await?;
            if !scheduler.can_retry_task(&task.id).await? {
                anyhow::bail!("task '{}' has no outstanding failure to retry", code);
            }
            let exec = scheduler.run_out_of_band(&code, TriggerType::Retry).await?;
            println!(
                "Task '{}' retried (execution {}, status {}).",
                code, exec.id, exec.status
            );
        }
        TaskAction::History { code, limit } => {
            let scheduler = open()?;
            let task = scheduler.get_task_by_code(&code).await?;
            let history = scheduler.task_history(&task.id, limit).await?;
            if history.is_empty() {
                println!("No executions for '{}'.", code);
            }
            for e in history {
                println!(
                    "{} | {:<9} | {:<9} | {:>8} ms | {}",
                    e.started_at.to_rfc3339(),
                    e.status.to_string(),
                    e.triggered_by.to_string(),
                    e.execution_time_ms
                        .map(|ms| ms.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    e.error_message.unwrap_or_default()
                );
            }
        }
        TaskAction::Seed => {
            let added = open()?.seed_defaults().await?;
            if added.is_empty() {
                println!("All default tasks already present.");
            } else {
                println!("Added: {}", added.join(", "));
            }
        }
    }

    Ok(())
}
