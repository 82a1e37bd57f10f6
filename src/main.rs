//! # EvalFlow — Evaluation Lifecycle Scheduler
//!
//! Runs the job engine and the consolidated batch runner against a shared
//! SQLite database, and exposes the coordinator entry points for operators.
//!
//! Usage:
//!   evalflow serve                       # Run the job engine + batch runner
//!   evalflow eval import eval.json       # Store an evaluation from JSON
//!   evalflow eval create 42              # Schedule jobs for a new evaluation
//!   evalflow fire 42 due                 # Deliver a job by hand
//!   evalflow jobs 42                     # List scheduled jobs
//!   evalflow lock --holder ops obtain nightly --ttl-secs 600

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evalflow_core::config::EvalFlowConfig;
use evalflow_core::traits::{
    Clock, DistributedLock, EvaluationStore, GroupMembershipSyncer, NotificationSender,
    SystemClock,
};
use evalflow_core::types::{EvalAction, EvalId, Evaluation, JobType};
use evalflow_scheduler::batch::spawn_batch_runner;
use evalflow_scheduler::engine::spawn_job_engine;
use evalflow_scheduler::{
    BatchNotificationRunner, Collaborators, JobCoordinator, JobEngine, LoggingNotifier,
    SchedulerDb, WebhookNotifier, state,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "evalflow",
    version,
    about = "📅 EvalFlow — date-driven evaluation lifecycle scheduler"
)]
struct Cli {
    /// Config file (default: ~/.evalflow/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job engine and the batch notification runner until Ctrl-C
    Serve,
    /// Evaluation changes
    Eval {
        #[command(subcommand)]
        action: EvalCommand,
    },
    /// Deliver a job for an evaluation now
    Fire {
        id: EvalId,
        /// created, active, reminder, due, closed, viewable, viewable_instructors, viewable_students
        job_type: String,
    },
    /// Show stored and computed state
    State { id: EvalId },
    /// List scheduled jobs for an evaluation
    Jobs { id: EvalId },
    /// Cluster lock maintenance
    Lock {
        /// Holder id (default: the configured server id)
        #[arg(long)]
        holder: Option<String>,
        #[command(subcommand)]
        action: LockCommand,
    },
}

#[derive(Subcommand)]
enum EvalCommand {
    /// Store an evaluation read from a JSON file and print its id
    Import { path: PathBuf },
    Create { id: EvalId },
    Update { id: EvalId },
    Delete { id: EvalId },
}

#[derive(Subcommand)]
enum LockCommand {
    Obtain {
        name: String,
        #[arg(long, default_value_t = 60)]
        ttl_secs: u64,
    },
    Release { name: String },
}

/// Everything a command needs, wired against one database.
struct App {
    config: EvalFlowConfig,
    db: Arc<SchedulerDb>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationSender>,
    groups: Arc<dyn GroupMembershipSyncer>,
}

impl App {
    fn open(config: EvalFlowConfig) -> Result<Self> {
        let db_path = config.database_path();
        let db = Arc::new(
            SchedulerDb::open(&db_path)
                .with_context(|| format!("opening database {}", db_path.display()))?,
        );
        db.seed_settings(&config.settings.pairs())?;

        let (notifier, groups): (Arc<dyn NotificationSender>, Arc<dyn GroupMembershipSyncer>) =
            match WebhookNotifier::from_config(&config.notify) {
                Some(webhook) => {
                    let webhook = Arc::new(webhook);
                    (webhook.clone(), webhook)
                }
                None => {
                    tracing::info!("📭 No webhook configured, notifications are logged only");
                    let logger = Arc::new(LoggingNotifier::new());
                    (logger.clone(), logger)
                }
            };

        Ok(Self {
            config,
            db,
            clock: Arc::new(SystemClock),
            notifier,
            groups,
        })
    }

    fn coordinator(&self) -> Arc<JobCoordinator> {
        Arc::new(JobCoordinator::new(Collaborators {
            evaluations: self.db.clone(),
            jobs: self.db.clone(),
            notifier: self.notifier.clone(),
            settings: self.db.clone(),
            groups: self.groups.clone(),
            lock_graph: self.db.clone(),
            clock: self.clock.clone(),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "evalflow=debug,evalflow_scheduler=debug,evalflow_core=debug"
    } else {
        "evalflow=info,evalflow_scheduler=info,evalflow_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(path).to_string());
            EvalFlowConfig::load_from(&path)?
        }
        None => EvalFlowConfig::load()?,
    };
    let app = App::open(config)?;

    match cli.command {
        Commands::Serve => serve(app).await,
        Commands::Eval { action } => eval_command(&app, action).await,
        Commands::Fire { id, job_type } => {
            let job_type: JobType = job_type.parse()?;
            app.coordinator().on_job_fired(id, job_type).await?;
            println!("✅ {job_type} job delivered for evaluation {id}");
            Ok(())
        }
        Commands::State { id } => {
            let eval = app
                .db
                .get_by_id(id)
                .await?
                .with_context(|| format!("evaluation {id} not found"))?;
            let now = app.clock.now();
            let report = serde_json::json!({
                "id": id,
                "title": eval.title,
                "stored_state": eval.state,
                "computed_state": state::resolve(&eval, true, now),
                "start_date": eval.start_date,
                "due_date": eval.due_date,
                "stop_date": eval.stop_date,
                "view_date": eval.view_date,
                "locked": eval.locked,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Jobs { id } => {
            let jobs = app.db.jobs_for(id)?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(())
        }
        Commands::Lock { holder, action } => {
            let holder = holder.unwrap_or_else(|| app.config.server_id.clone());
            lock_command(&app, &holder, action).await
        }
    }
}

async fn serve(app: App) -> Result<()> {
    let coordinator = app.coordinator();
    let engine = Arc::new(tokio::sync::Mutex::new(JobEngine::new(
        coordinator,
        app.db.clone(),
        app.clock.clone(),
        &app.config.scheduler,
    )));
    let runner = Arc::new(BatchNotificationRunner::new(
        app.db.clone(),
        app.notifier.clone(),
        app.db.clone(),
        app.db.clone(),
        app.clock.clone(),
        &app.config.batch,
        &app.config.server_id,
    ));

    println!("📅 EvalFlow v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:   {}", app.config.database_path().display());
    println!("   🆔 Server id:  {}", app.config.server_id);
    println!("   ⏰ Poll every: {}s", app.config.scheduler.poll_interval_secs);
    println!("   📣 Digests:    every {}s", app.config.batch.interval_secs);
    println!();

    let engine_task = tokio::spawn(spawn_job_engine(engine.clone(), app.config.scheduler.poll_interval_secs));
    let batch_task = tokio::spawn(spawn_batch_runner(runner, app.config.batch.interval_secs));

    tokio::signal::ctrl_c().await?;
    engine_task.abort();
    batch_task.abort();

    let stats = engine.lock().await.stats().clone();
    tracing::info!(
        "👋 Shutting down: {} fired, {} failed, {} skipped",
        stats.fired,
        stats.failed,
        stats.skipped
    );
    Ok(())
}

async fn eval_command(app: &App, action: EvalCommand) -> Result<()> {
    let (id, action) = match action {
        EvalCommand::Import { path } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let eval: Evaluation = serde_json::from_str(&raw)?;
            eval.validate_dates()?;
            let id = app.db.insert_evaluation(&eval)?;
            println!("✅ Stored evaluation {id}");
            return Ok(());
        }
        EvalCommand::Create { id } => (id, EvalAction::Create),
        EvalCommand::Update { id } => (id, EvalAction::Update),
        EvalCommand::Delete { id } => (id, EvalAction::Delete),
    };

    let coordinator = app.coordinator();
    coordinator.on_evaluation_change(id, action).await?;
    let jobs = app.db.jobs_for(id)?;
    println!("✅ {action:?} handled for evaluation {id}, {} job(s) scheduled", jobs.len());
    for job in jobs {
        println!("   • {} at {}", job.job_type, job.run_at.to_rfc3339());
    }
    Ok(())
}

async fn lock_command(app: &App, holder: &str, action: LockCommand) -> Result<()> {
    match action {
        LockCommand::Obtain { name, ttl_secs } => {
            let ttl = std::time::Duration::from_secs(ttl_secs);
            if app.db.obtain(&name, holder, ttl).await? {
                println!("🔒 Lock '{name}' obtained by {holder} for {ttl_secs}s");
            } else {
                println!("⏳ Lock '{name}' is held by another process");
            }
        }
        LockCommand::Release { name } => {
            if app.db.release(&name, holder).await? {
                println!("🔓 Lock '{name}' released");
            } else {
                println!("⚠️  Lock '{name}' was not held by {holder}");
            }
        }
    }
    Ok(())
}
