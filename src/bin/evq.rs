//! evq CLI: dispatcher, worker, and operator commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use evidence_queue::config::{ServerConfig, ToolsConfig, WorkerConfig};
use evidence_queue::db::Db;
use evidence_queue::dispatch::{DispatchConfig, Dispatcher};
use evidence_queue::hooks::{HookRunner, NamePatternRules};
use evidence_queue::model::{Case, Evidence, Hook, HookTrigger, Job, JobId, JobStatus, PushJobRequest};
use evidence_queue::module::{Module, ModuleRegistry};
use evidence_queue::telemetry::{Role, TelemetryConfig, init_telemetry};
use evidence_queue::server;
use evidence_queue::worker::{DispatcherClient, WorkerRuntime};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "evq", about = "Evidence processing job queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher (HTTP server)
    Serve {
        /// Override BIND_ADDR
        #[arg(long)]
        bind: Option<std::net::SocketAddr>,
    },
    /// Run a worker connected to SERVER_URL
    Work {
        /// Override WORKER_CONCURRENCY
        #[arg(long)]
        concurrency: Option<usize>,
        /// Override TOOLS_CONFIG
        #[arg(long)]
        tools: Option<PathBuf>,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Hook operations
    Hook {
        #[command(subcommand)]
        action: HookAction,
    },
    /// Case operations
    Case {
        #[command(subcommand)]
        action: CaseAction,
    },
    /// Evidence operations
    Evidence {
        #[command(subcommand)]
        action: EvidenceAction,
    },
    /// List modules, or the modules runnable on one evidence item
    Modules {
        #[arg(long, requires = "evidence")]
        case: Option<String>,
        #[arg(long, requires = "case")]
        evidence: Option<String>,
        /// Run prerequisite checks against a tools config
        #[arg(long, conflicts_with = "case")]
        check: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Queue a module run for an evidence item
    Push {
        case_id: String,
        evidence_id: String,
        module: String,
    },
    /// List jobs
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Only jobs for this evidence item
        #[arg(long)]
        evidence: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a job
    Show {
        /// Job ID (full or prefix)
        id: String,
    },
}

#[derive(Subcommand)]
enum HookAction {
    /// Run MODULE whenever added evidence matches CONDITION
    Add {
        name: String,
        module: String,
        /// Glob over the evidence name, e.g. "*.evtx"
        condition: String,
        #[arg(long)]
        disabled: bool,
    },
    List,
    Remove { id: String },
}

#[derive(Subcommand)]
enum CaseAction {
    Add {
        id: String,
        name: String,
        #[arg(long, default_value_t = 0)]
        sketch_id: i64,
    },
}

#[derive(Subcommand)]
enum EvidenceAction {
    /// Register an evidence file already placed under the evidence directory
    Add {
        case_id: String,
        name: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long = "type", default_value = "Other")]
        kind: String,
        #[arg(long, default_value = "")]
        source: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { bind } => cmd_serve(bind).await,
        Command::Work { concurrency, tools } => cmd_work(concurrency, tools).await,
        Command::Modules {
            case,
            evidence,
            check,
        } => cmd_modules(case, evidence, check).await,
        Command::Job { action } => {
            let dispatcher = offline_dispatcher().await?;
            match action {
                JobAction::Push {
                    case_id,
                    evidence_id,
                    module,
                } => cmd_job_push(&dispatcher, case_id, evidence_id, module).await,
                JobAction::List {
                    status,
                    evidence,
                    limit,
                } => cmd_job_list(dispatcher.db(), status, evidence, limit).await,
                JobAction::Show { id } => cmd_job_show(dispatcher.db(), id).await,
            }
        }
        Command::Hook { action } => {
            let dispatcher = offline_dispatcher().await?;
            match action {
                HookAction::Add {
                    name,
                    module,
                    condition,
                    disabled,
                } => cmd_hook_add(dispatcher.hooks(), dispatcher.db(), name, module, condition, !disabled).await,
                HookAction::List => cmd_hook_list(dispatcher.db()).await,
                HookAction::Remove { id } => {
                    dispatcher.db().delete_hook(&id).await?;
                    println!("Removed hook {id}");
                    Ok(())
                }
            }
        }
        Command::Case { action } => {
            let dispatcher = offline_dispatcher().await?;
            match action {
                CaseAction::Add {
                    id,
                    name,
                    sketch_id,
                } => {
                    dispatcher
                        .db()
                        .save_case(&Case {
                            id: id.clone(),
                            name,
                            sketch_id,
                        })
                        .await?;
                    println!("Saved case {id}");
                    Ok(())
                }
            }
        }
        Command::Evidence { action } => {
            let dispatcher = offline_dispatcher().await?;
            match action {
                EvidenceAction::Add {
                    case_id,
                    name,
                    id,
                    kind,
                    source,
                } => cmd_evidence_add(&dispatcher, case_id, name, id, kind, source).await,
            }
        }
    }
}

/// Open the store for one-shot operator commands. Never sweeps: a server
/// may be running against the same database.
async fn offline_dispatcher() -> anyhow::Result<Dispatcher> {
    let config = ServerConfig::from_env()?;
    let db = Db::connect(&config.database_url).await?;
    db.migrate().await?;
    Ok(Dispatcher::new(
        Arc::new(db),
        Arc::new(ModuleRegistry::catalog()?),
        Arc::new(NamePatternRules),
        DispatchConfig::default(),
    ))
}

async fn cmd_serve(bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;

    let db = Db::connect(&config.database_url).await?;
    let _guard = init_telemetry(
        TelemetryConfig::new(Role::Dispatcher, db.instance_token().as_str())
            .with_endpoint(config.otel_endpoint.clone())
            .with_filter(config.log_level.clone()),
    )?;
    db.migrate().await?;
    info!(instance = %db.instance_token(), "dispatcher starting");

    let dispatcher = Arc::new(
        Dispatcher::start(
            Arc::new(db),
            Arc::new(ModuleRegistry::catalog()?),
            Arc::new(NamePatternRules),
            DispatchConfig {
                poll_interval: config.poll_interval,
                keepalive_interval: config.keepalive_interval,
            },
        )
        .await?,
    );

    let addr = bind.unwrap_or(config.bind_addr);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    let app = server::router(Arc::clone(&dispatcher), config.api_key);

    let ctrl = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        ctrl.shutdown();
    });

    server::serve(listener, app, dispatcher.shutdown_token()).await?;
    Ok(())
}

async fn cmd_work(concurrency: Option<usize>, tools: Option<PathBuf>) -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;

    let _guard = init_telemetry(
        TelemetryConfig::new(Role::Worker, uuid::Uuid::new_v4().simple().to_string())
            .with_endpoint(config.otel_endpoint.clone())
            .with_filter(config.log_level.clone()),
    )?;

    let tools = ToolsConfig::load(&tools.unwrap_or(config.tools_config))?;
    let registry = ModuleRegistry::builtin(tools, &config.evidence_dir)?
        .available()
        .await;
    let client = DispatcherClient::new(&config.server_url, config.api_key, config.skip_verify_tls)?;

    let runtime = Arc::new(
        WorkerRuntime::new(
            client,
            Arc::new(registry),
            concurrency.unwrap_or(config.concurrency),
        )
        .with_reconnect_delay(config.reconnect_delay),
    );

    let ctrl = Arc::clone(&runtime);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested, finishing in-flight jobs");
        ctrl.shutdown();
    });

    runtime.run().await?;
    Ok(())
}

async fn cmd_modules(
    case: Option<String>,
    evidence: Option<String>,
    check: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let (Some(case_id), Some(evidence_id)) = (case, evidence) {
        let dispatcher = offline_dispatcher().await?;
        let runs = dispatcher.runnable_modules(&case_id, &evidence_id).await?;
        if runs.is_empty() {
            println!("No modules apply to this evidence.");
        }
        for run in runs {
            let status = run.status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
            println!("{:<30}  {:<10}  {}", run.name, status, run.error);
        }
        return Ok(());
    }

    let registry = match check {
        Some(path) => {
            let tools = ToolsConfig::load(&path)?;
            ModuleRegistry::builtin(tools, Path::new("."))?
                .available()
                .await
        }
        None => ModuleRegistry::catalog()?,
    };
    for module in registry.iter() {
        println!("{:<30}  {}", module.name(), module.description());
    }
    Ok(())
}

async fn cmd_job_push(
    dispatcher: &Dispatcher,
    case_id: String,
    evidence_id: String,
    module_name: String,
) -> anyhow::Result<()> {
    let job = dispatcher
        .push_job(PushJobRequest {
            case_id,
            evidence_id,
            module_name,
        })
        .await?;
    println!("Queued: {} ({} on {})", job.id, job.module_name, job.evidence_id);
    Ok(())
}

async fn cmd_job_list(
    db: &Db,
    status: Option<String>,
    evidence: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let status: Option<JobStatus> = status.map(|s| s.parse()).transpose()?;

    let jobs: Vec<Job> = match evidence {
        Some(evidence_id) => db
            .list_jobs(&evidence_id)
            .await?
            .into_iter()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect(),
        None => db.list_jobs_by_status(status, limit).await?,
    };

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<28}  {:<10}  {:<12}  CREATED",
        "ID", "MODULE", "STATUS", "EVIDENCE"
    );
    println!("{}", "-".repeat(80));
    for job in &jobs {
        let short_id: String = job.id.as_str().chars().take(8).collect();
        println!(
            "{:<8}  {:<28}  {:<10}  {:<12}  {}",
            short_id,
            job.module_name,
            job.status,
            job.evidence_id,
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_job_show(db: &Db, id: String) -> anyhow::Result<()> {
    let job = if id.len() < 32 {
        let mut matches = db.find_jobs_by_prefix(&id, 2).await?;
        match matches.len() {
            0 => anyhow::bail!("no job matching prefix '{id}'"),
            1 => matches.remove(0),
            _ => anyhow::bail!("several jobs match prefix '{id}', be more specific"),
        }
    } else {
        db.get_job(&JobId(id)).await?
    };

    println!("ID:         {}", job.id);
    println!("Module:     {}", job.module_name);
    println!("Case:       {}", job.case_id);
    println!("Evidence:   {}", job.evidence_id);
    println!("Status:     {}", job.status);
    if !job.error.is_empty() {
        println!("Error:      {}", job.error);
    }
    println!("Worker:     {}", if job.worker_token.is_empty() { "-" } else { job.worker_token.as_str() });
    println!("Server:     {}", job.server_token);
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    Ok(())
}

async fn cmd_hook_add(
    hooks: &HookRunner,
    db: &Db,
    name: String,
    module: String,
    condition: String,
    enabled: bool,
) -> anyhow::Result<()> {
    let hook = Hook {
        id: uuid::Uuid::new_v4().simple().to_string(),
        trigger: HookTrigger::OnEvidenceAdded,
        name,
        module,
        condition,
        enabled,
    };
    hooks.validate(&hook)?;
    db.save_hook(&hook).await?;
    println!("Added hook {} ({})", hook.id, hook.name);
    Ok(())
}

async fn cmd_hook_list(db: &Db) -> anyhow::Result<()> {
    let hooks = db.list_hooks().await?;
    if hooks.is_empty() {
        println!("No hooks configured.");
        return Ok(());
    }
    for hook in hooks {
        println!(
            "{}  {:<20}  {:<28}  {:<20}  {}",
            hook.id,
            hook.name,
            hook.module,
            hook.condition,
            if hook.enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}

async fn cmd_evidence_add(
    dispatcher: &Dispatcher,
    case_id: String,
    name: String,
    id: Option<String>,
    kind: String,
    source: String,
) -> anyhow::Result<()> {
    let evidence = Evidence {
        id: id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
        case_id,
        kind,
        name,
        source,
        notes: String::new(),
        size: 0,
        hash: String::new(),
        added_at: chrono::Utc::now(),
    };
    let jobs = dispatcher.register_evidence(evidence.clone()).await?;
    println!("Registered evidence {} ({})", evidence.id, evidence.name);
    for job in jobs {
        println!("  hook queued {} ({})", job.id, job.module_name);
    }
    Ok(())
}
