//! ccron - A cluster-aware cron scheduler.
//!
//! Usage:
//!   ccron run <settings> <jobs-dir>          Run a scheduler node with jobs from a directory
//!   ccron validate <jobs-dir>                Validate job documents without running
//!   ccron owners <jobs-dir> --nodes a,b,c    Show which node would own each job

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use clustercron::cluster::{NodeComparator, resolve_owner};
use clustercron::config::import_documents;
use clustercron::core::job::UNKNOWN_VERSION;
use clustercron::{
    DefaultJobConfigFactory, Event, EventBus, EventHandler, Job, JobConfigFactory, JobError,
    JobExecutionContext, JobKey, JobRegistry, NodeDescriptor, NodeFilter, NodeIdComparator,
    NodeSettings, Scheduler, load_documents_from_directory,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Job type the command line registers.
const LOG_JOB_TYPE: &str = "log";

/// ccron - A cluster-aware cron scheduler
#[derive(Parser)]
#[command(name = "ccron")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scheduler node
    Run {
        /// Path to the node settings YAML file
        #[arg(value_name = "SETTINGS")]
        settings: PathBuf,

        /// Path to the directory containing job documents
        #[arg(value_name = "JOBS_DIR")]
        jobs_dir: PathBuf,
    },

    /// Validate job documents without running
    Validate {
        /// Path to the directory containing job documents
        #[arg(value_name = "JOBS_DIR")]
        jobs_dir: PathBuf,
    },

    /// Print the owner of each job for a given roster
    Owners {
        /// Path to the directory containing job documents
        #[arg(value_name = "JOBS_DIR")]
        jobs_dir: PathBuf,

        /// Comma-separated node ids
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,

        /// Node filter expression
        #[arg(long)]
        filter: Option<String>,

        /// Config index the documents belong to
        #[arg(long, default_value = "jobs")]
        index: String,
    },
}

/// Job that logs each firing.
struct LoggingJob;

#[async_trait]
impl Job for LoggingJob {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError> {
        info!(
            job = %ctx.key,
            run = %ctx.run_id,
            node = %ctx.node,
            scheduled = %ctx.scheduled_fire_time,
            "job fired"
        );
        if let Some(message) = ctx.data_str("message") {
            info!("  {}", message);
        }
        Ok(())
    }
}

/// Simple logging event handler that prints scheduler events.
struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobCompleted {
                key,
                run_id,
                success,
                error: job_error,
                duration,
                ..
            } => {
                if *success {
                    info!("Job '{}' completed in {:?} (run: {})", key, duration, run_id);
                } else {
                    error!(
                        "Job '{}' failed after {:?} (run: {}): {}",
                        key,
                        duration,
                        run_id,
                        job_error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            Event::JobMisfired {
                key,
                missed_fire_time,
                fire_now,
                ..
            } => {
                let action = if *fire_now { "firing now" } else { "skipped" };
                warn!("Job '{}' missed {} ({})", key, missed_fire_time, action);
            }
            Event::JobsUpdated {
                new,
                updated,
                deleted,
                ..
            } => {
                info!("Jobs updated: new: {}; upd: {}; del: {}", new, updated, deleted);
            }
            Event::OwnershipChanged {
                eligible_nodes,
                local_eligible,
                ..
            } => {
                info!(
                    "Ownership changed: {} eligible node(s), local node eligible: {}",
                    eligible_nodes, local_eligible
                );
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { settings, jobs_dir } => {
            run_node(settings, jobs_dir).await?;
        }
        Commands::Validate { jobs_dir } => {
            validate_jobs(jobs_dir)?;
        }
        Commands::Owners {
            jobs_dir,
            nodes,
            filter,
            index,
        } => {
            print_owners(jobs_dir, nodes, filter, index)?;
        }
    }

    Ok(())
}

/// Run a scheduler node.
async fn run_node(settings: PathBuf, jobs_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading settings from: {}", settings.display());
    let settings = NodeSettings::load(&settings)?;

    let store = settings.storage.open().await?;
    let config_index = settings
        .config_index
        .clone()
        .unwrap_or_else(|| settings.scheduler_name.clone());

    info!("Loading jobs from: {}", jobs_dir.display());
    let documents = load_documents_from_directory(&jobs_dir)?;
    if documents.is_empty() {
        warn!("No job documents found in {}", jobs_dir.display());
    }
    let imported = import_documents(store.as_ref(), &config_index, documents).await?;
    info!("Imported {} job document(s) into '{}'", imported, config_index);

    // Create event bus with logging handler
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    let registry = JobRegistry::new().register_instance(LOG_JOB_TYPE, Arc::new(LoggingJob));
    let scheduler = settings
        .configure(Scheduler::builder(settings.scheduler_name.clone()))
        .store(store)
        .job_factory(Arc::new(registry))
        .job_config_factory(Arc::new(DefaultJobConfigFactory::new(LOG_JOB_TYPE)))
        .event_bus(event_bus)
        .build()?;

    info!(
        "Starting scheduler '{}' on node '{}'...",
        scheduler.name(),
        scheduler.local_node().id
    );
    if !scheduler.is_local_node_eligible() {
        warn!("The node filter excludes this node; it will not run any job");
    }
    info!("Press Ctrl+C to stop");

    let (handle, scheduler_task) = scheduler.start().await;

    // Wait for Ctrl+C
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    info!("Goodbye!");
    Ok(())
}

/// Validate job documents without running.
fn validate_jobs(jobs_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating jobs in: {}", jobs_dir.display());

    let documents = load_documents_from_directory(&jobs_dir)?;
    let factory = DefaultJobConfigFactory::new(LOG_JOB_TYPE);
    let mut invalid = 0;

    for (id, document) in &documents {
        let key = JobKey::new("jobs", id.as_str());
        match factory.create_from_document(key, document, UNKNOWN_VERSION) {
            Ok(config) => {
                let next = config
                    .schedule()
                    .first_fire_time(chrono::Utc::now())
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|_| "never".to_string());
                info!(
                    "  - {} ({}): OK, next fire {}",
                    id,
                    config.schedule().expression(),
                    next
                );
            }
            Err(e) => {
                error!("  - {}: {}", id, e);
                invalid += 1;
            }
        }
    }

    if invalid > 0 {
        error!("Validation failed: {} of {} job(s) invalid", invalid, documents.len());
        return Err(format!("{} invalid job document(s)", invalid).into());
    }

    info!("All {} job(s) are valid", documents.len());
    Ok(())
}

/// Print the owner of each job for a hypothetical roster.
fn print_owners(
    jobs_dir: PathBuf,
    nodes: Vec<String>,
    filter: Option<String>,
    index: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let documents = load_documents_from_directory(&jobs_dir)?;
    let factory = DefaultJobConfigFactory::new(LOG_JOB_TYPE);

    let roster: Vec<NodeDescriptor> = nodes
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(NodeDescriptor::new)
        .collect();
    let Some(local) = roster.first().map(|n| n.id.clone()) else {
        return Err("at least one node is required".into());
    };

    let mut eligible = match &filter {
        Some(expr) => NodeFilter::parse(expr)?.select(&roster, &local),
        None => roster.clone(),
    };
    let comparator = NodeIdComparator;
    eligible.sort_by(|a, b| comparator.compare(a, b));

    println!(
        "Eligible nodes: {}",
        eligible
            .iter()
            .map(|n| n.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();

    for (id, document) in &documents {
        let key = JobKey::new(index.as_str(), id.as_str());
        match factory.create_from_document(key, document, UNKNOWN_VERSION) {
            Ok(config) => {
                let owner = resolve_owner(config.effective_hash(), &eligible)
                    .map(|n| n.id.to_string())
                    .unwrap_or_else(|| "<none>".to_string());
                println!("{} -> {}", config.key(), owner);
            }
            Err(e) => println!("{} -> invalid: {}", id, e),
        }
    }

    Ok(())
}
