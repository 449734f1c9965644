mod config;
mod logging;
mod seed;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tandem_client::HttpTransport;
use tandem_graph::memory::MemoryFhirServer;
use tandem_graph::{
    CodeResolver, FhirTransport, LoadStrategy, NewHealthConcern, ResourceGraph,
    StaticCodeResolver, SubjectContext, TaskStatus, TaskUpdate,
};

use crate::config::Config;

#[derive(Parser)]
#[command(
    name = "tandem",
    about = "Resolve and update SDOH referral resources on a FHIR server",
    version,
    arg_required_else_help = true
)]
struct Cli {
    /// Config file (defaults to ./tandem.{toml,json,yaml} when present).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override `fhir.base_url`.
    #[arg(long, global = true, value_name = "URL")]
    base_url: Option<String>,

    /// Override `fhir.load_strategy` (per-type or batch).
    #[arg(long, global = true)]
    load_strategy: Option<LoadStrategy>,

    /// Run against an in-process server seeded with demo records.
    #[arg(long, global = true)]
    memory: bool,

    /// Print single-line JSON instead of pretty-printed output.
    #[arg(long, global = true)]
    compact: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Task commands.
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// SDOH health concern commands.
    HealthConcern {
        #[command(subcommand)]
        command: HealthConcernCommands,
    },

    /// Print CLI version.
    Version,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Load a Task with its ServiceRequest, patient, requester and referral context.
    Resources {
        task_id: String,
    },

    /// Change a Task's status and/or add a comment.
    Update {
        task_id: String,
        /// New status (e.g. accepted, in-progress, completed, cancelled).
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Status reason; required when rejecting or cancelling.
        #[arg(long)]
        reason: Option<String>,
        /// Comment appended to Task.note.
        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Subcommand)]
enum HealthConcernCommands {
    /// List active health concerns of a patient.
    List {
        #[command(flatten)]
        subject: SubjectArgs,
    },

    /// Record a new health concern.
    Create {
        #[command(flatten)]
        subject: SubjectArgs,
        /// Free-text name of the concern.
        #[arg(long)]
        name: String,
        /// SDOH category code (e.g. housing-instability).
        #[arg(long)]
        category: String,
        /// ICD-10-CM code.
        #[arg(long)]
        icd: Option<String>,
        /// SNOMED CT code.
        #[arg(long)]
        snomed: Option<String>,
    },

    /// Move a health concern to the problem list.
    Promote {
        #[command(flatten)]
        subject: SubjectArgs,
        condition_id: String,
    },

    /// Mark a health concern resolved.
    Resolve {
        #[command(flatten)]
        subject: SubjectArgs,
        condition_id: String,
    },
}

#[derive(Args)]
struct SubjectArgs {
    /// Patient id.
    #[arg(long)]
    patient: String,
    /// Id of the Practitioner acting.
    #[arg(long)]
    user: String,
}

impl From<SubjectArgs> for SubjectContext {
    fn from(args: SubjectArgs) -> Self {
        SubjectContext::new(args.patient, args.user)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(base_url) = cli.base_url.clone() {
        config.fhir.base_url = base_url;
    }
    if let Some(strategy) = cli.load_strategy {
        config.fhir.load_strategy = strategy;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    let graph = build_graph(&config, cli.memory)?;

    match cli.command {
        Commands::Version => {}
        Commands::Task { command } => match command {
            TaskCommands::Resources { task_id } => {
                let resources = graph
                    .task_resources(&task_id)
                    .await
                    .with_context(|| format!("Failed to load resources for Task/{task_id}"))?;
                write_json(&resources, cli.compact)?;
            }
            TaskCommands::Update {
                task_id,
                status,
                reason,
                comment,
            } => {
                let update = TaskUpdate {
                    status,
                    status_reason: reason,
                    comment,
                };
                let resources = graph
                    .update_task(&task_id, &update)
                    .await
                    .with_context(|| format!("Failed to update Task/{task_id}"))?;
                write_json(&resources, cli.compact)?;
            }
        },
        Commands::HealthConcern { command } => match command {
            HealthConcernCommands::List { subject } => {
                let subject = SubjectContext::from(subject);
                let concerns = graph
                    .list_health_concerns(&subject)
                    .await
                    .context("Failed to list health concerns")?;
                write_json(&concerns, cli.compact)?;
            }
            HealthConcernCommands::Create {
                subject,
                name,
                category,
                icd,
                snomed,
            } => {
                let concern = NewHealthConcern {
                    name,
                    category,
                    icd_code: icd,
                    snomed_code: snomed,
                };
                let created = graph
                    .create_health_concern(&subject.into(), &concern)
                    .await
                    .context("Failed to create health concern")?;
                write_json(&created, cli.compact)?;
            }
            HealthConcernCommands::Promote {
                subject,
                condition_id,
            } => {
                let promoted = graph
                    .promote_health_concern(&subject.into(), &condition_id)
                    .await
                    .with_context(|| format!("Failed to promote Condition/{condition_id}"))?;
                write_json(&promoted, cli.compact)?;
            }
            HealthConcernCommands::Resolve {
                subject,
                condition_id,
            } => {
                let resolved = graph
                    .resolve_health_concern(&subject.into(), &condition_id)
                    .await
                    .with_context(|| format!("Failed to resolve Condition/{condition_id}"))?;
                write_json(&resolved, cli.compact)?;
            }
        },
    }

    Ok(())
}

fn build_graph(config: &Config, memory: bool) -> Result<ResourceGraph> {
    let transport: Arc<dyn FhirTransport> = if memory {
        let server = MemoryFhirServer::new();
        seed::seed_demo(&server);
        tracing::info!(
            patient = seed::PATIENT_ID,
            practitioner = seed::PRACTITIONER_ID,
            task = seed::TASK_ID,
            "Using in-memory FHIR server with demo records"
        );
        Arc::new(server)
    } else {
        let mut builder = HttpTransport::builder(config.fhir.base_url.as_str())
            .timeout(Duration::from_secs(config.fhir.timeout_seconds));
        if let Some(token) = &config.fhir.bearer_token {
            builder = builder.bearer_token(token.as_str());
        }
        let transport = builder.build().with_context(|| {
            format!("Failed to create FHIR client for {}", config.fhir.base_url)
        })?;
        tracing::debug!(base_url = %transport.base_url(), "Using HTTP transport");
        Arc::new(transport)
    };

    Ok(ResourceGraph::new(transport, load_codes(config)?)
        .with_load_strategy(config.fhir.load_strategy))
}

fn load_codes(config: &Config) -> Result<Arc<dyn CodeResolver>> {
    let resolver = match &config.terminology.mappings_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {path}"))?;
            StaticCodeResolver::from_json_str(&raw)
                .with_context(|| format!("Failed to parse code mappings in {path}"))?
        }
        None => StaticCodeResolver::sdoh_defaults(),
    };
    Ok(Arc::new(resolver))
}

fn write_json<T: Serialize>(value: &T, compact: bool) -> Result<()> {
    let out = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{out}");
    Ok(())
}
