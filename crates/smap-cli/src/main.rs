use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use smap_core::{ApprovalStatus, DocumentFormat, ExecutionStatus, RowCounts};
use smap_db::{
    MappingFilter, MappingStore, MemoryStore, PgMappingStore, PgSchemaFetcher, SchemaSource,
    StaticSchemaSource,
};
use smap_infer::Cancellation;
use smap_pipeline::{
    Correction, DocumentInput, LifecycleManager, MappingPipeline, PipelineConfig, PipelineTuning,
    ReconciliationRecorder,
};
use smap_storage::HttpCompletionClient;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "smap")]
#[command(about = "Schema mapping pipeline command-line interface")]
struct Cli {
    /// Use an in-process store instead of Postgres (requires --schema-file).
    #[arg(long, global = true)]
    in_memory: bool,

    /// YAML target schema used instead of information_schema.
    #[arg(long, global = true)]
    schema_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Print the target schema.
    Schema,
    /// Normalize a document and print its nodes.
    Normalize {
        path: PathBuf,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
    },
    /// Stage, normalize and map documents.
    Run {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
    },
    /// List generated mappings.
    Mappings {
        #[arg(long)]
        document: Option<Uuid>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    Approve {
        mapping_id: Uuid,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        notes: Option<String>,
    },
    Reject {
        mapping_id: Uuid,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Replace a decided mapping with a corrected Pending one.
    Supersede {
        mapping_id: Uuid,
        #[arg(long)]
        table: String,
        #[arg(long)]
        column: String,
        #[arg(long)]
        transformation: Option<String>,
        #[arg(long)]
        rationale: Option<String>,
    },
    /// Record the start of an execution attempt.
    ExecBegin {
        mapping_id: Uuid,
        #[arg(long)]
        retry_limit: Option<u32>,
        #[arg(long, default_value = "smap-cli")]
        executor: String,
    },
    /// Record the outcome of a running execution attempt.
    ExecComplete {
        execution_id: Uuid,
        #[arg(long, value_enum)]
        status: OutcomeArg,
        #[arg(long, default_value_t = 0)]
        processed: u64,
        #[arg(long, default_value_t = 0)]
        inserted: u64,
        #[arg(long, default_value_t = 0)]
        updated: u64,
        #[arg(long, default_value_t = 0)]
        failed: u64,
        #[arg(long)]
        error: Option<String>,
    },
    /// Record a reconciliation for a finished execution.
    Reconcile {
        execution_id: Uuid,
        #[arg(long)]
        source: u64,
        #[arg(long)]
        target: u64,
        #[arg(long)]
        matched: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Xml,
    Json,
    Csv,
    Html,
}

impl From<FormatArg> for DocumentFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Xml => DocumentFormat::Xml,
            FormatArg::Json => DocumentFormat::Json,
            FormatArg::Csv => DocumentFormat::Csv,
            FormatArg::Html => DocumentFormat::Html,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Succeeded,
    Failed,
}

impl From<OutcomeArg> for ExecutionStatus {
    fn from(value: OutcomeArg) -> Self {
        match value {
            OutcomeArg::Succeeded => ExecutionStatus::Succeeded,
            OutcomeArg::Failed => ExecutionStatus::Failed,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct Backends {
    store: Arc<dyn MappingStore>,
    schema: Arc<dyn SchemaSource>,
}

async fn backends(cli: &Cli, config: &PipelineConfig, tuning: &PipelineTuning) -> Result<Backends> {
    if cli.in_memory {
        let path = cli
            .schema_file
            .as_ref()
            .context("--in-memory needs --schema-file")?;
        return Ok(Backends {
            store: Arc::new(MemoryStore::new()),
            schema: Arc::new(StaticSchemaSource::from_yaml_file(path)?),
        });
    }

    let pool = smap_db::connect(&config.database_url, 8, tuning.store_timeout()).await?;
    let schema: Arc<dyn SchemaSource> = match &cli.schema_file {
        Some(path) => Arc::new(StaticSchemaSource::from_yaml_file(path)?),
        None => Arc::new(PgSchemaFetcher::new(
            pool.clone(),
            config.target_schema.clone(),
            tuning.store_timeout(),
        )),
    };
    Ok(Backends {
        store: Arc::new(PgMappingStore::new(pool, tuning.store_timeout())),
        schema,
    })
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let tuning = config.load_tuning()?;

    match &cli.command {
        Commands::Migrate => {
            if cli.in_memory {
                bail!("migrate needs a database; drop --in-memory");
            }
            let pool = smap_db::connect(&config.database_url, 2, tuning.store_timeout()).await?;
            smap_db::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Schema => {
            let backends = backends(&cli, &config, &tuning).await?;
            let schema = backends.schema.fetch().await?;
            for column in schema.columns() {
                println!(
                    "{}.{}\t{}\t{}",
                    column.table,
                    column.column,
                    column.data_type,
                    if column.nullable { "null" } else { "not null" }
                );
            }
            println!("signature {}", schema.signature());
        }
        Commands::Normalize { path, format } => {
            let mut input = DocumentInput::from_path(path).await?;
            if let Some(format) = format {
                input = input.with_format((*format).into());
            }
            let normalized = tuning
                .normalizer()?
                .normalize(&input.bytes, input.format)
                .with_context(|| format!("normalizing {}", path.display()))?;
            print_json(&normalized)?;
        }
        Commands::Run { paths, format } => {
            let backends = backends(&cli, &config, &tuning).await?;
            let completion = Arc::new(HttpCompletionClient::new(config.completion_config())?);
            let pipeline = MappingPipeline::from_config(
                &config,
                &tuning,
                Arc::clone(&backends.store),
                backends.schema,
                completion,
            )?;

            let mut documents = Vec::with_capacity(paths.len());
            for path in paths {
                let mut input = DocumentInput::from_path(path).await?;
                if let Some(format) = format {
                    input = input.with_format((*format).into());
                }
                documents.push(input);
            }

            let cancel = Cancellation::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    on_signal.cancel();
                }
            });

            let summary = pipeline.run(documents, &cancel).await?;
            print_json(&summary)?;
            if cli.in_memory {
                let mappings = backends.store.list_mappings(&MappingFilter::default()).await?;
                print_json(&mappings)?;
            }
            info!(run_id = %summary.run_id, mappings = summary.mappings(), "run complete");
        }
        Commands::Mappings {
            document,
            status,
            limit,
        } => {
            let backends = durable(&cli, &config, &tuning).await?;
            let approval_status = status
                .as_deref()
                .map(str::parse::<ApprovalStatus>)
                .transpose()?;
            let mappings = backends
                .store
                .list_mappings(&MappingFilter {
                    document_id: *document,
                    approval_status,
                    limit: Some(*limit),
                })
                .await?;
            print_json(&mappings)?;
        }
        Commands::Approve {
            mapping_id,
            approver,
            notes,
        } => {
            let backends = durable(&cli, &config, &tuning).await?;
            let mapping = LifecycleManager::new(backends.store)
                .approve(*mapping_id, approver, notes.as_deref())
                .await?;
            print_json(&mapping)?;
        }
        Commands::Reject {
            mapping_id,
            approver,
            notes,
        } => {
            let backends = durable(&cli, &config, &tuning).await?;
            let mapping = LifecycleManager::new(backends.store)
                .reject(*mapping_id, approver, notes.as_deref())
                .await?;
            print_json(&mapping)?;
        }
        Commands::Supersede {
            mapping_id,
            table,
            column,
            transformation,
            rationale,
        } => {
            let backends = durable(&cli, &config, &tuning).await?;
            let schema = backends.schema.fetch().await?;
            let mapping = LifecycleManager::new(backends.store)
                .with_schema(Arc::new(schema))
                .supersede(
                    *mapping_id,
                    Correction {
                        target_table: table.clone(),
                        target_column: column.clone(),
                        transformation: transformation.clone(),
                        rationale: rationale.clone(),
                    },
                )
                .await?;
            print_json(&mapping)?;
        }
        Commands::ExecBegin {
            mapping_id,
            retry_limit,
            executor,
        } => {
            let backends = durable(&cli, &config, &tuning).await?;
            let record = LifecycleManager::new(backends.store)
                .begin_execution(*mapping_id, retry_limit.unwrap_or(tuning.retry_limit), executor)
                .await?;
            print_json(&record)?;
        }
        Commands::ExecComplete {
            execution_id,
            status,
            processed,
            inserted,
            updated,
            failed,
            error,
        } => {
            let backends = durable(&cli, &config, &tuning).await?;
            let counts = RowCounts {
                processed: *processed,
                inserted: *inserted,
                updated: *updated,
                failed: *failed,
            };
            let record = LifecycleManager::new(backends.store)
                .complete_execution(*execution_id, counts, (*status).into(), error.clone())
                .await?;
            print_json(&record)?;
        }
        Commands::Reconcile {
            execution_id,
            source,
            target,
            matched,
        } => {
            let backends = durable(&cli, &config, &tuning).await?;
            let execution = backends
                .store
                .get_execution(*execution_id)
                .await?
                .with_context(|| format!("execution {execution_id} not found"))?;
            let result = ReconciliationRecorder::new(backends.store)
                .reconcile(&execution, *source, *target, *matched)
                .await?;
            print_json(&result)?;
        }
    }

    Ok(())
}

/// Backends for commands that act on previously persisted state.
async fn durable(cli: &Cli, config: &PipelineConfig, tuning: &PipelineTuning) -> Result<Backends> {
    if cli.in_memory {
        bail!("this command reads persisted mappings; drop --in-memory");
    }
    backends(cli, config, tuning).await
}
