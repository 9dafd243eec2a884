//! dt-engine-cli — operator CLI for the dynamic table refresh engine
//! (spec §6.3). Talks to the metadata store directly; it never touches the
//! lake or runs a refresh itself, it only requests one via
//! `pending_refreshes`.

mod ddl;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use comfy_table::Table;
use dt_engine_core::error::EngineError;
use dt_engine_core::metadata::{MetadataStore, PostgresMetadataStore};
use dt_engine_core::model::{QualifiedName, TableStatus};
use tokio_postgres::NoTls;

#[derive(Parser, Debug)]
#[command(name = "dt-engine", about = "Operator CLI for the dynamic table refresh engine")]
struct Cli {
    #[arg(long, env = "DT_ENGINE_METADATA_URL", default_value = "postgres://localhost/dt_engine")]
    metadata_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a definition file, validate, and persist it.
    Create {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Parse and validate a definition file without persisting it.
    Validate {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// List every dynamic table with its current status and lag.
    List {
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// Show full properties and recent history for one table.
    Describe {
        name: String,
        #[arg(long, default_value = "table")]
        format: OutputFormat,
        #[arg(long, default_value_t = 10)]
        history_limit: i64,
    },
    /// Update one or more properties (`--set key=value`, repeatable).
    Alter {
        name: String,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        sets: Vec<String>,
    },
    /// Stop scheduling refreshes for a table.
    Suspend { name: String },
    /// Resume scheduling refreshes for a table.
    Resume { name: String },
    /// Enqueue a manual refresh at elevated priority.
    Refresh { name: String },
    /// Remove a table and everything that cascades from it.
    Drop { name: String },
    /// Show the refresh history log for a table.
    History {
        name: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// Generate shell completion scripts.
    Completions { shell: clap_complete::Shell },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

async fn connect(url: &str) -> Result<Arc<dyn MetadataStore>, EngineError> {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .map_err(|e| EngineError::MetadataStore(e.to_string()))?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(Arc::new(PostgresMetadataStore::new(client)))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli.command, cli.metadata_url).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Command, metadata_url: String) -> Result<(), EngineError> {
    match command {
        Command::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
        Command::Create { file } => {
            let store = connect(&metadata_url).await?;
            let spec = ddl::TableSpec::from_file(&file)?;
            let table = spec.into_dynamic_table()?;
            for source in &table.sources {
                if source.is_dynamic_table && store.get_table(&source.name).await?.is_none() {
                    return Err(EngineError::NotFound(format!("source dynamic table {} does not exist", source.name)));
                }
            }
            let graph = store.load_dependency_graph().await?;
            for source in &table.sources {
                if source.is_dynamic_table && graph.would_cycle(&table.name, &source.name) {
                    return Err(EngineError::CycleDetected(vec![table.name.to_string(), source.name.to_string()]));
                }
            }
            store.create_table(&table).await?;
            for source in table.sources.iter().filter(|s| s.is_dynamic_table) {
                store.add_dependency(&table.name, &source.name).await?;
            }
            println!("created {}", table.name);
            Ok(())
        }
        Command::Validate { file, format } => {
            let spec = ddl::TableSpec::from_file(&file)?;
            let table = spec.into_dynamic_table()?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&table).map_err(|e| EngineError::Internal(e.to_string()))?);
                }
                OutputFormat::Table => println!("{} is valid", table.name),
            }
            Ok(())
        }
        Command::List { format } => {
            let store = connect(&metadata_url).await?;
            let tables = store.list_active_tables().await?;
            let mut rows = Vec::new();
            for t in &tables {
                let history = store.recent_history(&t.name, 1).await?;
                let last = history.first();
                rows.push((
                    t.name.to_string(),
                    t.properties.status.as_str().to_string(),
                    t.properties.target_lag.as_str(),
                    last.map(|h| h.started_at.to_rfc3339()).unwrap_or_else(|| "never".to_string()),
                    last.map(|h| h.status.as_str().to_string()).unwrap_or_else(|| "-".to_string()),
                    t.properties.refresh_strategy.as_str().to_string(),
                ));
            }
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&rows).map_err(|e| EngineError::Internal(e.to_string()))?);
                }
                OutputFormat::Table => {
                    let mut table = Table::new();
                    table.set_header(vec!["name", "status", "target_lag", "last refresh", "last outcome", "strategy"]);
                    for row in rows {
                        table.add_row(vec![row.0, row.1, row.2, row.3, row.4, row.5]);
                    }
                    println!("{table}");
                }
            }
            Ok(())
        }
        Command::Describe { name, format, history_limit } => {
            let store = connect(&metadata_url).await?;
            let qn = QualifiedName::parse(&name);
            let table = store.get_table(&qn).await?.ok_or_else(|| EngineError::NotFound(name.clone()))?;
            let history = store.recent_history(&qn, history_limit).await?;
            match format {
                OutputFormat::Json => {
                    #[derive(serde::Serialize)]
                    struct Describe<'a> {
                        table: &'a dt_engine_core::model::DynamicTable,
                        history: Vec<String>,
                    }
                    let payload = Describe {
                        table: &table,
                        history: history.iter().map(|h| format!("{:?}", h.status)).collect(),
                    };
                    println!("{}", serde_json::to_string_pretty(&payload).map_err(|e| EngineError::Internal(e.to_string()))?);
                }
                OutputFormat::Table => {
                    println!("name: {}", table.name);
                    println!("status: {}", table.properties.status.as_str());
                    println!("target_lag: {}", table.properties.target_lag.as_str());
                    println!("refresh_strategy: {}", table.properties.refresh_strategy.as_str());
                    println!("grouping_keys: {}", table.grouping_keys.join(", "));
                    println!("allow_parallel: {}", table.properties.allow_parallel);
                    println!("comment: {}", table.properties.comment.as_deref().unwrap_or("-"));
                    println!("definition: {}", table.definition);
                    println!();
                    let mut t = Table::new();
                    t.set_header(vec!["started_at", "status", "strategy", "rows", "duration_ms", "error"]);
                    for h in history {
                        t.add_row(vec![
                            h.started_at.to_rfc3339(),
                            h.status.as_str().to_string(),
                            h.strategy.map(|s| s.as_str().to_string()).unwrap_or_else(|| "-".to_string()),
                            h.rows_affected.to_string(),
                            h.duration_ms.to_string(),
                            h.error_code.unwrap_or_default(),
                        ]);
                    }
                    println!("{t}");
                }
            }
            Ok(())
        }
        Command::Alter { name, sets } => {
            let store = connect(&metadata_url).await?;
            let qn = QualifiedName::parse(&name);
            let table = store.get_table(&qn).await?.ok_or_else(|| EngineError::NotFound(name.clone()))?;
            let mut props = table.properties;
            for kv in &sets {
                let (key, value) = kv.split_once('=').ok_or_else(|| {
                    EngineError::InvalidArgument(format!("--set expects KEY=VALUE, got {kv}"))
                })?;
                apply_property(&mut props, key, value)?;
            }
            if props.allow_parallel && table.grouping_keys.is_empty() {
                return Err(EngineError::InvalidArgument(
                    "allow_parallel requires non-empty grouping_keys".to_string(),
                ));
            }
            store.update_properties(&qn, &props).await?;
            println!("altered {qn}");
            Ok(())
        }
        Command::Suspend { name } => {
            let store = connect(&metadata_url).await?;
            store.set_status(&QualifiedName::parse(&name), TableStatus::Suspended).await?;
            println!("suspended {name}");
            Ok(())
        }
        Command::Resume { name } => {
            let store = connect(&metadata_url).await?;
            store.set_status(&QualifiedName::parse(&name), TableStatus::Active).await?;
            println!("resumed {name}");
            Ok(())
        }
        Command::Refresh { name } => {
            let store = connect(&metadata_url).await?;
            let qn = QualifiedName::parse(&name);
            store.get_table(&qn).await?.ok_or_else(|| EngineError::NotFound(name.clone()))?;
            store.enqueue_pending(&qn, chrono::Utc::now(), -1_000).await?;
            println!("enqueued manual refresh for {qn}");
            Ok(())
        }
        Command::Drop { name } => {
            let store = connect(&metadata_url).await?;
            store.drop_table(&QualifiedName::parse(&name)).await?;
            println!("dropped {name}");
            Ok(())
        }
        Command::History { name, limit, format } => {
            let store = connect(&metadata_url).await?;
            let qn = QualifiedName::parse(&name);
            let history = store.recent_history(&qn, limit).await?;
            match format {
                OutputFormat::Json => {
                    #[derive(serde::Serialize)]
                    struct Row {
                        started_at: String,
                        status: String,
                        strategy: Option<String>,
                        rows_affected: i64,
                        duration_ms: i64,
                        error_code: Option<String>,
                    }
                    let rows: Vec<Row> = history
                        .into_iter()
                        .map(|h| Row {
                            started_at: h.started_at.to_rfc3339(),
                            status: h.status.as_str().to_string(),
                            strategy: h.strategy.map(|s| s.as_str().to_string()),
                            rows_affected: h.rows_affected,
                            duration_ms: h.duration_ms,
                            error_code: h.error_code,
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows).map_err(|e| EngineError::Internal(e.to_string()))?);
                }
                OutputFormat::Table => {
                    let mut t = Table::new();
                    t.set_header(vec!["started_at", "status", "strategy", "rows", "duration_ms", "error"]);
                    for h in history {
                        t.add_row(vec![
                            h.started_at.to_rfc3339(),
                            h.status.as_str().to_string(),
                            h.strategy.map(|s| s.as_str().to_string()).unwrap_or_else(|| "-".to_string()),
                            h.rows_affected.to_string(),
                            h.duration_ms.to_string(),
                            h.error_code.unwrap_or_default(),
                        ]);
                    }
                    println!("{t}");
                }
            }
            Ok(())
        }
    }
}

fn apply_property(
    props: &mut dt_engine_core::model::TableProperties,
    key: &str,
    value: &str,
) -> Result<(), EngineError> {
    use dt_engine_core::model::{RefreshStrategyPref, TargetLag};
    match key {
        "target_lag" => props.target_lag = TargetLag::parse(value)?,
        "refresh_strategy" => props.refresh_strategy = RefreshStrategyPref::from_str(value)?,
        "deduplication" => props.deduplication = parse_bool(value)?,
        "cardinality_threshold" => {
            props.cardinality_threshold =
                value.parse().map_err(|_| EngineError::InvalidArgument(format!("invalid cardinality_threshold: {value}")))?
        }
        "allow_parallel" => props.allow_parallel = parse_bool(value)?,
        "parallel_threshold" => {
            props.parallel_threshold =
                value.parse().map_err(|_| EngineError::InvalidArgument(format!("invalid parallel_threshold: {value}")))?
        }
        "max_parallelism" => {
            props.max_parallelism =
                value.parse().map_err(|_| EngineError::InvalidArgument(format!("invalid max_parallelism: {value}")))?
        }
        "comment" => props.comment = Some(value.to_string()),
        other => return Err(EngineError::InvalidArgument(format!("unknown property: {other}"))),
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool, EngineError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(EngineError::InvalidArgument(format!("invalid boolean: {other}"))),
    }
}
