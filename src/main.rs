use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use sqlly::config::Config;
use sqlly::csv_sample::{read_sample_file, CsvSample};
use sqlly::model::{ColumnType, ConversionRequest, Row, SchemaDescriptor};
use sqlly::normalizer::{extract_dataset_id, join_statements, split_statements, Normalizer};
use sqlly::observability::init_tracing;
use sqlly::orchestrator::{ExecuteRequest, Orchestrator};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "sqlly")]
#[command(about = "Ask questions about an uploaded CSV in plain language and get SQL back")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a question into SQL via the agent service
    Convert {
        /// The question in natural language
        prompt: String,

        #[command(flatten)]
        dataset: DatasetArgs,

        /// Run the generated statements even when the request is not analytical
        #[arg(long)]
        execute: bool,
    },
    /// Run SQL against the query endpoint, repairing the document cast if needed
    Execute {
        sql: String,

        /// Dataset identifier (a UUID is extracted when embedded in a longer value)
        #[arg(long)]
        file_id: String,
    },
    /// Normalize SQL locally without calling any service
    Normalize {
        sql: String,

        #[command(flatten)]
        dataset: DatasetArgs,
    },
}

#[derive(ClapArgs)]
struct DatasetArgs {
    /// Dataset identifier (a UUID is extracted when embedded in a longer value)
    #[arg(long)]
    file_id: String,

    /// CSV file to derive the schema and sample rows from
    #[arg(long, conflicts_with = "schema")]
    csv: Option<PathBuf>,

    /// JSON object mapping column name to type
    #[arg(long)]
    schema: Option<PathBuf>,

    /// JSON array of sample rows (used with --schema)
    #[arg(long, requires = "schema")]
    sample_rows: Option<PathBuf>,

    /// Rows taken from --csv
    #[arg(long, default_value_t = 5)]
    sample_size: usize,
}

impl DatasetArgs {
    fn dataset_id(&self) -> Result<String> {
        extract_dataset_id(&self.file_id).context("--file-id must not be empty")
    }

    fn load(&self) -> Result<CsvSample> {
        if let Some(ref path) = self.csv {
            return read_sample_file(path, self.sample_size)
                .with_context(|| format!("Failed to read CSV {}", path.display()));
        }
        let Some(ref schema_path) = self.schema else {
            return Ok(CsvSample {
                schema: SchemaDescriptor::new(),
                sample_rows: Vec::new(),
            });
        };
        let schema = load_schema(schema_path)?;
        let sample_rows = match self.sample_rows {
            Some(ref path) => serde_json::from_str::<Vec<Row>>(&read(path)?)
                .with_context(|| format!("{} must be a JSON array of objects", path.display()))?,
            None => Vec::new(),
        };
        Ok(CsvSample { schema, sample_rows })
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn load_schema(path: &Path) -> Result<SchemaDescriptor> {
    let raw: BTreeMap<String, String> = serde_json::from_str(&read(path)?)
        .with_context(|| format!("{} must be a JSON object of column types", path.display()))?;
    raw.into_iter()
        .map(|(column, ty)| match ColumnType::parse(&ty) {
            Some(parsed) => Ok((column, parsed)),
            None => bail!("Unknown type '{}' for column '{}'", ty, column),
        })
        .collect()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Convert {
            prompt,
            dataset,
            execute,
        } => {
            let sample = dataset.load()?;
            let target_dataset_id = dataset.dataset_id()?;
            let config = Config::from_env()?;
            let orchestrator = Orchestrator::from_config(&config)?;

            let request = ConversionRequest {
                prompt_text: prompt,
                schema: sample.schema,
                sample_rows: sample.sample_rows,
                target_dataset_id,
            };
            info!("Converting: {}", request.prompt_text);
            let mut response = orchestrator.convert(&request).await?;

            if execute && response.statements.is_empty() && !response.sql.is_empty() {
                let executed = orchestrator
                    .execute(&ExecuteRequest {
                        sql: response.sql.clone(),
                        target_dataset_id: request.target_dataset_id.clone(),
                    })
                    .await?;
                response.statements = executed.statements;
            }
            print_json(&response)?;
        }
        Command::Execute { sql, file_id } => {
            let target_dataset_id = extract_dataset_id(&file_id).context("--file-id must not be empty")?;
            let config = Config::from_env()?;
            let orchestrator = Orchestrator::from_config(&config)?;
            let response = orchestrator
                .execute(&ExecuteRequest {
                    sql,
                    target_dataset_id,
                })
                .await?;
            print_json(&response)?;
        }
        Command::Normalize { sql, dataset } => {
            let sample = dataset.load()?;
            let target_dataset_id = dataset.dataset_id()?;
            let normalizer = Normalizer::with_schema(sample.schema);
            let statements: Vec<String> = split_statements(&sql)
                .iter()
                .map(|statement| normalizer.normalize(statement, &target_dataset_id).text)
                .collect();
            println!("{}", join_statements(&statements));
        }
    }

    Ok(())
}
