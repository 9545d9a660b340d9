use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tabula_api::{CollectionsApi, Engine, SaveOutcome, SearchCriteria};
use tabula_core::{CollectionSchema, Document, DocumentKey, FieldType};
use tabula_schema::StructuralValidator;
use tabula_storehub::MemoryHub;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tabulactl", version, about = "Tabula CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Store fixture to load (JSON or YAML: collections plus documents)
    #[arg(long = "store", global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect a collection schema (containments spliced in)
    Schema {
        /// Collection name, e.g. "tickets"
        collection: String,
        /// Print the compiled structural rules instead of the field list
        #[arg(long = "rules", action = ArgAction::SetTrue)]
        rules: bool,
    },
    /// Grade documents from a file without writing anything
    Check {
        /// Collection name
        collection: String,
        /// JSON or YAML file holding one document or an array of documents
        file: PathBuf,
    },
    /// Resolve, validate and store documents from a file
    Import {
        /// Collection name
        collection: String,
        /// JSON or YAML file holding one document or an array of documents
        file: PathBuf,
        /// Write the store back to a fixture after the batch
        #[arg(long = "save")]
        save: Option<PathBuf>,
    },
    /// List stored documents for a collection
    Ls {
        /// Collection name
        collection: String,
        /// Equality filter, repeatable: Field=Value
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Limit results
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Fetch one resource record by key or by a unique field
    Resource {
        /// Resource collection name, e.g. "accounts"
        resource: String,
        /// Canonical key to fetch
        key: Option<String>,
        /// Unique field lookup
        #[arg(long = "by", num_args = 2, value_names = ["FIELD", "VALUE"])]
        by: Option<Vec<String>>,
    },
}

/// On-disk shape for `--store` and `--save`: schemas plus seeded records.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
struct Fixture {
    #[serde(rename = "Collections")]
    collections: Vec<CollectionSchema>,
    #[serde(rename = "Documents")]
    documents: BTreeMap<String, Vec<Document>>,
}

fn init_tracing() {
    let env = std::env::var("TABULA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TABULA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TABULA_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_fixture(path: &Path) -> Result<Fixture> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let fixture = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)?,
        _ => serde_json::from_str(&raw)?,
    };
    Ok(fixture)
}

fn save_fixture(path: &Path, fixture: &Fixture) -> Result<()> {
    let raw = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::to_string(fixture)?,
        _ => serde_json::to_string_pretty(fixture)?,
    };
    std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

async fn open_store(path: Option<&Path>) -> Result<Arc<MemoryHub>> {
    let hub = Arc::new(MemoryHub::new());
    if let Some(path) = path {
        let fixture = load_fixture(path)?;
        for schema in fixture.collections {
            hub.put_schema(schema).await;
        }
        for (collection, docs) in fixture.documents {
            for doc in docs {
                hub.seed(&collection, doc).await?;
            }
        }
    }
    Ok(hub)
}

fn load_documents(path: &Path) -> Result<Vec<Document>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let value: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)?,
        _ => serde_json::from_str(&raw)?,
    };
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|v| Document::from_value(v).ok_or_else(|| anyhow!("documents must be JSON objects")))
        .collect()
}

// Bare words stay strings; numbers and booleans parse as JSON scalars.
fn scalar_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_filters(filters: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut map = BTreeMap::new();
    for raw in filters {
        let Some((field, value)) = raw.split_once('=') else {
            bail!("invalid --filter {raw:?}; expected Field=Value");
        };
        map.insert(field.to_string(), scalar_value(value));
    }
    Ok(map)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let hub = open_store(cli.store.as_deref()).await?;
    let engine = Engine::new(hub.clone(), hub.clone());

    match cli.command {
        Commands::Schema { collection, rules } => {
            info!(collection = %collection, "schema invoked");
            match engine.schema(&collection).await? {
                Some(schema) if rules => {
                    let validator = StructuralValidator::compile(&schema)?;
                    println!("{}", serde_json::to_string_pretty(validator.schema_json())?);
                }
                Some(schema) => match cli.output {
                    Output::Human => print_schema(&schema),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&schema)?),
                },
                None => eprintln!("no schema for collection {collection}"),
            }
        }
        Commands::Check { collection, file } => {
            let documents = load_documents(&file)?;
            info!(collection = %collection, docs = documents.len(), "check invoked");
            let outcomes = engine.check_items(&collection, documents).await?;
            report_outcomes(cli.output, &outcomes)?;
        }
        Commands::Import { collection, file, save } => {
            let documents = load_documents(&file)?;
            info!(collection = %collection, docs = documents.len(), "import invoked");
            let outcomes = engine.process_items_to_save(&collection, documents).await?;
            report_outcomes(cli.output, &outcomes)?;
            if let Some(path) = save {
                let (collections, documents) = hub.dump().await;
                save_fixture(&path, &Fixture { collections, documents })?;
                info!(path = %path.display(), "store saved");
            }
        }
        Commands::Ls { collection, filters, limit } => {
            info!(collection = %collection, filters = filters.len(), "ls invoked");
            let criteria = SearchCriteria { filters: parse_filters(&filters)?, page_size: limit };
            let page = engine.search(&collection, criteria).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<38} DOCUMENT", "KEY");
                    for item in &page.objects {
                        println!("{:<38} {}", item.key().unwrap_or("-"), serde_json::to_string(item)?);
                    }
                    if page.objects.len() < page.count {
                        eprintln!("{} of {} shown", page.objects.len(), page.count);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&page)?),
            }
        }
        Commands::Resource { resource, key, by } => {
            info!(resource = %resource, "resource invoked");
            let found = match (key, by) {
                (Some(key), None) => engine.resource_by_key(&resource, &key).await?,
                (None, Some(pair)) => {
                    let value = scalar_value(&pair[1]);
                    engine.resource_by_unique_field(&resource, &pair[0], &value).await?
                }
                _ => bail!("pass either a KEY or --by FIELD VALUE"),
            };
            match found {
                Some(record) => match cli.output {
                    Output::Human => {
                        for (field, value) in record.iter() {
                            println!("{:<24} {}", field, value);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&record)?),
                },
                None => eprintln!("no match in {resource}"),
            }
        }
    }

    Ok(())
}

fn report_outcomes(output: Output, outcomes: &[SaveOutcome]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<38} {:<7} ERRORS", "KEY", "VALID");
            for out in outcomes {
                let errors = if out.result.errors.is_empty() {
                    "-".to_string()
                } else {
                    out.result.errors.join("; ")
                };
                println!(
                    "{:<38} {:<7} {}",
                    out.item.key().unwrap_or("-"),
                    if out.result.valid { "yes" } else { "no" },
                    errors
                );
            }
            let invalid = outcomes.iter().filter(|o| !o.result.valid).count();
            if invalid > 0 {
                eprintln!("{} of {} documents rejected", invalid, outcomes.len());
            }
        }
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Row<'a> {
                key: Option<&'a str>,
                valid: bool,
                errors: &'a [String],
                item: &'a Document,
            }
            let rows: Vec<_> = outcomes
                .iter()
                .map(|o| Row {
                    key: o.item.key(),
                    valid: o.result.valid,
                    errors: &o.result.errors,
                    item: &o.item,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

fn print_schema(schema: &CollectionSchema) {
    println!("collection: {}", schema.name);
    println!("key: {}", describe_key(&schema.document_key));
    println!("{:<24} {:<20} {:<9} VALUES", "FIELD", "TYPE", "REQUIRED");
    for (name, def) in &schema.fields {
        let values = def
            .optional_values
            .as_ref()
            .map(|v| v.join(", "))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<20} {:<9} {}",
            name,
            describe_type(&def.kind),
            if def.mandatory { "yes" } else { "no" },
            values
        );
    }
}

fn describe_key(key: &DocumentKey) -> String {
    match key {
        DocumentKey::Key => "explicit".to_string(),
        DocumentKey::AutoGenerate => "auto-generate".to_string(),
        DocumentKey::Composite { fields, delimiter } => {
            format!("composite({})", fields.join(delimiter))
        }
    }
}

fn describe_type(kind: &FieldType) -> String {
    match kind {
        FieldType::String => "string".to_string(),
        FieldType::Integer => "integer".to_string(),
        FieldType::Double => "double".to_string(),
        FieldType::Bool => "bool".to_string(),
        FieldType::DateTime => "date-time".to_string(),
        FieldType::Array { items } => format!("array<{}>", describe_type(&items.kind)),
        FieldType::Object { .. } => "object".to_string(),
        FieldType::Resource { resource } => format!("ref<{resource}>"),
        FieldType::ContainedResource { resource, .. } => format!("contained<{resource}>"),
    }
}
