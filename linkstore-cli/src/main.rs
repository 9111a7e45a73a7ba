use clap::{Parser, Subcommand, ValueEnum};
use linkstore::{chain, Expr, QueryParams, Record, Store, StoreConfig};
use std::path::PathBuf;
use std::process;

/// linkstore CLI: append, link and query hash-chained records
#[derive(Parser)]
#[command(name = "linkstore", version, about)]
struct Cli {
    /// Database path (overrides the config file)
    #[arg(long)]
    db: Option<String>,

    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Create the objects table if it does not exist
    Init,

    /// Store a single record as-is
    Put {
        #[command(flatten)]
        fields: RecordArgs,
    },

    /// Append a record to its partition's chain, linking it to the previous one
    Append {
        #[command(flatten)]
        fields: RecordArgs,
    },

    /// Get a record by ID
    Get {
        id: String,
    },

    /// Get the newest record with the given key
    Last {
        key: String,
    },

    /// List records
    List {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Count records
    Count {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Set a record's peer hash from the hash of the record that follows it
    Link {
        /// Record ID
        id: String,
        /// Hash of the next record
        next_hash: String,
    },

    /// Verify the hash chain of a partition
    Verify {
        #[arg(long, default_value = "")]
        partition: String,
    },

    /// Delete every record
    Reset,
}

#[derive(clap::Args)]
struct RecordArgs {
    #[arg(long)]
    key: String,
    #[arg(long, default_value = "")]
    value: String,
    #[arg(long, default_value = "")]
    creator: String,
    #[arg(long, default_value = "")]
    owner: String,
    #[arg(long, default_value = "")]
    partition: String,
}

impl RecordArgs {
    fn into_record(self) -> Record {
        Record {
            key: self.key,
            value: self.value,
            creator_id: self.creator,
            owner_id: self.owner,
            partition_id: self.partition,
            ..Default::default()
        }
    }
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Exact key match
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    partition: Option<String>,
    /// Key prefix match
    #[arg(long)]
    prefix: Option<String>,
    /// Raw SQL predicate (no arguments)
    #[arg(long = "where")]
    expr: Option<String>,
    /// ORDER BY clause, e.g. "key desc"
    #[arg(long)]
    order: Option<String>,
    #[arg(long)]
    limit: Option<u64>,
}

impl FilterArgs {
    fn into_filter(self) -> Record {
        Record {
            key: self.key.unwrap_or_default(),
            partition_id: self.partition.unwrap_or_default(),
            query_params: QueryParams {
                expr: self.expr.map(|e| Expr::new(e, vec![])),
                key_starts_with: self.prefix,
                order_by: self.order,
                limit: self.limit,
            },
            ..Default::default()
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_yaml_file(path)?,
        None => StoreConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.connection_string = db.clone();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    log::info!("Opening store at: {}", config.connection_string);
    let store = Store::open(config)?;
    store.create_tables()?;

    match cli.command {
        Command::Init => {
            print_output(&serde_json::json!({ "ok": true }), &cli.format);
        }

        Command::Put { fields } => {
            let mut record = fields.into_record();
            store.create(&mut record, &[])?;
            print_output(&serde_json::to_value(&record)?, &cli.format);
        }

        Command::Append { fields } => {
            let record = chain::append(&store, fields.into_record())?;
            print_output(&serde_json::to_value(&record)?, &cli.format);
        }

        Command::Get { id } => {
            let filter = Record {
                id,
                ..Default::default()
            };
            let record = store.get_last(&filter, &[])?;
            print_output(&serde_json::to_value(&record)?, &cli.format);
        }

        Command::Last { key } => {
            let record = store.get_last(&Record::new(key, ""), &[])?;
            print_output(&serde_json::to_value(&record)?, &cli.format);
        }

        Command::List { filter } => {
            let records = store.get_all(&filter.into_filter(), &[])?;
            print_output(&serde_json::to_value(&records)?, &cli.format);
        }

        Command::Count { filter } => {
            let count = store.count(&filter.into_filter(), &[])?;
            print_output(&serde_json::json!({ "count": count }), &cli.format);
        }

        Command::Link { id, next_hash } => {
            let filter = Record {
                id,
                ..Default::default()
            };
            let mut record = store.get_last(&filter, &[])?;
            record.compute_peer_hash(&next_hash)?;
            store.update_peer_hash(&record, &record.peer_hash, &[])?;
            print_output(
                &serde_json::json!({ "ok": true, "id": record.id, "peer_hash": record.peer_hash }),
                &cli.format,
            );
        }

        Command::Verify { partition } => {
            let records = chain::load(&store, &partition)?;
            let result = match chain::verify(&records) {
                Ok(()) => serde_json::json!({ "ok": true, "records": records.len() }),
                Err(brk) => serde_json::json!({
                    "ok": false,
                    "index": brk.index,
                    "id": brk.id,
                    "reason": brk.kind.to_string(),
                }),
            };
            print_output(&result, &cli.format);
        }

        Command::Reset => {
            store.truncate_tables()?;
            print_output(&serde_json::json!({ "ok": true }), &cli.format);
        }
    }

    Ok(())
}

fn print_output(value: &serde_json::Value, format: &OutputFormat) {
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value).map_err(|e| e.to_string()),
        OutputFormat::Yaml => serde_yaml::to_string(value).map_err(|e| e.to_string()),
    };
    match rendered {
        Ok(text) => println!("{}", text.trim_end()),
        Err(e) => eprintln!("ERROR:{e}"),
    }
}
