//! Lanston - Main entry point.
//!
//! Runs one statement or table operation against the configured database and
//! prints the resulting rows as JSON.

use clap::Parser;
use lanston::config::{Command, Config, ConnectOptions, parse_assignments, parse_cli_value};
use lanston::{Database, QueryParam, Row, Selection};
use serde_json::Value as JsonValue;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Logs go to stderr so stdout carries only results
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn run(db: &Database, command: Command) -> Result<Vec<Row>, Box<dyn std::error::Error>> {
    let rows = match command {
        Command::Query { sql, params } => {
            let params: Vec<QueryParam> = params
                .iter()
                .map(|p| QueryParam::from(parse_cli_value(p)))
                .collect();
            db.query(&sql, &params).await?.into_rows()
        }
        Command::Select {
            table,
            schema,
            filter,
            columns,
        } => {
            let filter = parse_assignments(&filter)?;
            model(db, schema, table)
                .select(&filter, Selection::from(columns), None)
                .await?
        }
        Command::Insert {
            table,
            schema,
            data,
        } => {
            let data = parse_assignments(&data)?;
            model(db, schema, table)
                .insert(&data, Some(Selection::All), None)
                .await?
        }
        Command::Update {
            table,
            schema,
            filter,
            data,
        } => {
            let filter = parse_assignments(&filter)?;
            let data = parse_assignments(&data)?;
            model(db, schema, table)
                .update(&filter, &data, Some(Selection::All), None)
                .await?
        }
        Command::Delete {
            table,
            schema,
            filter,
        } => {
            let filter = parse_assignments(&filter)?;
            model(db, schema, table)
                .delete(&filter, Some(Selection::All), None)
                .await?
        }
    };
    Ok(rows)
}

fn model(db: &Database, schema: Option<String>, table: String) -> lanston::Model {
    match schema {
        Some(schema) => db.model_in(schema, table),
        None => db.model(table),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let options = ConnectOptions::parse(&config.database)?;
    info!(
        db_type = %options.db_type,
        url = %options.masked_url(),
        "Starting lanston v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = Database::connect_with(options).await?;
    let result = run(&db, config.command).await;
    db.disconnect().await;

    match result {
        Ok(rows) => {
            let rows: Vec<JsonValue> = rows.into_iter().map(JsonValue::Object).collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            Err(e)
        }
    }
}
