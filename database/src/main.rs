use clap::{Parser, Subcommand};
use std::error::Error;
use tracing_subscriber::EnvFilter;

mod commands;

/// KPI Dashboard Database CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available commands for database diagnostics
#[derive(Subcommand)]
enum Commands {
    /// Test connectivity with a trivial query
    Check,
    /// Run one statement and print the rows as JSON
    Query {
        /// Statement to run, with $1, $2... placeholders
        #[arg(short, long)]
        sql: String,
        /// Positional parameter (repeatable)
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// Stop after this many rows
        #[arg(short, long)]
        max_rows: Option<usize>,
    },
    /// Show configuration and pool status
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse command line arguments
    let cli = Cli::parse();

    // Execute command
    match cli.command {
        Commands::Check => {
            commands::check::execute().await?;
        }
        Commands::Query {
            sql,
            params,
            max_rows,
        } => {
            commands::query::execute(sql, params, max_rows).await?;
        }
        Commands::Status => {
            commands::status::execute().await?;
        }
    }

    Ok(())
}
