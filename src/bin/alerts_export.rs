//! alerts_export - print recent alert records from the SQLite store as JSON

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::Write;

use crimewatch::storage::{AlertStore, SqliteAlertStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the alert database.
    #[arg(long, env = "CRIMEWATCH_DB_PATH", default_value = "crimewatch.db")]
    db_path: String,
    /// Only export alerts for this camera id.
    #[arg(long)]
    camera: Option<u32>,
    /// Maximum number of records, newest first.
    #[arg(long, default_value_t = 100)]
    limit: usize,
    /// Write to this file instead of stdout.
    #[arg(long)]
    output: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.limit == 0 {
        return Err(anyhow!("--limit must be greater than zero"));
    }

    let mut store = SqliteAlertStore::open(&args.db_path)?;
    let records = store.list_alerts(args.camera, args.limit)?;
    let json = serde_json::to_string_pretty(&records)?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", json))?;
            log::info!("wrote {} alert(s) to {}", records.len(), path);
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json)?;
        }
    }
    Ok(())
}
