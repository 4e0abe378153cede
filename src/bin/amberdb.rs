//! Operational command line: inspect, verify, and dump database files.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use amberdb::Database;

#[derive(Parser)]
#[command(name = "amberdb", about = "amberdb database file tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print file size and per-table row counts.
    Info { file: PathBuf },
    /// Run the full integrity check.
    Check { file: PathBuf },
    /// Print a table's records by its first index (or every table).
    Dump {
        file: PathBuf,
        table: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Info { file } => {
            let db = Database::open_read(&file).context("open")?;
            println!("size: {} bytes", db.size());
            let rt = db.new_read_tran();
            for table in rt.table_names() {
                if let Some((nrows, total)) = rt.get_info(&table) {
                    println!("{table}: {nrows} rows, {total} bytes");
                }
                if let Some(schema) = db.schema(&table) {
                    println!("    {schema}");
                }
            }
            db.close();
        }
        Command::Check { file } => {
            let db = Database::open_read(&file).context("open")?;
            let report = db.full_check().context("integrity check")?;
            println!(
                "ok: {} tables, {} indexes, {} entries",
                report.tables, report.indexes, report.entries
            );
            db.close();
        }
        Command::Dump { file, table } => {
            let db = Database::open_read(&file).context("open")?;
            let rt = db.new_read_tran();
            let tables = match table {
                Some(t) => vec![t],
                None => rt.table_names(),
            };
            for table in tables {
                println!("==== {table}");
                let mut it = rt.iter(&table, 0).context("no such table")?;
                it.next();
                while !it.eof() {
                    let (_, off) = it.cur().expect("positioned");
                    let rec = rt.read_record(off);
                    let fields: Vec<String> = (0..rec.count())
                        .map(|i| String::from_utf8_lossy(rec.field(i)).into_owned())
                        .collect();
                    println!("{}", fields.join("\t"));
                    it.next();
                }
            }
            db.close();
        }
    }
    Ok(())
}
