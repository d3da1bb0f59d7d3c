use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tidemark::store::RedbStore;
use tidemark::{
    run_boundary_backfill, run_change_flag_backfill, BackfillConfig, RunReport, TableDescriptor,
};

#[derive(Parser)]
#[command(
    name = "tidemark",
    version,
    about = "Backfill derived temporal metadata over append-only version tables"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct TableArgs {
    /// Path to the tidemark database file.
    #[arg(long)]
    db: PathBuf,

    /// Logical version table to process.
    #[arg(long)]
    table: String,

    /// Entity key column; repeat for composite keys. The transaction
    /// column is never part of the key.
    #[arg(long = "key-column", required = true)]
    key_columns: Vec<String>,

    /// Column holding the transaction id.
    #[arg(long, default_value = "transaction_id")]
    tx_column: String,

    /// Column holding the end boundary.
    #[arg(long, default_value = "end_transaction_id")]
    end_column: String,

    /// Maximum updates per write transaction.
    #[arg(long, default_value_t = 500)]
    batch_size: usize,
}

impl TableArgs {
    fn descriptor(&self) -> TableDescriptor {
        TableDescriptor::new(self.table.as_str(), self.key_columns.clone())
            .with_tx_column(self.tx_column.as_str())
            .with_end_column(self.end_column.as_str())
    }

    fn config(&self) -> BackfillConfig {
        BackfillConfig {
            batch_size: self.batch_size,
            ..BackfillConfig::default()
        }
    }

    fn open_store(&self) -> Result<RedbStore> {
        let path = self
            .db
            .to_str()
            .context("database path is not valid UTF-8")?;
        RedbStore::open(path).with_context(|| format!("failed to open database at {path}"))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Backfill end-transaction boundaries.
    Boundaries {
        #[command(flatten)]
        table: TableArgs,
    },
    /// Backfill per-column change flags.
    Flags {
        #[command(flatten)]
        table: TableArgs,

        /// Tracked attribute column; repeat for each column.
        #[arg(long = "track", required = true)]
        tracked: Vec<String>,

        /// Suffix appended to attribute names to form flag column names.
        #[arg(long, default_value = "_mod")]
        flag_suffix: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let cli = Cli::parse();

    let report = match &cli.command {
        Command::Boundaries { table } => {
            let store = table.open_store()?;
            run_boundary_backfill(&store, &table.descriptor(), &table.config())
                .context("boundary backfill failed")?
        }
        Command::Flags {
            table,
            tracked,
            flag_suffix,
        } => {
            let store = table.open_store()?;
            let descriptor = table.descriptor().with_flag_suffix(flag_suffix.as_str());
            run_change_flag_backfill(&store, &descriptor, tracked, &table.config())
                .context("change-flag backfill failed")?
        }
    };

    print_report(&report);
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("rows processed: {}", report.rows_processed);
    println!("rows updated: {}", report.rows_updated);
    if !report.failed_entities.is_empty() {
        eprintln!("failed entities ({}):", report.failed_entities.len());
        for key in &report.failed_entities {
            eprintln!("  {key}");
        }
    }
}
