//! Read a built lake back and report each table's partitions and row counts.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use sparkify_lake::progress::init_tracing;
use sparkify_lake::writer::{read_table, table_dir_name, SUCCESS_MARKER};

const TABLES: [&str; 5] = ["songs", "artists", "users", "time", "songplays"];

#[derive(Parser)]
#[command(name = "inspect-lake")]
#[command(about = "Summarize the tables of a built lake")]
struct Args {
    /// Output root of a previous build
    root: PathBuf,

    /// Only this table
    #[arg(long)]
    table: Option<String>,

    /// List every partition, not only totals
    #[arg(long)]
    partitions: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let selected: Vec<&str> = match &args.table {
        Some(name) if TABLES.contains(&name.as_str()) => vec![name.as_str()],
        Some(name) => bail!("Unknown table '{}', expected one of {:?}", name, TABLES),
        None => TABLES.to_vec(),
    };

    println!("{:=<60}", "");
    for table in selected {
        let dir = args.root.join(table_dir_name(table));
        if !dir.is_dir() {
            println!("{:<10} missing", table);
            continue;
        }
        let parts = read_table(&dir).with_context(|| format!("Failed to read {}", dir.display()))?;
        let rows: usize = parts.iter().map(|p| p.num_rows()).sum();
        let committed = dir.join(SUCCESS_MARKER).exists();
        println!(
            "{:<10} {:>10} rows {:>6} files{}",
            table,
            rows,
            parts.len(),
            if committed { "" } else { "  (no _SUCCESS marker)" }
        );

        if args.partitions {
            for part in &parts {
                let label = part
                    .values
                    .iter()
                    .map(|(col, value)| format!("{}={}", col, value.as_deref().unwrap_or("null")))
                    .collect::<Vec<_>>()
                    .join("/");
                println!("    {:<40} {:>8}", if label.is_empty() { "-" } else { label.as_str() }, part.num_rows());
            }
        }
    }
    println!("{:=<60}", "");
    Ok(())
}
