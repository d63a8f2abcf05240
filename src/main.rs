use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

use sparkify_lake::config::{FileConfig, LakeConfig, Overrides};
use sparkify_lake::dedup::DedupPolicy;
use sparkify_lake::identity::IdStrategy;
use sparkify_lake::pipeline;
use sparkify_lake::progress::{format_duration, init_tracing, set_log_only};
use sparkify_lake::songplays::JoinPolicy;

#[derive(Parser)]
#[command(name = "sparkify-lake")]
#[command(about = "Build the partitioned Parquet song-play lake from raw JSON logs")]
struct Args {
    /// Input root holding song_data/ and log_data/
    input: Option<PathBuf>,

    /// Output root; table directories under it are replaced
    output: Option<PathBuf>,

    /// TOML config file ([storage], [storage.credentials], [transform])
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads (0 = one per core)
    #[arg(long, default_value = "0")]
    workers: usize,

    /// Hide progress bars and log periodic progress lines instead
    #[arg(long)]
    log_only: bool,

    /// Write run statistics as JSON to this path
    #[arg(long)]
    stats_json: Option<PathBuf>,

    /// Duplicate-row rule for the dimension tables
    #[arg(long, value_enum)]
    dedup: Option<DedupPolicy>,

    /// What to do when a song play matches several catalog entries
    #[arg(long, value_enum)]
    join: Option<JoinPolicy>,

    /// How songplay_id values are generated
    #[arg(long, value_enum)]
    ids: Option<IdStrategy>,

    /// Catalog file pattern, relative to the input root
    #[arg(long)]
    song_pattern: Option<String>,

    /// Activity file pattern, relative to the input root
    #[arg(long)]
    log_pattern: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();
    set_log_only(args.log_only);
    let start = Instant::now();

    if args.workers > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.workers)
            .build_global()
            .context("Failed to configure worker pool")?;
    }

    let file = match &args.config {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FileConfig::default(),
    };
    let overrides = Overrides {
        input_root: args.input,
        output_root: args.output,
        dedup: args.dedup,
        join: args.join,
        ids: args.ids,
        song_pattern: args.song_pattern,
        log_pattern: args.log_pattern,
    };
    let config = LakeConfig::resolve(file, overrides).context("Invalid configuration")?;

    println!("Input root: {:?}", config.storage.input_root);
    println!("Output root: {:?}", config.storage.output_root);
    println!(
        "Policies: dedup={:?} join={:?} ids={:?}",
        config.transform.dedup, config.transform.join, config.transform.ids
    );

    let stats = pipeline::run(&config).context("Lake build failed")?;
    stats.log_phase("complete");
    if let Some(path) = &args.stats_json {
        stats
            .write_to_file(path)
            .with_context(|| format!("Failed to write stats to {}", path.display()))?;
    }

    println!("\n{:=<60}", "");
    println!("Lake build complete!");
    println!("  Catalog records:  {}", stats.catalog_records);
    println!("  Activity records: {}", stats.activity_records);
    println!("  Song plays:       {}", stats.song_play_events);
    println!("  songs:     {}", stats.songs);
    println!("  artists:   {}", stats.artists);
    println!("  users:     {}", stats.users);
    println!("  time:      {}", stats.time);
    println!("  songplays: {}", stats.songplays);
    println!(
        "  Join misses: {} ({:.1}% matched)",
        stats.join_misses,
        stats.match_rate()
    );
    if stats.ambiguous_events > 0 {
        println!(
            "  Ambiguous plays: {} (+{} fan-out rows)",
            stats.ambiguous_events, stats.fan_out_rows
        );
    }
    println!("  Elapsed: {}", format_duration(start.elapsed()));
    println!("{:=<60}", "");

    Ok(())
}
