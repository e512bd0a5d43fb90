use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod aggregate;
mod classify;
mod config;
mod csv_input;
mod detect;
mod error;
mod export;
mod fetch;
mod join;
mod legend;
mod normalize;
mod pipeline;
mod states;
mod types;
mod utils;

use config::Config;
use csv_input::{suggest_join_columns, CsvTable};
use detect::{detect_state_fips, detect_states, StateDetection};
use fetch::{BoundaryFetcher, CachedClient};
use legend::{RunReport, ToConl};
use pipeline::MapResult;
use types::{AggregationPolicy, ClassMethod, ColorScheme, GeographyLevel, MissingValuePolicy};
use utils::file_link;

#[derive(Parser)]
#[command(name = "choropleth-join")]
#[command(about = "Join CSV data to US boundary polygons and class it for a choropleth map")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// CONL settings file (default: ./choropleth.conl when present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Quiet mode - only warnings and errors in the log
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch boundaries, join the CSV and write a classed GeoJSON plus a CONL report
    Map(MapArgs),
    /// Show which states the join column covers and whether the fetch can be narrowed
    DetectStates {
        csv: PathBuf,
        /// Join column holding FIPS codes or ZIPs
        #[arg(long)]
        join: String,
        #[arg(long, value_parser = parse_level, default_value = "county")]
        level: GeographyLevel,
    },
    /// List columns, suggested join columns and numeric data columns
    Inspect { csv: PathBuf },
    /// Remove the boundary response cache
    Clean,
}

#[derive(Args)]
struct MapArgs {
    csv: PathBuf,
    /// county, subcounty, zip, tract, place or state
    #[arg(long, value_parser = parse_level)]
    level: GeographyLevel,
    /// CSV column holding the geographic identifier
    #[arg(long)]
    join: String,
    /// CSV column holding the value to map
    #[arg(long)]
    data: String,
    /// Restrict boundaries to one state (USPS code, FIPS or name)
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    classes: Option<usize>,
    #[arg(long, value_enum)]
    method: Option<ClassMethod>,
    #[arg(long, value_enum)]
    colors: Option<ColorScheme>,
    /// How rows sharing a join key are collapsed
    #[arg(long, value_enum)]
    aggregation: Option<AggregationPolicy>,
    /// What a non-numeric data value becomes
    #[arg(long, value_enum)]
    missing: Option<MissingValuePolicy>,
    #[arg(short, long, default_value = export::DEFAULT_GEOJSON_FILE)]
    output: PathBuf,
    /// Also write an ESRI shapefile layer into this directory
    #[arg(long, value_name = "DIR", num_args = 0..=1, default_missing_value = export::DEFAULT_SHAPEFILE_DIR)]
    shapefile: Option<PathBuf>,
}

fn parse_level(s: &str) -> Result<GeographyLevel, String> {
    GeographyLevel::from_str(s).ok_or_else(|| {
        format!(
            "unknown geography level '{}' (county, subcounty, zip, tract, place, state)",
            s
        )
    })
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_csv(path: &Path) -> Result<CsvTable> {
    CsvTable::from_path(path).with_context(|| format!("Failed to load CSV: {}", path.display()))
}

fn print_summary(result: &MapResult) {
    let report = &result.join;
    println!(
        "Matched {} of {} boundaries ({} without data)",
        report.matched,
        report.total(),
        report.unmatched
    );
    if report.matched_by_name > 0 {
        println!("  {} matched by county name", report.matched_by_name);
    }
    if let Some(mode) = result.aggregation {
        println!(
            "  {} duplicate keys aggregated by {}",
            result.duplicate_keys,
            mode.as_str()
        );
    }
    if report.unparseable_values > 0 {
        println!("  {} non-numeric data values", report.unparseable_values);
    }
    for failure in &result.fetch_failures {
        println!("  {} skipped: {}", failure.state, failure.error);
    }

    if let Some(stats) = &result.stats {
        println!(
            "Statistics: {} features, min {:.2}, max {:.2}, average {:.2}",
            stats.count, stats.min, stats.max, stats.mean
        );
    }

    println!("Legend ({}):", result.classification.method.as_str());
    for (label, color) in result.classification.legend_entries() {
        println!("  {}  {}", color, label);
    }
}

fn run_map(args: MapArgs, config: &Config) -> Result<()> {
    let table = load_csv(&args.csv)?;

    let mut request = config.map_request(args.level, &args.join, &args.data)?;
    request.state = args.state;
    if let Some(n) = args.classes {
        request.class_count = n;
    }
    if let Some(method) = args.method {
        request.method = method;
    }
    if let Some(scheme) = args.colors {
        request.scheme = scheme;
    }
    if let Some(policy) = args.aggregation {
        request.aggregation = policy;
    }
    if let Some(policy) = args.missing {
        request.missing_values = policy;
    }

    let client = CachedClient::new(config.user_agent(), config.cache_dir())
        .context("Failed to build HTTP client")?;
    let fetcher = BoundaryFetcher::new(&client, config.fetch_settings());

    let result = pipeline::process(table, &request, &fetcher)?;
    print_summary(&result);

    export::write_geojson(&result.merged, &args.output)?;
    println!("Wrote {}", file_link(&args.output));

    let report_path = args.output.with_extension("conl");
    let csv_name = args.csv.display().to_string();
    let report = RunReport {
        generated: chrono::Utc::now(),
        csv_file: &csv_name,
        request: &request,
        result: &result,
    };
    fs::write(&report_path, report.to_conl())
        .with_context(|| format!("Failed to write report: {}", report_path.display()))?;
    println!("Wrote {}", file_link(&report_path));

    if let Some(dir) = args.shapefile {
        let layer = export::export_shapefile(&result.merged, &dir, &export::EsriShapefileWriter)
            .context("Shapefile export failed (the GeoJSON output is complete)")?;
        println!("Wrote {} ({} records)", file_link(&dir), layer.records.len());
    }

    Ok(())
}

fn run_detect_states(csv: &Path, join: &str, level: GeographyLevel, config: &Config) -> Result<()> {
    let table = load_csv(csv)?;
    table.require_column(join)?;

    let max = config.max_detected_states();
    let fips = detect_state_fips(table.column_values(join), level);
    println!("Distinct state codes in '{}': {}", join, fips.len());
    for code in &fips {
        match states::by_fips(code) {
            Some(state) => println!("  {} {} ({})", code, state.abbr, state.name),
            None => println!("  {} (unassigned)", code),
        }
    }

    match detect_states(table.column_values(join), level, max) {
        StateDetection::Narrowed(found) => {
            let abbrs: Vec<&str> = found.iter().map(|s| s.abbr).collect();
            println!("Fetch narrows to {} states: {}", abbrs.len(), abbrs.join(", "));
        }
        StateDetection::CannotNarrow { distinct } => {
            println!(
                "Cannot narrow ({} states, limit {}); boundaries would be fetched nationwide",
                distinct, max
            );
        }
    }
    Ok(())
}

fn run_inspect(csv: &Path) -> Result<()> {
    let table = load_csv(csv)?;
    println!("{}: {} rows", csv.display(), table.rows.len());
    println!("Columns: {}", table.headers.join(", "));

    let suggestions = suggest_join_columns(&table);
    if suggestions.is_empty() {
        println!("No obvious join column");
    } else {
        println!("Suggested join columns:");
        for s in &suggestions {
            println!(
                "  {} -> {} ({}, confidence {:.0}%)",
                s.column,
                s.level,
                s.kind,
                s.confidence * 100.0
            );
        }
    }

    let numeric = table.numeric_columns();
    if !numeric.is_empty() {
        println!("Numeric data columns: {}", numeric.join(", "));
    }
    Ok(())
}

fn run_clean(config: &Config) -> Result<()> {
    println!("Cleaning boundary cache...");
    match config.cache_dir() {
        Some(dir) if dir.exists() => {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
            println!("  Removed {}", dir.display());
        }
        Some(dir) => println!("  Nothing at {}", dir.display()),
        None => println!("  Caching is disabled"),
    }
    println!("Clean complete!");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Map(args) => run_map(args, &config),
        Commands::DetectStates { csv, join, level } => run_detect_states(&csv, &join, level, &config),
        Commands::Inspect { csv } => run_inspect(&csv),
        Commands::Clean => run_clean(&config),
    }
}
