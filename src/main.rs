mod boosting;
mod config;
mod cv;
mod eda;
mod error;
mod io;
mod metrics;
mod models;
mod plots;
mod preprocess;
mod records;
mod report;
mod smote;
mod stats;
mod tuning;

use std::path::Path;
use std::time::Instant;

use clap::Parser;
use env_logger::{Builder, Env};
use log::{debug, info, warn, LevelFilter};
use polars::prelude::DataFrame;
use sysinfo::{get_current_pid, ProcessExt, System, SystemExt};

use crate::config::{PipelineConfig, Stage, StrokeArgs};
use crate::error::Result;
use crate::io::{load_records, read_csv, read_parquet, write_csv, write_parquet, Layout};
use crate::preprocess::{labels, Preprocessor};
use crate::records::{clean_silver, records_from_dataframe, records_to_dataframe, ColumnRoles};

/// Resident memory of this process in bytes, 0 when it cannot be read.
fn monitor_memory() -> u64 {
    let Ok(pid) = get_current_pid() else {
        return 0;
    };
    let mut system = System::new();
    system.refresh_process(pid);
    system.process(pid).map_or(0, |process| process.memory())
}

async fn process_raw(input: &Path, layout: &Layout) -> Result<()> {
    let mut df = read_csv(input).await?;
    info!("raw layer: {:?} rows x columns", df.shape());
    write_parquet(layout.raw(), &mut df).await
}

async fn process_silver(layout: &Layout) -> Result<()> {
    let raw = read_parquet(layout.raw()).await?;
    let mut df = clean_silver(raw)?;
    info!(
        "silver layer: {} missing bmi values",
        df.column("bmi")?.null_count()
    );
    write_parquet(layout.silver(), &mut df).await
}

/// The silver layer, or the typed source CSV when the silver stage has not
/// been run.
async fn load_silver(input: &Path, layout: &Layout) -> Result<DataFrame> {
    let path = layout.silver();
    if path.exists() {
        return read_parquet(path).await;
    }
    warn!("{path:?} not found, loading {input:?} instead");
    Ok(records_to_dataframe(&load_records(input)?)?)
}

async fn process_gold(input: &Path, layout: &Layout) -> Result<()> {
    let silver = load_silver(input, layout).await?;
    let records = records_from_dataframe(&silver)?;
    let roles = ColumnRoles::from_frame(&silver)?;
    let (_, features) = Preprocessor::fit_transform(&records, &roles)?;
    let mut df = features.to_dataframe(&roles.target, &labels(&records))?;
    info!("gold layer:\n{}", df.head(Some(5)));

    write_csv(layout.gold_debug(), &mut df).await?;
    write_parquet(layout.gold(), &mut df).await
}

async fn process_eda(input: &Path, layout: &Layout, config: &PipelineConfig) -> Result<()> {
    let df = load_silver(input, layout).await?;
    eda::run(&df, config, &layout.eda_dir()).await?;
    Ok(())
}

async fn process_model(input: &Path, layout: &Layout, config: &PipelineConfig) -> Result<()> {
    let df = load_silver(input, layout).await?;
    let records = records_from_dataframe(&df)?;
    let roles = ColumnRoles::from_frame(&df)?;
    let report = report::run(&records, &roles, config, &layout.models_dir()).await?;

    info!(
        "imbalance study:\n{}",
        report.imbalance.table.to_dataframe("model")?
    );
    info!("model comparison:\n{}", report.comparison_table().to_dataframe("model")?);
    if !report.tuned.is_empty() {
        info!("tuned models:\n{}", report.tuned_table().to_dataframe("model")?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = StrokeArgs::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let env = Env::new().filter("STROKE_LOG");
    Builder::new()
        .filter(Some("stroke_analysis"), log_level)
        .parse_env(env)
        .init();

    debug!("arguments {:#?}", args);

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    let layout = Layout::new(&args.output);

    let start_time = Instant::now();
    let start_memory = monitor_memory();

    if args.stage.includes(Stage::Raw) {
        process_raw(&args.input, &layout).await?;
    }
    if args.stage.includes(Stage::Silver) {
        process_silver(&layout).await?;
    }
    if args.stage.includes(Stage::Gold) {
        process_gold(&args.input, &layout).await?;
    }
    if args.stage.includes(Stage::Eda) {
        process_eda(&args.input, &layout, &config).await?;
    }
    if args.stage.includes(Stage::Model) {
        process_model(&args.input, &layout, &config).await?;
    }

    let end_memory = monitor_memory();
    info!("time elapsed: {:?}", start_time.elapsed());
    info!(
        "memory used: {} KiB",
        end_memory.saturating_sub(start_memory) / 1024
    );

    Ok(())
}
