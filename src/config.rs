use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrokeError};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stroke dataset EDA and imbalanced classification",
    long_about = None
)]
#[command(propagate_version = true)]
pub struct StrokeArgs {
    #[arg(
        short,
        long,
        default_value = "data/healthcare-dataset-stroke-data.csv",
        help = "Input CSV path"
    )]
    pub input: PathBuf,
    #[arg(short, long, default_value = "data/output", help = "Output root")]
    pub output: PathBuf,
    #[arg(short, long, help = "JSON pipeline configuration")]
    pub config: Option<PathBuf>,
    #[arg(short, long, value_enum, default_value_t = Stage::All, help = "Stage to run")]
    pub stage: Stage,
    #[arg(short, long, action = clap::ArgAction::Count, help = "Verbose level")]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum Stage {
    All,
    Raw,
    Silver,
    Gold,
    Eda,
    Model,
}

impl Stage {
    /// Whether running `self` includes the `other` stage.
    pub fn includes(self, other: Stage) -> bool {
        self == Stage::All || self == other
    }
}

/// Knobs of the analysis. Every field has a default so a config file only
/// needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub seed: u64,
    pub train_size: f64,
    pub cv_folds: usize,
    pub smote_neighbors: usize,
    pub notable_cramers_v: f64,
    pub notable_correlation_ratio: f64,
    pub plots: bool,
    pub tuning: TuningConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 15,
            train_size: 0.8,
            cv_folds: 10,
            smote_neighbors: 5,
            notable_cramers_v: 0.29,
            notable_correlation_ratio: 0.3,
            plots: true,
            tuning: TuningConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub enabled: bool,
    pub logistic_c: Vec<f64>,
    pub boosting_rounds: Vec<usize>,
    pub boosting_learning_rates: Vec<f64>,
    pub boosting_depths: Vec<usize>,
    pub knn_neighbors: Vec<usize>,
    pub tree_depths: Vec<u16>,
    pub svm_c: Vec<f64>,
    pub svm_gamma: Vec<f64>,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            logistic_c: logspace(-3.0, 3.0, 20),
            boosting_rounds: vec![60, 100, 140, 180],
            boosting_learning_rates: vec![0.1, 0.01, 0.05],
            boosting_depths: (2..=9).collect(),
            knn_neighbors: vec![3, 5, 7, 9, 11],
            tree_depths: (3..=10).collect(),
            svm_c: vec![0.1, 1.0, 10.0, 100.0, 1000.0],
            svm_gamma: vec![1.0, 0.1, 0.01, 0.001, 0.0001],
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| StrokeError::io(path, e))?;
        let config: PipelineConfig =
            serde_json::from_str(&text).map_err(|e| StrokeError::Config {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let fail = |message: &str| {
            Err(StrokeError::Config {
                path: path.to_path_buf(),
                message: message.to_string(),
            })
        };
        if !(self.train_size > 0.0 && self.train_size < 1.0) {
            return fail("train_size must be strictly between 0 and 1");
        }
        if self.cv_folds < 2 {
            return fail("cv_folds must be at least 2");
        }
        if self.smote_neighbors == 0 {
            return fail("smote_neighbors must be positive");
        }
        Ok(())
    }
}

/// `num` values evenly spaced on a log10 scale between `10^start` and `10^stop`.
pub fn logspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![10f64.powf(start)],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num)
                .map(|i| 10f64.powf(start + step * i as f64))
                .collect()
        }
    }
}
