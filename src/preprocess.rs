use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::{DataFrame, NamedFrom, PolarsResult, Series};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Result, StrokeError};
use crate::records::{ColumnRoles, StrokeRecord};
use crate::stats::{mean, std_dev};

/// Shuffle with a fixed seed and cut into train/validation parts. The
/// validation part gets `ceil((1 - train_size) * n)` rows.
pub fn train_valid_split<T: Clone>(items: &[T], train_size: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let n = items.len();
    let n_valid = (((1.0 - train_size) * n as f64).ceil() as usize).min(n);
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let (valid_idx, train_idx) = order.split_at(n_valid);
    let train = train_idx.iter().map(|&i| items[i].clone()).collect();
    let valid = valid_idx.iter().map(|&i| items[i].clone()).collect();
    (train, valid)
}

pub fn labels(records: &[StrokeRecord]) -> Vec<i32> {
    records.iter().map(|r| r.stroke).collect()
}

/// Dense, row-major model input with named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn n_cols(&self) -> usize {
        self.names.len()
    }

    pub fn column(&self, idx: usize) -> Vec<f64> {
        self.rows.iter().map(|row| row[idx]).collect()
    }

    /// Feature columns followed by the target, ready for the gold layer.
    pub fn to_dataframe(&self, target_name: &str, target: &[i32]) -> PolarsResult<DataFrame> {
        let mut columns: Vec<Series> = (0..self.n_cols())
            .map(|j| Series::new(&self.names[j], self.column(j)))
            .collect();
        columns.push(Series::new(target_name, target.to_vec()));
        DataFrame::new(columns)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct NumericStep {
    column: String,
    fill: f64,
    mean: f64,
    scale: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct CategoricalStep {
    column: String,
    fill: String,
    categories: Vec<String>,
}

/// Mean-impute and standardise numeric columns; most-frequent-impute and
/// one-hot encode categorical ones. Fitted on training rows only.
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessor {
    numeric: Vec<NumericStep>,
    categorical: Vec<CategoricalStep>,
}

impl Preprocessor {
    pub fn fit(records: &[StrokeRecord], roles: &ColumnRoles) -> Result<Self> {
        if records.is_empty() {
            return Err(StrokeError::invalid("cannot fit preprocessing on zero rows"));
        }

        let mut numeric = Vec::with_capacity(roles.numerical.len());
        for column in &roles.numerical {
            let present: Vec<f64> = records.iter().filter_map(|r| r.numeric(column)).collect();
            let fill = mean(&present).ok_or_else(|| {
                StrokeError::invalid(format!("numeric column {column} has no values"))
            })?;
            let imputed: Vec<f64> = records
                .iter()
                .map(|r| r.numeric(column).unwrap_or(fill))
                .collect();
            let centre = mean(&imputed).unwrap_or(fill);
            let sd = std_dev(&imputed, 0).unwrap_or(0.0);
            numeric.push(NumericStep {
                column: column.clone(),
                fill,
                mean: centre,
                scale: if sd == 0.0 { 1.0 } else { sd },
            });
        }

        let mut categorical = Vec::with_capacity(roles.categorical.len());
        for column in &roles.categorical {
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for value in records.iter().filter_map(|r| r.category(column)) {
                *counts.entry(value).or_insert(0) += 1;
            }
            // BTreeMap iterates sorted, so ties resolve to the smallest value
            let fill = counts
                .iter()
                .fold(None::<(&String, usize)>, |best, (value, &count)| match best {
                    Some((_, best_count)) if best_count >= count => best,
                    _ => Some((value, count)),
                })
                .map(|(value, _)| value.clone())
                .ok_or_else(|| {
                    StrokeError::invalid(format!("categorical column {column} has no values"))
                })?;
            let categories: BTreeSet<String> = counts.into_keys().collect();
            categorical.push(CategoricalStep {
                column: column.clone(),
                fill,
                categories: categories.into_iter().collect(),
            });
        }

        Ok(Self {
            numeric,
            categorical,
        })
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.numeric.iter().map(|s| s.column.clone()).collect();
        for step in &self.categorical {
            for category in &step.categories {
                names.push(format!("{}_{}", step.column, category));
            }
        }
        names
    }

    pub fn n_features(&self) -> usize {
        self.numeric.len() + self.categorical.iter().map(|s| s.categories.len()).sum::<usize>()
    }

    /// Categories unseen during `fit` encode as all zeros.
    pub fn transform_one(&self, record: &StrokeRecord) -> Vec<f64> {
        let mut row = Vec::with_capacity(self.n_features());
        for step in &self.numeric {
            let value = record.numeric(&step.column).unwrap_or(step.fill);
            row.push((value - step.mean) / step.scale);
        }
        for step in &self.categorical {
            let value = record
                .category(&step.column)
                .unwrap_or_else(|| step.fill.clone());
            row.extend(
                step.categories
                    .iter()
                    .map(|category| if *category == value { 1.0 } else { 0.0 }),
            );
        }
        row
    }

    pub fn transform(&self, records: &[StrokeRecord]) -> FeatureMatrix {
        FeatureMatrix {
            names: self.feature_names(),
            rows: records.iter().map(|r| self.transform_one(r)).collect(),
        }
    }

    pub fn fit_transform(
        records: &[StrokeRecord],
        roles: &ColumnRoles,
    ) -> Result<(Self, FeatureMatrix)> {
        let preprocessor = Self::fit(records, roles)?;
        let matrix = preprocessor.transform(records);
        Ok((preprocessor, matrix))
    }
}
