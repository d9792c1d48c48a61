//! Descriptive statistics and association measures over the silver layer.

use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};
use polars::prelude::*;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::io::{ensure_dir, write_csv};
use crate::plots;
use crate::records::{display_name, records_from_dataframe, ColumnRoles, StrokeRecord, ID_COLUMN};
use crate::stats::{mean, mean_impute, median, min_max, pearson, round_to, std_dev};

/// A dense table of values with row and column labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledMatrix {
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl LabeledMatrix {
    /// Row labels go in the first column, named `index_name`.
    pub fn to_dataframe(&self, index_name: &str) -> PolarsResult<DataFrame> {
        let mut columns = vec![Series::new(
            index_name,
            self.rows.iter().map(String::as_str).collect::<Vec<&str>>(),
        )];
        for (j, name) in self.columns.iter().enumerate() {
            let values: Vec<f64> = self.values.iter().map(|row| row[j]).collect();
            columns.push(Series::new(name, values));
        }
        DataFrame::new(columns)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSummary {
    /// Rows including nulls.
    pub size: usize,
    /// Non-null rows.
    pub count: usize,
    pub n_unique: usize,
    /// In order of first appearance.
    pub unique: Vec<i32>,
    /// Most frequent first.
    pub value_counts: Vec<(i32, usize)>,
    pub null_count: usize,
}

pub fn target_summary(df: &DataFrame, target: &str) -> Result<TargetSummary> {
    let series = df.column(target)?;
    let cast = series.cast(&DataType::Int32)?;
    let values: Vec<i32> = cast.i32()?.into_iter().flatten().collect();

    let mut unique: Vec<i32> = Vec::new();
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for &v in &values {
        if !unique.contains(&v) {
            unique.push(v);
        }
        *counts.entry(v).or_insert(0) += 1;
    }
    let mut value_counts: Vec<(i32, usize)> = counts.into_iter().collect();
    value_counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    Ok(TargetSummary {
        size: series.len(),
        count: values.len(),
        n_unique: unique.len(),
        unique,
        value_counts,
        null_count: series.null_count(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSummary {
    pub column: String,
    pub dtype: String,
    pub n_unique: usize,
    pub missing: usize,
    pub percent_missing: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std: Option<f64>,
}

/// One row per column (the identifier excluded); statistics rounded to 2 dp.
pub fn feature_summary(df: &DataFrame) -> Result<Vec<FeatureSummary>> {
    let height = df.height();
    let mut summary = Vec::new();
    for series in df.get_columns() {
        if series.name() == ID_COLUMN {
            continue;
        }
        let missing = series.null_count();
        let percent_missing = if height == 0 {
            0.0
        } else {
            round_to(missing as f64 / height as f64 * 100.0, 2)
        };
        let mut row = FeatureSummary {
            column: series.name().to_string(),
            dtype: series.dtype().to_string(),
            n_unique: series.drop_nulls().n_unique()?,
            missing,
            percent_missing,
            min: None,
            max: None,
            mean: None,
            median: None,
            std: None,
        };
        if series.dtype().is_numeric() {
            let cast = series.cast(&DataType::Float64)?;
            let values: Vec<f64> = cast.f64()?.into_iter().flatten().collect();
            let rounded = |v: Option<f64>| v.map(|x| round_to(x, 2));
            let range = min_max(&values);
            row.min = rounded(range.map(|r| r.0));
            row.max = rounded(range.map(|r| r.1));
            row.mean = rounded(mean(&values));
            row.median = rounded(median(&values));
            row.std = rounded(std_dev(&values, 1));
        }
        summary.push(row);
    }
    Ok(summary)
}

fn feature_summary_frame(summary: &[FeatureSummary]) -> PolarsResult<DataFrame> {
    let stat = |pick: fn(&FeatureSummary) -> Option<f64>| -> Vec<Option<f64>> {
        summary.iter().map(pick).collect()
    };
    DataFrame::new(vec![
        Series::new("feature", summary.iter().map(|s| s.column.as_str()).collect::<Vec<&str>>()),
        Series::new("data_type", summary.iter().map(|s| s.dtype.as_str()).collect::<Vec<&str>>()),
        Series::new(
            "num_unique",
            summary.iter().map(|s| s.n_unique as u32).collect::<Vec<u32>>(),
        ),
        Series::new(
            "num_missing",
            summary.iter().map(|s| s.missing as u32).collect::<Vec<u32>>(),
        ),
        Series::new(
            "percent_missing",
            summary.iter().map(|s| s.percent_missing).collect::<Vec<f64>>(),
        ),
        Series::new("min", stat(|s| s.min)),
        Series::new("max", stat(|s| s.max)),
        Series::new("mean", stat(|s| s.mean)),
        Series::new("median", stat(|s| s.median)),
        Series::new("std", stat(|s| s.std)),
    ])
}

fn column_categories(records: &[StrokeRecord], column: &str) -> Vec<String> {
    records
        .iter()
        .map(|r| r.category(column).unwrap_or_default())
        .collect()
}

/// Value counts of a categorical column, most frequent first.
pub fn category_counts(records: &[StrokeRecord], column: &str) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for value in records.iter().filter_map(|r| r.category(column)) {
        *counts.entry(value).or_insert(0) += 1;
    }
    let mut counts: Vec<(String, usize)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PercentageRow {
    pub target: i32,
    pub category: String,
    pub count: usize,
    /// Share of the target group that falls in this category.
    pub percent_of_target: f64,
    /// Share of the category that has this target value.
    pub percent_of_category: f64,
}

/// Cross tabulation of target by category. Every (target, category)
/// combination is present, with a zero count if never observed.
pub fn percentages_by_target(records: &[StrokeRecord], column: &str) -> Vec<PercentageRow> {
    let mut counts: BTreeMap<(i32, String), usize> = BTreeMap::new();
    let mut targets: BTreeMap<i32, usize> = BTreeMap::new();
    let mut categories: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        let Some(category) = record.category(column) else {
            continue;
        };
        *counts.entry((record.stroke, category.clone())).or_insert(0) += 1;
        *targets.entry(record.stroke).or_insert(0) += 1;
        *categories.entry(category).or_insert(0) += 1;
    }

    let percent = |part: usize, whole: usize| {
        if whole == 0 {
            0.0
        } else {
            part as f64 / whole as f64 * 100.0
        }
    };
    let mut rows = Vec::with_capacity(targets.len() * categories.len());
    for (&target, &target_total) in &targets {
        for (category, &category_total) in &categories {
            let count = counts.get(&(target, category.clone())).copied().unwrap_or(0);
            rows.push(PercentageRow {
                target,
                category: category.clone(),
                count,
                percent_of_target: percent(count, target_total),
                percent_of_category: percent(count, category_total),
            });
        }
    }
    rows
}

fn percentages_frame(column: &str, rows: &[PercentageRow]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Series::new("stroke", rows.iter().map(|r| r.target).collect::<Vec<i32>>()),
        Series::new(column, rows.iter().map(|r| r.category.as_str()).collect::<Vec<&str>>()),
        Series::new("count", rows.iter().map(|r| r.count as u32).collect::<Vec<u32>>()),
        Series::new(
            "perc_of_target_cat",
            rows.iter().map(|r| r.percent_of_target).collect::<Vec<f64>>(),
        ),
        Series::new(
            "percent_of_cat_var",
            rows.iter().map(|r| r.percent_of_category).collect::<Vec<f64>>(),
        ),
    ])
}

/// Pairwise-complete Pearson correlation; undefined pairs are NaN.
pub fn pearson_matrix(records: &[StrokeRecord], columns: &[String]) -> LabeledMatrix {
    let data: Vec<Vec<Option<f64>>> = columns
        .iter()
        .map(|c| records.iter().map(|r| r.numeric(c)).collect())
        .collect();
    let values = data
        .iter()
        .map(|a| data.iter().map(|b| pearson(a, b).unwrap_or(f64::NAN)).collect())
        .collect();
    LabeledMatrix {
        rows: columns.to_vec(),
        columns: columns.to_vec(),
        values,
    }
}

/// Bias-corrected Cramér's V. Tables with one degree of freedom use the
/// Yates continuity correction; a non-positive denominator gives 0.
pub fn cramers_v(x: &[String], y: &[String]) -> f64 {
    let mut row_index: BTreeMap<&str, usize> = BTreeMap::new();
    let mut col_index: BTreeMap<&str, usize> = BTreeMap::new();
    for (a, b) in x.iter().zip(y) {
        let next = row_index.len();
        row_index.entry(a.as_str()).or_insert(next);
        let next = col_index.len();
        col_index.entry(b.as_str()).or_insert(next);
    }
    let (r, k) = (row_index.len(), col_index.len());
    let mut table = vec![vec![0f64; k]; r];
    for (a, b) in x.iter().zip(y) {
        table[row_index[a.as_str()]][col_index[b.as_str()]] += 1.0;
    }
    let n: f64 = table.iter().flatten().sum();
    if n < 2.0 {
        return 0.0;
    }

    let row_totals: Vec<f64> = table.iter().map(|row| row.iter().sum()).collect();
    let col_totals: Vec<f64> = (0..k).map(|j| table.iter().map(|row| row[j]).sum()).collect();
    let dof = (r - 1) * (k - 1);
    let mut chi2 = 0.0;
    if dof > 0 {
        for i in 0..r {
            for j in 0..k {
                let expected = row_totals[i] * col_totals[j] / n;
                let mut observed = table[i][j];
                if dof == 1 {
                    let diff = expected - observed;
                    observed += diff.signum() * diff.abs().min(0.5);
                }
                chi2 += (observed - expected).powi(2) / expected;
            }
        }
    }

    let (rf, kf) = (r as f64, k as f64);
    let phi2 = chi2 / n;
    let phi2corr = (phi2 - (kf - 1.0) * (rf - 1.0) / (n - 1.0)).max(0.0);
    let rcorr = rf - (rf - 1.0).powi(2) / (n - 1.0);
    let kcorr = kf - (kf - 1.0).powi(2) / (n - 1.0);
    let denominator = (kcorr - 1.0).min(rcorr - 1.0);
    if denominator <= 0.0 {
        return 0.0;
    }
    (phi2corr / denominator).sqrt()
}

pub fn cramers_matrix(records: &[StrokeRecord], columns: &[String]) -> LabeledMatrix {
    let data: Vec<Vec<String>> = columns.iter().map(|c| column_categories(records, c)).collect();
    let values = data
        .iter()
        .map(|a| data.iter().map(|b| cramers_v(a, b)).collect())
        .collect();
    LabeledMatrix {
        rows: columns.to_vec(),
        columns: columns.to_vec(),
        values,
    }
}

/// Correlation ratio (eta) of a numeric measurement given a category.
pub fn correlation_ratio(categories: &[String], measurements: &[f64]) -> f64 {
    let mut groups: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for (category, &value) in categories.iter().zip(measurements) {
        let entry = groups.entry(category.as_str()).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }
    let total_avg = match mean(measurements) {
        Some(m) => m,
        None => return 0.0,
    };
    let numerator: f64 = groups
        .values()
        .map(|&(sum, n)| n as f64 * (sum / n as f64 - total_avg).powi(2))
        .sum();
    if numerator == 0.0 {
        return 0.0;
    }
    let denominator: f64 = measurements.iter().map(|v| (v - total_avg).powi(2)).sum();
    (numerator / denominator).sqrt()
}

/// Rows are categorical columns, columns numeric ones (mean-imputed first).
pub fn correlation_ratio_matrix(
    records: &[StrokeRecord],
    categorical: &[String],
    numerical: &[String],
) -> LabeledMatrix {
    let measurements: Vec<Vec<f64>> = numerical
        .iter()
        .map(|c| mean_impute(&records.iter().map(|r| r.numeric(c)).collect::<Vec<_>>()))
        .collect();
    let values = categorical
        .iter()
        .map(|c| {
            let categories = column_categories(records, c);
            measurements
                .iter()
                .map(|m| correlation_ratio(&categories, m))
                .collect()
        })
        .collect();
    LabeledMatrix {
        rows: categorical.to_vec(),
        columns: numerical.to_vec(),
        values,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotablePair {
    pub first: String,
    pub second: String,
    pub value: f64,
}

/// Pairs below the diagonal of a symmetric matrix whose value, rounded to
/// 2 dp, exceeds `threshold`.
pub fn notable_associations(matrix: &LabeledMatrix, threshold: f64) -> Vec<NotablePair> {
    let n = matrix.columns.len();
    let mut pairs = Vec::new();
    for col in 0..n.saturating_sub(1) {
        for row in (col + 1)..matrix.rows.len() {
            let value = round_to(matrix.values[row][col], 2);
            if value > threshold {
                pairs.push(NotablePair {
                    first: matrix.columns[col].clone(),
                    second: matrix.rows[row].clone(),
                    value,
                });
            }
        }
    }
    pairs
}

/// Every cell whose value, rounded to 2 dp, exceeds `threshold`.
pub fn notable_cells(matrix: &LabeledMatrix, threshold: f64) -> Vec<NotablePair> {
    let mut pairs = Vec::new();
    for (j, column) in matrix.columns.iter().enumerate() {
        for (i, row) in matrix.rows.iter().enumerate() {
            let value = round_to(matrix.values[i][j], 2);
            if value > threshold {
                pairs.push(NotablePair {
                    first: column.clone(),
                    second: row.clone(),
                    value,
                });
            }
        }
    }
    pairs
}

/// Share of people aged `<= a` who had a stroke, for each whole age `a` from
/// 1 up to but excluding the floor of the oldest age.
pub fn cumulative_risk(records: &[StrokeRecord]) -> Vec<(u32, f64)> {
    let max_age = records.iter().map(|r| r.age).fold(f64::NEG_INFINITY, f64::max);
    if !max_age.is_finite() || max_age < 2.0 {
        return Vec::new();
    }
    (1..max_age.floor() as u32)
        .map(|age| {
            let cohort: Vec<&StrokeRecord> =
                records.iter().filter(|r| r.age <= age as f64).collect();
            let strokes = cohort.iter().filter(|r| r.is_stroke()).count();
            let risk = if cohort.is_empty() {
                0.0
            } else {
                strokes as f64 / cohort.len() as f64
            };
            (age, risk)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct EdaReport {
    pub shape: (usize, usize),
    pub target: TargetSummary,
    pub features: Vec<FeatureSummary>,
    pub category_counts: Vec<(String, Vec<(String, usize)>)>,
    pub percentages: Vec<(String, Vec<PercentageRow>)>,
    pub pearson: LabeledMatrix,
    pub cramers_v: LabeledMatrix,
    pub correlation_ratio: LabeledMatrix,
    pub notable_associations: Vec<NotablePair>,
    pub notable_correlation_ratios: Vec<NotablePair>,
    pub cumulative_risk: Vec<(u32, f64)>,
}

impl EdaReport {
    pub fn compute(
        df: &DataFrame,
        records: &[StrokeRecord],
        roles: &ColumnRoles,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let with_target = roles.categorical_with_target();
        let cramers = cramers_matrix(records, &with_target);
        let ratios = correlation_ratio_matrix(records, &with_target, &roles.numerical);
        Ok(Self {
            shape: df.shape(),
            target: target_summary(df, &roles.target)?,
            features: feature_summary(df)?,
            category_counts: with_target
                .iter()
                .map(|c| (c.clone(), category_counts(records, c)))
                .collect(),
            percentages: roles
                .categorical
                .iter()
                .map(|c| (c.clone(), percentages_by_target(records, c)))
                .collect(),
            pearson: pearson_matrix(records, &roles.numerical),
            notable_associations: notable_associations(&cramers, config.notable_cramers_v),
            notable_correlation_ratios: notable_cells(&ratios, config.notable_correlation_ratio),
            cramers_v: cramers,
            correlation_ratio: ratios,
            cumulative_risk: cumulative_risk(records),
        })
    }

    fn log(&self) {
        info!("dataset shape: {} rows x {} columns", self.shape.0, self.shape.1);
        info!(
            "target: size {}, count {}, unique {:?}, counts {:?}, nulls {}",
            self.target.size,
            self.target.count,
            self.target.unique,
            self.target.value_counts,
            self.target.null_count
        );
        for feature in self.features.iter().filter(|f| f.missing > 0) {
            warn!(
                "{} missing {} values ({}%)",
                feature.column, feature.missing, feature.percent_missing
            );
        }
        for pair in &self.notable_associations {
            info!("Cramér's V {} vs {}: {}", pair.first, pair.second, pair.value);
        }
        for pair in &self.notable_correlation_ratios {
            info!("correlation ratio {} vs {}: {}", pair.first, pair.second, pair.value);
        }
    }

    pub async fn write_tables(&self, dir: &Path) -> Result<()> {
        ensure_dir(dir).await?;
        let mut features = feature_summary_frame(&self.features)?;
        write_csv(dir.join("feature_summary.csv"), &mut features).await?;

        for (column, counts) in &self.category_counts {
            let mut df = DataFrame::new(vec![
                Series::new(column, counts.iter().map(|c| c.0.as_str()).collect::<Vec<&str>>()),
                Series::new("count", counts.iter().map(|c| c.1 as u32).collect::<Vec<u32>>()),
            ])?;
            write_csv(dir.join(format!("counts_{column}.csv")), &mut df).await?;
        }
        for (column, rows) in &self.percentages {
            let mut df = percentages_frame(column, rows)?;
            write_csv(dir.join(format!("percentages_{column}.csv")), &mut df).await?;
        }

        let mut pearson = self.pearson.to_dataframe("feature")?;
        write_csv(dir.join("correlation_numerical.csv"), &mut pearson).await?;
        write_csv(dir.join("cramers_v.csv"), &mut self.cramers_v.to_dataframe("feature")?).await?;
        write_csv(
            dir.join("correlation_ratio.csv"),
            &mut self.correlation_ratio.to_dataframe("feature")?,
        )
        .await?;

        let mut risk = DataFrame::new(vec![
            Series::new("age", self.cumulative_risk.iter().map(|r| r.0).collect::<Vec<u32>>()),
            Series::new(
                "cumulative_risk",
                self.cumulative_risk.iter().map(|r| r.1).collect::<Vec<f64>>(),
            ),
        ])?;
        write_csv(dir.join("cumulative_risk.csv"), &mut risk).await?;
        Ok(())
    }

    pub fn draw(&self, records: &[StrokeRecord], roles: &ColumnRoles, dir: &Path) -> Result<()> {
        let count_panels: Vec<plots::BarPanel> = self
            .category_counts
            .iter()
            .map(|(column, counts)| plots::BarPanel {
                title: format!("{} Count", display_name(column)),
                x_label: display_name(column),
                y_label: "Count".to_string(),
                bars: counts.iter().map(|(c, n)| (c.clone(), *n as f64)).collect(),
            })
            .collect();
        plots::bar_grid(
            &dir.join("combined_cat_counts.svg"),
            "Categorical Variable Counts",
            &count_panels,
            4,
        )?;

        let percent_panels: Vec<plots::BarPanel> = self
            .percentages
            .iter()
            .map(|(column, rows)| plots::BarPanel {
                title: format!("Percent Stroke by {}", display_name(column)),
                x_label: display_name(column),
                y_label: "Percent Stroke".to_string(),
                bars: rows
                    .iter()
                    .filter(|r| r.target == 1)
                    .map(|r| (r.category.clone(), r.percent_of_category))
                    .collect(),
            })
            .collect();
        plots::bar_grid(
            &dir.join("combined_perc_stroke.svg"),
            "Percent Stroke by Categorical Variable",
            &percent_panels,
            4,
        )?;

        let distributions: Vec<plots::DistributionPanel> = roles
            .numerical
            .iter()
            .map(|column| {
                let pick = |stroke: Option<bool>| -> Vec<f64> {
                    records
                        .iter()
                        .filter(|r| stroke.map_or(true, |s| r.is_stroke() == s))
                        .filter_map(|r| r.numeric(column))
                        .collect()
                };
                plots::DistributionPanel {
                    label: display_name(column),
                    values: pick(None),
                    stroke: pick(Some(true)),
                    no_stroke: pick(Some(false)),
                }
            })
            .collect();
        plots::distributions(&dir.join("combined_dist.svg"), &distributions)?;

        plots::heatmap_row(
            &dir.join("combined_corr.svg"),
            "Feature Correlation",
            &[
                ("Correlation Between Continuous Variables", &self.pearson),
                ("Association Between Categorical Variables (Cramér's V)", &self.cramers_v),
                (
                    "Correlation Ratio Between Numerical and Categorical Variables",
                    &self.correlation_ratio,
                ),
            ],
            (0.0, 1.0),
        )?;

        let risk: Vec<(f64, f64)> = self
            .cumulative_risk
            .iter()
            .map(|&(age, risk)| (age as f64, risk))
            .collect();
        plots::line_chart(
            &dir.join("cumulative_stroke_risk_vs_age.svg"),
            "Cumulative Stroke Risk vs. Age",
            "Age",
            "Cumulative Stroke Risk",
            &[plots::Line::solid("cumulative risk", risk)],
        )?;
        Ok(())
    }
}

/// The eda stage: summaries and association tables from the silver frame.
pub async fn run(df: &DataFrame, config: &PipelineConfig, dir: &Path) -> Result<EdaReport> {
    info!("data sample:\n{}", df.head(Some(5)));
    let records = records_from_dataframe(df)?;
    let roles = ColumnRoles::from_frame(df)?;
    info!(
        "categorical features {:?}, numerical features {:?}, target {}",
        roles.categorical, roles.numerical, roles.target
    );

    let report = EdaReport::compute(df, &records, &roles, config)?;
    report.log();
    report.write_tables(dir).await?;
    if config.plots {
        report.draw(&records, &roles, dir)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::fixtures::cohort;
    use crate::records::records_to_dataframe;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn target_and_feature_summaries() {
        let records = cohort(50);
        let df = records_to_dataframe(&records).unwrap();
        let target = target_summary(&df, "stroke").unwrap();
        assert_eq!(target.size, 50);
        assert_eq!(target.count, 50);
        assert_eq!(target.null_count, 0);
        assert_eq!(target.value_counts.iter().map(|v| v.1).sum::<usize>(), 50);

        let features = feature_summary(&df).unwrap();
        assert!(features.iter().all(|f| f.column != "id"));
        let bmi = features.iter().find(|f| f.column == "bmi").unwrap();
        assert_eq!(bmi.missing, 4);
        assert_eq!(bmi.percent_missing, 8.0);
        assert!(bmi.mean.is_some());
        let distinct: std::collections::BTreeSet<u64> = records
            .iter()
            .filter_map(|r| r.bmi.map(f64::to_bits))
            .collect();
        assert_eq!(distinct.len(), 20);
        assert_eq!(bmi.n_unique, distinct.len());
        let gender = features.iter().find(|f| f.column == "gender").unwrap();
        assert_eq!(gender.n_unique, 2);
        assert!(gender.mean.is_none());
    }

    #[test]
    fn percentages_fill_missing_combinations() {
        let mut records = cohort(40);
        records[3].gender = "Other".to_string();
        records[3].stroke = 0;
        let rows = percentages_by_target(&records, "gender");
        let other_stroke = rows
            .iter()
            .find(|r| r.target == 1 && r.category == "Other")
            .unwrap();
        assert_eq!(other_stroke.count, 0);
        for target in [0, 1] {
            let total: f64 = rows
                .iter()
                .filter(|r| r.target == target)
                .map(|r| r.percent_of_target)
                .sum();
            assert!((total - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn category_counts_descend() {
        let records = cohort(30);
        let counts = category_counts(&records, "hypertension");
        assert_eq!(counts[0].0, "normotensive");
        assert!(counts[0].1 >= counts[1].1);
    }

    #[test]
    fn cramers_v_extremes() {
        let three = strings(&["a", "b", "c", "a", "b", "c", "a", "b", "c", "a"]);
        assert!((cramers_v(&three, &three) - 1.0).abs() < 1e-9);

        let x = strings(&["a", "a", "b", "b"].repeat(10));
        let y = strings(&["c", "d", "c", "d"].repeat(10));
        assert_eq!(cramers_v(&x, &y), 0.0);

        let binary = strings(&["yes", "no"].repeat(50));
        let v = cramers_v(&binary, &binary);
        assert!(v > 0.95 && v <= 1.0);

        let constant = strings(&["z"; 10]);
        assert_eq!(cramers_v(&constant, &three), 0.0);
    }

    #[test]
    fn correlation_ratio_bounds() {
        let categories = strings(&["a", "a", "b", "b"]);
        assert!((correlation_ratio(&categories, &[1.0, 1.0, 5.0, 5.0]) - 1.0).abs() < 1e-12);
        assert_eq!(correlation_ratio(&categories, &[2.0, 2.0, 2.0, 2.0]), 0.0);

        let records = cohort(80);
        let roles = ColumnRoles::from_frame(&records_to_dataframe(&records).unwrap()).unwrap();
        let matrix =
            correlation_ratio_matrix(&records, &roles.categorical_with_target(), &roles.numerical);
        assert!(matrix.values.iter().flatten().all(|v| (0.0..=1.0 + 1e-12).contains(v)));
    }

    #[test]
    fn notable_pairs_use_rounded_values() {
        let matrix = LabeledMatrix {
            rows: strings(&["a", "b", "c"]),
            columns: strings(&["a", "b", "c"]),
            values: vec![
                vec![1.0, 0.5, 0.286],
                vec![0.5, 1.0, 0.1],
                vec![0.286, 0.1, 1.0],
            ],
        };
        let pairs = notable_associations(&matrix, 0.29);
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].first.as_str(), pairs[0].second.as_str()), ("a", "b"));
        assert_eq!(notable_cells(&matrix, 0.9).len(), 3);
    }

    #[test]
    fn cumulative_risk_by_age() {
        let mut records = cohort(5);
        let ages = [0.5, 1.5, 2.0, 3.0, 4.9];
        let strokes = [1, 0, 0, 1, 0];
        for ((record, age), stroke) in records.iter_mut().zip(ages).zip(strokes) {
            record.age = age;
            record.stroke = stroke;
        }
        let risk = cumulative_risk(&records);
        assert_eq!(risk.len(), 3);
        assert_eq!(risk[0], (1, 1.0));
        assert!((risk[1].1 - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(risk[2], (3, 0.5));
    }

    #[tokio::test]
    async fn run_writes_tables() {
        let dir = tempfile::tempdir().unwrap();
        let df = records_to_dataframe(&cohort(120)).unwrap();
        let config = PipelineConfig {
            plots: false,
            ..PipelineConfig::default()
        };
        let report = run(&df, &config, dir.path()).await.unwrap();
        assert_eq!(report.shape, (120, 12));
        assert_eq!(report.cramers_v.rows.len(), 8);
        assert!(dir.path().join("feature_summary.csv").exists());
        assert!(dir.path().join("counts_stroke.csv").exists());
        assert!(dir.path().join("cumulative_risk.csv").exists());
    }
}
