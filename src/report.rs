//! The model stage: imbalance study, model comparison and tuned refits.

use std::path::Path;

use log::{debug, info, warn};
use serde::Serialize;
use smartcore::decomposition::pca::{PCAParameters, PCA};
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::config::PipelineConfig;
use crate::cv::{cross_validate, CvScores};
use crate::eda::LabeledMatrix;
use crate::error::{Result, StrokeError};
use crate::io::{ensure_dir, write_csv};
use crate::metrics::{evaluate, Evaluation};
use crate::models::{Classifier, LogisticRegression, ModelSpec, PipelineSpec};
use crate::plots;
use crate::preprocess::{labels, train_valid_split, Preprocessor};
use crate::records::{ColumnRoles, StrokeRecord};
use crate::smote::Smote;
use crate::stats::round_to;
use crate::tuning::{grid_search, grids, SearchResult};

pub const HOLDOUT_METRICS: [&str; 7] = [
    "Accuracy",
    "Recall",
    "Specificity",
    "Precision (avg)",
    "NPV",
    "AUROC",
    "f1",
];

pub const COMPARISON_METRICS: [&str; 7] = [
    "Accuracy",
    "Recall (CV)",
    "Specificity",
    "Precision (avg)",
    "NPV",
    "AUROC",
    "f1 (CV)",
];

/// `{0: pos/neg, 1: neg/pos}`, each rounded to 4 dp.
pub fn balanced_class_weights(y: &[i32]) -> Result<[f64; 2]> {
    let positives = y.iter().filter(|&&label| label == 1).count() as f64;
    let negatives = y.len() as f64 - positives;
    if positives == 0.0 || negatives == 0.0 {
        return Err(StrokeError::invalid("class weights need both classes"));
    }
    Ok([
        round_to(positives / negatives, 4),
        round_to(negatives / positives, 4),
    ])
}

/// Projection of `rows` onto their first two principal components.
pub fn pca_projection(rows: &[Vec<f64>]) -> Result<Vec<(f64, f64)>> {
    let width = rows.first().map_or(0, Vec::len);
    if rows.len() < 2 || width < 2 {
        return Err(StrokeError::invalid("PCA needs at least two rows and two columns"));
    }
    let values: Vec<f64> = rows.iter().flatten().copied().collect();
    let dense = DenseMatrix::new(rows.len(), width, values, false);
    let params = PCAParameters::default().with_n_components(2);
    let pca = PCA::<f64, DenseMatrix<f64>>::fit(&dense, params)?;
    let projected = pca.transform(&dense)?;
    let (n, _) = projected.shape();
    Ok((0..n)
        .map(|i| (*projected.get((i, 0)), *projected.get((i, 1))))
        .collect())
}

fn holdout_row(e: &Evaluation) -> Vec<f64> {
    vec![
        e.accuracy,
        e.sensitivity,
        e.specificity,
        e.average_precision,
        e.npv,
        e.auroc,
        e.f1,
    ]
}

fn slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

/// One model evaluated on the holdout split and by cross validation.
#[derive(Debug, Clone, Serialize)]
pub struct ModelResult {
    pub name: String,
    pub model: ModelSpec,
    pub cv: CvScores,
    pub evaluation: Evaluation,
}

impl ModelResult {
    fn comparison_row(&self) -> Vec<f64> {
        let e = &self.evaluation;
        vec![
            e.accuracy,
            round_to(self.cv.mean_recall(), 4),
            e.specificity,
            e.average_precision,
            e.npv,
            e.auroc,
            round_to(self.cv.mean_f1(), 4),
        ]
    }
}

fn comparison_table(results: &[ModelResult]) -> LabeledMatrix {
    LabeledMatrix {
        rows: results.iter().map(|r| r.name.clone()).collect(),
        columns: COMPARISON_METRICS.iter().map(|c| c.to_string()).collect(),
        values: results.iter().map(ModelResult::comparison_row).collect(),
    }
}

/// Logistic regression on the raw imbalance, with class weights and after SMOTE.
#[derive(Debug, Clone, Serialize)]
pub struct ImbalanceStudy {
    pub class_weights: [f64; 2],
    pub evaluations: Vec<Evaluation>,
    pub table: LabeledMatrix,
    #[serde(skip)]
    pub before_smote: Vec<(f64, f64)>,
    #[serde(skip)]
    pub after_smote: Vec<(f64, f64)>,
    #[serde(skip)]
    pub train_labels: Vec<i32>,
    #[serde(skip)]
    pub resampled_labels: Vec<i32>,
}

impl ImbalanceStudy {
    pub fn run(
        train: &[StrokeRecord],
        valid: &[StrokeRecord],
        roles: &ColumnRoles,
        smote: &Smote,
    ) -> Result<Self> {
        let (preprocessor, x_train) = Preprocessor::fit_transform(train, roles)?;
        let x_valid = preprocessor.transform(valid);
        let y_train = labels(train);
        let y_valid = labels(valid);

        let class_weights = balanced_class_weights(&y_train)?;
        info!("class weights {{0: {}, 1: {}}}", class_weights[0], class_weights[1]);
        let (x_resampled, y_resampled) = smote.fit_resample(&x_train.rows, &y_train)?;

        let mut evaluations = Vec::with_capacity(3);
        for (name, weights, x, y) in [
            ("LR", None, &x_train.rows, &y_train),
            ("LR (weighted)", Some(class_weights), &x_train.rows, &y_train),
            ("LR (SMOTE)", None, &x_resampled, &y_resampled),
        ] {
            let mut model = LogisticRegression::new(1.0, weights);
            model.fit(x, y)?;
            debug!(
                "{name}: intercept {:.4}, coefficients {:?}",
                model.intercept(),
                model.coefficients()
            );
            let predicted = model.predict(&x_valid.rows)?;
            let scores = model.predict_proba(&x_valid.rows)?;
            evaluations.push(evaluate(name, &y_valid, &predicted, &scores));
        }

        let table = LabeledMatrix {
            rows: evaluations.iter().map(|e| e.model_name.clone()).collect(),
            columns: HOLDOUT_METRICS.iter().map(|c| c.to_string()).collect(),
            values: evaluations.iter().map(holdout_row).collect(),
        };

        Ok(Self {
            class_weights,
            evaluations,
            table,
            before_smote: pca_projection(&x_train.rows)?,
            after_smote: pca_projection(&x_resampled)?,
            train_labels: y_train,
            resampled_labels: y_resampled,
        })
    }
}

/// Fit `pipeline` on the training split, evaluate on the holdout split and
/// cross validate on every record.
fn assess(
    name: &str,
    pipeline: &PipelineSpec,
    records: &[StrokeRecord],
    train: &[StrokeRecord],
    valid: &[StrokeRecord],
    roles: &ColumnRoles,
    folds: usize,
) -> Result<ModelResult> {
    let fitted = pipeline.fit(train, roles)?;
    let predicted = fitted.predict(valid)?;
    let scores = fitted.predict_proba(valid)?;
    let evaluation = evaluate(name, &labels(valid), &predicted, &scores);
    let cv = cross_validate(pipeline, records, roles, folds)?;
    info!(
        "{name}: accuracy {}, recall {}, AUROC {}, mean CV f1 {:.4}, mean CV recall {:.4}",
        evaluation.accuracy,
        evaluation.sensitivity,
        evaluation.auroc,
        cv.mean_f1(),
        cv.mean_recall()
    );
    if !evaluation.possible_thresholds.is_empty() {
        info!("{name}: possible thresholds used {:?}", evaluation.possible_thresholds);
    }
    Ok(ModelResult {
        name: name.to_string(),
        model: pipeline.model.clone(),
        cv,
        evaluation,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelReport {
    pub train_rows: usize,
    pub valid_rows: usize,
    pub imbalance: ImbalanceStudy,
    pub comparison: Vec<ModelResult>,
    pub searches: Vec<SearchResult>,
    pub tuned: Vec<ModelResult>,
}

impl ModelReport {
    pub fn comparison_table(&self) -> LabeledMatrix {
        comparison_table(&self.comparison)
    }

    pub fn tuned_table(&self) -> LabeledMatrix {
        comparison_table(&self.tuned)
    }

    pub fn compute(
        records: &[StrokeRecord],
        roles: &ColumnRoles,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let (train, valid) = train_valid_split(records, config.train_size, config.seed);
        info!("split: {} training rows, {} validation rows", train.len(), valid.len());
        let smote = Smote::new(config.smote_neighbors, config.seed);

        let imbalance = ImbalanceStudy::run(&train, &valid, roles, &smote)?;

        let mut comparison = Vec::new();
        for model in ModelSpec::zoo(config.seed) {
            let pipeline = PipelineSpec::new(model.clone(), Some(smote.clone()));
            comparison.push(assess(
                model.family(),
                &pipeline,
                records,
                &train,
                &valid,
                roles,
                config.cv_folds,
            )?);
        }

        let mut searches = Vec::new();
        let mut tuned = Vec::new();
        if config.tuning.enabled {
            for candidates in grids(&config.tuning, config.seed) {
                if candidates.is_empty() {
                    continue;
                }
                let search = grid_search(&candidates, &smote, &train, roles, config.cv_folds)?;
                let pipeline = PipelineSpec::new(search.best.clone(), Some(smote.clone()));
                let name = format!("{} (tuned)", search.family);
                tuned.push(assess(
                    &name,
                    &pipeline,
                    records,
                    &train,
                    &valid,
                    roles,
                    config.cv_folds,
                )?);
                searches.push(search);
            }
        } else {
            warn!("hyperparameter tuning disabled");
        }

        Ok(Self {
            train_rows: train.len(),
            valid_rows: valid.len(),
            imbalance,
            comparison,
            searches,
            tuned,
        })
    }

    pub async fn write_tables(&self, dir: &Path) -> Result<()> {
        ensure_dir(dir).await?;
        write_csv(
            dir.join("imbalance_comparison.csv"),
            &mut self.imbalance.table.to_dataframe("model")?,
        )
        .await?;
        write_csv(
            dir.join("model_comparison.csv"),
            &mut self.comparison_table().to_dataframe("model")?,
        )
        .await?;
        if !self.tuned.is_empty() {
            write_csv(
                dir.join("tuned_comparison.csv"),
                &mut self.tuned_table().to_dataframe("model")?,
            )
            .await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let path = dir.join("metrics.json");
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| StrokeError::io(&path, e))?;
        Ok(())
    }

    pub fn draw(&self, dir: &Path) -> Result<()> {
        plots::heatmap(
            &dir.join("imbalance_comparison.svg"),
            "Logistic Regression and Class Imbalance",
            &self.imbalance.table,
            None,
            3,
        )?;
        plots::scatter_grid(
            &dir.join("pca_smote.svg"),
            "Training Data Projected on Two Principal Components",
            &[
                plots::ScatterPanel {
                    title: "Before SMOTE".to_string(),
                    points: self.imbalance.before_smote.clone(),
                    labels: self.imbalance.train_labels.clone(),
                },
                plots::ScatterPanel {
                    title: "After SMOTE".to_string(),
                    points: self.imbalance.after_smote.clone(),
                    labels: self.imbalance.resampled_labels.clone(),
                },
            ],
        )?;

        plots::heatmap(
            &dir.join("model_comparison.svg"),
            "Model Comparison",
            &self.comparison_table(),
            None,
            3,
        )?;
        if !self.tuned.is_empty() {
            plots::heatmap(
                &dir.join("tuned_comparison.svg"),
                "Tuned Model Comparison",
                &self.tuned_table(),
                None,
                3,
            )?;
        }

        let evaluations = self
            .imbalance
            .evaluations
            .iter()
            .chain(self.comparison.iter().map(|r| &r.evaluation))
            .chain(self.tuned.iter().map(|r| &r.evaluation));
        for evaluation in evaluations {
            let path = dir.join(format!("evaluation_{}.svg", slug(&evaluation.model_name)));
            plots::evaluation_figure(&path, evaluation)?;
        }
        Ok(())
    }
}

/// The model stage over the silver-layer records.
pub async fn run(
    records: &[StrokeRecord],
    roles: &ColumnRoles,
    config: &PipelineConfig,
    dir: &Path,
) -> Result<ModelReport> {
    let report = ModelReport::compute(records, roles, config)?;
    report.write_tables(dir).await?;
    if config.plots {
        report.draw(dir)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TuningConfig;
    use crate::records::fixtures::cohort;
    use crate::records::records_to_dataframe;

    fn roles(records: &[StrokeRecord]) -> ColumnRoles {
        ColumnRoles::from_frame(&records_to_dataframe(records).unwrap()).unwrap()
    }

    #[test]
    fn class_weights_are_inverse_ratios() {
        let y = [0, 0, 0, 1];
        assert_eq!(balanced_class_weights(&y).unwrap(), [0.3333, 3.0]);
        assert!(balanced_class_weights(&[0, 0]).is_err());
    }

    #[test]
    fn slugs_are_file_friendly() {
        assert_eq!(slug("LR (weighted)"), "lr_weighted");
        assert_eq!(slug("Gradient Boosting (tuned)"), "gradient_boosting_tuned");
    }

    #[test]
    fn pca_keeps_one_point_per_row() {
        let rows: Vec<Vec<f64>> = (0..20)
            .map(|i| vec![i as f64, (i * i % 7) as f64, (i % 3) as f64])
            .collect();
        let points = pca_projection(&rows).unwrap();
        assert_eq!(points.len(), 20);
        assert!(points.iter().all(|p| p.0.is_finite() && p.1.is_finite()));
    }

    #[test]
    fn imbalance_study_compares_three_fits() {
        let records = cohort(240);
        let (train, valid) = train_valid_split(&records, 0.8, 15);
        let study =
            ImbalanceStudy::run(&train, &valid, &roles(&records), &Smote::default()).unwrap();
        assert_eq!(study.table.rows, vec!["LR", "LR (weighted)", "LR (SMOTE)"]);
        assert_eq!(study.table.columns.len(), HOLDOUT_METRICS.len());
        let positives = study.resampled_labels.iter().filter(|&&l| l == 1).count();
        assert_eq!(positives * 2, study.resampled_labels.len());
        assert_eq!(study.after_smote.len(), study.resampled_labels.len());
    }

    #[tokio::test]
    async fn model_stage_writes_reports() {
        let records = cohort(200);
        let roles = roles(&records);
        let config = PipelineConfig {
            cv_folds: 3,
            plots: false,
            tuning: TuningConfig {
                logistic_c: vec![0.1, 1.0],
                boosting_rounds: vec![10],
                boosting_learning_rates: vec![0.1],
                boosting_depths: vec![2],
                knn_neighbors: vec![3],
                tree_depths: vec![3],
                svm_c: vec![1.0],
                svm_gamma: vec![0.1],
                ..TuningConfig::default()
            },
            ..PipelineConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let report = run(&records, &roles, &config, dir.path()).await.unwrap();

        assert_eq!(report.train_rows + report.valid_rows, 200);
        assert_eq!(report.valid_rows, 40);
        let table = report.comparison_table();
        assert_eq!(table.rows.len(), ModelSpec::zoo(config.seed).len());
        assert_eq!(table.columns, COMPARISON_METRICS.to_vec());
        assert_eq!(report.tuned.len(), 5);
        assert!(report.comparison.iter().all(|r| r.cv.f1.len() == 3));

        for file in [
            "imbalance_comparison.csv",
            "model_comparison.csv",
            "tuned_comparison.csv",
            "metrics.json",
        ] {
            assert!(dir.path().join(file).exists(), "{file} missing");
        }
        let json = std::fs::read_to_string(dir.path().join("metrics.json")).unwrap();
        assert!(json.contains("Logistic Regression"));
    }
}
