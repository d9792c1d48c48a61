//! Exhaustive hyperparameter grids scored by cross-validated F1.

use log::{debug, info};
use serde::Serialize;

use crate::boosting::BoostingParams;
use crate::config::TuningConfig;
use crate::cv::cross_validate;
use crate::error::{Result, StrokeError};
use crate::models::{ModelSpec, PipelineSpec};
use crate::records::{ColumnRoles, StrokeRecord};
use crate::smote::Smote;

/// Candidate settings for each tuned model family. Seeded models take `seed`.
pub fn grids(tuning: &TuningConfig, seed: u64) -> Vec<Vec<ModelSpec>> {
    let logistic = tuning
        .logistic_c
        .iter()
        .map(|&c| ModelSpec::LogisticRegression {
            c,
            class_weight: None,
        })
        .collect();

    let mut boosting = Vec::new();
    for &rounds in &tuning.boosting_rounds {
        for &learning_rate in &tuning.boosting_learning_rates {
            for &max_depth in &tuning.boosting_depths {
                boosting.push(ModelSpec::GradientBoosting(BoostingParams {
                    rounds,
                    learning_rate,
                    max_depth,
                    ..BoostingParams::default()
                }));
            }
        }
    }

    let knn = tuning
        .knn_neighbors
        .iter()
        .map(|&k| ModelSpec::Knn { k })
        .collect();
    let tree = tuning
        .tree_depths
        .iter()
        .map(|&depth| ModelSpec::DecisionTree {
            max_depth: Some(depth),
        })
        .collect();

    let mut svm = Vec::new();
    for &c in &tuning.svm_c {
        for &gamma in &tuning.svm_gamma {
            svm.push(ModelSpec::Svm {
                c,
                gamma: Some(gamma),
                seed,
            });
        }
    }

    vec![logistic, boosting, knn, tree, svm]
}

#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub model: ModelSpec,
    pub mean_f1: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub family: String,
    pub best: ModelSpec,
    pub best_f1: f64,
    pub candidates: Vec<Candidate>,
}

/// Score every candidate in a SMOTE pipeline; the first of equally good
/// candidates wins.
pub fn grid_search(
    candidates: &[ModelSpec],
    smote: &Smote,
    records: &[StrokeRecord],
    roles: &ColumnRoles,
    folds: usize,
) -> Result<SearchResult> {
    let first = candidates
        .first()
        .ok_or_else(|| StrokeError::invalid("empty hyperparameter grid"))?;
    let family = first.family().to_string();
    info!(
        "grid search {family}: {} candidates x {folds} folds",
        candidates.len()
    );

    let mut scored = Vec::with_capacity(candidates.len());
    let mut best: Option<(usize, f64)> = None;
    for (idx, model) in candidates.iter().enumerate() {
        let pipeline = PipelineSpec::new(model.clone(), Some(smote.clone()));
        let mean_f1 = cross_validate(&pipeline, records, roles, folds)?.mean_f1();
        debug!("{family} {model:?}: mean f1 {mean_f1:.4}");
        if best.map_or(true, |(_, score)| mean_f1 > score) {
            best = Some((idx, mean_f1));
        }
        scored.push(Candidate {
            model: model.clone(),
            mean_f1,
        });
    }

    let (best_idx, best_f1) = best.unwrap_or((0, f64::NAN));
    info!("{family}: best {:?} (f1 {best_f1:.4})", candidates[best_idx]);
    Ok(SearchResult {
        family,
        best: candidates[best_idx].clone(),
        best_f1,
        candidates: scored,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::fixtures::cohort;
    use crate::records::records_to_dataframe;

    #[test]
    fn default_grid_sizes() {
        let grids = grids(&TuningConfig::default(), 15);
        let sizes: Vec<usize> = grids.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20, 96, 5, 8, 25]);
        assert_eq!(grids[1][0].family(), "Gradient Boosting");
        assert_eq!(grids[4][0].family(), "SVM");

        let depths: Vec<usize> = grids[1]
            .iter()
            .filter_map(|spec| match spec {
                ModelSpec::GradientBoosting(params) => Some(params.max_depth),
                _ => None,
            })
            .take(8)
            .collect();
        assert_eq!(depths, (2..=9).collect::<Vec<_>>());
        assert!(grids[4].iter().all(|spec| matches!(spec, ModelSpec::Svm { seed: 15, .. })));
    }

    #[test]
    fn search_picks_a_scored_candidate() {
        let records = cohort(160);
        let roles = ColumnRoles::from_frame(&records_to_dataframe(&records).unwrap()).unwrap();
        let candidates = vec![ModelSpec::Knn { k: 3 }, ModelSpec::Knn { k: 7 }];
        let result = grid_search(&candidates, &Smote::default(), &records, &roles, 3).unwrap();
        assert_eq!(result.family, "KNN");
        assert_eq!(result.candidates.len(), 2);
        let top = result
            .candidates
            .iter()
            .map(|c| c.mean_f1)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(result.best_f1, top);
        assert!(candidates.contains(&result.best));
    }

    #[test]
    fn empty_grid_is_an_error() {
        let records = cohort(20);
        let roles = ColumnRoles::from_frame(&records_to_dataframe(&records).unwrap()).unwrap();
        assert!(grid_search(&[], &Smote::default(), &records, &roles, 2).is_err());
    }
}
