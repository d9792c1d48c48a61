//! Stratified k-fold cross validation.

use log::{debug, warn};
use serde::Serialize;

use crate::error::{Result, StrokeError};
use crate::metrics::{f1_score, recall_score};
use crate::models::PipelineSpec;
use crate::preprocess::labels;
use crate::records::{ColumnRoles, StrokeRecord};
use crate::stats::mean;

/// Test indices of each fold, without shuffling.
///
/// Labels sorted by class are dealt round robin over the folds to decide how
/// many rows of each class a fold receives; each class's rows are then handed
/// out to the folds in their original order. Classes are ordered by first
/// appearance.
pub fn stratified_folds(y: &[i32], k: usize) -> Result<Vec<Vec<usize>>> {
    if k < 2 {
        return Err(StrokeError::invalid(format!("need at least 2 folds, got {k}")));
    }
    if k > y.len() {
        return Err(StrokeError::invalid(format!(
            "cannot split {} rows into {k} folds",
            y.len()
        )));
    }

    let mut classes: Vec<i32> = Vec::new();
    for label in y {
        if !classes.contains(label) {
            classes.push(*label);
        }
    }
    let encoded: Vec<usize> = y
        .iter()
        .map(|label| classes.iter().position(|c| c == label).unwrap_or(0))
        .collect();
    let mut counts = vec![0usize; classes.len()];
    for &c in &encoded {
        counts[c] += 1;
    }
    if let Some(&smallest) = counts.iter().min() {
        if smallest < k {
            warn!("least populated class has {smallest} members, fewer than {k} folds");
        }
    }

    let mut order = encoded.clone();
    order.sort_unstable();
    let mut allocation = vec![vec![0usize; classes.len()]; k];
    for (position, &c) in order.iter().enumerate() {
        allocation[position % k][c] += 1;
    }

    let mut folds = vec![Vec::new(); k];
    for class in 0..classes.len() {
        let assignment =
            (0..k).flat_map(|fold| std::iter::repeat(fold).take(allocation[fold][class]));
        let members = encoded
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == class)
            .map(|(i, _)| i);
        for (idx, fold) in members.zip(assignment) {
            folds[fold].push(idx);
        }
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    Ok(folds)
}

/// Per-fold scores of one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CvScores {
    pub f1: Vec<f64>,
    pub recall: Vec<f64>,
}

impl CvScores {
    pub fn mean_f1(&self) -> f64 {
        mean(&self.f1).unwrap_or(0.0)
    }

    pub fn mean_recall(&self) -> f64 {
        mean(&self.recall).unwrap_or(0.0)
    }
}

/// Fit `pipeline` on every training part and score its held-out fold.
pub fn cross_validate(
    pipeline: &PipelineSpec,
    records: &[StrokeRecord],
    roles: &ColumnRoles,
    k: usize,
) -> Result<CvScores> {
    let y = labels(records);
    let folds = stratified_folds(&y, k)?;
    let mut scores = CvScores::default();

    for (fold_idx, test_idx) in folds.iter().enumerate() {
        let mut in_test = vec![false; records.len()];
        for &i in test_idx {
            in_test[i] = true;
        }
        let train: Vec<StrokeRecord> = records
            .iter()
            .zip(&in_test)
            .filter(|(_, &held_out)| !held_out)
            .map(|(r, _)| r.clone())
            .collect();
        let test: Vec<StrokeRecord> = test_idx.iter().map(|&i| records[i].clone()).collect();

        let fitted = pipeline.fit(&train, roles)?;
        let predicted = fitted.predict(&test)?;
        let truth = labels(&test);
        let f1 = f1_score(&truth, &predicted);
        let recall = recall_score(&truth, &predicted);
        debug!(
            "{} fold {}: f1 {f1:.4}, recall {recall:.4}",
            pipeline.model.family(),
            fold_idx + 1
        );
        scores.f1.push(f1);
        scores.recall.push(recall);
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelSpec;
    use crate::records::fixtures::cohort;
    use crate::records::records_to_dataframe;
    use crate::smote::Smote;

    #[test]
    fn folds_follow_class_allocation() {
        let y = [1, 0, 0, 1, 0, 0];
        let folds = stratified_folds(&y, 2).unwrap();
        assert_eq!(folds, vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[test]
    fn folds_cover_every_index_once() {
        let y: Vec<i32> = (0..103).map(|i| i32::from(i % 9 == 0)).collect();
        let folds = stratified_folds(&y, 10).unwrap();
        let mut all: Vec<usize> = folds.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..103).collect::<Vec<_>>());
        for fold in &folds {
            let positives = fold.iter().filter(|&&i| y[i] == 1).count();
            assert!((1..=2).contains(&positives), "{positives} positives in a fold");
            assert!((10..=11).contains(&fold.len()));
        }
    }

    #[test]
    fn rejects_bad_fold_counts() {
        assert!(stratified_folds(&[0, 1, 0], 1).is_err());
        assert!(stratified_folds(&[0, 1, 0], 4).is_err());
    }

    #[test]
    fn cross_validation_scores_each_fold() {
        let records = cohort(200);
        let roles = ColumnRoles::from_frame(&records_to_dataframe(&records).unwrap()).unwrap();
        let pipeline = PipelineSpec::new(ModelSpec::logistic(), Some(Smote::default()));
        let scores = cross_validate(&pipeline, &records, &roles, 5).unwrap();
        assert_eq!(scores.f1.len(), 5);
        assert_eq!(scores.recall.len(), 5);
        assert!(scores.f1.iter().all(|f| (0.0..=1.0).contains(f)));
        assert!((0.0..=1.0).contains(&scores.mean_recall()));
    }
}
