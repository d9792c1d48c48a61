//! Evaluation metrics for the binary stroke classifiers.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::stats::round_to;

/// Precision window used to recover the decision threshold behind a PPV.
const THRESHOLD_MATCH_TOLERANCE: f64 = 1e-5;

/// Binary confusion matrix, positive class is `1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tn: u32,
    pub fp: u32,
    pub fn_: u32,
    pub tp: u32,
}

impl ConfusionMatrix {
    pub fn from_predictions(truth: &[i32], predicted: &[i32]) -> Self {
        let mut cm = ConfusionMatrix::default();
        for (&t, &p) in truth.iter().zip(predicted) {
            match (t == 1, p == 1) {
                (false, false) => cm.tn += 1,
                (false, true) => cm.fp += 1,
                (true, false) => cm.fn_ += 1,
                (true, true) => cm.tp += 1,
            }
        }
        cm
    }

    pub fn total(&self) -> u32 {
        self.tn + self.fp + self.fn_ + self.tp
    }

    /// Counts as `[[tn, fp], [fn, tp]]`.
    pub fn as_rows(&self) -> [[u32; 2]; 2] {
        [[self.tn, self.fp], [self.fn_, self.tp]]
    }

    /// Each cell as a fraction of its true-outcome row.
    pub fn row_fractions(&self) -> [[f64; 2]; 2] {
        let rows = self.as_rows();
        let mut out = [[0.0; 2]; 2];
        for (r, row) in rows.iter().enumerate() {
            let total = (row[0] + row[1]) as f64;
            for c in 0..2 {
                out[r][c] = if total == 0.0 { 0.0 } else { row[c] as f64 / total };
            }
        }
        out
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn sensitivity(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn specificity(&self) -> f64 {
        ratio(self.tn, self.tn + self.fp)
    }

    pub fn ppv(&self) -> Option<f64> {
        checked_ratio(self.tp, self.tp + self.fp)
    }

    pub fn npv(&self) -> f64 {
        ratio(self.tn, self.tn + self.fn_)
    }

    /// Harmonic mean of precision and recall; 0 when both are undefined.
    pub fn f1(&self) -> f64 {
        let precision = self.ppv().unwrap_or(0.0);
        let recall = self.sensitivity();
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }

    /// `2TP / (2TP + FP + FN)` straight from the counts.
    pub fn f1_from_counts(&self) -> f64 {
        ratio(2 * self.tp, 2 * self.tp + self.fp + self.fn_)
    }
}

fn checked_ratio(num: u32, den: u32) -> Option<f64> {
    (den != 0).then(|| num as f64 / den as f64)
}

fn ratio(num: u32, den: u32) -> f64 {
    checked_ratio(num, den).unwrap_or(0.0)
}

/// Cumulative false/true positive counts at each distinct score, highest first.
fn binary_clf_curve(truth: &[i32], scores: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut fps = Vec::new();
    let mut tps = Vec::new();
    let mut thresholds = Vec::new();
    let (mut fp, mut tp) = (0.0, 0.0);
    for (pos, &idx) in order.iter().enumerate() {
        if truth[idx] == 1 {
            tp += 1.0;
        } else {
            fp += 1.0;
        }
        let last_of_run = order
            .get(pos + 1)
            .map_or(true, |&next| scores[next] != scores[idx]);
        if last_of_run {
            fps.push(fp);
            tps.push(tp);
            thresholds.push(scores[idx]);
        }
    }
    (fps, tps, thresholds)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// Decreasing; the first entry is `+inf` so the curve starts at (0, 0).
    pub thresholds: Vec<f64>,
}

/// Receiver operating characteristic. `None` unless both classes are present.
pub fn roc_curve(truth: &[i32], scores: &[f64]) -> Option<RocCurve> {
    let (fps, tps, thresholds) = binary_clf_curve(truth, scores);
    let total_fp = *fps.last()?;
    let total_tp = *tps.last()?;
    if total_fp == 0.0 || total_tp == 0.0 {
        return None;
    }
    let mut curve = RocCurve {
        fpr: vec![0.0],
        tpr: vec![0.0],
        thresholds: vec![f64::INFINITY],
    };
    for i in 0..fps.len() {
        curve.fpr.push(fps[i] / total_fp);
        curve.tpr.push(tps[i] / total_tp);
        curve.thresholds.push(thresholds[i]);
    }
    Some(curve)
}

pub fn roc_auc(truth: &[i32], scores: &[f64]) -> Option<f64> {
    let curve = roc_curve(truth, scores)?;
    Some(auc(&curve.fpr, &curve.tpr))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionRecallCurve {
    /// One longer than `thresholds`; ends at 1.0.
    pub precision: Vec<f64>,
    /// One longer than `thresholds`; ends at 0.0.
    pub recall: Vec<f64>,
    /// Increasing.
    pub thresholds: Vec<f64>,
}

/// Precision/recall pairs at every distinct score. `None` without positives.
pub fn precision_recall_curve(truth: &[i32], scores: &[f64]) -> Option<PrecisionRecallCurve> {
    let (fps, tps, thresholds) = binary_clf_curve(truth, scores);
    let total_tp = *tps.last()?;
    if total_tp == 0.0 {
        return None;
    }
    let mut precision: Vec<f64> = tps
        .iter()
        .zip(&fps)
        .map(|(tp, fp)| if tp + fp == 0.0 { 0.0 } else { tp / (tp + fp) })
        .collect();
    let mut recall: Vec<f64> = tps.iter().map(|tp| tp / total_tp).collect();
    let mut thresholds = thresholds;

    precision.reverse();
    recall.reverse();
    thresholds.reverse();
    precision.push(1.0);
    recall.push(0.0);

    Some(PrecisionRecallCurve {
        precision,
        recall,
        thresholds,
    })
}

/// Step-wise area under the precision-recall curve: `sum((R_n - R_n-1) * P_n)`.
pub fn average_precision(truth: &[i32], scores: &[f64]) -> Option<f64> {
    let curve = precision_recall_curve(truth, scores)?;
    let mut ap = 0.0;
    for i in 0..curve.thresholds.len() {
        ap += (curve.recall[i] - curve.recall[i + 1]) * curve.precision[i];
    }
    Some(ap)
}

/// Trapezoidal area under `y(x)`. `x` may run in either direction.
pub fn auc(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[0] + ys[1]) / 2.0)
        .sum::<f64>()
        .abs()
}

/// Share of positive labels, the no-skill level of a precision-recall plot.
pub fn positive_rate(truth: &[i32]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    truth.iter().filter(|&&t| t == 1).count() as f64 / truth.len() as f64
}

pub fn recall_score(truth: &[i32], predicted: &[i32]) -> f64 {
    ConfusionMatrix::from_predictions(truth, predicted).sensitivity()
}

pub fn f1_score(truth: &[i32], predicted: &[i32]) -> f64 {
    ConfusionMatrix::from_predictions(truth, predicted).f1()
}

/// Every curve and score needed to report and plot one fitted model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub model_name: String,
    pub confusion: ConfusionMatrix,
    pub accuracy: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub ppv: f64,
    pub npv: f64,
    pub auroc: f64,
    pub average_precision: f64,
    pub auprc: f64,
    pub f1: f64,
    pub f1_manual: f64,
    pub possible_thresholds: Vec<f64>,
    pub baseline: f64,
    pub roc: Option<RocCurve>,
    pub prc: Option<PrecisionRecallCurve>,
}

pub fn evaluate(model_name: &str, truth: &[i32], predicted: &[i32], scores: &[f64]) -> Evaluation {
    let confusion = ConfusionMatrix::from_predictions(truth, predicted);
    let ppv = confusion.ppv().unwrap_or_else(|| {
        warn!("{model_name}: no positive predictions, PPV undefined; reporting 0");
        0.0
    });

    let roc = roc_curve(truth, scores);
    let prc = precision_recall_curve(truth, scores);
    let auroc = roc_auc(truth, scores).unwrap_or(f64::NAN);
    let auprc = prc.as_ref().map_or(f64::NAN, |c| auc(&c.recall, &c.precision));
    let average_precision = average_precision(truth, scores).unwrap_or(f64::NAN);

    let possible_thresholds = prc
        .as_ref()
        .map(|c| {
            c.thresholds
                .iter()
                .zip(&c.precision)
                .filter(|(_, p)| (**p - ppv).abs() < THRESHOLD_MATCH_TOLERANCE)
                .map(|(t, _)| *t)
                .collect()
        })
        .unwrap_or_default();

    Evaluation {
        model_name: model_name.to_string(),
        confusion,
        accuracy: round_to(confusion.accuracy(), 4),
        sensitivity: round_to(confusion.sensitivity(), 4),
        specificity: round_to(confusion.specificity(), 4),
        ppv: round_to(ppv, 4),
        npv: round_to(confusion.npv(), 4),
        auroc: round_to(auroc, 4),
        average_precision: round_to(average_precision, 4),
        auprc: round_to(auprc, 4),
        f1: round_to(confusion.f1(), 4),
        f1_manual: round_to(confusion.f1_from_counts(), 4),
        possible_thresholds,
        baseline: positive_rate(truth),
        roc,
        prc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRUTH: [i32; 4] = [0, 0, 1, 1];
    const SCORES: [f64; 4] = [0.1, 0.4, 0.35, 0.8];

    #[test]
    fn confusion_counts_and_rates() {
        let truth = [0, 0, 0, 0, 1, 1, 1, 0];
        let pred = [0, 1, 0, 0, 1, 0, 1, 0];
        let cm = ConfusionMatrix::from_predictions(&truth, &pred);
        assert_eq!(cm.as_rows(), [[4, 1], [1, 2]]);
        assert_eq!(cm.accuracy(), 0.75);
        assert!((cm.sensitivity() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(cm.specificity(), 0.8);
        assert!((cm.ppv().unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(cm.npv(), 0.8);
        assert!((cm.f1() - cm.f1_from_counts()).abs() < 1e-12);
        assert_eq!(cm.row_fractions()[0], [0.8, 0.2]);
    }

    #[test]
    fn undefined_ppv_is_none() {
        let cm = ConfusionMatrix::from_predictions(&[0, 1], &[0, 0]);
        assert_eq!(cm.ppv(), None);
        assert_eq!(cm.f1(), 0.0);
    }

    #[test]
    fn roc_matches_reference_values() {
        let curve = roc_curve(&TRUTH, &SCORES).unwrap();
        assert_eq!(curve.fpr, vec![0.0, 0.0, 0.5, 0.5, 1.0]);
        assert_eq!(curve.tpr, vec![0.0, 0.5, 0.5, 1.0, 1.0]);
        assert_eq!(curve.thresholds[1], 0.8);
        assert_eq!(roc_auc(&TRUTH, &SCORES), Some(0.75));
        assert_eq!(roc_auc(&[1, 1], &[0.2, 0.3]), None);
    }

    #[test]
    fn perfect_ranking_has_unit_auc() {
        let truth = [0, 0, 0, 1, 1];
        let scores = [0.1, 0.2, 0.3, 0.8, 0.9];
        assert!((roc_auc(&truth, &scores).unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(average_precision(&truth, &scores), Some(1.0));
    }

    #[test]
    fn precision_recall_curve_shape() {
        let curve = precision_recall_curve(&TRUTH, &SCORES).unwrap();
        assert_eq!(curve.thresholds, vec![0.1, 0.35, 0.4, 0.8]);
        assert_eq!(curve.precision.len(), curve.thresholds.len() + 1);
        assert_eq!(*curve.precision.last().unwrap(), 1.0);
        assert_eq!(*curve.recall.last().unwrap(), 0.0);
        assert_eq!(curve.recall[0], 1.0);
        assert!((curve.precision[1] - 2.0 / 3.0).abs() < 1e-12);
        let ap = average_precision(&TRUTH, &SCORES).unwrap();
        assert!((ap - 0.8333333333).abs() < 1e-9);
    }

    #[test]
    fn evaluation_recovers_threshold() {
        let predicted: Vec<i32> = SCORES.iter().map(|&s| i32::from(s >= 0.5)).collect();
        let eval = evaluate("toy", &TRUTH, &predicted, &SCORES);
        assert_eq!(eval.ppv, 1.0);
        assert_eq!(eval.sensitivity, 0.5);
        assert_eq!(eval.possible_thresholds, vec![0.8]);
        assert_eq!(eval.baseline, 0.5);
        assert_eq!(eval.auroc, 0.75);
    }
}
