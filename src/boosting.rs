//! Gradient-boosted regression trees for binary log-loss.
//!
//! Each round grows one depth-limited tree on the log-loss residuals; split
//! search runs on binned features and leaf values take a single Newton step.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrokeError};
use crate::models::{check_training_data, Classifier};
use crate::stats::sigmoid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostingParams {
    /// Number of boosting rounds.
    pub rounds: usize,
    /// Shrinkage applied to every tree.
    pub learning_rate: f64,
    /// Depth of each tree; 1 gives decision stumps.
    pub max_depth: usize,
    /// Number of bins used for split search.
    pub bins: usize,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            rounds: 100,
            learning_rate: 0.1,
            max_depth: 3,
            bins: 32,
        }
    }
}

/// A node of a regression tree. Rows with `feature <= threshold` go left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature_index: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    pub fn predict(&self, features: &[f64]) -> f64 {
        let mut node = self;
        loop {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature_index,
                    threshold,
                    left,
                    right,
                } => {
                    let value = features.get(*feature_index).copied().unwrap_or(0.0);
                    node = if value <= *threshold { left } else { right };
                }
            }
        }
    }

    /// Number of splits on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        match self {
            Node::Leaf { .. } => 0,
            Node::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradientBoosting {
    pub params: BoostingParams,
    init_raw: f64,
    trees: Vec<Node>,
    fitted: bool,
}

impl GradientBoosting {
    pub fn new(params: BoostingParams) -> Self {
        Self {
            params,
            init_raw: 0.0,
            trees: Vec::new(),
            fitted: false,
        }
    }

    pub fn trees(&self) -> &[Node] {
        &self.trees
    }

    fn predict_raw(&self, features: &[f64]) -> f64 {
        self.init_raw
            + self
                .trees
                .iter()
                .map(|tree| self.params.learning_rate * tree.predict(features))
                .sum::<f64>()
    }
}

impl Classifier for GradientBoosting {
    fn fit(&mut self, x: &[Vec<f64>], y: &[i32]) -> Result<()> {
        let d = check_training_data(x, y)?;
        if self.params.rounds == 0 {
            return Err(StrokeError::invalid("boosting needs at least one round"));
        }
        if self.params.max_depth == 0 {
            return Err(StrokeError::invalid("boosting trees need a depth of at least 1"));
        }
        let n = x.len();
        let bins = self.params.bins.clamp(2, 256);
        let (mins, maxs) = feature_min_max(x, d);
        let binned = bin_features(x, &mins, &maxs, bins);

        let positive_rate = y.iter().filter(|&&l| l == 1).count() as f64 / n as f64;
        let p0 = positive_rate.clamp(1e-6, 1.0 - 1e-6);
        self.init_raw = (p0 / (1.0 - p0)).ln();
        self.trees.clear();

        let mut raw = vec![self.init_raw; n];
        for _ in 0..self.params.rounds {
            let probs: Vec<f64> = raw.iter().map(|&r| sigmoid(r)).collect();
            let residuals: Vec<f64> = y
                .iter()
                .zip(&probs)
                .map(|(&label, p)| label as f64 - p)
                .collect();
            let hessians: Vec<f64> = probs.iter().map(|p| p * (1.0 - p)).collect();

            let grower = TreeGrower {
                x,
                binned: &binned,
                residuals: &residuals,
                hessians: &hessians,
                mins: &mins,
                maxs: &maxs,
                bins,
                max_depth: self.params.max_depth,
            };
            let tree = grower.grow((0..n).collect(), 0);
            for (i, row) in x.iter().enumerate() {
                raw[i] += self.params.learning_rate * tree.predict(row);
            }
            self.trees.push(tree);
        }
        self.fitted = true;
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        if !self.fitted {
            return Err(StrokeError::invalid("model used before fit"));
        }
        Ok(x.iter().map(|row| sigmoid(self.predict_raw(row))).collect())
    }
}

/// Per-round state for growing one tree on the current residuals.
struct TreeGrower<'a> {
    x: &'a [Vec<f64>],
    binned: &'a [Vec<u8>],
    residuals: &'a [f64],
    hessians: &'a [f64],
    mins: &'a [f64],
    maxs: &'a [f64],
    bins: usize,
    max_depth: usize,
}

impl TreeGrower<'_> {
    fn grow(&self, rows: Vec<usize>, depth: usize) -> Node {
        if depth >= self.max_depth || rows.len() < 2 || self.is_pure(&rows) {
            return self.leaf(&rows);
        }

        let d = self.mins.len();
        let mut best: Option<BestSplit> = None;
        for feature_idx in 0..d {
            if let Some(split) = self.best_split_for_feature(&rows, feature_idx) {
                if best.as_ref().map_or(true, |b| split.score < b.score) {
                    best = Some(split);
                }
            }
        }
        let Some(best) = best else {
            return self.leaf(&rows);
        };

        let f = best.feature_index;
        let threshold = threshold_for_bin(self.mins[f], self.maxs[f], best.split_bin, self.bins);
        let (left, right): (Vec<usize>, Vec<usize>) =
            rows.iter().partition(|&&i| self.x[i][f] <= threshold);
        if left.is_empty() || right.is_empty() {
            return self.leaf(&rows);
        }
        Node::Split {
            feature_index: f,
            threshold,
            left: Box::new(self.grow(left, depth + 1)),
            right: Box::new(self.grow(right, depth + 1)),
        }
    }

    fn is_pure(&self, rows: &[usize]) -> bool {
        let first = self.residuals[rows[0]];
        rows.iter().all(|&i| (self.residuals[i] - first).abs() < 1e-12)
    }

    /// Newton step `sum(residual) / sum(p * (1 - p))` over the leaf's rows.
    fn leaf(&self, rows: &[usize]) -> Node {
        let g: f64 = rows.iter().map(|&i| self.residuals[i]).sum();
        let h: f64 = rows.iter().map(|&i| self.hessians[i]).sum();
        let value = if h < 1e-12 { 0.0 } else { g / h };
        Node::Leaf { value }
    }

    /// Split of `rows` on one feature minimising the residual sum of squares
    /// of the two sides. `None` when every row falls in one bin.
    fn best_split_for_feature(&self, rows: &[usize], feature_idx: usize) -> Option<BestSplit> {
        let bins = self.bins;
        let mut counts = vec![0u32; bins];
        let mut sums = vec![0f64; bins];
        let mut sums_sq = vec![0f64; bins];
        for &i in rows {
            let b = self.binned[i][feature_idx] as usize;
            let r = self.residuals[i];
            counts[b] += 1;
            sums[b] += r;
            sums_sq[b] += r * r;
        }
        let total_count: u32 = counts.iter().sum();
        let total_sum: f64 = sums.iter().sum();
        let total_sum_sq: f64 = sums_sq.iter().sum();

        let mut best: Option<BestSplit> = None;
        let mut left_count = 0u32;
        let mut left_sum = 0f64;
        let mut left_sum_sq = 0f64;
        for split_bin in 0..(bins - 1) {
            left_count += counts[split_bin];
            left_sum += sums[split_bin];
            left_sum_sq += sums_sq[split_bin];
            let right_count = total_count - left_count;
            if left_count == 0 || right_count == 0 {
                continue;
            }
            let right_sum = total_sum - left_sum;
            let right_sum_sq = total_sum_sq - left_sum_sq;
            let left_sse = left_sum_sq - left_sum * left_sum / left_count as f64;
            let right_sse = right_sum_sq - right_sum * right_sum / right_count as f64;
            let score = left_sse + right_sse;
            if best.as_ref().map_or(true, |b| score < b.score) {
                best = Some(BestSplit {
                    score,
                    feature_index: feature_idx,
                    split_bin,
                });
            }
        }
        best
    }
}

fn feature_min_max(x: &[Vec<f64>], d: usize) -> (Vec<f64>, Vec<f64>) {
    let mut mins = vec![f64::INFINITY; d];
    let mut maxs = vec![f64::NEG_INFINITY; d];
    for row in x {
        for (j, &v) in row.iter().take(d).enumerate() {
            if v.is_finite() {
                mins[j] = mins[j].min(v);
                maxs[j] = maxs[j].max(v);
            }
        }
    }
    for j in 0..d {
        if !mins[j].is_finite() || !maxs[j].is_finite() {
            mins[j] = 0.0;
            maxs[j] = 0.0;
        }
        if mins[j] == maxs[j] {
            maxs[j] = mins[j] + 1.0;
        }
    }
    (mins, maxs)
}

fn bin_features(x: &[Vec<f64>], mins: &[f64], maxs: &[f64], bins: usize) -> Vec<Vec<u8>> {
    let top = (bins - 1) as f64;
    x.iter()
        .map(|row| {
            mins.iter()
                .zip(maxs)
                .enumerate()
                .map(|(j, (&min, &max))| {
                    let v = row.get(j).copied().unwrap_or(0.0);
                    let t = ((v - min) / (max - min)).clamp(0.0, 1.0);
                    (t * top).round() as u8
                })
                .collect()
        })
        .collect()
}

#[derive(Debug, Clone)]
struct BestSplit {
    score: f64,
    feature_index: usize,
    split_bin: usize,
}

fn threshold_for_bin(min: f64, max: f64, split_bin: usize, bins: usize) -> f64 {
    // midpoint between the centres of `split_bin` and the next bin
    let t = (split_bin as f64 + 0.5) / (bins - 1) as f64;
    min + t * (max - min)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::metrics::roc_auc;

    fn xor(n: usize) -> (Vec<Vec<f64>>, Vec<i32>) {
        let mut rng = StdRng::seed_from_u64(15);
        let x: Vec<Vec<f64>> = (0..n)
            .map(|_| vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)])
            .collect();
        let y = x.iter().map(|row| i32::from((row[0] > 0.0) != (row[1] > 0.0))).collect();
        (x, y)
    }

    #[test]
    fn node_predict_follows_branches() {
        let tree = Node::Split {
            feature_index: 0,
            threshold: 0.5,
            left: Box::new(Node::Leaf { value: -1.0 }),
            right: Box::new(Node::Split {
                feature_index: 1,
                threshold: 0.0,
                left: Box::new(Node::Leaf { value: 2.0 }),
                right: Box::new(Node::Leaf { value: 3.0 }),
            }),
        };
        assert_eq!(tree.predict(&[0.5, 9.0]), -1.0);
        assert_eq!(tree.predict(&[0.6, -1.0]), 2.0);
        assert_eq!(tree.predict(&[0.6, 1.0]), 3.0);
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn learns_a_threshold_rule() {
        let x: Vec<Vec<f64>> = (0..100).map(|i| vec![(i % 7) as f64, i as f64]).collect();
        let y: Vec<i32> = (0..100).map(|i| i32::from(i >= 70)).collect();
        let mut model = GradientBoosting::new(BoostingParams {
            rounds: 50,
            learning_rate: 0.3,
            ..BoostingParams::default()
        });
        model.fit(&x, &y).unwrap();
        assert_eq!(model.trees().len(), 50);
        match &model.trees()[0] {
            Node::Split { feature_index, .. } => assert_eq!(*feature_index, 1),
            leaf => panic!("first tree is a leaf: {leaf:?}"),
        }
        let scores = model.predict_proba(&x).unwrap();
        assert!(roc_auc(&y, &scores).unwrap() > 0.99);
        assert_eq!(model.predict(&x).unwrap(), y);
    }

    #[test]
    fn trees_respect_max_depth() {
        let (x, y) = xor(200);
        for max_depth in [1, 2, 4] {
            let mut model = GradientBoosting::new(BoostingParams {
                rounds: 10,
                max_depth,
                ..BoostingParams::default()
            });
            model.fit(&x, &y).unwrap();
            assert!(model.trees().iter().all(|tree| tree.depth() <= max_depth));
            assert!(model.trees()[0].depth() >= 1);
        }
    }

    #[test]
    fn deeper_trees_learn_feature_interactions() {
        let (x, y) = xor(400);
        let mut model = GradientBoosting::new(BoostingParams {
            rounds: 200,
            learning_rate: 0.1,
            max_depth: 3,
            bins: 32,
        });
        model.fit(&x, &y).unwrap();
        let scores = model.predict_proba(&x).unwrap();
        assert!(roc_auc(&y, &scores).unwrap() > 0.95);
    }

    #[test]
    fn zero_depth_is_rejected() {
        let (x, y) = xor(20);
        let mut model = GradientBoosting::new(BoostingParams {
            max_depth: 0,
            ..BoostingParams::default()
        });
        assert!(model.fit(&x, &y).is_err());
    }

    #[test]
    fn initial_score_is_the_base_rate() {
        let x = vec![vec![0.0]; 10];
        let y = vec![1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut model = GradientBoosting::new(BoostingParams {
            rounds: 1,
            ..BoostingParams::default()
        });
        model.fit(&x, &y).unwrap();
        let p = model.predict_proba(&[vec![0.0]]).unwrap()[0];
        assert!((p - 0.1).abs() < 1e-9);
    }
}
