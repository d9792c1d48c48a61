//! Synthetic minority oversampling.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, StrokeError};
use crate::stats::squared_distance;

#[derive(Debug, Clone)]
pub struct Smote {
    pub k_neighbors: usize,
    pub seed: u64,
}

impl Default for Smote {
    fn default() -> Self {
        Self {
            k_neighbors: 5,
            seed: 15,
        }
    }
}

impl Smote {
    pub fn new(k_neighbors: usize, seed: u64) -> Self {
        Self { k_neighbors, seed }
    }

    /// Oversample the minority class until both classes have the same count.
    /// Original rows come first, synthetic rows are appended.
    pub fn fit_resample(&self, x: &[Vec<f64>], y: &[i32]) -> Result<(Vec<Vec<f64>>, Vec<i32>)> {
        if x.len() != y.len() {
            return Err(StrokeError::invalid(format!(
                "{} feature rows but {} labels",
                x.len(),
                y.len()
            )));
        }
        let positives = y.iter().filter(|&&label| label == 1).count();
        let negatives = y.len() - positives;
        let (minority_label, n_minority, n_majority) = if positives <= negatives {
            (1, positives, negatives)
        } else {
            (0, negatives, positives)
        };
        if n_minority < 2 {
            return Err(StrokeError::invalid(format!(
                "SMOTE needs at least 2 minority samples, found {n_minority}"
            )));
        }

        let minority: Vec<&Vec<f64>> = x
            .iter()
            .zip(y)
            .filter(|(_, &label)| label == minority_label)
            .map(|(row, _)| row)
            .collect();
        let k = self.k_neighbors.min(n_minority - 1).max(1);
        let neighbors: Vec<Vec<usize>> = (0..minority.len())
            .map(|i| nearest_neighbors(&minority, i, k))
            .collect();

        let n_synthetic = n_majority - n_minority;
        debug!("SMOTE: {n_minority} minority rows, generating {n_synthetic} (k={k})");

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut x_out = x.to_vec();
        let mut y_out = y.to_vec();
        x_out.reserve(n_synthetic);
        y_out.reserve(n_synthetic);
        for _ in 0..n_synthetic {
            let base = rng.gen_range(0..minority.len());
            let neighbor = neighbors[base][rng.gen_range(0..k)];
            let gap: f64 = rng.gen();
            let sample = minority[base]
                .iter()
                .zip(minority[neighbor].iter())
                .map(|(a, b)| a + gap * (b - a))
                .collect();
            x_out.push(sample);
            y_out.push(minority_label);
        }
        Ok((x_out, y_out))
    }
}

/// Indices of the `k` closest points to `points[target]`, itself excluded.
fn nearest_neighbors(points: &[&Vec<f64>], target: usize, k: usize) -> Vec<usize> {
    let mut distances: Vec<(usize, f64)> = points
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != target)
        .map(|(i, p)| (i, squared_distance(points[target], p)))
        .collect();
    distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    distances.into_iter().take(k).map(|(i, _)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> (Vec<Vec<f64>>, Vec<i32>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..20 {
            x.push(vec![i as f64, 0.0]);
            y.push(0);
        }
        for i in 0..4 {
            x.push(vec![100.0 + i as f64, 10.0]);
            y.push(1);
        }
        (x, y)
    }

    #[test]
    fn balances_classes() {
        let (x, y) = toy();
        let (xr, yr) = Smote::default().fit_resample(&x, &y).unwrap();
        assert_eq!(xr.len(), 40);
        assert_eq!(yr.iter().filter(|&&l| l == 1).count(), 20);
        assert_eq!(&xr[..24], &x[..]);
    }

    #[test]
    fn synthetic_points_stay_inside_minority_hull() {
        let (x, y) = toy();
        let (xr, _) = Smote::new(3, 7).fit_resample(&x, &y).unwrap();
        for row in &xr[24..] {
            assert!(row[0] >= 100.0 && row[0] <= 103.0);
            assert_eq!(row[1], 10.0);
        }
    }

    #[test]
    fn same_seed_same_samples() {
        let (x, y) = toy();
        let a = Smote::default().fit_resample(&x, &y).unwrap();
        let b = Smote::default().fit_resample(&x, &y).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn too_few_minority_rows() {
        let x = vec![vec![0.0], vec![1.0], vec![2.0]];
        let y = vec![0, 0, 1];
        assert!(Smote::default().fit_resample(&x, &y).is_err());
    }
}
