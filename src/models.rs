//! Binary classifiers and the preprocessing pipeline that feeds them.

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_classifier::{
    RandomForestClassifier, RandomForestClassifierParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::metrics::distance::euclidian::Euclidian;
use smartcore::neighbors::knn_classifier::{KNNClassifier, KNNClassifierParameters};
use smartcore::svm::svc::{SVCParameters, SVC};
use smartcore::svm::Kernels;
use smartcore::tree::decision_tree_classifier::{
    DecisionTreeClassifier, DecisionTreeClassifierParameters,
};

use crate::boosting::{BoostingParams, GradientBoosting};
use crate::error::{Result, StrokeError};
use crate::preprocess::{labels, FeatureMatrix, Preprocessor};
use crate::records::{ColumnRoles, StrokeRecord};
use crate::smote::Smote;
use crate::stats::{sigmoid, solve_linear, std_dev};

pub trait Classifier {
    fn fit(&mut self, x: &[Vec<f64>], y: &[i32]) -> Result<()>;

    /// Score for the positive class, in `[0, 1]`.
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>>;

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i32>> {
        Ok(self
            .predict_proba(x)?
            .into_iter()
            .map(|p| i32::from(p > 0.5))
            .collect())
    }
}

/// Shape checks shared by every `fit`: rows match labels, widths agree and
/// both classes are present.
pub(crate) fn check_training_data(x: &[Vec<f64>], y: &[i32]) -> Result<usize> {
    if x.is_empty() {
        return Err(StrokeError::invalid("cannot fit a model on zero rows"));
    }
    if x.len() != y.len() {
        return Err(StrokeError::invalid(format!(
            "{} feature rows but {} labels",
            x.len(),
            y.len()
        )));
    }
    let width = x[0].len();
    if x.iter().any(|row| row.len() != width) {
        return Err(StrokeError::invalid("feature rows have different widths"));
    }
    let positives = y.iter().filter(|&&label| label == 1).count();
    if positives == 0 || positives == y.len() {
        return Err(StrokeError::invalid("training labels contain a single class"));
    }
    Ok(width)
}

fn not_fitted() -> StrokeError {
    StrokeError::invalid("model used before fit")
}

fn to_dense(x: &[Vec<f64>]) -> DenseMatrix<f64> {
    let ncols = x.first().map_or(0, Vec::len);
    let values: Vec<f64> = x.iter().flatten().copied().collect();
    DenseMatrix::new(x.len(), ncols, values, false)
}

/// L2-penalised logistic regression fitted by damped Newton steps.
///
/// Minimises `0.5 * |w|^2 + C * sum_i s_i * logloss_i`, where `s_i` is the
/// weight of the sample's class. The intercept is not penalised.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    pub c: f64,
    pub class_weight: Option<[f64; 2]>,
    pub max_iter: usize,
    pub tol: f64,
    coef: Vec<f64>,
    intercept: f64,
    fitted: bool,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new(1.0, None)
    }
}

impl LogisticRegression {
    pub fn new(c: f64, class_weight: Option<[f64; 2]>) -> Self {
        Self {
            c,
            class_weight,
            max_iter: 100,
            tol: 1e-8,
            coef: Vec::new(),
            intercept: 0.0,
            fitted: false,
        }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coef
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    fn sample_weight(&self, label: i32) -> f64 {
        match self.class_weight {
            Some(weights) => weights[usize::from(label == 1)],
            None => 1.0,
        }
    }

    fn linear(params: &[f64], row: &[f64]) -> f64 {
        let p = row.len();
        params[p] + row.iter().zip(params).map(|(x, w)| x * w).sum::<f64>()
    }

    fn objective(&self, params: &[f64], x: &[Vec<f64>], y: &[i32]) -> f64 {
        let p = params.len() - 1;
        let penalty = 0.5 * params[..p].iter().map(|w| w * w).sum::<f64>();
        let loss: f64 = x
            .iter()
            .zip(y)
            .map(|(row, &label)| {
                let z = Self::linear(params, row);
                let softplus = z.max(0.0) + (-z.abs()).exp().ln_1p();
                self.sample_weight(label) * (softplus - label as f64 * z)
            })
            .sum();
        penalty + self.c * loss
    }
}

impl Classifier for LogisticRegression {
    fn fit(&mut self, x: &[Vec<f64>], y: &[i32]) -> Result<()> {
        let p = check_training_data(x, y)?;
        if self.c <= 0.0 {
            return Err(StrokeError::invalid("C must be positive"));
        }
        // weights followed by the intercept
        let dim = p + 1;
        let mut params = vec![0.0; dim];
        let mut current = self.objective(&params, x, y);

        for iter in 0..self.max_iter {
            let mut grad = vec![0.0; dim];
            let mut hess = vec![vec![0.0; dim]; dim];
            for j in 0..p {
                grad[j] = params[j];
                hess[j][j] = 1.0;
            }
            for (row, &label) in x.iter().zip(y) {
                let s = self.c * self.sample_weight(label);
                let prob = sigmoid(Self::linear(&params, row));
                let g = s * (prob - label as f64);
                let h = s * prob * (1.0 - prob);
                for a in 0..dim {
                    let xa = if a < p { row[a] } else { 1.0 };
                    grad[a] += g * xa;
                    if h == 0.0 || xa == 0.0 {
                        continue;
                    }
                    for b in a..dim {
                        let xb = if b < p { row[b] } else { 1.0 };
                        hess[a][b] += h * xa * xb;
                    }
                }
            }
            for a in 0..dim {
                for b in 0..a {
                    hess[a][b] = hess[b][a];
                }
            }
            hess[p][p] += 1e-10;

            let step = solve_linear(hess, grad.clone())
                .ok_or_else(|| StrokeError::invalid("singular Hessian in logistic regression"))?;

            let mut t = 1.0;
            let mut accepted = None;
            for _ in 0..30 {
                let candidate: Vec<f64> =
                    params.iter().zip(&step).map(|(w, d)| w - t * d).collect();
                let value = self.objective(&candidate, x, y);
                if value <= current {
                    accepted = Some((candidate, value));
                    break;
                }
                t *= 0.5;
            }
            let Some((candidate, value)) = accepted else {
                trace!("logistic regression: line search stalled at iteration {iter}");
                break;
            };

            let max_change = step.iter().map(|d| (t * d).abs()).fold(0.0, f64::max);
            params = candidate;
            let improvement = current - value;
            current = value;
            if max_change < self.tol || improvement.abs() < self.tol * (1.0 + current.abs()) {
                debug!("logistic regression converged after {} iterations", iter + 1);
                break;
            }
        }

        self.intercept = params[p];
        params.truncate(p);
        self.coef = params;
        self.fitted = true;
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        if !self.fitted {
            return Err(not_fitted());
        }
        Ok(x.iter()
            .map(|row| {
                let dot: f64 = row.iter().zip(&self.coef).map(|(a, w)| a * w).sum();
                sigmoid(self.intercept + dot)
            })
            .collect())
    }
}

/// smartcore decision tree; scores are its hard 0/1 predictions.
pub struct DecisionTree {
    pub max_depth: Option<u16>,
    model: Option<DecisionTreeClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>>>,
}

impl DecisionTree {
    pub fn new(max_depth: Option<u16>) -> Self {
        Self {
            max_depth,
            model: None,
        }
    }
}

impl Classifier for DecisionTree {
    fn fit(&mut self, x: &[Vec<f64>], y: &[i32]) -> Result<()> {
        check_training_data(x, y)?;
        let mut params = DecisionTreeClassifierParameters::default();
        if let Some(depth) = self.max_depth {
            params = params.with_max_depth(depth);
        }
        self.model = Some(DecisionTreeClassifier::fit(&to_dense(x), &y.to_vec(), params)?);
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(self.predict(x)?.into_iter().map(f64::from).collect())
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i32>> {
        let model = self.model.as_ref().ok_or_else(not_fitted)?;
        Ok(model.predict(&to_dense(x))?)
    }
}

/// smartcore random forest; scores are its hard 0/1 predictions.
pub struct RandomForest {
    pub n_trees: u16,
    pub max_depth: Option<u16>,
    pub seed: u64,
    model: Option<RandomForestClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>>>,
}

impl RandomForest {
    pub fn new(n_trees: u16, max_depth: Option<u16>, seed: u64) -> Self {
        Self {
            n_trees,
            max_depth,
            seed,
            model: None,
        }
    }
}

impl Classifier for RandomForest {
    fn fit(&mut self, x: &[Vec<f64>], y: &[i32]) -> Result<()> {
        check_training_data(x, y)?;
        let mut params = RandomForestClassifierParameters::default()
            .with_n_trees(self.n_trees)
            .with_seed(self.seed);
        if let Some(depth) = self.max_depth {
            params = params.with_max_depth(depth);
        }
        self.model = Some(RandomForestClassifier::fit(&to_dense(x), &y.to_vec(), params)?);
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(self.predict(x)?.into_iter().map(f64::from).collect())
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i32>> {
        let model = self.model.as_ref().ok_or_else(not_fitted)?;
        Ok(model.predict(&to_dense(x))?)
    }
}

/// `1 / (n_features * var(X))`, the RBF width used when none is given.
pub fn scale_gamma(x: &[Vec<f64>]) -> f64 {
    let n_features = x.first().map_or(0, Vec::len);
    let values: Vec<f64> = x.iter().flatten().copied().collect();
    let variance = std_dev(&values, 0).map_or(0.0, |s| s * s);
    if n_features == 0 || variance <= 0.0 {
        1.0
    } else {
        1.0 / (n_features as f64 * variance)
    }
}

/// smartcore support vector classifier with an RBF kernel; scores are its
/// hard 0/1 predictions.
///
/// A fitted `SVC` borrows its parameters and training matrix, so the wrapper
/// keeps the training data and replays the seeded fit when predicting.
pub struct Svm {
    pub c: f64,
    pub gamma: Option<f64>,
    pub seed: u64,
    train: Option<(DenseMatrix<f64>, Vec<i32>, f64)>,
}

impl Svm {
    pub fn new(c: f64, gamma: Option<f64>, seed: u64) -> Self {
        Self {
            c,
            gamma,
            seed,
            train: None,
        }
    }
}

impl Classifier for Svm {
    fn fit(&mut self, x: &[Vec<f64>], y: &[i32]) -> Result<()> {
        check_training_data(x, y)?;
        if self.c <= 0.0 {
            return Err(StrokeError::invalid(format!("SVM C must be positive, got {}", self.c)));
        }
        let gamma = self.gamma.unwrap_or_else(|| scale_gamma(x));
        let signed = y.iter().map(|&label| if label == 1 { 1 } else { -1 }).collect();
        debug!("svm: C={} gamma={gamma}", self.c);
        self.train = Some((to_dense(x), signed, gamma));
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(self.predict(x)?.into_iter().map(f64::from).collect())
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i32>> {
        let (train_x, train_y, gamma) = self.train.as_ref().ok_or_else(not_fitted)?;
        let rows = to_dense(x);
        let params: SVCParameters<f64, i32, DenseMatrix<f64>, Vec<i32>> =
            SVCParameters::default()
                .with_c(self.c)
                .with_kernel(Kernels::rbf().with_gamma(*gamma))
                .with_seed(Some(self.seed));
        let svc = SVC::fit(train_x, train_y, &params)?;
        Ok(svc
            .predict(&rows)?
            .into_iter()
            .map(|label| i32::from(label > 0.0))
            .collect())
    }
}

/// smartcore k-nearest neighbours; scores are its hard 0/1 predictions.
pub struct Knn {
    pub k: usize,
    model: Option<KNNClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>, Euclidian<f64>>>,
}

impl Knn {
    pub fn new(k: usize) -> Self {
        Self { k, model: None }
    }
}

impl Classifier for Knn {
    fn fit(&mut self, x: &[Vec<f64>], y: &[i32]) -> Result<()> {
        check_training_data(x, y)?;
        let params = KNNClassifierParameters::default().with_k(self.k);
        self.model = Some(KNNClassifier::fit(&to_dense(x), &y.to_vec(), params)?);
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(self.predict(x)?.into_iter().map(f64::from).collect())
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i32>> {
        let model = self.model.as_ref().ok_or_else(not_fitted)?;
        Ok(model.predict(&to_dense(x))?)
    }
}

/// A model family with its hyperparameters, buildable any number of times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelSpec {
    LogisticRegression {
        c: f64,
        class_weight: Option<[f64; 2]>,
    },
    GradientBoosting(BoostingParams),
    DecisionTree {
        max_depth: Option<u16>,
    },
    RandomForest {
        n_trees: u16,
        max_depth: Option<u16>,
        seed: u64,
    },
    Svm {
        c: f64,
        gamma: Option<f64>,
        seed: u64,
    },
    Knn {
        k: usize,
    },
}

impl ModelSpec {
    pub fn logistic() -> Self {
        ModelSpec::LogisticRegression {
            c: 1.0,
            class_weight: None,
        }
    }

    /// The model families compared against each other, at default settings.
    pub fn zoo(seed: u64) -> Vec<ModelSpec> {
        vec![
            ModelSpec::logistic(),
            ModelSpec::DecisionTree { max_depth: None },
            ModelSpec::RandomForest {
                n_trees: 100,
                max_depth: None,
                seed,
            },
            ModelSpec::Svm {
                c: 1.0,
                gamma: None,
                seed,
            },
            ModelSpec::GradientBoosting(BoostingParams::default()),
            ModelSpec::Knn { k: 5 },
        ]
    }

    pub fn family(&self) -> &'static str {
        match self {
            ModelSpec::LogisticRegression { .. } => "Logistic Regression",
            ModelSpec::GradientBoosting(_) => "Gradient Boosting",
            ModelSpec::DecisionTree { .. } => "Decision Tree",
            ModelSpec::RandomForest { .. } => "Random Forest",
            ModelSpec::Svm { .. } => "SVM",
            ModelSpec::Knn { .. } => "KNN",
        }
    }

    pub fn build(&self) -> Box<dyn Classifier> {
        match self {
            ModelSpec::LogisticRegression { c, class_weight } => {
                Box::new(LogisticRegression::new(*c, *class_weight))
            }
            ModelSpec::GradientBoosting(params) => Box::new(GradientBoosting::new(params.clone())),
            ModelSpec::DecisionTree { max_depth } => Box::new(DecisionTree::new(*max_depth)),
            ModelSpec::RandomForest {
                n_trees,
                max_depth,
                seed,
            } => Box::new(RandomForest::new(*n_trees, *max_depth, *seed)),
            ModelSpec::Svm { c, gamma, seed } => Box::new(Svm::new(*c, *gamma, *seed)),
            ModelSpec::Knn { k } => Box::new(Knn::new(*k)),
        }
    }
}

/// Preprocessing, optional oversampling and a model, fitted together on raw
/// records so nothing is learned from validation rows.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub model: ModelSpec,
    pub smote: Option<Smote>,
}

impl PipelineSpec {
    pub fn new(model: ModelSpec, smote: Option<Smote>) -> Self {
        Self { model, smote }
    }

    pub fn fit(&self, records: &[StrokeRecord], roles: &ColumnRoles) -> Result<FittedPipeline> {
        let (preprocessor, matrix) = Preprocessor::fit_transform(records, roles)?;
        let y = labels(records);
        let (x, y) = match &self.smote {
            Some(smote) => smote.fit_resample(&matrix.rows, &y)?,
            None => (matrix.rows, y),
        };
        let mut model = self.model.build();
        model.fit(&x, &y)?;
        Ok(FittedPipeline {
            preprocessor,
            model,
        })
    }
}

pub struct FittedPipeline {
    preprocessor: Preprocessor,
    model: Box<dyn Classifier>,
}

impl FittedPipeline {
    pub fn features(&self, records: &[StrokeRecord]) -> FeatureMatrix {
        self.preprocessor.transform(records)
    }

    pub fn predict(&self, records: &[StrokeRecord]) -> Result<Vec<i32>> {
        self.model.predict(&self.features(records).rows)
    }

    pub fn predict_proba(&self, records: &[StrokeRecord]) -> Result<Vec<f64>> {
        self.model.predict_proba(&self.features(records).rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ConfusionMatrix;
    use crate::preprocess::train_valid_split;
    use crate::records::fixtures::cohort;
    use crate::records::records_to_dataframe;

    fn separable() -> (Vec<Vec<f64>>, Vec<i32>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..40 {
            let positive = i >= 20;
            let v = if positive { 3.0 + (i - 20) as f64 / 10.0 } else { i as f64 / 10.0 };
            x.push(vec![v, (i % 3) as f64]);
            y.push(i32::from(positive));
        }
        (x, y)
    }

    #[test]
    fn logistic_regression_separates_toy_data() {
        let (x, y) = separable();
        let mut model = LogisticRegression::new(10.0, None);
        model.fit(&x, &y).unwrap();
        assert_eq!(model.predict(&x).unwrap(), y);
        assert!(model.coefficients()[0] > 0.0);
        let proba = model.predict_proba(&[vec![0.0, 0.0], vec![4.0, 0.0]]).unwrap();
        assert!(proba[0] < 0.1 && proba[1] > 0.9);
    }

    #[test]
    fn stronger_penalty_shrinks_coefficients() {
        let (x, y) = separable();
        let mut loose = LogisticRegression::new(10.0, None);
        let mut tight = LogisticRegression::new(0.01, None);
        loose.fit(&x, &y).unwrap();
        tight.fit(&x, &y).unwrap();
        assert!(tight.coefficients()[0].abs() < loose.coefficients()[0].abs());
    }

    #[test]
    fn class_weights_raise_minority_recall() {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..200 {
            let v = (i % 50) as f64 / 10.0;
            x.push(vec![v]);
            y.push(i32::from(i % 10 == 0 && v > 2.0));
        }
        let mut plain = LogisticRegression::new(1.0, None);
        let mut weighted = LogisticRegression::new(1.0, Some([0.1, 10.0]));
        plain.fit(&x, &y).unwrap();
        weighted.fit(&x, &y).unwrap();
        let recall = |m: &LogisticRegression| {
            ConfusionMatrix::from_predictions(&y, &m.predict(&x).unwrap()).sensitivity()
        };
        assert!(recall(&weighted) > recall(&plain));
    }

    #[test]
    fn single_class_is_rejected() {
        let mut model = LogisticRegression::default();
        let err = model.fit(&[vec![1.0], vec![2.0]], &[0, 0]).unwrap_err();
        assert!(matches!(err, StrokeError::InvalidData(_)));
        assert!(model.predict_proba(&[vec![1.0]]).is_err());
    }

    #[test]
    fn smartcore_models_fit_toy_data() {
        let (x, y) = separable();
        for spec in [
            ModelSpec::DecisionTree { max_depth: Some(3) },
            ModelSpec::Knn { k: 3 },
            ModelSpec::RandomForest {
                n_trees: 10,
                max_depth: Some(4),
                seed: 15,
            },
            ModelSpec::Svm {
                c: 10.0,
                gamma: Some(0.5),
                seed: 15,
            },
        ] {
            let mut model = spec.build();
            model.fit(&x, &y).unwrap();
            let predicted = model.predict(&x).unwrap();
            let accuracy = ConfusionMatrix::from_predictions(&y, &predicted).accuracy();
            assert!(accuracy > 0.9, "{} accuracy {accuracy}", spec.family());
            let scores = model.predict_proba(&x).unwrap();
            assert!(scores.iter().all(|&s| s == 0.0 || s == 1.0));
        }
    }

    #[test]
    fn seeded_forest_is_reproducible() {
        let records = cohort(200);
        let roles = ColumnRoles::from_frame(&records_to_dataframe(&records).unwrap()).unwrap();
        let (train, valid) = train_valid_split(&records, 0.8, 15);
        let spec = ModelSpec::RandomForest {
            n_trees: 20,
            max_depth: None,
            seed: 15,
        };
        let pipeline = PipelineSpec::new(spec, None);
        let first = pipeline.fit(&train, &roles).unwrap().predict(&valid).unwrap();
        let second = pipeline.fit(&train, &roles).unwrap().predict(&valid).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn svm_uses_scaled_gamma_by_default() {
        let x = vec![vec![0.0, 2.0], vec![2.0, 0.0]];
        // var of {0, 2, 2, 0} is 1, two features
        assert!((scale_gamma(&x) - 0.5).abs() < 1e-12);
        assert_eq!(scale_gamma(&[vec![1.0], vec![1.0]]), 1.0);

        let (x, y) = separable();
        let mut model = Svm::new(1.0, None, 15);
        model.fit(&x, &y).unwrap();
        let predicted = model.predict(&x).unwrap();
        let accuracy = ConfusionMatrix::from_predictions(&y, &predicted).accuracy();
        assert!(accuracy > 0.9, "svm accuracy {accuracy}");
        assert!(Svm::new(0.0, None, 15).fit(&x, &y).is_err());
    }

    #[test]
    fn pipeline_with_smote_predicts_validation_rows() {
        let records = cohort(300);
        let roles = ColumnRoles::from_frame(&records_to_dataframe(&records).unwrap()).unwrap();
        let (train, valid) = train_valid_split(&records, 0.8, 15);
        let pipeline = PipelineSpec::new(ModelSpec::logistic(), Some(Smote::default()));
        let fitted = pipeline.fit(&train, &roles).unwrap();
        let proba = fitted.predict_proba(&valid).unwrap();
        assert_eq!(proba.len(), valid.len());
        assert!(proba.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(fitted.predict(&valid).unwrap().len(), valid.len());
    }
}
