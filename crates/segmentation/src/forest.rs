//! Binary random-forest classifier used by lookalike modeling.
//!
//! Training is a pure function: it takes a feature matrix and 0/1 labels and
//! returns an immutable [`TrainedForest`]. Trees are CART with Gini impurity,
//! grown on bootstrap samples, considering `sqrt(features)` candidates per
//! split. Feature importance is mean decrease in impurity, normalised to 1.

use audience_core::config::LookalikeConfig;
use audience_core::{SegmentationError, SegmentationResult};
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::check_cancelled;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub seed: u64,
}

impl From<&LookalikeConfig> for ForestParams {
    fn from(config: &LookalikeConfig) -> Self {
        Self {
            n_estimators: config.n_estimators,
            max_depth: config.max_depth,
            min_samples_split: config.min_samples_split,
            seed: config.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf {
        probability: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { probability } => return *probability,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainedForest {
    trees: Vec<DecisionTree>,
    n_features: usize,
    importances: Vec<f64>,
}

impl TrainedForest {
    /// Probability of the positive class: the mean leaf probability across trees.
    pub fn predict_proba(&self, row: ArrayView1<f64>) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.trees.iter().map(|t| t.predict(row)).sum();
        sum / self.trees.len() as f64
    }

    pub fn predict_proba_batch(&self, data: &Array2<f64>) -> Vec<f64> {
        data.rows().into_iter().map(|row| self.predict_proba(row)).collect()
    }

    /// Fraction of rows whose predicted class (`p > 0.5`) matches the label.
    /// Zero for an empty matrix.
    pub fn accuracy(&self, data: &Array2<f64>, labels: &[u8]) -> f64 {
        if data.nrows() == 0 {
            return 0.0;
        }
        let correct = data
            .rows()
            .into_iter()
            .zip(labels)
            .filter(|(row, &label)| (self.predict_proba(*row) > 0.5) == (label == 1))
            .count();
        correct as f64 / data.nrows() as f64
    }

    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }
}

fn gini(positives: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    let p = positives / total;
    2.0 * p * (1.0 - p)
}

struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
}

struct Grower<'a> {
    data: &'a Array2<f64>,
    labels: &'a [u8],
    params: ForestParams,
    max_features: usize,
    root_size: f64,
    rng: StdRng,
    nodes: Vec<Node>,
    importance: Vec<f64>,
}

impl Grower<'_> {
    fn grow(&mut self, indices: Vec<usize>, depth: usize) -> usize {
        let total = indices.len() as f64;
        let positives = indices.iter().filter(|&&i| self.labels[i] == 1).count() as f64;
        let impurity = gini(positives, total);

        let id = self.nodes.len();
        self.nodes.push(Node::Leaf {
            probability: if total > 0.0 { positives / total } else { 0.0 },
        });

        if depth >= self.params.max_depth
            || indices.len() < self.params.min_samples_split.max(2)
            || impurity <= 0.0
        {
            return id;
        }
        let Some(split) = self.best_split(&indices, positives, impurity) else {
            return id;
        };

        let data = self.data;
        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| data[[i, split.feature]] <= split.threshold);
        self.importance[split.feature] += total / self.root_size * split.gain;

        let left_id = self.grow(left, depth + 1);
        let right_id = self.grow(right, depth + 1);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left: left_id,
            right: right_id,
        };
        id
    }

    /// Visits features in random order and stops after `max_features` of
    /// them, unless none of those produced a valid split yet.
    fn best_split(&mut self, indices: &[usize], positives: f64, impurity: f64) -> Option<Split> {
        let (data, labels) = (self.data, self.labels);
        let n_features = data.ncols();
        let total = indices.len() as f64;
        let order = rand::seq::index::sample(&mut self.rng, n_features, n_features);

        let mut sorted = indices.to_vec();
        let mut best: Option<Split> = None;
        for (visited, feature) in order.iter().enumerate() {
            if visited >= self.max_features && best.is_some() {
                break;
            }
            sorted.sort_by(|&a, &b| data[[a, feature]].total_cmp(&data[[b, feature]]));

            let mut left_pos = 0.0;
            for k in 0..sorted.len() - 1 {
                left_pos += f64::from(labels[sorted[k]]);
                let lo = data[[sorted[k], feature]];
                let hi = data[[sorted[k + 1], feature]];
                if hi <= lo {
                    continue;
                }
                let left_n = (k + 1) as f64;
                let right_n = total - left_n;
                let child = (left_n * gini(left_pos, left_n)
                    + right_n * gini(positives - left_pos, right_n))
                    / total;
                let gain = impurity - child;
                if gain > 1e-12 && best.as_ref().map_or(true, |b| gain > b.gain) {
                    let mid = lo + (hi - lo) / 2.0;
                    best = Some(Split {
                        feature,
                        threshold: if mid < hi { mid } else { lo },
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// Trains a forest on `data` (rows are samples) and 0/1 `labels`.
pub fn train(
    data: &Array2<f64>,
    labels: &[u8],
    params: ForestParams,
    cancel: &CancellationToken,
) -> SegmentationResult<TrainedForest> {
    let (n, n_features) = data.dim();
    if n == 0 || n_features == 0 {
        return Err(SegmentationError::computation(
            "cannot train on an empty feature matrix",
        ));
    }
    if labels.len() != n {
        return Err(SegmentationError::computation(format!(
            "{} labels for {} training rows",
            labels.len(),
            n
        )));
    }
    if labels.iter().any(|&l| l > 1) {
        return Err(SegmentationError::computation("labels must be 0 or 1"));
    }
    if params.n_estimators == 0 {
        return Err(SegmentationError::computation("forest needs at least one tree"));
    }

    let max_features = ((n_features as f64).sqrt() as usize).max(1);
    let mut trees = Vec::with_capacity(params.n_estimators);
    let mut importances = vec![0.0; n_features];

    for t in 0..params.n_estimators {
        check_cancelled(cancel)?;
        let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(t as u64));
        let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();

        let mut grower = Grower {
            data,
            labels,
            params,
            max_features,
            root_size: n as f64,
            rng,
            nodes: Vec::new(),
            importance: vec![0.0; n_features],
        };
        grower.grow(sample, 0);

        let tree_total: f64 = grower.importance.iter().sum();
        if tree_total > 0.0 {
            for (acc, v) in importances.iter_mut().zip(&grower.importance) {
                *acc += v / tree_total;
            }
        }
        trees.push(DecisionTree {
            nodes: grower.nodes,
        });
    }

    let total: f64 = importances.iter().sum();
    if total > 0.0 {
        importances.iter_mut().for_each(|v| *v /= total);
    }

    debug!(
        trees = trees.len(),
        rows = n,
        features = n_features,
        "Random forest trained"
    );

    Ok(TrainedForest {
        trees,
        n_features,
        importances,
    })
}
