//! Seeded k-means (k-means++ initialisation, several restarts, lowest inertia
//! wins). The same matrix, k and seed always give the same assignment.

use audience_core::config::ClusteringConfig;
use audience_core::{SegmentationError, SegmentationResult};
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::check_cancelled;

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    pub assignments: Vec<usize>,
    pub centroids: Array2<f64>,
    pub inertia: f64,
    pub iterations: usize,
}

impl KMeansResult {
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.centroids.nrows()];
        for &a in &self.assignments {
            sizes[a] += 1;
        }
        sizes
    }
}

/// `max(1, min(max_clusters, customers / customers_per_cluster))`.
pub fn cluster_count(customers: usize, config: &ClusteringConfig) -> usize {
    (customers / config.customers_per_cluster.max(1))
        .min(config.max_clusters)
        .max(1)
}

fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest(point: ArrayView1<f64>, centroids: &Array2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

fn init_plus_plus(data: &Array2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let n = data.nrows();
    let mut centroids = Array2::<f64>::zeros((k, data.ncols()));
    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));

    let mut closest: Vec<f64> = data
        .rows()
        .into_iter()
        .map(|row| squared_distance(row, centroids.row(0)))
        .collect();

    for c in 1..k {
        let total: f64 = closest.iter().sum();
        let chosen = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut pick = n - 1;
            for (i, d) in closest.iter().enumerate() {
                if target < *d {
                    pick = i;
                    break;
                }
                target -= d;
            }
            pick
        } else {
            rng.gen_range(0..n)
        };
        centroids.row_mut(c).assign(&data.row(chosen));
        for (i, row) in data.rows().into_iter().enumerate() {
            let d = squared_distance(row, centroids.row(c));
            if d < closest[i] {
                closest[i] = d;
            }
        }
    }
    centroids
}

fn lloyd(
    data: &Array2<f64>,
    mut centroids: Array2<f64>,
    config: &ClusteringConfig,
    cancel: &CancellationToken,
) -> SegmentationResult<KMeansResult> {
    let (n, dims) = data.dim();
    let k = centroids.nrows();
    let mut assignments = vec![usize::MAX; n];
    let mut iterations = 0;

    for _ in 0..config.max_iterations {
        check_cancelled(cancel)?;
        iterations += 1;

        let mut changed = false;
        let mut distances = vec![0.0; n];
        for (i, row) in data.rows().into_iter().enumerate() {
            let (c, d) = nearest(row, &centroids);
            if assignments[i] != c {
                assignments[i] = c;
                changed = true;
            }
            distances[i] = d;
        }

        let mut sums = Array2::<f64>::zeros((k, dims));
        let mut counts = vec![0usize; k];
        for (i, row) in data.rows().into_iter().enumerate() {
            let mut target = sums.row_mut(assignments[i]);
            target += &row;
            counts[assignments[i]] += 1;
        }

        let mut updated = centroids.clone();
        let mut taken: Vec<usize> = Vec::new();
        for c in 0..k {
            if counts[c] > 0 {
                let mean = sums.row(c).mapv(|v| v / counts[c] as f64);
                updated.row_mut(c).assign(&mean);
            } else {
                // Empty cluster: re-seed with the point farthest from its centroid.
                let far = (0..n)
                    .filter(|i| !taken.contains(i))
                    .max_by(|&a, &b| distances[a].total_cmp(&distances[b]).then(b.cmp(&a)))
                    .unwrap_or(0);
                taken.push(far);
                updated.row_mut(c).assign(&data.row(far));
                changed = true;
            }
        }

        let shift: f64 = centroids
            .rows()
            .into_iter()
            .zip(updated.rows())
            .map(|(a, b)| squared_distance(a, b))
            .sum();
        centroids = updated;

        if !changed || shift <= config.tolerance {
            break;
        }
    }

    let mut inertia = 0.0;
    for (i, row) in data.rows().into_iter().enumerate() {
        let (c, d) = nearest(row, &centroids);
        assignments[i] = c;
        inertia += d;
    }

    Ok(KMeansResult {
        assignments,
        centroids,
        inertia,
        iterations,
    })
}

pub fn kmeans(
    data: &Array2<f64>,
    k: usize,
    config: &ClusteringConfig,
    cancel: &CancellationToken,
) -> SegmentationResult<KMeansResult> {
    let n = data.nrows();
    if n == 0 {
        return Err(SegmentationError::computation("cannot cluster zero rows"));
    }
    let k = k.clamp(1, n);

    let mut best: Option<KMeansResult> = None;
    for run in 0..config.n_init.max(1) {
        check_cancelled(cancel)?;
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(run as u64));
        let initial = init_plus_plus(data, k, &mut rng);
        let result = lloyd(data, initial, config, cancel)?;
        debug!(run, inertia = result.inertia, iterations = result.iterations, "k-means run");
        if best.as_ref().map_or(true, |b| result.inertia < b.inertia) {
            best = Some(result);
        }
    }

    best.ok_or_else(|| SegmentationError::computation("k-means produced no result"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn blobs() -> Array2<f64> {
        let mut rows = Vec::new();
        for i in 0..30 {
            let jitter = (i % 5) as f64 * 0.01;
            rows.extend_from_slice(&[0.0 + jitter, 0.0 - jitter]);
            rows.extend_from_slice(&[10.0 + jitter, 10.0 - jitter]);
            rows.extend_from_slice(&[-10.0 - jitter, 10.0 + jitter]);
        }
        Array2::from_shape_vec((90, 2), rows).unwrap()
    }

    #[test]
    fn test_cluster_count_rule() {
        let config = ClusteringConfig::default();
        assert_eq!(cluster_count(0, &config), 1);
        assert_eq!(cluster_count(19, &config), 1);
        assert_eq!(cluster_count(40, &config), 2);
        assert_eq!(cluster_count(99, &config), 4);
        assert_eq!(cluster_count(10_000, &config), 5);
    }

    #[test]
    fn test_separates_blobs() {
        let data = blobs();
        let result = kmeans(&data, 3, &ClusteringConfig::default(), &CancellationToken::new())
            .unwrap();
        let mut sizes = result.cluster_sizes();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![30, 30, 30]);
        // Rows 0, 1, 2 come from different blobs.
        let a = &result.assignments;
        assert_ne!(a[0], a[1]);
        assert_ne!(a[1], a[2]);
        assert_ne!(a[0], a[2]);
        // Members of the same blob share a cluster.
        assert!((0..90).step_by(3).all(|i| a[i] == a[0]));
    }

    #[test]
    fn test_deterministic_for_same_seed() {
        let data = blobs();
        let config = ClusteringConfig::default();
        let first = kmeans(&data, 4, &config, &CancellationToken::new()).unwrap();
        for _ in 0..3 {
            let again = kmeans(&data, 4, &config, &CancellationToken::new()).unwrap();
            assert_eq!(again.assignments, first.assignments);
            assert_eq!(again.centroids, first.centroids);
        }
    }

    #[test]
    fn test_k_clamped_to_rows() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let result = kmeans(&data, 5, &ClusteringConfig::default(), &CancellationToken::new())
            .unwrap();
        assert_eq!(result.centroids.nrows(), 2);
        assert!(result.inertia.abs() < 1e-12);
    }

    #[test]
    fn test_duplicate_points_do_not_panic() {
        let data = Array2::<f64>::zeros((10, 3));
        let result = kmeans(&data, 3, &ClusteringConfig::default(), &CancellationToken::new())
            .unwrap();
        assert_eq!(result.assignments.len(), 10);
        assert_eq!(result.inertia, 0.0);
    }

    #[test]
    fn test_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = kmeans(&blobs(), 3, &ClusteringConfig::default(), &cancel).unwrap_err();
        assert!(matches!(err, SegmentationError::Cancelled));
    }

    #[test]
    fn test_empty_matrix() {
        let data = Array2::<f64>::zeros((0, 2));
        assert!(kmeans(&data, 1, &ClusteringConfig::default(), &CancellationToken::new()).is_err());
    }
}
