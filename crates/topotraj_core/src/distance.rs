//! Pairwise distances between persistence diagrams.
//!
//! The metric is the Wasserstein-`p` distance with a Euclidean ground metric
//! in the (birth, death) plane. Pairs only match pairs of the same homology
//! dimension; an unmatched pair is sent to the diagonal at cost
//! `persistence / sqrt(2)`.

use crate::diagram::{DiagramCollection, DiagramKey, PersistenceDiagram, PersistencePair};
use crate::error::{TopoError, TopoResult};
use crate::traits::{DiagramFilter, DiagramMetric};
use nalgebra::DMatrix;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Which pairs of each diagram take part in the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "pairs", rename_all = "snake_case")]
pub enum PairFilter {
    All,
    /// Keep the `k` most persistent pairs of each diagram.
    MostPersistent(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceSettings {
    pub pair_filter: PairFilter,
    pub exponent: f64,
}

impl Default for DistanceSettings {
    fn default() -> Self {
        Self {
            pair_filter: PairFilter::MostPersistent(50),
            exponent: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WassersteinDistance {
    exponent: f64,
}

impl WassersteinDistance {
    pub fn new(exponent: f64) -> TopoResult<Self> {
        if !exponent.is_finite() || exponent < 1.0 {
            return Err(TopoError::InvalidSettings(format!(
                "Wasserstein exponent must be finite and at least 1, got {exponent}"
            )));
        }
        Ok(Self { exponent })
    }

    pub fn exponent(&self) -> f64 {
        self.exponent
    }

    /// Optimal matching cost of one homology dimension, before the `p`-th root.
    fn matching_cost(&self, a: &[PersistencePair], b: &[PersistencePair]) -> f64 {
        let p = self.exponent;
        let to_diagonal =
            |pair: &PersistencePair| (pair.persistence() / std::f64::consts::SQRT_2).powf(p);
        if a.is_empty() {
            return b.iter().map(to_diagonal).sum();
        }
        if b.is_empty() {
            return a.iter().map(to_diagonal).sum();
        }

        let n = a.len();
        let m = b.len();
        let size = n + m;
        let mut cost = DMatrix::<f64>::zeros(size, size);
        let mut finite_total = 0.0;
        for (i, pa) in a.iter().enumerate() {
            for (j, pb) in b.iter().enumerate() {
                let ground = (pa.birth - pb.birth).hypot(pa.death - pb.death);
                let value = ground.powf(p);
                cost[(i, j)] = value;
                finite_total += value;
            }
        }
        let diag_a: Vec<f64> = a.iter().map(to_diagonal).collect();
        let diag_b: Vec<f64> = b.iter().map(to_diagonal).collect();
        finite_total += diag_a.iter().sum::<f64>() + diag_b.iter().sum::<f64>();

        // Any perfect matching over allowed cells costs less than this.
        let forbidden = finite_total + 1.0;
        for i in 0..n {
            for k in 0..n {
                cost[(i, m + k)] = if i == k { diag_a[i] } else { forbidden };
            }
        }
        for l in 0..m {
            for j in 0..m {
                cost[(n + l, j)] = if l == j { diag_b[j] } else { forbidden };
            }
        }

        solve_assignment(&cost)
    }
}

impl Default for WassersteinDistance {
    fn default() -> Self {
        Self { exponent: 2.0 }
    }
}

impl DiagramMetric for WassersteinDistance {
    fn distance(&self, a: &PersistenceDiagram, b: &PersistenceDiagram) -> f64 {
        let mut dimensions = a.dimensions();
        dimensions.extend(b.dimensions());

        let mut total = 0.0;
        for dimension in dimensions {
            let pa: Vec<PersistencePair> = a.pairs_in_dimension(dimension).copied().collect();
            let pb: Vec<PersistencePair> = b.pairs_in_dimension(dimension).copied().collect();
            total += self.matching_cost(&pa, &pb);
        }
        total.max(0.0).powf(1.0 / self.exponent)
    }
}

/// Minimum-cost perfect matching of a square cost matrix (Kuhn-Munkres with
/// row/column potentials). Returns the total cost.
pub(crate) fn solve_assignment(cost: &DMatrix<f64>) -> f64 {
    let n = cost.nrows();
    if n == 0 {
        return 0.0;
    }
    // 1-based: index 0 is the virtual column used while growing a path.
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; n + 1];
    let mut row_of_col = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for row in 1..=n {
        row_of_col[0] = row;
        let mut col0 = 0usize;
        let mut min_slack = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[col0] = true;
            let row0 = row_of_col[col0];
            let mut delta = f64::INFINITY;
            let mut col1 = 0usize;
            for col in 1..=n {
                if used[col] {
                    continue;
                }
                let slack = cost[(row0 - 1, col - 1)] - u[row0] - v[col];
                if slack < min_slack[col] {
                    min_slack[col] = slack;
                    way[col] = col0;
                }
                if min_slack[col] < delta {
                    delta = min_slack[col];
                    col1 = col;
                }
            }
            for col in 0..=n {
                if used[col] {
                    u[row_of_col[col]] += delta;
                    v[col] -= delta;
                } else {
                    min_slack[col] -= delta;
                }
            }
            col0 = col1;
            if row_of_col[col0] == 0 {
                break;
            }
        }
        loop {
            let col1 = way[col0];
            row_of_col[col0] = row_of_col[col1];
            col0 = col1;
            if col0 == 0 {
                break;
            }
        }
    }

    (1..=n)
        .map(|col| cost[(row_of_col[col] - 1, col - 1)])
        .sum()
}

/// Symmetric N×N matrix of diagram distances with a zero diagonal, indexed
/// by [`DiagramKey`] in collection order.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    keys: Vec<DiagramKey>,
    index: HashMap<DiagramKey, usize>,
    values: DMatrix<f64>,
}

impl DistanceMatrix {
    /// Builds a matrix from externally computed values. The two triangles
    /// are averaged and the diagonal set to zero.
    pub fn from_parts(keys: Vec<DiagramKey>, values: DMatrix<f64>) -> TopoResult<Self> {
        if values.nrows() != values.ncols() {
            return Err(TopoError::DimensionMismatch {
                expected: values.nrows(),
                found: values.ncols(),
            });
        }
        if values.nrows() != keys.len() {
            return Err(TopoError::DimensionMismatch {
                expected: keys.len(),
                found: values.nrows(),
            });
        }
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(TopoError::InvalidSettings(
                "distances must be finite and non-negative".to_string(),
            ));
        }
        let n = keys.len();
        let mut symmetric = values;
        for i in 0..n {
            symmetric[(i, i)] = 0.0;
            for j in (i + 1)..n {
                let mean = 0.5 * (symmetric[(i, j)] + symmetric[(j, i)]);
                symmetric[(i, j)] = mean;
                symmetric[(j, i)] = mean;
            }
        }
        Self::assemble(keys, symmetric)
    }

    fn assemble(keys: Vec<DiagramKey>, values: DMatrix<f64>) -> TopoResult<Self> {
        let mut index = HashMap::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            if index.insert(key.clone(), i).is_some() {
                return Err(TopoError::DuplicateKey(key.to_string()));
            }
        }
        Ok(Self {
            keys,
            index,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[DiagramKey] {
        &self.keys
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[(i, j)]
    }

    pub fn index_of(&self, key: &DiagramKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn distance_between(&self, a: &DiagramKey, b: &DiagramKey) -> Option<f64> {
        Some(self.values[(self.index_of(a)?, self.index_of(b)?)])
    }

    /// Row-major copy of the values.
    pub fn to_row_major(&self) -> Vec<f64> {
        let n = self.len();
        let mut out = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                out.push(self.values[(i, j)]);
            }
        }
        out
    }

    /// Sub-matrix over `keys`, in the order given.
    pub fn restrict<'a, I>(&self, keys: I) -> TopoResult<DistanceMatrix>
    where
        I: IntoIterator<Item = &'a DiagramKey>,
    {
        let mut rows = Vec::new();
        let mut selected = Vec::new();
        for key in keys {
            let row = self
                .index_of(key)
                .ok_or_else(|| TopoError::UnknownKey(key.to_string()))?;
            rows.push(row);
            selected.push(key.clone());
        }
        let n = rows.len();
        let values = DMatrix::from_fn(n, n, |i, j| self.values[(rows[i], rows[j])]);
        Self::assemble(selected, values)
    }

    /// Sub-matrix over the keys accepted by `filter`, in matrix order.
    pub fn subset<F: DiagramFilter + ?Sized>(&self, filter: &F) -> TopoResult<DistanceMatrix> {
        let keys: Vec<DiagramKey> = self
            .keys
            .iter()
            .filter(|key| filter.accepts(key))
            .cloned()
            .collect();
        self.restrict(keys.iter())
    }

    /// Largest amount by which `d(i,j) <= d(i,k) + d(k,j)` is violated.
    /// Approximate diagram distances may break the inequality slightly;
    /// this is reported, never enforced. Cubic in `len()`, so it is never
    /// run implicitly.
    pub fn triangle_violation(&self) -> f64 {
        let n = self.len();
        let mut worst: f64 = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                for k in 0..n {
                    let excess = self.values[(i, j)] - self.values[(i, k)] - self.values[(k, j)];
                    worst = worst.max(excess);
                }
            }
        }
        worst
    }

    /// Cell grid for a heat-map rendering of the matrix. Values are kept
    /// raw; `min`/`max` give the color range.
    pub fn heat_map(&self) -> HeatMap {
        let n = self.len();
        let values = self.to_row_major();
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    min = min.min(self.values[(i, j)]);
                    max = max.max(self.values[(i, j)]);
                }
            }
        }
        if n < 2 {
            min = 0.0;
            max = 0.0;
        }
        HeatMap {
            size: n,
            values,
            min,
            max,
            labels: self.keys.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatMap {
    pub size: usize,
    /// Row-major, `size * size` entries.
    pub values: Vec<f64>,
    /// Off-diagonal range.
    pub min: f64,
    pub max: f64,
    pub labels: Vec<String>,
}

/// Computes the full distance matrix of `collection` under `settings`.
pub fn compute_distance_matrix(
    collection: &DiagramCollection,
    settings: &DistanceSettings,
) -> TopoResult<DistanceMatrix> {
    let metric = WassersteinDistance::new(settings.exponent)?;
    let truncated = match settings.pair_filter {
        PairFilter::All => collection.clone(),
        PairFilter::MostPersistent(0) => {
            return Err(TopoError::InvalidSettings(
                "pair count must be at least 1".to_string(),
            ))
        }
        PairFilter::MostPersistent(k) => collection.truncated(k),
    };
    compute_distance_matrix_with(&truncated, &metric)
}

/// Computes the distance matrix with an arbitrary metric. Pairs `i < j` are
/// evaluated independently and mirrored.
pub fn compute_distance_matrix_with<M: DiagramMetric + ?Sized>(
    collection: &DiagramCollection,
    metric: &M,
) -> TopoResult<DistanceMatrix> {
    let n = collection.len();
    if n < 2 {
        return Err(TopoError::EmptyCollection {
            required: 2,
            found: n,
        });
    }
    let entries = collection.entries();
    for entry in entries {
        entry.diagram.validate(&entry.key.to_string())?;
    }

    let index_pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .collect();

    #[cfg(feature = "parallel")]
    let distances: Vec<f64> = index_pairs
        .par_iter()
        .map(|&(i, j)| metric.distance(&entries[i].diagram, &entries[j].diagram))
        .collect();
    #[cfg(not(feature = "parallel"))]
    let distances: Vec<f64> = index_pairs
        .iter()
        .map(|&(i, j)| metric.distance(&entries[i].diagram, &entries[j].diagram))
        .collect();

    let mut values = DMatrix::<f64>::zeros(n, n);
    for (&(i, j), &d) in index_pairs.iter().zip(distances.iter()) {
        values[(i, j)] = d;
        values[(j, i)] = d;
    }

    info!(
        diagrams = n,
        pairs = index_pairs.len(),
        "distance matrix computed"
    );
    let keys: Vec<DiagramKey> = collection.keys().cloned().collect();
    DistanceMatrix::assemble(keys, values)
}
