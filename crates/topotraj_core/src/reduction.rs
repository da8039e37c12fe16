//! Classical multidimensional scaling of a diagram distance matrix.

use crate::diagram::DiagramKey;
use crate::distance::DistanceMatrix;
use crate::error::{TopoError, TopoResult};
use nalgebra::{DMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionSettings {
    /// Target embedding dimension.
    pub components: usize,
    /// Eigenvalues at or below `relative_tolerance * max |λ|` count as noise.
    pub relative_tolerance: f64,
}

impl Default for ReductionSettings {
    fn default() -> Self {
        Self {
            components: 3,
            relative_tolerance: 1e-9,
        }
    }
}

/// Low-dimensional coordinates of every diagram of one distance matrix.
/// Coordinates from different runs are not comparable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    keys: Vec<DiagramKey>,
    coordinates: Vec<Vec<f64>>,
    /// Spectrum of the double-centered matrix, descending, negatives clamped.
    #[serde(default)]
    eigenvalues: Vec<f64>,
}

impl Embedding {
    pub fn from_parts(keys: Vec<DiagramKey>, coordinates: Vec<Vec<f64>>) -> TopoResult<Self> {
        if keys.len() != coordinates.len() {
            return Err(TopoError::DimensionMismatch {
                expected: keys.len(),
                found: coordinates.len(),
            });
        }
        if let Some(first) = coordinates.first() {
            let dim = first.len();
            if let Some(row) = coordinates.iter().find(|row| row.len() != dim) {
                return Err(TopoError::DimensionMismatch {
                    expected: dim,
                    found: row.len(),
                });
            }
        }
        let mut seen = HashSet::with_capacity(keys.len());
        for key in &keys {
            if !seen.insert(key) {
                return Err(TopoError::DuplicateKey(key.to_string()));
            }
        }
        Ok(Self {
            keys,
            coordinates,
            eigenvalues: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.coordinates.first().map_or(0, Vec::len)
    }

    pub fn keys(&self) -> &[DiagramKey] {
        &self.keys
    }

    pub fn coordinates(&self) -> &[Vec<f64>] {
        &self.coordinates
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DiagramKey, &[f64])> {
        self.keys
            .iter()
            .zip(self.coordinates.iter().map(Vec::as_slice))
    }

    pub fn coordinates_of(&self, key: &DiagramKey) -> Option<&[f64]> {
        self.keys
            .iter()
            .position(|k| k == key)
            .map(|i| self.coordinates[i].as_slice())
    }

    /// Kruskal stress-1 of the embedding against the distances it came from.
    pub fn stress(&self, distances: &DistanceMatrix) -> TopoResult<f64> {
        if distances.len() != self.len() {
            return Err(TopoError::DimensionMismatch {
                expected: distances.len(),
                found: self.len(),
            });
        }
        let n = self.len();
        let mut residual = 0.0;
        let mut total = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let embedded: f64 = self.coordinates[i]
                    .iter()
                    .zip(self.coordinates[j].iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>()
                    .sqrt();
                let original = distances.get(i, j);
                residual += (original - embedded).powi(2);
                total += original * original;
            }
        }
        if total <= f64::EPSILON {
            return Ok(0.0);
        }
        Ok((residual / total).sqrt())
    }
}

/// Embeds `distances` into `settings.components` dimensions.
///
/// Fails with [`TopoError::InsufficientRank`] when the double-centered
/// matrix has fewer non-trivial eigenvalues than requested; no dimension is
/// zero-padded.
pub fn classical_mds(
    distances: &DistanceMatrix,
    settings: &ReductionSettings,
) -> TopoResult<Embedding> {
    let n = distances.len();
    let d = settings.components;
    if d == 0 {
        return Err(TopoError::InvalidSettings(
            "embedding needs at least one component".to_string(),
        ));
    }
    if settings.relative_tolerance.is_nan() || settings.relative_tolerance < 0.0 {
        return Err(TopoError::InvalidSettings(
            "relative tolerance must be non-negative".to_string(),
        ));
    }
    if n == 0 {
        return Err(TopoError::EmptyCollection {
            required: 1,
            found: 0,
        });
    }

    let squared = distances.values().map(|v| v * v);
    let centered = double_center(&squared);
    let eigen = SymmetricEigen::new(centered);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let spectrum: Vec<f64> = order.iter().map(|&i| eigen.eigenvalues[i]).collect();

    let max_abs = spectrum.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let threshold = (settings.relative_tolerance * max_abs).max(f64::EPSILON);
    let available = spectrum.iter().filter(|&&v| v > threshold).count();
    debug!(?spectrum, available, "mds spectrum");
    if available < d {
        return Err(TopoError::InsufficientRank {
            requested: d,
            available,
        });
    }

    let mut coordinates = vec![vec![0.0; d]; n];
    for (component, &col) in order.iter().take(d).enumerate() {
        let scale = spectrum[component].sqrt();
        let vector = eigen.eigenvectors.column(col);
        // Fix the sign so the largest-magnitude entry is positive.
        let pivot = vector
            .iter()
            .copied()
            .fold(0.0_f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
        let sign = if pivot < 0.0 { -1.0 } else { 1.0 };
        for (row, coords) in coordinates.iter_mut().enumerate() {
            coords[component] = sign * vector[row] * scale;
        }
    }

    info!(
        diagrams = n,
        components = d,
        retained_variance = spectrum.iter().take(d).sum::<f64>(),
        "classical mds embedding computed"
    );

    Ok(Embedding {
        keys: distances.keys().to_vec(),
        coordinates,
        eigenvalues: spectrum.into_iter().map(|v| v.max(0.0)).collect(),
    })
}

/// `-1/2 * J * D2 * J` with `J = I - 11ᵀ/n`.
fn double_center(squared: &DMatrix<f64>) -> DMatrix<f64> {
    let n = squared.nrows();
    let inv_n = 1.0 / n as f64;
    let row_means: Vec<f64> = (0..n).map(|i| squared.row(i).sum() * inv_n).collect();
    let col_means: Vec<f64> = (0..n).map(|j| squared.column(j).sum() * inv_n).collect();
    let grand = row_means.iter().sum::<f64>() * inv_n;
    DMatrix::from_fn(n, n, |i, j| {
        -0.5 * (squared[(i, j)] - row_means[i] - col_means[j] + grand)
    })
}
