//! Likelihoods and information criteria for choosing a cluster count.
//!
//! A clustering is summarized by the distance of every diagram to its
//! cluster's exemplar. The log-likelihoods treat those distances as
//! residuals of an isotropic Gaussian mixture.

use crate::clustering::{cluster_distances_with_clock, ClusteringSettings};
use crate::distance::DistanceMatrix;
use crate::traits::{Clock, SystemClock};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Distances of the points of each cluster to that cluster's exemplar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpread {
    distances_per_cluster: Vec<Vec<f64>>,
}

impl ClusterSpread {
    pub fn new(distances_per_cluster: Vec<Vec<f64>>) -> Self {
        Self {
            distances_per_cluster,
        }
    }

    pub fn cluster_count(&self) -> usize {
        self.distances_per_cluster.len()
    }

    pub fn points_per_cluster(&self) -> Vec<usize> {
        self.distances_per_cluster.iter().map(Vec::len).collect()
    }

    pub fn point_count(&self) -> usize {
        self.distances_per_cluster.iter().map(Vec::len).sum()
    }

    pub fn distances_per_cluster(&self) -> &[Vec<f64>] {
        &self.distances_per_cluster
    }

    pub fn residual_sum_of_squares(&self) -> f64 {
        self.distances_per_cluster
            .iter()
            .flatten()
            .map(|d| d * d)
            .sum()
    }

    /// `-RSS / (2N)`: equal-size clusters with unit variance.
    pub fn unit_variance_log_likelihood(&self) -> Result<f64> {
        let n = self.point_count();
        if n == 0 {
            bail!("Log-likelihood requires at least one clustered point.");
        }
        Ok(-self.residual_sum_of_squares() / (2.0 * n as f64))
    }

    /// Maximum log-likelihood of a Gaussian mixture whose clusters share one
    /// variance `RSS / (dim * (N - K))` in a `dim`-dimensional space.
    pub fn same_variance_log_likelihood(&self, dimension: f64) -> Result<f64> {
        if !dimension.is_finite() || dimension <= 0.0 {
            bail!("Dimension must be positive and finite.");
        }
        let n = self.point_count();
        let k = self.cluster_count();
        if n <= k {
            bail!("Same-variance likelihood needs more points ({n}) than clusters ({k}).");
        }
        let rss = self.residual_sum_of_squares();
        if rss <= 0.0 {
            bail!("Same-variance likelihood is unbounded for a zero residual.");
        }
        let n_f = n as f64;
        let variance = rss / (dimension * (n_f - k as f64));

        let mut log_likelihood = 0.0;
        for &size in &self.points_per_cluster() {
            if size > 0 {
                let size = size as f64;
                log_likelihood += size * size.ln();
            }
        }
        log_likelihood -= n_f * n_f.ln();
        log_likelihood -= 0.5 * n_f * dimension * (2.0 * std::f64::consts::PI * variance).ln();
        log_likelihood -= 0.5 * dimension * (n_f - k as f64);
        Ok(log_likelihood)
    }
}

/// Akaike information criterion, `2k - 2 ln L`.
pub fn aic(log_likelihood: f64, parameters: f64) -> f64 {
    2.0 * parameters - 2.0 * log_likelihood
}

/// Small-sample corrected AIC, `AIC + (2k² + 2k) / (n - k - 1)`.
pub fn aicc(log_likelihood: f64, parameters: f64, samples: f64) -> f64 {
    aic(log_likelihood, parameters)
        + (2.0 * parameters * (parameters + 1.0)) / (samples - parameters - 1.0)
}

/// Bayesian information criterion, `ln(n) k - 2 ln L`.
pub fn bic(log_likelihood: f64, parameters: f64, samples: f64) -> f64 {
    samples.ln() * parameters - 2.0 * log_likelihood
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Aic,
    Aicc,
    Bic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterCountScore {
    pub clusters: usize,
    pub log_likelihood: f64,
    pub aic: f64,
    pub aicc: f64,
    pub bic: f64,
}

impl ClusterCountScore {
    pub fn from_spread(spread: &ClusterSpread, dimension: f64) -> Result<Self> {
        let clusters = spread.cluster_count();
        let log_likelihood = spread.same_variance_log_likelihood(dimension)?;
        let parameters = dimension * clusters as f64;
        let samples = spread.point_count() as f64;
        Ok(Self {
            clusters,
            log_likelihood,
            aic: aic(log_likelihood, parameters),
            aicc: aicc(log_likelihood, parameters, samples),
            bic: bic(log_likelihood, parameters, samples),
        })
    }

    pub fn value(&self, criterion: Criterion) -> f64 {
        match criterion {
            Criterion::Aic => self.aic,
            Criterion::Aicc => self.aicc,
            Criterion::Bic => self.bic,
        }
    }
}

/// Clusters `distances` once per candidate count and scores each result.
/// `dimension` is the effective dimension of the diagram space; each
/// cluster contributes `dimension` parameters.
pub fn score_cluster_counts(
    distances: &DistanceMatrix,
    candidates: &[usize],
    settings: &ClusteringSettings,
    dimension: f64,
) -> Result<Vec<ClusterCountScore>> {
    score_cluster_counts_with_clock(distances, candidates, settings, dimension, SystemClock::new())
}

pub fn score_cluster_counts_with_clock<C: Clock>(
    distances: &DistanceMatrix,
    candidates: &[usize],
    settings: &ClusteringSettings,
    dimension: f64,
    clock: C,
) -> Result<Vec<ClusterCountScore>> {
    if candidates.is_empty() {
        bail!("At least one candidate cluster count is required.");
    }
    let mut scores = Vec::with_capacity(candidates.len());
    for &clusters in candidates {
        let run_settings = ClusteringSettings {
            clusters,
            ..*settings
        };
        let assignment = cluster_distances_with_clock(distances, &run_settings, &clock)?;
        scores.push(ClusterCountScore::from_spread(&assignment.spread(), dimension)?);
    }
    Ok(scores)
}

/// Candidate cluster counts ordered from best (lowest criterion) to worst.
pub fn rank_by(scores: &[ClusterCountScore], criterion: Criterion) -> Vec<usize> {
    let mut ordered: Vec<&ClusterCountScore> = scores.iter().collect();
    ordered.sort_by(|a, b| {
        a.value(criterion)
            .partial_cmp(&b.value(criterion))
            .unwrap_or(Ordering::Equal)
    });
    ordered.into_iter().map(|score| score.clusters).collect()
}
