//! Exemplar (k-medoids) clustering of persistence diagrams under a
//! wall-clock budget.
//!
//! Seeding is deterministic farthest-point initialization, so two runs on
//! the same input produce the same assignment whenever they complete the
//! same number of iterations. The budget is checked only between full
//! iterations: it may be overrun by at most one iteration.

use crate::criteria::ClusterSpread;
use crate::diagram::{DiagramCollection, DiagramKey};
use crate::distance::{compute_distance_matrix, DistanceMatrix, DistanceSettings};
use crate::error::{TopoError, TopoResult};
use crate::traits::{Clock, SystemClock};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringSettings {
    pub clusters: usize,
    /// Soft deadline in seconds; `f64::INFINITY` disables it.
    pub time_budget_secs: f64,
    pub max_iterations: usize,
}

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            clusters: 5,
            time_budget_secs: 100.0,
            max_iterations: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterLabel {
    pub key: DiagramKey,
    pub cluster_id: usize,
    pub distance_to_exemplar: f64,
}

/// Representative diagram of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub cluster_id: usize,
    pub key: DiagramKey,
    pub members: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusteringRun {
    pub requested_clusters: usize,
    pub time_budget_secs: f64,
    pub elapsed_secs: f64,
    pub iterations: usize,
    pub converged: bool,
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub labels: Vec<ClusterLabel>,
    pub exemplars: Vec<Exemplar>,
    pub run: ClusteringRun,
    pub total_cost: f64,
}

impl ClusterAssignment {
    /// Assignment built outside the clusterer, e.g. from a stored table.
    /// Keys are taken as given; [`crate::fusion::fuse`] rejects duplicates.
    pub fn from_labels<I>(labels: I) -> Self
    where
        I: IntoIterator<Item = (DiagramKey, usize)>,
    {
        let labels: Vec<ClusterLabel> = labels
            .into_iter()
            .map(|(key, cluster_id)| ClusterLabel {
                key,
                cluster_id,
                distance_to_exemplar: 0.0,
            })
            .collect();
        let clusters = labels.iter().map(|l| l.cluster_id + 1).max().unwrap_or(0);
        Self {
            labels,
            exemplars: Vec::new(),
            run: ClusteringRun {
                requested_clusters: clusters,
                time_budget_secs: 0.0,
                elapsed_secs: 0.0,
                iterations: 0,
                converged: true,
                budget_exhausted: false,
            },
            total_cost: 0.0,
        }
    }

    pub fn empty() -> Self {
        Self::from_labels(std::iter::empty())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn cluster_of(&self, key: &DiagramKey) -> Option<usize> {
        self.labels
            .iter()
            .find(|label| &label.key == key)
            .map(|label| label.cluster_id)
    }

    pub fn members(&self, cluster_id: usize) -> impl Iterator<Item = &DiagramKey> {
        self.labels
            .iter()
            .filter(move |label| label.cluster_id == cluster_id)
            .map(|label| &label.key)
    }

    /// Distances to the exemplar grouped per cluster, for model selection.
    pub fn spread(&self) -> ClusterSpread {
        let clusters = self.run.requested_clusters;
        let mut per_cluster = vec![Vec::new(); clusters];
        for label in &self.labels {
            if label.cluster_id < clusters {
                per_cluster[label.cluster_id].push(label.distance_to_exemplar);
            }
        }
        ClusterSpread::new(per_cluster)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusteringProgress {
    pub iterations: usize,
    pub max_iterations: usize,
    pub total_cost: f64,
    pub reassigned: usize,
    pub converged: bool,
    pub elapsed_secs: f64,
    pub done: bool,
}

/// Stepped k-medoids runner. Each step is one full refinement iteration
/// (medoid update followed by reassignment).
pub struct ClusteringRunner<C: Clock = SystemClock> {
    distances: DistanceMatrix,
    settings: ClusteringSettings,
    clock: C,
    started_secs: f64,
    medoids: Vec<usize>,
    assignment: Vec<usize>,
    cost: f64,
    best: (f64, Vec<usize>, Vec<usize>),
    iterations: usize,
    reassigned: usize,
    converged: bool,
    budget_exhausted: bool,
}

impl ClusteringRunner<SystemClock> {
    pub fn new(distances: DistanceMatrix, settings: ClusteringSettings) -> TopoResult<Self> {
        Self::with_clock(distances, settings, SystemClock::new())
    }
}

impl<C: Clock> ClusteringRunner<C> {
    pub fn with_clock(
        distances: DistanceMatrix,
        settings: ClusteringSettings,
        clock: C,
    ) -> TopoResult<Self> {
        let n = distances.len();
        if n == 0 {
            return Err(TopoError::EmptyCollection {
                required: 1,
                found: 0,
            });
        }
        if settings.clusters < 1 || settings.clusters > n {
            return Err(TopoError::InvalidClusterCount {
                requested: settings.clusters,
                available: n,
            });
        }
        if settings.time_budget_secs.is_nan() || settings.time_budget_secs <= 0.0 {
            return Err(TopoError::InvalidSettings(format!(
                "time budget must be positive, got {}",
                settings.time_budget_secs
            )));
        }

        let started_secs = clock.now_secs();
        let medoids = farthest_point_seeds(&distances, settings.clusters);
        let (assignment, cost) = assign_to_medoids(&distances, &medoids);
        debug!(?medoids, cost, "k-medoids seeded");

        Ok(Self {
            best: (cost, medoids.clone(), assignment.clone()),
            distances,
            settings,
            clock,
            started_secs,
            medoids,
            assignment,
            cost,
            iterations: 0,
            reassigned: 0,
            converged: n == settings.clusters,
            budget_exhausted: false,
        })
    }

    fn elapsed_secs(&self) -> f64 {
        (self.clock.now_secs() - self.started_secs).max(0.0)
    }

    pub fn is_done(&self) -> bool {
        self.converged || self.budget_exhausted || self.iterations >= self.settings.max_iterations
    }

    /// Runs up to `batch_size` iterations, stopping early when done.
    pub fn run_steps(&mut self, batch_size: usize) -> ClusteringProgress {
        for _ in 0..batch_size {
            if self.is_done() {
                break;
            }
            self.step();
        }
        self.progress()
    }

    /// Runs until convergence, the iteration cap, or the time budget.
    pub fn run_to_completion(&mut self) -> ClusteringProgress {
        while !self.is_done() {
            self.step();
        }
        self.progress()
    }

    fn step(&mut self) {
        let medoids = update_medoids(&self.distances, &self.medoids, &self.assignment);
        let (assignment, cost) = assign_to_medoids(&self.distances, &medoids);
        let reassigned = assignment
            .iter()
            .zip(self.assignment.iter())
            .filter(|(a, b)| a != b)
            .count();

        self.converged = reassigned == 0 && medoids == self.medoids;
        self.medoids = medoids;
        self.assignment = assignment;
        self.cost = cost;
        self.reassigned = reassigned;
        self.iterations += 1;
        if cost <= self.best.0 {
            self.best = (cost, self.medoids.clone(), self.assignment.clone());
        }

        let elapsed = self.elapsed_secs();
        debug!(
            iteration = self.iterations,
            cost, reassigned, elapsed, "k-medoids iteration"
        );
        if !self.converged && elapsed >= self.settings.time_budget_secs {
            self.budget_exhausted = true;
            warn!(
                iterations = self.iterations,
                budget = self.settings.time_budget_secs,
                "clustering time budget exhausted before convergence"
            );
        }
    }

    pub fn progress(&self) -> ClusteringProgress {
        ClusteringProgress {
            iterations: self.iterations,
            max_iterations: self.settings.max_iterations,
            total_cost: self.cost,
            reassigned: self.reassigned,
            converged: self.converged,
            elapsed_secs: self.elapsed_secs(),
            done: self.is_done(),
        }
    }

    /// Consumes the runner, returning the lowest-cost assignment seen.
    pub fn take_result(self) -> ClusterAssignment {
        let elapsed_secs = self.elapsed_secs();
        let (total_cost, medoids, assignment) = self.best;
        let keys = self.distances.keys();

        let labels: Vec<ClusterLabel> = assignment
            .iter()
            .enumerate()
            .map(|(i, &cluster_id)| ClusterLabel {
                key: keys[i].clone(),
                cluster_id,
                distance_to_exemplar: self.distances.get(i, medoids[cluster_id]),
            })
            .collect();
        let exemplars: Vec<Exemplar> = medoids
            .iter()
            .enumerate()
            .map(|(cluster_id, &medoid)| Exemplar {
                cluster_id,
                key: keys[medoid].clone(),
                members: assignment.iter().filter(|&&c| c == cluster_id).count(),
            })
            .collect();

        info!(
            diagrams = labels.len(),
            clusters = medoids.len(),
            iterations = self.iterations,
            converged = self.converged,
            total_cost,
            "k-medoids clustering finished"
        );

        ClusterAssignment {
            labels,
            exemplars,
            run: ClusteringRun {
                requested_clusters: self.settings.clusters,
                time_budget_secs: self.settings.time_budget_secs,
                elapsed_secs,
                iterations: self.iterations,
                converged: self.converged,
                budget_exhausted: self.budget_exhausted,
            },
            total_cost,
        }
    }
}

/// Clusters the diagrams of a precomputed distance matrix.
pub fn cluster_distances(
    distances: &DistanceMatrix,
    settings: &ClusteringSettings,
) -> TopoResult<ClusterAssignment> {
    cluster_distances_with_clock(distances, settings, SystemClock::new())
}

pub fn cluster_distances_with_clock<C: Clock>(
    distances: &DistanceMatrix,
    settings: &ClusteringSettings,
    clock: C,
) -> TopoResult<ClusterAssignment> {
    let mut runner = ClusteringRunner::with_clock(distances.clone(), *settings, clock)?;
    runner.run_to_completion();
    Ok(runner.take_result())
}

/// Computes distances for `collection` and clusters them.
pub fn cluster_diagrams(
    collection: &DiagramCollection,
    distance_settings: &DistanceSettings,
    settings: &ClusteringSettings,
) -> TopoResult<ClusterAssignment> {
    if collection.is_empty() {
        return Err(TopoError::EmptyCollection {
            required: 1,
            found: 0,
        });
    }
    if settings.clusters < 1 || settings.clusters > collection.len() {
        return Err(TopoError::InvalidClusterCount {
            requested: settings.clusters,
            available: collection.len(),
        });
    }
    if collection.len() == 1 {
        let key = collection.keys().cloned().collect::<Vec<_>>();
        let single = DistanceMatrix::from_parts(key, nalgebra::DMatrix::zeros(1, 1))?;
        return cluster_distances(&single, settings);
    }
    let distances = compute_distance_matrix(collection, distance_settings)?;
    cluster_distances(&distances, settings)
}

/// First seed is the most central diagram; each further seed is the diagram
/// farthest from its nearest seed. Ties go to the lowest index.
fn farthest_point_seeds(distances: &DistanceMatrix, k: usize) -> Vec<usize> {
    let n = distances.len();
    let mut first = 0;
    let mut best_total = f64::INFINITY;
    for i in 0..n {
        let total: f64 = (0..n).map(|j| distances.get(i, j)).sum();
        if total < best_total {
            best_total = total;
            first = i;
        }
    }

    let mut medoids = vec![first];
    let mut is_medoid = vec![false; n];
    is_medoid[first] = true;
    let mut nearest: Vec<f64> = (0..n).map(|i| distances.get(i, first)).collect();

    while medoids.len() < k {
        let mut next = None;
        let mut farthest = f64::NEG_INFINITY;
        for i in 0..n {
            if !is_medoid[i] && nearest[i] > farthest {
                farthest = nearest[i];
                next = Some(i);
            }
        }
        let Some(next) = next else { break };
        medoids.push(next);
        is_medoid[next] = true;
        for i in 0..n {
            nearest[i] = nearest[i].min(distances.get(i, next));
        }
    }
    medoids
}

/// Nearest-medoid assignment. Medoids always own their cluster; ties go to
/// the lower cluster id. Returns labels and total distance.
fn assign_to_medoids(distances: &DistanceMatrix, medoids: &[usize]) -> (Vec<usize>, f64) {
    let n = distances.len();
    let mut owner = vec![None; n];
    for (cluster, &medoid) in medoids.iter().enumerate() {
        owner[medoid] = Some(cluster);
    }

    let nearest = |i: usize| -> (usize, f64) {
        if let Some(cluster) = owner[i] {
            return (cluster, 0.0);
        }
        let mut best = (0, distances.get(i, medoids[0]));
        for (cluster, &medoid) in medoids.iter().enumerate().skip(1) {
            let d = distances.get(i, medoid);
            if d < best.1 {
                best = (cluster, d);
            }
        }
        best
    };

    #[cfg(feature = "parallel")]
    let pairs: Vec<(usize, f64)> = (0..n).into_par_iter().map(nearest).collect();
    #[cfg(not(feature = "parallel"))]
    let pairs: Vec<(usize, f64)> = (0..n).map(nearest).collect();

    let cost = pairs.iter().map(|(_, d)| d).sum();
    (pairs.into_iter().map(|(c, _)| c).collect(), cost)
}

/// Moves each medoid to the member with the smallest total distance to its
/// cluster. The current medoid is kept unless strictly beaten.
fn update_medoids(distances: &DistanceMatrix, medoids: &[usize], assignment: &[usize]) -> Vec<usize> {
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); medoids.len()];
    for (i, &cluster) in assignment.iter().enumerate() {
        members[cluster].push(i);
    }

    medoids
        .iter()
        .zip(members.iter())
        .map(|(&current, group)| {
            let total = |candidate: usize| -> f64 {
                group.iter().map(|&j| distances.get(candidate, j)).sum()
            };
            let mut best = current;
            let mut best_total = total(current);
            for &candidate in group {
                let candidate_total = total(candidate);
                if candidate_total < best_total {
                    best = candidate;
                    best_total = candidate_total;
                }
            }
            best
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::PersistenceDiagram;
    use nalgebra::DMatrix;
    use std::cell::Cell;

    struct SteppingClock {
        now: Cell<f64>,
        step: f64,
    }

    impl Clock for SteppingClock {
        fn now_secs(&self) -> f64 {
            let now = self.now.get();
            self.now.set(now + self.step);
            now
        }
    }

    fn name(label: &str) -> DiagramKey {
        DiagramKey::new().with("Case", label)
    }

    fn line_matrix(positions: &[f64]) -> DistanceMatrix {
        let n = positions.len();
        let keys = (0..n)
            .map(|i| DiagramKey::new().with("TimeStep", i as i64))
            .collect();
        DistanceMatrix::from_parts(
            keys,
            DMatrix::from_fn(n, n, |i, j| (positions[i] - positions[j]).abs()),
        )
        .expect("matrix")
    }

    fn settings(clusters: usize) -> ClusteringSettings {
        ClusteringSettings {
            clusters,
            ..ClusteringSettings::default()
        }
    }

    #[test]
    fn scenario_separates_small_and_large_features() {
        let small = PersistenceDiagram::from(vec![(0.0, 1.0, 0)]);
        let large = PersistenceDiagram::from(vec![(0.0, 5.0, 0)]);
        let collection = DiagramCollection::from_pairs(vec![
            (name("A"), small.clone()),
            (name("B"), small.clone()),
            (name("C"), small),
            (name("D"), large.clone()),
            (name("E"), large),
        ])
        .expect("collection");

        let result = cluster_diagrams(&collection, &DistanceSettings::default(), &settings(2))
            .expect("clustering");
        let a = result.cluster_of(&name("A")).expect("A assigned");
        let d = result.cluster_of(&name("D")).expect("D assigned");
        assert_ne!(a, d);
        assert_eq!(result.cluster_of(&name("B")), Some(a));
        assert_eq!(result.cluster_of(&name("C")), Some(a));
        assert_eq!(result.cluster_of(&name("E")), Some(d));
        assert!(result.run.converged);
        assert_eq!(result.exemplars.len(), 2);
    }

    #[test]
    fn every_diagram_gets_one_valid_cluster_for_all_k() {
        let matrix = line_matrix(&[0.0, 0.1, 0.3, 4.0, 4.2, 9.0, 9.5, 9.6]);
        for k in 1..=matrix.len() {
            let result = cluster_distances(&matrix, &settings(k)).expect("clustering");
            assert_eq!(result.labels.len(), matrix.len());
            for label in &result.labels {
                assert!(label.cluster_id < k, "k={k} got id {}", label.cluster_id);
            }
            for exemplar in &result.exemplars {
                assert!(exemplar.members >= 1, "cluster {} is empty", exemplar.cluster_id);
                assert_eq!(result.cluster_of(&exemplar.key), Some(exemplar.cluster_id));
            }
        }
    }

    #[test]
    fn recovers_well_separated_groups() {
        let matrix = line_matrix(&[0.0, 0.1, 0.3, 4.0, 4.2, 9.0, 9.5, 9.6]);
        let result = cluster_distances(&matrix, &settings(3)).expect("clustering");
        let ids: Vec<usize> = result.labels.iter().map(|l| l.cluster_id).collect();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[1], ids[2]);
        assert_eq!(ids[3], ids[4]);
        assert_eq!(ids[5], ids[6]);
        assert_eq!(ids[6], ids[7]);
        assert_ne!(ids[0], ids[3]);
        assert_ne!(ids[3], ids[5]);
        assert_ne!(ids[0], ids[5]);
    }

    #[test]
    fn rejects_invalid_cluster_counts() {
        let matrix = line_matrix(&[0.0, 1.0, 2.0]);
        assert_eq!(
            cluster_distances(&matrix, &settings(0)).expect_err("k=0"),
            TopoError::InvalidClusterCount {
                requested: 0,
                available: 3
            }
        );
        assert_eq!(
            cluster_distances(&matrix, &settings(4)).expect_err("k>n"),
            TopoError::InvalidClusterCount {
                requested: 4,
                available: 3
            }
        );
    }

    #[test]
    fn rejects_non_positive_budget() {
        let matrix = line_matrix(&[0.0, 1.0, 2.0]);
        let bad = ClusteringSettings {
            clusters: 2,
            time_budget_secs: 0.0,
            max_iterations: 10,
        };
        assert!(matches!(
            cluster_distances(&matrix, &bad),
            Err(TopoError::InvalidSettings(_))
        ));
    }

    #[test]
    fn results_are_deterministic() {
        let matrix = line_matrix(&[3.0, 0.5, 7.0, 0.0, 6.5, 3.2, 9.9]);
        let first = cluster_distances(&matrix, &settings(3)).expect("first");
        let second = cluster_distances(&matrix, &settings(3)).expect("second");
        assert_eq!(first.labels, second.labels);
        assert_eq!(first.exemplars, second.exemplars);
    }

    #[test]
    fn time_budget_stops_after_one_iteration() {
        // Non-central seeding needs several refinements on this layout.
        let matrix = line_matrix(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 20.0]);
        let clock = SteppingClock {
            now: Cell::new(0.0),
            step: 10.0,
        };
        let budget = ClusteringSettings {
            clusters: 3,
            time_budget_secs: 1.0,
            max_iterations: 100,
        };
        let mut runner = ClusteringRunner::with_clock(matrix.clone(), budget, &clock)
            .expect("runner");
        runner.run_to_completion();
        let result = runner.take_result();
        assert!(result.run.iterations <= 1);
        assert_eq!(result.labels.len(), matrix.len());
        assert!(result.labels.iter().all(|l| l.cluster_id < 3));
        if !result.run.converged {
            assert!(result.run.budget_exhausted);
        }
    }

    #[test]
    fn stepped_runner_matches_batch_result() {
        let matrix = line_matrix(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 20.0]);
        let batch = cluster_distances(&matrix, &settings(3)).expect("batch");

        let mut runner = ClusteringRunner::new(matrix, settings(3)).expect("runner");
        let mut guard = 0;
        while !runner.is_done() {
            let progress = runner.run_steps(1);
            assert!(progress.iterations > guard || progress.done);
            guard = progress.iterations;
        }
        let stepped = runner.take_result();
        assert_eq!(stepped.labels, batch.labels);
        assert_eq!(stepped.run.iterations, batch.run.iterations);
    }

    #[test]
    fn spread_groups_distances_by_cluster() {
        let matrix = line_matrix(&[0.0, 1.0, 10.0, 12.0]);
        let result = cluster_distances(&matrix, &settings(2)).expect("clustering");
        let spread = result.spread();
        assert_eq!(spread.cluster_count(), 2);
        assert_eq!(spread.point_count(), 4);
        assert!((result.total_cost - 3.0).abs() < 1e-12);
    }

    #[test]
    fn from_labels_builds_external_assignment() {
        let assignment = ClusterAssignment::from_labels(vec![(name("A"), 0), (name("B"), 2)]);
        assert_eq!(assignment.len(), 2);
        assert_eq!(assignment.run.requested_clusters, 3);
        assert_eq!(assignment.cluster_of(&name("B")), Some(2));
        assert!(ClusterAssignment::empty().is_empty());
    }
}
