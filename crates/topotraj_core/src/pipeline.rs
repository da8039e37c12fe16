//! End-to-end run: distances, embedding, clustering, fusion, mesh.

use crate::clustering::{cluster_distances_with_clock, ClusterAssignment, ClusteringSettings};
use crate::diagram::DiagramCollection;
use crate::distance::{compute_distance_matrix, DistanceMatrix, DistanceSettings};
use crate::error::TopoError;
use crate::fusion::{fuse, fuse_on, FusedRecord};
use crate::mesh::{build_trajectory_mesh, TrajectoryMesh};
use crate::reduction::{classical_mds, Embedding, ReductionSettings};
use crate::traits::{Clock, DiagramFilter, SystemClock};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub distance: DistanceSettings,
    pub reduction: ReductionSettings,
    pub clustering: ClusteringSettings,
    /// Key fields to join cluster labels on; the full key when `None`.
    pub join_fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Validation,
    Distance,
    Reduction,
    Clustering,
    Fusion,
    Mesh,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Validation => "validation",
            PipelineStage::Distance => "distance",
            PipelineStage::Reduction => "reduction",
            PipelineStage::Clustering => "clustering",
            PipelineStage::Fusion => "fusion",
            PipelineStage::Mesh => "mesh",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: PipelineStage,
    #[source]
    pub source: TopoError,
}

trait AtStage<T> {
    fn at(self, stage: PipelineStage) -> Result<T, PipelineError>;
}

impl<T> AtStage<T> for Result<T, TopoError> {
    fn at(self, stage: PipelineStage) -> Result<T, PipelineError> {
        self.map_err(|source| PipelineError { stage, source })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub distances: DistanceMatrix,
    pub embedding: Embedding,
    pub assignment: ClusterAssignment,
    pub records: Vec<FusedRecord>,
    pub mesh: TrajectoryMesh,
}

/// Runs every stage on `collection`. Only diagrams accepted by `subset`
/// are clustered; all of them are embedded and meshed.
pub fn run_pipeline(
    collection: &DiagramCollection,
    subset: Option<&dyn DiagramFilter>,
    settings: &PipelineSettings,
) -> Result<PipelineOutput, PipelineError> {
    run_pipeline_with_clock(collection, subset, settings, SystemClock::new())
}

pub fn run_pipeline_with_clock<C: Clock>(
    collection: &DiagramCollection,
    subset: Option<&dyn DiagramFilter>,
    settings: &PipelineSettings,
    clock: C,
) -> Result<PipelineOutput, PipelineError> {
    if collection.is_empty() {
        return Err(TopoError::EmptyCollection {
            required: 2,
            found: 0,
        })
        .at(PipelineStage::Validation);
    }
    if let Some(fields) = &settings.join_fields {
        if fields.is_empty() {
            return Err(TopoError::InvalidSettings(
                "join fields must not be empty".to_string(),
            ))
            .at(PipelineStage::Validation);
        }
    }

    let started = clock.now_secs();
    let distances =
        compute_distance_matrix(collection, &settings.distance).at(PipelineStage::Distance)?;
    let mut mark = clock.now_secs();
    info!(
        stage = %PipelineStage::Distance,
        diagrams = distances.len(),
        elapsed_secs = mark - started,
        "stage complete"
    );

    let embedding = classical_mds(&distances, &settings.reduction).at(PipelineStage::Reduction)?;
    info!(
        stage = %PipelineStage::Reduction,
        components = embedding.dimension(),
        elapsed_secs = clock.now_secs() - mark,
        "stage complete"
    );
    mark = clock.now_secs();

    let clustered = match subset {
        Some(filter) => distances.subset(filter).at(PipelineStage::Clustering)?,
        None => distances.clone(),
    };
    let assignment = if clustered.is_empty() {
        warn!("clustering subset is empty; every diagram is left unclustered");
        ClusterAssignment::empty()
    } else {
        cluster_distances_with_clock(&clustered, &settings.clustering, &clock)
            .at(PipelineStage::Clustering)?
    };
    info!(
        stage = %PipelineStage::Clustering,
        clustered = assignment.len(),
        iterations = assignment.run.iterations,
        elapsed_secs = clock.now_secs() - mark,
        "stage complete"
    );
    mark = clock.now_secs();

    let records = match &settings.join_fields {
        Some(fields) => fuse_on(&embedding, &assignment, fields.as_slice()),
        None => fuse(&embedding, &assignment),
    }
    .at(PipelineStage::Fusion)?;

    let mesh = build_trajectory_mesh(&records).at(PipelineStage::Mesh)?;
    info!(
        stage = %PipelineStage::Mesh,
        points = mesh.point_count(),
        cells = mesh.cell_count(),
        warnings = mesh.warnings.len(),
        elapsed_secs = clock.now_secs() - mark,
        "stage complete"
    );
    info!(total_secs = clock.now_secs() - started, "pipeline complete");

    Ok(PipelineOutput {
        distances,
        embedding,
        assignment,
        records,
        mesh,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{DiagramKey, FieldFilter, PersistenceDiagram};
    use crate::fusion::UNCLUSTERED;

    /// Diagrams whose distances are Euclidean in `(a, b, c)`.
    fn collection(values: &[(f64, f64, f64)]) -> DiagramCollection {
        DiagramCollection::from_pairs(values.iter().enumerate().map(|(i, &(a, b, c))| {
            (
                DiagramKey::new()
                    .with("TimeStep", i as i64)
                    .with("Field", if i % 2 == 0 { "mag(B)" } else { "rho" }),
                PersistenceDiagram::from(vec![(0.0, a, 0), (0.0, b, 1), (0.0, c, 2)]),
            )
        }))
        .expect("collection")
    }

    fn sample() -> DiagramCollection {
        collection(&[
            (10.0, 10.0, 10.0),
            (11.0, 10.0, 10.0),
            (10.0, 11.5, 10.0),
            (10.0, 10.0, 12.0),
            (11.0, 11.0, 11.0),
            (10.5, 10.2, 10.7),
        ])
    }

    fn settings(clusters: usize) -> PipelineSettings {
        PipelineSettings {
            clustering: ClusteringSettings {
                clusters,
                ..ClusteringSettings::default()
            },
            ..PipelineSettings::default()
        }
    }

    #[test]
    fn runs_every_stage_on_full_collection() {
        let collection = sample();
        let output = run_pipeline(&collection, None, &settings(2)).expect("pipeline");
        assert_eq!(output.distances.len(), 6);
        assert_eq!(output.embedding.len(), 6);
        assert_eq!(output.embedding.dimension(), 3);
        assert_eq!(output.records.len(), 6);
        assert!(output.records.iter().all(|r| r.cluster_id == 0 || r.cluster_id == 1));
        assert_eq!(output.mesh.point_count(), 6);
        assert!(output.mesh.cell_count() > 0);
        assert_eq!(output.mesh.cluster_ids.len(), 6);
    }

    #[test]
    fn subset_leaves_other_diagrams_unclustered() {
        let collection = sample();
        let filter = FieldFilter::equals("Field", "mag(B)");
        let output = run_pipeline(&collection, Some(&filter), &settings(2)).expect("pipeline");
        assert_eq!(output.assignment.len(), 3);
        assert_eq!(output.records.len(), 6);
        for record in &output.records {
            let clustered = record.key.get("Field").and_then(|v| v.as_str()) == Some("mag(B)");
            assert_eq!(record.cluster_id != UNCLUSTERED, clustered);
        }
    }

    #[test]
    fn empty_subset_clusters_nothing() {
        let collection = sample();
        let filter = |_: &DiagramKey| false;
        let output = run_pipeline(&collection, Some(&filter), &settings(2)).expect("pipeline");
        assert!(output.assignment.is_empty());
        assert!(output.records.iter().all(|r| r.cluster_id == UNCLUSTERED));
    }

    #[test]
    fn rank_deficient_collection_fails_at_reduction() {
        let diagrams = ["A", "B", "C", "D", "E"].map(|name| {
            let death = if name < "D" { 1.0 } else { 5.0 };
            (
                DiagramKey::new().with("Run", name),
                PersistenceDiagram::from(vec![(0.0, death, 0)]),
            )
        });
        let collection = DiagramCollection::from_pairs(diagrams).expect("collection");
        let err = run_pipeline(&collection, None, &settings(2)).expect_err("rank");
        assert_eq!(err.stage, PipelineStage::Reduction);
        assert!(matches!(err.source, TopoError::InsufficientRank { .. }));
    }

    #[test]
    fn cluster_count_errors_name_the_clustering_stage() {
        let collection = sample();
        let filter = FieldFilter::equals("Field", "rho");
        let err = run_pipeline(&collection, Some(&filter), &settings(4)).expect_err("clusters");
        assert_eq!(err.stage, PipelineStage::Clustering);
        assert_eq!(
            err.source,
            TopoError::InvalidClusterCount {
                requested: 4,
                available: 3
            }
        );
        assert!(err.to_string().starts_with("clustering stage failed"));
    }

    #[test]
    fn empty_collection_fails_validation() {
        let collection = DiagramCollection::new(Vec::new()).expect("collection");
        let err = run_pipeline(&collection, None, &settings(1)).expect_err("empty");
        assert_eq!(err.stage, PipelineStage::Validation);
    }

    #[test]
    fn join_fields_select_projected_join() {
        let collection = sample();
        let mut settings = settings(1);
        settings.join_fields = Some(vec!["TimeStep".to_string()]);
        let output = run_pipeline(&collection, None, &settings).expect("pipeline");
        assert!(output.records.iter().all(|r| r.cluster_id == 0));

        settings.join_fields = Some(Vec::new());
        let err = run_pipeline(&collection, None, &settings).expect_err("empty fields");
        assert_eq!(err.stage, PipelineStage::Validation);
    }
}
