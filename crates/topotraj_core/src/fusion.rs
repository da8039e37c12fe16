//! Left outer join of cluster labels onto embedded diagrams.

use crate::clustering::ClusterAssignment;
use crate::diagram::DiagramKey;
use crate::error::{TopoError, TopoResult};
use crate::reduction::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Cluster id of a diagram that took no part in clustering.
pub const UNCLUSTERED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedRecord {
    pub key: DiagramKey,
    pub coordinates: Vec<f64>,
    pub cluster_id: i64,
}

impl FusedRecord {
    pub fn is_clustered(&self) -> bool {
        self.cluster_id != UNCLUSTERED
    }
}

/// One record per embedded diagram, in embedding order. Diagrams missing
/// from `assignment` get [`UNCLUSTERED`].
pub fn fuse(embedding: &Embedding, assignment: &ClusterAssignment) -> TopoResult<Vec<FusedRecord>> {
    join(embedding, assignment, |key| key.clone()).map(|joined| joined.records)
}

/// Like [`fuse`], but matches keys on the listed fields only.
pub fn fuse_on<S: AsRef<str>>(
    embedding: &Embedding,
    assignment: &ClusterAssignment,
    fields: &[S],
) -> TopoResult<Vec<FusedRecord>> {
    join(embedding, assignment, |key| key.project(fields)).map(|joined| joined.records)
}

struct Joined {
    records: Vec<FusedRecord>,
    /// Assignment labels that matched no embedded diagram.
    ignored: usize,
}

fn join<P>(embedding: &Embedding, assignment: &ClusterAssignment, join_key: P) -> TopoResult<Joined>
where
    P: Fn(&DiagramKey) -> DiagramKey,
{
    let mut labels: HashMap<DiagramKey, i64> = HashMap::with_capacity(assignment.len());
    for label in &assignment.labels {
        let key = join_key(&label.key);
        if labels.insert(key, label.cluster_id as i64).is_some() {
            return Err(TopoError::DuplicateKey(label.key.to_string()));
        }
    }

    // Several rows may share one projected key; count labels, not rows.
    let mut matched: HashSet<DiagramKey> = HashSet::with_capacity(labels.len());
    let records: Vec<FusedRecord> = embedding
        .iter()
        .map(|(key, coordinates)| {
            let projected = join_key(key);
            let cluster_id = match labels.get(&projected) {
                Some(&id) => {
                    matched.insert(projected);
                    id
                }
                None => UNCLUSTERED,
            };
            FusedRecord {
                key: key.clone(),
                coordinates: coordinates.to_vec(),
                cluster_id,
            }
        })
        .collect();

    let ignored = labels.len() - matched.len();
    if ignored > 0 {
        debug!(ignored, "assignment keys missing from embedding were ignored");
    }
    info!(
        records = records.len(),
        clustered = records.iter().filter(|r| r.is_clustered()).count(),
        "cluster labels fused onto embedding"
    );
    Ok(Joined { records, ignored })
}
