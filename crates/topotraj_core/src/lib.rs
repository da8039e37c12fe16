//! The `topotraj_core` crate turns a keyed collection of persistence diagrams
//! into a clustered, meshed trajectory through diagram space.
//!
//! Key components:
//! - **Diagrams**: `PersistenceDiagram`, typed `DiagramKey`s and relational `FieldFilter`s.
//! - **Distance**: Wasserstein distances between diagrams, collected into a `DistanceMatrix`.
//! - **Reduction**: classical multidimensional scaling of the matrix.
//! - **Clustering**: budgeted k-medoids, stepped through `ClusteringRunner`.
//! - **Criteria**: likelihoods and AIC/AICc/BIC for choosing the cluster count.
//! - **Fusion** and **Mesh**: label join onto the embedding and a tetrahedral mesh over it.

pub mod clustering;
pub mod criteria;
pub mod diagram;
pub mod distance;
pub mod error;
pub mod fusion;
pub mod mesh;
pub mod pipeline;
pub mod reduction;
pub mod traits;

pub use error::{TopoError, TopoResult};
