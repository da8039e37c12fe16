//! Tetrahedral mesh over the fused embedding points.
//!
//! Points are normalized, coincident points merged, and the affine rank of
//! what remains decides the triangulation: a 3-D Delaunay tetrahedralization,
//! a planar Delaunay triangulation promoted to flat tetrahedra, or a chain of
//! segments. Degenerate input never fails the build; it is reported through
//! [`MeshWarning`] instead.

use crate::diagram::KeyValue;
use crate::error::{TopoError, TopoResult};
use crate::fusion::FusedRecord;
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{info, warn};

/// Coincidence radius in normalized coordinates.
const MERGE_TOLERANCE: f64 = 1e-9;
/// Singular values below this fraction of the largest are treated as zero.
const RANK_TOLERANCE: f64 = 1e-7;
/// Simplices whose normalized volume is below this are reported as slivers.
const SLIVER_TOLERANCE: f64 = 1e-12;
/// Half-width of the enclosing super simplex, in normalized units.
const SUPER_EXTENT: f64 = 1.0e3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeshWarning {
    /// Points closer than the merge tolerance share one triangulation vertex.
    CoincidentPoints { merged: usize },
    /// Fewer than two distinct points: no cells at all.
    TooFewPoints { unique: usize },
    Collinear { unique: usize },
    Coplanar { unique: usize },
    /// Cells with (near) zero volume in the output.
    DegenerateCells { count: usize },
    /// Points the triangulator could not insert.
    SkippedPoints { count: usize },
}

impl fmt::Display for MeshWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshWarning::CoincidentPoints { merged } => {
                write!(f, "{merged} coincident point(s) merged")
            }
            MeshWarning::TooFewPoints { unique } => {
                write!(f, "only {unique} distinct point(s); mesh has no cells")
            }
            MeshWarning::Collinear { unique } => {
                write!(f, "{unique} distinct points are collinear; cells are segments")
            }
            MeshWarning::Coplanar { unique } => {
                write!(f, "{unique} distinct points are coplanar; cells are triangles")
            }
            MeshWarning::DegenerateCells { count } => {
                write!(f, "{count} cell(s) have near-zero volume")
            }
            MeshWarning::SkippedPoints { count } => {
                write!(f, "{count} point(s) could not be inserted")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryMesh {
    /// One position per fused record, in record order.
    pub points: Vec<[f64; 3]>,
    /// Vertex indices into `points`. Flat cells repeat their last vertex.
    pub cells: Vec<[u32; 4]>,
    pub cluster_ids: Vec<i64>,
    /// One column per key field; `None` where a record lacks the field.
    pub attributes: BTreeMap<String, Vec<Option<KeyValue>>>,
    #[serde(default)]
    pub warnings: Vec<MeshWarning>,
}

impl TrajectoryMesh {
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Unsigned volume of cell `index`, in the units of `points`.
    pub fn cell_volume(&self, index: usize) -> Option<f64> {
        let cell = self.cells.get(index)?;
        let corner = |i: usize| Vector3::from(self.points[cell[i] as usize]);
        let a = corner(0);
        let edges = Matrix3::from_columns(&[corner(1) - a, corner(2) - a, corner(3) - a]);
        Some(edges.determinant().abs() / 6.0)
    }

    pub fn total_volume(&self) -> f64 {
        (0..self.cells.len())
            .filter_map(|i| self.cell_volume(i))
            .sum()
    }
}

/// Builds the mesh for `records`, one point per record.
pub fn build_trajectory_mesh(records: &[FusedRecord]) -> TopoResult<TrajectoryMesh> {
    if u32::try_from(records.len()).is_err() {
        return Err(TopoError::InvalidSettings(format!(
            "{} records exceed the mesh index range",
            records.len()
        )));
    }
    let mut points = Vec::with_capacity(records.len());
    for record in records {
        if let Some(bad) = record.coordinates.iter().find(|v| !v.is_finite()) {
            return Err(TopoError::InvalidSettings(format!(
                "non-finite coordinate {bad} for {}",
                record.key
            )));
        }
        let mut position = [0.0; 3];
        for (slot, value) in position.iter_mut().zip(record.coordinates.iter()) {
            *slot = *value;
        }
        points.push(position);
    }

    let mut warnings = Vec::new();
    let normalized = normalize(&points);
    let unique = merge_coincident(&normalized);
    if unique.len() < points.len() {
        warnings.push(MeshWarning::CoincidentPoints {
            merged: points.len() - unique.len(),
        });
    }
    let unique_points: Vec<Vector3<f64>> = unique.iter().map(|&i| normalized[i]).collect();
    let (rank, axes) = affine_rank(&unique_points);

    let local_cells: Vec<[usize; 4]> = match rank {
        3 => {
            let coords: Vec<Vec<f64>> = unique_points
                .iter()
                .map(|p| vec![p.x, p.y, p.z])
                .collect();
            let triangulation = delaunay(&coords, 3);
            if triangulation.skipped > 0 {
                warnings.push(MeshWarning::SkippedPoints {
                    count: triangulation.skipped,
                });
            }
            triangulation
                .cells
                .iter()
                .map(|cell| {
                    orient_tetrahedron(&unique_points, [cell[0], cell[1], cell[2], cell[3]])
                })
                .collect()
        }
        2 => {
            warnings.push(MeshWarning::Coplanar {
                unique: unique.len(),
            });
            let projected = project(&unique_points, &axes[..2]);
            let triangulation = delaunay(&projected, 2);
            if triangulation.skipped > 0 {
                warnings.push(MeshWarning::SkippedPoints {
                    count: triangulation.skipped,
                });
            }
            triangulation
                .cells
                .iter()
                .map(|cell| {
                    let [a, b, c] = orient_triangle(&projected, [cell[0], cell[1], cell[2]]);
                    [a, b, c, c]
                })
                .collect()
        }
        1 => {
            warnings.push(MeshWarning::Collinear {
                unique: unique.len(),
            });
            let projected = project(&unique_points, &axes[..1]);
            let mut order: Vec<usize> = (0..unique.len()).collect();
            order.sort_by(|&a, &b| projected[a][0].total_cmp(&projected[b][0]));
            order.windows(2).map(|w| [w[0], w[1], w[1], w[1]]).collect()
        }
        _ => {
            warnings.push(MeshWarning::TooFewPoints {
                unique: unique.len(),
            });
            Vec::new()
        }
    };

    let slivers = if rank == 3 {
        local_cells
            .iter()
            .filter(|cell| signed_volume(&unique_points, **cell).abs() < SLIVER_TOLERANCE)
            .count()
    } else {
        local_cells.len()
    };
    if slivers > 0 {
        warnings.push(MeshWarning::DegenerateCells { count: slivers });
    }

    // Indices fit in u32: checked against the record count above.
    let cells: Vec<[u32; 4]> = local_cells
        .iter()
        .map(|cell| cell.map(|v| unique[v] as u32))
        .collect();

    for warning in &warnings {
        warn!(%warning, "trajectory mesh degeneracy");
    }
    info!(
        points = points.len(),
        unique = unique.len(),
        rank,
        cells = cells.len(),
        "trajectory mesh built"
    );

    Ok(TrajectoryMesh {
        points,
        cells,
        cluster_ids: records.iter().map(|r| r.cluster_id).collect(),
        attributes: attribute_columns(records),
        warnings,
    })
}

fn attribute_columns(records: &[FusedRecord]) -> BTreeMap<String, Vec<Option<KeyValue>>> {
    let names: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.key.fields().map(|(name, _)| name))
        .collect();
    names
        .into_iter()
        .map(|name| {
            let column = records.iter().map(|r| r.key.get(name).cloned()).collect();
            (name.to_string(), column)
        })
        .collect()
}

/// Centers on the centroid and scales the largest coordinate offset to 1.
fn normalize(points: &[[f64; 3]]) -> Vec<Vector3<f64>> {
    if points.is_empty() {
        return Vec::new();
    }
    let vectors: Vec<Vector3<f64>> = points.iter().map(|p| Vector3::from(*p)).collect();
    let centroid = vectors.iter().sum::<Vector3<f64>>() / vectors.len() as f64;
    let extent = vectors
        .iter()
        .map(|v| (v - centroid).amax())
        .fold(0.0_f64, f64::max);
    let scale = if extent > f64::EPSILON { 1.0 / extent } else { 1.0 };
    vectors.iter().map(|v| (v - centroid) * scale).collect()
}

/// Indices of the first point of every coincidence class, in order.
fn merge_coincident(points: &[Vector3<f64>]) -> Vec<usize> {
    let mut unique: Vec<usize> = Vec::new();
    for (i, p) in points.iter().enumerate() {
        if !unique
            .iter()
            .any(|&u| (points[u] - p).norm() <= MERGE_TOLERANCE)
        {
            unique.push(i);
        }
    }
    unique
}

/// Affine rank of `points` and their principal axes, strongest first.
fn affine_rank(points: &[Vector3<f64>]) -> (usize, Vec<Vector3<f64>>) {
    if points.len() < 2 {
        return (0, Vec::new());
    }
    let centroid = points.iter().sum::<Vector3<f64>>() / points.len() as f64;
    let centered = DMatrix::from_fn(points.len(), 3, |i, k| points[i][k] - centroid[k]);
    let svd = centered.svd(false, true);
    let Some(v_t) = svd.v_t else {
        return (0, Vec::new());
    };
    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));

    let largest = order.first().map_or(0.0, |&i| svd.singular_values[i]);
    if largest <= f64::EPSILON {
        return (0, Vec::new());
    }
    let rank = order
        .iter()
        .filter(|&&i| svd.singular_values[i] > RANK_TOLERANCE * largest)
        .count();
    let axes = order
        .iter()
        .map(|&i| Vector3::new(v_t[(i, 0)], v_t[(i, 1)], v_t[(i, 2)]))
        .collect();
    (rank, axes)
}

fn project(points: &[Vector3<f64>], axes: &[Vector3<f64>]) -> Vec<Vec<f64>> {
    let centroid = points.iter().sum::<Vector3<f64>>() / points.len().max(1) as f64;
    points
        .iter()
        .map(|p| axes.iter().map(|axis| (p - centroid).dot(axis)).collect())
        .collect()
}

fn signed_volume(points: &[Vector3<f64>], cell: [usize; 4]) -> f64 {
    let a = points[cell[0]];
    Matrix3::from_columns(&[points[cell[1]] - a, points[cell[2]] - a, points[cell[3]] - a])
        .determinant()
        / 6.0
}

fn orient_tetrahedron(points: &[Vector3<f64>], cell: [usize; 4]) -> [usize; 4] {
    if signed_volume(points, cell) < 0.0 {
        [cell[0], cell[1], cell[3], cell[2]]
    } else {
        cell
    }
}

fn orient_triangle(points: &[Vec<f64>], cell: [usize; 3]) -> [usize; 3] {
    let [a, b, c] = cell.map(|i| &points[i]);
    let cross = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
    if cross < 0.0 {
        [cell[0], cell[2], cell[1]]
    } else {
        cell
    }
}

struct Simplex {
    vertices: Vec<usize>,
    center: Vec<f64>,
    radius_sq: f64,
}

impl Simplex {
    fn new(points: &[Vec<f64>], vertices: Vec<usize>) -> Self {
        match circumsphere(points, &vertices) {
            Some((center, radius_sq)) => Self {
                vertices,
                center,
                radius_sq,
            },
            // A flat simplex is claimed by the next insertion.
            None => Self {
                center: points[vertices[0]].clone(),
                vertices,
                radius_sq: f64::INFINITY,
            },
        }
    }

    fn contains_in_sphere(&self, point: &[f64]) -> bool {
        let dist_sq: f64 = self
            .center
            .iter()
            .zip(point)
            .map(|(c, p)| (c - p) * (c - p))
            .sum();
        dist_sq < self.radius_sq
    }
}

fn circumsphere(points: &[Vec<f64>], vertices: &[usize]) -> Option<(Vec<f64>, f64)> {
    let dim = vertices.len() - 1;
    let origin = &points[vertices[0]];
    let mut edges = DMatrix::zeros(dim, dim);
    let mut rhs = DVector::zeros(dim);
    let mut scale = 1.0;
    for (row, &v) in vertices[1..].iter().enumerate() {
        let mut norm_sq = 0.0;
        for k in 0..dim {
            let d = points[v][k] - origin[k];
            edges[(row, k)] = d;
            norm_sq += d * d;
        }
        rhs[row] = 0.5 * norm_sq;
        scale *= norm_sq.sqrt();
    }
    let lu = edges.lu();
    if lu.determinant().abs() <= SLIVER_TOLERANCE * scale {
        return None;
    }
    let offset = lu.solve(&rhs)?;
    if !offset.iter().all(|v| v.is_finite()) {
        return None;
    }
    let center: Vec<f64> = origin.iter().zip(offset.iter()).map(|(o, d)| o + d).collect();
    Some((center, offset.norm_squared()))
}

struct Triangulation {
    cells: Vec<Vec<usize>>,
    skipped: usize,
}

/// Bowyer-Watson Delaunay triangulation of `points` in `dim` dimensions.
/// Points must already be normalized to roughly unit extent.
fn delaunay(points: &[Vec<f64>], dim: usize) -> Triangulation {
    let n = points.len();
    let mut all = points.to_vec();
    // Corner simplex {x_k >= -E, sum x_k <= E} encloses the unit cube.
    all.push(vec![-SUPER_EXTENT; dim]);
    for axis in 0..dim {
        let mut vertex = vec![-SUPER_EXTENT; dim];
        vertex[axis] = SUPER_EXTENT * dim as f64;
        all.push(vertex);
    }

    let mut simplices = vec![Simplex::new(&all, (n..n + dim + 1).collect())];
    let mut skipped = 0;

    for p in 0..n {
        let point = &all[p];
        let bad: Vec<bool> = simplices.iter().map(|s| s.contains_in_sphere(point)).collect();
        if !bad.iter().any(|&b| b) {
            skipped += 1;
            continue;
        }

        let mut face_count: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut faces: Vec<Vec<usize>> = Vec::new();
        for simplex in simplices
            .iter()
            .zip(&bad)
            .filter(|(_, flag)| **flag)
            .map(|(s, _)| s)
        {
            for skip in 0..simplex.vertices.len() {
                let mut face: Vec<usize> = simplex
                    .vertices
                    .iter()
                    .enumerate()
                    .filter(|&(i, _)| i != skip)
                    .map(|(_, &v)| v)
                    .collect();
                face.sort_unstable();
                let count = face_count.entry(face.clone()).or_insert(0);
                if *count == 0 {
                    faces.push(face);
                }
                *count += 1;
            }
        }

        let mut flags = bad.iter();
        simplices.retain(|_| !flags.next().copied().unwrap_or(false));
        for face in faces {
            if face_count.get(&face) == Some(&1) {
                let mut vertices = face;
                vertices.push(p);
                simplices.push(Simplex::new(&all, vertices));
            }
        }
    }

    Triangulation {
        cells: simplices
            .into_iter()
            .filter(|s| s.vertices.iter().all(|&v| v < n))
            .map(|s| s.vertices)
            .collect(),
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::DiagramKey;
    use crate::fusion::UNCLUSTERED;

    fn records(points: &[[f64; 3]]) -> Vec<FusedRecord> {
        points
            .iter()
            .enumerate()
            .map(|(i, p)| FusedRecord {
                key: DiagramKey::new().with("TimeStep", i as i64),
                coordinates: p.to_vec(),
                cluster_id: if i % 2 == 0 { 0 } else { UNCLUSTERED },
            })
            .collect()
    }

    fn assert_cells_within(mesh: &TrajectoryMesh) {
        for cell in &mesh.cells {
            assert!(cell.iter().all(|&v| (v as usize) < mesh.points.len()));
        }
    }

    #[test]
    fn single_tetrahedron() {
        let mesh = build_trajectory_mesh(&records(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ]))
        .expect("mesh");
        assert_eq!(mesh.cell_count(), 1);
        assert!(mesh.warnings.is_empty());
        let volume = mesh.cell_volume(0).expect("volume");
        assert!((volume - 1.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn interior_point_splits_tetrahedron() {
        let mesh = build_trajectory_mesh(&records(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.2, 0.2, 0.2],
        ]))
        .expect("mesh");
        assert_eq!(mesh.cell_count(), 4);
        assert!((mesh.total_volume() - 1.0 / 6.0).abs() < 1e-12);
        assert!(mesh.cells.iter().all(|cell| cell.contains(&4)));
        assert_cells_within(&mesh);
    }

    #[test]
    fn point_cloud_satisfies_empty_sphere_property() {
        // Deterministic scatter from a linear congruential sequence.
        let mut state: u64 = 12345;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        let cloud: Vec<[f64; 3]> = (0..40).map(|_| [next(), next(), next()]).collect();
        let mesh = build_trajectory_mesh(&records(&cloud)).expect("mesh");
        assert!(mesh.cell_count() >= 40);
        assert_cells_within(&mesh);

        let coords: Vec<Vec<f64>> = mesh.points.iter().map(|p| p.to_vec()).collect();
        for cell in &mesh.cells {
            let vertices: Vec<usize> = cell.iter().map(|&v| v as usize).collect();
            let (center, radius_sq) = circumsphere(&coords, &vertices).expect("sphere");
            for (i, point) in coords.iter().enumerate() {
                if vertices.contains(&i) {
                    continue;
                }
                let dist_sq: f64 = center.iter().zip(point).map(|(c, p)| (c - p).powi(2)).sum();
                assert!(dist_sq >= radius_sq * (1.0 - 1e-9), "point {i} inside cell {cell:?}");
            }
        }
        for i in 0..mesh.cell_count() {
            assert!(mesh.cell_volume(i).expect("volume") > 0.0);
        }
        let used: BTreeSet<u32> = mesh.cells.iter().flatten().copied().collect();
        assert_eq!(used.len(), cloud.len());
    }

    #[test]
    fn keeps_cluster_ids_and_key_fields() {
        let mut input = records(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ]);
        input[3].key.insert("Case", "b");
        let mesh = build_trajectory_mesh(&input).expect("mesh");
        assert_eq!(mesh.cluster_ids, vec![0, UNCLUSTERED, 0, UNCLUSTERED]);
        let time_steps = &mesh.attributes["TimeStep"];
        assert_eq!(time_steps[2], Some(KeyValue::Integer(2)));
        let case = &mesh.attributes["Case"];
        assert_eq!(case[..3], [None, None, None]);
        assert_eq!(case[3], Some(KeyValue::Text("b".to_string())));
    }

    #[test]
    fn two_dimensional_embedding_is_zero_padded() {
        let input: Vec<FusedRecord> = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.1], [0.4, 0.6]]
            .iter()
            .enumerate()
            .map(|(i, p)| FusedRecord {
                key: DiagramKey::new().with("TimeStep", i as i64),
                coordinates: p.to_vec(),
                cluster_id: 0,
            })
            .collect();
        let mesh = build_trajectory_mesh(&input).expect("mesh");
        assert!(mesh.points.iter().all(|p| p[2] == 0.0));
        assert!(mesh
            .warnings
            .iter()
            .any(|w| matches!(w, MeshWarning::Coplanar { unique: 5 })));
        assert!(!mesh.cells.is_empty());
        assert!(mesh.cells.iter().all(|cell| cell[2] == cell[3]));
        assert!(mesh.total_volume().abs() < 1e-12);
        assert_cells_within(&mesh);
    }

    #[test]
    fn collinear_points_become_segments() {
        let mesh = build_trajectory_mesh(&records(&[
            [3.0, 3.0, 3.0],
            [0.0, 0.0, 0.0],
            [2.0, 2.0, 2.0],
            [1.0, 1.0, 1.0],
        ]))
        .expect("mesh");
        assert_eq!(mesh.cell_count(), 3);
        assert!(mesh
            .warnings
            .iter()
            .any(|w| matches!(w, MeshWarning::Collinear { unique: 4 })));
        let mut edges: Vec<(u32, u32)> = mesh
            .cells
            .iter()
            .map(|c| (c[0].min(c[1]), c[0].max(c[1])))
            .collect();
        edges.sort_unstable();
        assert_eq!(edges, vec![(0, 2), (1, 3), (2, 3)]);
    }

    #[test]
    fn coincident_points_are_kept_without_cells() {
        let mesh = build_trajectory_mesh(&records(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 0.0],
        ]))
        .expect("mesh");
        assert_eq!(mesh.point_count(), 5);
        assert_eq!(mesh.cell_count(), 1);
        assert!(mesh.cells.iter().all(|cell| !cell.contains(&4)));
        assert!(mesh
            .warnings
            .contains(&MeshWarning::CoincidentPoints { merged: 1 }));
    }

    #[test]
    fn identical_points_yield_no_cells() {
        let mesh = build_trajectory_mesh(&records(&[[1.0, 2.0, 3.0]; 3])).expect("mesh");
        assert_eq!(mesh.point_count(), 3);
        assert!(mesh.cells.is_empty());
        assert!(mesh
            .warnings
            .contains(&MeshWarning::TooFewPoints { unique: 1 }));
    }

    #[test]
    fn empty_input_yields_empty_mesh() {
        let mesh = build_trajectory_mesh(&[]).expect("mesh");
        assert!(mesh.points.is_empty());
        assert!(mesh.cells.is_empty());
    }

    #[test]
    fn rejects_non_finite_coordinates() {
        let mut input = records(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
        input[1].coordinates[0] = f64::NAN;
        assert!(matches!(
            build_trajectory_mesh(&input),
            Err(TopoError::InvalidSettings(_))
        ));
    }
}
