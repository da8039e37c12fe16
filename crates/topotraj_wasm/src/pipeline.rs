//! Whole-pipeline and distance entry points.

use crate::clock::JsClock;
use js_sys::Float64Array;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_wasm_bindgen::{from_value, to_value};
use topotraj_core::clustering::{ClusterAssignment, ClusteringSettings};
use topotraj_core::criteria::score_cluster_counts_with_clock;
use topotraj_core::diagram::{DiagramCollection, DiagramKey, FieldFilter};
use topotraj_core::distance::{compute_distance_matrix as core_distance_matrix, DistanceSettings};
use topotraj_core::fusion::FusedRecord;
use topotraj_core::mesh::TrajectoryMesh;
use topotraj_core::pipeline::{run_pipeline_with_clock, PipelineSettings};
use topotraj_core::reduction::Embedding;
use topotraj_core::traits::DiagramFilter;
use wasm_bindgen::prelude::*;

#[derive(Serialize)]
struct PipelinePayload<'a> {
    keys: &'a [DiagramKey],
    /// Row-major distance matrix.
    distances: Vec<f64>,
    embedding: &'a Embedding,
    assignment: &'a ClusterAssignment,
    records: &'a [FusedRecord],
    mesh: &'a TrajectoryMesh,
}

pub(crate) fn parse_collection(value: JsValue) -> Result<DiagramCollection, JsValue> {
    from_value(value).map_err(|e| JsValue::from_str(&format!("Invalid diagram collection: {}", e)))
}

/// `undefined` and `null` select the defaults.
pub(crate) fn parse_settings<T>(value: JsValue, what: &str) -> Result<T, JsValue>
where
    T: DeserializeOwned + Default,
{
    if value.is_undefined() || value.is_null() {
        return Ok(T::default());
    }
    from_value(value).map_err(|e| JsValue::from_str(&format!("Invalid {} settings: {}", what, e)))
}

pub(crate) fn parse_filter(value: JsValue) -> Result<Option<FieldFilter>, JsValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(None);
    }
    from_value(value)
        .map(Some)
        .map_err(|e| JsValue::from_str(&format!("Invalid filter: {}", e)))
}

fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, JsValue> {
    to_value(value).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

/// Runs distances, embedding, clustering, fusion and meshing in one call.
#[wasm_bindgen]
pub fn run_pipeline(
    collection_val: JsValue,
    settings_val: JsValue,
    filter_val: JsValue,
) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();

    let collection = parse_collection(collection_val)?;
    let settings: PipelineSettings = parse_settings(settings_val, "pipeline")?;
    let filter = parse_filter(filter_val)?;

    let output = run_pipeline_with_clock(
        &collection,
        filter.as_ref().map(|f| f as &dyn DiagramFilter),
        &settings,
        JsClock,
    )
    .map_err(|e| JsValue::from_str(&format!("Pipeline failed: {}", e)))?;

    serialize(&PipelinePayload {
        keys: output.distances.keys(),
        distances: output.distances.to_row_major(),
        embedding: &output.embedding,
        assignment: &output.assignment,
        records: &output.records,
        mesh: &output.mesh,
    })
}

/// Row-major distance matrix of the collection, in collection order.
#[wasm_bindgen]
pub fn compute_distance_matrix(
    collection_val: JsValue,
    settings_val: JsValue,
) -> Result<Float64Array, JsValue> {
    let collection = parse_collection(collection_val)?;
    let settings: DistanceSettings = parse_settings(settings_val, "distance")?;
    let matrix = core_distance_matrix(&collection, &settings)
        .map_err(|e| JsValue::from_str(&format!("Distance computation failed: {}", e)))?;
    Ok(Float64Array::from(matrix.to_row_major().as_slice()))
}

#[wasm_bindgen]
pub fn distance_heat_map(
    collection_val: JsValue,
    settings_val: JsValue,
) -> Result<JsValue, JsValue> {
    let collection = parse_collection(collection_val)?;
    let settings: DistanceSettings = parse_settings(settings_val, "distance")?;
    let matrix = core_distance_matrix(&collection, &settings)
        .map_err(|e| JsValue::from_str(&format!("Distance computation failed: {}", e)))?;
    serialize(&matrix.heat_map())
}

/// Scores each candidate cluster count by AIC, AICc and BIC.
#[wasm_bindgen]
pub fn score_cluster_counts(
    collection_val: JsValue,
    distance_settings_val: JsValue,
    clustering_settings_val: JsValue,
    candidates: Vec<u32>,
    dimension: f64,
) -> Result<JsValue, JsValue> {
    let collection = parse_collection(collection_val)?;
    let distance_settings: DistanceSettings = parse_settings(distance_settings_val, "distance")?;
    let clustering_settings: ClusteringSettings =
        parse_settings(clustering_settings_val, "clustering")?;
    let matrix = core_distance_matrix(&collection, &distance_settings)
        .map_err(|e| JsValue::from_str(&format!("Distance computation failed: {}", e)))?;
    let candidates: Vec<usize> = candidates.into_iter().map(|k| k as usize).collect();
    let scores = score_cluster_counts_with_clock(
        &matrix,
        &candidates,
        &clustering_settings,
        dimension,
        JsClock,
    )
    .map_err(|e| JsValue::from_str(&format!("Cluster count scoring failed: {}", e)))?;
    serialize(&scores)
}
