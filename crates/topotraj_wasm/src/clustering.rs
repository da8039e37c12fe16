//! Stepped k-medoids runner.

use crate::clock::JsClock;
use crate::pipeline::{parse_collection, parse_filter, parse_settings};
use serde_wasm_bindgen::to_value;
use topotraj_core::clustering::{ClusteringRunner, ClusteringSettings};
use topotraj_core::distance::{compute_distance_matrix, DistanceSettings};
use wasm_bindgen::prelude::*;

/// WASM-exported k-medoids runner.
/// Runs batches of iterations so the caller can report progress between them.
#[wasm_bindgen]
pub struct WasmClusteringRunner {
    runner: Option<ClusteringRunner<JsClock>>,
}

#[wasm_bindgen]
impl WasmClusteringRunner {
    /// Computes distances for the collection and seeds the clustering of
    /// the diagrams accepted by `filter_val` (all of them when absent).
    #[wasm_bindgen(constructor)]
    pub fn new(
        collection_val: JsValue,
        distance_settings_val: JsValue,
        clustering_settings_val: JsValue,
        filter_val: JsValue,
    ) -> Result<WasmClusteringRunner, JsValue> {
        console_error_panic_hook::set_once();

        let collection = parse_collection(collection_val)?;
        let distance_settings: DistanceSettings =
            parse_settings(distance_settings_val, "distance")?;
        let settings: ClusteringSettings = parse_settings(clustering_settings_val, "clustering")?;
        let filter = parse_filter(filter_val)?;

        let mut distances = compute_distance_matrix(&collection, &distance_settings)
            .map_err(|e| JsValue::from_str(&format!("Distance computation failed: {}", e)))?;
        if let Some(filter) = filter {
            distances = distances
                .subset(&filter)
                .map_err(|e| JsValue::from_str(&format!("Subset selection failed: {}", e)))?;
        }

        let runner = ClusteringRunner::with_clock(distances, settings, JsClock)
            .map_err(|e| JsValue::from_str(&format!("Clustering init failed: {}", e)))?;

        Ok(WasmClusteringRunner {
            runner: Some(runner),
        })
    }

    pub fn is_done(&self) -> bool {
        self.runner.as_ref().map_or(true, |runner| runner.is_done())
    }

    /// Run a batch of iterations and return progress.
    pub fn run_steps(&mut self, batch_size: u32) -> Result<JsValue, JsValue> {
        let runner = self
            .runner
            .as_mut()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;

        let progress = runner.run_steps(batch_size as usize);

        to_value(&progress).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    pub fn get_progress(&self) -> Result<JsValue, JsValue> {
        let runner = self
            .runner
            .as_ref()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;

        to_value(&runner.progress())
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Get the final assignment. The runner is consumed.
    pub fn get_result(&mut self) -> Result<JsValue, JsValue> {
        let runner = self
            .runner
            .take()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;

        let assignment = runner.take_result();

        to_value(&assignment).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }
}
