//! `wasm-bindgen` bridge over `topotraj_core` for the browser front end.
//! Inputs arrive as plain JS objects and leave as serialized payloads or
//! typed arrays; errors surface as string `JsValue`s.

mod clock;
mod clustering;
mod pipeline;

pub use clock::JsClock;
pub use clustering::WasmClusteringRunner;
pub use pipeline::{compute_distance_matrix, distance_heat_map, run_pipeline, score_cluster_counts};
