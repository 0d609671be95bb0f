//! Core detector primitives for the launch monitor.
//!
//! This crate loads a YOLO-family ONNX model, runs single-frame inference
//! with `ort`, and provides the preprocessing, postprocessing, and buffer
//! management around it.

/// Pre-reserved tensor buffers with a non-blocking lease protocol.
pub mod arena;
/// High-level detection facade composing the full per-frame pipeline.
pub mod detector;
/// ONNX session loading and execution.
pub mod engine;
/// Detection decoding, score filtering, and per-class NMS.
pub mod postprocess;
/// Frame resizing and tensor conversion (scalar and blocked paths).
pub mod preprocess;

use thiserror::Error;

pub use arena::{LeasedF32, LeasedU8, TensorArena};
pub use detector::{Detector, DetectorConfig, DetectorMetrics};
pub use engine::{EngineConfig, InferenceEngine, RawOutputShape};
pub use postprocess::{BoundingBox, Detection, PostprocessConfig, decode_predictions};
pub use preprocess::{BlockedPreprocessor, FramePreprocessor, InputSize, ScalarPreprocessor};

/// Failures surfaced by the detector pipeline.
///
/// Per-frame errors never escape [`Detector::detect`]; they are folded into
/// the returned metrics. Initialization errors are fatal to the detector.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// Empty or mis-shaped input frame.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Destination buffer smaller than the tensor it must hold.
    #[error("insufficient buffer: need {needed} elements, have {available}")]
    InsufficientBuffer { needed: usize, available: usize },
    /// The underlying runtime reported a hard failure.
    #[error("runtime fault: {0}")]
    Runtime(String),
}

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
