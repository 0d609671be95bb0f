//! ONNX Runtime session wrapper for single-frame forward passes.
//!
//! The engine loads a serialized YOLO-family graph once, tunes the session
//! for a constrained ARM CPU budget (bounded intra-op pool, single inter-op
//! thread, memory-pattern reuse, full graph optimization), and caches the
//! model's tensor names so the hot path never queries the model again.
//! Platform accelerators are attached in fixed priority order: ARM Compute
//! Library, then XNNPACK, then plain CPU.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use ndarray::ArrayView;
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::TensorRef;

use crate::DetectorError;
use crate::preprocess::InputSize;

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_path: PathBuf,
    pub input_size: InputSize,
    /// Intra-op thread budget. 0 selects the physical core count.
    pub intra_threads: usize,
    pub use_acl: bool,
    pub use_fp16: bool,
    pub use_xnnpack: bool,
}

impl EngineConfig {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: InputSize) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            input_size,
            intra_threads: 0,
            use_acl: true,
            use_fp16: false,
            use_xnnpack: false,
        }
    }
}

/// Shape of the raw output copied out of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOutputShape {
    pub channels: usize,
    pub anchors: usize,
}

/// Wrapper around one loaded ONNX session.
pub struct InferenceEngine {
    session: Session,
    input_size: InputSize,
    input_name: String,
    output_name: String,
    expected_anchors: usize,
    head_checked: bool,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("input_size", &self.input_size)
            .field("input_name", &self.input_name)
            .field("output_name", &self.output_name)
            .field("expected_anchors", &self.expected_anchors)
            .field("head_checked", &self.head_checked)
            .finish_non_exhaustive()
    }
}

impl InferenceEngine {
    /// Load the model and prepare the session. A missing model file fails
    /// initialization; so does any session construction error.
    pub fn initialize(config: &EngineConfig) -> Result<Self, DetectorError> {
        let path = &config.model_path;
        if !path.exists() {
            return Err(DetectorError::Runtime(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        let intra_threads = if config.use_xnnpack {
            // XNNPACK brings its own pool; keep the session pool out of its way.
            1
        } else if config.intra_threads == 0 {
            num_cpus::get_physical()
        } else {
            config.intra_threads
        };

        debug!(
            "creating session: intra_threads={intra_threads} acl={} fp16={} xnnpack={}",
            config.use_acl, config.use_fp16, config.use_xnnpack
        );

        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(intra_threads))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.with_memory_pattern(true))
            .and_then(|b| b.with_config_entry("session.enable_cpu_mem_arena", "1"))
            .and_then(|b| b.with_execution_providers(execution_providers(config)))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| {
                DetectorError::Runtime(format!("failed to load model {}: {e}", path.display()))
            })?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| DetectorError::Runtime("model declares no inputs".into()))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| DetectorError::Runtime("model declares no outputs".into()))?;

        for input in &session.inputs {
            debug!("model input {}: {:?}", input.name, input.input_type);
        }
        for output in &session.outputs {
            debug!("model output {}: {:?}", output.name, output.output_type);
        }

        let expected_anchors = anchor_count(config.input_size);
        info!(
            "model {} loaded ({}x{}, {} anchors expected, input '{}', output '{}')",
            path.display(),
            config.input_size.width,
            config.input_size.height,
            expected_anchors,
            input_name,
            output_name
        );

        Ok(Self {
            session,
            input_size: config.input_size,
            input_name,
            output_name,
            expected_anchors,
            head_checked: false,
        })
    }

    pub fn input_size(&self) -> InputSize {
        self.input_size
    }

    pub fn expected_anchors(&self) -> usize {
        self.expected_anchors
    }

    /// Run one forward pass over a prepared `1x3xHxW` tensor and copy the
    /// raw output into `out`. The input is borrowed, not copied.
    pub fn run(&mut self, input: &[f32], out: &mut [f32]) -> Result<RawOutputShape, DetectorError> {
        let h = self.input_size.height as usize;
        let w = self.input_size.width as usize;
        let needed = 3 * h * w;
        if input.len() != needed {
            return Err(DetectorError::InvalidInput(format!(
                "input tensor must hold {needed} elements, got {}",
                input.len()
            )));
        }

        let view = ArrayView::from_shape((1, 3, h, w), input)
            .map_err(|e| DetectorError::InvalidInput(format!("bad input tensor shape: {e}")))?;
        let tensor = TensorRef::from_array_view(view)
            .map_err(|e| DetectorError::Runtime(format!("failed to wrap input tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| DetectorError::Runtime(format!("inference failed: {e}")))?;

        let value = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| DetectorError::Runtime("model produced no output tensor".into()))?;
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::Runtime(format!("output tensor is not f32: {e}")))?;

        let (raw_shape, transposed) = interpret_output_shape(shape, self.expected_anchors)?;
        if !self.head_checked {
            self.head_checked = true;
            match raw_shape.channels {
                84 => debug!("multi-class COCO head (84 = 4 bbox + 80 classes)"),
                5 => debug!("single-class head (5 = 4 bbox + 1 confidence)"),
                other => warn!("unexpected head width {other}; expected 84 or 5"),
            }
            if raw_shape.anchors != self.expected_anchors {
                warn!(
                    "model emits {} anchors, expected {} for {}x{} input",
                    raw_shape.anchors,
                    self.expected_anchors,
                    self.input_size.width,
                    self.input_size.height
                );
            }
        }

        let len = raw_shape.channels * raw_shape.anchors;
        if out.len() < len {
            return Err(DetectorError::InsufficientBuffer {
                needed: len,
                available: out.len(),
            });
        }
        if transposed {
            // Anchor-major export: rewrite to the channel-first layout the
            // postprocessor consumes.
            let (c, a) = (raw_shape.channels, raw_shape.anchors);
            for anchor in 0..a {
                for ch in 0..c {
                    out[ch * a + anchor] = data[anchor * c + ch];
                }
            }
        } else {
            out[..len].copy_from_slice(&data[..len]);
        }

        Ok(raw_shape)
    }
}

/// Anchor rows produced by a three-stride detection head for a given input.
pub fn anchor_count(size: InputSize) -> usize {
    let w = size.width as usize;
    let h = size.height as usize;
    (w / 8) * (h / 8) + (w / 16) * (h / 16) + (w / 32) * (h / 32)
}

fn interpret_output_shape(
    shape: &[i64],
    expected_anchors: usize,
) -> Result<(RawOutputShape, bool), DetectorError> {
    // Accept [1, C, A] or [C, A]; an anchor-major [1, A, C] head is
    // recognized by matching the anchor count and flagged for transposition.
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    let (a, b) = match dims.as_slice() {
        [1, a, b] => (*a, *b),
        [a, b] => (*a, *b),
        other => {
            return Err(DetectorError::Runtime(format!(
                "unsupported output shape {other:?}"
            )));
        }
    };

    let transposed = a == expected_anchors && b != expected_anchors;
    if transposed {
        Ok((
            RawOutputShape {
                channels: b,
                anchors: a,
            },
            true,
        ))
    } else {
        Ok((
            RawOutputShape {
                channels: a,
                anchors: b,
            },
            false,
        ))
    }
}

fn execution_providers(config: &EngineConfig) -> Vec<ExecutionProviderDispatch> {
    let mut providers = Vec::new();

    if config.use_acl {
        #[cfg(feature = "acl")]
        {
            use ort::execution_providers::ACLExecutionProvider;
            providers.push(
                ACLExecutionProvider::default()
                    .with_fast_math(config.use_fp16)
                    .build(),
            );
        }
        #[cfg(not(feature = "acl"))]
        warn!("ARM Compute Library requested but not compiled in; skipping");
    }

    if config.use_xnnpack {
        #[cfg(feature = "xnnpack")]
        {
            use ort::execution_providers::XNNPACKExecutionProvider;
            providers.push(XNNPACKExecutionProvider::default().build());
        }
        #[cfg(not(feature = "xnnpack"))]
        warn!("XNNPACK requested but not compiled in; skipping");
    }

    providers.push(CPUExecutionProvider::default().build());
    providers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loading_missing_model_fails() {
        let config = EngineConfig::new("missing.onnx", InputSize::default());
        let result = InferenceEngine::initialize(&config);
        assert!(result.is_err());
    }

    #[test]
    fn invalid_model_produces_useful_error() {
        let mut temp = NamedTempFile::new().expect("temp file");
        temp.write_all(b"not a real onnx file")
            .expect("write mock model");

        let config = EngineConfig::new(temp.path(), InputSize::default());
        let err = InferenceEngine::initialize(&config).expect_err("invalid model should fail");
        let message = format!("{err}");
        assert!(
            message.contains("failed to load model"),
            "unexpected error message: {message}"
        );
    }

    #[test]
    fn anchor_count_matches_yolo_head() {
        assert_eq!(anchor_count(InputSize::new(640, 640)), 8400);
        assert_eq!(anchor_count(InputSize::new(320, 320)), 2100);
    }

    #[test]
    fn output_shape_interpretation() {
        let (shape, transposed) = interpret_output_shape(&[1, 84, 8400], 8400).unwrap();
        assert_eq!(shape.channels, 84);
        assert_eq!(shape.anchors, 8400);
        assert!(!transposed);

        // Anchor-major heads are recognized by the anchor count.
        let (shape, transposed) = interpret_output_shape(&[1, 8400, 84], 8400).unwrap();
        assert_eq!(shape.channels, 84);
        assert_eq!(shape.anchors, 8400);
        assert!(transposed);

        assert!(interpret_output_shape(&[1, 2, 3, 4], 8400).is_err());
    }
}
