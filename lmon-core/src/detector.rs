//! High-level detector facade.
//!
//! Composes the arena, preprocessor, inference engine, and postprocessor
//! into one `detect` call. Per-frame failures never escape: each stage
//! error is folded into the returned metrics alongside an empty detection
//! list, and the engine is left untouched unless the runtime itself
//! reported the fault.

use std::time::Instant;

use log::{info, warn};
use lmon_utils::{AppSettings, BgrFrame, timing_guard};

use crate::DetectorError;
use crate::arena::TensorArena;
use crate::engine::{EngineConfig, InferenceEngine};
use crate::postprocess::{Detection, PostprocessConfig, decode_predictions};
use crate::preprocess::{BlockedPreprocessor, FramePreprocessor, InputSize, ScalarPreprocessor};

/// Facade construction parameters.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub engine: EngineConfig,
    pub postprocess: PostprocessConfig,
    /// CPU cores the calling thread may be pinned to. Empty disables
    /// pinning; failure to pin is logged, never fatal.
    pub pin_cores: Vec<usize>,
    pub warmup_iterations: usize,
    /// Use the cache-blocked preprocessor instead of the scalar reference.
    pub blocked_preprocessing: bool,
}

impl DetectorConfig {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            postprocess: PostprocessConfig::default(),
            pin_cores: Vec::new(),
            warmup_iterations: 5,
            blocked_preprocessing: true,
        }
    }

    /// Derive a full detector configuration from persisted settings.
    pub fn from_settings(settings: &AppSettings) -> Self {
        let model_path = settings
            .model_path
            .clone()
            .unwrap_or_else(|| "models/ball_detector_640.onnx".into());
        let input_size = InputSize::new(settings.input.width, settings.input.height);
        let mut engine = EngineConfig::new(model_path, input_size);
        engine.intra_threads = settings.engine.num_threads;
        engine.use_acl = settings.engine.use_acl;
        engine.use_fp16 = settings.engine.use_fp16;
        engine.use_xnnpack = settings.engine.use_xnnpack;

        Self {
            engine,
            postprocess: PostprocessConfig {
                confidence_threshold: settings.detection.confidence_threshold,
                nms_threshold: settings.detection.nms_threshold,
                num_classes: settings.detection.num_classes,
                single_class: settings.detection.single_class,
            },
            pin_cores: settings.engine.pin_cores.clone(),
            warmup_iterations: settings.engine.warmup_iterations,
            blocked_preprocessing: true,
        }
    }
}

/// Per-call timing and resource figures.
#[derive(Debug, Clone, Default)]
pub struct DetectorMetrics {
    pub preprocessing_ms: f32,
    pub inference_ms: f32,
    pub postprocessing_ms: f32,
    pub total_ms: f32,
    pub arena_reserved_bytes: usize,
    /// Set when any stage failed; detections are empty in that case.
    pub error: Option<String>,
}

/// The main entry point for running ball detection on single frames.
pub struct Detector {
    arena: TensorArena,
    preprocessor: Box<dyn FramePreprocessor>,
    engine: InferenceEngine,
    postprocess: PostprocessConfig,
    total_inferences: u64,
    mean_inference_ms: f32,
    warmup_inference_ms: f32,
}

impl Detector {
    /// Load the model, reserve buffers, optionally pin the calling thread,
    /// and warm the session up on a zero frame.
    pub fn initialize(config: DetectorConfig) -> Result<Self, DetectorError> {
        if !config.pin_cores.is_empty() {
            pin_current_thread(&config.pin_cores);
        }

        let input_size = config.engine.input_size;
        let engine = InferenceEngine::initialize(&config.engine)?;

        let mut arena = TensorArena::new();
        let out_channels = config.postprocess.data_width().max(84);
        arena.reserve(
            input_size.tensor_len(),
            out_channels * engine.expected_anchors(),
            input_size.scratch_len(),
        );

        let preprocessor: Box<dyn FramePreprocessor> = if config.blocked_preprocessing {
            Box::new(BlockedPreprocessor)
        } else {
            Box::new(ScalarPreprocessor)
        };

        let mut detector = Self {
            arena,
            preprocessor,
            engine,
            postprocess: config.postprocess,
            total_inferences: 0,
            mean_inference_ms: 0.0,
            warmup_inference_ms: 0.0,
        };

        detector.warm_up(config.warmup_iterations);
        Ok(detector)
    }

    /// Run `iterations` inferences on a zero-filled frame to prime caches
    /// and allocators, recording the final iteration's inference time.
    fn warm_up(&mut self, iterations: usize) {
        let size = self.engine.input_size();
        let dummy = BgrFrame::zeros(size.height as usize, size.width as usize);
        info!("warming up detector with {iterations} iterations");

        for i in 0..iterations {
            let (_, metrics) = self.detect(&dummy);
            if let Some(err) = metrics.error {
                warn!("warm-up iteration {i} failed: {err}");
                return;
            }
            if i + 1 == iterations {
                self.warmup_inference_ms = metrics.inference_ms;
                info!(
                    "warm-up complete, final inference time {:.2} ms",
                    metrics.inference_ms
                );
            }
        }
    }

    /// Detect objects in one BGR frame.
    ///
    /// Never panics and never fails outright: stage errors produce an empty
    /// detection list with `metrics.error` populated.
    pub fn detect(&mut self, frame: &BgrFrame) -> (Vec<Detection>, DetectorMetrics) {
        let _guard = timing_guard("lmon_core::detect", log::Level::Debug);
        let start_total = Instant::now();
        let size = self.engine.input_size();

        let mut input = self.arena.lease_input(size.tensor_len());
        let mut scratch = self.arena.lease_scratch(size.scratch_len());
        let out_channels = self.postprocess.data_width().max(84);
        let mut output = self
            .arena
            .lease_output(out_channels * self.engine.expected_anchors());

        let mut metrics = DetectorMetrics::default();
        let result = self.run_stages(frame, &mut input, &mut scratch, &mut output, &mut metrics);

        self.arena.release_all(input, output, scratch);

        metrics.total_ms = elapsed_ms(start_total);
        metrics.arena_reserved_bytes = self.arena.reserved_bytes();

        match result {
            Ok(detections) => {
                self.total_inferences += 1;
                let n = self.total_inferences as f32;
                self.mean_inference_ms =
                    (self.mean_inference_ms * (n - 1.0) + metrics.inference_ms) / n;
                (detections, metrics)
            }
            Err(err) => {
                warn!("detect failed: {err}");
                metrics.error = Some(err.to_string());
                (Vec::new(), metrics)
            }
        }
    }

    fn run_stages(
        &mut self,
        frame: &BgrFrame,
        input: &mut [f32],
        scratch: &mut [u8],
        output: &mut [f32],
        metrics: &mut DetectorMetrics,
    ) -> Result<Vec<Detection>, DetectorError> {
        let size = self.engine.input_size();

        let start = Instant::now();
        self.preprocessor.preprocess(frame, size, scratch, input)?;
        metrics.preprocessing_ms = elapsed_ms(start);

        let start = Instant::now();
        let shape = self.engine.run(&input[..size.tensor_len()], output)?;
        metrics.inference_ms = elapsed_ms(start);

        // Follow the model's actual head layout; thresholds come from the
        // configured postprocess parameters.
        let layout = PostprocessConfig {
            confidence_threshold: self.postprocess.confidence_threshold,
            nms_threshold: self.postprocess.nms_threshold,
            num_classes: shape.channels.saturating_sub(4).max(1),
            single_class: shape.channels == 5,
        };

        let start = Instant::now();
        let detections = decode_predictions(
            &output[..shape.channels * shape.anchors],
            shape.anchors,
            size,
            (frame.cols() as u32, frame.rows() as u32),
            &layout,
        )?;
        metrics.postprocessing_ms = elapsed_ms(start);

        Ok(detections)
    }

    /// Cumulative mean of the inference stage across all successful calls.
    pub fn mean_inference_ms(&self) -> f32 {
        self.mean_inference_ms
    }

    /// Total successful inferences, warm-up included.
    pub fn total_inferences(&self) -> u64 {
        self.total_inferences
    }

    /// Inference time of the final warm-up iteration.
    pub fn warmup_inference_ms(&self) -> f32 {
        self.warmup_inference_ms
    }

    pub fn input_size(&self) -> InputSize {
        self.engine.input_size()
    }

    pub fn postprocess_config(&self) -> &PostprocessConfig {
        &self.postprocess
    }
}

fn elapsed_ms(start: Instant) -> f32 {
    start.elapsed().as_secs_f32() * 1000.0
}

/// Pin the calling thread to the first available core from `cores`.
/// Failure is logged and otherwise ignored.
fn pin_current_thread(cores: &[usize]) {
    let Some(available) = core_affinity::get_core_ids() else {
        warn!("cannot enumerate CPU cores; thread pinning skipped");
        return;
    };

    for requested in cores {
        if let Some(core) = available.iter().find(|c| c.id == *requested) {
            if core_affinity::set_for_current(*core) {
                info!("detector thread pinned to core {requested}");
                return;
            }
        }
    }
    warn!("failed to pin detector thread to any of {cores:?}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinning_to_bogus_cores_is_not_fatal() {
        pin_current_thread(&[usize::MAX]);
    }

    #[test]
    fn config_from_settings_carries_thresholds() {
        let mut settings = AppSettings::default();
        settings.detection.confidence_threshold = 0.25;
        settings.detection.nms_threshold = 0.45;
        settings.engine.num_threads = 3;

        let config = DetectorConfig::from_settings(&settings);
        assert_eq!(config.postprocess.confidence_threshold, 0.25);
        assert_eq!(config.postprocess.nms_threshold, 0.45);
        assert_eq!(config.engine.intra_threads, 3);
        assert_eq!(config.warmup_iterations, 5);
    }
}
