use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Detection thresholds applied after the forward pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Number of class scores per anchor row. 80 for COCO heads.
    pub num_classes: usize,
    /// Single-class heads carry one confidence value instead of class scores.
    pub single_class: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            num_classes: 80,
            single_class: false,
        }
    }
}

/// Inference input resolution in pixels (width x height).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InputDimensions {
    pub width: u32,
    pub height: u32,
}

impl Default for InputDimensions {
    fn default() -> Self {
        Self {
            width: 640,
            height: 640,
        }
    }
}

/// Runtime tuning for the inference session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    /// Intra-op thread budget. 0 selects the physical core count.
    pub num_threads: usize,
    pub use_acl: bool,
    pub use_fp16: bool,
    pub use_xnnpack: bool,
    /// CPU cores the detector thread is pinned to. Empty disables pinning.
    pub pin_cores: Vec<usize>,
    pub warmup_iterations: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            num_threads: 0,
            use_acl: true,
            use_fp16: false,
            use_xnnpack: false,
            pin_cores: Vec::new(),
            warmup_iterations: 5,
        }
    }
}

/// Messaging-plane endpoints and socket tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IpcSettings {
    /// Endpoint subscribers connect to. The publisher bind endpoint is
    /// derived from this endpoint's port suffix.
    pub endpoint: String,
    pub high_water_mark: i32,
    pub linger_ms: i32,
    pub receive_timeout_ms: i32,
    /// Optional fixed system id; generated from host and pid when absent.
    pub system_id: Option<String>,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            endpoint: "tcp://localhost:5556".into(),
            high_water_mark: 1000,
            linger_ms: 1000,
            receive_timeout_ms: 100,
            system_id: None,
        }
    }
}

/// Persistent application settings consumed by the CLI and services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Optional override for the detector ONNX model path.
    pub model_path: Option<String>,
    pub input: InputDimensions,
    pub detection: DetectionSettings,
    pub engine: EngineSettings,
    pub ipc: IpcSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_path: Some("models/ball_detector_640.onnx".into()),
            input: InputDimensions::default(),
            detection: DetectionSettings::default(),
            engine: EngineSettings::default(),
            ipc: IpcSettings::default(),
        }
    }
}

impl AppSettings {
    /// Load settings from a JSON file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let mut settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;

        if settings.model_path.is_none() {
            settings.model_path = AppSettings::default().model_path;
        }

        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn default_settings_round_trip() {
        let file = NamedTempFile::new().expect("tempfile");
        let settings = AppSettings::default();
        settings.save_to_path(file.path()).expect("save");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.input, settings.input);
        assert_eq!(loaded.ipc, settings.ipc);
        assert_eq!(loaded.engine, settings.engine);
        assert_eq!(loaded.model_path, settings.model_path);
    }

    #[test]
    fn missing_model_path_uses_default() {
        let file = NamedTempFile::new().expect("tempfile");
        let json = r#"{
            "input": { "width": 416, "height": 416 },
            "detection": { "confidence_threshold": 0.25, "nms_threshold": 0.45 }
        }"#;
        fs::write(file.path(), json).expect("write custom settings");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(
            loaded.input,
            InputDimensions {
                width: 416,
                height: 416
            }
        );
        assert_eq!(loaded.detection.confidence_threshold, 0.25);
        assert_eq!(loaded.detection.num_classes, 80);
        assert_eq!(loaded.model_path, AppSettings::default().model_path);
    }

    #[test]
    fn endpoint_default_matches_bus_contract() {
        let settings = IpcSettings::default();
        assert_eq!(settings.endpoint, "tcp://localhost:5556");
        assert_eq!(settings.high_water_mark, 1000);
        assert_eq!(settings.linger_ms, 1000);
        assert_eq!(settings.receive_timeout_ms, 100);
    }
}
