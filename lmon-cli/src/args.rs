//! Command-line argument definitions for lmon-cli.

use clap::{ArgAction, Parser, ValueEnum};
use lmon_ipc::SystemMode;
use std::path::PathBuf;

/// Run ball detection over images, or join the launch-monitor IPC bus.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Path to an image file or a directory containing images.
    #[arg(short, long, required_unless_present = "listen")]
    pub input: Option<PathBuf>,

    /// Path to the detector ONNX model (overrides the settings file).
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Optional settings JSON; built-in defaults apply when absent.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Minimum detection confidence (overrides the settings file).
    #[arg(long)]
    pub confidence: Option<f32>,

    /// Non-maximum-suppression IoU threshold (overrides the settings file).
    #[arg(long)]
    pub nms: Option<f32>,

    /// Use the scalar reference preprocessor instead of the blocked one.
    #[arg(long, action = ArgAction::SetTrue)]
    pub scalar_preprocess: bool,

    /// Emit detections as JSON lines instead of human-readable text.
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Join the IPC bus and print received events instead of detecting.
    #[arg(long, action = ArgAction::SetTrue)]
    pub listen: bool,

    /// Seconds to stay on the bus in listen mode (0 = until shutdown).
    #[arg(long, default_value_t = 0)]
    pub listen_secs: u64,

    /// Bus endpoint to connect to (overrides the settings file).
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Role of this process on the bus.
    #[arg(long, value_enum, default_value_t = ModeArg::Camera1)]
    pub mode: ModeArg,
}

/// Bus role names accepted on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Camera1,
    Camera1Standalone,
    Camera2,
    Camera2Standalone,
    Camera1AutoCalibrate,
    Camera2AutoCalibrate,
    Camera1BallLocation,
    Camera2BallLocation,
    Pi1ProcessingForCam2,
    Test,
}

impl From<ModeArg> for SystemMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Camera1 => SystemMode::Camera1,
            ModeArg::Camera1Standalone => SystemMode::Camera1Standalone,
            ModeArg::Camera2 => SystemMode::Camera2,
            ModeArg::Camera2Standalone => SystemMode::Camera2Standalone,
            ModeArg::Camera1AutoCalibrate => SystemMode::Camera1AutoCalibrate,
            ModeArg::Camera2AutoCalibrate => SystemMode::Camera2AutoCalibrate,
            ModeArg::Camera1BallLocation => SystemMode::Camera1BallLocation,
            ModeArg::Camera2BallLocation => SystemMode::Camera2BallLocation,
            ModeArg::Pi1ProcessingForCam2 => SystemMode::Cam2ProcessForPi1,
            ModeArg::Test => SystemMode::Test,
        }
    }
}
