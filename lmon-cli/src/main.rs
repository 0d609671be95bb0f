//! Command-line front end: single-image or batch detection, and a bus
//! listener mode that prints received events.

mod args;

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use image::GenericImageView;
use log::{info, warn};
use rayon::prelude::*;

use args::Args;
use lmon_core::{Detector, DetectorConfig};
use lmon_ipc::{BusConfig, BusEvent, IpcBus};
use lmon_utils::{AppSettings, BgrFrame, init_logging};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => AppSettings::load_from_path(path)?,
        None => AppSettings::default(),
    };
    apply_overrides(&mut settings, &args);

    if args.listen {
        run_listener(&settings, &args)
    } else {
        run_detection(&settings, &args)
    }
}

fn apply_overrides(settings: &mut AppSettings, args: &Args) {
    if let Some(model) = &args.model {
        settings.model_path = Some(model.display().to_string());
    }
    if let Some(confidence) = args.confidence {
        settings.detection.confidence_threshold = confidence;
    }
    if let Some(nms) = args.nms {
        settings.detection.nms_threshold = nms;
    }
    if let Some(endpoint) = &args.endpoint {
        settings.ipc.endpoint = endpoint.clone();
    }
}

fn run_detection(settings: &AppSettings, args: &Args) -> Result<()> {
    let input = args
        .input
        .as_ref()
        .ok_or_else(|| anyhow!("an input path is required outside listen mode"))?;

    let mut config = DetectorConfig::from_settings(settings);
    config.blocked_preprocessing = !args.scalar_preprocess;

    let start = Instant::now();
    let mut detector =
        Detector::initialize(config).map_err(|e| anyhow!("detector initialization failed: {e}"))?;
    info!(
        "detector ready in {:.0} ms (warm-up inference {:.2} ms)",
        start.elapsed().as_secs_f32() * 1000.0,
        detector.warmup_inference_ms()
    );

    let paths = collect_images(input)?;
    anyhow::ensure!(!paths.is_empty(), "no images found under {}", input.display());

    // Decode images in parallel; inference itself runs one frame at a time.
    let frames: Vec<(PathBuf, Result<BgrFrame>)> = paths
        .par_iter()
        .map(|path| (path.clone(), load_bgr_frame(path)))
        .collect();

    for (path, frame) in frames {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("skipping {}: {e:#}", path.display());
                continue;
            }
        };

        let (detections, metrics) = detector.detect(&frame);
        if let Some(error) = &metrics.error {
            warn!("{}: detection failed: {error}", path.display());
            continue;
        }

        if args.json {
            let payload = serde_json::json!({
                "image": path.display().to_string(),
                "detections": detections.iter().map(|d| {
                    serde_json::json!({
                        "class_id": d.class_id,
                        "confidence": d.confidence,
                        "bbox": [d.bbox.x, d.bbox.y, d.bbox.width, d.bbox.height],
                    })
                }).collect::<Vec<_>>(),
                "timings_ms": {
                    "preprocess": metrics.preprocessing_ms,
                    "inference": metrics.inference_ms,
                    "postprocess": metrics.postprocessing_ms,
                    "total": metrics.total_ms,
                },
            });
            println!("{payload}");
        } else {
            println!(
                "{}: {} detections ({:.2} ms total)",
                path.display(),
                detections.len(),
                metrics.total_ms
            );
            for detection in &detections {
                println!(
                    "  class {} at ({:.1}, {:.1}) {}x{} confidence {:.3}",
                    detection.class_id,
                    detection.bbox.x,
                    detection.bbox.y,
                    detection.bbox.width.round(),
                    detection.bbox.height.round(),
                    detection.confidence
                );
            }
        }
    }

    info!(
        "{} inferences, mean inference {:.2} ms",
        detector.total_inferences(),
        detector.mean_inference_ms()
    );
    Ok(())
}

fn run_listener(settings: &AppSettings, args: &Args) -> Result<()> {
    let config = BusConfig::from_settings(&settings.ipc, args.mode.into());
    let mut bus = IpcBus::new(config);

    let (events_tx, events_rx) = mpsc::channel();
    bus.start(events_tx)
        .map_err(|e| anyhow!("failed to start IPC bus: {e}"))?;
    info!("listening on the bus as {}", bus.system_id());

    let deadline = (args.listen_secs > 0).then(|| Duration::from_secs(args.listen_secs));
    let started = Instant::now();

    loop {
        if let Some(limit) = deadline {
            if started.elapsed() >= limit {
                info!("listen window elapsed");
                break;
            }
        }

        match events_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(BusEvent::Exit) => {
                info!("shutdown message received");
                break;
            }
            Ok(event) => println!("{event:?}"),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    bus.stop();
    Ok(())
}

fn collect_images(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }

    anyhow::ensure!(input.is_dir(), "input does not exist: {}", input.display());
    let mut paths: Vec<PathBuf> = std::fs::read_dir(input)
        .with_context(|| format!("failed to read directory {}", input.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Decode an image file into an owned BGR frame.
fn load_bgr_frame(path: &Path) -> Result<BgrFrame> {
    let image = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    let (width, height) = image.dimensions();
    let rgb = image.to_rgb8();

    let mut frame = BgrFrame::zeros(height as usize, width as usize);
    let bytes = frame.bytes_mut();
    for (i, pixel) in rgb.pixels().enumerate() {
        bytes[i * 3] = pixel[2];
        bytes[i * 3 + 1] = pixel[1];
        bytes[i * 3 + 2] = pixel[0];
    }
    Ok(frame)
}
