use std::{
    env,
    io::{self, BufRead},
    path::PathBuf,
    thread,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, bounded, unbounded};
use pose_scroll::{
    Configuration,
    pipeline::{
        ActionDispatcher, Command, ControlMessage, ControlSignal, DetectionLoop, FrameSource,
        LoopEvent, LoopSettings, PoseEstimator, ThumbnailExtractor, TickOutcome, TickReport,
        spawn_detection_loop,
    },
    types::{Frame, Label, Pose},
};

const CONFIG_ENV: &str = "POSE_SCROLL_CONFIG";
const DEFAULT_CONFIG: &str = "pose-scroll.toml";

// No keypoint model ships with the host, so the overlay stays empty.
struct NoPoseEstimator;

impl PoseEstimator for NoPoseEstimator {
    fn estimate(&mut self, _frame: &Frame) -> Result<Pose> {
        Ok(Pose::default())
    }
}

enum HostCommand {
    Control(ControlSignal),
    Train(Label),
    TrainStop,
    Save,
    Load,
}

impl HostCommand {
    fn parse(message: &ControlMessage) -> Option<Self> {
        if let Some(signal) = ControlSignal::from_message(message) {
            return Some(HostCommand::Control(signal));
        }
        let mut words = message.data.split_whitespace();
        match (words.next()?, words.next()) {
            ("TRAIN", Some(label)) => label.parse().ok().map(HostCommand::Train),
            ("TRAIN_STOP", None) => Some(HostCommand::TrainStop),
            ("SAVE", None) => Some(HostCommand::Save),
            ("LOAD", None) => Some(HostCommand::Load),
            _ => None,
        }
    }
}

#[cfg(feature = "camera-nokhwa")]
fn frame_source(config: &Configuration) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(pose_scroll::pipeline::camera::NokhwaFrameSource::new(
        config.camera_index,
    )))
}

#[cfg(not(feature = "camera-nokhwa"))]
fn frame_source(_config: &Configuration) -> Result<Box<dyn FrameSource>> {
    anyhow::bail!("built without a camera backend; enable the camera-nokhwa feature")
}

fn main() -> Result<()> {
    env_logger::init();

    let config_path = env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = Configuration::load_or_default(&config_path)?;

    let (command_tx, command_rx) = unbounded();
    let mut detection = DetectionLoop::new(
        LoopSettings::from(&config),
        frame_source(&config)?,
        Box::new(NoPoseEstimator),
        Box::new(ThumbnailExtractor::new(config.thumbnail_side)),
        Box::new(ActionDispatcher::new(&config.actions, command_tx)),
    );

    if let Some(path) = &config.classifier_path {
        if let Err(err) = detection.load_classifier(path) {
            log::error!("starting untrained, {} not loaded: {err}", path.display());
        }
    }

    let handle = spawn_detection_loop(detection, config.tick_interval());
    thread::spawn(move || print_commands(command_rx));
    let reports = handle.reports().clone();
    thread::spawn(move || log_reports(reports));

    if config.start_detecting {
        handle.send(LoopEvent::Control(ControlSignal::On))?;
    }

    let stored_path = config
        .classifier_path
        .clone()
        .unwrap_or_else(|| config.save_path.clone());

    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read control channel")?;
        if line.trim().is_empty() {
            continue;
        }
        let message: ControlMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("ignoring control message {line:?}: {err}");
                continue;
            }
        };
        let Some(command) = HostCommand::parse(&message) else {
            log::debug!("ignoring control value {:?}", message.data);
            continue;
        };

        match command {
            HostCommand::Control(signal) => handle.send(LoopEvent::Control(signal))?,
            HostCommand::Train(label) => handle.send(LoopEvent::StartTraining(label))?,
            HostCommand::TrainStop => handle.send(LoopEvent::StopTraining)?,
            HostCommand::Save => {
                let (reply, result) = bounded(1);
                handle.send(LoopEvent::Save {
                    path: config.save_path.clone(),
                    reply,
                })?;
                if let Ok(Ok(())) = result.recv() {
                    log::info!("classifier saved to {}", config.save_path.display());
                }
            }
            HostCommand::Load => {
                let (reply, result) = bounded(1);
                handle.send(LoopEvent::Load {
                    path: stored_path.clone(),
                    reply,
                })?;
                let _ = result.recv();
            }
        }
    }

    handle.join()?;
    Ok(())
}

fn print_commands(command_rx: Receiver<Command>) {
    for command in command_rx {
        match serde_json::to_string(&command) {
            Ok(json) => println!("{json}"),
            Err(err) => log::warn!("failed to encode command {command:?}: {err}"),
        }
    }
}

fn log_reports(reports: Receiver<TickReport>) {
    for report in reports {
        match report.outcome {
            TickOutcome::Trained {
                label, examples, ..
            } => log::info!("pose {label}: {examples} examples"),
            TickOutcome::Predicted { prediction, .. } => log::debug!(
                "{} | examples {:?}",
                prediction.display_text(),
                report.status.example_counts
            ),
            _ => {}
        }
    }
}
