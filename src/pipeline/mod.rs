#[cfg(feature = "camera-nokhwa")]
pub mod camera;
mod control;
mod detection;
mod dispatch;
mod embedding;
mod runner;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::{Embedding, Frame, Label, Pose};

pub use self::{
    control::{ControlMessage, ControlSignal},
    detection::{DetectionLoop, LoopSettings, LoopState, LoopStatus, TickOutcome},
    dispatch::ActionDispatcher,
    embedding::ThumbnailExtractor,
    runner::{LoopEvent, LoopHandle, TickReport, spawn_detection_loop},
};

pub trait FrameSource: Send + 'static {
    /// Acquires the underlying device and begins producing frames.
    fn start(&mut self) -> Result<()>;
    /// Stops producing frames and releases the device.
    fn stop(&mut self);
    /// Most recent frame since the last call, if any.
    fn latest_frame(&mut self) -> Option<Frame>;
}

pub trait PoseEstimator: Send + 'static {
    fn estimate(&mut self, frame: &Frame) -> Result<Pose>;
}

pub trait EmbeddingExtractor: Send + 'static {
    fn dim(&self) -> usize;
    fn extract(&mut self, frame: &Frame) -> Result<Embedding>;
}

pub trait CommandDispatcher: Send + 'static {
    fn dispatch(&mut self, label: Label, confidence: f32) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    Scroll { dx: i32, dy: i32 },
}
