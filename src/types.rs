use std::{collections::BTreeMap, time::Instant};

use image::RgbaImage;

pub type Label = usize;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn from_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Frame {
            rgba: image.into_raw(),
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.rgba.is_empty()
    }
}

/// Fixed-length feature vector produced by an embedding extractor.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Embedding(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Embedding(values)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Keypoint {
    pub part: String,
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pose {
    pub keypoints: Vec<Keypoint>,
    pub score: f32,
}

impl Pose {
    /// Keypoints worth drawing, or `None` when the whole pose is too uncertain.
    pub fn drawable(self, min_pose_confidence: f32, min_part_confidence: f32) -> Option<Pose> {
        if self.score < min_pose_confidence {
            return None;
        }
        let keypoints = self
            .keypoints
            .into_iter()
            .filter(|kp| kp.score >= min_part_confidence)
            .collect();
        Some(Pose {
            keypoints,
            score: self.score,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub label: Label,
    pub confidences: BTreeMap<Label, f32>,
}

impl Prediction {
    pub fn confidence(&self) -> f32 {
        self.confidences.get(&self.label).copied().unwrap_or(0.0)
    }

    pub fn display_text(&self) -> String {
        format!("pose {} ({:.0}%)", self.label, self.confidence() * 100.0)
    }
}
