use std::path::Path;

use anyhow::{Context, Result};

use super::{CommandDispatcher, ControlSignal, EmbeddingExtractor, FrameSource, PoseEstimator};
use crate::{
    classifier::ExampleClassifier,
    codec,
    config::Configuration,
    error::ClassifierError,
    types::{Label, Pose, Prediction},
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoopSettings {
    pub num_classes: usize,
    pub top_k: usize,
    pub dispatch_threshold: f32,
    pub min_pose_confidence: f32,
    pub min_part_confidence: f32,
}

impl From<&Configuration> for LoopSettings {
    fn from(config: &Configuration) -> Self {
        Self {
            num_classes: config.num_classes,
            top_k: config.top_k,
            dispatch_threshold: config.dispatch_threshold,
            min_pose_confidence: config.min_pose_confidence,
            min_part_confidence: config.min_part_confidence,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&Configuration::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Training(Label),
    Predicting,
    WarmIdle,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    Idle,
    NoFrame,
    /// A collaborator failed; the next tick retries.
    Skipped,
    WarmIdle {
        pose: Option<Pose>,
    },
    Trained {
        label: Label,
        examples: usize,
        pose: Option<Pose>,
    },
    Rejected {
        label: Label,
    },
    Predicted {
        prediction: Prediction,
        dispatched: bool,
        pose: Option<Pose>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopStatus {
    pub state: LoopState,
    pub example_counts: Vec<usize>,
}

pub struct DetectionLoop {
    settings: LoopSettings,
    classifier: ExampleClassifier,
    frames: Box<dyn FrameSource>,
    pose_estimator: Box<dyn PoseEstimator>,
    extractor: Box<dyn EmbeddingExtractor>,
    dispatcher: Box<dyn CommandDispatcher>,
    is_detecting: bool,
    training_label: Option<Label>,
    is_playing: bool,
}

impl DetectionLoop {
    pub fn new(
        settings: LoopSettings,
        frames: Box<dyn FrameSource>,
        pose_estimator: Box<dyn PoseEstimator>,
        extractor: Box<dyn EmbeddingExtractor>,
        dispatcher: Box<dyn CommandDispatcher>,
    ) -> Self {
        let classifier = ExampleClassifier::new(extractor.dim(), settings.num_classes);
        Self {
            settings,
            classifier,
            frames,
            pose_estimator,
            extractor,
            dispatcher,
            is_detecting: false,
            training_label: None,
            is_playing: false,
        }
    }

    pub fn classifier(&self) -> &ExampleClassifier {
        &self.classifier
    }

    pub fn is_detecting(&self) -> bool {
        self.is_detecting
    }

    pub fn state(&self) -> LoopState {
        if !self.is_detecting || !self.is_playing {
            LoopState::Idle
        } else if let Some(label) = self.training_label {
            LoopState::Training(label)
        } else if self.classifier.class_count() > 0 {
            LoopState::Predicting
        } else {
            LoopState::WarmIdle
        }
    }

    pub fn status(&self) -> LoopStatus {
        LoopStatus {
            state: self.state(),
            example_counts: self.classifier.example_counts(),
        }
    }

    pub fn apply_control(&mut self, signal: ControlSignal) -> Result<()> {
        match signal {
            ControlSignal::On => {
                if self.is_detecting {
                    return Ok(());
                }
                self.frames.start().context("failed to acquire frame source")?;
                self.is_playing = true;
                self.is_detecting = true;
                log::info!("detection on");
            }
            ControlSignal::Off => {
                if !self.is_detecting {
                    return Ok(());
                }
                self.is_detecting = false;
                self.is_playing = false;
                self.frames.stop();
                log::info!("detection off");
            }
        }
        Ok(())
    }

    pub fn set_playing(&mut self, playing: bool) {
        self.is_playing = playing;
    }

    pub fn start_training(&mut self, label: Label) -> Result<(), ClassifierError> {
        if label >= self.settings.num_classes {
            return Err(ClassifierError::UnknownLabel {
                label,
                num_classes: self.settings.num_classes,
            });
        }
        self.training_label = Some(label);
        Ok(())
    }

    pub fn stop_training(&mut self) {
        self.training_label = None;
    }

    pub fn save_classifier(&mut self, path: &Path) -> Result<(), ClassifierError> {
        self.stop_training();
        let graph = codec::encode(&self.classifier)?;
        codec::save_graph(&graph, path)
    }

    pub fn load_classifier(&mut self, path: &Path) -> Result<(), ClassifierError> {
        self.stop_training();
        let graph = codec::load_graph(path)?;
        codec::restore(&mut self.classifier, &graph)?;
        log::info!(
            "classifier loaded from {} ({:?} examples per pose)",
            path.display(),
            self.classifier.example_counts()
        );
        Ok(())
    }

    /// Runs one detection step. Everything acquired here is dropped before
    /// returning, whichever branch exits.
    pub fn tick(&mut self) -> TickOutcome {
        let state = self.state();
        if state == LoopState::Idle {
            return TickOutcome::Idle;
        }

        let Some(frame) = self.frames.latest_frame() else {
            return TickOutcome::NoFrame;
        };

        let pose = match self.pose_estimator.estimate(&frame) {
            Ok(pose) => pose.drawable(
                self.settings.min_pose_confidence,
                self.settings.min_part_confidence,
            ),
            Err(err) => {
                log::warn!("pose estimation failed: {err:?}");
                return TickOutcome::Skipped;
            }
        };

        if state == LoopState::WarmIdle {
            return TickOutcome::WarmIdle { pose };
        }

        let embedding = match self.extractor.extract(&frame) {
            Ok(embedding) => embedding,
            Err(err) => {
                log::warn!("embedding extraction failed: {err:?}");
                return TickOutcome::Skipped;
            }
        };
        drop(frame);

        if let LoopState::Training(label) = state {
            return match self.classifier.add_example(embedding, label) {
                Ok(()) => TickOutcome::Trained {
                    label,
                    examples: self.classifier.example_count(label),
                    pose,
                },
                Err(err) => {
                    log::warn!("example for pose {label} rejected: {err}");
                    TickOutcome::Rejected { label }
                }
            };
        }

        let prediction = match self.classifier.predict(&embedding, self.settings.top_k) {
            Ok(prediction) => prediction,
            Err(ClassifierError::EmptyClassifier) => return TickOutcome::WarmIdle { pose },
            Err(err) => {
                log::warn!("prediction failed: {err}");
                return TickOutcome::Skipped;
            }
        };
        log::debug!("{}", prediction.display_text());

        let mut dispatched = false;
        if prediction.confidence() > self.settings.dispatch_threshold {
            match self
                .dispatcher
                .dispatch(prediction.label, prediction.confidence())
            {
                Ok(()) => dispatched = true,
                Err(err) => log::warn!("dispatch for pose {} failed: {err:?}", prediction.label),
            }
        }

        TickOutcome::Predicted {
            prediction,
            dispatched,
            pose,
        }
    }

    /// Releases the frame source; used when the hosting loop exits.
    pub fn shutdown(&mut self) {
        if let Err(err) = self.apply_control(ControlSignal::Off) {
            log::warn!("failed to stop detection: {err:?}");
        }
    }
}
