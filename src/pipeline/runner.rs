use std::{path::PathBuf, thread, time::Duration};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, select};

use super::{ControlSignal, DetectionLoop, LoopStatus, TickOutcome};
use crate::{error::ClassifierError, types::Label};

pub type Reply = Sender<Result<(), ClassifierError>>;

pub enum LoopEvent {
    Control(ControlSignal),
    StartTraining(Label),
    StopTraining,
    SourcePlaying(bool),
    Save { path: PathBuf, reply: Reply },
    Load { path: PathBuf, reply: Reply },
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub status: LoopStatus,
}

pub struct LoopHandle {
    events: Sender<LoopEvent>,
    reports: Receiver<TickReport>,
    handle: Option<thread::JoinHandle<DetectionLoop>>,
}

impl LoopHandle {
    pub fn sender(&self) -> Sender<LoopEvent> {
        self.events.clone()
    }

    pub fn send(&self, event: LoopEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow!("detection loop has stopped"))
    }

    pub fn reports(&self) -> &Receiver<TickReport> {
        &self.reports
    }

    /// Stops the worker and hands back the loop with its classifier.
    pub fn join(mut self) -> Result<DetectionLoop> {
        let _ = self.events.send(LoopEvent::Shutdown);
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("detection loop already joined"))?;
        handle
            .join()
            .map_err(|_| anyhow!("detection loop panicked"))
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.events.send(LoopEvent::Shutdown);
            let _ = handle.join();
        }
    }
}

pub fn spawn_detection_loop(detection: DetectionLoop, interval: Duration) -> LoopHandle {
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let (report_tx, report_rx) = crossbeam_channel::bounded(1);
    let handle = thread::spawn(move || run_loop(detection, event_rx, report_tx, interval));
    LoopHandle {
        events: event_tx,
        reports: report_rx,
        handle: Some(handle),
    }
}

fn run_loop(
    mut detection: DetectionLoop,
    events: Receiver<LoopEvent>,
    reports: Sender<TickReport>,
    interval: Duration,
) -> DetectionLoop {
    log::info!("detection loop started ({} ms per tick)", interval.as_millis());
    let ticker = crossbeam_channel::tick(interval);

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(LoopEvent::Shutdown) | Err(_) => break,
                Ok(event) => handle_event(&mut detection, event),
            },
            recv(ticker) -> _ => {
                let outcome = detection.tick();
                if outcome != TickOutcome::Idle {
                    let report = TickReport {
                        outcome,
                        status: detection.status(),
                    };
                    // Drop if the consumer is busy.
                    let _ = reports.try_send(report);
                }
            }
        }
    }

    detection.shutdown();
    log::info!("detection loop stopped");
    detection
}

fn handle_event(detection: &mut DetectionLoop, event: LoopEvent) {
    match event {
        LoopEvent::Control(signal) => {
            if let Err(err) = detection.apply_control(signal) {
                log::error!("control {signal:?} failed: {err:?}");
            }
        }
        LoopEvent::StartTraining(label) => {
            if let Err(err) = detection.start_training(label) {
                log::warn!("cannot train: {err}");
            }
        }
        LoopEvent::StopTraining => detection.stop_training(),
        LoopEvent::SourcePlaying(playing) => detection.set_playing(playing),
        LoopEvent::Save { path, reply } => {
            let result = detection.save_classifier(&path);
            if let Err(err) = &result {
                log::error!("failed to save classifier to {}: {err}", path.display());
            }
            let _ = reply.send(result);
        }
        LoopEvent::Load { path, reply } => {
            let result = detection.load_classifier(&path);
            if let Err(err) = &result {
                log::error!("failed to load classifier from {}: {err}", path.display());
            }
            let _ = reply.send(result);
        }
        LoopEvent::Shutdown => {}
    }
}
