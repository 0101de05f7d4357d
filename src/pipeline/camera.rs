use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    utils::{CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
};
use rayon::prelude::*;

use super::FrameSource;
use crate::types::Frame;

// Prefer pixel formats that are widely supported on macOS (the built-in cameras
// often reject YUYV even though Nokhwa reports it).
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::MJPEG,
    FrameFormat::NV12,
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
];

fn requested_formats() -> [RequestedFormat<'static>; 3] {
    [
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

fn build_camera(index: CameraIndex) -> Result<Camera> {
    let mut last_err = None;

    for requested in requested_formats() {
        match Camera::new(index.clone(), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
}

struct CaptureThread {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CaptureThread {
    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The capture thread owns the device and reports whether opening it worked.
/// On failure the thread is joined before the error is returned.
fn wait_until_open(ready_rx: &Receiver<Result<()>>, capture: &mut CaptureThread) -> Result<()> {
    let opened = ready_rx
        .recv()
        .unwrap_or_else(|_| Err(anyhow!("camera thread exited before opening the device")));
    if opened.is_err() {
        capture.halt();
    }
    opened
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Webcam frames via nokhwa. The device is held only between `start` and `stop`.
pub struct NokhwaFrameSource {
    index: CameraIndex,
    capture: Option<CaptureThread>,
    frame_rx: Option<Receiver<Frame>>,
}

impl NokhwaFrameSource {
    pub fn new(index: u32) -> Self {
        Self {
            index: CameraIndex::Index(index),
            capture: None,
            frame_rx: None,
        }
    }
}

impl FrameSource for NokhwaFrameSource {
    fn start(&mut self) -> Result<()> {
        self.stop();

        let (frame_tx, frame_rx) = crossbeam_channel::bounded(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let index = self.index.clone();
        let stale_rx = frame_rx.clone();
        let handle = thread::spawn(move || {
            capture_loop(index, stop_flag, ready_tx, frame_tx, stale_rx)
        });
        let mut capture = CaptureThread {
            stop,
            handle: Some(handle),
        };

        wait_until_open(&ready_rx, &mut capture)?;

        self.capture = Some(capture);
        self.frame_rx = Some(frame_rx);
        log::info!("camera {} started", self.index.as_string());
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.halt();
            log::info!("camera {} released", self.index.as_string());
        }
        self.frame_rx = None;
    }

    fn latest_frame(&mut self) -> Option<Frame> {
        let frame_rx = self.frame_rx.as_ref()?;
        let mut frame = frame_rx.try_recv().ok()?;
        while let Ok(newer) = frame_rx.try_recv() {
            frame = newer;
        }
        Some(frame)
    }
}

fn capture_loop(
    index: CameraIndex,
    stop_flag: Arc<AtomicBool>,
    ready_tx: Sender<Result<()>>,
    frame_tx: Sender<Frame>,
    stale_rx: Receiver<Frame>,
) {
    let mut camera = match build_camera(index) {
        Ok(cam) => cam,
        Err(err) => {
            let _ = ready_tx.send(Err(err.context("failed to open camera")));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    while !stop_flag.load(Ordering::Relaxed) {
        let frame = match camera.frame() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("camera frame read failed: {err:?}");
                continue;
            }
        };

        let decoded = match frame.decode_image::<RgbFormat>() {
            Ok(img) => img,
            Err(err) => {
                log::warn!("failed to decode camera frame: {err:?}");
                continue;
            }
        };

        let (width, height) = decoded.dimensions();
        let rgb = decoded.into_raw();
        if rgb.is_empty() {
            continue;
        }

        let mut rgba = vec![0u8; rgb.len() / 3 * 4];
        rgba.par_chunks_mut(4)
            .zip(rgb.par_chunks_exact(3))
            .for_each(|(dst, src)| {
                dst[..3].copy_from_slice(src);
                dst[3] = 255;
            });

        let frame = Frame {
            rgba,
            width,
            height,
            timestamp: Instant::now(),
        };
        // Replace the previous frame if the detection loop has not taken it.
        if let Err(TrySendError::Full(frame)) = frame_tx.try_send(frame) {
            let _ = stale_rx.try_recv();
            let _ = frame_tx.try_send(frame);
        }
    }

    if let Err(err) = camera.stop_stream() {
        log::warn!("failed to stop camera stream: {err:?}");
    }
}
