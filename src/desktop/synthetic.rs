//! Synthetic capture session
//!
//! A virtual display layout that renders gradient frames and moves the
//! pointer on a circle around the canvas centre. Used for headless runs and
//! tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use tracing::debug;

use crate::desktop::geometry::{pointer_from_top_left, pointer_rects_for, CaptureSession};
use crate::desktop::types::{Canvas, Monitor, PointerRect};
use crate::error::{CaptureError, CaptureResult};

/// Time for the moving pointer to complete one circle
const POINTER_PERIOD: Duration = Duration::from_secs(4);

/// Capture session over a virtual display layout
#[derive(Debug)]
pub struct SyntheticSession {
    monitors: Vec<Monitor>,
    canvas: Option<Canvas>,
    started: Instant,
    /// Canvas-relative pointer position; `None` moves the pointer
    fixed_pointer: Option<(f64, f64)>,
    failing_grabs: u32,
    panic_at_grab: Option<u64>,
    failing_close: bool,
    grabs: u64,
    closed: Arc<AtomicBool>,
}

impl SyntheticSession {
    pub fn new(monitors: Vec<Monitor>) -> Self {
        let canvas = Canvas::enclosing(&monitors);
        Self {
            monitors,
            canvas,
            started: Instant::now(),
            fixed_pointer: None,
            failing_grabs: 0,
            panic_at_grab: None,
            failing_close: false,
            grabs: 0,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One display of the given size at the origin
    pub fn single(width: u32, height: u32) -> Self {
        Self::new(vec![Monitor::new(0, 0, 0, width, height)])
    }

    /// Pins the pointer at a canvas-relative position
    pub fn with_fixed_pointer(mut self, x: f64, y: f64) -> Self {
        self.fixed_pointer = Some((x, y));
        self
    }

    /// Makes the first `count` grabs fail
    pub fn with_failing_grabs(mut self, count: u32) -> Self {
        self.failing_grabs = count;
        self
    }

    /// Panics inside the grab once `grabs` frames were produced
    pub fn with_panicking_grab(mut self, grabs: u64) -> Self {
        self.panic_at_grab = Some(grabs);
        self
    }

    /// Makes `close` report an error after marking the session closed
    pub fn with_failing_close(mut self) -> Self {
        self.failing_close = true;
        self
    }

    /// Flag set once the session is closed
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    fn canvas(&self) -> CaptureResult<Canvas> {
        self.canvas.ok_or(CaptureError::NoActiveDisplay)
    }

    fn ensure_open(&self) -> CaptureResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaptureError::Released);
        }
        Ok(())
    }

    /// Canvas-relative pointer position at this instant
    fn pointer_on_canvas(&self, canvas: &Canvas) -> (f64, f64) {
        if let Some(fixed) = self.fixed_pointer {
            return fixed;
        }
        let phase = self.started.elapsed().as_secs_f64() / POINTER_PERIOD.as_secs_f64();
        let angle = phase * std::f64::consts::TAU;
        let (cx, cy) = (canvas.width as f64 / 2.0, canvas.height as f64 / 2.0);
        let radius = cx.min(cy) * 0.8;
        (cx + radius * angle.cos(), cy + radius * angle.sin())
    }
}

impl CaptureSession for SyntheticSession {
    fn monitors(&mut self) -> CaptureResult<Vec<Monitor>> {
        self.ensure_open()?;
        Ok(self.monitors.clone())
    }

    fn pointer_displays(&mut self) -> CaptureResult<Vec<PointerRect>> {
        self.ensure_open()?;
        Ok(pointer_rects_for(&self.monitors))
    }

    fn pointer_position(&mut self) -> CaptureResult<(f64, f64)> {
        self.ensure_open()?;
        let canvas = self.canvas()?;
        let (x, y) = self.pointer_on_canvas(&canvas);
        Ok(pointer_from_top_left(
            &canvas,
            x + canvas.left as f64,
            y + canvas.top as f64,
        ))
    }

    fn grab_canvas(&mut self, canvas: &Canvas) -> CaptureResult<RgbaImage> {
        self.ensure_open()?;
        if self.failing_grabs > 0 {
            self.failing_grabs -= 1;
            return Err(CaptureError::Grab("synthetic grab failure".to_string()));
        }
        if self.panic_at_grab == Some(self.grabs) {
            panic!("synthetic grab panic after {} frames", self.grabs);
        }

        // Blue carries the grab count, which equals the frame sequence
        // while no grab has failed

        let shift = (self.grabs % 256) as u32;
        self.grabs += 1;
        let (width, height) = (canvas.width.max(1), canvas.height.max(1));
        Ok(RgbaImage::from_fn(width, height, |x, y| {
            Rgba([
                ((x * 255 / width + shift) % 256) as u8,
                ((y * 255 / height) % 256) as u8,
                shift as u8,
                255,
            ])
        }))
    }

    fn close(&mut self) -> CaptureResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Synthetic session closed after {} grabs", self.grabs);
        }
        if self.failing_close {
            return Err(CaptureError::Enumeration(
                "synthetic display server went away".to_string(),
            ));
        }
        Ok(())
    }
}
