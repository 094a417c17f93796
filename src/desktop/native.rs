//! Native capture session backed by `xcap` and `device_query`
//!
//! Both libraries report top-left coordinates, so the pointer side is
//! translated into the bottom-left convention before it reaches the
//! resolver.

use device_query::{DeviceQuery, DeviceState};
use image::{imageops, RgbaImage};
use tracing::{debug, info, warn};

use crate::desktop::geometry::{pointer_from_top_left, pointer_rects_for, CaptureSession};
use crate::desktop::types::{Canvas, Monitor, PointerRect};
use crate::error::{CaptureError, CaptureResult};

/// Capture session over the real desktop
#[derive(Debug, Default)]
pub struct NativeSession {
    monitors: Vec<Monitor>,
    closed: bool,
}

impl NativeSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> CaptureResult<()> {
        if self.closed {
            return Err(CaptureError::Released);
        }
        Ok(())
    }

    fn enumerate() -> CaptureResult<Vec<(Monitor, xcap::Monitor)>> {
        let monitors =
            xcap::Monitor::all().map_err(|e| CaptureError::Enumeration(e.to_string()))?;

        let mut described = Vec::with_capacity(monitors.len());
        for (index, monitor) in monitors.into_iter().enumerate() {
            let enumeration = |e: xcap::XCapError| CaptureError::Enumeration(e.to_string());
            let geometry = Monitor::new(
                monitor.id().unwrap_or(index as u32),
                monitor.x().map_err(enumeration)?,
                monitor.y().map_err(enumeration)?,
                monitor.width().map_err(enumeration)?,
                monitor.height().map_err(enumeration)?,
            );
            described.push((geometry, monitor));
        }
        Ok(described)
    }

    fn canvas(&self) -> CaptureResult<Canvas> {
        Canvas::enclosing(&self.monitors).ok_or(CaptureError::NoActiveDisplay)
    }
}

impl CaptureSession for NativeSession {
    fn monitors(&mut self) -> CaptureResult<Vec<Monitor>> {
        self.ensure_open()?;
        self.monitors = Self::enumerate()?
            .into_iter()
            .map(|(geometry, _)| geometry)
            .collect();
        info!("Native session found {} displays", self.monitors.len());
        Ok(self.monitors.clone())
    }

    fn pointer_displays(&mut self) -> CaptureResult<Vec<PointerRect>> {
        self.ensure_open()?;
        if self.monitors.is_empty() {
            self.monitors()?;
        }
        Ok(pointer_rects_for(&self.monitors))
    }

    fn pointer_position(&mut self) -> CaptureResult<(f64, f64)> {
        self.ensure_open()?;
        let canvas = self.canvas()?;
        let (x, y) = DeviceState::new().get_mouse().coords;
        Ok(pointer_from_top_left(&canvas, x as f64, y as f64))
    }

    fn grab_canvas(&mut self, canvas: &Canvas) -> CaptureResult<RgbaImage> {
        self.ensure_open()?;
        let mut raster = RgbaImage::new(canvas.width, canvas.height);

        for (geometry, monitor) in Self::enumerate()? {
            let image = monitor
                .capture_image()
                .map_err(|e| CaptureError::Grab(e.to_string()))?;
            if image.dimensions() != (geometry.width, geometry.height) {
                // HiDPI scaling: the grab is in physical pixels
                warn!(
                    "Display {} grabbed at {:?}, expected {}x{}",
                    geometry.id,
                    image.dimensions(),
                    geometry.width,
                    geometry.height
                );
            }
            let (x, y) = canvas.relative(&geometry);
            imageops::replace(&mut raster, &image, x as i64, y as i64);
        }

        debug!("Grabbed {}x{} canvas", canvas.width, canvas.height);
        Ok(raster)
    }

    fn close(&mut self) -> CaptureResult<()> {
        self.closed = true;
        self.monitors.clear();
        Ok(())
    }
}
