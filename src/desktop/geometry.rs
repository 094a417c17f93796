//! Multi-display geometry
//!
//! Two OS APIs describe the desktop differently: the capture API reports
//! monitors with a top-left origin, the pointer-query API reports display
//! bounds and the cursor with a bottom-left origin. The resolver queries
//! both independently and converts pointer samples into image space in
//! exactly one place, [`DisplayGeometryResolver::to_image_space`].

use image::RgbaImage;
use tracing::{debug, info, warn};

use crate::desktop::types::{Canvas, GlobalBounds, Monitor, PointerRect};
use crate::error::{CaptureError, CaptureResult};

/// OS capture handle: display enumeration, pointer queries and frame grabs
pub trait CaptureSession: Send {
    /// Active monitors in the capture API's convention, in enumeration order
    fn monitors(&mut self) -> CaptureResult<Vec<Monitor>>;

    /// Active displays in the pointer-query API's convention
    fn pointer_displays(&mut self) -> CaptureResult<Vec<PointerRect>>;

    /// Current pointer position in the pointer-query API's convention
    fn pointer_position(&mut self) -> CaptureResult<(f64, f64)>;

    /// Grabs the raw pixels of the whole canvas
    fn grab_canvas(&mut self, canvas: &Canvas) -> CaptureResult<RgbaImage>;

    /// Releases the OS resources held by the session
    fn close(&mut self) -> CaptureResult<()>;
}

/// Describes monitors in a bottom-left-origin space anchored at the lowest
/// display edge, the layout pointer-query APIs use.
pub fn pointer_rects_for(monitors: &[Monitor]) -> Vec<PointerRect> {
    let Some(canvas) = Canvas::enclosing(monitors) else {
        return Vec::new();
    };
    let base = canvas.bottom() as f64;

    monitors
        .iter()
        .map(|m| PointerRect {
            x: m.left as f64,
            y: base - m.bottom() as f64,
            width: m.width as f64,
            height: m.height as f64,
        })
        .collect()
}

/// Flips an absolute top-left pointer position into bottom-left form,
/// measured against the canvas height.
///
/// The axis differs from [`pointer_rects_for`] on purpose. Those rects are
/// flipped about `canvas.bottom()`, which puts their `max_y` at
/// `canvas.height`. `to_image_space` subtracts both `pointer_y` and
/// `canvas.top` from `max_y`, so the pointer has to be flipped about
/// `max_y` alone for the result to equal `y - canvas.top`. When
/// `canvas.top` is not zero the flipped pointer is offset from the rects by
/// `canvas.top`; only the image-space result is meaningful.
pub fn pointer_from_top_left(canvas: &Canvas, x: f64, y: f64) -> (f64, f64) {
    (x, canvas.height as f64 - y)
}

/// Resolves display geometry and owns the capture session for a recording
pub struct DisplayGeometryResolver {
    session: Option<Box<dyn CaptureSession>>,
    monitors: Vec<Monitor>,
    canvas: Canvas,
    bounds: GlobalBounds,
}

impl std::fmt::Debug for DisplayGeometryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayGeometryResolver")
            .field("monitors", &self.monitors)
            .field("canvas", &self.canvas)
            .field("bounds", &self.bounds)
            .field("released", &self.session.is_none())
            .finish()
    }
}

impl DisplayGeometryResolver {
    /// Queries the session once and fixes the geometry for the recording
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NoActiveDisplay` if either API reports no
    /// displays, or the session's own error if a query fails.
    pub fn new(session: Box<dyn CaptureSession>) -> CaptureResult<Self> {
        let mut resolver = Self {
            session: Some(session),
            monitors: Vec::new(),
            canvas: Canvas {
                left: 0,
                top: 0,
                width: 0,
                height: 0,
            },
            bounds: GlobalBounds {
                min_x: 0.0,
                min_y: 0.0,
                max_x: 0.0,
                max_y: 0.0,
            },
        };

        let monitors = resolver.query_monitors()?;
        let canvas = Canvas::enclosing(&monitors).ok_or(CaptureError::NoActiveDisplay)?;
        let bounds = resolver.query_global_bounds()?;

        info!("Detected {} monitor(s)", monitors.len());
        for monitor in &monitors {
            info!(
                "  Monitor {}: {}x{} at ({}, {})",
                monitor.id, monitor.width, monitor.height, monitor.left, monitor.top
            );
        }
        info!(
            "Combined canvas: {}x{} offset ({}, {})",
            canvas.width, canvas.height, canvas.left, canvas.top
        );
        info!(
            "Pointer-space bounds: ({}, {}) - ({}, {})",
            bounds.min_x, bounds.min_y, bounds.max_x, bounds.max_y
        );
        if (bounds.width() - canvas.width as f64).abs() > f64::EPSILON
            || (bounds.height() - canvas.height as f64).abs() > f64::EPSILON
        {
            warn!(
                "Pointer space ({}x{}) and canvas ({}x{}) disagree in size",
                bounds.width(),
                bounds.height(),
                canvas.width,
                canvas.height
            );
        }

        resolver.monitors = monitors;
        resolver.canvas = canvas;
        resolver.bounds = bounds;
        Ok(resolver)
    }

    fn session(&mut self) -> CaptureResult<&mut Box<dyn CaptureSession>> {
        self.session.as_mut().ok_or(CaptureError::Released)
    }

    /// Enumerates the active monitors
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NoActiveDisplay` for an empty display list.
    pub fn query_monitors(&mut self) -> CaptureResult<Vec<Monitor>> {
        let monitors = self.session()?.monitors()?;
        if monitors.is_empty() {
            return Err(CaptureError::NoActiveDisplay);
        }
        Ok(monitors)
    }

    /// Computes the canvas enclosing every monitor
    pub fn query_canvas(&mut self) -> CaptureResult<Canvas> {
        let monitors = self.query_monitors()?;
        Canvas::enclosing(&monitors).ok_or(CaptureError::NoActiveDisplay)
    }

    /// Computes the bounding box of all displays in pointer space
    pub fn query_global_bounds(&mut self) -> CaptureResult<GlobalBounds> {
        let rects = self.session()?.pointer_displays()?;
        GlobalBounds::enclosing(&rects).ok_or(CaptureError::NoActiveDisplay)
    }

    /// Monitors fixed at startup
    pub fn monitors(&self) -> &[Monitor] {
        &self.monitors
    }

    /// Canvas fixed at startup
    pub fn canvas(&self) -> Canvas {
        self.canvas
    }

    /// Pointer-space bounds fixed at startup
    pub fn global_bounds(&self) -> GlobalBounds {
        self.bounds
    }

    /// Converts a pointer-space position into image space
    pub fn to_image_space(&self, pointer_x: f64, pointer_y: f64) -> (f64, f64) {
        let image_x = pointer_x - self.canvas.left as f64;
        let image_y = self.bounds.max_y - pointer_y - self.canvas.top as f64;
        (image_x, image_y)
    }

    /// Queries the pointer and returns its image-space position
    pub fn sample_cursor(&mut self) -> CaptureResult<(f64, f64)> {
        let (x, y) = self.session()?.pointer_position()?;
        let converted = self.to_image_space(x, y);
        debug!(
            "Cursor pointer=({}, {}) image=({}, {})",
            x, y, converted.0, converted.1
        );
        Ok(converted)
    }

    /// Grabs the raw canvas raster
    pub fn grab(&mut self) -> CaptureResult<RgbaImage> {
        let canvas = self.canvas;
        self.session()?.grab_canvas(&canvas)
    }

    /// Closes the capture session; later calls are no-ops
    pub fn release(&mut self) -> CaptureResult<()> {
        match self.session.take() {
            Some(mut session) => {
                info!("Releasing capture session");
                session.close()
            }
            None => Ok(()),
        }
    }

    /// Returns true once the capture session has been released
    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }
}

impl Drop for DisplayGeometryResolver {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release capture session: {}", e);
        }
    }
}
