//! Frame composition
//!
//! Turns a raw canvas grab into the frame the sinks persist: everything
//! outside the displays becomes transparent, display corners are rounded,
//! each display gets a border and the result is downscaled. Also draws the
//! optional cursor marker used by the file sink.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use crate::desktop::types::{Canvas, Monitor};

/// Corner radius of the display mask, in canvas pixels
pub const DISPLAY_CORNER_RADIUS: u32 = 24;

/// Border thickness drawn around each display, in canvas pixels
pub const DISPLAY_BORDER_WIDTH: u32 = 6;

/// Radius of the cursor marker circle, in canvas pixels
pub const CURSOR_MARKER_RADIUS: u32 = 20;

const BORDER_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const MARKER_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const MARKER_OUTLINE_WIDTH: f32 = 3.0;
const CROSSHAIR_WIDTH: u32 = 2;
const CROSSHAIR_OVERHANG: u32 = 10;

/// Rectangle with rounded corners in canvas-relative pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
struct RoundedRect {
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
    radius: f32,
}

impl RoundedRect {
    /// Corner radius is capped at half the shorter side; an inverted
    /// rectangle gets radius 0 and contains nothing
    fn new(x0: f32, y0: f32, x1: f32, y1: f32, radius: f32) -> Self {
        let radius = radius.min((x1 - x0) / 2.0).min((y1 - y0) / 2.0).max(0.0);
        Self {
            x0,
            y0,
            x1,
            y1,
            radius,
        }
    }

    fn inset(&self, by: f32) -> Self {
        Self::new(
            self.x0 + by,
            self.y0 + by,
            self.x1 - by,
            self.y1 - by,
            self.radius - by,
        )
    }

    /// Tests the centre of pixel (x, y)
    fn contains(&self, x: u32, y: u32) -> bool {
        let px = x as f32 + 0.5;
        let py = y as f32 + 0.5;
        if px < self.x0 || px > self.x1 || py < self.y0 || py > self.y1 {
            return false;
        }

        // Distance to the inner rectangle the corner arcs are centred on
        let cx = px.clamp(self.x0 + self.radius, self.x1 - self.radius);
        let cy = py.clamp(self.y0 + self.radius, self.y1 - self.radius);
        let (dx, dy) = (px - cx, py - cy);
        dx * dx + dy * dy <= self.radius * self.radius
    }

    /// Pixel range covered by the rectangle, clipped to the image
    fn pixel_bounds(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clip = |v: f32, max: u32| (v.max(0.0) as u32).min(max);
        (
            clip(self.x0.floor(), width),
            clip(self.y0.floor(), height),
            clip(self.x1.ceil(), width),
            clip(self.y1.ceil(), height),
        )
    }
}

/// Composes raw canvas grabs into transparent, bordered, downscaled frames
#[derive(Debug, Clone)]
pub struct FrameComposer {
    displays: Vec<RoundedRect>,
    output_size: (u32, u32),
}

impl FrameComposer {
    /// Creates a composer for the given monitor layout
    pub fn new(monitors: &[Monitor], canvas: &Canvas, scale: f32) -> Self {
        let displays = monitors
            .iter()
            .map(|monitor| {
                let (x, y) = canvas.relative(monitor);
                RoundedRect::new(
                    x as f32,
                    y as f32,
                    (x + monitor.width as i32) as f32,
                    (y + monitor.height as i32) as f32,
                    DISPLAY_CORNER_RADIUS as f32,
                )
            })
            .collect();

        Self {
            displays,
            output_size: canvas.scaled_size(scale),
        }
    }

    /// Size of the frames this composer produces
    pub fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    /// Masks, borders and downscales a raw canvas grab
    pub fn compose(&self, mut canvas: RgbaImage) -> RgbaImage {
        self.apply_display_mask(&mut canvas);
        self.draw_borders(&mut canvas);
        downscale(&canvas, self.output_size)
    }

    /// Makes every pixel outside the rounded display areas transparent
    fn apply_display_mask(&self, image: &mut RgbaImage) {
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let visible = self.displays.iter().any(|d| d.contains(x, y));
            pixel[3] = if visible { 255 } else { 0 };
        }
    }

    fn draw_borders(&self, image: &mut RgbaImage) {
        let (width, height) = image.dimensions();
        for display in &self.displays {
            let inner = display.inset(DISPLAY_BORDER_WIDTH as f32);
            let (x0, y0, x1, y1) = display.pixel_bounds(width, height);
            for y in y0..y1 {
                for x in x0..x1 {
                    if display.contains(x, y) && !inner.contains(x, y) {
                        image.put_pixel(x, y, BORDER_COLOR);
                    }
                }
            }
        }
    }
}

/// Resizes an image to `size` with a Lanczos filter; a no-op at full size
pub fn downscale(image: &RgbaImage, size: (u32, u32)) -> RgbaImage {
    if image.dimensions() == size {
        return image.clone();
    }
    imageops::resize(image, size.0, size.1, FilterType::Lanczos3)
}

/// Draws a circle with a crosshair centred on (cx, cy)
///
/// Marker dimensions are given at capture resolution and scaled by `scale`
/// so the marker looks the same on downscaled frames.
pub fn draw_cursor_marker(image: &mut RgbaImage, cx: f64, cy: f64, scale: f32) {
    let (width, height) = image.dimensions();
    let radius = CURSOR_MARKER_RADIUS as f32 * scale;
    let outline = (MARKER_OUTLINE_WIDTH * scale).max(1.0);
    let overhang = CROSSHAIR_OVERHANG as f32 * scale;
    let line_half = ((CROSSHAIR_WIDTH as f32 * scale).max(1.0) / 2.0).max(0.5);
    let (cx, cy) = (cx as f32, cy as f32);

    let reach = radius + overhang + 1.0;
    let min_x = (cx - reach).floor().max(0.0) as u32;
    let min_y = (cy - reach).floor().max(0.0) as u32;
    let max_x = ((cx + reach).ceil().max(0.0) as u32).min(width);
    let max_y = ((cy + reach).ceil().max(0.0) as u32).min(height);

    let outer_sq = radius * radius;
    let inner = (radius - outline).max(0.0);
    let inner_sq = inner * inner;

    for y in min_y..max_y {
        for x in min_x..max_x {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            let dist_sq = dx * dx + dy * dy;

            let on_ring = dist_sq <= outer_sq && dist_sq >= inner_sq;
            let on_horizontal = dy.abs() <= line_half && dx.abs() <= radius + overhang;
            let on_vertical = dx.abs() <= line_half && dy.abs() <= radius + overhang;

            if on_ring || on_horizontal || on_vertical {
                image.put_pixel(x, y, MARKER_COLOR);
            }
        }
    }
}
