//! Desktop capture
//!
//! This module handles everything on the capture side:
//! - Display geometry and pointer coordinate conversion
//! - Frame composition (display mask, borders, downscale)
//! - The frame producer loop
//! - Capture session backends

pub mod capture;
pub mod compose;
pub mod geometry;
#[cfg(feature = "native")]
pub mod native;
pub mod synthetic;
pub mod types;

// Re-export commonly used types
pub use capture::{FrameProducer, ProducerHandle, ProducerSettings};
pub use compose::FrameComposer;
pub use geometry::{CaptureSession, DisplayGeometryResolver};
#[cfg(feature = "native")]
pub use native::NativeSession;
pub use synthetic::SyntheticSession;
pub use types::{
    Canvas, CaptureStats, CaptureStatsSnapshot, CaptureTime, CursorSample, Fps, Frame, FrameJob,
    GlobalBounds, Monitor, PointerRect, DEFAULT_DOWNSCALE, DEFAULT_FPS, MAX_FPS, MIN_FPS,
};

use crate::config::CaptureBackend;
use crate::error::{CaptureError, CaptureResult};

/// Layout of the synthetic backend when run from the command line
const SYNTHETIC_LAYOUT: (u32, u32) = (1920, 1080);

/// Opens a capture session for the configured backend
pub fn open_session(backend: CaptureBackend) -> CaptureResult<Box<dyn CaptureSession>> {
    match backend {
        CaptureBackend::Synthetic => {
            let (width, height) = SYNTHETIC_LAYOUT;
            Ok(Box::new(SyntheticSession::single(width, height)))
        }
        #[cfg(feature = "native")]
        CaptureBackend::Native => Ok(Box::new(NativeSession::new())),
        #[cfg(not(feature = "native"))]
        CaptureBackend::Native => Err(CaptureError::BackendUnavailable("native".to_string())),
    }
}
