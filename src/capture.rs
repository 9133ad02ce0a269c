/*!
 * Capture Source
 *
 * Single-buffered window snapshots. The orchestrator drops the previous
 * snapshot before polling for the next one, so no frame history exists.
 */

use std::fmt;

use tracing::info;

use crate::error::CaptureError;
use crate::frame::{CaptureSnapshot, Extent2D};

#[cfg(target_os = "linux")]
pub mod x11;

/// Result of comparing the source's live size with the last one observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeChange {
    Unchanged(Extent2D),
    Resized { previous: Option<Extent2D>, current: Extent2D },
}

impl SizeChange {
    pub fn current(&self) -> Extent2D {
        match *self {
            SizeChange::Unchanged(current) | SizeChange::Resized { current, .. } => current,
        }
    }
}

/// Why a poll produced no frame. None of these end the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentReason {
    /// Source is iconified, unmapped or has no backing storage
    Unavailable,
    /// Source reports a zero-sized extent
    EmptyExtent,
    /// Pixels are not 32 bits wide
    UnsupportedDepth { bits_per_pixel: u8 },
}

impl fmt::Display for AbsentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbsentReason::Unavailable => f.write_str("source unavailable"),
            AbsentReason::EmptyExtent => f.write_str("source has zero size"),
            AbsentReason::UnsupportedDepth { bits_per_pixel } => {
                write!(f, "unsupported pixel depth ({} bpp)", bits_per_pixel)
            }
        }
    }
}

#[derive(Debug)]
pub enum CapturePoll {
    Frame(CaptureSnapshot),
    Absent(AbsentReason),
}

/// Where window pixels come from.
pub trait CaptureSource {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Compare the live size with the last observed one. Must be called
    /// before each [`CaptureSource::poll`].
    fn reconcile_size(&mut self) -> Result<SizeChange, CaptureError>;

    fn poll(&mut self) -> Result<CapturePoll, CaptureError>;
}

/// Remembers the last observed source size.
#[derive(Debug, Default, Clone)]
pub struct SizeTracker {
    last: Option<Extent2D>,
}

impl SizeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<Extent2D> {
        self.last
    }

    pub fn observe(&mut self, current: Extent2D) -> SizeChange {
        if self.last == Some(current) {
            return SizeChange::Unchanged(current);
        }
        let previous = self.last.replace(current);
        info!(
            "[Capture] Source size {} -> {}",
            previous.map_or_else(|| "none".to_string(), |e| e.to_string()),
            current
        );
        SizeChange::Resized { previous, current }
    }
}
