/*!
 * Frame Representation
 *
 * Extents and raw pixel snapshots handed from the capture source to the
 * staging buffer.
 */

use std::fmt;

/// Width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either side is zero (minimized or unmapped sources report this)
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Component-wise minimum
    pub fn min(self, other: Extent2D) -> Extent2D {
        Extent2D {
            width: self.width.min(other.width),
            height: self.height.min(other.height),
        }
    }

    /// Clamp each side into `[lo, hi]`
    pub fn clamp(self, lo: Extent2D, hi: Extent2D) -> Extent2D {
        Extent2D {
            width: self.width.clamp(lo.width, hi.width.max(lo.width)),
            height: self.height.clamp(lo.height, hi.height.max(lo.height)),
        }
    }
}

impl fmt::Display for Extent2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Snapshots are BGRA, 8 bits per channel: what the X server hands back for
/// 24 and 32 deep windows.
pub const BYTES_PER_PIXEL: usize = 4;

/// One raw BGRA snapshot of the target window.
///
/// Rows are `stride` bytes apart; `stride >= width * 4`. Owned exclusively by
/// the orchestrator, which drops the previous snapshot before polling the next.
#[derive(Debug, Clone)]
pub struct CaptureSnapshot {
    /// Pixel data, `stride * height` bytes
    pub data: Vec<u8>,
    /// Snapshot extent as delivered by the source
    pub extent: Extent2D,
    /// Bytes between the starts of consecutive rows
    pub stride: usize,
    /// Snapshot sequence number
    pub sequence: u64,
}

impl CaptureSnapshot {
    /// Create a snapshot from tightly packed or padded rows
    pub fn new(data: Vec<u8>, extent: Extent2D, stride: usize, sequence: u64) -> Self {
        Self {
            data,
            extent,
            stride,
            sequence,
        }
    }

    /// Create a tightly packed BGRA snapshot
    pub fn packed(data: Vec<u8>, extent: Extent2D, sequence: u64) -> Self {
        let stride = extent.width as usize * BYTES_PER_PIXEL;
        Self::new(data, extent, stride, sequence)
    }

    /// Minimum number of bytes the declared extent and stride require
    pub fn expected_size(&self) -> usize {
        if self.extent.is_empty() {
            return 0;
        }
        let row = self.extent.width as usize * BYTES_PER_PIXEL;
        self.stride * (self.extent.height as usize - 1) + row
    }

    /// Validate stride and data size against the extent
    pub fn is_valid(&self) -> bool {
        self.stride >= self.extent.width as usize * BYTES_PER_PIXEL
            && self.data.len() >= self.expected_size()
    }

    /// Row `y` without padding
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        let len = self.extent.width as usize * BYTES_PER_PIXEL;
        &self.data[start..start + len]
    }

    /// BGRA pixel at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = y as usize * self.stride + x as usize * BYTES_PER_PIXEL;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ]
    }

    /// Convert to a tightly packed RGBA buffer
    pub fn to_rgba(&self) -> Option<Vec<u8>> {
        if !self.is_valid() {
            return None;
        }

        let mut rgba = Vec::with_capacity(self.extent.pixel_count() as usize * 4);
        for y in 0..self.extent.height {
            for px in self.row(y).chunks_exact(BYTES_PER_PIXEL) {
                rgba.push(px[2]); // R = B
                rgba.push(px[1]); // G = G
                rgba.push(px[0]); // B = R
                rgba.push(0xff); // X servers leave alpha undefined for depth 24
            }
        }
        Some(rgba)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_helpers() {
        let a = Extent2D::new(800, 600);
        let b = Extent2D::new(640, 900);
        assert_eq!(a.min(b), Extent2D::new(640, 600));
        assert_eq!(a.pixel_count(), 480_000);
        assert!(Extent2D::new(0, 10).is_empty());
        assert_eq!(a.to_string(), "800x600");
    }

    #[test]
    fn test_extent_clamp() {
        let lo = Extent2D::new(1, 1);
        let hi = Extent2D::new(1920, 1080);
        assert_eq!(Extent2D::new(4000, 0).clamp(lo, hi), Extent2D::new(1920, 1));
        assert_eq!(Extent2D::new(800, 600).clamp(lo, hi), Extent2D::new(800, 600));
    }

    #[test]
    fn test_snapshot_validation() {
        let snap = CaptureSnapshot::new(vec![0u8; 2 * 12], Extent2D::new(2, 2), 12, 0);
        assert!(snap.is_valid());
        assert_eq!(snap.expected_size(), 12 + 8);

        let short = CaptureSnapshot::packed(vec![0u8; 100], Extent2D::new(1920, 1080), 0);
        assert!(!short.is_valid());
    }

    #[test]
    fn test_padded_rows_and_rgba() {
        // 2x1 pixels with 4 bytes of row padding
        let data = vec![10, 20, 30, 40, 255, 128, 64, 0, 9, 9, 9, 9];
        let snap = CaptureSnapshot::new(data, Extent2D::new(2, 1), 12, 0);
        assert_eq!(snap.row(0).len(), 8);
        assert_eq!(snap.pixel(1, 0), [255, 128, 64, 0]);

        let rgba = snap.to_rgba().unwrap();
        assert_eq!(rgba, vec![30, 20, 10, 255, 64, 128, 255, 255]);
    }

    #[test]
    fn malformed_snapshot_has_no_rgba() {
        let narrow = CaptureSnapshot::new(vec![0u8; 16], Extent2D::new(2, 2), 4, 0);
        assert!(!narrow.is_valid());
        assert!(narrow.to_rgba().is_none());

        let packed = CaptureSnapshot::packed(vec![7u8; 16], Extent2D::new(2, 2), 3);
        assert_eq!(packed.stride, 2 * BYTES_PER_PIXEL);
        assert_eq!(packed.sequence, 3);
        assert_eq!(packed.to_rgba().map(|rgba| rgba.len()), Some(16));
    }
}
