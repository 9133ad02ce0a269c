//! Staging Transfer Buffer
//!
//! Host-visible linear buffer of `width * height * 4` bytes holding the most
//! recent snapshot in tightly packed BGRA rows, ready to be copied into the
//! capture-resolution image.

use tracing::{debug, trace};

use crate::error::GpuResult;
use crate::frame::{CaptureSnapshot, Extent2D};
use crate::gpu::{BufferHandle, GpuDevice, MemoryHandle, MemoryLocation};

const BYTES_PER_PIXEL: usize = 4;

/// What one upload actually wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    /// Region copied from the snapshot, anchored top-left
    pub copied: Extent2D,
    /// True when the snapshot did not cover the declared extent
    pub partial: bool,
}

pub struct StagingBuffer {
    buffer: BufferHandle,
    memory: MemoryHandle,
    extent: Extent2D,
    size: u64,
}

impl StagingBuffer {
    /// Allocate a buffer sized for `extent`.
    pub fn create(device: &mut dyn GpuDevice, extent: Extent2D) -> GpuResult<Self> {
        let size = extent.pixel_count() * BYTES_PER_PIXEL as u64;
        let buffer = device.create_buffer(size)?;
        let requirements = match device.buffer_memory_requirements(buffer) {
            Ok(req) => req,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };
        let memory = match device.allocate_memory(&requirements, MemoryLocation::HostVisible) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };
        if let Err(e) = device.bind_buffer_memory(buffer, memory) {
            device.destroy_buffer(buffer);
            device.free_memory(memory);
            return Err(e);
        }

        debug!("[Staging] Created {} byte staging buffer for {}", size, extent);
        Ok(Self {
            buffer,
            memory,
            extent,
            size,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy `snapshot` into the mapped buffer.
    pub fn upload(
        &self,
        device: &mut dyn GpuDevice,
        snapshot: &CaptureSnapshot,
    ) -> GpuResult<UploadReport> {
        let declared = self.extent;
        let mut report = None;
        device.write_mapped(self.memory, self.size, &mut |dst| {
            report = Some(copy_snapshot_rows(dst, declared, snapshot));
        })?;
        let report = report.unwrap_or(UploadReport {
            copied: Extent2D::default(),
            partial: true,
        });
        trace!(
            "[Staging] Uploaded snapshot #{} ({} of {})",
            snapshot.sequence,
            report.copied,
            declared
        );
        Ok(report)
    }

    /// Release buffer and memory. The caller guarantees no in-flight work reads it.
    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_buffer(self.buffer);
        device.free_memory(self.memory);
        debug!("[Staging] Destroyed staging buffer for {}", self.extent);
    }
}

/// Copy snapshot rows into a tightly packed destination of `declared` extent.
///
/// The copied region is `min(declared, snapshot.extent)`, so a source that
/// resized between observation and capture can never write past `dst`. When
/// the copy does not cover the whole destination, `dst` is zeroed first.
pub fn copy_snapshot_rows(
    dst: &mut [u8],
    declared: Extent2D,
    snapshot: &CaptureSnapshot,
) -> UploadReport {
    let dst_stride = declared.width as usize * BYTES_PER_PIXEL;
    let mut region = declared.min(snapshot.extent);

    // Never trust the snapshot's header beyond what its buffer really holds.
    if snapshot.stride < region.width as usize * BYTES_PER_PIXEL {
        region.width = (snapshot.stride / BYTES_PER_PIXEL) as u32;
    }
    let row_bytes = region.width as usize * BYTES_PER_PIXEL;
    let available_rows = if snapshot.stride == 0 {
        0
    } else if snapshot.data.len() >= row_bytes {
        (snapshot.data.len() - row_bytes) / snapshot.stride + 1
    } else {
        0
    };
    region.height = region.height.min(available_rows as u32);
    let rows_fit = if dst_stride == 0 { 0 } else { dst.len() / dst_stride };
    region.height = region.height.min(rows_fit as u32);

    let partial = region != declared;
    if partial {
        dst.fill(0);
    }

    for y in 0..region.height as usize {
        let src_start = y * snapshot.stride;
        let dst_start = y * dst_stride;
        dst[dst_start..dst_start + row_bytes]
            .copy_from_slice(&snapshot.data[src_start..src_start + row_bytes]);
    }

    UploadReport {
        copied: region,
        partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::soft::SoftDevice;

    fn patterned(extent: Extent2D, stride: usize) -> CaptureSnapshot {
        let mut data = vec![0xee; stride * extent.height as usize];
        for y in 0..extent.height as usize {
            for x in 0..extent.width as usize {
                let o = y * stride + x * 4;
                data[o..o + 4].copy_from_slice(&[x as u8, y as u8, 0x7f, 0xff]);
            }
        }
        CaptureSnapshot::new(data, extent, stride, 1)
    }

    #[test]
    fn full_copy_drops_row_padding() {
        let declared = Extent2D::new(3, 2);
        let snap = patterned(declared, 16);
        let mut dst = vec![0xaa; 3 * 2 * 4];

        let report = copy_snapshot_rows(&mut dst, declared, &snap);

        assert_eq!(report.copied, declared);
        assert!(!report.partial);
        assert_eq!(&dst[12..16], &[0, 1, 0x7f, 0xff]);
        assert_eq!(&dst[20..24], &[2, 1, 0x7f, 0xff]);
    }

    #[test]
    fn smaller_snapshot_leaves_zeroed_border() {
        let declared = Extent2D::new(4, 4);
        let snap = patterned(Extent2D::new(2, 3), 8);
        let mut dst = vec![0xaa; 4 * 4 * 4];

        let report = copy_snapshot_rows(&mut dst, declared, &snap);

        assert_eq!(report.copied, Extent2D::new(2, 3));
        assert!(report.partial);
        for y in 0..4usize {
            for x in 0..4usize {
                let px = &dst[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
                if x < 2 && y < 3 {
                    assert_eq!(px, &[x as u8, y as u8, 0x7f, 0xff]);
                } else {
                    assert_eq!(px, &[0, 0, 0, 0], "pixel ({}, {}) not zeroed", x, y);
                }
            }
        }
    }

    #[test]
    fn larger_snapshot_is_clipped_to_declared_extent() {
        let declared = Extent2D::new(2, 2);
        let snap = patterned(Extent2D::new(5, 5), 20);
        let mut dst = vec![0u8; 2 * 2 * 4];

        let report = copy_snapshot_rows(&mut dst, declared, &snap);

        assert_eq!(report.copied, declared);
        assert_eq!(&dst[12..16], &[1, 1, 0x7f, 0xff]);
    }

    #[test]
    fn truncated_snapshot_data_never_overreads() {
        let declared = Extent2D::new(4, 4);
        let mut snap = patterned(Extent2D::new(4, 4), 16);
        snap.data.truncate(16 * 2 + 8);
        let mut dst = vec![0u8; 64];

        let report = copy_snapshot_rows(&mut dst, declared, &snap);
        assert_eq!(report.copied, Extent2D::new(4, 2));
        assert!(dst[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn upload_through_device_mapping() {
        let mut device = SoftDevice::new(Extent2D::new(8, 8));
        let staging = StagingBuffer::create(&mut device, Extent2D::new(8, 8)).unwrap();
        assert_eq!(staging.size(), 8 * 8 * 4);

        let snap = patterned(Extent2D::new(8, 8), 32);
        let report = staging.upload(&mut device, &snap).unwrap();
        assert_eq!(report.copied, Extent2D::new(8, 8));

        staging.destroy(&mut device);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_memory_count(), 0);
    }
}
