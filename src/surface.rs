//! Presentation Surface
//!
//! Swapchain selection and the `Uninitialized -> Created -> Stale ->
//! Destroyed -> Created` lifecycle. Each presentable image keeps its own
//! tracked layout, reset to `Undefined` whenever the swapchain is rebuilt.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{GpuError, GpuResult};
use crate::frame::Extent2D;
use crate::gpu::{
    AcquireOutcome, ColorSpace, GpuDevice, ImageFormat, ImageHandle, ImageLayout, PresentMode,
    PresentOutcome, SemaphoreHandle, SurfaceCapabilities, SurfaceFormat, SwapchainDesc,
    SwapchainHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Uninitialized,
    Created,
    /// The platform reported the swapchain no longer matches the window
    Stale,
    Destroyed,
}

/// One presentable image and its tracked layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainImage {
    pub handle: ImageHandle,
    pub layout: ImageLayout,
    pub extent: Extent2D,
}

/// Prefer BGRA8 UNORM in sRGB-nonlinear, then any BGRA8 format. A surface
/// reporting a single `Undefined` entry accepts anything.
pub fn choose_format(formats: &[SurfaceFormat]) -> GpuResult<SurfaceFormat> {
    const PREFERRED: SurfaceFormat = SurfaceFormat {
        format: ImageFormat::Bgra8Unorm,
        color_space: ColorSpace::SrgbNonlinear,
    };

    if formats.len() == 1 && formats[0].format == ImageFormat::Undefined {
        return Ok(PREFERRED);
    }
    if formats.contains(&PREFERRED) {
        return Ok(PREFERRED);
    }
    formats
        .iter()
        .copied()
        .find(|f| f.format.is_bgra())
        .ok_or_else(|| {
            GpuError::Unsupported(format!("surface offers no BGRA8 format ({:?})", formats))
        })
}

/// Mailbox when low latency is wanted and offered; FIFO otherwise, which
/// every conforming platform supports.
pub fn choose_present_mode(modes: &[PresentMode], prefer_low_latency: bool) -> PresentMode {
    if prefer_low_latency && modes.contains(&PresentMode::Mailbox) {
        PresentMode::Mailbox
    } else {
        PresentMode::Fifo
    }
}

pub fn choose_extent(caps: &SurfaceCapabilities, requested: Extent2D) -> Extent2D {
    match caps.current_extent {
        Some(current) => current,
        None => requested.clamp(caps.min_extent, caps.max_extent),
    }
}

pub fn choose_image_count(caps: &SurfaceCapabilities) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

#[derive(Debug)]
pub struct PresentationSurface {
    state: SurfaceState,
    swapchain: SwapchainHandle,
    desc: Option<SwapchainDesc>,
    images: Vec<SwapchainImage>,
    prefer_low_latency: bool,
    generation: u64,
}

impl PresentationSurface {
    pub fn new(prefer_low_latency: bool) -> Self {
        Self {
            state: SurfaceState::Uninitialized,
            swapchain: SwapchainHandle::NULL,
            desc: None,
            images: Vec::new(),
            prefer_low_latency,
            generation: 0,
        }
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    /// Bumped on every successful creation; identifies the live swapchain
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self) -> SwapchainHandle {
        self.swapchain
    }

    pub fn extent(&self) -> Option<Extent2D> {
        self.desc.map(|d| d.extent)
    }

    pub fn desc(&self) -> Option<SwapchainDesc> {
        self.desc
    }

    pub fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    pub fn image_mut(&mut self, index: u32) -> Option<&mut SwapchainImage> {
        self.images.get_mut(index as usize)
    }

    pub fn mark_stale(&mut self) {
        if self.state == SurfaceState::Created {
            debug!("[Surface] Marked stale");
            self.state = SurfaceState::Stale;
        }
    }

    /// True when a rebuild for `window` would produce exactly what is live.
    pub fn is_current(&mut self, device: &mut dyn GpuDevice, window: Extent2D) -> GpuResult<bool> {
        if self.state != SurfaceState::Created {
            return Ok(false);
        }
        let caps = device.surface_support()?.capabilities;
        Ok(self.extent() == Some(choose_extent(&caps, window)))
    }

    /// Build a swapchain for a window of `window` extent.
    pub fn create(&mut self, device: &mut dyn GpuDevice, window: Extent2D) -> GpuResult<()> {
        if !self.swapchain.is_null() {
            self.destroy(device)?;
        }

        let support = device.surface_support()?;
        let format = choose_format(&support.formats)?;
        let desc = SwapchainDesc {
            image_count: choose_image_count(&support.capabilities),
            format,
            extent: choose_extent(&support.capabilities, window),
            present_mode: choose_present_mode(&support.present_modes, self.prefer_low_latency),
        };
        if desc.extent.is_empty() {
            return Err(GpuError::Unsupported(format!(
                "zero-sized presentation extent for window {}",
                window
            )));
        }

        let swapchain = device.create_swapchain(&desc)?;
        self.images = swapchain
            .images
            .iter()
            .map(|&handle| SwapchainImage {
                handle,
                layout: ImageLayout::Undefined,
                extent: desc.extent,
            })
            .collect();
        self.swapchain = swapchain.handle;
        self.desc = Some(desc);
        self.state = SurfaceState::Created;
        self.generation += 1;

        info!(
            "[Surface] Swapchain #{} created: {} images, {:?}, {:?}, {}",
            self.generation,
            self.images.len(),
            desc.format.format,
            desc.present_mode,
            desc.extent
        );
        Ok(())
    }

    /// Wait for the device, then release the swapchain and its images.
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) -> GpuResult<()> {
        if self.swapchain.is_null() {
            return Ok(());
        }
        device.wait_idle()?;
        device.destroy_swapchain(self.swapchain);
        debug!("[Surface] Swapchain #{} destroyed", self.generation);
        self.swapchain = SwapchainHandle::NULL;
        self.images.clear();
        self.desc = None;
        self.state = SurfaceState::Destroyed;
        Ok(())
    }

    /// Acquire the next image. `OutOfDate` marks the surface stale;
    /// nothing was signaled in that case.
    pub fn acquire(
        &mut self,
        device: &mut dyn GpuDevice,
        signal: SemaphoreHandle,
        timeout: Duration,
    ) -> GpuResult<AcquireOutcome> {
        if self.state != SurfaceState::Created {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let outcome = device.acquire_next_image(self.swapchain, signal, timeout)?;
        match outcome {
            AcquireOutcome::OutOfDate => {
                debug!("[Surface] Acquire reported out-of-date surface");
                self.mark_stale();
            }
            AcquireOutcome::Acquired { suboptimal: true, .. } => {
                debug!("[Surface] Acquire reported suboptimal surface");
                self.mark_stale();
            }
            AcquireOutcome::Timeout => warn!("[Surface] Acquire timed out after {:?}", timeout),
            AcquireOutcome::Acquired { .. } => {}
        }
        Ok(outcome)
    }

    pub fn present(
        &mut self,
        device: &mut dyn GpuDevice,
        index: u32,
        wait: SemaphoreHandle,
    ) -> GpuResult<PresentOutcome> {
        let outcome = device.present(self.swapchain, index, wait)?;
        if outcome != PresentOutcome::Presented {
            debug!("[Surface] Present reported {:?}", outcome);
            self.mark_stale();
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::soft::SoftDevice;

    fn caps(current: Option<Extent2D>, min_count: u32, max_count: u32) -> SurfaceCapabilities {
        SurfaceCapabilities {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: current,
            min_extent: Extent2D::new(16, 16),
            max_extent: Extent2D::new(4096, 2160),
        }
    }

    #[test]
    fn format_prefers_bgra_unorm() {
        let formats = [
            SurfaceFormat {
                format: ImageFormat::Rgba8Srgb,
                color_space: ColorSpace::SrgbNonlinear,
            },
            SurfaceFormat {
                format: ImageFormat::Bgra8Unorm,
                color_space: ColorSpace::SrgbNonlinear,
            },
        ];
        assert_eq!(choose_format(&formats).unwrap().format, ImageFormat::Bgra8Unorm);
    }

    #[test]
    fn unconstrained_surface_gets_bgra_default() {
        let formats = [SurfaceFormat {
            format: ImageFormat::Undefined,
            color_space: ColorSpace::SrgbNonlinear,
        }];
        assert_eq!(choose_format(&formats).unwrap().format, ImageFormat::Bgra8Unorm);
    }

    #[test]
    fn non_bgra_surface_is_rejected() {
        let formats = [SurfaceFormat {
            format: ImageFormat::Rgba8Unorm,
            color_space: ColorSpace::Other(1000104001),
        }];
        assert!(matches!(choose_format(&formats), Err(GpuError::Unsupported(_))));
    }

    #[test]
    fn present_mode_selection() {
        let modes = [PresentMode::Fifo, PresentMode::Mailbox];
        assert_eq!(choose_present_mode(&modes, true), PresentMode::Mailbox);
        assert_eq!(choose_present_mode(&modes, false), PresentMode::Fifo);
        assert_eq!(choose_present_mode(&[PresentMode::Immediate], true), PresentMode::Fifo);
    }

    #[test]
    fn extent_uses_current_or_clamps() {
        let fixed = caps(Some(Extent2D::new(800, 600)), 2, 3);
        assert_eq!(choose_extent(&fixed, Extent2D::new(1, 1)), Extent2D::new(800, 600));

        let free = caps(None, 2, 3);
        assert_eq!(choose_extent(&free, Extent2D::new(8, 9000)), Extent2D::new(16, 2160));
        assert_eq!(choose_extent(&free, Extent2D::new(640, 480)), Extent2D::new(640, 480));
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        assert_eq!(choose_image_count(&caps(None, 2, 8)), 3);
        assert_eq!(choose_image_count(&caps(None, 3, 3)), 3);
        assert_eq!(choose_image_count(&caps(None, 2, 0)), 3);
    }

    #[test]
    fn lifecycle_through_stale() {
        let mut device = SoftDevice::new(Extent2D::new(800, 600));
        let mut surface = PresentationSurface::new(true);
        assert_eq!(surface.state(), SurfaceState::Uninitialized);

        surface.create(&mut device, Extent2D::new(800, 600)).unwrap();
        assert_eq!(surface.state(), SurfaceState::Created);
        assert_eq!(surface.extent(), Some(Extent2D::new(800, 600)));
        assert_eq!(surface.images().len(), 3);
        assert_eq!(surface.desc().unwrap().present_mode, PresentMode::Mailbox);
        assert!(surface.is_current(&mut device, Extent2D::new(800, 600)).unwrap());

        device.set_window_extent(Extent2D::new(1920, 1080));
        let sem = device.create_semaphore().unwrap();
        let outcome = surface.acquire(&mut device, sem, Duration::from_millis(10)).unwrap();
        assert_eq!(outcome, AcquireOutcome::OutOfDate);
        assert_eq!(surface.state(), SurfaceState::Stale);

        surface.create(&mut device, Extent2D::new(1920, 1080)).unwrap();
        assert_eq!(surface.generation(), 2);
        assert_eq!(surface.extent(), Some(Extent2D::new(1920, 1080)));
        assert_eq!(device.live_swapchain_count(), 1);
        assert!(surface
            .images()
            .iter()
            .all(|img| img.layout == ImageLayout::Undefined));

        surface.destroy(&mut device).unwrap();
        assert_eq!(surface.state(), SurfaceState::Destroyed);
        assert_eq!(device.live_swapchain_count(), 0);
    }
}
