//! Frame Resource Set
//!
//! The five device-local images one resolution epoch needs, kept in a small
//! arena indexed by [`ImageRole`]. Each image carries its own tracked layout;
//! see [`crate::recorder`] for how that field is kept honest.

use std::fmt;

use tracing::{debug, info};

use crate::error::GpuResult;
use crate::frame::Extent2D;
use crate::gpu::{
    GpuDevice, ImageDesc, ImageFormat, ImageHandle, ImageLayout, ImageUsage, MemoryHandle,
    MemoryLocation, ViewHandle,
};

/// Capture, render and display extents of one resolution epoch.
///
/// The render extent is locked to the capture extent: frames are never
/// downscaled before the upscale stage sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionState {
    pub capture: Extent2D,
    pub render: Extent2D,
    pub display: Extent2D,
}

impl ResolutionState {
    pub fn new(capture: Extent2D, display: Extent2D) -> Self {
        Self {
            capture,
            render: capture,
            display,
        }
    }
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capture {} / render {} / display {}",
            self.capture, self.render, self.display
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageRole {
    /// Raw snapshot at capture resolution
    CaptureColor,
    /// Upscale input at render resolution
    InputColor,
    MotionVectors,
    Depth,
    /// Upscale output at display resolution
    OutputColor,
}

impl ImageRole {
    pub const ALL: [ImageRole; 5] = [
        ImageRole::CaptureColor,
        ImageRole::InputColor,
        ImageRole::MotionVectors,
        ImageRole::Depth,
        ImageRole::OutputColor,
    ];

    fn index(self) -> usize {
        match self {
            ImageRole::CaptureColor => 0,
            ImageRole::InputColor => 1,
            ImageRole::MotionVectors => 2,
            ImageRole::Depth => 3,
            ImageRole::OutputColor => 4,
        }
    }

    /// Declared size, format and usage for this role in `resolution`
    pub fn desc(self, resolution: &ResolutionState) -> ImageDesc {
        match self {
            ImageRole::CaptureColor => ImageDesc {
                extent: resolution.capture,
                format: ImageFormat::Bgra8Unorm,
                usage: ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC,
            },
            ImageRole::InputColor => ImageDesc {
                extent: resolution.render,
                format: ImageFormat::Bgra8Unorm,
                usage: ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC | ImageUsage::SAMPLED,
            },
            ImageRole::MotionVectors => ImageDesc {
                extent: resolution.render,
                format: ImageFormat::Rg16Float,
                usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
            },
            ImageRole::Depth => ImageDesc {
                extent: resolution.render,
                format: ImageFormat::R32Float,
                usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
            },
            ImageRole::OutputColor => ImageDesc {
                extent: resolution.display,
                format: ImageFormat::Bgra8Unorm,
                usage: ImageUsage::STORAGE
                    | ImageUsage::SAMPLED
                    | ImageUsage::TRANSFER_SRC
                    | ImageUsage::TRANSFER_DST,
            },
        }
    }
}

/// One device-local image with its memory, optional view and tracked layout.
#[derive(Debug)]
pub struct GpuImage {
    pub role: ImageRole,
    pub handle: ImageHandle,
    pub memory: MemoryHandle,
    pub view: Option<ViewHandle>,
    /// Last layout recorded for this image; `Undefined` until first use
    pub layout: ImageLayout,
    pub extent: Extent2D,
    pub format: ImageFormat,
    pub usage: ImageUsage,
}

impl GpuImage {
    /// Declare, query requirements, allocate, bind, then create a view when
    /// the usage needs one. Partial work is undone on failure.
    pub fn create(device: &mut dyn GpuDevice, role: ImageRole, desc: ImageDesc) -> GpuResult<Self> {
        let mut image = GpuImage {
            role,
            handle: ImageHandle::NULL,
            memory: MemoryHandle::NULL,
            view: None,
            layout: ImageLayout::Undefined,
            extent: desc.extent,
            format: desc.format,
            usage: desc.usage,
        };

        let result = (|| -> GpuResult<()> {
            image.handle = device.create_image(&desc)?;
            let requirements = device.image_memory_requirements(image.handle)?;
            image.memory = device.allocate_memory(&requirements, MemoryLocation::DeviceLocal)?;
            device.bind_image_memory(image.handle, image.memory)?;
            if desc.usage.needs_view() {
                image.view = Some(device.create_image_view(image.handle, desc.format)?);
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(image),
            Err(e) => {
                image.destroy(device);
                Err(e)
            }
        }
    }

    /// Reverse of [`GpuImage::create`]; every step skips never-created handles.
    pub fn destroy(self, device: &mut dyn GpuDevice) {
        if let Some(view) = self.view {
            device.destroy_image_view(view);
        }
        if !self.handle.is_null() {
            device.destroy_image(self.handle);
        }
        if !self.memory.is_null() {
            device.free_memory(self.memory);
        }
    }
}

/// Mutable borrows of every image in a complete set, for frame recording.
pub struct FrameImagesMut<'a> {
    pub capture: &'a mut GpuImage,
    pub input: &'a mut GpuImage,
    pub motion: &'a mut GpuImage,
    pub depth: &'a mut GpuImage,
    pub output: &'a mut GpuImage,
}

/// All per-epoch images. Valid only while its [`ResolutionState`] holds.
#[derive(Debug)]
pub struct FrameResourceSet {
    slots: [Option<GpuImage>; 5],
    resolution: ResolutionState,
    epoch: u64,
}

impl FrameResourceSet {
    pub fn create(
        device: &mut dyn GpuDevice,
        resolution: ResolutionState,
        epoch: u64,
    ) -> GpuResult<Self> {
        let mut set = FrameResourceSet {
            slots: [None, None, None, None, None],
            resolution,
            epoch,
        };

        for role in ImageRole::ALL {
            match GpuImage::create(device, role, role.desc(&resolution)) {
                Ok(image) => set.slots[role.index()] = Some(image),
                Err(e) => {
                    set.destroy_slots(device);
                    return Err(e);
                }
            }
        }

        info!(
            "[Resources] Epoch {} resource set ready ({})",
            epoch, resolution
        );
        Ok(set)
    }

    /// Wait for the device to go idle, then destroy every image in reverse
    /// creation order.
    pub fn destroy(mut self, device: &mut dyn GpuDevice) -> GpuResult<()> {
        device.wait_idle()?;
        self.destroy_slots(device);
        debug!("[Resources] Epoch {} resource set destroyed", self.epoch);
        Ok(())
    }

    fn destroy_slots(&mut self, device: &mut dyn GpuDevice) {
        for role in ImageRole::ALL.iter().rev() {
            if let Some(image) = self.slots[role.index()].take() {
                image.destroy(device);
            }
        }
    }

    /// Drop a single image early (the capture image when the source resizes).
    pub fn release(&mut self, device: &mut dyn GpuDevice, role: ImageRole) -> GpuResult<()> {
        if let Some(image) = self.slots[role.index()].take() {
            device.wait_idle()?;
            debug!("[Resources] Released {:?} ({})", role, image.extent);
            image.destroy(device);
        }
        Ok(())
    }

    pub fn resolution(&self) -> ResolutionState {
        self.resolution
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn get(&self, role: ImageRole) -> Option<&GpuImage> {
        self.slots[role.index()].as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Split the set into disjoint mutable borrows; `None` if any slot was released.
    pub fn images_mut(&mut self) -> Option<FrameImagesMut<'_>> {
        let [capture, input, motion, depth, output] = &mut self.slots;
        Some(FrameImagesMut {
            capture: capture.as_mut()?,
            input: input.as_mut()?,
            motion: motion.as_mut()?,
            depth: depth.as_mut()?,
            output: output.as_mut()?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &GpuImage> {
        self.slots.iter().flatten()
    }
}
