/*!
 * GPU Backend Module
 *
 * The seam between the frame pipeline and a concrete graphics API. Handles
 * are opaque 64-bit values so the same pipeline drives the Vulkan backend
 * and the CPU-side software backend used by the tests.
 */

pub mod command;
pub mod layout;
pub mod soft;
#[cfg(target_os = "linux")]
pub mod vulkan;

use std::ops::BitOr;
use std::time::Duration;

pub use command::{Command, Filter, ImageBarrier};
pub use layout::ImageLayout;

use crate::error::GpuResult;
use crate::frame::Extent2D;

macro_rules! handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl $name {
                pub const NULL: $name = $name(0);

                pub fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

handle!(
    ImageHandle,
    MemoryHandle,
    ViewHandle,
    BufferHandle,
    SemaphoreHandle,
    FenceHandle,
    CommandBufferHandle,
    SwapchainHandle,
);

/// Texel formats the pipeline allocates or sees on a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// Reported by surfaces that accept any format
    Undefined,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba8Unorm,
    Rgba8Srgb,
    /// Two-channel half float, used for motion vectors
    Rg16Float,
    /// Single-channel float, used for placeholder depth
    R32Float,
    /// Anything else a platform reports, by raw value
    Other(i32),
}

impl ImageFormat {
    /// Every format the pipeline allocates is 32 bits wide
    pub fn bytes_per_texel(self) -> usize {
        4
    }

    /// 32-bit packed BGRA family
    pub fn is_bgra(self) -> bool {
        matches!(self, ImageFormat::Bgra8Unorm | ImageFormat::Bgra8Srgb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    SrgbNonlinear,
    Other(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
    Other(i32),
}

/// Set of image usages, combined with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageUsage(u32);

impl ImageUsage {
    pub const TRANSFER_SRC: ImageUsage = ImageUsage(1);
    pub const TRANSFER_DST: ImageUsage = ImageUsage(1 << 1);
    pub const SAMPLED: ImageUsage = ImageUsage(1 << 2);
    pub const STORAGE: ImageUsage = ImageUsage(1 << 3);
    pub const COLOR_ATTACHMENT: ImageUsage = ImageUsage(1 << 4);

    pub fn contains(self, other: ImageUsage) -> bool {
        self.0 & other.0 == other.0
    }

    /// Usages that require an image view
    pub fn needs_view(self) -> bool {
        self.0 & (Self::SAMPLED.0 | Self::STORAGE.0 | Self::COLOR_ATTACHMENT.0) != 0
    }
}

impl BitOr for ImageUsage {
    type Output = ImageUsage;

    fn bitor(self, rhs: ImageUsage) -> ImageUsage {
        ImageUsage(self.0 | rhs.0)
    }
}

/// Declared size, format and usage of an image, before any memory exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: Extent2D,
    pub format: ImageFormat,
    pub usage: ImageUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub type_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    DeviceLocal,
    /// Host-visible and coherent
    HostVisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// Zero means no upper bound
    pub max_image_count: u32,
    /// `None` when the platform lets the swapchain pick its own extent
    pub current_extent: Option<Extent2D>,
    pub min_extent: Extent2D,
    pub max_extent: Extent2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceFormat {
    pub format: ImageFormat,
    pub color_space: ColorSpace,
}

/// Everything the platform reports about the presentation surface.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceSupport {
    pub capabilities: SurfaceCapabilities,
    pub formats: Vec<SurfaceFormat>,
    pub present_modes: Vec<PresentMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub image_count: u32,
    pub format: SurfaceFormat,
    pub extent: Extent2D,
    pub present_mode: PresentMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swapchain {
    pub handle: SwapchainHandle,
    pub images: Vec<ImageHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    /// The surface no longer matches the swapchain; nothing was signaled
    OutOfDate,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    Timeout,
}

/// One queue submission: wait on `wait` at the transfer stage, signal
/// `signal` and `fence` on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitInfo {
    pub command_buffer: CommandBufferHandle,
    pub wait: SemaphoreHandle,
    pub signal: SemaphoreHandle,
    pub fence: FenceHandle,
}

/// Device operations the frame pipeline needs.
///
/// Destroy/free calls accept null handles and ignore them.
pub trait GpuDevice {
    fn backend_name(&self) -> &'static str;

    fn create_image(&mut self, desc: &ImageDesc) -> GpuResult<ImageHandle>;
    fn image_memory_requirements(&self, image: ImageHandle) -> GpuResult<MemoryRequirements>;
    fn allocate_memory(
        &mut self,
        requirements: &MemoryRequirements,
        location: MemoryLocation,
    ) -> GpuResult<MemoryHandle>;
    fn bind_image_memory(&mut self, image: ImageHandle, memory: MemoryHandle) -> GpuResult<()>;
    fn create_image_view(&mut self, image: ImageHandle, format: ImageFormat) -> GpuResult<ViewHandle>;
    fn destroy_image_view(&mut self, view: ViewHandle);
    fn destroy_image(&mut self, image: ImageHandle);
    fn free_memory(&mut self, memory: MemoryHandle);

    fn create_buffer(&mut self, size: u64) -> GpuResult<BufferHandle>;
    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> GpuResult<MemoryRequirements>;
    fn bind_buffer_memory(&mut self, buffer: BufferHandle, memory: MemoryHandle) -> GpuResult<()>;
    /// Map `size` bytes of host-visible memory, hand them to `write`, unmap.
    fn write_mapped(
        &mut self,
        memory: MemoryHandle,
        size: u64,
        write: &mut dyn FnMut(&mut [u8]),
    ) -> GpuResult<()>;
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn create_semaphore(&mut self) -> GpuResult<SemaphoreHandle>;
    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);
    fn create_fence(&mut self, signaled: bool) -> GpuResult<FenceHandle>;
    fn wait_for_fence(&mut self, fence: FenceHandle, timeout: Duration) -> GpuResult<FenceWait>;
    fn reset_fence(&mut self, fence: FenceHandle) -> GpuResult<()>;
    fn destroy_fence(&mut self, fence: FenceHandle);

    fn allocate_command_buffer(&mut self) -> GpuResult<CommandBufferHandle>;
    fn free_command_buffer(&mut self, command_buffer: CommandBufferHandle);
    /// Reset `command_buffer` and encode `commands` into it.
    fn record(&mut self, command_buffer: CommandBufferHandle, commands: &[Command]) -> GpuResult<()>;
    fn submit(&mut self, submit: &SubmitInfo) -> GpuResult<()>;
    fn wait_idle(&mut self) -> GpuResult<()>;

    fn surface_support(&mut self) -> GpuResult<SurfaceSupport>;
    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> GpuResult<Swapchain>;
    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle);
    fn acquire_next_image(
        &mut self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        timeout: Duration,
    ) -> GpuResult<AcquireOutcome>;
    fn present(
        &mut self,
        swapchain: SwapchainHandle,
        index: u32,
        wait: SemaphoreHandle,
    ) -> GpuResult<PresentOutcome>;
}
