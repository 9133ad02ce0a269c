//! Vulkan backend
//!
//! One instance, one device, one graphics queue that can also present to
//! the XCB surface of the output window. Handles cross the `GpuDevice` seam
//! as their raw 64-bit values.

use std::ffi::c_char;
use std::sync::Arc;
use std::time::Duration;

use ash::khr::{surface, swapchain, xcb_surface};
use ash::vk::{self, Handle};
use ash::{Entry, Instance};
use tracing::{debug, info, warn};
use x11rb::xcb_ffi::XCBConnection;

use super::{
    AcquireOutcome, BufferHandle, ColorSpace, Command, CommandBufferHandle, FenceHandle,
    FenceWait, Filter, GpuDevice, ImageDesc, ImageFormat, ImageHandle, ImageLayout, ImageUsage,
    MemoryHandle, MemoryLocation, MemoryRequirements, PresentMode, PresentOutcome,
    SemaphoreHandle, SubmitInfo, SurfaceCapabilities, SurfaceFormat, SurfaceSupport, Swapchain,
    SwapchainDesc, SwapchainHandle, ViewHandle,
};
use crate::error::{GpuError, GpuResult};
use crate::frame::Extent2D;

fn vk_error(call: &'static str) -> impl Fn(vk::Result) -> GpuError {
    move |code| match code {
        vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
        code => GpuError::backend(call, code),
    }
}

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

fn to_vk_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Undefined => vk::Format::UNDEFINED,
        ImageFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        ImageFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        ImageFormat::Rg16Float => vk::Format::R16G16_SFLOAT,
        ImageFormat::R32Float => vk::Format::R32_SFLOAT,
        ImageFormat::Other(raw) => vk::Format::from_raw(raw),
    }
}

fn from_vk_format(format: vk::Format) -> ImageFormat {
    match format {
        vk::Format::UNDEFINED => ImageFormat::Undefined,
        vk::Format::B8G8R8A8_UNORM => ImageFormat::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => ImageFormat::Bgra8Srgb,
        vk::Format::R8G8B8A8_UNORM => ImageFormat::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => ImageFormat::Rgba8Srgb,
        vk::Format::R16G16_SFLOAT => ImageFormat::Rg16Float,
        vk::Format::R32_SFLOAT => ImageFormat::R32Float,
        other => ImageFormat::Other(other.as_raw()),
    }
}

fn to_vk_color_space(space: ColorSpace) -> vk::ColorSpaceKHR {
    match space {
        ColorSpace::SrgbNonlinear => vk::ColorSpaceKHR::SRGB_NONLINEAR,
        ColorSpace::Other(raw) => vk::ColorSpaceKHR::from_raw(raw),
    }
}

fn from_vk_color_space(space: vk::ColorSpaceKHR) -> ColorSpace {
    match space {
        vk::ColorSpaceKHR::SRGB_NONLINEAR => ColorSpace::SrgbNonlinear,
        other => ColorSpace::Other(other.as_raw()),
    }
}

fn to_vk_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        PresentMode::Other(raw) => vk::PresentModeKHR::from_raw(raw),
    }
}

fn from_vk_present_mode(mode: vk::PresentModeKHR) -> PresentMode {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => PresentMode::Immediate,
        vk::PresentModeKHR::MAILBOX => PresentMode::Mailbox,
        vk::PresentModeKHR::FIFO => PresentMode::Fifo,
        vk::PresentModeKHR::FIFO_RELAXED => PresentMode::FifoRelaxed,
        other => PresentMode::Other(other.as_raw()),
    }
}

fn to_vk_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    for (ours, theirs) in [
        (ImageUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (ImageUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
        (ImageUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (ImageUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
        (ImageUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

fn to_vk_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// Stage at which a submit waits for the acquired swapchain image.
const ACQUIRE_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::TRANSFER;

/// Access mask and pipeline stage that touch an image in `layout`.
///
/// Undefined-origin barriers start at the acquire wait stage so the layout
/// transition of a swapchain image is ordered after the semaphore wait.
fn layout_scope(layout: ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        ImageLayout::Undefined => (vk::AccessFlags::empty(), ACQUIRE_WAIT_STAGE),
        ImageLayout::TransferDst => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ImageLayout::TransferSrc => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ImageLayout::ShaderReadOnly => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        ImageLayout::General => (
            vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE
                | vk::AccessFlags::TRANSFER_READ
                | vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        ImageLayout::PresentSrc => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1)
}

fn extent3d(extent: Extent2D) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: 1,
    }
}

fn far_corner(extent: Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

pub struct VulkanDevice {
    _entry: Entry,
    instance: Instance,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    physical: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    queue: vk::Queue,
    swapchain_loader: swapchain::Device,
    command_pool: vk::CommandPool,
    // The surface borrows the XCB connection for its whole life
    _conn: Arc<XCBConnection>,
}

impl VulkanDevice {
    /// Bring up a device that can present into `window` on `conn`.
    pub fn new(conn: Arc<XCBConnection>, window: u32) -> GpuResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| GpuError::Unsupported(format!("no Vulkan loader: {}", e)))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"glasspane")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);
        let extensions: [*const c_char; 2] = [surface::NAME.as_ptr(), xcb_surface::NAME.as_ptr()];
        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(vk_error("vkCreateInstance"))?;

        let surface_loader = surface::Instance::new(&entry, &instance);
        let xcb_loader = xcb_surface::Instance::new(&entry, &instance);
        let surface_info = vk::XcbSurfaceCreateInfoKHR::default()
            .connection(conn.get_raw_xcb_connection() as *mut vk::xcb_connection_t)
            .window(window);
        let surface = match unsafe { xcb_loader.create_xcb_surface(&surface_info, None) } {
            Ok(surface) => surface,
            Err(code) => {
                unsafe { instance.destroy_instance(None) };
                return Err(vk_error("vkCreateXcbSurfaceKHR")(code));
            }
        };

        let picked = Self::pick_physical_device(&instance, &surface_loader, surface);
        let (physical, queue_family) = match picked {
            Ok(pair) => pair,
            Err(e) => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let name = unsafe { instance.get_physical_device_properties(physical) }
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());
        info!("[Vulkan] Using {} (queue family {})", name, queue_family);

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities);
        let device_extensions = [swapchain::NAME.as_ptr()];
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&device_extensions);
        let device = match unsafe { instance.create_device(physical, &device_info, None) } {
            Ok(device) => device,
            Err(code) => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                }
                return Err(vk_error("vkCreateDevice")(code));
            }
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(code) => {
                unsafe {
                    device.destroy_device(None);
                    surface_loader.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                }
                return Err(vk_error("vkCreateCommandPool")(code));
            }
        };

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical) };
        let swapchain_loader = swapchain::Device::new(&instance, &device);

        Ok(Self {
            _entry: entry,
            instance,
            surface_loader,
            surface,
            physical,
            memory_properties,
            device,
            queue,
            swapchain_loader,
            command_pool,
            _conn: conn,
        })
    }

    /// First device with a graphics queue that can present to `surface`.
    fn pick_physical_device(
        instance: &Instance,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> GpuResult<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(vk_error("vkEnumeratePhysicalDevices"))?;
        for physical in devices {
            let families =
                unsafe { instance.get_physical_device_queue_family_properties(physical) };
            for (index, family) in families.iter().enumerate() {
                let index = index as u32;
                if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                    continue;
                }
                let presents = unsafe {
                    surface_loader.get_physical_device_surface_support(physical, index, surface)
                }
                .unwrap_or(false);
                if presents {
                    return Ok((physical, index));
                }
            }
        }
        Err(GpuError::Unsupported(
            "no GPU with a graphics queue that can present to the window".into(),
        ))
    }

    fn memory_type_index(&self, type_bits: u32, location: MemoryLocation) -> GpuResult<u32> {
        let wanted = match location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|(index, memory_type)| {
                type_bits & (1 << index) != 0 && memory_type.property_flags.contains(wanted)
            })
            .map(|(index, _)| index as u32)
            .ok_or(GpuError::NoSuitableMemoryType { type_bits })
    }

    fn encode(&self, command_buffer: vk::CommandBuffer, command: &Command) {
        let d = &self.device;
        match *command {
            Command::Barrier(barrier) => {
                let (src_access, src_stage) = layout_scope(barrier.old);
                let (dst_access, dst_stage) = layout_scope(barrier.new);
                let image_barrier = vk::ImageMemoryBarrier::default()
                    .old_layout(to_vk_layout(barrier.old))
                    .new_layout(to_vk_layout(barrier.new))
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(vk::Image::from_raw(barrier.image.0))
                    .subresource_range(color_range());
                unsafe {
                    d.cmd_pipeline_barrier(
                        command_buffer,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[image_barrier],
                    );
                }
            }
            Command::CopyBufferToImage {
                buffer,
                image,
                layout,
                extent,
            } => {
                let region = vk::BufferImageCopy::default()
                    .buffer_offset(0)
                    .buffer_row_length(0)
                    .buffer_image_height(0)
                    .image_subresource(color_layers())
                    .image_extent(extent3d(extent));
                unsafe {
                    d.cmd_copy_buffer_to_image(
                        command_buffer,
                        vk::Buffer::from_raw(buffer.0),
                        vk::Image::from_raw(image.0),
                        to_vk_layout(layout),
                        &[region],
                    );
                }
            }
            Command::BlitImage {
                src,
                src_layout,
                src_extent,
                dst,
                dst_layout,
                dst_extent,
                filter,
            } => {
                let region = vk::ImageBlit::default()
                    .src_subresource(color_layers())
                    .src_offsets([vk::Offset3D::default(), far_corner(src_extent)])
                    .dst_subresource(color_layers())
                    .dst_offsets([vk::Offset3D::default(), far_corner(dst_extent)]);
                let filter = match filter {
                    Filter::Nearest => vk::Filter::NEAREST,
                    Filter::Linear => vk::Filter::LINEAR,
                };
                unsafe {
                    d.cmd_blit_image(
                        command_buffer,
                        vk::Image::from_raw(src.0),
                        to_vk_layout(src_layout),
                        vk::Image::from_raw(dst.0),
                        to_vk_layout(dst_layout),
                        &[region],
                        filter,
                    );
                }
            }
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                extent,
            } => {
                let region = vk::ImageCopy::default()
                    .src_subresource(color_layers())
                    .dst_subresource(color_layers())
                    .extent(extent3d(extent));
                unsafe {
                    d.cmd_copy_image(
                        command_buffer,
                        vk::Image::from_raw(src.0),
                        to_vk_layout(src_layout),
                        vk::Image::from_raw(dst.0),
                        to_vk_layout(dst_layout),
                        &[region],
                    );
                }
            }
            Command::ClearColor {
                image,
                layout,
                value,
            } => {
                let color = vk::ClearColorValue { float32: value };
                unsafe {
                    d.cmd_clear_color_image(
                        command_buffer,
                        vk::Image::from_raw(image.0),
                        to_vk_layout(layout),
                        &color,
                        &[color_range()],
                    );
                }
            }
        }
    }
}

impl GpuDevice for VulkanDevice {
    fn backend_name(&self) -> &'static str {
        "vulkan"
    }

    fn create_image(&mut self, desc: &ImageDesc) -> GpuResult<ImageHandle> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(to_vk_format(desc.format))
            .extent(extent3d(desc.extent))
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(to_vk_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None) }
            .map_err(vk_error("vkCreateImage"))?;
        Ok(ImageHandle(image.as_raw()))
    }

    fn image_memory_requirements(&self, image: ImageHandle) -> GpuResult<MemoryRequirements> {
        let reqs = unsafe {
            self.device
                .get_image_memory_requirements(vk::Image::from_raw(image.0))
        };
        Ok(MemoryRequirements {
            size: reqs.size,
            alignment: reqs.alignment,
            type_bits: reqs.memory_type_bits,
        })
    }

    fn allocate_memory(
        &mut self,
        requirements: &MemoryRequirements,
        location: MemoryLocation,
    ) -> GpuResult<MemoryHandle> {
        let type_index = self.memory_type_index(requirements.type_bits, location)?;
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        let memory = unsafe { self.device.allocate_memory(&info, None) }
            .map_err(vk_error("vkAllocateMemory"))?;
        Ok(MemoryHandle(memory.as_raw()))
    }

    fn bind_image_memory(&mut self, image: ImageHandle, memory: MemoryHandle) -> GpuResult<()> {
        unsafe {
            self.device.bind_image_memory(
                vk::Image::from_raw(image.0),
                vk::DeviceMemory::from_raw(memory.0),
                0,
            )
        }
        .map_err(vk_error("vkBindImageMemory"))
    }

    fn create_image_view(&mut self, image: ImageHandle, format: ImageFormat) -> GpuResult<ViewHandle> {
        let info = vk::ImageViewCreateInfo::default()
            .image(vk::Image::from_raw(image.0))
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(to_vk_format(format))
            .subresource_range(color_range());
        let view = unsafe { self.device.create_image_view(&info, None) }
            .map_err(vk_error("vkCreateImageView"))?;
        Ok(ViewHandle(view.as_raw()))
    }

    fn destroy_image_view(&mut self, view: ViewHandle) {
        if !view.is_null() {
            unsafe {
                self.device
                    .destroy_image_view(vk::ImageView::from_raw(view.0), None)
            };
        }
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if !image.is_null() {
            unsafe { self.device.destroy_image(vk::Image::from_raw(image.0), None) };
        }
    }

    fn free_memory(&mut self, memory: MemoryHandle) {
        if !memory.is_null() {
            unsafe {
                self.device
                    .free_memory(vk::DeviceMemory::from_raw(memory.0), None)
            };
        }
    }

    fn create_buffer(&mut self, size: u64) -> GpuResult<BufferHandle> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .map_err(vk_error("vkCreateBuffer"))?;
        Ok(BufferHandle(buffer.as_raw()))
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> GpuResult<MemoryRequirements> {
        let reqs = unsafe {
            self.device
                .get_buffer_memory_requirements(vk::Buffer::from_raw(buffer.0))
        };
        Ok(MemoryRequirements {
            size: reqs.size,
            alignment: reqs.alignment,
            type_bits: reqs.memory_type_bits,
        })
    }

    fn bind_buffer_memory(&mut self, buffer: BufferHandle, memory: MemoryHandle) -> GpuResult<()> {
        unsafe {
            self.device.bind_buffer_memory(
                vk::Buffer::from_raw(buffer.0),
                vk::DeviceMemory::from_raw(memory.0),
                0,
            )
        }
        .map_err(vk_error("vkBindBufferMemory"))
    }

    fn write_mapped(
        &mut self,
        memory: MemoryHandle,
        size: u64,
        write: &mut dyn FnMut(&mut [u8]),
    ) -> GpuResult<()> {
        let memory = vk::DeviceMemory::from_raw(memory.0);
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
        }
        .map_err(vk_error("vkMapMemory"))?;
        // Host-coherent memory: no flush needed before unmap.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), size as usize) };
        write(bytes);
        unsafe { self.device.unmap_memory(memory) };
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if !buffer.is_null() {
            unsafe { self.device.destroy_buffer(vk::Buffer::from_raw(buffer.0), None) };
        }
    }

    fn create_semaphore(&mut self) -> GpuResult<SemaphoreHandle> {
        let semaphore = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(vk_error("vkCreateSemaphore"))?;
        Ok(SemaphoreHandle(semaphore.as_raw()))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if !semaphore.is_null() {
            unsafe {
                self.device
                    .destroy_semaphore(vk::Semaphore::from_raw(semaphore.0), None)
            };
        }
    }

    fn create_fence(&mut self, signaled: bool) -> GpuResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(vk_error("vkCreateFence"))?;
        Ok(FenceHandle(fence.as_raw()))
    }

    fn wait_for_fence(&mut self, fence: FenceHandle, timeout: Duration) -> GpuResult<FenceWait> {
        let fences = [vk::Fence::from_raw(fence.0)];
        match unsafe {
            self.device
                .wait_for_fences(&fences, true, timeout_ns(timeout))
        } {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::Timeout),
            Err(code) => Err(vk_error("vkWaitForFences")(code)),
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> GpuResult<()> {
        unsafe { self.device.reset_fences(&[vk::Fence::from_raw(fence.0)]) }
            .map_err(vk_error("vkResetFences"))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if !fence.is_null() {
            unsafe { self.device.destroy_fence(vk::Fence::from_raw(fence.0), None) };
        }
    }

    fn allocate_command_buffer(&mut self) -> GpuResult<CommandBufferHandle> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(vk_error("vkAllocateCommandBuffers"))?;
        let buffer = buffers
            .first()
            .copied()
            .ok_or_else(|| GpuError::backend("vkAllocateCommandBuffers", "empty result"))?;
        Ok(CommandBufferHandle(buffer.as_raw()))
    }

    fn free_command_buffer(&mut self, command_buffer: CommandBufferHandle) {
        if !command_buffer.is_null() {
            unsafe {
                self.device.free_command_buffers(
                    self.command_pool,
                    &[vk::CommandBuffer::from_raw(command_buffer.0)],
                )
            };
        }
    }

    fn record(&mut self, command_buffer: CommandBufferHandle, commands: &[Command]) -> GpuResult<()> {
        let cb = vk::CommandBuffer::from_raw(command_buffer.0);
        unsafe {
            self.device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .map_err(vk_error("vkResetCommandBuffer"))?;
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cb, &begin)
                .map_err(vk_error("vkBeginCommandBuffer"))?;
        }
        for command in commands {
            self.encode(cb, command);
        }
        unsafe { self.device.end_command_buffer(cb) }.map_err(vk_error("vkEndCommandBuffer"))
    }

    fn submit(&mut self, submit: &SubmitInfo) -> GpuResult<()> {
        let command_buffers = [vk::CommandBuffer::from_raw(submit.command_buffer.0)];
        let wait = [vk::Semaphore::from_raw(submit.wait.0)];
        let wait_stages = [ACQUIRE_WAIT_STAGE];
        let signal = [vk::Semaphore::from_raw(submit.signal.0)];

        let mut info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        if !submit.wait.is_null() {
            info = info.wait_semaphores(&wait).wait_dst_stage_mask(&wait_stages);
        }
        if !submit.signal.is_null() {
            info = info.signal_semaphores(&signal);
        }
        unsafe {
            self.device
                .queue_submit(self.queue, &[info], vk::Fence::from_raw(submit.fence.0))
        }
        .map_err(vk_error("vkQueueSubmit"))
    }

    fn wait_idle(&mut self) -> GpuResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(vk_error("vkDeviceWaitIdle"))
    }

    fn surface_support(&mut self) -> GpuResult<SurfaceSupport> {
        let (caps, formats, modes) = unsafe {
            (
                self.surface_loader
                    .get_physical_device_surface_capabilities(self.physical, self.surface)
                    .map_err(vk_error("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?,
                self.surface_loader
                    .get_physical_device_surface_formats(self.physical, self.surface)
                    .map_err(vk_error("vkGetPhysicalDeviceSurfaceFormatsKHR"))?,
                self.surface_loader
                    .get_physical_device_surface_present_modes(self.physical, self.surface)
                    .map_err(vk_error("vkGetPhysicalDeviceSurfacePresentModesKHR"))?,
            )
        };

        // 0xFFFFFFFF means the swapchain decides.
        let current_extent = (caps.current_extent.width != u32::MAX)
            .then(|| Extent2D::new(caps.current_extent.width, caps.current_extent.height));

        Ok(SurfaceSupport {
            capabilities: SurfaceCapabilities {
                min_image_count: caps.min_image_count,
                max_image_count: caps.max_image_count,
                current_extent,
                min_extent: Extent2D::new(caps.min_image_extent.width, caps.min_image_extent.height),
                max_extent: Extent2D::new(caps.max_image_extent.width, caps.max_image_extent.height),
            },
            formats: formats
                .iter()
                .map(|f| SurfaceFormat {
                    format: from_vk_format(f.format),
                    color_space: from_vk_color_space(f.color_space),
                })
                .collect(),
            present_modes: modes.into_iter().map(from_vk_present_mode).collect(),
        })
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> GpuResult<Swapchain> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical, self.surface)
        }
        .map_err(vk_error("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;

        if !caps
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            return Err(GpuError::Unsupported(
                "surface images cannot be transfer destinations".into(),
            ));
        }
        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };
        let composite_alpha = if caps
            .supported_composite_alpha
            .contains(vk::CompositeAlphaFlagsKHR::OPAQUE)
        {
            vk::CompositeAlphaFlagsKHR::OPAQUE
        } else {
            vk::CompositeAlphaFlagsKHR::INHERIT
        };

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(desc.image_count)
            .image_format(to_vk_format(desc.format.format))
            .image_color_space(to_vk_color_space(desc.format.color_space))
            .image_extent(vk::Extent2D {
                width: desc.extent.width,
                height: desc.extent.height,
            })
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(composite_alpha)
            .present_mode(to_vk_present_mode(desc.present_mode))
            .clipped(true);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&info, None) }
            .map_err(vk_error("vkCreateSwapchainKHR"))?;
        let images = match unsafe { self.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(code) => {
                unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(vk_error("vkGetSwapchainImagesKHR")(code));
            }
        };
        debug!(
            "[Vulkan] Swapchain {:#x}: {} images",
            swapchain.as_raw(),
            images.len()
        );

        Ok(Swapchain {
            handle: SwapchainHandle(swapchain.as_raw()),
            images: images
                .into_iter()
                .map(|image| ImageHandle(image.as_raw()))
                .collect(),
        })
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) {
        if !swapchain.is_null() {
            unsafe {
                self.swapchain_loader
                    .destroy_swapchain(vk::SwapchainKHR::from_raw(swapchain.0), None)
            };
        }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        timeout: Duration,
    ) -> GpuResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                vk::SwapchainKHR::from_raw(swapchain.0),
                timeout_ns(timeout),
                vk::Semaphore::from_raw(signal.0),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(AcquireOutcome::Timeout),
            Err(code) => Err(vk_error("vkAcquireNextImageKHR")(code)),
        }
    }

    fn present(
        &mut self,
        swapchain: SwapchainHandle,
        index: u32,
        wait: SemaphoreHandle,
    ) -> GpuResult<PresentOutcome> {
        let wait = [vk::Semaphore::from_raw(wait.0)];
        let swapchains = [vk::SwapchainKHR::from_raw(swapchain.0)];
        let indices = [index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { self.swapchain_loader.queue_present(self.queue, &info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(code) => Err(vk_error("vkQueuePresentKHR")(code)),
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("[Vulkan] Wait idle before teardown failed: {:?}", e);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
        debug!("[Vulkan] Device torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_mapping_is_lossless_for_known_formats() {
        for format in [
            ImageFormat::Bgra8Unorm,
            ImageFormat::Bgra8Srgb,
            ImageFormat::Rg16Float,
            ImageFormat::R32Float,
            ImageFormat::Other(1_000_156_000),
        ] {
            assert_eq!(from_vk_format(to_vk_format(format)), format);
        }
    }

    #[test]
    fn usage_flags_translate_bit_for_bit() {
        let flags = to_vk_usage(ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED);
        assert_eq!(
            flags,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED
        );
    }

    #[test]
    fn present_layout_waits_on_nothing() {
        let (access, stage) = layout_scope(ImageLayout::PresentSrc);
        assert!(access.is_empty());
        assert_eq!(stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn undefined_origin_waits_at_the_acquire_stage() {
        let (access, stage) = layout_scope(ImageLayout::Undefined);
        assert!(access.is_empty());
        assert_eq!(stage, ACQUIRE_WAIT_STAGE);
        assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);
    }
}
