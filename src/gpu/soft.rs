//! CPU-side implementation of [`GpuDevice`].
//!
//! Executes recorded command streams on plain byte buffers at submit time and
//! keeps the true device-side layout of every image, so a barrier whose
//! assumed prior layout differs from reality is caught instead of silently
//! producing garbage. Used by the test suite.
//!
//! Blits always sample nearest-neighbor, including `Filter::Linear`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tracing::{debug, trace};

use super::{
    AcquireOutcome, BufferHandle, ColorSpace, Command, CommandBufferHandle, FenceHandle,
    FenceWait, GpuDevice, ImageDesc, ImageFormat, ImageHandle, ImageLayout, ImageUsage,
    MemoryHandle, MemoryLocation, MemoryRequirements, PresentMode, PresentOutcome,
    SemaphoreHandle, SubmitInfo, SurfaceCapabilities, SurfaceFormat, SurfaceSupport, Swapchain,
    SwapchainDesc, SwapchainHandle, ViewHandle,
};
use crate::error::{GpuError, GpuResult};
use crate::frame::Extent2D;

const ALIGNMENT: u64 = 256;
const MEMORY_TYPE_BITS: u32 = 0b11;

#[derive(Debug)]
struct SoftImage {
    desc: ImageDesc,
    layout: ImageLayout,
    data: Vec<u8>,
    memory: Option<MemoryHandle>,
    swapchain_owned: bool,
}

#[derive(Debug)]
struct SoftMemory {
    location: MemoryLocation,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct SoftBuffer {
    size: u64,
    memory: Option<MemoryHandle>,
}

#[derive(Debug)]
struct SoftSwapchain {
    desc: SwapchainDesc,
    images: Vec<ImageHandle>,
    next: u32,
    acquired: HashSet<u32>,
}

/// Presented frames kept for inspection; older ones are dropped.
pub const PRESENTED_HISTORY: usize = 8;

/// A frame that reached the (simulated) screen.
#[derive(Debug, Clone)]
pub struct PresentedFrame {
    pub swapchain: SwapchainHandle,
    pub image: ImageHandle,
    pub extent: Extent2D,
    pub data: Vec<u8>,
}

impl PresentedFrame {
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.extent.width as usize + x as usize) * 4;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ]
    }
}

/// Software device with a simulated presentation surface.
#[derive(Debug)]
pub struct SoftDevice {
    next_handle: u64,
    images: HashMap<ImageHandle, SoftImage>,
    memories: HashMap<MemoryHandle, SoftMemory>,
    buffers: HashMap<BufferHandle, SoftBuffer>,
    views: HashMap<ViewHandle, ImageHandle>,
    semaphores: HashMap<SemaphoreHandle, bool>,
    fences: HashMap<FenceHandle, bool>,
    command_buffers: HashMap<CommandBufferHandle, Vec<Command>>,
    swapchains: HashMap<SwapchainHandle, SoftSwapchain>,
    /// Images referenced by submitted work nobody has waited for yet
    in_flight: HashSet<ImageHandle>,
    support: SurfaceSupport,
    window_extent: Extent2D,
    out_of_date_acquires: u32,
    suboptimal_acquires: u32,
    out_of_date_presents: u32,
    fence_timeouts: u32,
    violations: Vec<String>,
    presented: VecDeque<PresentedFrame>,
    presents: u64,
    submits: u64,
}

impl SoftDevice {
    /// Device whose surface tracks a window of `window_extent`
    pub fn new(window_extent: Extent2D) -> Self {
        Self::with_support(window_extent, Self::default_support(window_extent))
    }

    pub fn with_support(window_extent: Extent2D, support: SurfaceSupport) -> Self {
        Self {
            next_handle: 1,
            images: HashMap::new(),
            memories: HashMap::new(),
            buffers: HashMap::new(),
            views: HashMap::new(),
            semaphores: HashMap::new(),
            fences: HashMap::new(),
            command_buffers: HashMap::new(),
            swapchains: HashMap::new(),
            in_flight: HashSet::new(),
            support,
            window_extent,
            out_of_date_acquires: 0,
            suboptimal_acquires: 0,
            out_of_date_presents: 0,
            fence_timeouts: 0,
            violations: Vec::new(),
            presented: VecDeque::with_capacity(PRESENTED_HISTORY),
            presents: 0,
            submits: 0,
        }
    }

    /// What a typical X11 Vulkan driver reports for a window surface
    pub fn default_support(window_extent: Extent2D) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: SurfaceCapabilities {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: Some(window_extent),
                min_extent: Extent2D::new(1, 1),
                max_extent: Extent2D::new(16384, 16384),
            },
            formats: vec![
                SurfaceFormat {
                    format: ImageFormat::Bgra8Srgb,
                    color_space: ColorSpace::SrgbNonlinear,
                },
                SurfaceFormat {
                    format: ImageFormat::Bgra8Unorm,
                    color_space: ColorSpace::SrgbNonlinear,
                },
            ],
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
        }
    }

    /// Simulate the output window being resized by the window system
    pub fn set_window_extent(&mut self, extent: Extent2D) {
        self.window_extent = extent;
        if self.support.capabilities.current_extent.is_some() {
            self.support.capabilities.current_extent = Some(extent);
        }
    }

    pub fn window_extent(&self) -> Extent2D {
        self.window_extent
    }

    /// Make the next `count` acquires report an out-of-date surface
    pub fn force_out_of_date_acquires(&mut self, count: u32) {
        self.out_of_date_acquires = count;
    }

    /// Make the next `count` successful acquires report a suboptimal surface
    pub fn force_suboptimal_acquires(&mut self, count: u32) {
        self.suboptimal_acquires = count;
    }

    /// Make the next `count` presents report an out-of-date surface
    pub fn force_out_of_date_presents(&mut self, count: u32) {
        self.out_of_date_presents = count;
    }

    /// Make the next `count` fence waits time out
    pub fn force_fence_timeouts(&mut self, count: u32) {
        self.fence_timeouts = count;
    }

    /// Misuse detected so far (destroying in-flight resources, bad handles)
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// The most recent presented frames, oldest first
    pub fn presented(&self) -> impl Iterator<Item = &PresentedFrame> {
        self.presented.iter()
    }

    pub fn last_presented(&self) -> Option<&PresentedFrame> {
        self.presented.back()
    }

    /// Every present that reached the screen, including ones no longer kept
    pub fn present_count(&self) -> u64 {
        self.presents
    }

    pub fn submit_count(&self) -> u64 {
        self.submits
    }

    /// True device-side layout of `image`
    pub fn layout_of(&self, image: ImageHandle) -> Option<ImageLayout> {
        self.images.get(&image).map(|img| img.layout)
    }

    pub fn image_desc(&self, image: ImageHandle) -> Option<ImageDesc> {
        self.images.get(&image).map(|img| img.desc)
    }

    pub fn read_pixel(&self, image: ImageHandle, x: u32, y: u32) -> Option<[u8; 4]> {
        let img = self.images.get(&image)?;
        let offset = (y as usize * img.desc.extent.width as usize + x as usize) * 4;
        let px = img.data.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Application-owned images currently alive (swapchain images excluded)
    pub fn live_image_count(&self) -> usize {
        self.images.values().filter(|img| !img.swapchain_owned).count()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_memory_count(&self) -> usize {
        self.memories.len()
    }

    pub fn live_swapchain_count(&self) -> usize {
        self.swapchains.len()
    }

    fn issue(&mut self) -> u64 {
        let raw = self.next_handle;
        self.next_handle += 1;
        raw
    }

    fn violation(&mut self, message: String) {
        debug!("[SoftGpu] violation: {}", message);
        self.violations.push(message);
    }

    fn image_mut(&mut self, image: ImageHandle) -> GpuResult<&mut SoftImage> {
        self.images.get_mut(&image).ok_or(GpuError::UnknownHandle {
            kind: "image",
            raw: image.0,
        })
    }

    fn expect_layout(&self, image: ImageHandle, assumed: ImageLayout) -> GpuResult<()> {
        let img = self.images.get(&image).ok_or(GpuError::UnknownHandle {
            kind: "image",
            raw: image.0,
        })?;
        if img.memory.is_none() && !img.swapchain_owned {
            return Err(GpuError::backend("command", "image used without bound memory"));
        }
        if img.layout != assumed {
            return Err(GpuError::LayoutMismatch {
                image,
                assumed,
                actual: img.layout,
            });
        }
        Ok(())
    }

    fn execute(&mut self, command: &Command) -> GpuResult<()> {
        for (image, layout) in command.image_uses() {
            self.expect_layout(image, layout)?;
            self.in_flight.insert(image);
        }

        match *command {
            Command::Barrier(barrier) => {
                let img = self.image_mut(barrier.image)?;
                if !barrier.old.may_precede(img.layout) {
                    return Err(GpuError::LayoutMismatch {
                        image: barrier.image,
                        assumed: barrier.old,
                        actual: img.layout,
                    });
                }
                trace!(
                    "[SoftGpu] {:?}: {} -> {}",
                    barrier.image,
                    img.layout,
                    barrier.new
                );
                img.layout = barrier.new;
                self.in_flight.insert(barrier.image);
            }
            Command::CopyBufferToImage {
                buffer,
                image,
                layout,
                extent,
            } => {
                if !layout.is_transfer_writable() {
                    return Err(GpuError::backend("copy_buffer_to_image", layout));
                }
                let source = self.buffer_bytes(buffer)?;
                let row = extent.width as usize * 4;
                if source.len() < row * extent.height as usize {
                    return Err(GpuError::backend("copy_buffer_to_image", "buffer too small"));
                }
                let img = self.image_mut(image)?;
                let limit = img.desc.extent;
                if extent.width > limit.width || extent.height > limit.height {
                    return Err(GpuError::OutOfBounds {
                        what: "image",
                        region: extent,
                        limit,
                    });
                }
                let dst_stride = limit.width as usize * 4;
                for y in 0..extent.height as usize {
                    img.data[y * dst_stride..y * dst_stride + row]
                        .copy_from_slice(&source[y * row..(y + 1) * row]);
                }
            }
            Command::BlitImage {
                src,
                src_layout,
                src_extent,
                dst,
                dst_layout,
                dst_extent,
                ..
            } => {
                if !src_layout.is_transfer_readable() || !dst_layout.is_transfer_writable() {
                    return Err(GpuError::backend("blit_image", (src_layout, dst_layout)));
                }
                let (source, src_width) = self.image_snapshot(src, src_extent)?;
                let img = self.image_mut(dst)?;
                check_region("blit destination", dst_extent, img.desc.extent)?;
                let dst_width = img.desc.extent.width as usize;
                for y in 0..dst_extent.height as u64 {
                    let sy = y * src_extent.height as u64 / dst_extent.height as u64;
                    for x in 0..dst_extent.width as u64 {
                        let sx = x * src_extent.width as u64 / dst_extent.width as u64;
                        let s = (sy as usize * src_width + sx as usize) * 4;
                        let d = (y as usize * dst_width + x as usize) * 4;
                        img.data[d..d + 4].copy_from_slice(&source[s..s + 4]);
                    }
                }
            }
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                extent,
            } => {
                if !src_layout.is_transfer_readable() || !dst_layout.is_transfer_writable() {
                    return Err(GpuError::backend("copy_image", (src_layout, dst_layout)));
                }
                let (source, src_width) = self.image_snapshot(src, extent)?;
                let img = self.image_mut(dst)?;
                check_region("copy destination", extent, img.desc.extent)?;
                let dst_width = img.desc.extent.width as usize;
                let row = extent.width as usize * 4;
                for y in 0..extent.height as usize {
                    let s = y * src_width * 4;
                    let d = y * dst_width * 4;
                    img.data[d..d + row].copy_from_slice(&source[s..s + row]);
                }
            }
            Command::ClearColor {
                image,
                layout,
                value,
            } => {
                if !layout.is_transfer_writable() {
                    return Err(GpuError::backend("clear_color_image", layout));
                }
                let img = self.image_mut(image)?;
                let texel = encode_texel(img.desc.format, value);
                for chunk in img.data.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&texel);
                }
            }
        }
        Ok(())
    }

    fn buffer_bytes(&self, buffer: BufferHandle) -> GpuResult<Vec<u8>> {
        let buf = self.buffers.get(&buffer).ok_or(GpuError::UnknownHandle {
            kind: "buffer",
            raw: buffer.0,
        })?;
        let memory = buf
            .memory
            .and_then(|m| self.memories.get(&m))
            .ok_or_else(|| GpuError::backend("copy_buffer_to_image", "buffer has no memory"))?;
        Ok(memory.bytes[..buf.size as usize].to_vec())
    }

    fn image_snapshot(&self, image: ImageHandle, region: Extent2D) -> GpuResult<(Vec<u8>, usize)> {
        let img = self.images.get(&image).ok_or(GpuError::UnknownHandle {
            kind: "image",
            raw: image.0,
        })?;
        check_region("source", region, img.desc.extent)?;
        Ok((img.data.clone(), img.desc.extent.width as usize))
    }

    fn surface_is_stale(&self, swapchain: &SoftSwapchain) -> bool {
        match self.support.capabilities.current_extent {
            Some(current) => current != swapchain.desc.extent,
            None => false,
        }
    }
}

fn check_region(what: &'static str, region: Extent2D, limit: Extent2D) -> GpuResult<()> {
    if region.width > limit.width || region.height > limit.height {
        return Err(GpuError::OutOfBounds {
            what,
            region,
            limit,
        });
    }
    Ok(())
}

fn encode_texel(format: ImageFormat, value: [f32; 4]) -> [u8; 4] {
    let unorm = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        ImageFormat::R32Float => value[0].to_le_bytes(),
        ImageFormat::Rg16Float => {
            let r = f16_bits(value[0]).to_le_bytes();
            let g = f16_bits(value[1]).to_le_bytes();
            [r[0], r[1], g[0], g[1]]
        }
        ImageFormat::Rgba8Unorm | ImageFormat::Rgba8Srgb => {
            [unorm(value[0]), unorm(value[1]), unorm(value[2]), unorm(value[3])]
        }
        _ => [unorm(value[2]), unorm(value[1]), unorm(value[0]), unorm(value[3])],
    }
}

/// Truncating f32 -> IEEE half conversion; exact for the values clears use.
fn f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32 - 127 + 15;
    if value == 0.0 || exponent <= 0 {
        return sign;
    }
    if exponent >= 0x1f {
        return sign | 0x7c00;
    }
    sign | ((exponent as u16) << 10) | ((bits >> 13) & 0x3ff) as u16
}

impl GpuDevice for SoftDevice {
    fn backend_name(&self) -> &'static str {
        "software"
    }

    fn create_image(&mut self, desc: &ImageDesc) -> GpuResult<ImageHandle> {
        if desc.extent.is_empty() {
            return Err(GpuError::backend("create_image", desc.extent));
        }
        let handle = ImageHandle(self.issue());
        let size = desc.extent.pixel_count() as usize * desc.format.bytes_per_texel();
        self.images.insert(
            handle,
            SoftImage {
                desc: *desc,
                layout: ImageLayout::Undefined,
                data: vec![0; size],
                memory: None,
                swapchain_owned: false,
            },
        );
        Ok(handle)
    }

    fn image_memory_requirements(&self, image: ImageHandle) -> GpuResult<MemoryRequirements> {
        let img = self.images.get(&image).ok_or(GpuError::UnknownHandle {
            kind: "image",
            raw: image.0,
        })?;
        Ok(MemoryRequirements {
            size: img.data.len() as u64,
            alignment: ALIGNMENT,
            type_bits: MEMORY_TYPE_BITS,
        })
    }

    fn allocate_memory(
        &mut self,
        requirements: &MemoryRequirements,
        location: MemoryLocation,
    ) -> GpuResult<MemoryHandle> {
        if requirements.size == 0 {
            return Err(GpuError::backend("allocate_memory", "zero-sized allocation"));
        }
        if requirements.type_bits & MEMORY_TYPE_BITS == 0 {
            return Err(GpuError::NoSuitableMemoryType {
                type_bits: requirements.type_bits,
            });
        }
        let handle = MemoryHandle(self.issue());
        let bytes = match location {
            MemoryLocation::HostVisible => vec![0xcd; requirements.size as usize],
            MemoryLocation::DeviceLocal => Vec::new(),
        };
        self.memories.insert(handle, SoftMemory { location, bytes });
        Ok(handle)
    }

    fn bind_image_memory(&mut self, image: ImageHandle, memory: MemoryHandle) -> GpuResult<()> {
        if !self.memories.contains_key(&memory) {
            return Err(GpuError::UnknownHandle {
                kind: "memory",
                raw: memory.0,
            });
        }
        let img = self.image_mut(image)?;
        if img.memory.is_some() {
            return Err(GpuError::backend("bind_image_memory", "image already bound"));
        }
        img.memory = Some(memory);
        Ok(())
    }

    fn create_image_view(&mut self, image: ImageHandle, _format: ImageFormat) -> GpuResult<ViewHandle> {
        let img = self.image_mut(image)?;
        if img.memory.is_none() {
            return Err(GpuError::backend("create_image_view", "image has no memory"));
        }
        let handle = ViewHandle(self.issue());
        self.views.insert(handle, image);
        Ok(handle)
    }

    fn destroy_image_view(&mut self, view: ViewHandle) {
        if view.is_null() {
            return;
        }
        if self.views.remove(&view).is_none() {
            self.violation(format!("destroyed unknown view {:?}", view));
        }
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if image.is_null() {
            return;
        }
        if self.in_flight.contains(&image) {
            self.violation(format!("destroyed {:?} while GPU work referenced it", image));
        }
        if self.views.values().any(|&owner| owner == image) {
            self.violation(format!("destroyed {:?} before its view", image));
        }
        if self.images.remove(&image).is_none() {
            self.violation(format!("destroyed unknown image {:?}", image));
        }
    }

    fn free_memory(&mut self, memory: MemoryHandle) {
        if memory.is_null() {
            return;
        }
        let still_bound = self.images.values().any(|img| img.memory == Some(memory))
            || self.buffers.values().any(|buf| buf.memory == Some(memory));
        if still_bound {
            self.violation(format!("freed {:?} while still bound", memory));
        }
        if self.memories.remove(&memory).is_none() {
            self.violation(format!("freed unknown memory {:?}", memory));
        }
    }

    fn create_buffer(&mut self, size: u64) -> GpuResult<BufferHandle> {
        if size == 0 {
            return Err(GpuError::backend("create_buffer", "zero-sized buffer"));
        }
        let handle = BufferHandle(self.issue());
        self.buffers.insert(handle, SoftBuffer { size, memory: None });
        Ok(handle)
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> GpuResult<MemoryRequirements> {
        let buf = self.buffers.get(&buffer).ok_or(GpuError::UnknownHandle {
            kind: "buffer",
            raw: buffer.0,
        })?;
        Ok(MemoryRequirements {
            size: buf.size.div_ceil(ALIGNMENT) * ALIGNMENT,
            alignment: ALIGNMENT,
            type_bits: MEMORY_TYPE_BITS,
        })
    }

    fn bind_buffer_memory(&mut self, buffer: BufferHandle, memory: MemoryHandle) -> GpuResult<()> {
        let size = self
            .memories
            .get(&memory)
            .map(|m| m.bytes.len() as u64)
            .ok_or(GpuError::UnknownHandle {
                kind: "memory",
                raw: memory.0,
            })?;
        let buf = self.buffers.get_mut(&buffer).ok_or(GpuError::UnknownHandle {
            kind: "buffer",
            raw: buffer.0,
        })?;
        if size < buf.size {
            return Err(GpuError::backend("bind_buffer_memory", "memory smaller than buffer"));
        }
        buf.memory = Some(memory);
        Ok(())
    }

    fn write_mapped(
        &mut self,
        memory: MemoryHandle,
        size: u64,
        write: &mut dyn FnMut(&mut [u8]),
    ) -> GpuResult<()> {
        let mem = self.memories.get_mut(&memory).ok_or(GpuError::UnknownHandle {
            kind: "memory",
            raw: memory.0,
        })?;
        if mem.location != MemoryLocation::HostVisible {
            return Err(GpuError::backend("map_memory", "memory is not host-visible"));
        }
        if size as usize > mem.bytes.len() {
            return Err(GpuError::backend("map_memory", "range exceeds allocation"));
        }
        write(&mut mem.bytes[..size as usize]);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if buffer.is_null() {
            return;
        }
        if self.buffers.remove(&buffer).is_none() {
            self.violation(format!("destroyed unknown buffer {:?}", buffer));
        }
    }

    fn create_semaphore(&mut self) -> GpuResult<SemaphoreHandle> {
        let handle = SemaphoreHandle(self.issue());
        self.semaphores.insert(handle, false);
        Ok(handle)
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if !semaphore.is_null() {
            self.semaphores.remove(&semaphore);
        }
    }

    fn create_fence(&mut self, signaled: bool) -> GpuResult<FenceHandle> {
        let handle = FenceHandle(self.issue());
        self.fences.insert(handle, signaled);
        Ok(handle)
    }

    fn wait_for_fence(&mut self, fence: FenceHandle, _timeout: Duration) -> GpuResult<FenceWait> {
        if self.fence_timeouts > 0 {
            self.fence_timeouts -= 1;
            return Ok(FenceWait::Timeout);
        }
        match self.fences.get(&fence) {
            Some(true) => {
                self.in_flight.clear();
                Ok(FenceWait::Signaled)
            }
            // Nothing will ever signal it: the CPU would hang here.
            Some(false) => Err(GpuError::backend("wait_for_fences", "fence never submitted")),
            None => Err(GpuError::UnknownHandle {
                kind: "fence",
                raw: fence.0,
            }),
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> GpuResult<()> {
        let state = self.fences.get_mut(&fence).ok_or(GpuError::UnknownHandle {
            kind: "fence",
            raw: fence.0,
        })?;
        *state = false;
        Ok(())
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if !fence.is_null() {
            self.fences.remove(&fence);
        }
    }

    fn allocate_command_buffer(&mut self) -> GpuResult<CommandBufferHandle> {
        let handle = CommandBufferHandle(self.issue());
        self.command_buffers.insert(handle, Vec::new());
        Ok(handle)
    }

    fn free_command_buffer(&mut self, command_buffer: CommandBufferHandle) {
        if !command_buffer.is_null() {
            self.command_buffers.remove(&command_buffer);
        }
    }

    fn record(&mut self, command_buffer: CommandBufferHandle, commands: &[Command]) -> GpuResult<()> {
        let recorded = self
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(GpuError::UnknownHandle {
                kind: "command buffer",
                raw: command_buffer.0,
            })?;
        recorded.clear();
        recorded.extend_from_slice(commands);
        Ok(())
    }

    fn submit(&mut self, submit: &SubmitInfo) -> GpuResult<()> {
        match self.semaphores.get_mut(&submit.wait) {
            Some(signaled) if *signaled => *signaled = false,
            _ => return Err(GpuError::backend("queue_submit", "wait semaphore never signaled")),
        }
        match self.fences.get(&submit.fence) {
            Some(false) => {}
            _ => return Err(GpuError::backend("queue_submit", "fence must be unsignaled")),
        }

        let commands = self
            .command_buffers
            .get(&submit.command_buffer)
            .cloned()
            .ok_or(GpuError::UnknownHandle {
                kind: "command buffer",
                raw: submit.command_buffer.0,
            })?;
        for command in &commands {
            self.execute(command)?;
        }

        self.semaphores.insert(submit.signal, true);
        self.fences.insert(submit.fence, true);
        self.submits += 1;
        Ok(())
    }

    fn wait_idle(&mut self) -> GpuResult<()> {
        self.in_flight.clear();
        Ok(())
    }

    fn surface_support(&mut self) -> GpuResult<SurfaceSupport> {
        Ok(self.support.clone())
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> GpuResult<Swapchain> {
        let caps = self.support.capabilities;
        let fits = desc.extent.width >= caps.min_extent.width
            && desc.extent.height >= caps.min_extent.height
            && desc.extent.width <= caps.max_extent.width
            && desc.extent.height <= caps.max_extent.height;
        if !fits || desc.extent.is_empty() {
            return Err(GpuError::backend("create_swapchain", desc.extent));
        }
        if !self.support.formats.iter().any(|f| *f == desc.format)
            && !(self.support.formats.len() == 1
                && self.support.formats[0].format == ImageFormat::Undefined)
        {
            return Err(GpuError::Unsupported(format!("{:?}", desc.format)));
        }

        let handle = SwapchainHandle(self.issue());
        let mut images = Vec::with_capacity(desc.image_count as usize);
        for _ in 0..desc.image_count {
            let image = ImageHandle(self.issue());
            self.images.insert(
                image,
                SoftImage {
                    desc: ImageDesc {
                        extent: desc.extent,
                        format: desc.format.format,
                        usage: ImageUsage::TRANSFER_DST,
                    },
                    layout: ImageLayout::Undefined,
                    data: vec![0; desc.extent.pixel_count() as usize * 4],
                    memory: None,
                    swapchain_owned: true,
                },
            );
            images.push(image);
        }
        self.swapchains.insert(
            handle,
            SoftSwapchain {
                desc: *desc,
                images: images.clone(),
                next: 0,
                acquired: HashSet::new(),
            },
        );
        Ok(Swapchain { handle, images })
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) {
        if swapchain.is_null() {
            return;
        }
        let Some(chain) = self.swapchains.remove(&swapchain) else {
            self.violation(format!("destroyed unknown swapchain {:?}", swapchain));
            return;
        };
        for image in chain.images {
            if self.in_flight.contains(&image) {
                self.violation(format!("destroyed swapchain image {:?} in flight", image));
            }
            self.images.remove(&image);
        }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        _timeout: Duration,
    ) -> GpuResult<AcquireOutcome> {
        if self.out_of_date_acquires > 0 {
            self.out_of_date_acquires -= 1;
            return Ok(AcquireOutcome::OutOfDate);
        }
        let stale = match self.swapchains.get(&swapchain) {
            Some(chain) => self.surface_is_stale(chain),
            None => {
                return Err(GpuError::UnknownHandle {
                    kind: "swapchain",
                    raw: swapchain.0,
                })
            }
        };
        if stale {
            return Ok(AcquireOutcome::OutOfDate);
        }
        match self.semaphores.get_mut(&signal) {
            Some(signaled) if !*signaled => *signaled = true,
            _ => return Err(GpuError::backend("acquire_next_image", "semaphore already signaled")),
        }

        let chain = self
            .swapchains
            .get_mut(&swapchain)
            .ok_or(GpuError::UnknownHandle {
                kind: "swapchain",
                raw: swapchain.0,
            })?;
        let index = chain.next % chain.images.len() as u32;
        chain.next = chain.next.wrapping_add(1);
        chain.acquired.insert(index);
        let suboptimal = self.suboptimal_acquires > 0;
        if suboptimal {
            self.suboptimal_acquires -= 1;
        }
        Ok(AcquireOutcome::Acquired { index, suboptimal })
    }

    fn present(
        &mut self,
        swapchain: SwapchainHandle,
        index: u32,
        wait: SemaphoreHandle,
    ) -> GpuResult<PresentOutcome> {
        match self.semaphores.get_mut(&wait) {
            Some(signaled) if *signaled => *signaled = false,
            _ => return Err(GpuError::backend("queue_present", "wait semaphore never signaled")),
        }
        let (image, extent) = {
            let chain = self
                .swapchains
                .get_mut(&swapchain)
                .ok_or(GpuError::UnknownHandle {
                    kind: "swapchain",
                    raw: swapchain.0,
                })?;
            if !chain.acquired.remove(&index) {
                return Err(GpuError::backend("queue_present", "image was not acquired"));
            }
            (chain.images[index as usize], chain.desc.extent)
        };
        self.expect_layout(image, ImageLayout::PresentSrc)?;

        let data = self
            .images
            .get(&image)
            .map(|img| img.data.clone())
            .unwrap_or_default();
        if self.presented.len() == PRESENTED_HISTORY {
            self.presented.pop_front();
        }
        self.presented.push_back(PresentedFrame {
            swapchain,
            image,
            extent,
            data,
        });
        self.presents += 1;

        if self.out_of_date_presents > 0 {
            self.out_of_date_presents -= 1;
            return Ok(PresentOutcome::OutOfDate);
        }
        let stale = self
            .swapchains
            .get(&swapchain)
            .map(|chain| self.surface_is_stale(chain))
            .unwrap_or(false);
        if stale {
            return Ok(PresentOutcome::OutOfDate);
        }
        Ok(PresentOutcome::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::ImageBarrier;

    fn color_image(device: &mut SoftDevice, extent: Extent2D) -> ImageHandle {
        let image = device
            .create_image(&ImageDesc {
                extent,
                format: ImageFormat::Bgra8Unorm,
                usage: ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC,
            })
            .unwrap();
        let req = device.image_memory_requirements(image).unwrap();
        let memory = device.allocate_memory(&req, MemoryLocation::DeviceLocal).unwrap();
        device.bind_image_memory(image, memory).unwrap();
        image
    }

    fn submit(device: &mut SoftDevice, commands: &[Command]) -> GpuResult<()> {
        let cmd = device.allocate_command_buffer().unwrap();
        let wait = device.create_semaphore().unwrap();
        let signal = device.create_semaphore().unwrap();
        let fence = device.create_fence(false).unwrap();
        device.semaphores.insert(wait, true);
        device.record(cmd, commands).unwrap();
        device.submit(&SubmitInfo {
            command_buffer: cmd,
            wait,
            signal,
            fence,
        })
    }

    #[test]
    fn barrier_with_wrong_prior_layout_is_rejected() {
        let mut device = SoftDevice::new(Extent2D::new(4, 4));
        let image = color_image(&mut device, Extent2D::new(4, 4));

        let first = Command::Barrier(ImageBarrier {
            image,
            old: ImageLayout::Undefined,
            new: ImageLayout::TransferDst,
        });
        submit(&mut device, &[first]).unwrap();
        assert_eq!(device.layout_of(image), Some(ImageLayout::TransferDst));

        let wrong = Command::Barrier(ImageBarrier {
            image,
            old: ImageLayout::ShaderReadOnly,
            new: ImageLayout::TransferSrc,
        });
        let err = submit(&mut device, &[wrong]).unwrap_err();
        assert!(matches!(err, GpuError::LayoutMismatch { .. }));
    }

    #[test]
    fn blit_scales_nearest() {
        let mut device = SoftDevice::new(Extent2D::new(4, 4));
        let src = color_image(&mut device, Extent2D::new(2, 1));
        let dst = color_image(&mut device, Extent2D::new(4, 2));
        device.images.get_mut(&src).unwrap().data = vec![1, 2, 3, 4, 5, 6, 7, 8];

        let commands = [
            Command::Barrier(ImageBarrier {
                image: src,
                old: ImageLayout::Undefined,
                new: ImageLayout::TransferSrc,
            }),
            Command::Barrier(ImageBarrier {
                image: dst,
                old: ImageLayout::Undefined,
                new: ImageLayout::TransferDst,
            }),
            Command::BlitImage {
                src,
                src_layout: ImageLayout::TransferSrc,
                src_extent: Extent2D::new(2, 1),
                dst,
                dst_layout: ImageLayout::TransferDst,
                dst_extent: Extent2D::new(4, 2),
                filter: crate::gpu::Filter::Nearest,
            },
        ];
        submit(&mut device, &commands).unwrap();
        assert_eq!(device.read_pixel(dst, 0, 0), Some([1, 2, 3, 4]));
        assert_eq!(device.read_pixel(dst, 1, 1), Some([1, 2, 3, 4]));
        assert_eq!(device.read_pixel(dst, 3, 1), Some([5, 6, 7, 8]));
    }

    #[test]
    fn destroying_in_flight_image_is_a_violation() {
        let mut device = SoftDevice::new(Extent2D::new(4, 4));
        let image = color_image(&mut device, Extent2D::new(4, 4));
        let barrier = Command::Barrier(ImageBarrier {
            image,
            old: ImageLayout::Undefined,
            new: ImageLayout::General,
        });
        submit(&mut device, &[barrier]).unwrap();
        device.destroy_image(image);
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn clear_encodes_per_format() {
        assert_eq!(encode_texel(ImageFormat::Bgra8Unorm, [1.0, 0.0, 0.0, 1.0]), [0, 0, 255, 255]);
        assert_eq!(encode_texel(ImageFormat::R32Float, [0.0; 4]), [0, 0, 0, 0]);
        assert_eq!(f16_bits(1.0), 0x3c00);
        assert_eq!(f16_bits(-2.0), 0xc000);
    }

    #[test]
    fn acquire_reports_out_of_date_after_window_resize() {
        let mut device = SoftDevice::new(Extent2D::new(800, 600));
        let chain = device
            .create_swapchain(&SwapchainDesc {
                image_count: 3,
                format: SurfaceFormat {
                    format: ImageFormat::Bgra8Unorm,
                    color_space: ColorSpace::SrgbNonlinear,
                },
                extent: Extent2D::new(800, 600),
                present_mode: PresentMode::Fifo,
            })
            .unwrap();
        let sem = device.create_semaphore().unwrap();
        device.set_window_extent(Extent2D::new(1920, 1080));
        let outcome = device
            .acquire_next_image(chain.handle, sem, Duration::from_secs(1))
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::OutOfDate);
    }

    #[test]
    fn presented_history_is_bounded() {
        let extent = Extent2D::new(2, 2);
        let mut device = SoftDevice::new(extent);
        let chain = device
            .create_swapchain(&SwapchainDesc {
                image_count: 2,
                format: SurfaceFormat {
                    format: ImageFormat::Bgra8Unorm,
                    color_space: ColorSpace::SrgbNonlinear,
                },
                extent,
                present_mode: PresentMode::Fifo,
            })
            .unwrap();
        let cmd = device.allocate_command_buffer().unwrap();
        let frames = PRESENTED_HISTORY + 3;
        for _ in 0..frames {
            let ready = device.create_semaphore().unwrap();
            let done = device.create_semaphore().unwrap();
            let fence = device.create_fence(false).unwrap();
            let AcquireOutcome::Acquired { index, .. } = device
                .acquire_next_image(chain.handle, ready, Duration::from_secs(1))
                .unwrap()
            else {
                panic!("acquire failed");
            };
            let to_present = Command::Barrier(ImageBarrier {
                image: chain.images[index as usize],
                old: ImageLayout::Undefined,
                new: ImageLayout::PresentSrc,
            });
            device.record(cmd, &[to_present]).unwrap();
            device
                .submit(&SubmitInfo {
                    command_buffer: cmd,
                    wait: ready,
                    signal: done,
                    fence,
                })
                .unwrap();
            device.wait_for_fence(fence, Duration::from_secs(1)).unwrap();
            assert_eq!(
                device.present(chain.handle, index, done).unwrap(),
                PresentOutcome::Presented
            );
        }
        assert_eq!(device.present_count(), frames as u64);
        assert_eq!(device.presented().count(), PRESENTED_HISTORY);
        assert!(device.last_presented().is_some());
    }

    #[test]
    fn forced_suboptimal_acquire_still_hands_out_an_image() {
        let extent = Extent2D::new(4, 4);
        let mut device = SoftDevice::new(extent);
        let chain = device
            .create_swapchain(&SwapchainDesc {
                image_count: 2,
                format: SurfaceFormat {
                    format: ImageFormat::Bgra8Unorm,
                    color_space: ColorSpace::SrgbNonlinear,
                },
                extent,
                present_mode: PresentMode::Fifo,
            })
            .unwrap();
        device.force_suboptimal_acquires(1);
        let first = device.create_semaphore().unwrap();
        let second = device.create_semaphore().unwrap();
        let timeout = Duration::from_secs(1);
        assert_eq!(
            device.acquire_next_image(chain.handle, first, timeout).unwrap(),
            AcquireOutcome::Acquired { index: 0, suboptimal: true }
        );
        assert_eq!(
            device.acquire_next_image(chain.handle, second, timeout).unwrap(),
            AcquireOutcome::Acquired { index: 1, suboptimal: false }
        );
    }
}
