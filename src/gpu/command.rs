//! Backend-neutral command stream.
//!
//! The recorder emits these; each backend encodes them (the Vulkan backend
//! into a `VkCommandBuffer`, the software backend into CPU work).

use super::{BufferHandle, ImageHandle, ImageLayout};
use crate::frame::Extent2D;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub old: ImageLayout,
    pub new: ImageLayout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barrier(ImageBarrier),
    /// Tightly packed buffer rows into the top-left `extent` of `image`
    CopyBufferToImage {
        buffer: BufferHandle,
        image: ImageHandle,
        layout: ImageLayout,
        extent: Extent2D,
    },
    /// Scaled copy of the full source onto the full destination
    BlitImage {
        src: ImageHandle,
        src_layout: ImageLayout,
        src_extent: Extent2D,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        dst_extent: Extent2D,
        filter: Filter,
    },
    /// Unscaled copy of the top-left `extent`
    CopyImage {
        src: ImageHandle,
        src_layout: ImageLayout,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        extent: Extent2D,
    },
    ClearColor {
        image: ImageHandle,
        layout: ImageLayout,
        value: [f32; 4],
    },
}

impl Command {
    /// Images this command touches, with the layout it expects each in
    pub fn image_uses(&self) -> Vec<(ImageHandle, ImageLayout)> {
        match *self {
            Command::Barrier(_) => Vec::new(),
            Command::CopyBufferToImage { image, layout, .. } => vec![(image, layout)],
            Command::BlitImage {
                src,
                src_layout,
                dst,
                dst_layout,
                ..
            }
            | Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                ..
            } => vec![(src, src_layout), (dst, dst_layout)],
            Command::ClearColor { image, layout, .. } => vec![(image, layout)],
        }
    }
}
