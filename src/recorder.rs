//! Frame command recording.
//!
//! Every transition reads the prior layout from the image's tracked field
//! and writes the new layout back in the same call, so the next transition
//! of that image always assumes exactly what the last one produced.

use crate::frame::Extent2D;
use crate::gpu::{BufferHandle, Command, Filter, ImageBarrier, ImageHandle, ImageLayout};
use crate::resources::GpuImage;
use crate::surface::SwapchainImage;

/// An image whose layout the application tracks.
pub trait TrackedImage {
    fn handle(&self) -> ImageHandle;
    fn extent(&self) -> Extent2D;
    fn layout(&self) -> ImageLayout;
    fn set_layout(&mut self, layout: ImageLayout);
}

impl TrackedImage for GpuImage {
    fn handle(&self) -> ImageHandle {
        self.handle
    }

    fn extent(&self) -> Extent2D {
        self.extent
    }

    fn layout(&self) -> ImageLayout {
        self.layout
    }

    fn set_layout(&mut self, layout: ImageLayout) {
        self.layout = layout;
    }
}

impl TrackedImage for SwapchainImage {
    fn handle(&self) -> ImageHandle {
        self.handle
    }

    fn extent(&self) -> Extent2D {
        self.extent
    }

    fn layout(&self) -> ImageLayout {
        self.layout
    }

    fn set_layout(&mut self, layout: ImageLayout) {
        self.layout = layout;
    }
}

/// Commands for one frame, built in submission order.
#[derive(Debug, Default)]
pub struct FrameRecorder {
    commands: Vec<Command>,
}

impl FrameRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new frame, reusing the allocation
    pub fn reset(&mut self) {
        self.commands.clear();
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Move `image` from its tracked layout to `new`.
    pub fn transition(&mut self, image: &mut dyn TrackedImage, new: ImageLayout) {
        let old = image.layout();
        self.barrier(image, old, new);
    }

    /// Move `image` to `new`, discarding its contents.
    pub fn discard(&mut self, image: &mut dyn TrackedImage, new: ImageLayout) {
        self.barrier(image, ImageLayout::Undefined, new);
    }

    fn barrier(&mut self, image: &mut dyn TrackedImage, old: ImageLayout, new: ImageLayout) {
        self.commands.push(Command::Barrier(ImageBarrier {
            image: image.handle(),
            old,
            new,
        }));
        image.set_layout(new);
    }

    /// Copy the top-left `extent` of tightly packed rows from `buffer`.
    pub fn copy_buffer_to_image(
        &mut self,
        buffer: BufferHandle,
        image: &dyn TrackedImage,
        extent: Extent2D,
    ) {
        self.commands.push(Command::CopyBufferToImage {
            buffer,
            image: image.handle(),
            layout: image.layout(),
            extent: extent.min(image.extent()),
        });
    }

    /// Scale the whole of `src` onto the whole of `dst`.
    pub fn blit(&mut self, src: &dyn TrackedImage, dst: &dyn TrackedImage, filter: Filter) {
        self.commands.push(Command::BlitImage {
            src: src.handle(),
            src_layout: src.layout(),
            src_extent: src.extent(),
            dst: dst.handle(),
            dst_layout: dst.layout(),
            dst_extent: dst.extent(),
            filter,
        });
    }

    /// Unscaled copy of the region both images share.
    pub fn copy_image(&mut self, src: &dyn TrackedImage, dst: &dyn TrackedImage) {
        self.commands.push(Command::CopyImage {
            src: src.handle(),
            src_layout: src.layout(),
            dst: dst.handle(),
            dst_layout: dst.layout(),
            extent: src.extent().min(dst.extent()),
        });
    }

    /// Copy when extents match, scale otherwise.
    pub fn copy_or_blit(&mut self, src: &dyn TrackedImage, dst: &dyn TrackedImage, filter: Filter) {
        if src.extent() == dst.extent() {
            self.copy_image(src, dst);
        } else {
            self.blit(src, dst, filter);
        }
    }

    pub fn clear(&mut self, image: &dyn TrackedImage, value: [f32; 4]) {
        self.commands.push(Command::ClearColor {
            image: image.handle(),
            layout: image.layout(),
            value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swap_image(raw: u64) -> SwapchainImage {
        SwapchainImage {
            handle: ImageHandle(raw),
            layout: ImageLayout::Undefined,
            extent: Extent2D::new(4, 4),
        }
    }

    #[test]
    fn transition_chains_from_tracked_layout() {
        let mut recorder = FrameRecorder::new();
        let mut image = swap_image(9);

        recorder.transition(&mut image, ImageLayout::TransferDst);
        recorder.transition(&mut image, ImageLayout::PresentSrc);
        assert_eq!(image.layout, ImageLayout::PresentSrc);

        let olds: Vec<_> = recorder
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::Barrier(b) => Some((b.old, b.new)),
                _ => None,
            })
            .collect();
        assert_eq!(
            olds,
            vec![
                (ImageLayout::Undefined, ImageLayout::TransferDst),
                (ImageLayout::TransferDst, ImageLayout::PresentSrc),
            ]
        );
    }

    #[test]
    fn discard_always_assumes_undefined() {
        let mut recorder = FrameRecorder::new();
        let mut image = swap_image(3);
        image.layout = ImageLayout::PresentSrc;

        recorder.discard(&mut image, ImageLayout::TransferDst);
        assert_eq!(
            recorder.commands()[0],
            Command::Barrier(ImageBarrier {
                image: ImageHandle(3),
                old: ImageLayout::Undefined,
                new: ImageLayout::TransferDst,
            })
        );
        assert_eq!(image.layout, ImageLayout::TransferDst);
    }

    #[test]
    fn copy_or_blit_picks_by_extent() {
        let mut recorder = FrameRecorder::new();
        let a = swap_image(1);
        let mut b = swap_image(2);
        recorder.copy_or_blit(&a, &b, Filter::Linear);
        b.extent = Extent2D::new(8, 8);
        recorder.copy_or_blit(&a, &b, Filter::Linear);

        assert!(matches!(recorder.commands()[0], Command::CopyImage { .. }));
        assert!(matches!(recorder.commands()[1], Command::BlitImage { .. }));
        recorder.reset();
        assert!(recorder.is_empty());
    }
}
