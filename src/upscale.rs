/*!
 * Upscale Stage
 *
 * Contract for a resampling service bound to one (render, display) extent
 * pair at a time. Dispatch records into the orchestrator's command stream so
 * its work is ordered with the copies around it.
 *
 * The identity stage here is the built-in implementation: it blits the
 * render-resolution input straight onto the output image.
 */

use tracing::{debug, info};

use crate::error::UpscaleError;
use crate::frame::Extent2D;
use crate::gpu::{Filter, GpuDevice, ImageLayout};
use crate::recorder::FrameRecorder;
use crate::resources::GpuImage;

/// Sub-pixel offset used by the two-phase jitter, in render pixels
pub const JITTER_OFFSET: f32 = 0.25;

/// Opaque binding returned by [`UpscaleStage::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpscaleHandle(pub u64);

/// Images a dispatch reads and writes. Inputs arrive in `ShaderReadOnly`,
/// the output in `General`; all must be left that way.
pub struct UpscaleImages<'a> {
    pub input_color: &'a mut GpuImage,
    pub depth: &'a mut GpuImage,
    pub motion_vectors: &'a mut GpuImage,
    pub output_color: &'a mut GpuImage,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchParams {
    /// Sub-pixel jitter in the stage's sign convention
    pub jitter: [f32; 2],
    pub motion_vector_scale: [f32; 2],
    pub frame_time_delta_ms: f32,
    /// Discard temporal history; set on the first dispatch of a binding
    pub reset: bool,
}

pub trait UpscaleStage {
    fn name(&self) -> &'static str;

    fn create(
        &mut self,
        device: &mut dyn GpuDevice,
        render: Extent2D,
        display: Extent2D,
    ) -> Result<UpscaleHandle, UpscaleError>;

    fn dispatch(
        &mut self,
        handle: UpscaleHandle,
        recorder: &mut FrameRecorder,
        images: UpscaleImages<'_>,
        params: &DispatchParams,
    ) -> Result<(), UpscaleError>;

    fn destroy(&mut self, device: &mut dyn GpuDevice, handle: UpscaleHandle);
}

/// Two-phase sub-pixel jitter keyed on frame parity.
#[derive(Debug, Clone)]
pub struct JitterSequence {
    enabled: bool,
    frame: u64,
}

impl JitterSequence {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, frame: 0 }
    }

    /// Camera-space offset for the current frame
    pub fn camera_offset(&self) -> [f32; 2] {
        if !self.enabled {
            return [0.0, 0.0];
        }
        if self.frame % 2 == 0 {
            [JITTER_OFFSET, JITTER_OFFSET]
        } else {
            [-JITTER_OFFSET, -JITTER_OFFSET]
        }
    }

    /// What the stage receives: the camera offset negated
    pub fn dispatch_offset(&self) -> [f32; 2] {
        let [x, y] = self.camera_offset();
        [-x, -y]
    }

    pub fn advance(&mut self) {
        self.frame = self.frame.wrapping_add(1);
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }
}

fn expect_layout(image: &GpuImage, layout: ImageLayout) -> Result<(), UpscaleError> {
    if image.layout != layout {
        return Err(UpscaleError::Dispatch(format!(
            "{:?} is {} but the stage expects {}",
            image.role, image.layout, layout
        )));
    }
    Ok(())
}

/// Resamples input onto output with a blit. Ignores depth, motion and jitter.
#[derive(Debug, Default)]
pub struct IdentityUpscaler {
    live: Option<(UpscaleHandle, Extent2D, Extent2D)>,
    next_id: u64,
    dispatches: u64,
}

impl IdentityUpscaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        self.live.is_some()
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }
}

impl UpscaleStage for IdentityUpscaler {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn create(
        &mut self,
        _device: &mut dyn GpuDevice,
        render: Extent2D,
        display_extent: Extent2D,
    ) -> Result<UpscaleHandle, UpscaleError> {
        if render.is_empty() || display_extent.is_empty() {
            return Err(UpscaleError::Create {
                stage: self.name(),
                render,
                display: display_extent,
                reason: "empty extent".to_string(),
            });
        }
        if let Some((handle, ..)) = self.live {
            return Err(UpscaleError::Create {
                stage: self.name(),
                render,
                display: display_extent,
                reason: format!("binding {:?} is still live", handle),
            });
        }
        self.next_id += 1;
        let handle = UpscaleHandle(self.next_id);
        self.live = Some((handle, render, display_extent));
        info!(
            "[Upscale] Identity stage bound {:?}: {} -> {}",
            handle, render, display_extent
        );
        Ok(handle)
    }

    fn dispatch(
        &mut self,
        handle: UpscaleHandle,
        recorder: &mut FrameRecorder,
        images: UpscaleImages<'_>,
        params: &DispatchParams,
    ) -> Result<(), UpscaleError> {
        match self.live {
            Some((live, render, display)) if live == handle => {
                if images.input_color.extent != render || images.output_color.extent != display {
                    return Err(UpscaleError::Dispatch(format!(
                        "images {} -> {} do not match binding {} -> {}",
                        images.input_color.extent, images.output_color.extent, render, display
                    )));
                }
            }
            _ => return Err(UpscaleError::NotBound),
        }
        expect_layout(images.input_color, ImageLayout::ShaderReadOnly)?;
        expect_layout(images.depth, ImageLayout::ShaderReadOnly)?;
        expect_layout(images.motion_vectors, ImageLayout::ShaderReadOnly)?;
        expect_layout(images.output_color, ImageLayout::General)?;

        if params.reset {
            debug!("[Upscale] History reset on {:?}", handle);
        }

        recorder.transition(&mut *images.input_color, ImageLayout::TransferSrc);
        recorder.blit(&*images.input_color, &*images.output_color, Filter::Nearest);
        recorder.transition(&mut *images.input_color, ImageLayout::ShaderReadOnly);
        self.dispatches += 1;
        Ok(())
    }

    fn destroy(&mut self, _device: &mut dyn GpuDevice, handle: UpscaleHandle) {
        if matches!(self.live, Some((live, ..)) if live == handle) {
            debug!("[Upscale] Identity stage released {:?}", handle);
            self.live = None;
        }
    }
}

/// Blit `input` onto `output` without an upscale stage, leaving both in the
/// layouts a dispatch would.
pub fn passthrough(recorder: &mut FrameRecorder, input: &mut GpuImage, output: &GpuImage) {
    recorder.transition(&mut *input, ImageLayout::TransferSrc);
    recorder.blit(&*input, output, Filter::Linear);
    recorder.transition(&mut *input, ImageLayout::ShaderReadOnly);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::soft::SoftDevice;
    use crate::resources::{FrameResourceSet, ResolutionState};

    #[test]
    fn jitter_alternates_and_negates() {
        let mut jitter = JitterSequence::new(true);
        assert_eq!(jitter.camera_offset(), [0.25, 0.25]);
        assert_eq!(jitter.dispatch_offset(), [-0.25, -0.25]);
        jitter.advance();
        assert_eq!(jitter.camera_offset(), [-0.25, -0.25]);
        assert_eq!(jitter.dispatch_offset(), [0.25, 0.25]);
        jitter.advance();
        assert_eq!(jitter.camera_offset(), [0.25, 0.25]);

        let off = JitterSequence::new(false);
        assert_eq!(off.dispatch_offset(), [0.0, 0.0]);
    }

    #[test]
    fn binding_is_one_to_one() {
        let mut device = SoftDevice::new(Extent2D::new(8, 8));
        let mut stage = IdentityUpscaler::new();
        let render = Extent2D::new(4, 4);
        let display = Extent2D::new(8, 8);

        let handle = stage.create(&mut device, render, display).unwrap();
        assert!(stage.create(&mut device, render, display).is_err());
        stage.destroy(&mut device, handle);
        assert!(!stage.is_bound());
        let again = stage.create(&mut device, render, display).unwrap();
        assert_ne!(handle, again);
    }

    #[test]
    fn create_errors_name_both_extents() {
        let mut device = SoftDevice::new(Extent2D::new(8, 8));
        let mut stage = IdentityUpscaler::new();
        let render = Extent2D::new(4, 4);

        match stage.create(&mut device, render, Extent2D::new(0, 8)) {
            Err(UpscaleError::Create {
                render: r, display, ..
            }) => {
                assert_eq!(r, render);
                assert_eq!(display, Extent2D::new(0, 8));
            }
            other => panic!("expected a create error, got {:?}", other),
        }
        assert!(!stage.is_bound());

        let err = stage
            .create(&mut device, render, Extent2D::new(8, 8))
            .and_then(|_| stage.create(&mut device, render, Extent2D::new(16, 16)))
            .unwrap_err();
        assert!(err.to_string().contains("4x4 -> 16x16"), "{}", err);
    }

    #[test]
    fn dispatch_requires_live_binding_and_layouts() {
        let mut device = SoftDevice::new(Extent2D::new(8, 8));
        let resolution = ResolutionState::new(Extent2D::new(4, 4), Extent2D::new(8, 8));
        let mut set = FrameResourceSet::create(&mut device, resolution, 1).unwrap();
        let mut stage = IdentityUpscaler::new();
        let mut recorder = FrameRecorder::new();
        let params = DispatchParams {
            jitter: [0.0, 0.0],
            motion_vector_scale: [4.0, 4.0],
            frame_time_delta_ms: 16.0,
            reset: true,
        };

        let images = set.images_mut().unwrap();
        let err = stage
            .dispatch(
                UpscaleHandle(99),
                &mut recorder,
                UpscaleImages {
                    input_color: images.input,
                    depth: images.depth,
                    motion_vectors: images.motion,
                    output_color: images.output,
                },
                &params,
            )
            .unwrap_err();
        assert!(matches!(err, UpscaleError::NotBound));

        let handle = stage.create(&mut device, resolution.render, resolution.display).unwrap();
        let images = set.images_mut().unwrap();
        let err = stage
            .dispatch(
                handle,
                &mut recorder,
                UpscaleImages {
                    input_color: images.input,
                    depth: images.depth,
                    motion_vectors: images.motion,
                    output_color: images.output,
                },
                &params,
            )
            .unwrap_err();
        assert!(matches!(err, UpscaleError::Dispatch(_)));
        assert!(recorder.is_empty());
    }
}
