/*!
 * Frame Orchestrator
 *
 * Drives one overlay session: drain window events, reconcile sizes, capture,
 * upload, record, submit, present. Owns every GPU object of the session and
 * is the only thing that mutates them.
 *
 * At most one frame of GPU work is outstanding. The in-flight fence is
 * waited on before acquisition but reset only once an image was acquired,
 * so an iteration that bails out early never leaves it unsignaled.
 */

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::{AbsentReason, CapturePoll, CaptureSource, SizeChange};
use crate::config::OverlayConfig;
use crate::error::{GpuResult, SessionError, UpscaleError};
use crate::frame::Extent2D;
use crate::gpu::{
    AcquireOutcome, CommandBufferHandle, FenceHandle, FenceWait, Filter, GpuDevice, ImageLayout,
    SemaphoreHandle, SubmitInfo,
};
use crate::metrics::{summary_due, FrameMetrics, FrameTimer};
use crate::platform::{EventSummary, OutputWindow};
use crate::recorder::FrameRecorder;
use crate::resources::{FrameImagesMut, FrameResourceSet, ImageRole, ResolutionState};
use crate::staging::StagingBuffer;
use crate::surface::{PresentationSurface, SurfaceState, SwapchainImage};
use crate::upscale::{
    passthrough, DispatchParams, JitterSequence, UpscaleHandle, UpscaleImages, UpscaleStage,
};

/// Pause between iterations that had nothing to capture
const IDLE_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub fence_timeout: Duration,
    pub acquire_timeout: Duration,
    pub jitter: bool,
    pub prefer_low_latency: bool,
    pub stats_interval_frames: u64,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&OverlayConfig::default())
    }
}

impl From<&OverlayConfig> for OrchestratorOptions {
    fn from(config: &OverlayConfig) -> Self {
        Self {
            fence_timeout: config.fence_timeout(),
            acquire_timeout: config.acquire_timeout(),
            jitter: config.jitter,
            prefer_low_latency: config.prefer_low_latency,
            stats_interval_frames: config.stats_interval_frames,
        }
    }
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Toggle pressed; the process may start another session
    Toggled,
    /// Output or source window destroyed
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    CaptureAbsent(AbsentReason),
    /// Source has no usable size, so no resource set exists
    NoCaptureExtent,
    FenceTimeout,
    AcquireTimeout,
    SurfaceStale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { image_index: u32, epoch: u64 },
    Skipped(SkipReason),
    Finished(SessionEnd),
}

/// One frame's worth of synchronization.
#[derive(Debug, Clone, Copy)]
struct SyncSet {
    image_available: SemaphoreHandle,
    render_finished: SemaphoreHandle,
    in_flight: FenceHandle,
}

impl SyncSet {
    fn create(device: &mut dyn GpuDevice) -> GpuResult<Self> {
        let mut sync = SyncSet {
            image_available: SemaphoreHandle::NULL,
            render_finished: SemaphoreHandle::NULL,
            in_flight: FenceHandle::NULL,
        };
        let result = (|| -> GpuResult<()> {
            sync.image_available = device.create_semaphore()?;
            sync.render_finished = device.create_semaphore()?;
            // Signaled so the first frame's wait returns at once.
            sync.in_flight = device.create_fence(true)?;
            Ok(())
        })();
        match result {
            Ok(()) => Ok(sync),
            Err(e) => {
                sync.destroy(device);
                Err(e)
            }
        }
    }

    fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_fence(self.in_flight);
        device.destroy_semaphore(self.render_finished);
        device.destroy_semaphore(self.image_available);
    }
}

#[derive(Debug, Clone, Copy)]
struct UpscaleBinding {
    handle: UpscaleHandle,
    reset_pending: bool,
}

pub struct Orchestrator<D: GpuDevice, S: CaptureSource, W: OutputWindow> {
    device: D,
    source: S,
    window: W,
    upscaler: Option<Box<dyn UpscaleStage>>,
    binding: Option<UpscaleBinding>,
    surface: PresentationSurface,
    resources: Option<FrameResourceSet>,
    staging: Option<StagingBuffer>,
    command_buffer: CommandBufferHandle,
    sync: Option<SyncSet>,
    recorder: FrameRecorder,
    jitter: JitterSequence,
    options: OrchestratorOptions,
    metrics: FrameMetrics,
    capture_extent: Extent2D,
    epoch: u64,
    pending_rebuild: bool,
    last_frame: Option<Instant>,
    started: bool,
}

impl<D: GpuDevice, S: CaptureSource, W: OutputWindow> Orchestrator<D, S, W> {
    /// No GPU object exists until [`Orchestrator::start`].
    pub fn new(
        device: D,
        source: S,
        window: W,
        upscaler: Option<Box<dyn UpscaleStage>>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            device,
            source,
            window,
            upscaler,
            binding: None,
            surface: PresentationSurface::new(options.prefer_low_latency),
            resources: None,
            staging: None,
            command_buffer: CommandBufferHandle::NULL,
            sync: None,
            recorder: FrameRecorder::new(),
            jitter: JitterSequence::new(options.jitter),
            options,
            metrics: FrameMetrics::new(),
            capture_extent: Extent2D::default(),
            epoch: 0,
            pending_rebuild: false,
            last_frame: None,
            started: false,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn window_mut(&mut self) -> &mut W {
        &mut self.window
    }

    pub fn surface(&self) -> &PresentationSurface {
        &self.surface
    }

    pub fn resources(&self) -> Option<&FrameResourceSet> {
        self.resources.as_ref()
    }

    pub fn metrics(&self) -> &FrameMetrics {
        &self.metrics
    }

    /// Current resolution epoch; 0 before the first resource set exists
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn capture_extent(&self) -> Extent2D {
        self.capture_extent
    }

    /// Create the sync set, presentation surface and first resource set.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.started {
            return Ok(());
        }
        info!(
            "[Orchestrator] Starting session on {} ({} backend, upscaler: {})",
            self.source.describe(),
            self.device.backend_name(),
            self.upscaler.as_ref().map_or("none", |stage| stage.name())
        );
        self.sync = Some(SyncSet::create(&mut self.device)?);
        self.capture_extent = self.source.reconcile_size()?.current();
        self.started = true;
        self.rebuild("session start")?;
        Ok(())
    }

    /// Run iterations until the session ends. GPU objects are released on
    /// every exit path.
    pub fn run(&mut self) -> Result<SessionEnd, SessionError> {
        let result = self.run_loop();
        let teardown = self.shutdown();
        match (result, teardown) {
            (Ok(end), Ok(())) => {
                info!("[Orchestrator] Session ended: {:?}", end);
                Ok(end)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), teardown) => {
                error!("[Orchestrator] Session aborted: {}", e);
                if let Err(te) = teardown {
                    warn!("[Orchestrator] Teardown after abort failed: {}", te);
                }
                Err(e)
            }
        }
    }

    fn run_loop(&mut self) -> Result<SessionEnd, SessionError> {
        self.start()?;
        loop {
            match self.step()? {
                FrameOutcome::Finished(end) => return Ok(end),
                FrameOutcome::Skipped(
                    SkipReason::CaptureAbsent(_) | SkipReason::NoCaptureExtent,
                ) => std::thread::sleep(IDLE_BACKOFF),
                _ => {}
            }
        }
    }

    /// One loop iteration.
    pub fn step(&mut self) -> Result<FrameOutcome, SessionError> {
        let timer = FrameTimer::start();
        if !self.started {
            self.start()?;
        }

        // Events first; an exit request must not touch the GPU.
        let events = self.window.poll_events()?;
        let summary = EventSummary::from_events(&events);
        if summary.destroyed {
            info!("[Orchestrator] Window destroyed");
            return Ok(FrameOutcome::Finished(SessionEnd::Destroyed));
        }
        if summary.toggled {
            info!("[Orchestrator] Toggle requested");
            return Ok(FrameOutcome::Finished(SessionEnd::Toggled));
        }
        if let Some(extent) = summary.resized {
            debug!("[Orchestrator] Output window reports {}", extent);
            self.rebuild("output window resized")?;
        }

        if let SizeChange::Resized { current, .. } = self.source.reconcile_size()? {
            self.capture_extent = current;
            if let Some(resources) = self.resources.as_mut() {
                resources.release(&mut self.device, ImageRole::CaptureColor)?;
            }
            self.pending_rebuild = true;
        }
        if self.pending_rebuild || self.surface.state() != SurfaceState::Created {
            self.rebuild("resolution changed")?;
        }
        if self.resources.is_none() {
            return Ok(self.skip(SkipReason::NoCaptureExtent));
        }

        // The previous snapshot is gone by now; only this one is alive.
        let snapshot = match self.source.poll()? {
            CapturePoll::Frame(snapshot) => snapshot,
            CapturePoll::Absent(reason) => {
                debug!("[Orchestrator] No frame: {}", reason);
                return Ok(self.skip(SkipReason::CaptureAbsent(reason)));
            }
        };
        let staging = self.staging.as_ref().ok_or(SessionError::NotReady("staging buffer"))?;
        let report = staging.upload(&mut self.device, &snapshot)?;
        if report.partial {
            debug!(
                "[Orchestrator] Partial upload: {} of {}",
                report.copied,
                staging.extent()
            );
        }
        drop(snapshot);

        let sync = self.sync.ok_or(SessionError::NotReady("sync set"))?;
        if self.device.wait_for_fence(sync.in_flight, self.options.fence_timeout)? == FenceWait::Timeout {
            warn!(
                "[Orchestrator] Previous frame still running after {:?}",
                self.options.fence_timeout
            );
            self.metrics.record_stall();
            return Ok(self.skip(SkipReason::FenceTimeout));
        }

        let image_index = match self.surface.acquire(
            &mut self.device,
            sync.image_available,
            self.options.acquire_timeout,
        )? {
            AcquireOutcome::Acquired { index, .. } => index,
            AcquireOutcome::OutOfDate => {
                self.rebuild("surface out of date")?;
                return Ok(self.skip(SkipReason::SurfaceStale));
            }
            AcquireOutcome::Timeout => {
                self.metrics.record_stall();
                return Ok(self.skip(SkipReason::AcquireTimeout));
            }
        };
        self.device.reset_fence(sync.in_flight)?;

        let params = self.dispatch_params()?;
        self.record(image_index, &params)?;
        self.device.record(self.command_buffer, self.recorder.commands())?;
        self.device.submit(&SubmitInfo {
            command_buffer: self.command_buffer,
            wait: sync.image_available,
            signal: sync.render_finished,
            fence: sync.in_flight,
        })?;
        if let Some(binding) = self.binding.as_mut() {
            binding.reset_pending = false;
        }
        self.jitter.advance();

        let outcome = self
            .surface
            .present(&mut self.device, image_index, sync.render_finished)
            .map_err(|e| SessionError::Present(e.to_string()))?;
        if self.surface.state() == SurfaceState::Stale {
            debug!("[Orchestrator] Present reported {:?}; rebuilding next iteration", outcome);
        }

        self.metrics.record_presented(&timer);
        if summary_due(self.metrics.frames_presented(), self.options.stats_interval_frames) {
            self.metrics.log_summary("Running");
        }
        Ok(FrameOutcome::Presented {
            image_index,
            epoch: self.epoch,
        })
    }

    fn skip(&self, reason: SkipReason) -> FrameOutcome {
        let skipped = self.metrics.record_skipped();
        if summary_due(skipped, self.options.stats_interval_frames) {
            warn!(
                "[Orchestrator] {} iterations skipped so far, latest: {:?}",
                skipped, reason
            );
            self.metrics.log_summary("Idle");
        }
        FrameOutcome::Skipped(reason)
    }

    fn dispatch_params(&mut self) -> Result<DispatchParams, SessionError> {
        let render = self
            .resources
            .as_ref()
            .ok_or(SessionError::NotReady("resource set"))?
            .resolution()
            .render;
        let now = Instant::now();
        let delta = self
            .last_frame
            .map_or(0.0, |last| now.duration_since(last).as_secs_f32() * 1000.0);
        self.last_frame = Some(now);

        Ok(DispatchParams {
            jitter: self.jitter.dispatch_offset(),
            motion_vector_scale: [render.width as f32, render.height as f32],
            frame_time_delta_ms: delta,
            reset: self.binding.map_or(false, |b| b.reset_pending),
        })
    }

    fn record(&mut self, image_index: u32, params: &DispatchParams) -> Result<(), SessionError> {
        let Self {
            recorder,
            resources,
            staging,
            surface,
            upscaler,
            binding,
            ..
        } = self;

        recorder.reset();
        let images = resources
            .as_mut()
            .and_then(FrameResourceSet::images_mut)
            .ok_or(SessionError::NotReady("resource set"))?;
        let staging = staging.as_ref().ok_or(SessionError::NotReady("staging buffer"))?;
        let target = surface
            .image_mut(image_index)
            .ok_or(SessionError::NotReady("swapchain image"))?;
        let upscale = match (upscaler.as_mut(), binding.as_ref()) {
            (Some(stage), Some(binding)) => Some((stage, binding.handle)),
            (Some(_), None) => return Err(UpscaleError::NotBound.into()),
            (None, _) => None,
        };

        record_frame(recorder, staging, images, target, upscale, params)?;
        Ok(())
    }

    /// Bring the surface, resource set and upscale binding in line with the
    /// current window and capture sizes. Returns false when nothing changed.
    fn rebuild(&mut self, reason: &str) -> Result<bool, SessionError> {
        self.pending_rebuild = false;
        let window = self.window.extent();
        let surface_current = self.surface.is_current(&mut self.device, window)?;
        let resources_current = match &self.resources {
            Some(set) => {
                surface_current
                    && set.is_complete()
                    && self.surface.extent().map(|display| {
                        ResolutionState::new(self.capture_extent, display)
                    }) == Some(set.resolution())
            }
            None => surface_current && self.capture_extent.is_empty(),
        };
        if resources_current && !self.command_buffer.is_null() {
            debug!("[Orchestrator] Rebuild ({}) is a no-op", reason);
            return Ok(false);
        }

        info!("[Orchestrator] Rebuilding ({})", reason);
        self.device.wait_idle()?;
        self.teardown_epoch()?;

        if !surface_current {
            self.surface.create(&mut self.device, window)?;
            self.metrics.record_surface_rebuild();
        }
        let display = self
            .surface
            .extent()
            .ok_or(SessionError::NotReady("presentation surface"))?;
        self.command_buffer = self.device.allocate_command_buffer()?;

        if self.capture_extent.is_empty() {
            info!("[Orchestrator] Capture source has no size; waiting for it to reappear");
            return Ok(true);
        }

        self.epoch += 1;
        let resolution = ResolutionState::new(self.capture_extent, display);
        self.resources = Some(FrameResourceSet::create(&mut self.device, resolution, self.epoch)?);
        self.staging = Some(StagingBuffer::create(&mut self.device, self.capture_extent)?);
        if let Some(stage) = self.upscaler.as_mut() {
            let handle = stage.create(&mut self.device, resolution.render, resolution.display)?;
            self.binding = Some(UpscaleBinding {
                handle,
                reset_pending: true,
            });
        }
        self.metrics.record_epoch_rebuild();
        info!("[Orchestrator] Epoch {}: {}", self.epoch, resolution);
        Ok(true)
    }

    /// Release everything tied to the current epoch, upscale binding first.
    fn teardown_epoch(&mut self) -> Result<(), SessionError> {
        if let Some(binding) = self.binding.take() {
            if let Some(stage) = self.upscaler.as_mut() {
                stage.destroy(&mut self.device, binding.handle);
            }
        }
        let command_buffer = std::mem::replace(&mut self.command_buffer, CommandBufferHandle::NULL);
        self.device.free_command_buffer(command_buffer);
        if let Some(staging) = self.staging.take() {
            staging.destroy(&mut self.device);
        }
        if let Some(resources) = self.resources.take() {
            resources.destroy(&mut self.device)?;
        }
        Ok(())
    }

    /// Wait for the device, then destroy every GPU object of the session.
    pub fn shutdown(&mut self) -> Result<(), SessionError> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        self.device.wait_idle()?;
        self.teardown_epoch()?;
        self.surface.destroy(&mut self.device)?;
        if let Some(sync) = self.sync.take() {
            sync.destroy(&mut self.device);
        }
        self.metrics.log_summary("Session");
        Ok(())
    }
}

impl<D: GpuDevice, S: CaptureSource, W: OutputWindow> Drop for Orchestrator<D, S, W> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("[Orchestrator] Teardown on drop failed: {}", e);
        }
    }
}

/// Record one frame: upload, resample to render size, placeholder clears,
/// upscale (or passthrough), then copy into the acquired image.
fn record_frame(
    recorder: &mut FrameRecorder,
    staging: &StagingBuffer,
    images: FrameImagesMut<'_>,
    target: &mut SwapchainImage,
    upscale: Option<(&mut Box<dyn UpscaleStage>, UpscaleHandle)>,
    params: &DispatchParams,
) -> Result<(), UpscaleError> {
    let FrameImagesMut {
        capture,
        input,
        motion,
        depth,
        output,
    } = images;

    recorder.transition(&mut *capture, ImageLayout::TransferDst);
    recorder.copy_buffer_to_image(staging.buffer(), &*capture, staging.extent());
    recorder.transition(&mut *capture, ImageLayout::TransferSrc);

    recorder.transition(&mut *input, ImageLayout::TransferDst);
    recorder.blit(&*capture, &*input, Filter::Nearest);
    recorder.transition(&mut *input, ImageLayout::ShaderReadOnly);

    // 2-D content has no depth or motion; zero them once per epoch.
    for placeholder in [&mut *motion, &mut *depth] {
        if placeholder.layout == ImageLayout::Undefined {
            recorder.transition(&mut *placeholder, ImageLayout::TransferDst);
            recorder.clear(&*placeholder, [0.0; 4]);
            recorder.transition(&mut *placeholder, ImageLayout::ShaderReadOnly);
        }
    }

    recorder.discard(&mut *output, ImageLayout::General);
    match upscale {
        Some((stage, handle)) => stage.dispatch(
            handle,
            recorder,
            UpscaleImages {
                input_color: input,
                depth,
                motion_vectors: motion,
                output_color: &mut *output,
            },
            params,
        )?,
        None => passthrough(recorder, input, &*output),
    }

    recorder.discard(&mut *target, ImageLayout::TransferDst);
    recorder.copy_or_blit(&*output, &*target, Filter::Linear);
    recorder.transition(&mut *target, ImageLayout::PresentSrc);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CaptureError, PlatformError};
    use crate::frame::CaptureSnapshot;
    use crate::gpu::soft::SoftDevice;
    use crate::platform::WindowEvent;
    use crate::upscale::IdentityUpscaler;
    use std::collections::VecDeque;

    struct FixedSource {
        extent: Extent2D,
        tracker: crate::capture::SizeTracker,
        sequence: u64,
    }

    impl CaptureSource for FixedSource {
        fn describe(&self) -> String {
            "fixed".into()
        }

        fn reconcile_size(&mut self) -> Result<SizeChange, CaptureError> {
            Ok(self.tracker.observe(self.extent))
        }

        fn poll(&mut self) -> Result<CapturePoll, CaptureError> {
            self.sequence += 1;
            let data = vec![0x40; self.extent.pixel_count() as usize * 4];
            Ok(CapturePoll::Frame(CaptureSnapshot::packed(
                data,
                self.extent,
                self.sequence,
            )))
        }
    }

    struct QueueWindow {
        extent: Extent2D,
        events: VecDeque<WindowEvent>,
    }

    impl OutputWindow for QueueWindow {
        fn extent(&self) -> Extent2D {
            self.extent
        }

        fn poll_events(&mut self) -> Result<Vec<WindowEvent>, PlatformError> {
            Ok(self.events.drain(..).collect())
        }
    }

    fn orchestrator(
        upscaler: Option<Box<dyn UpscaleStage>>,
    ) -> Orchestrator<SoftDevice, FixedSource, QueueWindow> {
        let extent = Extent2D::new(16, 12);
        Orchestrator::new(
            SoftDevice::new(extent),
            FixedSource {
                extent,
                tracker: Default::default(),
                sequence: 0,
            },
            QueueWindow {
                extent,
                events: VecDeque::new(),
            },
            upscaler,
            OrchestratorOptions::default(),
        )
    }

    #[test]
    fn long_skip_stretch_is_counted_and_summarized() {
        let mut orch = orchestrator(None);
        orch.options.stats_interval_frames = 2;
        orch.source.extent = Extent2D::default();
        for _ in 0..5 {
            assert_eq!(
                orch.step().unwrap(),
                FrameOutcome::Skipped(SkipReason::NoCaptureExtent)
            );
        }
        assert_eq!(orch.metrics().frames_skipped(), 5);
        assert_eq!(orch.metrics().frames_presented(), 0);
        assert_eq!(orch.device().submit_count(), 0);

        orch.source.extent = Extent2D::new(16, 12);
        assert!(matches!(orch.step().unwrap(), FrameOutcome::Presented { .. }));
        assert_eq!(orch.metrics().frames_skipped(), 5);
    }

    #[test]
    fn presents_with_and_without_upscaler() {
        for upscaler in [None, Some(Box::new(IdentityUpscaler::new()) as Box<dyn UpscaleStage>)] {
            let mut orch = orchestrator(upscaler);
            for _ in 0..3 {
                let outcome = orch.step().unwrap();
                assert!(matches!(outcome, FrameOutcome::Presented { epoch: 1, .. }));
            }
            assert_eq!(orch.device().present_count(), 3);
            assert_eq!(orch.device().last_presented().unwrap().pixel(0, 0), [0x40; 4]);
        }
    }

    #[test]
    fn exit_requests_stop_before_gpu_work() {
        let mut orch = orchestrator(None);
        orch.start().unwrap();
        let submits = orch.device().submit_count();
        orch.window_mut().events.push_back(WindowEvent::Toggle);
        assert_eq!(
            orch.step().unwrap(),
            FrameOutcome::Finished(SessionEnd::Toggled)
        );
        assert_eq!(orch.device().submit_count(), submits);

        orch.window_mut().events.push_back(WindowEvent::Toggle);
        orch.window_mut().events.push_back(WindowEvent::Destroyed);
        assert_eq!(
            orch.step().unwrap(),
            FrameOutcome::Finished(SessionEnd::Destroyed)
        );
    }

    #[test]
    fn fence_timeout_is_a_recoverable_stall() {
        let mut orch = orchestrator(None);
        orch.step().unwrap();
        orch.device_mut().force_fence_timeouts(1);
        assert_eq!(
            orch.step().unwrap(),
            FrameOutcome::Skipped(SkipReason::FenceTimeout)
        );
        assert!(matches!(orch.step().unwrap(), FrameOutcome::Presented { .. }));
        assert_eq!(orch.metrics().gpu_stalls(), 1);
    }

    #[test]
    fn out_of_date_acquire_rebuilds_and_skips() {
        let mut orch = orchestrator(None);
        orch.step().unwrap();
        let generation = orch.surface().generation();
        orch.device_mut().force_out_of_date_acquires(1);

        assert_eq!(
            orch.step().unwrap(),
            FrameOutcome::Skipped(SkipReason::SurfaceStale)
        );
        assert_eq!(orch.surface().generation(), generation + 1);
        // Fence was never reset, so the next frame does not hang on it.
        assert!(matches!(orch.step().unwrap(), FrameOutcome::Presented { .. }));
        assert!(orch.device().violations().is_empty());
    }

    #[test]
    fn out_of_date_present_rebuilds_next_iteration() {
        let mut orch = orchestrator(None);
        orch.step().unwrap();
        orch.device_mut().force_out_of_date_presents(1);
        assert!(matches!(orch.step().unwrap(), FrameOutcome::Presented { .. }));
        assert_eq!(orch.surface().state(), SurfaceState::Stale);

        assert!(matches!(orch.step().unwrap(), FrameOutcome::Presented { .. }));
        assert_eq!(orch.surface().state(), SurfaceState::Created);
        assert_eq!(orch.metrics().surface_rebuilds(), 2);
    }

    #[test]
    fn shutdown_releases_everything() {
        let mut orch = orchestrator(Some(Box::new(IdentityUpscaler::new())));
        orch.step().unwrap();
        orch.step().unwrap();
        orch.shutdown().unwrap();

        let device = orch.device();
        assert_eq!(device.live_image_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_memory_count(), 0);
        assert_eq!(device.live_swapchain_count(), 0);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }
}
