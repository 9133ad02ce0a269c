//! End-to-end frame pipeline scenarios on the software GPU backend.
//!
//! A scripted capture source and output window drive the orchestrator the
//! way the X11 adapters do, without an X server or a GPU.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use glasspane::capture::{AbsentReason, SizeChange, SizeTracker};
use glasspane::error::{CaptureError, PlatformError, UpscaleError};
use glasspane::gpu::soft::SoftDevice;
use glasspane::gpu::{GpuDevice, SurfaceCapabilities};
use glasspane::surface::SurfaceState;
use glasspane::orchestrator::SkipReason;
use glasspane::recorder::FrameRecorder;
use glasspane::resources::{ImageRole, ResolutionState};
use glasspane::upscale::{DispatchParams, UpscaleHandle, UpscaleImages};
use glasspane::{
    CapturePoll, CaptureSnapshot, CaptureSource, Extent2D, FrameOutcome, IdentityUpscaler,
    Orchestrator, OrchestratorOptions, OutputWindow, UpscaleStage, WindowEvent,
};

/// Pixel (x, y) is `[x, y, 0x80, 0xff]` (low bytes of the coordinates).
struct PatternSource {
    extent: Extent2D,
    /// Deliver snapshots of this size regardless of the reported size
    deliver: Option<Extent2D>,
    /// Report this instead of a frame while set
    absent: Option<AbsentReason>,
    tracker: SizeTracker,
    sequence: u64,
}

impl PatternSource {
    fn new(extent: Extent2D) -> Self {
        Self {
            extent,
            deliver: None,
            absent: None,
            tracker: SizeTracker::new(),
            sequence: 0,
        }
    }
}

impl CaptureSource for PatternSource {
    fn describe(&self) -> String {
        format!("pattern {}", self.extent)
    }

    fn reconcile_size(&mut self) -> Result<SizeChange, CaptureError> {
        Ok(self.tracker.observe(self.extent))
    }

    fn poll(&mut self) -> Result<CapturePoll, CaptureError> {
        if self.extent.is_empty() {
            return Ok(CapturePoll::Absent(AbsentReason::EmptyExtent));
        }
        if let Some(reason) = self.absent {
            return Ok(CapturePoll::Absent(reason));
        }
        let extent = self.deliver.unwrap_or(self.extent);
        let mut data = Vec::with_capacity(extent.pixel_count() as usize * 4);
        for y in 0..extent.height {
            for x in 0..extent.width {
                data.extend_from_slice(&[x as u8, y as u8, 0x80, 0xff]);
            }
        }
        self.sequence += 1;
        Ok(CapturePoll::Frame(CaptureSnapshot::packed(
            data,
            extent,
            self.sequence,
        )))
    }
}

struct ScriptedWindow {
    extent: Extent2D,
    events: VecDeque<WindowEvent>,
}

impl OutputWindow for ScriptedWindow {
    fn extent(&self) -> Extent2D {
        self.extent
    }

    fn poll_events(&mut self) -> Result<Vec<WindowEvent>, PlatformError> {
        Ok(self.events.drain(..).collect())
    }
}

/// Identity stage that remembers every parameter block it was handed.
struct RecordingStage {
    inner: IdentityUpscaler,
    log: Rc<RefCell<Vec<DispatchParams>>>,
}

impl UpscaleStage for RecordingStage {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn create(
        &mut self,
        device: &mut dyn GpuDevice,
        render: Extent2D,
        display: Extent2D,
    ) -> Result<UpscaleHandle, UpscaleError> {
        self.inner.create(device, render, display)
    }

    fn dispatch(
        &mut self,
        handle: UpscaleHandle,
        recorder: &mut FrameRecorder,
        images: UpscaleImages<'_>,
        params: &DispatchParams,
    ) -> Result<(), UpscaleError> {
        self.log.borrow_mut().push(*params);
        self.inner.dispatch(handle, recorder, images, params)
    }

    fn destroy(&mut self, device: &mut dyn GpuDevice, handle: UpscaleHandle) {
        self.inner.destroy(device, handle)
    }
}

type Session = Orchestrator<SoftDevice, PatternSource, ScriptedWindow>;

fn options() -> OrchestratorOptions {
    OrchestratorOptions {
        stats_interval_frames: 0,
        ..OrchestratorOptions::default()
    }
}

fn session_on(
    device: SoftDevice,
    capture: Extent2D,
    window: Extent2D,
    upscaler: Option<Box<dyn UpscaleStage>>,
) -> Session {
    Orchestrator::new(
        device,
        PatternSource::new(capture),
        ScriptedWindow {
            extent: window,
            events: VecDeque::new(),
        },
        upscaler,
        options(),
    )
}

fn session(capture: Extent2D, window: Extent2D, upscaler: Option<Box<dyn UpscaleStage>>) -> Session {
    session_on(SoftDevice::new(window), capture, window, upscaler)
}

fn identity() -> Option<Box<dyn UpscaleStage>> {
    Some(Box::new(IdentityUpscaler::new()))
}

fn resize_window(session: &mut Session, extent: Extent2D) {
    session.device_mut().set_window_extent(extent);
    let window = session.window_mut();
    window.extent = extent;
    window.events.push_back(WindowEvent::Resized(extent));
}

fn present(session: &mut Session) -> u64 {
    match session.step().unwrap() {
        FrameOutcome::Presented { epoch, .. } => epoch,
        other => panic!("expected a presented frame, got {:?}", other),
    }
}

/// Every tracked layout matches what the device really holds.
fn assert_layouts_in_sync(session: &Session) {
    let device = session.device();
    for image in session.resources().unwrap().iter() {
        assert_eq!(
            device.layout_of(image.handle),
            Some(image.layout),
            "{:?} out of sync",
            image.role
        );
    }
    for image in session.surface().images() {
        assert_eq!(device.layout_of(image.handle), Some(image.layout));
    }
}

#[test]
fn identity_upscale_reproduces_captured_pixels() {
    let extent = Extent2D::new(800, 600);
    let mut session = session(extent, extent, identity());

    assert_eq!(present(&mut session), 1);

    let frame = session.device().last_presented().unwrap();
    assert_eq!(frame.extent, extent);
    assert_eq!(frame.pixel(0, 0), [0, 0, 0x80, 0xff]);
    assert_eq!(frame.pixel(10, 20), [10, 20, 0x80, 0xff]);
    assert_eq!(frame.pixel(799, 599), [799u32 as u8, 599u32 as u8, 0x80, 0xff]);
}

#[test]
fn capture_and_window_resize_rebuild_everything() {
    let small = Extent2D::new(800, 600);
    let large = Extent2D::new(1920, 1080);
    let mut session = session(small, small, identity());
    for _ in 0..3 {
        assert_eq!(present(&mut session), 1);
    }
    let generation = session.surface().generation();

    session.source_mut().extent = large;
    resize_window(&mut session, large);
    let epoch = present(&mut session);

    assert!(epoch > 1);
    assert_eq!(epoch, session.epoch());
    assert!(session.surface().generation() > generation);
    assert_eq!(session.surface().extent(), Some(large));
    assert_eq!(
        session.resources().unwrap().resolution(),
        ResolutionState::new(large, large)
    );

    let frame = session.device().last_presented().unwrap();
    assert_eq!(frame.swapchain, session.surface().handle());
    assert_eq!(frame.extent, large);
    assert_eq!(frame.pixel(1000, 700), [1000u32 as u8, 700u32 as u8, 0x80, 0xff]);

    assert_eq!(session.device().live_swapchain_count(), 1);
    assert_eq!(session.device().live_image_count(), ImageRole::ALL.len());
    assert!(session.device().violations().is_empty());
}

#[test]
fn zero_size_capture_skips_then_resumes() {
    let extent = Extent2D::new(320, 240);
    let mut session = session(extent, extent, identity());
    assert_eq!(present(&mut session), 1);
    let presented = session.device().present_count();

    session.source_mut().extent = Extent2D::default();
    for _ in 0..3 {
        assert_eq!(
            session.step().unwrap(),
            FrameOutcome::Skipped(SkipReason::NoCaptureExtent)
        );
    }
    assert!(session.resources().is_none());
    assert_eq!(session.device().present_count(), presented);
    assert_eq!(session.device().live_image_count(), 0);

    session.source_mut().extent = Extent2D::new(200, 100);
    let epoch = present(&mut session);
    assert_eq!(epoch, 2);
    assert_eq!(
        session.resources().unwrap().resolution().capture,
        Extent2D::new(200, 100)
    );
    assert!(session.device().violations().is_empty());
}

#[test]
fn absent_capture_skips_without_touching_the_gpu() {
    let extent = Extent2D::new(320, 240);
    let mut session = session(extent, extent, identity());
    assert_eq!(present(&mut session), 1);
    let submits = session.device().submit_count();
    let presented = session.device().present_count();

    let reason = AbsentReason::UnsupportedDepth { bits_per_pixel: 24 };
    session.source_mut().absent = Some(reason);
    for _ in 0..3 {
        assert_eq!(
            session.step().unwrap(),
            FrameOutcome::Skipped(SkipReason::CaptureAbsent(reason))
        );
    }
    assert_eq!(session.device().submit_count(), submits);
    assert_eq!(session.device().present_count(), presented);
    assert_eq!(session.metrics().frames_skipped(), 3);
    assert!(session.resources().is_some());

    session.source_mut().absent = None;
    for _ in 0..3 {
        assert_eq!(present(&mut session), 1);
        assert_layouts_in_sync(&session);
    }
    assert_eq!(session.device().present_count(), presented + 3);
    assert!(session.device().violations().is_empty());
}

#[test]
fn suboptimal_acquire_presents_then_rebuilds() {
    let extent = Extent2D::new(320, 240);
    let mut session = session(extent, extent, identity());
    present(&mut session);
    let generation = session.surface().generation();
    let rebuilds = session.metrics().surface_rebuilds();

    session.device_mut().force_suboptimal_acquires(1);
    present(&mut session);
    assert_eq!(session.device().present_count(), 2);
    assert_eq!(session.surface().state(), SurfaceState::Stale);
    assert_eq!(session.surface().generation(), generation);

    present(&mut session);
    assert_eq!(session.surface().state(), SurfaceState::Created);
    assert!(session.surface().generation() > generation);
    assert_eq!(session.metrics().surface_rebuilds(), rebuilds + 1);
    assert_eq!(session.device().present_count(), 3);
    assert_eq!(session.device().live_swapchain_count(), 1);
    assert_layouts_in_sync(&session);
    assert!(session.device().violations().is_empty());
}

#[test]
fn tracked_layouts_hold_across_many_frames() {
    let capture = Extent2D::new(64, 48);
    let window = Extent2D::new(128, 96);
    for upscaler in [None, identity()] {
        let mut session = session(capture, window, upscaler);
        for _ in 0..6 {
            present(&mut session);
            assert_layouts_in_sync(&session);
        }
        assert_eq!(session.device().present_count(), 6);
        assert!(session.device().violations().is_empty());
    }
}

#[test]
fn unchanged_resize_is_a_no_op() {
    let extent = Extent2D::new(640, 480);
    let mut session = session(extent, extent, identity());
    present(&mut session);
    present(&mut session);
    let generation = session.surface().generation();
    let swapchain = session.surface().handle();
    let rebuilds = session.metrics().epoch_rebuilds();

    for _ in 0..3 {
        session
            .window_mut()
            .events
            .push_back(WindowEvent::Resized(extent));
    }
    assert_eq!(present(&mut session), 1);

    assert_eq!(session.surface().generation(), generation);
    assert_eq!(session.surface().handle(), swapchain);
    assert_eq!(session.metrics().epoch_rebuilds(), rebuilds);
    assert_eq!(session.device().live_image_count(), ImageRole::ALL.len());
    assert_eq!(session.device().live_swapchain_count(), 1);
}

#[test]
fn swapchain_extent_is_the_clamped_request() {
    let window = Extent2D::new(4000, 10);
    let mut support = SoftDevice::default_support(window);
    support.capabilities = SurfaceCapabilities {
        current_extent: None,
        min_extent: Extent2D::new(64, 64),
        max_extent: Extent2D::new(1024, 1024),
        ..support.capabilities
    };
    let device = SoftDevice::with_support(window, support);
    let mut session = session_on(device, Extent2D::new(32, 32), window, identity());

    present(&mut session);

    let clamped = Extent2D::new(1024, 64);
    assert_eq!(session.surface().extent(), Some(clamped));
    assert_eq!(session.resources().unwrap().resolution().display, clamped);
    assert_eq!(session.device().last_presented().unwrap().extent, clamped);
}

#[test]
fn mismatched_snapshots_never_overrun_staging() {
    let extent = Extent2D::new(64, 48);
    let mut session = session(extent, extent, None);

    // Source shrank between size check and capture.
    session.source_mut().deliver = Some(Extent2D::new(40, 30));
    present(&mut session);
    let frame = session.device().last_presented().unwrap();
    assert_eq!(frame.pixel(39, 29), [39, 29, 0x80, 0xff]);

    // Source grew: the excess is clipped.
    session.source_mut().deliver = Some(Extent2D::new(100, 90));
    present(&mut session);
    let frame = session.device().last_presented().unwrap();
    assert_eq!(frame.extent, extent);
    assert_eq!(frame.pixel(63, 47), [63, 47, 0x80, 0xff]);

    assert!(session.device().violations().is_empty());
}

#[test]
fn reset_is_requested_once_per_binding() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let stage = RecordingStage {
        inner: IdentityUpscaler::new(),
        log: Rc::clone(&log),
    };
    let capture = Extent2D::new(96, 64);
    let window = Extent2D::new(192, 128);
    let mut session = session(capture, window, Some(Box::new(stage)));

    for _ in 0..3 {
        present(&mut session);
    }
    session.source_mut().extent = Extent2D::new(48, 32);
    present(&mut session);
    present(&mut session);

    let log = log.borrow();
    let resets: Vec<bool> = log.iter().map(|p| p.reset).collect();
    assert_eq!(resets, vec![true, false, false, true, false]);

    assert_eq!(log[0].motion_vector_scale, [96.0, 64.0]);
    assert_eq!(log[3].motion_vector_scale, [48.0, 32.0]);
    assert_eq!(log[0].frame_time_delta_ms, 0.0);

    // Jitter alternates by frame parity and reaches the stage negated.
    assert_eq!(log[0].jitter, [-0.25, -0.25]);
    assert_eq!(log[1].jitter, [0.25, 0.25]);
    assert_eq!(log[2].jitter, [-0.25, -0.25]);
}
