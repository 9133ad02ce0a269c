/*!
 * Glasspane Library
 *
 * Mirrors one compositor-redirected window into a full-screen overlay,
 * optionally through an upscale stage. The frame pipeline is generic over
 * the GPU backend, the capture source and the output window.
 */

pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod metrics;
pub mod orchestrator;
pub mod platform;
pub mod recorder;
pub mod resources;
pub mod staging;
pub mod surface;
pub mod upscale;

// Re-export commonly used types
pub use capture::{CapturePoll, CaptureSource};
pub use config::{OverlayConfig, UpscalerKind};
pub use error::{CaptureError, GpuError, SessionError, UpscaleError};
pub use frame::{CaptureSnapshot, Extent2D};
pub use gpu::GpuDevice;
pub use orchestrator::{FrameOutcome, Orchestrator, OrchestratorOptions, SessionEnd};
pub use platform::{OutputWindow, WindowEvent};
pub use upscale::{IdentityUpscaler, UpscaleStage};
