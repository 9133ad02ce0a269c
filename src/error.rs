//! Error types shared across the frame pipeline.
//!
//! Recoverable conditions (absent capture, stale surface, timeouts) are not
//! errors; they travel as ordinary enum outcomes. Everything here ends the
//! current session.

use thiserror::Error;

use crate::frame::Extent2D;
use crate::gpu::{ImageHandle, ImageLayout};

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("{call} failed: {code}")]
    Backend { call: &'static str, code: String },

    #[error("no memory type matches filter {type_bits:#x} with the requested properties")]
    NoSuitableMemoryType { type_bits: u32 },

    #[error("missing capability: {0}")]
    Unsupported(String),

    #[error("device lost")]
    DeviceLost,

    #[error("unknown {kind} handle {raw:#x}")]
    UnknownHandle { kind: &'static str, raw: u64 },

    #[error("image {image:?} assumed {assumed:?} but device holds it in {actual:?}")]
    LayoutMismatch {
        image: ImageHandle,
        assumed: ImageLayout,
        actual: ImageLayout,
    },

    #[error("copy region {region} exceeds {what} extent {limit}")]
    OutOfBounds {
        what: &'static str,
        region: Extent2D,
        limit: Extent2D,
    },
}

impl GpuError {
    pub fn backend(call: &'static str, code: impl std::fmt::Debug) -> Self {
        GpuError::Backend {
            call,
            code: format!("{:?}", code),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("lost connection to the display server: {0}")]
    Connection(String),

    #[error("display server rejected {request}: {detail}")]
    Protocol { request: &'static str, detail: String },

    #[error("{0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("upscale stage '{stage}' could not be created for {render} -> {display}: {reason}")]
    Create {
        stage: &'static str,
        render: Extent2D,
        display: Extent2D,
        reason: String,
    },

    #[error("upscale dispatch failed: {0}")]
    Dispatch(String),

    #[error("upscale stage dispatched without a live binding")]
    NotBound,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("output window error: {0}")]
    Window(String),

    #[error("event queue error: {0}")]
    Events(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why a session stopped abnormally. Returned to `main`, which decides
/// whether the process exits.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Upscale(#[from] UpscaleError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("present failed: {0}")]
    Present(String),

    #[error("{0} used before it was built")]
    NotReady(&'static str),
}

pub type GpuResult<T> = Result<T, GpuError>;
