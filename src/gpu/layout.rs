//! Image layouts as tracked by the application.
//!
//! The tracked layout is authoritative application-side state; nothing ever
//! asks the device what layout an image is in.

use std::fmt;

/// Device-visible access mode of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents undefined. Valid as the prior layout of any transition.
    Undefined,
    TransferDst,
    TransferSrc,
    ShaderReadOnly,
    /// Read/write from shaders and transfers alike
    General,
    PresentSrc,
}

impl ImageLayout {
    /// Layouts a transfer command may read from
    pub fn is_transfer_readable(self) -> bool {
        matches!(self, ImageLayout::TransferSrc | ImageLayout::General)
    }

    /// Layouts a transfer command may write into
    pub fn is_transfer_writable(self) -> bool {
        matches!(self, ImageLayout::TransferDst | ImageLayout::General)
    }

    /// Whether a barrier assuming `self` as its prior layout is valid for an
    /// image that really is in `actual`.
    pub fn may_precede(self, actual: ImageLayout) -> bool {
        self == ImageLayout::Undefined || self == actual
    }
}

impl fmt::Display for ImageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageLayout::Undefined => "UNDEFINED",
            ImageLayout::TransferDst => "TRANSFER_DST",
            ImageLayout::TransferSrc => "TRANSFER_SRC",
            ImageLayout::ShaderReadOnly => "SHADER_READ_ONLY",
            ImageLayout::General => "GENERAL",
            ImageLayout::PresentSrc => "PRESENT_SRC",
        };
        f.write_str(name)
    }
}
