//! X11 Composite capture
//!
//! Redirects the target window off-screen (automatic mode, so the compositor
//! keeps drawing it) and reads its named backing pixmap with `GetImage`.

use std::sync::Arc;

use tracing::{debug, info, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::{ConnectionError, ReplyError, ReplyOrIdError};
use x11rb::protocol::composite::{self, ConnectionExt as _, Redirect};
use x11rb::protocol::xproto::{
    AtomEnum, ConnectionExt as _, ImageFormat, MapState, Pixmap, Window,
};
use x11rb::protocol::ErrorKind;
use x11rb::xcb_ffi::XCBConnection;

use super::{AbsentReason, CapturePoll, CaptureSource, SizeChange, SizeTracker};
use crate::error::CaptureError;
use crate::frame::{CaptureSnapshot, Extent2D};

impl From<ConnectionError> for CaptureError {
    fn from(e: ConnectionError) -> Self {
        CaptureError::Connection(e.to_string())
    }
}

impl From<ReplyError> for CaptureError {
    fn from(e: ReplyError) -> Self {
        match e {
            ReplyError::ConnectionError(e) => e.into(),
            ReplyError::X11Error(e) => CaptureError::Protocol {
                request: "x11",
                detail: format!("{:?}", e.error_kind),
            },
        }
    }
}

impl From<ReplyOrIdError> for CaptureError {
    fn from(e: ReplyOrIdError) -> Self {
        match e {
            ReplyOrIdError::IdsExhausted => CaptureError::Connection("XID range exhausted".into()),
            ReplyOrIdError::ConnectionError(e) => e.into(),
            ReplyOrIdError::X11Error(e) => CaptureError::Protocol {
                request: "x11",
                detail: format!("{:?}", e.error_kind),
            },
        }
    }
}

/// Focused top-level window: input focus, else `_NET_ACTIVE_WINDOW`,
/// climbed to the child of the root.
pub fn focused_top_level(conn: &XCBConnection, root: Window) -> Result<Option<Window>, CaptureError> {
    let mut focus = conn.get_input_focus()?.reply()?.focus;

    // 0 is None, 1 is PointerRoot
    if focus <= 1 || focus == root {
        let atom = conn.intern_atom(false, b"_NET_ACTIVE_WINDOW")?.reply()?.atom;
        let reply = conn
            .get_property(false, root, atom, AtomEnum::WINDOW, 0, 1)?
            .reply()?;
        focus = reply
            .value32()
            .and_then(|mut values| values.next())
            .unwrap_or(0);
        debug!("[Capture] Input focus unusable, _NET_ACTIVE_WINDOW = {:#x}", focus);
    }
    if focus <= 1 || focus == root {
        return Ok(None);
    }

    let mut window = focus;
    loop {
        let tree = conn.query_tree(window)?.reply()?;
        if tree.parent == tree.root || tree.parent == x11rb::NONE {
            break;
        }
        window = tree.parent;
    }
    Ok(Some(window))
}

/// Errors the server sends for a window (or its pixmap) destroyed under us.
fn is_vanished(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Window | ErrorKind::Drawable)
}

fn unless_vanished<T>(reply: Result<T, ReplyError>, window: Window) -> Result<Option<T>, CaptureError> {
    match reply {
        Ok(value) => Ok(Some(value)),
        Err(ReplyError::X11Error(e)) if is_vanished(e.error_kind) => {
            debug!("[Capture] Window {:#x} vanished: {:?}", window, e.error_kind);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub struct X11WindowSource {
    conn: Arc<XCBConnection>,
    window: Window,
    pixmap: Option<Pixmap>,
    tracker: SizeTracker,
    sequence: u64,
}

impl X11WindowSource {
    /// Redirect `window` and prepare to read it.
    pub fn new(conn: Arc<XCBConnection>, window: Window) -> Result<Self, CaptureError> {
        if conn
            .extension_information(composite::X11_EXTENSION_NAME)?
            .is_none()
        {
            return Err(CaptureError::Unsupported(
                "X server lacks the Composite extension".into(),
            ));
        }
        let version = conn.composite_query_version(0, 4)?.reply()?;
        debug!(
            "[Capture] Composite {}.{}",
            version.major_version, version.minor_version
        );

        conn.composite_redirect_window(window, Redirect::AUTOMATIC)?
            .check()?;
        info!("[Capture] Redirected window {:#x}", window);

        Ok(Self {
            conn,
            window,
            pixmap: None,
            tracker: SizeTracker::new(),
            sequence: 0,
        })
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Live size, or zero when the window is not viewable or already gone.
    /// A destroyed window still has its DestroyNotify queued, which ends the
    /// session on the next iteration.
    fn live_extent(&self) -> Result<Extent2D, CaptureError> {
        let reply = self.conn.get_window_attributes(self.window)?.reply();
        let Some(attrs) = unless_vanished(reply, self.window)? else {
            return Ok(Extent2D::default());
        };
        if attrs.map_state != MapState::VIEWABLE {
            return Ok(Extent2D::default());
        }
        let reply = self.conn.get_geometry(self.window)?.reply();
        let Some(geometry) = unless_vanished(reply, self.window)? else {
            return Ok(Extent2D::default());
        };
        Ok(Extent2D::new(geometry.width as u32, geometry.height as u32))
    }

    fn release_pixmap(&mut self) {
        if let Some(pixmap) = self.pixmap.take() {
            if let Err(e) = self.conn.free_pixmap(pixmap) {
                warn!("[Capture] FreePixmap failed: {}", e);
            }
        }
    }

    /// Name a fresh pixmap for the window's current backing storage. The
    /// compositor allocates new storage on every resize.
    fn rename_pixmap(&mut self) -> Result<(), CaptureError> {
        self.release_pixmap();
        let pixmap = self.conn.generate_id()?;
        match self
            .conn
            .composite_name_window_pixmap(self.window, pixmap)?
            .check()
        {
            Ok(()) => {
                self.pixmap = Some(pixmap);
                Ok(())
            }
            // Unmapped windows have no storage to name.
            Err(ReplyError::X11Error(e)) => {
                debug!("[Capture] NameWindowPixmap refused: {:?}", e.error_kind);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn bits_per_pixel(&self, depth: u8) -> u8 {
        self.conn
            .setup()
            .pixmap_formats
            .iter()
            .find(|format| format.depth == depth)
            .map_or(0, |format| format.bits_per_pixel)
    }
}

impl CaptureSource for X11WindowSource {
    fn describe(&self) -> String {
        format!("X11 window {:#x}", self.window)
    }

    fn reconcile_size(&mut self) -> Result<SizeChange, CaptureError> {
        let extent = self.live_extent()?;
        let change = self.tracker.observe(extent);
        if let SizeChange::Resized { current, .. } = change {
            if current.is_empty() {
                self.release_pixmap();
            } else {
                self.rename_pixmap()?;
            }
        }
        Ok(change)
    }

    fn poll(&mut self) -> Result<CapturePoll, CaptureError> {
        let extent = self.tracker.last().unwrap_or_default();
        if extent.is_empty() {
            return Ok(CapturePoll::Absent(AbsentReason::EmptyExtent));
        }
        if self.pixmap.is_none() {
            self.rename_pixmap()?;
        }
        let Some(pixmap) = self.pixmap else {
            return Ok(CapturePoll::Absent(AbsentReason::Unavailable));
        };

        // Round trip so every request the server queued has landed.
        self.conn.get_input_focus()?.reply()?;

        let reply = self
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                pixmap,
                0,
                0,
                extent.width as u16,
                extent.height as u16,
                !0,
            )?
            .reply();
        let image = match reply {
            Ok(image) => image,
            Err(ReplyError::X11Error(e)) => {
                debug!("[Capture] GetImage refused: {:?}", e.error_kind);
                self.release_pixmap();
                return Ok(CapturePoll::Absent(AbsentReason::Unavailable));
            }
            Err(e) => return Err(e.into()),
        };

        let bits_per_pixel = self.bits_per_pixel(image.depth);
        if bits_per_pixel != 32 {
            warn!(
                "[Capture] Window depth {} uses {} bpp; only 32 bpp is supported",
                image.depth, bits_per_pixel
            );
            return Ok(CapturePoll::Absent(AbsentReason::UnsupportedDepth { bits_per_pixel }));
        }

        let stride = image.data.len() / extent.height as usize;
        self.sequence += 1;
        Ok(CapturePoll::Frame(CaptureSnapshot::new(
            image.data,
            extent,
            stride,
            self.sequence,
        )))
    }
}

impl Drop for X11WindowSource {
    fn drop(&mut self) {
        self.release_pixmap();
        let _ = self
            .conn
            .composite_unredirect_window(self.window, Redirect::AUTOMATIC);
        let _ = self.conn.flush();
        debug!("[Capture] Released window {:#x}", self.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroyed_window_errors_count_as_vanished() {
        assert!(is_vanished(ErrorKind::Window));
        assert!(is_vanished(ErrorKind::Drawable));
        assert!(!is_vanished(ErrorKind::Match));
        assert!(!is_vanished(ErrorKind::Access));
        assert!(!is_vanished(ErrorKind::Alloc));
    }

    #[test]
    fn vanished_replies_become_absent_not_errors() {
        let ok: Result<u32, ReplyError> = Ok(7);
        assert_eq!(unless_vanished(ok, 0x40_0001).unwrap(), Some(7));

        let lost: Result<u32, ReplyError> =
            Err(ReplyError::ConnectionError(ConnectionError::UnknownError));
        assert!(matches!(
            unless_vanished(lost, 0x40_0001),
            Err(CaptureError::Connection(_))
        ));
    }
}
