//! X11 output window
//!
//! An override-redirect window the window manager never touches, made
//! click-through with an empty XFixes input region so pointer input falls
//! through to the captured window underneath.

use std::sync::Arc;

use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::errors::{ConnectionError, ReplyError, ReplyOrIdError};
use x11rb::protocol::shape::SK;
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::{
    ChangeWindowAttributesAux, ConnectionExt as _, CreateWindowAux, EventMask, GrabMode,
    InputFocus, Keycode, ModMask, Window, WindowClass,
};
use x11rb::protocol::Event;
use x11rb::xcb_ffi::XCBConnection;
use x11rb::COPY_DEPTH_FROM_PARENT;

use super::{OutputWindow, WindowEvent};
use crate::error::PlatformError;
use crate::frame::Extent2D;

impl From<ConnectionError> for PlatformError {
    fn from(e: ConnectionError) -> Self {
        PlatformError::Events(e.to_string())
    }
}

impl From<ReplyError> for PlatformError {
    fn from(e: ReplyError) -> Self {
        PlatformError::Window(e.to_string())
    }
}

impl From<ReplyOrIdError> for PlatformError {
    fn from(e: ReplyOrIdError) -> Self {
        PlatformError::Window(e.to_string())
    }
}

/// A key grabbed on the root window for the lifetime of the process.
pub struct ToggleKey {
    conn: Arc<XCBConnection>,
    root: Window,
    keycodes: Vec<Keycode>,
}

impl ToggleKey {
    /// Grab every keycode that produces `keysym`, under any modifiers.
    pub fn grab(conn: Arc<XCBConnection>, root: Window, keysym: u32) -> Result<Self, PlatformError> {
        let setup = conn.setup();
        let (min, max) = (setup.min_keycode, setup.max_keycode);
        let mapping = conn
            .get_keyboard_mapping(min, max - min + 1)?
            .reply()?;
        let per_keycode = mapping.keysyms_per_keycode.max(1) as usize;
        let keycodes: Vec<Keycode> = mapping
            .keysyms
            .chunks(per_keycode)
            .enumerate()
            .filter(|(_, syms)| syms.contains(&keysym))
            .map(|(i, _)| min + i as u8)
            .collect();
        if keycodes.is_empty() {
            return Err(PlatformError::Window(format!(
                "no key produces keysym {:#x}",
                keysym
            )));
        }

        for &keycode in &keycodes {
            conn.grab_key(true, root, ModMask::ANY, keycode, GrabMode::ASYNC, GrabMode::ASYNC)?
                .check()?;
        }
        conn.flush()?;
        info!("[X11] Toggle key {:#x} grabbed ({:?})", keysym, keycodes);
        Ok(Self {
            conn,
            root,
            keycodes,
        })
    }

    pub fn matches(&self, keycode: Keycode) -> bool {
        self.keycodes.contains(&keycode)
    }

    /// Block until the toggle key is pressed.
    pub fn wait(&self) -> Result<(), PlatformError> {
        loop {
            if let Event::KeyPress(press) = self.conn.wait_for_event()? {
                if self.matches(press.detail) {
                    return Ok(());
                }
            }
        }
    }
}

impl Drop for ToggleKey {
    fn drop(&mut self) {
        for &keycode in &self.keycodes {
            let _ = self.conn.ungrab_key(keycode, self.root, ModMask::ANY);
        }
        let _ = self.conn.flush();
    }
}

pub struct X11OutputWindow {
    conn: Arc<XCBConnection>,
    window: Window,
    target: Window,
    extent: Extent2D,
    toggle_keycodes: Vec<Keycode>,
}

impl X11OutputWindow {
    /// Map the overlay over `target` (or the whole screen) and hand keyboard
    /// focus back to `target`.
    pub fn create(
        conn: Arc<XCBConnection>,
        screen_num: usize,
        target: Window,
        fullscreen: bool,
        toggle: &ToggleKey,
    ) -> Result<Self, PlatformError> {
        let screen = conn
            .setup()
            .roots
            .get(screen_num)
            .ok_or_else(|| PlatformError::Window(format!("no screen {}", screen_num)))?
            .clone();

        let (x, y, width, height) = if fullscreen {
            (0, 0, screen.width_in_pixels, screen.height_in_pixels)
        } else {
            let geometry = conn.get_geometry(target)?.reply()?;
            let origin = conn
                .translate_coordinates(target, screen.root, 0, 0)?
                .reply()?;
            (origin.dst_x, origin.dst_y, geometry.width, geometry.height)
        };

        let window = conn.generate_id()?;
        let aux = CreateWindowAux::new()
            .override_redirect(1)
            .background_pixel(screen.black_pixel)
            .event_mask(EventMask::STRUCTURE_NOTIFY | EventMask::EXPOSURE);
        conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            window,
            screen.root,
            x,
            y,
            width,
            height,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &aux,
        )?
        .check()?;

        // Empty input region: clicks pass through to whatever is below.
        conn.xfixes_query_version(5, 0)?.reply()?;
        let region = conn.generate_id()?;
        conn.xfixes_create_region(region, &[])?;
        conn.xfixes_set_window_shape_region(window, SK::INPUT, 0, 0, region)?;
        conn.xfixes_destroy_region(region)?;

        // Learn when the captured window goes away.
        conn.change_window_attributes(
            target,
            &ChangeWindowAttributesAux::new().event_mask(EventMask::STRUCTURE_NOTIFY),
        )?;

        conn.map_window(window)?;
        conn.set_input_focus(InputFocus::PARENT, target, x11rb::CURRENT_TIME)?;
        conn.flush()?;

        let extent = Extent2D::new(width as u32, height as u32);
        info!(
            "[X11] Output window {:#x} mapped at {},{} {} over {:#x}",
            window, x, y, extent, target
        );
        Ok(Self {
            conn,
            window,
            target,
            extent,
            toggle_keycodes: toggle.keycodes.clone(),
        })
    }

    pub fn window(&self) -> Window {
        self.window
    }

    fn translate(&mut self, event: Event) -> Option<WindowEvent> {
        match event {
            Event::ConfigureNotify(ev) if ev.window == self.window => {
                let extent = Extent2D::new(ev.width as u32, ev.height as u32);
                if extent == self.extent {
                    return None;
                }
                self.extent = extent;
                Some(WindowEvent::Resized(extent))
            }
            Event::DestroyNotify(ev) if ev.window == self.window || ev.window == self.target => {
                info!("[X11] Window {:#x} destroyed", ev.window);
                Some(WindowEvent::Destroyed)
            }
            Event::KeyPress(ev) if self.toggle_keycodes.contains(&ev.detail) => {
                Some(WindowEvent::Toggle)
            }
            Event::Error(e) => {
                debug!("[X11] Async error: {:?}", e.error_kind);
                None
            }
            _ => None,
        }
    }
}

impl OutputWindow for X11OutputWindow {
    fn extent(&self) -> Extent2D {
        self.extent
    }

    fn poll_events(&mut self) -> Result<Vec<WindowEvent>, PlatformError> {
        let mut events = Vec::new();
        while let Some(event) = self.conn.poll_for_event()? {
            if let Some(translated) = self.translate(event) {
                events.push(translated);
            }
        }
        Ok(events)
    }
}

impl Drop for X11OutputWindow {
    fn drop(&mut self) {
        if let Err(e) = self.conn.destroy_window(self.window) {
            warn!("[X11] DestroyWindow failed: {}", e);
        }
        let _ = self.conn.flush();
    }
}
