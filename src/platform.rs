/*!
 * Output Window Platform
 *
 * The window the overlay presents into, and the events it delivers.
 */

use crate::error::PlatformError;
use crate::frame::Extent2D;

#[cfg(target_os = "linux")]
pub mod x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    /// The output window or the captured window is gone
    Destroyed,
    Resized(Extent2D),
    /// The user asked to end the session
    Toggle,
}

pub trait OutputWindow {
    /// Live client-area size
    fn extent(&self) -> Extent2D;

    /// Everything queued since the last call, without blocking.
    fn poll_events(&mut self) -> Result<Vec<WindowEvent>, PlatformError>;
}

/// What one drain of the event queue asks the orchestrator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSummary {
    pub destroyed: bool,
    pub toggled: bool,
    /// Last size reported, if any resize arrived
    pub resized: Option<Extent2D>,
}

impl EventSummary {
    /// Coalesce a batch; any number of resizes collapse into one.
    pub fn from_events(events: &[WindowEvent]) -> Self {
        let mut summary = EventSummary::default();
        for event in events {
            match *event {
                WindowEvent::Destroyed => summary.destroyed = true,
                WindowEvent::Toggle => summary.toggled = true,
                WindowEvent::Resized(extent) => summary.resized = Some(extent),
            }
        }
        summary
    }
}
