//! glasspane: mirror one X11 window into a full-screen Vulkan overlay.
//!
//! Picks the focused window after a short delay, redirects it through the
//! Composite extension and presents every frame it draws. The toggle key
//! (F12 by default) ends the session; pressing it again starts a new one on
//! whatever window has focus then.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::Window;
use x11rb::xcb_ffi::XCBConnection;

use glasspane::capture::x11::{focused_top_level, X11WindowSource};
use glasspane::capture::{CapturePoll, CaptureSource};
use glasspane::gpu::vulkan::VulkanDevice;
use glasspane::platform::x11::{ToggleKey, X11OutputWindow};
use glasspane::{
    IdentityUpscaler, Orchestrator, OrchestratorOptions, OverlayConfig, SessionEnd, UpscaleStage,
    UpscalerKind,
};

#[derive(Debug, Parser)]
#[command(name = "glasspane", version, about = "Mirror one X11 window into a full-screen Vulkan overlay")]
struct Cli {
    /// JSON config file (default: ~/.config/glasspane/config.json if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Window to capture, decimal or 0x-prefixed hex; defaults to the focused window
    #[arg(long, value_parser = parse_xid)]
    window: Option<u32>,

    /// Milliseconds to wait before picking the focused window
    #[arg(long)]
    start_delay_ms: Option<u64>,

    /// Match the target window's size instead of covering the screen
    #[arg(long)]
    windowed: bool,

    #[arg(long, value_enum)]
    upscaler: Option<UpscalerKind>,

    /// Disable sub-pixel jitter
    #[arg(long)]
    no_jitter: bool,

    /// Prefer FIFO presentation over MAILBOX
    #[arg(long)]
    vsync: bool,

    /// Save one captured frame as PNG and exit
    #[arg(long, value_name = "PNG")]
    snapshot: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut OverlayConfig) {
        if let Some(window) = self.window {
            config.target_window = Some(window);
        }
        if let Some(delay) = self.start_delay_ms {
            config.start_delay_ms = delay;
        }
        if self.windowed {
            config.fullscreen = false;
        }
        if let Some(upscaler) = self.upscaler {
            config.upscaler = upscaler;
        }
        if self.no_jitter {
            config.jitter = false;
        }
        if self.vsync {
            config.prefer_low_latency = false;
        }
    }
}

fn parse_xid(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid window id '{}': {}", text, e))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = OverlayConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let (conn, screen_num) =
        XCBConnection::connect(None).context("Failed to connect to the X server")?;
    let conn = Arc::new(conn);
    let root = conn
        .setup()
        .roots
        .get(screen_num)
        .map(|screen| screen.root)
        .context("X server reported no such screen")?;

    if !config.start_delay().is_zero() && config.target_window.is_none() {
        info!(
            "[Main] Picking the focused window in {} ms",
            config.start_delay_ms
        );
        std::thread::sleep(config.start_delay());
    }

    if let Some(path) = &cli.snapshot {
        let target = pick_target(&conn, root, config.target_window)?;
        return save_snapshot(conn, target, path);
    }

    let toggle = ToggleKey::grab(Arc::clone(&conn), root, config.toggle_keysym)
        .context("Failed to grab the toggle key")?;

    let mut explicit = config.target_window;
    loop {
        let target = pick_target(&conn, root, explicit.take())?;
        match run_session(&conn, screen_num, target, &config, &toggle)? {
            SessionEnd::Destroyed => {
                info!("[Main] Window gone, exiting");
                return Ok(());
            }
            SessionEnd::Toggled => {
                info!("[Main] Overlay off; press the toggle key to mirror the focused window");
                toggle.wait().context("Failed waiting for the toggle key")?;
            }
        }
    }
}

fn pick_target(conn: &XCBConnection, root: Window, explicit: Option<u32>) -> Result<Window> {
    if let Some(window) = explicit {
        return Ok(window);
    }
    match focused_top_level(conn, root).context("Failed to query the focused window")? {
        Some(window) => {
            info!("[Main] Target window {:#x}", window);
            Ok(window)
        }
        None => bail!("No focused window to capture; focus one or pass --window"),
    }
}

fn run_session(
    conn: &Arc<XCBConnection>,
    screen_num: usize,
    target: Window,
    config: &OverlayConfig,
    toggle: &ToggleKey,
) -> Result<SessionEnd> {
    let window = X11OutputWindow::create(
        Arc::clone(conn),
        screen_num,
        target,
        config.fullscreen,
        toggle,
    )
    .context("Failed to create the output window")?;
    let source = X11WindowSource::new(Arc::clone(conn), target)
        .context("Failed to redirect the target window")?;
    let device = VulkanDevice::new(Arc::clone(conn), window.window())
        .context("Failed to initialize Vulkan")?;

    let upscaler: Option<Box<dyn UpscaleStage>> = match config.upscaler {
        UpscalerKind::Identity => Some(Box::new(IdentityUpscaler::new())),
        UpscalerKind::None => None,
    };

    let mut orchestrator = Orchestrator::new(
        device,
        source,
        window,
        upscaler,
        OrchestratorOptions::from(config),
    );
    let end = orchestrator.run().context("Overlay session failed")?;
    Ok(end)
}

fn save_snapshot(conn: Arc<XCBConnection>, target: Window, path: &Path) -> Result<()> {
    let mut source =
        X11WindowSource::new(conn, target).context("Failed to redirect the target window")?;
    source.reconcile_size()?;

    let snapshot = match source.poll()? {
        CapturePoll::Frame(snapshot) => snapshot,
        CapturePoll::Absent(reason) => bail!("Nothing to capture: {}", reason),
    };
    let Some(rgba) = snapshot.to_rgba() else {
        bail!("Captured image is malformed");
    };
    image::save_buffer(
        path,
        &rgba,
        snapshot.extent.width,
        snapshot.extent.height,
        image::ColorType::Rgba8,
    )
    .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("[Main] Saved {} ({})", path.display(), snapshot.extent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_ids_parse_as_hex_or_decimal() {
        assert_eq!(parse_xid("0x1c00007"), Ok(0x1c0_0007));
        assert_eq!(parse_xid("29360135"), Ok(29_360_135));
        assert!(parse_xid("window").is_err());
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from(["glasspane", "--windowed", "--upscaler", "none", "--no-jitter"]);
        let mut config = OverlayConfig::default();
        cli.apply(&mut config);
        assert!(!config.fullscreen);
        assert_eq!(config.upscaler, UpscalerKind::None);
        assert!(!config.jitter);
        assert!(config.prefer_low_latency);
    }
}
