//! Seam to the on-screen edge overlay.
//!
//! Rendering itself lives outside this crate. The daemon only drives emphasis
//! levels: a short full-strength flash per action and a slow ambient pulse
//! while it is running. Every call happens on the event loop.
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Upper bound for the ambient pulse so it never competes with a flash.
pub const MAX_AMBIENT_LEVEL: f32 = 0.25;
/// Ambient level of the "on" half of a pulse.
pub const PULSE_LEVEL: f32 = 0.15;
/// Extra time a standalone flash stays up after its nominal duration.
const STANDALONE_LINGER: Duration = Duration::from_millis(100);

pub trait Overlay: Send {
    /// Full-strength emphasis for `duration`.
    fn flash(&mut self, duration: Duration);
    /// Background emphasis, clamped to `[0, MAX_AMBIENT_LEVEL]`.
    fn set_ambient_pulse(&mut self, level: f32);
    /// Current emphasis in `[0, 1]`: the stronger of flash and ambient.
    fn emphasis(&self) -> f32;
}

/// Tracks emphasis without drawing anything; the stand-in renderer.
#[derive(Debug, Default)]
pub struct HeadlessOverlay {
    flash_until: Option<Instant>,
    ambient: f32,
    flashes: u64,
}

impl HeadlessOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn flash_count(&self) -> u64 {
        self.flashes
    }

    pub fn is_flashing(&self) -> bool {
        self.flash_until.is_some_and(|until| Instant::now() < until)
    }
}

impl Overlay for HeadlessOverlay {
    fn flash(&mut self, duration: Duration) {
        self.flashes += 1;
        self.flash_until = Some(Instant::now() + duration);
        debug!("overlay flash for {}ms", duration.as_millis());
    }

    fn set_ambient_pulse(&mut self, level: f32) {
        self.ambient = level.clamp(0.0, MAX_AMBIENT_LEVEL);
        trace!("overlay ambient level {:.2}", self.ambient);
    }

    fn emphasis(&self) -> f32 {
        let flash: f32 = if self.is_flashing() { 1.0 } else { 0.0 };
        flash.max(self.ambient)
    }
}

/// Alternates the ambient level between [`PULSE_LEVEL`] and zero.
#[derive(Debug, Default)]
pub struct Pulse {
    phase: bool,
}

impl Pulse {
    /// Advances one half-period and returns the level to apply.
    pub fn tick(&mut self) -> f32 {
        self.phase = !self.phase;
        if self.phase {
            PULSE_LEVEL
        } else {
            0.0
        }
    }
}

/// One-off flash rendered by the calling process when no daemon is reachable.
pub fn show_standalone_flash(overlay: &mut dyn Overlay, duration: Duration) {
    overlay.flash(duration);
    std::thread::sleep(duration + STANDALONE_LINGER);
}
