//! Operator controls forwarded from the viewer to the mapping system.
//!
//! Flags are set from any thread (UI, RPC, signal handler) and consumed by
//! the viewer loop at the end of each tick. The localization toggle is
//! edge-triggered: the mapping system only hears about transitions.

use std::sync::atomic::{AtomicBool, Ordering};

/// Mapping-system operations the viewer may trigger.
pub trait MapControl: Send {
    /// Stop creating new map content and track against the existing map.
    fn activate_localization_mode(&mut self);

    /// Resume full mapping.
    fn deactivate_localization_mode(&mut self);

    /// Discard the current map.
    fn reset(&mut self);
}

/// Control flags shared with the viewer loop.
#[derive(Debug, Default)]
pub struct ViewerControls {
    localization_mode: AtomicBool,
    reset_requested: AtomicBool,
}

impl ViewerControls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request localization-only mode on or off.
    pub fn set_localization_mode(&self, enabled: bool) {
        self.localization_mode.store(enabled, Ordering::Relaxed);
    }

    /// Requested localization mode.
    pub fn localization_mode(&self) -> bool {
        self.localization_mode.load(Ordering::Relaxed)
    }

    /// Request a map reset on the next tick.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Relaxed);
    }

    /// Consume a pending reset request.
    pub fn take_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::Relaxed)
    }
}

/// Tracks what the mapping system was last told, so toggles fire once.
#[derive(Debug, Default)]
pub struct ControlTracker {
    localization_active: bool,
}

impl ControlTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether localization mode was last activated.
    pub fn localization_active(&self) -> bool {
        self.localization_active
    }

    /// Forward pending control changes to `system`.
    pub fn apply(&mut self, controls: &ViewerControls, system: &mut dyn MapControl) {
        let wanted = controls.localization_mode();
        if wanted && !self.localization_active {
            log::info!("Activating localization mode");
            system.activate_localization_mode();
            self.localization_active = true;
        } else if !wanted && self.localization_active {
            log::info!("Deactivating localization mode");
            system.deactivate_localization_mode();
            self.localization_active = false;
        }

        if controls.take_reset() {
            log::info!("Resetting map");
            // Reset returns the system to full mapping
            if self.localization_active {
                self.localization_active = false;
                controls.set_localization_mode(false);
            }
            system.reset();
        }
    }
}
