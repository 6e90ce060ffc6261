use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;

/// Immutable thresholds and budgets, loaded once at startup (`spec.md` §6).
///
/// Split from the mutable flags the front-end and mapper flip at runtime
/// (`RuntimeState`) per the design note in `spec.md` §9: "Split into
/// immutable configuration ... passed by reference and a small
/// atomically-updated runtime state block."
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Params {
    pub use_prior: bool,
    pub stereo: bool,

    pub initial_parallax: f64,

    pub pyramid_levels: u32,
    pub pyramid_sigma: f64,
    pub window_size: u32,

    pub max_ktl_distance: f64,
    pub max_reprojection_error: f64,

    pub max_nb_keypoints: usize,
    pub max_projection_distance: f64,
    pub max_descriptor_distance: f64,

    pub do_local_matching: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            use_prior: true,
            stereo: true,
            initial_parallax: 20.0,
            pyramid_levels: 3,
            pyramid_sigma: 1.2,
            window_size: 21,
            max_ktl_distance: 1.0,
            max_reprojection_error: 1.0,
            max_nb_keypoints: 1000,
            max_projection_distance: 10.0,
            max_descriptor_distance: 64.0,
            do_local_matching: true,
        }
    }
}

impl Params {
    pub fn local_map_target(&self) -> usize {
        self.max_nb_keypoints * 10
    }
}

/// Runtime-mutable flags shared across the tracker and mapper threads.
///
/// Every field is a plain atomic rather than a lock: the flags are read and
/// flipped far more often than they are contended, and none of them needs
/// to be observed atomically with any other field.
#[derive(Debug, Default)]
pub struct RuntimeState {
    vision_initialized: AtomicBool,
    reset_required: AtomicBool,
    p3p_required: AtomicBool,
    exit_required: AtomicBool,
}

impl RuntimeState {
    pub fn vision_initialized(&self) -> bool {
        self.vision_initialized.load(Ordering::Acquire)
    }

    pub fn set_vision_initialized(&self, value: bool) {
        self.vision_initialized.store(value, Ordering::Release);
    }

    pub fn reset_required(&self) -> bool {
        self.reset_required.load(Ordering::Acquire)
    }

    pub fn set_reset_required(&self, value: bool) {
        self.reset_required.store(value, Ordering::Release);
    }

    pub fn p3p_required(&self) -> bool {
        self.p3p_required.load(Ordering::Acquire)
    }

    pub fn set_p3p_required(&self, value: bool) {
        self.p3p_required.store(value, Ordering::Release);
    }

    pub fn exit_required(&self) -> bool {
        self.exit_required.load(Ordering::Acquire)
    }

    pub fn request_exit(&self) {
        self.exit_required.store(true, Ordering::Release);
    }

    /// Clears everything a reset must observe and re-clear (`spec.md` §7:
    /// "the next cycle must observe and clear state").
    pub fn clear_for_reset(&self) {
        self.vision_initialized.store(false, Ordering::Release);
        self.reset_required.store(false, Ordering::Release);
        self.p3p_required.store(false, Ordering::Release);
    }
}
