//! # Brightness Classifier
//!
//! Turns the camera's auto-exposure result into a scene state
//! ([`SceneState::Night`], [`SceneState::Cloudy`] or [`SceneState::Sunny`]).
//!
//! Two thresholds are evaluated independently, each as a Schmitt trigger:
//! - the **dark** threshold separates Night from the lit states,
//! - the **bright** threshold separates Sunny from the rest.
//!
//! When a sample clears `threshold + margin` the margin flips negative, so
//! falling back requires a sample at or below `threshold - |margin|`. The
//! bright check runs after the dark check and overwrites its result.
//!
//! A transition *into* Night raises the dark-boundary flag exactly once; the
//! boundary image is uploaded even when nothing else is dirty.

use crate::SceneState;
use serde::{Deserialize, Serialize};

/// Classifier thresholds in brightness units (see [`brightness_from_exposure`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Night below, Cloudy or Sunny above.
    pub dark: u64,
    pub dark_margin: u64,
    /// Sunny above.
    pub bright: u64,
    pub bright_margin: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            dark: 3_300,
            dark_margin: 200,
            bright: 280_000,
            bright_margin: 20_000,
        }
    }
}

/// Scene brightness from exposure metadata.
///
/// Short exposures at low gain mean a bright scene. The `0.01` keeps the
/// divisor positive when a driver reports zero gain.
pub fn brightness_from_exposure(exposure_us: f64, analog_gain: f64, digital_gain: f64) -> u64 {
    if exposure_us <= 0.0 {
        return u64::MAX;
    }
    let gain = analog_gain * digital_gain + 0.01;
    (1e9 / exposure_us / gain) as u64
}

/// Result of one classifier update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub brightness: u64,
    pub previous: SceneState,
    pub state: SceneState,
    /// Set when `state != previous`.
    pub transitioned_to: Option<SceneState>,
    /// First Night sample after a lit one.
    pub dark_boundary: bool,
}

/// Stateful hysteresis classifier.
#[derive(Debug, Clone)]
pub struct BrightnessClassifier {
    thresholds: Thresholds,
    state: SceneState,
    dark_margin: i64,
    bright_margin: i64,
}

impl BrightnessClassifier {
    /// Starts as Cloudy so the first dark sample of a run produces the
    /// dark-boundary image.
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            state: SceneState::Cloudy,
            dark_margin: thresholds.dark_margin as i64,
            bright_margin: thresholds.bright_margin as i64,
        }
    }

    pub fn state(&self) -> SceneState {
        self.state
    }

    /// Current signed margins `(dark, bright)`.
    pub fn margins(&self) -> (i64, i64) {
        (self.dark_margin, self.bright_margin)
    }

    pub fn update(&mut self, brightness: u64) -> Classification {
        let previous = self.state;
        let sample = i64::try_from(brightness).unwrap_or(i64::MAX);
        let mut state;
        let mut dark_boundary = false;

        // Dark threshold
        if sample > self.thresholds.dark as i64 + self.dark_margin {
            self.dark_margin = -self.dark_margin.abs();
            state = SceneState::Cloudy;
        } else {
            self.dark_margin = self.dark_margin.abs();
            dark_boundary = previous != SceneState::Night;
            state = SceneState::Night;
        }

        // Bright threshold, evaluated last and wins
        if sample > self.thresholds.bright as i64 + self.bright_margin {
            self.bright_margin = -self.bright_margin.abs();
            state = SceneState::Sunny;
        } else {
            self.bright_margin = self.bright_margin.abs();
        }

        self.state = state;
        Classification {
            brightness,
            previous,
            state,
            transitioned_to: (state != previous).then_some(state),
            dark_boundary: dark_boundary && state == SceneState::Night,
        }
    }
}
