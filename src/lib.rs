//! # Sundial Cam Core Library
//!
//! Everything an unattended sundial webcam needs between "the camera took a
//! picture" and "the collector has the result": solar geometry, scene
//! classification, capture scheduling, image composition and transfer.
//!
//! ## Design Philosophy
//!
//! ### One cycle at a time
//! The appliance runs a single cooperative loop on a current-thread tokio
//! runtime. A cycle is strictly serialized:
//!
//! 1. **Capture**: wait for the next 30-second wall-clock mark, take a still
//! 2. **Ephemeris**: equation of time/longitude, today's noon, sunrise, sunset
//! 3. **Classify**: exposure → brightness → Night / Cloudy / Sunny
//! 4. **Compose**: derive a render plan and rasterize the total/detail pair
//! 5. **Transfer**: ship dirty artifacts plus status, ingest remote commands
//! 6. **Reschedule**: next wait, noon acceleration, sunset termination
//!
//! ### Failure is local to the cycle
//! Every per-cycle error (sensor, transport, rasterizer) degrades to a
//! warning. Only a missing camera at startup stops the program.
//!
//! ### Collaborators behind traits
//! Camera, temperature sensors, rasterizer and transports are traits with one
//! shipped implementation each, so the loop runs in tests with fakes.
//!
//! ## Core Types
//! - [`SceneState`]: the classifier's mutually exclusive scene label
//! - [`station::CaptureLoop`]: the loop wiring all components together

use serde::{Deserialize, Serialize};

pub mod brightness;
pub mod camera;
pub mod composition;
pub mod config;
pub mod ephemeris;
pub mod logging;
pub mod params;
pub mod raster;
pub mod scheduler;
pub mod sensors;
pub mod shutdown;
pub mod station;
pub mod status;
pub mod transfer;

/// Software version reported in the status record.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lighting state of the dial. Exactly one is active at any time.
///
/// # Example
/// ```
/// use sundial_cam_lib::SceneState;
///
/// assert_eq!(SceneState::Sunny.flags(), (1, 0, 0));
/// assert!(SceneState::Cloudy.is_lit());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneState {
    Night,
    Cloudy,
    Sunny,
}

impl SceneState {
    /// `(sunny, cloudy, night)` as 0/1 flags, the layout of the status record.
    pub fn flags(self) -> (u8, u8, u8) {
        match self {
            SceneState::Sunny => (1, 0, 0),
            SceneState::Cloudy => (0, 1, 0),
            SceneState::Night => (0, 0, 1),
        }
    }

    /// Cloudy or Sunny.
    pub fn is_lit(self) -> bool {
        self != SceneState::Night
    }
}

impl std::fmt::Display for SceneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SceneState::Night => "night",
            SceneState::Cloudy => "cloudy",
            SceneState::Sunny => "sunny",
        };
        f.write_str(name)
    }
}
