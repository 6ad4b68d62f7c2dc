//! # Camera
//!
//! The camera is an external collaborator: it produces a still on disk plus
//! the exposure and gain values that auto-exposure settled on.
//!
//! [`LibcameraCamera`] drives the Raspberry Pi `libcamera-still` tool. A
//! missing camera is only fatal at startup ([`LibcameraCamera::open`]); a
//! failed capture later on is an ordinary per-cycle error.

use crate::config::{CameraConfig, PathsConfig};
use crate::params::Resolution;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Upper bound for one still, on top of the settle time.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("bad capture metadata: {0}")]
    Metadata(String),

    #[error("camera IO: {0}")]
    Io(#[from] std::io::Error),
}

/// One still and its exposure settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image_path: PathBuf,
    pub captured_at: DateTime<Utc>,
    pub exposure_us: f64,
    pub analog_gain: f64,
    pub digital_gain: f64,
}

#[allow(async_fn_in_trait)]
pub trait Camera {
    /// Full sensor resolution of the stills.
    fn resolution(&self) -> Resolution;

    async fn capture(&mut self) -> Result<Frame, CameraError>;

    /// Release the device.
    async fn close(&mut self) {}
}

/// `libcamera-still` wrapper.
#[derive(Debug)]
pub struct LibcameraCamera {
    command: String,
    settle_ms: u64,
    resolution: Resolution,
    image_path: PathBuf,
    metadata_path: PathBuf,
}

impl LibcameraCamera {
    /// Probe for a camera. Fails with [`CameraError::DeviceUnavailable`] when
    /// the tool is missing or lists no cameras.
    pub async fn open(config: &CameraConfig, paths: &PathsConfig) -> Result<Self, CameraError> {
        let output = Command::new(&config.command)
            .arg("--list-cameras")
            .output()
            .await
            .map_err(|e| CameraError::DeviceUnavailable(format!("{}: {}", config.command, e)))?;

        let listing = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let sensor = parse_camera_listing(&listing)
            .ok_or_else(|| CameraError::DeviceUnavailable("no cameras available".to_string()))?;

        let resolution = match (config.width, config.height) {
            (Some(w), Some(h)) => Resolution::new(w, h),
            _ => sensor,
        };
        info!(
            "Camera found, sensor {}x{}, capturing {}x{}",
            sensor.width, sensor.height, resolution.width, resolution.height
        );

        Ok(LibcameraCamera {
            command: config.command.clone(),
            settle_ms: config.settle_ms,
            resolution,
            image_path: paths.live_image.clone(),
            metadata_path: paths.live_metadata.clone(),
        })
    }
}

impl Camera for LibcameraCamera {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    async fn capture(&mut self) -> Result<Frame, CameraError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--nopreview")
            .arg("-t")
            .arg(self.settle_ms.to_string())
            .arg("--width")
            .arg(self.resolution.width.to_string())
            .arg("--height")
            .arg(self.resolution.height.to_string())
            .args(["--encoding", "jpg"])
            .arg("--metadata")
            .arg(&self.metadata_path)
            .args(["--metadata-format", "json"])
            .arg("-o")
            .arg(&self.image_path)
            .kill_on_drop(true);

        let limit = CAPTURE_TIMEOUT + Duration::from_millis(self.settle_ms);
        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| CameraError::Capture(format!("no still after {:?}", limit)))??;
        let captured_at = Utc::now();

        if !output.status.success() {
            return Err(CameraError::Capture(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let raw = tokio::fs::read(&self.metadata_path).await?;
        let (exposure_us, analog_gain, digital_gain) = parse_metadata(&raw)?;
        debug!(
            "Captured {} (exposure {} us, gain {:.2}/{:.2})",
            self.image_path.display(),
            exposure_us,
            analog_gain,
            digital_gain
        );

        Ok(Frame {
            image_path: self.image_path.clone(),
            captured_at,
            exposure_us,
            analog_gain,
            digital_gain,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StillMetadata {
    exposure_time: f64,
    analogue_gain: f64,
    #[serde(default = "unity")]
    digital_gain: f64,
}

fn unity() -> f64 {
    1.0
}

fn parse_metadata(raw: &[u8]) -> Result<(f64, f64, f64), CameraError> {
    let meta: StillMetadata =
        serde_json::from_slice(raw).map_err(|e| CameraError::Metadata(e.to_string()))?;
    Ok((meta.exposure_time, meta.analogue_gain, meta.digital_gain))
}

/// First `[WxH]` of a `--list-cameras` listing.
fn parse_camera_listing(listing: &str) -> Option<Resolution> {
    listing
        .lines()
        .filter(|l| l.contains(" : "))
        .find_map(|line| {
            let start = line.find('[')? + 1;
            let end = start + line[start..].find(']')?;
            let size = line[start..end].split_whitespace().next()?;
            let (w, h) = size.split_once('x')?;
            Some(Resolution::new(w.parse().ok()?, h.parse().ok()?))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_yields_sensor_resolution() {
        let listing = "Available cameras\n-----------------\n0 : imx219 [3280x2464 10-bit RGGB] (/base/soc/i2c0mux/i2c@1/imx219@10)\n    Modes: 'SRGGB10_CSI2P' : 640x480 [206.65 fps - (1000, 752)/1280x960 crop]\n";
        assert_eq!(parse_camera_listing(listing), Some(Resolution::new(3280, 2464)));

        let listing = "Available cameras\n-----------------\n0 : ov5647 [2592x1944] (/base/soc/i2c0mux/i2c@1/ov5647@36)\n";
        assert_eq!(parse_camera_listing(listing), Some(Resolution::new(2592, 1944)));

        assert_eq!(parse_camera_listing("No cameras available!\n"), None);
    }

    #[test]
    fn metadata_fills_exposure_and_gains() {
        let raw = br#"{"ExposureTime": 1250, "AnalogueGain": 1.5, "DigitalGain": 1.02, "Lux": 800.0}"#;
        assert_eq!(parse_metadata(raw).unwrap(), (1250.0, 1.5, 1.02));

        let no_digital = br#"{"ExposureTime": 66000, "AnalogueGain": 8.0}"#;
        assert_eq!(parse_metadata(no_digital).unwrap(), (66000.0, 8.0, 1.0));

        assert!(matches!(
            parse_metadata(b"{}"),
            Err(CameraError::Metadata(_))
        ));
    }
}
