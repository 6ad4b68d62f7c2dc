//! # Status Record
//!
//! The liveness record sent to the collector every cycle and kept on local
//! disk, so the last known state can be inspected even when transfer fails.
//! Optionally each cycle is also appended to a yearly series archive.

use crate::composition::TimingFacts;
use crate::config::{self, ConfigError};
use crate::sensors::Temperatures;
use crate::SceneState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub system: SystemStatus,
    pub dial: DialStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub sw_version: String,
    pub capture_time: String,
    pub capture_lat: String,
    pub cpu_temperature: String,
    pub camera_temperature: String,
    pub outcase_temperature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialStatus {
    pub brightness: i64,
    pub sunny: u8,
    pub cloudy: u8,
    pub night: u8,
}

impl StatusRecord {
    pub fn new(
        timing: &TimingFacts,
        temperatures: &Temperatures,
        brightness: u64,
        scene: SceneState,
    ) -> Self {
        let (sunny, cloudy, night) = scene.flags();
        StatusRecord {
            system: SystemStatus {
                sw_version: crate::VERSION.to_string(),
                capture_time: timing.utc_label(),
                capture_lat: timing.lat_label(),
                cpu_temperature: temperatures.cpu_label(),
                camera_temperature: temperatures.case_label(),
                outcase_temperature: temperatures.outside_label(),
            },
            dial: DialStatus {
                brightness: i64::try_from(brightness).unwrap_or(i64::MAX),
                sunny,
                cloudy,
                night,
            },
        }
    }

    /// Record written before the first capture.
    pub fn startup() -> Self {
        StatusRecord {
            system: SystemStatus {
                sw_version: crate::VERSION.to_string(),
                capture_time: String::new(),
                capture_lat: String::new(),
                cpu_temperature: String::new(),
                camera_temperature: String::new(),
                outcase_temperature: String::new(),
            },
            dial: DialStatus {
                brightness: 0,
                sunny: 0,
                cloudy: 0,
                night: 0,
            },
        }
    }

    /// Replace the temperature fields, keeping the capture fields.
    pub fn update_temperatures(&mut self, temperatures: &Temperatures) {
        self.system.cpu_temperature = temperatures.cpu_label();
        self.system.camera_temperature = temperatures.case_label();
        self.system.outcase_temperature = temperatures.outside_label();
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        config::write_toml(path.as_ref(), self)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Local long-term record: one status line per cycle, one image per lit cycle.
#[derive(Debug, Clone)]
pub struct SeriesArchive {
    dir: PathBuf,
}

impl SeriesArchive {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        SeriesArchive { dir: dir.into() }
    }

    /// Append `<utc>;<cpu>;<case>;<out>;<brightness>` to `status<YYYY>.log`
    /// and copy the total image (if given) to `images<jjj>/img<jjj><HHMMSS>.jpg`.
    pub fn record(
        &self,
        at: DateTime<Utc>,
        temperatures: &Temperatures,
        brightness: u64,
        total_image: Option<&Path>,
    ) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let log = self.dir.join(at.format("status%Y.log").to_string());
        let mut file = OpenOptions::new().create(true).append(true).open(&log)?;
        writeln!(
            file,
            "{};{};{};{};{}",
            at.format("%Y-%m-%dT%H:%M:%SZ"),
            temperatures.cpu_label(),
            temperatures.case_label(),
            temperatures.outside_label(),
            brightness
        )?;

        if let Some(image) = total_image {
            let day_dir = self.dir.join(at.format("images%j").to_string());
            fs::create_dir_all(&day_dir)?;
            let target = day_dir.join(at.format("img%j%H%M%S.jpg").to_string());
            fs::copy(image, &target)?;
            debug!("Archived {}", target.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeris;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn timing() -> TimingFacts {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap();
        TimingFacts::new(at, &ephemeris::compute(at, 23.586, 46.758))
    }

    #[test]
    fn record_carries_scene_flags_and_labels() {
        let temps = Temperatures {
            cpu: Some(51.2),
            case: Some(18.0),
            outside: None,
        };
        let record = StatusRecord::new(&timing(), &temps, 412_000, SceneState::Sunny);
        assert_eq!(record.system.capture_time, "UTC: 19 Oct 2026 09:30:00");
        assert!(record.system.capture_lat.starts_with("LAT: 19 Oct 2026 11:"));
        assert_eq!(record.system.outcase_temperature, "TT.T");
        assert_eq!(record.system.cpu_temperature, "51.2");
        assert_eq!((record.dial.sunny, record.dial.cloudy, record.dial.night), (1, 0, 0));
    }

    #[test]
    fn record_survives_a_saturated_brightness() {
        let record = StatusRecord::new(
            &timing(),
            &Temperatures::default(),
            u64::MAX,
            SceneState::Sunny,
        );
        assert_eq!(record.dial.brightness, i64::MAX);
        assert!(record.to_toml().is_ok());
    }

    #[test]
    fn temperature_update_keeps_the_capture() {
        let mut record =
            StatusRecord::new(&timing(), &Temperatures::default(), 7_000, SceneState::Cloudy);
        record.update_temperatures(&Temperatures {
            cpu: Some(55.0),
            case: Some(21.4),
            outside: None,
        });
        assert_eq!(record.system.capture_time, "UTC: 19 Oct 2026 09:30:00");
        assert_eq!(record.system.cpu_temperature, "55.0");
        assert_eq!(record.system.camera_temperature, "21.4");
        assert_eq!(record.dial.brightness, 7_000);
        assert_eq!(record.dial.cloudy, 1);
    }

    #[test]
    fn record_is_written_locally() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let record = StatusRecord::new(&timing(), &Temperatures::default(), 10, SceneState::Night);
        record.write(&path).unwrap();

        let back: StatusRecord = config::read_toml(&path).unwrap();
        assert_eq!(back, record);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("[system]"));
        assert!(text.contains("swVersion"));
    }

    #[test]
    fn archive_appends_lines_and_copies_images() {
        let dir = tempdir().unwrap();
        let archive = SeriesArchive::new(dir.path().join("archive"));
        let image = dir.path().join("imgTotal.jpg");
        fs::write(&image, b"jpeg").unwrap();

        let at = Utc.with_ymd_and_hms(2026, 2, 3, 14, 5, 30).unwrap();
        let temps = Temperatures {
            cpu: Some(40.0),
            case: None,
            outside: Some(-3.5),
        };
        archive.record(at, &temps, 5_000, Some(&image)).unwrap();
        archive.record(at, &temps, 3_000, None).unwrap();

        let log = fs::read_to_string(dir.path().join("archive/status2026.log")).unwrap();
        assert_eq!(
            log,
            "2026-02-03T14:05:30Z;40.0;TT.T;-3.5;5000\n2026-02-03T14:05:30Z;40.0;TT.T;-3.5;3000\n"
        );
        assert!(dir.path().join("archive/images034/img034140530.jpg").exists());
    }
}
