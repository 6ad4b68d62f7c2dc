//! # Temperature Sensors
//!
//! CPU temperature from the kernel thermal zone plus up to two DS18B20
//! one-wire probes. With one probe it measures the camera case; with two the
//! first is outside and the second is the case.
//!
//! One-wire probes report exactly 85.0 °C when a conversion did not complete.
//! That value is re-read up to [`MAX_RETRIES`] times and then shown as
//! `TT.T`, the same placeholder used for any other sensor error.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Power-on value of a DS18B20, never a real reading here.
pub const KNOWN_BAD: f64 = 85.0;
pub const MAX_RETRIES: u32 = 2;
/// Shown when no valid reading is available.
pub const UNKNOWN: &str = "TT.T";

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("sensor IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("sensor {0} failed its CRC check")]
    Crc(String),

    #[error("unreadable value from {sensor}: {raw}")]
    Parse { sensor: String, raw: String },
}

pub trait TemperatureSensor {
    fn id(&self) -> &str;

    /// Degrees Celsius.
    fn read(&mut self) -> Result<f64, SensorError>;
}

/// Read a sensor, re-reading the known-bad value. `None` means unknown.
pub fn read_with_retry(sensor: &mut dyn TemperatureSensor) -> Option<f64> {
    for attempt in 0..=MAX_RETRIES {
        match sensor.read() {
            Ok(v) if v == KNOWN_BAD => {
                debug!("Sensor {} read {} (attempt {})", sensor.id(), v, attempt + 1);
            }
            Ok(v) => return Some(v),
            Err(e) => {
                warn!("Sensor {}: {}", sensor.id(), e);
                return None;
            }
        }
    }
    warn!("Sensor {} stuck at {} °C", sensor.id(), KNOWN_BAD);
    None
}

/// DS18B20 on the one-wire bus.
#[derive(Debug, Clone)]
pub struct W1Sensor {
    id: String,
    path: PathBuf,
}

impl W1Sensor {
    pub fn new<P: Into<PathBuf>>(id: impl Into<String>, path: P) -> Self {
        W1Sensor {
            id: id.into(),
            path: path.into(),
        }
    }

    /// All `28-*` devices under `root` (normally `/sys/bus/w1/devices`),
    /// sorted by id.
    pub fn discover<P: AsRef<Path>>(root: P) -> Vec<W1Sensor> {
        let Ok(entries) = fs::read_dir(root.as_ref()) else {
            debug!("No one-wire bus at {}", root.as_ref().display());
            return Vec::new();
        };
        let mut sensors: Vec<W1Sensor> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let id = entry.file_name().to_string_lossy().into_owned();
                id.starts_with("28-")
                    .then(|| W1Sensor::new(id, entry.path().join("w1_slave")))
            })
            .collect();
        sensors.sort_by(|a, b| a.id.cmp(&b.id));
        sensors
    }
}

impl TemperatureSensor for W1Sensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&mut self) -> Result<f64, SensorError> {
        let raw = fs::read_to_string(&self.path)?;
        parse_w1_slave(&self.id, &raw)
    }
}

/// Kernel thermal zone (`/sys/class/thermal/thermal_zone0/temp`).
#[derive(Debug, Clone)]
pub struct CpuThermal {
    path: PathBuf,
}

impl CpuThermal {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        CpuThermal { path: path.into() }
    }
}

impl Default for CpuThermal {
    fn default() -> Self {
        CpuThermal::new("/sys/class/thermal/thermal_zone0/temp")
    }
}

impl TemperatureSensor for CpuThermal {
    fn id(&self) -> &str {
        "cpu"
    }

    fn read(&mut self) -> Result<f64, SensorError> {
        let raw = fs::read_to_string(&self.path)?;
        let milli: i64 = raw.trim().parse().map_err(|_| SensorError::Parse {
            sensor: "cpu".to_string(),
            raw: raw.trim().to_string(),
        })?;
        Ok(milli as f64 / 1000.0)
    }
}

/// One cycle's readings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Temperatures {
    pub cpu: Option<f64>,
    pub case: Option<f64>,
    pub outside: Option<f64>,
}

impl Temperatures {
    pub fn cpu_label(&self) -> String {
        label(self.cpu)
    }

    pub fn case_label(&self) -> String {
        label(self.case)
    }

    pub fn outside_label(&self) -> String {
        label(self.outside)
    }
}

fn label(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.1}", v),
        None => UNKNOWN.to_string(),
    }
}

/// The station's sensors, assigned to their roles.
pub struct SensorBank {
    cpu: Box<dyn TemperatureSensor>,
    w1: Vec<Box<dyn TemperatureSensor>>,
}

impl SensorBank {
    pub fn new(cpu: Box<dyn TemperatureSensor>, w1: Vec<Box<dyn TemperatureSensor>>) -> Self {
        if w1.len() > 2 {
            warn!("{} one-wire sensors found, using the first two", w1.len());
        }
        SensorBank { cpu, w1 }
    }

    /// CPU thermal zone plus whatever one-wire probes are attached.
    pub fn discover<P: AsRef<Path>>(w1_root: P) -> Self {
        let probes: Vec<Box<dyn TemperatureSensor>> = W1Sensor::discover(w1_root)
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn TemperatureSensor>)
            .collect();
        debug!("{} one-wire sensors", probes.len());
        SensorBank::new(Box::new(CpuThermal::default()), probes)
    }

    pub fn read_all(&mut self) -> Temperatures {
        let cpu = match self.cpu.read() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("CPU temperature: {}", e);
                None
            }
        };
        let (outside, case) = match self.w1.as_mut_slice() {
            [] => (None, None),
            [case] => (None, read_with_retry(case.as_mut())),
            [outside, case, ..] => (
                read_with_retry(outside.as_mut()),
                read_with_retry(case.as_mut()),
            ),
        };
        Temperatures { cpu, case, outside }
    }
}

fn parse_w1_slave(id: &str, raw: &str) -> Result<f64, SensorError> {
    let mut lines = raw.lines();
    let crc_ok = lines
        .next()
        .map(|l| l.trim_end().ends_with("YES"))
        .unwrap_or(false);
    if !crc_ok {
        return Err(SensorError::Crc(id.to_string()));
    }
    lines
        .next()
        .and_then(|l| l.split("t=").nth(1))
        .and_then(|t| t.trim().parse::<i64>().ok())
        .map(|milli| milli as f64 / 1000.0)
        .ok_or_else(|| SensorError::Parse {
            sensor: id.to_string(),
            raw: raw.trim().to_string(),
        })
}
