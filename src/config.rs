//! # Configuration Management
//!
//! Persisted station state, stored as TOML next to the binary (paths are
//! configurable). Four files are involved:
//!
//! - `station.toml`: operating parameters, see [`Config`]
//! - `stationinfo.toml`: who and where the station is, see [`StationInfoFile`]
//! - `status.toml`: rewritten every cycle by [`crate::status`]
//! - `remotecmd.toml`: the last remote command, see [`RemoteCommandFile`]
//!
//! Missing files are created from defaults. A file that exists but does not
//! parse is left alone and the defaults are used for this run.

use crate::brightness::Thresholds;
use crate::ephemeris::Horizon;
use crate::params::{GeometrySettings, RemoteCommand};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors reading or writing persisted state.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialize: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("config is not UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
}

/// Station operating parameters (`station.toml`).
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub header: HeaderConfig,
    pub transport: TransportConfig,
    pub geometry: GeometrySettings,
    pub operational: OperationalConfig,
    pub dial: DialPoints,
    pub classifier: Thresholds,
    pub schedule: ScheduleConfig,
    pub camera: CameraConfig,
    pub overlay: OverlayConfig,
    pub paths: PathsConfig,
}

/// Station identity shared by every artifact sent to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HeaderConfig {
    pub id_name: String,
    pub id_no: String,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        HeaderConfig {
            id_name: "idname".to_string(),
            id_no: "idno".to_string(),
        }
    }
}

/// Remote collector endpoints. The file-transfer fields and the
/// request/response fields are both kept; `operational.ftp_upload` picks one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Request/response endpoint
    pub url: String,
    /// Sent as `x-functions-key`
    pub api_key: String,
    /// Upper bound for any single network operation
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: "host".to_string(),
            port: 21,
            user: "user".to_string(),
            password: "password".to_string(),
            url: "http://localhost:7071/api/transfer-images".to_string(),
            api_key: String::new(),
            timeout_secs: 10,
        }
    }
}

/// Operational switches. Several of them can be overridden remotely, see
/// [`crate::params::RunParameters`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct OperationalConfig {
    /// Capture period in minutes (0 = 30 s, capped at 15 min)
    pub period_m: u32,
    /// true: file-transfer session, false: request/response
    pub ftp_upload: bool,
    /// Reserved for a live stream; persisted but not acted on
    pub stream: bool,
    /// Archive status lines and daylight images locally
    pub series: bool,
    /// Let the zoom window follow the expected shadow
    pub zoom_move: bool,
    /// Outline the zoom window on the total image
    pub zoom_draw_rect: bool,
    /// Publish the offline placeholder instead of the live image
    pub cam_offline: bool,
    /// Accept remote commands
    pub remote_cmd: bool,
    /// Blur the lower (accessible) part of the total image
    pub blur: bool,
}

impl Default for OperationalConfig {
    fn default() -> Self {
        OperationalConfig {
            period_m: 1,
            ftp_upload: true,
            stream: false,
            series: false,
            zoom_move: false,
            zoom_draw_rect: true,
            cam_offline: false,
            remote_cmd: false,
            blur: false,
        }
    }
}

/// A point on the dial in sensor pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DialPoint {
    pub x: i32,
    pub y: i32,
}

/// Reference points on the dial face, used by zoom follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DialPoints {
    /// Winter-solstice noon
    pub w12: DialPoint,
    /// Summer-solstice noon
    pub s12: DialPoint,
    /// Equinox 09:00
    pub e09: DialPoint,
    /// Equinox 15:00
    pub e15: DialPoint,
}

impl Default for DialPoints {
    fn default() -> Self {
        DialPoints {
            w12: DialPoint { x: 1268, y: 627 },
            s12: DialPoint { x: 1276, y: 937 },
            e09: DialPoint { x: 957, y: 752 },
            e15: DialPoint { x: 1458, y: 700 },
        }
    }
}

/// Timing knobs of the capture scheduler.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub warmup_secs: u64,
    /// Captures land on multiples of this many seconds
    pub align_secs: u64,
    /// Start this early so the still lands on the mark
    pub prolog_ms: u64,
    /// Wake this long before the next mark
    pub wake_ahead_secs: u64,
    /// Half-width of the accelerated window around solar noon
    pub noon_window_mins: i64,
    /// Cycles longer than this are reported
    pub max_cycle_secs: u64,
    /// Period used when the sun neither rises nor sets
    pub polar_period_secs: u64,
    pub horizon: Horizon,
    /// Run after the sunset termination
    pub power_down_command: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            warmup_secs: 30,
            align_secs: 30,
            prolog_ms: 3_100,
            wake_ahead_secs: 10,
            noon_window_mins: 15,
            max_cycle_secs: 20,
            polar_period_secs: 300,
            horizon: Horizon::Standard,
            power_down_command: vec!["sudo".to_string(), "halt".to_string()],
        }
    }
}

/// Camera command and optional resolution override.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CameraConfig {
    pub command: String,
    /// Auto-exposure settle time before the still
    pub settle_ms: u64,
    /// Overrides the resolution reported by the camera
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            command: "libcamera-still".to_string(),
            settle_ms: 1_000,
            width: None,
            height: None,
        }
    }
}

/// Text drawn on the total image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub brand: String,
    pub jpeg_quality: u8,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            brand: "sundial-cam".to_string(),
            jpeg_quality: 85,
        }
    }
}

/// Where everything lives. Volatile files default to a RAM disk.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub live_image: PathBuf,
    pub live_metadata: PathBuf,
    pub total_image: PathBuf,
    pub detail_image: PathBuf,
    pub mask_image: PathBuf,
    pub offline_image: PathBuf,
    pub cloudy_night_image: PathBuf,
    pub station_info: PathBuf,
    pub status: PathBuf,
    pub remote_cmd: PathBuf,
    pub archive_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            live_image: "/mnt/ramdisk/imgLive.jpg".into(),
            live_metadata: "/mnt/ramdisk/imgLive.json".into(),
            total_image: "/mnt/ramdisk/imgTotal.jpg".into(),
            detail_image: "/mnt/ramdisk/imgDetail.jpg".into(),
            mask_image: "/mnt/ramdisk/imgMask.png".into(),
            offline_image: "imgCamOffLine.jpg".into(),
            cloudy_night_image: "imgCloudyNight.jpg".into(),
            station_info: "stationinfo.toml".into(),
            status: "/mnt/ramdisk/status.toml".into(),
            remote_cmd: "/mnt/ramdisk/remotecmd.toml".into(),
            archive_dir: "archive".into(),
            log_dir: "logs".into(),
        }
    }
}

impl Config {
    /// Load configuration from the specified path.
    ///
    /// Writes the defaults if the file does not exist yet; falls back to the
    /// defaults (without touching the file) if it cannot be parsed.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let config: Config = load_or_create(path.as_ref());
        info!(
            "Loaded configuration for station {} ({})",
            config.header.id_name, config.header.id_no
        );
        config
    }

    /// Read the configuration without side effects: nothing is written or
    /// logged, and any failure yields the defaults. Used before logging is up.
    pub fn peek<P: AsRef<Path>>(path: P) -> Self {
        read_toml(path.as_ref()).unwrap_or_default()
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        write_toml(path.as_ref(), self)
    }
}

/// Who and where the station is (`stationinfo.toml`).
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StationInfoFile {
    pub header: HeaderConfig,
    pub info: StationInfo,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StationInfo {
    pub name: String,
    pub location: String,
    /// Degrees, north positive
    pub latitude: f64,
    /// Degrees, east positive
    pub longitude: f64,
    pub type_webcam: String,
    pub type_transfer: String,
    pub text: String,
    pub website: String,
    pub team: String,
    pub nearby_public_inst: String,
    pub organization: String,
}

impl Default for StationInfo {
    fn default() -> Self {
        StationInfo {
            name: "Name".to_string(),
            location: "Location".to_string(),
            latitude: 45.0,
            longitude: 0.0,
            type_webcam: "RaspberryPI+Cam".to_string(),
            type_transfer: "RaspberryPI".to_string(),
            text: "Text".to_string(),
            website: "Website".to_string(),
            team: "Team".to_string(),
            nearby_public_inst: "NearbyPublicInst".to_string(),
            organization: "Organization".to_string(),
        }
    }
}

impl StationInfoFile {
    /// Load the station info, creating it from defaults (with the station
    /// header) if it does not exist.
    pub fn load_or_create<P: AsRef<Path>>(path: P, header: &HeaderConfig) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            let fresh = StationInfoFile {
                header: header.clone(),
                info: StationInfo::default(),
            };
            if let Err(e) = write_toml(path, &fresh) {
                warn!("Could not write station info {}: {}", path.display(), e);
            }
            return fresh;
        }
        load_or_create(path)
    }
}

/// Immutable per-deployment facts, fixed at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct StationProfile {
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
    pub id_name: String,
    pub id_no: String,
}

impl From<&StationInfoFile> for StationProfile {
    fn from(file: &StationInfoFile) -> Self {
        StationProfile {
            latitude: file.info.latitude,
            longitude: file.info.longitude,
            name: file.info.name.clone(),
            id_name: file.header.id_name.clone(),
            id_no: file.header.id_no.clone(),
        }
    }
}

/// On-disk remote command (`remotecmd.toml`). Section and key names match the
/// collector's INI file, which is also valid TOML.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RemoteCommandFile {
    #[serde(rename = "Command")]
    pub command: RemoteCommandSection,
    #[serde(rename = "Detail")]
    pub detail: RemoteDetailSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RemoteCommandSection {
    pub camoffline: u8,
    pub periodm: u32,
    pub series: u8,
    pub zoommove: u8,
    pub zoomdrawrect: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RemoteDetailSection {
    pub zoomcentpercx: i32,
    pub zoomcentpercy: i32,
}

impl From<&RemoteCommand> for RemoteCommandFile {
    fn from(cmd: &RemoteCommand) -> Self {
        RemoteCommandFile {
            command: RemoteCommandSection {
                camoffline: cmd.cam_offline.into(),
                periodm: cmd.period_m,
                series: cmd.series.into(),
                zoommove: cmd.zoom_move.into(),
                zoomdrawrect: cmd.zoom_draw_rect.into(),
            },
            detail: RemoteDetailSection {
                zoomcentpercx: cmd.zoom_center_perc_x,
                zoomcentpercy: cmd.zoom_center_perc_y,
            },
        }
    }
}

impl From<RemoteCommandFile> for RemoteCommand {
    fn from(file: RemoteCommandFile) -> Self {
        RemoteCommand {
            cam_offline: file.command.camoffline != 0,
            period_m: file.command.periodm,
            series: file.command.series != 0,
            zoom_move: file.command.zoommove != 0,
            zoom_draw_rect: file.command.zoomdrawrect != 0,
            zoom_center_perc_x: file.detail.zoomcentpercx,
            zoom_center_perc_y: file.detail.zoomcentpercy,
        }
    }
}

/// Parse a remote command as fetched from the collector.
pub fn parse_remote_command(bytes: &[u8]) -> Result<RemoteCommand, ConfigError> {
    let text = std::str::from_utf8(bytes)?;
    let file: RemoteCommandFile = toml::from_str(text)?;
    Ok(file.into())
}

/// Read the locally cached command.
pub fn load_remote_command<P: AsRef<Path>>(path: P) -> Result<RemoteCommand, ConfigError> {
    parse_remote_command(&fs::read(path.as_ref())?)
}

/// Cache the last accepted command locally.
pub fn save_remote_command<P: AsRef<Path>>(path: P, cmd: &RemoteCommand) -> Result<(), ConfigError> {
    write_toml(path.as_ref(), &RemoteCommandFile::from(cmd))
}

/// Read any TOML document.
pub fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

/// Write a TOML document via a sibling temp file and rename, so readers never
/// see a half-written file.
pub fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let contents = toml::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

fn load_or_create<T: DeserializeOwned + Serialize + Default>(path: &Path) -> T {
    if !path.exists() {
        info!("No {} found, writing defaults", path.display());
        let fresh = T::default();
        if let Err(e) = write_toml(path, &fresh) {
            warn!("Could not write {}: {}", path.display(), e);
        }
        return fresh;
    }
    match read_toml(path) {
        Ok(value) => value,
        Err(e) => {
            warn!("Invalid file {}: {}", path.display(), e);
            warn!("Using defaults for this run");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.operational.period_m, 1);
        assert!(config.operational.ftp_upload);
        assert!(!config.operational.remote_cmd);
        assert_eq!(config.classifier.dark, 3_300);
        assert_eq!(config.schedule.warmup_secs, 30);
        assert_eq!(config.transport.timeout_secs, 10);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("station.toml");

        let config = Config::load_from_path(&path);
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_invalid_file_falls_back_without_overwriting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("station.toml");
        fs::write(&path, "this is = = not toml").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config, Config::default());
        assert_eq!(fs::read_to_string(&path).unwrap(), "this is = = not toml");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("station.toml");
        fs::write(&path, "[operational]\nperiod_m = 7\nremote_cmd = true\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.operational.period_m, 7);
        assert!(config.operational.remote_cmd);
        assert!(config.operational.zoom_draw_rect);
        assert_eq!(config.geometry, GeometrySettings::default());
    }

    #[test]
    fn test_peek_reads_without_creating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("station.toml");

        assert_eq!(Config::peek(&path), Config::default());
        assert!(!path.exists());

        fs::write(&path, "[paths]\nlog_dir = \"/tmp/sdc-logs\"\n").unwrap();
        assert_eq!(Config::peek(&path).paths.log_dir, PathBuf::from("/tmp/sdc-logs"));
    }

    #[test]
    fn test_remote_command_from_collector_ini() {
        let ini = b"[Command]\ncamoffline = 1\nperiodm = 5\nseries = 0\nzoommove = 1\nzoomdrawrect = 0\n\n[Detail]\nzoomcentpercx = -12\nzoomcentpercy = 8\n";
        let cmd = parse_remote_command(ini).unwrap();
        assert!(cmd.cam_offline);
        assert_eq!(cmd.period_m, 5);
        assert!(!cmd.series);
        assert!(cmd.zoom_move);
        assert!(!cmd.zoom_draw_rect);
        assert_eq!((cmd.zoom_center_perc_x, cmd.zoom_center_perc_y), (-12, 8));

        assert!(parse_remote_command(b"<html>404</html>").is_err());
    }

    #[test]
    fn test_remote_command_cache_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("remotecmd.toml");
        let cmd = RemoteCommand {
            cam_offline: false,
            period_m: 3,
            series: true,
            zoom_move: false,
            zoom_draw_rect: true,
            zoom_center_perc_x: 4,
            zoom_center_perc_y: -4,
        };
        save_remote_command(&path, &cmd).unwrap();
        assert_eq!(load_remote_command(&path).unwrap(), cmd);
        assert!(load_remote_command(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_station_info_created_with_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stationinfo.toml");
        let header = HeaderConfig {
            id_name: "ROCLUJ".to_string(),
            id_no: "RO001".to_string(),
        };

        let info = StationInfoFile::load_or_create(&path, &header);
        assert_eq!(info.header, header);
        assert!(path.exists());

        let profile = StationProfile::from(&info);
        assert_eq!(profile.id_no, "RO001");
        assert_eq!(profile.latitude, 45.0);
    }
}
