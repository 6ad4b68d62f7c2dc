//! # Parameter Store
//!
//! Validated view of the persisted station parameters.
//!
//! Every crop/zoom value has a documented `[min, max]`. Out-of-range values
//! are clamped to the nearest bound on load, reported as [`OutOfRange`], and
//! written back before anything uses them.
//!
//! The store is the only writer of `station.toml`. Remote commands are merged
//! at a single point per cycle ([`ParameterStore::apply_cycle`]).

use crate::config::{self, Config, ConfigError, DialPoint, DialPoints};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A persisted value outside its documented range.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field} = {value} is outside [{min}, {max}], clamped to {clamped}")]
pub struct OutOfRange {
    pub field: &'static str,
    pub value: i32,
    pub min: i32,
    pub max: i32,
    pub clamped: i32,
}

/// Percentage and size parameters of the crop and zoom windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GeometrySettings {
    /// Crop width as a share of the sensor width
    pub crop_perc: i32,
    /// Crop height as a share of the crop width
    pub crop_aspect_perc: i32,
    pub crop_center_perc_x: i32,
    pub crop_center_perc_y: i32,
    /// Width of the published total image
    pub crop_web_width: i32,
    /// Zoom width as a share of the crop width
    pub zoom_perc: i32,
    pub zoom_aspect_perc: i32,
    pub zoom_center_perc_x: i32,
    pub zoom_center_perc_y: i32,
    /// Width of the published detail image
    pub zoom_web_width: i32,
}

impl Default for GeometrySettings {
    fn default() -> Self {
        GeometrySettings {
            crop_perc: 70,
            crop_aspect_perc: 50,
            crop_center_perc_x: 0,
            crop_center_perc_y: 0,
            crop_web_width: 800,
            zoom_perc: 22,
            zoom_aspect_perc: 75,
            zoom_center_perc_x: 0,
            zoom_center_perc_y: 0,
            zoom_web_width: 400,
        }
    }
}

pub const CROP_PERC: (i32, i32) = (25, 100);
pub const CROP_ASPECT_PERC: (i32, i32) = (40, 150);
pub const CROP_CENTER_PERC: (i32, i32) = (-30, 30);
pub const CROP_WEB_WIDTH: (i32, i32) = (400, 800);
pub const ZOOM_PERC: (i32, i32) = (15, 50);
pub const ZOOM_ASPECT_PERC: (i32, i32) = (50, 200);
pub const ZOOM_CENTER_PERC: (i32, i32) = (-40, 40);
pub const ZOOM_WEB_WIDTH: (i32, i32) = (300, 500);

impl GeometrySettings {
    /// Clamp every field into its bounds. An empty result means nothing
    /// changed.
    pub fn clamp(&mut self) -> Vec<OutOfRange> {
        let mut report = Vec::new();
        let fields: [(&'static str, &mut i32, (i32, i32)); 10] = [
            ("crop_perc", &mut self.crop_perc, CROP_PERC),
            ("crop_aspect_perc", &mut self.crop_aspect_perc, CROP_ASPECT_PERC),
            ("crop_center_perc_x", &mut self.crop_center_perc_x, CROP_CENTER_PERC),
            ("crop_center_perc_y", &mut self.crop_center_perc_y, CROP_CENTER_PERC),
            ("crop_web_width", &mut self.crop_web_width, CROP_WEB_WIDTH),
            ("zoom_perc", &mut self.zoom_perc, ZOOM_PERC),
            ("zoom_aspect_perc", &mut self.zoom_aspect_perc, ZOOM_ASPECT_PERC),
            ("zoom_center_perc_x", &mut self.zoom_center_perc_x, ZOOM_CENTER_PERC),
            ("zoom_center_perc_y", &mut self.zoom_center_perc_y, ZOOM_CENTER_PERC),
            ("zoom_web_width", &mut self.zoom_web_width, ZOOM_WEB_WIDTH),
        ];
        for (field, value, (min, max)) in fields {
            let clamped = (*value).clamp(min, max);
            if clamped != *value {
                report.push(OutOfRange {
                    field,
                    value: *value,
                    min,
                    max,
                    clamped,
                });
                *value = clamped;
            }
        }
        report
    }

    /// Point the zoom window at the expected shadow tip for the given local
    /// apparent hour and solar declination.
    ///
    /// The noon point moves between the winter (`W12`) and summer (`S12`)
    /// dial points with the declination; the target then moves piecewise
    /// linearly E09 → noon → E15 between 09:00 and 15:00 and holds outside
    /// that range.
    pub fn follow_shadow(
        &self,
        dial: &DialPoints,
        sensor: Resolution,
        apparent_hour: f64,
        declination_deg: f64,
    ) -> GeometrySettings {
        let season = ((declination_deg + 23.44) / 46.88).clamp(0.0, 1.0);
        let noon = lerp(dial.w12, dial.s12, season);
        let e09 = (f64::from(dial.e09.x), f64::from(dial.e09.y));
        let e15 = (f64::from(dial.e15.x), f64::from(dial.e15.y));

        let (tx, ty) = if apparent_hour <= 9.0 {
            e09
        } else if apparent_hour < 12.0 {
            lerp_f(e09, noon, (apparent_hour - 9.0) / 3.0)
        } else if apparent_hour < 15.0 {
            lerp_f(noon, e15, (apparent_hour - 12.0) / 3.0)
        } else {
            e15
        };

        let crop = GeometryParams::derive(self, sensor).crop;
        let to_perc = |t: f64, origin: i32, size: u32| -> i32 {
            ((t - f64::from(origin)) / f64::from(size.max(1)) * 100.0 - 50.0).round() as i32
        };

        let mut moved = *self;
        moved.zoom_center_perc_x =
            to_perc(tx, crop.x, crop.width).clamp(ZOOM_CENTER_PERC.0, ZOOM_CENTER_PERC.1);
        moved.zoom_center_perc_y =
            to_perc(ty, crop.y, crop.height).clamp(ZOOM_CENTER_PERC.0, ZOOM_CENTER_PERC.1);
        moved
    }
}

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }
}

/// An axis-aligned rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    /// Whether `other` lies completely inside `self`'s extent when both are
    /// expressed in `self`'s coordinate system.
    pub fn contains_local(&self, other: &PixelRect) -> bool {
        other.x >= 0
            && other.y >= 0
            && other.right() <= self.width as i32
            && other.bottom() <= self.height as i32
    }
}

/// Pixel rectangles derived from [`GeometrySettings`] and the sensor size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryParams {
    pub sensor: Resolution,
    /// In sensor coordinates
    pub crop: PixelRect,
    /// In crop coordinates
    pub zoom: PixelRect,
    /// The zoom window in total-image coordinates
    pub zoom_web: PixelRect,
    pub total_size: Resolution,
    pub detail_size: Resolution,
}

impl GeometryParams {
    /// Derive pixel rectangles. `settings` must already be clamped.
    ///
    /// The crop is kept inside the sensor. The zoom window is sized from the
    /// crop and, if its centre offset pushes it past the crop edge, shifted
    /// back inside without changing its size.
    pub fn derive(settings: &GeometrySettings, sensor: Resolution) -> Self {
        let sw = i64::from(sensor.width.max(1));
        let sh = i64::from(sensor.height.max(1));

        // 1. Crop window
        let crop_w = (sw * i64::from(settings.crop_perc) / 100).clamp(1, sw);
        let crop_natural_h = crop_w * i64::from(settings.crop_aspect_perc) / 100;
        let crop_h = crop_natural_h.clamp(1, sh);
        let crop_x = ((sw - crop_w) / 2 - sw * i64::from(settings.crop_center_perc_x) / 100)
            .clamp(0, sw - crop_w);
        let crop_y = ((sh - crop_h) / 2 - sh * i64::from(settings.crop_center_perc_y) / 100)
            .clamp(0, sh - crop_h);

        // 2. Zoom window inside the crop
        let zoom_w = (crop_w * i64::from(settings.zoom_perc) / 100).clamp(1, crop_w);
        let zoom_natural_h = zoom_w * i64::from(settings.zoom_aspect_perc) / 100;
        let zoom_h = zoom_natural_h.clamp(1, crop_h);
        let center_x = crop_w * i64::from(50 + settings.zoom_center_perc_x) / 100;
        let center_y = crop_h * i64::from(50 + settings.zoom_center_perc_y) / 100;
        let zoom_x = shift_inside(center_x - zoom_w / 2, zoom_w, crop_w);
        let zoom_y = shift_inside(center_y - zoom_h / 2, zoom_h, crop_h);

        // 3. Published sizes, keeping the aspect of a window cut short above
        let total_w = i64::from(settings.crop_web_width);
        let total_h =
            published_height(total_w, settings.crop_aspect_perc, crop_w, crop_h, crop_natural_h);
        let detail_w = i64::from(settings.zoom_web_width);
        let detail_h =
            published_height(detail_w, settings.zoom_aspect_perc, zoom_w, zoom_h, zoom_natural_h);

        let zoom_web = PixelRect {
            x: (zoom_x * total_w / crop_w) as i32,
            y: (zoom_y * total_h / crop_h) as i32,
            width: (zoom_w * total_w / crop_w) as u32,
            height: (zoom_h * total_h / crop_h) as u32,
        };

        GeometryParams {
            sensor,
            crop: PixelRect {
                x: crop_x as i32,
                y: crop_y as i32,
                width: crop_w as u32,
                height: crop_h as u32,
            },
            zoom: PixelRect {
                x: zoom_x as i32,
                y: zoom_y as i32,
                width: zoom_w as u32,
                height: zoom_h as u32,
            },
            zoom_web,
            total_size: Resolution::new(total_w as u32, total_h as u32),
            detail_size: Resolution::new(detail_w as u32, detail_h as u32),
        }
    }
}

/// Operational knobs in force for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParameters {
    pub period_m: u32,
    pub ftp_upload: bool,
    pub series: bool,
    pub zoom_move: bool,
    pub zoom_draw_rect: bool,
    pub cam_offline: bool,
    pub remote_control: bool,
}

impl RunParameters {
    /// Merge a remote command over these local values. Only applies while
    /// remote control is enabled locally.
    pub fn effective(&self, remote: Option<&RemoteCommand>) -> RunParameters {
        match remote {
            Some(cmd) if self.remote_control => RunParameters {
                period_m: cmd.period_m,
                series: cmd.series,
                zoom_move: cmd.zoom_move,
                zoom_draw_rect: cmd.zoom_draw_rect,
                cam_offline: cmd.cam_offline,
                ..*self
            },
            _ => *self,
        }
    }
}

/// Operator override fetched from the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteCommand {
    pub cam_offline: bool,
    pub period_m: u32,
    pub series: bool,
    pub zoom_move: bool,
    pub zoom_draw_rect: bool,
    pub zoom_center_perc_x: i32,
    pub zoom_center_perc_y: i32,
}

/// Owner of `station.toml`.
#[derive(Debug)]
pub struct ParameterStore {
    path: PathBuf,
    config: Config,
    remote: Option<RemoteCommand>,
    needs_persist: bool,
}

impl ParameterStore {
    /// Load (or create) the station file, clamp it and write back any
    /// corrections.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let config = Config::load_from_path(&path);
        let mut store = Self::from_config(config, path);
        store.persist_if_needed();
        store
    }

    /// Wrap an already loaded config. Clamps but does not write.
    pub fn from_config<P: Into<PathBuf>>(config: Config, path: P) -> Self {
        let mut store = ParameterStore {
            path: path.into(),
            config,
            remote: None,
            needs_persist: false,
        };
        store.clamp();
        store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn needs_persist(&self) -> bool {
        self.needs_persist
    }

    /// The last accepted remote command, if any.
    pub fn remote(&self) -> Option<&RemoteCommand> {
        self.remote.as_ref()
    }

    /// Local values as persisted.
    pub fn local(&self) -> RunParameters {
        let op = &self.config.operational;
        RunParameters {
            period_m: op.period_m,
            ftp_upload: op.ftp_upload,
            series: op.series,
            zoom_move: op.zoom_move,
            zoom_draw_rect: op.zoom_draw_rect,
            cam_offline: op.cam_offline,
            remote_control: op.remote_cmd,
        }
    }

    /// Values in force this cycle.
    pub fn effective(&self) -> RunParameters {
        self.local().effective(self.remote.as_ref())
    }

    pub fn geometry(&self) -> GeometrySettings {
        self.config.geometry
    }

    /// Accept a remote command. Returns whether it had any effect.
    ///
    /// Period and zoom centre are merged into the persisted config; the
    /// command is kept so [`Self::effective`] can overlay the other flags.
    pub fn accept_remote(&mut self, cmd: RemoteCommand) -> bool {
        if !self.config.operational.remote_cmd {
            debug!("Remote control disabled, ignoring remote command");
            return false;
        }
        let op = &mut self.config.operational;
        let geometry = &mut self.config.geometry;
        let changed = op.period_m != cmd.period_m
            || geometry.zoom_center_perc_x != cmd.zoom_center_perc_x
            || geometry.zoom_center_perc_y != cmd.zoom_center_perc_y;
        op.period_m = cmd.period_m;
        geometry.zoom_center_perc_x = cmd.zoom_center_perc_x;
        geometry.zoom_center_perc_y = cmd.zoom_center_perc_y;

        if self.remote != Some(cmd) {
            info!(
                "Remote command accepted: period {} min, offline {}, series {}, zoom move {}",
                cmd.period_m, cmd.cam_offline, cmd.series, cmd.zoom_move
            );
        }
        self.remote = Some(cmd);
        self.needs_persist |= changed;
        self.clamp();
        true
    }

    /// The per-cycle mutation point: pick up operator edits from disk, merge
    /// the remote command (if any) and persist.
    pub fn apply_cycle(&mut self, command: Option<RemoteCommand>) -> Result<bool, ConfigError> {
        self.reload();
        let applied = match command {
            Some(cmd) => self.accept_remote(cmd),
            None => false,
        };
        if self.needs_persist {
            self.persist()?;
        }
        Ok(applied)
    }

    /// Write the config back and clear the persist flag.
    pub fn persist(&mut self) -> Result<(), ConfigError> {
        self.config.save_to_path(&self.path)?;
        self.needs_persist = false;
        debug!("Persisted {}", self.path.display());
        Ok(())
    }

    // -- Private Implementation --

    fn clamp(&mut self) {
        let report = self.config.geometry.clamp();
        for out in &report {
            warn!("Config out of range: {}", out);
        }
        self.needs_persist |= !report.is_empty();
    }

    fn reload(&mut self) {
        match config::read_toml::<Config>(&self.path) {
            Ok(fresh) if fresh != self.config => {
                debug!("Station file changed on disk, reloading");
                self.config = fresh;
                self.clamp();
            }
            Ok(_) => {}
            Err(e) => debug!("Keeping in-memory parameters: {}", e),
        }
    }

    fn persist_if_needed(&mut self) {
        if self.needs_persist {
            if let Err(e) = self.persist() {
                warn!("Could not persist corrected parameters: {}", e);
            }
        }
    }
}

fn published_height(width: i64, aspect_perc: i32, w: i64, h: i64, natural_h: i64) -> i64 {
    if h < natural_h {
        (width * h / w).max(1)
    } else {
        width * i64::from(aspect_perc) / 100
    }
}

fn shift_inside(origin: i64, size: i64, extent: i64) -> i64 {
    if origin < 0 {
        0
    } else if origin + size > extent {
        extent - size
    } else {
        origin
    }
}

fn lerp(a: DialPoint, b: DialPoint, t: f64) -> (f64, f64) {
    lerp_f(
        (f64::from(a.x), f64::from(a.y)),
        (f64::from(b.x), f64::from(b.y)),
        t,
    )
}

fn lerp_f(a: (f64, f64), b: (f64, f64), t: f64) -> (f64, f64) {
    (a.0 + (b.0 - a.0) * t, a.1 + (b.1 - a.1) * t)
}
