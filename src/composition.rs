//! # Composition Planner
//!
//! Derives what the published image pair must show, without touching pixels.
//!
//! The plan names the source image, the crop and zoom windows, every overlay
//! (panels, text and the optional zoom outline) in total-image coordinates,
//! the optional blur region, whether the total/detail images need to be
//! refreshed at all, and whether the result is new for the collector.
//! [`crate::raster::Rasterizer`] executes it.
//!
//! ## Layout of the total image (W × H)
//! ```text
//! +-brand-+        +--station name--+         +-sun panel-+
//! |                                           | sunrise   |
//! |                                           | noon      |
//! |                                           | sunset    |
//! |                                                       |
//! +-UTC-+-EoT-+-EoL-+-LAT-+            +-------temps------+
//! ```

use crate::ephemeris::{Daylight, SolarDay};
use crate::params::{GeometryParams, PixelRect, Resolution, RunParameters};
use crate::sensors::Temperatures;
use crate::SceneState;
use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use std::path::PathBuf;

/// Gaussian radius of the blur region.
pub const BLUR_RADIUS: f32 = 5.0;

/// Per-cycle time facts, derived from the capture instant and the ephemeris.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingFacts {
    pub capture_at: DateTime<Utc>,
    /// EoT + EoL, seconds
    pub apparent_offset: f64,
    pub local_apparent: NaiveDateTime,
    pub eot_offset: f64,
    pub eol_offset: f64,
    pub noon: DateTime<Utc>,
    pub daylight: Daylight,
}

impl TimingFacts {
    pub fn new(capture_at: DateTime<Utc>, solar: &SolarDay) -> Self {
        let apparent_offset = solar.apparent_offset();
        let shift = Duration::milliseconds((apparent_offset * 1000.0).round() as i64);
        TimingFacts {
            capture_at,
            apparent_offset,
            local_apparent: (capture_at + shift).naive_utc(),
            eot_offset: solar.eot_offset,
            eol_offset: solar.eol_offset,
            noon: solar.noon,
            daylight: solar.daylight,
        }
    }

    /// `UTC: 20 Mar 2026 10:00:00`
    pub fn utc_label(&self) -> String {
        self.capture_at.format("UTC: %d %b %Y %H:%M:%S").to_string()
    }

    /// `LAT: 20 Mar 2026 11:41:48`
    pub fn lat_label(&self) -> String {
        self.local_apparent.format("LAT: %d %b %Y %H:%M:%S").to_string()
    }

    /// `EoT: +07:30` or `EoT:  -07:30`
    pub fn eot_label(&self) -> String {
        let (sign, secs) = split_sign(self.eot_offset);
        format!("EoT: {}{:02}:{:02}", sign, (secs / 60) % 60, secs % 60)
    }

    /// `EoL: +01:34:21` or `EoL:  -01:34:21`
    pub fn eol_label(&self) -> String {
        let (sign, secs) = split_sign(self.eol_offset);
        format!(
            "EoL: {}{:02}:{:02}:{:02}",
            sign,
            (secs / 3600) % 24,
            (secs / 60) % 60,
            secs % 60
        )
    }

    /// The four lines of the sun panel. Missing sunrise/sunset print dashes.
    pub fn sun_panel(&self) -> [String; 4] {
        let (rise, set) = match self.daylight {
            Daylight::Regular { sunrise, sunset } => (
                sunrise.format("%H:%M:%S").to_string(),
                sunset.format("%H:%M:%S").to_string(),
            ),
            Daylight::PolarDay | Daylight::PolarNight => {
                ("--:--:--".to_string(), "--:--:--".to_string())
            }
        };
        [
            "Today locals in UTC:".to_string(),
            format!("Sunrise  {}", rise),
            format!("Noon      {}", self.noon.format("%H:%M:%S")),
            format!("Sunset   {}", set),
        ]
    }

    /// Local apparent time as fractional hours, for zoom follow.
    pub fn apparent_hour(&self) -> f64 {
        let t = self.local_apparent.time();
        f64::from(t.num_seconds_from_midnight()) / 3600.0
    }
}

fn split_sign(seconds: f64) -> (&'static str, u64) {
    let whole = seconds.round();
    if whole < 0.0 {
        (" -", (-whole) as u64)
    } else {
        ("+", whole as u64)
    }
}

/// The image the composition starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceImage {
    Live,
    /// Camera offline placeholder
    Offline,
    /// Night placeholder
    CloudyNight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tint {
    White,
    Black,
    Gray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontSize {
    Small,
    Regular,
    Bold,
}

/// One drawing instruction on the total image, in paint order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlay {
    Panel {
        rect: PixelRect,
        tint: Tint,
    },
    Text {
        x: i32,
        y: i32,
        text: String,
        tint: Tint,
        font: FontSize,
    },
    Outline {
        rect: PixelRect,
        tint: Tint,
    },
}

/// Blur applied under a polygon mask. The mask is generated once into
/// `mask_path` and reused.
#[derive(Debug, Clone, PartialEq)]
pub struct BlurRegion {
    pub polygon: Vec<(i32, i32)>,
    pub radius: f32,
    pub mask_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderPlan {
    pub source: SourceImage,
    /// In sensor coordinates
    pub crop: PixelRect,
    /// In crop coordinates
    pub zoom: PixelRect,
    pub total_size: Resolution,
    pub detail_size: Resolution,
    pub blur: Option<BlurRegion>,
    pub overlays: Vec<Overlay>,
    pub refresh_total: bool,
    pub refresh_detail: bool,
    /// The collector has not seen this scene yet.
    pub publish: bool,
}

impl RenderPlan {
    pub fn needs_render(&self) -> bool {
        self.refresh_total || self.refresh_detail
    }
}

/// Events of this cycle that make the published images stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshTriggers {
    /// Scene changed since the last published pair (or nothing published yet).
    pub scene_changed: bool,
    pub dark_boundary: bool,
    pub offline_changed: bool,
}

impl RefreshTriggers {
    pub fn any(&self) -> bool {
        self.scene_changed || self.dark_boundary || self.offline_changed
    }
}

/// Everything the planner looks at.
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs<'a> {
    pub geometry: &'a GeometryParams,
    pub scene: SceneState,
    pub timing: &'a TimingFacts,
    pub run: &'a RunParameters,
    pub temperatures: &'a Temperatures,
    pub station_name: &'a str,
    pub brand: &'a str,
    pub blur: Option<&'a std::path::Path>,
    pub triggers: RefreshTriggers,
}

/// Build the render plan for one cycle.
///
/// Live frames are re-rendered locally on every lit cycle; placeholders only
/// change on an event. Either way the pair is published only on a scene
/// change, a dark boundary or an offline flip.
pub fn plan(inputs: PlanInputs<'_>) -> RenderPlan {
    let source = if inputs.run.cam_offline {
        SourceImage::Offline
    } else if inputs.scene == SceneState::Night {
        SourceImage::CloudyNight
    } else {
        SourceImage::Live
    };

    let publish = inputs.triggers.any();
    let refresh = source == SourceImage::Live || publish;

    let size = inputs.geometry.total_size;
    let blur = inputs.blur.map(|mask| BlurRegion {
        polygon: blur_polygon(size),
        radius: BLUR_RADIUS,
        mask_path: mask.to_path_buf(),
    });

    RenderPlan {
        source,
        crop: inputs.geometry.crop,
        zoom: inputs.geometry.zoom,
        total_size: size,
        detail_size: inputs.geometry.detail_size,
        blur,
        overlays: overlays(&inputs),
        refresh_total: refresh,
        refresh_detail: refresh,
        publish,
    }
}

/// Lower band of the total image that shows the accessible ground.
pub fn blur_polygon(size: Resolution) -> Vec<(i32, i32)> {
    let w = size.width as i32;
    let h = size.height as i32;
    vec![(2, h - 70), (w - 3, h - 130), (w - 3, h - 3), (2, h - 3)]
}

// -- Private Implementation --

fn rect(x1: i32, y1: i32, x2: i32, y2: i32) -> PixelRect {
    PixelRect {
        x: x1,
        y: y1,
        width: (x2 - x1 + 1).max(0) as u32,
        height: (y2 - y1 + 1).max(0) as u32,
    }
}

fn text(x: i32, y: i32, text: impl Into<String>, tint: Tint, font: FontSize) -> Overlay {
    Overlay::Text {
        x,
        y,
        text: text.into(),
        tint,
        font,
    }
}

fn panel(x1: i32, y1: i32, x2: i32, y2: i32, tint: Tint) -> Overlay {
    Overlay::Panel {
        rect: rect(x1, y1, x2, y2),
        tint,
    }
}

fn overlays(inputs: &PlanInputs<'_>) -> Vec<Overlay> {
    let w = inputs.geometry.total_size.width as i32;
    let h = inputs.geometry.total_size.height as i32;
    let timing = inputs.timing;
    let mut out = Vec::with_capacity(24);

    // 1. Brand mark
    out.push(panel(0, 0, 95, 14, Tint::Gray));
    out.push(text(2, 2, inputs.brand, Tint::White, FontSize::Small));

    // 2. Station name, centred
    let center = w / 2;
    let half = (inputs.station_name.chars().count() as i32 * 13) / 4;
    out.push(panel(center - half - 15, 2, center + half + 15, 20, Tint::White));
    out.push(text(center - half, 5, inputs.station_name, Tint::Black, FontSize::Bold));

    // 3. Sun panel, top right
    out.push(panel(w - 119, 2, w - 3, 78, Tint::White));
    let [title, rise, noon, set] = timing.sun_panel();
    out.push(text(w - 116, 6, title, Tint::Black, FontSize::Small));
    out.push(text(w - 111, 25, rise, Tint::Black, FontSize::Small));
    out.push(text(w - 111, 44, noon, Tint::Black, FontSize::Small));
    out.push(text(w - 111, 63, set, Tint::Black, FontSize::Small));

    // 4. Capture time panels, bottom left
    out.push(panel(2, h - 22, 160, h - 3, Tint::White));
    out.push(panel(163, h - 22, 240, h - 3, Tint::White));
    out.push(panel(243, h - 22, 334, h - 3, Tint::White));
    out.push(panel(337, h - 22, 494, h - 3, Tint::White));
    out.push(text(5, h - 18, timing.utc_label(), Tint::Black, FontSize::Regular));
    out.push(text(166, h - 18, timing.eot_label(), Tint::Black, FontSize::Regular));
    out.push(text(246, h - 18, timing.eol_label(), Tint::Black, FontSize::Regular));
    out.push(text(340, h - 18, timing.lat_label(), Tint::Black, FontSize::Regular));

    // 5. Temperatures, bottom right
    let temps = inputs.temperatures;
    out.push(panel(w - 269, h - 22, w - 3, h - 3, Tint::White));
    out.push(text(w - 265, h - 18, "Temp:", Tint::Black, FontSize::Small));
    out.push(text(
        w - 223,
        h - 18,
        format!("Out {}°C", temps.outside_label()),
        Tint::Black,
        FontSize::Small,
    ));
    out.push(text(
        w - 153,
        h - 18,
        format!("Case {}°C", temps.case_label()),
        Tint::Black,
        FontSize::Small,
    ));
    out.push(text(
        w - 75,
        h - 18,
        format!("CPU {}°C", temps.cpu_label()),
        Tint::Black,
        FontSize::Small,
    ));

    // 6. Zoom window outline
    if inputs.run.zoom_draw_rect {
        out.push(Overlay::Outline {
            rect: inputs.geometry.zoom_web,
            tint: Tint::White,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeris;
    use crate::params::GeometrySettings;
    use chrono::TimeZone;

    fn run() -> RunParameters {
        RunParameters {
            period_m: 1,
            ftp_upload: true,
            series: false,
            zoom_move: false,
            zoom_draw_rect: true,
            cam_offline: false,
            remote_control: false,
        }
    }

    fn timing() -> TimingFacts {
        let at = Utc.with_ymd_and_hms(2026, 3, 20, 10, 0, 0).unwrap();
        TimingFacts::new(at, &ephemeris::compute(at, 23.586, 46.758))
    }

    fn plan_for(scene: SceneState, run: &RunParameters, triggers: RefreshTriggers) -> RenderPlan {
        let geometry =
            GeometryParams::derive(&GeometrySettings::default(), Resolution::new(2592, 1944));
        let timing = timing();
        let temps = Temperatures::default();
        plan(PlanInputs {
            geometry: &geometry,
            scene,
            timing: &timing,
            run,
            temperatures: &temps,
            station_name: "Cluj-Napoca",
            brand: "sundial-cam",
            blur: None,
            triggers,
        })
    }

    #[test]
    fn labels_follow_the_published_formats() {
        let t = timing();
        assert_eq!(t.utc_label(), "UTC: 20 Mar 2026 10:00:00");
        assert!(t.eot_label().starts_with("EoT:  -"), "{}", t.eot_label());
        assert_eq!(t.eol_label(), "EoL: +01:34:21");
        assert!(t.lat_label().starts_with("LAT: 20 Mar 2026 11:"));
        assert_eq!(t.sun_panel()[0], "Today locals in UTC:");
        assert!(t.sun_panel()[2].starts_with("Noon      10:"));
    }

    #[test]
    fn negative_longitude_label_has_the_wide_sign() {
        let at = Utc.with_ymd_and_hms(2026, 11, 3, 12, 0, 0).unwrap();
        let t = TimingFacts::new(at, &ephemeris::compute(at, -15.0, 40.0));
        assert_eq!(t.eol_label(), "EoL:  -01:00:00");
        assert!(t.eot_label().starts_with("EoT: +16:"));
    }

    #[test]
    fn apparent_time_adds_both_offsets() {
        let t = timing();
        let expected = t.capture_at
            + Duration::milliseconds(((t.eot_offset + t.eol_offset) * 1000.0).round() as i64);
        assert_eq!(t.local_apparent, expected.naive_utc());
        assert!((t.apparent_hour() - 11.45).abs() < 0.1);
    }

    #[test]
    fn source_image_selection() {
        let none = RefreshTriggers::default();
        assert_eq!(plan_for(SceneState::Sunny, &run(), none).source, SourceImage::Live);
        assert_eq!(
            plan_for(SceneState::Night, &run(), none).source,
            SourceImage::CloudyNight
        );
        let offline = RunParameters {
            cam_offline: true,
            ..run()
        };
        assert_eq!(plan_for(SceneState::Sunny, &offline, none).source, SourceImage::Offline);
        assert_eq!(plan_for(SceneState::Night, &offline, none).source, SourceImage::Offline);
    }

    #[test]
    fn placeholders_refresh_only_on_events() {
        let none = RefreshTriggers::default();
        let cloudy = plan_for(SceneState::Cloudy, &run(), none);
        assert!(cloudy.needs_render());
        assert!(!cloudy.publish);
        assert!(!plan_for(SceneState::Night, &run(), none).needs_render());

        let boundary = RefreshTriggers {
            dark_boundary: true,
            ..none
        };
        let night = plan_for(SceneState::Night, &run(), boundary);
        assert!(night.refresh_total && night.refresh_detail);
        assert!(night.publish);

        let offline = RunParameters {
            cam_offline: true,
            ..run()
        };
        assert!(!plan_for(SceneState::Sunny, &offline, none).needs_render());
        let flipped = RefreshTriggers {
            offline_changed: true,
            ..none
        };
        assert!(plan_for(SceneState::Sunny, &offline, flipped).needs_render());
    }

    #[test]
    fn lit_frames_are_published_only_on_a_scene_change() {
        let none = RefreshTriggers::default();
        assert!(!plan_for(SceneState::Sunny, &run(), none).publish);

        let changed = RefreshTriggers {
            scene_changed: true,
            ..none
        };
        let sunny = plan_for(SceneState::Sunny, &run(), changed);
        assert!(sunny.publish && sunny.refresh_total && sunny.refresh_detail);
    }

    #[test]
    fn overlays_cover_every_panel() {
        let plan = plan_for(SceneState::Sunny, &run(), RefreshTriggers::default());
        let texts: Vec<&str> = plan
            .overlays
            .iter()
            .filter_map(|o| match o {
                Overlay::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(texts.contains(&"sundial-cam"));
        assert!(texts.contains(&"Cluj-Napoca"));
        assert!(texts.contains(&"Temp:"));
        assert!(texts.contains(&"Out TT.T°C"));
        assert!(texts.iter().any(|t| t.starts_with("UTC: ")));
        assert!(texts.iter().any(|t| t.starts_with("Sunset   ")));
        assert!(matches!(plan.overlays.last(), Some(Overlay::Outline { .. })));

        let no_rect = RunParameters {
            zoom_draw_rect: false,
            ..run()
        };
        let plan = plan_for(SceneState::Sunny, &no_rect, RefreshTriggers::default());
        assert!(!plan.overlays.iter().any(|o| matches!(o, Overlay::Outline { .. })));
    }

    #[test]
    fn blur_polygon_hugs_the_bottom_edge() {
        let poly = blur_polygon(Resolution::new(800, 400));
        assert_eq!(poly, vec![(2, 330), (797, 270), (797, 397), (2, 397)]);
    }
}
