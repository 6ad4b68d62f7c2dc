//! # Solar Ephemeris
//!
//! Low-precision solar geometry for a single sundial station, after the NOAA
//! solar calculator (Meeus, *Astronomical Algorithms*, ch. 25 and 28).
//!
//! ## What it provides
//! - **Equation of Time (EoT)**: apparent minus mean solar time, in seconds.
//!   Evaluated from the continuous Julian century, never from a day index, so
//!   two evaluations one second apart differ by milliseconds at most.
//! - **Equation of Longitude (EoL)**: `longitude * 240 s`, positive east of
//!   Greenwich. Local apparent time is `UTC + EoT + EoL`.
//! - **Solar noon, sunrise, sunset** for the UTC date of the given instant.
//!   Sunrise/sunset use the standard horizon (-0.833°) unless another
//!   [`Horizon`] is requested.
//!
//! Accuracy is well under a minute for sunrise/sunset and a few seconds for
//! EoT between 1950 and 2050, which is plenty for time correction of a single
//! station.
//!
//! Polar days and nights do not raise: [`SolarDay::daylight`] reports
//! [`Daylight::PolarDay`] or [`Daylight::PolarNight`] and callers decide.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Julian day of 1970-01-01T00:00:00Z.
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
/// Julian day of J2000.0.
const J2000_JD: f64 = 2_451_545.0;
/// One degree of longitude is four minutes of time.
pub const SECONDS_PER_DEGREE: f64 = 240.0;

/// Solar altitude convention used for sunrise and sunset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    /// Upper limb on the horizon with standard refraction (-0.833°).
    #[default]
    Standard,
    /// Civil twilight (-6°).
    Civil,
    /// Nautical twilight (-12°).
    Nautical,
}

impl Horizon {
    /// Solar altitude in degrees at which the sun counts as risen.
    pub fn altitude_deg(self) -> f64 {
        match self {
            Horizon::Standard => -0.833,
            Horizon::Civil => -6.0,
            Horizon::Nautical => -12.0,
        }
    }
}

/// Sunrise and sunset for a day, or the polar sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Daylight {
    Regular {
        sunrise: DateTime<Utc>,
        sunset: DateTime<Utc>,
    },
    /// The sun stays above the horizon all day.
    PolarDay,
    /// The sun stays below the horizon all day.
    PolarNight,
}

/// Returned when sunrise/sunset are requested on a day that has none.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolarDayNight {
    #[error("the sun does not set today (polar day)")]
    Day,
    #[error("the sun does not rise today (polar night)")]
    Night,
}

/// Everything the capture loop needs from the sun for one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarDay {
    /// Solar transit (local apparent noon) in UTC.
    pub noon: DateTime<Utc>,
    pub daylight: Daylight,
    /// Equation of time at the requested instant, seconds.
    pub eot_offset: f64,
    /// Equation of longitude for the station, seconds.
    pub eol_offset: f64,
    /// Solar declination at noon, degrees.
    pub declination_deg: f64,
}

impl SolarDay {
    /// Sunrise and sunset, or which polar sentinel applies.
    pub fn sun_times(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), PolarDayNight> {
        match self.daylight {
            Daylight::Regular { sunrise, sunset } => Ok((sunrise, sunset)),
            Daylight::PolarDay => Err(PolarDayNight::Day),
            Daylight::PolarNight => Err(PolarDayNight::Night),
        }
    }

    /// Seconds to add to UTC to obtain local apparent time.
    pub fn apparent_offset(&self) -> f64 {
        self.eot_offset + self.eol_offset
    }

    /// Whether `at` lies after today's sunset. A polar night has no daylight
    /// at all, a polar day never sets.
    pub fn is_after_sunset(&self, at: DateTime<Utc>) -> bool {
        match self.daylight {
            Daylight::Regular { sunset, .. } => at > sunset,
            Daylight::PolarDay => false,
            Daylight::PolarNight => true,
        }
    }
}

/// Compute today's solar facts for a station with the standard horizon.
///
/// `longitude` and `latitude` are signed degrees (east and north positive).
///
/// # Example
/// ```
/// use chrono::{TimeZone, Utc};
/// use sundial_cam_lib::ephemeris::compute;
///
/// let at = Utc.with_ymd_and_hms(2026, 3, 20, 9, 0, 0).unwrap();
/// let day = compute(at, 23.586, 46.758);
/// assert!(day.sun_times().is_ok());
/// ```
pub fn compute(at: DateTime<Utc>, longitude: f64, latitude: f64) -> SolarDay {
    compute_with_horizon(at, longitude, latitude, Horizon::Standard)
}

/// Same as [`compute`] with an explicit sunrise/sunset convention.
pub fn compute_with_horizon(
    at: DateTime<Utc>,
    longitude: f64,
    latitude: f64,
    horizon: Horizon,
) -> SolarDay {
    let midnight = at.date_naive().and_time(NaiveTime::MIN).and_utc();

    // 1. Transit: first guess from mean noon at the station, refined once
    //    with the equation of time at that guess.
    let guess = midnight + seconds(43_200.0 - longitude * SECONDS_PER_DEGREE);
    let first = solar_coordinates(julian_day(guess));
    let noon_s = 43_200.0 - longitude * SECONDS_PER_DEGREE - first.eot_minutes * 60.0;
    let at_noon = solar_coordinates(julian_day(midnight + seconds(noon_s)));
    let noon_s = 43_200.0 - longitude * SECONDS_PER_DEGREE - at_noon.eot_minutes * 60.0;
    let noon = midnight + seconds(noon_s);

    // 2. Hour angle of the horizon crossing.
    let lat = latitude.to_radians();
    let dec = at_noon.declination_deg.to_radians();
    let zenith = (90.0 - horizon.altitude_deg()).to_radians();
    let cos_ha = zenith.cos() / (lat.cos() * dec.cos()) - lat.tan() * dec.tan();

    let daylight = if cos_ha > 1.0 {
        Daylight::PolarNight
    } else if cos_ha < -1.0 {
        Daylight::PolarDay
    } else {
        let half_day = cos_ha.acos().to_degrees() * SECONDS_PER_DEGREE;
        Daylight::Regular {
            sunrise: noon - seconds(half_day),
            sunset: noon + seconds(half_day),
        }
    };

    SolarDay {
        noon,
        daylight,
        eot_offset: eot_offset(at),
        eol_offset: eol_offset(longitude),
        declination_deg: at_noon.declination_deg,
    }
}

/// Equation of time in seconds at `at`.
pub fn eot_offset(at: DateTime<Utc>) -> f64 {
    solar_coordinates(julian_day(at)).eot_minutes * 60.0
}

/// Equation of longitude in seconds: 4 minutes per degree, east positive.
pub fn eol_offset(longitude: f64) -> f64 {
    longitude * SECONDS_PER_DEGREE
}

/// Solar declination in degrees at `at`.
pub fn declination(at: DateTime<Utc>) -> f64 {
    solar_coordinates(julian_day(at)).declination_deg
}

// -- Private Implementation --

struct SolarCoordinates {
    eot_minutes: f64,
    declination_deg: f64,
}

fn seconds(s: f64) -> Duration {
    Duration::milliseconds((s * 1000.0).round() as i64)
}

fn julian_day(at: DateTime<Utc>) -> f64 {
    let secs = at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) * 1e-9;
    secs / 86_400.0 + UNIX_EPOCH_JD
}

fn solar_coordinates(jd: f64) -> SolarCoordinates {
    // Julian centuries since J2000.0
    let t = (jd - J2000_JD) / 36_525.0;

    // Geometric mean longitude and anomaly of the sun (deg)
    let l0 = (280.46646 + t * (36_000.76983 + t * 0.000_303_2)).rem_euclid(360.0);
    let m = (357.52911 + t * (35_999.05029 - 0.000_153_7 * t)).to_radians();
    let e = 0.016_708_634 - t * (0.000_042_037 + 0.000_000_126_7 * t);

    // Equation of centre -> apparent longitude
    let c = m.sin() * (1.914_602 - t * (0.004_817 + 0.000_014 * t))
        + (2.0 * m).sin() * (0.019_993 - 0.000_101 * t)
        + (3.0 * m).sin() * 0.000_289;
    let omega = (125.04 - 1_934.136 * t).to_radians();
    let apparent_long = (l0 + c - 0.005_69 - 0.004_78 * omega.sin()).to_radians();

    // Obliquity of the ecliptic, corrected for nutation
    let eps0 = 23.0 + (26.0 + (21.448 - t * (46.815 + t * (0.000_59 - t * 0.001_813))) / 60.0) / 60.0;
    let eps = (eps0 + 0.002_56 * omega.cos()).to_radians();

    let declination = (eps.sin() * apparent_long.sin()).asin();

    let y = (eps / 2.0).tan().powi(2);
    let l0 = l0.to_radians();
    let eot = y * (2.0 * l0).sin() - 2.0 * e * m.sin() + 4.0 * e * y * m.sin() * (2.0 * l0).cos()
        - 0.5 * y * y * (4.0 * l0).sin()
        - 1.25 * e * e * (2.0 * m).sin();

    SolarCoordinates {
        eot_minutes: 4.0 * eot.to_degrees(),
        declination_deg: declination.to_degrees(),
    }
}
