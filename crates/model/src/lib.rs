use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One raw location fix as delivered by the location subsystem.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct GpsSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: f64,
    pub speed_mps: Option<f64>,  // sensor-reported, m/s
    pub accuracy_m: Option<f64>, // horizontal accuracy, m
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&GpsSample> for GeoPoint {
    fn from(s: &GpsSample) -> Self {
        Self { latitude: s.latitude, longitude: s.longitude }
    }
}

/// Thresholds for accepting raw fixes.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct GpsFilterConfig {
    pub max_accuracy_m: f64,
    pub min_distance_m: f64,
    pub max_speed_kmh: f64,
    pub stationary_speed_mps: f64,
    pub stationary_radius_m: f64,
    pub max_delta_s: f64,
}

impl Default for GpsFilterConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: 25.0,
            min_distance_m: 3.0,
            max_speed_kmh: 36.0,
            stationary_speed_mps: 0.8,
            stationary_radius_m: 6.0,
            max_delta_s: 15.0,
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum RejectReason {
    Ok,
    InvalidCoordinate,
    InvalidTimestamp,
    LowAccuracy,
    NoPreviousSample,
    TimeGapTooLarge,
    SpeedTooFast,
    Stationary,
    DistanceBelowMin,
}

/// Outcome of evaluating one fix against the previous accepted baseline.
///
/// The three flags feed three independent consumers: the cumulative
/// distance counter, the recorded path, and the instantaneous-pace
/// window. `for_distance` implies the other two.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct GpsFilterResult {
    pub for_distance: bool,
    pub for_path: bool,
    pub for_pace: bool,
    pub distance_m: f64,
    pub fused_speed_mps: f64,
    pub reason: RejectReason,
}

/// Pace as minutes/seconds per kilometer.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct Pace {
    pub minutes: u32,
    pub seconds: u32,
}

impl Pace {
    pub fn from_secs_per_km(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::default();
        }
        let total = secs.floor() as u32;
        Self { minutes: total / 60, seconds: total % 60 }
    }

    pub fn total_seconds(&self) -> u32 {
        self.minutes * 60 + self.seconds
    }
}

/// Live metrics for the active run. Heart rate, cadence and calories
/// stay `None` when no source can supply them; absence propagates.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct RunningStats {
    pub heart_rate_bpm: Option<u32>,
    pub cadence_spm: Option<u32>,
    pub avg_pace: Pace,
    pub instant_pace: Pace,
    pub speed_kmh: f64,
    pub calories_kcal: Option<f64>,
}

/// (timestamp, cumulative distance) pair kept inside the trailing
/// instantaneous-pace window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PaceSnapshot {
    pub timestamp_ms: f64,
    pub distance_m: f64,
}

/// One ~10 m slice of the run, the unit of upload granularity.
/// Append-only and immutable once created; ordinals never repeat.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Segment {
    pub ordinal: u32,
    pub distance_m: f64,
    pub duration_s: f64,
    pub start_timestamp_ms: f64,
    pub heart_rate_bpm: Option<u32>,
    pub cadence_spm: Option<u32>,
    pub calories_kcal: Option<f64>,
    pub locations: Vec<GeoPoint>,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Finished,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Sex {
    Male,
    Female,
}

/// Calorie-formula inputs. Defaults stand in until the host supplies
/// real profile data.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct RunnerProfile {
    pub weight_kg: f64,
    pub age_years: u32,
    pub sex: Sex,
}

impl Default for RunnerProfile {
    fn default() -> Self {
        Self { weight_kg: 70.0, age_years: 30, sex: Sex::Male }
    }
}

/// The record assembled on run end and handed to the completion
/// service (or the offline queue).
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct FinalRecord {
    /// Client-side identity, stable across offline retries.
    #[serde(with = "uuid::serde::simple")]
    pub id: Uuid,
    pub run_id: String,
    pub distance_m: f64,
    pub duration_s: f64,
    pub paused_s: f64,
    pub started_at_ms: f64,
    pub stats: RunningStats,
    pub segments: Vec<Segment>,
    pub path: Vec<GeoPoint>,
}

/// Completion-service response. Points and rewards are authoritative
/// server data, never computed locally.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ServerRecord {
    pub record_id: String,
    pub points: u32,
}
