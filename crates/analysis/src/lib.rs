use model::{Pace, PaceSnapshot, RunnerProfile, RunningStats, Sex};
use serde_json::{json, Value};
use std::collections::VecDeque;

/// Trailing window for instantaneous pace, ms.
pub const PACE_WINDOW_MS: f64 = 10_000.0;
/// Below this span the window is too short to divide by.
pub const MIN_PACE_SPAN_MS: f64 = 1_000.0;
/// Metabolic equivalent for running, used when no heart rate is known.
/// Compendium of Physical Activities code 12050 (running, ~6 mph).
pub const RUNNING_MET: f64 = 9.8;

/// Derives live run metrics from accumulated distance and time.
/// Owns the sliding snapshot window for instantaneous pace.
pub struct StatsCalculator {
    profile: RunnerProfile,
    window: VecDeque<PaceSnapshot>,
}

impl StatsCalculator {
    pub fn new(profile: RunnerProfile) -> Self {
        Self { profile, window: VecDeque::new() }
    }

    /// One full stats pass. `now_ms` feeds the pace window; heart rate
    /// and cadence pass through untouched so absence propagates.
    pub fn update(
        &mut self,
        distance_m: f64,
        elapsed_s: f64,
        heart_rate_bpm: Option<u32>,
        cadence_spm: Option<u32>,
        now_ms: f64,
    ) -> RunningStats {
        let instant_pace = self.instant_pace(now_ms, distance_m);
        let calories = if elapsed_s > 0.0 {
            Some(self.calculate_calories(heart_rate_bpm, elapsed_s))
        } else {
            None
        };
        RunningStats {
            heart_rate_bpm,
            cadence_spm,
            avg_pace: average_pace(distance_m, elapsed_s),
            instant_pace,
            speed_kmh: speed_kmh(distance_m, elapsed_s),
            calories_kcal: calories,
        }
    }

    /// Heart-rate presence is the sole formula selector: known HR uses
    /// the Keytel regression, unknown HR the MET estimate. Never both.
    pub fn calculate_calories(&self, heart_rate_bpm: Option<u32>, elapsed_s: f64) -> f64 {
        match heart_rate_bpm {
            Some(hr) => keytel_kcal(&self.profile, hr, elapsed_s / 60.0),
            None => met_kcal(self.profile.weight_kg, elapsed_s / 3600.0),
        }
    }

    fn instant_pace(&mut self, now_ms: f64, distance_m: f64) -> Pace {
        self.window.push_back(PaceSnapshot { timestamp_ms: now_ms, distance_m });
        while let Some(front) = self.window.front() {
            if now_ms - front.timestamp_ms > PACE_WINDOW_MS {
                self.window.pop_front();
            } else {
                break;
            }
        }
        let (oldest, newest) = match (self.window.front(), self.window.back()) {
            (Some(o), Some(n)) if self.window.len() >= 2 => (o, n),
            _ => return Pace::default(),
        };
        let span_ms = newest.timestamp_ms - oldest.timestamp_ms;
        let delta_km = (newest.distance_m - oldest.distance_m) / 1000.0;
        // Near-zero denominators spike the pace; report zero instead
        // of extrapolating.
        if delta_km <= 0.0 || span_ms < MIN_PACE_SPAN_MS {
            return Pace::default();
        }
        Pace::from_secs_per_km(span_ms / 1000.0 / delta_km)
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn profile(&self) -> &RunnerProfile {
        &self.profile
    }
}


/// Full-run pace, sec/km floored then split min/sec; zero when no
/// distance has accumulated yet.
pub fn average_pace(distance_m: f64, elapsed_s: f64) -> Pace {
    if distance_m <= 0.0 {
        return Pace::default();
    }
    Pace::from_secs_per_km((elapsed_s / (distance_m / 1000.0)).floor())
}

pub fn speed_kmh(distance_m: f64, elapsed_s: f64) -> f64 {
    if elapsed_s <= 0.0 {
        return 0.0;
    }
    (distance_m / 1000.0) / (elapsed_s / 3600.0)
}

/// Keytel et al. (2005) heart-rate regression, kcal for the elapsed
/// minutes, floored at zero (the linear fit goes negative at low HR).
fn keytel_kcal(profile: &RunnerProfile, heart_rate_bpm: u32, minutes: f64) -> f64 {
    let hr = heart_rate_bpm as f64;
    let age = profile.age_years as f64;
    let per_min = match profile.sex {
        Sex::Male => (-55.0969 + 0.6309 * hr + 0.1988 * profile.weight_kg + 0.2017 * age) / 4.184,
        Sex::Female => (-20.4022 + 0.4472 * hr - 0.1263 * profile.weight_kg + 0.074 * age) / 4.184,
    };
    (per_min * minutes).max(0.0)
}

fn met_kcal(weight_kg: f64, hours: f64) -> f64 {
    (RUNNING_MET * weight_kg * hours).max(0.0)
}

/// Flat JSON snapshot for a display layer.
pub fn snapshot_json(stats: &RunningStats, elapsed_s: f64, distance_m: f64) -> Value {
    json!({
        "distance_m": distance_m,
        "elapsed_s": elapsed_s,
        "avg_pace": format!("{}:{:02}", stats.avg_pace.minutes, stats.avg_pace.seconds),
        "instant_pace": format!("{}:{:02}", stats.instant_pace.minutes, stats.instant_pace.seconds),
        "speed_kmh": stats.speed_kmh,
        "heart_rate_bpm": stats.heart_rate_bpm,
        "cadence_spm": stats.cadence_spm,
        "calories_kcal": stats.calories_kcal,
    })
}
