//! Pure fix-by-fix GPS filter. No state besides the previous accepted
//! baseline the caller passes in.

use model::{GpsFilterConfig, GpsFilterResult, GpsSample, RejectReason};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates, meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

fn rejected(reason: RejectReason) -> GpsFilterResult {
    GpsFilterResult {
        for_distance: false,
        for_path: false,
        for_pace: false,
        distance_m: 0.0,
        fused_speed_mps: 0.0,
        reason,
    }
}

fn pace_only(distance_m: f64, fused_speed_mps: f64, reason: RejectReason) -> GpsFilterResult {
    GpsFilterResult {
        for_distance: false,
        for_path: false,
        for_pace: true,
        distance_m,
        fused_speed_mps,
        reason,
    }
}

/// Evaluates one incoming fix against the previous accepted baseline.
///
/// Checks run in order and short-circuit at the first failure:
/// finiteness, accuracy gate, baseline establishment, time gap,
/// teleport speed, stationary jitter, minimum distance. A fix that
/// counts for distance always counts for path and pace too.
pub fn evaluate(
    previous: Option<&GpsSample>,
    current: &GpsSample,
    config: &GpsFilterConfig,
) -> GpsFilterResult {
    if !current.latitude.is_finite() || !current.longitude.is_finite() {
        return rejected(RejectReason::InvalidCoordinate);
    }
    if !current.timestamp_ms.is_finite() {
        return rejected(RejectReason::InvalidTimestamp);
    }
    if let Some(acc) = current.accuracy_m {
        if acc > config.max_accuracy_m {
            return rejected(RejectReason::LowAccuracy);
        }
    }

    // First fix establishes the baseline: path only, zero distance.
    let prev = match previous {
        Some(p) => p,
        None => {
            return GpsFilterResult {
                for_distance: false,
                for_path: true,
                for_pace: false,
                distance_m: 0.0,
                fused_speed_mps: current.speed_mps.unwrap_or(0.0).max(0.0),
                reason: RejectReason::NoPreviousSample,
            }
        }
    };

    let elapsed_s = (current.timestamp_ms - prev.timestamp_ms) / 1000.0;
    if !elapsed_s.is_finite() || elapsed_s <= 0.0 {
        return rejected(RejectReason::InvalidTimestamp);
    }
    if elapsed_s > config.max_delta_s {
        // The next fix becomes a fresh baseline instead of bridging
        // the gap with a fabricated straight line.
        return rejected(RejectReason::TimeGapTooLarge);
    }

    let distance_m = haversine_m(
        prev.latitude,
        prev.longitude,
        current.latitude,
        current.longitude,
    );
    let distance_speed = distance_m / elapsed_s;
    let sensor_speed = current.speed_mps.filter(|v| *v > 0.0);
    let fused_speed = match sensor_speed {
        Some(s) => (s + distance_speed) / 2.0,
        None => distance_speed,
    };

    // Validate against the larger of the two raw estimates so a bad
    // sensor reading cannot mask a GPS teleport (or vice versa).
    let validation_speed = sensor_speed.unwrap_or(0.0).max(distance_speed);
    if validation_speed * 3.6 > config.max_speed_kmh {
        return rejected(RejectReason::SpeedTooFast);
    }

    let stationary_basis = sensor_speed.unwrap_or(distance_speed);
    if stationary_basis < config.stationary_speed_mps && distance_m <= config.stationary_radius_m {
        return pace_only(distance_m, fused_speed, RejectReason::Stationary);
    }

    if distance_m < config.min_distance_m {
        return pace_only(distance_m, fused_speed, RejectReason::DistanceBelowMin);
    }

    GpsFilterResult {
        for_distance: true,
        for_path: true,
        for_pace: true,
        distance_m,
        fused_speed_mps: fused_speed,
        reason: RejectReason::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lat: f64, lon: f64, t_ms: f64) -> GpsSample {
        GpsSample {
            latitude: lat,
            longitude: lon,
            timestamp_ms: t_ms,
            speed_mps: None,
            accuracy_m: Some(5.0),
        }
    }

    // ~0.0001 deg latitude is ~11.1 m.
    const LAT_STEP_11M: f64 = 0.0001;

    #[test]
    fn first_fix_is_path_only() {
        let cur = sample(48.85, 2.35, 1_000.0);
        let res = evaluate(None, &cur, &GpsFilterConfig::default());
        assert!(res.for_path);
        assert!(!res.for_distance);
        assert!(!res.for_pace);
        assert_eq!(res.distance_m, 0.0);
        assert_eq!(res.reason, RejectReason::NoPreviousSample);
    }

    #[test]
    fn low_accuracy_rejects_regardless_of_motion() {
        let prev = sample(48.85, 2.35, 0.0);
        let mut cur = sample(48.85 + LAT_STEP_11M, 2.35, 5_000.0);
        cur.accuracy_m = Some(26.0);
        let res = evaluate(Some(&prev), &cur, &GpsFilterConfig::default());
        assert_eq!(res.reason, RejectReason::LowAccuracy);
        assert!(!res.for_pace);
    }

    #[test]
    fn nonfinite_coordinate_rejects() {
        let prev = sample(48.85, 2.35, 0.0);
        let cur = sample(f64::NAN, 2.35, 1_000.0);
        let res = evaluate(Some(&prev), &cur, &GpsFilterConfig::default());
        assert_eq!(res.reason, RejectReason::InvalidCoordinate);
    }

    #[test]
    fn non_monotonic_timestamp_rejects() {
        let prev = sample(48.85, 2.35, 5_000.0);
        let cur = sample(48.85 + LAT_STEP_11M, 2.35, 5_000.0);
        let res = evaluate(Some(&prev), &cur, &GpsFilterConfig::default());
        assert_eq!(res.reason, RejectReason::InvalidTimestamp);
    }

    #[test]
    fn long_gap_rebaselines() {
        let prev = sample(48.85, 2.35, 0.0);
        let cur = sample(48.85 + LAT_STEP_11M, 2.35, 16_000.0);
        let res = evaluate(Some(&prev), &cur, &GpsFilterConfig::default());
        assert_eq!(res.reason, RejectReason::TimeGapTooLarge);
        assert!(!res.for_distance);
    }

    #[test]
    fn teleport_rejects_speed_too_fast() {
        // 50 m in 1 s = 180 km/h.
        let prev = sample(48.85, 2.35, 0.0);
        let cur = sample(48.85 + 0.00045, 2.35, 1_000.0);
        let res = evaluate(Some(&prev), &cur, &GpsFilterConfig::default());
        assert_eq!(res.reason, RejectReason::SpeedTooFast);
    }

    #[test]
    fn sensor_speed_feeds_validation() {
        // Small positional delta but the sensor claims 11 m/s: the max
        // of the two estimates is checked, so this passes; 11 m/s is
        // 39.6 km/h which exceeds the default 36 km/h limit.
        let prev = sample(48.85, 2.35, 0.0);
        let mut cur = sample(48.85 + LAT_STEP_11M, 2.35, 2_000.0);
        cur.speed_mps = Some(11.0);
        let res = evaluate(Some(&prev), &cur, &GpsFilterConfig::default());
        assert_eq!(res.reason, RejectReason::SpeedTooFast);
    }

    #[test]
    fn stationary_jitter_counts_for_pace_only() {
        // ~2.2 m drift over 4 s at ~0.55 m/s: inside the stationary
        // radius and below the stationary speed.
        let prev = sample(48.85, 2.35, 0.0);
        let cur = sample(48.85 + 0.00002, 2.35, 4_000.0);
        let res = evaluate(Some(&prev), &cur, &GpsFilterConfig::default());
        assert_eq!(res.reason, RejectReason::Stationary);
        assert!(res.for_pace);
        assert!(!res.for_distance);
        assert!(!res.for_path);
    }

    #[test]
    fn sub_threshold_move_counts_for_pace_only() {
        // ~2.2 m in 1 s: too fast to be stationary, below the 3 m
        // minimum distance.
        let prev = sample(48.85, 2.35, 0.0);
        let cur = sample(48.85 + 0.00002, 2.35, 1_000.0);
        let res = evaluate(Some(&prev), &cur, &GpsFilterConfig::default());
        assert_eq!(res.reason, RejectReason::DistanceBelowMin);
        assert!(res.for_pace);
        assert!(!res.for_distance);
    }

    #[test]
    fn normal_motion_accepts_all_channels() {
        let prev = sample(48.85, 2.35, 0.0);
        let cur = sample(48.85 + LAT_STEP_11M, 2.35, 4_000.0);
        let res = evaluate(Some(&prev), &cur, &GpsFilterConfig::default());
        assert_eq!(res.reason, RejectReason::Ok);
        assert!(res.for_distance && res.for_path && res.for_pace);
        assert!(res.distance_m > 10.0 && res.distance_m < 12.0);
    }

    #[test]
    fn fused_speed_averages_sensor_and_derived() {
        let prev = sample(48.85, 2.35, 0.0);
        let mut cur = sample(48.85 + LAT_STEP_11M, 2.35, 4_000.0);
        cur.speed_mps = Some(3.0);
        let res = evaluate(Some(&prev), &cur, &GpsFilterConfig::default());
        let derived = res.distance_m / 4.0;
        assert!((res.fused_speed_mps - (3.0 + derived) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn accepted_distance_is_monotone_over_a_clean_sequence() {
        let config = GpsFilterConfig::default();
        let mut prev: Option<GpsSample> = None;
        let mut total = 0.0;
        for i in 0..60 {
            let cur = sample(48.85 + LAT_STEP_11M * i as f64, 2.35, i as f64 * 3_000.0);
            let res = evaluate(prev.as_ref(), &cur, &config);
            assert!(res.distance_m >= 0.0);
            if res.for_distance {
                total += res.distance_m;
            }
            prev = Some(cur);
        }
        assert!(total > 0.0);
        // 59 steps of ~11.1 m each.
        assert!((total - 59.0 * 11.1).abs() < 5.0);
    }
}
