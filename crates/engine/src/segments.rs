//! Converts accepted distance deltas into discrete, append-only
//! segments at a fixed distance threshold.

use log::debug;
use model::{GeoPoint, Segment};
use parking_lot::Mutex;

/// Default segment length, meters.
pub const SEGMENT_DISTANCE_M: f64 = 10.0;

/// Stats captured at segment-cut time. `calories_kcal` is the run
/// total so far, not a per-segment figure.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatsSnapshot {
    pub heart_rate_bpm: Option<u32>,
    pub cadence_spm: Option<u32>,
    pub calories_kcal: Option<f64>,
}

struct OpenSegment {
    distance_m: f64,
    locations: Vec<GeoPoint>,
    // Set by the first delta after a cut; segment time starts when
    // movement does, on the sample clock.
    start_ms: Option<f64>,
}

impl OpenSegment {
    fn empty() -> Self {
        Self { distance_m: 0.0, locations: Vec::new(), start_ms: None }
    }
}

struct AggregatorInner {
    segments: Vec<Segment>,
    open: OpenSegment,
    next_ordinal: u32,
}

/// Ordinal assignment and the open-segment accumulator are updated in
/// the same critical section, so interleaved delta deliveries can
/// neither duplicate nor skip an ordinal.
pub struct SegmentAggregator {
    threshold_m: f64,
    inner: Mutex<AggregatorInner>,
}

impl SegmentAggregator {
    pub fn new(threshold_m: f64) -> Self {
        Self {
            threshold_m,
            inner: Mutex::new(AggregatorInner {
                segments: Vec::new(),
                open: OpenSegment::empty(),
                next_ordinal: 1,
            }),
        }
    }

    /// Fresh per-run state. Called once per run start.
    pub fn initialize(&self) {
        let mut inner = self.inner.lock();
        inner.segments.clear();
        inner.open = OpenSegment::empty();
        inner.next_ordinal = 1;
    }

    /// Adds an accepted delta. Returns the segments this delta
    /// completed (usually none or one) so the caller can notify a
    /// display layer; sub-threshold remainders stay buffered.
    pub fn process_delta(
        &self,
        distance_m: f64,
        locations: &[GeoPoint],
        stats: &StatsSnapshot,
        now_ms: f64,
    ) -> Vec<Segment> {
        let mut inner = self.inner.lock();
        if inner.open.start_ms.is_none() {
            inner.open.start_ms = Some(now_ms);
        }
        inner.open.distance_m += distance_m;
        inner.open.locations.extend_from_slice(locations);

        let mut cut = Vec::new();
        while inner.open.distance_m >= self.threshold_m {
            let distance = self.threshold_m;
            cut.push(Self::cut_segment(&mut inner, distance, stats, now_ms));
        }
        cut
    }

    /// Emits any non-zero remainder when the run ends, so total
    /// segment distance always equals total accepted distance.
    pub fn finalize(&self, stats: &StatsSnapshot, now_ms: f64) -> Option<Segment> {
        let mut inner = self.inner.lock();
        if inner.open.distance_m <= 0.0 {
            return None;
        }
        let distance = inner.open.distance_m;
        Some(Self::cut_segment(&mut inner, distance, stats, now_ms))
    }

    fn cut_segment(
        inner: &mut AggregatorInner,
        distance_m: f64,
        stats: &StatsSnapshot,
        now_ms: f64,
    ) -> Segment {
        let ordinal = inner.next_ordinal;
        inner.next_ordinal += 1;

        let start_ms = inner.open.start_ms.unwrap_or(now_ms);
        // Calories-so-far split evenly across every segment cut so
        // far, this one included. Approximate by product intent.
        let share = stats
            .calories_kcal
            .map(|total| total / (inner.segments.len() + 1) as f64);

        let segment = Segment {
            ordinal,
            distance_m,
            duration_s: ((now_ms - start_ms) / 1000.0).max(0.0),
            start_timestamp_ms: start_ms,
            heart_rate_bpm: stats.heart_rate_bpm,
            cadence_spm: stats.cadence_spm,
            calories_kcal: share,
            locations: std::mem::take(&mut inner.open.locations),
        };
        debug!("segment {} cut ({:.1} m)", ordinal, distance_m);

        inner.open.distance_m -= distance_m;
        inner.open.start_ms = Some(now_ms);
        inner.segments.push(segment.clone());
        segment
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.inner.lock().segments.clone()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Distance buffered in the still-open segment.
    pub fn pending_distance_m(&self) -> f64 {
        self.inner.lock().open.distance_m
    }
}

impl Default for SegmentAggregator {
    fn default() -> Self {
        Self::new(SEGMENT_DISTANCE_M)
    }
}
