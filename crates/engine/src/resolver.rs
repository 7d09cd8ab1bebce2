//! Ordered-fallback resolution over sensor tiers. One resolver per
//! lifecycle; each metric falls back independently.

use log::{debug, warn};
use parking_lot::Mutex;
use sensor_core::{
    reading_channel, CalorieQuery, Metric, ReadingRx, SensorDataResult, SensorReading,
    SensorSource, SourceKind,
};
use std::collections::HashMap;
use std::sync::Arc;

struct Slot {
    active: Option<usize>,
    // Kept alive so the channel survives tier switches; dropped on stop.
    _tx: sensor_core::ReadingTx,
    // None only during the instant between slot insertion and pump spawn.
    task: Option<tokio::task::JoinHandle<()>>,
}

struct ResolverInner {
    sources: Vec<Arc<dyn SensorSource>>,
    available: Mutex<Vec<bool>>,
    slots: Mutex<HashMap<Metric, Slot>>,
    latest: Mutex<HashMap<Metric, SensorDataResult<u32>>>,
}

/// Chooses which sensor tier supplies each metric, falling through to
/// the next tier whenever the active one reports `NoData`. A spent
/// tier is never re-queried within the same monitoring session;
/// exhaustion pins the metric to `None` until monitoring is restarted.
pub struct SensorPriorityResolver {
    inner: Arc<ResolverInner>,
}

impl SensorPriorityResolver {
    /// Availability (reachability + permission) is snapshotted here,
    /// not re-checked per sample. `sources` must be ordered highest
    /// priority first.
    pub async fn new(sources: Vec<Arc<dyn SensorSource>>) -> Self {
        let mut available = Vec::with_capacity(sources.len());
        for s in &sources {
            available.push(s.is_available().await && s.has_permission().await);
        }
        Self {
            inner: Arc::new(ResolverInner {
                sources,
                available: Mutex::new(available),
                slots: Mutex::new(HashMap::new()),
                latest: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Re-runs the availability checks on demand.
    pub async fn refresh_availability(&self) {
        let mut fresh = Vec::with_capacity(self.inner.sources.len());
        for s in &self.inner.sources {
            fresh.push(s.is_available().await && s.has_permission().await);
        }
        *self.inner.available.lock() = fresh;
    }

    /// Starts the highest-priority available tier for `metric`.
    /// Restarting an exhausted metric begins a fresh session from the
    /// top of the chain.
    pub async fn start_monitoring(&self, metric: Metric) {
        self.stop_monitoring(metric).await;

        let (tx, rx) = reading_channel();
        let started = start_from(&self.inner, metric, 0, &tx).await;
        match started {
            Some(idx) => {
                // The slot must exist before the pump can observe a
                // reading, or an immediate NoData would be dropped.
                self.inner.slots.lock().insert(
                    metric,
                    Slot { active: Some(idx), _tx: tx, task: None },
                );
                let task = tokio::spawn(pump(self.inner.clone(), metric, rx));
                if let Some(slot) = self.inner.slots.lock().get_mut(&metric) {
                    slot.task = Some(task);
                }
            }
            None => {
                warn!("no sensor source available for {:?}", metric);
                self.inner.latest.lock().insert(metric, SensorDataResult::None);
            }
        }
    }

    /// Tears down whichever tier is active for `metric` and clears the
    /// active-source record.
    pub async fn stop_monitoring(&self, metric: Metric) {
        let slot = self.inner.slots.lock().remove(&metric);
        if let Some(slot) = slot {
            if let Some(idx) = slot.active {
                self.inner.sources[idx].stop_monitoring(metric).await;
            }
            if let Some(task) = slot.task {
                task.abort();
            }
        }
        self.inner.latest.lock().remove(&metric);
    }

    pub async fn stop_all(&self) {
        self.stop_monitoring(Metric::HeartRate).await;
        self.stop_monitoring(Metric::Cadence).await;
    }

    /// Latest resolved value for `metric`.
    pub fn latest(&self, metric: Metric) -> SensorDataResult<u32> {
        self.inner
            .latest
            .lock()
            .get(&metric)
            .copied()
            .unwrap_or(SensorDataResult::None)
    }

    /// Point-in-time query down the priority chain, outside any
    /// monitoring session.
    pub async fn current(&self, metric: Metric) -> SensorDataResult<u32> {
        let available = self.inner.available.lock().clone();
        for (idx, source) in self.inner.sources.iter().enumerate() {
            if !available[idx] {
                continue;
            }
            if let SensorReading::Value(v) = source.current_value(metric).await {
                return SensorDataResult::Data { value: v, source: source.kind() };
            }
        }
        SensorDataResult::None
    }

    /// Calories use their own tier order: wearable-reported, then
    /// phone-OS-reported, then the caller's local formula (signalled
    /// by `None` here).
    pub async fn resolve_calories(&self, query: &CalorieQuery) -> SensorDataResult<f64> {
        let available = self.inner.available.lock().clone();
        for kind in [SourceKind::Wearable, SourceKind::PhoneHealth] {
            let found = self
                .inner
                .sources
                .iter()
                .enumerate()
                .find(|(_, s)| s.kind() == kind);
            if let Some((idx, source)) = found {
                if !available[idx] {
                    continue;
                }
                if let SensorReading::Value(v) = source.calorie_estimate(query).await {
                    return SensorDataResult::Data { value: v, source: kind };
                }
            }
        }
        SensorDataResult::None
    }
}

/// Starts the first available tier at or after `from`, skipping tiers
/// whose start call fails (treated like an immediate `NoData`).
async fn start_from(
    inner: &Arc<ResolverInner>,
    metric: Metric,
    from: usize,
    tx: &sensor_core::ReadingTx,
) -> Option<usize> {
    let available = inner.available.lock().clone();
    for idx in from..inner.sources.len() {
        if !available[idx] {
            continue;
        }
        let source = &inner.sources[idx];
        match source.start_monitoring(metric, tx.clone()).await {
            Ok(()) => {
                debug!("{:?} monitoring on {:?}", metric, source.kind());
                return Some(idx);
            }
            Err(e) => {
                warn!("{:?} start failed on {:?}: {e}", metric, source.kind());
            }
        }
    }
    None
}

async fn pump(inner: Arc<ResolverInner>, metric: Metric, mut rx: ReadingRx) {
    while let Some(reading) = rx.recv().await {
        match reading {
            SensorReading::Value(v) => {
                let kind = {
                    let slots = inner.slots.lock();
                    slots
                        .get(&metric)
                        .and_then(|s| s.active)
                        .map(|idx| inner.sources[idx].kind())
                };
                if let Some(source) = kind {
                    inner
                        .latest
                        .lock()
                        .insert(metric, SensorDataResult::Data { value: v, source });
                }
            }
            SensorReading::NoData => fall_through(&inner, metric).await,
        }
    }
}

/// One tier down, never back up.
async fn fall_through(inner: &Arc<ResolverInner>, metric: Metric) {
    let (current, tx) = {
        let slots = inner.slots.lock();
        match slots.get(&metric) {
            Some(slot) => (slot.active, slot._tx.clone()),
            None => return,
        }
    };
    let current = match current {
        Some(idx) => idx,
        None => return,
    };

    inner.sources[current].stop_monitoring(metric).await;
    debug!(
        "{:?} reported no data on {:?}, falling back",
        metric,
        inner.sources[current].kind()
    );

    match start_from(inner, metric, current + 1, &tx).await {
        Some(next) => {
            if let Some(slot) = inner.slots.lock().get_mut(&metric) {
                slot.active = Some(next);
            }
        }
        None => {
            warn!("{:?} sources exhausted", metric);
            if let Some(slot) = inner.slots.lock().get_mut(&metric) {
                slot.active = None;
            }
            inner.latest.lock().insert(metric, SensorDataResult::None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_core::{ReadingTx, SensorError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeSource {
        kind: SourceKind,
        available: bool,
        // scripted deliveries, sent in order on each start
        script: Vec<SensorReading<u32>>,
        starts: AtomicUsize,
        calories: Option<f64>,
    }

    impl FakeSource {
        fn new(kind: SourceKind, script: Vec<SensorReading<u32>>) -> Arc<Self> {
            Arc::new(Self { kind, available: true, script, starts: AtomicUsize::new(0), calories: None })
        }

        fn unavailable(kind: SourceKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: false,
                script: vec![],
                starts: AtomicUsize::new(0),
                calories: None,
            })
        }

        fn with_calories(kind: SourceKind, kcal: Option<f64>) -> Arc<Self> {
            Arc::new(Self { kind, available: true, script: vec![], starts: AtomicUsize::new(0), calories: kcal })
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SensorSource for FakeSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn has_permission(&self) -> bool {
            true
        }

        async fn start_monitoring(&self, _metric: Metric, tx: ReadingTx) -> Result<(), SensorError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            for r in &self.script {
                let _ = tx.send(*r);
            }
            Ok(())
        }

        async fn stop_monitoring(&self, _metric: Metric) {}

        async fn current_value(&self, _metric: Metric) -> SensorReading<u32> {
            match self.script.first() {
                Some(r) => *r,
                None => SensorReading::NoData,
            }
        }

        async fn calorie_estimate(&self, _query: &CalorieQuery) -> SensorReading<f64> {
            match self.calories {
                Some(v) => SensorReading::Value(v),
                None => SensorReading::NoData,
            }
        }
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn query() -> CalorieQuery {
        CalorieQuery { distance_m: 1_000.0, duration_s: 300.0, weight_kg: 70.0, heart_rate_bpm: None }
    }

    #[tokio::test]
    async fn highest_tier_wins_when_it_has_data() {
        let watch = FakeSource::new(SourceKind::SportsWatch, vec![SensorReading::Value(142)]);
        let wearable = FakeSource::new(SourceKind::Wearable, vec![SensorReading::Value(90)]);
        let resolver =
            SensorPriorityResolver::new(vec![watch.clone(), wearable.clone()]).await;

        resolver.start_monitoring(Metric::HeartRate).await;
        settle(|| resolver.latest(Metric::HeartRate).value().is_some()).await;

        assert_eq!(
            resolver.latest(Metric::HeartRate),
            SensorDataResult::Data { value: 142, source: SourceKind::SportsWatch }
        );
        assert_eq!(wearable.starts(), 0);
    }

    #[tokio::test]
    async fn no_data_falls_exactly_one_tier() {
        let watch = FakeSource::new(SourceKind::SportsWatch, vec![SensorReading::NoData]);
        let wearable = FakeSource::new(SourceKind::Wearable, vec![SensorReading::Value(88)]);
        let phone = FakeSource::new(SourceKind::PhoneHealth, vec![SensorReading::Value(77)]);
        let resolver = SensorPriorityResolver::new(vec![
            watch.clone(),
            wearable.clone(),
            phone.clone(),
        ])
        .await;

        resolver.start_monitoring(Metric::HeartRate).await;
        settle(|| resolver.latest(Metric::HeartRate).value().is_some()).await;

        assert_eq!(
            resolver.latest(Metric::HeartRate),
            SensorDataResult::Data { value: 88, source: SourceKind::Wearable }
        );
        assert_eq!(watch.starts(), 1);
        assert_eq!(wearable.starts(), 1);
        assert_eq!(phone.starts(), 0);
    }

    #[tokio::test]
    async fn unavailable_tiers_are_skipped_at_start() {
        let watch = FakeSource::unavailable(SourceKind::SportsWatch);
        let wearable = FakeSource::new(SourceKind::Wearable, vec![SensorReading::Value(91)]);
        let resolver =
            SensorPriorityResolver::new(vec![watch.clone(), wearable.clone()]).await;

        resolver.start_monitoring(Metric::HeartRate).await;
        settle(|| resolver.latest(Metric::HeartRate).value().is_some()).await;

        assert_eq!(watch.starts(), 0);
        assert_eq!(wearable.starts(), 1);
    }

    #[tokio::test]
    async fn exhaustion_pins_none_until_restart() {
        let watch = FakeSource::new(SourceKind::SportsWatch, vec![SensorReading::NoData]);
        let wearable = FakeSource::new(SourceKind::Wearable, vec![SensorReading::NoData]);
        let resolver =
            SensorPriorityResolver::new(vec![watch.clone(), wearable.clone()]).await;

        resolver.start_monitoring(Metric::HeartRate).await;
        settle(|| watch.starts() == 1 && wearable.starts() == 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(resolver.latest(Metric::HeartRate), SensorDataResult::None);
        // a spent tier is never re-queried within the session
        assert_eq!(watch.starts(), 1);
        assert_eq!(wearable.starts(), 1);

        // explicit restart begins a fresh session from the top
        resolver.start_monitoring(Metric::HeartRate).await;
        settle(|| watch.starts() == 2).await;
        assert_eq!(watch.starts(), 2);
    }

    #[tokio::test]
    async fn metrics_fall_back_independently() {
        let watch = FakeSource::new(SourceKind::SportsWatch, vec![SensorReading::Value(140)]);
        let wearable = FakeSource::new(SourceKind::Wearable, vec![SensorReading::Value(172)]);
        let resolver =
            SensorPriorityResolver::new(vec![watch.clone(), wearable.clone()]).await;

        // Heart rate stays on the watch; cadence exhausts the watch
        // (same scripted Value is heart-rate-shaped but that is fine
        // for the fake) and both keep their own active source.
        resolver.start_monitoring(Metric::HeartRate).await;
        resolver.start_monitoring(Metric::Cadence).await;
        settle(|| {
            resolver.latest(Metric::HeartRate).value().is_some()
                && resolver.latest(Metric::Cadence).value().is_some()
        })
        .await;

        assert_eq!(
            resolver.latest(Metric::HeartRate),
            SensorDataResult::Data { value: 140, source: SourceKind::SportsWatch }
        );
        assert_eq!(
            resolver.latest(Metric::Cadence),
            SensorDataResult::Data { value: 140, source: SourceKind::SportsWatch }
        );

        resolver.stop_monitoring(Metric::Cadence).await;
        assert_eq!(resolver.latest(Metric::Cadence), SensorDataResult::None);
        // stopping cadence does not disturb heart rate
        assert!(resolver.latest(Metric::HeartRate).value().is_some());
    }

    #[tokio::test]
    async fn calories_prefer_wearable_then_phone_then_local() {
        let watch = FakeSource::with_calories(SourceKind::SportsWatch, Some(999.0));
        let wearable = FakeSource::with_calories(SourceKind::Wearable, Some(212.0));
        let phone = FakeSource::with_calories(SourceKind::PhoneHealth, Some(180.0));
        let resolver = SensorPriorityResolver::new(vec![
            watch.clone(),
            wearable.clone(),
            phone.clone(),
        ])
        .await;

        // wearable answer wins even though the watch has a figure;
        // the calorie chain does not include the sports watch
        assert_eq!(
            resolver.resolve_calories(&query()).await,
            SensorDataResult::Data { value: 212.0, source: SourceKind::Wearable }
        );

        let no_wearable = SensorPriorityResolver::new(vec![
            FakeSource::with_calories(SourceKind::Wearable, None),
            phone.clone(),
        ])
        .await;
        assert_eq!(
            no_wearable.resolve_calories(&query()).await,
            SensorDataResult::Data { value: 180.0, source: SourceKind::PhoneHealth }
        );

        let nothing = SensorPriorityResolver::new(vec![FakeSource::with_calories(
            SourceKind::PhoneHealth,
            None,
        )])
        .await;
        assert_eq!(nothing.resolve_calories(&query()).await, SensorDataResult::None);
    }
}
