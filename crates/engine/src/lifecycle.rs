//! Run state machine: wires GPS ingestion, the segment aggregator,
//! the stats calculator and the sensor resolver together for one run
//! at a time.

use crate::resolver::SensorPriorityResolver;
use crate::segments::{SegmentAggregator, StatsSnapshot};
use crate::services::{LocationProvider, OfflineQueue, QueuedPayload, RunService, StepCounter};
use crate::store::SampleStore;
use analysis::StatsCalculator;
use log::{debug, info, warn};
use model::{
    FinalRecord, GeoPoint, GpsFilterConfig, GpsSample, RejectReason, RunState, RunnerProfile,
    RunningStats, Segment,
};
use parking_lot::Mutex;
use sensor_core::{CalorieQuery, Metric};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("location permission missing")]
    PermissionDenied,
    #[error("a run is already active")]
    AlreadyRunning,
    #[error("no active run")]
    NotRunning,
    #[error("{0}")]
    Msg(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How fixes reach the engine. Foreground subscribes directly;
/// background polls the durable store at 1 Hz while the host app is
/// foregrounded. Never both at once; switching is an explicit restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestionMode {
    Foreground,
    Background,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LifecycleConfig {
    pub profile: RunnerProfile,
    pub filter: GpsFilterConfig,
    pub segment_distance_m: f64,
    /// Runs shorter than this skip server submission entirely.
    pub min_run_distance_m: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            profile: RunnerProfile::default(),
            filter: GpsFilterConfig::default(),
            segment_distance_m: crate::segments::SEGMENT_DISTANCE_M,
            min_run_distance_m: 10.0,
        }
    }
}

struct RunInner {
    state: RunState,
    mode: Option<IngestionMode>,
    run_id: String,
    filter: GpsFilterConfig,
    aggregator: SegmentAggregator,
    stats: StatsCalculator,
    current: RunningStats,
    baseline: Option<GpsSample>,
    distance_m: f64,
    path: Vec<GeoPoint>,
    started_wall_ms: f64,
    first_fix_ms: Option<f64>,
    last_seen_ms: Option<f64>,
    pause_started: Option<Instant>,
    paused_total: Duration,
    step_cadence_spm: Option<u32>,
    total_steps: u64,
    final_record: Option<FinalRecord>,
}

impl RunInner {
    fn fresh(config: &LifecycleConfig) -> Self {
        Self {
            state: RunState::Idle,
            mode: None,
            run_id: String::new(),
            filter: config.filter.clone(),
            aggregator: SegmentAggregator::new(config.segment_distance_m),
            stats: StatsCalculator::new(config.profile),
            current: RunningStats::default(),
            baseline: None,
            distance_m: 0.0,
            path: Vec::new(),
            started_wall_ms: 0.0,
            first_fix_ms: None,
            last_seen_ms: None,
            pause_started: None,
            paused_total: Duration::ZERO,
            step_cadence_spm: None,
            total_steps: 0,
            final_record: None,
        }
    }

    /// One fix, fully processed before the next: filter, then the
    /// three acceptance channels, then the stats pass.
    fn process_sample(&mut self, sample: GpsSample, hr: Option<u32>, sensor_cadence: Option<u32>) {
        let result = gps_filter::evaluate(self.baseline.as_ref(), &sample, &self.filter);

        if !(result.for_distance || result.for_path || result.for_pace) {
            debug!("fix rejected: {:?}", result.reason);
        }

        if result.for_path {
            self.path.push(GeoPoint::from(&sample));
        }

        if result.for_path || result.for_pace {
            if self.first_fix_ms.is_none() {
                self.first_fix_ms = Some(sample.timestamp_ms);
            }
            self.last_seen_ms = Some(sample.timestamp_ms);
        }

        if result.for_distance {
            self.distance_m += result.distance_m;
            let snapshot = StatsSnapshot {
                heart_rate_bpm: self.current.heart_rate_bpm,
                cadence_spm: self.current.cadence_spm,
                calories_kcal: self.current.calories_kcal,
            };
            for segment in self.aggregator.process_delta(
                result.distance_m,
                &[GeoPoint::from(&sample)],
                &snapshot,
                sample.timestamp_ms,
            ) {
                info!("segment {} complete ({:.1} m)", segment.ordinal, segment.distance_m);
            }
        }

        if result.for_pace {
            let cadence = sensor_cadence.or(self.step_cadence_spm);
            self.current = self.stats.update(
                self.distance_m,
                self.elapsed_s(),
                hr,
                cadence,
                sample.timestamp_ms,
            );
        }

        // The baseline advances on full accepts and on new-baseline
        // reasons; stationary/sub-minimum fixes keep the old baseline
        // so micro-movement can accumulate past the threshold.
        match result.reason {
            RejectReason::Ok | RejectReason::NoPreviousSample | RejectReason::TimeGapTooLarge => {
                self.baseline = Some(sample);
            }
            _ => {}
        }
    }

    /// Moving time on the sample clock, minus wall-clock paused time.
    fn elapsed_s(&self) -> f64 {
        let (first, last) = match (self.first_fix_ms, self.last_seen_ms) {
            (Some(f), Some(l)) => (f, l),
            _ => return 0.0,
        };
        let mut paused = self.paused_total.as_secs_f64();
        if let Some(p) = self.pause_started {
            paused += p.elapsed().as_secs_f64();
        }
        ((last - first) / 1000.0 - paused).max(0.0)
    }

    fn assemble_record(&self) -> FinalRecord {
        FinalRecord {
            id: Uuid::new_v4(),
            run_id: self.run_id.clone(),
            distance_m: self.distance_m,
            duration_s: self.elapsed_s(),
            paused_s: self.paused_total.as_secs_f64(),
            started_at_ms: self.started_wall_ms,
            stats: self.current.clone(),
            segments: self.aggregator.segments(),
            path: self.path.clone(),
        }
    }
}

/// One lifecycle instance drives at most one active run; run state is
/// discarded wholesale and reallocated on the next `start`.
pub struct RunningLifecycle {
    inner: Arc<Mutex<RunInner>>,
    config: LifecycleConfig,
    location: Arc<dyn LocationProvider>,
    store: Arc<dyn SampleStore>,
    steps: Arc<dyn StepCounter>,
    service: Arc<dyn RunService>,
    queue: Arc<dyn OfflineQueue>,
    resolver: Arc<SensorPriorityResolver>,
    poll_shutdown: Mutex<Option<watch::Sender<bool>>>,
    // Bumped to retire pump threads from an ended/reset run.
    epoch: Arc<AtomicU64>,
    host_foreground: Mutex<bool>,
}

fn wall_now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

impl RunningLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LifecycleConfig,
        location: Arc<dyn LocationProvider>,
        store: Arc<dyn SampleStore>,
        steps: Arc<dyn StepCounter>,
        service: Arc<dyn RunService>,
        queue: Arc<dyn OfflineQueue>,
        resolver: Arc<SensorPriorityResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunInner::fresh(&config))),
            config,
            location,
            store,
            steps,
            service,
            queue,
            resolver,
            poll_shutdown: Mutex::new(None),
            epoch: Arc::new(AtomicU64::new(0)),
            host_foreground: Mutex::new(true),
        }
    }

    pub async fn start(&self, mode: IngestionMode) -> Result<(), LifecycleError> {
        {
            let inner = self.inner.lock();
            if matches!(inner.state, RunState::Running | RunState::Paused) {
                return Err(LifecycleError::AlreadyRunning);
            }
        }
        if !self.location.has_permission() {
            return Err(LifecycleError::PermissionDenied);
        }

        // Degraded mode: a failed registration never blocks the run.
        let run_id = match self.service.start_run().await {
            Ok(id) => id,
            Err(e) => {
                warn!("run registration failed ({e}), continuing with local id");
                format!("local-{}", Uuid::new_v4().simple())
            }
        };

        {
            let mut inner = self.inner.lock();
            // re-checked: the registration call awaited in between
            if matches!(inner.state, RunState::Running | RunState::Paused) {
                return Err(LifecycleError::AlreadyRunning);
            }
            *inner = RunInner::fresh(&self.config);
            inner.aggregator.initialize();
            inner.run_id = run_id.clone();
            inner.mode = Some(mode);
            inner.started_wall_ms = wall_now_ms();
            inner.state = RunState::Running;
        }

        self.resolver.start_monitoring(Metric::HeartRate).await;
        self.resolver.start_monitoring(Metric::Cadence).await;
        self.spawn_step_pump();

        match mode {
            IngestionMode::Foreground => {
                self.location.resume();
                self.spawn_foreground_pump();
            }
            IngestionMode::Background => {
                if *self.host_foreground.lock() {
                    self.spawn_poll();
                }
            }
        }

        info!("run {run_id} started ({mode:?})");
        Ok(())
    }

    pub fn pause(&self) -> Result<(), LifecycleError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != RunState::Running {
                return Err(LifecycleError::NotRunning);
            }
            inner.state = RunState::Paused;
            inner.pause_started = Some(Instant::now());
        }
        self.location.pause();
        self.steps.stop();
        self.stop_poll();
        info!("run paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), LifecycleError> {
        let mode = {
            let mut inner = self.inner.lock();
            if inner.state != RunState::Paused {
                return Err(LifecycleError::NotRunning);
            }
            if let Some(p) = inner.pause_started.take() {
                inner.paused_total += p.elapsed();
            }
            inner.state = RunState::Running;
            inner.mode
        };
        self.location.resume();
        self.spawn_step_pump();
        if mode == Some(IngestionMode::Background) && *self.host_foreground.lock() {
            self.spawn_poll();
        }
        info!("run resumed");
        Ok(())
    }

    /// Ends the run and assembles the final record. Submission is
    /// spawned, never awaited: failures route to the offline queue and
    /// the state machine reaches `Finished` regardless.
    pub async fn end(&self) -> Result<FinalRecord, LifecycleError> {
        let mut record = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, RunState::Running | RunState::Paused) {
                return Err(LifecycleError::NotRunning);
            }
            if let Some(p) = inner.pause_started.take() {
                inner.paused_total += p.elapsed();
            }

            let now_ms = inner.last_seen_ms.unwrap_or(inner.started_wall_ms);
            let snapshot = StatsSnapshot {
                heart_rate_bpm: inner.current.heart_rate_bpm,
                cadence_spm: inner.current.cadence_spm,
                calories_kcal: inner.current.calories_kcal,
            };
            inner.aggregator.finalize(&snapshot, now_ms);

            inner.state = RunState::Finished;
            let record = inner.assemble_record();
            inner.final_record = Some(record.clone());
            record
        };

        self.teardown_ingestion().await;

        // Device-sourced calories take precedence in the final record.
        let query = CalorieQuery {
            distance_m: record.distance_m,
            duration_s: record.duration_s,
            weight_kg: self.config.profile.weight_kg,
            heart_rate_bpm: record.stats.heart_rate_bpm,
        };
        if let sensor_core::SensorDataResult::Data { value, source } =
            self.resolver.resolve_calories(&query).await
        {
            debug!("final calories from {source:?}");
            record.stats.calories_kcal = Some(value);
            self.inner.lock().final_record = Some(record.clone());
        }

        if record.distance_m < self.config.min_run_distance_m {
            info!(
                "run {} below minimum distance ({:.1} m), skipping submission",
                record.run_id, record.distance_m
            );
            return Ok(record);
        }

        let service = self.service.clone();
        let queue = self.queue.clone();
        let main_record = record.clone();
        tokio::spawn(async move {
            match service.end_run(&main_record).await {
                Ok(server) => info!("run {} accepted as {}", main_record.run_id, server.record_id),
                Err(e) => {
                    warn!("run submission failed ({e}), queueing for retry");
                    queue.enqueue(QueuedPayload::RunRecord(main_record));
                }
            }
        });

        let service = self.service.clone();
        let queue = self.queue.clone();
        let run_id = record.run_id.clone();
        let segments = record.segments.clone();
        tokio::spawn(async move {
            if let Err(e) = service.upload_segments(&run_id, &segments).await {
                warn!("segment upload failed ({e}), queueing for retry");
                queue.enqueue(QueuedPayload::Segments { run_id, segments });
            }
        });

        Ok(record)
    }

    /// Back to `Idle`, discarding all run state. Safe in any state.
    pub async fn reset(&self) {
        self.teardown_ingestion().await;
        let mut inner = self.inner.lock();
        *inner = RunInner::fresh(&self.config);
    }

    /// The host app moved to the background: background-mode polling
    /// stops entirely (the durable store keeps recording without us).
    pub fn host_backgrounded(&self) {
        *self.host_foreground.lock() = false;
        self.stop_poll();
    }

    /// The host app returned to the foreground: restart polling if a
    /// background-mode run is active.
    pub fn host_foregrounded(&self) {
        *self.host_foreground.lock() = true;
        let inner = self.inner.lock();
        if inner.state == RunState::Running && inner.mode == Some(IngestionMode::Background) {
            drop(inner);
            self.spawn_poll();
        }
    }

    // --- produced interface ---

    pub fn state(&self) -> RunState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> RunningStats {
        self.inner.lock().current.clone()
    }

    pub fn distance_m(&self) -> f64 {
        self.inner.lock().distance_m
    }

    pub fn elapsed_s(&self) -> f64 {
        self.inner.lock().elapsed_s()
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.inner.lock().aggregator.segments()
    }

    pub fn total_steps(&self) -> u64 {
        self.inner.lock().total_steps
    }

    pub fn final_record(&self) -> Option<FinalRecord> {
        self.inner.lock().final_record.clone()
    }

    // --- ingestion plumbing ---

    async fn teardown_ingestion(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.stop_poll();
        self.location.pause();
        self.steps.stop();
        self.resolver.stop_all().await;
    }

    /// Foreground mode: a dedicated thread drains the subscription and
    /// feeds samples through the lifecycle lock, one at a time.
    fn spawn_foreground_pump(&self) {
        let rx = self.location.subscribe();
        let inner = self.inner.clone();
        let resolver = self.resolver.clone();
        let epoch = self.epoch.clone();
        let my_epoch = epoch.load(Ordering::SeqCst);
        std::thread::spawn(move || loop {
            if epoch.load(Ordering::SeqCst) != my_epoch {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(sample) => {
                    let hr = resolver.latest(Metric::HeartRate).value();
                    let cadence = resolver.latest(Metric::Cadence).value();
                    let mut inner = inner.lock();
                    if inner.state == RunState::Running {
                        inner.process_sample(sample, hr, cadence);
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        });
    }

    /// Background mode: drain the durable store once per second while
    /// the host is foregrounded.
    fn spawn_poll(&self) {
        let mut shutdown_slot = self.poll_shutdown.lock();
        if shutdown_slot.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *shutdown_slot = Some(tx);
        drop(shutdown_slot);

        let inner = self.inner.clone();
        let store = self.store.clone();
        let resolver = self.resolver.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let samples = match store.read_all() {
                            Ok(s) => s,
                            Err(e) => {
                                warn!("sample store read failed: {e}");
                                continue;
                            }
                        };
                        if samples.is_empty() {
                            continue;
                        }
                        if let Err(e) = store.clear() {
                            warn!("sample store clear failed: {e}");
                        }
                        let hr = resolver.latest(Metric::HeartRate).value();
                        let cadence = resolver.latest(Metric::Cadence).value();
                        let mut inner = inner.lock();
                        if inner.state != RunState::Running {
                            continue;
                        }
                        for sample in samples {
                            inner.process_sample(sample, hr, cadence);
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn stop_poll(&self) {
        if let Some(tx) = self.poll_shutdown.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Best-effort pedometer hookup; a missing step sensor only costs
    /// the cadence fallback.
    fn spawn_step_pump(&self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        if let Err(e) = self.steps.start(tx) {
            warn!("step counter unavailable: {e}");
            return;
        }
        let inner = self.inner.clone();
        let epoch = self.epoch.clone();
        let my_epoch = epoch.load(Ordering::SeqCst);
        std::thread::spawn(move || loop {
            if epoch.load(Ordering::SeqCst) != my_epoch {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(reading) => {
                    let mut inner = inner.lock();
                    inner.step_cadence_spm = Some(reading.cadence_spm);
                    inner.total_steps = reading.total_steps;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        });
    }
}
