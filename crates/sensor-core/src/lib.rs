//! Sensor source abstraction shared by the priority resolver and the
//! platform adapters (sports watch, wrist wearable, phone health
//! service).

use serde::{Deserialize, Serialize};

/// Physical tier a reading came from, highest priority first.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    SportsWatch,
    Wearable,
    PhoneHealth,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum Metric {
    HeartRate,
    Cadence,
}

/// One delivery from a monitoring session. `NoData` means the source
/// is reachable but cannot produce a reading; it drives fallback and
/// is not an error.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SensorReading<T> {
    Value(T),
    NoData,
}

/// A resolved value plus the tier that produced it, or `None` when
/// every tier is exhausted.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub enum SensorDataResult<T> {
    Data { value: T, source: SourceKind },
    None,
}

impl<T: Copy> SensorDataResult<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            SensorDataResult::Data { value, .. } => Some(*value),
            SensorDataResult::None => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("{0}")]
    Msg(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ReadingTx = tokio::sync::mpsc::UnboundedSender<SensorReading<u32>>;
pub type ReadingRx = tokio::sync::mpsc::UnboundedReceiver<SensorReading<u32>>;

pub fn reading_channel() -> (ReadingTx, ReadingRx) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Inputs for a device-side calorie estimate.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct CalorieQuery {
    pub distance_m: f64,
    pub duration_s: f64,
    pub weight_kg: f64,
    pub heart_rate_bpm: Option<u32>,
}

/// Capability trait for one sensor tier. The resolver iterates
/// implementations in priority order and never branches on platform.
///
/// For the wearable tier, `is_available` covers "companion app
/// installed and reachable".
#[async_trait::async_trait]
pub trait SensorSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn is_available(&self) -> bool;

    async fn has_permission(&self) -> bool;

    /// Begins delivering readings for `metric` into `tx` until stopped.
    async fn start_monitoring(&self, metric: Metric, tx: ReadingTx) -> Result<(), SensorError>;

    async fn stop_monitoring(&self, metric: Metric);

    /// Point-in-time query outside any monitoring session.
    async fn current_value(&self, metric: Metric) -> SensorReading<u32>;

    /// The device's own calorie figure, when it keeps one.
    async fn calorie_estimate(&self, query: &CalorieQuery) -> SensorReading<f64>;
}
