//! Collaborator interfaces consumed by the lifecycle. The engine owns
//! only the traits; hosts supply platform implementations, tests
//! supply fakes.

use model::{FinalRecord, GpsSample, Segment, ServerRecord};
use sensor_core::SensorError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Msg(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Location subsystem. In foreground mode fixes arrive over the
/// subscription channel; in background mode they land in the durable
/// `SampleStore` instead and the engine polls.
pub trait LocationProvider: Send + Sync {
    fn has_permission(&self) -> bool;

    fn subscribe(&self) -> crossbeam_channel::Receiver<GpsSample>;

    fn pause(&self);

    fn resume(&self);

    fn cumulative_distance_m(&self) -> f64;

    fn history(&self) -> Vec<GpsSample>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepReading {
    pub total_steps: u64,
    pub cadence_spm: u32,
}

/// Pedometer. Best-effort: an unavailable step sensor is not fatal to
/// a run.
pub trait StepCounter: Send + Sync {
    fn start(&self, tx: crossbeam_channel::Sender<StepReading>) -> Result<(), SensorError>;

    fn stop(&self);
}

/// Run registration/completion backend.
#[async_trait::async_trait]
pub trait RunService: Send + Sync {
    async fn start_run(&self) -> Result<String, ServiceError>;

    /// Server response carries authoritative point/reward data.
    async fn end_run(&self, record: &FinalRecord) -> Result<ServerRecord, ServiceError>;

    async fn upload_segments(&self, run_id: &str, segments: &[Segment]) -> Result<(), ServiceError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueuedPayload {
    RunRecord(FinalRecord),
    Segments { run_id: String, segments: Vec<Segment> },
}

/// Durable retry queue. The engine only triggers `enqueue` on
/// submission failure; the retry sweep lives elsewhere.
pub trait OfflineQueue: Send + Sync {
    fn enqueue(&self, payload: QueuedPayload);
}
