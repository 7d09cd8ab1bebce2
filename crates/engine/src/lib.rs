//! Real-time running telemetry engine: filters raw fixes, accumulates
//! distance/pace/calorie stats, cuts fixed-distance segments and
//! resolves which sensor tier supplies heart rate and cadence.

pub mod lifecycle;
pub mod resolver;
pub mod segments;
pub mod services;
pub mod store;

pub use lifecycle::{IngestionMode, LifecycleConfig, LifecycleError, RunningLifecycle};
pub use resolver::SensorPriorityResolver;
pub use segments::{SegmentAggregator, StatsSnapshot, SEGMENT_DISTANCE_M};
pub use services::{
    LocationProvider, OfflineQueue, QueuedPayload, RunService, ServiceError, StepCounter,
    StepReading,
};
pub use store::{JsonlSampleStore, MemorySampleStore, SampleStore};
