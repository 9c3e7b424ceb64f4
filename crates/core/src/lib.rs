pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use config::EngineConfig;
pub use error::{ErrorKind, FailureReport, SegmentationError, SegmentationResult};
pub use metrics::{MetricRow, MetricsCalculator};
pub use types::{AudienceSegment, CustomerRecord, LifecycleStage, RfmScores, SegmentType};
