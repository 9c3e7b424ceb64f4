//! Audience segmentation pipelines: RFM lifecycle scoring, behavioral
//! clustering, demographic breakdowns, lookalike modeling and criteria-based
//! custom segments, plus the registry their results are committed to.

pub mod behavioral;
pub mod builder;
pub mod clustering;
pub mod criteria;
pub mod custom;
pub mod demographic;
pub mod engine;
pub mod forest;
pub mod lifecycle;
pub mod lookalike;
pub mod pipeline;
pub mod registry;
pub mod rfm;
pub mod scaling;
pub mod source;

pub use builder::{SegmentBuilder, SegmentDraft};
pub use criteria::{Criteria, Criterion};
pub use demographic::DemographicOptions;
pub use engine::{LookalikeOptions, SegmentationEngine};
pub use pipeline::{PipelineOutput, PipelineRun};
pub use registry::SegmentRegistry;
pub use source::{CustomerDataSource, InMemoryDataSource};
