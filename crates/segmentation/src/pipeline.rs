//! Shapes shared by every pipeline: the uncommitted result a pipeline body
//! returns and the committed output the engine hands back.

use audience_core::types::AudienceSegment;
use audience_core::{SegmentationError, SegmentationResult};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::builder::SegmentDraft;

/// What a pipeline body produces before anything touches the registry.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun<D> {
    pub drafts: Vec<SegmentDraft>,
    pub diagnostics: D,
}

/// Committed segments plus the pipeline's diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput<D> {
    pub segments: Vec<AudienceSegment>,
    pub diagnostics: D,
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> SegmentationResult<()> {
    if cancel.is_cancelled() {
        Err(SegmentationError::Cancelled)
    } else {
        Ok(())
    }
}
