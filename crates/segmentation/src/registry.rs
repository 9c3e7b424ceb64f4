//! Append-only store of produced segments, scoped to the engine's lifetime.

use audience_core::types::{AudienceSegment, SegmentType};
use audience_core::{SegmentationError, SegmentationResult};
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::builder::SegmentDraft;

/// Segments keyed by id, with the customer ids each one covers.
///
/// Inserts never overwrite and a commit is atomic across its drafts. There is
/// no eviction.
pub struct SegmentRegistry {
    segments: DashMap<Uuid, AudienceSegment>,
    members: DashMap<Uuid, Vec<String>>,
    warn_above: usize,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::with_warning_threshold(usize::MAX)
    }

    /// A registry that logs a warning on every commit once it holds more than
    /// `warn_above` segments.
    pub fn with_warning_threshold(warn_above: usize) -> Self {
        Self {
            segments: DashMap::new(),
            members: DashMap::new(),
            warn_above,
        }
    }

    /// Registers a segment produced outside the engine's pipelines.
    pub fn register(
        &self,
        segment: AudienceSegment,
        members: Vec<String>,
    ) -> SegmentationResult<Uuid> {
        let id = segment.id;
        match self.segments.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SegmentationError::validation(format!(
                    "segment {id} is already registered"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                // Members first so a visible segment always has its members.
                self.members.insert(id, members);
                slot.insert(segment);
            }
        }
        debug!(segment_id = %id, "Segment registered");
        Ok(id)
    }

    /// Commits a pipeline's drafts and returns the committed segments.
    ///
    /// All drafts land or none do: ids are checked up front, and a collision
    /// that races in during insertion rolls back what this call inserted.
    pub fn commit(&self, drafts: Vec<SegmentDraft>) -> SegmentationResult<Vec<AudienceSegment>> {
        let mut ids = HashSet::with_capacity(drafts.len());
        for draft in &drafts {
            let id = draft.segment.id;
            if !ids.insert(id) || self.segments.contains_key(&id) {
                return Err(SegmentationError::validation(format!(
                    "segment {id} is already registered"
                )));
            }
        }

        let mut committed = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let segment = draft.segment.clone();
            if let Err(err) = self.register(draft.segment, draft.members) {
                self.rollback(&committed);
                return Err(err);
            }
            committed.push(segment);
        }
        metrics::counter!("segmentation.registry_commits").increment(1);
        metrics::counter!("segmentation.segments_created").increment(committed.len() as u64);

        let total = self.segments.len();
        if total > self.warn_above {
            warn!(
                segments = total,
                threshold = self.warn_above,
                "Segment registry exceeds configured size"
            );
        }
        Ok(committed)
    }

    fn rollback(&self, inserted: &[AudienceSegment]) {
        for segment in inserted {
            self.segments.remove(&segment.id);
            self.members.remove(&segment.id);
        }
        warn!(rolled_back = inserted.len(), "Segment commit rolled back");
    }

    pub fn get(&self, id: &Uuid) -> Option<AudienceSegment> {
        self.segments.get(id).map(|s| s.clone())
    }

    pub fn members(&self, id: &Uuid) -> Option<Vec<String>> {
        self.members.get(id).map(|m| m.clone())
    }

    /// All segments, oldest first.
    pub fn list(&self) -> Vec<AudienceSegment> {
        let mut all: Vec<AudienceSegment> =
            self.segments.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.created_date.cmp(&b.created_date).then(a.id.cmp(&b.id)));
        all
    }

    pub fn by_type(&self, segment_type: SegmentType) -> Vec<AudienceSegment> {
        self.list()
            .into_iter()
            .filter(|s| s.segment_type == segment_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
