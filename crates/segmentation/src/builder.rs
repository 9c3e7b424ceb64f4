//! Segment builder — fluent API for assembling an `AudienceSegment` together
//! with the customer ids it covers.

use audience_core::types::{AudienceSegment, LifecycleStage, RfmScores, SegmentType};
use audience_core::{SegmentationError, SegmentationResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A fully built segment that has not been committed to a registry yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDraft {
    pub segment: AudienceSegment,
    pub members: Vec<String>,
}

pub struct SegmentBuilder {
    name: String,
    description: String,
    segment_type: SegmentType,
    lifecycle_stage: Option<LifecycleStage>,
    size: Option<usize>,
    criteria: Map<String, Value>,
    performance_metrics: BTreeMap<String, f64>,
    platforms: BTreeSet<String>,
    confidence_score: f64,
    predicted_ltv: f64,
    recommended_actions: Vec<String>,
    rfm_scores: Option<RfmScores>,
    behavioral_patterns: Option<Map<String, Value>>,
    members: Vec<String>,
}

impl SegmentBuilder {
    pub fn new(name: impl Into<String>, segment_type: SegmentType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            segment_type,
            lifecycle_stage: None,
            size: None,
            criteria: Map::new(),
            performance_metrics: BTreeMap::new(),
            platforms: BTreeSet::new(),
            confidence_score: 0.0,
            predicted_ltv: 0.0,
            recommended_actions: Vec::new(),
            rfm_scores: None,
            behavioral_patterns: None,
            members: Vec::new(),
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn lifecycle_stage(mut self, stage: LifecycleStage) -> Self {
        self.lifecycle_stage = Some(stage);
        self
    }

    /// Overrides the size otherwise taken from the member count.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn criterion(mut self, key: impl Into<String>, value: Value) -> Self {
        self.criteria.insert(key.into(), value);
        self
    }

    pub fn criteria(mut self, criteria: Map<String, Value>) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn metrics(mut self, metrics: BTreeMap<String, f64>) -> Self {
        self.performance_metrics = metrics;
        self
    }

    pub fn platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn confidence(mut self, score: f64) -> Self {
        self.confidence_score = score;
        self
    }

    pub fn predicted_ltv(mut self, ltv: f64) -> Self {
        self.predicted_ltv = ltv;
        self
    }

    pub fn recommended_actions(mut self, actions: Vec<String>) -> Self {
        self.recommended_actions = actions;
        self
    }

    pub fn rfm_scores(mut self, scores: RfmScores) -> Self {
        self.rfm_scores = Some(scores);
        self
    }

    pub fn behavioral_patterns(mut self, patterns: Map<String, Value>) -> Self {
        self.behavioral_patterns = Some(patterns);
        self
    }

    pub fn members(mut self, members: Vec<String>) -> Self {
        self.members = members;
        self
    }

    /// Builds the segment, refusing anything smaller than `min_size`.
    pub fn build(self, min_size: usize) -> SegmentationResult<SegmentDraft> {
        let size = self.size.unwrap_or(self.members.len());
        if size < min_size {
            return Err(SegmentationError::SegmentTooSmall {
                size,
                minimum: min_size,
            });
        }

        let now = chrono::Utc::now();
        let segment = AudienceSegment {
            id: Uuid::new_v4(),
            name: self.name,
            description: self.description,
            segment_type: self.segment_type,
            lifecycle_stage: self.lifecycle_stage,
            size,
            criteria: self.criteria,
            performance_metrics: self.performance_metrics,
            platforms: self.platforms,
            created_date: now,
            last_updated: now,
            is_active: true,
            confidence_score: finite_or_zero(self.confidence_score).clamp(0.0, 1.0),
            predicted_ltv: finite_or_zero(self.predicted_ltv).max(0.0),
            recommended_actions: self.recommended_actions,
            rfm_scores: self.rfm_scores,
            behavioral_patterns: self.behavioral_patterns,
        };

        Ok(SegmentDraft {
            segment,
            members: self.members,
        })
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn members(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{i}")).collect()
    }

    #[test]
    fn test_build_below_minimum_fails() {
        let err = SegmentBuilder::new("tiny", SegmentType::Custom)
            .members(members(3))
            .build(50)
            .unwrap_err();
        assert!(matches!(
            err,
            SegmentationError::SegmentTooSmall { size: 3, minimum: 50 }
        ));
    }

    #[test]
    fn test_build_sets_defaults() {
        let draft = SegmentBuilder::new("RFM: Champions", SegmentType::Rfm)
            .lifecycle_stage(LifecycleStage::Champions)
            .criterion("lifecycle_stage", json!("champions"))
            .platforms(["meta", "google"])
            .members(members(60))
            .build(50)
            .unwrap();
        let seg = &draft.segment;
        assert_eq!(seg.size, 60);
        assert!(seg.is_active);
        assert_eq!(seg.created_date, seg.last_updated);
        assert_eq!(seg.platforms.len(), 2);
        assert_eq!(seg.criteria["lifecycle_stage"], json!("champions"));
        assert_eq!(draft.members.len(), 60);
    }

    #[test]
    fn test_build_clamps_scores() {
        let draft = SegmentBuilder::new("x", SegmentType::Lookalike)
            .confidence(1.7)
            .predicted_ltv(-5.0)
            .size(10)
            .build(1)
            .unwrap();
        assert_eq!(draft.segment.confidence_score, 1.0);
        assert_eq!(draft.segment.predicted_ltv, 0.0);

        let nan = SegmentBuilder::new("y", SegmentType::Custom)
            .confidence(f64::NAN)
            .size(1)
            .build(1)
            .unwrap();
        assert_eq!(nan.segment.confidence_score, 0.0);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = SegmentBuilder::new("a", SegmentType::Custom).size(1).build(1).unwrap();
        let b = SegmentBuilder::new("a", SegmentType::Custom).size(1).build(1).unwrap();
        assert_ne!(a.segment.id, b.segment.id);
    }
}
