//! Custom segments: filter the population with caller-supplied criteria and
//! promote the matched rows to a single segment.

use audience_core::config::EngineConfig;
use audience_core::metrics::{BaselineComparison, MetricRow};
use audience_core::types::{CustomerRecord, SegmentType};
use audience_core::{MetricsCalculator, SegmentationError, SegmentationResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::builder::SegmentBuilder;
use crate::criteria::Criteria;
use crate::pipeline::{check_cancelled, PipelineRun};

#[derive(Debug, Clone, Serialize)]
pub struct CustomDiagnostics {
    pub matched_rows: usize,
    pub distinct_customers: usize,
    pub preview: Vec<CustomerRecord>,
    pub performance_comparison: BTreeMap<String, BaselineComparison>,
    pub ignored_criteria: Vec<String>,
}

fn metric_row(record: &CustomerRecord) -> MetricRow {
    MetricRow {
        revenue: record.number("revenue"),
        conversions: record
            .number("conversions")
            .or_else(|| record.number("conversion_count")),
        clicks: record.number("clicks"),
        impressions: record.number("impressions"),
        spend: record.number("spend"),
        frequency: record.number("frequency"),
        predicted_ltv: record.number("predicted_ltv"),
    }
}

/// Filters `records` by `criteria_map` and builds one custom segment.
///
/// The segment size is the number of matched rows. Fails with
/// `SegmentTooSmall` when fewer rows than the configured minimum match.
pub fn analyze(
    records: &[CustomerRecord],
    criteria_map: &Map<String, Value>,
    name: &str,
    description: Option<&str>,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> SegmentationResult<PipelineRun<CustomDiagnostics>> {
    if name.trim().is_empty() {
        return Err(SegmentationError::validation("segment name must not be empty"));
    }
    let criteria = Criteria::parse(criteria_map)?;
    check_cancelled(cancel)?;
    let (applicable, ignored) = criteria.applicable_to(records);
    if !ignored.is_empty() {
        warn!(fields = ?ignored, "Criteria reference fields absent from every record; ignoring them");
    }

    let matched = applicable.filter(records);
    check_cancelled(cancel)?;
    if matched.len() < config.min_segment_size {
        return Err(SegmentationError::SegmentTooSmall {
            size: matched.len(),
            minimum: config.min_segment_size,
        });
    }

    let rows: Vec<MetricRow> = matched.iter().map(|r| metric_row(r)).collect();
    let metrics = MetricsCalculator::segment_metrics(&rows);
    let revenues: Vec<f64> = rows.iter().filter_map(|r| r.revenue).collect();
    let confidence = MetricsCalculator::segment_confidence(matched.len(), &revenues);
    let performance_comparison = MetricsCalculator::baseline_comparison(
        &metrics,
        config.custom.baseline_roas,
        config.custom.baseline_ctr,
    );

    let mut seen = HashSet::new();
    let members: Vec<String> = matched
        .iter()
        .filter_map(|r| r.customer_id())
        .filter(|id| seen.insert(id.clone()))
        .collect();

    let platforms: Vec<String> = {
        let found: BTreeSet<&str> =
            matched.iter().filter_map(|r| r.text("platform")).collect();
        if found.is_empty() {
            config.default_platforms.clone()
        } else {
            found.into_iter().map(str::to_string).collect()
        }
    };

    let description = description
        .map(str::to_string)
        .unwrap_or_else(|| format!("Custom segment with {} criteria", criteria.len()));

    let draft = SegmentBuilder::new(name, SegmentType::Custom)
        .description(description)
        .size(matched.len())
        .criteria(criteria_map.clone())
        .metrics(metrics)
        .platforms(platforms)
        .confidence(confidence)
        .members(members)
        .build(config.min_segment_size)?;

    let diagnostics = CustomDiagnostics {
        matched_rows: matched.len(),
        distinct_customers: draft.members.len(),
        preview: matched
            .iter()
            .take(config.custom.preview_rows)
            .map(|r| (*r).clone())
            .collect(),
        performance_comparison,
        ignored_criteria: ignored,
    };

    info!(
        segment = name,
        matched_rows = diagnostics.matched_rows,
        confidence,
        "Custom segment built"
    );

    Ok(PipelineRun {
        drafts: vec![draft],
        diagnostics,
    })
}
