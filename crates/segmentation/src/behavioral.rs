//! Behavioral segmentation: per-customer engagement aggregates, standardised
//! and clustered with seeded k-means. Clusters reaching the minimum segment
//! size become segments; every cluster is reported in the diagnostics.

use audience_core::config::EngineConfig;
use audience_core::metrics::MetricRow;
use audience_core::types::{CustomerRecord, SegmentType};
use audience_core::{MetricsCalculator, SegmentationError, SegmentationResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::builder::SegmentBuilder;
use crate::clustering::{cluster_count, kmeans};
use crate::pipeline::{check_cancelled, PipelineRun};
use crate::scaling::StandardScaler;

pub const REQUIRED_FIELDS: [&str; 5] = ["customer_id", "clicks", "impressions", "conversions", "platform"];

pub const FEATURE_NAMES: [&str; 6] = [
    "total_clicks",
    "mean_clicks",
    "total_impressions",
    "mean_impressions",
    "total_conversions",
    "conversion_events",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralFeatures {
    pub customer_id: String,
    pub total_clicks: f64,
    pub mean_clicks: f64,
    pub total_impressions: f64,
    pub mean_impressions: f64,
    pub total_conversions: f64,
    pub conversion_events: usize,
    pub dominant_platform: String,
    pub revenue: Option<f64>,
    pub spend: Option<f64>,
}

impl BehavioralFeatures {
    pub fn vector(&self) -> [f64; 6] {
        [
            self.total_clicks,
            self.mean_clicks,
            self.total_impressions,
            self.mean_impressions,
            self.total_conversions,
            self.conversion_events as f64,
        ]
    }

    fn metric_row(&self) -> MetricRow {
        MetricRow {
            revenue: self.revenue,
            conversions: Some(self.total_conversions),
            clicks: Some(self.total_clicks),
            impressions: Some(self.total_impressions),
            spend: self.spend,
            frequency: Some(self.conversion_events as f64),
            predicted_ltv: None,
        }
    }
}

/// Raw clustering output for one cluster, promoted or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralCluster {
    pub cluster_id: usize,
    pub name: String,
    pub centroid: Vec<f64>,
    pub size: usize,
    pub metrics: BTreeMap<String, f64>,
    pub dominant_platform: String,
    pub promoted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub customer_id: String,
    pub cluster_id: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BehavioralDiagnostics {
    pub k: usize,
    pub algorithm: &'static str,
    pub seed: u64,
    pub feature_names: Vec<String>,
    pub zero_variance_features: Vec<String>,
    pub clusters: Vec<BehavioralCluster>,
    pub assignments: Vec<ClusterAssignment>,
    pub inertia: f64,
    pub insights: Vec<String>,
}

/// Most frequent value; ties go to the lexicographically smallest.
pub fn dominant_value<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    // BTreeMap iterates in key order, so the first maximum is the smallest key.
    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value.to_string())
}

#[derive(Default)]
struct Accumulator {
    clicks: f64,
    impressions: f64,
    conversions: f64,
    rows: usize,
    platforms: Vec<String>,
    revenue: Option<f64>,
    spend: Option<f64>,
}

/// One feature row per customer, in first-appearance order.
pub fn extract_features(records: &[CustomerRecord]) -> SegmentationResult<Vec<BehavioralFeatures>> {
    if records.is_empty() {
        return Err(SegmentationError::validation(
            "No data provided for behavioral analysis",
        ));
    }

    let missing: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.missing_fields(&REQUIRED_FIELDS))
        .collect();
    if !missing.is_empty() {
        let mut names: Vec<&str> = missing.into_iter().collect();
        names.sort_by_key(|name| REQUIRED_FIELDS.iter().position(|f| f == name));
        return Err(SegmentationError::validation(format!(
            "Missing required fields: {names:?}"
        )));
    }

    let mut order: Vec<String> = Vec::new();
    let mut accumulators: HashMap<String, Accumulator> = HashMap::new();
    for (row, record) in records.iter().enumerate() {
        let numeric = |field: &str| {
            record.number(field).ok_or_else(|| {
                SegmentationError::validation(format!("Row {row}: {field} must be numeric"))
            })
        };
        let customer_id = record.customer_id().ok_or_else(|| {
            SegmentationError::validation(format!("Row {row}: customer_id must be a string or number"))
        })?;
        let platform = record
            .text("platform")
            .ok_or_else(|| SegmentationError::validation(format!("Row {row}: platform must be a string")))?
            .to_string();
        let (clicks, impressions, conversions) =
            (numeric("clicks")?, numeric("impressions")?, numeric("conversions")?);

        let acc = accumulators.entry(customer_id.clone()).or_insert_with(|| {
            order.push(customer_id);
            Accumulator::default()
        });
        acc.clicks += clicks;
        acc.impressions += impressions;
        acc.conversions += conversions;
        acc.rows += 1;
        acc.platforms.push(platform);
        if let Some(v) = record.number("revenue") {
            acc.revenue = Some(acc.revenue.unwrap_or(0.0) + v);
        }
        if let Some(v) = record.number("spend") {
            acc.spend = Some(acc.spend.unwrap_or(0.0) + v);
        }
    }

    let features = order
        .into_iter()
        .filter_map(|customer_id| {
            let acc = accumulators.remove(&customer_id)?;
            let rows = acc.rows as f64;
            Some(BehavioralFeatures {
                total_clicks: acc.clicks,
                mean_clicks: MetricsCalculator::safe_div(acc.clicks, rows),
                total_impressions: acc.impressions,
                mean_impressions: MetricsCalculator::safe_div(acc.impressions, rows),
                total_conversions: acc.conversions,
                conversion_events: acc.rows,
                dominant_platform: dominant_value(acc.platforms.iter().map(String::as_str))
                    .unwrap_or_else(|| "unknown".to_string()),
                revenue: acc.revenue,
                spend: acc.spend,
                customer_id,
            })
        })
        .collect();
    Ok(features)
}

/// Best/worst group by ROAS and the number of patterns found.
pub fn insights(clusters: &[BehavioralCluster]) -> Vec<String> {
    if clusters.is_empty() {
        return vec!["No behavioral clusters found".to_string()];
    }

    let mut ranked: Vec<(f64, usize)> = clusters
        .iter()
        .map(|c| (c.metrics.get("roas").copied().unwrap_or(0.0), c.size))
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut out = Vec::with_capacity(3);
    if let (Some(best), Some(worst)) = (ranked.first(), ranked.last()) {
        out.push(format!(
            "Highest performing behavioral group has {:.2} ROAS with {} customers",
            best.0, best.1
        ));
        out.push(format!(
            "Opportunity to improve: Group with {:.2} ROAS needs attention",
            worst.0
        ));
    }
    out.push(format!(
        "Identified {} distinct behavioral patterns in your audience",
        clusters.len()
    ));
    out
}

pub fn analyze(
    records: &[CustomerRecord],
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> SegmentationResult<PipelineRun<BehavioralDiagnostics>> {
    let features = extract_features(records)?;
    check_cancelled(cancel)?;

    let n = features.len();
    let mut matrix = Array2::<f64>::zeros((n, FEATURE_NAMES.len()));
    for (i, f) in features.iter().enumerate() {
        for (j, v) in f.vector().into_iter().enumerate() {
            matrix[[i, j]] = v;
        }
    }

    let (scaler, scaled) = StandardScaler::fit_transform(&matrix)?;
    if n > 1 {
        scaler.ensure_informative()?;
    }

    let k = cluster_count(n, &config.clustering);
    let result = kmeans(&scaled, k, &config.clustering, cancel)?;

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); result.centroids.nrows()];
    for (i, &c) in result.assignments.iter().enumerate() {
        members[c].push(i);
    }

    let mut clusters = Vec::with_capacity(members.len());
    let mut drafts = Vec::new();
    for (cluster_id, idx) in members.iter().enumerate() {
        let rows: Vec<MetricRow> = idx.iter().map(|&i| features[i].metric_row()).collect();
        let metrics = MetricsCalculator::segment_metrics(&rows);
        let dominant_platform =
            dominant_value(idx.iter().map(|&i| features[i].dominant_platform.as_str()))
                .unwrap_or_else(|| "unknown".to_string());
        let centroid: Vec<f64> = result.centroids.row(cluster_id).to_vec();
        let name = format!("Behavioral Group {}", cluster_id + 1);
        let promoted = idx.len() >= config.min_segment_size;

        if promoted {
            let mut patterns = Map::new();
            patterns.insert("cluster_center".to_string(), json!(centroid));
            patterns.insert("feature_names".to_string(), json!(FEATURE_NAMES));
            patterns.insert("dominant_platform".to_string(), json!(dominant_platform));

            let draft = SegmentBuilder::new(format!("Behavioral: {name}"), SegmentType::Behavioral)
                .description(format!("Behavioral cluster with {} customers", idx.len()))
                .criterion("cluster_id", json!(format!("cluster_{cluster_id}")))
                .metrics(metrics.clone())
                .platforms([dominant_platform.clone()])
                .behavioral_patterns(patterns)
                .members(idx.iter().map(|&i| features[i].customer_id.clone()).collect())
                .build(config.min_segment_size)?;
            drafts.push(draft);
        } else {
            debug!(
                cluster_id,
                size = idx.len(),
                minimum = config.min_segment_size,
                "Cluster below minimum segment size"
            );
        }

        clusters.push(BehavioralCluster {
            cluster_id,
            name,
            centroid,
            size: idx.len(),
            metrics,
            dominant_platform,
            promoted,
        });
    }

    let diagnostics = BehavioralDiagnostics {
        k: result.centroids.nrows(),
        algorithm: "kmeans",
        seed: config.clustering.seed,
        feature_names: FEATURE_NAMES.iter().map(|f| f.to_string()).collect(),
        zero_variance_features: scaler
            .zero_variance_columns()
            .into_iter()
            .map(|j| FEATURE_NAMES[j].to_string())
            .collect(),
        assignments: features
            .iter()
            .zip(&result.assignments)
            .map(|(f, &cluster_id)| ClusterAssignment {
                customer_id: f.customer_id.clone(),
                cluster_id,
            })
            .collect(),
        inertia: result.inertia,
        insights: insights(&clusters),
        clusters,
    };

    info!(
        customers = n,
        k = diagnostics.k,
        segments = drafts.len(),
        "Behavioral clustering complete"
    );

    Ok(PipelineRun {
        drafts,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(customer: &str, clicks: f64, impressions: f64, conversions: f64, platform: &str) -> CustomerRecord {
        CustomerRecord::from(json!({
            "customer_id": customer,
            "clicks": clicks,
            "impressions": impressions,
            "conversions": conversions,
            "platform": platform,
        }))
    }

    /// Two clearly separated engagement profiles, `per_group` customers each.
    fn two_profiles(per_group: usize) -> Vec<CustomerRecord> {
        let mut records = Vec::new();
        for i in 0..per_group {
            let j = (i % 7) as f64;
            records.push(rec(&format!("low{i}"), 1.0 + j * 0.1, 100.0 + j, 0.0, "meta"));
            records.push(rec(&format!("high{i}"), 50.0 + j, 2000.0 + j * 10.0, 5.0, "google"));
        }
        records
    }

    #[test]
    fn test_dominant_value_tie_break() {
        assert_eq!(
            dominant_value(["tiktok", "google", "tiktok", "google"]).as_deref(),
            Some("google")
        );
        assert_eq!(dominant_value(["meta", "google", "meta"]).as_deref(), Some("meta"));
        assert_eq!(dominant_value(Vec::<&str>::new()), None);
    }

    #[test]
    fn test_extract_features_aggregates() {
        let records = vec![
            rec("a", 2.0, 100.0, 1.0, "meta"),
            rec("a", 4.0, 300.0, 0.0, "google"),
            rec("a", 0.0, 200.0, 2.0, "google"),
            rec("b", 1.0, 10.0, 0.0, "tiktok"),
        ];
        let features = extract_features(&records).unwrap();
        assert_eq!(features.len(), 2);
        let a = &features[0];
        assert_eq!(a.customer_id, "a");
        assert_eq!(a.total_clicks, 6.0);
        assert_eq!(a.mean_clicks, 2.0);
        assert_eq!(a.total_impressions, 600.0);
        assert_eq!(a.mean_impressions, 200.0);
        assert_eq!(a.total_conversions, 3.0);
        assert_eq!(a.conversion_events, 3);
        assert_eq!(a.dominant_platform, "google");
        assert_eq!(a.revenue, None);
    }

    #[test]
    fn test_missing_fields_rejected() {
        let mut bad = rec("a", 1.0, 1.0, 1.0, "meta");
        bad.0.remove("platform");
        let err = extract_features(&[bad]).unwrap_err();
        match err {
            SegmentationError::Validation(msg) => assert!(msg.contains("platform")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_clusters_and_promotes() {
        let records = two_profiles(60);
        let run = analyze(&records, &EngineConfig::default(), &CancellationToken::new()).unwrap();
        let diag = &run.diagnostics;
        assert_eq!(diag.k, 5);
        assert_eq!(diag.assignments.len(), 120);
        assert_eq!(diag.clusters.iter().map(|c| c.size).sum::<usize>(), 120);

        // Low and high customers never share a cluster.
        let cluster_of: HashMap<&str, usize> = diag
            .assignments
            .iter()
            .map(|a| (a.customer_id.as_str(), a.cluster_id))
            .collect();
        for i in 0..60 {
            assert_ne!(cluster_of[format!("low{i}").as_str()], cluster_of[format!("high{i}").as_str()]);
        }

        for draft in &run.drafts {
            let seg = &draft.segment;
            assert_eq!(seg.segment_type, SegmentType::Behavioral);
            assert!(seg.size >= 50);
            let patterns = seg.behavioral_patterns.as_ref().unwrap();
            assert_eq!(patterns["cluster_center"].as_array().unwrap().len(), 6);
            assert_eq!(seg.platforms.len(), 1);
        }
        let promoted = diag.clusters.iter().filter(|c| c.promoted).count();
        assert_eq!(promoted, run.drafts.len());
        assert_eq!(diag.insights.len(), 3);
    }

    #[test]
    fn test_deterministic_assignments() {
        let records = two_profiles(45);
        let config = EngineConfig::default();
        let a = analyze(&records, &config, &CancellationToken::new()).unwrap();
        let b = analyze(&records, &config, &CancellationToken::new()).unwrap();
        let ids = |run: &PipelineRun<BehavioralDiagnostics>| -> Vec<usize> {
            run.diagnostics.assignments.iter().map(|x| x.cluster_id).collect()
        };
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(a.diagnostics.clusters.len(), b.diagnostics.clusters.len());
        for (x, y) in a.diagnostics.clusters.iter().zip(&b.diagnostics.clusters) {
            assert_eq!(x.centroid, y.centroid);
        }
    }

    #[test]
    fn test_small_clusters_reported_not_promoted() {
        let records = two_profiles(15);
        let run = analyze(&records, &EngineConfig::default(), &CancellationToken::new()).unwrap();
        assert!(run.drafts.is_empty());
        assert_eq!(run.diagnostics.k, 1);
        assert_eq!(run.diagnostics.clusters[0].size, 30);
        assert!(!run.diagnostics.clusters[0].promoted);
    }

    #[test]
    fn test_identical_customers_is_computation_error() {
        let records: Vec<CustomerRecord> =
            (0..40).map(|i| rec(&format!("c{i}"), 1.0, 10.0, 0.0, "meta")).collect();
        let err = analyze(&records, &EngineConfig::default(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, SegmentationError::Computation(_)));
    }

    #[test]
    fn test_insights_rank_by_roas() {
        let cluster = |id: usize, roas: f64, size: usize| BehavioralCluster {
            cluster_id: id,
            name: format!("g{id}"),
            centroid: vec![],
            size,
            metrics: BTreeMap::from([("roas".to_string(), roas)]),
            dominant_platform: "meta".to_string(),
            promoted: true,
        };
        let out = insights(&[cluster(0, 1.5, 80), cluster(1, 3.25, 60)]);
        assert_eq!(out[0], "Highest performing behavioral group has 3.25 ROAS with 60 customers");
        assert!(out[1].contains("1.50 ROAS"));
        assert_eq!(insights(&[]), vec!["No behavioral clusters found".to_string()]);
    }
}
