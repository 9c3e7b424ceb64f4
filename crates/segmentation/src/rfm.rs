//! RFM scoring: per-customer recency/frequency/monetary aggregates, quantile
//! scores, lifecycle classification and one segment per populated stage.

use audience_core::config::EngineConfig;
use audience_core::metrics::MetricRow;
use audience_core::types::{CustomerRecord, LifecycleStage, RfmScores, SegmentType};
use audience_core::{MetricsCalculator, SegmentationError, SegmentationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::SegmentBuilder;
use crate::lifecycle;
use crate::pipeline::{check_cancelled, PipelineRun};

/// Number of equal-population buckets per dimension.
pub const RFM_BUCKETS: usize = 5;

pub const REQUIRED_FIELDS: [&str; 4] = ["customer_id", "timestamp", "revenue", "conversion_count"];

/// Intermediate per-customer scoring result. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmRecord {
    pub customer_id: String,
    pub recency_days: i64,
    pub frequency_count: f64,
    pub monetary_sum: f64,
    pub r_score: u8,
    pub f_score: u8,
    pub m_score: u8,
    pub rfm_code: String,
    pub lifecycle_stage: LifecycleStage,
    pub predicted_ltv: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RfmDiagnostics {
    pub customers: Vec<RfmRecord>,
    pub lifecycle_distribution: BTreeMap<LifecycleStage, usize>,
    pub total_customers: usize,
    pub avg_predicted_ltv: f64,
    /// Customers whose code is listed under several stages in the table.
    pub ambiguous_customers: usize,
}

/// `monetary × (1 + frequency/10) × (1 − recency_days/365)`, floored at 0.
pub fn predicted_ltv(monetary: f64, frequency: f64, recency_days: f64) -> f64 {
    let ltv = monetary * (1.0 + frequency / 10.0) * (1.0 - recency_days / 365.0);
    if ltv.is_finite() {
        ltv.max(0.0)
    } else {
        0.0
    }
}

/// Zero-based bucket per value: values are ranked ascending, ties broken by
/// position, and ranks cut into `RFM_BUCKETS` equal-population groups.
pub fn quantile_buckets(values: &[f64]) -> Vec<usize> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));

    let mut buckets = vec![0; n];
    for (position, &index) in order.iter().enumerate() {
        buckets[index] = bucket_for_rank(position + 1, n);
    }
    buckets
}

/// Bucket `b` holds ranks in `(e_b, e_{b+1}]` with `e_i = 1 + (n-1)·i/5`,
/// compared in integers to avoid edge rounding.
fn bucket_for_rank(rank: usize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let scaled = RFM_BUCKETS * (rank - 1);
    (0..RFM_BUCKETS)
        .find(|b| scaled <= (n - 1) * (b + 1))
        .unwrap_or(RFM_BUCKETS - 1)
}

#[derive(Debug)]
struct CustomerAggregate {
    customer_id: String,
    last_seen: DateTime<Utc>,
    frequency: f64,
    monetary: f64,
    conversions: Option<f64>,
    clicks: Option<f64>,
    impressions: Option<f64>,
    spend: Option<f64>,
}

fn add_optional(total: &mut Option<f64>, value: Option<f64>) {
    if let Some(v) = value {
        *total = Some(total.unwrap_or(0.0) + v);
    }
}

fn aggregate(records: &[CustomerRecord]) -> SegmentationResult<Vec<CustomerAggregate>> {
    if records.is_empty() {
        return Err(SegmentationError::validation(
            "No data provided for RFM analysis",
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

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut customers: Vec<CustomerAggregate> = Vec::new();

    for (row, record) in records.iter().enumerate() {
        let customer_id = record.customer_id().ok_or_else(|| {
            SegmentationError::validation(format!("Row {row}: customer_id must be a string or number"))
        })?;
        let timestamp = record.timestamp("timestamp").ok_or_else(|| {
            SegmentationError::validation(format!("Row {row}: unparseable timestamp"))
        })?;
        let revenue = record.number("revenue").ok_or_else(|| {
            SegmentationError::validation(format!("Row {row}: revenue must be numeric"))
        })?;
        let conversions = record.number("conversion_count").ok_or_else(|| {
            SegmentationError::validation(format!("Row {row}: conversion_count must be numeric"))
        })?;

        let slot = *index.entry(customer_id.clone()).or_insert_with(|| {
            customers.push(CustomerAggregate {
                customer_id,
                last_seen: timestamp,
                frequency: 0.0,
                monetary: 0.0,
                conversions: None,
                clicks: None,
                impressions: None,
                spend: None,
            });
            customers.len() - 1
        });

        let customer = &mut customers[slot];
        customer.last_seen = customer.last_seen.max(timestamp);
        customer.frequency += conversions;
        customer.monetary += revenue;
        add_optional(&mut customer.conversions, record.number("conversions"));
        add_optional(&mut customer.clicks, record.number("clicks"));
        add_optional(&mut customer.impressions, record.number("impressions"));
        add_optional(&mut customer.spend, record.number("spend"));
    }

    Ok(customers)
}

fn truncated_mean(scores: impl Iterator<Item = u8>) -> u8 {
    let (sum, count) = scores.fold((0u32, 0u32), |(s, c), v| (s + v as u32, c + 1));
    if count == 0 {
        0
    } else {
        (sum / count) as u8
    }
}

/// Scores every customer and builds one segment per lifecycle stage that
/// reaches `config.min_segment_size`. Smaller stages produce no segment.
pub fn analyze(
    records: &[CustomerRecord],
    as_of: DateTime<Utc>,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> SegmentationResult<PipelineRun<RfmDiagnostics>> {
    let customers = aggregate(records)?;
    check_cancelled(cancel)?;

    let recency: Vec<f64> = customers
        .iter()
        .map(|c| (as_of - c.last_seen).num_days().max(0) as f64)
        .collect();
    let frequency: Vec<f64> = customers.iter().map(|c| c.frequency).collect();
    let monetary: Vec<f64> = customers.iter().map(|c| c.monetary).collect();

    let r_buckets = quantile_buckets(&recency);
    let f_buckets = quantile_buckets(&frequency);
    let m_buckets = quantile_buckets(&monetary);
    check_cancelled(cancel)?;

    let mut scored = Vec::with_capacity(customers.len());
    let mut ambiguous_customers = 0;
    for (i, customer) in customers.iter().enumerate() {
        let r_score = (RFM_BUCKETS - r_buckets[i]) as u8;
        let f_score = (f_buckets[i] + 1) as u8;
        let m_score = (m_buckets[i] + 1) as u8;
        let rfm_code = format!("{r_score}{f_score}{m_score}");
        if lifecycle::is_ambiguous(&rfm_code) {
            ambiguous_customers += 1;
        }
        scored.push(RfmRecord {
            customer_id: customer.customer_id.clone(),
            recency_days: recency[i] as i64,
            frequency_count: customer.frequency,
            monetary_sum: customer.monetary,
            r_score,
            f_score,
            m_score,
            lifecycle_stage: lifecycle::classify(&rfm_code),
            rfm_code,
            predicted_ltv: predicted_ltv(customer.monetary, customer.frequency, recency[i]),
        });
    }

    if ambiguous_customers > 0 {
        warn!(
            customers = ambiguous_customers,
            "RFM codes listed under several lifecycle stages were resolved by stage priority"
        );
    }

    let mut lifecycle_distribution = BTreeMap::new();
    for record in &scored {
        *lifecycle_distribution.entry(record.lifecycle_stage).or_insert(0) += 1;
    }

    let mut drafts = Vec::new();
    for stage in LifecycleStage::ALL {
        let member_idx: Vec<usize> = (0..scored.len())
            .filter(|&i| scored[i].lifecycle_stage == stage)
            .collect();
        if member_idx.len() < config.min_segment_size {
            debug!(
                stage = %stage,
                size = member_idx.len(),
                minimum = config.min_segment_size,
                "Lifecycle stage below minimum segment size"
            );
            continue;
        }

        let rows: Vec<MetricRow> = member_idx
            .iter()
            .map(|&i| MetricRow {
                revenue: Some(scored[i].monetary_sum),
                conversions: customers[i].conversions,
                clicks: customers[i].clicks,
                impressions: customers[i].impressions,
                spend: customers[i].spend,
                frequency: Some(scored[i].frequency_count),
                predicted_ltv: Some(scored[i].predicted_ltv),
            })
            .collect();
        let ltvs: Vec<f64> = member_idx.iter().map(|&i| scored[i].predicted_ltv).collect();
        let scores = RfmScores {
            avg_recency_score: truncated_mean(member_idx.iter().map(|&i| scored[i].r_score)),
            avg_frequency_score: truncated_mean(member_idx.iter().map(|&i| scored[i].f_score)),
            avg_monetary_score: truncated_mean(member_idx.iter().map(|&i| scored[i].m_score)),
        };

        let draft = SegmentBuilder::new(format!("RFM: {}", stage.display_name()), SegmentType::Rfm)
            .description(stage.description())
            .lifecycle_stage(stage)
            .criterion("lifecycle_stage", json!(stage.as_str()))
            .metrics(MetricsCalculator::segment_metrics(&rows))
            .platforms(config.default_platforms.iter().cloned())
            .predicted_ltv(MetricsCalculator::mean(&ltvs))
            .recommended_actions(lifecycle::recommended_actions(stage))
            .rfm_scores(scores)
            .members(member_idx.iter().map(|&i| scored[i].customer_id.clone()).collect())
            .build(config.min_segment_size)?;
        drafts.push(draft);
    }

    let ltvs: Vec<f64> = scored.iter().map(|r| r.predicted_ltv).collect();
    let diagnostics = RfmDiagnostics {
        total_customers: scored.len(),
        avg_predicted_ltv: MetricsCalculator::mean(&ltvs),
        lifecycle_distribution,
        ambiguous_customers,
        customers: scored,
    };

    info!(
        customers = diagnostics.total_customers,
        segments = drafts.len(),
        "RFM analysis complete"
    );

    Ok(PipelineRun {
        drafts,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::Value;

    fn rec(customer: &str, days_ago: i64, revenue: f64, conversions: f64, now: DateTime<Utc>) -> CustomerRecord {
        CustomerRecord::from(json!({
            "customer_id": customer,
            "timestamp": (now - Duration::days(days_ago)).to_rfc3339(),
            "revenue": revenue,
            "conversion_count": conversions,
        }))
    }

    #[test]
    fn test_predicted_ltv_contract() {
        assert!((predicted_ltv(100.0, 10.0, 0.0) - 200.0).abs() < 1e-12);
        assert_eq!(predicted_ltv(100.0, 10.0, 400.0), 0.0);
        assert_eq!(predicted_ltv(0.0, 0.0, 0.0), 0.0);
        for m in [0.0, 1.0, 500.0] {
            for f in [0.0, 3.0, 50.0] {
                for r in [0.0, 100.0, 365.0, 1000.0] {
                    assert!(predicted_ltv(m, f, r) >= 0.0);
                }
            }
        }
    }

    #[test]
    fn test_quantile_buckets_are_balanced() {
        let values: Vec<f64> = (0..200).map(|v| (v * 7 % 200) as f64).collect();
        let buckets = quantile_buckets(&values);
        let mut counts = [0usize; RFM_BUCKETS];
        for b in buckets {
            counts[b] += 1;
        }
        assert_eq!(counts, [40; RFM_BUCKETS]);
    }

    #[test]
    fn test_quantile_buckets_balanced_with_ties() {
        let values = vec![1.0; 10];
        let buckets = quantile_buckets(&values);
        let mut counts = [0usize; RFM_BUCKETS];
        for b in &buckets {
            counts[*b] += 1;
        }
        assert_eq!(counts, [2; RFM_BUCKETS]);
        // Ties keep input order.
        assert_eq!(buckets, vec![0, 0, 1, 1, 2, 2, 3, 3, 4, 4]);
    }

    #[test]
    fn test_quantile_buckets_small_inputs() {
        assert_eq!(quantile_buckets(&[]), Vec::<usize>::new());
        assert_eq!(quantile_buckets(&[3.0]), vec![0]);
        assert_eq!(quantile_buckets(&[5.0, 1.0]), vec![4, 0]);
    }

    #[test]
    fn test_bucket_population_within_bound() {
        for n in [5usize, 7, 13, 99, 101] {
            let values: Vec<f64> = (0..n).map(|v| v as f64).collect();
            let mut counts = [0usize; RFM_BUCKETS];
            for b in quantile_buckets(&values) {
                counts[b] += 1;
            }
            let target = n as f64 / RFM_BUCKETS as f64;
            let bound = n.div_ceil(RFM_BUCKETS) as f64;
            for c in counts {
                assert!((c as f64 - target).abs() <= bound, "n={n} counts={counts:?}");
            }
        }
    }

    #[test]
    fn test_missing_fields_fail_before_computation() {
        let now = Utc::now();
        let mut bad = rec("c1", 1, 10.0, 1.0, now);
        bad.0.remove("revenue");
        bad.0.remove("timestamp");
        let records = vec![rec("c0", 1, 10.0, 1.0, now), bad];
        let err = analyze(&records, now, &EngineConfig::default(), &CancellationToken::new())
            .unwrap_err();
        match err {
            SegmentationError::Validation(msg) => {
                assert!(msg.contains("timestamp"));
                assert!(msg.contains("revenue"));
                assert!(!msg.contains("conversion_count"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_input_is_validation_error() {
        let err = analyze(&[], Utc::now(), &EngineConfig::default(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SegmentationError::Validation(_)));
    }

    #[test]
    fn test_recency_score_monotonic() {
        let now = Utc::now();
        let records: Vec<CustomerRecord> = (0..50)
            .map(|i| rec(&format!("c{i}"), (i * 3) as i64, 100.0, 1.0, now))
            .collect();
        let run = analyze(&records, now, &EngineConfig::default(), &CancellationToken::new())
            .unwrap();
        let mut customers = run.diagnostics.customers.clone();
        customers.sort_by_key(|c| c.recency_days);
        for pair in customers.windows(2) {
            assert!(pair[0].r_score >= pair[1].r_score);
        }
        assert_eq!(customers[0].r_score, 5);
        assert_eq!(customers.last().unwrap().r_score, 1);
    }

    #[test]
    fn test_aggregates_per_customer() {
        let now = Utc::now();
        let records = vec![
            rec("a", 10, 50.0, 2.0, now),
            rec("a", 3, 25.0, 1.0, now),
            rec("b", 30, 10.0, 1.0, now),
        ];
        let run = analyze(&records, now, &EngineConfig::default(), &CancellationToken::new())
            .unwrap();
        let a = &run.diagnostics.customers[0];
        assert_eq!(a.customer_id, "a");
        assert_eq!(a.recency_days, 3);
        assert_eq!(a.frequency_count, 3.0);
        assert_eq!(a.monetary_sum, 75.0);
        assert_eq!(run.diagnostics.total_customers, 2);
        // Two customers never reach 50 members per stage.
        assert!(run.drafts.is_empty());
    }

    #[test]
    fn test_future_dates_count_as_today() {
        let now = Utc::now();
        let records = vec![rec("a", -5, 100.0, 10.0, now)];
        let run = analyze(&records, now, &EngineConfig::default(), &CancellationToken::new())
            .unwrap();
        assert_eq!(run.diagnostics.customers[0].recency_days, 0);
        assert!((run.diagnostics.customers[0].predicted_ltv - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_segments_for_populated_stages() {
        let now = Utc::now();
        let records: Vec<CustomerRecord> = (0..100)
            .map(|i| rec(&format!("c{i}"), (i % 90) as i64, 10.0 + i as f64, 1.0 + (i % 5) as f64, now))
            .collect();
        let config = EngineConfig {
            min_segment_size: 5,
            ..EngineConfig::default()
        };
        let run = analyze(&records, now, &config, &CancellationToken::new()).unwrap();
        assert!(!run.drafts.is_empty());
        let covered: usize = run.drafts.iter().map(|d| d.segment.size).sum();
        assert!(covered <= 100);
        for draft in &run.drafts {
            let seg = &draft.segment;
            assert_eq!(seg.segment_type, SegmentType::Rfm);
            let stage = seg.lifecycle_stage.unwrap();
            assert_eq!(run.diagnostics.lifecycle_distribution[&stage], seg.size);
            assert_eq!(seg.criteria["lifecycle_stage"], Value::from(stage.as_str()));
            let scores = seg.rfm_scores.unwrap();
            assert!((1..=5).contains(&scores.avg_recency_score));
            assert!(seg.performance_metrics.contains_key("avg_predicted_ltv"));
            assert!(!seg.recommended_actions.is_empty());
            assert!((0.0..=1.0).contains(&seg.confidence_score));
        }
    }

    #[test]
    fn test_conversions_metric_only_from_conversions_column() {
        let now = Utc::now();
        let config = EngineConfig {
            min_segment_size: 1,
            ..EngineConfig::default()
        };
        let plain: Vec<CustomerRecord> = (0..10)
            .map(|i| rec(&format!("c{i}"), i, 100.0, 3.0, now))
            .collect();
        let run = analyze(&plain, now, &config, &CancellationToken::new()).unwrap();
        for draft in &run.drafts {
            let metrics = &draft.segment.performance_metrics;
            assert!(metrics.contains_key("avg_frequency"));
            assert!(!metrics.contains_key("avg_conversions"));
        }

        let with_column: Vec<CustomerRecord> = plain
            .into_iter()
            .map(|mut r| {
                r.0.insert("conversions".to_string(), json!(7));
                r
            })
            .collect();
        let run = analyze(&with_column, now, &config, &CancellationToken::new()).unwrap();
        for draft in &run.drafts {
            let metrics = &draft.segment.performance_metrics;
            assert!((metrics["avg_conversions"] - 7.0).abs() < 1e-12);
            assert!((metrics["avg_frequency"] - 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_non_finite_revenue_is_rejected() {
        let now = Utc::now();
        let mut records = vec![rec("a", 1, 10.0, 1.0, now), rec("b", 2, 20.0, 1.0, now)];
        records[1].0.insert("revenue".to_string(), json!("NaN"));
        let err = analyze(&records, now, &EngineConfig::default(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SegmentationError::Validation(_)));
    }

    #[test]
    fn test_cancelled_token_aborts() {
        let now = Utc::now();
        let records = vec![rec("a", 1, 1.0, 1.0, now)];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = analyze(&records, now, &EngineConfig::default(), &cancel).unwrap_err();
        assert!(matches!(err, SegmentationError::Cancelled));
    }
}
