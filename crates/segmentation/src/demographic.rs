//! Demographic performance: delivery aggregated by age group, gender, country
//! and interest category, compared with configured targets. Age/gender
//! combinations are clustered by performance, and every group reaching the
//! minimum segment size becomes a segment.

use audience_core::config::{DemographicConfig, EngineConfig};
use audience_core::metrics::MetricRow;
use audience_core::types::{CustomerRecord, SegmentType};
use audience_core::{MetricsCalculator, SegmentationError, SegmentationResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::builder::SegmentBuilder;
use crate::clustering::kmeans;
use crate::pipeline::{check_cancelled, PipelineRun};
use crate::scaling::StandardScaler;

pub const AGE_GROUP_ORDER: [&str; 6] = ["18-24", "25-34", "35-44", "45-54", "55-64", "65+"];

pub const CLUSTER_FEATURES: [&str; 4] = ["ctr", "roas", "impressions", "spend"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    AgeGroup,
    Gender,
    Country,
    InterestCategory,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::AgeGroup,
        Dimension::Gender,
        Dimension::Country,
        Dimension::InterestCategory,
    ];

    /// Record field holding this dimension's value.
    pub fn field(&self) -> &'static str {
        match self {
            Self::AgeGroup => "age_group",
            Self::Gender => "gender",
            Self::Country => "country",
            Self::InterestCategory => "interest_category",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::AgeGroup => "Age",
            Self::Gender => "Gender",
            Self::Country => "Country",
            Self::InterestCategory => "Interest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTier {
    HighPerformer,
    GoodPerformer,
    Underperformer,
}

impl PerformanceTier {
    pub fn classify(roas: f64, settings: &DemographicConfig) -> Self {
        if roas >= settings.high_performer_roas {
            Self::HighPerformer
        } else if roas >= settings.good_performer_roas {
            Self::GoodPerformer
        } else {
            Self::Underperformer
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighPerformer => "high_performer",
            Self::GoodPerformer => "good_performer",
            Self::Underperformer => "underperformer",
        }
    }

    fn recommended_actions(&self) -> Vec<String> {
        let actions: &[&str] = match self {
            Self::HighPerformer => &[
                "Scale budget toward this audience",
                "Test expanded creatives for this audience",
            ],
            Self::GoodPerformer => &[
                "Maintain spend and monitor efficiency",
                "Optimize bids toward target ROAS",
            ],
            Self::Underperformer => &[
                "Reduce spend or refine targeting",
                "Review creative relevance for this audience",
            ],
        };
        actions.iter().map(|a| a.to_string()).collect()
    }
}

/// Summed delivery of a set of rows. Missing values count as 0;
/// `conversion_count` stands in for `conversions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub rows: usize,
    pub impressions: f64,
    pub clicks: f64,
    pub conversions: f64,
    pub spend: f64,
    pub revenue: f64,
}

impl Delivery {
    pub fn from_rows<'a>(records: impl IntoIterator<Item = &'a CustomerRecord>) -> Self {
        let mut delivery = Self::default();
        for record in records {
            delivery.rows += 1;
            delivery.impressions += record.number("impressions").unwrap_or(0.0);
            delivery.clicks += record.number("clicks").unwrap_or(0.0);
            delivery.conversions += record
                .number("conversions")
                .or_else(|| record.number("conversion_count"))
                .unwrap_or(0.0);
            delivery.spend += record.number("spend").unwrap_or(0.0);
            delivery.revenue += record.number("revenue").unwrap_or(0.0);
        }
        delivery
    }

    /// Percent of impressions clicked.
    pub fn ctr(&self) -> f64 {
        MetricsCalculator::ctr(self.clicks, self.impressions)
    }

    /// Percent of clicks converted.
    pub fn cvr(&self) -> f64 {
        MetricsCalculator::safe_div(self.conversions, self.clicks) * 100.0
    }

    pub fn roas(&self) -> f64 {
        MetricsCalculator::roas(self.revenue, self.spend)
    }

    pub fn cpa(&self) -> f64 {
        MetricsCalculator::safe_div(self.spend, self.conversions)
    }
}

/// Actual over target per rate; 1.0 is on target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetComparison {
    pub ctr: f64,
    pub cvr: f64,
    pub roas: f64,
}

impl TargetComparison {
    pub fn new(delivery: &Delivery, settings: &DemographicConfig) -> Self {
        Self {
            ctr: MetricsCalculator::safe_div(delivery.ctr(), settings.target_ctr),
            cvr: MetricsCalculator::safe_div(delivery.cvr(), settings.target_cvr),
            roas: MetricsCalculator::safe_div(delivery.roas(), settings.target_roas),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPerformance {
    pub dimension: Dimension,
    pub value: String,
    pub delivery: Delivery,
    pub customers: usize,
    pub ctr: f64,
    pub cvr: f64,
    pub roas: f64,
    pub cpa: f64,
    pub vs_target: TargetComparison,
    pub tier: PerformanceTier,
    pub promoted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DimensionBreakdown {
    pub dimension: Dimension,
    /// Age groups in age order, every other dimension by ROAS descending.
    pub groups: Vec<GroupPerformance>,
    pub roas_leader: Option<String>,
    pub highest_volume: Option<String>,
    pub insights: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenderGap {
    pub better_roas: String,
    pub roas_difference: f64,
    pub better_ctr: String,
    pub ctr_difference: f64,
}

/// Age/gender combinations that k-means grouped together.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceCluster {
    pub cluster_id: usize,
    pub combinations: Vec<(String, String)>,
    pub avg_roas: f64,
    pub avg_ctr: f64,
    pub total_spend: f64,
    pub tier: PerformanceTier,
}

#[derive(Debug, Clone, Serialize)]
pub struct DemographicDiagnostics {
    pub total_rows: usize,
    pub overall: Delivery,
    pub overall_vs_target: TargetComparison,
    pub breakdowns: Vec<DimensionBreakdown>,
    pub gender_gap: Option<GenderGap>,
    pub clusters: Vec<PerformanceCluster>,
    pub insights: Vec<String>,
}

/// Which optional dimensions a run covers. Age and gender are always on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemographicOptions {
    pub include_geographic: bool,
    pub include_interests: bool,
}

impl Default for DemographicOptions {
    fn default() -> Self {
        Self {
            include_geographic: true,
            include_interests: true,
        }
    }
}

impl DemographicOptions {
    pub fn dimensions(&self) -> Vec<Dimension> {
        Dimension::ALL
            .into_iter()
            .filter(|d| match d {
                Dimension::Country => self.include_geographic,
                Dimension::InterestCategory => self.include_interests,
                _ => true,
            })
            .collect()
    }
}

/// Group key of a record along a dimension. Blank strings count as missing.
fn group_value(record: &CustomerRecord, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn age_rank(value: &str) -> usize {
    AGE_GROUP_ORDER
        .iter()
        .position(|a| *a == value)
        .unwrap_or(AGE_GROUP_ORDER.len())
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

fn distinct_customers(records: &[CustomerRecord], idx: &[usize]) -> Vec<String> {
    let mut seen = HashSet::new();
    idx.iter()
        .filter_map(|&i| records[i].customer_id())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

fn breakdown(
    records: &[CustomerRecord],
    dimension: Dimension,
    groups: &BTreeMap<String, Vec<usize>>,
    config: &EngineConfig,
) -> DimensionBreakdown {
    let settings = &config.demographic;
    let mut performance: Vec<GroupPerformance> = groups
        .iter()
        .map(|(value, idx)| {
            let delivery = Delivery::from_rows(idx.iter().map(|&i| &records[i]));
            let roas = delivery.roas();
            GroupPerformance {
                dimension,
                value: value.clone(),
                customers: distinct_customers(records, idx).len(),
                ctr: delivery.ctr(),
                cvr: delivery.cvr(),
                roas,
                cpa: delivery.cpa(),
                vs_target: TargetComparison::new(&delivery, settings),
                tier: PerformanceTier::classify(roas, settings),
                promoted: idx.len() >= config.min_segment_size,
                delivery,
            }
        })
        .collect();

    match dimension {
        Dimension::AgeGroup => performance.sort_by(|a, b| {
            age_rank(&a.value)
                .cmp(&age_rank(&b.value))
                .then_with(|| a.value.cmp(&b.value))
        }),
        _ => performance.sort_by(|a, b| b.roas.total_cmp(&a.roas).then_with(|| a.value.cmp(&b.value))),
    }

    // Ties go to the lexicographically smaller value.
    let leader_by = |key: fn(&GroupPerformance) -> f64| {
        performance
            .iter()
            .max_by(|a, b| key(a).total_cmp(&key(b)).then_with(|| b.value.cmp(&a.value)))
            .map(|g| g.value.clone())
    };
    let roas_leader = leader_by(|g| g.roas);
    let highest_volume = leader_by(|g| g.delivery.impressions);

    let mut insights = Vec::new();
    if let Some(leader) = &roas_leader {
        let roas = performance
            .iter()
            .find(|g| &g.value == leader)
            .map_or(0.0, |g| g.roas);
        insights.push(format!(
            "{} {leader} leads on ROAS at {roas:.2}x",
            dimension.label()
        ));
        if let Some(volume) = highest_volume.as_ref().filter(|v| *v != leader) {
            insights.push(format!(
                "Opportunity: {leader} has better ROAS but {volume} has higher volume"
            ));
        }
    }
    let below: Vec<&str> = performance
        .iter()
        .filter(|g| g.roas < settings.target_roas)
        .map(|g| g.value.as_str())
        .collect();
    if !below.is_empty() {
        insights.push(format!(
            "{} groups below target ROAS: {}",
            dimension.label(),
            below.join(", ")
        ));
    }

    DimensionBreakdown {
        dimension,
        groups: performance,
        roas_leader,
        highest_volume,
        insights,
    }
}

/// ROAS and CTR gap between the `male` and `female` groups, when both exist.
fn gender_gap(breakdown: &DimensionBreakdown) -> Option<GenderGap> {
    let find = |name: &str| {
        breakdown
            .groups
            .iter()
            .find(|g| g.value.eq_ignore_ascii_case(name))
    };
    let (male, female) = (find("male")?, find("female")?);
    let pick = |m: f64, f: f64| if m > f { &male.value } else { &female.value };
    Some(GenderGap {
        better_roas: pick(male.roas, female.roas).clone(),
        roas_difference: (male.roas - female.roas).abs(),
        better_ctr: pick(male.ctr, female.ctr).clone(),
        ctr_difference: (male.ctr - female.ctr).abs(),
    })
}

fn performance_clusters(
    records: &[CustomerRecord],
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> SegmentationResult<Vec<PerformanceCluster>> {
    let mut combos: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for (i, record) in records.iter().enumerate() {
        let age = group_value(record, Dimension::AgeGroup.field());
        let gender = group_value(record, Dimension::Gender.field());
        if let (Some(age), Some(gender)) = (age, gender) {
            combos.entry((age, gender)).or_default().push(i);
        }
    }
    if combos.len() < 2 {
        debug!(combinations = combos.len(), "Too few age/gender combinations to cluster");
        return Ok(Vec::new());
    }

    let keys: Vec<(String, String)> = combos.keys().cloned().collect();
    let deliveries: Vec<Delivery> = combos
        .values()
        .map(|idx| Delivery::from_rows(idx.iter().map(|&i| &records[i])))
        .collect();
    let mut matrix = Array2::<f64>::zeros((keys.len(), CLUSTER_FEATURES.len()));
    for (i, d) in deliveries.iter().enumerate() {
        for (j, v) in [d.ctr(), d.roas(), d.impressions, d.spend].into_iter().enumerate() {
            matrix[[i, j]] = v;
        }
    }
    let (_, scaled) = StandardScaler::fit_transform(&matrix)?;
    let k = config.demographic.max_clusters.min(keys.len());
    let result = kmeans(&scaled, k, &config.clustering, cancel)?;

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); result.centroids.nrows()];
    for (i, &c) in result.assignments.iter().enumerate() {
        members[c].push(i);
    }
    Ok(members
        .into_iter()
        .enumerate()
        .filter(|(_, idx)| !idx.is_empty())
        .map(|(cluster_id, idx)| {
            let roas: Vec<f64> = idx.iter().map(|&i| deliveries[i].roas()).collect();
            let ctr: Vec<f64> = idx.iter().map(|&i| deliveries[i].ctr()).collect();
            let avg_roas = MetricsCalculator::mean(&roas);
            PerformanceCluster {
                cluster_id,
                combinations: idx.iter().map(|&i| keys[i].clone()).collect(),
                avg_roas,
                avg_ctr: MetricsCalculator::mean(&ctr),
                total_spend: idx.iter().map(|&i| deliveries[i].spend).sum(),
                tier: PerformanceTier::classify(avg_roas, &config.demographic),
            }
        })
        .collect())
}

fn overall_insights(
    records: &[CustomerRecord],
    breakdowns: &[DimensionBreakdown],
    clusters: &[PerformanceCluster],
    settings: &DemographicConfig,
) -> Vec<String> {
    let mut insights = Vec::new();

    let row_roas: Vec<f64> = records
        .iter()
        .filter_map(|r| Some(MetricsCalculator::roas(r.number("revenue")?, r.number("spend")?)))
        .collect();
    let (spread, mean) = (
        MetricsCalculator::std_dev(&row_roas),
        MetricsCalculator::mean(&row_roas),
    );
    if row_roas.len() > 1 && spread > mean * 0.5 {
        insights.push(format!(
            "High performance variability: ROAS std {spread:.2} against mean {mean:.2}"
        ));
    }

    if let Some(age) = breakdowns.iter().find(|b| b.dimension == Dimension::AgeGroup) {
        let total: f64 = age.groups.iter().map(|g| g.delivery.spend).sum();
        let top = age
            .groups
            .iter()
            .max_by(|a, b| a.delivery.spend.total_cmp(&b.delivery.spend));
        if let Some(top) = top {
            let share = MetricsCalculator::safe_div(top.delivery.spend, total);
            if share > settings.spend_concentration {
                insights.push(format!(
                    "{:.0}% of spend is in the {} age group; consider diversifying",
                    share * 100.0,
                    top.value
                ));
            }
        }
    }

    let combos_in = |tier: PerformanceTier| -> usize {
        clusters
            .iter()
            .filter(|c| c.tier == tier)
            .map(|c| c.combinations.len())
            .sum()
    };
    let high = combos_in(PerformanceTier::HighPerformer);
    if high > 0 {
        insights.push(format!("{high} age/gender combinations in high-performing clusters"));
    }
    let under = combos_in(PerformanceTier::Underperformer);
    if under > 0 {
        insights.push(format!("{under} age/gender combinations need optimization"));
    }

    insights
}

/// Breaks delivery down by each selected dimension and promotes every group
/// with at least `config.min_segment_size` rows to a demographic segment.
/// Rows without a value for a dimension are left out of that dimension only.
pub fn analyze(
    records: &[CustomerRecord],
    options: DemographicOptions,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> SegmentationResult<PipelineRun<DemographicDiagnostics>> {
    if records.is_empty() {
        return Err(SegmentationError::insufficient("No demographic data provided"));
    }
    let dimensions = options.dimensions();

    let mut grouped: Vec<(Dimension, BTreeMap<String, Vec<usize>>)> = Vec::new();
    for &dimension in &dimensions {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, record) in records.iter().enumerate() {
            if let Some(value) = group_value(record, dimension.field()) {
                groups.entry(value).or_default().push(i);
            }
        }
        if !groups.is_empty() {
            grouped.push((dimension, groups));
        }
    }
    if grouped.is_empty() {
        let fields: Vec<&str> = dimensions.iter().map(|d| d.field()).collect();
        return Err(SegmentationError::insufficient(format!(
            "No records carry any demographic field: {fields:?}"
        )));
    }
    check_cancelled(cancel)?;

    let mut breakdowns = Vec::with_capacity(grouped.len());
    let mut drafts = Vec::new();
    for (dimension, groups) in &grouped {
        let summary = breakdown(records, *dimension, groups, config);
        for group in summary.groups.iter().filter(|g| g.promoted) {
            let idx = &groups[&group.value];
            let rows: Vec<MetricRow> = idx.iter().map(|&i| metric_row(&records[i])).collect();
            let mut metrics = MetricsCalculator::segment_metrics(&rows);
            metrics.insert("ctr".to_string(), group.ctr);
            metrics.insert("cvr".to_string(), group.cvr);
            metrics.insert("cpa".to_string(), group.cpa);
            metrics.insert("roas_vs_target".to_string(), group.vs_target.roas);
            let revenues: Vec<f64> = rows.iter().filter_map(|r| r.revenue).collect();
            let platforms: Vec<String> = {
                let found: BTreeSet<&str> =
                    idx.iter().filter_map(|&i| records[i].text("platform")).collect();
                if found.is_empty() {
                    config.default_platforms.clone()
                } else {
                    found.into_iter().map(str::to_string).collect()
                }
            };

            let draft = SegmentBuilder::new(
                format!("Demographic: {} {}", dimension.label(), group.value),
                SegmentType::Demographic,
            )
            .description(format!(
                "{} {} audience, {} at {:.2}x ROAS",
                dimension.label(),
                group.value,
                group.tier.as_str(),
                group.roas
            ))
            .size(idx.len())
            .criterion(dimension.field(), json!(group.value))
            .metrics(metrics)
            .platforms(platforms)
            .confidence(MetricsCalculator::segment_confidence(idx.len(), &revenues))
            .recommended_actions(group.tier.recommended_actions())
            .members(distinct_customers(records, idx))
            .build(config.min_segment_size)?;
            drafts.push(draft);
        }
        breakdowns.push(summary);
        check_cancelled(cancel)?;
    }

    let clusters = performance_clusters(records, config, cancel)?;
    let gender_gap = breakdowns
        .iter()
        .find(|b| b.dimension == Dimension::Gender)
        .and_then(gender_gap);
    let insights = overall_insights(records, &breakdowns, &clusters, &config.demographic);

    let overall = Delivery::from_rows(records);
    let diagnostics = DemographicDiagnostics {
        total_rows: records.len(),
        overall_vs_target: TargetComparison::new(&overall, &config.demographic),
        overall,
        breakdowns,
        gender_gap,
        clusters,
        insights,
    };

    info!(
        rows = diagnostics.total_rows,
        dimensions = diagnostics.breakdowns.len(),
        clusters = diagnostics.clusters.len(),
        segments = drafts.len(),
        "Demographic analysis complete"
    );

    Ok(PipelineRun {
        drafts,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTRIES: [&str; 4] = ["US", "DE", "BR", "JP"];

    /// 120 rows: 25-34 outperforms 45-54, women outperform men, one in five
    /// rows is in the `gaming` interest.
    fn population() -> Vec<CustomerRecord> {
        (0..120)
            .map(|i| {
                let young = i % 2 == 0;
                let female = i % 3 == 0;
                let base = if young { 400.0 } else { 50.0 };
                let revenue = base + if female { 100.0 } else { 0.0 };
                CustomerRecord::from(json!({
                    "customer_id": format!("c{i}"),
                    "age_group": if young { "25-34" } else { "45-54" },
                    "gender": if female { "female" } else { "male" },
                    "country": COUNTRIES[i % 4],
                    "interest_category": if i % 5 == 0 { "gaming" } else { "fitness" },
                    "platform": "meta",
                    "revenue": revenue,
                    "spend": 100.0,
                    "clicks": 20,
                    "impressions": 1000,
                    "conversions": 2,
                }))
            })
            .collect()
    }

    fn config(min: usize) -> EngineConfig {
        EngineConfig {
            min_segment_size: min,
            ..EngineConfig::default()
        }
    }

    fn by_dimension(diag: &DemographicDiagnostics, dimension: Dimension) -> &DimensionBreakdown {
        diag.breakdowns
            .iter()
            .find(|b| b.dimension == dimension)
            .unwrap()
    }

    #[test]
    fn test_delivery_rates_guard_zero() {
        let empty = Delivery::default();
        assert_eq!(empty.ctr(), 0.0);
        assert_eq!(empty.cvr(), 0.0);
        assert_eq!(empty.roas(), 0.0);
        assert_eq!(empty.cpa(), 0.0);

        let record = CustomerRecord::from(json!({
            "clicks": 5, "impressions": 200, "conversion_count": 1, "spend": 10, "revenue": 30,
        }));
        let d = Delivery::from_rows([&record]);
        assert!((d.ctr() - 2.5).abs() < 1e-12);
        assert!((d.cvr() - 20.0).abs() < 1e-12);
        assert!((d.roas() - 3.0).abs() < 1e-12);
        assert!((d.cpa() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_tier_thresholds() {
        let settings = DemographicConfig::default();
        assert_eq!(PerformanceTier::classify(3.0, &settings), PerformanceTier::HighPerformer);
        assert_eq!(PerformanceTier::classify(2.0, &settings), PerformanceTier::GoodPerformer);
        assert_eq!(PerformanceTier::classify(1.99, &settings), PerformanceTier::Underperformer);
    }

    #[test]
    fn test_age_breakdown_against_targets() {
        let run = analyze(&population(), DemographicOptions::default(), &config(30), &CancellationToken::new())
            .unwrap();
        let age = by_dimension(&run.diagnostics, Dimension::AgeGroup);
        let values: Vec<&str> = age.groups.iter().map(|g| g.value.as_str()).collect();
        assert_eq!(values, vec!["25-34", "45-54"]);
        assert_eq!(age.roas_leader.as_deref(), Some("25-34"));
        assert_eq!(age.groups[0].tier, PerformanceTier::HighPerformer);
        assert_eq!(age.groups[1].tier, PerformanceTier::Underperformer);
        assert!((age.groups[0].ctr - 2.0).abs() < 1e-12);
        assert!((age.groups[0].cvr - 10.0).abs() < 1e-12);
        assert!((age.groups[0].vs_target.roas - age.groups[0].roas / 2.0).abs() < 1e-12);
        assert!(age.insights[0].contains("25-34"));
        assert!(age.insights.iter().any(|i| i.contains("below target") && i.contains("45-54")));

        let overall = &run.diagnostics.overall;
        assert_eq!(overall.rows, 120);
        assert!((overall.spend - 12_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_promotes_groups_reaching_minimum() {
        let run = analyze(&population(), DemographicOptions::default(), &config(30), &CancellationToken::new())
            .unwrap();
        // Two age groups, two genders, four countries and `fitness`.
        assert_eq!(run.drafts.len(), 9);
        let interest = by_dimension(&run.diagnostics, Dimension::InterestCategory);
        let gaming = interest.groups.iter().find(|g| g.value == "gaming").unwrap();
        assert_eq!(gaming.delivery.rows, 24);
        assert!(!gaming.promoted);

        for draft in &run.drafts {
            let seg = &draft.segment;
            assert_eq!(seg.segment_type, SegmentType::Demographic);
            assert!(seg.size >= 30);
            assert_eq!(draft.members.len(), seg.size);
            assert_eq!(seg.criteria.len(), 1);
            assert!((0.0..=1.0).contains(&seg.confidence_score));
            assert!(seg.performance_metrics.values().all(|v| v.is_finite()));
            assert!(!seg.recommended_actions.is_empty());
        }
        let young = run
            .drafts
            .iter()
            .find(|d| d.segment.criteria.get("age_group") == Some(&json!("25-34")))
            .unwrap();
        assert_eq!(young.segment.size, 60);
        assert!(young.segment.platforms.contains("meta"));
    }

    #[test]
    fn test_optional_dimensions_skipped() {
        let options = DemographicOptions {
            include_geographic: false,
            include_interests: false,
        };
        let run = analyze(&population(), options, &config(30), &CancellationToken::new()).unwrap();
        let dims: Vec<Dimension> = run.diagnostics.breakdowns.iter().map(|b| b.dimension).collect();
        assert_eq!(dims, vec![Dimension::AgeGroup, Dimension::Gender]);
        assert_eq!(run.drafts.len(), 4);
    }

    #[test]
    fn test_gender_gap() {
        let run = analyze(&population(), DemographicOptions::default(), &config(30), &CancellationToken::new())
            .unwrap();
        let gap = run.diagnostics.gender_gap.unwrap();
        assert_eq!(gap.better_roas, "female");
        assert!(gap.roas_difference > 0.9);
        assert_eq!(gap.ctr_difference, 0.0);
    }

    #[test]
    fn test_clusters_cover_every_combination() {
        let mut config = config(30);
        config.demographic.max_clusters = 2;
        let run = analyze(&population(), DemographicOptions::default(), &config, &CancellationToken::new())
            .unwrap();
        let clusters = &run.diagnostics.clusters;
        assert!(!clusters.is_empty() && clusters.len() <= 2);
        let covered: usize = clusters.iter().map(|c| c.combinations.len()).sum();
        assert_eq!(covered, 4);
        assert!((clusters.iter().map(|c| c.total_spend).sum::<f64>() - 12_000.0).abs() < 1e-9);
        assert!(!run.diagnostics.insights.is_empty());
    }

    #[test]
    fn test_spend_concentration_insight() {
        let records: Vec<CustomerRecord> = (0..10)
            .map(|i| {
                CustomerRecord::from(json!({
                    "customer_id": i,
                    "age_group": if i < 8 { "18-24" } else { "65+" },
                    "revenue": 100.0,
                    "spend": 50.0,
                }))
            })
            .collect();
        let run = analyze(&records, DemographicOptions::default(), &config(1), &CancellationToken::new())
            .unwrap();
        assert!(run
            .diagnostics
            .insights
            .iter()
            .any(|i| i.starts_with("80% of spend") && i.contains("18-24")));
        assert!(run.diagnostics.gender_gap.is_none());
        assert!(run.diagnostics.clusters.is_empty());
    }

    #[test]
    fn test_missing_input_is_insufficient() {
        let err = analyze(&[], DemographicOptions::default(), &config(1), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SegmentationError::InsufficientData(_)));

        let records = vec![CustomerRecord::from(json!({"customer_id": "a", "revenue": 1.0}))];
        let err = analyze(&records, DemographicOptions::default(), &config(1), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SegmentationError::InsufficientData(_)));
    }

    #[test]
    fn test_cancelled_token_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = analyze(&population(), DemographicOptions::default(), &config(30), &cancel)
            .unwrap_err();
        assert!(matches!(err, SegmentationError::Cancelled));
    }
}
