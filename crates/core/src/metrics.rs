//! Shared aggregate formulas (CTR, ROAS, averages, confidence) used by every
//! segmentation pipeline. Every division is guarded: a zero denominator yields
//! 0, never NaN or an error.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row fed to the calculator. Absent inputs suppress the metrics that
/// depend on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub revenue: Option<f64>,
    pub conversions: Option<f64>,
    pub clicks: Option<f64>,
    pub impressions: Option<f64>,
    pub spend: Option<f64>,
    pub frequency: Option<f64>,
    pub predicted_ltv: Option<f64>,
}

/// Segment performance compared with a fixed baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineComparison {
    pub performance: f64,
    pub baseline: f64,
    pub improvement_pct: f64,
}

pub struct MetricsCalculator;

impl MetricsCalculator {
    pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
        if denominator == 0.0 || !denominator.is_finite() {
            return 0.0;
        }
        let value = numerator / denominator;
        if value.is_finite() {
            value
        } else {
            0.0
        }
    }

    /// Click-through rate in percent.
    pub fn ctr(clicks: f64, impressions: f64) -> f64 {
        Self::safe_div(clicks, impressions) * 100.0
    }

    pub fn roas(revenue: f64, spend: f64) -> f64 {
        Self::safe_div(revenue, spend)
    }

    pub fn mean(values: &[f64]) -> f64 {
        Self::safe_div(values.iter().sum(), values.len() as f64)
    }

    /// Sample standard deviation (n - 1 denominator); 0 below two values.
    pub fn std_dev(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let mean = Self::mean(values);
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (values.len() - 1) as f64;
        var.sqrt()
    }

    pub fn coefficient_of_variation(values: &[f64]) -> f64 {
        Self::safe_div(Self::std_dev(values), Self::mean(values))
    }

    /// Aggregate metrics for a segment's rows. A metric is emitted only when
    /// at least one row carries its inputs.
    pub fn segment_metrics(rows: &[MetricRow]) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();

        let revenue: Vec<f64> = rows.iter().filter_map(|r| r.revenue).collect();
        if !revenue.is_empty() {
            metrics.insert("avg_revenue".to_string(), Self::mean(&revenue));
            metrics.insert("total_revenue".to_string(), revenue.iter().sum());
        }

        let conversions: Vec<f64> = rows.iter().filter_map(|r| r.conversions).collect();
        if !conversions.is_empty() {
            metrics.insert("avg_conversions".to_string(), Self::mean(&conversions));
            metrics.insert("total_conversions".to_string(), conversions.iter().sum());
        }

        let ctrs: Vec<f64> = rows
            .iter()
            .filter_map(|r| Some(Self::ctr(r.clicks?, r.impressions?)))
            .collect();
        if !ctrs.is_empty() {
            metrics.insert("avg_ctr".to_string(), Self::mean(&ctrs));
        }

        let spend_rows: Vec<(f64, f64)> = rows
            .iter()
            .filter_map(|r| Some((r.revenue?, r.spend?)))
            .collect();
        if !spend_rows.is_empty() {
            let revenue_sum: f64 = spend_rows.iter().map(|(r, _)| r).sum();
            let spend_sum: f64 = spend_rows.iter().map(|(_, s)| s).sum();
            metrics.insert("roas".to_string(), Self::roas(revenue_sum, spend_sum));
        }

        let frequency: Vec<f64> = rows.iter().filter_map(|r| r.frequency).collect();
        if !frequency.is_empty() {
            metrics.insert("avg_frequency".to_string(), Self::mean(&frequency));
        }

        let ltv: Vec<f64> = rows.iter().filter_map(|r| r.predicted_ltv).collect();
        if !ltv.is_empty() {
            metrics.insert("avg_predicted_ltv".to_string(), Self::mean(&ltv));
        }

        metrics
    }

    /// Confidence from population size and revenue consistency, in [0, 1].
    ///
    /// Size score saturates at 1000 rows. Consistency is `1 - cv(revenue)`
    /// floored at 0, or 0.5 when fewer than two revenue values exist.
    pub fn segment_confidence(size: usize, revenues: &[f64]) -> f64 {
        let size_score = (size as f64 / 1000.0).min(1.0);
        let consistency_score = if revenues.len() > 1 {
            (1.0 - Self::coefficient_of_variation(revenues)).max(0.0)
        } else {
            0.5
        };
        ((size_score + consistency_score) / 2.0).clamp(0.0, 1.0)
    }

    /// ROAS and CTR against fixed baselines, keyed `roas_vs_baseline` and
    /// `ctr_vs_baseline`.
    pub fn baseline_comparison(
        metrics: &BTreeMap<String, f64>,
        baseline_roas: f64,
        baseline_ctr: f64,
    ) -> BTreeMap<String, BaselineComparison> {
        let mut comparison = BTreeMap::new();
        let pairs = [
            ("roas", "roas_vs_baseline", baseline_roas),
            ("avg_ctr", "ctr_vs_baseline", baseline_ctr),
        ];
        for (metric, key, baseline) in pairs {
            if let Some(&performance) = metrics.get(metric) {
                comparison.insert(
                    key.to_string(),
                    BaselineComparison {
                        performance,
                        baseline,
                        improvement_pct: Self::safe_div(performance - baseline, baseline) * 100.0,
                    },
                );
            }
        }
        comparison
    }
}
