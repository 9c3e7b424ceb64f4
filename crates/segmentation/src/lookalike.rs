//! Lookalike modeling: learn what separates a seed segment's customers from
//! everyone else, then score the population and cut it into similarity bands.

use audience_core::config::EngineConfig;
use audience_core::metrics::MetricRow;
use audience_core::types::{AudienceSegment, CustomerRecord, SegmentType};
use audience_core::{MetricsCalculator, SegmentationError, SegmentationResult};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::builder::SegmentBuilder;
use crate::forest::{self, ForestParams};
use crate::pipeline::{check_cancelled, PipelineRun};
use crate::scaling::StandardScaler;

pub const FEATURE_NAMES: [&str; 4] = ["revenue", "conversions", "clicks", "impressions"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityBand {
    High,
    Medium,
}

impl SimilarityBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
        }
    }
}

/// Holdout accuracy and feature importance of the model behind a lookalike run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelReport {
    pub accuracy: f64,
    pub feature_importance: BTreeMap<String, f64>,
    pub training_rows: usize,
    pub holdout_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandSummary {
    pub band: SimilarityBand,
    /// Candidates in the band before the size cap.
    pub eligible: usize,
    /// Candidates kept after the cap.
    pub selected: usize,
    /// Seed customers scored into the band but left out of its audience.
    pub seed_members_excluded: usize,
    pub mean_similarity: f64,
    pub promoted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LookalikeDiagnostics {
    pub seed_segment_id: uuid::Uuid,
    pub seed_customers: usize,
    pub population: usize,
    pub similarity_threshold: f64,
    pub model: ModelReport,
    pub bands: Vec<BandSummary>,
}

/// Per-customer lookalike features plus what the metrics calculator needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFeatures {
    pub customer_id: String,
    pub values: [f64; 4],
    pub spend: Option<f64>,
}

impl CandidateFeatures {
    fn metric_row(&self) -> MetricRow {
        let [revenue, conversions, clicks, impressions] = self.values;
        MetricRow {
            revenue: Some(revenue),
            conversions: Some(conversions),
            clicks: Some(clicks),
            impressions: Some(impressions),
            spend: self.spend,
            ..Default::default()
        }
    }
}

/// Sums revenue, conversions, clicks and impressions per customer; missing
/// values count as 0. `conversion_count` stands in for `conversions`.
pub fn extract_features(records: &[CustomerRecord]) -> SegmentationResult<Vec<CandidateFeatures>> {
    let mut order: Vec<String> = Vec::new();
    let mut by_customer: HashMap<String, CandidateFeatures> = HashMap::new();
    for (row, record) in records.iter().enumerate() {
        let customer_id = record.customer_id().ok_or_else(|| {
            SegmentationError::validation(format!("Row {row}: customer_id is missing"))
        })?;
        let values = [
            record.number("revenue").unwrap_or(0.0),
            record
                .number("conversions")
                .or_else(|| record.number("conversion_count"))
                .unwrap_or(0.0),
            record.number("clicks").unwrap_or(0.0),
            record.number("impressions").unwrap_or(0.0),
        ];
        let entry = by_customer.entry(customer_id.clone()).or_insert_with(|| {
            order.push(customer_id.clone());
            CandidateFeatures {
                customer_id,
                values: [0.0; 4],
                spend: None,
            }
        });
        for (acc, v) in entry.values.iter_mut().zip(values) {
            *acc += v;
        }
        if let Some(spend) = record.number("spend") {
            entry.spend = Some(entry.spend.unwrap_or(0.0) + spend);
        }
    }
    Ok(order
        .into_iter()
        .filter_map(|id| by_customer.remove(&id))
        .collect())
}

/// Which band a probability falls in, if any.
pub fn band_for(probability: f64, high: f64, medium: f64) -> Option<SimilarityBand> {
    if probability > high {
        Some(SimilarityBand::High)
    } else if probability >= medium {
        Some(SimilarityBand::Medium)
    } else {
        None
    }
}

/// Inputs of one lookalike run.
pub struct LookalikeRequest<'a> {
    pub seed: &'a AudienceSegment,
    pub seed_members: &'a [String],
    pub population: &'a [CustomerRecord],
    pub max_audience_size: usize,
    pub similarity_threshold: f64,
}

pub fn analyze(
    request: LookalikeRequest<'_>,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> SegmentationResult<PipelineRun<LookalikeDiagnostics>> {
    let settings = &config.lookalike;
    let seed = request.seed;
    if request.population.is_empty() {
        return Err(SegmentationError::insufficient(
            "No data available for lookalike modeling",
        ));
    }

    let candidates = extract_features(request.population)?;
    let seed_ids: HashSet<&str> = request.seed_members.iter().map(String::as_str).collect();
    let labels: Vec<u8> = candidates
        .iter()
        .map(|c| u8::from(seed_ids.contains(c.customer_id.as_str())))
        .collect();
    let seed_count = labels.iter().filter(|&&l| l == 1).count();

    if seed_count < settings.min_seed_size.max(1) {
        return Err(SegmentationError::insufficient(format!(
            "Seed segment too small for lookalike modeling ({seed_count} customers). Minimum: {}",
            settings.min_seed_size
        )));
    }
    if seed_count == candidates.len() {
        return Err(SegmentationError::insufficient(
            "Population contains no customers outside the seed segment",
        ));
    }
    check_cancelled(cancel)?;

    let mut matrix = Array2::<f64>::zeros((candidates.len(), FEATURE_NAMES.len()));
    for (i, c) in candidates.iter().enumerate() {
        for (j, v) in c.values.iter().enumerate() {
            matrix[[i, j]] = *v;
        }
    }
    let (scaler, scaled) = StandardScaler::fit_transform(&matrix)?;
    scaler.ensure_informative()?;

    // Seeded shuffle, then holdout first.
    let n = candidates.len();
    let mut shuffled: Vec<usize> = (0..n).collect();
    shuffled.shuffle(&mut StdRng::seed_from_u64(settings.seed));
    let holdout_rows = ((n as f64 * settings.holdout_fraction).ceil() as usize).clamp(1, n - 1);
    let (holdout_idx, train_idx) = shuffled.split_at(holdout_rows);

    let train_x = scaled.select(Axis(0), train_idx);
    let train_y: Vec<u8> = train_idx.iter().map(|&i| labels[i]).collect();
    let holdout_x = scaled.select(Axis(0), holdout_idx);
    let holdout_y: Vec<u8> = holdout_idx.iter().map(|&i| labels[i]).collect();

    let model = forest::train(&train_x, &train_y, ForestParams::from(settings), cancel)?;
    let report = ModelReport {
        accuracy: model.accuracy(&holdout_x, &holdout_y),
        feature_importance: FEATURE_NAMES
            .iter()
            .zip(model.feature_importances())
            .map(|(name, v)| (name.to_string(), *v))
            .collect(),
        training_rows: train_idx.len(),
        holdout_rows: holdout_idx.len(),
    };
    debug!(accuracy = report.accuracy, "Lookalike model evaluated");
    check_cancelled(cancel)?;

    let probabilities = model.predict_proba_batch(&scaled);
    let cap = request.max_audience_size / 2;

    let mut bands = Vec::with_capacity(2);
    let mut drafts = Vec::new();
    for band in [SimilarityBand::High, SimilarityBand::Medium] {
        let in_band: Vec<usize> = (0..n)
            .filter(|&i| {
                band_for(probabilities[i], settings.high_similarity, settings.medium_similarity)
                    == Some(band)
            })
            .collect();
        let (mut ranked, excluded): (Vec<usize>, Vec<usize>) = in_band
            .into_iter()
            .partition(|&i| !(settings.exclude_seed_members && labels[i] == 1));
        let eligible = ranked.len();
        ranked.sort_by(|&a, &b| {
            probabilities[b]
                .total_cmp(&probabilities[a])
                .then_with(|| candidates[a].customer_id.cmp(&candidates[b].customer_id))
        });
        ranked.truncate(cap);

        let scores: Vec<f64> = ranked.iter().map(|&i| probabilities[i]).collect();
        let mean_similarity = MetricsCalculator::mean(&scores);
        let promoted = !ranked.is_empty() && ranked.len() >= config.min_segment_size;

        if promoted {
            let rows: Vec<MetricRow> = ranked.iter().map(|&i| candidates[i].metric_row()).collect();
            let draft = SegmentBuilder::new(
                format!("Lookalike {}: {}", drafts.len() + 1, seed.name),
                SegmentType::Lookalike,
            )
            .description(format!(
                "Lookalike audience based on {} ({:.2} similarity)",
                seed.name, mean_similarity
            ))
            .criterion("seed_segment_id", json!(seed.id))
            .criterion("similarity_threshold", json!(request.similarity_threshold))
            .criterion("similarity_score", json!(mean_similarity))
            .criterion("band", json!(band.as_str()))
            .metrics(MetricsCalculator::segment_metrics(&rows))
            .platforms(seed.platforms.iter().cloned())
            .confidence(mean_similarity)
            .members(ranked.iter().map(|&i| candidates[i].customer_id.clone()).collect())
            .build(config.min_segment_size)?;
            drafts.push(draft);
        } else if eligible > 0 {
            debug!(
                band = band.as_str(),
                selected = ranked.len(),
                minimum = config.min_segment_size,
                "Similarity band below minimum segment size"
            );
        }

        bands.push(BandSummary {
            band,
            eligible,
            selected: ranked.len(),
            seed_members_excluded: excluded.len(),
            mean_similarity,
            promoted,
        });
    }

    info!(
        seed_segment_id = %seed.id,
        seed_customers = seed_count,
        population = n,
        accuracy = report.accuracy,
        segments = drafts.len(),
        "Lookalike modeling complete"
    );

    Ok(PipelineRun {
        drafts,
        diagnostics: LookalikeDiagnostics {
            seed_segment_id: seed.id,
            seed_customers: seed_count,
            population: n,
            similarity_threshold: request.similarity_threshold,
            model: report,
            bands,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer(id: &str, revenue: f64, conversions: f64, clicks: f64, impressions: f64) -> CustomerRecord {
        CustomerRecord::from(json!({
            "customer_id": id,
            "revenue": revenue,
            "conversions": conversions,
            "clicks": clicks,
            "impressions": impressions,
        }))
    }

    /// 30 high-value seed customers, 10 non-seed customers with the same
    /// profile, 120 low-value others.
    fn population() -> (Vec<CustomerRecord>, Vec<String>) {
        let mut records = Vec::new();
        let mut seed = Vec::new();
        for i in 0..30 {
            let id = format!("seed{i:02}");
            records.push(customer(&id, 900.0 + (i % 5) as f64, 9.0, 80.0, 1000.0));
            seed.push(id);
        }
        for i in 0..10 {
            records.push(customer(&format!("like{i:02}"), 900.0 + (i % 5) as f64, 9.0, 80.0, 1000.0));
        }
        for i in 0..120 {
            records.push(customer(&format!("low{i:03}"), 20.0 + (i % 11) as f64, 0.0, 5.0, 900.0));
        }
        (records, seed)
    }

    fn seed_segment() -> AudienceSegment {
        SegmentBuilder::new("RFM: Champions", SegmentType::Rfm)
            .platforms(["meta", "google"])
            .size(30)
            .build(0)
            .unwrap()
            .segment
    }

    fn config(min: usize) -> EngineConfig {
        let mut config = EngineConfig {
            min_segment_size: min,
            ..EngineConfig::default()
        };
        config.lookalike.n_estimators = 30;
        config
    }

    #[test]
    fn test_band_boundaries() {
        assert_eq!(band_for(0.71, 0.7, 0.5), Some(SimilarityBand::High));
        assert_eq!(band_for(0.7, 0.7, 0.5), Some(SimilarityBand::Medium));
        assert_eq!(band_for(0.5, 0.7, 0.5), Some(SimilarityBand::Medium));
        assert_eq!(band_for(0.49, 0.7, 0.5), None);
    }

    #[test]
    fn test_extract_features_sums_per_customer() {
        let records = vec![
            customer("a", 10.0, 1.0, 2.0, 3.0),
            CustomerRecord::from(json!({"customer_id": "a", "revenue": 5.0, "conversion_count": 2})),
            customer("b", 1.0, 0.0, 0.0, 0.0),
        ];
        let features = extract_features(&records).unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].values, [15.0, 3.0, 2.0, 3.0]);
        assert_eq!(features[1].customer_id, "b");
    }

    #[test]
    fn test_small_seed_is_insufficient() {
        let (records, seed) = population();
        let err = analyze(
            LookalikeRequest {
                seed: &seed_segment(),
                seed_members: &seed[..5],
                population: &records,
                max_audience_size: 10_000,
                similarity_threshold: 0.8,
            },
            &config(10),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SegmentationError::InsufficientData(_)));
    }

    #[test]
    fn test_seed_only_population_is_insufficient() {
        let (records, seed) = population();
        let err = analyze(
            LookalikeRequest {
                seed: &seed_segment(),
                seed_members: &seed,
                population: &records[..30],
                max_audience_size: 10_000,
                similarity_threshold: 0.8,
            },
            &config(10),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SegmentationError::InsufficientData(_)));
    }

    #[test]
    fn test_finds_lookalikes() {
        let (records, seed) = population();
        let seed_segment = seed_segment();
        let run = analyze(
            LookalikeRequest {
                seed: &seed_segment,
                seed_members: &seed,
                population: &records,
                max_audience_size: 10_000,
                similarity_threshold: 0.8,
            },
            &config(1),
            &CancellationToken::new(),
        )
        .unwrap();

        let diag = &run.diagnostics;
        assert_eq!(diag.seed_customers, 30);
        assert_eq!(diag.population, 160);
        assert_eq!(diag.model.holdout_rows, 32);
        assert_eq!(diag.model.training_rows, 128);
        assert!((0.0..=1.0).contains(&diag.model.accuracy));
        let importance: f64 = diag.model.feature_importance.values().sum();
        assert!((importance - 1.0).abs() < 1e-9);
        assert_eq!(diag.bands.len(), 2);
        assert!(diag.bands.iter().map(|b| b.seed_members_excluded).sum::<usize>() > 0);
        assert!(!run.drafts.is_empty());

        for draft in &run.drafts {
            let seg = &draft.segment;
            assert_eq!(seg.segment_type, SegmentType::Lookalike);
            assert!((0.5..=1.0).contains(&seg.confidence_score));
            assert_eq!(seg.criteria["seed_segment_id"], json!(seed_segment.id));
            assert_eq!(seg.platforms, seed_segment.platforms);
            // Only the seed-profile non-members qualify.
            assert!(draft.members.iter().all(|m| m.starts_with("like")));
        }
    }

    #[test]
    fn test_band_cap_is_half_max_audience() {
        let (records, seed) = population();
        let run = analyze(
            LookalikeRequest {
                seed: &seed_segment(),
                seed_members: &seed,
                population: &records,
                max_audience_size: 6,
                similarity_threshold: 0.8,
            },
            &config(1),
            &CancellationToken::new(),
        )
        .unwrap();
        for band in &run.diagnostics.bands {
            assert!(band.selected <= 3);
        }
        for draft in &run.drafts {
            assert!(draft.segment.size <= 3);
            assert!(draft.segment.criteria["similarity_score"].is_f64());
        }
    }

    #[test]
    fn test_seed_members_kept_when_not_excluded() {
        let (records, seed) = population();
        let mut config = config(1);
        config.lookalike.exclude_seed_members = false;
        let run = analyze(
            LookalikeRequest {
                seed: &seed_segment(),
                seed_members: &seed,
                population: &records,
                max_audience_size: 10_000,
                similarity_threshold: 0.8,
            },
            &config,
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(run.diagnostics.bands.iter().all(|b| b.seed_members_excluded == 0));
        assert!(run
            .drafts
            .iter()
            .flat_map(|d| d.members.iter())
            .any(|m| m.starts_with("seed")));
    }
}
