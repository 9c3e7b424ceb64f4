use serde::Deserialize;

use crate::error::{SegmentationError, SegmentationResult};

/// Root engine configuration. Loaded from environment variables with the
/// prefix `AUDIENCE_ENGINE__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_min_segment_size")]
    pub min_segment_size: usize,
    /// Registry size above which every commit logs a warning. The registry
    /// itself never evicts.
    #[serde(default = "default_max_segments_warning")]
    pub max_segments_warning: usize,
    #[serde(default = "default_pipeline_timeout_ms")]
    pub pipeline_timeout_ms: u64,
    #[serde(default = "default_platforms")]
    pub default_platforms: Vec<String>,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub lookalike: LookalikeConfig,
    #[serde(default)]
    pub custom: CustomFilterConfig,
    #[serde(default)]
    pub demographic: DemographicConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,
    #[serde(default = "default_customers_per_cluster")]
    pub customers_per_cluster: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_n_init")]
    pub n_init: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookalikeConfig {
    #[serde(default = "default_min_seed_size")]
    pub min_seed_size: usize,
    #[serde(default = "default_n_estimators")]
    pub n_estimators: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_min_samples_split")]
    pub min_samples_split: usize,
    #[serde(default = "default_holdout_fraction")]
    pub holdout_fraction: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_high_similarity")]
    pub high_similarity: f64,
    #[serde(default = "default_medium_similarity")]
    pub medium_similarity: f64,
    #[serde(default = "default_max_audience_size")]
    pub default_max_audience_size: usize,
    #[serde(default = "default_exclude_seed_members")]
    pub exclude_seed_members: bool,
    /// Recorded on lookalike segments when the caller gives none.
    #[serde(default = "default_similarity_threshold")]
    pub default_similarity_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomFilterConfig {
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
    #[serde(default = "default_baseline_roas")]
    pub baseline_roas: f64,
    #[serde(default = "default_baseline_ctr")]
    pub baseline_ctr: f64,
}

/// Targets and tier thresholds for demographic performance breakdowns.
#[derive(Debug, Clone, Deserialize)]
pub struct DemographicConfig {
    #[serde(default = "default_target_roas")]
    pub target_roas: f64,
    /// Percent.
    #[serde(default = "default_baseline_ctr")]
    pub target_ctr: f64,
    /// Percent of clicks.
    #[serde(default = "default_target_cvr")]
    pub target_cvr: f64,
    #[serde(default = "default_high_performer_roas")]
    pub high_performer_roas: f64,
    #[serde(default = "default_target_roas")]
    pub good_performer_roas: f64,
    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,
    /// Share of total spend above which one age group counts as concentrated.
    #[serde(default = "default_spend_concentration")]
    pub spend_concentration: f64,
}

// Default functions
fn default_min_segment_size() -> usize {
    50
}
fn default_max_segments_warning() -> usize {
    100
}
fn default_pipeline_timeout_ms() -> u64 {
    30_000
}
fn default_platforms() -> Vec<String> {
    ["meta", "google", "tiktok", "snapchat"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}
fn default_max_clusters() -> usize {
    5
}
fn default_customers_per_cluster() -> usize {
    20
}
fn default_seed() -> u64 {
    42
}
fn default_n_init() -> usize {
    10
}
fn default_max_iterations() -> usize {
    300
}
fn default_tolerance() -> f64 {
    1e-4
}
fn default_min_seed_size() -> usize {
    10
}
fn default_n_estimators() -> usize {
    100
}
fn default_max_depth() -> usize {
    10
}
fn default_min_samples_split() -> usize {
    2
}
fn default_holdout_fraction() -> f64 {
    0.2
}
fn default_high_similarity() -> f64 {
    0.7
}
fn default_medium_similarity() -> f64 {
    0.5
}
fn default_max_audience_size() -> usize {
    10_000
}
fn default_exclude_seed_members() -> bool {
    true
}
fn default_similarity_threshold() -> f64 {
    0.8
}
fn default_target_roas() -> f64 {
    2.0
}
fn default_target_cvr() -> f64 {
    2.0
}
fn default_high_performer_roas() -> f64 {
    3.0
}
fn default_spend_concentration() -> f64 {
    0.6
}
fn default_preview_rows() -> usize {
    100
}
fn default_baseline_roas() -> f64 {
    2.0
}
fn default_baseline_ctr() -> f64 {
    1.5
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            max_clusters: default_max_clusters(),
            customers_per_cluster: default_customers_per_cluster(),
            seed: default_seed(),
            n_init: default_n_init(),
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
        }
    }
}

impl Default for LookalikeConfig {
    fn default() -> Self {
        Self {
            min_seed_size: default_min_seed_size(),
            n_estimators: default_n_estimators(),
            max_depth: default_max_depth(),
            min_samples_split: default_min_samples_split(),
            holdout_fraction: default_holdout_fraction(),
            seed: default_seed(),
            high_similarity: default_high_similarity(),
            medium_similarity: default_medium_similarity(),
            default_max_audience_size: default_max_audience_size(),
            exclude_seed_members: default_exclude_seed_members(),
            default_similarity_threshold: default_similarity_threshold(),
        }
    }
}

impl Default for CustomFilterConfig {
    fn default() -> Self {
        Self {
            preview_rows: default_preview_rows(),
            baseline_roas: default_baseline_roas(),
            baseline_ctr: default_baseline_ctr(),
        }
    }
}

impl Default for DemographicConfig {
    fn default() -> Self {
        Self {
            target_roas: default_target_roas(),
            target_ctr: default_baseline_ctr(),
            target_cvr: default_target_cvr(),
            high_performer_roas: default_high_performer_roas(),
            good_performer_roas: default_target_roas(),
            max_clusters: default_max_clusters(),
            spend_concentration: default_spend_concentration(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_segment_size: default_min_segment_size(),
            max_segments_warning: default_max_segments_warning(),
            pipeline_timeout_ms: default_pipeline_timeout_ms(),
            default_platforms: default_platforms(),
            clustering: ClusteringConfig::default(),
            lookalike: LookalikeConfig::default(),
            custom: CustomFilterConfig::default(),
            demographic: DemographicConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            tracing::debug!(path, "Loading configuration file");
            builder = builder.add_source(config::File::with_name(path));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("AUDIENCE_ENGINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("default_platforms"),
        );

        let config = builder.build()?;
        config.try_deserialize().map_err(|e| {
            tracing::warn!(error = %e, path = ?path, "Configuration rejected");
            e
        })
    }

    pub fn validate(&self) -> SegmentationResult<()> {
        if self.pipeline_timeout_ms == 0 {
            return Err(SegmentationError::Config(
                "pipeline_timeout_ms must be positive".to_string(),
            ));
        }
        if self.clustering.max_clusters == 0 || self.clustering.customers_per_cluster == 0 {
            return Err(SegmentationError::Config(
                "clustering.max_clusters and clustering.customers_per_cluster must be positive"
                    .to_string(),
            ));
        }
        if self.clustering.n_init == 0 || self.clustering.max_iterations == 0 {
            return Err(SegmentationError::Config(
                "clustering.n_init and clustering.max_iterations must be positive".to_string(),
            ));
        }
        let lookalike = &self.lookalike;
        if !(lookalike.holdout_fraction > 0.0 && lookalike.holdout_fraction < 1.0) {
            return Err(SegmentationError::Config(format!(
                "lookalike.holdout_fraction must be in (0, 1), got {}",
                lookalike.holdout_fraction
            )));
        }
        if lookalike.medium_similarity > lookalike.high_similarity {
            return Err(SegmentationError::Config(format!(
                "lookalike.medium_similarity ({}) exceeds lookalike.high_similarity ({})",
                lookalike.medium_similarity, lookalike.high_similarity
            )));
        }
        if !(0.0..=1.0).contains(&lookalike.default_similarity_threshold) {
            return Err(SegmentationError::Config(format!(
                "lookalike.default_similarity_threshold must be within [0, 1], got {}",
                lookalike.default_similarity_threshold
            )));
        }
        if lookalike.n_estimators == 0 || lookalike.max_depth == 0 {
            return Err(SegmentationError::Config(
                "lookalike.n_estimators and lookalike.max_depth must be positive".to_string(),
            ));
        }
        let demographic = &self.demographic;
        if demographic.good_performer_roas > demographic.high_performer_roas {
            return Err(SegmentationError::Config(format!(
                "demographic.good_performer_roas ({}) exceeds demographic.high_performer_roas ({})",
                demographic.good_performer_roas, demographic.high_performer_roas
            )));
        }
        if demographic.max_clusters == 0 {
            return Err(SegmentationError::Config(
                "demographic.max_clusters must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
