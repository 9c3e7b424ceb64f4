//! Segmentation engine: runs each pipeline on a blocking worker under a
//! timeout and commits its segments to the registry only when it succeeds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use audience_core::config::EngineConfig;
use audience_core::types::CustomerRecord;
use audience_core::{SegmentationError, SegmentationResult};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::behavioral::{self, BehavioralDiagnostics};
use crate::custom::{self, CustomDiagnostics};
use crate::demographic::{self, DemographicDiagnostics, DemographicOptions};
use crate::lookalike::{self, LookalikeDiagnostics, LookalikeRequest};
use crate::pipeline::{check_cancelled, PipelineOutput, PipelineRun};
use crate::registry::SegmentRegistry;
use crate::rfm::{self, RfmDiagnostics};
use crate::source::CustomerDataSource;

/// Parameters of a lookalike request. `None` falls back to configuration.
#[derive(Debug, Clone, Default)]
pub struct LookalikeOptions {
    pub max_audience_size: Option<usize>,
    pub similarity_threshold: Option<f64>,
}

pub struct SegmentationEngine {
    config: Arc<EngineConfig>,
    registry: Arc<SegmentRegistry>,
    source: Arc<dyn CustomerDataSource>,
    shutdown: CancellationToken,
}

impl SegmentationEngine {
    pub fn new(config: EngineConfig, source: Arc<dyn CustomerDataSource>) -> SegmentationResult<Self> {
        config.validate()?;
        let registry = SegmentRegistry::with_warning_threshold(config.max_segments_warning);
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            source,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SegmentRegistry> {
        &self.registry
    }

    /// Cancels every running pipeline. Later calls fail with `Cancelled`.
    pub fn shutdown(&self) {
        info!("Segmentation engine shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn create_rfm_segments(
        &self,
        records: Vec<CustomerRecord>,
        client_id: &str,
    ) -> SegmentationResult<PipelineOutput<RfmDiagnostics>> {
        self.create_rfm_segments_as_of(records, Utc::now(), client_id)
            .await
    }

    /// RFM with an explicit reference time for recency.
    pub async fn create_rfm_segments_as_of(
        &self,
        records: Vec<CustomerRecord>,
        as_of: DateTime<Utc>,
        client_id: &str,
    ) -> SegmentationResult<PipelineOutput<RfmDiagnostics>> {
        self.run("rfm", client_id, move |config, cancel| {
            rfm::analyze(&records, as_of, config, cancel)
        })
        .await
    }

    pub async fn create_behavioral_segments(
        &self,
        records: Vec<CustomerRecord>,
        client_id: &str,
    ) -> SegmentationResult<PipelineOutput<BehavioralDiagnostics>> {
        self.run("behavioral", client_id, move |config, cancel| {
            behavioral::analyze(&records, config, cancel)
        })
        .await
    }

    pub async fn create_demographic_segments(
        &self,
        records: Vec<CustomerRecord>,
        options: DemographicOptions,
        client_id: &str,
    ) -> SegmentationResult<PipelineOutput<DemographicDiagnostics>> {
        self.run("demographic", client_id, move |config, cancel| {
            demographic::analyze(&records, options, config, cancel)
        })
        .await
    }

    /// Scores the data source's population against an existing seed segment.
    pub async fn create_lookalike_segments(
        &self,
        seed_segment_id: Uuid,
        options: LookalikeOptions,
    ) -> SegmentationResult<PipelineOutput<LookalikeDiagnostics>> {
        let seed = self
            .registry
            .get(&seed_segment_id)
            .ok_or(SegmentationError::SegmentNotFound(seed_segment_id))?;
        let members = self.registry.members(&seed_segment_id).unwrap_or_default();

        let similarity_threshold = options
            .similarity_threshold
            .unwrap_or(self.config.lookalike.default_similarity_threshold);
        if !(0.0..=1.0).contains(&similarity_threshold) {
            return Err(SegmentationError::validation(format!(
                "similarity_threshold must be within [0, 1], got {similarity_threshold}"
            )));
        }
        let max_audience_size = options
            .max_audience_size
            .unwrap_or(self.config.lookalike.default_max_audience_size);
        if max_audience_size == 0 {
            return Err(SegmentationError::validation(
                "max_audience_size must be positive",
            ));
        }

        let source = Arc::clone(&self.source);
        let scope = format!("seed:{seed_segment_id}");
        self.run("lookalike", &scope, move |config, cancel| {
            let population = source.fetch_all()?;
            lookalike::analyze(
                LookalikeRequest {
                    seed: &seed,
                    seed_members: &members,
                    population: &population,
                    max_audience_size,
                    similarity_threshold,
                },
                config,
                cancel,
            )
        })
        .await
    }

    /// Filters the data source's population and registers one custom segment.
    pub async fn create_custom_segment(
        &self,
        criteria: Map<String, Value>,
        name: &str,
        description: Option<&str>,
        client_id: &str,
    ) -> SegmentationResult<PipelineOutput<CustomDiagnostics>> {
        let source = Arc::clone(&self.source);
        let name = name.to_string();
        let description = description.map(str::to_string);
        self.run("custom", client_id, move |config, cancel| {
            let records = source.fetch_all()?;
            check_cancelled(cancel)?;
            custom::analyze(
                &records,
                &criteria,
                &name,
                description.as_deref(),
                config,
                cancel,
            )
        })
        .await
    }

    async fn run<D, F>(
        &self,
        pipeline: &'static str,
        client_id: &str,
        body: F,
    ) -> SegmentationResult<PipelineOutput<D>>
    where
        D: Send + 'static,
        F: FnOnce(&EngineConfig, &CancellationToken) -> SegmentationResult<PipelineRun<D>>
            + Send
            + 'static,
    {
        let cancel = self.shutdown.child_token();
        let timeout_ms = self.config.pipeline_timeout_ms;
        let started = Instant::now();

        let outcome = if cancel.is_cancelled() {
            Err(SegmentationError::Cancelled)
        } else {
            let config = Arc::clone(&self.config);
            let worker_cancel = cancel.clone();
            let handle = tokio::task::spawn_blocking(move || body(&config, &worker_cancel));
            match tokio::time::timeout(Duration::from_millis(timeout_ms), handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(SegmentationError::Internal(anyhow::anyhow!(
                    "{pipeline} worker failed: {join_err}"
                ))),
                Err(_) => {
                    cancel.cancel();
                    Err(SegmentationError::Timeout { timeout_ms })
                }
            }
        };

        // Shutdown may land after the worker finished; nothing is committed then.
        let outcome = outcome.and_then(|run| {
            if cancel.is_cancelled() {
                Err(SegmentationError::Cancelled)
            } else {
                Ok(run)
            }
        });

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("segmentation.pipeline_latency_ms", "pipeline" => pipeline)
            .record(elapsed_ms);

        match outcome.and_then(|run| {
            let segments = self.registry.commit(run.drafts)?;
            Ok(PipelineOutput {
                segments,
                diagnostics: run.diagnostics,
            })
        }) {
            Ok(output) => {
                info!(
                    pipeline,
                    client_id,
                    segments = output.segments.len(),
                    elapsed_ms,
                    "Pipeline completed"
                );
                Ok(output)
            }
            Err(err) => {
                metrics::counter!("segmentation.pipeline_failures", "pipeline" => pipeline)
                    .increment(1);
                warn!(
                    pipeline,
                    client_id,
                    kind = ?err.kind(),
                    retryable = err.is_retryable(),
                    error = %err,
                    "Pipeline failed"
                );
                Err(err)
            }
        }
    }
}
