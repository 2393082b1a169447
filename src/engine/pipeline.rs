//! Wires the three stages to their queues and runs them as tokio tasks.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span};

use super::handler::{SimulatedWork, StageHandler};
use super::shutdown::Shutdown;
use super::stage::{IngressReceipt, IngressRequest, StageConfig, StageProcessor};
use crate::channel::{HandoffChannel, InMemoryChannel};
use crate::config::{PipelineSettings, StageProfiles};
use crate::error::{Error, Result};
use crate::model::Stage;
use crate::telemetry::carrier::TracePropagator;
use crate::telemetry::metrics::MetricsSink;

/// The queues between the stages.
///
/// `ingress` feeds stage 1, `step1` carries stage 1's output to stage 2,
/// `step2` carries stage 2's output to stage 3.
#[derive(Clone)]
pub struct PipelineChannels {
    pub ingress: Arc<dyn HandoffChannel>,
    pub step1: Arc<dyn HandoffChannel>,
    pub step2: Arc<dyn HandoffChannel>,
}

impl PipelineChannels {
    /// In-process queues named and timed after `settings`.
    pub fn in_memory(settings: &PipelineSettings) -> Self {
        let queue = |name: &str| -> Arc<dyn HandoffChannel> {
            Arc::new(InMemoryChannel::new(name, settings.visibility_timeout))
        };
        Self {
            ingress: queue(&settings.ingress_queue),
            step1: queue(&settings.step1_queue),
            step2: queue(&settings.step2_queue),
        }
    }

    pub fn input_of(&self, stage: Stage) -> Arc<dyn HandoffChannel> {
        match stage {
            Stage::One => Arc::clone(&self.ingress),
            Stage::Two => Arc::clone(&self.step1),
            Stage::Three => Arc::clone(&self.step2),
        }
    }

    pub fn output_of(&self, stage: Stage) -> Option<Arc<dyn HandoffChannel>> {
        match stage {
            Stage::One => Some(Arc::clone(&self.step1)),
            Stage::Two => Some(Arc::clone(&self.step2)),
            Stage::Three => None,
        }
    }
}

/// Three stage processors sharing one shutdown signal.
pub struct Pipeline {
    processors: [Arc<StageProcessor>; 3],
    shutdown: Shutdown,
}

impl Pipeline {
    /// Build a pipeline whose business steps are the simulated work in
    /// `profiles`.
    pub fn new(
        channels: &PipelineChannels,
        profiles: &StageProfiles,
        propagator: Arc<dyn TracePropagator>,
        metrics: Arc<dyn MetricsSink>,
        config: StageConfig,
    ) -> Result<Self> {
        Self::with_handlers(
            channels,
            propagator,
            metrics,
            config,
            |stage| -> Arc<dyn StageHandler> {
                Arc::new(SimulatedWork::from_profile(profiles.for_stage(stage)))
            },
        )
    }

    /// Build a pipeline with a caller-chosen handler per stage.
    pub fn with_handlers(
        channels: &PipelineChannels,
        propagator: Arc<dyn TracePropagator>,
        metrics: Arc<dyn MetricsSink>,
        config: StageConfig,
        handler_for: impl Fn(Stage) -> Arc<dyn StageHandler>,
    ) -> Result<Self> {
        let build = |stage: Stage| -> Result<Arc<StageProcessor>> {
            let processor = StageProcessor::new(
                stage,
                channels.input_of(stage),
                channels.output_of(stage),
                handler_for(stage),
            )?
            .with_propagator(Arc::clone(&propagator))
            .with_metrics(Arc::clone(&metrics))
            .with_config(config.clone());
            Ok(Arc::new(processor))
        };

        Ok(Self {
            processors: [build(Stage::One)?, build(Stage::Two)?, build(Stage::Three)?],
            shutdown: Shutdown::new(),
        })
    }

    pub fn processor(&self, stage: Stage) -> &Arc<StageProcessor> {
        &self.processors[usize::from(stage.number() - 1)]
    }

    /// Accept an external trigger through stage 1.
    pub async fn ingest(&self, request: IngressRequest) -> Result<IngressReceipt> {
        self.processor(Stage::One).ingest(request).await
    }

    /// Start a worker task for each of `stages`. Every stage when empty.
    pub fn spawn(&self, stages: &[Stage]) -> Result<Vec<JoinHandle<()>>> {
        let stages = if stages.is_empty() { &Stage::ALL[..] } else { stages };
        if self.shutdown.is_triggered() {
            return Err(Error::Other("pipeline already shut down".to_string()));
        }

        let handles = stages
            .iter()
            .map(|&stage| {
                let processor = Arc::clone(self.processor(stage));
                let shutdown = self.shutdown.clone();
                tokio::spawn(
                    async move { processor.run(shutdown).await }
                        .instrument(info_span!("stage_worker", stage = %stage)),
                )
            })
            .collect::<Vec<_>>();

        info!(stages = ?stages, "pipeline workers spawned");
        Ok(handles)
    }

    /// Ask every worker to stop after its current item.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }
}
