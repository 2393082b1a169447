//! Stage processor: receive, evaluate, then process and forward, or
//! short-circuit an item that already failed upstream.
//!
//! One processor owns one input queue and handles one message at a time.
//! The only retry mechanism is the transport's redelivery: a message is
//! acknowledged once the item has been forwarded, completed, short-circuited
//! or found undecodable, and left alone when forwarding fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::handler::StageHandler;
use super::shutdown::Shutdown;
use crate::channel::{HandoffChannel, Message, MessageId};
use crate::config::PipelineSettings;
use crate::derived::{self, DerivedMetrics};
use crate::error::{Error, Result};
use crate::model::{INVALID_DATA, NewWorkItem, Stage, StageState, WorkItem};
use crate::telemetry::carrier::{TracePropagator, W3cPropagator, attach_correlation_id};
use crate::telemetry::metrics::{self, MetricsSink, OtelMetrics, kind};
use crate::telemetry::stage::{
    record_state_transition, start_ingress_span, start_receive_span, start_send_span,
};

/// Timing bounds for one processor.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Long-poll bound on the input queue.
    pub receive_wait: Duration,
    /// Bound on one send to the next queue. Kept shorter than
    /// `receive_wait` so a stuck downstream surfaces as a forward failure.
    pub send_timeout: Duration,
    /// Pause after a failed receive before polling again.
    pub retry_backoff: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            receive_wait: Duration::from_secs(20),
            send_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl From<&PipelineSettings> for StageConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            receive_wait: settings.receive_wait,
            send_timeout: settings.send_timeout,
            retry_backoff: settings.retry_backoff,
        }
    }
}

/// What happened to one received message.
#[derive(Debug)]
pub enum Disposition {
    /// Body did not decode. Acknowledged and dropped.
    Dropped { message_id: MessageId, reason: String },
    /// Item carried an upstream error. Acknowledged, not forwarded.
    ShortCircuited {
        item: Box<WorkItem>,
        origin: Option<Stage>,
    },
    /// Item sent to the next queue and acknowledged on the input.
    Forwarded {
        item: Box<WorkItem>,
        message_id: MessageId,
    },
    /// Forwarding failed. The input message was not acknowledged and will
    /// be redelivered after its visibility window.
    Retained { item: Box<WorkItem>, error: String },
    /// Terminal stage finished the item. Acknowledged.
    Completed { item: Box<WorkItem> },
}

impl Disposition {
    /// The item as it stood when the stage let go of it.
    pub fn item(&self) -> Option<&WorkItem> {
        match self {
            Disposition::Dropped { .. } => None,
            Disposition::ShortCircuited { item, .. }
            | Disposition::Forwarded { item, .. }
            | Disposition::Retained { item, .. }
            | Disposition::Completed { item } => Some(item),
        }
    }

    /// Did the stage remove the message from its input queue?
    pub fn acknowledged(&self) -> bool {
        !matches!(self, Disposition::Retained { .. })
    }
}

/// An external trigger accepted by stage 1.
#[derive(Debug, Clone, Default)]
pub struct IngressRequest {
    pub correlation_id: Option<String>,
    pub payload: String,
    /// Tag the item `invalid_data` so every later stage short-circuits.
    pub inject_error: bool,
}

/// Synchronous answer to an ingress trigger. Says nothing about how the
/// item fares downstream.
#[derive(Debug, Clone)]
pub struct IngressReceipt {
    pub correlation_id: String,
    pub stage1_duration: Duration,
    pub message_id: MessageId,
    pub error_injected: bool,
}

/// One stage of the pipeline bound to its queues and collaborators.
pub struct StageProcessor {
    stage: Stage,
    input: Arc<dyn HandoffChannel>,
    output: Option<Arc<dyn HandoffChannel>>,
    handler: Arc<dyn StageHandler>,
    propagator: Arc<dyn TracePropagator>,
    metrics: Arc<dyn MetricsSink>,
    config: StageConfig,
}

impl StageProcessor {
    /// Bind `stage` to its queues. Stages 1 and 2 need an output queue; the
    /// terminal stage must not have one.
    pub fn new(
        stage: Stage,
        input: Arc<dyn HandoffChannel>,
        output: Option<Arc<dyn HandoffChannel>>,
        handler: Arc<dyn StageHandler>,
    ) -> Result<Self> {
        match (stage.is_terminal(), output.is_some()) {
            (false, false) => {
                return Err(Error::Config(format!("{stage} needs an output queue")));
            }
            (true, true) => {
                return Err(Error::Config(format!("{stage} is terminal and cannot forward")));
            }
            _ => {}
        }
        Ok(Self {
            stage,
            input,
            output,
            handler,
            propagator: Arc::new(W3cPropagator::new()),
            metrics: Arc::new(OtelMetrics),
            config: StageConfig::default(),
        })
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn TracePropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(mut self, config: StageConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Poll the input queue until `shutdown` fires.
    ///
    /// Shutdown is checked between polls; an item already being processed
    /// always runs to completion. Receive errors never end the loop.
    pub async fn run(&self, shutdown: Shutdown) {
        info!(stage = %self.stage, queue = self.input.name(), "stage processor started");

        while !shutdown.is_triggered() {
            match self.input.receive(self.config.receive_wait).await {
                Ok(Some(msg)) => {
                    let disposition = self.handle_message(msg).await;
                    debug!(stage = %self.stage, ?disposition, "message handled");
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        stage = %self.stage,
                        queue = self.input.name(),
                        operation = "receive",
                        error = %e,
                        "failed to receive from input queue, retrying"
                    );
                    self.count_error(kind::RECEIVE);
                    tokio::select! {
                        _ = shutdown.wait() => {}
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }

        info!(stage = %self.stage, "stage processor stopped");
    }

    /// Receive at most one message and handle it. `Ok(None)` if nothing
    /// arrived within the receive wait.
    pub async fn run_once(&self) -> Result<Option<Disposition>> {
        match self.input.receive(self.config.receive_wait).await? {
            Some(msg) => Ok(Some(self.handle_message(msg).await)),
            None => Ok(None),
        }
    }

    /// Drive one received message through the life cycle.
    pub async fn handle_message(&self, msg: Message) -> Disposition {
        let received_at = Utc::now();
        let started = Instant::now();
        let span = start_receive_span(
            self.stage,
            self.input.name(),
            &msg.attributes,
            self.propagator.as_ref(),
        );

        self.dispatch(msg, received_at, started, &span)
            .instrument(span.clone())
            .await
    }

    async fn dispatch(
        &self,
        msg: Message,
        received_at: chrono::DateTime<Utc>,
        started: Instant,
        span: &Span,
    ) -> Disposition {
        let mut item: WorkItem = match serde_json::from_slice(&msg.body) {
            Ok(item) => item,
            Err(e) => {
                error!(
                    stage = %self.stage,
                    queue = self.input.name(),
                    message_id = %msg.id,
                    operation = "decode",
                    error = %e,
                    "failed to decode work item, dropping message"
                );
                self.count_error(kind::MALFORMED);
                self.acknowledge(&msg, None).await;
                record_state_transition(span, StageState::Receiving, StageState::Receiving);
                return Disposition::Dropped {
                    message_id: msg.id,
                    reason: e.to_string(),
                };
            }
        };

        if item.ensure_correlation_id() {
            warn!(
                stage = %self.stage,
                message_id = %msg.id,
                correlation_id = item.correlation_id(),
                "work item arrived without a correlation id, generated one"
            );
        }
        span.record("correlation.id", item.correlation_id());
        if msg.receive_count > 1 {
            info!(
                stage = %self.stage,
                correlation_id = item.correlation_id(),
                receive_count = msg.receive_count,
                "redelivered message"
            );
        }

        if let Some(latency) = derived::handoff_latency(item.metadata(), self.stage, received_at) {
            self.metrics
                .timing(metrics::HANDOFF_DURATION, latency, &self.stage_tags());
        }

        record_state_transition(span, StageState::Receiving, StageState::Evaluating);
        if item.has_error() {
            record_state_transition(span, StageState::Evaluating, StageState::ShortCircuiting);
            return self.short_circuit(item, &msg).await;
        }

        record_state_transition(span, StageState::Evaluating, StageState::Processing);
        if self.stage == Stage::One {
            // stage 1 is the ingress for items that arrive by queue
            item.mark_started(received_at);
        }
        let duration = self.process(&mut item, started).await;

        if self.stage.is_terminal() {
            record_state_transition(span, StageState::Processing, StageState::Terminating);
            return self.terminate(item, &msg, duration).await;
        }

        record_state_transition(span, StageState::Processing, StageState::Forwarding);
        match self.forward(&item, span).await {
            Ok(message_id) => {
                self.acknowledge(&msg, Some(item.correlation_id())).await;
                info!(
                    stage = %self.stage,
                    correlation_id = item.correlation_id(),
                    duration_ms = duration.as_millis() as u64,
                    "stage completed, work item forwarded"
                );
                Disposition::Forwarded {
                    item: Box::new(item),
                    message_id,
                }
            }
            Err(e) => Disposition::Retained {
                item: Box::new(item),
                error: e.to_string(),
            },
        }
    }

    /// Handle an ingress trigger inline: build the item, run stage 1's
    /// step and forward to stage 2.
    ///
    /// Returns once the item is on the stage 2 queue. A forwarding failure
    /// is returned to the caller; there is no input message to redeliver.
    pub async fn ingest(&self, request: IngressRequest) -> Result<IngressReceipt> {
        if self.stage != Stage::One {
            return Err(Error::Config(format!(
                "ingress is handled by {}, not {}",
                Stage::One,
                self.stage
            )));
        }

        let started = Instant::now();
        let mut new = NewWorkItem::new(request.payload);
        if let Some(id) = request.correlation_id {
            new = new.correlation_id(id);
        }
        let mut item = new.build();
        let span = start_ingress_span(item.correlation_id());

        async {
            record_state_transition(&span, StageState::Receiving, StageState::Evaluating);
            record_state_transition(&span, StageState::Evaluating, StageState::Processing);
            item.mark_started(Utc::now());

            if request.inject_error {
                item.mark_error(INVALID_DATA, self.stage);
                self.count_error(kind::LOCAL);
                warn!(
                    stage = %self.stage,
                    correlation_id = item.correlation_id(),
                    error_type = INVALID_DATA,
                    "error injection activated, work item marked invalid"
                );
            }

            let duration = self.process(&mut item, started).await;

            record_state_transition(&span, StageState::Processing, StageState::Forwarding);
            let forwarded = self.forward(&item, &span).await;
            self.metrics.incr(
                metrics::INGRESS_REQUESTS,
                &[KeyValue::new(
                    "result",
                    if forwarded.is_ok() { "ok" } else { "error" },
                )],
            );
            let message_id = forwarded?;

            info!(
                stage = %self.stage,
                correlation_id = item.correlation_id(),
                duration_ms = duration.as_millis() as u64,
                error_injected = request.inject_error,
                "ingress accepted, work item sent to stage2"
            );

            Ok::<_, Error>(IngressReceipt {
                correlation_id: item.correlation_id().to_string(),
                stage1_duration: duration,
                message_id,
                error_injected: request.inject_error,
            })
        }
        .instrument(span.clone())
        .await
    }

    /// Run the business step and stamp this stage's milestone.
    async fn process(&self, item: &mut WorkItem, started: Instant) -> Duration {
        if let Err(e) = self.handler.handle(self.stage, item).await {
            warn!(
                stage = %self.stage,
                correlation_id = item.correlation_id(),
                error_type = %e.error_type,
                error = %e.message,
                "business step failed, marking work item"
            );
            item.mark_error(e.error_type, self.stage);
            self.count_error(kind::LOCAL);
        }

        let duration = started.elapsed();
        if !item.complete_stage(self.stage, Utc::now()) {
            debug!(
                stage = %self.stage,
                correlation_id = item.correlation_id(),
                "milestone already stamped by an earlier delivery, keeping it"
            );
        }

        let tags = self.stage_tags();
        self.metrics.incr(metrics::MESSAGES_PROCESSED, &tags);
        self.metrics.timing(metrics::STAGE_DURATION, duration, &tags);
        derived::record_under_threshold(
            self.metrics.as_ref(),
            metrics::LATENCY_UNDER_THRESHOLD,
            duration,
            derived::latency_threshold(self.stage),
            Some(self.stage),
        );
        duration
    }

    /// Send the item to the next queue with a fresh trace carrier.
    async fn forward(&self, item: &WorkItem, parent: &Span) -> Result<MessageId> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| Error::Config(format!("{} has no output queue", self.stage)))?;
        let correlation_id = item.correlation_id();
        let send_span = start_send_span(parent, self.stage, output.name(), correlation_id);
        let attributes =
            attach_correlation_id(self.propagator.encode(&send_span), correlation_id);

        let body = match serde_json::to_vec(item) {
            Ok(body) => body,
            Err(e) => {
                error!(
                    stage = %self.stage,
                    correlation_id,
                    queue = output.name(),
                    operation = "encode",
                    error = %e,
                    "failed to serialize work item for next stage"
                );
                self.count_error(kind::SERIALIZE);
                return Err(e.into());
            }
        };

        let sent = tokio::time::timeout(self.config.send_timeout, output.send(body, attributes))
            .instrument(send_span)
            .await
            .unwrap_or_else(|_| {
                Err(Error::SendTimeout {
                    channel: output.name().to_string(),
                    timeout: self.config.send_timeout,
                })
            });

        if let Err(ref e) = sent {
            error!(
                stage = %self.stage,
                correlation_id,
                queue = output.name(),
                operation = "send",
                error = %e,
                "failed to send work item to next stage, leaving input for redelivery"
            );
            self.count_error(kind::SEND);
        }
        sent
    }

    /// Absorb an item that failed upstream: count, log, acknowledge.
    async fn short_circuit(&self, item: WorkItem, msg: &Message) -> Disposition {
        let origin = item.error_origin();
        let source = origin.map(Stage::label).unwrap_or("unknown");

        self.count_error(kind::INHERITED);
        self.metrics.incr(
            metrics::PIPELINE_TOTAL,
            &[
                KeyValue::new("result", "failed"),
                KeyValue::new("stage", self.stage.label()),
            ],
        );
        error!(
            stage = %self.stage,
            correlation_id = item.correlation_id(),
            error_type = item.error_type().unwrap_or_default(),
            error_source = source,
            action = "skipping_stage_processing",
            "inherited error, work item will not be forwarded"
        );

        self.acknowledge(msg, Some(item.correlation_id())).await;
        Disposition::ShortCircuited {
            item: Box::new(item),
            origin,
        }
    }

    /// Terminal stage: derived metrics, pipeline outcome, acknowledge.
    async fn terminate(&self, item: WorkItem, msg: &Message, duration: Duration) -> Disposition {
        let derived = DerivedMetrics::compute(item.metadata(), Utc::now());
        derived.emit(self.metrics.as_ref());

        let result = if item.has_error() { "failed" } else { "success" };
        self.metrics
            .incr(metrics::PIPELINE_TOTAL, &[KeyValue::new("result", result)]);

        self.acknowledge(msg, Some(item.correlation_id())).await;

        let meta = item.metadata();
        info!(
            stage = %self.stage,
            correlation_id = item.correlation_id(),
            duration_ms = duration.as_millis() as u64,
            end_to_end_ms = derived.end_to_end.map(|d| d.as_millis() as u64),
            result,
            pipeline_start = meta.start_time(),
            pipeline_stage1 = meta.completed(Stage::One),
            pipeline_stage2 = meta.completed(Stage::Two),
            "pipeline completed"
        );
        Disposition::Completed {
            item: Box::new(item),
        }
    }

    /// Remove `msg` from the input queue. Failure is logged and counted;
    /// the message will simply be redelivered.
    async fn acknowledge(&self, msg: &Message, correlation_id: Option<&str>) {
        if let Err(e) = self.input.acknowledge(&msg.ack_handle).await {
            error!(
                stage = %self.stage,
                correlation_id,
                queue = self.input.name(),
                message_id = %msg.id,
                error = %e,
                "failed to acknowledge message"
            );
            self.count_error(kind::ACK);
        }
    }

    fn stage_tags(&self) -> [KeyValue; 1] {
        [KeyValue::new("stage", self.stage.label())]
    }

    fn count_error(&self, kind: &'static str) {
        self.metrics.incr(
            metrics::ERRORS,
            &[
                KeyValue::new("stage", self.stage.label()),
                KeyValue::new("kind", kind),
            ],
        );
    }
}
