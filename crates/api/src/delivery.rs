//! Delivery loop wiring: handlers, dispatcher and runner built from settings.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use fieldops_core::Clock;
use fieldops_outbox::heartbeat::default_instance_id;
use fieldops_outbox::{
    CircuitGate, DeliveryContext, DeliveryHandler, Dispatcher, HandlerError, HandlerRegistry,
    HeartbeatReporter, HeartbeatStore, OutboxRunner, OutboxStore,
};

use crate::app::Stores;
use crate::config::RunnerSettings;

pub type DynRunner = OutboxRunner<Arc<dyn OutboxStore>, Arc<dyn HeartbeatStore>>;

/// Acknowledges every event after logging it.
///
/// Stand-in for dev mode; deployments register the real channel handlers
/// (`email.*`, `webhook.*`, ...) before building the runner.
#[derive(Debug, Default)]
pub struct LogOnlyHandler;

#[async_trait]
impl DeliveryHandler for LogOnlyHandler {
    async fn deliver(
        &self,
        ctx: &DeliveryContext,
        payload: &serde_json::Value,
    ) -> Result<(), HandlerError> {
        info!(
            tenant_id = %ctx.tenant_id,
            event_id = %ctx.event_id,
            kind = %ctx.kind,
            attempt = ctx.attempt,
            payload_bytes = payload.to_string().len(),
            "delivered (log only)"
        );
        Ok(())
    }
}

/// Registry with `LogOnlyHandler` as the `*` fallback.
pub fn log_only_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register("*", Arc::new(LogOnlyHandler));
    handlers
}

/// Build the runner over `stores` with the configured tuning.
pub fn build_runner(
    stores: &Stores,
    handlers: HandlerRegistry,
    circuit: Arc<dyn CircuitGate>,
    clock: Arc<dyn Clock>,
    settings: &RunnerSettings,
) -> DynRunner {
    let runner_config = settings.runner_config();
    let dispatcher = Dispatcher::new(
        stores.outbox.clone(),
        handlers,
        circuit,
        clock.clone(),
        settings.dispatcher_config(),
    );
    let heartbeat = HeartbeatReporter::new(
        stores.heartbeats.clone(),
        runner_config.name.clone(),
        default_instance_id(),
        clock.clone(),
    );
    OutboxRunner::new(dispatcher, heartbeat, clock, runner_config)
}
