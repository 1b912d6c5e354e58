use std::sync::Arc;

use fieldops_core::Clock;
use fieldops_infra::{PostgresOutboxStore, apply_schema};
use fieldops_outbox::{
    DeadLetterStore, HeartbeatStore, InMemoryOutboxStore, OutboxError, OutboxStore,
    ReplayAuditLog, ReplayService, ReplayTargetCheck,
};

use crate::config::AppConfig;

/// Replay service over type-erased stores.
pub type DynReplayService = ReplayService<Arc<dyn DeadLetterStore>, Arc<dyn ReplayAuditLog>>;

/// The four store seams, backed by one implementation.
#[derive(Clone)]
pub struct Stores {
    pub outbox: Arc<dyn OutboxStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub heartbeats: Arc<dyn HeartbeatStore>,
    pub audit: Arc<dyn ReplayAuditLog>,
}

impl Stores {
    /// All seams served by the same in-memory store (dev/test).
    pub fn in_memory(store: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            outbox: store.clone(),
            dead_letters: store.clone(),
            heartbeats: store.clone(),
            audit: store,
        }
    }

    pub fn postgres(store: PostgresOutboxStore) -> Self {
        let store = Arc::new(store);
        Self {
            outbox: store.clone(),
            dead_letters: store.clone(),
            heartbeats: store.clone(),
            audit: store,
        }
    }

    /// Connect according to `config`: Postgres (schema applied) when
    /// `DATABASE_URL` is set, otherwise in-memory.
    pub async fn from_config(config: &AppConfig) -> Result<Self, OutboxError> {
        match &config.database_url {
            Some(url) => {
                let store =
                    PostgresOutboxStore::connect(url, config.database_max_connections).await?;
                apply_schema(store.pool()).await?;
                tracing::info!("using postgres outbox stores");
                Ok(Self::postgres(store))
            }
            None => {
                tracing::warn!("DATABASE_URL not set; using in-memory outbox stores");
                Ok(Self::in_memory(InMemoryOutboxStore::arc()))
            }
        }
    }
}

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppServices {
    pub stores: Stores,
    pub replay: Arc<DynReplayService>,
    pub clock: Arc<dyn Clock>,
}

impl AppServices {
    pub fn new(
        stores: Stores,
        target_check: Arc<dyn ReplayTargetCheck>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let replay = ReplayService::new(
            stores.dead_letters.clone(),
            stores.audit.clone(),
            target_check,
            clock.clone(),
        );
        Self {
            stores,
            replay: Arc::new(replay),
            clock,
        }
    }
}
