//! Wiring from [`Settings`] to a ready [`WalletService`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::info;

use ledgerly_events::{EventEnvelope, InMemoryEventBus};
use ledgerly_infra::command_dispatcher::CommandDispatcher;
use ledgerly_infra::config::Settings;
use ledgerly_infra::event_store::{InMemoryEventStore, PostgresEventStore};

use crate::error::LedgerError;
use crate::plans::PlanCatalog;
use crate::service::{ServiceConfig, WalletService};

pub type Bus = InMemoryEventBus<EventEnvelope<JsonValue>>;
pub type InMemoryWalletService<C> = WalletService<InMemoryEventStore, Bus, C>;
pub type PostgresWalletService<C> = WalletService<PostgresEventStore, Bus, C>;

/// Install the tracing subscriber described by `[logging]`.
pub fn init_logging(settings: &Settings) {
    ledgerly_observability::init_with(settings.logging.format, &settings.logging.filter);
}

/// Service over the in-memory store, for tests and single-process use.
pub fn in_memory<C: PlanCatalog>(
    settings: &Settings,
    catalog: C,
) -> Result<InMemoryWalletService<C>, LedgerError> {
    let config = service_config(settings)?;
    let dispatcher = dispatcher(InMemoryEventStore::new(), settings);
    Ok(WalletService::new(Arc::new(dispatcher), catalog, config))
}

/// Service over Postgres. Needs `database.url` and a multi-threaded tokio
/// runtime, since the store bridges its sync interface onto async `sqlx`.
pub async fn postgres<C: PlanCatalog>(
    settings: &Settings,
    catalog: C,
) -> Result<PostgresWalletService<C>, LedgerError> {
    let config = service_config(settings)?;
    let url = settings
        .database
        .url
        .as_deref()
        .ok_or_else(|| {
            LedgerError::Validation("database.url is required for the postgres backend".to_string())
        })?;

    let store = PostgresEventStore::connect(url, settings.database.max_connections).await?;
    info!(max_connections = settings.database.max_connections, "connected to postgres event store");

    let dispatcher = dispatcher(store, settings);
    Ok(WalletService::new(Arc::new(dispatcher), catalog, config))
}

fn dispatcher<S>(store: S, settings: &Settings) -> CommandDispatcher<S, Bus> {
    let timeout = Duration::from_millis(settings.ledger.retry_timeout_ms);
    let dispatcher = CommandDispatcher::new(store, Bus::new()).with_retry_timeout(timeout);
    match settings.ledger.max_append_attempts {
        Some(max) => dispatcher.with_max_attempts(max),
        None => dispatcher,
    }
}

fn service_config(settings: &Settings) -> Result<ServiceConfig, LedgerError> {
    ServiceConfig::from_settings(settings).map_err(|e| LedgerError::Validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use ledgerly_core::TenantId;

    use super::*;
    use crate::plans::InMemoryPlanCatalog;

    #[test]
    fn in_memory_service_honours_settings() {
        let settings = Settings::from_toml_str("[ledger]\nmax_append_attempts = 3").unwrap();
        let service = in_memory(&settings, InMemoryPlanCatalog::new()).unwrap();
        assert_eq!(service.dispatcher().max_attempts(), Some(3));
        assert!(service.list_plans(TenantId::new()).is_empty());
    }

    #[test]
    fn default_service_retries_until_the_timeout() {
        let settings = Settings::from_toml_str("[ledger]\nretry_timeout_ms = 1500").unwrap();
        let service = in_memory(&settings, InMemoryPlanCatalog::new()).unwrap();
        let retry = service.dispatcher().retry_policy();
        assert_eq!(retry.max_attempts, None);
        assert_eq!(retry.timeout, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn postgres_requires_a_url() {
        let settings = Settings::from_toml_str("").unwrap();
        let err = postgres(&settings, InMemoryPlanCatalog::new()).await.err().unwrap();
        assert!(matches!(err, LedgerError::Validation(msg) if msg.contains("database.url")));
    }
}
