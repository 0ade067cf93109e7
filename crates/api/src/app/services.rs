//! Service wiring: stores, the applier and its read side, and the background pipeline.
//!
//! ```text
//! handlers ──spawn_blocking──► applier ─► store (rows + ledger + outbox)
//!                                              │
//!                     outbox relay (thread) ◄──┘
//!                              │ publish
//!                              ▼
//!                           EventBus ──► summary projection worker
//!                                    └─► listeners worker (order approvals → applier)
//! ```
//!
//! Service calls are synchronous; the Postgres store drives its futures on the
//! runtime handle it was created with, so handlers must reach it through
//! [`AppServices::run`] and never call it directly from async code.
//!
//! The summary read model is process-local. `start_background` rebuilds it from the
//! outbox before the consumers attach, so a restart does not serve empty totals.

use std::io;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::{info, warn};

use stockledger_events::{EventBus, EventEnvelope, InMemoryEventBus};
use stockledger_infra::config::Settings;
use stockledger_infra::directory::{StaticCatalog, StaticDealerDirectory};
use stockledger_infra::listeners::inventory_listeners;
use stockledger_infra::projections::{
    ProjectionError, RegionKey, RegionTotal, SnapshotKey, StockSnapshot, StockSummaryProjection,
};
use stockledger_infra::read_model::InMemoryReadModelStore;
use stockledger_infra::store::{
    AlertStore, InMemoryAlertStore, InMemoryStockStore, InMemoryVehicleStore, OutboxStore,
    PostgresStockStore, StockStore, StoreError, VehicleStore,
};
use stockledger_infra::workers::{OutboxRelay, PeriodicHandle, ProjectionWorker, WorkerHandle};
use stockledger_infra::{
    RetryPolicy, StockAlertEngine, StockQueryService, TransactionApplier, TransferService,
};

use crate::app::errors::{self, ErrorResponse};

pub type SharedStockStore = Arc<dyn StockStore>;
pub type SharedAlertStore = Arc<dyn AlertStore>;
pub type SharedOutboxStore = Arc<dyn OutboxStore>;
pub type SharedVehicleStore = Arc<dyn VehicleStore>;
pub type Envelope = EventEnvelope<JsonValue>;

pub type Applier = TransactionApplier<SharedStockStore>;
pub type QueryService = StockQueryService<SharedStockStore, Arc<StaticCatalog>>;
pub type AlertEngine = StockAlertEngine<SharedStockStore, SharedAlertStore>;
pub type SummaryProjection = StockSummaryProjection<
    InMemoryReadModelStore<SnapshotKey, StockSnapshot>,
    InMemoryReadModelStore<RegionKey, RegionTotal>,
    Arc<StaticDealerDirectory>,
>;

/// Failure while building services or starting their background threads.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to spawn background thread: {0}")]
    Spawn(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to rebuild the stock summary: {0}")]
    Summary(#[from] ProjectionError),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    Bus(#[from] stockledger_infra::event_bus::RedisStreamsError),
}

enum Background {
    Periodic(PeriodicHandle),
    Worker(WorkerHandle),
}

impl Background {
    fn shutdown(self) {
        match self {
            Background::Periodic(h) => h.shutdown(),
            Background::Worker(h) => h.shutdown(),
        }
    }
}

pub struct AppServices {
    pub applier: Arc<Applier>,
    pub query: QueryService,
    pub alerts: AlertEngine,
    pub transfers: TransferService<SharedStockStore, SharedVehicleStore>,
    pub catalog: Arc<StaticCatalog>,
    pub directory: Arc<StaticDealerDirectory>,
    pub summary: Arc<SummaryProjection>,

    stock: SharedStockStore,
    alert_store: SharedAlertStore,
    outbox: SharedOutboxStore,
    background: Mutex<Vec<Background>>,
}

impl AppServices {
    pub fn new(
        stock: SharedStockStore,
        alert_store: SharedAlertStore,
        outbox: SharedOutboxStore,
        vehicles: SharedVehicleStore,
        retry: RetryPolicy,
    ) -> Self {
        let catalog = Arc::new(StaticCatalog::new());
        let directory = Arc::new(StaticDealerDirectory::new());
        let applier = Arc::new(TransactionApplier::new(stock.clone()).with_retry_policy(retry));

        Self {
            query: StockQueryService::new(stock.clone(), catalog.clone()),
            alerts: StockAlertEngine::new(stock.clone(), alert_store.clone()),
            transfers: TransferService::new(applier.clone(), vehicles),
            summary: Arc::new(StockSummaryProjection::new(
                InMemoryReadModelStore::new(),
                InMemoryReadModelStore::new(),
                directory.clone(),
            )),
            applier,
            catalog,
            directory,
            stock,
            alert_store,
            outbox,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Process-local stores (dev and tests).
    pub fn in_memory(retry: RetryPolicy) -> Self {
        let stock = Arc::new(InMemoryStockStore::new());
        Self::new(
            stock.clone(),
            Arc::new(InMemoryAlertStore::new()),
            stock,
            Arc::new(InMemoryVehicleStore::new()),
            retry,
        )
    }

    /// Run a blocking service call off the async executor.
    pub async fn run<T, E, F>(self: &Arc<Self>, f: F) -> Result<T, axum::response::Response>
    where
        F: FnOnce(&AppServices) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: ErrorResponse + Send + 'static,
    {
        let services = Arc::clone(self);
        match tokio::task::spawn_blocking(move || f(&services)).await {
            Ok(result) => result.map_err(ErrorResponse::into_error_response),
            Err(e) => Err(errors::json_error(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("service call aborted: {e}"),
            )),
        }
    }

    /// Rebuild the summary, then start the outbox relay, the alert scheduler and the
    /// bus consumers on the transport selected by `settings`.
    pub fn start_background(&self, settings: &Settings) -> Result<(), ServiceError> {
        let replayed = self
            .summary
            .rebuild_from_outbox(&self.outbox, settings.outbox.batch_size)?;
        info!(replayed, "stock summary rebuilt from the outbox");

        #[cfg(feature = "redis")]
        if let Some(url) = settings.redis.url.as_deref() {
            use stockledger_infra::event_bus::RedisStreamsEventBus;

            // One consumer group per consumer, so each sees every stock event.
            let bus = |group: String| {
                RedisStreamsEventBus::new(url, Some(settings.redis.stream.clone()), group)
            };
            self.start_pipeline(
                bus(settings.redis.group.clone())?,
                bus(format!("{}-summary", settings.redis.group))?,
                bus(format!("{}-listeners", settings.redis.group))?,
                settings,
            )?;
            info!(stream = %settings.redis.stream, "event pipeline started on redis streams");
            return Ok(());
        }

        let bus: Arc<InMemoryEventBus<Envelope>> = Arc::new(InMemoryEventBus::new());
        self.start_pipeline(bus.clone(), bus.clone(), bus, settings)?;
        info!("event pipeline started on the in-memory bus");
        Ok(())
    }

    fn start_pipeline<B>(
        &self,
        publisher: B,
        summary_bus: B,
        listener_bus: B,
        settings: &Settings,
    ) -> Result<(), ServiceError>
    where
        B: EventBus<Envelope> + 'static,
    {
        let mut started = Vec::with_capacity(4);
        let result = self.spawn_all(publisher, summary_bus, listener_bus, settings, &mut started);
        if result.is_err() {
            for handle in started {
                handle.shutdown();
            }
            return result;
        }

        match self.background.lock() {
            Ok(mut handles) => handles.extend(started),
            Err(_) => warn!("background registry poisoned; workers will not be joined on shutdown"),
        }
        Ok(())
    }

    fn spawn_all<B>(
        &self,
        publisher: B,
        summary_bus: B,
        listener_bus: B,
        settings: &Settings,
        started: &mut Vec<Background>,
    ) -> Result<(), ServiceError>
    where
        B: EventBus<Envelope> + 'static,
    {
        let summary = self.summary.clone();
        started.push(Background::Worker(ProjectionWorker::spawn(
            "stock-summary",
            summary_bus,
            settings.consumer_retry.clone(),
            move |env: &Envelope| summary.apply_envelope(env).map(|_| ()),
        )?));

        let listeners = inventory_listeners(self.applier.clone());
        started.push(Background::Worker(ProjectionWorker::spawn(
            "inventory-listeners",
            listener_bus,
            settings.consumer_retry.clone(),
            move |env: &Envelope| listeners.dispatch(env).map(|_| ()),
        )?));

        started.push(Background::Periodic(
            OutboxRelay::new(self.outbox.clone(), publisher, settings.outbox.batch_size)
                .spawn(&settings.outbox.relay)?,
        ));

        started.push(Background::Periodic(
            StockAlertEngine::new(self.stock.clone(), self.alert_store.clone())
                .spawn_scheduler(&settings.alerts)?,
        ));
        Ok(())
    }

    /// Stop and join every background thread.
    pub fn shutdown(&self) {
        let handles = match self.background.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => return,
        };
        for handle in handles {
            handle.shutdown();
        }
        info!("background workers stopped");
    }
}

/// Build services from settings: Postgres when a database URL is configured,
/// in-memory stores otherwise.
pub async fn build_services(settings: &Settings) -> Result<AppServices, ServiceError> {
    let Some(url) = settings.database.url.as_deref() else {
        warn!("no database configured; using in-memory stores");
        return Ok(AppServices::in_memory(settings.retry.clone()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(url)
        .await?;
    let store = Arc::new(PostgresStockStore::new(pool)?);
    store.ensure_schema().await?;
    info!("connected to postgres");

    Ok(AppServices::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store,
        settings.retry.clone(),
    ))
}
