//! consent-relayd
//!
//! Serves the consent HTTP surface and relays consent store changes to the
//! event bus until SIGINT/SIGTERM, then drains and exits.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consent_relay::config::{Location, RelayConfig};
use consent_relay::cursor::FeedPosition;
use consent_relay::http::{self, AppState};
use consent_relay::session::{Session, SessionSigner};
use consent_relay::storage::{ChangeSubscription, FeedStart, InMemoryStores, UpdateResult};
use consent_relay::{
    open_database, seed, ApplicationCatalog, ApplicationId, Application, ConsentStore, Coordinator, CursorStore,
    EventBus, EventPublisher, FileCursorStore, LogBus, MemoryBus, MemoryCursorStore, PersistentConfig,
    PersistentStores, Policy, PolicyCatalog, PolicySet, RelayError, RelayResult, Shutdown, StorageError, Subject,
    SubjectId,
};

struct SubjectStoreProxy {
    stores: Arc<PersistentStores>,
}

impl ConsentStore for SubjectStoreProxy {
    fn get_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StorageError> {
        self.stores.subjects.get_subject(id)
    }

    fn put_subject(&self, subject: Subject) -> Result<Option<FeedPosition>, StorageError> {
        self.stores.subjects.put_subject(subject)
    }

    fn put_document(&self, id: &SubjectId, document: Value) -> Result<Option<FeedPosition>, StorageError> {
        self.stores.subjects.put_document(id, document)
    }

    fn update_subject(&self, id: &SubjectId, subject: Subject) -> Result<UpdateResult, StorageError> {
        self.stores.subjects.update_subject(id, subject)
    }

    fn delete_subject(&self, id: &SubjectId) -> Result<bool, StorageError> {
        self.stores.subjects.delete_subject(id)
    }

    fn list_subject_ids(&self) -> Result<Vec<SubjectId>, StorageError> {
        self.stores.subjects.list_subject_ids()
    }

    fn head(&self) -> Result<FeedPosition, StorageError> {
        self.stores.subjects.head()
    }

    fn subscribe_changes(&self, start: FeedStart) -> Result<ChangeSubscription, StorageError> {
        self.stores.subjects.subscribe_changes(start)
    }
}

struct PolicyCatalogProxy {
    stores: Arc<PersistentStores>,
}

impl PolicyCatalog for PolicyCatalogProxy {
    fn list_policies(&self, filter: Option<&PolicySet>) -> Result<Vec<Policy>, StorageError> {
        self.stores.policies.list_policies(filter)
    }

    fn put_policy(&self, policy: Policy) -> Result<(), StorageError> {
        self.stores.policies.put_policy(policy)
    }
}

struct ApplicationCatalogProxy {
    stores: Arc<PersistentStores>,
}

impl ApplicationCatalog for ApplicationCatalogProxy {
    fn get_application(&self, id: &ApplicationId) -> Result<Option<Application>, StorageError> {
        self.stores.applications.get_application(id)
    }

    fn list_applications(&self) -> Result<Vec<Application>, StorageError> {
        self.stores.applications.list_applications()
    }

    fn put_application(&self, application: Application) -> Result<(), StorageError> {
        self.stores.applications.put_application(application)
    }
}

struct Stores {
    subjects: Arc<dyn ConsentStore>,
    policies: Arc<dyn PolicyCatalog>,
    applications: Arc<dyn ApplicationCatalog>,
}

fn open_stores(config: &RelayConfig) -> RelayResult<Stores> {
    match config.store_location() {
        Location::Memory => {
            tracing::warn!("consent store is in memory; subjects are lost on exit");
            let InMemoryStores {
                subjects,
                policies,
                applications,
            } = InMemoryStores::new();
            Ok(Stores {
                subjects: Arc::new(subjects),
                policies: Arc::new(policies),
                applications: Arc::new(applications),
            })
        }
        Location::Directory(dir) => {
            let stores = Arc::new(open_database(
                &dir,
                Some(PersistentConfig {
                    sync_on_write: config.sync_on_write(),
                    ..PersistentConfig::default()
                }),
            )?);
            tracing::info!(dir = %dir.display(), wal_bytes = stores.wal_size(), "consent store opened");
            Ok(Stores {
                subjects: Arc::new(SubjectStoreProxy {
                    stores: Arc::clone(&stores),
                }),
                policies: Arc::new(PolicyCatalogProxy {
                    stores: Arc::clone(&stores),
                }),
                applications: Arc::new(ApplicationCatalogProxy { stores }),
            })
        }
    }
}

fn open_cursor_store(config: &RelayConfig) -> RelayResult<Arc<dyn CursorStore>> {
    match config.cursor_location() {
        Location::Memory => Ok(Arc::new(MemoryCursorStore::new())),
        Location::Directory(dir) => Ok(Arc::new(FileCursorStore::open(&dir)?)),
    }
}

fn open_bus(config: &RelayConfig) -> RelayResult<Arc<dyn EventBus>> {
    match config.bus_location() {
        Location::Memory => {
            tracing::warn!("event bus is in memory; published events are not retained");
            Ok(Arc::new(MemoryBus::new()))
        }
        Location::Directory(dir) => Ok(Arc::new(LogBus::open(&dir, config.sync_on_write())?)),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::warn!("shutdown requested; draining");
}

async fn run(config: RelayConfig) -> RelayResult<()> {
    config.validate()?;
    let secret = config
        .session_secret
        .as_deref()
        .ok_or_else(|| RelayError::config("session secret is required"))?;
    let sessions = Arc::new(SessionSigner::new(secret)?);

    let stores = open_stores(&config)?;
    let cursor_store = open_cursor_store(&config)?;
    let bus = open_bus(&config)?;

    if config.seed_demo {
        seed::seed_demo(
            stores.subjects.as_ref(),
            stores.policies.as_ref(),
            stores.applications.as_ref(),
        )?;
        tracing::info!(
            subject_id = seed::BERNARD,
            token = %sessions.sign(&Session::user(seed::BERNARD)),
            "demo session token"
        );
    }

    let publisher = Arc::new(EventPublisher::start(bus, config.publisher_config())?);
    let shutdown = Shutdown::new();
    let coordinator = Coordinator::new(
        Arc::clone(&stores.subjects),
        cursor_store,
        Arc::clone(&publisher),
        config.coordinator_config(),
    )
    .with_shutdown(shutdown.clone())
    .spawn()?;

    let app = http::router(
        AppState {
            subjects: stores.subjects,
            policies: stores.policies,
            applications: stores.applications,
            sessions,
        },
        config.max_sockets,
    );

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::config(format!("cannot listen on {addr}: {e}")))?;
    tracing::info!(%addr, topic = %config.topic, store = %config.store_location(), bus = %config.bus_location(), "consent-relayd listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown.trigger();
    let summary = tokio::task::spawn_blocking(move || coordinator.join())
        .await
        .map_err(|e| RelayError::internal(format!("coordinator join failed: {e}")))??;
    tracing::info!(
        published = summary.published,
        suppressed = summary.suppressed,
        abandoned = summary.abandoned,
        dead_lettered = summary.dead_lettered,
        shed = summary.shed,
        cursor = ?summary.final_cursor.map(|c| c.position.as_u64()),
        "relay drained"
    );

    served.map_err(|e| RelayError::internal(format!("http server failed: {e}")))
}

fn init_tracing(config: &RelayConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    if config.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = RelayConfig::parse();
    init_tracing(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "consent-relayd failed");
            ExitCode::FAILURE
        }
    }
}
