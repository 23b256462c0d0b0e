//! Graph executor
//!
//! An [`Engine`] owns the store, the cache, the runtime and the service
//! manager for the lifetime of the process. Graphs are evaluated through an
//! [`EngineSession`], which scopes service de-duplication and debugging.

mod evaluate;
pub mod flight;
pub mod report;

pub use report::{
    EvaluationReport, NodeFailure, NodeOutput, NodeResult, RootResult, RootSummary,
    ServiceEndpoint,
};

use crate::audit::{AuditEvent, AuditLog};
use crate::cache::{mb_to_bytes, CacheEntry, CacheLimits, CacheLookup, Fingerprint, OperationCache};
use crate::config::{Config, ConfigManager};
use crate::debug::DebugHandle;
use crate::error::{KilnError, KilnResult};
use crate::graph::{Graph, OperationId};
use crate::runtime::ContainerRuntime;
use crate::secrets::{EngineKey, ProviderRegistry, SecretBroker};
use crate::service::ServiceManager;
use crate::session::{Session, SessionId, SessionRegistry};
use crate::store::ContentStore;
use evaluate::Evaluation;
use flight::FlightGroup;
use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Session records older than this with no live owner are removed on open
const STALE_SESSION_HOURS: u32 = 24;

/// Everything an engine is assembled from
pub struct EngineParts {
    pub config: Config,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<ContentStore>,
    pub cache: Option<Arc<OperationCache>>,
    pub broker: Arc<SecretBroker>,
    pub scratch: PathBuf,
    pub sessions_dir: Option<PathBuf>,
    pub audit: AuditLog,
}

pub(crate) struct EngineInner {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<ContentStore>,
    cache: Option<Arc<OperationCache>>,
    broker: Arc<SecretBroker>,
    services: ServiceManager,
    sessions: SessionRegistry,
    flights: FlightGroup<Fingerprint, CacheEntry>,
    /// Bounds concurrently running sandboxes
    slots: Semaphore,
    scratch: PathBuf,
    audit: AuditLog,
}

impl EngineInner {
    /// Serve a cached result, treating a corrupt entry as a miss
    async fn cached(&self, fp: &Fingerprint) -> Option<CacheEntry> {
        let cache = self.cache.as_ref()?;
        match cache.lookup(fp).await {
            CacheLookup::Hit(entry) => Some(entry),
            CacheLookup::Miss => None,
            CacheLookup::Corrupt(e) => {
                warn!("Recomputing {}: {}", fp.short(), e);
                self.audit
                    .record(AuditEvent::CacheCorrupt {
                        fingerprint: fp.hex(),
                        reason: e.to_string(),
                    })
                    .await;
                None
            }
        }
    }

    /// Record a result; a failed insert only costs a future recomputation
    async fn remember(&self, entry: &CacheEntry) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.insert(entry.clone()).await {
                warn!("Failed to cache {}: {}", entry.fingerprint.short(), e);
            }
        }
    }
}

/// The long-lived executor
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open the persisted store and cache under the configured state directory
    pub async fn open(config: Config, runtime: Arc<dyn ContainerRuntime>) -> KilnResult<Self> {
        let store = Arc::new(ContentStore::open(ConfigManager::store_dir(&config)).await?);
        let cache = if config.cache.enabled {
            let limits = CacheLimits {
                max_entries: config.cache.max_entries,
                max_total_bytes: mb_to_bytes(config.cache.max_total_mb),
            };
            Some(Arc::new(
                OperationCache::open(ConfigManager::cache_dir(&config), limits, store.clone())
                    .await?,
            ))
        } else {
            None
        };

        let audit = AuditLog::new(&config);
        let key = EngineKey::load_or_create(&ConfigManager::engine_key_path()).await?;
        let broker = SecretBroker::new(
            ProviderRegistry::with_defaults(&config.secrets),
            key,
            Duration::from_secs(config.secrets.timeout_secs),
            audit.clone(),
        );

        let scratch = ConfigManager::scratch_dir();
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", scratch.display()), e))?;

        let engine = Self::from_parts(EngineParts {
            config,
            runtime,
            store,
            cache,
            broker: Arc::new(broker),
            scratch,
            sessions_dir: Some(ConfigManager::sessions_dir()),
            audit,
        });
        if let Err(e) = engine.inner.sessions.cleanup(STALE_SESSION_HOURS).await {
            warn!("Failed to clean up stale session records: {}", e);
        }
        Ok(engine)
    }

    pub fn from_parts(parts: EngineParts) -> Self {
        let services = ServiceManager::new(
            parts.runtime.clone(),
            parts.store.clone(),
            parts.scratch.clone(),
            parts.config.services.clone(),
            parts.config.runtime.name_prefix.clone(),
            parts.audit.clone(),
        );
        let slots = Semaphore::new(parts.config.engine.max_parallel.max(1));
        Self {
            inner: Arc::new(EngineInner {
                config: parts.config,
                runtime: parts.runtime,
                store: parts.store,
                cache: parts.cache,
                broker: parts.broker,
                services,
                sessions: SessionRegistry::new(parts.sessions_dir),
                flights: FlightGroup::new(),
                slots,
                scratch: parts.scratch,
                audit: parts.audit,
            }),
        }
    }

    /// Open a session in the configured default module
    pub async fn session(&self, name: &str) -> KilnResult<EngineSession> {
        let module = self.inner.config.engine.default_module.clone();
        self.session_in(name, &module).await
    }

    /// Open a session owned by `module`
    pub async fn session_in(&self, name: &str, module: &str) -> KilnResult<EngineSession> {
        let session = self.inner.sessions.open(name, module).await?;
        Ok(EngineSession {
            engine: self.inner.clone(),
            session,
            debug: None,
        })
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.inner.store
    }

    pub fn cache(&self) -> Option<&Arc<OperationCache>> {
        self.inner.cache.as_ref()
    }

    pub fn services(&self) -> &ServiceManager {
        &self.inner.services
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    /// Stop every service and flush persisted state
    pub async fn close(&self) -> KilnResult<()> {
        self.inner.services.shutdown().await;
        for session in self.inner.sessions.list() {
            self.inner.sessions.begin_close(&session.id)?;
            self.inner.sessions.finish_close(&session.id).await?;
        }
        if let Some(cache) = &self.inner.cache {
            cache.flush().await?;
        }
        self.inner.store.flush().await?;
        info!("Engine closed");
        Ok(())
    }
}

/// A client's scope: services are shared within it and torn down with it
pub struct EngineSession {
    engine: Arc<EngineInner>,
    session: Session,
    debug: Option<DebugHandle>,
}

impl EngineSession {
    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Route breakpoints and failures to a debug controller
    pub fn with_debugger(mut self, handle: DebugHandle) -> Self {
        self.debug = Some(handle);
        self
    }

    /// Evaluate `roots` (or the graph's own roots when empty)
    ///
    /// Each root gets its own result; a failure only affects the roots that
    /// depend on the failing node. Dropping the returned future cancels
    /// work no other evaluation is waiting for.
    pub async fn evaluate(
        &self,
        graph: &Graph,
        roots: &[OperationId],
    ) -> KilnResult<EvaluationReport> {
        self.engine.sessions.ensure_open(&self.session.id)?;
        let plan = graph.validate()?;

        let roots: Vec<OperationId> = if roots.is_empty() {
            graph.roots.clone()
        } else {
            roots.to_vec()
        };
        if roots.is_empty() {
            return Err(KilnError::InvalidGraph("no roots requested".to_string()));
        }
        for root in &roots {
            if graph.get(root).is_none() {
                return Err(KilnError::UnknownOperation(root.to_string()));
            }
        }

        debug!(
            "Evaluating {} root(s) of {} operations in session {}",
            roots.len(),
            graph.operations.len(),
            self.session.id.short()
        );
        let evaluation = Evaluation::new(
            self.engine.clone(),
            self.session.clone(),
            self.debug.clone(),
            Arc::new(graph.clone()),
            Arc::new(plan),
        );
        let futures: Vec<_> = roots.iter().map(|root| evaluation.node(root)).collect();
        let results = join_all(futures).await;

        Ok(EvaluationReport {
            roots: roots
                .into_iter()
                .zip(results)
                .map(|(root, result)| RootResult { root, result })
                .collect(),
        })
    }

    pub async fn evaluate_one(&self, graph: &Graph, root: &OperationId) -> KilnResult<NodeResult> {
        let mut report = self.evaluate(graph, std::slice::from_ref(root)).await?;
        report
            .roots
            .pop()
            .map(|r| r.result)
            .ok_or_else(|| KilnError::Internal("empty evaluation report".to_string()))
    }

    /// Start a service node and keep it running until [`stop_service`]
    ///
    /// [`stop_service`]: EngineSession::stop_service
    pub async fn start_service(
        &self,
        graph: &Graph,
        id: &OperationId,
    ) -> KilnResult<ServiceEndpoint> {
        match self.evaluate_one(graph, id).await? {
            Ok(NodeOutput::Service(endpoint)) => {
                self.engine.services.pin(&endpoint.lease);
                Ok(endpoint)
            }
            Ok(NodeOutput::Artifact(_)) => Err(KilnError::InvalidGraph(format!(
                "'{}' is not a service",
                id
            ))),
            Err(failure) => Err(KilnError::DependencyFailed {
                operation: failure.to_string(),
            }),
        }
    }

    /// Stop a service now, skipping the grace period
    pub async fn stop_service(&self, endpoint: &ServiceEndpoint) -> KilnResult<()> {
        self.engine
            .services
            .stop(&self.session.id, &endpoint.lease.fingerprint())
            .await
    }

    /// Close the session; its services wind down through the grace period
    pub async fn close(self) -> KilnResult<()> {
        if !self.engine.sessions.begin_close(&self.session.id)? {
            return Ok(());
        }
        let owned = self.engine.services.close_session(&self.session.id).await;
        debug!(
            "Session {} released {} service(s)",
            self.session.id.short(),
            owned
        );
        self.engine.sessions.finish_close(&self.session.id).await
    }
}
