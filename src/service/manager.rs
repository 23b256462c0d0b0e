//! Service lifecycle manager
//!
//! Instances are keyed by (session, fingerprint). Every requester holds a
//! [`ServiceLease`]; when the last lease is dropped a running instance
//! enters `StopPending` and is torn down once the grace period passes,
//! unless a new lease revives it first.

use crate::audit::{AuditEvent, AuditLog};
use crate::cache::Fingerprint;
use crate::config::schema::ServicesConfig;
use crate::error::{KilnError, KilnResult};
use crate::runtime::{ContainerRuntime, MountPoint, NetworkAttachment, SandboxHandle, ServiceLaunch};
use crate::service::expose::{self, PortBinding, PortMapping};
use crate::service::health::{wait_healthy, HealthPolicy};
use crate::service::{hostname_for, ServiceSpec, ServiceState};
use crate::session::{Session, SessionId};
use crate::store::{ContentStore, EntryKind};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InstanceKey {
    session: SessionId,
    fingerprint: Fingerprint,
}

struct Instance {
    key: InstanceKey,
    hostname: String,
    label: String,
    /// Only written while `inner` is locked
    state: watch::Sender<ServiceState>,
    inner: Mutex<InstanceInner>,
}

struct InstanceInner {
    /// Live leases, plus one while pinned by an explicit start
    refs: usize,
    pinned: bool,
    /// Bumped on every transition that invalidates a pending grace timer
    generation: u64,
    handle: Option<SandboxHandle>,
    failure: Option<Arc<KilnError>>,
    exposures: Vec<(PortBinding, JoinHandle<()>)>,
    workdir: Option<PathBuf>,
}

/// Resources released by a teardown
#[derive(Default)]
struct Released {
    handle: Option<SandboxHandle>,
    exposures: Vec<(PortBinding, JoinHandle<()>)>,
    workdir: Option<PathBuf>,
}

impl Instance {
    fn new(key: InstanceKey, hostname: String, label: String) -> Self {
        let (state, _) = watch::channel(ServiceState::Starting);
        Self {
            key,
            hostname,
            label,
            state,
            inner: Mutex::new(InstanceInner {
                refs: 1,
                pinned: false,
                generation: 0,
                handle: None,
                failure: None,
                exposures: Vec::new(),
                workdir: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InstanceInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> ServiceState {
        *self.state.borrow()
    }

    fn set(&self, next: ServiceState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            if !prev.can_become(next) {
                warn!("{}: unexpected transition {} -> {}", self.hostname, prev, next);
            }
            debug!("{}: {} -> {}", self.hostname, prev, next);
        }
    }

    /// Add a reference unless the instance is finished
    fn try_retain(&self) -> bool {
        let mut inner = self.lock();
        let state = self.current();
        if state.is_terminal() {
            return false;
        }
        inner.refs += 1;
        if state == ServiceState::StopPending {
            inner.generation += 1;
            self.set(ServiceState::Running);
            debug!("{} reused within its grace period", self.hostname);
        }
        true
    }

    fn take(inner: &mut InstanceInner) -> Released {
        Released {
            handle: inner.handle.take(),
            exposures: std::mem::take(&mut inner.exposures),
            workdir: inner.workdir.take(),
        }
    }

    async fn wait_ready(&self) -> KilnResult<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| s.is_live() || s.is_terminal())
            .await
            .map_err(|_| KilnError::Internal("service state channel closed".to_string()))?;
        match state {
            ServiceState::Failed => Err(self.failure_error()),
            ServiceState::Stopped => Err(KilnError::ServiceStart {
                hostname: self.hostname.clone(),
                reason: "stopped before it became ready".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// The failure every waiter receives
    fn failure_error(&self) -> KilnError {
        let inner = self.lock();
        match inner.failure.as_deref() {
            Some(KilnError::ServiceUnhealthy { hostname, attempts }) => KilnError::ServiceUnhealthy {
                hostname: hostname.clone(),
                attempts: *attempts,
            },
            Some(other) => KilnError::ServiceStart {
                hostname: self.hostname.clone(),
                reason: other.to_string(),
            },
            None => KilnError::ServiceStart {
                hostname: self.hostname.clone(),
                reason: "failed".to_string(),
            },
        }
    }
}

struct Shared {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<ContentStore>,
    scratch: PathBuf,
    config: ServicesConfig,
    name_prefix: String,
    audit: AuditLog,
    instances: DashMap<InstanceKey, Arc<Instance>>,
    networks: DashMap<SessionId, String>,
    closing: DashMap<SessionId, ()>,
}

impl Shared {
    fn claim(&self, session: &Session, spec: &ServiceSpec) -> KilnResult<(Arc<Instance>, bool)> {
        if self.closing.contains_key(&session.id) {
            return Err(KilnError::SessionClosed(session.id.to_string()));
        }

        let key = InstanceKey {
            session: session.id,
            fingerprint: spec.fingerprint,
        };
        let fresh = || {
            Arc::new(Instance::new(
                key,
                hostname_for(&spec.fingerprint, &session.module, &session.id),
                spec.label.clone(),
            ))
        };

        Ok(match self.instances.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().try_retain() {
                    (entry.get().clone(), false)
                } else {
                    let instance = fresh();
                    entry.insert(instance.clone());
                    (instance, true)
                }
            }
            Entry::Vacant(entry) => {
                let instance = fresh();
                entry.insert(instance.clone());
                (instance, true)
            }
        })
    }

    fn release(self: &Arc<Self>, instance: &Arc<Instance>) {
        let generation = {
            let mut inner = instance.lock();
            inner.refs = inner.refs.saturating_sub(1);
            if inner.refs > 0 || instance.current() != ServiceState::Running {
                return;
            }
            inner.generation += 1;
            instance.set(ServiceState::StopPending);
            inner.generation
        };
        self.arm_grace(instance.clone(), generation);
    }

    fn arm_grace(self: &Arc<Self>, instance: Arc<Instance>, generation: u64) {
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let shared = self.clone();
                let grace = self.config.grace_period();
                rt.spawn(async move {
                    tokio::time::sleep(grace).await;
                    shared.expire(instance, generation).await;
                });
            }
            Err(_) => warn!(
                "No async runtime to stop {}; it stays up until shutdown",
                instance.hostname
            ),
        }
    }

    async fn expire(&self, instance: Arc<Instance>, generation: u64) {
        let released = {
            let mut inner = instance.lock();
            if inner.generation != generation
                || inner.refs > 0
                || instance.current() != ServiceState::StopPending
            {
                return;
            }
            instance.set(ServiceState::Stopped);
            Instance::take(&mut inner)
        };
        info!("Grace period over, stopping {} ({})", instance.label, instance.hostname);
        self.teardown(&instance, released).await;
    }

    async fn fail(&self, instance: &Arc<Instance>, error: KilnError) {
        let released = {
            let mut inner = instance.lock();
            if instance.current().is_terminal() {
                return;
            }
            warn!("Service {} ({}) failed: {}", instance.label, instance.hostname, error);
            inner.failure = Some(Arc::new(error));
            instance.set(ServiceState::Failed);
            Instance::take(&mut inner)
        };
        self.teardown(instance, released).await;
    }

    async fn teardown(&self, instance: &Arc<Instance>, released: Released) {
        for (binding, task) in released.exposures {
            task.abort();
            debug!("Released {} for {}", binding.host, instance.hostname);
        }
        if let Some(handle) = released.handle {
            if let Err(e) = self.runtime.stop_service(&handle).await {
                warn!("Failed to stop {}: {}", instance.hostname, e);
            }
            self.audit
                .record(AuditEvent::ServiceStopped {
                    operation: instance.label.clone(),
                    hostname: instance.hostname.clone(),
                    session: instance.key.session.to_string(),
                })
                .await;
        }
        if let Some(dir) = released.workdir {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                debug!("Could not remove {}: {}", dir.display(), e);
            }
        }
        self.instances
            .remove_if(&instance.key, |_, current| Arc::ptr_eq(current, instance));
        self.release_network_if_idle(instance.key.session).await;
    }

    /// Drop the network of a closed session once its last service is gone
    async fn release_network_if_idle(&self, session: SessionId) {
        if !self.closing.contains_key(&session) {
            return;
        }
        if self.instances.iter().any(|e| e.key().session == session) {
            return;
        }
        if let Some((_, network)) = self.networks.remove(&session) {
            if let Err(e) = self.runtime.remove_network(&network).await {
                warn!("Failed to remove network {}: {}", network, e);
            }
        }
    }

    async fn ensure_network(&self, session: SessionId) -> KilnResult<String> {
        if let Some(network) = self.networks.get(&session) {
            return Ok(network.clone());
        }
        let name = format!("{}-{}", self.name_prefix, session.short());
        self.runtime.create_network(&name).await?;
        self.networks.insert(session, name.clone());
        Ok(name)
    }

    /// Materialise the rootfs and mounts of one member
    async fn prepare(&self, instance: &Instance, spec: &ServiceSpec) -> KilnResult<ServiceLaunch> {
        if spec.rootfs.kind != EntryKind::Dir {
            return Err(KilnError::InvalidGraph(format!(
                "service '{}' needs a directory as its rootfs",
                spec.label
            )));
        }

        let id = Uuid::new_v4().simple().to_string();
        let dir = self
            .scratch
            .join("services")
            .join(format!("{}-{}", instance.hostname, &id[..8]));
        instance.lock().workdir = Some(dir.clone());

        let rootfs = dir.join("rootfs");
        self.store.materialize(&spec.rootfs.address, &rootfs).await?;

        let mut mounts = Vec::with_capacity(spec.mounts.len());
        for (i, mount) in spec.mounts.iter().enumerate() {
            let source = dir.join("mounts").join(i.to_string());
            self.store.export(&mount.artifact, &source).await?;
            mounts.push(MountPoint {
                source,
                target: mount.target.clone(),
                readonly: mount.readonly,
            });
        }

        let network = self.ensure_network(instance.key.session).await?;

        Ok(ServiceLaunch {
            label: spec.label.clone(),
            hostname: instance.hostname.clone(),
            rootfs,
            args: spec.args.clone(),
            env: spec.env.clone(),
            workdir: spec.workdir.clone(),
            mounts,
            secrets: spec.secrets.clone(),
            network: NetworkAttachment {
                network,
                hosts: spec.hosts.clone(),
            },
            ports: spec.ports.clone(),
        })
    }

    /// Launch every member, then health-check them together
    ///
    /// Members of a group may need each other to become healthy, so no
    /// member is probed before all have been launched.
    async fn start_group(self: Arc<Self>, members: Vec<(Arc<Instance>, ServiceSpec)>) {
        let mut launched = Vec::with_capacity(members.len());

        for (instance, spec) in members {
            let launch = match self.prepare(&instance, &spec).await {
                Ok(launch) => launch,
                Err(e) => {
                    self.fail(&instance, e).await;
                    continue;
                }
            };

            match self.runtime.launch_service(launch).await {
                Ok(handle) => {
                    let stopped = {
                        let mut inner = instance.lock();
                        if instance.current() == ServiceState::Starting {
                            inner.handle = Some(handle.clone());
                            instance.set(ServiceState::HealthChecking);
                            false
                        } else {
                            true
                        }
                    };
                    if stopped {
                        // Stopped explicitly while launching
                        if let Err(e) = self.runtime.stop_service(&handle).await {
                            warn!("Failed to stop {}: {}", instance.hostname, e);
                        }
                        continue;
                    }
                    self.audit
                        .record(AuditEvent::ServiceStarted {
                            operation: instance.label.clone(),
                            hostname: instance.hostname.clone(),
                            session: instance.key.session.to_string(),
                        })
                        .await;
                    launched.push((instance, spec, handle));
                }
                Err(e) => self.fail(&instance, e).await,
            }
        }

        let checks = launched.into_iter().map(|(instance, spec, handle)| {
            let shared = self.clone();
            async move {
                let policy = HealthPolicy::from_config(&shared.config).with_attempts(spec.health_attempts);
                match wait_healthy(shared.runtime.as_ref(), &handle, &spec.health, &policy).await {
                    Ok(_) => shared.mark_running(&instance),
                    Err(e) => shared.fail(&instance, e).await,
                }
            }
        });
        futures_util::future::join_all(checks).await;
    }

    fn mark_running(self: &Arc<Self>, instance: &Arc<Instance>) {
        let generation = {
            let mut inner = instance.lock();
            if instance.current() != ServiceState::HealthChecking {
                return;
            }
            if inner.refs == 0 {
                // Every requester went away during startup
                inner.generation += 1;
                instance.set(ServiceState::StopPending);
                Some(inner.generation)
            } else {
                instance.set(ServiceState::Running);
                None
            }
        };
        info!("Service {} is running as {}", instance.label, instance.hostname);
        if let Some(generation) = generation {
            self.arm_grace(instance.clone(), generation);
        }
    }

    fn find(&self, session: &SessionId, fingerprint: &Fingerprint) -> KilnResult<Arc<Instance>> {
        let key = InstanceKey {
            session: *session,
            fingerprint: *fingerprint,
        };
        self.instances
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| KilnError::ServiceNotFound(fingerprint.short()))
    }
}

/// A reference to a ready service instance
///
/// Dropping the lease releases the reference.
pub struct ServiceLease {
    shared: Arc<Shared>,
    instance: Arc<Instance>,
}

impl ServiceLease {
    pub fn hostname(&self) -> &str {
        &self.instance.hostname
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.instance.key.fingerprint
    }

    pub fn session(&self) -> SessionId {
        self.instance.key.session
    }

    pub fn state(&self) -> ServiceState {
        self.instance.current()
    }

    pub fn handle(&self) -> Option<SandboxHandle> {
        self.instance.lock().handle.clone()
    }

    /// Address on the session network, when the runtime reports one
    pub fn address(&self) -> Option<IpAddr> {
        self.instance.lock().handle.as_ref().and_then(|h| h.address)
    }
}

impl Drop for ServiceLease {
    fn drop(&mut self) {
        self.shared.release(&self.instance);
    }
}

impl fmt::Debug for ServiceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLease")
            .field("hostname", &self.instance.hostname)
            .field("state", &self.instance.current())
            .finish()
    }
}

/// Starts, de-duplicates, health-checks and tears down services
#[derive(Clone)]
pub struct ServiceManager {
    shared: Arc<Shared>,
}

impl ServiceManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<ContentStore>,
        scratch: PathBuf,
        config: ServicesConfig,
        name_prefix: impl Into<String>,
        audit: AuditLog,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime,
                store,
                scratch,
                config,
                name_prefix: name_prefix.into(),
                audit,
                instances: DashMap::new(),
                networks: DashMap::new(),
                closing: DashMap::new(),
            }),
        }
    }

    /// Hostname the instance of `fingerprint` has (or will have) in `session`
    pub fn hostname(&self, session: &Session, fingerprint: &Fingerprint) -> String {
        hostname_for(fingerprint, &session.module, &session.id)
    }

    /// Network that sandboxes binding this session's services must join
    pub async fn network_for(&self, session: &SessionId) -> KilnResult<String> {
        if self.shared.closing.contains_key(session) {
            return Err(KilnError::SessionClosed(session.to_string()));
        }
        self.shared.ensure_network(*session).await
    }

    /// Get a running instance, starting it if needed
    pub async fn acquire(&self, session: &Session, spec: ServiceSpec) -> KilnResult<ServiceLease> {
        let mut leases = self.acquire_group(session, vec![spec]).await?;
        leases
            .pop()
            .ok_or_else(|| KilnError::Internal("empty service group".to_string()))
    }

    /// Acquire a group of services that may reference each other
    ///
    /// Hostnames are fixed for every member before any of them launches.
    /// On error, leases already taken are released.
    pub async fn acquire_group(
        &self,
        session: &Session,
        specs: Vec<ServiceSpec>,
    ) -> KilnResult<Vec<ServiceLease>> {
        let mut leases = Vec::with_capacity(specs.len());
        let mut to_start = Vec::new();

        for spec in specs {
            let (instance, fresh) = self.shared.claim(session, &spec)?;
            leases.push(ServiceLease {
                shared: self.shared.clone(),
                instance: instance.clone(),
            });
            if fresh {
                to_start.push((instance, spec));
            }
        }

        if !to_start.is_empty() {
            // Detached so a cancelled requester never strands other waiters
            tokio::spawn(self.shared.clone().start_group(to_start));
        }

        for lease in &leases {
            lease.instance.wait_ready().await?;
        }
        Ok(leases)
    }

    /// Start a service and keep it up until `stop`, bypassing the grace period
    pub async fn start(&self, session: &Session, spec: ServiceSpec) -> KilnResult<String> {
        let lease = self.acquire(session, spec).await?;
        self.pin(&lease);
        Ok(lease.hostname().to_string())
    }

    /// Keep a leased instance up after its leases are gone, until `stop`
    pub fn pin(&self, lease: &ServiceLease) {
        let mut inner = lease.instance.lock();
        if !inner.pinned {
            inner.pinned = true;
            inner.refs += 1;
        }
    }

    /// Stop a service now, regardless of outstanding leases
    pub async fn stop(&self, session: &SessionId, fingerprint: &Fingerprint) -> KilnResult<()> {
        let instance = self.shared.find(session, fingerprint)?;
        let released = {
            let mut inner = instance.lock();
            if instance.current().is_terminal() {
                return Ok(());
            }
            inner.pinned = false;
            inner.generation += 1;
            instance.set(ServiceState::Stopped);
            Instance::take(&mut inner)
        };
        info!("Stopping {} ({})", instance.label, instance.hostname);
        self.shared.teardown(&instance, released).await;
        Ok(())
    }

    /// Release a closing session's services through the grace path
    ///
    /// Returns the number of instances the session still owned.
    pub async fn close_session(&self, session: &SessionId) -> usize {
        self.shared.closing.insert(*session, ());

        let instances: Vec<Arc<Instance>> = self
            .shared
            .instances
            .iter()
            .filter(|e| e.key().session == *session)
            .map(|e| e.value().clone())
            .collect();

        for instance in &instances {
            let unpinned = {
                let mut inner = instance.lock();
                std::mem::replace(&mut inner.pinned, false)
            };
            if unpinned {
                self.shared.release(instance);
            }
        }

        if instances.is_empty() {
            self.shared.release_network_if_idle(*session).await;
        }
        instances.len()
    }

    /// Stop every service immediately and remove all networks
    pub async fn shutdown(&self) {
        let instances: Vec<Arc<Instance>> = self
            .shared
            .instances
            .iter()
            .map(|e| e.value().clone())
            .collect();

        for instance in instances {
            let released = {
                let mut inner = instance.lock();
                inner.generation += 1;
                if !instance.current().is_terminal() {
                    instance.set(ServiceState::Stopped);
                }
                Instance::take(&mut inner)
            };
            self.shared.teardown(&instance, released).await;
        }

        let networks: Vec<String> = self
            .shared
            .networks
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for network in networks {
            if let Err(e) = self.shared.runtime.remove_network(&network).await {
                warn!("Failed to remove network {}: {}", network, e);
            }
        }
        self.shared.networks.clear();
        self.shared.closing.clear();
    }

    pub fn state(&self, session: &SessionId, fingerprint: &Fingerprint) -> Option<ServiceState> {
        self.shared
            .find(session, fingerprint)
            .ok()
            .map(|instance| instance.current())
    }

    /// Number of instances not yet torn down
    pub fn active_count(&self) -> usize {
        self.shared.instances.len()
    }

    /// Publish a service port on the host for as long as the instance lives
    pub async fn expose(
        &self,
        session: &SessionId,
        fingerprint: &Fingerprint,
        port: u16,
        mapping: PortMapping,
    ) -> KilnResult<PortBinding> {
        let instance = self.shared.find(session, fingerprint)?;
        let not_running = || KilnError::ServiceNotFound(instance.hostname.clone());

        let handle = {
            let inner = instance.lock();
            if !instance.current().is_live() {
                return Err(not_running());
            }
            if let Some((binding, _)) = inner.exposures.iter().find(|(b, _)| b.service_port == port) {
                return Ok(*binding);
            }
            inner.handle.clone().ok_or_else(not_running)?
        };

        let target = self.shared.runtime.sandbox_address(&handle, port).await?;
        let (binding, task) = expose::forward(&instance.hostname, port, mapping, target).await?;

        let mut inner = instance.lock();
        if !instance.current().is_live() {
            task.abort();
            return Err(not_running());
        }
        inner.exposures.push((binding, task));
        info!("Exposed {}:{} on {}", instance.hostname, port, binding.host);
        Ok(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FingerprintBuilder;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::HostAlias;
    use crate::service::HealthCheck;
    use crate::store::Artifact;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, BufReader};

    struct Fixture {
        _dir: TempDir,
        runtime: Arc<FakeRuntime>,
        manager: ServiceManager,
        rootfs: Artifact,
    }

    fn config() -> ServicesConfig {
        ServicesConfig {
            grace_period_secs: 10,
            health_max_attempts: 3,
            health_interval_ms: 100,
            health_max_interval_ms: 400,
            health_timeout_ms: 50,
        }
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::open(dir.path().join("store")).await.unwrap());
        let rootfs = Artifact::dir(store.empty_tree().await.unwrap());
        let runtime = Arc::new(FakeRuntime::new());
        let manager = ServiceManager::new(
            runtime.clone(),
            store,
            dir.path().join("scratch"),
            config(),
            "kiln",
            AuditLog::disabled(),
        );
        Fixture {
            _dir: dir,
            runtime,
            manager,
            rootfs,
        }
    }

    fn fp(name: &str) -> Fingerprint {
        FingerprintBuilder::new("service").str("name", name).finish()
    }

    fn spec(name: &str, rootfs: Artifact) -> ServiceSpec {
        let mut spec = ServiceSpec::new(fp(name), name, rootfs);
        spec.ports = vec![6379];
        spec.health = HealthCheck::Tcp { port: 6379 };
        spec
    }

    #[tokio::test(start_paused = true)]
    async fn reacquire_within_grace_reuses_instance() {
        let f = fixture().await;
        let session = Session::new("test", "main");

        let lease = f.manager.acquire(&session, spec("redis", f.rootfs)).await.unwrap();
        let hostname = lease.hostname().to_string();
        assert_eq!(lease.state(), ServiceState::Running);
        drop(lease);
        assert_eq!(
            f.manager.state(&session.id, &fp("redis")),
            Some(ServiceState::StopPending)
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        let lease = f.manager.acquire(&session, spec("redis", f.rootfs)).await.unwrap();
        assert_eq!(lease.hostname(), hostname);
        assert_eq!(lease.state(), ServiceState::Running);
        assert_eq!(f.runtime.launches(), 1);
        assert_eq!(f.runtime.stops(), 0);

        // The first timer must not fire for the revived instance
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(f.runtime.stops(), 0);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_tears_down() {
        let f = fixture().await;
        let session = Session::new("test", "main");

        let lease = f.manager.acquire(&session, spec("redis", f.rootfs)).await.unwrap();
        drop(lease);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(f.runtime.stops(), 1);
        assert!(matches!(
            f.manager.state(&session.id, &fp("redis")),
            None | Some(ServiceState::Stopped)
        ));

        let lease = f.manager.acquire(&session, spec("redis", f.rootfs)).await.unwrap();
        assert_eq!(lease.state(), ServiceState::Running);
        assert_eq!(f.runtime.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_service_fails_within_budget() {
        let f = fixture().await;
        let session = Session::new("test", "main");
        f.runtime.mark_unhealthy("db");

        let started = tokio::time::Instant::now();
        let err = f.manager.acquire(&session, spec("db", f.rootfs)).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, KilnError::ServiceUnhealthy { attempts: 3, .. }));
        let budget = HealthPolicy::from_config(&config()).budget();
        assert!(elapsed <= budget, "{:?} > {:?}", elapsed, budget);
        assert_eq!(f.runtime.probes.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(f.runtime.stops(), 1);
        assert!(matches!(
            f.manager.state(&session.id, &fp("db")),
            None | Some(ServiceState::Failed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_start_passes_after_retries() {
        let f = fixture().await;
        let session = Session::new("test", "main");
        f.runtime.fail_first_probes("db", 2);

        let lease = f.manager.acquire(&session, spec("db", f.rootfs)).await.unwrap();
        assert_eq!(lease.state(), ServiceState::Running);
        assert_eq!(f.runtime.probes.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_instance() {
        let f = fixture().await;
        let session = Session::new("test", "main");
        f.runtime.fail_first_probes("redis", 1);

        let (a, b) = tokio::join!(
            f.manager.acquire(&session, spec("redis", f.rootfs)),
            f.manager.acquire(&session, spec("redis", f.rootfs)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.hostname(), b.hostname());
        assert_eq!(f.runtime.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_get_distinct_instances() {
        let f = fixture().await;
        let s1 = Session::new("one", "main");
        let s2 = Session::new("two", "main");

        let a = f.manager.acquire(&s1, spec("redis", f.rootfs)).await.unwrap();
        let b = f.manager.acquire(&s2, spec("redis", f.rootfs)).await.unwrap();
        let c = f.manager.acquire(&s1, spec("redis", f.rootfs)).await.unwrap();

        assert_ne!(a.hostname(), b.hostname());
        assert_eq!(a.hostname(), c.hostname());
        assert_eq!(f.runtime.launches(), 2);
        assert_eq!(f.runtime.networks().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mutually_bound_services_start_together() {
        let f = fixture().await;
        let session = Session::new("test", "main");
        f.runtime.fail_first_probes("a", 1);
        f.runtime.fail_first_probes("b", 2);

        let host_a = f.manager.hostname(&session, &fp("a"));
        let host_b = f.manager.hostname(&session, &fp("b"));
        let mut a = spec("a", f.rootfs);
        a.hosts.push(HostAlias {
            alias: "peer".into(),
            hostname: host_b.clone(),
            address: None,
        });
        let mut b = spec("b", f.rootfs);
        b.hosts.push(HostAlias {
            alias: "peer".into(),
            hostname: host_a.clone(),
            address: None,
        });

        let leases = f.manager.acquire_group(&session, vec![a, b]).await.unwrap();
        assert_eq!(leases.len(), 2);
        assert!(leases.iter().all(|l| l.state() == ServiceState::Running));

        let launched = f.runtime.launched_hostnames();
        assert!(launched.contains(&host_a));
        assert!(launched.contains(&host_b));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_start_ignores_grace_until_stop() {
        let f = fixture().await;
        let session = Session::new("test", "main");

        f.manager.start(&session, spec("redis", f.rootfs)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            f.manager.state(&session.id, &fp("redis")),
            Some(ServiceState::Running)
        );

        f.manager.stop(&session.id, &fp("redis")).await.unwrap();
        assert_eq!(f.runtime.stops(), 1);
        assert_eq!(f.manager.active_count(), 0);
        assert!(matches!(
            f.manager.stop(&session.id, &fp("redis")).await,
            Err(KilnError::ServiceNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_session_releases_through_grace() {
        let f = fixture().await;
        let session = Session::new("test", "main");

        f.manager.start(&session, spec("redis", f.rootfs)).await.unwrap();
        assert_eq!(f.manager.close_session(&session.id).await, 1);
        assert_eq!(f.runtime.stops(), 0);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(f.runtime.stops(), 1);
        assert!(f.runtime.networks().is_empty());
        assert!(matches!(
            f.manager.acquire(&session, spec("redis", f.rootfs)).await,
            Err(KilnError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let f = fixture().await;
        let session = Session::new("test", "main");

        let _lease = f.manager.acquire(&session, spec("redis", f.rootfs)).await.unwrap();
        f.manager.shutdown().await;

        assert_eq!(f.runtime.stops(), 1);
        assert_eq!(f.runtime.running_count(), 0);
        assert!(f.runtime.networks().is_empty());
        assert_eq!(f.manager.active_count(), 0);
    }

    #[tokio::test]
    async fn exposed_port_reaches_the_service() {
        let f = fixture().await;
        let session = Session::new("test", "main");

        let lease = f.manager.acquire(&session, spec("redis", f.rootfs)).await.unwrap();
        let binding = f
            .manager
            .expose(&session.id, &fp("redis"), 6379, PortMapping::Random)
            .await
            .unwrap();
        assert_eq!(binding.service_port, 6379);

        let stream = tokio::net::TcpStream::connect(binding.host).await.unwrap();
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await.unwrap();
        assert_eq!(line, format!("hello from {}\n", lease.hostname()));

        assert!(f
            .manager
            .expose(&session.id, &fp("redis"), 9999, PortMapping::Random)
            .await
            .is_err());
    }
}
