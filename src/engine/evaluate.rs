//! Scheduling of one evaluation
//!
//! Every node becomes a shared future, created on first request and
//! memoised for the rest of the evaluation, so a node reached through
//! several paths runs once. Node futures refer back to the evaluation
//! weakly: dropping the evaluation drops every pending node, which in turn
//! gives up its place in any single-flight execution.

use super::report::{NodeFailure, NodeOutput, NodeResult, ServiceEndpoint};
use super::EngineInner;
use crate::cache::{CacheEntry, Fingerprint, FingerprintBuilder};
use crate::debug::{DebugHandle, DebugReason, Suspension};
use crate::error::{truncate_output, KilnError, KilnResult};
use crate::graph::{
    BreakpointOp, ExecOp, ExportOp, FileOp, Graph, GraphPlan, HostDirectoryOp, ImageOp, Mount,
    OpKind, OperationId, SecretMount, SecretTarget, ServiceOp, WithDirectoryOp,
};
use crate::runtime::{ExecRequest, HostAlias, MountPoint, NetworkAttachment, SecretDelivery};
use crate::secrets::ResolvedSecret;
use crate::service::{ServiceMount, ServiceSpec};
use crate::session::Session;
use crate::store::{Artifact, EntryKind, ImportFilter};
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

type NodeError = Arc<KilnError>;
type SharedNode = Shared<BoxFuture<'static, NodeResult>>;
type GroupResult = Result<Arc<HashMap<OperationId, ServiceEndpoint>>, NodeFailure>;
type SharedGroup = Shared<BoxFuture<'static, GroupResult>>;

#[derive(Clone)]
struct Context {
    engine: Arc<EngineInner>,
    session: Session,
    debug: Option<DebugHandle>,
    graph: Arc<Graph>,
}

pub(super) struct Evaluation {
    ctx: Context,
    plan: Arc<GraphPlan>,
    nodes: Mutex<HashMap<OperationId, SharedNode>>,
    groups: Mutex<HashMap<usize, SharedGroup>>,
}

impl Evaluation {
    pub(super) fn new(
        engine: Arc<EngineInner>,
        session: Session,
        debug: Option<DebugHandle>,
        graph: Arc<Graph>,
        plan: Arc<GraphPlan>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: Context {
                engine,
                session,
                debug,
                graph,
            },
            plan,
            nodes: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        })
    }

    /// The memoised result future of one node
    pub(super) fn node(self: &Arc<Self>, id: &OperationId) -> SharedNode {
        lock(&self.nodes)
            .entry(id.clone())
            .or_insert_with(|| evaluate_node(Arc::downgrade(self), id.clone()).boxed().shared())
            .clone()
    }

    /// The memoised start of one service group
    fn group(self: &Arc<Self>, index: usize) -> SharedGroup {
        lock(&self.groups)
            .entry(index)
            .or_insert_with(|| evaluate_group(Arc::downgrade(self), index).boxed().shared())
            .clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

enum Pending {
    Inputs(Vec<SharedNode>),
    Group(SharedGroup),
}

async fn evaluate_node(evaluation: Weak<Evaluation>, id: OperationId) -> NodeResult {
    // The evaluation is only borrowed while dependencies are looked up;
    // holding it across an await would keep it alive from its own map
    let (ctx, kind, pending) = {
        let Some(this) = evaluation.upgrade() else {
            return Err(NodeFailure::new(id, KilnError::Cancelled));
        };
        let Some(op) = this.ctx.graph.get(&id) else {
            return Err(NodeFailure::new(
                id.clone(),
                KilnError::UnknownOperation(id.to_string()),
            ));
        };
        let pending = match &op.kind {
            OpKind::Service(_) => match this.plan.group_of(&id) {
                Some(index) => Pending::Group(this.group(index)),
                None => {
                    return Err(NodeFailure::new(
                        id.clone(),
                        KilnError::Internal(format!("service '{}' has no group", id)),
                    ))
                }
            },
            kind => Pending::Inputs(kind.inputs().into_iter().map(|i| this.node(i)).collect()),
        };
        (this.ctx.clone(), op.kind.clone(), pending)
    };

    match pending {
        Pending::Group(group) => {
            let endpoints = group.await?;
            endpoints
                .get(&id)
                .cloned()
                .map(NodeOutput::Service)
                .ok_or_else(|| {
                    NodeFailure::new(
                        id.clone(),
                        KilnError::Internal(format!("service group did not start '{}'", id)),
                    )
                })
        }
        Pending::Inputs(deps) => {
            let inputs = join_all(deps)
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            let span = info_span!("node", op = %id, kind = kind.name());
            async {
                match run_node(&ctx, &id, kind.clone(), &inputs).await {
                    Ok(artifact) => Ok(NodeOutput::Artifact(artifact)),
                    Err(error) => {
                        if let Some(scene) = Scene::of_input(&kind, &inputs, &error) {
                            suspend_on_failure(&ctx, &id, &error, scene).await;
                        }
                        Err(NodeFailure::shared(id.clone(), error))
                    }
                }
            }
            .instrument(span)
            .await
        }
    }
}

async fn run_node(
    ctx: &Context,
    id: &OperationId,
    kind: OpKind,
    inputs: &[NodeOutput],
) -> Result<Artifact, NodeError> {
    match kind {
        OpKind::Image(op) => image(ctx, op).await,
        OpKind::Literal(op) => {
            let address = ctx.engine.store.put_bytes(op.contents.as_bytes()).await?;
            Ok(Artifact::file(address, op.mode))
        }
        OpKind::HostDirectory(op) => host_directory(ctx, op).await,
        OpKind::WithDirectory(op) => with_directory(ctx, op, inputs).await,
        OpKind::File(op) => file(ctx, op, inputs).await,
        OpKind::Exec(op) => exec(ctx, id, op, inputs).await,
        OpKind::Export(op) => export(ctx, op, inputs).await,
        OpKind::Breakpoint(op) => breakpoint(ctx, id, op, inputs).await,
        OpKind::Service(_) => Err(Arc::new(KilnError::Internal(format!(
            "service '{}' must start with its group",
            id
        )))),
    }
}

fn artifact_at(inputs: &[NodeOutput], index: usize) -> KilnResult<Artifact> {
    inputs
        .get(index)
        .and_then(NodeOutput::artifact)
        .copied()
        .ok_or_else(|| KilnError::Internal(format!("input {} is not a filesystem", index)))
}

fn directory_at(inputs: &[NodeOutput], index: usize, what: &str) -> KilnResult<Artifact> {
    let artifact = artifact_at(inputs, index)?;
    if artifact.kind != EntryKind::Dir {
        return Err(KilnError::InvalidGraph(format!(
            "{} must be a directory, not a {}",
            what, artifact.kind
        )));
    }
    Ok(artifact)
}

/// Serve `fp` from the cache, or run `work` once for every concurrent
/// requester and cache its result
async fn cached<F, Fut>(engine: &Arc<EngineInner>, fp: Fingerprint, work: F) -> Result<CacheEntry, NodeError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = KilnResult<CacheEntry>> + Send + 'static,
{
    if let Some(entry) = engine.cached(&fp).await {
        return Ok(entry);
    }
    let inner = engine.clone();
    engine
        .flights
        .run(fp, move |token| {
            let work = work(token);
            async move {
                // A flight that finished since the lookup above already cached it
                if let Some(entry) = inner.cached(&fp).await {
                    return Ok(entry);
                }
                let entry = work.await?;
                inner.remember(&entry).await;
                Ok(entry)
            }
        })
        .await
}

async fn image(ctx: &Context, op: ImageOp) -> Result<Artifact, NodeError> {
    let fp = FingerprintBuilder::new("image")
        .str("reference", &op.reference)
        .finish();
    let engine = ctx.engine.clone();
    let entry = cached(&ctx.engine, fp, move |_| async move {
        info!("Pulling {}", op.reference);
        let scratch = ScratchDir::create(&engine.scratch, "image").await?;
        engine.runtime.pull_image(&op.reference, scratch.path()).await?;
        let tree = engine
            .store
            .import_dir(scratch.path(), &ImportFilter::default())
            .await?;
        Ok(CacheEntry::new(fp, "image", Artifact::dir(tree)))
    })
    .await?;
    Ok(entry.result)
}

async fn host_directory(ctx: &Context, op: HostDirectoryOp) -> Result<Artifact, NodeError> {
    if !op.path.is_dir() {
        return Err(KilnError::PathNotFound(op.path).into());
    }
    let tree = ctx
        .engine
        .store
        .import_dir(&op.path, &ImportFilter::excluding(&op.excludes))
        .await?;
    debug!("Imported {} as {}", op.path.display(), tree.short());
    Ok(Artifact::dir(tree))
}

async fn with_directory(
    ctx: &Context,
    op: WithDirectoryOp,
    inputs: &[NodeOutput],
) -> Result<Artifact, NodeError> {
    let base = directory_at(inputs, 0, "with_directory base")?;
    let source = artifact_at(inputs, 1)?;
    let fp = FingerprintBuilder::new("with_directory")
        .json("base", &base)?
        .str("path", &op.path)
        .json("source", &source)?
        .finish();
    let store = ctx.engine.store.clone();
    let entry = cached(&ctx.engine, fp, move |_| async move {
        let tree = store.with_artifact(&base.address, &op.path, &source).await?;
        Ok(CacheEntry::new(fp, "with_directory", Artifact::dir(tree)))
    })
    .await?;
    Ok(entry.result)
}

async fn file(ctx: &Context, op: FileOp, inputs: &[NodeOutput]) -> Result<Artifact, NodeError> {
    let source = directory_at(inputs, 0, "file source")?;
    let fp = FingerprintBuilder::new("file")
        .address("source", &source.address)
        .str("path", &op.path)
        .finish();
    let store = ctx.engine.store.clone();
    let entry = cached(&ctx.engine, fp, move |_| async move {
        let found = store.lookup(&source.address, &op.path).await?;
        Ok(CacheEntry::new(fp, "file", found))
    })
    .await?;
    Ok(entry.result)
}

async fn export(ctx: &Context, op: ExportOp, inputs: &[NodeOutput]) -> Result<Artifact, NodeError> {
    let source = artifact_at(inputs, 0)?;
    ctx.engine.store.export(&source, &op.path).await?;
    info!("Exported {} to {}", source.address.short(), op.path.display());
    Ok(source)
}

async fn resolve_secrets(
    engine: &EngineInner,
    mounts: &[SecretMount],
) -> KilnResult<Vec<(SecretTarget, ResolvedSecret)>> {
    let resolved = join_all(mounts.iter().map(|m| engine.broker.resolve(&m.reference))).await;
    mounts
        .iter()
        .zip(resolved)
        .map(|(mount, result)| result.map(|secret| (mount.target.clone(), secret)))
        .collect()
}

fn deliveries(secrets: &[(SecretTarget, ResolvedSecret)]) -> Vec<SecretDelivery> {
    secrets
        .iter()
        .map(|(target, resolved)| match target {
            SecretTarget::Env(name) => SecretDelivery::Env {
                name: name.clone(),
                value: resolved.secret.clone(),
            },
            SecretTarget::File(path) => SecretDelivery::File {
                target: path.clone(),
                value: resolved.secret.clone(),
            },
        })
        .collect()
}

fn relative(target: &str) -> PathBuf {
    PathBuf::from(target.trim_start_matches('/'))
}

fn log_output(id: &OperationId, stream: &str, bytes: &[u8]) {
    for line in String::from_utf8_lossy(bytes).lines() {
        debug!("[{} {}] {}", id, stream, line);
    }
}

async fn exec(
    ctx: &Context,
    id: &OperationId,
    op: ExecOp,
    inputs: &[NodeOutput],
) -> Result<Artifact, NodeError> {
    let rootfs = directory_at(inputs, 0, "exec rootfs")?;
    let mut mounts = Vec::with_capacity(op.mounts.len());
    for (i, mount) in op.mounts.iter().enumerate() {
        mounts.push((mount.clone(), artifact_at(inputs, 1 + i)?));
    }
    let offset = 1 + op.mounts.len();
    let mut services = Vec::with_capacity(op.services.len());
    for (i, binding) in op.services.iter().enumerate() {
        let endpoint = inputs
            .get(offset + i)
            .and_then(NodeOutput::service)
            .cloned()
            .ok_or_else(|| {
                KilnError::Internal(format!("'{}' is bound but not running", binding.service))
            })?;
        services.push((binding.alias.clone(), endpoint));
    }
    let secrets = resolve_secrets(&ctx.engine, &op.secrets).await?;

    let mut builder = FingerprintBuilder::new("exec")
        .address("rootfs", &rootfs.address)
        .json("args", &op.args)?
        .json("env", &op.env)?
        .json("workdir", &op.workdir)?
        .json("user", &op.user)?
        .json("expect_exit", &op.expect_exit)?;
    for (mount, artifact) in &mounts {
        builder = builder
            .str("mount.target", &mount.target)
            .json("mount.readonly", &mount.readonly)?
            .json("mount.source", artifact)?;
    }
    for (target, resolved) in &secrets {
        builder = builder
            .json("secret.target", target)?
            .str("secret.digest", &resolved.digest);
    }
    for (alias, endpoint) in &services {
        builder = builder
            .str("service.alias", alias)
            .fingerprint("service", &endpoint.lease.fingerprint());
    }
    let fingerprint = builder.finish();
    debug!("{} has fingerprint {}", id, fingerprint.short());

    let work = ExecWork {
        ctx: ctx.clone(),
        id: id.clone(),
        op,
        fingerprint,
        rootfs,
        mounts,
        secrets,
        services,
    };
    let entry = cached(&ctx.engine, fingerprint, move |_| work.run()).await?;
    Ok(entry.result)
}

/// Everything one sandbox run needs, owned so it can outlive its requester
struct ExecWork {
    ctx: Context,
    id: OperationId,
    op: ExecOp,
    fingerprint: Fingerprint,
    rootfs: Artifact,
    mounts: Vec<(Mount, Artifact)>,
    secrets: Vec<(SecretTarget, ResolvedSecret)>,
    /// Held for the whole run so bound services stay up
    services: Vec<(String, ServiceEndpoint)>,
}

impl ExecWork {
    async fn run(self) -> KilnResult<CacheEntry> {
        let engine = self.ctx.engine.clone();
        let slot = engine
            .slots
            .acquire()
            .await
            .map_err(|_| KilnError::Cancelled)?;

        let scratch = ScratchDir::create(&engine.scratch, "exec").await?;
        let rootfs = scratch.path().join("rootfs");
        engine.store.materialize(&self.rootfs.address, &rootfs).await?;

        let mut mounts = Vec::with_capacity(self.mounts.len());
        for (i, (mount, artifact)) in self.mounts.iter().enumerate() {
            let source = scratch.path().join("mounts").join(i.to_string());
            engine.store.export(artifact, &source).await?;
            mounts.push(MountPoint {
                source,
                target: mount.target.clone(),
                readonly: mount.readonly,
            });
        }

        let secrets = deliveries(&self.secrets);
        let network = if self.services.is_empty() {
            None
        } else {
            Some(NetworkAttachment {
                network: engine.services.network_for(&self.ctx.session.id).await?,
                hosts: self
                    .services
                    .iter()
                    .map(|(alias, endpoint)| HostAlias {
                        alias: alias.clone(),
                        hostname: endpoint.hostname.clone(),
                        address: endpoint.lease.address(),
                    })
                    .collect(),
            })
        };

        let redactor = engine.broker.redactor();
        info!("Running {}: {}", self.id, redactor.scrub_str(&self.op.args.join(" ")));
        let outcome = engine
            .runtime
            .exec(ExecRequest {
                label: self.id.to_string(),
                rootfs: rootfs.clone(),
                args: self.op.args.clone(),
                env: self.op.env.clone(),
                workdir: self.op.workdir.clone(),
                user: self.op.user.clone(),
                mounts,
                secrets: secrets.clone(),
                network,
            })
            .await?;
        drop(slot);

        let stdout = redactor.scrub(&outcome.stdout);
        let stderr = redactor.scrub(&outcome.stderr);
        log_output(&self.id, "stdout", &stdout);
        log_output(&self.id, "stderr", &stderr);

        if !self.op.expect_exit.contains(&outcome.exit_code) {
            let error = KilnError::Execution {
                kind: "exec",
                exit_code: outcome.exit_code,
                output: truncate_output(
                    &String::from_utf8_lossy(&stdout),
                    &String::from_utf8_lossy(&stderr),
                ),
            };
            let scene = Scene {
                fs: SceneFs::Live(rootfs),
                env: self.op.env.clone(),
                workdir: self.op.workdir.clone(),
                secrets,
            };
            suspend_on_failure(&self.ctx, &self.id, &error, scene).await;
            return Err(error);
        }

        // Mounts and secret files are inputs, never part of the result
        let mut skip: Vec<PathBuf> = self.mounts.iter().map(|(m, _)| relative(&m.target)).collect();
        skip.extend(
            secrets
                .iter()
                .filter_map(SecretDelivery::file_target)
                .map(relative),
        );
        let tree = engine
            .store
            .import_dir(
                &rootfs,
                &ImportFilter {
                    excludes: Vec::new(),
                    skip,
                },
            )
            .await?;
        let stdout = engine.store.put_bytes(&stdout).await?;
        let stderr = engine.store.put_bytes(&stderr).await?;
        debug!("{} produced {}", self.id, tree.short());

        Ok(CacheEntry::new(self.fingerprint, "exec", Artifact::dir(tree)).with_output(
            stdout,
            stderr,
            outcome.exit_code,
        ))
    }
}

/// The filesystem a failed node is debugged in
enum SceneFs {
    /// Still on disk, such as a sandbox that just exited
    Live(PathBuf),
    /// Exported to a scratch copy for the session
    Stored(Artifact),
}

/// What the debugger gets to see of a failed node
struct Scene {
    fs: SceneFs,
    env: BTreeMap<String, String>,
    workdir: Option<String>,
    secrets: Vec<SecretDelivery>,
}

impl Scene {
    /// A failed node seen through the directory it was working on
    ///
    /// That is the first input for every operation that has one. Exit
    /// failures were already offered with the sandbox in place, and aborts
    /// and cancellations came from the user.
    fn of_input(kind: &OpKind, inputs: &[NodeOutput], error: &KilnError) -> Option<Self> {
        if !offered_on_failure(error) {
            return None;
        }
        let fs = inputs
            .first()
            .and_then(NodeOutput::artifact)
            .filter(|a| a.kind == EntryKind::Dir)?;
        let (env, workdir) = match kind {
            OpKind::Exec(op) => (op.env.clone(), op.workdir.clone()),
            _ => (BTreeMap::new(), None),
        };
        Some(Self {
            fs: SceneFs::Stored(*fs),
            env,
            workdir,
            secrets: Vec::new(),
        })
    }

    /// A failed service member seen through its rootfs
    fn of_member(
        ctx: &Context,
        id: &OperationId,
        inputs: &BTreeMap<OperationId, NodeOutput>,
        error: &KilnError,
    ) -> Option<Self> {
        if !offered_on_failure(error) {
            return None;
        }
        let Some(OpKind::Service(op)) = ctx.graph.get(id).map(|o| &o.kind) else {
            return None;
        };
        let fs = inputs.get(&op.rootfs).and_then(NodeOutput::artifact)?;
        Some(Self {
            fs: SceneFs::Stored(*fs),
            env: op.env.clone(),
            workdir: op.workdir.clone(),
            secrets: Vec::new(),
        })
    }
}

fn offered_on_failure(error: &KilnError) -> bool {
    !matches!(
        error,
        KilnError::Execution { .. } | KilnError::DebugAborted { .. } | KilnError::Cancelled
    )
}

/// Hand a failed node to the debugger, if one is attached and failures
/// are debugged
///
/// The node fails either way; the verdict only ends the session.
async fn suspend_on_failure(ctx: &Context, id: &OperationId, error: &KilnError, scene: Scene) {
    let Some(debug) = &ctx.debug else {
        return;
    };
    if !ctx.engine.config.debug.on_failure {
        return;
    }

    // A stored filesystem is copied out and removed once answered
    let (_scratch, rootfs) = match scene.fs {
        SceneFs::Live(path) => (None, path),
        SceneFs::Stored(artifact) => match stage_rootfs(ctx, &artifact).await {
            Ok((scratch, rootfs)) => (Some(scratch), rootfs),
            Err(e) => {
                warn!("Cannot debug {}: {}", id, e);
                return;
            }
        },
    };
    let suspension = Suspension {
        operation: id.to_string(),
        reason: DebugReason::Failure {
            error: error.to_string(),
        },
        rootfs,
        env: scene.env,
        workdir: scene.workdir,
        secrets: scene.secrets,
    };
    if let Err(e) = debug.suspend(suspension).await {
        warn!("Debug session for {} failed: {}", id, e);
    }
}

/// Export `artifact` as the rootfs of a debug session
async fn stage_rootfs(ctx: &Context, artifact: &Artifact) -> KilnResult<(ScratchDir, PathBuf)> {
    let scratch = ScratchDir::create(&ctx.engine.scratch, "debug").await?;
    let rootfs = scratch.path().join("rootfs");
    ctx.engine.store.export(artifact, &rootfs).await?;
    Ok((scratch, rootfs))
}

async fn breakpoint(
    ctx: &Context,
    id: &OperationId,
    op: BreakpointOp,
    inputs: &[NodeOutput],
) -> Result<Artifact, NodeError> {
    let source = artifact_at(inputs, 0)?;
    let Some(debug) = &ctx.debug else {
        debug!("No debugger attached; {} passes through", id);
        return Ok(source);
    };

    let fp = FingerprintBuilder::new("breakpoint")
        .json("source", &source)?
        .json("label", &op.label)?
        .finish();
    let (env, workdir) = match ctx.graph.get(&op.source).map(|o| &o.kind) {
        Some(OpKind::Exec(exec)) => (exec.env.clone(), exec.workdir.clone()),
        _ => (BTreeMap::new(), None),
    };

    // Concurrent evaluations reaching the same breakpoint share one stop
    let engine = ctx.engine.clone();
    let ctx = ctx.clone();
    let debug = debug.clone();
    let id = id.clone();
    let entry = cached(&engine, fp, move |_| async move {
        let (_scratch, rootfs) = stage_rootfs(&ctx, &source).await?;
        let verdict = debug
            .suspend(Suspension {
                operation: id.to_string(),
                reason: DebugReason::Breakpoint { label: op.label },
                rootfs,
                env,
                workdir,
                secrets: Vec::new(),
            })
            .await?;
        DebugHandle::check(verdict, id.as_str())?;
        Ok(CacheEntry::new(fp, "breakpoint", source))
    })
    .await?;
    Ok(entry.result)
}

/// A service member with its inputs resolved
struct Member {
    id: OperationId,
    op: ServiceOp,
    rootfs: Artifact,
    mounts: Vec<ServiceMount>,
    secrets: Vec<(SecretTarget, ResolvedSecret)>,
    /// Running services outside the group, by alias
    external: Vec<(String, ServiceEndpoint)>,
    fingerprint: Fingerprint,
}

async fn evaluate_group(evaluation: Weak<Evaluation>, index: usize) -> GroupResult {
    let (ctx, members, deps) = {
        let Some(this) = evaluation.upgrade() else {
            return Err(NodeFailure::new(
                OperationId::new(format!("service-group-{}", index)),
                KilnError::Cancelled,
            ));
        };
        let Some(group) = this.plan.service_groups.get(index) else {
            return Err(NodeFailure::new(
                OperationId::new(format!("service-group-{}", index)),
                KilnError::Internal("unknown service group".to_string()),
            ));
        };

        let mut members = Vec::with_capacity(group.members.len());
        for id in &group.members {
            match this.ctx.graph.get(id).map(|op| &op.kind) {
                Some(OpKind::Service(op)) => members.push((id.clone(), op.clone())),
                _ => {
                    return Err(NodeFailure::new(
                        id.clone(),
                        KilnError::Internal(format!("'{}' is not a service", id)),
                    ))
                }
            }
        }

        let mut deps: BTreeMap<OperationId, SharedNode> = BTreeMap::new();
        for (_, op) in &members {
            let needed = std::iter::once(&op.rootfs)
                .chain(op.mounts.iter().map(|m| &m.source))
                .chain(
                    op.services
                        .iter()
                        .map(|b| &b.service)
                        .filter(|s| !group.members.contains(s)),
                );
            for input in needed {
                if !deps.contains_key(input) {
                    deps.insert(input.clone(), this.node(input));
                }
            }
        }
        (this.ctx.clone(), members, deps)
    };

    let ids: Vec<OperationId> = deps.keys().cloned().collect();
    let results = join_all(deps.into_values()).await;
    let mut inputs = BTreeMap::new();
    for (id, result) in ids.into_iter().zip(results) {
        inputs.insert(id, result?);
    }

    let label = members
        .iter()
        .map(|(id, _)| id.as_str())
        .collect::<Vec<_>>()
        .join(",");
    async {
        let result = start_group(&ctx, members, &inputs).await;
        if let Err(failure) = &result {
            if let Some(scene) = Scene::of_member(&ctx, &failure.origin, &inputs, &failure.error) {
                suspend_on_failure(&ctx, &failure.origin, &failure.error, scene).await;
            }
        }
        result
    }
    .instrument(info_span!("service_group", members = %label))
    .await
}

async fn prepare_member(
    ctx: &Context,
    id: &OperationId,
    op: ServiceOp,
    inputs: &BTreeMap<OperationId, NodeOutput>,
    group: &[OperationId],
) -> Result<Member, NodeError> {
    let artifact = |source: &OperationId| {
        inputs
            .get(source)
            .and_then(NodeOutput::artifact)
            .copied()
            .ok_or_else(|| KilnError::Internal(format!("missing input '{}'", source)))
    };

    let rootfs = artifact(&op.rootfs)?;
    if rootfs.kind != EntryKind::Dir {
        return Err(KilnError::InvalidGraph(format!(
            "service rootfs must be a directory, not a {}",
            rootfs.kind
        ))
        .into());
    }
    let mut mounts = Vec::with_capacity(op.mounts.len());
    for mount in &op.mounts {
        mounts.push(ServiceMount {
            artifact: artifact(&mount.source)?,
            target: mount.target.clone(),
            readonly: mount.readonly,
        });
    }
    let mut external = Vec::new();
    for binding in op.services.iter().filter(|b| !group.contains(&b.service)) {
        let endpoint = inputs
            .get(&binding.service)
            .and_then(NodeOutput::service)
            .cloned()
            .ok_or_else(|| {
                KilnError::Internal(format!("'{}' is bound but not running", binding.service))
            })?;
        external.push((binding.alias.clone(), endpoint));
    }
    let secrets = resolve_secrets(&ctx.engine, &op.secrets).await?;

    let mut builder = FingerprintBuilder::new("service")
        .address("rootfs", &rootfs.address)
        .json("args", &op.args)?
        .json("env", &op.env)?
        .json("workdir", &op.workdir)?
        .json("ports", &op.ports)?
        .json("health", &op.health)?;
    for mount in &mounts {
        builder = builder
            .str("mount.target", &mount.target)
            .json("mount.readonly", &mount.readonly)?
            .json("mount.source", &mount.artifact)?;
    }
    for (target, resolved) in &secrets {
        builder = builder
            .json("secret.target", target)?
            .str("secret.digest", &resolved.digest);
    }
    for (alias, endpoint) in &external {
        builder = builder
            .str("service.alias", alias)
            .fingerprint("service", &endpoint.lease.fingerprint());
    }

    Ok(Member {
        id: id.clone(),
        op,
        rootfs,
        mounts,
        secrets,
        external,
        fingerprint: builder.finish(),
    })
}

/// Fix every member's identity, then launch the group together
async fn start_group(
    ctx: &Context,
    members: Vec<(OperationId, ServiceOp)>,
    inputs: &BTreeMap<OperationId, NodeOutput>,
) -> GroupResult {
    let group: Vec<OperationId> = members.iter().map(|(id, _)| id.clone()).collect();
    let mut resolved = Vec::with_capacity(members.len());
    for (id, op) in members {
        let member = prepare_member(ctx, &id, op, inputs, &group)
            .await
            .map_err(|e| NodeFailure::shared(id.clone(), e))?;
        resolved.push(member);
    }

    // Peers are referenced by their own identity; a digest over all members
    // then ties each identity to the whole group
    let base: HashMap<OperationId, Fingerprint> = resolved
        .iter()
        .map(|m| (m.id.clone(), m.fingerprint))
        .collect();
    let mut locals = Vec::with_capacity(resolved.len());
    for member in &resolved {
        let mut builder =
            FingerprintBuilder::new("service.local").fingerprint("base", &member.fingerprint);
        for binding in &member.op.services {
            if let Some(peer) = base.get(&binding.service) {
                builder = builder
                    .str("peer.alias", &binding.alias)
                    .fingerprint("peer", peer);
            }
        }
        locals.push(builder.finish());
    }
    let mut sorted = locals.clone();
    sorted.sort();
    let group_fp = sorted
        .iter()
        .fold(FingerprintBuilder::new("service.group"), |b, local| {
            b.fingerprint("member", local)
        })
        .finish();
    for (member, local) in resolved.iter_mut().zip(&locals) {
        member.fingerprint = FingerprintBuilder::new("service.instance")
            .fingerprint("local", local)
            .fingerprint("group", &group_fp)
            .finish();
    }

    let services = &ctx.engine.services;
    let identities: HashMap<OperationId, Fingerprint> = resolved
        .iter()
        .map(|m| (m.id.clone(), m.fingerprint))
        .collect();
    let mut specs = Vec::with_capacity(resolved.len());
    for member in &resolved {
        let mut spec = ServiceSpec::new(member.fingerprint, member.id.to_string(), member.rootfs);
        spec.args = member.op.args.clone();
        spec.env = member.op.env.clone();
        spec.workdir = member.op.workdir.clone();
        spec.mounts = member.mounts.clone();
        spec.secrets = deliveries(&member.secrets);
        spec.ports = member.op.ports.clone();
        spec.health = member.op.health.clone();
        spec.health_attempts = member.op.health_attempts;

        for binding in &member.op.services {
            let host = match identities.get(&binding.service) {
                Some(peer) => HostAlias {
                    alias: binding.alias.clone(),
                    hostname: services.hostname(&ctx.session, peer),
                    address: None,
                },
                None => {
                    let endpoint = member
                        .external
                        .iter()
                        .find(|(alias, _)| alias == &binding.alias)
                        .map(|(_, endpoint)| endpoint)
                        .ok_or_else(|| {
                            NodeFailure::new(
                                member.id.clone(),
                                KilnError::Internal(format!(
                                    "'{}' is bound but not running",
                                    binding.service
                                )),
                            )
                        })?;
                    HostAlias {
                        alias: binding.alias.clone(),
                        hostname: endpoint.hostname.clone(),
                        address: endpoint.lease.address(),
                    }
                }
            };
            spec.hosts.push(host);
        }
        specs.push(spec);
    }

    let leases = services
        .acquire_group(&ctx.session, specs)
        .await
        .map_err(|e| NodeFailure::new(failed_member(ctx, &e, &resolved), e))?;

    let mut endpoints = HashMap::with_capacity(resolved.len());
    for (member, lease) in resolved.into_iter().zip(leases) {
        let mut ports = Vec::with_capacity(member.op.expose.len());
        for exposed in &member.op.expose {
            let binding = services
                .expose(&ctx.session.id, &lease.fingerprint(), exposed.port, exposed.mapping)
                .await
                .map_err(|e| NodeFailure::new(member.id.clone(), e))?;
            ports.push(binding);
        }
        endpoints.insert(
            member.id,
            ServiceEndpoint {
                hostname: lease.hostname().to_string(),
                ports,
                lease: Arc::new(lease),
                bound: member.external.into_iter().map(|(_, e)| e).collect(),
            },
        );
    }
    Ok(Arc::new(endpoints))
}

/// The member a group start error is about
fn failed_member(ctx: &Context, error: &KilnError, members: &[Member]) -> OperationId {
    let hostname = match error {
        KilnError::ServiceUnhealthy { hostname, .. } | KilnError::ServiceStart { hostname, .. } => {
            Some(hostname)
        }
        _ => None,
    };
    hostname
        .and_then(|hostname| {
            members.iter().find(|m| {
                &ctx.engine.services.hostname(&ctx.session, &m.fingerprint) == hostname
            })
        })
        .or_else(|| members.first())
        .map(|m| m.id.clone())
        .unwrap_or_else(|| OperationId::new("service"))
}

/// A node's working directory, removed when dropped
struct ScratchDir(PathBuf);

impl ScratchDir {
    async fn create(root: &Path, kind: &str) -> KilnResult<Self> {
        let path = root.join(format!("{}-{}", kind, Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", path.display()), e))?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.0.display(), e);
            }
        }
    }
}
