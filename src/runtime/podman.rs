//! Rootless Podman runtime
//!
//! Operations run with `podman run --rootfs` over a tree the engine has
//! materialised in the scratch directory, so no image store round trip is
//! needed between operations. Images are only used to obtain base
//! filesystems.

use crate::config::schema::RuntimeConfig;
use crate::error::{truncate_output, KilnError, KilnResult};
use crate::runtime::{
    stream_child_output, AttachedShell, ContainerRuntime, ExecOutcome, ExecRequest,
    NetworkAttachment, SandboxHandle, SecretDelivery, ServiceLaunch, ShellRequest,
};
use crate::service::HealthCheck;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Container runtime using native rootless Podman
pub struct PodmanRuntime {
    config: RuntimeConfig,
    scratch: PathBuf,
    /// Secret directories of running services, removed on stop
    service_secrets: DashMap<String, PathBuf>,
}

/// Secret material prepared for one sandbox
struct PreparedSecrets {
    dir: Option<PathBuf>,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl PreparedSecrets {
    async fn cleanup(self) {
        if let Some(dir) = self.dir {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to remove secret dir {}: {}", dir.display(), e);
            }
        }
    }
}

impl PodmanRuntime {
    pub fn new(config: RuntimeConfig, scratch: PathBuf) -> Self {
        Self {
            config,
            scratch,
            service_secrets: DashMap::new(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.podman);
        // Podman forwards only explicitly named variables; clearing keeps
        // host secrets out of `-e NAME` lookups by accident
        cmd.env_clear();
        for key in ["PATH", "HOME", "XDG_RUNTIME_DIR", "XDG_CONFIG_HOME", "XDG_DATA_HOME"] {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        cmd
    }

    /// Check if Podman is installed
    async fn podman_installed(&self) -> bool {
        self.command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if rootless Podman is properly configured
    async fn rootless_configured(&self) -> KilnResult<bool> {
        let output = self
            .run(&["info", "--format", "{{.Host.Security.Rootless}}"])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim() == "true")
    }

    /// Execute a Podman command and return the output
    async fn run(&self, args: &[&str]) -> KilnResult<std::process::Output> {
        debug!("Executing: podman {:?}", args);

        self.command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error(format!("podman {:?}", args), e))
    }

    /// Execute a Podman command that must succeed, returning trimmed stdout
    async fn run_ok(&self, args: &[&str]) -> KilnResult<String> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(KilnError::command_exec(
                format!("podman {}", args.first().copied().unwrap_or_default()),
                stderr.trim(),
            ))
        }
    }

    fn spawn_error(&self, command: String, e: std::io::Error) -> KilnError {
        if e.kind() == std::io::ErrorKind::NotFound {
            KilnError::PodmanNotFound
        } else {
            KilnError::command_failed(command, e)
        }
    }

    /// Check if image exists locally
    async fn image_exists(&self, image: &str) -> KilnResult<bool> {
        let output = self.run(&["image", "exists", image]).await?;
        Ok(output.status.success())
    }

    /// Pull an image, streaming progress to the debug log
    async fn pull(&self, image: &str) -> KilnResult<()> {
        info!("Pulling image: {}", image);

        let mut child = self
            .command()
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(format!("podman pull {}", image), e))?;

        let lines = stream_child_output(&mut child, &|line| debug!("pull: {}", line)).await;
        let status = child
            .wait()
            .await
            .map_err(|e| KilnError::command_failed("podman pull", e))?;

        if status.success() {
            Ok(())
        } else {
            Err(KilnError::ImagePull {
                image: image.to_string(),
                reason: truncate_output(&lines.join("\n"), ""),
            })
        }
    }

    fn container_name(&self, kind: &str, label: &str) -> String {
        let label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .take(32)
            .collect();
        let id = Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}-{}", self.config.name_prefix, kind, label, &id[..8])
    }

    /// Hardening flags shared by every sandbox
    fn sandbox_flags(&self) -> Vec<String> {
        let mut args = Vec::new();
        for cap in &self.config.cap_drop {
            args.push("--cap-drop".to_string());
            args.push(cap.clone());
        }
        for opt in &self.config.security_opt {
            args.push("--security-opt".to_string());
            args.push(opt.clone());
        }
        if self.config.pids_limit > 0 {
            args.push("--pids-limit".to_string());
            args.push(self.config.pids_limit.to_string());
        }
        args
    }

    /// Write secret files and build the matching flags
    async fn prepare_secrets(&self, secrets: &[SecretDelivery]) -> KilnResult<PreparedSecrets> {
        let mut prepared = PreparedSecrets {
            dir: None,
            args: Vec::new(),
            env: Vec::new(),
        };

        for (i, secret) in secrets.iter().enumerate() {
            match secret {
                SecretDelivery::Env { name, value } => {
                    // Value travels through the podman process env only
                    prepared.args.push("-e".to_string());
                    prepared.args.push(name.clone());
                    prepared.env.push((name.clone(), value.expose().to_string()));
                }
                SecretDelivery::File { target, value } => {
                    let dir = match &prepared.dir {
                        Some(dir) => dir.clone(),
                        None => {
                            let dir = self.scratch.join(format!("secrets-{}", Uuid::new_v4()));
                            create_private_dir(&dir).await?;
                            prepared.dir = Some(dir.clone());
                            dir
                        }
                    };
                    let file = dir.join(format!("{}", i));
                    write_private_file(&file, value.expose().as_bytes()).await?;
                    prepared.args.push("-v".to_string());
                    prepared
                        .args
                        .push(format!("{}:{}:ro", file.display(), target));
                }
            }
        }
        Ok(prepared)
    }
}

/// Arguments for `podman run`, excluding secrets
fn run_args(
    sandbox_flags: Vec<String>,
    env: &BTreeMap<String, String>,
    workdir: Option<&str>,
    user: Option<&str>,
    mounts: &[super::MountPoint],
    network: Option<&NetworkAttachment>,
) -> Vec<String> {
    let mut args = sandbox_flags;

    match network {
        Some(net) => {
            args.push("--network".to_string());
            args.push(net.network.clone());
            for host in &net.hosts {
                if let Some(address) = host.address {
                    args.push("--add-host".to_string());
                    args.push(format!("{}:{}", host.alias, address));
                }
            }
        }
        None => {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
    }

    if let Some(workdir) = workdir {
        args.push("-w".to_string());
        args.push(workdir.to_string());
    }
    if let Some(user) = user {
        args.push("-u".to_string());
        args.push(user.to_string());
    }

    for (k, v) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", k, v));
    }

    for mount in mounts {
        args.push("-v".to_string());
        let mut spec = format!("{}:{}", mount.source.display(), mount.target);
        if mount.readonly {
            spec.push_str(":ro");
        }
        args.push(spec);
    }

    args
}

/// Env var through which a service learns a bound peer's hostname
fn host_env_name(alias: &str) -> String {
    format!(
        "KILN_HOST_{}",
        alias.to_ascii_uppercase().replace('-', "_")
    )
}

async fn create_private_dir(dir: &Path) -> KilnResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| KilnError::io(format!("creating {}", dir.display()), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| KilnError::io("setting secret dir permissions", e))?;
    }
    Ok(())
}

async fn write_private_file(path: &Path, contents: &[u8]) -> KilnResult<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(path)
        .await
        .map_err(|e| KilnError::io(format!("creating {}", path.display()), e))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, contents)
        .await
        .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn is_available(&self) -> KilnResult<bool> {
        if !self.podman_installed().await {
            return Ok(false);
        }
        self.rootless_configured().await
    }

    async fn ensure_ready(&self) -> KilnResult<()> {
        if !self.podman_installed().await {
            return Err(KilnError::PodmanNotFound);
        }

        if !self.rootless_configured().await? {
            return Err(KilnError::PodmanRootlessSetup {
                reason: "Rootless Podman not configured".to_string(),
            });
        }

        Ok(())
    }

    async fn pull_image(&self, reference: &str, dest: &Path) -> KilnResult<()> {
        if !self.image_exists(reference).await? {
            self.pull(reference).await?;
        }

        let name = self.container_name("unpack", reference);
        let id = self
            .run_ok(&["create", "--name", &name, reference, "true"])
            .await
            .map_err(|e| KilnError::ImagePull {
                image: reference.to_string(),
                reason: e.to_string(),
            })?;

        let tar = self.scratch.join(format!("{}.tar", name));
        let tar_str = tar.to_string_lossy().to_string();
        let exported = self.run_ok(&["export", "-o", &tar_str, &id]).await;
        if let Err(e) = self.run_ok(&["rm", "-f", &id]).await {
            warn!("Failed to remove unpack container {}: {}", name, e);
        }
        exported?;

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", dest.display()), e))?;
        let output = Command::new("tar")
            .arg("-xf")
            .arg(&tar)
            .arg("-C")
            .arg(dest)
            .args(["--no-same-owner", "--exclude=dev/*"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| KilnError::command_failed("tar -xf", e));
        let _ = tokio::fs::remove_file(&tar).await;

        let output = output?;
        if !output.status.success() {
            return Err(KilnError::ImagePull {
                image: reference.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    async fn exec(&self, request: ExecRequest) -> KilnResult<ExecOutcome> {
        let secrets = self.prepare_secrets(&request.secrets).await?;

        let name = self.container_name("exec", &request.label);
        let mut args = vec!["run".to_string(), "--rm".to_string(), "--name".to_string(), name];
        args.extend(run_args(
            self.sandbox_flags(),
            &request.env,
            request.workdir.as_deref(),
            request.user.as_deref(),
            &request.mounts,
            request.network.as_ref(),
        ));
        args.extend(secrets.args.iter().cloned());
        args.push("--rootfs".to_string());
        args.push(request.rootfs.to_string_lossy().to_string());
        args.extend(request.args.iter().cloned());

        debug!("Running sandbox for {}", request.label);
        let mut cmd = self.command();
        cmd.args(&args)
            .envs(secrets.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = cmd.output().await;
        secrets.cleanup().await;

        let output = output.map_err(|e| self.spawn_error("podman run".to_string(), e))?;
        // 125-127 are podman's own failures, not the command's
        match output.status.code() {
            Some(code @ 125..=127) if output.stdout.is_empty() => Err(KilnError::Sandbox(format!(
                "podman exited with {}: {}",
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            code => Ok(ExecOutcome {
                exit_code: code.unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
        }
    }

    async fn create_network(&self, name: &str) -> KilnResult<()> {
        if self.run(&["network", "exists", name]).await?.status.success() {
            return Ok(());
        }
        self.run_ok(&["network", "create", name]).await?;
        debug!("Created network {}", name);
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> KilnResult<()> {
        let output = self.run(&["network", "rm", "-f", name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("not found") && !stderr.contains("no such network") {
                return Err(KilnError::command_exec("podman network rm", stderr.trim()));
            }
        }
        Ok(())
    }

    async fn launch_service(&self, launch: ServiceLaunch) -> KilnResult<SandboxHandle> {
        let secrets = self.prepare_secrets(&launch.secrets).await?;

        let mut env = launch.env.clone();
        for host in &launch.network.hosts {
            env.insert(host_env_name(&host.alias), host.hostname.clone());
        }

        let name = self.container_name("svc", &launch.hostname);
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name,
            "--hostname".to_string(),
            launch.hostname.clone(),
            "--network-alias".to_string(),
            launch.hostname.clone(),
        ];
        args.extend(run_args(
            self.sandbox_flags(),
            &env,
            launch.workdir.as_deref(),
            None,
            &launch.mounts,
            Some(&launch.network),
        ));
        for port in &launch.ports {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1::{}", port));
        }
        args.extend(secrets.args.iter().cloned());
        args.push("--rootfs".to_string());
        args.push(launch.rootfs.to_string_lossy().to_string());
        args.extend(launch.args.iter().cloned());

        let output = self
            .command()
            .args(&args)
            .envs(secrets.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error("podman run -d".to_string(), e))?;

        if !output.status.success() {
            secrets.cleanup().await;
            return Err(KilnError::ServiceStart {
                hostname: launch.hostname,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if let Some(dir) = secrets.dir {
            self.service_secrets.insert(id.clone(), dir);
        }

        let format = format!(
            "{{{{(index .NetworkSettings.Networks \"{}\").IPAddress}}}}",
            launch.network.network
        );
        let address = self
            .run_ok(&["inspect", "-f", &format, &id])
            .await
            .ok()
            .and_then(|ip| ip.parse::<IpAddr>().ok());

        info!(
            "Service container started: {} ({})",
            launch.hostname,
            &id[..12.min(id.len())]
        );
        Ok(SandboxHandle {
            id,
            hostname: launch.hostname,
            address,
        })
    }

    async fn probe(
        &self,
        handle: &SandboxHandle,
        check: &HealthCheck,
        timeout: Duration,
    ) -> KilnResult<bool> {
        match check {
            HealthCheck::None => Ok(true),
            HealthCheck::Tcp { port } => {
                let addr = match self.sandbox_address(handle, *port).await {
                    Ok(addr) => addr,
                    Err(_) => return Ok(false),
                };
                let connect = tokio::net::TcpStream::connect(addr);
                Ok(matches!(tokio::time::timeout(timeout, connect).await, Ok(Ok(_))))
            }
            HealthCheck::Exec { command } => {
                let mut args = vec!["exec", handle.id.as_str()];
                args.extend(command.iter().map(String::as_str));
                match tokio::time::timeout(timeout, self.run(&args)).await {
                    Ok(Ok(output)) => Ok(output.status.success()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Ok(false),
                }
            }
        }
    }

    async fn stop_service(&self, handle: &SandboxHandle) -> KilnResult<()> {
        debug!("Stopping service container: {}", handle.id);
        let output = self.run(&["rm", "-f", "-t", "2", &handle.id]).await?;

        if let Some((_, dir)) = self.service_secrets.remove(&handle.id) {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }

        if output.status.success() {
            Ok(())
        } else {
            // Ignore error if container doesn't exist
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no such container") {
                Ok(())
            } else {
                Err(KilnError::command_exec("podman rm", stderr))
            }
        }
    }

    async fn sandbox_address(&self, handle: &SandboxHandle, port: u16) -> KilnResult<SocketAddr> {
        let spec = format!("{}/tcp", port);
        let out = self.run_ok(&["port", &handle.id, &spec]).await?;
        out.lines()
            .find_map(|line| line.trim().parse::<SocketAddr>().ok())
            .ok_or_else(|| KilnError::PortExposure {
                hostname: handle.hostname.clone(),
                port,
                reason: format!("port not published ({})", out),
            })
    }

    async fn attach_shell(&self, request: ShellRequest) -> KilnResult<AttachedShell> {
        let secrets = self.prepare_secrets(&request.secrets).await?;

        let name = self.container_name("debug", &request.label);
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name,
        ];
        if request.inherit_stdio {
            args.push("-t".to_string());
        }
        args.extend(run_args(
            self.sandbox_flags(),
            &request.env,
            request.workdir.as_deref(),
            None,
            &[],
            None,
        ));
        args.extend(secrets.args.iter().cloned());
        args.push("--rootfs".to_string());
        args.push(request.rootfs.to_string_lossy().to_string());
        args.push(request.shell.clone());

        let mut cmd = self.command();
        cmd.args(&args)
            .envs(secrets.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if request.inherit_stdio {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| self.spawn_error("podman run -i".to_string(), e))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let done = tokio::spawn(async move {
            let status = child.wait().await;
            secrets.cleanup().await;
            let status = status.map_err(|e| KilnError::command_failed("podman run -i", e))?;
            Ok(status.code().unwrap_or(-1))
        });

        let mut shell = AttachedShell::new(done);
        shell.stdin = stdin.map(|s| Box::new(s) as _);
        shell.stdout = stdout.map(|s| Box::new(s) as _);
        shell.stderr = stderr.map(|s| Box::new(s) as _);
        Ok(shell)
    }

    fn runtime_name(&self) -> &'static str {
        "Podman"
    }
}
