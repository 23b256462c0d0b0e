//! In-process runtime for engine tests
//!
//! Commands are interpreted instead of executed:
//! - `write <path> <contents>` writes a file into the rootfs
//! - `cat <path>` prints a rootfs file, a mounted file or a secret file
//! - `echo-env <NAME>` prints a plain or secret env var
//! - any argument equal to `fail` exits 1
//! - anything else writes `/out/<label>` with the joined args
//!
//! Services get a real loopback listener per port that greets with
//! `hello from <hostname>` and then echoes.

use crate::error::{KilnError, KilnResult};
use crate::runtime::{
    AttachedShell, ContainerRuntime, ExecOutcome, ExecRequest, SandboxHandle, SecretDelivery,
    ServiceLaunch, ShellRequest,
};
use crate::service::HealthCheck;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Default)]
pub(crate) struct FakeRuntime {
    pub pulls: AtomicUsize,
    pub execs: AtomicUsize,
    pub launches: AtomicUsize,
    pub stops: AtomicUsize,
    pub probes: AtomicUsize,
    exec_delay: Mutex<Duration>,
    /// Service labels whose probes never pass
    unhealthy: Mutex<HashSet<String>>,
    /// Service labels whose first N probes fail
    slow_start: Mutex<HashMap<String, usize>>,
    launched: Mutex<Vec<String>>,
    running: Mutex<HashMap<String, RunningService>>,
    requests: Mutex<Vec<ExecRequest>>,
    networks: Mutex<HashSet<String>>,
}

struct RunningService {
    label: String,
    ports: HashMap<u16, SocketAddr>,
    listeners: Vec<JoinHandle<()>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exec_delay(self, delay: Duration) -> Self {
        *self.exec_delay.lock().unwrap() = delay;
        self
    }

    pub fn mark_unhealthy(&self, label: &str) {
        self.unhealthy.lock().unwrap().insert(label.to_string());
    }

    pub fn fail_first_probes(&self, label: &str, count: usize) {
        self.slow_start
            .lock()
            .unwrap()
            .insert(label.to_string(), count);
    }

    pub fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Hostnames of every service launched so far
    pub fn launched_hostnames(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    /// Exec requests seen so far
    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn networks(&self) -> Vec<String> {
        let mut networks: Vec<String> = self.networks.lock().unwrap().iter().cloned().collect();
        networks.sort();
        networks
    }

    fn read_path(request: &ExecRequest, path: &str) -> Option<Vec<u8>> {
        for secret in &request.secrets {
            if let SecretDelivery::File { target, value } = secret {
                if target == path {
                    return Some(value.expose().as_bytes().to_vec());
                }
            }
        }
        for mount in &request.mounts {
            if let Some(rest) = path.strip_prefix(mount.target.as_str()) {
                let source = if rest.is_empty() {
                    mount.source.clone()
                } else {
                    mount.source.join(rest.trim_start_matches('/'))
                };
                return std::fs::read(source).ok();
            }
        }
        std::fs::read(in_rootfs(&request.rootfs, path)).ok()
    }
}

fn in_rootfs(rootfs: &Path, path: &str) -> PathBuf {
    rootfs.join(path.trim_start_matches('/'))
}

fn write_in_rootfs(rootfs: &Path, path: &str, contents: &[u8]) -> KilnResult<()> {
    let target = in_rootfs(rootfs, path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KilnError::io("fake mkdir", e))?;
    }
    std::fs::write(&target, contents).map_err(|e| KilnError::io("fake write", e))
}

async fn greet_and_echo(listener: TcpListener, hostname: String) {
    while let Ok((mut stream, _)) = listener.accept().await {
        let hostname = hostname.clone();
        tokio::spawn(async move {
            let (read, mut write) = stream.split();
            if write
                .write_all(format!("hello from {}\n", hostname).as_bytes())
                .await
                .is_err()
            {
                return;
            }
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if write.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_available(&self) -> KilnResult<bool> {
        Ok(true)
    }

    async fn ensure_ready(&self) -> KilnResult<()> {
        Ok(())
    }

    async fn pull_image(&self, reference: &str, dest: &Path) -> KilnResult<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        write_in_rootfs(dest, "etc/os-release", format!("ID={}\n", reference).as_bytes())?;
        write_in_rootfs(dest, "bin/sh", b"#!fake\n")
    }

    async fn exec(&self, request: ExecRequest) -> KilnResult<ExecOutcome> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let delay = *self.exec_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if request.args.iter().any(|a| a == "fail") {
            return Ok(ExecOutcome {
                exit_code: 1,
                stdout: b"partial output\n".to_vec(),
                stderr: b"boom\n".to_vec(),
            });
        }

        let args: Vec<&str> = request.args.iter().map(String::as_str).collect();
        let stdout = match args.as_slice() {
            ["write", path, contents] => {
                write_in_rootfs(&request.rootfs, path, contents.as_bytes())?;
                format!("wrote {}\n", path).into_bytes()
            }
            ["cat", path] => match Self::read_path(&request, path) {
                Some(bytes) => bytes,
                None => {
                    return Ok(ExecOutcome {
                        exit_code: 1,
                        stdout: Vec::new(),
                        stderr: format!("cat: {}: No such file\n", path).into_bytes(),
                    })
                }
            },
            ["echo-env", name] => {
                let secret = request.secrets.iter().find_map(|s| match s {
                    SecretDelivery::Env { name: n, value } if n == name => {
                        Some(value.expose().to_string())
                    }
                    _ => None,
                });
                let value = secret
                    .or_else(|| request.env.get(*name).cloned())
                    .unwrap_or_default();
                format!("{}\n", value).into_bytes()
            }
            _ => {
                let joined = request.args.join(" ");
                write_in_rootfs(
                    &request.rootfs,
                    &format!("out/{}", request.label),
                    joined.as_bytes(),
                )?;
                format!("{}\n", joined).into_bytes()
            }
        };

        Ok(ExecOutcome {
            exit_code: 0,
            stdout,
            stderr: Vec::new(),
        })
    }

    async fn create_network(&self, name: &str) -> KilnResult<()> {
        self.networks.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> KilnResult<()> {
        self.networks.lock().unwrap().remove(name);
        Ok(())
    }

    async fn launch_service(&self, launch: ServiceLaunch) -> KilnResult<SandboxHandle> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        self.launched.lock().unwrap().push(launch.hostname.clone());

        let mut ports = HashMap::new();
        let mut listeners = Vec::new();
        for port in &launch.ports {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .map_err(|e| KilnError::io("fake listener", e))?;
            let addr = listener
                .local_addr()
                .map_err(|e| KilnError::io("fake listener addr", e))?;
            ports.insert(*port, addr);
            listeners.push(tokio::spawn(greet_and_echo(listener, launch.hostname.clone())));
        }

        let id = format!("fake-{}", n);
        self.running.lock().unwrap().insert(
            id.clone(),
            RunningService {
                label: launch.label.clone(),
                ports,
                listeners,
            },
        );

        Ok(SandboxHandle {
            id,
            hostname: launch.hostname,
            address: Some(format!("10.88.0.{}", n + 2).parse().unwrap()),
        })
    }

    async fn probe(
        &self,
        handle: &SandboxHandle,
        _check: &HealthCheck,
        _timeout: Duration,
    ) -> KilnResult<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let label = match self.running.lock().unwrap().get(&handle.id) {
            Some(service) => service.label.clone(),
            None => return Ok(false),
        };
        if self.unhealthy.lock().unwrap().contains(&label) {
            return Ok(false);
        }
        let mut slow = self.slow_start.lock().unwrap();
        if let Some(remaining) = slow.get_mut(&label) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn stop_service(&self, handle: &SandboxHandle) -> KilnResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(service) = self.running.lock().unwrap().remove(&handle.id) {
            for listener in service.listeners {
                listener.abort();
            }
        }
        Ok(())
    }

    async fn sandbox_address(&self, handle: &SandboxHandle, port: u16) -> KilnResult<SocketAddr> {
        self.running
            .lock()
            .unwrap()
            .get(&handle.id)
            .and_then(|s| s.ports.get(&port).copied())
            .ok_or_else(|| KilnError::PortExposure {
                hostname: handle.hostname.clone(),
                port,
                reason: "port not published".to_string(),
            })
    }

    async fn attach_shell(&self, request: ShellRequest) -> KilnResult<AttachedShell> {
        let (client_in, mut shell_in) = tokio::io::duplex(1024);
        let (mut shell_out, client_out) = tokio::io::duplex(1024);
        let rootfs = request.rootfs.clone();

        let done = tokio::spawn(async move {
            let _ = shell_out
                .write_all(format!("debug {}\n", request.label).as_bytes())
                .await;
            let mut lines = BufReader::new(&mut shell_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                // `ls <path>` reports whether a path exists in the rootfs
                let reply = match line.strip_prefix("ls ") {
                    Some(path) => in_rootfs(&rootfs, path).exists().to_string(),
                    None => line,
                };
                let _ = shell_out.write_all(format!("{}\n", reply).as_bytes()).await;
            }
            Ok(0)
        });

        let mut shell = AttachedShell::new(done);
        shell.stdin = Some(Box::new(client_in));
        shell.stdout = Some(Box::new(client_out));
        Ok(shell)
    }

    fn runtime_name(&self) -> &'static str {
        "Fake"
    }
}
