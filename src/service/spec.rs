use crate::cache::Fingerprint;
use crate::runtime::{HostAlias, SecretDelivery};
use crate::service::HealthCheck;
use crate::store::Artifact;
use std::collections::BTreeMap;

/// A store artifact mounted into a service sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMount {
    pub artifact: Artifact,
    pub target: String,
    pub readonly: bool,
}

/// A fully resolved service, ready to launch
///
/// `fingerprint` is the de-duplication identity within a session. `hosts`
/// carries the bindings: peers in the same group by hostname only, already
/// running services with their address.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub fingerprint: Fingerprint,
    pub label: String,
    pub rootfs: Artifact,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub mounts: Vec<ServiceMount>,
    pub secrets: Vec<SecretDelivery>,
    pub ports: Vec<u16>,
    pub health: HealthCheck,
    pub health_attempts: Option<u32>,
    pub hosts: Vec<HostAlias>,
}

impl ServiceSpec {
    pub fn new(fingerprint: Fingerprint, label: impl Into<String>, rootfs: Artifact) -> Self {
        Self {
            fingerprint,
            label: label.into(),
            rootfs,
            args: Vec::new(),
            env: BTreeMap::new(),
            workdir: None,
            mounts: Vec::new(),
            secrets: Vec::new(),
            ports: Vec::new(),
            health: HealthCheck::None,
            health_attempts: None,
            hosts: Vec::new(),
        }
    }
}
