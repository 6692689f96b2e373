// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pair configuration and role selection.
//!
//! A pair is one host and one worker sharing one resource. Everything the two
//! processes must agree on (pair id, runtime dir, handshake timeout) is carried
//! from host to worker through `CROSSVIS_*` environment variables at spawn.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ShareError};

/// Command-line token that marks a worker launch. Absent means host.
pub const WORKER_ROLE_MARKER: &str = "--crossvis-worker";

pub const ENV_PAIR_ID: &str = "CROSSVIS_PAIR_ID";
pub const ENV_RUNTIME_DIR: &str = "CROSSVIS_RUNTIME_DIR";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "CROSSVIS_HANDSHAKE_TIMEOUT_MS";

/// `sun_path` is 108 bytes including the terminating NUL.
const MAX_SOCKET_PATH: usize = 107;

/// Which side of the protocol a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a controller does to its counterpart when it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerPolicy {
    /// Forcibly terminate the counterpart. Either side closing ends the pair.
    #[default]
    TerminatePeer,
    /// Leave the counterpart running.
    Detach,
}

/// Discoverable address of one role within one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    role: Role,
    pair_id: String,
    path: PathBuf,
}

impl ProcessIdentity {
    pub fn new(role: Role, pair_id: &str, runtime_dir: &Path) -> Self {
        Self {
            role,
            pair_id: pair_id.to_string(),
            path: runtime_dir.join(format!("crossvis-{}-{}.sock", pair_id, role.as_str())),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pair_id(&self) -> &str {
        &self.pair_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pair_id, self.role)
    }
}

/// Exponential backoff for the worker's readiness announcement.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Configuration for one host/worker pair.
#[derive(Debug, Clone)]
pub struct PairConfig {
    /// Instance-unique id; keeps concurrent pairs from finding each other.
    pub pair_id: String,
    /// Directory holding both handshake sockets.
    pub runtime_dir: PathBuf,
    /// Bound on every handshake wait, on both sides.
    pub handshake_timeout: Duration,
    pub ready_backoff_initial: Duration,
    pub ready_backoff_max: Duration,
    /// How long one loop iteration blocks on window events.
    pub poll_interval: Duration,
    /// Bytes reserved for the shared resource (header + content).
    pub resource_capacity: usize,
    /// Initial client size of the window, in pixels.
    pub window_size: (u32, u32),
    pub peer_policy: PeerPolicy,
    /// How long to wait for a terminated peer to be reaped.
    pub peer_shutdown_timeout: Duration,
    /// Program launched as the worker. Defaults to the current executable.
    pub worker_program: Option<PathBuf>,
    /// Arguments forwarded to the worker ahead of the role marker.
    pub worker_args: Vec<String>,
    /// Only process a worker accepts its reference from. Defaults to the
    /// worker's parent.
    pub host_pid: Option<u32>,
}

impl PairConfig {
    pub fn new(pair_id: impl Into<String>) -> Self {
        Self {
            pair_id: pair_id.into(),
            runtime_dir: default_runtime_dir(),
            handshake_timeout: Duration::from_secs(10),
            ready_backoff_initial: Duration::from_millis(10),
            ready_backoff_max: Duration::from_millis(500),
            poll_interval: Duration::from_millis(16),
            resource_capacity: 64 * 1024,
            window_size: (800, 600),
            peer_policy: PeerPolicy::TerminatePeer,
            peer_shutdown_timeout: Duration::from_secs(2),
            worker_program: None,
            worker_args: Vec::new(),
            host_pid: None,
        }
    }

    /// Config with a freshly generated pair id.
    pub fn generate() -> Self {
        Self::new(format!("p{}", cuid2::create_id()))
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_resource_capacity(mut self, bytes: usize) -> Self {
        self.resource_capacity = bytes;
        self
    }

    pub fn with_window_size(mut self, width: u32, height: u32) -> Self {
        self.window_size = (width, height);
        self
    }

    pub fn with_peer_policy(mut self, policy: PeerPolicy) -> Self {
        self.peer_policy = policy;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_host_pid(mut self, pid: u32) -> Self {
        self.host_pid = Some(pid);
        self
    }

    /// Pid the worker expects the resource reference from.
    pub fn expected_host_pid(&self) -> u32 {
        self.host_pid.unwrap_or_else(std::os::unix::process::parent_id)
    }

    /// Overlay values from a settings file. Fields absent from the file keep
    /// their current value.
    pub fn apply_settings(mut self, settings: PairSettings) -> Self {
        if let Some(pair_id) = settings.pair_id {
            self.pair_id = pair_id;
        }
        if let Some(dir) = settings.runtime_dir {
            self.runtime_dir = dir;
        }
        if let Some(ms) = settings.handshake_timeout_ms {
            self.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(bytes) = settings.resource_capacity {
            self.resource_capacity = bytes;
        }
        if let Some(width) = settings.window_width {
            self.window_size.0 = width;
        }
        if let Some(height) = settings.window_height {
            self.window_size.1 = height;
        }
        if let Some(policy) = settings.peer_policy {
            self.peer_policy = policy;
        }
        if let Some(ms) = settings.peer_shutdown_timeout_ms {
            self.peer_shutdown_timeout = Duration::from_millis(ms);
        }
        self
    }

    pub fn identity(&self, role: Role) -> ProcessIdentity {
        ProcessIdentity::new(role, &self.pair_id, &self.runtime_dir)
    }

    /// Environment the host hands to the worker so both agree on the pair.
    pub fn worker_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_PAIR_ID, self.pair_id.clone()),
            (
                ENV_RUNTIME_DIR,
                self.runtime_dir.to_string_lossy().into_owned(),
            ),
            (
                ENV_HANDSHAKE_TIMEOUT_MS,
                self.handshake_timeout.as_millis().to_string(),
            ),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.pair_id.is_empty() {
            return Err(ShareError::Configuration("pair id is empty".into()));
        }
        if !self
            .pair_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ShareError::Configuration(format!(
                "pair id '{}' may only contain ASCII letters, digits, '-' and '_'",
                self.pair_id
            )));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ShareError::Configuration(
                "handshake timeout must be non-zero".into(),
            ));
        }
        if self.resource_capacity < crate::bridge::MIN_RESOURCE_CAPACITY {
            return Err(ShareError::Configuration(format!(
                "resource capacity {} is below the minimum of {} bytes",
                self.resource_capacity,
                crate::bridge::MIN_RESOURCE_CAPACITY
            )));
        }
        for role in [Role::Host, Role::Worker] {
            let identity = self.identity(role);
            let len = identity.path().as_os_str().len();
            if len > MAX_SOCKET_PATH {
                return Err(ShareError::Configuration(format!(
                    "socket path for {} is {} bytes, limit is {}",
                    identity, len, MAX_SOCKET_PATH
                )));
            }
        }
        Ok(())
    }
}

/// Optional TOML settings file.
///
/// ```toml
/// handshake_timeout_ms = 5000
/// window_width = 1280
/// window_height = 720
/// peer_policy = "terminate_peer"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairSettings {
    pub pair_id: Option<String>,
    pub runtime_dir: Option<PathBuf>,
    pub handshake_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub resource_capacity: Option<usize>,
    pub window_width: Option<u32>,
    pub window_height: Option<u32>,
    pub peer_policy: Option<PeerPolicy>,
    pub peer_shutdown_timeout_ms: Option<u64>,
}

impl PairSettings {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source)
            .map_err(|e| ShareError::Configuration(format!("invalid settings: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            ShareError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }
}

/// `$XDG_RUNTIME_DIR` when set, the system temp dir otherwise.
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_differ_per_role_and_pair() {
        let a = PairConfig::new("alpha").with_runtime_dir("/run/x");
        let b = PairConfig::new("beta").with_runtime_dir("/run/x");

        assert_ne!(a.identity(Role::Host), a.identity(Role::Worker));
        assert_ne!(a.identity(Role::Worker), b.identity(Role::Worker));
        assert_eq!(
            a.identity(Role::Worker).path(),
            Path::new("/run/x/crossvis-alpha-worker.sock")
        );
    }

    #[test]
    fn generated_pair_ids_are_unique_and_valid() {
        let a = PairConfig::generate().with_runtime_dir("/tmp");
        let b = PairConfig::generate().with_runtime_dir("/tmp");
        assert_ne!(a.pair_id, b.pair_id);
        a.validate().unwrap();
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(35));
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 35, 35]);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let base = PairConfig::new("ok").with_runtime_dir("/tmp");
        base.validate().unwrap();

        assert!(PairConfig::new("").validate().is_err());
        assert!(PairConfig::new("../escape").validate().is_err());
        assert!(base.clone().with_resource_capacity(16).validate().is_err());
        assert!(
            base.clone()
                .with_handshake_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            base.with_runtime_dir(format!("/tmp/{}", "d".repeat(120)))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn settings_overlay_only_present_fields() {
        let settings = PairSettings::from_toml_str(
            r#"
            handshake_timeout_ms = 2500
            window_width = 1280
            peer_policy = "detach"
            "#,
        )
        .unwrap();

        let config = PairConfig::new("p").apply_settings(settings);
        assert_eq!(config.handshake_timeout, Duration::from_millis(2500));
        assert_eq!(config.window_size, (1280, 600));
        assert_eq!(config.peer_policy, PeerPolicy::Detach);
        assert_eq!(config.poll_interval, Duration::from_millis(16));
    }

    #[test]
    fn unknown_settings_are_rejected() {
        assert!(PairSettings::from_toml_str("colour = \"red\"").is_err());
    }

    #[test]
    fn expected_host_defaults_to_the_parent() {
        let config = PairConfig::new("p");
        assert_eq!(config.expected_host_pid(), std::os::unix::process::parent_id());
        assert_eq!(config.with_host_pid(4242).expected_host_pid(), 4242);
    }

    #[test]
    fn worker_env_carries_the_pair() {
        let config = PairConfig::new("pair7")
            .with_runtime_dir("/run/user/1")
            .with_handshake_timeout(Duration::from_millis(1500));
        let env = config.worker_env();
        assert!(env.contains(&(ENV_PAIR_ID, "pair7".to_string())));
        assert!(env.contains(&(ENV_RUNTIME_DIR, "/run/user/1".to_string())));
        assert!(env.contains(&(ENV_HANDSHAKE_TIMEOUT_MS, "1500".to_string())));
    }
}
