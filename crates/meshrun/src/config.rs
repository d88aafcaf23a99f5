//! # Cluster configuration
//!
//! Timing and routing knobs shared by every component of a node. Values are
//! plain data; nothing here reads files or the environment.

use std::time::Duration;

use meshpack::DEFAULT_MAX_FRAME;
use meshrpc::code;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Timeout used when a caller does not pass one.
    pub rpc_timeout: Duration,
    /// A ref stuck in CHECK for longer than `rpc_timeout * check_stale_factor`
    /// is invalidated.
    pub check_stale_factor: u32,
    /// Period of the entity-ref sweep.
    pub registry_sweep_interval: Duration,
    /// Period of the per-connection callback sweep.
    pub addon_sweep_interval: Duration,
    /// How long an INVALID ref is kept before removal.
    pub invalid_grace: Duration,
    /// How long a RUN ref may sit idle before removal.
    pub idle_threshold: Duration,
    /// Server types that relay traffic for servers without a direct link.
    pub cross_connect_types: Vec<i32>,
    /// Code reported to callers when an entity does not exist.
    pub not_exists_code: i32,
    pub handshake_timeout: Duration,
    pub max_frame: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(3),
            check_stale_factor: 2,
            registry_sweep_interval: Duration::from_secs(10),
            addon_sweep_interval: Duration::from_secs(1),
            invalid_grace: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(600),
            cross_connect_types: Vec::new(),
            not_exists_code: code::ENTITY_NOT_EXISTS,
            handshake_timeout: Duration::from_secs(5),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_check_stale_factor(mut self, factor: u32) -> Self {
        self.check_stale_factor = factor.max(1);
        self
    }

    pub fn with_registry_sweep_interval(mut self, interval: Duration) -> Self {
        self.registry_sweep_interval = interval;
        self
    }

    pub fn with_addon_sweep_interval(mut self, interval: Duration) -> Self {
        self.addon_sweep_interval = interval;
        self
    }

    pub fn with_invalid_grace(mut self, grace: Duration) -> Self {
        self.invalid_grace = grace;
        self
    }

    pub fn with_idle_threshold(mut self, idle: Duration) -> Self {
        self.idle_threshold = idle;
        self
    }

    /// Adds a server type that relays for unlinked destinations.
    pub fn with_cross_connect(mut self, server_type: i32) -> Self {
        if !self.cross_connect_types.contains(&server_type) {
            self.cross_connect_types.push(server_type);
        }
        self
    }

    pub fn with_not_exists_code(mut self, code: i32) -> Self {
        self.not_exists_code = code;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Age after which an unanswered existence check counts as lost.
    pub fn check_timeout(&self) -> Duration {
        self.rpc_timeout * self.check_stale_factor
    }
}
