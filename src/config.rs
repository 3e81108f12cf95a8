//! Client configuration.
use std::time::Duration;

use crate::{
    engine::{
        DEFAULT_DIRECT_WRITE_FACTOR, DEFAULT_MAX_FRAME_SIZE, DEFAULT_SHARED_BUFFER_SIZE,
        EngineConfig,
    },
    protocol::{ConnectOptions, Credentials},
    schema::DEFAULT_REFRESH_ATTEMPTS,
    supervisor::SupervisorConfig,
};

/// Everything needed to build a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` strings, tried in order.
    pub addresses: Vec<String>,
    pub credentials: Option<Credentials>,
    /// How long `Client::connect` waits for the first live connection.
    pub init_timeout: Duration,
    /// Default per-operation deadline; `None` waits forever.
    pub operation_timeout: Option<Duration>,
    /// How long a request may wait for room in the outbound buffer.
    pub write_timeout: Duration,
    /// Bounds each TCP connect and handshake read.
    pub connect_timeout: Duration,
    /// Consecutive failed attempts before the client gives up; `None` never does.
    pub connect_retries: Option<u32>,
    pub reconnect_delay: Duration,
    pub shared_buffer_size: usize,
    /// Messages longer than `shared_buffer_size * direct_write_factor` skip
    /// the shared buffer.
    pub direct_write_factor: f64,
    pub max_frame_size: usize,
    pub schema_refresh_attempts: u32,
    /// Enables retries and discovery.
    pub cluster: Option<ClusterConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["127.0.0.1:3301".to_string()],
            credentials: None,
            init_timeout: Duration::from_secs(5),
            operation_timeout: Some(Duration::from_secs(3)),
            write_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            connect_retries: Some(3),
            reconnect_delay: Duration::from_millis(500),
            shared_buffer_size: DEFAULT_SHARED_BUFFER_SIZE,
            direct_write_factor: DEFAULT_DIRECT_WRITE_FACTOR,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            schema_refresh_attempts: DEFAULT_REFRESH_ATTEMPTS,
            cluster: None,
        }
    }
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            addresses: vec![address.into()],
            ..Self::default()
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connect_retries(mut self, retries: Option<u32>) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_shared_buffer(mut self, size: usize, direct_write_factor: f64) -> Self {
        self.shared_buffer_size = size;
        self.direct_write_factor = direct_write_factor;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_schema_refresh_attempts(mut self, attempts: u32) -> Self {
        self.schema_refresh_attempts = attempts;
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub(crate) fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            operation_timeout: self.operation_timeout,
            write_timeout: self.write_timeout,
            shared_buffer_size: self.shared_buffer_size,
            direct_write_factor: self.direct_write_factor,
            max_frame_size: self.max_frame_size,
        }
    }

    pub(crate) fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connect: ConnectOptions {
                connect_timeout: self.connect_timeout,
                credentials: self.credentials.clone(),
                max_frame_size: self.max_frame_size,
            },
            connect_retries: self.connect_retries,
            reconnect_delay: self.reconnect_delay,
        }
    }
}

/// Settings for talking to a replicated cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Stored function returning the current members, polled when set.
    pub discovery_function: Option<String>,
    pub discovery_delay: Duration,
    /// Threads replaying parked operations.
    pub retry_threads: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            discovery_function: None,
            discovery_delay: Duration::from_secs(60),
            retry_threads: 2,
        }
    }
}

impl ClusterConfig {
    pub fn with_discovery(mut self, function: impl Into<String>, delay: Duration) -> Self {
        self.discovery_function = Some(function.into());
        self.discovery_delay = delay;
        self
    }

    pub fn with_retry_threads(mut self, threads: usize) -> Self {
        self.retry_threads = threads;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_flow_into_component_configs() {
        let config = ClientConfig::new("db:3301")
            .with_credentials("admin", "secret")
            .with_operation_timeout(None)
            .with_shared_buffer(1024, 0.25)
            .with_connect_retries(None);

        let engine = config.engine_config();
        assert_eq!(engine.operation_timeout, None);
        assert_eq!(engine.shared_buffer_size, 1024);
        assert_eq!(engine.direct_write_factor, 0.25);

        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.connect_retries, None);
        assert_eq!(
            supervisor.connect.credentials.map(|c| c.user).as_deref(),
            Some("admin")
        );
        assert_eq!(config.addresses, vec!["db:3301"]);
    }
}
