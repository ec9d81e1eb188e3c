// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Supervisor Configuration
//!
//! Connection parameters for the broker and the timing policy of the supervisor.
//! How the parameters are loaded (file, environment) is up to the host process;
//! they only need to deserialize into [`ConnectionParameters`].

use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::{fmt, time::Duration};

/// Interval between connection or channel attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Interval between registry checks in `wait_until_idle`.
pub const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Unacknowledged deliveries allowed in flight on the shared channel.
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;

/// Broker address and credentials. Immutable once loaded.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionParameters {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        ConnectionParameters {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "rabbitmq-supervisor".to_owned(),
        }
    }
}

impl ConnectionParameters {
    /// Builds the AMQP URI used to dial the broker.
    ///
    /// The fields are carried as-is, so credentials and vhosts containing
    /// reserved characters (`@`, `/`, `#`, ...) need no escaping.
    ///
    /// # Returns
    /// A structured URI ready for `lapin::Connection::connect_uri`
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..Default::default()
        }
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

/// Timing and fairness policy of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub(crate) retry_interval: Duration,
    pub(crate) idle_poll_interval: Duration,
    pub(crate) prefetch_count: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            idle_poll_interval: DEFAULT_IDLE_POLL_INTERVAL,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
        }
    }
}

impl SupervisorConfig {
    /// Sets the wait between failed connection or channel attempts.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the registry poll interval used by `wait_until_idle`.
    pub fn idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Sets the global prefetch limit applied to the shared channel.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }
}
