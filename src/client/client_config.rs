use std::time::Duration;

use anyhow::bail;

use crate::protocol::version::ProtocolVersion;


#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `major.minor.patch`, sent as version code in every frame header
    pub protocol_version: String,
    pub client_type: u32,

    /// time to wait for LOGIN_ACK after opening a connection
    pub login_timeout: Duration,
    /// pause between failed connection attempts
    pub reconnect_backoff: Duration,
    pub heartbeat_interval: Duration,

    /// time after sending a message before the first retry
    pub ack_timeout: Duration,
    /// time between retries
    pub retry_timeout: Duration,
    pub max_retries: u32,

    pub event_queue_capacity: usize,
}

impl ClientConfig {
    pub fn new() -> ClientConfig {
        ClientConfig {
            protocol_version: "1.0.0".to_string(),
            client_type: 1,
            login_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(50),
            ack_timeout: Duration::from_secs(15),
            retry_timeout: Duration::from_secs(5),
            max_retries: 3,
            event_queue_capacity: 4096,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.protocol_version.parse::<ProtocolVersion>()?;

        if self.login_timeout.is_zero() {
            bail!("login timeout must be positive");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if self.ack_timeout.is_zero() || self.retry_timeout.is_zero() {
            bail!("ack and retry timeouts must be positive");
        }
        if self.event_queue_capacity == 0 {
            bail!("event queue capacity must be positive");
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::new()
    }
}
