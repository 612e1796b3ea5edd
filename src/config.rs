use std::time::Duration;
use anyhow::bail;

/// Tuning of the KCP engine that backs each session. Both peers should use the same values
///  for MTU and window sizes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// KCP 'nodelay' mode: shorter minimum RTO and no exponential backoff on resend
    pub no_delay: bool,
    /// KCP's internal flush interval in milliseconds
    pub internal_update_interval_millis: i32,
    /// Number of duplicate ACKs that trigger a fast resend; 0 disables fast resend
    pub fast_resend: i32,
    pub congestion_control_disabled: bool,

    /// maximum number of *segments* (not bytes) in flight
    pub send_window: u16,
    pub receive_window: u16,

    /// This is the maximum size of a datagram that KCP emits, including its own header. Payloads
    ///  bigger than this are fragmented by KCP, into at most [EngineConfig::MAX_FRAGMENTS]
    ///  fragments. This limits the size of a single message, see [EngineConfig::max_payload_len].
    pub mtu: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            no_delay: true,
            internal_update_interval_millis: 10,
            fast_resend: 2,
            congestion_control_disabled: true,
            send_window: 64,
            receive_window: 64,
            mtu: 512,
        }
    }
}

impl EngineConfig {
    /// KCP rejects a payload that needs more fragments than this
    pub const MAX_FRAGMENTS: usize = 127;

    /// size of KCP's segment header
    pub const KCP_HEADER_LEN: usize = 24;

    /// The biggest payload a single send can hand to KCP, i.e. the limit for a message *after*
    ///  compression. This is 61,976 bytes for the default MTU of 512. Bigger messages are
    ///  rejected when they are sent.
    pub fn max_payload_len(&self) -> usize {
        Self::MAX_FRAGMENTS * self.mtu.saturating_sub(Self::KCP_HEADER_LEN)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 50 {
            bail!("MTU of {} is too small to hold a KCP header and payload", self.mtu);
        }
        if self.send_window == 0 || self.receive_window == 0 {
            bail!("window sizes must be positive");
        }
        if self.internal_update_interval_millis <= 0 {
            bail!("engine update interval must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub engine: EngineConfig,

    /// The drive loop advances the engine's clock and harvests received messages at this
    ///  interval. It is independent of traffic, i.e. it keeps ticking while a session is idle.
    pub drive_interval: Duration,

    /// Size of the receive buffer of the datagram socket. Datagrams bigger than this are
    ///  truncated by the OS.
    pub max_datagram_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            engine: EngineConfig::default(),
            drive_interval: Duration::from_millis(10),
            max_datagram_size: 64 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate()?;

        if self.drive_interval.is_zero() {
            bail!("drive interval must be positive");
        }
        if self.max_datagram_size < self.engine.mtu {
            bail!("receive buffer of {} bytes can not hold datagrams of MTU {}", self.max_datagram_size, self.engine.mtu);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub session: SessionConfig,

    /// Upper bound for the number of candidates the SID generator tries before giving up. `None`
    ///  means the generator searches until it finds a free id, which never terminates if all
    ///  2^32-1 ids are in use.
    pub max_sid_probes: Option<u64>,
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.session.validate()?;
        if self.max_sid_probes == Some(0) {
            bail!("max_sid_probes must be positive if it is set");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session: SessionConfig,

    /// polling interval while waiting for the server's SID assignment
    pub connect_interval: Duration,
    /// time after which a single connect attempt is considered failed
    pub connect_timeout: Duration,
    /// number of connect attempts in [crate::client::Client::connect_with_retry]
    pub max_connect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            session: SessionConfig::default(),
            connect_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(5000),
            max_connect_attempts: 5,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.session.validate()?;
        if self.connect_interval.is_zero() {
            bail!("connect interval must be positive");
        }
        if self.max_connect_attempts == 0 {
            bail!("at least one connect attempt is required");
        }
        Ok(())
    }
}
