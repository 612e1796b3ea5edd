use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::engine::{EngineFactory, KcpEngineFactory, SessionOutput};
use crate::error::SessionError;
use crate::gate::{DatagramGate, DatagramHandler, DatagramSink};
use crate::handler::SessionHandler;
use crate::handshake::{self, DatagramKind};
use crate::session::Session;
use crate::sid::Sid;

type SessionSlot = Arc<RwLock<Option<Arc<Session>>>>;

struct Running {
    gate: Arc<DatagramGate>,
    server_addr: SocketAddr,
    cancel: CancellationToken,
    recv_handle: JoinHandle<()>,
}

impl Running {
    fn stop(self) {
        self.cancel.cancel();
        self.recv_handle.abort();
    }
}

/// The client end of the session layer. A client talks to a single server through a single
///  session: it probes the server for a session id, and once it has one, all messages go
///  through that session.
///
/// ```ignore
/// let client = Client::new(Arc::new(ClientConfig::default()), handler);
/// client.start("127.0.0.1:17555".parse()?).await?;
/// if client.connect().await {
///     client.send_message(b"hello").await;
/// }
/// ```
pub struct Client {
    config: Arc<ClientConfig>,
    handler: Arc<dyn SessionHandler>,
    engine_factory: Arc<dyn EngineFactory>,
    session: SessionSlot,
    running: Mutex<Option<Running>>,
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.stop();
        }
    }
}

impl Client {
    pub fn new(config: Arc<ClientConfig>, handler: Arc<dyn SessionHandler>) -> Client {
        let engine_factory = Arc::new(KcpEngineFactory::new(config.session.engine.clone()));
        Self::with_engine_factory(config, handler, engine_factory)
    }

    pub fn with_engine_factory(config: Arc<ClientConfig>, handler: Arc<dyn SessionHandler>, engine_factory: Arc<dyn EngineFactory>) -> Client {
        Client {
            config,
            handler,
            engine_factory,
            session: Default::default(),
            running: Mutex::new(None),
        }
    }

    /// Binds an ephemeral local socket and starts listening for the server's datagrams. This
    ///  does not contact the server yet, see [Client::try_connect_to_server].
    pub async fn start(&self, server_addr: SocketAddr) -> anyhow::Result<()> {
        self.config.validate()?;

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SessionError::AlreadyStarted.into());
        }

        let local_ip = if server_addr.is_ipv6() {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        }
        else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let gate = Arc::new(DatagramGate::bind(SocketAddr::new(local_ip, 0), self.config.session.max_datagram_size).await?);

        let dispatch = Arc::new(ClientDispatch {
            server_addr,
            sink: gate.clone(),
            session: self.session.clone(),
            engine_factory: self.engine_factory.clone(),
            handler: self.handler.clone(),
            drive_interval: self.config.session.drive_interval,
        });

        let cancel = CancellationToken::new();
        let recv_handle = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.recv_loop(dispatch, cancel).await })
        };

        info!("client for server {:?} started", server_addr);
        *running = Some(Running { gate, server_addr, cancel, recv_handle });
        Ok(())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await
            .as_ref()
            .and_then(|r| r.gate.local_addr().ok())
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    pub async fn sid(&self) -> Option<Sid> {
        self.session.read().await
            .as_ref()
            .map(|s| s.sid())
    }

    /// Probes the server for a session id and waits for the session to be established, checking
    ///  every `interval`. Returns `false` if there is no session after `timeout`.
    pub async fn try_connect_to_server(&self, interval: Duration, timeout: Duration) -> bool {
        let server_addr = {
            let running = self.running.lock().await;
            match running.as_ref() {
                Some(running) => {
                    running.gate.send_datagram(running.server_addr, &handshake::PROBE);
                    running.server_addr
                }
                None => {
                    warn!("client not started - can not connect");
                    return false;
                }
            }
        };
        debug!("sent session id probe to {:?}", server_addr);

        let mut waited = Duration::ZERO;
        loop {
            sleep(interval).await;
            if self.is_connected().await {
                info!("connected to {:?}", server_addr);
                return true;
            }

            waited += interval;
            if waited >= timeout {
                warn!("no session id from {:?} after {:?}", server_addr, timeout);
                return false;
            }
        }
    }

    /// Repeats [Client::try_connect_to_server] until it succeeds, giving up after `max_attempts`
    pub async fn connect_with_retry(&self, interval: Duration, timeout: Duration, max_attempts: u32) -> bool {
        for attempt in 1..=max_attempts {
            if self.try_connect_to_server(interval, timeout).await {
                return true;
            }
            if attempt < max_attempts {
                info!("connect attempt {} of {} failed - retrying", attempt, max_attempts);
            }
        }
        error!("giving up after {} connect attempts", max_attempts);
        false
    }

    /// [Client::connect_with_retry] with the configured interval, timeout and number of attempts
    pub async fn connect(&self) -> bool {
        self.connect_with_retry(self.config.connect_interval, self.config.connect_timeout, self.config.max_connect_attempts).await
    }

    /// Sends a message to the server. Returns `false` if there is no connected session, or if
    ///  the message is too big for KCP: its compressed size must not exceed
    ///  [crate::config::EngineConfig::max_payload_len] (about 60 KiB with the default MTU).
    pub async fn send_message(&self, msg: &[u8]) -> bool {
        let session = match self.session.read().await.as_ref() {
            Some(session) if session.is_connected() => session.clone(),
            _ => {
                warn!("not connected - not sending message");
                return false;
            }
        };

        match session.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                warn!("error sending message: {}", e);
                false
            }
        }
    }

    /// Closes the session and stops receiving. Closing a client that is not running is a no-op.
    pub async fn close(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            info!("closing client");
            running.stop();
        }

        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

/// Handles the client socket's datagrams: the server's sid assignment, and datagrams for the
///  established session
struct ClientDispatch {
    server_addr: SocketAddr,
    sink: Arc<dyn DatagramSink>,
    session: SessionSlot,
    engine_factory: Arc<dyn EngineFactory>,
    handler: Arc<dyn SessionHandler>,
    drive_interval: Duration,
}

#[async_trait]
impl DatagramHandler for ClientDispatch {
    async fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        if from != self.server_addr {
            warn!("datagram from {:?}, expected only {:?} - ignoring", from, self.server_addr);
            return;
        }

        match handshake::classify(buf) {
            None => debug!("datagram of {} bytes is too short for a session id - ignoring", buf.len()),
            Some(DatagramKind::Handshake) => self.on_handshake_reply(buf).await,
            Some(DatagramKind::Session(sid)) => self.on_session_datagram(sid, buf).await,
        }
    }
}

impl ClientDispatch {
    async fn on_handshake_reply(&self, buf: &[u8]) {
        // holding the write lock for the whole check-and-create makes concurrent replies safe
        let mut slot = self.session.write().await;
        if let Some(session) = slot.as_ref() {
            if session.is_connected() {
                info!("already connected as session {} - ignoring duplicate session id assignment", session.sid());
                return;
            }
        }

        let sid = match handshake::parse_reply(buf) {
            Some(sid) => sid,
            None => {
                warn!("malformed session id assignment of {} bytes - ignoring", buf.len());
                return;
            }
        };

        let engine = match self.engine_factory.create_engine(sid, SessionOutput::new(self.sink.clone(), self.server_addr)) {
            Ok(engine) => engine,
            Err(e) => {
                error!("error creating engine for session {}: {}", sid, e);
                return;
            }
        };

        let mut session = Session::new(sid, self.server_addr, engine, self.handler.clone(), self.drive_interval);
        session.spawn_drive_loop();
        info!("got session id {} from {:?}", sid, self.server_addr);
        *slot = Some(Arc::new(session));
    }

    async fn on_session_datagram(&self, sid: Sid, buf: &[u8]) {
        let session = match self.session.read().await.as_ref() {
            Some(session) if session.is_connected() => session.clone(),
            _ => {
                warn!("datagram for session {} before a session was established - ignoring", sid);
                return;
            }
        };

        if let Err(e) = session.input(buf).await {
            debug!("dropping datagram for session {}: {}", sid, e);
        }
    }
}
