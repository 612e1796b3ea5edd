use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::engine::{EngineFactory, KcpEngineFactory, SessionOutput};
use crate::error::SessionError;
use crate::gate::{DatagramGate, DatagramHandler, DatagramSink};
use crate::handler::SessionHandler;
use crate::handshake::{self, DatagramKind};
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::sid::Sid;

struct Running {
    gate: Arc<DatagramGate>,
    cancel: CancellationToken,
    recv_handle: JoinHandle<()>,
}

impl Running {
    fn stop(self) {
        self.cancel.cancel();
        self.recv_handle.abort();
    }
}

/// The server end of the session layer: it listens on a single UDP socket, hands out session
///  ids to clients that probe for one, and multiplexes any number of sessions over the socket.
///
/// Messages received through any session go to the [SessionHandler], as does the notification
///  of a newly established session.
pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<dyn SessionHandler>,
    engine_factory: Arc<dyn EngineFactory>,
    registry: Arc<SessionRegistry>,
    running: Mutex<Option<Running>>,
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.stop();
        }
    }
}

impl Server {
    pub fn new(config: Arc<ServerConfig>, handler: Arc<dyn SessionHandler>) -> Server {
        let engine_factory = Arc::new(KcpEngineFactory::new(config.session.engine.clone()));
        Self::with_engine_factory(config, handler, engine_factory)
    }

    pub fn with_engine_factory(config: Arc<ServerConfig>, handler: Arc<dyn SessionHandler>, engine_factory: Arc<dyn EngineFactory>) -> Server {
        let registry = Arc::new(SessionRegistry::new(config.max_sid_probes));
        Server {
            config,
            handler,
            engine_factory,
            registry,
            running: Mutex::new(None),
        }
    }

    /// Binds the socket and starts serving. Sessions and the sid counter left over from a
    ///  previous run are discarded.
    pub async fn start(&self, addr: SocketAddr) -> anyhow::Result<()> {
        self.config.validate()?;

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SessionError::AlreadyStarted.into());
        }

        let gate = Arc::new(DatagramGate::bind(addr, self.config.session.max_datagram_size).await?);
        self.registry.clear().await;

        let dispatch = Arc::new(ServerDispatch {
            config: self.config.clone(),
            sink: gate.clone(),
            registry: self.registry.clone(),
            engine_factory: self.engine_factory.clone(),
            handler: self.handler.clone(),
        });

        let cancel = CancellationToken::new();
        let recv_handle = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.recv_loop(dispatch, cancel).await })
        };

        info!("server listening on {:?}", gate.local_addr()?);
        *running = Some(Running { gate, cancel, recv_handle });
        Ok(())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await
            .as_ref()
            .and_then(|r| r.gate.local_addr().ok())
    }

    async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Sends a message to a single client. Returns `false` if the server is not running, if
    ///  there is no session with this id, or if the message is too big for KCP: its compressed
    ///  size must not exceed [crate::config::EngineConfig::max_payload_len].
    pub async fn send_message(&self, msg: &[u8], sid: Sid) -> bool {
        if !self.is_running().await {
            warn!("server not started - not sending message to session {}", sid);
            return false;
        }

        let session = match self.registry.get(sid).await {
            Some(session) => session,
            None => {
                warn!("no session {} - not sending message", sid);
                return false;
            }
        };

        match session.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                warn!("error sending message to session {}: {}", sid, e);
                false
            }
        }
    }

    /// Sends a message to all clients. The size limit of [Server::send_message] applies, and
    ///  sessions that reject the message are skipped.
    pub async fn broadcast_message(&self, msg: &[u8]) -> bool {
        if !self.is_running().await {
            warn!("server not started - not broadcasting message");
            return false;
        }

        let num_sessions = self.registry.broadcast(msg).await;
        debug!("broadcast message of {} bytes to {} sessions", msg.len(), num_sessions);
        true
    }

    /// Removes and closes a session. A datagram carrying its sid that arrives afterwards creates
    ///  a new session.
    pub async fn disconnect_by_sid(&self, sid: Sid) -> bool {
        let removed = self.registry.remove_by_sid(sid).await;
        if removed {
            info!("disconnected session {}", sid);
        }
        else {
            debug!("no session {} to disconnect", sid);
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    pub async fn sids(&self) -> Vec<Sid> {
        self.registry.sids().await
    }

    /// Stops receiving and closes all sessions. Closing a server that is not running is a no-op.
    pub async fn close(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            info!("closing server");
            running.stop();
        }
        self.registry.clear().await;
    }
}

/// Demultiplexes the server socket's datagrams to the handshake and the sessions
struct ServerDispatch {
    config: Arc<ServerConfig>,
    sink: Arc<dyn DatagramSink>,
    registry: Arc<SessionRegistry>,
    engine_factory: Arc<dyn EngineFactory>,
    handler: Arc<dyn SessionHandler>,
}

#[async_trait]
impl DatagramHandler for ServerDispatch {
    async fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        match handshake::classify(buf) {
            None => debug!("datagram of {} bytes from {:?} is too short for a session id - ignoring", buf.len(), from),
            Some(DatagramKind::Handshake) => self.on_probe(from).await,
            Some(DatagramKind::Session(sid)) => self.on_session_datagram(sid, buf, from).await,
        }
    }
}

impl ServerDispatch {
    async fn on_probe(&self, from: SocketAddr) {
        let sid = match self.registry.generate_unique_sid().await {
            Ok(sid) => sid,
            Err(e) => {
                error!("can not assign a session id to {:?}: {}", from, e);
                return;
            }
        };

        debug!("assigning session id {} to {:?}", sid, from);
        self.sink.send_datagram(from, &handshake::encode_reply(sid));
    }

    async fn on_session_datagram(&self, sid: Sid, buf: &[u8], from: SocketAddr) {
        let session = match self.registry.get(sid).await {
            Some(session) => session,
            None => match self.create_session(sid, from).await {
                Some(session) => session,
                None => return,
            },
        };

        if session.remote_addr() != from {
            trace!("datagram for session {} from {:?}, session was established with {:?}", sid, from, session.remote_addr());
        }

        if let Err(e) = session.input(buf).await {
            debug!("session {}: dropping datagram from {:?}: {}", sid, from, e);
        }
    }

    async fn create_session(&self, sid: Sid, from: SocketAddr) -> Option<Arc<Session>> {
        let engine = match self.engine_factory.create_engine(sid, SessionOutput::new(self.sink.clone(), from)) {
            Ok(engine) => engine,
            Err(e) => {
                error!("error creating engine for session {} with {:?}: {}", sid, from, e);
                return None;
            }
        };

        let mut session = Session::new(sid, from, engine, self.handler.clone(), self.config.session.drive_interval);
        session.spawn_drive_loop();
        let session = Arc::new(session);

        // the receive loop is the only place that adds sessions, so this can not race
        if let Err(e) = self.registry.add_session(session.clone()).await {
            warn!("registering session {}: {}", sid, e);
            return self.registry.get(sid).await;
        }

        info!("new session {} with {:?}", sid, from);
        self.handler.on_session_created(sid, from).await;
        Some(session)
    }
}
