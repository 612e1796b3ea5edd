use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::engine::ReliableEngine;
use crate::error::{SessionError, SessionResult};
use crate::handler::SessionHandler;
use crate::sid::Sid;

/// A session's lifecycle only moves forward: `Connecting -> Connected -> Disconnected`.
///  Server sessions skip `Connecting` from the outside view because they are handed out only
///  after their drive loop is running.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
}

type SharedEngine = Arc<Mutex<Option<Box<dyn ReliableEngine>>>>;

/// One reliable KCP conversation with a peer. The session owns the engine, and a drive loop
///  that keeps the engine's clock ticking and hands reassembled inbound messages to the
///  [SessionHandler], regardless of traffic.
///
/// Application payloads are gzip compressed on the way in and decompressed on the way out.
pub struct Session {
    sid: Sid,
    remote_addr: SocketAddr,
    state: AtomicU8,
    engine: SharedEngine,
    handler: Arc<dyn SessionHandler>,
    drive_interval: Duration,
    created_at: Instant,
    cancel: CancellationToken,
    drive_handle: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.drive_handle.take() {
            handle.abort();
        }
    }
}

impl Session {
    pub fn new(
        sid: Sid,
        remote_addr: SocketAddr,
        engine: Box<dyn ReliableEngine>,
        handler: Arc<dyn SessionHandler>,
        drive_interval: Duration,
    ) -> Session {
        Session {
            sid,
            remote_addr,
            state: AtomicU8::new(SessionState::Connecting.into()),
            engine: Arc::new(Mutex::new(Some(engine))),
            handler,
            drive_interval,
            created_at: Instant::now(),
            cancel: CancellationToken::new(),
            drive_handle: None,
        }
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        SessionState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(SessionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Moves the state forward to `to`, returning `false` (and leaving the state unchanged) if
    ///  that would be a transition backward or to the same state
    fn advance_state(&self, to: SessionState) -> bool {
        let to_raw: u8 = to.into();
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current < to_raw { Some(to_raw) } else { None }
            })
            .is_ok()
    }

    /// Starts the drive loop, which makes the session `Connected`
    pub fn spawn_drive_loop(&mut self) {
        if self.drive_handle.is_some() {
            warn!("drive loop of session {} already spawned", self.sid);
            return;
        }
        if !self.advance_state(SessionState::Connected) {
            warn!("session {} is {:?} - not spawning drive loop", self.sid, self.state());
            return;
        }

        self.drive_handle = Some(tokio::spawn(Self::drive_loop(
            self.sid,
            self.remote_addr,
            self.engine.clone(),
            self.handler.clone(),
            self.drive_interval,
            self.created_at,
            self.cancel.clone(),
        )));
        debug!("session {} with {:?} connected", self.sid, self.remote_addr);
    }

    /// Passes a raw datagram, including its leading session id, to the engine
    pub async fn input(&self, datagram: &[u8]) -> SessionResult<()> {
        let mut engine = self.engine.lock().await;
        match engine.as_mut() {
            Some(engine) => engine.input(datagram),
            None => Err(self.closed_error()),
        }
    }

    pub async fn send(&self, payload: &[u8]) -> SessionResult<()> {
        let compressed = codec::compress(payload);
        trace!("session {}: sending {} bytes ({} compressed)", self.sid, payload.len(), compressed.len());

        let mut engine = self.engine.lock().await;
        match engine.as_mut() {
            Some(engine) => engine.send(&compressed),
            None => Err(self.closed_error()),
        }
    }

    /// Stops the drive loop and releases the engine. This is final, and calling it again has
    ///  no further effect.
    pub async fn close(&self) {
        self.cancel.cancel();
        if self.advance_state(SessionState::Disconnected) {
            info!("closing session {} with {:?}", self.sid, self.remote_addr);
        }
        self.engine.lock().await.take();
    }

    fn closed_error(&self) -> SessionError {
        SessionError::SessionClosed { sid: self.sid, remote_addr: self.remote_addr }
    }

    async fn drive_loop(
        sid: Sid,
        remote_addr: SocketAddr,
        engine: SharedEngine,
        handler: Arc<dyn SessionHandler>,
        drive_interval: Duration,
        created_at: Instant,
        cancel: CancellationToken,
    ) {
        let mut ticks = interval(drive_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    let received = match Self::drive_tick(&engine, created_at).await {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("session {}: error driving engine: {}", sid, e);
                            continue;
                        }
                    };

                    // the engine lock is released here, so handlers may send in response
                    for compressed in received {
                        match codec::decompress(&compressed) {
                            Ok(msg) => handler.on_message(sid, remote_addr, msg).await,
                            Err(e) => warn!("session {}: discarding message from {:?}: {}", sid, remote_addr, e),
                        }
                    }
                }
            }
        }
        debug!("drive loop of session {} terminated", sid);
    }

    /// Advances the engine's clock and drains all messages that are ready
    async fn drive_tick(engine: &SharedEngine, created_at: Instant) -> SessionResult<Vec<Vec<u8>>> {
        let mut engine = engine.lock().await;
        let engine = match engine.as_mut() {
            Some(engine) => engine,
            None => return Ok(Vec::new()),
        };

        // KCP works with a wrapping millisecond clock
        let now_millis = created_at.elapsed().as_millis() as u32;
        engine.advance_time(now_millis)?;

        let mut received = Vec::new();
        while let Some(size) = engine.peek_ready_size() {
            let mut buf = vec![0u8; size];
            match engine.receive(&mut buf) {
                Ok(len) => {
                    buf.truncate(len);
                    received.push(buf);
                }
                Err(e) => {
                    warn!("error receiving message of size {}: {}", size, e);
                    break;
                }
            }
        }
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ChannelHandler, MockSessionHandler, SessionEvent};
    use crate::test_util::{addr, FakeEngine, FakeEngineState};
    use rstest::rstest;
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;

    fn session_with_fake(handler: Arc<dyn SessionHandler>) -> (Session, Arc<StdMutex<FakeEngineState>>) {
        let (engine, state) = FakeEngine::detached();
        let session = Session::new(Sid(5), addr(9000), Box::new(engine), handler, Duration::from_millis(10));
        (session, state)
    }

    #[rstest]
    #[case::connecting(SessionState::Connecting, 0)]
    #[case::connected(SessionState::Connected, 1)]
    #[case::disconnected(SessionState::Disconnected, 2)]
    fn test_state_repr(#[case] state: SessionState, #[case] raw: u8) {
        assert_eq!(u8::from(state), raw);
        assert_eq!(SessionState::try_from(raw).unwrap(), state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle() {
        let (mut session, _) = session_with_fake(Arc::new(MockSessionHandler::new()));
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.sid(), Sid(5));
        assert_eq!(session.remote_addr(), addr(9000));

        session.spawn_drive_loop();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.is_connected());

        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_drive_loop_after_close() {
        let (mut session, state) = session_with_fake(Arc::new(MockSessionHandler::new()));
        session.close().await;

        session.spawn_drive_loop();
        assert_eq!(session.state(), SessionState::Disconnected);

        sleep(Duration::from_millis(50)).await;
        assert!(state.lock().unwrap().advanced_to.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_loop_advances_engine_clock() {
        let (mut session, state) = session_with_fake(Arc::new(MockSessionHandler::new()));
        session.spawn_drive_loop();

        sleep(Duration::from_millis(35)).await;

        let advanced_to = state.lock().unwrap().advanced_to.clone();
        assert_eq!(advanced_to, vec![0, 10, 20, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_loop_delivers_all_ready_messages() {
        let (handler, mut events) = ChannelHandler::new();
        let (mut session, state) = session_with_fake(Arc::new(handler));
        {
            let mut state = state.lock().unwrap();
            state.ready.push_back(codec::compress(b"a"));
            state.ready.push_back(codec::compress(b"bc"));
            state.ready.push_back(codec::compress(b""));
        }
        session.spawn_drive_loop();

        for expected in [b"a".to_vec(), b"bc".to_vec(), vec![]] {
            assert_eq!(events.recv().await, Some(SessionEvent::Message { sid: Sid(5), from: addr(9000), msg: expected }));
        }
        // all three were drained in the first tick
        assert_eq!(state.lock().unwrap().advanced_to, vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_is_discarded() {
        let (handler, mut events) = ChannelHandler::new();
        let (mut session, state) = session_with_fake(Arc::new(handler));
        {
            let mut state = state.lock().unwrap();
            state.ready.push_back(b"not compressed".to_vec());
            state.ready.push_back(codec::compress(b"valid"));
        }
        session.spawn_drive_loop();

        assert_eq!(events.recv().await, Some(SessionEvent::Message { sid: Sid(5), from: addr(9000), msg: b"valid".to_vec() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_loop_survives_engine_errors() {
        let (handler, mut events) = ChannelHandler::new();
        let (mut session, state) = session_with_fake(Arc::new(handler));
        state.lock().unwrap().failing_advances = 3;
        session.spawn_drive_loop();

        sleep(Duration::from_millis(45)).await;
        state.lock().unwrap().ready.push_back(codec::compress(b"late"));

        assert_eq!(events.recv().await, Some(SessionEvent::Message { sid: Sid(5), from: addr(9000), msg: b"late".to_vec() }));
        assert!(state.lock().unwrap().advanced_to.len() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_compresses() {
        let (session, state) = session_with_fake(Arc::new(MockSessionHandler::new()));

        session.send(b"Message 0 from client").await.unwrap();

        let sent = state.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_ne!(sent[0], b"Message 0 from client".to_vec());
        assert_eq!(codec::decompress(&sent[0]).unwrap(), b"Message 0 from client".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_is_passed_unchanged() {
        let (session, state) = session_with_fake(Arc::new(MockSessionHandler::new()));

        session.input(&[5, 0, 0, 0, 1, 2, 3]).await.unwrap();

        assert_eq!(state.lock().unwrap().inputs, vec![vec![5, 0, 0, 0, 1, 2, 3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_rejects_io() {
        let (mut session, state) = session_with_fake(Arc::new(MockSessionHandler::new()));
        session.spawn_drive_loop();
        sleep(Duration::from_millis(15)).await;
        session.close().await;
        let num_advances = state.lock().unwrap().advanced_to.len();

        assert!(matches!(session.send(b"x").await, Err(SessionError::SessionClosed { sid: Sid(5), .. })));
        assert!(matches!(session.input(&[5, 0, 0, 0]).await, Err(SessionError::SessionClosed { .. })));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(state.lock().unwrap().advanced_to.len(), num_advances);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_drive_loop() {
        let (mut session, state) = session_with_fake(Arc::new(MockSessionHandler::new()));
        session.spawn_drive_loop();
        sleep(Duration::from_millis(15)).await;

        drop(session);
        let num_advances = state.lock().unwrap().advanced_to.len();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(state.lock().unwrap().advanced_to.len(), num_advances);
    }
}
