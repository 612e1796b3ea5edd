//! The seam between the session layer and the reliable transport protocol. Sessions only talk
//!  to a [ReliableEngine]; retransmission, windows, ordering and fragmentation all happen
//!  behind it. The production implementation is KCP (the `kcp` crate).

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use kcp::Kcp;
use tracing::trace;

use crate::config::EngineConfig;
use crate::error::{SessionError, SessionResult};
use crate::gate::DatagramSink;
use crate::sid::Sid;

#[cfg_attr(test, automock)]
pub trait ReliableEngine: Send + 'static {
    /// Feed one raw inbound datagram, including the leading session id (the engine checks it)
    fn input(&mut self, datagram: &[u8]) -> SessionResult<()>;

    /// Enqueue an outbound application payload. The engine fragments it as needed and emits
    ///  datagrams through its output asynchronously, i.e. during later calls to `advance_time`.
    fn send(&mut self, payload: &[u8]) -> SessionResult<()>;

    /// Drives the engine's timers. This must be called at short, regular intervals.
    fn advance_time(&mut self, now_millis: u32) -> SessionResult<()>;

    /// Size of the next fully reassembled inbound message, or `None` if there is none
    fn peek_ready_size(&self) -> Option<usize>;

    /// Copies the next ready message into `buf`, returning its length
    fn receive(&mut self, buf: &mut [u8]) -> SessionResult<usize>;
}

/// Creates the engine for a new session. Sessions on both client and server get their engine
///  from here, which allows tests to replace KCP.
#[cfg_attr(test, automock)]
pub trait EngineFactory: Send + Sync + 'static {
    fn create_engine(&self, sid: Sid, output: SessionOutput) -> SessionResult<Box<dyn ReliableEngine>>;
}

/// The engine's output sink: every datagram the engine emits goes to the session's peer
pub struct SessionOutput {
    sink: Arc<dyn DatagramSink>,
    remote_addr: SocketAddr,
}

impl SessionOutput {
    pub fn new(sink: Arc<dyn DatagramSink>, remote_addr: SocketAddr) -> SessionOutput {
        SessionOutput { sink, remote_addr }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl Write for SessionOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.sink.send_datagram(self.remote_addr, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct KcpEngine {
    kcp: Kcp<SessionOutput>,
}

impl KcpEngine {
    pub fn new(sid: Sid, output: SessionOutput, config: &EngineConfig) -> SessionResult<KcpEngine> {
        let mut kcp = Kcp::new(sid.to_raw(), output);
        kcp.set_nodelay(
            config.no_delay,
            config.internal_update_interval_millis,
            config.fast_resend,
            config.congestion_control_disabled,
        );
        kcp.set_wndsize(config.send_window, config.receive_window);
        kcp.set_mtu(config.mtu)
            .map_err(|e| SessionError::Engine(format!("invalid MTU {}: {:?}", config.mtu, e)))?;

        Ok(KcpEngine { kcp })
    }
}

impl ReliableEngine for KcpEngine {
    fn input(&mut self, datagram: &[u8]) -> SessionResult<()> {
        self.kcp.input(datagram)
            .map(|_| ())
            .map_err(|e| SessionError::Engine(format!("input: {:?}", e)))
    }

    fn send(&mut self, payload: &[u8]) -> SessionResult<()> {
        self.kcp.send(payload)
            .map(|_| ())
            .map_err(|e| SessionError::Engine(format!("send: {:?}", e)))
    }

    fn advance_time(&mut self, now_millis: u32) -> SessionResult<()> {
        self.kcp.update(now_millis)
            .map_err(|e| SessionError::Engine(format!("update: {:?}", e)))
    }

    fn peek_ready_size(&self) -> Option<usize> {
        // KCP reports 'nothing there' and 'still waiting for fragments' as errors
        self.kcp.peeksize().ok()
    }

    fn receive(&mut self, buf: &mut [u8]) -> SessionResult<usize> {
        self.kcp.recv(buf)
            .map_err(|e| SessionError::Engine(format!("recv: {:?}", e)))
    }
}

pub struct KcpEngineFactory {
    config: EngineConfig,
}

impl KcpEngineFactory {
    pub fn new(config: EngineConfig) -> KcpEngineFactory {
        KcpEngineFactory { config }
    }
}

impl EngineFactory for KcpEngineFactory {
    fn create_engine(&self, sid: Sid, output: SessionOutput) -> SessionResult<Box<dyn ReliableEngine>> {
        trace!("creating KCP engine for session {} to {:?}", sid, output.remote_addr());
        Ok(Box::new(KcpEngine::new(sid, output, &self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{addr, CollectingSink};

    fn engine(sid: Sid, sink: Arc<CollectingSink>, to: SocketAddr) -> KcpEngine {
        KcpEngine::new(sid, SessionOutput::new(sink, to), &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_output_goes_to_remote_addr() {
        let mock = {
            let mut mock = crate::gate::MockDatagramSink::new();
            mock.expect_send_datagram()
                .withf(|to, buf| to == &addr(9) && buf == [1u8, 2].as_slice())
                .once()
                .return_const(());
            mock
        };

        let mut output = SessionOutput::new(Arc::new(mock), addr(9));
        assert_eq!(output.write(&[1, 2]).unwrap(), 2);
    }

    #[test]
    fn test_datagrams_carry_sid() {
        let sink = Arc::new(CollectingSink::default());
        let mut sender = engine(Sid(0x0102_0304), sink.clone(), addr(2));

        sender.send(b"abc").unwrap();
        sender.advance_time(0).unwrap();

        let sent = sink.take();
        assert!(!sent.is_empty());
        for (to, datagram) in sent {
            assert_eq!(to, addr(2));
            assert_eq!(Sid::from_datagram(&datagram), Some(Sid(0x0102_0304)));
        }
    }

    #[test]
    fn test_transfer_between_engines() {
        let sink_a = Arc::new(CollectingSink::default());
        let sink_b = Arc::new(CollectingSink::default());
        let mut a = engine(Sid(7), sink_a.clone(), addr(2));
        let mut b = engine(Sid(7), sink_b.clone(), addr(1));

        assert_eq!(b.peek_ready_size(), None);

        a.send(b"first").unwrap();
        a.send(&vec![3u8; 2000]).unwrap(); // bigger than the MTU
        a.advance_time(0).unwrap();

        for (_, datagram) in sink_a.take() {
            b.input(&datagram).unwrap();
        }

        assert_eq!(b.peek_ready_size(), Some(5));
        let mut buf = vec![0u8; 5];
        assert_eq!(b.receive(&mut buf).unwrap(), 5);
        assert_eq!(buf, b"first");

        assert_eq!(b.peek_ready_size(), Some(2000));
        let mut buf = vec![0u8; 2000];
        assert_eq!(b.receive(&mut buf).unwrap(), 2000);
        assert_eq!(buf, vec![3u8; 2000]);

        assert_eq!(b.peek_ready_size(), None);
    }

    #[test]
    fn test_input_for_other_sid_is_rejected() {
        let sink_a = Arc::new(CollectingSink::default());
        let mut a = engine(Sid(1), sink_a.clone(), addr(2));
        let mut b = engine(Sid(2), Arc::new(CollectingSink::default()), addr(1));

        a.send(b"x").unwrap();
        a.advance_time(0).unwrap();

        for (_, datagram) in sink_a.take() {
            assert!(matches!(b.input(&datagram), Err(SessionError::Engine(_))));
        }
        assert_eq!(b.peek_ready_size(), None);
    }

    #[test]
    fn test_payload_size_limit() {
        let config = EngineConfig::default();
        let mut e = engine(Sid(1), Arc::new(CollectingSink::default()), addr(2));

        assert!(e.send(&vec![1u8; config.max_payload_len()]).is_ok());
        assert!(matches!(e.send(&vec![1u8; config.max_payload_len() + 1]), Err(SessionError::Engine(_))));
    }

    #[test]
    fn test_factory_rejects_invalid_mtu() {
        let factory = KcpEngineFactory::new(EngineConfig { mtu: 10, ..Default::default() });
        let result = factory.create_engine(Sid(1), SessionOutput::new(Arc::new(CollectingSink::default()), addr(1)));
        assert!(result.is_err());
    }
}
