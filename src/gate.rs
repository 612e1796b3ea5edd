use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed receive, so that a socket in a persistent error state does not make
///  the receive loop spin
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// This is an abstraction for sending a datagram, introduced to decouple sessions and the KCP
///  output path from the actual socket, and to facilitate mocking the I/O part away for testing.
///
/// Sending is fire-and-forget: it never blocks, and failures are logged rather than reported.
///  Reliability is the KCP engine's business.
#[cfg_attr(test, automock)]
pub trait DatagramSink: Send + Sync + 'static {
    fn send_datagram(&self, to: SocketAddr, buf: &[u8]);
}

/// Receives every datagram read by a [DatagramGate]'s receive loop
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, buf: &[u8], from: SocketAddr);
}

/// The raw socket operations a [DatagramGate] needs, separated out to allow mocking the socket
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    async fn send_datagram_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }

    async fn send_datagram_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<()> {
        self.send_to(buf, to).await
            .map(|_| ())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// A bound UDP socket, shared by the receive loop and all senders.
///
/// Outbound datagrams go through a queue that a single task drains, so they leave the socket
///  in the order they were handed to [DatagramSink::send_datagram].
pub struct DatagramGate {
    socket: Arc<dyn DatagramSocket>,
    send_queue: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    max_datagram_size: usize,
}

impl DatagramGate {
    pub async fn bind(addr: SocketAddr, max_datagram_size: usize) -> anyhow::Result<DatagramGate> {
        let socket = UdpSocket::bind(addr).await?;
        info!("bound datagram socket to {:?}", socket.local_addr()?);

        Ok(Self::new(Arc::new(socket), max_datagram_size))
    }

    /// Wraps a socket and spawns its send task, so this must be called from inside a tokio
    ///  runtime. The send task terminates when the gate is dropped.
    pub fn new(socket: Arc<dyn DatagramSocket>, max_datagram_size: usize) -> DatagramGate {
        let (send_queue, queue_receiver) = mpsc::unbounded_channel();
        tokio::spawn(Self::send_loop(socket.clone(), queue_receiver));

        DatagramGate {
            socket,
            send_queue,
            max_datagram_size,
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn send_loop(socket: Arc<dyn DatagramSocket>, mut queue: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>) {
        while let Some((to, buf)) = queue.recv().await {
            match socket.send_datagram_to(to, &buf).await {
                Ok(()) => trace!("sent datagram of {} bytes to {:?}", buf.len(), to),
                Err(e) => warn!("error sending datagram to {:?}: {}", to, e),
            }
        }
        debug!("send queue closed - terminating send loop");
    }

    /// Reads datagrams until `cancel` is triggered, passing each one to `handler`. A failed
    ///  receive is logged and the loop carries on: a single bad datagram or a transient socket
    ///  error (e.g. an ICMP 'port unreachable' surfacing as 'connection reset') must not take
    ///  down the endpoint.
    pub async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>, cancel: CancellationToken) {
        let mut buf = vec![0u8; self.max_datagram_size];

        info!("starting datagram receive loop");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.socket.recv_datagram(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            trace!("received datagram of {} bytes from {:?}", len, from);
                            handler.on_datagram(&buf[..len], from).await;
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = sleep(RECV_ERROR_BACKOFF) => {}
                            }
                        }
                    }
                }
            }
        }
        info!("datagram receive loop cancelled");
    }
}

impl DatagramSink for DatagramGate {
    fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }

        if self.send_queue.send((to, buf.to_vec())).is_err() {
            warn!("send loop terminated - dropping datagram to {:?}", to);
        }
    }
}
