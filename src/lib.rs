//! A session layer on top of KCP: it multiplexes any number of reliable, ordered message
//!  channels between a server and its clients over a single UDP socket on the server.
//!
//! ## Sessions
//!
//! Every session has a 32-bit session id (sid) that is unique on its server. KCP uses it as its
//!  conversation id, so every datagram of an established session starts with the sid. The sid
//!  `0` is reserved for the handshake (see [handshake]):
//!
//! * the client sends a probe, i.e. a datagram consisting of a zero sid
//! * the server replies with a zero sid followed by a newly assigned sid. It does *not* create
//!    a session at this point
//! * the client creates its session for the assigned sid and starts using it
//! * the server creates its session when the first datagram carrying the new sid arrives
//!
//! There is no retransmission for the handshake itself: a lost probe or reply shows up as a
//!  timeout on the client, which may then probe again.
//!
//! ## Messages
//!
//! Application messages are gzip compressed before they go into KCP and decompressed after
//!  KCP reassembled them (see [codec]). Messages that fail to decompress are discarded.
//!
//! Each session has a drive loop that advances KCP's clock at a fixed interval (10ms by
//!  default) and passes received messages to the application's [handler::SessionHandler].
//!
//! ## Not covered
//!
//! * authentication, encryption
//! * detecting dead peers: a session lives until it is closed explicitly
//! * migrating sessions between addresses

pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod handler;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod session;
pub mod sid;

#[cfg(test)]
mod test_util;

pub use client::Client;
pub use config::{ClientConfig, EngineConfig, ServerConfig, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use handler::{ChannelHandler, SessionEvent, SessionHandler};
pub use server::Server;
pub use sid::Sid;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
