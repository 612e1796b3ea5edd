use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::engine::{EngineFactory, ReliableEngine, SessionOutput};
use crate::error::{SessionError, SessionResult};
use crate::gate::DatagramSink;
use crate::sid::Sid;

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Records what an engine was asked to do, and lets a test inject 'received' messages
#[derive(Default)]
pub struct FakeEngineState {
    pub inputs: Vec<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub advanced_to: Vec<u32>,
    pub ready: VecDeque<Vec<u8>>,
    /// the next N calls to `advance_time` fail
    pub failing_advances: usize,
}

/// A stand-in for KCP without any protocol: `send` writes the payload to the output unchanged,
///  and messages become ready only when a test puts them there.
pub struct FakeEngine {
    state: Arc<Mutex<FakeEngineState>>,
    output: Option<SessionOutput>,
}

impl FakeEngine {
    pub fn detached() -> (FakeEngine, Arc<Mutex<FakeEngineState>>) {
        let state: Arc<Mutex<FakeEngineState>> = Default::default();
        (FakeEngine { state: state.clone(), output: None }, state)
    }
}

impl ReliableEngine for FakeEngine {
    fn input(&mut self, datagram: &[u8]) -> SessionResult<()> {
        self.state.lock().unwrap().inputs.push(datagram.to_vec());
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> SessionResult<()> {
        self.state.lock().unwrap().sent.push(payload.to_vec());
        if let Some(output) = self.output.as_mut() {
            std::io::Write::write(output, payload).unwrap();
        }
        Ok(())
    }

    fn advance_time(&mut self, now_millis: u32) -> SessionResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_advances > 0 {
            state.failing_advances -= 1;
            return Err(SessionError::Engine("simulated failure".to_string()));
        }
        state.advanced_to.push(now_millis);
        Ok(())
    }

    fn peek_ready_size(&self) -> Option<usize> {
        self.state.lock().unwrap().ready.front().map(|m| m.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> SessionResult<usize> {
        match self.state.lock().unwrap().ready.pop_front() {
            Some(msg) => {
                buf[..msg.len()].copy_from_slice(&msg);
                Ok(msg.len())
            }
            None => Err(SessionError::Engine("nothing ready".to_string())),
        }
    }
}

/// Creates [FakeEngine]s and keeps their state accessible by sid
#[derive(Default)]
pub struct FakeEngineFactory {
    engines: Mutex<Vec<(Sid, SocketAddr, Arc<Mutex<FakeEngineState>>)>>,
}

impl FakeEngineFactory {
    pub fn engine_state(&self, sid: Sid) -> Option<Arc<Mutex<FakeEngineState>>> {
        self.engines.lock().unwrap()
            .iter()
            .rev()
            .find(|(s, _, _)| *s == sid)
            .map(|(_, _, state)| state.clone())
    }

    pub fn created(&self) -> Vec<(Sid, SocketAddr)> {
        self.engines.lock().unwrap()
            .iter()
            .map(|(sid, addr, _)| (*sid, *addr))
            .collect()
    }
}

impl EngineFactory for FakeEngineFactory {
    fn create_engine(&self, sid: Sid, output: SessionOutput) -> SessionResult<Box<dyn ReliableEngine>> {
        let state: Arc<Mutex<FakeEngineState>> = Default::default();
        self.engines.lock().unwrap().push((sid, output.remote_addr(), state.clone()));
        Ok(Box::new(FakeEngine { state, output: Some(output) }))
    }
}

/// Collects all datagrams instead of sending them
#[derive(Default)]
pub struct CollectingSink {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl CollectingSink {
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl DatagramSink for CollectingSink {
    fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        self.sent.lock().unwrap().push((to, buf.to_vec()));
    }
}
