use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{SessionError, SessionResult};
use crate::session::Session;
use crate::sid::Sid;

struct RegistryInner {
    by_id: FxHashMap<Sid, Arc<Session>>,
    /// the most recently generated sid
    last_sid: u32,
    /// cached copy of `by_id`'s values for iterating during broadcast. It is rebuilt lazily
    ///  after any change to `by_id` (i.e. when `snapshot_dirty` is set).
    snapshot: Vec<Arc<Session>>,
    snapshot_dirty: bool,
}

impl RegistryInner {
    fn next_candidate(&mut self) -> Sid {
        self.last_sid = if self.last_sid == u32::MAX { 1 } else { self.last_sid + 1 };
        Sid(self.last_sid)
    }

    fn snapshot(&mut self) -> &[Arc<Session>] {
        if self.snapshot_dirty {
            trace!("rebuilding session snapshot");
            self.snapshot = self.by_id.values().cloned().collect();
            self.snapshot_dirty = false;
        }
        &self.snapshot
    }
}

/// The server's sessions by sid, and the generator for fresh sids. All state is behind a
///  single lock, so generating an id and checking it against the registered sessions is atomic.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    max_sid_probes: Option<u64>,
}

impl SessionRegistry {
    pub fn new(max_sid_probes: Option<u64>) -> SessionRegistry {
        SessionRegistry {
            inner: Mutex::new(RegistryInner {
                by_id: Default::default(),
                last_sid: 0,
                snapshot: Vec::new(),
                snapshot_dirty: false,
            }),
            max_sid_probes,
        }
    }

    /// Returns an id that is not `0` and not in use right now. Ids are handed out in ascending
    ///  order, wrapping around to `1` after `u32::MAX`.
    ///
    /// NB: The id is not reserved: a session with this id is registered only when the client's
    ///      first datagram arrives. Until then, the same id is generated again only after the
    ///      counter wraps around.
    ///
    /// Without a configured limit, this searches forever if all ids are in use.
    pub async fn generate_unique_sid(&self) -> SessionResult<Sid> {
        let mut inner = self.inner.lock().await;

        let mut num_probes: u64 = 0;
        loop {
            let candidate = inner.next_candidate();
            if !inner.by_id.contains_key(&candidate) {
                return Ok(candidate);
            }

            num_probes += 1;
            if let Some(max) = self.max_sid_probes {
                if num_probes >= max {
                    warn!("no free sid after {} probes", num_probes);
                    return Err(SessionError::SidExhausted(num_probes));
                }
            }
        }
    }

    pub async fn add_session(&self, session: Arc<Session>) -> SessionResult<()> {
        let mut inner = self.inner.lock().await;
        let sid = session.sid();
        if inner.by_id.contains_key(&sid) {
            return Err(SessionError::DuplicateSid(sid));
        }

        debug!("registering session {} for {:?}", sid, session.remote_addr());
        inner.by_id.insert(sid, session);
        inner.snapshot_dirty = true;
        Ok(())
    }

    pub async fn get(&self, sid: Sid) -> Option<Arc<Session>> {
        self.inner.lock().await
            .by_id
            .get(&sid)
            .cloned()
    }

    /// Removes the session and closes it, which stops its drive loop
    pub async fn remove_by_sid(&self, sid: Sid) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            let removed = inner.by_id.remove(&sid);
            if removed.is_some() {
                inner.snapshot_dirty = true;
            }
            removed
        };

        match removed {
            Some(session) => {
                debug!("removed session {} for {:?}", sid, session.remote_addr());
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Sends `payload` through every registered session, returning the number of sessions.
    ///  Failures for individual sessions are logged and do not affect the others.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let mut inner = self.inner.lock().await;
        let snapshot = inner.snapshot();

        for session in snapshot {
            if let Err(e) = session.send(payload).await {
                warn!("broadcast to session {} failed: {}", session.sid(), e);
            }
        }
        snapshot.len()
    }

    /// Closes and removes all sessions, and restarts sid generation
    pub async fn clear(&self) {
        let sessions = {
            let mut inner = self.inner.lock().await;
            inner.last_sid = 0;
            inner.snapshot.clear();
            inner.snapshot_dirty = false;
            inner.by_id.drain()
                .map(|(_, session)| session)
                .collect::<Vec<_>>()
        };

        for session in sessions {
            session.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn sids(&self) -> Vec<Sid> {
        let mut result: Vec<Sid> = self.inner.lock().await.by_id.keys().cloned().collect();
        result.sort();
        result
    }
}
