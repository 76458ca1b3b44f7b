//! Process-wide cache of remote sessions keyed by host.
//!
//! The registry is an explicit value (usually behind an `Arc`) rather than a
//! global, so tests can build one with a fake session factory.
//!
//! Lookup and insertion happen under the map lock, so two callers asking for
//! the same host always get the same [`SharedSession`]. Connecting happens
//! under the per-session lock in [`SessionRegistry::connected`]: a second
//! caller for the same host waits for the first connect and then finds the
//! session already live, so a host is never dialled twice concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::session::{ConnectError, RemoteFs, RemoteSession};
use crate::model::types::RemoteEndpoint;

pub type SharedSession = Arc<Mutex<Box<dyn RemoteFs>>>;

type SessionFactory = Box<dyn Fn(&RemoteEndpoint) -> Box<dyn RemoteFs> + Send + Sync>;

struct Entry {
    endpoint: RemoteEndpoint,
    session: SharedSession,
}

pub struct SessionRegistry {
    factory: SessionFactory,
    sessions: Mutex<HashMap<String, Entry>>,
}

impl SessionRegistry {
    /// Registry that builds sessions with `factory`. Sessions are created unconnected.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&RemoteEndpoint) -> Box<dyn RemoteFs> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Registry backed by real SSH/SFTP sessions.
    pub fn ssh(connect_timeout: Duration) -> Self {
        Self::new(move |endpoint| {
            Box::new(RemoteSession::new(endpoint.clone()).with_connect_timeout(connect_timeout))
        })
    }

    /// Return the session registered for `endpoint.host`, creating one if needed.
    ///
    /// If the registered session was built from different connection details
    /// (credentials or port changed), it is replaced.
    pub fn get_or_create(&self, endpoint: &RemoteEndpoint) -> SharedSession {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get(&endpoint.host) {
            if entry.endpoint == *endpoint {
                return Arc::clone(&entry.session);
            }
            info!(host = %endpoint.host, "connection details changed; replacing session");
        }

        debug!(host = %endpoint.host, "registering new remote session");
        let session: SharedSession = Arc::new(Mutex::new((self.factory)(endpoint)));
        sessions.insert(
            endpoint.host.clone(),
            Entry {
                endpoint: endpoint.clone(),
                session: Arc::clone(&session),
            },
        );
        session
    }

    /// Registered session for `endpoint`, connected if it was not already live.
    pub fn connected(&self, endpoint: &RemoteEndpoint) -> Result<SharedSession, ConnectError> {
        let shared = self.get_or_create(endpoint);
        {
            let mut session = shared.lock();
            if !session.is_connected() {
                session.connect()?;
            }
        }
        Ok(shared)
    }

    /// Drop the session for `host`. The connection closes once the last holder releases it.
    pub fn invalidate(&self, host: &str) -> bool {
        self.sessions.lock().remove(host).is_some()
    }

    pub fn contains(&self, host: &str) -> bool {
        self.sessions.lock().contains_key(host)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hosts: Vec<String> = self.sessions.lock().keys().cloned().collect();
        f.debug_struct("SessionRegistry")
            .field("hosts", &hosts)
            .finish()
    }
}
