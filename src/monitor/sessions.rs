//! Connected operator sessions and log fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use super::bridge::LogSink;
use super::models::{LogRecord, MONITOR_SERVER_ID};
use super::registry::{Caller, Registry};

/// Identifier of one operator connection.
pub type SessionId = u64;

/// Records buffered per session before it is considered dead.
pub const SESSION_QUEUE_CAPACITY: usize = 256;

/// Sent on connect while no users exist.
pub const BOOTSTRAP_WARNING: &str =
    "No users exist, every token is treated as admin. Create one with :user create \"<name>\".";

struct Session {
    token: Option<String>,
    tx: mpsc::Sender<LogRecord>,
}

/// The set of connected sessions.
///
/// Each session is an outbound queue drained by its connection's writer.
/// A session whose queue is closed or full is dropped, which closes the
/// queue and lets the writer shut the connection down.
pub struct Sessions {
    registry: Arc<Registry>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_id: AtomicU64,
}

impl Sessions {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a session. `token` identifies the operator for broadcast
    /// filtering; it never authenticates commands.
    pub async fn register(&self, token: Option<String>, tx: mpsc::Sender<LogRecord>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().await.insert(id, Session { token, tx });
        debug!(session = id, "Session registered");
        id
    }

    pub async fn remove(&self, id: SessionId) {
        if self.sessions.lock().await.remove(&id).is_some() {
            debug!(session = id, "Session removed");
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// The identity a session's connect token currently resolves to.
    fn viewer(&self, token: Option<&str>) -> Option<Caller> {
        match self.registry.resolve(token.unwrap_or_default()) {
            Ok(caller) => caller,
            Err(e) => {
                warn!(error = %e, "Failed to resolve session token");
                None
            }
        }
    }

    fn can_see(&self, session: &Session, server_id: i64) -> bool {
        server_id == MONITOR_SERVER_ID
            || self
                .viewer(session.token.as_deref())
                .is_some_and(|caller| caller.user.can_access(server_id))
    }

    /// Send one record to one session. Returns false if the session is gone.
    pub async fn send_to(&self, id: SessionId, record: LogRecord) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(&id) else {
            return false;
        };
        if let Err(e) = session.tx.try_send(record) {
            warn!(session = id, error = %e, "Dropping session");
            sessions.remove(&id);
            return false;
        }
        true
    }

    /// Send a record to every session allowed to see its server.
    pub async fn broadcast(&self, record: LogRecord) {
        let mut sessions = self.sessions.lock().await;
        let mut dead = Vec::new();
        for (id, session) in sessions.iter() {
            if !self.can_see(session, record.server_id) {
                continue;
            }
            if let Err(e) = session.tx.try_send(record.clone()) {
                warn!(session = id, error = %e, "Dropping session");
                dead.push(*id);
            }
        }
        for id in dead {
            sessions.remove(&id);
        }
    }

    /// Announce the monitor and every visible server to a new session, and
    /// warn it when the monitor is still in bootstrap mode.
    pub async fn greet(&self, id: SessionId) {
        let token = {
            let sessions = self.sessions.lock().await;
            match sessions.get(&id) {
                Some(session) => session.token.clone(),
                None => return,
            }
        };

        let mut records = vec![LogRecord::init(MONITOR_SERVER_ID, "Monitor")];
        if let Some(caller) = self.viewer(token.as_deref()) {
            match self.registry.servers() {
                Ok(servers) => {
                    for record in servers {
                        if !caller.user.can_access(record.id()) {
                            continue;
                        }
                        if let Ok(name) = record.name() {
                            records.push(LogRecord::init(record.id(), name));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to list servers for greeting"),
            }
            if caller.bootstrap {
                records.push(LogRecord::monitor(MONITOR_SERVER_ID, BOOTSTRAP_WARNING));
            }
        }

        for record in records {
            if !self.send_to(id, record).await {
                break;
            }
        }
    }
}

#[async_trait]
impl LogSink for Sessions {
    async fn publish(&self, record: LogRecord) {
        self.broadcast(record).await;
    }
}
