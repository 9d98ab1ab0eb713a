//! The registry is the aggregate root of the monitor: every server record,
//! every supervisor handle, the token table and the binary status table live
//! behind one readers-writer lock. Operations that touch more than one of
//! those maps do so inside a single critical section.
//!
//! Server fields (name, version) sit behind a second lock owned by the
//! record itself. That lock is only ever taken while the registry lock is
//! held or after the record has been cloned out of the registry, never the
//! other way around.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use super::models::{BinaryStatus, Channel, Grant, ServerConfig, User};
use super::store::PersistedState;
use super::supervisor::Supervisor;
use crate::errors::MonitorError;

/// A supervised server's persisted description behind a record-local lock.
#[derive(Debug)]
pub struct ServerRecord {
    id: i64,
    inner: RwLock<ServerConfig>,
}

impl ServerRecord {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            id: config.id,
            inner: RwLock::new(config),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn snapshot(&self) -> Result<ServerConfig, MonitorError> {
        self.inner
            .read()
            .map(|cfg| cfg.clone())
            .map_err(|_| MonitorError::LockPoisoned)
    }

    pub fn name(&self) -> Result<String, MonitorError> {
        Ok(self.snapshot()?.name)
    }

    pub fn version(&self) -> Result<String, MonitorError> {
        Ok(self.snapshot()?.version)
    }

    /// Replace the display name, returning the previous one.
    fn rename(&self, name: &str) -> Result<String, MonitorError> {
        let mut cfg = self.inner.write().map_err(|_| MonitorError::LockPoisoned)?;
        Ok(std::mem::replace(&mut cfg.name, name.to_string()))
    }

    fn set_version(&self, version: &str, channel: Channel, pinned: bool) -> Result<(), MonitorError> {
        let mut cfg = self.inner.write().map_err(|_| MonitorError::LockPoisoned)?;
        cfg.version = version.to_string();
        cfg.channel = channel;
        cfg.pinned = pinned;
        Ok(())
    }
}

/// The identity a message was authenticated as.
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    pub user: User,
    /// True while no users exist and every token maps to the implicit root admin
    pub bootstrap: bool,
}

#[derive(Default)]
struct RegistryState {
    last_id: i64,
    servers: BTreeMap<i64, Arc<ServerRecord>>,
    supervisors: HashMap<i64, Supervisor>,
    tokens: HashMap<String, User>,
    versions: HashMap<String, BinaryStatus>,
}

/// Shared, lock-protected monitor state.
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from persisted state. Supervisors are attached
    /// separately once they have been spawned.
    pub fn from_state(persisted: PersistedState) -> Self {
        let servers = persisted
            .servers
            .into_values()
            .map(|cfg| (cfg.id, Arc::new(ServerRecord::new(cfg))))
            .collect();
        Self {
            state: RwLock::new(RegistryState {
                last_id: persisted.last_id,
                servers,
                supervisors: HashMap::new(),
                tokens: persisted.tokens.into_iter().collect(),
                versions: persisted.versions.into_iter().collect(),
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RegistryState>, MonitorError> {
        self.state.read().map_err(|_| MonitorError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RegistryState>, MonitorError> {
        self.state.write().map_err(|_| MonitorError::LockPoisoned)
    }

    // ── Servers ──────────────────────────────────────────────────────

    /// Allocate the next server id. Ids are never reused, even when the
    /// install that asked for one fails.
    pub fn next_id(&self) -> Result<i64, MonitorError> {
        let mut state = self.write()?;
        state.last_id += 1;
        Ok(state.last_id)
    }

    /// Register a record together with its supervisor.
    pub fn insert_server(
        &self,
        record: Arc<ServerRecord>,
        supervisor: Supervisor,
    ) -> Result<(), MonitorError> {
        let mut state = self.write()?;
        let id = record.id();
        if id > state.last_id {
            state.last_id = id;
        }
        state.servers.insert(id, record);
        state.supervisors.insert(id, supervisor);
        Ok(())
    }

    /// Attach a supervisor to a record loaded from disk.
    pub fn attach_supervisor(&self, id: i64, supervisor: Supervisor) -> Result<(), MonitorError> {
        let mut state = self.write()?;
        if !state.servers.contains_key(&id) {
            return Err(MonitorError::InvalidServer { id });
        }
        state.supervisors.insert(id, supervisor);
        Ok(())
    }

    pub fn server(&self, id: i64) -> Result<Arc<ServerRecord>, MonitorError> {
        self.read()?
            .servers
            .get(&id)
            .cloned()
            .ok_or(MonitorError::InvalidServer { id })
    }

    pub fn supervisor(&self, id: i64) -> Result<Supervisor, MonitorError> {
        self.read()?
            .supervisors
            .get(&id)
            .cloned()
            .ok_or(MonitorError::InvalidServer { id })
    }

    /// All records, ordered by id.
    pub fn servers(&self) -> Result<Vec<Arc<ServerRecord>>, MonitorError> {
        Ok(self.read()?.servers.values().cloned().collect())
    }

    /// Rename a server, returning its previous name.
    pub fn rename_server(&self, id: i64, name: &str) -> Result<String, MonitorError> {
        let state = self.read()?;
        let record = state
            .servers
            .get(&id)
            .ok_or(MonitorError::InvalidServer { id })?;
        record.rename(name)
    }

    pub fn set_server_version(
        &self,
        id: i64,
        version: &str,
        channel: Channel,
        pinned: bool,
    ) -> Result<(), MonitorError> {
        let state = self.read()?;
        let record = state
            .servers
            .get(&id)
            .ok_or(MonitorError::InvalidServer { id })?;
        record.set_version(version, channel, pinned)
    }

    // ── Binaries ─────────────────────────────────────────────────────

    pub fn binary_status(&self, version: &str) -> Result<BinaryStatus, MonitorError> {
        Ok(self
            .read()?
            .versions
            .get(version)
            .copied()
            .unwrap_or_default())
    }

    pub fn set_binary_status(&self, version: &str, status: BinaryStatus) -> Result<(), MonitorError> {
        self.write()?.versions.insert(version.to_string(), status);
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────────────

    /// Resolve a bearer token. With an empty token table every token is the
    /// implicit root admin.
    pub fn resolve(&self, token: &str) -> Result<Option<Caller>, MonitorError> {
        let state = self.read()?;
        if state.tokens.is_empty() {
            return Ok(Some(Caller {
                user: User::bootstrap_root(),
                bootstrap: true,
            }));
        }
        Ok(state.tokens.get(token).map(|user| Caller {
            user: user.clone(),
            bootstrap: false,
        }))
    }

    /// Create a user and return its new token. The first user is an admin.
    pub fn create_user(&self, name: &str) -> Result<String, MonitorError> {
        let mut state = self.write()?;
        if state.tokens.values().any(|u| u.name == name) {
            return Err(MonitorError::UserExists {
                name: name.to_string(),
            });
        }
        let is_admin = state.tokens.is_empty();
        let token = new_token();
        state
            .tokens
            .insert(token.clone(), User::new(name, is_admin));
        info!(user = name, is_admin, "Created user");
        Ok(token)
    }

    pub fn delete_user(&self, name: &str) -> Result<(), MonitorError> {
        let mut state = self.write()?;
        let before = state.tokens.len();
        state.tokens.retain(|_, u| u.name != name);
        if state.tokens.len() == before {
            return Err(MonitorError::UserNotFound {
                name: name.to_string(),
            });
        }
        info!(user = name, "Deleted user");
        Ok(())
    }

    pub fn authorize(&self, name: &str, grant: Grant) -> Result<(), MonitorError> {
        self.update_user(name, grant, true)
    }

    pub fn deauthorize(&self, name: &str, grant: Grant) -> Result<(), MonitorError> {
        self.update_user(name, grant, false)
    }

    fn update_user(&self, name: &str, grant: Grant, allow: bool) -> Result<(), MonitorError> {
        let mut state = self.write()?;
        if let Grant::Server(id) = grant
            && !state.servers.contains_key(&id)
        {
            return Err(MonitorError::InvalidServer { id });
        }
        let user = state
            .tokens
            .values_mut()
            .find(|u| u.name == name)
            .ok_or_else(|| MonitorError::UserNotFound {
                name: name.to_string(),
            })?;
        match (grant, allow) {
            (Grant::Admin, allow) => user.is_admin = allow,
            (Grant::Server(id), true) => {
                user.servers.insert(id);
            }
            (Grant::Server(id), false) => {
                user.servers.remove(&id);
            }
        }
        Ok(())
    }

    /// All users, ordered by name.
    pub fn users(&self) -> Result<Vec<User>, MonitorError> {
        let mut users: Vec<User> = self.read()?.tokens.values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Capture everything that survives a restart.
    pub fn snapshot(&self) -> Result<PersistedState, MonitorError> {
        let state = self.read()?;
        let servers = state
            .servers
            .iter()
            .map(|(id, record)| Ok((*id, record.snapshot()?)))
            .collect::<Result<_, MonitorError>>()?;
        Ok(PersistedState {
            last_id: state.last_id,
            servers,
            versions: state.versions.clone().into_iter().collect(),
            tokens: state.tokens.clone().into_iter().collect(),
        })
    }
}

/// 16 random bytes rendered as uppercase hex.
fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string().to_uppercase()
}
