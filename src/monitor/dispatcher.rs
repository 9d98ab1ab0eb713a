//! Operator message handling.
//!
//! Every inbound message is re-authenticated from its token, checked against
//! the addressed server, and then either run as a `:` directive or forwarded
//! verbatim to the server's stdin.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use super::bridge::{LogSink, NOT_RUNNING_MESSAGE};
use super::command::{
    Directive, GrantTarget, ParseError, VersionSpec, admin_only, all_usage, tokenize,
};
use super::installer::Installer;
use super::models::{Channel, Grant, LogRecord, MONITOR_SERVER_ID, OperatorMessage, ServerConfig, User};
use super::registry::{Registry, ServerRecord};
use super::sessions::{SessionId, Sessions};
use super::store::StateStore;
use super::supervisor::{KillMode, Supervisor, SupervisorState};
use crate::config::{Settings, is_valid_server_name};
use crate::errors::MonitorError;

const INVALID_TOKEN: &str = "Invalid token.";
const NOT_AUTHORIZED: &str = "You are not authorized to access this server.";
const DOWNLOAD_NOTICE: &str = "Please wait, the monitor may need to download files.";
const INVALID_NAME: &str = "Invalid server name, it may not be blank or contain '/', '\\' or '..'.";

/// Executes operator messages against the monitor state.
pub struct Dispatcher {
    registry: Arc<Registry>,
    sessions: Arc<Sessions>,
    installer: Arc<Installer>,
    settings: Arc<Settings>,
    store: StateStore,
    shutdown: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<Sessions>,
        installer: Arc<Installer>,
        settings: Arc<Settings>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        let store = StateStore::new(settings.state_file());
        Self {
            registry,
            sessions,
            installer,
            settings,
            store,
            shutdown,
        }
    }

    /// Start supervising `record`, publishing its output to every session.
    pub fn spawn_supervisor(&self, record: Arc<ServerRecord>) -> Supervisor {
        let sink: Arc<dyn LogSink> = self.sessions.clone();
        Supervisor::spawn(record, self.installer.clone(), self.settings.clone(), sink)
    }

    /// Persist the registry, logging any failure.
    pub async fn persist(&self) -> Result<(), MonitorError> {
        self.store.dump(&self.registry).await.inspect_err(|e| {
            warn!(error = %e, path = %self.store.path().display(), "Failed to save monitor state");
        })
    }

    /// Handle one message from `session`.
    pub async fn handle(&self, session: SessionId, msg: OperatorMessage) {
        let sid = msg.server_id;
        let caller = match self.registry.resolve(&msg.token) {
            Ok(Some(caller)) => caller,
            Ok(None) => return self.error(session, sid, INVALID_TOKEN).await,
            Err(e) => return self.error(session, sid, e.to_string()).await,
        };
        if !caller.user.can_access(sid) {
            return self.error(session, sid, NOT_AUTHORIZED).await;
        }

        match msg.command.strip_prefix(':') {
            Some(directive) => self.run_directive(session, &caller.user, sid, directive).await,
            None => self.forward(session, sid, &msg.command).await,
        }
    }

    async fn reply(&self, session: SessionId, sid: i64, message: impl Into<String>) {
        self.sessions.send_to(session, LogRecord::monitor(sid, message)).await;
    }

    async fn error(&self, session: SessionId, sid: i64, message: impl Into<String>) {
        self.sessions.send_to(session, LogRecord::error(sid, message)).await;
    }

    async fn usage(&self, session: SessionId, sid: i64, lines: &[&str]) {
        for line in lines {
            self.reply(session, sid, *line).await;
        }
    }

    /// Persist after a mutation; failures are reported, never rolled back.
    async fn save(&self, session: SessionId, sid: i64) {
        if let Err(e) = self.persist().await {
            self.error(session, sid, format!("Could not save monitor state: {}", e))
                .await;
        }
    }

    async fn forward(&self, session: SessionId, sid: i64, command: &str) {
        let supervisor = match self.registry.supervisor(sid) {
            Ok(s) => s,
            Err(_) => {
                return self
                    .error(session, sid, "Could not send command, invalid SID.")
                    .await;
            }
        };
        if !supervisor.send_command(command).await {
            self.error(session, sid, NOT_RUNNING_MESSAGE).await;
        }
    }

    async fn run_directive(&self, session: SessionId, user: &User, sid: i64, text: &str) {
        let tokens = tokenize(text);
        if let Some(denied) = admin_only(&tokens)
            && !user.is_admin
        {
            return self.error(session, sid, denied).await;
        }

        let directive = match Directive::parse(&tokens) {
            Ok(d) => d,
            Err(ParseError::Usage(lines)) => return self.usage(session, sid, lines).await,
            Err(ParseError::Unknown(cmd)) => {
                return self
                    .error(session, sid, format!("Unknown command :{}, try :help.", cmd))
                    .await;
            }
            Err(ParseError::InvalidServerId { deauthorize }) => {
                let verb = if deauthorize { "deauthorize" } else { "authorize" };
                return self
                    .error(session, sid, format!("Could not {}, invalid SID.", verb))
                    .await;
            }
        };

        match directive {
            Directive::Help => {
                let lines: Vec<&str> = all_usage().collect();
                self.usage(session, sid, &lines).await;
            }
            Directive::Recover => self.recover(session, sid).await,
            Directive::Stop => self.stop(session, sid).await,
            Directive::Status => self.status(session, user, sid).await,
            Directive::ServerCreate { name, version } => {
                self.create_server(session, sid, &name, version).await
            }
            Directive::ServerUpdate { version } => self.update_server(session, sid, version).await,
            Directive::ServerRename { name } => self.rename_server(session, sid, &name).await,
            Directive::KillMonitor => self.kill_monitor(session, sid).await,
            Directive::KillServer => self.kill_server(session, sid).await,
            Directive::UserCreate { name } => self.create_user(session, sid, &name).await,
            Directive::UserDelete { name } => self.delete_user(session, sid, &name).await,
            Directive::UserAuthorize { name, target } => {
                self.grant(session, sid, &name, target, true).await
            }
            Directive::UserDeauthorize { name, target } => {
                self.grant(session, sid, &name, target, false).await
            }
            Directive::UserList => self.list_users(session, sid).await,
        }
    }

    async fn recover(&self, session: SessionId, sid: i64) {
        let Ok(supervisor) = self.registry.supervisor(sid) else {
            return self
                .error(session, sid, "Could not recover server, invalid SID.")
                .await;
        };
        if !supervisor.start() {
            self.error(session, sid, "Could not recover server, server not down.")
                .await;
        }
    }

    async fn stop(&self, session: SessionId, sid: i64) {
        let Ok(supervisor) = self.registry.supervisor(sid) else {
            return self
                .error(session, sid, "Could not stop server, invalid SID.")
                .await;
        };
        if !supervisor.kill(KillMode::Restartable) {
            self.error(session, sid, "Could not stop server, server not up.")
                .await;
        }
    }

    async fn kill_server(&self, session: SessionId, sid: i64) {
        let Ok(supervisor) = self.registry.supervisor(sid) else {
            return self
                .error(session, sid, "Could not kill server, invalid SID.")
                .await;
        };
        if !supervisor.kill(KillMode::Permanent) {
            self.error(session, sid, "Could not kill server, server not up.")
                .await;
        }
    }

    async fn kill_monitor(&self, session: SessionId, sid: i64) {
        info!("Monitor exit requested by operator");
        self.reply(session, sid, "Monitor shutting down.").await;
        self.save(session, sid).await;
        self.shutdown.send_replace(true);
    }

    async fn status(&self, session: SessionId, user: &User, sid: i64) {
        let records: Vec<Arc<ServerRecord>> = if sid == MONITOR_SERVER_ID {
            match self.registry.servers() {
                Ok(all) => all.into_iter().filter(|r| user.can_access(r.id())).collect(),
                Err(e) => return self.error(session, sid, e.to_string()).await,
            }
        } else {
            match self.registry.server(sid) {
                Ok(record) => vec![record],
                Err(_) => {
                    return self
                        .error(session, sid, "Could not get status, invalid SID.")
                        .await;
                }
            }
        };
        if records.is_empty() {
            return self.reply(session, sid, "No servers.").await;
        }
        for record in records {
            let line = match record.snapshot() {
                Ok(cfg) => self.describe(&cfg),
                Err(e) => e.to_string(),
            };
            self.reply(session, sid, line).await;
        }
    }

    fn describe(&self, cfg: &ServerConfig) -> String {
        let state = match self.registry.supervisor(cfg.id).map(|s| s.state()) {
            Ok(SupervisorState::Up) => "up",
            Ok(SupervisorState::Starting) => "starting",
            Ok(SupervisorState::AwaitingManualRecovery) => "down",
            Ok(SupervisorState::TerminatedPermanently) => "killed",
            Err(_) => "unsupervised",
        };
        let pinned = if cfg.pinned { ", pinned" } else { "" };
        format!(
            "#{} {}: version {} ({}{}), {}",
            cfg.id, cfg.name, cfg.version, cfg.channel, pinned, state
        )
    }

    /// Resolve a version request to a concrete version and the channel and
    /// pin flag the record should carry.
    async fn resolve_version(
        &self,
        spec: VersionSpec,
        current: Channel,
    ) -> Result<(String, Channel, bool), String> {
        match spec {
            VersionSpec::Latest(channel) => self
                .installer
                .latest_version(channel)
                .await
                .map(|v| (v, channel, false))
                .map_err(|e| e.to_string()),
            VersionSpec::Pinned(version) => Ok((version, current, true)),
        }
    }

    async fn create_server(&self, session: SessionId, sid: i64, name: &str, spec: VersionSpec) {
        if !is_valid_server_name(name) {
            return self.error(session, sid, INVALID_NAME).await;
        }
        self.reply(session, sid, "Installing server...").await;
        self.reply(session, sid, DOWNLOAD_NOTICE).await;

        let (version, channel, pinned) = match self.resolve_version(spec, Channel::Stable).await {
            Ok(v) => v,
            Err(e) => return self.error(session, sid, e).await,
        };
        let id = match self.registry.next_id() {
            Ok(id) => id,
            Err(e) => return self.error(session, sid, e.to_string()).await,
        };
        if let Err(e) = self.installer.ensure_binary(&version).await {
            return self.error(session, sid, e.to_string()).await;
        }

        let record = Arc::new(ServerRecord::new(ServerConfig {
            id,
            name: name.to_string(),
            version: version.clone(),
            channel,
            pinned,
        }));
        let supervisor = self.spawn_supervisor(record.clone());
        if let Err(e) = self.registry.insert_server(record, supervisor) {
            return self.error(session, sid, e.to_string()).await;
        }
        info!(server_id = id, name, version = %version, "Server installed");
        self.save(session, sid).await;

        self.reply(session, sid, "Server installed.").await;
        self.sessions.broadcast(LogRecord::init(id, name)).await;
        self.sessions
            .broadcast(LogRecord::monitor(id, "Use :recover to start server."))
            .await;
    }

    async fn update_server(&self, session: SessionId, sid: i64, spec: Option<VersionSpec>) {
        let current = match self.registry.server(sid).and_then(|r| r.snapshot()) {
            Ok(cfg) => cfg,
            Err(_) => {
                return self
                    .error(session, sid, "Could not update server, invalid SID.")
                    .await;
            }
        };
        self.reply(session, sid, "Updating server...").await;
        self.reply(session, sid, DOWNLOAD_NOTICE).await;

        let spec = spec.unwrap_or(VersionSpec::Latest(current.channel));
        let (version, channel, pinned) = match self.resolve_version(spec, current.channel).await {
            Ok(v) => v,
            Err(e) => return self.error(session, sid, e).await,
        };
        if let Err(e) = self.installer.ensure_binary(&version).await {
            return self.error(session, sid, e.to_string()).await;
        }
        if let Err(e) = self
            .registry
            .set_server_version(sid, &version, channel, pinned)
        {
            return self.error(session, sid, e.to_string()).await;
        }
        info!(server_id = sid, version = %version, "Server updated");
        self.save(session, sid).await;

        self.reply(session, sid, format!("Server updated to {}", version))
            .await;
        if self.registry.supervisor(sid).is_ok_and(|s| s.is_up()) {
            self.reply(session, sid, "The new version is used from the next restart.")
                .await;
        }
    }

    async fn rename_server(&self, session: SessionId, sid: i64, name: &str) {
        if !is_valid_server_name(name) {
            return self.error(session, sid, INVALID_NAME).await;
        }
        let old = match self.registry.rename_server(sid, name) {
            Ok(old) => old,
            Err(_) => {
                return self
                    .error(session, sid, "Could not rename server, invalid SID.")
                    .await;
            }
        };
        self.save(session, sid).await;

        let from = self.settings.server_data_dir(&old, sid);
        let to = self.settings.server_data_dir(name, sid);
        if tokio::fs::try_exists(&from).await.unwrap_or(false)
            && let Err(e) = tokio::fs::rename(&from, &to).await
        {
            warn!(server_id = sid, error = %e, "Failed to move server data directory");
            self.error(
                session,
                sid,
                format!("Could not move server config directory: {}", e),
            )
            .await;
        }

        self.sessions.broadcast(LogRecord::init(sid, name)).await;
        self.reply(session, sid, "Server renamed.").await;
    }

    async fn create_user(&self, session: SessionId, sid: i64, name: &str) {
        match self.registry.create_user(name) {
            Ok(token) => {
                self.save(session, sid).await;
                self.reply(session, sid, format!("New user created! Token: {}", token))
                    .await;
            }
            Err(e) => self.error(session, sid, e.to_string()).await,
        }
    }

    async fn delete_user(&self, session: SessionId, sid: i64, name: &str) {
        match self.registry.delete_user(name) {
            Ok(()) => {
                self.save(session, sid).await;
                self.reply(session, sid, "User deleted.").await;
            }
            Err(MonitorError::UserNotFound { .. }) => {
                self.error(session, sid, "Could not delete user, user not found.")
                    .await
            }
            Err(e) => self.error(session, sid, e.to_string()).await,
        }
    }

    async fn grant(&self, session: SessionId, sid: i64, name: &str, target: GrantTarget, allow: bool) {
        let grant = match target {
            GrantTarget::Admin => Grant::Admin,
            GrantTarget::Server(id) => Grant::Server(id),
            GrantTarget::Addressed => Grant::Server(sid),
        };
        let (verb, done) = if allow {
            ("authorize", "User authorized.")
        } else {
            ("deauthorize", "User deauthorized.")
        };
        let result = if allow {
            self.registry.authorize(name, grant)
        } else {
            self.registry.deauthorize(name, grant)
        };
        match result {
            Ok(()) => {
                self.save(session, sid).await;
                self.reply(session, sid, done).await;
            }
            Err(MonitorError::UserNotFound { .. }) => {
                self.error(session, sid, format!("Could not {}, user not found.", verb))
                    .await
            }
            Err(MonitorError::InvalidServer { .. }) => {
                self.error(session, sid, format!("Could not {}, invalid SID.", verb))
                    .await
            }
            Err(e) => self.error(session, sid, e.to_string()).await,
        }
    }

    async fn list_users(&self, session: SessionId, sid: i64) {
        let users = match self.registry.users() {
            Ok(users) => users,
            Err(e) => return self.error(session, sid, e.to_string()).await,
        };
        if users.is_empty() {
            return self.reply(session, sid, "No users.").await;
        }
        for user in users {
            let line = if user.is_admin {
                format!("{}: admin", user.name)
            } else if user.servers.is_empty() {
                format!("{}: no servers", user.name)
            } else {
                let ids: Vec<String> = user.servers.iter().map(|id| id.to_string()).collect();
                format!("{}: servers {}", user.name, ids.join(", "))
            };
            self.reply(session, sid, line).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::installer::tests::FakeSource;
    use crate::monitor::models::{ERROR_CLASS, INIT_CLASS, MONITOR_CLASS};
    use crate::monitor::store::StateStore;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        dir: TempDir,
        registry: Arc<Registry>,
        sessions: Arc<Sessions>,
        dispatcher: Dispatcher,
        shutdown: watch::Receiver<bool>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut settings = Settings::default();
            settings.base_dir = dir.path().to_path_buf();
            settings.launch.program = "sh".into();
            settings.launch.args = vec!["-c".into(), "cat".into()];
            settings.launch.stop_command = String::new();
            let settings = Arc::new(settings);

            let registry = Arc::new(Registry::new());
            let source = FakeSource::new()
                .with_release("1.0.0", Channel::Stable)
                .with_release("1.1.0-rc.1", Channel::Unstable);
            let installer = Arc::new(Installer::new(
                registry.clone(),
                Arc::new(source),
                settings.binaries_dir(),
            ));
            let sessions = Arc::new(Sessions::new(registry.clone()));
            let (shutdown_tx, shutdown) = watch::channel(false);
            let dispatcher = Dispatcher::new(
                registry.clone(),
                sessions.clone(),
                installer,
                settings,
                shutdown_tx,
            );
            Self {
                dir,
                registry,
                sessions,
                dispatcher,
                shutdown,
            }
        }

        async fn connect(&self, token: Option<&str>) -> (SessionId, mpsc::Receiver<LogRecord>) {
            let (tx, rx) = mpsc::channel(256);
            let id = self.sessions.register(token.map(String::from), tx).await;
            (id, rx)
        }

        async fn send(&self, session: SessionId, sid: i64, token: &str, command: &str) {
            let msg = OperatorMessage {
                server_id: sid,
                token: token.into(),
                command: command.into(),
            };
            self.dispatcher.handle(session, msg).await;
        }
    }

    fn drain(rx: &mut mpsc::Receiver<LogRecord>) -> Vec<LogRecord> {
        let mut out = Vec::new();
        while let Ok(record) = rx.try_recv() {
            out.push(record);
        }
        out
    }

    fn messages(records: &[LogRecord]) -> Vec<&str> {
        records.iter().map(|r| r.message.as_str()).collect()
    }

    #[tokio::test]
    async fn test_server_create_reply_sequence() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;

        h.send(session, 0, "anything", ":server create \"Home\" stable").await;

        let records = drain(&mut rx);
        assert_eq!(
            messages(&records),
            vec![
                "Installing server...",
                DOWNLOAD_NOTICE,
                "Server installed.",
                "Home",
                "Use :recover to start server.",
            ]
        );
        assert_eq!(records[3].class, INIT_CLASS);
        assert_eq!(records[3].server_id, 1);
        assert_eq!(records[4].class, MONITOR_CLASS);
        assert_eq!(records[4].server_id, 1);

        let cfg = h.registry.server(1).unwrap().snapshot().unwrap();
        assert_eq!(cfg.name, "Home");
        assert_eq!(cfg.version, "1.0.0");
        assert!(!cfg.pinned);

        let saved = StateStore::new(h.dir.path().join("Monitor/state.json"))
            .load()
            .unwrap();
        assert_eq!(saved.servers[&1].name, "Home");
    }

    #[tokio::test]
    async fn test_server_create_pinned_and_unknown_version() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;

        h.send(session, 0, "", ":server create Old 1.0.0").await;
        let cfg = h.registry.server(1).unwrap().snapshot().unwrap();
        assert!(cfg.pinned);
        drain(&mut rx);

        h.send(session, 0, "", ":server create Bad 0.0.1").await;
        let records = drain(&mut rx);
        let last = records.last().unwrap();
        assert_eq!(last.class, ERROR_CLASS);
        assert!(last.message.contains("0.0.1"));
        assert_eq!(h.registry.servers().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_kill_server_when_not_up() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;
        h.send(session, 0, "", ":server create Home").await;
        drain(&mut rx);

        h.send(session, 1, "", ":kill server").await;
        let records = drain(&mut rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].class, ERROR_CLASS);
        assert_eq!(records[0].message, "Could not kill server, server not up.");
        assert_eq!(
            h.registry.supervisor(1).unwrap().state(),
            SupervisorState::AwaitingManualRecovery
        );
    }

    #[tokio::test]
    async fn test_invalid_sid_replies() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;

        h.send(session, 7, "", ":recover").await;
        h.send(session, 7, "", ":kill server").await;
        h.send(session, 7, "", ":server update").await;
        h.send(session, 7, "", "say hello").await;

        assert_eq!(
            messages(&drain(&mut rx)),
            vec![
                "Could not recover server, invalid SID.",
                "Could not kill server, invalid SID.",
                "Could not update server, invalid SID.",
                "Could not send command, invalid SID.",
            ]
        );
    }

    #[tokio::test]
    async fn test_raw_command_to_stopped_server() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;
        h.send(session, 0, "", ":server create Home").await;
        drain(&mut rx);

        h.send(session, 1, "", "/time set day").await;
        let records = drain(&mut rx);
        assert_eq!(messages(&records), vec![NOT_RUNNING_MESSAGE]);
    }

    #[tokio::test]
    async fn test_usage_and_unknown_directives() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;

        h.send(session, 0, "", ":server").await;
        let records = drain(&mut rx);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.message.starts_with(":server")));

        h.send(session, 0, "", ":teleport home").await;
        let records = drain(&mut rx);
        assert_eq!(records[0].class, ERROR_CLASS);
        assert!(records[0].message.contains(":teleport"));

        h.send(session, 0, "", ":help").await;
        assert_eq!(drain(&mut rx).len(), all_usage().count());
    }

    #[tokio::test]
    async fn test_user_lifecycle_ends_bootstrap() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;

        h.send(session, 0, "whatever", ":user create alice").await;
        let records = drain(&mut rx);
        let token = records[0]
            .message
            .strip_prefix("New user created! Token: ")
            .unwrap()
            .to_string();

        // Bootstrap is over: an unknown token is rejected.
        h.send(session, 0, "whatever", ":help").await;
        assert_eq!(messages(&drain(&mut rx)), vec![INVALID_TOKEN]);

        h.send(session, 0, &token, ":user create bob").await;
        h.send(session, 0, &token, ":user create bob").await;
        let records = drain(&mut rx);
        assert!(records[0].message.starts_with("New user created!"));
        assert_eq!(records[1].message, "A user with that name already exists.");
        assert_eq!(records[1].class, ERROR_CLASS);

        h.send(session, 0, &token, ":user list").await;
        assert_eq!(
            messages(&drain(&mut rx)),
            vec!["alice: admin", "bob: no servers"]
        );

        h.send(session, 0, &token, ":user delete carol").await;
        h.send(session, 0, &token, ":user delete bob").await;
        assert_eq!(
            messages(&drain(&mut rx)),
            vec!["Could not delete user, user not found.", "User deleted."]
        );
    }

    #[tokio::test]
    async fn test_authorization_is_enforced() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;
        h.send(session, 0, "", ":server create Home").await;
        h.send(session, 0, "", ":user create alice").await;
        let records = drain(&mut rx);
        let admin = records
            .last()
            .unwrap()
            .message
            .strip_prefix("New user created! Token: ")
            .unwrap()
            .to_string();
        h.send(session, 0, &admin, ":user create bob").await;
        let bob = drain(&mut rx)[0]
            .message
            .strip_prefix("New user created! Token: ")
            .unwrap()
            .to_string();

        h.send(session, 1, &bob, ":status").await;
        h.send(session, 0, &bob, ":kill monitor").await;
        h.send(session, 0, &bob, ":user list").await;
        assert_eq!(
            messages(&drain(&mut rx)),
            vec![
                NOT_AUTHORIZED,
                "Exiting the monitor is an admin only action.",
                "Managing users is an admin only action.",
            ]
        );

        h.send(session, 1, &admin, ":user authorize bob").await;
        h.send(session, 1, &admin, ":user authorize nobody").await;
        h.send(session, 0, &admin, ":user authorize bob 9").await;
        assert_eq!(
            messages(&drain(&mut rx)),
            vec![
                "User authorized.",
                "Could not authorize, user not found.",
                "Could not authorize, invalid SID.",
            ]
        );

        h.send(session, 1, &bob, ":status").await;
        let records = drain(&mut rx);
        assert_eq!(records.len(), 1);
        assert!(records[0].message.starts_with("#1 Home: version 1.0.0 (stable)"));
        assert!(records[0].message.ends_with("down"));

        h.send(session, 1, &admin, ":user deauthorize bob").await;
        h.send(session, 1, &bob, ":status").await;
        assert_eq!(
            messages(&drain(&mut rx)),
            vec!["User deauthorized.", NOT_AUTHORIZED]
        );
    }

    #[tokio::test]
    async fn test_update_switches_version() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;
        h.send(session, 0, "", ":server create Home").await;
        drain(&mut rx);

        h.send(session, 1, "", ":server update unstable").await;
        let records = drain(&mut rx);
        assert_eq!(records.last().unwrap().message, "Server updated to 1.1.0-rc.1");
        let cfg = h.registry.server(1).unwrap().snapshot().unwrap();
        assert_eq!(cfg.version, "1.1.0-rc.1");
        assert_eq!(cfg.channel, Channel::Unstable);
        assert!(!cfg.pinned);

        h.send(session, 1, "", ":server update 1.0.0").await;
        drain(&mut rx);
        let cfg = h.registry.server(1).unwrap().snapshot().unwrap();
        assert_eq!(cfg.version, "1.0.0");
        assert_eq!(cfg.channel, Channel::Unstable);
        assert!(cfg.pinned);

        h.send(session, 1, "", ":server update 3.0.0").await;
        let records = drain(&mut rx);
        assert_eq!(records.last().unwrap().class, ERROR_CLASS);
        assert_eq!(
            h.registry.server(1).unwrap().version().unwrap(),
            "1.0.0"
        );
    }

    #[tokio::test]
    async fn test_rename_moves_data_directory() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;
        h.send(session, 0, "", ":server create Home").await;
        drain(&mut rx);
        let old_dir = h.dir.path().join("GameData/Home 1");
        std::fs::create_dir_all(&old_dir).unwrap();
        std::fs::write(old_dir.join("world.vcdbs"), "data").unwrap();

        h.send(session, 1, "", ":server rename \"Big World\"").await;
        let records = drain(&mut rx);
        assert_eq!(messages(&records), vec!["Big World", "Server renamed."]);
        assert_eq!(records[0].class, INIT_CLASS);

        assert!(!old_dir.exists());
        assert!(h.dir.path().join("GameData/Big World 1/world.vcdbs").exists());
        assert_eq!(h.registry.server(1).unwrap().name().unwrap(), "Big World");
    }

    #[tokio::test]
    async fn test_rename_keeps_new_name_when_directory_move_fails() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;
        h.send(session, 0, "", ":server create Home").await;
        drain(&mut rx);
        let old_dir = h.dir.path().join("GameData/Home 1");
        std::fs::create_dir_all(&old_dir).unwrap();
        std::fs::write(old_dir.join("world.vcdbs"), "data").unwrap();
        let taken = h.dir.path().join("GameData/Away 1");
        std::fs::create_dir_all(&taken).unwrap();
        std::fs::write(taken.join("other.vcdbs"), "other").unwrap();

        h.send(session, 1, "", ":server rename Away").await;
        let records = drain(&mut rx);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].class, ERROR_CLASS);
        assert!(
            records[0]
                .message
                .starts_with("Could not move server config directory:")
        );
        assert_eq!(messages(&records[1..]), vec!["Away", "Server renamed."]);

        assert_eq!(h.registry.server(1).unwrap().name().unwrap(), "Away");
        assert!(old_dir.join("world.vcdbs").exists());
        assert!(taken.join("other.vcdbs").exists());
    }

    #[tokio::test]
    async fn test_server_names_cannot_leave_data_dir() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;

        h.send(session, 0, "", ":server create \"../../escape\"").await;
        let records = drain(&mut rx);
        assert_eq!(messages(&records), vec![INVALID_NAME]);
        assert_eq!(records[0].class, ERROR_CLASS);
        assert!(h.registry.servers().unwrap().is_empty());

        h.send(session, 0, "", ":server create Home").await;
        drain(&mut rx);
        h.send(session, 1, "", ":server rename \"a/b\"").await;
        assert_eq!(messages(&drain(&mut rx)), vec![INVALID_NAME]);
        assert_eq!(h.registry.server(1).unwrap().name().unwrap(), "Home");
    }

    #[tokio::test]
    async fn test_kill_monitor_signals_shutdown() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;

        h.send(session, 0, "", ":kill monitor").await;
        assert_eq!(messages(&drain(&mut rx)), vec!["Monitor shutting down."]);
        assert!(*h.shutdown.borrow());
        assert!(h.dir.path().join("Monitor/state.json").exists());
    }

    #[tokio::test]
    async fn test_recover_and_stop_running_server() {
        let h = Harness::new();
        let (session, mut rx) = h.connect(None).await;
        h.send(session, 0, "", ":server create Home").await;
        drain(&mut rx);

        let supervisor = h.registry.supervisor(1).unwrap();
        let mut state = supervisor.subscribe();
        h.send(session, 1, "", ":recover").await;
        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            state.wait_for(|s| *s == SupervisorState::Up),
        )
        .await
        .unwrap()
        .unwrap();

        h.send(session, 1, "", ":recover").await;
        let records = drain(&mut rx);
        assert!(messages(&records).contains(&"Could not recover server, server not down."));

        h.send(session, 1, "", ":stop").await;
        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            state.wait_for(|s| *s == SupervisorState::AwaitingManualRecovery),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(supervisor.is_alive());
    }
}
