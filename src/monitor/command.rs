//! The operator command language.
//!
//! Directives start with `:` and are split by [`tokenize`]:
//!
//! ```text
//! :server create "My World" unstable
//! => ["server", "create", "My World", "unstable"]
//! ```

use super::models::Channel;

pub const HELP_USAGE: &[&str] = &[":help"];
pub const RECOVER_USAGE: &[&str] = &[":recover"];
pub const STOP_USAGE: &[&str] = &[":stop"];
pub const STATUS_USAGE: &[&str] = &[":status"];
pub const SERVER_USAGE: &[&str] = &[
    ":server create \"<name>\" [stable|unstable|<x.x.x.x>]",
    ":server update [stable|unstable|<x.x.x.x>]",
    ":server rename \"<name>\"",
];
pub const KILL_USAGE: &[&str] = &[":kill (monitor|server)"];
pub const USER_USAGE: &[&str] = &[
    ":user (create|delete) \"<name>\"",
    ":user (authorize|deauthorize) \"<name>\" [<sid>|admin]",
    ":user list",
];

/// Every usage line, in `:help` order.
pub fn all_usage() -> impl Iterator<Item = &'static str> {
    [
        HELP_USAGE,
        RECOVER_USAGE,
        STOP_USAGE,
        STATUS_USAGE,
        SERVER_USAGE,
        KILL_USAGE,
        USER_USAGE,
    ]
    .into_iter()
    .flatten()
    .copied()
}

/// Split a directive into tokens.
///
/// Outside quotes, runs of spaces and tabs separate tokens. A double-quoted
/// segment is one token with its whitespace kept and the quotes removed;
/// `""` is an empty token. An unterminated quote runs to the end of input.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut buf = String::new();
    let mut quoted = false;

    for c in input.chars() {
        if quoted {
            if c == '"' {
                tokens.push(std::mem::take(&mut buf));
                quoted = false;
            } else {
                buf.push(c);
            }
            continue;
        }
        match c {
            '"' => {
                if !buf.is_empty() {
                    tokens.push(std::mem::take(&mut buf));
                }
                quoted = true;
            }
            ' ' | '\t' => {
                if !buf.is_empty() {
                    tokens.push(std::mem::take(&mut buf));
                }
            }
            _ => buf.push(c),
        }
    }
    if quoted || !buf.is_empty() {
        tokens.push(buf);
    }
    tokens
}

/// Which build a server should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    /// Track the newest release of a channel
    Latest(Channel),
    /// One exact version
    Pinned(String),
}

impl VersionSpec {
    pub fn parse(s: &str) -> Self {
        match s.parse::<Channel>() {
            Ok(channel) => Self::Latest(channel),
            Err(_) => Self::Pinned(s.to_string()),
        }
    }
}

/// The permission named by `:user authorize|deauthorize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantTarget {
    Admin,
    Server(i64),
    /// The server the message was addressed to
    Addressed,
}

/// A parsed directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Help,
    Recover,
    Stop,
    Status,
    ServerCreate { name: String, version: VersionSpec },
    ServerUpdate { version: Option<VersionSpec> },
    ServerRename { name: String },
    KillMonitor,
    KillServer,
    UserCreate { name: String },
    UserDelete { name: String },
    UserAuthorize { name: String, target: GrantTarget },
    UserDeauthorize { name: String, target: GrantTarget },
    UserList,
}

/// Why a directive could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Wrong arguments; reply with these usage lines
    Usage(&'static [&'static str]),
    /// First token is not a directive
    Unknown(String),
    /// A grant named a server id that is not a number
    InvalidServerId { deauthorize: bool },
}

/// Operator-facing refusal if the directive needs an admin.
pub fn admin_only(tokens: &[String]) -> Option<&'static str> {
    let first = tokens.first().map(String::as_str);
    let second = tokens.get(1).map(String::as_str);
    match (first, second) {
        (Some("user"), _) => Some("Managing users is an admin only action."),
        (Some("kill"), Some("monitor")) => Some("Exiting the monitor is an admin only action."),
        (Some("server"), Some("create")) => Some("Creating servers is an admin only action."),
        _ => None,
    }
}

impl Directive {
    pub fn parse(tokens: &[String]) -> Result<Self, ParseError> {
        let args: Vec<&str> = tokens.iter().map(String::as_str).collect();
        match args.as_slice() {
            [] => Err(ParseError::Usage(HELP_USAGE)),
            ["help", ..] => Ok(Self::Help),
            ["recover", ..] => Ok(Self::Recover),
            ["stop", ..] => Ok(Self::Stop),
            ["status", ..] => Ok(Self::Status),
            ["server", rest @ ..] => parse_server(rest),
            ["kill", "monitor", ..] => Ok(Self::KillMonitor),
            ["kill", "server", ..] => Ok(Self::KillServer),
            ["kill", ..] => Err(ParseError::Usage(KILL_USAGE)),
            ["user", rest @ ..] => parse_user(rest),
            [other, ..] => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

fn parse_server(args: &[&str]) -> Result<Directive, ParseError> {
    match args {
        ["create", name] => Ok(Directive::ServerCreate {
            name: name.to_string(),
            version: VersionSpec::Latest(Channel::Stable),
        }),
        ["create", name, version, ..] => Ok(Directive::ServerCreate {
            name: name.to_string(),
            version: VersionSpec::parse(version),
        }),
        ["update"] => Ok(Directive::ServerUpdate { version: None }),
        ["update", version, ..] => Ok(Directive::ServerUpdate {
            version: Some(VersionSpec::parse(version)),
        }),
        ["rename", name, ..] => Ok(Directive::ServerRename {
            name: name.to_string(),
        }),
        // `delete` is not supported: halted servers cannot be cleaned up safely yet.
        _ => Err(ParseError::Usage(SERVER_USAGE)),
    }
}

fn parse_user(args: &[&str]) -> Result<Directive, ParseError> {
    match args {
        ["list", ..] => Ok(Directive::UserList),
        ["create", name, ..] => Ok(Directive::UserCreate {
            name: name.to_string(),
        }),
        ["delete", name, ..] => Ok(Directive::UserDelete {
            name: name.to_string(),
        }),
        [action @ ("authorize" | "deauthorize"), name, rest @ ..] => {
            let deauthorize = *action == "deauthorize";
            let target = match rest.first() {
                None => GrantTarget::Addressed,
                Some(&"admin") => GrantTarget::Admin,
                Some(id) => GrantTarget::Server(
                    id.parse()
                        .map_err(|_| ParseError::InvalidServerId { deauthorize })?,
                ),
            };
            let name = name.to_string();
            Ok(if deauthorize {
                Directive::UserDeauthorize { name, target }
            } else {
                Directive::UserAuthorize { name, target }
            })
        }
        _ => Err(ParseError::Usage(USER_USAGE)),
    }
}
