//! The game-server monitor.
//!
//! | Module       | Responsibility                                           |
//! |--------------|----------------------------------------------------------|
//! | `models`     | Server records, users, log records, wire messages        |
//! | `registry`   | Lock-protected servers, supervisors, tokens and binaries |
//! | `store`      | JSON state file load/dump                                |
//! | `installer`  | Release catalog lookup, download, checksum, extraction   |
//! | `archive`    | Safe gzip tarball extraction                             |
//! | `supervisor` | Per-server lifecycle, crash backoff, kill/recover        |
//! | `bridge`     | stdin/stdout relays and log forwarding                   |
//! | `logline`    | Server console line parsing                              |
//! | `sessions`   | Connected operators and filtered broadcast               |
//! | `command`    | Directive tokenizer and parser                           |
//! | `dispatcher` | Authenticates and executes operator messages             |
//! | `ws`         | WebSocket transport for operator sessions                |
//! | `server`     | HTTP router and monitor startup                          |

pub mod archive;
pub mod bridge;
pub mod command;
pub mod dispatcher;
pub mod installer;
pub mod logline;
pub mod models;
pub mod registry;
pub mod server;
pub mod sessions;
pub mod store;
pub mod supervisor;
pub mod ws;

pub use dispatcher::Dispatcher;
pub use registry::Registry;
pub use server::{build_router, start_server};
pub use supervisor::{Supervisor, SupervisorState};
