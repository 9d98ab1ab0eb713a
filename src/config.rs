//! Monitor settings loaded from `warden.toml`.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration for a local Vintage Story install:
//!
//! ```toml
//! [server]
//! host = "localhost"
//! port = 2660
//! ui_dir = "ui"
//!
//! [paths]
//! binaries_dir = "Binaries"
//! data_dir = "GameData"
//! state_file = "Monitor/state.json"
//!
//! [launch]
//! program = "mono"
//! args = ["{binary}", "--dataPath", "{data_dir}"]
//! binary_name = "VintagestoryServer.exe"
//! stop_command = "/stop"
//! stop_timeout_secs = 15
//!
//! [releases]
//! stable_latest_url = "http://api.vintagestory.at/lateststable.txt"
//! unstable_latest_url = "http://api.vintagestory.at/latestunstable.txt"
//! stable_catalog_url = "http://api.vintagestory.at/stable.json"
//! unstable_catalog_url = "http://api.vintagestory.at/unstable.json"
//! download_base = "https://account.vintagestory.at/files"
//! ```
//!
//! Relative paths resolve against the directory holding the settings file.
//! `WARDEN_HOST` and `WARDEN_PORT` override the `[server]` section.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default settings file name.
pub const CONFIG_FILE_NAME: &str = "warden.toml";

/// Placeholder expanded to the server binary path in launch arguments.
pub const BINARY_PLACEHOLDER: &str = "{binary}";

/// Placeholder expanded to the per-server data directory in launch arguments.
pub const DATA_DIR_PLACEHOLDER: &str = "{data_dir}";

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// "localhost" binds the loopback interface only
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory of static UI files served on every non-socket path
    #[serde(default)]
    pub ui_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    2660
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ui_dir: None,
        }
    }
}

/// On-disk layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_binaries_dir")]
    pub binaries_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_binaries_dir() -> PathBuf {
    PathBuf::from("Binaries")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("GameData")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("Monitor/state.json")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            binaries_dir: default_binaries_dir(),
            data_dir: default_data_dir(),
            state_file: default_state_file(),
        }
    }
}

/// How a supervised server process is started and stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSection {
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments; `{binary}` and `{data_dir}` are expanded per server
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_binary_name")]
    pub binary_name: String,
    /// Line written to the server's stdin to request a graceful shutdown.
    /// Empty means kills are immediate.
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_program() -> String {
    if cfg!(windows) {
        BINARY_PLACEHOLDER.to_string()
    } else {
        "mono".to_string()
    }
}

fn default_args() -> Vec<String> {
    let mut args = Vec::new();
    if !cfg!(windows) {
        args.push(BINARY_PLACEHOLDER.to_string());
    }
    args.push("--dataPath".to_string());
    args.push(DATA_DIR_PLACEHOLDER.to_string());
    args
}

fn default_binary_name() -> String {
    "VintagestoryServer.exe".to_string()
}

fn default_stop_command() -> String {
    "/stop".to_string()
}

fn default_stop_timeout_secs() -> u64 {
    15
}

impl Default for LaunchSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            binary_name: default_binary_name(),
            stop_command: default_stop_command(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

/// Release endpoints used to resolve and download server builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasesSection {
    #[serde(default = "default_stable_latest_url")]
    pub stable_latest_url: String,
    #[serde(default = "default_unstable_latest_url")]
    pub unstable_latest_url: String,
    #[serde(default = "default_stable_catalog_url")]
    pub stable_catalog_url: String,
    #[serde(default = "default_unstable_catalog_url")]
    pub unstable_catalog_url: String,
    #[serde(default = "default_download_base")]
    pub download_base: String,
}

fn default_stable_latest_url() -> String {
    "http://api.vintagestory.at/lateststable.txt".to_string()
}

fn default_unstable_latest_url() -> String {
    "http://api.vintagestory.at/latestunstable.txt".to_string()
}

fn default_stable_catalog_url() -> String {
    "http://api.vintagestory.at/stable.json".to_string()
}

fn default_unstable_catalog_url() -> String {
    "http://api.vintagestory.at/unstable.json".to_string()
}

fn default_download_base() -> String {
    "https://account.vintagestory.at/files".to_string()
}

impl Default for ReleasesSection {
    fn default() -> Self {
        Self {
            stable_latest_url: default_stable_latest_url(),
            unstable_latest_url: default_unstable_latest_url(),
            stable_catalog_url: default_stable_catalog_url(),
            unstable_catalog_url: default_unstable_catalog_url(),
            download_base: default_download_base(),
        }
    }
}

/// Full contents of `warden.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub launch: LaunchSection,
    #[serde(default)]
    pub releases: ReleasesSection,
    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut settings = Self::parse(&content)?;
        settings.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(settings)
    }

    /// Parse settings from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse warden.toml")
    }

    /// Load settings from `path`, falling back to defaults rooted at the
    /// file's directory when it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self {
                base_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
                ..Self::default()
            })
        }
    }

    /// Save settings to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize warden.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn binaries_dir(&self) -> PathBuf {
        self.resolve(&self.paths.binaries_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.paths.data_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        self.resolve(&self.paths.state_file)
    }

    pub fn ui_dir(&self) -> Option<PathBuf> {
        self.server.ui_dir.as_deref().map(|dir| self.resolve(dir))
    }

    /// Listener host, with `WARDEN_HOST` taking precedence.
    pub fn host(&self) -> String {
        std::env::var("WARDEN_HOST").unwrap_or_else(|_| self.server.host.clone())
    }

    /// Listener port, with `WARDEN_PORT` taking precedence when it parses.
    pub fn port(&self) -> u16 {
        std::env::var("WARDEN_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.server.port)
    }

    /// Socket address to bind. "localhost" stays on loopback; any other
    /// host name listens on all interfaces.
    pub fn bind_addr(&self) -> String {
        bind_addr_for(&self.host(), self.port())
    }

    /// Directory an installed version is extracted into.
    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.binaries_dir().join(version)
    }

    /// Path of the server executable for `version`.
    pub fn server_binary(&self, version: &str) -> PathBuf {
        self.version_dir(version).join(&self.launch.binary_name)
    }

    /// Data directory of one server: `<data_dir>/<name> <id>`.
    pub fn server_data_dir(&self, name: &str, id: i64) -> PathBuf {
        self.data_dir().join(format!("{} {}", name, id))
    }

    /// Expand the launch program and arguments for one server start.
    pub fn launch_command(&self, binary: &Path, data_dir: &Path) -> (String, Vec<String>) {
        let expand = |arg: &str| {
            arg.replace(BINARY_PLACEHOLDER, &binary.to_string_lossy())
                .replace(DATA_DIR_PLACEHOLDER, &data_dir.to_string_lossy())
        };
        let program = expand(&self.launch.program);
        let args = self.launch.args.iter().map(|a| expand(a)).collect();
        (program, args)
    }

    /// Graceful stop line, if one is configured.
    pub fn stop_command(&self) -> Option<&str> {
        let cmd = self.launch.stop_command.trim();
        (!cmd.is_empty()).then_some(cmd)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.launch.stop_timeout_secs)
    }

    /// Validate the settings and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.launch.program.trim().is_empty() {
            warnings.push("launch.program is empty".to_string());
        }
        let mentions_binary = self.launch.program.contains(BINARY_PLACEHOLDER)
            || self
                .launch
                .args
                .iter()
                .any(|a| a.contains(BINARY_PLACEHOLDER));
        if !mentions_binary {
            warnings.push(format!(
                "launch.program/args never reference {}; installed binaries will not be used",
                BINARY_PLACEHOLDER
            ));
        }
        if self.server.port == 0 {
            warnings.push("server.port is 0; an ephemeral port will be chosen".to_string());
        }
        for (key, url) in [
            ("releases.stable_latest_url", &self.releases.stable_latest_url),
            ("releases.unstable_latest_url", &self.releases.unstable_latest_url),
            ("releases.stable_catalog_url", &self.releases.stable_catalog_url),
            ("releases.unstable_catalog_url", &self.releases.unstable_catalog_url),
            ("releases.download_base", &self.releases.download_base),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                warnings.push(format!("{} is not an http(s) URL: '{}'", key, url));
            }
        }

        warnings
    }
}

/// Whether `name` can be used as a server name. Names end up in the data
/// directory path, so they must stay inside a single path component.
pub fn is_valid_server_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains("..") && !name.contains(['/', '\\', '\0'])
}

fn bind_addr_for(host: &str, port: u16) -> String {
    if host == "localhost" {
        format!("127.0.0.1:{}", port)
    } else {
        format!("0.0.0.0:{}", port)
    }
}
