//! Server binary acquisition.
//!
//! `Installer::ensure_binary` is the only way a version ends up on disk. The
//! registry's binary status is the source of truth: a version is marked
//! `Corrupted` the moment its directory is touched and `Ok` only after the
//! archive has been verified and fully extracted, so an interrupted install
//! is retried on the next start.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::archive;
use super::models::{BinaryStatus, Channel};
use super::registry::Registry;
use crate::config::ReleasesSection;
use crate::errors::{InstallError, MonitorError};

/// Download coordinates of one server build.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseEntry {
    pub version: String,
    pub channel: Channel,
    pub filename: String,
    /// Hex digest; empty when the catalog carries none
    pub sha256: String,
}

/// Where releases come from.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Newest version published on `channel`.
    async fn latest_version(&self, channel: Channel) -> Result<String, InstallError>;

    /// Find `version` in the release catalogs, stable first.
    async fn lookup(&self, version: &str) -> Result<ReleaseEntry, InstallError>;

    /// Fetch the release archive.
    async fn download(&self, entry: &ReleaseEntry) -> Result<Vec<u8>, InstallError>;
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    filename: String,
    #[serde(default)]
    sha256: String,
}

/// `{version: {"server": {...}, "client": {...}}}`
type Catalog = HashMap<String, HashMap<String, CatalogFile>>;

/// Release source backed by the public release API.
pub struct HttpReleaseSource {
    client: reqwest::Client,
    urls: ReleasesSection,
}

impl HttpReleaseSource {
    pub fn new(urls: ReleasesSection) -> Self {
        Self {
            client: reqwest::Client::new(),
            urls,
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, InstallError> {
        let fetch_err = |source| InstallError::Fetch {
            url: url.to_string(),
            source,
        };
        self.client
            .get(url)
            .send()
            .await
            .map_err(fetch_err)?
            .error_for_status()
            .map_err(fetch_err)
    }

    async fn catalog(&self, url: &str) -> Result<Catalog, InstallError> {
        self.get(url)
            .await?
            .json::<Catalog>()
            .await
            .map_err(|source| InstallError::Fetch {
                url: url.to_string(),
                source,
            })
    }
}

#[async_trait]
impl ReleaseSource for HttpReleaseSource {
    async fn latest_version(&self, channel: Channel) -> Result<String, InstallError> {
        let url = match channel {
            Channel::Stable => &self.urls.stable_latest_url,
            Channel::Unstable => &self.urls.unstable_latest_url,
        };
        let body = self
            .get(url)
            .await?
            .text()
            .await
            .map_err(|source| InstallError::Fetch {
                url: url.clone(),
                source,
            })?;
        let version = body.trim();
        if version.is_empty() {
            return Err(InstallError::EmptyVersion { url: url.clone() });
        }
        Ok(version.to_string())
    }

    async fn lookup(&self, version: &str) -> Result<ReleaseEntry, InstallError> {
        let mut fetch_error = None;
        for (channel, url) in [
            (Channel::Stable, &self.urls.stable_catalog_url),
            (Channel::Unstable, &self.urls.unstable_catalog_url),
        ] {
            let catalog = match self.catalog(url).await {
                Ok(catalog) => catalog,
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to fetch release catalog");
                    fetch_error.get_or_insert(e);
                    continue;
                }
            };
            if let Some(server) = catalog.get(version).and_then(|files| files.get("server")) {
                return Ok(ReleaseEntry {
                    version: version.to_string(),
                    channel,
                    filename: server.filename.clone(),
                    sha256: server.sha256.clone(),
                });
            }
        }
        Err(fetch_error.unwrap_or_else(|| InstallError::UnknownVersion {
            version: version.to_string(),
        }))
    }

    async fn download(&self, entry: &ReleaseEntry) -> Result<Vec<u8>, InstallError> {
        let url = format!(
            "{}/{}/{}",
            self.urls.download_base.trim_end_matches('/'),
            entry.channel,
            entry.filename
        );
        info!(version = %entry.version, url = %url, "Downloading server release");
        let bytes = self
            .get(&url)
            .await?
            .bytes()
            .await
            .map_err(|source| InstallError::Fetch {
                url: url.clone(),
                source,
            })?;
        Ok(bytes.to_vec())
    }
}

/// Installs server versions into `<binaries_dir>/<version>`.
pub struct Installer {
    registry: Arc<Registry>,
    source: Arc<dyn ReleaseSource>,
    binaries_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Installer {
    pub fn new(registry: Arc<Registry>, source: Arc<dyn ReleaseSource>, binaries_dir: PathBuf) -> Self {
        Self {
            registry,
            source,
            binaries_dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn latest_version(&self, channel: Channel) -> Result<String, InstallError> {
        self.source.latest_version(channel).await
    }

    fn version_lock(&self, version: &str) -> Result<Arc<tokio::sync::Mutex<()>>, InstallError> {
        let mut locks = self.locks.lock().map_err(|_| MonitorError::LockPoisoned)?;
        Ok(locks.entry(version.to_string()).or_default().clone())
    }

    /// Make sure `version` is installed. Returns immediately, without any
    /// I/O, when it already is. Concurrent calls for the same version are
    /// serialized; different versions install in parallel.
    pub async fn ensure_binary(&self, version: &str) -> Result<(), InstallError> {
        if self.registry.binary_status(version)? == BinaryStatus::Ok {
            return Ok(());
        }

        let lock = self.version_lock(version)?;
        let _guard = lock.lock().await;
        if self.registry.binary_status(version)? == BinaryStatus::Ok {
            return Ok(());
        }

        let entry = self.source.lookup(version).await?;
        let dir = self.binaries_dir.join(version);

        self.registry
            .set_binary_status(version, BinaryStatus::Corrupted)?;
        clear_dir(&dir).await?;

        let bytes = self.source.download(&entry).await?;
        verify_checksum(&entry, &bytes)?;

        let target = dir.clone();
        tokio::task::spawn_blocking(move || archive::extract_tar_gz(bytes.as_slice(), &target))
            .await
            .map_err(|e| InstallError::Extract {
                path: dir.clone(),
                source: std::io::Error::other(e),
            })??;

        self.registry.set_binary_status(version, BinaryStatus::Ok)?;
        info!(version, dir = %dir.display(), "Server release installed");
        Ok(())
    }
}

async fn clear_dir(dir: &std::path::Path) -> Result<(), InstallError> {
    let extract_err = |source| InstallError::Extract {
        path: dir.to_path_buf(),
        source,
    };
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(extract_err(e)),
    }
    tokio::fs::create_dir_all(dir).await.map_err(extract_err)
}

fn verify_checksum(entry: &ReleaseEntry, bytes: &[u8]) -> Result<(), InstallError> {
    if entry.sha256.is_empty() {
        warn!(version = %entry.version, "Release catalog has no checksum, skipping verification");
        return Ok(());
    }
    let actual = format!("{:x}", Sha256::digest(bytes));
    if !actual.eq_ignore_ascii_case(&entry.sha256) {
        return Err(InstallError::ChecksumMismatch {
            version: entry.version.clone(),
            expected: entry.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::monitor::archive::tests::tar_gz;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// In-memory release source serving one archive per known version.
    pub(crate) struct FakeSource {
        pub releases: HashMap<String, (Channel, Vec<u8>, String)>,
        pub latest: HashMap<Channel, String>,
        pub lookups: AtomicUsize,
        pub downloads: AtomicUsize,
    }

    impl FakeSource {
        pub fn new() -> Self {
            Self {
                releases: HashMap::new(),
                latest: HashMap::new(),
                lookups: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
            }
        }

        /// Publish `version` with a valid archive containing the server binary.
        pub fn with_release(mut self, version: &str, channel: Channel) -> Self {
            let archive = tar_gz(&[("VintagestoryServer.exe", Some(b"MZ".as_slice()))]);
            let digest = format!("{:x}", Sha256::digest(&archive));
            self.releases
                .insert(version.to_string(), (channel, archive, digest));
            self.latest.insert(channel, version.to_string());
            self
        }
    }

    #[async_trait]
    impl ReleaseSource for FakeSource {
        async fn latest_version(&self, channel: Channel) -> Result<String, InstallError> {
            self.latest
                .get(&channel)
                .cloned()
                .ok_or_else(|| InstallError::EmptyVersion {
                    url: channel.to_string(),
                })
        }

        async fn lookup(&self, version: &str) -> Result<ReleaseEntry, InstallError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let (channel, _, sha256) =
                self.releases
                    .get(version)
                    .ok_or_else(|| InstallError::UnknownVersion {
                        version: version.to_string(),
                    })?;
            Ok(ReleaseEntry {
                version: version.to_string(),
                channel: *channel,
                filename: format!("vs_server_{}.tar.gz", version),
                sha256: sha256.clone(),
            })
        }

        async fn download(&self, entry: &ReleaseEntry) -> Result<Vec<u8>, InstallError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(self.releases[&entry.version].1.clone())
        }
    }

    fn installer(source: Arc<FakeSource>, dir: &TempDir) -> (Installer, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let installer = Installer::new(registry.clone(), source, dir.path().join("Binaries"));
        (installer, registry)
    }

    #[tokio::test]
    async fn test_ensure_binary_installs_and_marks_ok() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new().with_release("1.19.8", Channel::Stable));
        let (installer, registry) = installer(source.clone(), &dir);

        installer.ensure_binary("1.19.8").await.unwrap();

        assert_eq!(registry.binary_status("1.19.8").unwrap(), BinaryStatus::Ok);
        assert!(
            dir.path()
                .join("Binaries/1.19.8/VintagestoryServer.exe")
                .is_file()
        );
    }

    #[tokio::test]
    async fn test_ensure_binary_second_call_does_no_io() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new().with_release("1.19.8", Channel::Stable));
        let (installer, _registry) = installer(source.clone(), &dir);

        installer.ensure_binary("1.19.8").await.unwrap();
        installer.ensure_binary("1.19.8").await.unwrap();

        assert_eq!(source.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_version_leaves_status_untouched() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new());
        let (installer, registry) = installer(source, &dir);

        let err = installer.ensure_binary("0.0.1").await.unwrap_err();
        assert!(matches!(err, InstallError::UnknownVersion { .. }));
        assert_eq!(
            registry.binary_status("0.0.1").unwrap(),
            BinaryStatus::NotInstalled
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_version_corrupted() {
        let dir = TempDir::new().unwrap();
        let mut source = FakeSource::new().with_release("1.19.8", Channel::Stable);
        source.releases.get_mut("1.19.8").unwrap().2 = "00".repeat(32);
        let (installer, registry) = installer(Arc::new(source), &dir);

        let err = installer.ensure_binary("1.19.8").await.unwrap_err();
        assert!(matches!(err, InstallError::ChecksumMismatch { .. }));
        assert_eq!(
            registry.binary_status("1.19.8").unwrap(),
            BinaryStatus::Corrupted
        );
    }

    #[tokio::test]
    async fn test_corrupted_version_is_reinstalled_from_scratch() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new().with_release("1.19.8", Channel::Stable));
        let (installer, registry) = installer(source.clone(), &dir);

        let stale = dir.path().join("Binaries/1.19.8/leftover.dll");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"half").unwrap();
        registry
            .set_binary_status("1.19.8", BinaryStatus::Corrupted)
            .unwrap();

        installer.ensure_binary("1.19.8").await.unwrap();
        assert!(!stale.exists());
        assert_eq!(registry.binary_status("1.19.8").unwrap(), BinaryStatus::Ok);
    }

    #[tokio::test]
    async fn test_concurrent_installs_of_one_version_download_once() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new().with_release("1.19.8", Channel::Stable));
        let (installer, _registry) = installer(source.clone(), &dir);
        let installer = Arc::new(installer);

        let a = tokio::spawn({
            let installer = installer.clone();
            async move { installer.ensure_binary("1.19.8").await }
        });
        let b = tokio::spawn({
            let installer = installer.clone();
            async move { installer.ensure_binary("1.19.8").await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_verify_checksum_is_case_insensitive() {
        let bytes = b"release";
        let entry = ReleaseEntry {
            version: "1.0".into(),
            channel: Channel::Stable,
            filename: "f.tar.gz".into(),
            sha256: format!("{:X}", Sha256::digest(bytes)),
        };
        verify_checksum(&entry, bytes).unwrap();
    }

    #[test]
    fn test_catalog_format_parses() {
        let catalog: Catalog = serde_json::from_str(
            r#"{
                "1.19.8": {
                    "server": {"filename": "vs_server_1.19.8.tar.gz", "sha256": "ab"},
                    "client": {"filename": "vs_install_1.19.8.exe"}
                }
            }"#,
        )
        .unwrap();
        let server = &catalog["1.19.8"]["server"];
        assert_eq!(server.filename, "vs_server_1.19.8.tar.gz");
        assert_eq!(server.sha256, "ab");
        assert!(catalog["1.19.8"]["client"].sha256.is_empty());
    }
}
