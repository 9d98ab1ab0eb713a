//! Gzip tarball extraction for server releases.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use crate::errors::InstallError;

/// Extract a `.tar.gz` image into `to`.
///
/// Only directories and regular files are accepted; anything else (links,
/// devices) aborts the extraction. Entries whose path would land outside
/// `to` are rejected.
pub fn extract_tar_gz<R: Read>(reader: R, to: &Path) -> Result<(), InstallError> {
    let extract_err = |source| InstallError::Extract {
        path: to.to_path_buf(),
        source,
    };

    let mut archive = Archive::new(GzDecoder::new(reader));
    for entry in archive.entries().map_err(extract_err)? {
        let mut entry = entry.map_err(extract_err)?;
        let raw_path = entry.path().map_err(extract_err)?.into_owned();
        let name = raw_path.display().to_string();

        match entry.header().entry_type() {
            EntryType::Directory => {
                let target = to.join(safe_relative(&raw_path, &name)?);
                std::fs::create_dir_all(&target).map_err(extract_err)?;
            }
            EntryType::Regular => {
                let target = to.join(safe_relative(&raw_path, &name)?);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(extract_err)?;
                }
                let mut file = std::fs::File::create(&target).map_err(extract_err)?;
                std::io::copy(&mut entry, &mut file).map_err(extract_err)?;
            }
            EntryType::XGlobalHeader => {}
            _ => return Err(InstallError::UnsupportedEntry { entry: name }),
        }
    }
    Ok(())
}

/// Strip `.` components and reject anything that could escape the target.
fn safe_relative(path: &Path, name: &str) -> Result<PathBuf, InstallError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(InstallError::UnsafeEntry {
                    entry: name.to_string(),
                });
            }
        }
    }
    Ok(out)
}
