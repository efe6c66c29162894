//! The `current` link pointing at the active version.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ClassifiedError;
use crate::paths::Layout;
use crate::store::VersionStore;
use tvm_schema::ToolchainVersion;

/// Where `link` points, or `None` when it does not exist or is not a link.
pub fn read_link_target(link: &Path) -> Option<PathBuf> {
    std::fs::read_link(link).ok()
}

/// Remove the link itself, never its target. Missing links are fine.
pub fn remove_link(link: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            #[cfg(windows)]
            if std::fs::remove_dir(link).is_ok() {
                return Ok(());
            }
            std::fs::remove_file(link)
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a symlink", link.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn make_link(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_link(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Point `link` at `target`, replacing an existing link.
///
/// On Unix the new link is created beside the old one and renamed over it.
pub fn point_link(link: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if cfg!(unix) {
        let mut tmp_name = link.as_os_str().to_owned();
        tmp_name.push(format!(".tmp-{}", std::process::id()));
        let tmp = PathBuf::from(tmp_name);
        remove_link(&tmp)?;
        make_link(target, &tmp)?;
        if let Err(e) = std::fs::rename(&tmp, link) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
    } else {
        remove_link(link)?;
        make_link(target, link)?;
    }
    debug!(link = %link.display(), target = %target.display(), "Updated link");
    Ok(())
}

/// Make an installed version the active one: repoint `current` and flip the
/// active flag. Returns the previous link target.
pub fn switch_version(
    layout: &Layout,
    store: &dyn VersionStore,
    version: &ToolchainVersion,
) -> Result<Option<PathBuf>, ClassifiedError> {
    let record = store
        .get(version)?
        .ok_or_else(|| crate::store::StoreError::NotInstalled(version.clone()))?;
    if !record.path.is_dir() {
        return Err(ClassifiedError::new(
            crate::error::ErrorKind::FileSystem,
            format!("Installation directory {} is missing", record.path.display()),
        )
        .with_context("version", version));
    }

    let link = layout.current_link();
    let previous = read_link_target(&link);
    point_link(&link, &record.path)?;
    if let Err(e) = store.set_active(version) {
        // Keep the link and the records consistent.
        match &previous {
            Some(prev) => point_link(&link, prev)?,
            None => remove_link(&link)?,
        }
        return Err(e.into());
    }
    Ok(previous)
}
