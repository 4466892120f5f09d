//! Traversal driver (§4.6). Grounded on `original_source/backup.c`'s
//! `backupRecursive` (full scan) and `backupContaining`/`backupPath`
//! (single-path incremental walk).

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::{debug, warn};

use crate::config::Config;
use crate::engine::{self, Outcome};
use crate::error::Result;
use crate::watch::DirectoryWatcher;

/// Full recursive scan of the source, cross-checked against the destination
/// shadow tree for deletions (§4.6).
pub fn full_sync(config: &Config) -> Result<()> {
    full_sync_impl(config, None)
}

/// As `full_sync`, additionally seeding/refreshing `watches`'s bounded
/// directory-watch cache (§4.8) for every live directory encountered, so
/// the daemon's startup and periodic full syncs keep the watch set warm —
/// and re-establish any watches the cache had to evict under pressure —
/// exactly as §9's design notes describe the relationship between full
/// sync and the notification layer.
pub fn full_sync_observing(config: &Config, watches: &DirectoryWatcher) -> Result<()> {
    full_sync_impl(config, Some(watches))
}

fn full_sync_impl(config: &Config, watches: Option<&DirectoryWatcher>) -> Result<()> {
    let source_root = open_root(&config.source)?;
    let dest_root = open_root(&config.dest)?;
    let source_dev = fstat_dev(&source_root)?;

    if let Some(watches) = watches {
        watches.ensure_watch(&config.source);
    }

    full_sync_dir(config, &source_root, &dest_root, Path::new(""), source_dev, watches)
}

fn full_sync_dir(
    config: &Config,
    source_dir: &Dir,
    dest_dir: &Dir,
    rel_prefix: &Path,
    parent_dev: u64,
    watches: Option<&DirectoryWatcher>,
) -> Result<()> {
    // forward pass: process every live source child.
    for entry in iter_names(source_dir)? {
        let rel = rel_prefix.join(&entry);
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        if config.exclusions.excluded(&rel_str) {
            continue;
        }

        match engine::process(config, source_dir, dest_dir, &entry, &rel) {
            Ok(Outcome { descent: Some(descent), .. }) => {
                let child_dev = match fstat_dev(&nix::dir::Dir::openat(
                    source_dir.as_raw_fd(),
                    entry.as_str(),
                    OFlag::O_RDONLY | OFlag::O_DIRECTORY,
                    Mode::empty(),
                )) {
                    Ok(d) => d,
                    Err(_) => continue,
                };

                if is_mount_boundary(parent_dev, child_dev) {
                    debug!(path = %rel.display(), "mount boundary: not recursing");
                    continue;
                }

                let child_source = nix::dir::Dir::openat(
                    source_dir.as_raw_fd(),
                    entry.as_str(),
                    OFlag::O_RDONLY | OFlag::O_DIRECTORY,
                    Mode::empty(),
                )
                .map_err(|e| crate::error::Error::io(&rel, std::io::Error::from(e)))?;

                if let Some(watches) = watches {
                    watches.ensure_watch(&config.source.join(&rel));
                }

                full_sync_dir(config, &child_source, &descent, &rel, child_dev, watches)?;
            }
            Ok(Outcome { descent: None, .. }) => {}
            Err(e) => {
                warn!(path = %rel.display(), error = %e, "backup step failed, skipping");
            }
        }
    }

    // reverse pass: any destination marker with no live source sibling gets
    // one more `process` call, which will observe the nonexistent tuple and
    // write a tombstone revision.
    for marker_name in iter_marker_source_names(dest_dir)? {
        let rel = rel_prefix.join(&marker_name);
        let exists = nix::sys::stat::fstatat(
            source_dir.as_raw_fd(),
            marker_name.as_str(),
            nix::fcntl::AtFlags::AT_SYMLINK_NOFOLLOW,
        )
        .is_ok();

        if exists {
            continue;
        }

        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if config.exclusions.excluded(&rel_str) {
            continue;
        }

        if let Err(e) = engine::process(config, source_dir, dest_dir, &marker_name, &rel) {
            warn!(path = %rel.display(), error = %e, "tombstone backup step failed");
        }
    }

    Ok(())
}

/// `path_sync(absolute_path)` from §4.6: walk from the roots down to the
/// final component, invoking the engine synchronously at each intermediate
/// level; the final component is left to the caller (the scheduler's worker
/// pool), so slow diffs never block the event loop.
pub fn path_sync(config: &Config, absolute_path: &Path) -> Result<Option<(PathBuf, String)>> {
    let relative = match absolute_path.strip_prefix(&config.source) {
        Ok(r) => r,
        Err(_) => return Ok(None), // not under the source root; drop quietly.
    };

    let components: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    if components.is_empty() {
        return Ok(None);
    }

    let mut source_dir = open_root(&config.source)?;
    let mut dest_dir = open_root(&config.dest)?;
    let mut rel_prefix = PathBuf::new();

    for component in &components[..components.len() - 1] {
        let rel = rel_prefix.join(component);
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if config.exclusions.excluded(&rel_str) {
            return Ok(None);
        }

        let outcome = engine::process(config, &source_dir, &dest_dir, component, &rel)?;
        let descent = match outcome.descent {
            Some(d) => d,
            None => return Ok(None), // not a directory (or vanished); nothing further to walk.
        };

        let child_source = nix::dir::Dir::openat(
            source_dir.as_raw_fd(),
            component.as_str(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
        .map_err(|e| crate::error::Error::io(&rel, std::io::Error::from(e)))?;

        source_dir = child_source;
        dest_dir = descent;
        rel_prefix = rel;
    }

    let last = components.last().unwrap().clone();
    Ok(Some((rel_prefix, last)))
}

fn open_root(path: &Path) -> Result<Dir> {
    Dir::open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
        .map_err(|e| crate::error::Error::io(path, std::io::Error::from(e)))
}

fn fstat_dev(dir: &Dir) -> Result<u64> {
    let st = nix::sys::stat::fstat(dir.as_raw_fd())
        .map_err(|e| crate::error::Error::io("<dir>", std::io::Error::from(e)))?;
    Ok(st.st_dev as u64)
}

fn iter_names(dir: &Dir) -> Result<Vec<String>> {
    let mut dup = dir
        .try_clone()
        .map_err(|e| crate::error::Error::io("<dir>", std::io::Error::from(e)))?;
    let mut names = Vec::new();
    for entry in dup.iter() {
        let entry = entry.map_err(|e| crate::error::Error::io("<dir>", std::io::Error::from(e)))?;
        let name = entry.file_name();
        let bytes = name.to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        names.push(String::from_utf8_lossy(bytes).into_owned());
    }
    Ok(names)
}

/// Scans the destination directory for marker files (`ni i <name>`) and
/// returns the decoded source-side names, for the reverse deletion pass.
fn iter_marker_source_names(dest_dir: &Dir) -> Result<Vec<String>> {
    let mut dup = dest_dir
        .try_clone()
        .map_err(|e| crate::error::Error::io("<dest>", std::io::Error::from(e)))?;
    let mut names = Vec::new();
    for entry in dup.iter() {
        let entry = entry.map_err(|e| crate::error::Error::io("<dest>", std::io::Error::from(e)))?;
        let raw = entry.file_name();
        let bytes = raw.to_bytes();
        if bytes.len() > 3 && &bytes[..2] == b"ni" && bytes[2] == b'i' {
            names.push(String::from_utf8_lossy(&bytes[3..]).into_owned());
        }
    }
    Ok(names)
}

/// I6: recursion into a child directory is gated on same-device.
fn is_mount_boundary(parent_dev: u64, child_dev: u64) -> bool {
    parent_dev != child_dev
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_device_does_not_cross_mount() {
        assert!(!is_mount_boundary(1, 1));
    }

    #[test]
    fn differing_device_crosses_mount() {
        assert!(is_mount_boundary(1, 2));
    }
}
