//! `purge` reader: time-thresholded reverse walk removing a contiguous
//! prefix of revisions whose metadata mtime predates the cutoff, collapsing
//! trailing tombstones, and removing fully-dead ShadowEntries bottom-up.
//! Grounded directly on `original_source/nipurge.c`'s `purgeDir`/`purge`.

use std::os::fd::AsRawFd;
use std::path::Path;

use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::debug;

use crate::error::{Error, Result};
use crate::shadow::{self, MarkerLock, ShadowPaths};

/// Purges all ShadowEntries under `dest_root` whose dead revisions predate
/// `cutoff` (a unix timestamp).
pub fn purge(dest_root: &Path, cutoff: i64) -> Result<()> {
    let root = Dir::open(dest_root, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
        .map_err(|e| Error::io(dest_root, std::io::Error::from(e)))?;
    purge_dir(&root, Path::new(""), cutoff)
}

fn purge_dir(dir: &Dir, prefix: &Path, cutoff: i64) -> Result<()> {
    // first purge subdirectories (descent dirs), then our own content, as
    // `purgeDir` does (recurse before purging local increments).
    for name in marker_names(dir)? {
        let rel = prefix.join(&name);
        let paths = ShadowPaths::for_name(&name);
        if let Ok(descent) = shadow::open_dir(dir, &paths.descent_dir) {
            purge_dir(&descent, &rel, cutoff)?;
        }
    }

    for name in marker_names(dir)? {
        let rel = prefix.join(&name);
        purge_one(dir, &name, &rel, cutoff)?;
    }

    Ok(())
}

fn purge_one(dir: &Dir, name: &str, rel: &Path, cutoff: i64) -> Result<()> {
    let paths = ShadowPaths::for_name(name);
    let mut lock = MarkerLock::acquire_exclusive(dir, &paths.marker, rel)?;
    let r_cur = lock.read_revision()?;
    if r_cur == 0 {
        return Ok(());
    }

    let meta_dir = shadow::open_dir(dir, &paths.metadata_dir)?;

    // find the first (highest) dead revision scanning backward from r_cur - 1.
    let mut old_revision = 0u64;
    for r in (1..r_cur).rev() {
        let met_name = format!("{r}.met");
        let st = nix::sys::stat::fstatat(meta_dir.as_raw_fd(), met_name.as_str(), nix::fcntl::AtFlags::empty());
        if let Ok(s) = st {
            if s.st_mtime < cutoff {
                old_revision = r;
                break;
            }
        }
    }

    // if the latest purgeable revision is r_cur - 1, check whether r_cur
    // itself is a tombstone; if so, collapse it into the purge range too.
    if old_revision == r_cur.saturating_sub(1) && r_cur >= 1 {
        let current_meta = crate::metadata::read_revision(&meta_dir, r_cur, true, rel)?;
        if current_meta.is_nonexistent() {
            old_revision = r_cur;
        }
    }

    if old_revision == 0 {
        return Ok(());
    }

    let content_dir = shadow::open_dir(dir, &paths.content_dir)?;
    for r in (1..=old_revision).rev() {
        shadow::remove_if_present(&meta_dir, &format!("{r}.met"))?;
        shadow::remove_if_present(&content_dir, &format!("{r}.dat"))?;
        shadow::remove_if_present(&content_dir, &format!("{r}.bsp"))?;
        shadow::remove_if_present(&content_dir, &format!("{r}.x3p"))?;
    }

    debug!(path = %rel.display(), through_revision = old_revision, "purged revisions");

    if old_revision == r_cur {
        // every revision is gone: remove the whole ShadowEntry, bottom-up.
        drop(lock);
        remove_shadow_entry(dir, &paths, rel)?;
    }

    Ok(())
}

fn remove_shadow_entry(dir: &Dir, paths: &ShadowPaths, rel: &Path) -> Result<()> {
    let _ = nix::unistd::unlinkat(
        Some(dir.as_raw_fd()),
        paths.descent_dir.as_str(),
        nix::unistd::UnlinkatFlags::RemoveDir,
    );
    let _ = nix::unistd::unlinkat(
        Some(dir.as_raw_fd()),
        paths.content_dir.as_str(),
        nix::unistd::UnlinkatFlags::RemoveDir,
    );
    let _ = nix::unistd::unlinkat(
        Some(dir.as_raw_fd()),
        paths.metadata_dir.as_str(),
        nix::unistd::UnlinkatFlags::RemoveDir,
    );
    shadow::remove_if_present(dir, &paths.marker)?;
    debug!(path = %rel.display(), "removed fully-dead shadow entry");
    Ok(())
}

fn marker_names(dir: &Dir) -> Result<Vec<String>> {
    let mut dup = dir.try_clone().map_err(|e| Error::io("<dir>", std::io::Error::from(e)))?;
    let mut names = Vec::new();
    for entry in dup.iter() {
        let entry = entry.map_err(|e| Error::io("<dir>", std::io::Error::from(e)))?;
        let raw = entry.file_name();
        let bytes = raw.to_bytes();
        if bytes.len() > 3 && &bytes[..2] == b"ni" && bytes[2] == b'i' {
            names.push(String::from_utf8_lossy(&bytes[3..]).into_owned());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    #[test]
    fn cutoff_is_exclusive_boundary() {
        // a revision with mtime exactly equal to cutoff is NOT purged
        // (nipurge.c's `sbuf.st_mtime < oldest` is a strict comparison).
        let cutoff = 250i64;
        let mtime = 250i64;
        assert!(!(mtime < cutoff));
    }
}
