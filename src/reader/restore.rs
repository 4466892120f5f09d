//! `restore` reader: reconstructs the source-side object at a chosen
//! timestamp by locating the latest revision `<= T`, then forward-applying
//! reverse patches from the current revision down to it. Grounded on
//! `original_source/nirestore.c`'s `restoreSelected`/`restoreData`/`bspatch`
//! flow.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::error::{Error, Result};
use crate::metadata::{Metadata, ObjectType};
use crate::patch::{self, Codec};
use crate::reader::list::find_revision_at;
use crate::shadow::{self, MarkerLock, ShadowPaths};

pub struct RestoreOptions {
    pub at: i64,
}

/// Restores everything under `dest_root` (optionally scoped to
/// `start_path`) as it existed at `options.at`, writing into `target_root`.
pub fn restore(
    dest_root: &Path,
    start_path: Option<&Path>,
    target_root: &Path,
    options: &RestoreOptions,
) -> Result<()> {
    std::fs::create_dir_all(target_root).map_err(|e| Error::io(target_root, e))?;

    let root = Dir::open(dest_root, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
        .map_err(|e| Error::io(dest_root, std::io::Error::from(e)))?;

    let (dir, prefix) = match start_path {
        Some(p) => (descend_to(&root, p)?, p.to_path_buf()),
        None => (root, PathBuf::new()),
    };

    restore_dir(&dir, &prefix, target_root, options)
}

fn descend_to(root: &Dir, path: &Path) -> Result<Dir> {
    let mut current = root.try_clone().map_err(|e| Error::io(path, std::io::Error::from(e)))?;
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        let paths = ShadowPaths::for_name(&name);
        current = shadow::open_dir(&current, &paths.descent_dir)?;
    }
    Ok(current)
}

fn restore_dir(dir: &Dir, prefix: &Path, target_root: &Path, options: &RestoreOptions) -> Result<()> {
    for name in marker_names(dir)? {
        let rel = prefix.join(&name);
        let paths = ShadowPaths::for_name(&name);
        let target_path = target_root.join(&rel);

        let mut lock = MarkerLock::acquire_shared(dir, &paths.marker, &rel)?;
        let r_cur = lock.read_revision()?;
        if r_cur == 0 {
            continue;
        }

        let meta_dir = shadow::open_dir(dir, &paths.metadata_dir)?;
        let target_revision = find_revision_at(&meta_dir, r_cur, options.at)?;

        if let Some((r, meta)) = target_revision {
            if !meta.is_nonexistent() {
                restore_one(dir, &paths, r_cur, r, &meta, &target_path)?;
            }
            // else: object didn't exist yet / was deleted at this time; leave target absent.
        }

        if let Ok(descent) = shadow::open_dir(dir, &paths.descent_dir) {
            restore_dir(&descent, &rel, target_root, options)?;
        }
    }
    Ok(())
}

fn restore_one(
    dir: &Dir,
    paths: &ShadowPaths,
    r_cur: u64,
    r_target: u64,
    meta: &Metadata,
    target_path: &Path,
) -> Result<()> {
    if let Some(parent) = target_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    match meta.kind {
        ObjectType::Directory => {
            std::fs::create_dir_all(target_path).map_err(|e| Error::io(target_path, e))?;
        }
        ObjectType::Regular => {
            let content_dir = shadow::open_dir(dir, &paths.content_dir)?;
            let data = reconstruct_content(&content_dir, r_cur, r_target)?;
            std::fs::write(target_path, data).map_err(|e| Error::io(target_path, e))?;
        }
        ObjectType::Symlink => {
            let content_dir = shadow::open_dir(dir, &paths.content_dir)?;
            let data = reconstruct_content(&content_dir, r_cur, r_target)?;
            let target_str = String::from_utf8_lossy(&data).into_owned();
            let _ = std::fs::remove_file(target_path);
            std::os::unix::fs::symlink(target_str, target_path).map_err(|e| Error::io(target_path, e))?;
        }
        ObjectType::Fifo | ObjectType::Other | ObjectType::Nonexistent => {
            // metadata-only stub: nothing to materialize (Non-goal).
            return Ok(());
        }
    }

    restore_metadata(meta, target_path)
}

/// Reconstructs revision `r_target`'s content. §4.5 step 8 tolerates a
/// failed regress by leaving the older revision's full payload in place
/// instead of a patch, and a tombstone revision writes no payload at all, so
/// a full `.dat` can legitimately appear anywhere between `r_target` and
/// `r_cur`, not only at `r_cur` itself. Mirroring `restoreData`'s forward
/// scan ("for (ii = restIncr; ii <= curIncr; ii++) ... break" on the first
/// revision with full content), scan upward from `r_target` for the nearest
/// such anchor, then apply reverse patches down from it to `r_target`.
fn reconstruct_content(content_dir: &Dir, r_cur: u64, r_target: u64) -> Result<Vec<u8>> {
    let anchor = (r_target..=r_cur)
        .find(|r| content_file_exists(content_dir, &format!("{r}.dat")))
        .ok_or(Error::MissingRevision { path: PathBuf::new(), revision: r_target })?;

    let mut current_revision = anchor;
    let mut current = read_full(content_dir, anchor)?;

    while current_revision > r_target {
        let prior = current_revision - 1;
        if content_file_exists(content_dir, &format!("{prior}.dat")) {
            current = read_full(content_dir, prior)?;
        } else {
            let (codec, patch_file) = open_patch(content_dir, prior)?;
            let base = write_temp(&current)?;
            let out = tempfile::tempfile().map_err(|e| Error::io("<restore-temp>", e))?;
            patch::apply_patch(codec, &base, &patch_file, &out)?;
            current = read_all(out)?;
        }
        current_revision = prior;
    }

    Ok(current)
}

fn content_file_exists(content_dir: &Dir, name: &str) -> bool {
    nix::sys::stat::fstatat(content_dir.as_raw_fd(), name, nix::fcntl::AtFlags::empty()).is_ok()
}

fn read_full(content_dir: &Dir, revision: u64) -> Result<Vec<u8>> {
    use std::io::Read;
    let name = format!("{revision}.dat");
    let fd = nix::fcntl::openat(content_dir.as_raw_fd(), name.as_str(), OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| Error::io(&name, std::io::Error::from(e)))?;
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(|e| Error::io(&name, e))?;
    Ok(buf)
}

fn open_patch(content_dir: &Dir, revision: u64) -> Result<(Codec, File)> {
    for (codec, ext) in [(Codec::A, "bsp"), (Codec::B, "x3p")] {
        let name = format!("{revision}.{ext}");
        if let Ok(fd) = nix::fcntl::openat(content_dir.as_raw_fd(), name.as_str(), OFlag::O_RDONLY, Mode::empty()) {
            let file = unsafe { File::from_raw_fd(fd) };
            return Ok((codec, file));
        }
    }
    Err(Error::MissingRevision { path: PathBuf::new(), revision })
}

fn write_temp(data: &[u8]) -> Result<File> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = tempfile::tempfile().map_err(|e| Error::io("<restore-temp>", e))?;
    f.write_all(data).map_err(|e| Error::io("<restore-temp>", e))?;
    f.seek(SeekFrom::Start(0)).map_err(|e| Error::io("<restore-temp>", e))?;
    Ok(f)
}

fn read_all(mut f: File) -> Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    f.seek(SeekFrom::Start(0)).map_err(|e| Error::io("<restore-temp>", e))?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).map_err(|e| Error::io("<restore-temp>", e))?;
    Ok(buf)
}

/// Restores mode/time/owner last, per `nirestore.c`'s ordering
/// (`fchmodat`/`utimensat`/`fchownat` after content is in place).
fn restore_metadata(meta: &Metadata, target_path: &Path) -> Result<()> {
    use nix::sys::stat::{fchmodat, FchmodatFlags};
    use nix::sys::time::TimeSpec;
    use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};

    let mode = nix::sys::stat::Mode::from_bits_truncate(meta.mode);
    let _ = fchmodat(None, target_path, mode, FchmodatFlags::FollowSymlink);

    let times = [TimeSpec::new(meta.mtime, 0), TimeSpec::new(meta.mtime, 0)];
    let _ = nix::sys::stat::utimensat(
        None,
        target_path,
        &times[0],
        &times[1],
        nix::sys::stat::UtimensatFlags::FollowSymlink,
    );

    let _ = fchownat(
        None,
        target_path,
        Some(Uid::from_raw(meta.uid)),
        Some(Gid::from_raw(meta.gid)),
        FchownatFlags::FollowSymlink,
    );

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

use std::os::fd::FromRawFd as _;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_options_carry_target_time() {
        let opts = RestoreOptions { at: 1234 };
        assert_eq!(opts.at, 1234);
    }
}
