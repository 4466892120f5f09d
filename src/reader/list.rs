//! `list` reader: prints ShadowEntry names that existed at a given wall-clock
//! time. Grounded on `original_source/nils.c`'s print-only traversal mode
//! (`targetDir == -1`), split out here into its own first-class operation
//! per `SPEC_FULL.md` §4's companion-reader expansion.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::error::Result;
use crate::metadata::Metadata;
use crate::shadow::{self, MarkerLock, ShadowPaths};

#[derive(Debug, Clone)]
pub struct ListedEntry {
    pub relative_path: PathBuf,
    pub metadata: Metadata,
    pub revision: u64,
}

pub struct ListOptions {
    pub at: i64,
    pub long: bool,
    pub history: bool,
}

/// Lists entries under `dest_root` (optionally scoped to `start_path`, a
/// relative sub-path) as of wall-clock time `options.at`.
pub fn list(dest_root: &Path, start_path: Option<&Path>, options: &ListOptions) -> Result<Vec<ListedEntry>> {
    let root = Dir::open(dest_root, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
        .map_err(|e| crate::error::Error::io(dest_root, std::io::Error::from(e)))?;

    let (dir, prefix) = match start_path {
        Some(p) => (descend_to(&root, p)?, p.to_path_buf()),
        None => (root, PathBuf::new()),
    };

    let mut out = Vec::new();
    list_dir(&dir, &prefix, options, &mut out)?;
    Ok(out)
}

fn descend_to(root: &Dir, path: &Path) -> Result<Dir> {
    let mut current = root
        .try_clone()
        .map_err(|e| crate::error::Error::io(path, std::io::Error::from(e)))?;
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        let paths = ShadowPaths::for_name(&name);
        current = shadow::open_dir(&current, &paths.descent_dir)?;
    }
    Ok(current)
}

fn list_dir(dir: &Dir, prefix: &Path, options: &ListOptions, out: &mut Vec<ListedEntry>) -> Result<()> {
    for name in marker_names(dir)? {
        let rel = prefix.join(&name);
        let paths = ShadowPaths::for_name(&name);

        let mut lock = MarkerLock::acquire_shared(dir, &paths.marker, &rel)?;
        let r_cur = lock.read_revision()?;
        if r_cur == 0 {
            continue;
        }

        let meta_dir = shadow::open_dir(dir, &paths.metadata_dir)?;

        if options.history {
            for r in 1..=r_cur {
                let meta = crate::metadata::read_revision(&meta_dir, r, true, &rel)?;
                out.push(ListedEntry { relative_path: rel.clone(), metadata: meta, revision: r });
            }
        } else {
            let revision = find_revision_at(&meta_dir, r_cur, options.at)?;
            if let Some((r, meta)) = revision {
                if !meta.is_nonexistent() {
                    out.push(ListedEntry { relative_path: rel.clone(), metadata: meta, revision: r });
                }
            }
        }

        if shadow::open_dir(dir, &paths.descent_dir).is_ok() {
            let descent = shadow::open_dir(dir, &paths.descent_dir)?;
            list_dir(&descent, &rel, options, out)?;
        }
    }
    Ok(())
}

/// Locates the latest revision `r <= r_cur` whose metadata file was written
/// at or before `at`, using the metadata file's own filesystem mtime as the
/// write timestamp (mirrors `nirestore.c`'s approach of comparing against
/// `st_mtime` of the `.met`/`.new` file rather than the recorded tuple).
pub(crate) fn find_revision_at(meta_dir: &Dir, r_cur: u64, at: i64) -> Result<Option<(u64, Metadata)>> {
    for r in (1..=r_cur).rev() {
        let name = format!("{r}.met");
        let st = nix::sys::stat::fstatat(meta_dir.as_raw_fd(), name.as_str(), nix::fcntl::AtFlags::empty());
        let written_at = match st {
            Ok(s) => s.st_mtime,
            Err(_) => continue,
        };
        if written_at <= at {
            let meta = crate::metadata::read_revision(meta_dir, r, true, Path::new(&name))?;
            return Ok(Some((r, meta)));
        }
    }
    Ok(None)
}

fn marker_names(dir: &Dir) -> Result<Vec<String>> {
    let mut dup = dir
        .try_clone()
        .map_err(|e| crate::error::Error::io("<dir>", std::io::Error::from(e)))?;
    let mut names = Vec::new();
    for entry in dup.iter() {
        let entry = entry.map_err(|e| crate::error::Error::io("<dir>", std::io::Error::from(e)))?;
        let raw = entry.file_name();
        let bytes = raw.to_bytes();
        if bytes.len() > 3 && &bytes[..2] == b"ni" && bytes[2] == b'i' {
            names.push(String::from_utf8_lossy(&bytes[3..]).into_owned());
        }
    }
    Ok(names)
}
